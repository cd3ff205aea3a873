//! Publishing the rendered video: metadata, the resumable upload and its retry policy.
//!
//! The upload is driven one request at a time through a [`ChunkTransport`]. Each fault is
//! classified as retriable (server overload statuses, transport and I/O errors, a chunk the
//! server did not take) or fatal.
//! Retriable faults are followed by a randomized exponential backoff, up to a fixed number of
//! retries for the whole upload.

use crate::cache::Cache;
use crate::config::Config;
use crate::error::Fault;
use crate::media::timecode;
use crate::prompt::Prompter;
use crate::twitch::clips::Selection;
use crate::youtube::client::{UploadProgress, YouTubeClient};
use crate::youtube::playlists::{self, PlaylistRecord};
use crate::youtube::types::{UploadedVideo, VideoResource, VideoSnippet, VideoStatus};
use bytes::Bytes;
use eyre::Context;
use reqwest::StatusCode;
use std::collections::BTreeSet;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::instrument;

/// Bytes sent per request. The API wants a multiple of 256 KiB.
pub const CHUNK_SIZE: u64 = 32 * 256 * 1024;

/// Statuses the upload endpoint returns when it is worth trying again.
const RETRIABLE_STATUSES: [StatusCode; 4] = [
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Something that went wrong during one upload request.
#[derive(Debug, thiserror::Error)]
pub enum UploadFault {
    #[error("upload endpoint returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("upload transport failed")]
    Transport(#[from] reqwest::Error),
    #[error("reading the video file failed")]
    Io(#[from] std::io::Error),
    #[error("upload session made no progress past byte {offset}")]
    Stalled { offset: u64 },
    #[error("{0:#}")]
    Other(eyre::Report),
}

impl UploadFault {
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Status { status, .. } => RETRIABLE_STATUSES.contains(status),
            Self::Transport(_) | Self::Io(_) | Self::Stalled { .. } => true,
            Self::Other(_) => false,
        }
    }

    fn into_report(self) -> eyre::Report {
        match self {
            Self::Other(report) => report,
            fault => eyre::Report::new(fault),
        }
    }
}

/// What one successful upload request achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    InProgress { uploaded: u64, total: u64 },
    Complete { video_id: String },
}

/// Sends the next piece of an upload.
pub trait ChunkTransport {
    fn next_chunk(&mut self) -> impl Future<Output = Result<ChunkOutcome, UploadFault>> + Send;
}

/// Bound on retries and the unit the backoff is measured in.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub unit: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            unit: Duration::from_secs(1),
        }
    }

    /// Backoff before retry number `retry` (starting at 1), given `jitter` in `[0, 1)`.
    pub fn delay(&self, retry: u32, jitter: f64) -> Duration {
        self.unit.mul_f64(jitter * 2f64.powi(retry as i32))
    }
}

/// Drives `transport` until the upload completes, returning the new video's id.
///
/// Fatal faults are returned as they are. After more than `policy.max_retries` retriable
/// faults the upload is abandoned with [`Fault::UploadRetriesExhausted`].
pub async fn drive_upload<T: ChunkTransport>(
    transport: &mut T,
    policy: &RetryPolicy,
) -> eyre::Result<String> {
    let mut retry = 0;
    loop {
        tracing::info!("uploading video");
        let fault = match transport.next_chunk().await {
            Ok(ChunkOutcome::Complete { video_id }) => {
                tracing::info!(%video_id, "video was successfully uploaded");
                return Ok(video_id);
            }
            Ok(ChunkOutcome::InProgress { uploaded, total }) => {
                tracing::debug!(uploaded, total, "chunk accepted");
                continue;
            }
            Err(fault) if fault.is_retriable() => fault,
            Err(fault) => return Err(fault.into_report()),
        };

        retry += 1;
        tracing::warn!(error = %fault, retry, "retriable upload error");
        if retry > policy.max_retries {
            return Err(Fault::UploadRetriesExhausted {
                attempts: policy.max_retries,
            }
            .into());
        }
        let delay = policy.delay(retry, rand::random::<f64>());
        tracing::info!(?delay, "sleeping and then retrying");
        tokio::time::sleep(delay).await;
    }
}

/// A resumable upload of a file on disk.
///
/// The session is opened on the first request. After a failed request, the next one first asks
/// the server how many bytes it holds and continues from there. A chunk that leaves the server's
/// offset where it was is reported as [`UploadFault::Stalled`].
pub struct ResumableUpload<'a> {
    client: &'a YouTubeClient,
    path: PathBuf,
    resource: VideoResource,
    total: u64,
    chunk_size: u64,
    session_uri: Option<String>,
    offset: u64,
    resync: bool,
}

impl<'a> ResumableUpload<'a> {
    pub async fn new(
        client: &'a YouTubeClient,
        path: impl Into<PathBuf>,
        resource: VideoResource,
    ) -> eyre::Result<Self> {
        let path = path.into();
        let total = tokio::fs::metadata(&path)
            .await
            .wrap_err_with(|| format!("stat {}", path.display()))?
            .len();
        Ok(Self {
            client,
            path,
            resource,
            total,
            chunk_size: CHUNK_SIZE,
            session_uri: None,
            offset: 0,
            resync: false,
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    async fn read_chunk(&self) -> std::io::Result<Bytes> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        file.take(self.chunk_size).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    fn advance(&mut self, progress: UploadProgress) -> Result<ChunkOutcome, UploadFault> {
        match progress {
            UploadProgress::Incomplete { received } => {
                self.offset = received;
                Ok(ChunkOutcome::InProgress {
                    uploaded: received,
                    total: self.total,
                })
            }
            UploadProgress::Complete(UploadedVideo { id: Some(video_id) }) => {
                Ok(ChunkOutcome::Complete { video_id })
            }
            UploadProgress::Complete(UploadedVideo { id: None }) => Err(UploadFault::Other(
                Fault::UnexpectedUploadResponse("completed upload carries no video id".into())
                    .into(),
            )),
        }
    }
}

impl ChunkTransport for ResumableUpload<'_> {
    async fn next_chunk(&mut self) -> Result<ChunkOutcome, UploadFault> {
        let session_uri = match &self.session_uri {
            Some(uri) => uri.clone(),
            None => {
                let uri = self
                    .client
                    .start_resumable_upload(&self.resource, self.total)
                    .await?;
                self.session_uri = Some(uri.clone());
                uri
            }
        };

        if self.resync {
            let progress = self
                .client
                .put_upload_bytes(&session_uri, self.offset, None, self.total)
                .await?;
            self.resync = false;
            if let UploadProgress::Complete(_) = progress {
                return self.advance(progress);
            }
            self.advance(progress)?;
            tracing::debug!(offset = self.offset, "resuming upload");
        }

        let chunk = self.read_chunk().await?;
        let before = self.offset;
        match self
            .client
            .put_upload_bytes(&session_uri, self.offset, Some(chunk), self.total)
            .await
        {
            Ok(progress) => match self.advance(progress)? {
                ChunkOutcome::InProgress { uploaded, .. } if uploaded <= before => {
                    self.offset = before;
                    Err(UploadFault::Stalled { offset: before })
                }
                outcome => Ok(outcome),
            },
            Err(fault) => {
                self.resync = true;
                Err(fault)
            }
        }
    }
}

/// Title, description and tags of the video being published.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
}

impl VideoMetadata {
    pub fn into_resource(self, category_id: &str, privacy_status: &str) -> VideoResource {
        VideoResource {
            snippet: VideoSnippet {
                category_id: category_id.to_string(),
                title: self.title,
                description: self.description,
                tags: self.tags,
            },
            status: VideoStatus {
                privacy_status: privacy_status.to_string(),
                self_declared_made_for_kids: false,
            },
        }
    }
}

/// Videos in a playlist are numbered in upload order.
pub fn video_title(playlist_title: &str, item_count: u64) -> String {
    format!("{playlist_title} #{}", item_count + 1)
}

/// One `H:MM:SS - <url>` line per chapter, after the promotional text if there is any.
pub fn video_description(promo: Option<&str>, timestamps: &[f64], public_urls: &[String]) -> String {
    let chapters = timestamps
        .iter()
        .zip(public_urls)
        .map(|(&start, url)| format!("{} - {url}", timecode(start)))
        .collect::<Vec<_>>()
        .join("\n");
    match promo {
        Some(promo) if !promo.is_empty() => format!("{promo}\n\n{chapters}"),
        _ => chapters,
    }
}

/// The stored tags for the game plus every creator's name in lower case, without duplicates.
pub fn video_tags(stored: Vec<String>, creators: &[String]) -> Vec<String> {
    stored
        .into_iter()
        .chain(creators.iter().map(|c| c.to_lowercase()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Uploads the rendered video, then files it into the game's playlist.
///
/// Returns the id of the new video.
#[instrument(skip(client, config, prompter, video, timestamps, selection))]
pub async fn publish<P: Prompter>(
    client: &YouTubeClient,
    config: &Config,
    prompter: &mut P,
    game_id: &str,
    video: &Path,
    timestamps: &[f64],
    selection: &Selection,
) -> eyre::Result<String> {
    let playlist_cache: Cache<PlaylistRecord> = Cache::new(config.playlist_ids_path());
    let playlist = playlists::resolve_playlist(client, &playlist_cache, prompter, game_id).await?;

    let tag_cache: Cache<Vec<String>> = Cache::new(config.tags_path());
    let stored_tags = tag_cache.lookup(game_id).await?.unwrap_or_default();

    let metadata = VideoMetadata {
        title: video_title(&playlist.title, playlist.item_count),
        description: video_description(
            config.promo.as_deref(),
            timestamps,
            &selection.public_urls,
        ),
        tags: video_tags(stored_tags, &selection.creators),
    };
    tracing::info!(title = %metadata.title, tags = metadata.tags.len(), "publishing video");
    let resource = metadata.into_resource(&config.video_category_id, &config.privacy_status);

    let mut upload = ResumableUpload::new(client, video, resource).await?;
    let video_id = drive_upload(&mut upload, &RetryPolicy::new(config.upload_retries)).await?;

    tracing::info!(delay = ?config.upload_settle_delay, "waiting for the upload to be processed");
    tokio::time::sleep(config.upload_settle_delay).await;

    playlists::insert_video(client, &playlist_cache, game_id, &playlist, &video_id).await?;
    Ok(video_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::youtube::client::tests::client_for;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use tempfile::TempDir;
    use tokio::time::Instant;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Plays back canned results and notes when it was called.
    struct FakeTransport {
        results: VecDeque<Result<ChunkOutcome, UploadFault>>,
        calls: Vec<Instant>,
    }

    impl FakeTransport {
        fn new(results: impl IntoIterator<Item = Result<ChunkOutcome, UploadFault>>) -> Self {
            Self {
                results: results.into_iter().collect(),
                calls: Vec::new(),
            }
        }
    }

    impl ChunkTransport for FakeTransport {
        async fn next_chunk(&mut self) -> Result<ChunkOutcome, UploadFault> {
            self.calls.push(Instant::now());
            self.results
                .pop_front()
                .unwrap_or_else(|| Err(unavailable()))
        }
    }

    fn unavailable() -> UploadFault {
        UploadFault::Status {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        }
    }

    fn done() -> Result<ChunkOutcome, UploadFault> {
        Ok(ChunkOutcome::Complete {
            video_id: "vid".to_string(),
        })
    }

    #[test]
    fn classifies_faults() {
        assert!(unavailable().is_retriable());
        for code in [500, 502, 504] {
            let fault = UploadFault::Status {
                status: StatusCode::from_u16(code).unwrap(),
                body: String::new(),
            };
            assert!(fault.is_retriable(), "{code}");
        }
        let forbidden = UploadFault::Status {
            status: StatusCode::FORBIDDEN,
            body: String::new(),
        };
        assert!(!forbidden.is_retriable());
        assert!(UploadFault::Io(std::io::Error::other("reset")).is_retriable());
        assert!(UploadFault::Stalled { offset: 4 }.is_retriable());
        assert!(!UploadFault::Other(eyre::eyre!("nope")).is_retriable());
    }

    #[test]
    fn backoff_is_bounded_by_power_of_two() {
        let policy = RetryPolicy::new(10);
        assert_eq!(policy.delay(1, 0.0), Duration::ZERO);
        assert!(policy.delay(3, 0.999) <= Duration::from_secs(8));
        assert_eq!(policy.delay(2, 0.5), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_then_success() {
        let mut transport = FakeTransport::new([Err(unavailable()), Err(unavailable()), done()]);
        let id = drive_upload(&mut transport, &RetryPolicy::new(10))
            .await
            .unwrap();

        assert_eq!(id, "vid");
        assert_eq!(transport.calls.len(), 3);
        assert!(transport.calls[1] - transport.calls[0] <= Duration::from_secs(2));
        assert!(transport.calls[2] - transport.calls[1] <= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_ten_retries() {
        let mut transport = FakeTransport::new([]);
        let err = drive_upload(&mut transport, &RetryPolicy::new(10))
            .await
            .unwrap_err();

        assert_eq!(transport.calls.len(), 11);
        assert!(matches!(
            err.downcast_ref::<Fault>(),
            Some(Fault::UploadRetriesExhausted { attempts: 10 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_fault_is_not_retried() {
        let mut transport = FakeTransport::new([Err(UploadFault::Status {
            status: StatusCode::FORBIDDEN,
            body: "quotaExceeded".to_string(),
        })]);
        let err = drive_upload(&mut transport, &RetryPolicy::new(10))
            .await
            .unwrap_err();

        assert_eq!(transport.calls.len(), 1);
        assert!(err.to_string().contains("403"), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn progress_does_not_count_as_retry() {
        let mut transport = FakeTransport::new([
            Ok(ChunkOutcome::InProgress {
                uploaded: 4,
                total: 8,
            }),
            Err(unavailable()),
            done(),
        ]);
        drive_upload(&mut transport, &RetryPolicy::new(1))
            .await
            .unwrap();
        assert_eq!(transport.calls.len(), 3);
    }

    #[test]
    fn title_counts_from_one() {
        assert_eq!(video_title("Apex Legends Highlights", 0), "Apex Legends Highlights #1");
        assert_eq!(video_title("Apex Legends Highlights", 41), "Apex Legends Highlights #42");
    }

    #[test]
    fn description_lists_chapters() {
        let urls = vec![
            "https://clips.twitch.tv/a".to_string(),
            "https://clips.twitch.tv/b".to_string(),
        ];
        assert_eq!(
            video_description(None, &[0.0, 3725.4], &urls),
            "0:00:00 - https://clips.twitch.tv/a\n1:02:05 - https://clips.twitch.tv/b"
        );
        assert_eq!(
            video_description(Some("Subscribe!"), &[0.0], &urls[..1]),
            "Subscribe!\n\n0:00:00 - https://clips.twitch.tv/a"
        );
    }

    #[test]
    fn tags_are_deduplicated() {
        let tags = video_tags(
            vec!["apex".to_string(), "shroud".to_string()],
            &["Shroud".to_string(), "aceu".to_string(), "ACEU".to_string()],
        );
        assert_eq!(tags, ["aceu", "apex", "shroud"]);
    }

    #[tokio::test]
    async fn chunked_upload_resumes_after_server_error() {
        let server = MockServer::start().await;
        let session = format!("{}/session/1", server.uri());
        Mock::given(method("POST"))
            .and(path("/upload/videos"))
            .respond_with(ResponseTemplate::new(200).insert_header("Location", session.as_str()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(header("Content-Range", "bytes 0-3/10"))
            .respond_with(ResponseTemplate::new(308).insert_header("Range", "bytes=0-3"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(header("Content-Range", "bytes 4-7/10"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(header("Content-Range", "bytes */10"))
            .respond_with(ResponseTemplate::new(308).insert_header("Range", "bytes=0-5"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(header("Content-Range", "bytes 6-9/10"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({ "id": "vid9" })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let file = dir.path().join("final.mp4");
        std::fs::write(&file, b"0123456789").unwrap();

        let client = client_for(&server);
        let mut upload = ResumableUpload::new(&client, &file, VideoMetadata::default().into_resource("20", "private"))
            .await
            .unwrap()
            .with_chunk_size(4);
        let policy = RetryPolicy {
            max_retries: 3,
            unit: Duration::from_millis(1),
        };
        let id = drive_upload(&mut upload, &policy).await.unwrap();
        assert_eq!(id, "vid9");
    }

    #[tokio::test]
    async fn upload_that_never_advances_runs_out_of_retries() {
        let server = MockServer::start().await;
        let session = format!("{}/session/1", server.uri());
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).insert_header("Location", session.as_str()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(308))
            .expect(4)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let file = dir.path().join("final.mp4");
        std::fs::write(&file, b"0123456789").unwrap();

        let client = client_for(&server);
        let mut upload = ResumableUpload::new(&client, &file, VideoMetadata::default().into_resource("20", "private"))
            .await
            .unwrap()
            .with_chunk_size(4);
        let policy = RetryPolicy {
            max_retries: 3,
            unit: Duration::from_millis(1),
        };
        let err = drive_upload(&mut upload, &policy).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Fault>(),
            Some(Fault::UploadRetriesExhausted { attempts: 3 })
        ));
    }

    #[tokio::test]
    async fn completion_without_id_is_unexpected() {
        let server = MockServer::start().await;
        let session = format!("{}/session/1", server.uri());
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).insert_header("Location", session.as_str()))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let file = dir.path().join("final.mp4");
        std::fs::write(&file, b"01").unwrap();

        let client = client_for(&server);
        let mut upload = ResumableUpload::new(&client, &file, VideoMetadata::default().into_resource("20", "private"))
            .await
            .unwrap();
        let err = drive_upload(&mut upload, &RetryPolicy::new(10))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Fault>(),
            Some(Fault::UnexpectedUploadResponse(_))
        ));
    }

    #[tokio::test]
    async fn publish_uploads_then_files_into_playlist() {
        let server = MockServer::start().await;
        let session = format!("{}/session/1", server.uri());
        Mock::given(method("POST"))
            .and(path("/upload/videos"))
            .and(body_partial_json(serde_json::json!({
                "snippet": {
                    "categoryId": "20",
                    "title": "Apex Highlights #5",
                    "description": "0:00:00 - https://clips.twitch.tv/a\n0:00:12 - https://clips.twitch.tv/b",
                    "tags": ["apex", "streamer"]
                },
                "status": { "privacyStatus": "private", "selfDeclaredMadeForKids": false }
            })))
            .respond_with(ResponseTemplate::new(200).insert_header("Location", session.as_str()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/session/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "new" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/playlistItems"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let mut config = Config::new(dir.path());
        config.upload_settle_delay = Duration::ZERO;
        std::fs::write(
            config.playlist_ids_path(),
            r#"{"33214": ["PL1", "Apex Highlights", 4]}"#,
        )
        .unwrap();
        std::fs::write(config.tags_path(), r#"{"33214": ["apex"]}"#).unwrap();
        std::fs::write(config.output_path(), b"video").unwrap();

        let selection = Selection {
            download_urls: vec!["d1".into(), "d2".into()],
            public_urls: vec![
                "https://clips.twitch.tv/a".into(),
                "https://clips.twitch.tv/b".into(),
            ],
            creators: vec!["Streamer".into(), "streamer".into()],
        };
        let client = client_for(&server);
        let id = publish(
            &client,
            &config,
            &mut crate::prompt::scripted::ScriptedPrompter::default(),
            "33214",
            &config.output_path(),
            &[0.0, 12.0],
            &selection,
        )
        .await
        .unwrap();

        assert_eq!(id, "new");
        let cache: Cache<PlaylistRecord> = Cache::new(config.playlist_ids_path());
        assert_eq!(cache.lookup("33214").await.unwrap().unwrap().item_count, 5);
    }
}
