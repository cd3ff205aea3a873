//! Data API client with automatic access-token refresh.

use crate::youtube::oauth::OAuthManager;
use crate::youtube::types::{
    Page, PagedStream, Playlist, PlaylistItemInsert, PlaylistItemSnippet, PlaylistListResponse,
    ResourceId, UploadedVideo, VideoResource,
};
use crate::youtube::upload::UploadFault;
use bytes::Bytes;
use eyre::Context;
use http::Method;
use oauth2::TokenResponse;
use oauth2::basic::BasicTokenResponse;
use reqwest::StatusCode;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tokio_stream::Stream;
use tracing::instrument;

pub const API_BASE: &str = "https://www.googleapis.com/youtube/v3";
pub const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/youtube/v3";

/// Reason the API gives when a video is inserted into a playlist it is already in.
const ALREADY_IN_PLAYLIST: &str = "videoAlreadyInPlaylist";

/// An OAuth token together with the moment it should stop being used.
#[derive(Debug, Clone)]
pub struct TimeBoundAccessToken {
    token: BasicTokenResponse,
    /// Real expiry minus a safety buffer.
    expires_at: SystemTime,
}

impl TimeBoundAccessToken {
    /// Wraps a token loaded from disk, whose issue time is unknown, so it is refreshed before
    /// first use.
    pub fn expired(token: BasicTokenResponse) -> Self {
        Self {
            expires_at: SystemTime::UNIX_EPOCH,
            token,
        }
    }

    /// Wraps a token that was just issued.
    pub fn new(token: BasicTokenResponse) -> Self {
        Self {
            expires_at: Self::calculate_token_expiry(&token),
            token,
        }
    }

    pub fn raw_token(&self) -> &BasicTokenResponse {
        &self.token
    }

    /// Refreshes the token in place, keeping the old refresh token if the new response lacks
    /// one.
    ///
    /// Returns `Ok(false)` if the refresh was refused and the operator must authorize again.
    pub async fn refresh(&mut self, oauth_manager: &OAuthManager) -> eyre::Result<bool> {
        tracing::trace!("refreshing token");
        let Some(new_token) = oauth_manager
            .refresh_token(&self.token)
            .await
            .context("refresh OAuth token")?
        else {
            return Ok(false);
        };

        let old_token = std::mem::replace(&mut self.token, new_token);
        if self.token.refresh_token().is_none() {
            tracing::trace!("new token lacks refresh token, preserving original");
            self.token
                .set_refresh_token(old_token.refresh_token().cloned());
        }
        self.expires_at = Self::calculate_token_expiry(&self.token);
        Ok(true)
    }

    fn calculate_token_expiry(token: &BasicTokenResponse) -> SystemTime {
        let now = SystemTime::now();
        match token.expires_in() {
            Some(expires_in) => {
                now + expires_in.saturating_sub(Duration::from_secs(300)) // 5 minute buffer
            }
            // 1 hour minus the buffer
            None => now + Duration::from_secs(3300),
        }
    }
}

/// Result of filing a video into a playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistInsert {
    Inserted,
    AlreadyPresent,
}

/// Where a resumable upload session stands after a request.
#[derive(Debug)]
pub enum UploadProgress {
    /// The server holds the first `received` bytes and wants the rest.
    Incomplete { received: u64 },
    Complete(UploadedVideo),
}

/// Client for the Data API v3, acting on behalf of the operator.
///
/// Before each call the access token is checked against its expiry and refreshed through the
/// [`OAuthManager`] when needed.
#[derive(Debug, Clone)]
pub struct YouTubeClient {
    token: Arc<Mutex<TimeBoundAccessToken>>,
    oauth_manager: Arc<OAuthManager>,
    client: reqwest::Client,
    api_base: String,
    upload_base: String,
}

impl YouTubeClient {
    pub fn new(
        token: TimeBoundAccessToken,
        oauth_manager: Arc<OAuthManager>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            token: Arc::new(Mutex::new(token)),
            oauth_manager,
            client,
            api_base: API_BASE.to_string(),
            upload_base: UPLOAD_BASE.to_string(),
        }
    }

    /// Points the client at different hosts.
    pub fn with_base_urls(mut self, api: impl Into<String>, upload: impl Into<String>) -> Self {
        self.api_base = api.into();
        self.upload_base = upload.into();
        self
    }

    #[instrument(skip(self))]
    pub(crate) async fn fresh_access_token(&self) -> eyre::Result<String> {
        let mut token = self.token.lock().await;
        if SystemTime::now() >= token.expires_at {
            tracing::debug!("access token expired, attempting refresh");
            if !token.refresh(&self.oauth_manager).await? {
                tracing::error!("access token refresh failed, client is unusable");
                eyre::bail!("Unable to refresh expired access token");
            }
            tracing::debug!("access token successfully refreshed");
        }
        Ok(token.token.access_token().secret().to_string())
    }

    /// Sends an authenticated request and hands back the response whatever its status.
    async fn send_authenticated(
        &self,
        method: Method,
        url: &str,
        query_params: &[(&str, &str)],
        json_body: Option<&impl Serialize>,
    ) -> eyre::Result<reqwest::Response> {
        let access_token = self.fresh_access_token().await?;
        let mut request = self
            .client
            .request(method.clone(), url)
            .header("Authorization", format!("Bearer {access_token}"))
            .query(query_params);
        if let Some(body) = json_body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .with_context(|| format!("send {method} request to YouTube API: {url}"))
    }

    /// Like [`Self::send_authenticated`], but any non-success status is an error.
    #[instrument(skip(self, json_body), level = tracing::Level::TRACE)]
    async fn make_authenticated_request(
        &self,
        method: Method,
        url: &str,
        query_params: &[(&str, &str)],
        json_body: Option<&impl Serialize>,
    ) -> eyre::Result<reqwest::Response> {
        let response = self
            .send_authenticated(method.clone(), url, query_params, json_body)
            .await?;
        let status_code = response.status();
        if !status_code.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            eyre::bail!(
                "YouTube API {} request failed with status {}: {}",
                method,
                status_code,
                error_text
            );
        }
        Ok(response)
    }

    async fn list_my_playlists_page(&self, page_token: Option<String>) -> eyre::Result<Page<Playlist>> {
        let url = format!("{}/playlists", self.api_base);
        let mut query_params = vec![
            ("part", "snippet,id,contentDetails"),
            ("mine", "true"),
            ("maxResults", "50"),
        ];
        if let Some(token) = page_token.as_deref() {
            query_params.push(("pageToken", token));
        }

        let response = self
            .make_authenticated_request(Method::GET, &url, &query_params, None::<&()>)
            .await?;
        let playlists: PlaylistListResponse = response
            .json()
            .await
            .context("parse playlist list response as JSON")?;
        tracing::debug!(returned_items = playlists.items.len(), "fetched playlists");
        Ok(Page {
            items: playlists.items,
            next_page_token: playlists.next_page_token,
        })
    }

    /// Streams the operator's own playlists, fetching pages as the stream is consumed.
    ///
    /// See: <https://developers.google.com/youtube/v3/docs/playlists/list>
    pub fn list_my_playlists(&self) -> impl Stream<Item = eyre::Result<Playlist>> + Send + '_ {
        PagedStream::new(move |page_token| self.list_my_playlists_page(page_token))
    }

    /// Adds a video to the end of a playlist.
    ///
    /// A video that is already in the playlist is reported as
    /// [`PlaylistInsert::AlreadyPresent`] rather than as an error.
    ///
    /// See: <https://developers.google.com/youtube/v3/docs/playlistItems/insert>
    #[instrument(skip(self))]
    pub async fn insert_playlist_item(
        &self,
        playlist_id: &str,
        video_id: &str,
    ) -> eyre::Result<PlaylistInsert> {
        let url = format!("{}/playlistItems", self.api_base);
        let body = PlaylistItemInsert {
            snippet: PlaylistItemSnippet {
                playlist_id,
                resource_id: ResourceId {
                    kind: "youtube#video",
                    video_id,
                },
            },
        };
        let response = self
            .send_authenticated(Method::POST, &url, &[("part", "snippet")], Some(&body))
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(PlaylistInsert::Inserted);
        }
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        if status == StatusCode::CONFLICT || error_text.contains(ALREADY_IN_PLAYLIST) {
            tracing::debug!(%status, "video already in playlist");
            return Ok(PlaylistInsert::AlreadyPresent);
        }
        eyre::bail!(
            "YouTube API playlist insert failed with status {}: {}",
            status,
            error_text
        )
    }

    /// Opens a resumable upload session for a video of `content_length` bytes.
    ///
    /// Returns the session URI that the bytes are sent to.
    ///
    /// See: <https://developers.google.com/youtube/v3/guides/using_resumable_upload_protocol>
    #[instrument(skip(self, resource))]
    pub async fn start_resumable_upload(
        &self,
        resource: &VideoResource,
        content_length: u64,
    ) -> Result<String, UploadFault> {
        let url = format!("{}/videos", self.upload_base);
        let access_token = self.fresh_access_token().await.map_err(UploadFault::Other)?;
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {access_token}"))
            .header("X-Upload-Content-Length", content_length)
            .header("X-Upload-Content-Type", "video/mp4")
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .json(resource)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadFault::Status { status, body });
        }
        let location = response
            .headers()
            .get(http::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| UploadFault::Other(eyre::eyre!("upload session has no Location")))?;
        tracing::debug!("resumable upload session opened");
        Ok(location.to_string())
    }

    /// Sends `chunk` starting at byte `offset` of a `total`-byte upload.
    ///
    /// With no chunk, asks the server how much it already has, which is how an interrupted
    /// session is resumed.
    #[instrument(skip(self, session_uri, chunk), fields(len = chunk.as_ref().map(Bytes::len)))]
    pub async fn put_upload_bytes(
        &self,
        session_uri: &str,
        offset: u64,
        chunk: Option<Bytes>,
        total: u64,
    ) -> Result<UploadProgress, UploadFault> {
        let access_token = self.fresh_access_token().await.map_err(UploadFault::Other)?;
        let (content_range, body) = match chunk {
            Some(chunk) if !chunk.is_empty() => {
                let last = offset + chunk.len() as u64 - 1;
                (format!("bytes {offset}-{last}/{total}"), chunk)
            }
            _ => (format!("bytes */{total}"), Bytes::new()),
        };
        let response = self
            .client
            .put(session_uri)
            .header("Authorization", format!("Bearer {access_token}"))
            .header(http::header::CONTENT_RANGE, content_range)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::PERMANENT_REDIRECT {
            // "308 Resume Incomplete"
            let received = response
                .headers()
                .get(http::header::RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(received_bytes)
                .unwrap_or(0);
            return Ok(UploadProgress::Incomplete { received });
        }
        let body = response.text().await?;
        if !status.is_success() {
            return Err(UploadFault::Status { status, body });
        }
        match serde_json::from_str::<UploadedVideo>(&body) {
            Ok(video) => Ok(UploadProgress::Complete(video)),
            Err(_) => Ok(UploadProgress::Complete(UploadedVideo { id: None })),
        }
    }
}

/// Parses a `Range: bytes=0-N` header into the number of bytes held.
fn received_bytes(range: &str) -> Option<u64> {
    let (_, end) = range.strip_prefix("bytes=")?.split_once('-')?;
    end.trim().parse::<u64>().ok().map(|end| end + 1)
}
