//! Wire types for the Data API, and the stream that walks its paged list endpoints.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio_stream::Stream;

/// One page of a list endpoint: its items plus the token for the page after it.
#[derive(Debug)]
pub struct Page<T> {
    pub items: VecDeque<T>,
    pub next_page_token: Option<String>,
}

type PendingPage<'a, F, T> =
    Pin<Box<dyn Future<Output = eyre::Result<(F, Page<T>)>> + 'a + Send>>;

/// Yields the items of a paged list endpoint one at a time, fetching a page only once the
/// previous one has been drained.
///
/// Stops after the first error. Dropping the stream early means no further pages are fetched,
/// so a search that finds its match on page one costs one request.
pub struct PagedStream<'a, T, F> {
    buffered: VecDeque<T>,
    pending: Option<PendingPage<'a, F, T>>,
    pages_fetched: usize,
    done: bool,
}

impl<'a, T, F> PagedStream<'a, T, F> {
    pub fn new<Fut>(fetch_page: F) -> Self
    where
        F: Fn(Option<String>) -> Fut,
        F: Send + 'a,
        Fut: Future<Output = eyre::Result<Page<T>>> + Send + 'a,
    {
        let first = async move {
            let page = fetch_page(None).await?;
            Ok((fetch_page, page))
        };
        Self {
            buffered: VecDeque::new(),
            pending: Some(Box::pin(first)),
            pages_fetched: 0,
            done: false,
        }
    }

    /// Number of pages received so far.
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }
}

impl<T: Unpin, F> Unpin for PagedStream<'_, T, F> {}

impl<'a, T: Unpin, F, Fut> Stream for PagedStream<'a, T, F>
where
    F: Fn(Option<String>) -> Fut,
    F: Send + 'a,
    Fut: Future<Output = eyre::Result<Page<T>>> + Send + 'a,
{
    type Item = eyre::Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(item) = self.buffered.pop_front() {
                return Poll::Ready(Some(Ok(item)));
            }
            if self.done {
                return Poll::Ready(None);
            }
            let Some(pending) = self.pending.as_mut() else {
                self.done = true;
                return Poll::Ready(None);
            };
            match pending.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => {
                    self.pending = None;
                    self.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(Ok((fetch_page, page))) => {
                    self.pages_fetched += 1;
                    self.buffered.extend(page.items);
                    // An empty token is how some endpoints say "last page".
                    match page.next_page_token.filter(|t| !t.is_empty()) {
                        Some(token) => {
                            self.pending = Some(Box::pin(async move {
                                let page = fetch_page(Some(token)).await?;
                                Ok((fetch_page, page))
                            }));
                        }
                        None => {
                            self.pending = None;
                            self.done = true;
                        }
                    }
                }
            }
        }
    }
}

/// See: <https://developers.google.com/youtube/v3/docs/playlists/list>
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistListResponse {
    #[serde(default)]
    pub items: VecDeque<Playlist>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub id: String,
    pub snippet: PlaylistSnippet,
    pub content_details: Option<PlaylistContentDetails>,
}

impl Playlist {
    pub fn item_count(&self) -> u64 {
        self.content_details
            .as_ref()
            .map(|d| d.item_count)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistSnippet {
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistContentDetails {
    #[serde(default)]
    pub item_count: u64,
}

/// The metadata half of a video upload.
///
/// See: <https://developers.google.com/youtube/v3/docs/videos/insert>
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoResource {
    pub snippet: VideoSnippet,
    pub status: VideoStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSnippet {
    pub category_id: String,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStatus {
    pub privacy_status: String,
    pub self_declared_made_for_kids: bool,
}

/// What the upload endpoint returns once the last byte is in. Only the id matters here.
#[derive(Debug, Deserialize)]
pub struct UploadedVideo {
    pub id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PlaylistItemInsert<'a> {
    pub(crate) snippet: PlaylistItemSnippet<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PlaylistItemSnippet<'a> {
    pub(crate) playlist_id: &'a str,
    pub(crate) resource_id: ResourceId<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ResourceId<'a> {
    pub(crate) kind: &'a str,
    pub(crate) video_id: &'a str,
}
