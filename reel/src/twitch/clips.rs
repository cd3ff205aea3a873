//! Paging through recent clips and choosing which ones make it into the video.
//!
//! Selection walks the clip listing page by page. In automatic mode every clip is taken until
//! the requested count is reached. In manual mode each candidate goes to a [`DecisionSource`]
//! and selection ends when it says so. Either way, running out of pages while more clips are
//! still wanted is reported as [`Fault::PageExhausted`] rather than silently returning less.

use crate::error::Fault;
use crate::prompt::DecisionSource;
use crate::twitch::client::{HelixClient, MAX_PAGE_SIZE};
use crate::twitch::types::Clip;
use jiff::ToSpan;
use jiff::civil::Date;
use std::collections::VecDeque;
use std::future::Future;
use tracing::instrument;

/// How clips are picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The operator reviews every candidate.
    Manual { page_size: u32 },
    /// The top `count` clips are taken without asking.
    Automatic { count: u32 },
}

impl Mode {
    /// A target count of zero (or less) means the operator picks by hand.
    pub fn from_target(count: i64, manual_page_size: u32) -> Self {
        match u32::try_from(count) {
            Ok(count) if count > 0 => Self::Automatic { count },
            Ok(_) => Self::Manual {
                page_size: manual_page_size,
            },
            Err(_) if count > 0 => Self::Automatic { count: u32::MAX },
            Err(_) => Self::Manual {
                page_size: manual_page_size,
            },
        }
    }
}

/// The chosen clips, as three index-aligned sequences in the order they were chosen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub download_urls: Vec<String>,
    pub public_urls: Vec<String>,
    pub creators: Vec<String>,
}

impl Selection {
    pub fn len(&self) -> usize {
        self.download_urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.download_urls.is_empty()
    }

    fn push(&mut self, clip: &Clip) -> eyre::Result<()> {
        let download_url = clip.download_url()?;
        self.download_urls.push(download_url);
        self.public_urls.push(clip.url.clone());
        self.creators.push(clip.broadcaster_name.clone());
        Ok(())
    }

    /// Keeps only the entries whose index `keep` approves of, preserving order.
    pub fn retain_indices(&mut self, mut keep: impl FnMut(usize) -> bool) {
        let keep: Vec<bool> = (0..self.len()).map(&mut keep).collect();
        for seq in [
            &mut self.download_urls,
            &mut self.public_urls,
            &mut self.creators,
        ] {
            let mut i = 0;
            seq.retain(|_| {
                let k = keep[i];
                i += 1;
                k
            });
        }
    }
}

/// One page of clip candidates.
#[derive(Debug, Default)]
pub struct ClipPage {
    pub clips: VecDeque<Clip>,
    /// Continuation token; `None` on the last page.
    pub cursor: Option<String>,
}

/// A paged listing of clip candidates for one (game, time window) query.
pub trait ClipPages {
    fn fetch(
        &self,
        first: u32,
        after: Option<String>,
    ) -> impl Future<Output = eyre::Result<ClipPage>> + Send;
}

/// The clips of a game created since a given instant, as listed by Helix.
#[derive(Debug, Clone)]
pub struct GameClips<'a> {
    pub client: &'a HelixClient,
    pub game_id: String,
    pub started_at: String,
}

impl<'a> GameClips<'a> {
    pub fn new(client: &'a HelixClient, game_id: impl Into<String>, days_ago: u32) -> eyre::Result<Self> {
        let today = utc_date(jiff::Timestamp::now());
        Ok(Self {
            client,
            game_id: game_id.into(),
            started_at: window_start(today, days_ago)?,
        })
    }
}

impl ClipPages for GameClips<'_> {
    async fn fetch(&self, first: u32, after: Option<String>) -> eyre::Result<ClipPage> {
        let response = self
            .client
            .list_clips(&self.game_id, &self.started_at, first, after.as_deref())
            .await?;
        Ok(ClipPage {
            clips: response.data,
            cursor: response.pagination.into_cursor(),
        })
    }
}

/// Calendar date of `now` in UTC.
pub fn utc_date(now: jiff::Timestamp) -> Date {
    now.to_zoned(jiff::tz::TimeZone::UTC).date()
}

/// Midnight UTC `days_ago` days before `today`, in the format Helix expects.
pub fn window_start(today: Date, days_ago: u32) -> eyre::Result<String> {
    let start = today.checked_sub(i64::from(days_ago).days())?;
    Ok(format!("{start}T00:00:00.00Z"))
}

/// State carried from one page to the next.
#[derive(Debug, Default)]
struct Progress {
    selection: Selection,
    /// Seconds of video accepted so far (manual mode).
    running_total: f64,
    cursor: Option<String>,
    pages: usize,
}

/// Pages through `pages` and returns the chosen clips.
///
/// `decisions` is only consulted in [`Mode::Manual`].
#[instrument(skip(pages, decisions))]
pub async fn select_clips<S, D>(pages: &S, mode: Mode, decisions: &mut D) -> eyre::Result<Selection>
where
    S: ClipPages,
    D: DecisionSource,
{
    let mut progress = Progress::default();

    loop {
        let first = match mode {
            Mode::Manual { page_size } => page_size,
            Mode::Automatic { count } => {
                (count - progress.selection.len() as u32).min(MAX_PAGE_SIZE)
            }
        };
        tracing::info!(first, page = progress.pages, "requesting clips");
        let page = pages.fetch(first, progress.cursor.take()).await?;
        progress.pages += 1;

        for clip in page.clips {
            match mode {
                Mode::Automatic { count } => {
                    take(&mut progress.selection, &clip);
                    if progress.selection.len() as u32 >= count {
                        tracing::info!(clips = progress.selection.len(), "clips received");
                        return Ok(progress.selection);
                    }
                }
                Mode::Manual { .. } => {
                    let decision = decisions.decide(&clip, progress.running_total).await?;
                    if decision.accepts() && take(&mut progress.selection, &clip) {
                        progress.running_total += clip.duration;
                    }
                    if decision.finishes() {
                        tracing::info!(clips = progress.selection.len(), "clips chosen");
                        return Ok(progress.selection);
                    }
                }
            }
        }

        // Still here: manual mode without a finish signal, or automatic mode short of its
        // target. Either way another page is needed.
        match page.cursor {
            Some(cursor) => progress.cursor = Some(cursor),
            None => {
                tracing::warn!(
                    clips = progress.selection.len(),
                    pages = progress.pages,
                    "ran out of clip pages"
                );
                return Err(Fault::PageExhausted {
                    selection: progress.selection,
                }
                .into());
            }
        }
    }
}

/// Adds `clip` to the selection, returning whether it could be used.
fn take(selection: &mut Selection, clip: &Clip) -> bool {
    match selection.push(clip) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(url = %clip.url, error = %e, "skipping clip without a usable media url");
            false
        }
    }
}
