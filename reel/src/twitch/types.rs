//! Helix API payloads.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Response of `GET /helix/games`.
///
/// See: <https://dev.twitch.tv/docs/api/reference/#get-games>
#[derive(Debug, Serialize, Deserialize)]
pub struct GameListResponse {
    pub data: Vec<Game>,
}

/// A game (category) as known by the clips provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    /// The provider's canonical identifier for the category.
    pub id: String,
    pub name: String,
}

/// Response of `GET /helix/clips`.
///
/// See: <https://dev.twitch.tv/docs/api/reference/#get-clips>
#[derive(Debug, Serialize, Deserialize)]
pub struct ClipListResponse {
    pub data: VecDeque<Clip>,
    #[serde(default)]
    pub pagination: Pagination,
}

/// Cursor block of a paged Helix response.
///
/// An absent or empty cursor means there are no more pages.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Pagination {
    pub cursor: Option<String>,
}

impl Pagination {
    pub fn into_cursor(self) -> Option<String> {
        self.cursor.filter(|c| !c.is_empty())
    }
}

/// A clip candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    /// Public, shareable URL of the clip (its "slug").
    pub url: String,
    pub thumbnail_url: String,
    pub broadcaster_name: String,
    /// Length in seconds, as reported by the provider.
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Clip {
    /// Direct media URL of the clip.
    ///
    /// The provider doesn't expose one, but it can be derived from the thumbnail: everything
    /// from `-preview` onwards is replaced with `.mp4`.
    pub fn download_url(&self) -> eyre::Result<String> {
        download_url_from_thumbnail(&self.thumbnail_url)
    }
}

pub fn download_url_from_thumbnail(thumbnail_url: &str) -> eyre::Result<String> {
    let Some(splice) = thumbnail_url.find("-preview") else {
        eyre::bail!("thumbnail url {thumbnail_url:?} has no -preview suffix");
    };
    Ok(format!("{}.mp4", &thumbnail_url[..splice]))
}

/// Response of the client-credentials token exchange.
#[derive(Debug, Deserialize)]
pub struct AppAccessToken {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}
