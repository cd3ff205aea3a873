//! Where things live on disk, and the knobs of a run.

use eyre::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of clips shown per page when the operator picks clips by hand.
pub const MANUAL_PAGE_SIZE: u32 = 20;

/// Everything a run needs to know that isn't part of the request itself.
///
/// Passed by reference into the components that need it; there is no process-wide state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding secrets, caches, the scratch directory and the rendered video.
    pub root: PathBuf,
    /// Timeout applied to every HTTP exchange with the clips provider.
    pub http_timeout: Duration,
    /// Page size used in manual mode.
    pub manual_page_size: u32,
    /// Extra attempts after a transport failure while acquiring the clips-provider token.
    pub oauth_retries: u32,
    /// Retries allowed for retriable upload faults.
    pub upload_retries: u32,
    /// How long to let the hosting platform process an upload before filing it into a playlist.
    pub upload_settle_delay: Duration,
    /// Static text placed above the chapter list in the video description.
    pub promo: Option<String>,
    /// Image shown beside each clip's caption.
    pub logo: Option<PathBuf>,
    /// Video category on the hosting platform (20 is Gaming).
    pub video_category_id: String,
    pub privacy_status: String,
}

impl Config {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            http_timeout: Duration::from_secs(5),
            manual_page_size: MANUAL_PAGE_SIZE,
            oauth_retries: 3,
            upload_retries: 10,
            upload_settle_delay: Duration::from_secs(60),
            promo: None,
            logo: None,
            video_category_id: "20".to_string(),
            privacy_status: "private".to_string(),
        }
    }

    pub fn twitch_secret_path(&self) -> PathBuf {
        self.root.join("twitch_client_secret.json")
    }

    pub fn youtube_secret_path(&self) -> PathBuf {
        self.root.join("yt_client_secret.json")
    }

    pub fn youtube_tokens_path(&self) -> PathBuf {
        self.root.join("yt_tokens.json")
    }

    pub fn game_ids_path(&self) -> PathBuf {
        self.root.join("game_ids.json")
    }

    pub fn playlist_ids_path(&self) -> PathBuf {
        self.root.join("playlist_ids.json")
    }

    pub fn tags_path(&self) -> PathBuf {
        self.root.join("tags.json")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn output_path(&self) -> PathBuf {
        self.root.join("final.mp4")
    }
}

/// Application credentials for the clips provider's client-credentials grant.
///
/// Stored as `twitch_client_secret.json`; the fields are sent verbatim as the form body of the
/// token request.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct TwitchCredentials {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_grant_type")]
    pub grant_type: String,
}

fn default_grant_type() -> String {
    "client_credentials".to_string()
}

/// Installed-application client secrets for the hosting platform, in the format the Google
/// developer console hands out.
#[derive(Debug, Clone, Deserialize)]
pub struct YouTubeClientSecrets {
    pub installed: InstalledApp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstalledApp {
    pub client_id: String,
    pub client_secret: String,
}

pub async fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> eyre::Result<T> {
    let raw = tokio::fs::read(path)
        .await
        .wrap_err_with(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&raw).wrap_err_with(|| format!("parse {}", path.display()))
}
