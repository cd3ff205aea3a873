//! Publishing to the video-hosting platform.

pub mod client;
pub mod oauth;
pub mod playlists;
pub mod types;
pub mod upload;

use crate::config::{Config, YouTubeClientSecrets, load_json};
use client::{TimeBoundAccessToken, YouTubeClient};
use eyre::Context;
use oauth::{OAuthManager, TokenStore};
use std::sync::Arc;

/// Builds a client authorized as the operator.
///
/// A stored token is refreshed and reused. Without one, or if the refresh is refused, the
/// operator goes through the browser consent flow. Either way the token in use is written back
/// to the token store.
pub async fn connect(config: &Config) -> eyre::Result<YouTubeClient> {
    let secrets: YouTubeClientSecrets = load_json(&config.youtube_secret_path())
        .await
        .context("load upload platform client secrets")?;
    let oauth = Arc::new(OAuthManager::new(&secrets.installed));
    let store = TokenStore::new(config.youtube_tokens_path());

    let mut token = None;
    if let Some(stored) = store.load().await? {
        let mut stored = TimeBoundAccessToken::expired(stored);
        if stored.refresh(&oauth).await? {
            tracing::info!("reusing stored upload platform token");
            token = Some(stored);
        }
    }
    let token = match token {
        Some(token) => token,
        None => TimeBoundAccessToken::new(
            oauth
                .authenticate()
                .await
                .context("authorize upload platform access")?,
        ),
    };
    store.save(token.raw_token()).await?;

    let http = reqwest::Client::builder()
        // The upload protocol answers 308 to mean "keep going".
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("build HTTP client")?;
    Ok(YouTubeClient::new(token, oauth, http))
}
