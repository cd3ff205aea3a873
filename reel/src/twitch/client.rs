//! Client for the Helix REST API of the clips provider.

use crate::config::{Config, TwitchCredentials};
use crate::twitch::auth::{self, TOKEN_URL};
use crate::twitch::types::{ClipListResponse, Game, GameListResponse};
use eyre::Context;
use http::Method;
use tracing::instrument;

pub const HELIX_URL: &str = "https://api.twitch.tv/helix";

/// Largest page Helix will hand out.
pub const MAX_PAGE_SIZE: u32 = 100;

/// An authenticated Helix client.
///
/// Every request carries the app access token as a bearer token along with the application's
/// client id, which Helix requires alongside the token.
#[derive(Debug, Clone)]
pub struct HelixClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    access_token: String,
}

impl HelixClient {
    /// Acquires an app access token and returns a client using it.
    pub async fn connect(config: &Config, credentials: &TwitchCredentials) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .context("build HTTP client")?;
        let access_token =
            auth::request_app_token(&http, TOKEN_URL, credentials, config.oauth_retries).await?;
        Ok(Self::new(
            http,
            HELIX_URL,
            credentials.client_id.clone(),
            access_token,
        ))
    }

    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            client_id: client_id.into(),
            access_token: access_token.into(),
        }
    }

    /// Makes an authenticated GET request to Helix and checks the status code.
    #[instrument(skip(self), level = tracing::Level::TRACE)]
    async fn make_authenticated_request(
        &self,
        endpoint: &str,
        query_params: &[(&str, &str)],
    ) -> eyre::Result<reqwest::Response> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self
            .http
            .request(Method::GET, &url)
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("Client-Id", &self.client_id)
            .query(query_params)
            .send()
            .await
            .with_context(|| format!("send request to Helix API: {url}"))?;

        let status_code = response.status();
        if !status_code.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(eyre::eyre!(
                "Helix API request to {} failed with status {}: {}",
                endpoint,
                status_code,
                error_text
            ));
        }

        Ok(response)
    }

    /// Looks up games by their exact name.
    ///
    /// See: <https://dev.twitch.tv/docs/api/reference/#get-games>
    #[instrument(skip(self))]
    pub async fn search_games(&self, name: &str) -> eyre::Result<Vec<Game>> {
        let response = self
            .make_authenticated_request("games", &[("name", name)])
            .await?;
        let games: GameListResponse = response
            .json()
            .await
            .context("parse Helix games response as JSON")?;
        tracing::debug!(returned_items = games.data.len(), "fetched games");
        Ok(games.data)
    }

    /// Fetches one page of clips for a game, created on or after `started_at`.
    ///
    /// See: <https://dev.twitch.tv/docs/api/reference/#get-clips>
    #[instrument(skip(self))]
    pub async fn list_clips(
        &self,
        game_id: &str,
        started_at: &str,
        first: u32,
        after: Option<&str>,
    ) -> eyre::Result<ClipListResponse> {
        let first = first.clamp(1, MAX_PAGE_SIZE).to_string();
        let mut query_params = vec![
            ("game_id", game_id),
            ("first", first.as_str()),
            ("started_at", started_at),
        ];
        if let Some(cursor) = after {
            query_params.push(("after", cursor));
        }

        let response = self
            .make_authenticated_request("clips", &query_params)
            .await?;
        let clips: ClipListResponse = response
            .json()
            .await
            .context("parse Helix clips response as JSON")?;
        tracing::debug!(
            returned_items = clips.data.len(),
            has_cursor = clips.pagination.cursor.is_some(),
            "fetched clips"
        );
        Ok(clips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn clip_requests_carry_auth_and_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/clips"))
            .and(header("Authorization", "Bearer tok"))
            .and(header("Client-Id", "cid"))
            .and(query_param("game_id", "33214"))
            .and(query_param("first", "20"))
            .and(query_param("started_at", "2024-01-01T00:00:00.00Z"))
            .and(query_param("after", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [],
                "pagination": {}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HelixClient::new(reqwest::Client::new(), server.uri(), "cid", "tok");
        let page = client
            .list_clips("33214", "2024-01-01T00:00:00.00Z", 20, Some("abc"))
            .await
            .unwrap();
        assert!(page.data.is_empty());
    }

    #[tokio::test]
    async fn first_page_has_no_cursor_and_size_is_capped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/clips"))
            .and(query_param("first", "100"))
            .and(query_param_is_missing("after"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [],
                "pagination": {}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HelixClient::new(reqwest::Client::new(), server.uri(), "cid", "tok");
        client.list_clips("1", "t", 250, None).await.unwrap();
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid oauth token"))
            .mount(&server)
            .await;

        let client = HelixClient::new(reqwest::Client::new(), server.uri(), "cid", "tok");
        let err = client.search_games("Apex Legends").await.unwrap_err();
        assert!(err.to_string().contains("401"), "{err}");
    }
}
