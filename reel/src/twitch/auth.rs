//! App access tokens through the client-credentials grant.

use crate::config::TwitchCredentials;
use crate::error::Fault;
use crate::twitch::types::AppAccessToken;
use eyre::Context;
use tracing::instrument;

/// Token endpoint of the clips provider.
pub const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";

/// Exchanges application credentials for a bearer token.
///
/// An HTTP error status means the credentials were rejected; that is reported immediately as
/// [`Fault::CredentialsInvalid`] with the server's response body. Any transport failure (timeout,
/// refused or reset connection, a peer hanging up mid-response) restarts the whole exchange, up to `retries` more times, after which
/// [`Fault::NetworkTransient`] is returned.
#[instrument(skip(http, credentials), fields(client_id = %credentials.client_id))]
pub async fn request_app_token(
    http: &reqwest::Client,
    token_url: &str,
    credentials: &TwitchCredentials,
    retries: u32,
) -> eyre::Result<String> {
    let mut failures = 0;
    let response = loop {
        match http.post(token_url).form(credentials).send().await {
            Ok(response) => break response,
            Err(e) if !e.is_builder() && !e.is_redirect() => {
                failures += 1;
                tracing::warn!(error = %e, failures, "token request failed");
                if failures > retries {
                    return Err(Fault::NetworkTransient { attempts: failures }.into());
                }
                tracing::info!("trying again");
            }
            Err(e) => return Err(e).context("send token request"),
        }
    };

    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(Fault::CredentialsInvalid { status, body }.into());
    }

    let token: AppAccessToken = response
        .json()
        .await
        .context("parse token response as JSON")?;
    tracing::info!(expires_in = ?token.expires_in, "clips provider token received");
    Ok(token.access_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> TwitchCredentials {
        TwitchCredentials {
            client_id: "x".repeat(30),
            client_secret: "y".repeat(30),
            grant_type: "client_credentials".to_string(),
        }
    }

    fn http() -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn returns_access_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "abc123",
                "expires_in": 1234567,
                "token_type": "bearer",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/oauth2/token", server.uri());
        let token = request_app_token(&http(), &url, &credentials(), 3)
            .await
            .unwrap();
        assert_eq!(token, "abc123");
    }

    #[tokio::test]
    async fn rejected_credentials_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid client secret"))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/oauth2/token", server.uri());
        let err = request_app_token(&http(), &url, &credentials(), 3)
            .await
            .unwrap_err();
        match err.downcast_ref::<Fault>() {
            Some(Fault::CredentialsInvalid { status, body }) => {
                assert_eq!(status.as_u16(), 400);
                assert_eq!(body, "invalid client secret");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_connections_are_retried_then_given_up() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(socket);
            }
        });

        let url = format!("http://{addr}/oauth2/token");
        let err = request_app_token(&http(), &url, &credentials(), 3)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Fault>(),
            Some(Fault::NetworkTransient { attempts: 4 })
        ));
        assert_eq!(accepted.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn timeouts_are_retried_then_given_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .expect(4)
            .mount(&server)
            .await;

        let url = format!("{}/oauth2/token", server.uri());
        let err = request_app_token(&http(), &url, &credentials(), 3)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Fault>(),
            Some(Fault::NetworkTransient { attempts: 4 })
        ));
    }
}
