//! OAuth 2.0 for the video-hosting platform.
//!
//! Uploading on the operator's behalf needs a user token, obtained once through the
//! installed-application flow (browser consent, loopback redirect, PKCE) and then kept alive
//! with its refresh token. The token is persisted between runs in a JSON file.

use crate::config::InstalledApp;
use eyre::Context;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response, body};
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge, RedirectUrl,
    Scope, TokenUrl,
};
use oauth2::{TokenResponse, reqwest};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://www.googleapis.com/oauth2/v3/token";
/// Upload, playlist listing and playlist insertion all fall under this one scope.
const SCOPE: &str = "https://www.googleapis.com/auth/youtube";

const OAUTH_DONE_HTML: &str = "<!DOCTYPE html><html><body>\
    <p>Authorization complete. You can close this window and return to the terminal.</p>\
    </body></html>";

/// Runs OAuth flows with the operator's installed-application credentials.
#[derive(Debug, Clone)]
pub struct OAuthManager {
    client_id: String,
    client_secret: String,
}

impl OAuthManager {
    pub fn new(app: &InstalledApp) -> Self {
        Self {
            client_id: app.client_id.clone(),
            client_secret: app.client_secret.clone(),
        }
    }

    fn http_client() -> eyre::Result<reqwest::Client> {
        reqwest::ClientBuilder::new()
            // SSRF no thank you.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build OAuth HTTP client")
    }

    /// Sends the operator through the consent screen and exchanges the resulting code.
    ///
    /// Opens the system browser on the authorization URL and waits for the redirect to land on
    /// a one-shot local HTTP server.
    pub async fn authenticate(&self) -> eyre::Result<BasicTokenResponse> {
        let csrf = CsrfToken::new_random();
        let (redirect_url, eventually_authorization_code) = self
            .setup_redirect(csrf.clone())
            .await
            .context("set up redirect endpoint")?;

        let client = BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_client_secret(ClientSecret::new(self.client_secret.clone()))
            .set_auth_uri(AuthUrl::new(AUTH_URL.to_string()).context("authorization url")?)
            .set_token_uri(TokenUrl::new(TOKEN_URL.to_string()).context("token url")?)
            .set_redirect_uri(redirect_url);

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let (auth_url, _csrf_token) = client
            // The flow runs exactly once, so the CSRF token is never reused.
            .authorize_url(move || csrf.clone())
            .add_scope(Scope::new(SCOPE.to_string()))
            .set_pkce_challenge(pkce_challenge)
            .url();

        tracing::info!(url = %auth_url, "asking operator to follow OAuth flow");
        println!("Authorize uploads in your browser: {auth_url}");
        if let Err(e) = webbrowser::open(auth_url.as_ref()) {
            tracing::warn!(error = %e, "could not open browser, open the URL above manually");
        }
        let authorization_code = eventually_authorization_code
            .await
            .context("await operator authorization code")?;

        client
            .exchange_code(authorization_code)
            .set_pkce_verifier(pkce_verifier)
            .request_async(&Self::http_client()?)
            .await
            .context("exchange authorization code for access token")
    }

    /// Exchanges the refresh token of `token` for a fresh access token.
    ///
    /// Returns `Ok(None)` when there is no refresh token or the platform no longer honours it,
    /// in which case the operator has to go through [`Self::authenticate`] again.
    pub async fn refresh_token(
        &self,
        token: &BasicTokenResponse,
    ) -> eyre::Result<Option<BasicTokenResponse>> {
        let Some(refresh_token) = token.refresh_token() else {
            tracing::warn!("no refresh token available, cannot refresh");
            return Ok(None);
        };

        let client = BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_client_secret(ClientSecret::new(self.client_secret.clone()))
            .set_token_uri(TokenUrl::new(TOKEN_URL.to_string()).context("token url")?);

        match client
            .exchange_refresh_token(refresh_token)
            .request_async(&Self::http_client()?)
            .await
        {
            Ok(new_token) => {
                tracing::debug!("refreshed OAuth token");
                Ok(Some(new_token))
            }
            Err(ref e @ oauth2::RequestTokenError::ServerResponse(ref sr))
                if matches!(
                    sr.error(),
                    oauth2::basic::BasicErrorResponseType::InvalidGrant
                ) =>
            {
                tracing::warn!("refresh token no longer valid: {}", e);
                Ok(None)
            }
            Err(e) => Err(e).context("exchange refresh token"),
        }
    }

    /// Binds a loopback listener for the OAuth redirect.
    ///
    /// Returns the redirect URL to hand to the platform, and a future that resolves to the
    /// authorization code once the browser has been redirected back with a matching `state`.
    async fn setup_redirect(
        &self,
        csrf: CsrfToken,
    ) -> eyre::Result<(
        RedirectUrl,
        impl Future<Output = eyre::Result<AuthorizationCode>>,
    )> {
        let socket = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind to localhost")?;
        let addr = socket.local_addr().context("get local address")?;
        let url = RedirectUrl::new(format!("http://{}:{}", addr.ip(), addr.port()))
            .context("construct redirect url")?;
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let r = async move {
                let (conn, _) = socket.accept().await.context("accept")?;
                let conn = hyper_util::rt::TokioIo::new(conn);
                let (got, mut gotten) = tokio::sync::mpsc::channel(1);
                let service = service_fn(move |req: Request<body::Incoming>| {
                    let csrf = csrf.clone();
                    let got = got.clone();
                    async move {
                        let mut state = None;
                        let mut code = None;
                        for (k, v) in
                            form_urlencoded::parse(req.uri().query().unwrap_or("").as_bytes())
                        {
                            match &*k {
                                "state" => state = Some(v),
                                "code" => code = Some(v),
                                _ => {}
                            }
                        }
                        if state.as_deref() != Some(csrf.secret().as_str()) {
                            return Err("invalid csrf token");
                        }
                        let Some(code) = code else {
                            return Err("no authorization code found");
                        };
                        if got
                            .send(AuthorizationCode::new(code.into_owned()))
                            .await
                            .is_err()
                        {
                            return Err("authorization code no longer awaited");
                        }
                        Ok(Response::new(Full::<Bytes>::from(OAUTH_DONE_HTML)))
                    }
                });
                let mut serve = std::pin::pin!(
                    hyper::server::conn::http1::Builder::new().serve_connection(conn, service)
                );

                tokio::select! {
                    exit = &mut serve => {
                        if let Err(e) = exit {
                            Err(e).context("redirect server got bad request")
                        } else {
                            eyre::bail!("redirect server exited prematurely");
                        }
                    }
                    code = gotten.recv() => {
                        serve.as_mut().graceful_shutdown();
                        code.ok_or_else(|| eyre::eyre!("redirect handler went away"))
                    }
                }
            };
            let _ = tx.send(r.await);
        });
        Ok((url, async move {
            rx.await.context("redirect future dropped prematurely")?
        }))
    }
}

/// Where the platform token is kept between runs.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the stored token, or `None` if there is none or it can't be read back.
    pub async fn load(&self) -> eyre::Result<Option<BasicTokenResponse>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).wrap_err_with(|| format!("read {}", self.path.display())),
        };
        match serde_json::from_slice(&raw) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ignoring unreadable stored token");
                Ok(None)
            }
        }
    }

    pub async fn save(&self, token: &BasicTokenResponse) -> eyre::Result<()> {
        let json = serde_json::to_vec(token).context("serialize token")?;
        tokio::fs::write(&self.path, json)
            .await
            .wrap_err_with(|| format!("write {}", self.path.display()))
    }
}
