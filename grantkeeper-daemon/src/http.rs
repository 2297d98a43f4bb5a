//! HTTP(S) surface: authorization start and the OAuth2 redirect callback.
//!
//! - `GET /auth?account=<name>` redirects the browser to the provider
//! - `GET /?state=account:<name>&code=<code>` completes the exchange

use axum::{
    Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use grantkeeper_core::oauth::account_from_state;
use serde::Deserialize;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::daemon::wait_for_shutdown;
use crate::state::DaemonState;

const ISSUE_URL: &str = "https://github.com/grantkeeper/grantkeeper/issues/new/choose";

/// Build the callback router.
pub fn router(state: Arc<DaemonState>) -> Router {
    Router::new()
        .route("/", get(callback))
        .route("/auth", get(start_auth))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct AuthParams {
    account: Option<String>,
}

async fn start_auth(
    State(state): State<Arc<DaemonState>>,
    Query(params): Query<AuthParams>,
) -> Response {
    let account = params.account.unwrap_or_default();

    match state.manager.engine().authorize_url(&account) {
        Ok(url) => {
            info!(account = %account, "Starting authorization");
            (StatusCode::FOUND, [(header::LOCATION, url.to_string())]).into_response()
        }
        Err(e) => {
            warn!(account = %account, error = %e, "Cannot start authorization");
            error_page(
                StatusCode::BAD_REQUEST,
                &format!("Account '{}' not found.", account),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    state: Option<String>,
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

async fn callback(
    State(state): State<Arc<DaemonState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(provider_error) = params.error {
        let description = params.error_description.unwrap_or(provider_error);
        warn!(error = %description, "Provider returned an authorization error");
        return error_page(
            StatusCode::BAD_REQUEST,
            &format!("Authorization failed: {}", description),
        );
    }

    let Some(account) = params.state.as_deref().and_then(account_from_state) else {
        return error_page(StatusCode::BAD_REQUEST, "Invalid state parameter.");
    };

    if !state.manager.accounts().contains(account) {
        return error_page(StatusCode::BAD_REQUEST, "Invalid Account");
    }

    let Some(code) = params.code.filter(|code| !code.is_empty()) else {
        return error_page(StatusCode::BAD_REQUEST, "Missing authorization code.");
    };

    let token = match state.manager.engine().exchange_code(account, &code).await {
        Ok(token) => token,
        Err(e) => {
            error!(account, error = %e, "Token exchange failed");
            return error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to exchange token. Please try again.",
            );
        }
    };

    if let Err(e) = state.manager.store_authorized(account, &token).await {
        error!(account, error = %e, "Failed to store token");
        return error_page(
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to store token. Please try again.",
        );
    }

    success_page(account)
}

fn success_page(account: &str) -> Response {
    let body = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8" />
<meta name="viewport" content="width=device-width, initial-scale=1" />
<title>Authentication Successful</title>
<style>
  body {{ font-family: system-ui, sans-serif; background: #f0f4f8; display: flex; height: 100vh; margin: 0; align-items: center; justify-content: center; }}
  .card {{ background: #fff; padding: 2rem 3rem; border-radius: 10px; max-width: 420px; text-align: center; box-shadow: 0 4px 12px rgb(0 0 0 / 0.1); }}
  h1 {{ color: #2e7d32; }}
</style>
</head>
<body>
  <div class="card">
    <h1>Authentication Successful</h1>
    <p>Your account <strong>{}</strong> has been authenticated successfully.</p>
    <p>You can safely close this tab now.</p>
    <p><em>grantkeeper</em> will keep the token fresh in the background.</p>
  </div>
</body>
</html>
"#,
        escape_html(account)
    );
    (StatusCode::OK, Html(body)).into_response()
}

fn error_page(status: StatusCode, message: &str) -> Response {
    let body = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8" />
<meta name="viewport" content="width=device-width, initial-scale=1" />
<title>Error</title>
<style>
  body {{ font-family: system-ui, sans-serif; background: #f8d7da; display: flex; height: 100vh; margin: 0; align-items: center; justify-content: center; }}
  .card {{ background: #fff0f0; padding: 2rem 3rem; border-radius: 10px; max-width: 420px; text-align: center; border: 1px solid #f5c6cb; color: #721c24; }}
</style>
</head>
<body>
  <div class="card">
    <h1>Error Occurred</h1>
    <p>{}</p>
    <p>Please try again or consider opening a <a href="{}">GitHub Issue</a> if the problem persists.</p>
  </div>
</body>
</html>
"#,
        escape_html(message),
        ISSUE_URL
    );
    (status, Html(body)).into_response()
}

/// Escape text for inclusion in HTML element content or attributes.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Serve `app` over plain HTTP until shutdown.
pub async fn serve_http(
    listener: TcpListener,
    app: Router,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown))
        .await
}

/// Serve `app` over HTTPS with `tls` until shutdown.
pub async fn serve_https(
    listener: TcpListener,
    app: Router,
    tls: axum_server::tls_rustls::RustlsConfig,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    listener.set_nonblocking(true)?;
    let handle = axum_server::Handle::new();

    let stopper = handle.clone();
    tokio::spawn(async move {
        wait_for_shutdown(shutdown).await;
        stopper.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    axum_server::from_tcp_rustls(listener, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<script>alert("x&'y")</script>"#),
            "&lt;script&gt;alert(&quot;x&amp;&#39;y&quot;)&lt;/script&gt;"
        );
        assert_eq!(escape_html("work"), "work");
    }
}
