//! Plumbing shared by the collaborator adapters.
//!
//! Every collaborator trait returns a [`BackendFuture`] so the traits stay
//! object-safe and can be held as `Arc<dyn _>` in [`crate::Services`]. The
//! HTTP adapters share one `reqwest` client.

use std::future::Future;
use std::pin::Pin;
use std::sync::LazyLock;
use std::time::Duration;

/// Future returned by collaborator operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Joins a base URL and an absolute API path.
pub(crate) fn endpoint(base: &str, path: &str) -> String {
    format!("{}{path}", base.trim_end_matches('/'))
}

/// Reads an error body, falling back to the status line.
pub(crate) async fn error_text(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if body.trim().is_empty() {
        status.to_string()
    } else {
        body
    }
}
