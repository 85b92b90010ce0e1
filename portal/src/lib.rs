//! Minimal client for the interactive-story portal.
//!
//! This crate provides a focused HTTP client for the portal that hosts
//! choice-driven interactive stories:
//! - Form-based login with a per-client cookie session
//! - Page fetches that carry the session cookies
//! - URL builders for story, outline, and chapter pages
//! - Field extraction from fetched markup (see [`extract`])
//!
//! The client owns all session state; nothing here is process-global.

pub mod extract;

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Base URL for interactive stories on the portal.
const DEFAULT_BASE_URL: &str = "https://www.quillportal.com/interactive";

/// Login endpoint, relative to the portal host.
const LOGIN_URL: &str = "https://www.quillportal.com/login";

/// Errors that can occur when talking to the portal.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Login failed - check username and password")]
    LoginFailed,

    #[error("PORTAL_USERNAME / PORTAL_PASSWORD not configured")]
    MissingCredentials,
}

/// Portal client with a private cookie session.
///
/// Logging in stores the session cookies on the client, and every later
/// fetch sends them, so member-only pages resolve once [`Portal::login`]
/// has succeeded.
#[derive(Debug, Clone)]
pub struct Portal {
    client: reqwest::Client,
    base_url: String,
    login_url: String,
}

impl Default for Portal {
    fn default() -> Self {
        Self::new()
    }
}

impl Portal {
    /// Create a new portal client with an empty cookie session.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .cookie_store(true)
                .timeout(Duration::from_secs(60))
                .connect_timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to build HTTP client"),
            base_url: DEFAULT_BASE_URL.to_string(),
            login_url: LOGIN_URL.to_string(),
        }
    }

    /// Point the client at a different portal host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Point the login form at a different endpoint.
    pub fn with_login_url(mut self, login_url: impl Into<String>) -> Self {
        self.login_url = login_url.into();
        self
    }

    /// Read portal credentials from `PORTAL_USERNAME` / `PORTAL_PASSWORD`.
    pub fn credentials_from_env() -> Result<(String, String), Error> {
        let username = std::env::var("PORTAL_USERNAME").map_err(|_| Error::MissingCredentials)?;
        let password = std::env::var("PORTAL_PASSWORD").map_err(|_| Error::MissingCredentials)?;
        Ok((username, password))
    }

    /// Log in to the portal, storing the session cookies on this client.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), Error> {
        let form = [
            ("login_username", username),
            ("login_password", password),
            ("submit", "submit"),
        ];
        let response = self
            .client
            .post(&self.login_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        // The portal answers the login POST with a full page either way;
        // only the page title tells success from failure.
        if extract::is_login_failed(&body) {
            return Err(Error::LoginFailed);
        }
        debug!(username, "logged in to portal");
        Ok(())
    }

    /// Fetch a page as text, sending the session cookies.
    pub async fn page(&self, url: &str) -> Result<String, Error> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        response
            .text()
            .await
            .map_err(|e| Error::Network(e.to_string()))
    }

    /// URL of a story's main page.
    pub fn story_url(&self, item_id: u32) -> String {
        format!("{}/{item_id}", self.base_url)
    }

    /// URL of a story's outline listing.
    pub fn outline_url(&self, item_id: u32) -> String {
        format!("{}/{item_id}/outline", self.base_url)
    }

    /// URL of one chapter page.
    ///
    /// `path` is the 0-based choice path; the portal addresses chapters by
    /// 1-based segments joined with `-`, e.g. path `[0, 2]` -> `.../map/1-3`.
    pub fn chapter_url(&self, item_id: u32, path: &[u8]) -> String {
        let segments = path
            .iter()
            .map(|c| (*c as u16 + 1).to_string())
            .collect::<Vec<_>>()
            .join("-");
        format!("{}/{item_id}/map/{segments}", self.base_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapter_url_uses_one_based_segments() {
        let portal = Portal::new().with_base_url("https://portal.test/interactive");
        assert_eq!(
            portal.chapter_url(1234, &[0, 2, 1]),
            "https://portal.test/interactive/1234/map/1-3-2"
        );
    }

    #[test]
    fn story_and_outline_urls() {
        let portal = Portal::new().with_base_url("https://portal.test/interactive");
        assert_eq!(portal.story_url(77), "https://portal.test/interactive/77");
        assert_eq!(
            portal.outline_url(77),
            "https://portal.test/interactive/77/outline"
        );
    }

    #[test]
    fn missing_credentials_error() {
        std::env::remove_var("PORTAL_USERNAME");
        std::env::remove_var("PORTAL_PASSWORD");
        assert!(matches!(
            Portal::credentials_from_env(),
            Err(Error::MissingCredentials)
        ));
    }
}
