//! Caller identity plumbing
//!
//! Authentication itself happens upstream (gateway or sidecar); this service
//! receives the already-verified identity in headers and uses it for
//! logging/attribution only, never for authorization decisions.

use axum::http::HeaderMap;

/// Header carrying the authenticated username.
pub const USERNAME_HEADER: &str = "x-client-username";
/// Header carrying the calling application, when the credential belongs to a
/// client application rather than a person.
pub const APPLICATION_HEADER: &str = "x-client-application";

/// Authenticated caller identity.
#[derive(Debug, Clone)]
pub struct Identity {
    pub username: String,
    pub application: Option<String>,
}

impl Identity {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let username = headers
            .get(USERNAME_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .unwrap_or("unknown")
            .to_string();
        let application = headers
            .get(APPLICATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string());

        Identity {
            username,
            application,
        }
    }

    /// `application/username` or just `username`, for log lines.
    pub fn log_label(&self) -> String {
        match &self.application {
            Some(app) => format!("{}/{}", app, self.username),
            None => self.username.clone(),
        }
    }
}
