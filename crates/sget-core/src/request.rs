//! Request template: URL, headers, and credentials shared by every HTTP call
//! of a session (probe, range fetchers, fallback, hash audit).
//!
//! Each call clones the template into a fresh curl `Easy` handle, so handles
//! are never shared across threads.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::time::Duration;

/// Basic-auth credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Immutable description of how to talk to the server.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    url: String,
    headers: HashMap<String, String>,
    auth: Option<Credentials>,
    connect_timeout: Duration,
}

impl RequestTemplate {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        RequestTemplate {
            url: url.into(),
            headers: HashMap::new(),
            auth: None,
            connect_timeout,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_auth(mut self, auth: Option<Credentials>) -> Self {
        self.auth = auth;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Same template with `key=value` set in the URL query string (used by the
    /// hash audit's `hash=sha1` parameter).
    pub fn with_query_param(&self, key: &str, value: &str) -> Result<RequestTemplate> {
        let mut url = url::Url::parse(&self.url)
            .with_context(|| format!("invalid URL: {}", self.url))?;
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != key)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(pairs)
            .append_pair(key, value);
        let mut out = self.clone();
        out.url = url.to_string();
        Ok(out)
    }

    /// Fresh curl handle configured from this template: redirects followed,
    /// connect timeout set, custom headers and credentials applied.
    pub(crate) fn new_easy(&self) -> Result<curl::easy::Easy, curl::Error> {
        let mut easy = curl::easy::Easy::new();
        easy.url(&self.url)?;
        easy.follow_location(true)?;
        easy.max_redirections(10)?;
        easy.connect_timeout(self.connect_timeout)?;
        if !self.headers.is_empty() {
            let mut list = curl::easy::List::new();
            for (k, v) in &self.headers {
                list.append(&format!("{}: {}", k.trim(), v.trim()))?;
            }
            easy.http_headers(list)?;
        }
        if let Some(auth) = &self.auth {
            easy.username(&auth.username)?;
            easy.password(&auth.password)?;
        }
        Ok(easy)
    }
}
