//! Outbound page fetching.
//!
//! [`PageFetcher`] is the seam the orchestrator and the save pipeline fetch
//! through; [`HttpFetcher`] is the reqwest-backed implementation. Non-2xx
//! responses, transport errors, and timeouts all surface as
//! [`PatchScoutError::Fetch`].

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, instrument};
use url::Url;

use patchscout_shared::{FetchConfig, PatchScoutError, Result};

/// A successfully fetched HTML document.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// URL as requested.
    pub url: Url,
    /// URL after redirects.
    pub final_url: Url,
    pub status: u16,
    pub html: String,
    pub fetched_at: DateTime<Utc>,
}

/// Fetches a page's HTML.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchedPage>;
}

/// reqwest-backed fetcher with a descriptive user agent and a hard timeout.
pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    allow_localhost: bool,
}

impl HttpFetcher {
    /// Build a fetcher from the `[fetch]` config section.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let timeout = config.timeout();
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| PatchScoutError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeout,
            allow_localhost: false,
        })
    }

    /// Allow fetching localhost/private IPs (mock servers in tests).
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    #[instrument(skip(self), fields(url = %url))]
    async fn fetch(&self, url: &Url) -> Result<FetchedPage> {
        if !self.allow_localhost && is_ssrf_target(url) {
            return Err(PatchScoutError::fetch(url.as_str(), "blocked private or non-http target"));
        }

        debug!("fetching page");

        // The client timeout covers connect + body; this bounds the whole call.
        let response = tokio::time::timeout(self.timeout, self.client.get(url.as_str()).send())
            .await
            .map_err(|_| PatchScoutError::fetch_timeout(url.as_str()))?
            .map_err(|e| map_reqwest_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PatchScoutError::fetch(url.as_str(), format!("HTTP {status}")));
        }

        if let Some(content_type) = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            let content_type = content_type.to_ascii_lowercase();
            if !(content_type.contains("html") || content_type.starts_with("text/")) {
                return Err(PatchScoutError::fetch(
                    url.as_str(),
                    format!("unsupported content type {content_type}"),
                ));
            }
        }

        let final_url = response.url().clone();
        let html = tokio::time::timeout(self.timeout, response.text())
            .await
            .map_err(|_| PatchScoutError::fetch_timeout(url.as_str()))?
            .map_err(|e| map_reqwest_error(url, e))?;

        Ok(FetchedPage {
            url: url.clone(),
            final_url,
            status: status.as_u16(),
            html,
            fetched_at: Utc::now(),
        })
    }
}

fn map_reqwest_error(url: &Url, e: reqwest::Error) -> PatchScoutError {
    if e.is_timeout() {
        PatchScoutError::fetch_timeout(url.as_str())
    } else {
        PatchScoutError::fetch(url.as_str(), e.to_string())
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    if let Some(host) = url.host_str() {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return is_private_ip(&ip);
        }
        if host == "localhost" || host.ends_with(".local") || host.ends_with(".internal") {
            return true;
        }
    }

    false
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}
