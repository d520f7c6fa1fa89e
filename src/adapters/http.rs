//! Transcript fetcher over HTTP. Each egress identity other than
//! [`DIRECT`] is a proxy URL (`http://`, `https://` or `socks5://`), so the
//! leased identity decides which route the request takes.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::error::CollaboratorError;
use crate::pipeline::{Fetched, Fetcher};

/// Identity meaning "no proxy".
pub const DIRECT: &str = "direct";

/// Bodies that mean the service answered with a bot check instead of content.
const BLOCK_MARKERS: &[&str] = &[
    "unusual traffic",
    "captcha",
    "confirm you're not a bot",
    "confirm you\u{2019}re not a bot",
];

/// Fetches transcripts over HTTP, one client per egress identity.
pub struct HttpFetcher {
    url_template: String,
    timeout: Duration,
    clients: Mutex<HashMap<String, Client>>,
}

impl HttpFetcher {
    /// `url_template` must contain `{id}`, replaced by the job key.
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url_template: url_template.into(),
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn url_for(&self, key: &str) -> String {
        self.url_template.replace("{id}", key)
    }

    fn client_for(&self, resource: &str) -> Result<Client, CollaboratorError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(resource) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(self.timeout);
        if resource != DIRECT {
            let proxy = reqwest::Proxy::all(resource)
                .map_err(|e| CollaboratorError::Invalid(format!("bad proxy {resource}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| {
                CollaboratorError::Transient(format!("failed to build HTTP client: {e}"))
            })?;
        clients.insert(resource.to_string(), client.clone());
        Ok(client)
    }
}

fn classify_status(status: StatusCode) -> Option<CollaboratorError> {
    if status.is_success() {
        return None;
    }
    let message = format!("HTTP {status}");
    Some(match status {
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
            CollaboratorError::Rejected(message)
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => CollaboratorError::Invalid(message),
        _ => CollaboratorError::Transient(message),
    })
}

fn looks_blocked(body: &str) -> bool {
    let lower = body.to_lowercase();
    BLOCK_MARKERS.iter().any(|marker| lower.contains(marker))
}

impl Fetcher for HttpFetcher {
    async fn fetch(&self, key: &str, resource: &str) -> Result<Fetched, CollaboratorError> {
        let client = self.client_for(resource)?;
        let url = self.url_for(key);
        debug!(%url, resource, "fetching transcript");

        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| CollaboratorError::Transient(e.to_string()))?;

        if let Some(err) = classify_status(response.status()) {
            return Err(err);
        }

        let body = response
            .text()
            .await
            .map_err(|e| CollaboratorError::Transient(e.to_string()))?;

        if looks_blocked(&body) {
            return Err(CollaboratorError::Rejected("bot check page instead of transcript".into()));
        }
        if body.trim().is_empty() {
            return Err(CollaboratorError::Transient("empty transcript body".into()));
        }
        Ok(Fetched::ok(body))
    }
}
