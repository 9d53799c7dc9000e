// Pull side over HTTP
//
// Snapshot and history pulls via reqwest. 404 means "not found yet", any
// other non-success status is an API error with the response body as message.

use async_trait::async_trait;
use reqwest::StatusCode;
use runsync_core::{
    ConfigError, EntitySnapshot, EventPage, Envelope, Lifecycle, PullError, SnapshotSource,
};
use tracing::{debug, instrument};
use url::Url;

use crate::config::HttpConfig;
use crate::wire::{decode_snapshot, HistoryResponse};

/// Largest page the history endpoint serves
pub const MAX_PAGE_SIZE: usize = 500;

pub struct HttpSnapshotSource {
    config: HttpConfig,
    http: reqwest::Client,
}

impl HttpSnapshotSource {
    pub fn new(config: HttpConfig) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ConfigError::invalid("http client", e.to_string()))?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    async fn get_text(&self, url: Url) -> Result<String, PullError> {
        let mut request = self.http.get(url);
        if let Some(token) = &self.config.api_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| PullError::http(e.to_string()))?;
        self.handle_response(response).await
    }

    async fn handle_response(&self, response: reqwest::Response) -> Result<String, PullError> {
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(PullError::NotFound);
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PullError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .text()
            .await
            .map_err(|e| PullError::http(e.to_string()))
    }
}

fn endpoint_error(e: ConfigError) -> PullError {
    PullError::http(e.to_string())
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    #[instrument(level = "debug", skip(self))]
    async fn fetch_snapshot(
        &self,
        entity_id: &str,
        lifecycle: Lifecycle,
    ) -> Result<EntitySnapshot, PullError> {
        let url = self
            .config
            .snapshot_url(entity_id, lifecycle)
            .map_err(endpoint_error)?
            .ok_or(PullError::Unsupported(lifecycle))?;
        let body = self.get_text(url).await?;
        decode_snapshot(&body, entity_id)
    }

    /// The cursor is the server-side offset into the newest-first listing.
    #[instrument(level = "debug", skip(self))]
    async fn fetch_events(
        &self,
        entity_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<EventPage, PullError> {
        let offset = match cursor {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| PullError::decode(format!("invalid history cursor '{}'", raw)))?,
            None => 0,
        };
        let limit = limit.clamp(1, MAX_PAGE_SIZE);

        let url = self
            .config
            .events_url(entity_id, limit, offset)
            .map_err(endpoint_error)?;
        let body = self.get_text(url).await?;
        let page: HistoryResponse = serde_json::from_str(&body)
            .map_err(|e| PullError::decode(format!("history of {}: {}", entity_id, e)))?;

        let returned = page.events.len();
        let consumed = offset + returned;
        let next_cursor = (returned > 0 && consumed < page.total_count).then(|| consumed.to_string());

        // Newest first on the wire, oldest first in the page
        let events: Vec<Envelope> = page.events.into_iter().rev().map(Envelope::from).collect();
        debug!(entity_id = %entity_id, offset, returned, total = page.total_count, "Fetched history page");

        Ok(EventPage {
            events,
            next_cursor,
        })
    }
}
