//! Push transports
//!
//! - [`WsPushTransport`]: the server's `/ws/events` WebSocket, filtered by
//!   query parameters
//! - [`SsePushTransport`]: a per-entity `text/event-stream` endpoint whose
//!   `data:` lines carry one event each
//!
//! Both decode frames with [`decode_push_frame`]; keep-alives are swallowed,
//! error frames end the connection and undecodable frames are skipped by the
//! channel client.

use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use runsync_core::{
    ConfigError, Envelope, PushStream, PushTransport, SubscriptionFilter, TransportError,
};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, trace};

use crate::config::{HttpConfig, PushKind};
use crate::wire::{decode_push_frame, Frame};

/// Push transport selected by `config.push`
pub fn push_transport(config: HttpConfig) -> Result<Arc<dyn PushTransport>, ConfigError> {
    Ok(match config.push {
        PushKind::WebSocket => Arc::new(WsPushTransport::new(config)),
        PushKind::Sse => Arc::new(SsePushTransport::new(config)?),
    })
}

fn frame_to_item(frame: Result<Frame, TransportError>) -> Option<Result<Envelope, TransportError>> {
    match frame {
        Ok(Frame::Envelope(envelope)) => Some(Ok(envelope)),
        Ok(Frame::Control) => {
            trace!("Control frame");
            None
        }
        Ok(Frame::Error(message)) => Some(Err(TransportError::Server(message))),
        Err(e) => Some(Err(e)),
    }
}

// ============================================================================
// WebSocket
// ============================================================================

pub struct WsPushTransport {
    config: HttpConfig,
}

impl WsPushTransport {
    pub fn new(config: HttpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PushTransport for WsPushTransport {
    async fn connect(&self, filter: &SubscriptionFilter) -> Result<PushStream, TransportError> {
        let url = self
            .config
            .ws_events_url(filter)
            .map_err(|e| TransportError::connect(e.to_string()))?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::connect(e.to_string()))?;
        if let Some(token) = &self.config.api_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::connect(format!("invalid token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let connected = tokio::time::timeout(self.config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| {
                TransportError::connect(format!(
                    "timed out after {}ms",
                    self.config.connect_timeout.as_millis()
                ))
            })?;
        let (ws, _response) = connected.map_err(|e| TransportError::connect(e.to_string()))?;
        debug!(url = %url, "WebSocket connected");

        let fallback = filter.entity_id.clone();
        let stream = ws.filter_map(move |message| {
            let item = match message {
                Ok(Message::Text(text)) => frame_to_item(decode_push_frame(&text, fallback.as_deref())),
                Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => frame_to_item(decode_push_frame(text, fallback.as_deref())),
                    Err(_) => Some(Err(TransportError::decode("binary frame is not UTF-8"))),
                },
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "WebSocket closed by server");
                    None
                }
                // Ping/pong are answered by tungstenite
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::dropped(e.to_string()))),
            };
            futures::future::ready(item)
        });

        Ok(Box::pin(stream))
    }

    fn name(&self) -> &'static str {
        "WsPushTransport"
    }
}

// ============================================================================
// Server-Sent Events
// ============================================================================

pub struct SsePushTransport {
    config: HttpConfig,
    http: reqwest::Client,
}

impl SsePushTransport {
    pub fn new(config: HttpConfig) -> Result<Self, ConfigError> {
        // No total timeout: the response body is the long-lived stream
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ConfigError::invalid("http client", e.to_string()))?;
        Ok(Self { config, http })
    }
}

#[async_trait]
impl PushTransport for SsePushTransport {
    async fn connect(&self, filter: &SubscriptionFilter) -> Result<PushStream, TransportError> {
        let url = self
            .config
            .sse_url(filter)
            .map_err(|e| TransportError::connect(e.to_string()))?;

        let mut request = self.http.get(url.clone()).header(ACCEPT, "text/event-stream");
        if let Some(token) = &self.config.api_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::connect(format!("HTTP {}: {}", status.as_u16(), message)));
        }
        debug!(url = %url, "SSE stream opened");

        let fallback = filter.entity_id.clone();
        let stream = response.bytes_stream().eventsource().filter_map(move |event| {
            let item = match event {
                Ok(event) if event.data.trim().is_empty() => None,
                Ok(event) => frame_to_item(decode_push_frame(&event.data, fallback.as_deref())),
                Err(e) => Some(Err(TransportError::dropped(e.to_string()))),
            };
            futures::future::ready(item)
        });

        Ok(Box::pin(stream))
    }

    fn name(&self) -> &'static str {
        "SsePushTransport"
    }
}
