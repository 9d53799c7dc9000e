// Endpoint configuration
//
// Environment variables (a `.env` file is loaded first when present):
// - RUNSYNC_API_URL: API base URL (default: http://localhost:18000)
// - RUNSYNC_WS_URL: WebSocket base URL (default: API URL with ws/wss scheme)
// - RUNSYNC_PUSH: push transport, "ws" or "sse" (default: ws)
// - RUNSYNC_API_TOKEN: bearer token sent with every request
// - RUNSYNC_REQUEST_TIMEOUT_MS: pull request timeout (default: 10000)
// - RUNSYNC_AGENT_RUN_PATH: snapshot path of agent runs, `{id}` is the entity
//   id (default: none, agent runs are reconciled from their event history)
// - RUNSYNC_SESSION_KIND: "preview" (by sandbox id) or "prototype" (by
//   session id) (default: preview)

use std::env;
use std::str::FromStr;
use std::time::Duration;

use runsync_core::{ConfigError, Lifecycle, SubscriptionFilter};
use url::Url;

pub const DEFAULT_API_URL: &str = "http://localhost:18000";

/// Preview record of a sandbox
pub const PREVIEW_SESSION_PATH: &str = "/api/v1/preview/sandbox/{id}";
/// Prototype session record
pub const PROTOTYPE_SESSION_PATH: &str = "/api/v1/prototype/session/{id}";

/// Which kind of session record a session entity id refers to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionKind {
    /// Live preview, addressed by its sandbox id
    #[default]
    Preview,
    /// Prototyping session, addressed by its session id
    Prototype,
}

impl SessionKind {
    pub fn snapshot_path(&self) -> &'static str {
        match self {
            SessionKind::Preview => PREVIEW_SESSION_PATH,
            SessionKind::Prototype => PROTOTYPE_SESSION_PATH,
        }
    }
}

impl FromStr for SessionKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "preview" => Ok(SessionKind::Preview),
            "prototype" => Ok(SessionKind::Prototype),
            other => Err(ConfigError::invalid(
                "RUNSYNC_SESSION_KIND",
                format!("unknown session kind '{}', expected preview or prototype", other),
            )),
        }
    }
}

/// Which push transport to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PushKind {
    #[default]
    WebSocket,
    Sse,
}

impl FromStr for PushKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ws" | "websocket" => Ok(PushKind::WebSocket),
            "sse" => Ok(PushKind::Sse),
            other => Err(ConfigError::invalid(
                "RUNSYNC_PUSH",
                format!("unknown push transport '{}', expected ws or sse", other),
            )),
        }
    }
}

impl std::fmt::Display for PushKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushKind::WebSocket => write!(f, "ws"),
            PushKind::Sse => write!(f, "sse"),
        }
    }
}

/// Server endpoints and credentials
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub api_url: Url,
    pub ws_url: Url,
    pub push: PushKind,
    pub api_token: Option<String>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,

    /// Snapshot path for agent runs; `{id}` is replaced by the entity id.
    /// The server has no sandbox record route, so there is no default.
    pub agent_run_path: Option<String>,
    /// Snapshot path for sessions
    pub session_path: String,
    /// History path
    pub events_path: String,
    /// WebSocket subscribe path
    pub ws_path: String,
    /// SSE subscribe path
    pub sse_path: String,
}

impl HttpConfig {
    pub fn new(api_url: &str) -> Result<Self, ConfigError> {
        let api_url = parse_url("RUNSYNC_API_URL", api_url)?;
        let ws_url = ws_url_for(&api_url)?;
        Ok(Self {
            api_url,
            ws_url,
            push: PushKind::default(),
            api_token: None,
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            agent_run_path: None,
            session_path: PREVIEW_SESSION_PATH.to_string(),
            events_path: "/api/v1/sandboxes/{id}/events".to_string(),
            ws_path: "/api/v1/ws/events".to_string(),
            sse_path: "/api/v1/sandboxes/{id}/sse".to_string(),
        })
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded .env from {:?}", path);
        }

        let api_url = env::var("RUNSYNC_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let mut config = Self::new(&api_url)?;

        if let Ok(ws_url) = env::var("RUNSYNC_WS_URL") {
            config.ws_url = parse_url("RUNSYNC_WS_URL", &ws_url)?;
        }
        if let Ok(push) = env::var("RUNSYNC_PUSH") {
            config.push = push.parse()?;
        }
        config.api_token = env::var("RUNSYNC_API_TOKEN").ok().filter(|t| !t.is_empty());
        if let Ok(timeout) = env::var("RUNSYNC_REQUEST_TIMEOUT_MS") {
            let millis: u64 = timeout.parse().map_err(|_| {
                ConfigError::invalid("RUNSYNC_REQUEST_TIMEOUT_MS", "must be a number of milliseconds")
            })?;
            config.request_timeout = Duration::from_millis(millis);
        }
        if let Ok(path) = env::var("RUNSYNC_AGENT_RUN_PATH") {
            if !path.is_empty() {
                config.agent_run_path = Some(path);
            }
        }
        if let Ok(kind) = env::var("RUNSYNC_SESSION_KIND") {
            config = config.with_session_kind(kind.parse()?);
        }

        Ok(config)
    }

    pub fn with_ws_url(mut self, ws_url: &str) -> Result<Self, ConfigError> {
        self.ws_url = parse_url("ws_url", ws_url)?;
        Ok(self)
    }

    pub fn with_push(mut self, push: PushKind) -> Self {
        self.push = push;
        self
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_session_path(mut self, template: impl Into<String>) -> Self {
        self.session_path = template.into();
        self
    }

    pub fn with_session_kind(self, kind: SessionKind) -> Self {
        self.with_session_path(kind.snapshot_path())
    }

    pub fn with_agent_run_path(mut self, template: impl Into<String>) -> Self {
        self.agent_run_path = Some(template.into());
        self
    }

    /// Snapshot URL of an entity; `None` when the lifecycle has no snapshot
    /// route configured
    pub fn snapshot_url(
        &self,
        entity_id: &str,
        lifecycle: Lifecycle,
    ) -> Result<Option<Url>, ConfigError> {
        let template = match lifecycle {
            Lifecycle::AgentRun => self.agent_run_path.as_deref(),
            Lifecycle::Session => Some(self.session_path.as_str()),
        };
        template
            .map(|template| join(&self.api_url, &expand(template, entity_id)))
            .transpose()
    }

    /// History URL of one page
    pub fn events_url(&self, entity_id: &str, limit: usize, offset: usize) -> Result<Url, ConfigError> {
        let mut url = join(&self.api_url, &expand(&self.events_path, entity_id))?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string())
            .append_pair("offset", &offset.to_string());
        Ok(url)
    }

    /// WebSocket subscribe URL for a filter
    pub fn ws_events_url(&self, filter: &SubscriptionFilter) -> Result<Url, ConfigError> {
        let mut url = join(&self.ws_url, &self.ws_path)?;
        append_filter(&mut url, filter);
        Ok(url)
    }

    /// SSE subscribe URL for one entity
    pub fn sse_url(&self, filter: &SubscriptionFilter) -> Result<Url, ConfigError> {
        let entity_id = filter
            .entity_id
            .as_deref()
            .ok_or(ConfigError::Missing("entity id for SSE subscription"))?;
        let mut url = join(&self.api_url, &expand(&self.sse_path, entity_id))?;
        if let Some(types) = &filter.event_types {
            let types: Vec<&str> = types.iter().map(String::as_str).collect();
            url.query_pairs_mut().append_pair("event_types", &types.join(","));
        }
        Ok(url)
    }
}

fn parse_url(field: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw.trim()).map_err(|e| ConfigError::invalid(field, format!("'{}': {}", raw, e)))
}

/// Swap http(s) for ws(s)
fn ws_url_for(api_url: &Url) -> Result<Url, ConfigError> {
    let scheme = match api_url.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    let rest = api_url
        .as_str()
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or_default();
    parse_url("ws_url", &format!("{}://{}", scheme, rest))
}

fn expand(template: &str, entity_id: &str) -> String {
    template.replace("{id}", entity_id)
}

fn join(base: &Url, path: &str) -> Result<Url, ConfigError> {
    let raw = format!("{}{}", base.as_str().trim_end_matches('/'), path);
    parse_url("endpoint", &raw)
}

fn append_filter(url: &mut Url, filter: &SubscriptionFilter) {
    let mut query = url.query_pairs_mut();
    if let Some(entity_id) = &filter.entity_id {
        query.append_pair("entity_ids", entity_id);
    }
    if let Some(types) = &filter.event_types {
        let types: Vec<&str> = types.iter().map(String::as_str).collect();
        query.append_pair("event_types", &types.join(","));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_follows_api_scheme() {
        let config = HttpConfig::new("https://api.example.com").unwrap();
        assert_eq!(config.ws_url.as_str(), "wss://api.example.com/");

        let config = HttpConfig::new("http://localhost:18000/").unwrap();
        assert_eq!(config.ws_url.as_str(), "ws://localhost:18000/");
    }

    #[test]
    fn test_endpoint_urls() {
        let config = HttpConfig::new("http://localhost:18000").unwrap();

        assert_eq!(config.snapshot_url("sb-1", Lifecycle::AgentRun).unwrap(), None);
        assert_eq!(
            config
                .snapshot_url("sb-1", Lifecycle::Session)
                .unwrap()
                .unwrap()
                .as_str(),
            "http://localhost:18000/api/v1/preview/sandbox/sb-1"
        );
        assert_eq!(
            config.events_url("sb-1", 100, 200).unwrap().as_str(),
            "http://localhost:18000/api/v1/sandboxes/sb-1/events?limit=100&offset=200"
        );
    }

    #[test]
    fn test_configured_snapshot_routes() {
        let config = HttpConfig::new("http://localhost:18000")
            .unwrap()
            .with_agent_run_path("/api/v1/tasks/{id}")
            .with_session_kind(SessionKind::Prototype);

        assert_eq!(
            config
                .snapshot_url("t-1", Lifecycle::AgentRun)
                .unwrap()
                .unwrap()
                .as_str(),
            "http://localhost:18000/api/v1/tasks/t-1"
        );
        assert_eq!(
            config
                .snapshot_url("ps-1", Lifecycle::Session)
                .unwrap()
                .unwrap()
                .path(),
            "/api/v1/prototype/session/ps-1"
        );
    }

    #[test]
    fn test_session_kind_parse() {
        assert_eq!("Prototype".parse::<SessionKind>().unwrap(), SessionKind::Prototype);
        assert_eq!("preview".parse::<SessionKind>().unwrap(), SessionKind::Preview);
        assert!("notebook".parse::<SessionKind>().is_err());
    }

    #[test]
    fn test_ws_url_carries_filter() {
        let config = HttpConfig::new("http://localhost:18000").unwrap();
        let filter = SubscriptionFilter::entity("sb-1").with_event_types(["agent.completed", "agent.failed"]);

        let url = config.ws_events_url(&filter).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(url.path(), "/api/v1/ws/events");
        assert_eq!(
            pairs,
            vec![
                ("entity_ids".to_string(), "sb-1".to_string()),
                ("event_types".to_string(), "agent.completed,agent.failed".to_string()),
            ]
        );
    }

    #[test]
    fn test_sse_requires_entity() {
        let config = HttpConfig::new("http://localhost:18000").unwrap();
        assert!(matches!(
            config.sse_url(&SubscriptionFilter::default()),
            Err(ConfigError::Missing(_))
        ));
    }

    #[test]
    fn test_push_kind_parse() {
        assert_eq!("ws".parse::<PushKind>().unwrap(), PushKind::WebSocket);
        assert_eq!("SSE".parse::<PushKind>().unwrap(), PushKind::Sse);
        assert!("grpc".parse::<PushKind>().is_err());
    }

    #[test]
    fn test_rejects_bad_url() {
        assert!(HttpConfig::new("not a url").is_err());
    }
}
