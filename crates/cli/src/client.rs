// Connection settings for the CLI
//
// Starts from RUNSYNC_* environment variables (and .env), lets flags override
// them, and optionally reads the engine's tuning from a YAML file.

use std::path::{Path, PathBuf};

use runsync_core::{
    derive_status, ConfigError, EntitySnapshot, Envelope, Lifecycle, PullError, SnapshotSource,
    Status, SyncConfig, SyncEngine,
};
use runsync_http::{HttpConfig, HttpSnapshotSource, PushKind, SessionKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to load {}: {message}", path.display())]
    ConfigFile { path: PathBuf, message: String },

    #[error("Entity not found")]
    NotFound,

    #[error(transparent)]
    Pull(PullError),
}

impl From<PullError> for ClientError {
    fn from(err: PullError) -> Self {
        match err {
            PullError::NotFound => ClientError::NotFound,
            other => ClientError::Pull(other),
        }
    }
}

/// Flags that override the environment
#[derive(Debug, Default)]
pub struct Overrides {
    pub api_url: Option<String>,
    pub ws_url: Option<String>,
    pub push: Option<PushKind>,
    pub api_token: Option<String>,
    pub agent_run_path: Option<String>,
    pub session_kind: Option<SessionKind>,
    pub config_file: Option<PathBuf>,
}

pub struct Client {
    http: HttpConfig,
    sync: SyncConfig,
}

impl Client {
    pub fn new(overrides: Overrides) -> Result<Self, ClientError> {
        let mut http = HttpConfig::from_env()?;
        if let Some(api_url) = &overrides.api_url {
            // --api-url re-derives the push URL; --ws-url overrides it again below
            let mut fresh = HttpConfig::new(api_url)?.with_push(http.push);
            fresh.api_token = http.api_token.take();
            fresh.request_timeout = http.request_timeout;
            fresh.agent_run_path = http.agent_run_path.take();
            fresh.session_path = std::mem::take(&mut http.session_path);
            http = fresh;
        }
        if let Some(ws_url) = &overrides.ws_url {
            http = http.with_ws_url(ws_url)?;
        }
        if let Some(push) = overrides.push {
            http = http.with_push(push);
        }
        if let Some(token) = overrides.api_token {
            http = http.with_api_token(token);
        }
        if let Some(path) = overrides.agent_run_path.filter(|p| !p.is_empty()) {
            http = http.with_agent_run_path(path);
        }
        if let Some(kind) = overrides.session_kind {
            http = http.with_session_kind(kind);
        }

        let sync = match &overrides.config_file {
            Some(path) => load_sync_config(path)?,
            None => SyncConfig::default(),
        };
        sync.validate()?;

        Ok(Self { http, sync })
    }

    pub fn engine(&self) -> Result<SyncEngine, ClientError> {
        Ok(runsync_http::engine(self.http.clone(), self.sync.clone())?)
    }

    pub fn source(&self) -> Result<HttpSnapshotSource, ClientError> {
        Ok(HttpSnapshotSource::new(self.http.clone())?)
    }

    /// Pull up to `max_events` of history, oldest first
    pub async fn history(
        &self,
        entity_id: &str,
        max_events: usize,
    ) -> Result<Vec<Envelope>, ClientError> {
        let source = self.source()?;
        let page_size = self.sync.history.page_size;

        let mut pages = Vec::new();
        let mut fetched = 0;
        let mut cursor: Option<String> = None;
        while fetched < max_events {
            let page = source
                .fetch_events(entity_id, cursor.as_deref(), page_size.min(max_events - fetched))
                .await?;
            fetched += page.events.len();
            let next = page.next_cursor.clone();
            pages.push(page.events);
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        // Pages arrive newest first
        Ok(pages.into_iter().rev().flatten().collect())
    }

    /// One-shot status: snapshot plus history, reconciled.
    ///
    /// The snapshot is `None` when the server has no record route for the
    /// lifecycle; the status then comes from the history alone.
    pub async fn status(
        &self,
        entity_id: &str,
        lifecycle: Lifecycle,
    ) -> Result<(Status, Option<EntitySnapshot>, Vec<Envelope>), ClientError> {
        let snapshot = match self.source()?.fetch_snapshot(entity_id, lifecycle).await {
            Ok(snapshot) => Some(snapshot),
            Err(PullError::Unsupported(_)) => None,
            Err(e) => return Err(e.into()),
        };
        let limit = self.sync.history.page_size * self.sync.history.max_pages;
        let events = self.history(entity_id, limit).await?;
        let status = derive_status(
            lifecycle,
            snapshot.as_ref(),
            &events,
            self.sync.vocabulary(lifecycle),
        );
        Ok((status, snapshot, events))
    }
}

fn load_sync_config(path: &Path) -> Result<SyncConfig, ClientError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ClientError::ConfigFile {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    serde_yaml::from_str(&raw).map_err(|e| ClientError::ConfigFile {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
