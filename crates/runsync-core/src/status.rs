//! Status derivation
//!
//! Derives the lifecycle status of a watched entity from its last pulled
//! snapshot and its event log. Two state machines share one `Status` type:
//!
//! ```text
//! AgentRun:  Pending ──► Running ──► { Completed, Failed, Cancelled }
//!
//! Session:   Creating ──► Ready ◄──► { Prompting, Exporting }
//!                │          │
//!                └──────────┴──────► { Failed, Stopped }
//! ```
//!
//! Event types are first classified into an [`EventKind`] by an
//! [`EventVocabulary`] (configuration data), then folded through the
//! exhaustive transition table in [`Status::next`]. Terminal states absorb.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::{EntitySnapshot, Envelope, Lifecycle};
use crate::pattern::EventPattern;

/// Lifecycle status of a watched entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    // Agent run
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,

    // Session
    Creating,
    Ready,
    Prompting,
    Exporting,
    Stopped,
}

impl Status {
    /// No further transition is expected
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Failed | Status::Cancelled | Status::Stopped
        )
    }

    /// Work is in progress and the entity is expected to change soon
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Status::Pending | Status::Running | Status::Creating | Status::Prompting | Status::Exporting
        )
    }

    /// Idle but alive; changes only on user action
    pub fn is_stable(&self) -> bool {
        matches!(self, Status::Ready)
    }

    /// Apply one classified event.
    ///
    /// The match is exhaustive over `(Status, EventKind)` so adding a kind or
    /// a status is a compile-time checked change.
    pub fn next(self, kind: EventKind) -> Status {
        use EventKind as K;
        use Status as S;

        match (self, kind) {
            // Terminal states absorb everything
            (S::Completed | S::Failed | S::Cancelled | S::Stopped, _) => self,

            // Agent run
            (S::Pending | S::Running, K::Completed) => S::Completed,
            (S::Pending | S::Running, K::Failed) => S::Failed,
            (S::Pending | S::Running, K::Cancelled | K::Stopped) => S::Cancelled,
            (
                S::Pending | S::Running,
                K::Started
                | K::Progress
                | K::Ready
                | K::PromptStarted
                | K::ExportStarted
                | K::Idle,
            ) => S::Running,

            // Session
            (S::Creating | S::Ready | S::Prompting | S::Exporting, K::Failed) => S::Failed,
            (
                S::Creating | S::Ready | S::Prompting | S::Exporting,
                K::Stopped | K::Cancelled | K::Completed,
            ) => S::Stopped,
            (S::Creating | S::Ready | S::Prompting | S::Exporting, K::PromptStarted) => {
                S::Prompting
            }
            (S::Creating | S::Ready | S::Prompting | S::Exporting, K::ExportStarted) => {
                S::Exporting
            }
            (S::Creating | S::Ready | S::Prompting | S::Exporting, K::Ready | K::Idle) => {
                S::Ready
            }
            (S::Creating | S::Ready | S::Prompting | S::Exporting, K::Started | K::Progress) => {
                self
            }
        }
    }

    /// Parse a server-reported status string for the given lifecycle.
    ///
    /// Returns `None` for strings outside the known vocabulary.
    pub fn parse(lifecycle: Lifecycle, raw: &str) -> Option<Status> {
        let raw = raw.trim().to_ascii_lowercase();
        let status = match lifecycle {
            Lifecycle::AgentRun => match raw.as_str() {
                "pending" | "queued" | "created" => Status::Pending,
                "running" | "assigned" | "in_progress" | "started" | "starting" => Status::Running,
                "completed" | "succeeded" | "done" => Status::Completed,
                "failed" | "error" => Status::Failed,
                "cancelled" | "canceled" | "stopped" | "terminated" => Status::Cancelled,
                _ => return None,
            },
            Lifecycle::Session => match raw.as_str() {
                "pending" | "starting" | "creating" => Status::Creating,
                "ready" | "running" | "idle" => Status::Ready,
                "prompting" => Status::Prompting,
                "exporting" => Status::Exporting,
                "failed" | "error" => Status::Failed,
                "stopped" | "terminated" | "completed" => Status::Stopped,
                _ => return None,
            },
        };
        Some(status)
    }

    /// Starting state of a lifecycle
    pub fn initial(lifecycle: Lifecycle) -> Status {
        match lifecycle {
            Lifecycle::AgentRun => Status::Pending,
            Lifecycle::Session => Status::Creating,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
            Status::Creating => "creating",
            Status::Ready => "ready",
            Status::Prompting => "prompting",
            Status::Exporting => "exporting",
            Status::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// What an event type means for the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    /// Any work event without lifecycle meaning
    Progress,
    Ready,
    PromptStarted,
    ExportStarted,
    /// A busy sub-operation finished
    Idle,
    Completed,
    Failed,
    Cancelled,
    Stopped,
}

/// One classification rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyRule {
    pub pattern: EventPattern,
    pub kind: EventKind,
}

/// Ordered classification rules; the first matching rule wins and unmatched
/// types are [`EventKind::Progress`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventVocabulary {
    pub rules: Vec<VocabularyRule>,
}

impl EventVocabulary {
    /// Build from `(pattern, kind)` pairs
    pub fn from_rules<I, S>(rules: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (S, EventKind)>,
        S: AsRef<str>,
    {
        let rules = rules
            .into_iter()
            .map(|(pattern, kind)| {
                Ok(VocabularyRule {
                    pattern: EventPattern::parse(pattern.as_ref())?,
                    kind,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self { rules })
    }

    /// Default vocabulary for a lifecycle
    pub fn for_lifecycle(lifecycle: Lifecycle) -> Self {
        match lifecycle {
            Lifecycle::AgentRun => Self::agent_run(),
            Lifecycle::Session => Self::session(),
        }
    }

    /// Agent run vocabulary: `*.completed`, `*.failed`, `*.error` are terminal,
    /// except per-iteration events of continuous runs.
    pub fn agent_run() -> Self {
        use EventKind::*;
        Self::builtin(&[
            ("iteration.*", Progress),
            ("agent.started", Started),
            ("spec.execution_started", Started),
            ("continuous.started", Started),
            ("continuous.stopped", Cancelled),
            ("*.completed", Completed),
            ("spec.execution_completed", Completed),
            ("*.failed", Failed),
            ("*.error", Failed),
            ("spec.execution_failed", Failed),
            ("sandbox.terminated", Cancelled),
        ])
    }

    /// Session (preview / prototype) vocabulary.
    ///
    /// The server reports prompt and export starts only through the session
    /// record, so busy sub-states come from the snapshot.
    pub fn session() -> Self {
        use EventKind::*;
        Self::builtin(&[
            ("PREVIEW_READY", Ready),
            ("PROTOTYPE_SESSION_STARTED", Ready),
            ("PROTOTYPE_PROMPT_APPLIED", Idle),
            ("PROTOTYPE_EXPORTED", Idle),
            ("sandbox.failed", Failed),
            ("sandbox.terminated", Stopped),
        ])
    }

    fn builtin(rules: &[(&str, EventKind)]) -> Self {
        Self {
            rules: rules
                .iter()
                .filter_map(|(raw, kind)| {
                    EventPattern::parse(raw).ok().map(|pattern| VocabularyRule {
                        pattern,
                        kind: *kind,
                    })
                })
                .collect(),
        }
    }

    /// Classify an event type
    pub fn classify(&self, event_type: &str) -> EventKind {
        self.rules
            .iter()
            .find(|rule| rule.pattern.matches(event_type))
            .map(|rule| rule.kind)
            .unwrap_or(EventKind::Progress)
    }

    /// Check the vocabulary against the server's actual event taxonomy.
    ///
    /// Returns the rules that match none of the known event types; these are
    /// guesses that should be corrected or removed.
    pub fn validate<S: AsRef<str>>(&self, known_event_types: &[S]) -> Vec<&VocabularyRule> {
        self.rules
            .iter()
            .filter(|rule| {
                !known_event_types
                    .iter()
                    .any(|known| rule.pattern.matches(known.as_ref()))
            })
            .collect()
    }
}

/// Status implied by the event log alone
pub fn derive_from_events(
    lifecycle: Lifecycle,
    events: &[Envelope],
    vocabulary: &EventVocabulary,
) -> Status {
    events.iter().fold(Status::initial(lifecycle), |status, event| {
        status.next(vocabulary.classify(&event.event_type))
    })
}

/// Combine the snapshot status with the event-derived status.
///
/// Pull is the truth for settled state; events only win where they carry
/// information the snapshot cannot have yet.
pub fn reconcile(lifecycle: Lifecycle, snapshot: Option<Status>, events: Status) -> Status {
    match snapshot {
        None => events,
        Some(pulled) if pulled.is_terminal() => pulled,
        Some(_) if events.is_terminal() => events,
        Some(Status::Ready) if matches!(events, Status::Prompting | Status::Exporting) => events,
        // Events are folded from the initial state, so they are never behind it
        Some(pulled) if pulled == Status::initial(lifecycle) => events,
        Some(pulled) => pulled,
    }
}

/// Derive the status of an entity from its snapshot and its event log.
///
/// Pure: unknown snapshot status strings fall back to the lifecycle's initial
/// state rather than being reported here.
pub fn derive_status(
    lifecycle: Lifecycle,
    snapshot: Option<&EntitySnapshot>,
    events: &[Envelope],
    vocabulary: &EventVocabulary,
) -> Status {
    let from_events = derive_from_events(lifecycle, events, vocabulary);
    let from_snapshot = snapshot
        .map(|s| Status::parse(lifecycle, &s.status).unwrap_or_else(|| Status::initial(lifecycle)));
    reconcile(lifecycle, from_snapshot, from_events)
}
