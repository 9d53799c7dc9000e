pub mod events;
pub mod status;
pub mod watch;

use clap::Args;
use runsync_core::Lifecycle;
use runsync_http::SessionKind;

/// Entity selection shared by all commands
#[derive(Args, Debug, Clone)]
pub struct EntityArgs {
    /// Entity (sandbox) ID
    pub entity: String,

    /// Treat the entity as a long-lived session instead of an agent run
    #[arg(long)]
    pub session: bool,

    /// The entity is a prototype session ID (implies --session)
    #[arg(long)]
    pub prototype: bool,
}

impl EntityArgs {
    pub fn lifecycle(&self) -> Lifecycle {
        if self.session || self.prototype {
            Lifecycle::Session
        } else {
            Lifecycle::AgentRun
        }
    }

    /// Session record kind, when the flags pick one
    pub fn session_kind(&self) -> Option<SessionKind> {
        self.prototype.then_some(SessionKind::Prototype)
    }
}
