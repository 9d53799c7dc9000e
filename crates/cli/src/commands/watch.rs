// Watch command - follow an entity live until it settles
//
// Text mode prints each new event as a table row and a summary line whenever
// status or connection changes. json/yaml mode emits one tagged document per
// update.

use std::time::Duration;

use super::EntityArgs;
use crate::client::Client;
use crate::output::{format_view_summary, print_event_row, OutputFormat};
use anyhow::{bail, Result};
use runsync_core::{ConnectionState, EntityView, Envelope, Status, WatchOptions};
use serde::Serialize;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

pub struct WatchArgs {
    pub entity: EntityArgs,
    pub just_created: bool,
    pub until_ready: bool,
    pub timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Update<'a> {
    Event(&'a Envelope),
    Status(StatusUpdate<'a>),
}

#[derive(Debug, Serialize)]
struct StatusUpdate<'a> {
    entity_id: &'a str,
    status: Status,
    connection: ConnectionState,
    retry_count: u32,
    stale: bool,
    not_found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<&'a str>,
}

impl<'a> From<&'a EntityView> for StatusUpdate<'a> {
    fn from(view: &'a EntityView) -> Self {
        Self {
            entity_id: &view.entity_id,
            status: view.status,
            connection: view.connection,
            retry_count: view.retry_count,
            stale: view.stale,
            not_found: view.not_found,
            error_message: view.error_message(),
        }
    }
}

/// Tracks what has been printed so each update only emits the delta
#[derive(Default)]
struct Renderer {
    printed_events: usize,
    last_summary: Option<String>,
}

impl Renderer {
    fn render(&mut self, view: &EntityView, output: OutputFormat, quiet: bool) -> Result<()> {
        for event in view.events.iter().skip(self.printed_events) {
            if output.is_text() {
                if !quiet {
                    print_event_row(event);
                }
            } else {
                output.print_line(&Update::Event(event))?;
            }
        }
        self.printed_events = view.events.len();

        let summary = format_view_summary(view);
        if self.last_summary.as_deref() != Some(summary.as_str()) {
            if output.is_text() {
                println!("{}", summary);
            } else {
                output.print_line(&Update::Status(StatusUpdate::from(view)))?;
            }
            self.last_summary = Some(summary);
        }
        Ok(())
    }
}

fn is_settled(view: &EntityView, until_ready: bool) -> bool {
    if view.is_terminal() {
        return true;
    }
    // A missing entity that is no longer polled will not show up
    if view.not_found && !view.polling {
        return true;
    }
    until_ready && view.snapshot.is_some() && view.status.is_stable()
}

pub async fn run(client: &Client, output: OutputFormat, quiet: bool, args: WatchArgs) -> Result<()> {
    let engine = client.engine()?;
    let mut options = WatchOptions {
        lifecycle: args.entity.lifecycle(),
        ..WatchOptions::default()
    };
    if args.just_created {
        options = options.just_created();
    }

    let watch = engine.watch(args.entity.entity.clone(), options).await;
    let Some(changes) = watch.changes() else {
        bail!("watch of {} was released", args.entity.entity);
    };
    let mut updates = WatchStream::new(changes);

    let deadline = async {
        match args.timeout {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut renderer = Renderer::default();
    let last = loop {
        tokio::select! {
            update = updates.next() => {
                if update.is_none() {
                    break watch.view();
                }
            }
            _ = &mut ctrl_c => {
                tracing::debug!("Interrupted");
                break watch.view();
            }
            _ = &mut deadline => {
                watch.stop();
                bail!("timed out after {}s", args.timeout.unwrap_or_default());
            }
        }

        let Some(view) = watch.view() else {
            break None;
        };
        renderer.render(&view, output, quiet)?;
        if is_settled(&view, args.until_ready) {
            break Some(view);
        }
    };
    watch.stop();

    if let Some(view) = last {
        if view.status == Status::Failed {
            bail!(
                "{} failed: {}",
                view.entity_id,
                view.error_message().unwrap_or("no error message")
            );
        }
        if view.not_found && view.snapshot.is_none() {
            bail!("{} not found", view.entity_id);
        }
    }

    Ok(())
}
