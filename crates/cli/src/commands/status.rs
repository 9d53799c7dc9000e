// Status command - one-shot snapshot + history reconciliation

use super::EntityArgs;
use crate::client::Client;
use crate::output::{print_field, OutputFormat};
use anyhow::Result;
use runsync_core::{EntitySnapshot, Lifecycle, Status};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct StatusReport {
    entity_id: String,
    lifecycle: Lifecycle,
    status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_status: Option<String>,
    event_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot: Option<EntitySnapshot>,
}

pub async fn run(client: &Client, output: OutputFormat, quiet: bool, args: &EntityArgs) -> Result<()> {
    let lifecycle = args.lifecycle();
    let (status, snapshot, events) = client.status(&args.entity, lifecycle).await?;

    let report = StatusReport {
        entity_id: args.entity.clone(),
        lifecycle,
        status,
        server_status: snapshot.as_ref().map(|s| s.status.clone()),
        event_count: events.len(),
        last_event_type: events.last().map(|e| e.event_type.clone()),
        snapshot,
    };

    if !output.is_text() {
        return output.print_value(&report);
    }

    if quiet {
        println!("{}", report.status);
        return Ok(());
    }

    print_field("Entity", &report.entity_id);
    print_field("Lifecycle", &report.lifecycle.to_string());
    print_field("Status", &report.status.to_string());
    if let Some(server_status) = &report.server_status {
        print_field("Server", server_status);
    }
    print_field("Events", &report.event_count.to_string());
    if let Some(last) = &report.last_event_type {
        print_field("Last event", last);
    }
    if status == Status::Failed {
        if let Some(message) = report.snapshot.as_ref().and_then(|s| s.error_message.as_ref()) {
            print_field("Error", message);
        }
    }

    Ok(())
}
