// Events command - print an entity's event history

use crate::client::Client;
use crate::output::{print_event_row, print_table_header, OutputFormat, EVENT_COLUMNS};
use anyhow::Result;

pub async fn run(client: &Client, output: OutputFormat, entity_id: &str, limit: usize) -> Result<()> {
    let events = client.history(entity_id, limit).await?;

    if output.is_text() {
        if events.is_empty() {
            println!("No events found");
            return Ok(());
        }
        print_table_header(&EVENT_COLUMNS);
        for event in &events {
            print_event_row(event);
        }
    } else {
        output.print_value(&events)?;
    }

    Ok(())
}
