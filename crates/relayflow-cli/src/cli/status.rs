//! Pipeline status dashboard command.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use relayflow_core::broker::{PartitionOffsets, StageBroker};
use relayflow_core::repository::run_store::RunStore;

use crate::state::AppState;

/// Display pending outbox rows, per-partition consumer lag, and the
/// dead-letter count.
pub async fn status(state: &AppState, json: bool) -> Result<()> {
    let topic = &state.config.broker.topic;
    let group = &state.config.executor.group_id;

    let pending = state.store.count_pending_outbox().await?;

    let mut offsets = Vec::new();
    for partition in 0..state.broker.partition_count(topic) {
        offsets.push(state.broker.offsets(group, topic, partition).await?);
    }
    let total_lag: u64 = offsets.iter().map(PartitionOffsets::lag).sum();

    let dead_letters = state
        .broker
        .topic_len(&state.config.broker.dead_letter_topic)
        .await?;

    if json {
        let partitions: Vec<_> = offsets
            .iter()
            .map(|o| {
                serde_json::json!({
                    "partition": o.partition,
                    "committed": o.committed,
                    "end": o.end,
                    "lag": o.lag(),
                })
            })
            .collect();
        let status = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "data_dir": state.data_dir.display().to_string(),
            "topic": topic,
            "group_id": group,
            "pending_outbox": pending,
            "lag": total_lag,
            "partitions": partitions,
            "dead_letters": dead_letters,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} relayflow v{}",
        style("⚡").bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!();

    println!("  {}", style("── Outbox ──").dim());
    let pending_display = if pending > 0 {
        style(pending).yellow()
    } else {
        style(pending).green()
    };
    println!("  Pending: {}", pending_display);
    println!();

    println!("  {}", style("── Executors ──").dim());
    println!("  Topic: {}", style(topic).cyan());
    println!("  Group: {}", style(group).cyan());
    println!("  Lag:   {}", style(total_lag).bold());
    println!("{}", offsets_table(&offsets));
    println!();

    println!("  {}", style("── Dead letters ──").dim());
    let dlq_display = if dead_letters > 0 {
        style(dead_letters).red()
    } else {
        style(dead_letters).green()
    };
    println!(
        "  {}: {}",
        state.config.broker.dead_letter_topic, dlq_display
    );
    println!();

    println!("  {}", style("── System ──").dim());
    println!("  Data dir: {}", style(state.data_dir.display()).dim());
    println!();

    Ok(())
}

fn offsets_table(offsets: &[PartitionOffsets]) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Partition").fg(Color::White),
        Cell::new("Committed").fg(Color::White),
        Cell::new("End").fg(Color::White),
        Cell::new("Lag").fg(Color::White),
    ]);

    for o in offsets {
        let lag = if o.lag() > 0 {
            Cell::new(o.lag()).fg(Color::Yellow)
        } else {
            Cell::new(o.lag()).fg(Color::DarkGrey)
        };
        table.add_row(vec![
            Cell::new(o.partition).fg(Color::Cyan),
            Cell::new(o.committed),
            Cell::new(o.end),
            lag,
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_table_has_row_per_partition() {
        let offsets = vec![
            PartitionOffsets {
                partition: 0,
                committed: 2,
                end: 5,
            },
            PartitionOffsets {
                partition: 1,
                committed: 0,
                end: 0,
            },
        ];
        let table = offsets_table(&offsets);
        assert_eq!(table.row_iter().count(), 2);
        let rendered = table.to_string();
        assert!(rendered.contains("Partition"));
        assert!(rendered.contains("Lag"));
    }
}
