//! Workflow registration and manual triggering.

use std::path::Path;

use anyhow::{Context, Result, bail};
use console::style;
use relayflow_infra::workflow::load_definition;
use uuid::Uuid;

use crate::state::AppState;

/// Register a workflow definition file.
pub async fn register(state: &AppState, file: &Path, json: bool) -> Result<()> {
    let def = load_definition(file)
        .await
        .with_context(|| format!("invalid workflow file {}", file.display()))?;
    state.store.save_workflow(&def).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&def)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Registered workflow '{}'",
        style("✓").green().bold(),
        style(&def.name).cyan()
    );
    println!("  ID:      {}", style(def.id).bold());
    println!("  Trigger: {}", def.trigger.trigger_type_id);

    let registry = state.registry()?;
    let mut actions: Vec<_> = def.actions.iter().collect();
    actions.sort_by_key(|a| a.sorting_order);
    for action in actions {
        let handled = if registry.contains(&action.action_type_id) {
            style("").dim()
        } else {
            style(" (no built-in handler)").yellow()
        };
        println!(
            "  Stage {}: {}{}",
            action.sorting_order, action.action_type_id, handled
        );
    }
    println!();
    Ok(())
}

/// Enqueue a run: the run row and its outbox row are written in one
/// transaction; the relay picks it up from there.
pub async fn trigger(state: &AppState, workflow_id: Uuid, payload: Option<&str>, json: bool) -> Result<()> {
    let payload: serde_json::Value = match payload {
        Some(raw) => serde_json::from_str(raw).context("--payload is not valid JSON")?,
        None => serde_json::json!({}),
    };
    if !payload.is_object() {
        bail!("--payload must be a JSON object");
    }

    let run = state
        .store
        .create_run_with_outbox(&workflow_id, payload)
        .await
        .with_context(|| format!("failed to enqueue run of workflow {workflow_id}"))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "run_id": run.id,
                "workflow_id": run.workflow_id,
                "created_at": run.created_at,
            }))?
        );
    } else {
        println!(
            "  {} Run {} enqueued",
            style("✓").green().bold(),
            style(run.id).bold()
        );
    }
    Ok(())
}
