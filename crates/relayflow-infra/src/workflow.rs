//! Workflow definition files.
//!
//! `relayflow register` reads a definition from a TOML or JSON file. Ids are
//! optional in the file and generated when absent; an action without a
//! `sorting_order` takes its position in the list.

use std::path::Path;

use relayflow_types::error::WorkflowError;
use relayflow_types::workflow::{ActionMetadata, ActionSpec, TriggerSpec, WorkflowDefinition};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct WorkflowFile {
    id: Option<Uuid>,
    name: String,
    trigger: TriggerFile,
    #[serde(default)]
    actions: Vec<ActionFile>,
}

#[derive(Debug, Deserialize)]
struct TriggerFile {
    id: Option<Uuid>,
    #[serde(alias = "type")]
    trigger_type_id: String,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ActionFile {
    id: Option<Uuid>,
    #[serde(alias = "type")]
    action_type_id: String,
    sorting_order: Option<u32>,
    #[serde(default)]
    metadata: ActionMetadata,
}

impl WorkflowFile {
    fn into_definition(self) -> WorkflowDefinition {
        WorkflowDefinition {
            id: self.id.unwrap_or_else(Uuid::now_v7),
            name: self.name,
            trigger: TriggerSpec {
                id: self.trigger.id.unwrap_or_else(Uuid::now_v7),
                trigger_type_id: self.trigger.trigger_type_id,
                metadata: self.trigger.metadata,
            },
            actions: self
                .actions
                .into_iter()
                .enumerate()
                .map(|(position, action)| ActionSpec {
                    id: action.id.unwrap_or_else(Uuid::now_v7),
                    action_type_id: action.action_type_id,
                    sorting_order: action.sorting_order.unwrap_or(position as u32),
                    metadata: action.metadata,
                })
                .collect(),
        }
    }
}

/// Parse a definition. `json` selects JSON, otherwise TOML.
pub fn parse_definition(content: &str, json: bool) -> Result<WorkflowDefinition, WorkflowError> {
    let file: WorkflowFile = if json {
        serde_json::from_str(content).map_err(|e| WorkflowError::Parse(e.to_string()))?
    } else {
        toml::from_str(content).map_err(|e| WorkflowError::Parse(e.to_string()))?
    };

    let def = file.into_definition();
    def.validate()?;
    Ok(def)
}

/// Load and validate a definition file. `.json` files are parsed as JSON,
/// everything else as TOML.
pub async fn load_definition(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| WorkflowError::Parse(format!("failed to read {}: {e}", path.display())))?;
    let json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    parse_definition(&content, json)
}
