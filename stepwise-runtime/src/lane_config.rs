//! Lane configuration: built-in lanes plus YAML-defined agents and workflows.

use crate::budget::Identity;
use crate::interfaces::{AdmissionError, RuntimeError};
use crate::run::Lane;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const BUILDER_PROMPT: &str = "You help the user design an agent. Ask what the agent should do, \
try the tools it would need, and report what worked. Keep answers short.";

const ASSISTANT_PROMPT: &str = "You are a personal assistant. Use the available tools when they \
help answer the request, and say plainly when a tool fails.";

const WORKFLOW_PROMPT: &str = "You execute a saved workflow. Follow the instructions step by step \
using the available tools, then summarise the result.";

/// Everything that makes one lane different from another.
#[derive(Debug, Clone, PartialEq)]
pub struct LaneConfig {
    pub lane: Lane,
    /// Agent or workflow id for the lanes that have one.
    pub target_id: Option<String>,
    pub display_name: String,
    pub system_prompt: String,
    /// Capability names; `None` means the full table.
    pub tools: Option<Vec<String>>,
    pub max_steps: u32,
    pub model: Option<String>,
}

/// Which lane a request is for, and the target it names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaneTarget {
    Builder,
    Assistant,
    PublicAgent(String),
    Workflow(String),
}

impl LaneTarget {
    pub fn lane(&self) -> Lane {
        match self {
            LaneTarget::Builder => Lane::Builder,
            LaneTarget::Assistant => Lane::Assistant,
            LaneTarget::PublicAgent(_) => Lane::PublicExecute,
            LaneTarget::Workflow(_) => Lane::Workflow,
        }
    }
}

/// Per-lane step budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LaneBudgets {
    pub builder: u32,
    pub assistant: u32,
    #[serde(rename = "public-execute", alias = "public_execute")]
    pub public_execute: u32,
    pub workflow: u32,
}

impl Default for LaneBudgets {
    fn default() -> Self {
        Self {
            builder: Lane::Builder.default_max_steps(),
            assistant: Lane::Assistant.default_max_steps(),
            public_execute: Lane::PublicExecute.default_max_steps(),
            workflow: Lane::Workflow.default_max_steps(),
        }
    }
}

impl LaneBudgets {
    pub fn max_steps_for(&self, lane: Lane) -> u32 {
        match lane {
            Lane::Builder => self.builder,
            Lane::Assistant => self.assistant,
            Lane::PublicExecute => self.public_execute,
            Lane::Workflow => self.workflow,
        }
    }
}

/// Raw definition structure from YAML.
#[derive(Debug, Deserialize)]
struct RawDefinition {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    public: bool,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    prompt_file: Option<String>,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    max_steps: Option<u32>,
    #[serde(default)]
    instructions: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

/// A deployed agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    pub owner: Option<String>,
    pub public: bool,
    pub prompt: String,
    pub tools: Vec<String>,
    pub max_steps: Option<u32>,
    pub model: Option<String>,
}

/// A saved workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub prompt: Option<String>,
    pub instructions: String,
    pub tools: Vec<String>,
    pub max_steps: Option<u32>,
    pub model: Option<String>,
}

fn read_definition(config_path: &Path) -> Result<RawDefinition, RuntimeError> {
    if !config_path.exists() {
        return Err(RuntimeError::ConfigError(format!(
            "Config file not found: {}",
            config_path.display()
        )));
    }

    let content = std::fs::read_to_string(config_path)?;
    if content.trim().is_empty() {
        return Err(RuntimeError::ConfigError("Config file is empty".to_string()));
    }

    let raw: RawDefinition = serde_yaml::from_str(&content)
        .map_err(|e| RuntimeError::ConfigError(format!("Invalid YAML: {}", e)))?;

    if raw.id.trim().is_empty() {
        return Err(RuntimeError::ConfigError(
            "Config missing required field: id".to_string(),
        ));
    }
    if raw.max_steps == Some(0) {
        return Err(RuntimeError::ConfigError(
            "max_steps must be at least 1".to_string(),
        ));
    }
    Ok(raw)
}

/// Resolve the prompt from inline text or a file relative to the config.
fn resolve_prompt(raw: &RawDefinition, config_path: &Path) -> Result<Option<String>, RuntimeError> {
    match (&raw.prompt, &raw.prompt_file) {
        (Some(_), Some(_)) => Err(RuntimeError::ConfigError(
            "Config sets both prompt and prompt_file".to_string(),
        )),
        (Some(prompt), None) => Ok(Some(prompt.clone())),
        (None, Some(file)) => {
            let prompt_path = if Path::new(file).is_absolute() {
                PathBuf::from(file)
            } else {
                config_path
                    .parent()
                    .unwrap_or_else(|| Path::new("."))
                    .join(file)
            };
            if !prompt_path.exists() {
                return Err(RuntimeError::ConfigError(format!(
                    "Prompt file not found: {}",
                    prompt_path.display()
                )));
            }
            Ok(Some(std::fs::read_to_string(&prompt_path)?))
        }
        (None, None) => Ok(None),
    }
}

/// Load a deployed agent definition from YAML.
///
/// # Errors
/// Returns error if the file or its prompt file is missing, or the YAML is invalid
pub fn load_agent_definition(config_path: &Path) -> Result<AgentDefinition, RuntimeError> {
    let raw = read_definition(config_path)?;
    let prompt = resolve_prompt(&raw, config_path)?
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| {
            RuntimeError::ConfigError("Config missing required field: prompt".to_string())
        })?;

    Ok(AgentDefinition {
        name: raw.name.clone().unwrap_or_else(|| raw.id.clone()),
        id: raw.id,
        owner: raw.owner,
        public: raw.public,
        prompt,
        tools: raw.tools,
        max_steps: raw.max_steps,
        model: raw.model,
    })
}

/// Load a saved workflow definition from YAML.
///
/// # Errors
/// Returns error if the file is missing, has no owner or instructions, or the YAML is invalid
pub fn load_workflow_definition(config_path: &Path) -> Result<WorkflowDefinition, RuntimeError> {
    let raw = read_definition(config_path)?;
    let prompt = resolve_prompt(&raw, config_path)?;

    let owner = raw
        .owner
        .clone()
        .filter(|o| !o.trim().is_empty())
        .ok_or_else(|| RuntimeError::ConfigError("Workflow missing owner".to_string()))?;
    let instructions = raw
        .instructions
        .clone()
        .filter(|i| !i.trim().is_empty())
        .ok_or_else(|| RuntimeError::ConfigError("Workflow missing instructions".to_string()))?;

    Ok(WorkflowDefinition {
        name: raw.name.clone().unwrap_or_else(|| raw.id.clone()),
        id: raw.id,
        owner,
        prompt,
        instructions,
        tools: raw.tools,
        max_steps: raw.max_steps,
        model: raw.model,
    })
}

fn is_valid_target_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Resolves a [`LaneTarget`] to its configuration.
#[derive(Debug, Clone, Default)]
pub struct LaneCatalog {
    agents_dir: Option<PathBuf>,
    workflows_dir: Option<PathBuf>,
    budgets: LaneBudgets,
}

impl LaneCatalog {
    pub fn new(budgets: LaneBudgets) -> Self {
        Self {
            agents_dir: None,
            workflows_dir: None,
            budgets,
        }
    }

    pub fn with_agents_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.agents_dir = Some(dir.into());
        self
    }

    pub fn with_workflows_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workflows_dir = Some(dir.into());
        self
    }

    pub fn budgets(&self) -> &LaneBudgets {
        &self.budgets
    }

    pub fn resolve(
        &self,
        target: &LaneTarget,
        identity: &Identity,
    ) -> Result<LaneConfig, AdmissionError> {
        match target {
            LaneTarget::Builder => Ok(self.builtin(Lane::Builder, "Agent Builder", BUILDER_PROMPT)),
            LaneTarget::Assistant => Ok(self.builtin(Lane::Assistant, "Assistant", ASSISTANT_PROMPT)),
            LaneTarget::PublicAgent(id) => self.public_agent(id, identity),
            LaneTarget::Workflow(id) => self.workflow(id, identity),
        }
    }

    fn builtin(&self, lane: Lane, display_name: &str, prompt: &str) -> LaneConfig {
        LaneConfig {
            lane,
            target_id: None,
            display_name: display_name.to_string(),
            system_prompt: prompt.to_string(),
            tools: None,
            max_steps: self.budgets.max_steps_for(lane),
            model: None,
        }
    }

    fn definition_path(
        dir: Option<&PathBuf>,
        id: &str,
        kind: &str,
    ) -> Result<PathBuf, AdmissionError> {
        let not_found = || AdmissionError::NotFound(format!("{} {}", kind, id));
        if !is_valid_target_id(id) {
            return Err(not_found());
        }
        let path = dir.ok_or_else(not_found)?.join(format!("{}.yaml", id));
        if !path.exists() {
            return Err(not_found());
        }
        Ok(path)
    }

    /// A deployed agent. Private agents are only visible to their owner.
    pub fn public_agent(&self, id: &str, identity: &Identity) -> Result<LaneConfig, AdmissionError> {
        let path = Self::definition_path(self.agents_dir.as_ref(), id, "agent")?;
        let def = load_agent_definition(&path).map_err(|e| {
            warn!(agent_id = id, error = %e, "Invalid agent definition");
            AdmissionError::Internal(format!("agent {} is misconfigured", id))
        })?;

        let owned = def.owner.is_some() && def.owner.as_deref() == identity.user_id();
        if !def.public && !owned {
            debug!(agent_id = id, "Agent is not public and caller is not the owner");
            return Err(AdmissionError::NotFound(format!("agent {}", id)));
        }

        Ok(LaneConfig {
            lane: Lane::PublicExecute,
            target_id: Some(def.id),
            display_name: def.name,
            system_prompt: def.prompt,
            tools: Some(def.tools),
            max_steps: def
                .max_steps
                .unwrap_or_else(|| self.budgets.max_steps_for(Lane::PublicExecute)),
            model: def.model,
        })
    }

    /// A saved workflow, visible only to its owner.
    pub fn workflow(&self, id: &str, identity: &Identity) -> Result<LaneConfig, AdmissionError> {
        let path = Self::definition_path(self.workflows_dir.as_ref(), id, "workflow")?;
        let def = load_workflow_definition(&path).map_err(|e| {
            warn!(workflow_id = id, error = %e, "Invalid workflow definition");
            AdmissionError::Internal(format!("workflow {} is misconfigured", id))
        })?;

        if identity.user_id() != Some(def.owner.as_str()) {
            debug!(workflow_id = id, "Caller does not own workflow");
            return Err(AdmissionError::NotFound(format!("workflow {}", id)));
        }

        let prompt = def.prompt.unwrap_or_else(|| WORKFLOW_PROMPT.to_string());
        Ok(LaneConfig {
            lane: Lane::Workflow,
            target_id: Some(def.id),
            display_name: def.name,
            system_prompt: format!("{}\n\nInstructions:\n{}", prompt, def.instructions),
            tools: Some(def.tools),
            max_steps: def
                .max_steps
                .unwrap_or_else(|| self.budgets.max_steps_for(Lane::Workflow)),
            model: def.model,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_agent_with_prompt_file() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("agent.md"), "You scrape prices.").unwrap();
        let config_file = temp_dir.path().join("pricer.yaml");
        fs::write(
            &config_file,
            "id: pricer\nname: Price Watcher\npublic: true\nprompt_file: agent.md\ntools:\n  - http_fetch\nmax_steps: 5\n",
        )
        .unwrap();

        let def = load_agent_definition(&config_file).unwrap();
        assert_eq!(def.id, "pricer");
        assert_eq!(def.name, "Price Watcher");
        assert_eq!(def.prompt, "You scrape prices.");
        assert_eq!(def.tools, vec!["http_fetch"]);
        assert_eq!(def.max_steps, Some(5));
        assert!(def.public);
    }

    #[test]
    fn test_agent_name_defaults_to_id() {
        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join("a.yaml");
        fs::write(&config_file, "id: a\nprompt: hi\n").unwrap();

        let def = load_agent_definition(&config_file).unwrap();
        assert_eq!(def.name, "a");
        assert!(def.tools.is_empty());
        assert!(!def.public);
    }

    #[test]
    fn test_agent_without_prompt_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join("a.yaml");
        fs::write(&config_file, "id: a\n").unwrap();

        match load_agent_definition(&config_file) {
            Err(RuntimeError::ConfigError(msg)) => assert!(msg.contains("prompt")),
            other => panic!("Expected ConfigError, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_prompt_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join("a.yaml");
        fs::write(&config_file, "id: a\nprompt_file: missing.md\n").unwrap();

        match load_agent_definition(&config_file) {
            Err(RuntimeError::ConfigError(msg)) => assert!(msg.contains("Prompt file not found")),
            other => panic!("Expected ConfigError, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join("a.yaml");
        fs::write(&config_file, "id: [unclosed\n").unwrap();

        match load_agent_definition(&config_file) {
            Err(RuntimeError::ConfigError(msg)) => assert!(msg.contains("Invalid YAML")),
            other => panic!("Expected ConfigError, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_max_steps_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join("a.yaml");
        fs::write(&config_file, "id: a\nprompt: hi\nmax_steps: 0\n").unwrap();
        assert!(load_agent_definition(&config_file).is_err());
    }

    #[test]
    fn test_workflow_requires_owner_and_instructions() {
        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join("w.yaml");
        fs::write(&config_file, "id: w\ninstructions: do it\n").unwrap();
        assert!(load_workflow_definition(&config_file).is_err());

        fs::write(&config_file, "id: w\nowner: alice\n").unwrap();
        assert!(load_workflow_definition(&config_file).is_err());

        fs::write(&config_file, "id: w\nowner: alice\ninstructions: do it\n").unwrap();
        let def = load_workflow_definition(&config_file).unwrap();
        assert_eq!(def.owner, "alice");
        assert!(def.prompt.is_none());
    }

    #[test]
    fn test_budgets_from_toml_like_input() {
        let budgets: LaneBudgets =
            serde_yaml::from_str("builder: 8\npublic-execute: 30\n").unwrap();
        assert_eq!(budgets.max_steps_for(Lane::Builder), 8);
        assert_eq!(budgets.max_steps_for(Lane::PublicExecute), 30);
        assert_eq!(budgets.max_steps_for(Lane::Assistant), 50);
    }

    #[test]
    fn test_builtin_lanes_use_full_table() {
        let catalog = LaneCatalog::default();
        let builder = catalog.resolve(&LaneTarget::Builder, &Identity::Guest).unwrap();
        assert_eq!(builder.lane, Lane::Builder);
        assert_eq!(builder.max_steps, 10);
        assert!(builder.tools.is_none());

        let assistant = catalog
            .resolve(&LaneTarget::Assistant, &Identity::User("u".into()))
            .unwrap();
        assert_eq!(assistant.max_steps, 50);
    }

    #[test]
    fn test_target_ids_validated() {
        assert!(is_valid_target_id("agent_1-b"));
        assert!(!is_valid_target_id("../secret"));
        assert!(!is_valid_target_id(""));

        let catalog = LaneCatalog::default().with_agents_dir("/tmp");
        assert_eq!(
            catalog.public_agent("../x", &Identity::Guest),
            Err(AdmissionError::NotFound("agent ../x".into()))
        );
    }
}
