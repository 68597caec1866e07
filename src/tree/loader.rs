//! YAML flow definitions
//!
//! Parses declarative flow files into [`NodeTree`] arenas and keeps the
//! registry the orchestrator resolves flow paths against. The raw YAML text
//! is retained so a job can snapshot the exact definition it ran.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::{NodeKind, NodeTree, TreeBuilder};

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Failed to read flow file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid flow yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid flow definition: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
struct FlowDoc {
    name: String,
    #[serde(default)]
    envs: HashMap<String, String>,
    #[serde(default)]
    steps: Vec<StepDoc>,
}

#[derive(Debug, Deserialize)]
struct StepDoc {
    name: String,
    #[serde(default)]
    envs: HashMap<String, String>,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    allow_failure: bool,
    #[serde(default)]
    steps: Vec<StepDoc>,
}

/// Parse a YAML flow definition into a tree.
pub fn parse_flow(yml: &str) -> Result<NodeTree, LoaderError> {
    let doc: FlowDoc = serde_yaml::from_str(yml)?;
    if doc.name.trim().is_empty() {
        return Err(LoaderError::Invalid("flow name cannot be empty".into()));
    }
    if doc.steps.is_empty() {
        return Err(LoaderError::Invalid(format!(
            "flow '{}' has no steps",
            doc.name
        )));
    }

    let mut builder = TreeBuilder::new();
    let root = builder.add(None, &doc.name, doc.envs, NodeKind::Group);
    for step in &doc.steps {
        add_step(&mut builder, root, step)?;
    }
    Ok(builder.build())
}

fn add_step(
    builder: &mut TreeBuilder,
    parent: super::NodeId,
    doc: &StepDoc,
) -> Result<(), LoaderError> {
    match (&doc.script, doc.steps.is_empty()) {
        (Some(script), true) => {
            builder.add(
                Some(parent),
                &doc.name,
                doc.envs.clone(),
                NodeKind::Step {
                    script: script.clone(),
                    allow_failure: doc.allow_failure,
                },
            );
            Ok(())
        }
        (None, false) => {
            let group = builder.add(Some(parent), &doc.name, doc.envs.clone(), NodeKind::Group);
            for child in &doc.steps {
                add_step(builder, group, child)?;
            }
            Ok(())
        }
        (Some(_), false) => Err(LoaderError::Invalid(format!(
            "node '{}' has both a script and nested steps",
            doc.name
        ))),
        (None, true) => Err(LoaderError::Invalid(format!(
            "node '{}' has neither a script nor nested steps",
            doc.name
        ))),
    }
}

/// A registered flow: its tree plus the raw YAML it was parsed from.
#[derive(Debug)]
pub struct FlowEntry {
    pub tree: NodeTree,
    pub yml: String,
}

/// Registry of known flows, keyed by root path (the flow name).
#[derive(Debug, Default)]
pub struct FlowRegistry {
    flows: DashMap<String, Arc<FlowEntry>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and register a flow definition. Returns the flow's root path.
    pub fn register(&self, yml: &str) -> Result<String, LoaderError> {
        let tree = parse_flow(yml)?;
        let path = tree.node(tree.root()).path.clone();
        self.flows.insert(
            path.clone(),
            Arc::new(FlowEntry {
                tree,
                yml: yml.to_string(),
            }),
        );
        Ok(path)
    }

    pub fn find(&self, root_path: &str) -> Option<Arc<FlowEntry>> {
        self.flows.get(root_path).map(|e| e.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.flows.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

/// Load every `*.yml`/`*.yaml` file under `dir` into the registry.
/// Files that fail to parse are skipped with a warning.
pub fn load_flow_dir(registry: &FlowRegistry, dir: &Path) -> Result<usize, LoaderError> {
    let mut loaded = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yml" || e == "yaml")
            .unwrap_or(false);
        if !is_yaml {
            continue;
        }
        let text = std::fs::read_to_string(&path)?;
        match registry.register(&text) {
            Ok(name) => {
                debug!("Loaded flow '{}' from {}", name, path.display());
                loaded += 1;
            }
            Err(e) => {
                warn!("Skipping flow file {}: {}", path.display(), e);
            }
        }
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const DEMO_FLOW: &str = r#"
name: demo
envs:
  FLOW_STATUS: READY
  FLOW_VERSION: "1"
steps:
  - name: build
    script: make build
  - name: checks
    steps:
      - name: unit
        script: make unit
      - name: lint
        script: make lint
        allow_failure: true
"#;

    #[test]
    fn test_parse_flow_tree_shape() {
        let tree = parse_flow(DEMO_FLOW).unwrap();
        assert_eq!(tree.len(), 5);
        assert_eq!(tree.node(tree.root()).path, "demo");
        assert_eq!(
            tree.node(tree.root()).envs.get("FLOW_STATUS"),
            Some(&"READY".to_string())
        );

        let lint = tree.find("demo/checks/lint").unwrap();
        assert!(tree.node(lint).allow_failure());
        assert_eq!(tree.node(lint).script(), Some("make lint"));
    }

    #[test]
    fn test_parse_flow_rejects_empty() {
        assert!(parse_flow("name: empty\nsteps: []").is_err());
    }

    #[test]
    fn test_parse_flow_rejects_script_and_steps() {
        let yml = r#"
name: bad
steps:
  - name: both
    script: echo hi
    steps:
      - name: inner
        script: echo inner
"#;
        let err = parse_flow(yml).unwrap_err();
        assert!(matches!(err, LoaderError::Invalid(_)));
    }

    #[test]
    fn test_registry_register_and_find() {
        let registry = FlowRegistry::new();
        let path = registry.register(DEMO_FLOW).unwrap();
        assert_eq!(path, "demo");

        let entry = registry.find("demo").unwrap();
        assert!(entry.yml.contains("make build"));
        assert!(registry.find("missing").is_none());
    }

    #[test]
    fn test_load_flow_dir() {
        let dir = TempDir::new().unwrap();
        let mut f = std::fs::File::create(dir.path().join("demo.yml")).unwrap();
        f.write_all(DEMO_FLOW.as_bytes()).unwrap();
        // non-yaml files are ignored
        std::fs::File::create(dir.path().join("notes.txt")).unwrap();

        let registry = FlowRegistry::new();
        let loaded = load_flow_dir(&registry, dir.path()).unwrap();
        assert_eq!(loaded, 1);
        assert!(registry.find("demo").is_some());
    }
}
