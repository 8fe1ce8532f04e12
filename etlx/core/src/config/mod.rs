//! Configuration model
//!
//! A [`Config`] is the ordered tree parsed from a Markdown (or notebook) document.
//! Level 1 headings become top-level sections, deeper headings nest under their
//! parent, and fenced blocks attach typed payloads to the deepest open section.
//!
//! ```rust
//! use etlx_core::config::Config;
//!
//! let md = "# ETL\n\n```yaml\nconnection: \"duckdb:\"\n```\n\n## sales\n\n```yaml\ntable: sales\n```\n";
//! let config = Config::from_markdown(md).unwrap();
//!
//! assert_eq!(config.order(), vec!["ETL", "AUTO_LOGS"]);
//! let etl = config.section("ETL").unwrap();
//! assert_eq!(etl.children()[0].0, "sales");
//! ```

use std::path::Path;

use tracing::{debug, warn};

pub mod auto_logs;
pub mod error;
pub mod node;
pub mod notebook;
pub mod parser;
pub mod visit;

pub use auto_logs::{with_auto_logs, AUTO_LOGS_KEY};
pub use error::{ConfigError, ParseWarning};
pub use node::{DynamicQuery, Node, NodeMap, LAKES_KEY, METADATA_KEY, ORDER_KEY};
pub use visit::{walk_mut, DynamicQueries, VisitMut};

/// The parsed configuration document.
#[derive(Debug, Clone)]
pub struct Config {
    root: Node,
    warnings: Vec<ParseWarning>,
}

impl Default for Config {
    fn default() -> Self {
        let mut root = NodeMap::new();
        root.insert(ORDER_KEY.to_string(), Node::List(Vec::new()));
        Self {
            root: Node::Map(root),
            warnings: Vec::new(),
        }
    }
}

impl Config {
    /// Load a `.md` document, or a `.ipynb` notebook detected by its extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::NotFound {
            source,
            file_path: path.display().to_string(),
        })?;
        let name = path.display().to_string();

        if is_notebook(path) {
            let md = notebook::notebook_to_markdown(&raw)?;
            Self::parse(&with_auto_logs(&md), &name)
        } else {
            Self::parse(&with_auto_logs(&raw), &name)
        }
    }

    /// Parse Markdown text, appending the `AUTO_LOGS` section when missing.
    pub fn from_markdown(markdown: &str) -> Result<Self, ConfigError> {
        Self::parse(&with_auto_logs(markdown), "config.md")
    }

    /// Parse Markdown text as it is, used for fragments merged into a running config.
    pub fn from_markdown_fragment(markdown: &str, name: &str) -> Result<Self, ConfigError> {
        Self::parse(markdown, name)
    }

    /// Load a `.md` or `.ipynb` file as a fragment, without `AUTO_LOGS`.
    pub fn from_fragment_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::NotFound {
            source,
            file_path: path.display().to_string(),
        })?;
        let name = path.display().to_string();
        if is_notebook(path) {
            Self::parse(&notebook::notebook_to_markdown(&raw)?, &name)
        } else {
            Self::parse(&raw, &name)
        }
    }

    /// Parse notebook JSON given as text.
    pub fn from_ipynb_json(json: &str) -> Result<Self, ConfigError> {
        let md = notebook::notebook_to_markdown(json)?;
        Self::parse(&with_auto_logs(&md), "notebook.ipynb")
    }

    fn parse(markdown: &str, name: &str) -> Result<Self, ConfigError> {
        let parsed = parser::parse_markdown(markdown, name)?;
        let mut root = Node::Map(parsed.root);

        let mut dynamic = DynamicQueries::default();
        walk_mut(&mut root, &mut dynamic);
        debug!(
            "Parsed {name}: {} sections, {} dynamic queries",
            root.order().len(),
            dynamic.converted
        );

        Ok(Self {
            root,
            warnings: parsed.warnings,
        })
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Payloads skipped while parsing
    pub fn warnings(&self) -> &[ParseWarning] {
        &self.warnings
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.root.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Top-level keys in document order
    pub fn order(&self) -> Vec<String> {
        self.root.order()
    }

    /// Lake attach strings found anywhere in the document
    pub fn lakes(&self) -> Vec<String> {
        self.get(LAKES_KEY).map(Node::string_list).unwrap_or_default()
    }

    /// A top-level section, which must be a map.
    pub fn section(&self, key: &str) -> Result<&Node, ConfigError> {
        self.get(key)
            .filter(|n| n.is_map())
            .ok_or_else(|| ConfigError::MissingSection(key.to_string()))
    }

    /// A top-level section together with its metadata.
    pub fn section_with_metadata(&self, key: &str) -> Result<(&Node, &Node), ConfigError> {
        let section = self.section(key)?;
        let metadata = section
            .metadata()
            .ok_or_else(|| ConfigError::MissingMetadata(key.to_string()))?;
        Ok((section, metadata))
    }

    /// Insert or replace a top-level key, keeping `__order` in sync.
    pub fn insert(&mut self, key: impl Into<String>, node: Node) {
        let key = key.into();
        let Some(root) = self.root.as_map_mut() else {
            return;
        };
        if !root.contains_key(&key) {
            if let Some(Node::List(order)) = root.get_mut(ORDER_KEY) {
                order.push(Node::from(key.as_str()));
            }
        }
        root.insert(key, node);
    }

    /// Add the top-level sections of `other` that do not exist yet.
    ///
    /// Returns the conflicting keys; for those the existing section wins.
    pub fn merge(&mut self, other: Config) -> Vec<String> {
        let mut conflicts = Vec::new();
        let order = other.order();
        let Node::Map(mut incoming) = other.root else {
            return conflicts;
        };

        for key in order {
            let Some(node) = incoming.shift_remove(&key) else {
                continue;
            };
            if self.contains(&key) {
                warn!("Configuration key {key} already exists, keeping the current one");
                conflicts.push(key);
            } else {
                self.insert(key, node);
            }
        }

        let lakes = other_lakes(&incoming);
        if !lakes.is_empty() {
            let mut all = self.lakes();
            for lake in lakes {
                if !all.contains(&lake) {
                    all.push(lake);
                }
            }
            if let Some(root) = self.root.as_map_mut() {
                root.insert(
                    LAKES_KEY.to_string(),
                    Node::List(all.into_iter().map(Node::String).collect()),
                );
            }
        }

        self.warnings.extend(other.warnings);
        conflicts
    }

    /// Pretty JSON rendering of the whole tree.
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(&self.root.to_json()).unwrap_or_default()
    }
}

fn other_lakes(map: &NodeMap) -> Vec<String> {
    map.get(LAKES_KEY).map(Node::string_list).unwrap_or_default()
}

fn is_notebook(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("ipynb"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_existing_keys() {
        let mut base = Config::from_markdown_fragment("# A\n\n```yaml\nv: 1\n```\n", "a").unwrap();
        let other =
            Config::from_markdown_fragment("# A\n\n```yaml\nv: 2\n```\n\n# B\n", "b").unwrap();

        let conflicts = base.merge(other);

        assert_eq!(conflicts, vec!["A"]);
        assert_eq!(base.order(), vec!["A", "B"]);
        let v = base.section("A").unwrap().metadata().unwrap().get("v").cloned();
        assert_eq!(v, Some(Node::Int(1)));
    }

    #[test]
    fn missing_section_and_metadata() {
        let config = Config::from_markdown_fragment("# A\n\n## item\n", "a").unwrap();
        assert!(matches!(
            config.section("NOPE"),
            Err(ConfigError::MissingSection(_))
        ));
        assert!(matches!(
            config.section_with_metadata("A"),
            Err(ConfigError::MissingMetadata(_))
        ));
    }

    #[test]
    fn loads_notebooks_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.ipynb");
        std::fs::write(
            &path,
            r##"{"cells": [{"cell_type": "markdown", "source": ["# ETL\n"]}]}"##,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.order(), vec!["ETL", "AUTO_LOGS"]);
    }

    #[test]
    fn json_rendering_keeps_order_keys() {
        let config = Config::from_markdown_fragment("# B\n\n# A\n", "x").unwrap();
        let json = config.to_json_pretty();
        assert!(json.find("\"B\"").unwrap() < json.find("\"A\"").unwrap());
        assert!(json.contains("__order"));
    }
}
