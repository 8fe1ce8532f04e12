//! Markdown walker producing the configuration tree.
//!
//! Headings open sections, fenced blocks attach payloads to the deepest open section:
//!
//! - `yaml|toml|json [name]` blocks decode into a map stored at `name` (or `metadata`)
//! - `sql [name]` blocks store their text, the name may come from a `-- name` line
//! - `html|python|py name` blocks store their text under the mandatory name

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use miette::NamedSource;
use pulldown_cmark::{CodeBlockKind, Event, Parser, Tag, TagEnd};
use regex::Regex;
use tracing::warn;

use super::error::{ConfigError, ParseWarning};
use super::node::{Node, NodeMap, LAKES_KEY, METADATA_KEY, ORDER_KEY};

static YAML_NAME_REGEX: OnceLock<Regex> = OnceLock::new();
static SQL_NAME_REGEX: OnceLock<Regex> = OnceLock::new();

/// Result of walking a document.
#[derive(Debug, Default)]
pub struct Parsed {
    pub root: NodeMap,
    pub warnings: Vec<ParseWarning>,
}

struct Walker<'a> {
    source: &'a str,
    name: &'a str,
    root: NodeMap,
    /// Key path of the open section at each heading level
    levels: BTreeMap<usize, Vec<String>>,
    warnings: Vec<ParseWarning>,
}

/// Parse a Markdown document into a tree.
pub fn parse_markdown(source: &str, name: &str) -> Result<Parsed, ConfigError> {
    let mut walker = Walker {
        source,
        name,
        root: NodeMap::new(),
        levels: BTreeMap::new(),
        warnings: Vec::new(),
    };
    walker.root.insert(ORDER_KEY.to_string(), Node::List(Vec::new()));

    let lakes = etlx_db::lake::find_lake_strings(source);
    if !lakes.is_empty() {
        walker.root.insert(
            LAKES_KEY.to_string(),
            Node::List(lakes.into_iter().map(Node::String).collect()),
        );
    }

    let mut heading: Option<(usize, std::ops::Range<usize>, String)> = None;
    let mut fence: Option<(String, String)> = None;

    for (event, range) in Parser::new(source).into_offset_iter() {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                heading = Some((level as usize, range, String::new()));
            }
            Event::Text(text) => {
                if let Some((_, _, buf)) = heading.as_mut() {
                    buf.push_str(&text);
                } else if let Some((_, buf)) = fence.as_mut() {
                    buf.push_str(&text);
                }
            }
            Event::End(TagEnd::Heading(_)) => {
                if let Some((level, span, text)) = heading.take() {
                    walker.open_section(level, text.trim(), span)?;
                }
            }
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) => {
                fence = Some((info.trim().to_string(), String::new()));
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some((info, content)) = fence.take() {
                    walker.attach_block(&info, content);
                }
            }
            _ => {}
        }
    }

    Ok(Parsed {
        root: walker.root,
        warnings: walker.warnings,
    })
}

fn new_section() -> Node {
    let mut map = NodeMap::new();
    map.insert(ORDER_KEY.to_string(), Node::List(Vec::new()));
    Node::Map(map)
}

fn push_order(section: &mut NodeMap, key: &str) {
    if let Some(Node::List(order)) = section.get_mut(ORDER_KEY) {
        order.push(Node::from(key));
    }
}

fn section_mut<'a>(root: &'a mut NodeMap, path: &[String]) -> Option<&'a mut NodeMap> {
    let mut current = root;
    for key in path {
        current = current.get_mut(key)?.as_map_mut()?;
    }
    Some(current)
}

impl Walker<'_> {
    fn open_section(
        &mut self,
        level: usize,
        heading: &str,
        span: std::ops::Range<usize>,
    ) -> Result<(), ConfigError> {
        if level == 1 {
            push_order(&mut self.root, heading);
            if !self.root.get(heading).is_some_and(Node::is_map) {
                self.root.insert(heading.to_string(), new_section());
            }
            self.levels.clear();
            self.levels.insert(1, vec![heading.to_string()]);
            return Ok(());
        }

        let parent_path = match self.levels.get(&(level - 1)) {
            Some(path) => path.clone(),
            None => {
                return Err(ConfigError::OrphanHeading {
                    level,
                    heading: heading.to_string(),
                    source_code: Arc::new(NamedSource::new(self.name, self.source.to_string())),
                    span: span.into(),
                })
            }
        };

        let parent = section_mut(&mut self.root, &parent_path).ok_or_else(|| {
            ConfigError::invalid(parent_path.join("->"), "enclosing heading is not a section")
        })?;
        push_order(parent, heading);
        if !parent.get(heading).is_some_and(Node::is_map) {
            parent.insert(heading.to_string(), new_section());
        }

        let mut path = parent_path;
        path.push(heading.to_string());
        self.levels.retain(|l, _| *l < level);
        self.levels.insert(level, path);
        Ok(())
    }

    fn warn(&mut self, path: &[String], message: String) {
        let section = path.join("->");
        warn!("{section}: {message}");
        self.warnings.push(ParseWarning { section, message });
    }

    fn attach_block(&mut self, info: &str, content: String) {
        let Some(path) = self.levels.values().next_back().cloned() else {
            if !info.is_empty() {
                self.warn(&[], format!("`{info}` block outside of any section was ignored"));
            }
            return;
        };

        let (lang, tag) = match info.split_once(char::is_whitespace) {
            Some((lang, rest)) => (lang.to_ascii_lowercase(), rest.trim().to_string()),
            None => (info.to_ascii_lowercase(), String::new()),
        };

        let entry = match lang.as_str() {
            "yaml" | "yml" | "toml" | "json" => {
                let (key, content) = if tag.is_empty() {
                    let (name, content) = take_name(yaml_name_regex(), &content);
                    (name.unwrap_or_else(|| METADATA_KEY.to_string()), content)
                } else {
                    (tag, content)
                };
                match decode(&lang, &content) {
                    Ok(node) => Some((key, node)),
                    Err(e) => {
                        self.warn(&path, format!("error parsing {info} block {key}: {e}"));
                        None
                    }
                }
            }
            "sql" => {
                let (key, content) = if tag.is_empty() {
                    take_name(sql_name_regex(), &content)
                } else {
                    (Some(tag), content)
                };
                match key {
                    Some(key) => Some((key, Node::String(content))),
                    None => {
                        self.warn(&path, "missing query name for SQL block".to_string());
                        None
                    }
                }
            }
            "html" | "python" | "py" => {
                if tag.is_empty() {
                    self.warn(&path, format!("missing name for {lang} block"));
                    None
                } else {
                    Some((tag, Node::String(content)))
                }
            }
            _ => None,
        };

        if let Some((key, node)) = entry {
            if let Some(section) = section_mut(&mut self.root, &path) {
                section.insert(key, node);
            }
        }
    }
}

fn yaml_name_regex() -> &'static Regex {
    YAML_NAME_REGEX.get_or_init(|| Regex::new(r"(?m)^#\s*(\w+)\s*$").expect("invalid regex"))
}

fn sql_name_regex() -> &'static Regex {
    SQL_NAME_REGEX.get_or_init(|| Regex::new(r"(?m)^--\s*(\w+)\s*$").expect("invalid regex"))
}

/// Pull a `# name` / `-- name` directive out of a payload.
fn take_name(regex: &Regex, content: &str) -> (Option<String>, String) {
    match regex.captures(content) {
        Some(caps) => {
            let name = caps.get(1).map(|m| m.as_str().to_string());
            let stripped = regex.replace(content, "");
            (name, stripped.trim_start_matches('\n').to_string())
        }
        None => (None, content.to_string()),
    }
}

fn decode(lang: &str, content: &str) -> Result<Node, String> {
    let node = match lang {
        "yaml" | "yml" => serde_yml::from_str::<serde_yml::Value>(content)
            .map(Node::from)
            .map_err(|e| e.to_string())?,
        "toml" => toml::from_str::<toml::Table>(content)
            .map(|t| Node::from(toml::Value::Table(t)))
            .map_err(|e| e.to_string())?,
        _ => serde_json::from_str::<serde_json::Value>(content)
            .map(Node::from)
            .map_err(|e| e.to_string())?,
    };
    match node {
        Node::Map(_) => Ok(node),
        Node::Null => Ok(Node::map()),
        other => Err(format!("expected a mapping, found `{other}`")),
    }
}
