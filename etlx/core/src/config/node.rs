//! Dynamically typed configuration values.

use std::fmt;
use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

/// Key holding the authored order of the children of a section
pub const ORDER_KEY: &str = "__order";
/// Key holding the options of a section
pub const METADATA_KEY: &str = "metadata";
/// Top-level key with every lake attach string found in the document
pub const LAKES_KEY: &str = "__lakes";

pub type NodeMap = IndexMap<String, Node>;

static DYNAMIC_REGEX: OnceLock<Regex> = OnceLock::new();

/// A value of the configuration tree.
///
/// Maps keep insertion order, so iteration without `__order` still follows the document.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Node {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Node>),
    Map(NodeMap),
    Dynamic(DynamicQuery),
}

/// SQL whose result rows (column `query`) are the statements to execute.
///
/// Written as `get_dyn_queries[name]` or `get_dyn_queries[name](before,after)` in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicQuery {
    pub name: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

impl DynamicQuery {
    pub fn parse(input: &str) -> Option<Self> {
        let caps = DYNAMIC_REGEX
            .get_or_init(|| {
                Regex::new(r"(?s)^\s*get_dyn_queries\[(\w+)\](?:\((.*)\))?\s*$").expect("invalid regex")
            })
            .captures(input)?;

        let name = caps.get(1)?.as_str().to_string();
        let (before, after) = match caps.get(2) {
            Some(args) => {
                let mut parts = split_top_level(args.as_str()).into_iter();
                let before = parts.next().filter(|s| !s.is_empty());
                let after = parts.next().filter(|s| !s.is_empty());
                (before, after)
            }
            None => (None, None),
        };

        Some(Self { name, before, after })
    }
}

impl fmt::Display for DynamicQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "get_dyn_queries[{}]", self.name)?;
        if self.before.is_some() || self.after.is_some() {
            write!(
                f,
                "({},{})",
                self.before.as_deref().unwrap_or_default(),
                self.after.as_deref().unwrap_or_default()
            )?;
        }
        Ok(())
    }
}

// Splits on commas outside parentheses and quotes
fn split_top_level(args: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut current = String::new();

    for ch in args.chars() {
        match (quote, ch) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(ch);
                current.push(ch);
            }
            (None, '(') => {
                depth += 1;
                current.push(ch);
            }
            (None, ')') => {
                depth -= 1;
                current.push(ch);
            }
            (None, ',') if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            (None, c) => current.push(c),
        }
    }
    parts.push(current.trim().to_string());
    parts
}

impl Node {
    pub fn map() -> Self {
        Node::Map(NodeMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Node::Null)
    }

    pub fn is_map(&self) -> bool {
        matches!(self, Node::Map(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::String(s) => Some(s),
            _ => None,
        }
    }

    /// Booleans, plus the strings `true` / `false`
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Node::Bool(b) => Some(*b),
            Node::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Node::Int(i) => Some(*i),
            Node::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Node::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Node::Int(i) => Some(*i as f64),
            Node::Float(f) => Some(*f),
            Node::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&NodeMap> {
        match self {
            Node::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut NodeMap> {
        match self {
            Node::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Node]> {
        match self {
            Node::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.as_map().and_then(|m| m.get(key))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Node::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Node::as_bool)
    }

    /// Value at `key` unless it is absent or null
    pub fn get_set(&self, key: &str) -> Option<&Node> {
        self.get(key).filter(|n| !n.is_null())
    }

    pub fn metadata(&self) -> Option<&Node> {
        self.get(METADATA_KEY).filter(|m| m.is_map())
    }

    /// `false` only when `active` is explicitly false
    pub fn is_active(&self) -> bool {
        self.get_bool("active").unwrap_or(true)
    }

    /// Child keys in authored order: `__order` when present, insertion order otherwise.
    pub fn order(&self) -> Vec<String> {
        let Some(map) = self.as_map() else {
            return Vec::new();
        };
        match map.get(ORDER_KEY).and_then(Node::as_list) {
            Some(order) => order
                .iter()
                .filter_map(Node::as_str)
                .filter(|k| map.contains_key(*k))
                .map(str::to_string)
                .collect(),
            None => map
                .keys()
                .filter(|k| !is_reserved(k))
                .cloned()
                .collect(),
        }
    }

    /// Child sections in authored order, skipping reserved keys and scalar payloads.
    pub fn children(&self) -> Vec<(String, &Node)> {
        self.order()
            .into_iter()
            .filter(|k| !is_reserved(k))
            .filter_map(|k| {
                let child = self.get(&k)?;
                child.is_map().then_some((k, child))
            })
            .collect()
    }

    /// A string, or the strings of a list
    pub fn string_list(&self) -> Vec<String> {
        match self {
            Node::String(s) => vec![s.clone()],
            Node::List(items) => items
                .iter()
                .filter_map(|n| match n {
                    Node::String(s) => Some(s.clone()),
                    Node::Int(_) | Node::Float(_) | Node::Bool(_) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Scalar rendering used when a value is spliced into text
    pub fn to_text(&self) -> Option<String> {
        match self {
            Node::String(s) => Some(s.clone()),
            Node::Int(_) | Node::Float(_) | Node::Bool(_) | Node::Dynamic(_) => {
                Some(self.to_string())
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Node::Null => serde_json::Value::Null,
            Node::Bool(b) => serde_json::Value::Bool(*b),
            Node::Int(i) => serde_json::Value::from(*i),
            Node::Float(f) => serde_json::Value::from(*f),
            Node::String(s) => serde_json::Value::String(s.clone()),
            Node::Dynamic(d) => serde_json::Value::String(d.to_string()),
            Node::List(items) => serde_json::Value::Array(items.iter().map(Node::to_json).collect()),
            Node::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

/// Keys synthesized by the parser or reserved for options
pub fn is_reserved(key: &str) -> bool {
    matches!(key, METADATA_KEY | ORDER_KEY | LAKES_KEY | "order")
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Null => Ok(()),
            Node::Bool(b) => write!(f, "{b}"),
            Node::Int(i) => write!(f, "{i}"),
            Node::Float(v) => write!(f, "{v}"),
            Node::String(s) => write!(f, "{s}"),
            Node::Dynamic(d) => write!(f, "{d}"),
            Node::List(_) | Node::Map(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Node::Null => serializer.serialize_none(),
            Node::Bool(b) => serializer.serialize_bool(*b),
            Node::Int(i) => serializer.serialize_i64(*i),
            Node::Float(f) => serializer.serialize_f64(*f),
            Node::String(s) => serializer.serialize_str(s),
            Node::Dynamic(d) => serializer.collect_str(d),
            Node::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Node::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

impl From<&str> for Node {
    fn from(value: &str) -> Self {
        Node::String(value.to_string())
    }
}

impl From<String> for Node {
    fn from(value: String) -> Self {
        Node::String(value)
    }
}

impl From<bool> for Node {
    fn from(value: bool) -> Self {
        Node::Bool(value)
    }
}

impl From<i64> for Node {
    fn from(value: i64) -> Self {
        Node::Int(value)
    }
}

impl From<Vec<Node>> for Node {
    fn from(value: Vec<Node>) -> Self {
        Node::List(value)
    }
}

impl From<NodeMap> for Node {
    fn from(value: NodeMap) -> Self {
        Node::Map(value)
    }
}

impl From<serde_json::Value> for Node {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Node::Null,
            serde_json::Value::Bool(b) => Node::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Node::Int(i),
                None => Node::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Node::String(s),
            serde_json::Value::Array(items) => Node::List(items.into_iter().map(Node::from).collect()),
            serde_json::Value::Object(map) => {
                Node::Map(map.into_iter().map(|(k, v)| (k, Node::from(v))).collect())
            }
        }
    }
}

impl From<serde_yml::Value> for Node {
    fn from(value: serde_yml::Value) -> Self {
        match value {
            serde_yml::Value::Null => Node::Null,
            serde_yml::Value::Bool(b) => Node::Bool(b),
            serde_yml::Value::Number(n) => match n.as_i64() {
                Some(i) => Node::Int(i),
                None => Node::Float(n.as_f64().unwrap_or_default()),
            },
            serde_yml::Value::String(s) => Node::String(s),
            serde_yml::Value::Sequence(items) => {
                Node::List(items.into_iter().map(Node::from).collect())
            }
            serde_yml::Value::Mapping(map) => Node::Map(
                map.into_iter()
                    .map(|(k, v)| (yaml_key(k), Node::from(v)))
                    .collect(),
            ),
            serde_yml::Value::Tagged(tagged) => Node::from(tagged.value),
        }
    }
}

fn yaml_key(key: serde_yml::Value) -> String {
    match key {
        serde_yml::Value::String(s) => s,
        serde_yml::Value::Bool(b) => b.to_string(),
        serde_yml::Value::Number(n) => n.to_string(),
        serde_yml::Value::Null => "null".to_string(),
        other => Node::from(other).to_string(),
    }
}

impl From<toml::Value> for Node {
    fn from(value: toml::Value) -> Self {
        match value {
            toml::Value::Boolean(b) => Node::Bool(b),
            toml::Value::Integer(i) => Node::Int(i),
            toml::Value::Float(f) => Node::Float(f),
            toml::Value::String(s) => Node::String(s),
            toml::Value::Datetime(dt) => Node::String(dt.to_string()),
            toml::Value::Array(items) => Node::List(items.into_iter().map(Node::from).collect()),
            toml::Value::Table(table) => {
                Node::Map(table.into_iter().map(|(k, v)| (k, Node::from(v))).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_query_with_literal_arguments() {
        let dq = DynamicQuery::parse(
            "get_dyn_queries[create_missing_columns](ATTACH 'logs.db' (TYPE SQLITE),DETACH logs)",
        )
        .unwrap();
        assert_eq!(dq.name, "create_missing_columns");
        assert_eq!(dq.before.as_deref(), Some("ATTACH 'logs.db' (TYPE SQLITE)"));
        assert_eq!(dq.after.as_deref(), Some("DETACH logs"));
    }

    #[test]
    fn dynamic_query_without_arguments() {
        let dq = DynamicQuery::parse("get_dyn_queries[alter_cols]").unwrap();
        assert_eq!(dq.before, None);
        assert_eq!(dq.to_string(), "get_dyn_queries[alter_cols]");
        assert!(DynamicQuery::parse("SELECT 1").is_none());
    }

    #[test]
    fn order_falls_back_to_insertion() {
        let mut map = NodeMap::new();
        map.insert("metadata".into(), Node::map());
        map.insert("b".into(), Node::map());
        map.insert("a".into(), Node::from("SELECT 1"));
        let node = Node::Map(map);

        assert_eq!(node.order(), vec!["b", "a"]);
        let children: Vec<_> = node.children().into_iter().map(|(k, _)| k).collect();
        assert_eq!(children, vec!["b"]);
    }

    #[test]
    fn yaml_values_become_nodes() {
        let yaml: serde_yml::Value =
            serde_yml::from_str("name: x\nactive: false\nlist: [1, two]\n").unwrap();
        let node = Node::from(yaml);
        assert_eq!(node.get_str("name"), Some("x"));
        assert!(!node.is_active());
        assert_eq!(node.get("list").unwrap().string_list(), vec!["1", "two"]);
    }
}
