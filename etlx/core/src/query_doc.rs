//! Query documents: a SQL statement assembled from named clause fragments.
//!
//! Each fragment is a subsection holding `select`, `from`, `where`, ... blocks.
//! A clause may reference another fragment as `@name`, which is replaced by that
//! fragment's select expression in parentheses.

use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::{NoExpand, Regex};
use serde::Serialize;
use tracing::warn;

use crate::config::{Config, ConfigError, Node};

/// Default top-level key of a query document
pub const QUERY_DOC_KEY: &str = "QUERY_DOC";
/// Optional subsection grouping the fragments
pub const FIELDS_KEY: &str = "FIELDS";

/// Clause names in the order they are concatenated.
pub const CLAUSES: [&str; 9] = [
    "cte", "select", "from", "join", "where", "group_by", "window", "order_by", "having",
];

static REFERENCE_REGEX: OnceLock<Regex> = OnceLock::new();
static LEADING_SELECT_REGEX: OnceLock<Regex> = OnceLock::new();

/// A named clause fragment.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Field {
    pub name: String,
    pub description: String,
    pub active: bool,
    /// Clause text keyed by clause name
    pub clauses: IndexMap<&'static str, String>,
    /// Other string entries of the fragment
    pub extras: IndexMap<String, String>,
}

impl Field {
    /// Read a fragment from its subsection. `None` when it has no `select`.
    pub fn from_node(key: &str, node: &Node) -> Option<Self> {
        let metadata = node.metadata();
        let lookup = |clause: &str| {
            node.get_str(clause)
                .or_else(|| metadata.and_then(|m| m.get_str(clause)))
                .map(str::to_string)
        };

        let name = metadata
            .and_then(|m| m.get_str("name"))
            .unwrap_or(key)
            .to_string();

        lookup("select")?;

        let clauses = CLAUSES
            .iter()
            .map(|c| (*c, lookup(c).unwrap_or_default()))
            .collect();

        let extras = node
            .as_map()
            .into_iter()
            .flatten()
            .filter(|(k, _)| !CLAUSES.contains(&k.as_str()))
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect();

        Some(Self {
            description: metadata
                .and_then(|m| m.get_str("description").or_else(|| m.get_str("desc")))
                .unwrap_or_default()
                .to_string(),
            active: node.is_active() && metadata.map(Node::is_active).unwrap_or(true),
            name,
            clauses,
            extras,
        })
    }

    pub fn clause(&self, clause: &str) -> &str {
        self.clauses.get(clause).map(String::as_str).unwrap_or_default()
    }

    pub fn select(&self) -> &str {
        self.clause("select")
    }
}

/// The fragments of a query document in authored order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryDoc {
    pub fields: Vec<Field>,
}

impl QueryDoc {
    /// Read the fragments of a section, from its `FIELDS` subsection when there is one.
    pub fn from_section(key: &str, section: &Node) -> Result<Self, ConfigError> {
        if !section.is_map() {
            return Err(ConfigError::MissingSection(key.to_string()));
        }
        let holder = section.get(FIELDS_KEY).filter(|n| n.is_map()).unwrap_or(section);

        let fields = holder
            .children()
            .into_iter()
            .filter_map(|(child_key, child)| {
                let field = Field::from_node(&child_key, child);
                if field.is_none() {
                    warn!("{key}: field {child_key} has no select and was ignored");
                }
                field
            })
            .collect();

        Ok(Self { fields })
    }

    /// Concatenate the clauses of every active fragment, resolving `@name` references.
    pub fn build(&self) -> String {
        let mut selects: IndexMap<String, String> = self
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.select().to_string()))
            .collect();
        let mut buffers: IndexMap<&'static str, String> =
            CLAUSES.iter().map(|c| (*c, String::new())).collect();

        for field in self.fields.iter().filter(|f| f.active) {
            for clause in CLAUSES {
                let resolved = replace_references(field.clause(clause), &selects);
                if clause == "select" {
                    selects.insert(field.name.clone(), resolved.clone());
                }
                if let Some(buffer) = buffers.get_mut(clause) {
                    buffer.push_str(&resolved);
                }
            }
        }

        buffers.into_values().collect()
    }
}

/// Strip a select expression down to what can be embedded in another clause.
pub fn clean_select(select: &str, name: &str) -> String {
    let leading = LEADING_SELECT_REGEX
        .get_or_init(|| Regex::new(r"(?i)^\s*SELECT\s+").expect("invalid regex"));

    let flat = select.replace('\n', " ");
    let flat = leading.replace(flat.trim(), "");
    // only a trailing alias, `CAST(x AS DATE)` must survive for a field named `d`
    let alias = Regex::new(&format!(r#"(?i)\s+AS\s+"?{}"?\s*$"#, regex::escape(name)));
    let flat = match alias {
        Ok(re) => re.replace_all(&flat, "").into_owned(),
        Err(_) => flat.into_owned(),
    };
    let flat = flat.trim();
    flat.strip_prefix(',').unwrap_or(flat).trim().to_string()
}

fn replace_references(clause: &str, selects: &IndexMap<String, String>) -> String {
    if !clause.contains('@') {
        return clause.to_string();
    }
    let finder = REFERENCE_REGEX.get_or_init(|| Regex::new(r"@(\w+)").expect("invalid regex"));

    let mut names: Vec<String> = Vec::new();
    for caps in finder.captures_iter(clause) {
        let name = caps[1].to_string();
        if selects.contains_key(&name) && !names.contains(&name) {
            names.push(name);
        }
    }

    let mut out = clause.to_string();
    for name in names {
        let Some(select) = selects.get(&name) else {
            continue;
        };
        let replacement = format!("({})", clean_select(select, &name));
        if let Ok(re) = Regex::new(&format!(r"@{}\b(?:::\w+|\(\))?", regex::escape(&name))) {
            out = re.replace_all(&out, NoExpand(&replacement)).into_owned();
        }
    }
    out
}

/// Build the SQL of the query document at `key`.
pub fn build_query(config: &Config, key: &str) -> Result<String, ConfigError> {
    let section = config.section(key)?;
    Ok(QueryDoc::from_section(key, section)?.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(md: &str) -> Config {
        Config::from_markdown_fragment(md, "doc.md").unwrap()
    }

    #[test]
    fn references_become_parenthesised_selects() {
        let config = doc(
            "# QUERY_DOC\n\n## a\n\n```sql select\nSELECT x AS a\n```\n\n## b\n\n```sql select\n, @a + 1 AS b\n```\n\n```sql from\n FROM t\n```\n",
        );
        let sql = build_query(&config, QUERY_DOC_KEY).unwrap();
        assert!(sql.contains("(x) + 1 AS b"), "{sql}");
        assert!(sql.starts_with("SELECT x AS a\n"));
        assert!(sql.ends_with(" FROM t\n"));
    }

    #[test]
    fn fields_subsection_and_inactive_fragments() {
        let config = doc(
            "# SALES\n\n## FIELDS\n\n### total\n\n```yaml\nname: total\nactive: false\n```\n\n```sql select\n, SUM(v) AS total\n```\n\n### id\n\n```sql select\nSELECT id\n```\n",
        );
        let sql = build_query(&config, "SALES").unwrap();
        assert_eq!(sql, "SELECT id\n");
    }

    #[test]
    fn casts_and_calls_are_absorbed() {
        let mut selects = IndexMap::new();
        selects.insert("d".to_string(), "CAST(x AS DATE) AS \"d\"".to_string());
        assert_eq!(
            replace_references("WHERE @d::DATE > @d() AND @dx", &selects),
            "WHERE (CAST(x AS DATE)) > (CAST(x AS DATE)) AND @dx"
        );
    }

    #[test]
    fn clean_select_strips_keyword_alias_and_comma() {
        assert_eq!(clean_select("SELECT\n  amount * 2 AS doubled", "doubled"), "amount * 2");
        assert_eq!(clean_select(", price AS \"price\"", "price"), "price");
    }

    #[test]
    fn clean_select_keeps_inner_casts() {
        assert_eq!(clean_select("CAST(x AS DATE) AS d", "d"), "CAST(x AS DATE)");
        assert_eq!(clean_select("CAST(x AS DATE)", "d"), "CAST(x AS DATE)");
        assert_eq!(clean_select("CAST(x AS d_type) AS \"d\"", "d"), "CAST(x AS d_type)");
    }

    #[test]
    fn missing_section_is_an_error() {
        let config = doc("# OTHER\n");
        assert!(matches!(
            build_query(&config, QUERY_DOC_KEY),
            Err(ConfigError::MissingSection(_))
        ));
    }
}
