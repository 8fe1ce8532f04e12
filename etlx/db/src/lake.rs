//! Detection of the lake attach form:
//! `[ATTACH] 'ducklake:DSN' [AS name] [(DATA_PATH '...')]`

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

fn main_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"(?i)^\s*(ATTACH\s+)?['"]?(?:duck)?lake:([^'")\s]+)['"]?(?:\s+AS\s+([a-zA-Z_][a-zA-Z0-9_]*))?(?:\s*\(([^)]*)\))?\s*;?\s*$"#,
        )
        .expect("invalid regex")
    })
}

fn scan_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"(?i)(?:(?:^|\s)(ATTACH)\s+)?['"]?(\b(?:duck)?lake:[^'")\s;]+)['"]?(?:\s+AS\s+([a-zA-Z_][a-zA-Z0-9_]*))?(?:\s*\(([^)]*)\))?\s*;?"#,
        )
        .expect("invalid regex")
    })
}

fn data_path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?i)DATA_PATH\s+['"]([^'"]+)['"]"#).expect("invalid regex")
    })
}

/// A parsed lake connection string.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LakeAttach {
    /// The text as found in the document
    pub source: String,
    pub has_attach: bool,
    pub dsn: String,
    pub name: Option<String>,
    pub data_path: Option<String>,
    /// Raw parameter list between the trailing parentheses
    pub params: Option<String>,
}

impl LakeAttach {
    /// Parse a full connection string; `None` when it is not in lake form.
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return None;
        }
        let caps = main_pattern().captures(trimmed)?;
        let params = caps.get(4).map(|m| m.as_str().to_string());
        Some(Self {
            source: trimmed.to_string(),
            has_attach: caps.get(1).is_some(),
            dsn: caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
            name: caps.get(3).map(|m| m.as_str().to_string()),
            data_path: params.as_deref().and_then(extract_data_path),
            params,
        })
    }

    pub fn is_lake(input: &str) -> bool {
        main_pattern().is_match(input.trim())
    }

    /// Name the catalog is attached as, `ducklake` when not given.
    pub fn catalog(&self) -> &str {
        self.name.as_deref().unwrap_or("ducklake")
    }

    /// The ATTACH statement to issue: the original text when it already was one.
    pub fn attach_sql(&self) -> String {
        if self.has_attach {
            return self.source.trim_end_matches(';').to_string();
        }
        let mut sql = format!("ATTACH 'ducklake:{}' AS {}", self.dsn, self.catalog());
        if let Some(params) = &self.params {
            sql.push_str(&format!(" ({params})"));
        }
        sql
    }
}

fn extract_data_path(params: &str) -> Option<String> {
    data_path_pattern()
        .captures(params)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Find every lake occurrence inside a larger text.
pub fn find_occurrences(text: &str) -> Vec<LakeAttach> {
    scan_pattern()
        .captures_iter(text)
        .map(|caps| {
            let full = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            let dsn = full
                .split_once(':')
                .map(|(_, rest)| rest)
                .unwrap_or(full)
                .to_string();
            let params = caps.get(4).map(|m| m.as_str().to_string());
            LakeAttach {
                source: caps
                    .get(0)
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default(),
                has_attach: caps.get(1).is_some(),
                dsn,
                name: caps.get(3).map(|m| m.as_str().to_string()),
                data_path: params.as_deref().and_then(extract_data_path),
                params,
            }
        })
        .collect()
}

/// Distinct lake strings in order of appearance.
pub fn find_lake_strings(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for occ in find_occurrences(text) {
        if !seen.contains(&occ.source) {
            seen.push(occ.source);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_attach_form() {
        let lake = LakeAttach::parse(
            "ATTACH 'ducklake:postgres:dbname=lake' AS my_lake (DATA_PATH 's3://bucket/lake/')",
        )
        .unwrap();

        assert!(lake.has_attach);
        assert_eq!(lake.dsn, "postgres:dbname=lake");
        assert_eq!(lake.name.as_deref(), Some("my_lake"));
        assert_eq!(lake.data_path.as_deref(), Some("s3://bucket/lake/"));
    }

    #[test]
    fn builds_attach_for_bare_form() {
        let lake = LakeAttach::parse("ducklake:metadata.ducklake").unwrap();

        assert!(!lake.has_attach);
        assert_eq!(
            lake.attach_sql(),
            "ATTACH 'ducklake:metadata.ducklake' AS ducklake"
        );
    }

    #[test]
    fn plain_connections_are_not_lakes() {
        assert!(!LakeAttach::is_lake("duckdb:database/app.duckdb"));
        assert!(!LakeAttach::is_lake("sqlite3:database/app.db"));
    }

    #[test]
    fn scans_documents() {
        let text = "connection: \"ducklake:cat.ducklake\"\nother: 'ducklake:cat.ducklake'\n";
        assert_eq!(find_lake_strings(text).len(), 2);
        assert!(find_occurrences(text).iter().all(|o| o.dsn == "cat.ducklake"));
    }
}
