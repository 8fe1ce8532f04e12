//! Notebook (`.ipynb`) flattening into Markdown.

use serde::Deserialize;

use super::error::ConfigError;

#[derive(Debug, Deserialize)]
struct Notebook {
    #[serde(default)]
    cells: Vec<Cell>,
}

#[derive(Debug, Deserialize)]
struct Cell {
    cell_type: String,
    #[serde(default)]
    source: Source,
}

/// Cell sources are either a list of lines or a single string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Source {
    Lines(Vec<String>),
    Text(String),
}

impl Default for Source {
    fn default() -> Self {
        Source::Lines(Vec::new())
    }
}

impl Source {
    fn joined(&self) -> String {
        match self {
            Source::Lines(lines) => lines.concat(),
            Source::Text(text) => text.clone(),
        }
    }
}

/// Markdown cells are copied as they are, code cells are wrapped in an untagged fence.
pub fn notebook_to_markdown(json: &str) -> Result<String, ConfigError> {
    let notebook: Notebook = serde_json::from_str(json).map_err(ConfigError::Notebook)?;
    let mut md = String::new();

    for cell in &notebook.cells {
        let source = cell.source.joined();
        if source.is_empty() {
            continue;
        }
        match cell.cell_type.as_str() {
            "markdown" => {
                md.push_str(&source);
                md.push_str("\n\n");
            }
            "code" => {
                md.push_str("```\n");
                md.push_str(&source);
                if !source.ends_with('\n') {
                    md.push('\n');
                }
                md.push_str("```\n\n");
            }
            _ => {}
        }
    }

    Ok(md)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_cells() {
        let json = r##"{"cells": [
            {"cell_type": "markdown", "source": ["# ETL\n", "\n", "```yaml\n", "connection: \"duckdb:\"\n", "```"]},
            {"cell_type": "code", "source": "print(1)"},
            {"cell_type": "raw", "source": ["ignored"]},
            {"cell_type": "markdown", "source": []}
        ]}"##;
        let md = notebook_to_markdown(json).unwrap();
        assert!(md.starts_with("# ETL\n\n```yaml\n"));
        assert!(md.contains("```\nprint(1)\n```\n\n"));
        assert!(!md.contains("ignored"));
    }

    #[test]
    fn rejects_invalid_json() {
        assert!(matches!(
            notebook_to_markdown("not json"),
            Err(ConfigError::Notebook(_))
        ));
    }
}
