//! Rendering of notification bodies and text exports with minijinja.

use miette::Diagnostic;
use minijinja::{AutoEscape, Environment};
use serde::Serialize;

#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum TemplateError {
    #[error("failed to render template '{name}'")]
    #[diagnostic(
        code(etlx::template::render),
        help("Templates use Jinja syntax; query results are available under their item key")
    )]
    Render {
        name: String,
        #[source]
        source: minijinja::Error,
    },

    #[error("template file not found: '{file_path}'")]
    #[diagnostic(code(etlx::template::file_not_found))]
    NotFound {
        #[source]
        source: std::io::Error,
        file_path: String,
    },
}

/// Render `template` against `data`. HTML output escapes interpolated values.
pub fn render<S: Serialize>(
    name: &str,
    template: &str,
    data: &S,
    html: bool,
) -> Result<String, TemplateError> {
    let mut env = Environment::new();
    env.set_auto_escape_callback(move |_| if html { AutoEscape::Html } else { AutoEscape::None });

    env.render_str(template, data)
        .map_err(|source| TemplateError::Render {
            name: name.to_string(),
            source,
        })
}

/// Template text from a file when `source` names an existing one, the text itself otherwise.
pub fn load(source: &str) -> Result<String, TemplateError> {
    let path = std::path::Path::new(source);
    if source.lines().count() > 1 || !path.is_file() {
        return Ok(source.to_string());
    }
    std::fs::read_to_string(path).map_err(|source_err| TemplateError::NotFound {
        source: source_err,
        file_path: source.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_query_results() {
        let data = json!({"sales": {"success": true, "data": [{"total": 3}]}});
        let out = render("body", "Total: {{ sales.data[0].total }}", &data, false).unwrap();
        assert_eq!(out, "Total: 3");
    }

    #[test]
    fn html_bodies_escape_values() {
        let data = json!({"name": "<b>"});
        let out = render("body", "<p>{{ name }}</p>", &data, true).unwrap();
        assert_eq!(out, "<p>&lt;b&gt;</p>");
    }

    #[test]
    fn syntax_errors_are_reported() {
        let err = render("broken", "{% if %}", &json!({}), false).unwrap_err();
        assert!(matches!(err, TemplateError::Render { .. }));
    }

    #[test]
    fn load_reads_files_or_returns_inline_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body.html");
        std::fs::write(&path, "<p>hi</p>").unwrap();

        assert_eq!(load(path.to_str().unwrap()).unwrap(), "<p>hi</p>");
        assert_eq!(load("<p>inline</p>").unwrap(), "<p>inline</p>");
    }
}
