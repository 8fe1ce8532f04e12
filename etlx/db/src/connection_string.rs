//! Splitting of `driver:dsn` connection strings and driver specific DSN rewriting.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use url::Url;

use crate::error::DbError;
use crate::lake::LakeAttach;
use crate::Result;

/// Directory holding embedded databases referenced by short name.
pub const EMBEDDED_DIR: &str = "database";

/// What a connection string points at.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionTarget {
    /// The lake attach form, served by the embedded analytic engine
    Lake(LakeAttach),
    /// A plain `driver:dsn` pair; `driver` is empty when the string has no prefix
    Driver { driver: String, dsn: String },
}

impl ConnectionTarget {
    pub fn driver(&self) -> &str {
        match self {
            ConnectionTarget::Lake(_) => "ducklake",
            ConnectionTarget::Driver { driver, .. } => driver,
        }
    }
}

/// Parse a connection string. Lake strings are detected first, otherwise the
/// text is split on the first `:`.
pub fn parse_connection(conn: &str) -> ConnectionTarget {
    let conn = conn.trim();
    if let Some(lake) = LakeAttach::parse(conn) {
        return ConnectionTarget::Lake(lake);
    }
    match conn.split_once(':') {
        Some((driver, dsn)) => ConnectionTarget::Driver {
            driver: driver.trim().to_lowercase(),
            dsn: dsn.trim().to_string(),
        },
        None => ConnectionTarget::Driver {
            driver: String::new(),
            dsn: conn.to_string(),
        },
    }
}

/// Whether `dsn` is an in-memory database for embedded drivers.
pub fn is_memory(dsn: &str) -> bool {
    let dsn = dsn.trim();
    dsn.is_empty() || dsn == ":memory:" || dsn == "memory"
}

/// Resolve the file backing an embedded database.
///
/// Short names without a directory land in `database/`: `name` becomes
/// `database/name.<ext>` and `name.ext` becomes `database/name.ext`.
/// Anything with a path separator is used verbatim. `None` means in memory.
pub fn embedded_path(dsn: &str, default_ext: &str) -> Option<PathBuf> {
    if is_memory(dsn) {
        return None;
    }
    let dsn = dsn.split('?').next().unwrap_or(dsn);
    if dsn.contains('/') || dsn.contains('\\') {
        return Some(PathBuf::from(dsn));
    }
    let file = if Path::new(dsn).extension().is_some() {
        dsn.to_string()
    } else {
        format!("{dsn}.{default_ext}")
    };
    Some(Path::new(EMBEDDED_DIR).join(file))
}

/// Create the parent directory of an embedded database file.
pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn kv_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\w+)=(\S+)").expect("invalid regex"))
}

fn mysql_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:([^:@/]*)(?::([^@]*))?@)?(?:\w+\(([^)]*)\))?/([^?]*)(?:\?(.*))?$")
            .expect("invalid regex")
    })
}

/// Turn a postgres DSN into a URL. URLs pass through, key/value strings
/// (`host=.. port=.. user=.. password=.. dbname=..`) are converted.
pub fn postgres_url(dsn: &str) -> Result<String> {
    let dsn = dsn.trim();
    if dsn.starts_with("postgres://") || dsn.starts_with("postgresql://") {
        return Ok(dsn.to_string());
    }

    let mut url = Url::parse("postgres://localhost")
        .map_err(|e| DbError::InvalidConnection(e.to_string()))?;
    let invalid = |field: &str| DbError::InvalidConnection(format!("postgres {field}"));

    for caps in kv_pattern().captures_iter(dsn) {
        let value = caps[2].trim_matches('\'');
        match &caps[1] {
            "host" => url.set_host(Some(value)).map_err(|_| invalid("host"))?,
            "port" => {
                let port = value.parse().map_err(|_| invalid("port"))?;
                url.set_port(Some(port)).map_err(|_| invalid("port"))?;
            }
            "user" => url.set_username(value).map_err(|_| invalid("user"))?,
            "password" => url.set_password(Some(value)).map_err(|_| invalid("password"))?,
            "dbname" => url.set_path(value),
            key => {
                url.query_pairs_mut().append_pair(key, value);
            }
        }
    }
    Ok(url.to_string())
}

/// Turn a `user:pass@tcp(host:port)/db?params` DSN into a URL.
pub fn mysql_url(dsn: &str) -> Result<String> {
    let dsn = dsn.trim();
    if dsn.starts_with("mysql://") {
        return Ok(dsn.to_string());
    }
    let caps = mysql_pattern()
        .captures(dsn)
        .ok_or_else(|| DbError::InvalidConnection("mysql dsn".into()))?;

    let mut url = String::from("mysql://");
    if let Some(user) = caps.get(1).filter(|m| !m.as_str().is_empty()) {
        url.push_str(user.as_str());
        if let Some(pass) = caps.get(2) {
            url.push(':');
            url.push_str(pass.as_str());
        }
        url.push('@');
    }
    url.push_str(caps.get(3).map(|m| m.as_str()).unwrap_or("localhost:3306"));
    url.push('/');
    url.push_str(&caps[4]);
    if let Some(params) = caps.get(5).filter(|m| !m.as_str().is_empty()) {
        url.push('?');
        url.push_str(params.as_str());
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn splits_on_first_colon() {
        assert_eq!(
            parse_connection("postgres:host=db user=etl"),
            ConnectionTarget::Driver {
                driver: "postgres".into(),
                dsn: "host=db user=etl".into()
            }
        );
        assert_eq!(parse_connection("duckdb:").driver(), "duckdb");
        assert_eq!(parse_connection("no-driver").driver(), "");
    }

    #[test]
    fn detects_lakes_first() {
        let target = parse_connection("ducklake:sqlite:meta.sqlite");
        assert!(matches!(target, ConnectionTarget::Lake(_)));
        assert_eq!(target.driver(), "ducklake");
    }

    #[rstest]
    #[case("", None)]
    #[case(":memory:", None)]
    #[case("app", Some("database/app.duckdb"))]
    #[case("app.ddb", Some("database/app.ddb"))]
    #[case("data/app.duckdb", Some("data/app.duckdb"))]
    fn embedded_paths(#[case] dsn: &str, #[case] expected: Option<&str>) {
        assert_eq!(embedded_path(dsn, "duckdb"), expected.map(PathBuf::from));
    }

    #[test]
    fn postgres_key_values() {
        let url =
            postgres_url("host=db port=5433 user=etl password=secret dbname=dw sslmode=disable")
                .unwrap();
        assert_eq!(url, "postgres://etl:secret@db:5433/dw?sslmode=disable");
        assert_eq!(
            postgres_url("postgres://u@h/db").unwrap(),
            "postgres://u@h/db"
        );
    }

    #[test]
    fn mysql_go_style() {
        assert_eq!(
            mysql_url("root:pw@tcp(127.0.0.1:3306)/dw?parseTime=true").unwrap(),
            "mysql://root:pw@127.0.0.1:3306/dw?parseTime=true"
        );
    }
}
