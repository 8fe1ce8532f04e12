//! Token rewriting for SQL strings and paths.
//!
//! Rewriters run in a fixed order: environment values, then file / table / tmp
//! tokens, then dates. Every rewriter leaves text without tokens untouched.

use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::{NoExpand, Regex};

use crate::env::EnvResolver;

pub mod dates;

pub use dates::{date_format_to_strftime, format_date, reference_from_filename, replace_dates};

/// Bound on the passes used to resolve variables whose values hold further tokens
pub const MAX_ENV_PASSES: usize = 3;

/// Disables the bare `YYYYMMDD` style patterns when set to `true`
pub const NO_BRACKETS_ENV: &str = "ETLX_DONT_RPLC_DT_PLCHLDR_NO_CBRCKTS";

static ENV_PREFIXED_REGEX: OnceLock<Regex> = OnceLock::new();
static ENV_DOT_REGEX: OnceLock<Regex> = OnceLock::new();
static ENV_BARE_REGEX: OnceLock<Regex> = OnceLock::new();
static FILE_REGEX: OnceLock<Regex> = OnceLock::new();
static TABLE_REGEX: OnceLock<Regex> = OnceLock::new();
static TMP_REGEX: OnceLock<Regex> = OnceLock::new();

fn env_pass(input: &str, env: &dyn EnvResolver) -> String {
    let prefixed =
        ENV_PREFIXED_REGEX.get_or_init(|| Regex::new(r"@ENV\.(\w+)").expect("invalid regex"));
    let dot = ENV_DOT_REGEX.get_or_init(|| Regex::new(r"@\.(\w+)").expect("invalid regex"));
    let bare = ENV_BARE_REGEX.get_or_init(|| Regex::new(r"@(\w+)").expect("invalid regex"));

    // unknown names collapse to the bare name for the explicit forms
    for regex in [prefixed, dot] {
        if regex.is_match(input) {
            return regex
                .replace_all(input, |caps: &regex::Captures<'_>| {
                    env.non_empty(&caps[1]).unwrap_or_else(|| caps[1].to_string())
                })
                .into_owned();
        }
    }

    bare.replace_all(input, |caps: &regex::Captures<'_>| {
        env.non_empty(&caps[1]).unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

/// Replace `@ENV.NAME`, `@.NAME` and `@NAME` tokens with environment values.
///
/// `@ENV.NAME` and `@.NAME` fall back to `NAME`, an unknown `@NAME` is kept.
pub fn replace_env(input: &str, env: &dyn EnvResolver) -> String {
    let mut current = input.to_string();
    for _ in 0..MAX_ENV_PASSES {
        let next = env_pass(&current, env);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn file_regex() -> &'static Regex {
    FILE_REGEX.get_or_init(|| {
        Regex::new(
            r"<file>|<filename>|<fname>|<file_name>|<path>|<filepath>|<file_path>|\{file\}|\{filename\}|\{fname\}|\{file_name\}|\{path\}|\{filepath\}|\{file_path\}",
        )
        .expect("invalid regex")
    })
}

fn table_regex() -> &'static Regex {
    TABLE_REGEX.get_or_init(|| {
        Regex::new(r"<table>|<table_name>|<tablename>|\{table\}|\{table_name\}|\{tablename\}")
            .expect("invalid regex")
    })
}

fn tmp_regex() -> &'static Regex {
    TMP_REGEX.get_or_init(|| {
        Regex::new(r"<tmp_path>|<tmp>|\{tmp_path\}|\{tmp\}").expect("invalid regex")
    })
}

pub fn replace_file(input: &str, file: &str) -> String {
    file_regex().replace_all(input, NoExpand(file)).into_owned()
}

pub fn replace_table(input: &str, table: &str) -> String {
    table_regex().replace_all(input, NoExpand(table)).into_owned()
}

pub fn replace_tmp(input: &str, tmp: &str) -> String {
    tmp_regex().replace_all(input, NoExpand(tmp)).into_owned()
}

/// The substitution context of one query.
#[derive(Debug, Clone, Copy)]
pub struct Placeholders<'a> {
    env: &'a dyn EnvResolver,
    dates: &'a [NaiveDateTime],
    table: Option<&'a str>,
    file: Option<&'a str>,
    tmp: Option<&'a str>,
}

impl<'a> Placeholders<'a> {
    pub fn new(env: &'a dyn EnvResolver, dates: &'a [NaiveDateTime]) -> Self {
        Self {
            env,
            dates,
            table: None,
            file: None,
            tmp: None,
        }
    }

    pub fn table(mut self, table: Option<&'a str>) -> Self {
        self.table = table.filter(|t| !t.is_empty());
        self
    }

    pub fn file(mut self, file: Option<&'a str>) -> Self {
        self.file = file.filter(|f| !f.is_empty());
        self
    }

    pub fn tmp(mut self, tmp: Option<&'a str>) -> Self {
        self.tmp = tmp.filter(|t| !t.is_empty());
        self
    }

    pub fn dates(&self) -> &'a [NaiveDateTime] {
        self.dates
    }

    pub fn env(&self) -> &'a dyn EnvResolver {
        self.env
    }

    /// Run every rewriter over `input`.
    pub fn apply(&self, input: &str) -> String {
        let mut out = replace_env(input, self.env);
        if let Some(file) = self.file {
            out = replace_file(&out, file);
        }
        if let Some(table) = self.table {
            out = replace_table(&out, table);
        }
        if let Some(tmp) = self.tmp {
            out = replace_tmp(&out, tmp);
        }
        replace_dates(&out, self.dates, !self.env.flag(NO_BRACKETS_ENV))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::MapEnv;
    use chrono::NaiveDate;
    use rstest::rstest;

    fn env() -> MapEnv {
        MapEnv::new()
            .with("DB", "warehouse")
            .with("CHAIN", "@ENV.DB")
            .with("EMPTY", "")
    }

    #[rstest]
    #[case("@ENV.FOO-bar", "FOO-bar")]
    #[case("ATTACH '@ENV.DB.db'", "ATTACH 'warehouse.db'")]
    #[case("USE @.DB", "USE warehouse")]
    #[case("USE @DB", "USE warehouse")]
    #[case("SELECT @unknown", "SELECT @unknown")]
    #[case("@ENV.CHAIN", "warehouse")]
    #[case("@ENV.EMPTY", "EMPTY")]
    #[case("SELECT 1", "SELECT 1")]
    fn environment_tokens(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(replace_env(input, &env()), expected);
    }

    #[test]
    fn self_referencing_values_stop() {
        let env = MapEnv::new().with("LOOP", "@ENV.LOOP");
        assert_eq!(replace_env("@ENV.LOOP", &env), "@ENV.LOOP");
    }

    #[test]
    fn tokens_with_dollar_signs_are_literal() {
        assert_eq!(replace_table("SELECT * FROM <table>", "t$1"), "SELECT * FROM t$1");
    }

    #[test]
    fn full_pipeline_is_idempotent() {
        let env = env();
        let dates = [NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()];
        let ph = Placeholders::new(&env, &dates)
            .table(Some("sales"))
            .file(Some("<tmp>/<table>_YYYYMMDD.csv"))
            .tmp(Some("/tmp"));

        let sql = "COPY \"<table>\" TO '<fname>' -- @ENV.DB {YYYY}";
        let once = ph.apply(sql);
        assert_eq!(once, "COPY \"sales\" TO '/tmp/sales_20240115.csv' -- warehouse 2024");
        assert_eq!(ph.apply(&once), once);
    }
}
