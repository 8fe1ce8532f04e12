//! Date tokens inside SQL and paths.
//!
//! Formats are written with `YYYY`/`AAAA`, `YY`/`AA`, `MM`, `DD`, `HH`, `mm`, `SS` and
//! `STAMP`/`TSTAMP`, either inside braces (`'{YYYY-MM-DD}'`, `{YYYYMM}`) or as bare
//! compact patterns such as `YYYYMMDD` in table and file names.

use std::sync::OnceLock;

use chrono::format::{Item, StrftimeItems};
use chrono::{Datelike, Months, NaiveDate, NaiveDateTime};
use regex::{NoExpand, Regex};

static EQUALITY_REGEX: OnceLock<Regex> = OnceLock::new();
static QUOTED_FORMAT_REGEX: OnceLock<Regex> = OnceLock::new();
static ANY_FORMAT_REGEX: OnceLock<Regex> = OnceLock::new();
static COMPACT_REGEX: OnceLock<Regex> = OnceLock::new();
static EQUALS_REGEX: OnceLock<Regex> = OnceLock::new();
static FILE_DATE_REGEXES: OnceLock<[Regex; 3]> = OnceLock::new();

const TOKENS: [(&str, &str); 10] = [
    ("YYYY", "%Y"),
    ("AAAA", "%Y"),
    ("YY", "%y"),
    ("AA", "%y"),
    ("MM", "%m"),
    ("DD", "%d"),
    ("HH", "%H"),
    ("mm", "%M"),
    ("SS", "%S"),
    ("TSTAMP", "%Y%m%d%H%M%S"),
];

/// Translate a date format into a strftime pattern.
///
/// Returns `None` when the format holds no date token.
pub fn date_format_to_strftime(format: &str) -> Option<String> {
    let escaped = format.replace('%', "%%");
    let mut out = escaped.clone();
    for (token, spec) in TOKENS {
        out = out.replace(token, spec);
    }
    out = out.replace("STAMP", "%Y%m%d%H%M%S");
    (out != escaped).then_some(out)
}

/// Format `date` with a token format, `None` when the format is not a date format.
pub fn format_date(date: &NaiveDateTime, format: &str) -> Option<String> {
    let pattern = date_format_to_strftime(format)?;
    let items: Vec<Item<'_>> = StrftimeItems::new(&pattern).collect();
    if items.iter().any(|i| matches!(i, Item::Error)) {
        return None;
    }
    Some(date.format_with_items(items.into_iter()).to_string())
}

fn strip_format(token: &str) -> &str {
    token
        .trim_matches('\'')
        .trim_start_matches('{')
        .trim_end_matches('}')
}

fn equality_regex() -> &'static Regex {
    EQUALITY_REGEX.get_or_init(|| {
        Regex::new(r#"(["]?\w+["]?\.\w+\s?=\s?'\{.*?\}'|["]?\w+["]?\s?=\s?'\{.*?\}')"#)
            .expect("invalid regex")
    })
}

fn quoted_format_regex() -> &'static Regex {
    QUOTED_FORMAT_REGEX.get_or_init(|| Regex::new(r"'\{.*?\}'").expect("invalid regex"))
}

fn any_format_regex() -> &'static Regex {
    ANY_FORMAT_REGEX.get_or_init(|| Regex::new(r"'?\{.*?\}'?").expect("invalid regex"))
}

fn compact_regex() -> &'static Regex {
    COMPACT_REGEX.get_or_init(|| {
        Regex::new(
            r"YYYY.?MM.?DD|AAAA.?MM.?DD|YY.?MM.?DD|AA.?MM.?DD|YYYY.?MM|AAAA.?MM|YY.?MM|AA.?MM|MM.?DD|DD.?MM.?YYYY|DD.?MM.?AAAA|DD.?MM.?YY|DD.?MM.?AA",
        )
        .expect("invalid regex")
    })
}

fn equals_regex() -> &'static Regex {
    EQUALS_REGEX.get_or_init(|| Regex::new(r"\s?=\s?").expect("invalid regex"))
}

fn distinct(matches: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for m in matches {
        if !out.contains(&m) {
            out.push(m);
        }
    }
    out
}

/// Replace date tokens in `query` with the reference dates.
///
/// A quoted equality such as `dt = '{YYYY-MM-DD}'` becomes `dt IN (d1,d2)` when more than
/// one date is given; every other token uses the first date. Bare compact patterns are
/// only replaced when `compact` is set.
pub fn replace_dates(query: &str, dates: &[NaiveDateTime], compact: bool) -> String {
    let Some(first) = dates.first() else {
        return query.to_string();
    };
    let mut query = query.to_string();

    let equalities = distinct(
        equality_regex()
            .find_iter(&query)
            .map(|m| m.as_str().to_string()),
    );
    for m in equalities {
        let Some(token) = quoted_format_regex().find(&m).map(|t| t.as_str().to_string()) else {
            continue;
        };
        let format = strip_format(&token);
        if date_format_to_strftime(format).is_none() {
            continue;
        }
        let rendered = if dates.len() > 1 {
            let list = dates
                .iter()
                .filter_map(|d| format_date(d, format))
                .collect::<Vec<_>>()
                .join(",");
            let with_list = m.replacen(&token, &format!("({list})"), 1);
            equals_regex()
                .replacen(&with_list, 1, NoExpand(" IN "))
                .into_owned()
        } else {
            match format_date(first, format) {
                Some(value) => m.replacen(&token, &format!("'{value}'"), 1),
                None => continue,
            }
        };
        query = query.replace(&m, &rendered);
    }

    let remaining = distinct(
        any_format_regex()
            .find_iter(&query)
            .map(|m| m.as_str().to_string()),
    );
    for m in remaining {
        if m.to_lowercase().contains("driver") {
            continue;
        }
        let Some(value) = format_date(first, strip_format(&m)) else {
            continue;
        };
        let open = if m.starts_with('\'') { "'" } else { "" };
        let close = if m.len() > 1 && m.ends_with('\'') { "'" } else { "" };
        query = query.replace(&m, &format!("{open}{value}{close}"));
    }

    if !compact {
        return query;
    }

    compact_regex()
        .replace_all(&query, |caps: &regex::Captures<'_>| {
            let m = &caps[0];
            format_date(first, m).unwrap_or_else(|| m.to_string())
        })
        .into_owned()
}

fn last_day_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1)
        .and_then(|first| first.checked_add_months(Months::new(1)))
        .and_then(|next| next.pred_opt())
        .unwrap_or(date)
}

/// Reference date carried by a file name: `YYYYMMDD`, else the month end of `YYYYMM` or `YYMM`.
pub fn reference_from_filename(name: &str) -> Option<NaiveDate> {
    let [eight, six, four] = FILE_DATE_REGEXES.get_or_init(|| {
        [
            Regex::new(r"\d{8}").expect("invalid regex"),
            Regex::new(r"\d{6}").expect("invalid regex"),
            Regex::new(r"\d{4}").expect("invalid regex"),
        ]
    });

    if let Some(m) = eight.find(name) {
        return NaiveDate::parse_from_str(m.as_str(), "%Y%m%d").ok();
    }
    if let Some(m) = six.find(name) {
        return NaiveDate::parse_from_str(&format!("{}01", m.as_str()), "%Y%m%d")
            .ok()
            .map(last_day_of_month);
    }
    if let Some(m) = four.find(name) {
        return NaiveDate::parse_from_str(&format!("{}01", m.as_str()), "%y%m%d")
            .ok()
            .map(last_day_of_month);
    }
    None
}
