//! Log persistence section appended to every document that does not declare one.

/// Heading that marks a document as already carrying its log section
pub const AUTO_LOGS_KEY: &str = "AUTO_LOGS";

const AUTO_LOGS: &str = r#"
# AUTO_LOGS

```yaml metadata
name: LOGS
description: "Logging"
table: logs
connection: "duckdb:"
before_sql:
  - "LOAD Sqlite"
  - "ATTACH '<tmp>/etlx_logs.db' (TYPE SQLITE)"
  - "USE etlx_logs"
  - "LOAD json"
  - "get_dyn_queries[create_missing_columns](ATTACH '<tmp>/etlx_logs.db' (TYPE SQLITE),DETACH etlx_logs)"
save_log_sql: |
  INSERT INTO "etlx_logs"."<table>" BY NAME
  SELECT *
  FROM READ_JSON('<fname>');
save_on_err_patt: '(?i)table.+with.+name.+(\w+).+does.+not.+exist'
save_on_err_sql: |
  CREATE TABLE "etlx_logs"."<table>" AS
  SELECT *
  FROM READ_JSON('<fname>');
after_sql:
  - 'USE memory'
  - 'DETACH "etlx_logs"'
active: true
```

```sql
-- create_missing_columns
WITH source_columns AS (
    SELECT "column_name", "column_type"
    FROM (DESCRIBE SELECT * FROM READ_JSON('<fname>'))
),
destination_columns AS (
    SELECT "column_name", "data_type" as "column_type"
    FROM "duckdb_columns"
    WHERE "table_name" = '<table>'
),
missing_columns AS (
    SELECT "s"."column_name", "s"."column_type"
    FROM source_columns "s"
    LEFT JOIN destination_columns "d" ON "s"."column_name" = "d"."column_name"
    WHERE "d"."column_name" IS NULL
)
SELECT 'ALTER TABLE "etlx_logs"."<table>" ADD COLUMN "' || "column_name" || '" ' || "column_type" || ';' AS "query"
FROM missing_columns
WHERE (SELECT COUNT(*) FROM destination_columns) > 0;
```
"#;

/// Append the `AUTO_LOGS` section unless the document has its own.
pub fn with_auto_logs(markdown: &str) -> String {
    if markdown.contains("# AUTO_LOGS") {
        markdown.to_string()
    } else {
        format!("{markdown}{AUTO_LOGS}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::node::Node;
    use crate::config::parser::parse_markdown;

    #[test]
    fn appended_once() {
        let doc = with_auto_logs("# ETL\n");
        assert!(doc.contains("# AUTO_LOGS"));
        assert_eq!(with_auto_logs(&doc), doc);
    }

    #[test]
    fn section_parses_with_its_dynamic_query() {
        let parsed = parse_markdown(&with_auto_logs(""), "auto_logs").unwrap();
        let logs = Node::Map(parsed.root).get(AUTO_LOGS_KEY).cloned().unwrap();
        let meta = logs.metadata().unwrap();
        assert_eq!(meta.get_str("table"), Some("logs"));
        assert_eq!(meta.get("before_sql").unwrap().as_list().unwrap().len(), 5);
        assert!(logs
            .get_str("create_missing_columns")
            .unwrap()
            .starts_with("WITH source_columns"));
    }
}
