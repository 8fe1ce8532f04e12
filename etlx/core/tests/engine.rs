mod common;

use std::sync::Arc;

use common::*;
use etlx_core::prelude::*;
use etlx_db::{QueryResult, Row, Value};
use etlx_transport::Transports;
use rstest::rstest;
use tracing_test::traced_test;

const ETL_DOC: &str = r#"# ETL

```yaml
connection: "mock:warehouse"
```

## sales

```yaml
table: sales
extract_sql: extract_sales
transform_sql: transform_sales
load_sql: load_sales
load_after_sql: "ANALYZE sales"
```

```sql extract_sales
SELECT * FROM src_sales
```

```sql transform_sales
UPDATE staging SET amount = amount * 100
```

```sql load_sales
INSERT INTO "<table>" SELECT * FROM staging
```

## stock

```yaml
load_sql: "INSERT INTO stock SELECT * FROM src_stock"
```
"#;

fn options() -> RunOptions {
    RunOptions {
        dates: vec![date(2024, 5, 2)],
        ..RunOptions::default()
    }
}

#[tokio::test]
#[traced_test]
async fn etl_steps_run_in_document_order() {
    let tmp = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    let mut engine = engine(ETL_DOC, &driver, tmp.path());

    let outcome = engine.run_all(&options()).await.unwrap();
    assert_eq!(outcome.failures(), 0, "{:?}", outcome.records);

    let extract = driver.position("FROM src_sales").unwrap();
    let transform = driver.position("UPDATE staging").unwrap();
    let load = driver.position(r#"INSERT INTO "sales""#).unwrap();
    let after = driver.position("ANALYZE sales").unwrap();
    let stock = driver.position("FROM src_stock").unwrap();
    assert!(extract < transform && transform < load && load < after && after < stock);

    assert!(record(&outcome, "ETL->sales").success);
    assert!(record(&outcome, "ETL->sales->load:Main").success);
    assert!(record(&outcome, "ETL->stock").success);
    assert_eq!(driver.opened(), driver.closed());
}

#[tokio::test]
async fn steps_option_limits_the_run() {
    let tmp = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    let mut engine = engine(ETL_DOC, &driver, tmp.path());

    let options = RunOptions {
        steps: vec!["load".to_string()],
        ..options()
    };
    let outcome = engine.run_all(&options).await.unwrap();

    assert!(!driver.ran("FROM src_sales"));
    assert!(!driver.ran("UPDATE staging"));
    assert!(driver.ran(r#"INSERT INTO "sales""#));

    let excluded = record(&outcome, "ETL->sales->extract");
    assert!(excluded.success);
    assert_eq!(excluded.msg, "STEP extract Excluded from the process");
    assert_eq!(excluded.item_key.as_deref(), Some("sales"));
    let excluded = outcome
        .records
        .iter()
        .filter(|r| r.msg.ends_with("Excluded from the process"))
        .count();
    assert_eq!(excluded, 4, "extract and transform of both items");
}

#[rstest]
#[case::only(vec!["stock"], vec![], "sales")]
#[case::skip(vec![], vec!["stock"], "stock")]
#[tokio::test]
async fn item_selection(#[case] only: Vec<&str>, #[case] skip: Vec<&str>, #[case] left_out: &str) {
    let tmp = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    let mut engine = engine(ETL_DOC, &driver, tmp.path());

    let options = RunOptions {
        only: only.into_iter().map(String::from).collect(),
        skip: skip.into_iter().map(String::from).collect(),
        ..options()
    };
    let outcome = engine.run_all(&options).await.unwrap();

    let excluded = record(&outcome, &format!("ETL->{left_out}"));
    assert!(excluded.success);
    assert_eq!(excluded.msg, "Excluded");
    assert!(!driver.ran(&format!("FROM src_{left_out}")));
}

#[tokio::test]
#[traced_test]
async fn failed_before_blocks_main_but_not_after() {
    let doc = r#"# ETL

```yaml
connection: "mock:warehouse"
```

## orders

```yaml
load_before_sql: "CREATE TEMP TABLE tmp_orders AS SELECT 1"
load_sql: "INSERT INTO orders SELECT * FROM tmp_orders"
load_after_sql: "DROP TABLE tmp_orders"
```
"#;
    let tmp = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    driver.fails("CREATE TEMP TABLE", "permission denied", 1);
    let mut engine = engine(doc, &driver, tmp.path());

    let outcome = engine.run_all(&options()).await.unwrap();

    assert!(!driver.ran("INSERT INTO orders"));
    assert!(driver.ran("DROP TABLE tmp_orders"));
    let before = record(&outcome, "ETL->orders->load:Before");
    assert!(!before.success);
    assert!(before.msg.contains("permission denied"), "{}", before.msg);
    assert!(!has_record(&outcome, "ETL->orders->load:Main"));
    assert!(!record(&outcome, "ETL->orders").success);
}

#[tokio::test]
async fn errors_matching_the_pattern_run_the_recovery_sql() {
    let doc = r#"# ETL

```yaml
connection: "mock:warehouse"
```

## orders

```yaml
load_sql: "INSERT INTO orders SELECT * FROM staging"
load_on_err_match_patt: "(?i)table.+does not exist"
load_on_err_match_sql: "CREATE TABLE orders AS SELECT * FROM staging"
```
"#;
    let tmp = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    driver.fails("INSERT INTO orders", "Table orders does not exist", 1);
    let mut engine = engine(doc, &driver, tmp.path());

    let outcome = engine.run_all(&options()).await.unwrap();

    let main = record(&outcome, "ETL->orders->load:Main");
    assert!(main.success);
    assert_eq!(main.msg, "recovered through the error handler");
    assert!(driver.ran("CREATE TABLE orders"));
}

#[tokio::test]
async fn violated_validation_suppresses_main() {
    let doc = r#"# ETL

```yaml
connection: "mock:warehouse"
```

## orders

```yaml
load_validation:
  - sql: "SELECT * FROM staging WHERE amount < 0"
    type: throw_if_not_empty
    msg: "negative amounts on {YYYY-MM-DD}"
load_sql: "INSERT INTO orders SELECT * FROM staging"
```
"#;
    let tmp = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    driver.returns_value("amount < 0", "amount", Value::Int(-3));
    let mut engine = engine(doc, &driver, tmp.path());

    let outcome = engine.run_all(&options()).await.unwrap();

    assert!(!driver.ran("INSERT INTO orders"));
    let failed: Vec<&LogRecord> = outcome.records.iter().filter(|r| !r.success).collect();
    assert!(
        failed.iter().any(|r| r.msg == "negative amounts on 2024-05-02"),
        "{failed:?}"
    );
}

#[tokio::test]
async fn first_violated_rule_stops_validation() {
    let doc = r#"# ETL

```yaml
connection: "mock:warehouse"
```

## orders

```yaml
load_validation:
  - sql: "SELECT * FROM staging WHERE amount < 0"
    type: throw_if_not_empty
    msg: "negative amounts"
  - sql: "SELECT * FROM staging WHERE customer IS NULL"
    type: throw_if_not_empty
    msg: "orphan orders"
load_sql: "INSERT INTO orders SELECT * FROM staging"
```
"#;
    let tmp = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    driver.returns_value("amount < 0", "amount", Value::Int(-3));
    driver.returns_value("customer IS NULL", "id", Value::Int(7));
    let mut engine = engine(doc, &driver, tmp.path());

    let outcome = engine.run_all(&options()).await.unwrap();

    assert!(driver.ran("amount < 0"));
    assert!(!driver.ran("customer IS NULL"));
    assert!(!driver.ran("INSERT INTO orders"));
    let valid: Vec<&LogRecord> = outcome
        .records
        .iter()
        .filter(|r| r.name == "ETL->orders->load:Valid")
        .collect();
    assert_eq!(valid.len(), 1, "{valid:?}");
    assert_eq!(valid[0].msg, "negative amounts");
}

#[tokio::test]
async fn csv_extract_runs_leading_statements_before_the_export() {
    let doc = r#"# ETL

```yaml
connection: "mock:warehouse"
```

## orders

```yaml
to_csv: true
extract_sql:
  - "SET search_path TO sales"
  - "SELECT * FROM src_orders"
```
"#;
    let tmp = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    let columns = vec!["id".to_string()];
    let rows = vec![
        Row::from_iter([("id".to_string(), Value::Int(1))]),
        Row::from_iter([("id".to_string(), Value::Int(2))]),
    ];
    driver.returns("FROM src_orders", QueryResult::new(columns, rows));
    let mut engine = engine(doc, &driver, tmp.path());

    let outcome = engine.run_all(&options()).await.unwrap();

    let set = driver.position("SET search_path").expect("leading statement ran");
    let export = driver.position("FROM src_orders").expect("export ran");
    assert!(set < export);

    let main = record(&outcome, "ETL->orders->extract:Main");
    assert!(main.success, "{}", main.msg);
    assert_eq!(main.rows, Some(2));
    let fname = main.fname.as_deref().unwrap();
    assert!(std::path::Path::new(fname).exists());
}

#[tokio::test]
#[traced_test]
async fn failed_dynamic_fetch_leaves_the_phase_running() {
    let doc = r#"# ETL

```yaml
connection: "mock:warehouse"
```

## orders

```yaml
load_before_sql:
  - "get_dyn_queries[new_columns]"
  - "CREATE TEMP TABLE tmp_orders AS SELECT 1"
load_sql: "INSERT INTO orders SELECT * FROM tmp_orders"
```

```sql new_columns
SELECT 'ALTER TABLE orders ADD COLUMN ' || name AS query FROM pending_columns
```
"#;
    let tmp = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    driver.fails("pending_columns", "no such table: pending_columns", 1);
    let mut engine = engine(doc, &driver, tmp.path());

    let outcome = engine.run_all(&options()).await.unwrap();

    assert!(logs_contain("failed to fetch the queries"));
    assert!(driver.ran("pending_columns"));
    assert!(!driver.ran("ALTER TABLE orders"));
    assert!(driver.ran("CREATE TEMP TABLE tmp_orders"));
    assert!(record(&outcome, "ETL->orders->load:Before").success);
    assert!(record(&outcome, "ETL->orders->load:Main").success);
}

#[rstest]
#[case::met(true, true)]
#[case::not_met(false, false)]
#[tokio::test]
async fn condition_gates_main(#[case] flag: bool, #[case] runs: bool) {
    let doc = r#"# ETL

```yaml
connection: "mock:warehouse"
```

## orders

```yaml
load_condition: "SELECT has_rows FROM source_ready"
load_condition_msg: "source not ready"
load_sql: "INSERT INTO orders SELECT * FROM staging"
```
"#;
    let tmp = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    driver.returns_value("source_ready", "has_rows", Value::Bool(flag));
    let mut engine = engine(doc, &driver, tmp.path());

    let outcome = engine.run_all(&options()).await.unwrap();

    assert_eq!(driver.ran("INSERT INTO orders"), runs);
    let cond = record(&outcome, "ETL->orders->load:Cond");
    assert_eq!(cond.success, flag);
    if !flag {
        assert_eq!(cond.msg, "failed source not ready");
    }
}

#[tokio::test]
async fn deactivated_sections_are_recorded_and_skipped() {
    let doc = r#"# ETL

```yaml
connection: "mock:warehouse"
active: false
```

## orders

```yaml
load_sql: "INSERT INTO orders SELECT 1"
```
"#;
    let tmp = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    let mut engine = engine(doc, &driver, tmp.path());

    let outcome = engine.run_all(&options()).await.unwrap();

    assert_eq!(record(&outcome, "ETL").msg, "Deactivated");
    assert!(driver.statements().is_empty());
}

#[tokio::test]
async fn connection_failures_are_records() {
    let doc = r#"# ETL

```yaml
connection: "nosuchdriver:somewhere"
```

## orders

```yaml
load_sql: "INSERT INTO orders SELECT 1"
```
"#;
    let tmp = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    let mut engine = engine(doc, &driver, tmp.path());

    let outcome = engine.run_all(&options()).await.unwrap();

    let conn = record(&outcome, "ETL->orders->load:Conn");
    assert!(!conn.success);
    assert!(conn.msg.starts_with("connecting to nosuchdriver"), "{}", conn.msg);
    assert!(!record(&outcome, "ETL->orders").success);
}

#[tokio::test]
async fn multi_queries_rows_are_returned() {
    let doc = r#"# MULTI_QUERIES

```yaml
connection: "mock:warehouse"
```

## north

```yaml
query: "SELECT 'north' AS region"
```

## south

```yaml
query: "SELECT 'south' AS region"
```
"#;
    let tmp = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    let rows = ["north", "south"]
        .into_iter()
        .map(|r| Row::from_iter([("region".to_string(), Value::Text(r.to_string()))]))
        .collect();
    driver.returns("UNION", QueryResult::new(vec!["region".to_string()], rows));
    let mut engine = engine(doc, &driver, tmp.path());

    let outcome = engine.run_all(&options()).await.unwrap();

    let joined = &driver.statements()[0];
    assert_eq!(joined, "SELECT 'north' AS region\nUNION\nSELECT 'south' AS region\n");
    let rows = &outcome.data["MULTI_QUERIES"];
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1]["region"], Value::Text("south".to_string()));
    assert_eq!(record(&outcome, "MULTI_QUERIES:Main").rows, Some(2));
}

#[tokio::test]
async fn required_fragments_join_the_run() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
        tmp.path().join("late.md"),
        r#"# LATE_LOADS

```yaml
runs_as: ETL
connection: "mock:warehouse"
```

## late

```yaml
load_sql: "INSERT INTO late SELECT 1"
```
"#,
    )
    .unwrap();
    let doc = format!(
        "# REQUIRES\n\n```yaml\npath: {}\n```\n\n## late\n\n```yaml\npath: late.md\n```\n",
        tmp.path().display()
    );
    let driver = MockDriver::new();
    let mut engine = engine(&doc, &driver, tmp.path());

    let outcome = engine.run_all(&options()).await.unwrap();

    assert_eq!(record(&outcome, "REQUIRES->late").msg, "Successfully loaded!");
    assert!(engine.config().contains("LATE_LOADS"));
    assert!(driver.ran("INSERT INTO late"));
    assert!(record(&outcome, "LATE_LOADS->late").success);
}

#[tokio::test]
async fn logs_run_last_with_every_record() {
    let doc = r#"# LOGS

```yaml
connection: "mock:warehouse"
table: etl_logs
save_log_sql: "INSERT INTO <table> SELECT * FROM read_json('<fname>')"
```

# ETL

```yaml
connection: "mock:warehouse"
```

## orders

```yaml
load_sql: "INSERT INTO orders SELECT 1"
```
"#;
    let tmp = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    let mut engine = engine(doc, &driver, tmp.path());

    let outcome = engine.run_all(&options()).await.unwrap();
    assert_eq!(outcome.failures(), 0, "{:?}", outcome.records);

    let statements = driver.statements();
    let save = statements.last().unwrap();
    assert!(save.starts_with("INSERT INTO etl_logs"), "{save}");
    assert!(driver.position("INSERT INTO orders") < driver.position("etl_logs"));

    let path = save
        .split('\'')
        .nth(1)
        .expect("the json path is quoted");
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    let names: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|r| r["name"].as_str())
        .collect();
    assert!(names.contains(&"ETL->orders"), "{names:?}");
}

#[tokio::test]
async fn notifications_render_query_data() {
    let doc = r#"# NOTIFY

```yaml
connection: "mock:warehouse"
```

## daily

```yaml
to: ["ops@example.com"]
subject: "Sales {YYYY-MM-DD}"
body: body_html
data_sql:
  - regions
```

```sql regions
SELECT region FROM sales_by_region
```

```html body_html
{% for r in regions.data %}<li>{{ r.region }}</li>{% endfor %}
```
"#;
    let tmp = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    driver.returns_value("sales_by_region", "region", Value::Text("north".to_string()));
    let mailer = Arc::new(RecordingMailer::default());
    let transports = Transports::unsupported().with_mailer(mailer.clone());
    let mut engine = engine_with(doc, &driver, tmp.path(), transports);

    let outcome = engine.run_all(&options()).await.unwrap();

    assert_eq!(record(&outcome, "NOTIFY->daily").msg, "Notification sent!");
    let sent = mailer.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec!["ops@example.com".to_string()]);
    assert_eq!(sent[0].subject, "Sales 2024-05-02");
    assert!(sent[0].body.contains("<li>north</li>"), "{}", sent[0].body);
}

#[tokio::test]
async fn run_section_reports_unknown_sections() {
    let tmp = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    let mut engine = engine(ETL_DOC, &driver, tmp.path());

    assert!(engine.run_section("NOPE", &options()).await.is_err());

    let outcome = engine.run_section("ETL", &options()).await.unwrap();
    assert!(record(&outcome, "ETL->stock").success);
}
