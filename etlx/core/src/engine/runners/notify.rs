//! `NOTIFY` sections: an email rendered from query results.

use etlx_transport::Mail;
use serde_json::{json, Map, Value as Json};
use tracing::instrument;

use super::exports::data_queries;
use super::{active_section, close, connect, description, item_record};
use crate::config::Node;
use crate::engine::log::LogBook;
use crate::engine::lookup::SqlContext;
use crate::engine::phase::{OnError, Phases};
use crate::engine::Runtime;
use crate::templating;
use crate::Result;

#[instrument(skip_all, fields(key = %key))]
pub async fn run(rt: &Runtime<'_>, key: &str, book: &mut LogBook) -> Result<()> {
    let (section, meta) = active_section(rt, key)?;

    for (item_key, item, item_meta) in rt.items(key, section, book) {
        notify(rt, key, meta, &item_key, item, item_meta, book).await;
    }
    Ok(())
}

#[instrument(skip_all, fields(item = %item_key))]
async fn notify(
    rt: &Runtime<'_>,
    key: &str,
    section_meta: &Node,
    item_key: &str,
    item: &Node,
    meta: &Node,
    book: &mut LogBook,
) {
    let dates = rt.dates_for(Some(meta));
    let reference = Runtime::reference(&dates);

    let conn_record = item_record(key, item_key, "Conn", reference.clone());
    let candidates = [meta.get_str("connection"), section_meta.get_str("connection")];
    let Some(mut db) = connect(rt, book, conn_record, &candidates, Some(meta)).await else {
        return;
    };

    let name = format!("{key}->{item_key}");
    let ctx = rt
        .sql_context(item, &dates)
        .table(meta.get_str("name"))
        .label(&name);
    let mut phases = Phases::new(&mut db, &ctx, book, &name, key)
        .item(item_key)
        .reference(reference);

    phases.before(meta.get_set("before_sql"), &OnError::none()).await;

    if phases
        .condition(meta.get_str("condition"), meta.get_str("condition_msg"))
        .await
    {
        let record = phases.record("").description(description(meta));
        let data = template_data(&mut phases, &ctx, item, meta).await;
        let record = match compose(&ctx, item, meta, &data) {
            Ok(mail) => match rt.transports.mailer.send(&mail).await {
                Ok(()) => record.ok("Notification sent!"),
                Err(e) => record.failed(format!("err sending email: {e}")),
            },
            Err(e) => record.failed(e),
        };
        phases.book().push(record);
    }

    phases.after(meta.get_set("after_sql"), &OnError::none()).await;
    drop(phases);
    close(db).await;
}

/// Metadata `data` merged with `{name: {success, data | msg}}` for each `data_sql` entry.
async fn template_data(
    phases: &mut Phases<'_, '_>,
    ctx: &SqlContext<'_>,
    item: &Node,
    meta: &Node,
) -> Json {
    let mut data = match meta.get("data").map(Node::to_json) {
        Some(Json::Object(map)) => map,
        _ => Map::new(),
    };
    for (name, sql) in data_queries(item, meta.get_set("data_sql")) {
        let result = match phases.db().query_rows(&ctx.resolve(sql)).await {
            Ok(rows) => json!({"success": true, "data": rows}),
            Err(e) => json!({
                "success": false,
                "msg": format!("failed to execute query {name}: {e}"),
                "data": [],
            }),
        };
        data.insert(name, result);
    }
    Json::Object(data)
}

fn compose(ctx: &SqlContext<'_>, item: &Node, meta: &Node, data: &Json) -> std::result::Result<Mail, String> {
    let list = |key: &str| meta.get_set(key).map(Node::string_list).unwrap_or_default();
    let template = meta
        .get_str("body")
        .map(|body| item.get_str(body).unwrap_or(body))
        .unwrap_or_default();
    let body = templating::render("body", template, data, true).map_err(|e| e.to_string())?;

    Ok(Mail {
        to: list("to"),
        cc: list("cc"),
        bcc: list("bcc"),
        subject: ctx.render(meta.get_str("subject").unwrap_or_default()),
        body,
        attachments: list("attachments")
            .iter()
            .map(|a| ctx.render(a).into())
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::env::MapEnv;
    use crate::placeholders::Placeholders;

    const DOC: &str = r#"# NOTIFY

## daily

```yaml
to: [ops@example.com, data@example.com]
cc: boss@example.com
subject: "Sales {YYYY-MM-DD}"
body: daily_body
attachments:
  - /tmp/sales_{YYYYMMDD}.csv
```

```html daily_body
<p>Total: {{ totals.data[0].total }}</p>
```
"#;

    #[test]
    fn mail_is_composed_from_the_item() {
        let config = Config::from_markdown_fragment(DOC, "notify.md").unwrap();
        let item = config.section("NOTIFY").unwrap().get("daily").unwrap();
        let meta = item.metadata().unwrap();
        let env = MapEnv::new();
        let dates = [chrono::NaiveDate::from_ymd_opt(2024, 5, 2)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()];
        let ctx = SqlContext::new(&config, item, Placeholders::new(&env, &dates));
        let data = json!({"totals": {"success": true, "data": [{"total": 42}]}});

        let mail = compose(&ctx, item, meta, &data).unwrap();
        assert_eq!(mail.to, ["ops@example.com", "data@example.com"]);
        assert_eq!(mail.cc, ["boss@example.com"]);
        assert_eq!(mail.subject, "Sales 2024-05-02");
        assert_eq!(mail.body.trim(), "<p>Total: 42</p>");
        assert_eq!(mail.attachments, [std::path::PathBuf::from("/tmp/sales_20240502.csv")]);
    }
}
