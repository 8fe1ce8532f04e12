//! `ACTIONS` sections: file, transfer and copy operations named by `type`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use etlx_transport::{local, FtpParams, HttpParams, S3Params, SftpParams};
use tracing::{debug, instrument};

use super::{active_section, db2db, description, item_record, section_path};
use crate::config::{ConfigError, Node};
use crate::engine::log::LogBook;
use crate::engine::Runtime;
use crate::Result;

#[instrument(skip_all, fields(key = %key))]
pub async fn run(rt: &Runtime<'_>, key: &str, book: &mut LogBook) -> Result<()> {
    let (section, meta) = active_section(rt, key)?;
    let main_path = section_path(rt, meta, &rt.options.dates)?;

    for (item_key, item, item_meta) in rt.items(key, section, book) {
        let dates = rt.dates_for(Some(item_meta));
        let record = item_record(key, &item_key, "", Runtime::reference(&dates))
            .description(description(item_meta));

        let Some(kind) = item_meta.get_str("type") else {
            book.push(record.failed("Missing Action Type"));
            continue;
        };
        let Some(params) = item_meta.get_set("params").filter(|p| p.is_map()) else {
            book.push(record.failed("Missing Action Params"));
            continue;
        };

        let action = Action {
            rt,
            item,
            params,
            dates: &dates,
            base: main_path.as_deref(),
        };
        let prefix = format!("{key} -> {item_key} -> {kind}");
        book.push(match action.perform(kind).await {
            Ok(Some(msg)) => record.ok(format!("{prefix}: {msg}")),
            Ok(None) => record.failed(format!("{prefix}: Unsupported type")),
            Err(e) => record.failed(format!("{prefix}: {e}")),
        });
    }
    Ok(())
}

struct Action<'r, 'a> {
    rt: &'r Runtime<'a>,
    item: &'a Node,
    params: &'a Node,
    dates: &'r [NaiveDateTime],
    base: Option<&'r Path>,
}

impl Action<'_, '_> {
    /// The success message, `None` for an unknown `type`.
    async fn perform(&self, kind: &str) -> Result<Option<String>> {
        let transports = self.rt.transports;
        let msg = match kind {
            "copy_file" => {
                let bytes = local::copy_file(&self.path("source")?, &self.path("target")?)?;
                debug!("Copied {bytes} bytes");
                "Copy successful".to_string()
            }
            "compress" => self.compress()?,
            "decompress" => self.decompress()?,
            "ftp_upload" => {
                transports.ftp.upload(&self.ftp(true)?).await?;
                "FTP upload successful".to_string()
            }
            "ftp_download" => {
                transports.ftp.download(&self.ftp(false)?).await?;
                "FTP download successful".to_string()
            }
            "sftp_upload" => {
                transports.sftp.upload(&self.sftp(true)?).await?;
                "SFTP upload successful".to_string()
            }
            "sftp_download" => {
                transports.sftp.download(&self.sftp(false)?).await?;
                "SFTP download successful".to_string()
            }
            "http_upload" => {
                let status = transports.http.upload(&self.http()?).await?;
                format!("HTTP upload successful, status {status}")
            }
            "http_download" => {
                let bytes = transports.http.download(&self.http()?).await?;
                format!("HTTP download successful, {bytes} bytes")
            }
            "s3_upload" => {
                transports.s3.upload(&self.s3()?).await?;
                "S3 upload successful".to_string()
            }
            "s3_download" => {
                let bytes = transports.s3.download(&self.s3()?).await?;
                format!("S3 download successful, {bytes} bytes")
            }
            "db_2_db" => {
                let ctx = self.rt.sql_context(self.item, self.dates).label("db_2_db");
                let rows = db2db::transfer(self.rt, &ctx, self.params).await?;
                format!("DB 2 DB successful, {rows} rows")
            }
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }

    fn text(&self, key: &str) -> Option<String> {
        self.params
            .get_set(key)
            .and_then(Node::to_text)
            .map(|v| self.rt.placeholders(self.dates).apply(&v))
    }

    fn required(&self, key: &str) -> Result<String> {
        self.text(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::invalid(key, format!("missing required param: {key}")).into())
    }

    /// A local path param, joined with the section path when relative.
    fn path(&self, key: &str) -> Result<PathBuf> {
        Ok(Runtime::resolve_path(self.base, &self.required(key)?))
    }

    fn optional_path(&self, key: &str) -> Option<PathBuf> {
        self.text(key).map(|p| Runtime::resolve_path(self.base, &p))
    }

    fn port(&self) -> Option<u16> {
        self.params
            .get("port")
            .and_then(|p| p.as_i64().or_else(|| p.as_str().and_then(|s| s.trim().parse().ok())))
            .and_then(|p| u16::try_from(p).ok())
    }

    fn flag(&self, key: &str) -> bool {
        self.params.get_bool(key).unwrap_or_default()
    }

    fn compress(&self) -> Result<String> {
        let compression = self.required("compression")?;
        let files: Vec<PathBuf> = self
            .params
            .get_set("files")
            .map(Node::string_list)
            .unwrap_or_default()
            .iter()
            .map(|f| Runtime::resolve_path(self.base, &self.rt.placeholders(self.dates).apply(f)))
            .collect();
        if files.is_empty() {
            return Err(ConfigError::invalid("files", "compress needs at least one file").into());
        }
        let output = self.path("output")?;

        match compression.as_str() {
            "zip" => {
                local::zip_files(&files, &output)?;
                Ok("ZIP compression successful.".to_string())
            }
            "gz" => {
                let [file] = files.as_slice() else {
                    return Err(ConfigError::invalid(
                        "files",
                        "GZ compression only supports one input file",
                    )
                    .into());
                };
                local::gzip_file(file, &output)?;
                Ok("GZ compression successful.".to_string())
            }
            other => Err(ConfigError::invalid(
                "compression",
                format!("Unsupported compression type {other}"),
            )
            .into()),
        }
    }

    fn decompress(&self) -> Result<String> {
        let compression = self.required("compression")?;
        let input = self.path("input")?;
        let output = self.path("output")?;
        match compression.as_str() {
            "zip" => {
                local::unzip(&input, &output)?;
                Ok("ZIP decompression successful.".to_string())
            }
            "gz" => {
                local::gunzip(&input, &output)?;
                Ok("GZ decompression successful.".to_string())
            }
            other => Err(ConfigError::invalid(
                "compression",
                format!("Unsupported compression type {other}"),
            )
            .into()),
        }
    }

    /// `source` is local on upload and remote on download.
    fn local_remote(&self, upload: bool) -> Result<(PathBuf, String)> {
        if upload {
            Ok((self.path("source")?, self.required("target")?))
        } else {
            Ok((self.path("target")?, self.required("source")?))
        }
    }

    fn user(&self) -> String {
        self.text("user").or_else(|| self.text("username")).unwrap_or_default()
    }

    fn ftp(&self, upload: bool) -> Result<FtpParams> {
        let (local_path, remote_path) = self.local_remote(upload)?;
        Ok(FtpParams {
            host: self.required("host")?,
            port: self.port(),
            user: self.user(),
            password: self.text("password").unwrap_or_default(),
            local_path,
            remote_path,
        })
    }

    fn sftp(&self, upload: bool) -> Result<SftpParams> {
        let (local_path, remote_path) = self.local_remote(upload)?;
        Ok(SftpParams {
            host: self.required("host")?,
            port: self.port(),
            user: self.user(),
            password: self.text("password").unwrap_or_default(),
            host_key: self.path("host_key")?,
            local_path,
            remote_path,
        })
    }

    fn http(&self) -> Result<HttpParams> {
        let headers: BTreeMap<String, String> = self
            .params
            .get("headers")
            .and_then(Node::as_map)
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|(k, v)| {
                        let v = self.rt.placeholders(self.dates).apply(&v.to_text()?);
                        Some((k.clone(), v))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(HttpParams {
            url: self.required("url")?,
            method: self.text("method"),
            headers,
            content_type: self.text("content_type"),
            form_field: self.text("form_field"),
            source: self.optional_path("source"),
            target: self.optional_path("target"),
        })
    }

    fn s3(&self) -> Result<S3Params> {
        Ok(S3Params {
            bucket: self.required("bucket")?,
            key: self.required("key")?,
            region: self.text("region"),
            endpoint: self.text("endpoint"),
            access_key_id: self.text("access_key_id"),
            secret_access_key: self.text("secret_access_key"),
            session_token: self.text("session_token"),
            path_style: self.flag("path_style"),
            allow_http: self.flag("allow_http"),
            source: self.optional_path("source"),
            target: self.optional_path("target"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::RunOptions;
    use crate::env::MapEnv;
    use etlx_db::DriverRegistry;
    use etlx_transport::Transports;

    const DOC: &str = r#"# ACTIONS

```yaml
runs_as: ACTIONS
```

## upload

```yaml
type: sftp_upload
params:
  host: "@SFTP_HOST"
  port: "2222"
  username: etl
  host_key: keys/server.pub
  source: out/sales_{YYYYMMDD}.csv
  target: /inbox/sales.csv
```
"#;

    #[test]
    fn transfer_params_get_placeholders_and_base_path() {
        let config = Config::from_markdown_fragment(DOC, "actions.md").unwrap();
        let registry = DriverRegistry::new();
        let env = MapEnv::new().with("SFTP_HOST", "files.example.com");
        let transports = Transports::unsupported();
        let options = RunOptions::default();
        let rt = Runtime {
            config: &config,
            registry: &registry,
            env: &env,
            transports: &transports,
            tmp_dir: Path::new("/tmp"),
            options: &options,
        };
        let item = config.section("ACTIONS").unwrap().get("upload").unwrap();
        let params = item.metadata().unwrap().get("params").unwrap();
        let dates = [chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()];
        let action = Action {
            rt: &rt,
            item,
            params,
            dates: &dates,
            base: Some(Path::new("/data")),
        };

        let sftp = action.sftp(true).unwrap();
        assert_eq!(sftp.host, "files.example.com");
        assert_eq!(sftp.port, Some(2222));
        assert_eq!(sftp.user, "etl");
        assert_eq!(sftp.host_key, PathBuf::from("/data/keys/server.pub"));
        assert_eq!(sftp.local_path, PathBuf::from("/data/out/sales_20240301.csv"));
        assert_eq!(sftp.remote_path, "/inbox/sales.csv");
    }
}
