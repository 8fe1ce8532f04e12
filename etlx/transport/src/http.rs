//! HTTP transfers through [reqwest](https://docs.rs/reqwest).

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method};
use tracing::{debug, instrument};

use crate::remote::{HttpClient, HttpParams};
use crate::{Result, TransportError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct ReqwestHttp {
    client: Client,
}

impl ReqwestHttp {
    pub fn new() -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn invalid(msg: impl Into<String>) -> TransportError {
    TransportError::InvalidParams(msg.into())
}

fn method(params: &HttpParams, default: Method) -> Result<Method> {
    match &params.method {
        Some(m) if !m.trim().is_empty() => Method::from_str(&m.trim().to_uppercase())
            .map_err(|_| invalid(format!("invalid http method: {m}"))),
        _ => Ok(default),
    }
}

fn headers(params: &HttpParams) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (key, value) in &params.headers {
        let name = HeaderName::from_str(key).map_err(|_| invalid(format!("invalid header: {key}")))?;
        let value =
            HeaderValue::from_str(value).map_err(|_| invalid(format!("invalid header value for {key}")))?;
        map.insert(name, value);
    }
    if let Some(content_type) = &params.content_type {
        let value = HeaderValue::from_str(content_type)
            .map_err(|_| invalid(format!("invalid content type: {content_type}")))?;
        map.insert(CONTENT_TYPE, value);
    }
    Ok(map)
}

fn check_status(url: &str, status: reqwest::StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(TransportError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttp {
    #[instrument(skip_all, err, fields(url = %params.url))]
    async fn upload(&self, params: &HttpParams) -> Result<u16> {
        let source = params
            .source
            .as_ref()
            .ok_or_else(|| invalid("http upload needs a source file"))?;
        let body = tokio::fs::read(source).await?;

        let mut request = self
            .client
            .request(method(params, Method::POST)?, &params.url);

        if let Some(field) = &params.form_field {
            let file_name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let mut part = Part::bytes(body).file_name(file_name);
            if let Some(content_type) = &params.content_type {
                part = part.mime_str(content_type)?;
            }
            let mut plain = params.clone();
            plain.content_type = None;
            request = request
                .headers(headers(&plain)?)
                .multipart(Form::new().part(field.clone(), part));
        } else {
            request = request.headers(headers(params)?).body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        check_status(&params.url, status)?;
        debug!("Uploaded {} with status {status}", source.display());
        Ok(status.as_u16())
    }

    #[instrument(skip_all, err, fields(url = %params.url))]
    async fn download(&self, params: &HttpParams) -> Result<u64> {
        let target = params
            .target
            .as_ref()
            .ok_or_else(|| invalid("http download needs a target file"))?;

        let response = self
            .client
            .request(method(params, Method::GET)?, &params.url)
            .headers(headers(params)?)
            .send()
            .await?;
        check_status(&params.url, response.status())?;

        let bytes = response.bytes().await?;
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, &bytes).await?;
        debug!("Downloaded {} bytes into {}", bytes.len(), target.display());
        Ok(bytes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_and_custom_methods() {
        let params = HttpParams::builder().url("http://localhost").build();
        assert_eq!(method(&params, Method::GET).unwrap(), Method::GET);

        let params = HttpParams::builder()
            .url("http://localhost")
            .method("put")
            .build();
        assert_eq!(method(&params, Method::POST).unwrap(), Method::PUT);
    }

    #[tokio::test]
    async fn upload_without_source_is_rejected() {
        let http = ReqwestHttp::new().unwrap();
        let params = HttpParams::builder().url("http://localhost/upload").build();
        let err = http.upload(&params).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidParams(_)));
    }
}
