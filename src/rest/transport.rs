//! HTTP transport seam
//!
//! The dispatcher builds fully-formed requests and hands them to an
//! [`HttpTransport`]. Production uses reqwest; tests plug in a scripted one.

use crate::error::RestError;
use crate::rest::bucket::Attachment;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Request body variants
#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    /// Files plus an optional `payload_json` part
    Multipart {
        payload_json: Option<Value>,
        files: Vec<Attachment>,
    },
}

/// Fully-built outbound request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

/// Raw response handed back to the dispatcher
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Execute one attempt. Network failures map to `Transport` or `Timeout`.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, RestError>;
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, RestError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| RestError::InvalidRequest(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    fn multipart(payload_json: Option<Value>, files: Vec<Attachment>) -> Result<Form, RestError> {
        let mut form = Form::new();
        for (index, file) in files.into_iter().enumerate() {
            let mut part = Part::bytes(file.data).file_name(file.filename);
            if let Some(content_type) = file.content_type {
                part = part
                    .mime_str(&content_type)
                    .map_err(|e| RestError::InvalidRequest(format!("bad content type: {e}")))?;
            }
            form = form.part(format!("files[{index}]"), part);
        }
        if let Some(payload) = payload_json {
            form = form.text("payload_json", payload.to_string());
        }
        Ok(form)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, RestError> {
        debug!(method = %request.method, url = %request.url, "Sending HTTP request");

        let builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);

        let builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Multipart {
                payload_json,
                files,
            } => builder.multipart(Self::multipart(payload_json, files)?),
        };

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> RestError {
    if e.is_timeout() {
        RestError::Timeout
    } else {
        RestError::Transport(e.to_string())
    }
}
