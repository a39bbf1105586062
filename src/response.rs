use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::body::ResponseBody;
use crate::config::RequestConfig;
use crate::error::{Error, ErrorCode};

/// Successful result of a logical call.
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    status_text: String,
    headers: HeaderMap,
    body: ResponseBody,
    config: Arc<RequestConfig>,
}

impl Response {
    /// Build an envelope, e.g. when an error interceptor recovers a failure.
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: ResponseBody,
        config: Arc<RequestConfig>,
    ) -> Self {
        Self {
            status,
            status_text: status_text(status),
            headers,
            body,
            config,
        }
    }

    pub fn with_body(mut self, body: ResponseBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Config of the attempt that produced this envelope.
    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    pub fn json<T>(&self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        self.body.deserialize().map_err(|source| {
            Error::new(
                ErrorCode::ValidationFailed,
                format!("failed to deserialize response body: {source}"),
            )
            .with_config(Arc::clone(&self.config))
            .with_body(self.body.clone())
            .with_source(source)
        })
    }

    pub fn text(&self) -> Option<&str> {
        self.body.as_text()
    }

    pub fn bytes(&self) -> Option<&Bytes> {
        self.body.as_bytes()
    }
}

pub(crate) fn status_text(status: StatusCode) -> String {
    status.canonical_reason().unwrap_or_default().to_owned()
}
