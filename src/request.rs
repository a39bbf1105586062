use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthRetryPolicy;
use crate::body::{MultipartForm, RequestPayload};
use crate::cancel::CancelableRequest;
use crate::client::Client;
use crate::config::{ContentType, RequestConfig, ResponseType};
use crate::retry::RetryPolicy;
use crate::schema::ResponseSchema;

/// Fluent construction of a [`RequestConfig`] bound to a client.
pub struct RequestBuilder<'a> {
    client: &'a Client,
    config: RequestConfig,
}

impl std::fmt::Debug for RequestBuilder<'_> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a Client, config: RequestConfig) -> Self {
        Self { client, config }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.config = self.config.with_header(name, value);
        self
    }

    pub fn try_header(mut self, name: &str, value: &str) -> crate::Result<Self> {
        self.config = self.config.try_with_header(name, value)?;
        Ok(self)
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.config = self.config.with_headers(headers);
        self
    }

    pub fn bearer_auth(self, token: &str) -> crate::Result<Self> {
        self.try_header("authorization", &format!("Bearer {token}"))
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config = self.config.with_query_pair(name, value);
        self
    }

    pub fn query_pairs<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (name, value) in pairs {
            self.config = self.config.with_query_pair(name, value);
        }
        self
    }

    pub fn query<T>(mut self, params: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        self.config = self.config.with_query(params)?;
        Ok(self)
    }

    pub fn json<T>(mut self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        self.config = self.config.with_json(payload)?;
        Ok(self)
    }

    /// Structured payload sent as `application/x-www-form-urlencoded`.
    pub fn form<T>(mut self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        self.config = self
            .config
            .with_json(payload)?
            .with_content_type(ContentType::Form);
        Ok(self)
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.config = self.config.with_payload(RequestPayload::Text(text.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.config = self.config.with_payload(RequestPayload::Bytes(body.into()));
        self
    }

    pub fn multipart(mut self, form: MultipartForm) -> Self {
        self.config = self.config.with_payload(RequestPayload::Multipart(form));
        self
    }

    pub fn payload(mut self, payload: RequestPayload) -> Self {
        self.config = self.config.with_payload(payload);
        self
    }

    pub fn content_type(mut self, content_type: ContentType) -> Self {
        self.config = self.config.with_content_type(content_type);
        self
    }

    pub fn response_type(mut self, response_type: ResponseType) -> Self {
        self.config = self.config.with_response_type(response_type);
        self
    }

    pub fn parse_json(mut self, parse_json: bool) -> Self {
        self.config = self.config.with_parse_json(parse_json);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_timeout(timeout);
        self
    }

    pub fn retry_policy(mut self, retry_policy: impl Into<RetryPolicy>) -> Self {
        self.config = self.config.with_retry_policy(retry_policy.into());
        self
    }

    pub fn auth_retry(mut self, auth_retry: AuthRetryPolicy) -> Self {
        self.config = self.config.with_auth_retry(auth_retry);
        self
    }

    pub fn schema<S>(mut self, schema: S) -> Self
    where
        S: ResponseSchema + 'static,
    {
        self.config = self.config.with_schema(schema);
        self
    }

    pub fn schema_arc(mut self, schema: Arc<dyn ResponseSchema>) -> Self {
        self.config = self.config.with_schema_arc(schema);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.config = self.config.with_cancel_token(token);
        self
    }

    pub fn into_config(self) -> RequestConfig {
        self.config
    }

    pub fn send(self) -> CancelableRequest {
        self.client.execute(self.config)
    }

    pub async fn send_json<T>(self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        self.send().await?.json()
    }
}
