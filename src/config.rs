use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::auth::AuthRetryPolicy;
use crate::body::RequestPayload;
use crate::retry::RetryPolicy;
use crate::schema::ResponseSchema;
use crate::util::{merge_headers, parse_header_name, parse_header_value, redact_uri_for_logs};

/// Content-type hint for encoding the request payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentType {
    Json,
    Form,
    Text,
    Html,
    Xml,
    Custom(String),
}

impl ContentType {
    pub fn mime(&self) -> &str {
        match self {
            Self::Json => "application/json",
            Self::Form => "application/x-www-form-urlencoded",
            Self::Text => "text/plain; charset=utf-8",
            Self::Html => "text/html; charset=utf-8",
            Self::Xml => "application/xml",
            Self::Custom(mime) => mime,
        }
    }
}

/// Response-type hint for decoding the response body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseType {
    /// Pick a decoder from the response `content-type`.
    #[default]
    Auto,
    Json,
    Text,
    Bytes,
    /// Hand back the transport response without reading it.
    Raw,
}

/// Declarative description of one logical call.
///
/// A config is built once by the caller and never mutated by the engine;
/// retries and auth re-issues work from copies. The `with_*` methods consume
/// and return the config, which is also the shape request interceptors use.
#[derive(Clone)]
pub struct RequestConfig {
    method: Method,
    url: String,
    base_url: Option<String>,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    payload: Option<RequestPayload>,
    content_type: Option<ContentType>,
    response_type: ResponseType,
    parse_json: bool,
    timeout: Option<Duration>,
    retry_policy: Option<RetryPolicy>,
    auth_retry: Option<AuthRetryPolicy>,
    schema: Option<Arc<dyn ResponseSchema>>,
    cancel_token: Option<CancellationToken>,
    auth_retry_count: usize,
}

impl std::fmt::Debug for RequestConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestConfig")
            .field("method", &self.method)
            .field("url", &redact_uri_for_logs(&self.url))
            .field("base_url", &self.base_url)
            .field("query_len", &self.query.len())
            .field("headers", &self.headers)
            .field("payload", &self.payload)
            .field("content_type", &self.content_type)
            .field("response_type", &self.response_type)
            .field("parse_json", &self.parse_json)
            .field("timeout", &self.timeout)
            .field("retry_policy", &self.retry_policy)
            .field("auth_retry", &self.auth_retry.is_some())
            .field("schema", &self.schema.is_some())
            .field("cancel_token", &self.cancel_token.is_some())
            .field("auth_retry_count", &self.auth_retry_count)
            .finish()
    }
}

impl RequestConfig {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            base_url: None,
            query: Vec::new(),
            headers: HeaderMap::new(),
            payload: None,
            content_type: None,
            response_type: ResponseType::Auto,
            parse_json: true,
            timeout: None,
            retry_policy: None,
            auth_retry: None,
            schema: None,
            cancel_token: None,
            auth_retry_count: 0,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_query<T>(mut self, params: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(params).map_err(|source| {
            crate::Error::caller("query parameters must serialize to an object")
                .with_source(source)
        })?;
        let pairs = crate::body::flatten_form_pairs(&value).ok_or_else(|| {
            crate::Error::caller("query parameters must serialize to an object")
        })?;
        self.query.extend(pairs);
        Ok(self)
    }

    /// Insert a header, replacing any previous value under the same name.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_with_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.with_header(name, value))
    }

    pub fn without_header(mut self, name: &HeaderName) -> Self {
        self.headers.remove(name);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in &headers {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn with_payload(mut self, payload: RequestPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_json<T>(self, payload: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        Ok(self.with_payload(RequestPayload::json(payload)?))
    }

    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn with_response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    pub fn with_parse_json(mut self, parse_json: bool) -> Self {
        self.parse_json = parse_json;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    pub fn with_auth_retry(mut self, auth_retry: AuthRetryPolicy) -> Self {
        self.auth_retry = Some(auth_retry);
        self
    }

    pub fn with_schema<S>(self, schema: S) -> Self
    where
        S: ResponseSchema + 'static,
    {
        self.with_schema_arc(Arc::new(schema))
    }

    pub fn with_schema_arc(mut self, schema: Arc<dyn ResponseSchema>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Attach a caller-owned cancellation signal.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn payload(&self) -> Option<&RequestPayload> {
        self.payload.as_ref()
    }

    pub fn content_type(&self) -> Option<&ContentType> {
        self.content_type.as_ref()
    }

    pub fn response_type(&self) -> ResponseType {
        self.response_type
    }

    pub fn parse_json(&self) -> bool {
        self.parse_json
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    pub fn auth_retry(&self) -> Option<&AuthRetryPolicy> {
        self.auth_retry.as_ref()
    }

    pub fn schema(&self) -> Option<&Arc<dyn ResponseSchema>> {
        self.schema.as_ref()
    }

    pub fn cancel_token(&self) -> Option<&CancellationToken> {
        self.cancel_token.as_ref()
    }

    /// Number of auth-refresh re-issues that led to this config.
    pub fn auth_retry_count(&self) -> usize {
        self.auth_retry_count
    }

    /// Copy used for an auth-refresh re-issue. The counter is the only field
    /// that changes between attempts.
    pub(crate) fn next_auth_attempt(&self) -> Self {
        let mut next = self.clone();
        next.auth_retry_count = self.auth_retry_count.saturating_add(1);
        next
    }

    /// Fill unset fields from client defaults at the start of a logical call.
    pub(crate) fn with_client_defaults(mut self, defaults: &ClientDefaults) -> Self {
        if self.base_url.is_none() {
            self.base_url = defaults.base_url.clone();
        }
        self.headers = merge_headers(&defaults.headers, &self.headers);
        if self.timeout.is_none() {
            self.timeout = defaults.timeout;
        }
        if self.retry_policy.is_none() {
            self.retry_policy = Some(defaults.retry_policy.clone());
        }
        if self.auth_retry.is_none() {
            self.auth_retry = defaults.auth_retry.clone();
        }
        self
    }

    pub(crate) fn describe(&self) -> String {
        format!("{} {}", self.method, redact_uri_for_logs(&self.url))
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ClientDefaults {
    pub(crate) base_url: Option<String>,
    pub(crate) headers: HeaderMap,
    pub(crate) timeout: Option<Duration>,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) auth_retry: Option<AuthRetryPolicy>,
}
