use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;

use crate::body::ResponseBody;
use crate::config::RequestConfig;

type SharedSource = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    Canceled,
    TimedOut,
    BadResponse,
    ValidationFailed,
    ValidationUnknown,
    Network,
    Unknown,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Canceled => "canceled",
            Self::TimedOut => "timed_out",
            Self::BadResponse => "bad_response",
            Self::ValidationFailed => "validation_failed",
            Self::ValidationUnknown => "validation_unknown",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Aborted,
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Aborted => "aborted",
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// What was handed to the transport for the failing attempt.
#[derive(Clone, Debug)]
pub struct RequestSnapshot {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
}

/// Status line and headers of the response that produced a failure.
#[derive(Clone, Debug)]
pub struct ResponseSnapshot {
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
}

/// The single failure value produced by the engine.
///
/// Every failure mode (transport, timeout, cancellation, non-2xx status,
/// schema validation) is reported through this type so that error
/// interceptors and retry gating can treat them uniformly. Callers branch
/// on [`Error::code`].
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct Error {
    code: ErrorCode,
    message: String,
    config: Option<Arc<RequestConfig>>,
    request: Option<RequestSnapshot>,
    response: Option<ResponseSnapshot>,
    body: Option<ResponseBody>,
    transport_kind: Option<TransportErrorKind>,
    #[source]
    source: Option<SharedSource>,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            config: None,
            request: None,
            response: None,
            body: None,
            transport_kind: None,
            source: None,
        }
    }

    pub fn with_config(mut self, config: Arc<RequestConfig>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_request(mut self, request: RequestSnapshot) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_response(mut self, response: ResponseSnapshot) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_body(mut self, body: ResponseBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub(crate) fn with_transport_kind(mut self, kind: TransportErrorKind) -> Self {
        self.transport_kind = Some(kind);
        self
    }

    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn config(&self) -> Option<&RequestConfig> {
        self.config.as_deref()
    }

    pub fn request(&self) -> Option<&RequestSnapshot> {
        self.request.as_ref()
    }

    pub fn response(&self) -> Option<&ResponseSnapshot> {
        self.response.as_ref()
    }

    /// HTTP status of the failing response, when there was one.
    pub fn status(&self) -> Option<StatusCode> {
        self.response.as_ref().map(|response| response.status)
    }

    pub fn body(&self) -> Option<&ResponseBody> {
        self.body.as_ref()
    }

    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        self.transport_kind
    }

    pub fn is_canceled(&self) -> bool {
        self.code == ErrorCode::Canceled
    }

    pub fn is_timeout(&self) -> bool {
        self.code == ErrorCode::TimedOut
    }

    pub(crate) fn canceled(config: &Arc<RequestConfig>) -> Self {
        Self::new(
            ErrorCode::Canceled,
            format!("request canceled: {}", config.describe()),
        )
        .with_config(Arc::clone(config))
    }

    pub(crate) fn timed_out(
        config: &Arc<RequestConfig>,
        request: RequestSnapshot,
        timeout: Duration,
    ) -> Self {
        Self::new(
            ErrorCode::TimedOut,
            format!(
                "request timed out after {}ms: {}",
                timeout.as_millis(),
                config.describe()
            ),
        )
        .with_config(Arc::clone(config))
        .with_request(request)
    }

    pub(crate) fn bad_response(
        config: &Arc<RequestConfig>,
        request: RequestSnapshot,
        response: ResponseSnapshot,
        body: ResponseBody,
    ) -> Self {
        Self::new(
            ErrorCode::BadResponse,
            format!(
                "request failed with status {}: {}",
                response.status.as_u16(),
                config.describe()
            ),
        )
        .with_config(Arc::clone(config))
        .with_request(request)
        .with_response(response)
        .with_body(body)
    }

    pub(crate) fn network(
        config: &Arc<RequestConfig>,
        request: Option<RequestSnapshot>,
        error: crate::transport::TransportError,
    ) -> Self {
        let kind = error.kind();
        let mut built = Self::new(
            ErrorCode::Network,
            format!("network error ({kind}): {}", config.describe()),
        )
        .with_config(Arc::clone(config))
        .with_transport_kind(kind)
        .with_source(error);
        built.request = request;
        built
    }

    pub(crate) fn caller(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unknown, message)
    }

    /// Attach the config only when the failure site did not already do so.
    pub(crate) fn or_config(mut self, config: &Arc<RequestConfig>) -> Self {
        if self.config.is_none() {
            self.config = Some(Arc::clone(config));
        }
        self
    }
}
