//! The boundary between the engine and whatever actually performs HTTP I/O.

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;
use tracing::debug;

use crate::body::WireBody;
use crate::cancel::AbortSignal;
use crate::error::TransportErrorKind;

#[cfg(feature = "hyper-transport")]
mod hyper_client;

#[cfg(feature = "hyper-transport")]
pub use self::hyper_client::HyperTransport;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Performs a single HTTP exchange.
///
/// Implementations should stop work once `signal` is aborted, but the engine
/// does not rely on it: an attempt is abandoned as soon as the signal fires.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: TransportRequest,
        signal: AbortSignal,
    ) -> BoxFuture<'_, Result<TransportResponse, TransportError>>;
}

#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: WireBody,
}

#[derive(Debug, Error)]
#[error("{kind} transport failure: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn aborted() -> Self {
        Self::new(TransportErrorKind::Aborted, "request aborted")
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }
}

/// Response body as exposed by a transport.
pub enum TransportBody {
    Buffered(Bytes),
    Streaming(BoxStream<'static, Result<Bytes, BoxError>>),
    /// The transport cannot provide a body reader; reads yield an empty body.
    Unavailable,
}

impl std::fmt::Debug for TransportBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(bytes) => formatter
                .debug_tuple("Buffered")
                .field(&bytes.len())
                .finish(),
            Self::Streaming(_) => formatter.write_str("Streaming"),
            Self::Unavailable => formatter.write_str("Unavailable"),
        }
    }
}

impl From<Bytes> for TransportBody {
    fn from(bytes: Bytes) -> Self {
        Self::Buffered(bytes)
    }
}

impl From<Vec<u8>> for TransportBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Buffered(Bytes::from(bytes))
    }
}

impl From<String> for TransportBody {
    fn from(text: String) -> Self {
        Self::Buffered(Bytes::from(text))
    }
}

impl From<&'static str> for TransportBody {
    fn from(text: &'static str) -> Self {
        Self::Buffered(Bytes::from_static(text.as_bytes()))
    }
}

impl From<&'static [u8]> for TransportBody {
    fn from(bytes: &'static [u8]) -> Self {
        Self::Buffered(Bytes::from_static(bytes))
    }
}

#[derive(Debug)]
pub struct TransportResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: TransportBody,
}

impl TransportResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: TransportBody) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn into_body(self) -> TransportBody {
        self.body
    }

    /// Read the whole body.
    pub async fn bytes(self) -> Result<Bytes, TransportError> {
        match self.body {
            TransportBody::Buffered(bytes) => Ok(bytes),
            TransportBody::Unavailable => {
                debug!(status = self.status.as_u16(), "transport body reader unavailable");
                Ok(Bytes::new())
            }
            TransportBody::Streaming(mut stream) => {
                let mut collected = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|source| {
                        TransportError::new(TransportErrorKind::Read, "failed to read response body")
                            .with_source(source)
                    })?;
                    collected.extend_from_slice(&chunk);
                }
                Ok(collected.freeze())
            }
        }
    }
}
