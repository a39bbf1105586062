use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{StreamExt, TryStreamExt};
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Request, Uri};
use http_body_util::{BodyDataStream, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use rand::Rng;

use super::{BoxError, Transport, TransportBody, TransportError, TransportRequest, TransportResponse};
use crate::body::WireBody;
use crate::cancel::AbortSignal;
use crate::error::{Error, TransportErrorKind};

const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;

type HyperClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// [`Transport`] backed by the hyper legacy client with rustls.
#[derive(Clone)]
pub struct HyperTransport {
    client: HyperClient,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("HyperTransport").finish_non_exhaustive()
    }
}

impl HyperTransport {
    pub fn new() -> crate::Result<Self> {
        Self::with_pool(DEFAULT_POOL_IDLE_TIMEOUT, DEFAULT_POOL_MAX_IDLE_PER_HOST)
    }

    pub fn with_pool(
        pool_idle_timeout: Duration,
        pool_max_idle_per_host: usize,
    ) -> crate::Result<Self> {
        let https = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|source| {
                Error::caller(format!("failed to initialize rustls: {source}")).with_source(source)
            })?
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(pool_idle_timeout.max(Duration::from_millis(1)))
            .pool_max_idle_per_host(pool_max_idle_per_host.max(1))
            .build(https);
        Ok(Self { client })
    }
}

impl Transport for HyperTransport {
    fn send(
        &self,
        request: TransportRequest,
        signal: AbortSignal,
    ) -> BoxFuture<'_, Result<TransportResponse, TransportError>> {
        Box::pin(async move {
            let http_request = build_http_request(request)?;
            let response = tokio::select! {
                biased;
                () = signal.aborted() => return Err(TransportError::aborted()),
                result = self.client.request(http_request) => result.map_err(|source| {
                    let kind = classify_transport_error(&source);
                    TransportError::new(kind, source.to_string()).with_source(source)
                })?,
            };

            let (parts, incoming) = response.into_parts();
            let stream = BodyDataStream::new(incoming)
                .map_err(|source| -> BoxError { Box::new(source) })
                .boxed();
            Ok(TransportResponse::new(
                parts.status,
                parts.headers,
                TransportBody::Streaming(stream),
            ))
        })
    }
}

fn build_http_request(request: TransportRequest) -> Result<Request<Full<Bytes>>, TransportError> {
    let uri = request.url.parse::<Uri>().map_err(|source| {
        TransportError::new(
            TransportErrorKind::Other,
            format!("invalid request uri {}", request.url),
        )
        .with_source(source)
    })?;
    let mut headers = request.headers;
    let body = match request.body {
        WireBody::Empty => Bytes::new(),
        WireBody::Bytes(bytes) => bytes,
        WireBody::Multipart(form) => {
            let boundary = multipart_boundary();
            let content_type = HeaderValue::from_str(&format!(
                "multipart/form-data; boundary={boundary}"
            ))
            .map_err(|source| {
                TransportError::new(TransportErrorKind::Other, "invalid multipart boundary")
                    .with_source(source)
            })?;
            headers.insert(CONTENT_TYPE, content_type);
            form.encode(&boundary)
        }
    };

    let mut builder = Request::builder().method(request.method).uri(uri);
    if let Some(target) = builder.headers_mut() {
        *target = headers;
    }
    builder.body(Full::new(body)).map_err(|source| {
        TransportError::new(TransportErrorKind::Other, "failed to build http request")
            .with_source(source)
    })
}

fn multipart_boundary() -> String {
    let mut rng = rand::rng();
    format!(
        "reqflow-{:016x}{:016x}",
        rng.random::<u64>(),
        rng.random::<u64>()
    )
}

fn classify_transport_error(error: &hyper_util::client::legacy::Error) -> TransportErrorKind {
    let text = error.to_string().to_ascii_lowercase();
    if error.is_connect() {
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }
    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
    {
        return TransportErrorKind::Read;
    }
    TransportErrorKind::Other
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::header::CONTENT_TYPE;
    use http::{HeaderMap, Method};

    use super::{build_http_request, multipart_boundary};
    use crate::body::{MultipartForm, WireBody};
    use crate::error::TransportErrorKind;
    use crate::transport::TransportRequest;

    #[test]
    fn multipart_request_gets_a_boundary_content_type() {
        let request = TransportRequest {
            method: Method::POST,
            url: "http://127.0.0.1/upload".to_owned(),
            headers: HeaderMap::new(),
            body: WireBody::Multipart(MultipartForm::new().text("a", "b")),
        };
        let built = build_http_request(request).expect("request builds");
        let content_type = built.headers()[CONTENT_TYPE]
            .to_str()
            .expect("ascii content type");
        assert!(content_type.starts_with("multipart/form-data; boundary=reqflow-"));
    }

    #[test]
    fn invalid_uri_is_reported_as_transport_error() {
        let request = TransportRequest {
            method: Method::GET,
            url: "http://exa mple.com".to_owned(),
            headers: HeaderMap::new(),
            body: WireBody::Bytes(Bytes::new()),
        };
        let Err(error) = build_http_request(request) else {
            panic!("uri should not parse");
        };
        assert_eq!(error.kind(), TransportErrorKind::Other);
    }

    #[test]
    fn boundaries_are_unique() {
        assert_ne!(multipart_boundary(), multipart_boundary());
    }
}
