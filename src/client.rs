use std::sync::Arc;
use std::time::Duration;

use http::Method;
use http::header::{HeaderName, HeaderValue};

use crate::auth::AuthRetryPolicy;
use crate::cancel::{CancelHandle, CancelableRequest};
use crate::config::{ClientDefaults, RequestConfig};
use crate::execute::Executor;
use crate::interceptor::Interceptors;
use crate::request::RequestBuilder;
use crate::retry::RetryPolicy;
use crate::transport::Transport;
use crate::util::{parse_header_name, parse_header_value, validate_base_url};

const DEFAULT_CLIENT_NAME: &str = "reqflow";

pub struct ClientBuilder {
    client_name: String,
    defaults: ClientDefaults,
    transport: Option<Arc<dyn Transport>>,
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ClientBuilder")
            .field("client_name", &self.client_name)
            .field("defaults", &self.defaults)
            .field("transport", &self.transport.is_some())
            .finish()
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            defaults: ClientDefaults::default(),
            transport: None,
        }
    }

    /// Base URL that relative request URLs are joined onto.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.defaults.base_url = Some(base_url.into());
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.defaults.headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    /// Per-attempt timeout for requests that do not set their own.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.defaults.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn retry_policy(mut self, retry_policy: impl Into<RetryPolicy>) -> Self {
        self.defaults.retry_policy = retry_policy.into();
        self
    }

    pub fn auth_retry(mut self, auth_retry: AuthRetryPolicy) -> Self {
        self.defaults.auth_retry = Some(auth_retry);
        self
    }

    pub fn transport<T>(self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        self.transport_arc(Arc::new(transport))
    }

    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn try_build(self) -> crate::Result<Client> {
        if let Some(base_url) = &self.defaults.base_url {
            validate_base_url(base_url)?;
        }
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport()?,
        };
        Ok(Client {
            executor: Arc::new(Executor {
                client_name: self.client_name,
                transport,
                interceptors: Interceptors::new(),
                defaults: self.defaults,
            }),
        })
    }

    #[track_caller]
    pub fn build(self) -> Client {
        self.try_build().unwrap_or_else(|error| {
            panic!("failed to build reqflow client: {error}; use try_build() to handle configuration errors")
        })
    }
}

#[cfg(feature = "hyper-transport")]
fn default_transport() -> crate::Result<Arc<dyn Transport>> {
    Ok(Arc::new(crate::transport::HyperTransport::new()?))
}

#[cfg(not(feature = "hyper-transport"))]
fn default_transport() -> crate::Result<Arc<dyn Transport>> {
    Err(crate::Error::caller(
        "no transport configured; enable the `hyper-transport` feature or call ClientBuilder::transport",
    ))
}

/// Entry point for executing requests.
///
/// Cloning is cheap and clones share the interceptor registry.
#[derive(Clone, Debug)]
pub struct Client {
    executor: Arc<Executor>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn client_name(&self) -> &str {
        &self.executor.client_name
    }

    pub fn interceptors(&self) -> &Interceptors {
        &self.executor.interceptors
    }

    /// Start one logical call.
    ///
    /// The interceptor chains are captured here, so registry changes made
    /// after this returns do not affect the call even if it has not been
    /// polled yet. Never fails synchronously: every failure, including
    /// invalid URLs and headers, is reported by awaiting the returned request.
    pub fn execute(&self, config: RequestConfig) -> CancelableRequest {
        let handle = CancelHandle::new();
        if config
            .cancel_token()
            .is_some_and(|token| token.is_cancelled())
        {
            handle.cancel();
        }
        let interceptors = self.executor.interceptors.snapshot();
        let future = Arc::clone(&self.executor).execute(config, interceptors, handle.clone());
        CancelableRequest::new(handle, Box::pin(future))
    }

    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, RequestConfig::new(method, url))
    }

    pub fn get(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, url)
    }

    pub fn patch(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, url)
    }

    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, url)
    }
}
