//! Request, response and error interceptor chains.
//!
//! Each chain is copy-on-write: registration and removal swap in a new list
//! while calls already in flight keep running against the snapshot they took
//! when they started.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures_util::future::BoxFuture;
use tracing::debug;

use crate::config::RequestConfig;
use crate::error::Error;
use crate::response::Response;
use crate::util::{read_unpoisoned, write_unpoisoned};

pub trait RequestInterceptor: Send + Sync {
    fn intercept(&self, config: RequestConfig) -> BoxFuture<'static, crate::Result<RequestConfig>>;
}

impl<F, Fut> RequestInterceptor for F
where
    F: Fn(RequestConfig) -> Fut + Send + Sync,
    Fut: Future<Output = crate::Result<RequestConfig>> + Send + 'static,
{
    fn intercept(&self, config: RequestConfig) -> BoxFuture<'static, crate::Result<RequestConfig>> {
        Box::pin(self(config))
    }
}

pub trait ResponseInterceptor: Send + Sync {
    fn intercept(&self, response: Response) -> BoxFuture<'static, crate::Result<Response>>;
}

impl<F, Fut> ResponseInterceptor for F
where
    F: Fn(Response) -> Fut + Send + Sync,
    Fut: Future<Output = crate::Result<Response>> + Send + 'static,
{
    fn intercept(&self, response: Response) -> BoxFuture<'static, crate::Result<Response>> {
        Box::pin(self(response))
    }
}

/// What an error stage decided about a failure.
#[derive(Debug)]
pub enum ErrorOutcome {
    /// The failure is replaced by a successful envelope. Later error stages
    /// do not run and the call is not retried.
    Recovered(Response),
    /// The (possibly rewritten) failure continues down the chain.
    Failing(Error),
}

impl From<Error> for ErrorOutcome {
    fn from(error: Error) -> Self {
        Self::Failing(error)
    }
}

impl From<Response> for ErrorOutcome {
    fn from(response: Response) -> Self {
        Self::Recovered(response)
    }
}

pub trait ErrorInterceptor: Send + Sync {
    fn intercept(&self, error: Error) -> BoxFuture<'static, ErrorOutcome>;
}

impl<F, Fut> ErrorInterceptor for F
where
    F: Fn(Error) -> Fut + Send + Sync,
    Fut: Future<Output = ErrorOutcome> + Send + 'static,
{
    fn intercept(&self, error: Error) -> BoxFuture<'static, ErrorOutcome> {
        Box::pin(self(error))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainKind {
    Request,
    Response,
    Error,
}

impl ChainKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ChainKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Removal token for one registered interceptor.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InterceptorHandle {
    kind: ChainKind,
    id: u64,
}

impl InterceptorHandle {
    pub fn kind(&self) -> ChainKind {
        self.kind
    }
}

struct Entry<I: ?Sized> {
    id: u64,
    category: Option<String>,
    interceptor: Arc<I>,
}

impl<I: ?Sized> Clone for Entry<I> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            category: self.category.clone(),
            interceptor: Arc::clone(&self.interceptor),
        }
    }
}

/// Ordered interceptors of one kind.
pub struct InterceptorChain<I: ?Sized> {
    kind: ChainKind,
    next_id: AtomicU64,
    entries: RwLock<Arc<Vec<Entry<I>>>>,
}

impl<I: ?Sized> std::fmt::Debug for InterceptorChain<I> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("InterceptorChain")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .finish()
    }
}

impl<I: ?Sized> InterceptorChain<I> {
    fn new(kind: ChainKind) -> Self {
        Self {
            kind,
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Arc::new(Vec::new())),
        }
    }

    fn insert(&self, interceptor: Arc<I>, category: Option<String>) -> InterceptorHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = write_unpoisoned(&self.entries);
        Arc::make_mut(&mut *entries).push(Entry {
            id,
            category,
            interceptor,
        });
        debug!(chain = %self.kind, id, "interceptor registered");
        InterceptorHandle {
            kind: self.kind,
            id,
        }
    }

    /// Remove one interceptor. Calls that already started keep it.
    pub fn remove(&self, handle: &InterceptorHandle) -> bool {
        if handle.kind != self.kind {
            return false;
        }
        let mut entries = write_unpoisoned(&self.entries);
        let Some(position) = entries.iter().position(|entry| entry.id == handle.id) else {
            return false;
        };
        Arc::make_mut(&mut *entries).remove(position);
        debug!(chain = %self.kind, id = handle.id, "interceptor removed");
        true
    }

    /// Remove every interceptor registered under `category`.
    pub fn clear_category(&self, category: &str) -> usize {
        let mut entries = write_unpoisoned(&self.entries);
        let before = entries.len();
        if !entries
            .iter()
            .any(|entry| entry.category.as_deref() == Some(category))
        {
            return 0;
        }
        Arc::make_mut(&mut *entries).retain(|entry| entry.category.as_deref() != Some(category));
        before - entries.len()
    }

    pub fn clear(&self) {
        *write_unpoisoned(&self.entries) = Arc::new(Vec::new());
    }

    pub fn len(&self) -> usize {
        read_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<Vec<Entry<I>>> {
        Arc::clone(&read_unpoisoned(&self.entries))
    }
}

impl InterceptorChain<dyn RequestInterceptor> {
    pub fn register<F, Fut>(&self, interceptor: F) -> InterceptorHandle
    where
        F: Fn(RequestConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::Result<RequestConfig>> + Send + 'static,
    {
        self.insert(Arc::new(interceptor), None)
    }

    pub fn register_in<F, Fut>(&self, category: impl Into<String>, interceptor: F) -> InterceptorHandle
    where
        F: Fn(RequestConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::Result<RequestConfig>> + Send + 'static,
    {
        self.insert(Arc::new(interceptor), Some(category.into()))
    }

    pub fn register_arc(
        &self,
        category: Option<String>,
        interceptor: Arc<dyn RequestInterceptor>,
    ) -> InterceptorHandle {
        self.insert(interceptor, category)
    }
}

impl InterceptorChain<dyn ResponseInterceptor> {
    pub fn register<F, Fut>(&self, interceptor: F) -> InterceptorHandle
    where
        F: Fn(Response) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::Result<Response>> + Send + 'static,
    {
        self.insert(Arc::new(interceptor), None)
    }

    pub fn register_in<F, Fut>(&self, category: impl Into<String>, interceptor: F) -> InterceptorHandle
    where
        F: Fn(Response) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::Result<Response>> + Send + 'static,
    {
        self.insert(Arc::new(interceptor), Some(category.into()))
    }

    pub fn register_arc(
        &self,
        category: Option<String>,
        interceptor: Arc<dyn ResponseInterceptor>,
    ) -> InterceptorHandle {
        self.insert(interceptor, category)
    }
}

impl InterceptorChain<dyn ErrorInterceptor> {
    pub fn register<F, Fut>(&self, interceptor: F) -> InterceptorHandle
    where
        F: Fn(Error) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ErrorOutcome> + Send + 'static,
    {
        self.insert(Arc::new(interceptor), None)
    }

    pub fn register_in<F, Fut>(&self, category: impl Into<String>, interceptor: F) -> InterceptorHandle
    where
        F: Fn(Error) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ErrorOutcome> + Send + 'static,
    {
        self.insert(Arc::new(interceptor), Some(category.into()))
    }

    pub fn register_arc(
        &self,
        category: Option<String>,
        interceptor: Arc<dyn ErrorInterceptor>,
    ) -> InterceptorHandle {
        self.insert(interceptor, category)
    }
}

/// The client's interceptor registry.
#[derive(Debug)]
pub struct Interceptors {
    request: InterceptorChain<dyn RequestInterceptor>,
    response: InterceptorChain<dyn ResponseInterceptor>,
    error: InterceptorChain<dyn ErrorInterceptor>,
}

impl Default for Interceptors {
    fn default() -> Self {
        Self {
            request: InterceptorChain::new(ChainKind::Request),
            response: InterceptorChain::new(ChainKind::Response),
            error: InterceptorChain::new(ChainKind::Error),
        }
    }
}

impl Interceptors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) -> &InterceptorChain<dyn RequestInterceptor> {
        &self.request
    }

    pub fn response(&self) -> &InterceptorChain<dyn ResponseInterceptor> {
        &self.response
    }

    pub fn error(&self) -> &InterceptorChain<dyn ErrorInterceptor> {
        &self.error
    }

    pub fn remove(&self, handle: &InterceptorHandle) -> bool {
        match handle.kind {
            ChainKind::Request => self.request.remove(handle),
            ChainKind::Response => self.response.remove(handle),
            ChainKind::Error => self.error.remove(handle),
        }
    }

    /// Remove every interceptor of `category` from all three chains.
    pub fn clear_category(&self, category: &str) -> usize {
        self.request.clear_category(category)
            + self.response.clear_category(category)
            + self.error.clear_category(category)
    }

    pub fn clear(&self) {
        self.request.clear();
        self.response.clear();
        self.error.clear();
    }

    pub fn len(&self) -> usize {
        self.request.len() + self.response.len() + self.error.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn snapshot(&self) -> InterceptorSnapshot {
        InterceptorSnapshot {
            request: self.request.snapshot(),
            response: self.response.snapshot(),
            error: self.error.snapshot(),
        }
    }
}

/// Chains as they were when a logical call started.
#[derive(Clone)]
pub(crate) struct InterceptorSnapshot {
    request: Arc<Vec<Entry<dyn RequestInterceptor>>>,
    response: Arc<Vec<Entry<dyn ResponseInterceptor>>>,
    error: Arc<Vec<Entry<dyn ErrorInterceptor>>>,
}

impl InterceptorSnapshot {
    pub(crate) async fn run_request(&self, mut config: RequestConfig) -> crate::Result<RequestConfig> {
        for entry in self.request.iter() {
            config = entry.interceptor.intercept(config).await?;
        }
        Ok(config)
    }

    pub(crate) async fn run_response(&self, mut response: Response) -> crate::Result<Response> {
        for entry in self.response.iter() {
            response = entry.interceptor.intercept(response).await?;
        }
        Ok(response)
    }

    pub(crate) async fn run_error(&self, mut error: Error) -> ErrorOutcome {
        for entry in self.error.iter() {
            match entry.interceptor.intercept(error).await {
                ErrorOutcome::Recovered(response) => return ErrorOutcome::Recovered(response),
                ErrorOutcome::Failing(next) => error = next,
            }
        }
        ErrorOutcome::Failing(error)
    }
}
