//! `reqflow` is a typed HTTP request engine: one logical call goes through
//! request/response/error interceptor chains, per-attempt timeouts,
//! cancellation, retry with back-off, auth-refresh re-issue, content
//! negotiation and optional response schema validation.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use reqflow::prelude::{AuthRetryPolicy, Client, RetryPolicy};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Item {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com")
//!         .client_name("my-sdk")
//!         .timeout(Duration::from_secs(3))
//!         .retry_policy(RetryPolicy::Count(2))
//!         .auth_retry(AuthRetryPolicy::new(|_error, _config| async { true }))
//!         .try_build()?;
//!
//!     client.interceptors().request().register(|config: reqflow::RequestConfig| async move {
//!         config.try_with_header("authorization", "Bearer token")
//!     });
//!
//!     let item: Item = client
//!         .post("/v1/items")
//!         .json(&serde_json::json!({ "name": "demo" }))?
//!         .send_json()
//!         .await?;
//!
//!     println!("created id={}", item.id);
//!     Ok(())
//! }
//! ```
//!
//! Every failure, including timeouts, cancellation, non-2xx statuses and
//! schema mismatches, is an [`Error`] with an [`ErrorCode`].

mod auth;
mod body;
mod cancel;
mod client;
mod config;
mod error;
mod execute;
mod interceptor;
mod request;
mod response;
mod retry;
mod schema;
mod transport;
mod util;

pub use crate::auth::{AuthRefreshHandler, AuthRetryPolicy};
pub use crate::body::{
    MultipartForm, MultipartPart, RawResponse, RequestPayload, ResponseBody, WireBody, decode,
    encode,
};
pub use crate::cancel::{AbortReason, AbortSignal, CancelHandle, CancelableRequest};
pub use crate::client::{Client, ClientBuilder};
pub use crate::config::{ContentType, RequestConfig, ResponseType};
pub use crate::error::{Error, ErrorCode, RequestSnapshot, ResponseSnapshot, TransportErrorKind};
pub use crate::interceptor::{
    ChainKind, ErrorInterceptor, ErrorOutcome, InterceptorChain, InterceptorHandle, Interceptors,
    RequestInterceptor, ResponseInterceptor,
};
pub use crate::request::RequestBuilder;
pub use crate::response::Response;
pub use crate::retry::{Backoff, RetryPolicy, RetrySettings};
pub use crate::schema::{JsonSchema, ResponseSchema, SchemaError, TypedSchema};
#[cfg(feature = "hyper-transport")]
pub use crate::transport::HyperTransport;
pub use crate::transport::{
    BoxError, Transport, TransportBody, TransportError, TransportRequest, TransportResponse,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        AuthRetryPolicy, Backoff, CancelableRequest, Client, ContentType, Error, ErrorCode,
        ErrorOutcome, RequestConfig, Response, ResponseBody, ResponseType, RetryPolicy,
        RetrySettings,
    };
}

#[cfg(test)]
mod tests;
