//! The attempt loop behind [`Client::execute`](crate::Client::execute).
//!
//! One logical call runs attempts strictly one after another. Each attempt
//! runs the request chain, encodes the body, races the transport against the
//! attempt timeout and the call's cancel handle, checks the status, then runs
//! the response chain and schema. Every failure goes through the error chain
//! before the auth-refresh gate and the retry gate see it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, StatusCode};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::body::{self, ResponseBody};
use crate::cancel::{AbortReason, AbortSignal, CancelHandle, forward_external_cancel};
use crate::config::{ClientDefaults, RequestConfig, ResponseType};
use crate::error::{Error, ErrorCode, RequestSnapshot, ResponseSnapshot};
use crate::interceptor::{ErrorOutcome, InterceptorSnapshot, Interceptors};
use crate::response::{Response, status_text};
use crate::schema::{ResponseSchema, SchemaError};
use crate::transport::{Transport, TransportError, TransportRequest};
use crate::util::{append_query_pairs, redact_uri_for_logs, resolve_uri};

pub(crate) struct Executor {
    pub(crate) client_name: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) interceptors: Interceptors,
    pub(crate) defaults: ClientDefaults,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Executor")
            .field("client_name", &self.client_name)
            .field("interceptors", &self.interceptors)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Run one logical call to completion against the interceptors captured
    /// when the call was started.
    pub(crate) async fn execute(
        self: Arc<Self>,
        config: RequestConfig,
        interceptors: InterceptorSnapshot,
        handle: CancelHandle,
    ) -> crate::Result<Response> {
        let config = Arc::new(config.with_client_defaults(&self.defaults));
        let external = config.cancel_token().cloned();
        if external.as_ref().is_some_and(CancellationToken::is_cancelled) {
            handle.cancel();
        }
        let forward = {
            let handle = handle.clone();
            async move {
                match external {
                    Some(token) => forward_external_cancel(token, handle).await,
                    None => std::future::pending::<()>().await,
                }
            }
        };

        tokio::select! {
            biased;
            () = handle.canceled() => Err(Error::canceled(&config)),
            () = forward => Err(Error::canceled(&config)),
            result = self.run(&interceptors, Arc::clone(&config), &handle) => result,
        }
    }

    async fn run(
        &self,
        interceptors: &InterceptorSnapshot,
        mut config: Arc<RequestConfig>,
        handle: &CancelHandle,
    ) -> crate::Result<Response> {
        let retry_policy = config.retry_policy().cloned().unwrap_or_default();
        let mut retries_used = 0_usize;
        let mut attempt = 1_usize;

        loop {
            if handle.is_canceled() {
                return Err(Error::canceled(&config));
            }

            let span = info_span!(
                "reqflow.request",
                client = %self.client_name,
                method = %config.method(),
                uri = %redact_uri_for_logs(config.url()),
                attempt = attempt,
                auth_retry = config.auth_retry_count(),
                max_retries = retry_policy.max_retries()
            );
            let error = match self
                .attempt(interceptors, &config, handle)
                .instrument(span.clone())
                .await
            {
                Ok(response) => return settle(handle, &config, Ok(response)),
                Err(error) => error.or_config(&config),
            };

            let error = match interceptors.run_error(error).instrument(span.clone()).await {
                ErrorOutcome::Recovered(response) => {
                    debug!(parent: &span, "failure recovered by error interceptor");
                    return settle(handle, &config, Ok(response));
                }
                ErrorOutcome::Failing(error) => error,
            };
            if handle.is_canceled() || error.is_canceled() {
                return settle(handle, &config, Err(error));
            }

            if let Some(auth) = config.auth_retry().cloned()
                && auth.covers_status(&error)
            {
                if !auth.should_refresh(&error, &config) {
                    return Err(error);
                }
                let refresh = auth.refresh(error.clone(), RequestConfig::clone(&config));
                let refreshed = tokio::select! {
                    biased;
                    () = handle.canceled() => return Err(Error::canceled(&config)),
                    refreshed = refresh => refreshed,
                };
                if !refreshed {
                    return Err(error);
                }
                warn!(
                    parent: &span,
                    status = error.status().map(|status| status.as_u16()),
                    "re-issuing request after credential refresh"
                );
                config = Arc::new(config.next_auth_attempt());
                attempt += 1;
                continue;
            }

            if !retry_policy.should_retry(&error, retries_used) {
                return Err(error);
            }
            retries_used += 1;
            let retry_delay = retry_policy.backoff_for_retry(retries_used);
            warn!(
                parent: &span,
                delay_ms = retry_delay.as_millis() as u64,
                retry = retries_used,
                code = %error.code(),
                error = %error,
                "retrying request after failure"
            );
            if !retry_delay.is_zero() {
                tokio::select! {
                    biased;
                    () = handle.canceled() => return Err(Error::canceled(&config)),
                    () = sleep(retry_delay) => {}
                }
            }
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        interceptors: &InterceptorSnapshot,
        base: &Arc<RequestConfig>,
        handle: &CancelHandle,
    ) -> crate::Result<Response> {
        let signal = handle.attempt_signal();
        let config = interceptors
            .run_request(RequestConfig::clone(base))
            .await
            .map_err(|error| error.or_config(base))?;
        let config = Arc::new(config);
        if signal.is_aborted() {
            return Err(Error::canceled(&config));
        }

        let url = resolve_uri(config.base_url(), config.url())
            .map(|url| append_query_pairs(&url, config.query()))
            .map_err(|error| error.or_config(&config))?;
        let (body, headers) = body::encode(
            config.payload(),
            config.content_type(),
            config.headers().clone(),
        )
        .map_err(|error| error.or_config(&config))?;
        let snapshot = RequestSnapshot {
            method: config.method().clone(),
            url: url.clone(),
            headers: headers.clone(),
        };
        let request = TransportRequest {
            method: config.method().clone(),
            url,
            headers,
            body,
        };

        debug!(empty_body = request.body.is_empty(), "sending request");
        let timeout = config.timeout();
        let exchange = self.exchange(
            request,
            signal.clone(),
            config.response_type(),
            config.parse_json(),
        );
        let outcome = tokio::select! {
            biased;
            () = signal.aborted() => Err(abort_error(&signal, &config, snapshot.clone(), timeout)),
            result = exchange => result.map_err(|error| {
                if signal.is_aborted() {
                    abort_error(&signal, &config, snapshot.clone(), timeout)
                } else {
                    Error::network(&config, Some(snapshot.clone()), error)
                }
            }),
            () = attempt_deadline(timeout) => {
                signal.abort(AbortReason::Timeout);
                Err(abort_error(&signal, &config, snapshot.clone(), timeout))
            }
        };
        let (status, response_headers, body) = outcome?;
        if handle.is_canceled() {
            return Err(Error::canceled(&config).with_request(snapshot));
        }

        if !status.is_success() {
            debug!(status = status.as_u16(), "request failed with non-success status");
            return Err(Error::bad_response(
                &config,
                snapshot,
                ResponseSnapshot {
                    status,
                    status_text: status_text(status),
                    headers: response_headers,
                },
                body,
            ));
        }
        debug!(status = status.as_u16(), "request completed");

        let response = Response::new(status, response_headers, body, Arc::clone(&config));
        let response = interceptors
            .run_response(response)
            .await
            .map_err(|error| error.or_config(&config))?;
        if let Some(schema) = config.schema() {
            validate_response(schema.as_ref(), &response, &config)?;
        }
        Ok(response)
    }

    async fn exchange(
        &self,
        request: TransportRequest,
        signal: AbortSignal,
        response_type: ResponseType,
        parse_json: bool,
    ) -> Result<(StatusCode, HeaderMap, ResponseBody), TransportError> {
        let response = self.transport.send(request, signal).await?;
        let status = response.status();
        let headers = response.headers().clone();
        // Failing responses are decoded for diagnostics even when the caller
        // asked for the raw transport response.
        let response_type = if !status.is_success() && response_type == ResponseType::Raw {
            ResponseType::Auto
        } else {
            response_type
        };
        let body = body::decode(response, response_type, parse_json).await?;
        Ok((status, headers, body))
    }
}

/// A result produced after cancel was requested is replaced by `Canceled`.
fn settle(
    handle: &CancelHandle,
    config: &Arc<RequestConfig>,
    result: crate::Result<Response>,
) -> crate::Result<Response> {
    match result {
        Err(error) if error.is_canceled() => Err(error),
        _ if handle.is_canceled() => Err(Error::canceled(config)),
        other => other,
    }
}

async fn attempt_deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => sleep(timeout).await,
        None => std::future::pending::<()>().await,
    }
}

fn abort_error(
    signal: &AbortSignal,
    config: &Arc<RequestConfig>,
    snapshot: RequestSnapshot,
    timeout: Option<Duration>,
) -> Error {
    match signal.reason() {
        Some(AbortReason::Timeout) => {
            Error::timed_out(config, snapshot, timeout.unwrap_or_default())
        }
        _ => Error::canceled(config).with_request(snapshot),
    }
}

fn validate_response(
    schema: &dyn ResponseSchema,
    response: &Response,
    config: &Arc<RequestConfig>,
) -> crate::Result<()> {
    let outcome = catch_unwind(AssertUnwindSafe(|| schema.validate(response.body())));
    let error = match outcome {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(source @ SchemaError::Mismatch(_))) => Error::new(
            ErrorCode::ValidationFailed,
            format!("{source}: {}", config.describe()),
        )
        .with_source(source),
        Ok(Err(source @ SchemaError::Internal(_))) => Error::new(
            ErrorCode::ValidationUnknown,
            format!("{source}: {}", config.describe()),
        )
        .with_source(source),
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|text| (*text).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "validator panicked".to_owned());
            Error::new(
                ErrorCode::ValidationUnknown,
                format!("schema validator failed: {detail}: {}", config.describe()),
            )
        }
    };
    Err(error
        .with_config(Arc::clone(config))
        .with_response(ResponseSnapshot {
            status: response.status(),
            status_text: response.status_text().to_owned(),
            headers: response.headers().clone(),
        })
        .with_body(response.body().clone()))
}
