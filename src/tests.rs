use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, StatusCode};
use serde_json::json;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::auth::AuthRetryPolicy;
use crate::body::{ResponseBody, WireBody};
use crate::cancel::{AbortReason, AbortSignal, CancelHandle};
use crate::client::Client;
use crate::config::{RequestConfig, ResponseType};
use crate::error::{Error, ErrorCode, TransportErrorKind};
use crate::interceptor::ErrorOutcome;
use crate::response::Response;
use crate::retry::{Backoff, RetryPolicy, RetrySettings};
use crate::schema::{JsonSchema, SchemaError};
use crate::transport::{
    BoxError, Transport, TransportBody, TransportError, TransportRequest, TransportResponse,
};

type Reply = Result<TransportResponse, TransportError>;
type Responder = Box<dyn Fn(usize, &TransportRequest) -> BoxFuture<'static, Reply> + Send + Sync>;

struct Recorded {
    at: Instant,
    request: TransportRequest,
    signal: AbortSignal,
}

struct ScriptedTransport {
    calls: Mutex<Vec<Recorded>>,
    responder: Responder,
}

impl ScriptedTransport {
    /// `responder` gets the 1-based call number and the request.
    fn new<F, Fut>(responder: F) -> Arc<Self>
    where
        F: Fn(usize, &TransportRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Reply> + Send + 'static,
    {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(move |call, request| Box::pin(responder(call, request))),
        })
    }

    fn count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    fn gaps(&self) -> Vec<Duration> {
        let calls = self.calls.lock().expect("calls lock");
        calls
            .windows(2)
            .map(|pair| pair[1].at.duration_since(pair[0].at))
            .collect()
    }

    fn header(&self, call: usize, name: &str) -> Option<String> {
        let calls = self.calls.lock().expect("calls lock");
        calls[call]
            .request
            .headers
            .get(name)
            .map(|value| value.to_str().expect("ascii header").to_owned())
    }

    fn url(&self, call: usize) -> String {
        self.calls.lock().expect("calls lock")[call].request.url.clone()
    }

    fn signal(&self, call: usize) -> AbortSignal {
        self.calls.lock().expect("calls lock")[call].signal.clone()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: TransportRequest, signal: AbortSignal) -> BoxFuture<'_, Reply> {
        let call = {
            let mut calls = self.calls.lock().expect("calls lock");
            calls.push(Recorded {
                at: Instant::now(),
                request: request.clone(),
                signal,
            });
            calls.len()
        };
        (self.responder)(call, &request)
    }
}

fn reply(status: u16, body: &'static str) -> Reply {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(TransportResponse::new(
        StatusCode::from_u16(status).expect("valid status"),
        headers,
        TransportBody::from(body),
    ))
}

fn client_for(transport: &Arc<ScriptedTransport>) -> Client {
    Client::builder()
        .base_url("http://engine.test")
        .transport_arc(transport.clone())
        .build()
}

fn recovered(error: &Error, body: serde_json::Value) -> Response {
    let config = error
        .config()
        .cloned()
        .unwrap_or_else(|| RequestConfig::get("http://engine.test/"));
    Response::new(
        StatusCode::OK,
        HeaderMap::new(),
        ResponseBody::Json(body),
        Arc::new(config),
    )
}

#[tokio::test]
async fn later_request_interceptors_see_and_override_earlier_ones() {
    let transport = ScriptedTransport::new(|_, _: &TransportRequest| async { reply(200, "{}") });
    let client = client_for(&transport);
    client
        .interceptors()
        .request()
        .register(|config: RequestConfig| async move { config.try_with_header("x-stage", "r1") });
    client
        .interceptors()
        .request()
        .register(|config: RequestConfig| async move {
            let previous = config.headers()["x-stage"]
                .to_str()
                .expect("ascii")
                .to_owned();
            config
                .try_with_header("x-stage", "r2")?
                .try_with_header("x-previous", &previous)
        });

    client.get("/items").send().await.expect("call succeeds");
    assert_eq!(transport.header(0, "x-stage").as_deref(), Some("r2"));
    assert_eq!(transport.header(0, "x-previous").as_deref(), Some("r1"));
}

#[tokio::test(start_paused = true)]
async fn interceptor_removal_only_affects_calls_started_afterwards() {
    let transport = ScriptedTransport::new(|call, request: &TransportRequest| {
        let first_x_attempt = call == 1 && request.url.ends_with("/x");
        async move {
            if first_x_attempt {
                reply(503, "{}")
            } else {
                reply(200, "{}")
            }
        }
    });
    let client = client_for(&transport);
    let handle = client
        .interceptors()
        .request()
        .register(|config: RequestConfig| async move { config.try_with_header("x-tag", "on") });

    let client_x = client.clone();
    let call_x = tokio::spawn(async move {
        client_x
            .get("/x")
            .retry_policy(RetryPolicy::Count(1))
            .send()
            .await
    });
    while transport.count() == 0 {
        tokio::task::yield_now().await;
    }

    assert!(client.interceptors().remove(&handle));
    client.get("/y").send().await.expect("call y succeeds");
    call_x
        .await
        .expect("task joins")
        .expect("call x succeeds on retry");

    assert_eq!(transport.count(), 3);
    assert!(transport.url(0).ends_with("/x"));
    assert_eq!(transport.header(0, "x-tag").as_deref(), Some("on"));
    assert!(transport.url(1).ends_with("/y"));
    assert_eq!(transport.header(1, "x-tag"), None);
    assert!(transport.url(2).ends_with("/x"));
    assert_eq!(transport.header(2, "x-tag").as_deref(), Some("on"));
}

#[tokio::test]
async fn interceptors_are_captured_when_the_call_is_sent() {
    let transport = ScriptedTransport::new(|_, _: &TransportRequest| async { reply(200, "{}") });
    let client = client_for(&transport);
    let handle = client
        .interceptors()
        .request()
        .register(|config: RequestConfig| async move { config.try_with_header("x-tag", "on") });

    let call_x = client.get("/x").send();
    assert!(client.interceptors().remove(&handle));
    let call_y = client.get("/y").send();

    call_x.await.expect("call x succeeds");
    call_y.await.expect("call y succeeds");
    assert!(transport.url(0).ends_with("/x"));
    assert_eq!(transport.header(0, "x-tag").as_deref(), Some("on"));
    assert!(transport.url(1).ends_with("/y"));
    assert_eq!(transport.header(1, "x-tag"), None);
}

#[tokio::test(start_paused = true)]
async fn retry_exhaustion_makes_n_plus_one_attempts_with_linear_backoff() {
    let transport = ScriptedTransport::new(|_, _: &TransportRequest| async { reply(503, "{}") });
    let client = client_for(&transport);

    let error = client
        .get("/flaky")
        .retry_policy(
            RetrySettings::new(3)
                .retryable_status_codes([503])
                .backoff(Backoff::linear(Duration::from_millis(100))),
        )
        .send()
        .await
        .expect_err("every attempt fails");

    assert_eq!(error.code(), ErrorCode::BadResponse);
    assert_eq!(error.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    assert_eq!(transport.count(), 4);
    let expected = [100, 200, 300].map(Duration::from_millis);
    for (gap, expected) in transport.gaps().into_iter().zip(expected) {
        assert!(
            gap >= expected && gap < expected + Duration::from_millis(5),
            "gap {gap:?} expected {expected:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn count_policy_backs_off_exponentially() {
    let transport = ScriptedTransport::new(|_, _: &TransportRequest| async { reply(500, "{}") });
    let client = client_for(&transport);

    client
        .get("/down")
        .retry_policy(RetryPolicy::Count(2))
        .send()
        .await
        .expect_err("every attempt fails");

    assert_eq!(transport.count(), 3);
    let gaps = transport.gaps();
    assert!(gaps[0] >= Duration::from_secs(1) && gaps[0] < Duration::from_millis(1005));
    assert!(gaps[1] >= Duration::from_secs(2) && gaps[1] < Duration::from_millis(2005));
}

#[tokio::test]
async fn statuses_outside_the_allow_list_are_not_retried() {
    let transport = ScriptedTransport::new(|_, _: &TransportRequest| async { reply(404, "{}") });
    let client = client_for(&transport);

    let error = client
        .get("/missing")
        .retry_policy(RetrySettings::new(3).retryable_status_codes([503]))
        .send()
        .await
        .expect_err("404 is final");
    assert_eq!(error.status(), Some(StatusCode::NOT_FOUND));
    assert_eq!(transport.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn network_failures_are_retried_and_then_succeed() {
    let transport = ScriptedTransport::new(|call, _: &TransportRequest| async move {
        if call == 1 {
            Err(TransportError::new(
                TransportErrorKind::Connect,
                "connection refused",
            ))
        } else {
            reply(200, r#"{"ok":true}"#)
        }
    });
    let client = client_for(&transport);

    let response = client
        .get("/items")
        .retry_policy(RetrySettings::new(1).retryable_status_codes([503]))
        .send()
        .await
        .expect("second attempt succeeds");
    assert_eq!(response.body().as_json(), Some(&json!({ "ok": true })));
    assert_eq!(transport.count(), 2);
}

#[tokio::test]
async fn exhausted_network_failure_keeps_transport_kind() {
    let transport = ScriptedTransport::new(|_, _: &TransportRequest| async {
        Err(TransportError::new(TransportErrorKind::Dns, "no such host"))
    });
    let client = client_for(&transport);

    let error = client
        .get("/items")
        .send()
        .await
        .expect_err("network failure");
    assert_eq!(error.code(), ErrorCode::Network);
    assert_eq!(error.transport_kind(), Some(TransportErrorKind::Dns));
    assert!(error.request().is_some());
    assert!(error.config().is_some());
}

#[tokio::test]
async fn auth_refresh_reissues_once_without_consuming_retries() {
    let token = Arc::new(Mutex::new("stale".to_owned()));
    let refreshes = Arc::new(AtomicUsize::new(0));
    let transport = ScriptedTransport::new(|_, request: &TransportRequest| {
        let authorized = request
            .headers
            .get("authorization")
            .is_some_and(|value| value == "Bearer fresh");
        async move {
            if authorized {
                reply(200, r#"{"user":"ada"}"#)
            } else {
                reply(401, r#"{"error":"expired"}"#)
            }
        }
    });
    let client = client_for(&transport);
    let interceptor_token = Arc::clone(&token);
    client
        .interceptors()
        .request()
        .register(move |config: RequestConfig| {
            let value = format!("Bearer {}", interceptor_token.lock().expect("token lock"));
            async move { config.try_with_header("authorization", &value) }
        });

    let refresh_token = Arc::clone(&token);
    let refresh_count = Arc::clone(&refreshes);
    let auth = AuthRetryPolicy::new(move |error: Error, config: RequestConfig| {
        refresh_count.fetch_add(1, Ordering::SeqCst);
        *refresh_token.lock().expect("token lock") = "fresh".to_owned();
        async move { error.status() == Some(StatusCode::UNAUTHORIZED) && config.auth_retry_count() == 0 }
    });

    let response = client
        .get("/me")
        .retry_policy(RetryPolicy::None)
        .auth_retry(auth)
        .send()
        .await
        .expect("refresh recovers the call");

    assert_eq!(response.body().as_json(), Some(&json!({ "user": "ada" })));
    assert_eq!(response.config().auth_retry_count(), 1);
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(transport.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn declined_refresh_surfaces_the_auth_failure_without_generic_retry() {
    let transport = ScriptedTransport::new(|_, _: &TransportRequest| async { reply(401, "{}") });
    let client = client_for(&transport);

    let error = client
        .get("/me")
        .retry_policy(RetryPolicy::Count(3))
        .auth_retry(AuthRetryPolicy::new(|_error, _config| async { false }))
        .send()
        .await
        .expect_err("refresh declined");
    assert_eq!(error.status(), Some(StatusCode::UNAUTHORIZED));
    assert_eq!(transport.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn auth_refresh_stops_after_max_attempts() {
    let transport = ScriptedTransport::new(|_, _: &TransportRequest| async { reply(401, "{}") });
    let client = client_for(&transport);

    let error = client
        .get("/me")
        .retry_policy(RetryPolicy::Count(3))
        .auth_retry(AuthRetryPolicy::new(|_error, _config| async { true }).max_attempts(2))
        .send()
        .await
        .expect_err("credentials never become valid");
    assert_eq!(error.status(), Some(StatusCode::UNAUTHORIZED));
    assert_eq!(error.config().map(RequestConfig::auth_retry_count), Some(2));
    assert_eq!(transport.count(), 3);
}

#[tokio::test(start_paused = true)]
async fn cancel_wins_over_a_longer_timeout() {
    let transport =
        ScriptedTransport::new(|_, _: &TransportRequest| std::future::pending::<Reply>());
    let client = client_for(&transport);

    let request = client
        .get("/hang")
        .timeout(Duration::from_secs(10))
        .retry_policy(RetryPolicy::Count(3))
        .send();
    let handle = request.cancel_handle();
    tokio::spawn(async move {
        sleep(Duration::from_secs(1)).await;
        handle.cancel();
    });

    let started = Instant::now();
    let error = request.await.expect_err("call is canceled");
    assert_eq!(error.code(), ErrorCode::Canceled);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(transport.count(), 1);
    assert!(transport.signal(0).is_aborted());
    assert_eq!(transport.signal(0).reason(), Some(AbortReason::Canceled));
}

#[tokio::test(start_paused = true)]
async fn timeout_aborts_the_attempt_as_timed_out() {
    let transport =
        ScriptedTransport::new(|_, _: &TransportRequest| std::future::pending::<Reply>());
    let client = client_for(&transport);

    let started = Instant::now();
    let error = client
        .get("/slow")
        .timeout(Duration::from_millis(500))
        .retry_policy(RetrySettings::new(2).retry_on_timeout(false))
        .send()
        .await
        .expect_err("call times out");
    assert_eq!(error.code(), ErrorCode::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(transport.count(), 1);
    assert_eq!(transport.signal(0).reason(), Some(AbortReason::Timeout));
}

#[tokio::test(start_paused = true)]
async fn client_timeout_applies_and_timeouts_retry_by_default() {
    let transport = ScriptedTransport::new(|call, _: &TransportRequest| async move {
        if call == 1 {
            std::future::pending::<Reply>().await
        } else {
            reply(200, "{}")
        }
    });
    let client = Client::builder()
        .base_url("http://engine.test")
        .timeout(Duration::from_millis(200))
        .retry_policy(RetryPolicy::Count(1))
        .transport_arc(transport.clone())
        .build();

    client
        .get("/slow-once")
        .send()
        .await
        .expect("retry after timeout succeeds");
    assert_eq!(transport.count(), 2);
    assert_eq!(transport.signal(0).reason(), Some(AbortReason::Timeout));
    assert!(!transport.signal(1).is_aborted());
}

#[tokio::test]
async fn cancel_before_start_never_reaches_the_transport() {
    let transport = ScriptedTransport::new(|_, _: &TransportRequest| async { reply(200, "{}") });
    let client = client_for(&transport);

    let request = client.get("/items").send();
    request.cancel();
    assert!(request.is_canceled());
    let error = request.await.expect_err("canceled up front");
    assert_eq!(error.code(), ErrorCode::Canceled);
    assert_eq!(transport.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn external_token_cancels_the_call() {
    let transport =
        ScriptedTransport::new(|_, _: &TransportRequest| std::future::pending::<Reply>());
    let client = client_for(&transport);
    let token = CancellationToken::new();

    let request = client.get("/hang").cancel_token(token.clone()).send();
    tokio::spawn(async move {
        sleep(Duration::from_millis(250)).await;
        token.cancel();
    });

    let error = request.await.expect_err("external cancel");
    assert_eq!(error.code(), ErrorCode::Canceled);
    assert!(transport.signal(0).is_aborted());
}

#[tokio::test]
async fn already_canceled_external_token_never_reaches_the_transport() {
    let transport = ScriptedTransport::new(|_, _: &TransportRequest| async { reply(200, "{}") });
    let client = client_for(&transport);
    let token = CancellationToken::new();
    token.cancel();

    let request = client.get("/items").cancel_token(token).send();
    assert!(request.is_canceled());
    let error = request.await.expect_err("token was canceled up front");
    assert_eq!(error.code(), ErrorCode::Canceled);
    assert_eq!(transport.count(), 0);
}

#[tokio::test]
async fn external_token_canceled_before_first_poll_cancels_the_call() {
    let transport = ScriptedTransport::new(|_, _: &TransportRequest| async { reply(200, "{}") });
    let client = client_for(&transport);
    let token = CancellationToken::new();

    let request = client.get("/items").cancel_token(token.clone()).send();
    token.cancel();
    let error = request.await.expect_err("token canceled before polling");
    assert_eq!(error.code(), ErrorCode::Canceled);
    assert_eq!(transport.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_backoff_stops_retrying() {
    let transport = ScriptedTransport::new(|_, _: &TransportRequest| async { reply(503, "{}") });
    let client = client_for(&transport);

    let request = client.get("/flaky").retry_policy(RetryPolicy::Count(5)).send();
    let handle = request.cancel_handle();
    tokio::spawn(async move {
        sleep(Duration::from_millis(500)).await;
        handle.cancel();
    });

    let error = request.await.expect_err("canceled while backing off");
    assert_eq!(error.code(), ErrorCode::Canceled);
    assert_eq!(transport.count(), 1);
}

#[tokio::test]
async fn result_completed_after_cancel_is_discarded() {
    let slot: Arc<Mutex<Option<CancelHandle>>> = Arc::new(Mutex::new(None));
    let transport_slot = Arc::clone(&slot);
    let transport = ScriptedTransport::new(move |_, _: &TransportRequest| {
        if let Some(handle) = transport_slot.lock().expect("slot lock").as_ref() {
            handle.cancel();
        }
        async { reply(200, "{}") }
    });
    let client = client_for(&transport);

    let request = client.get("/race").send();
    *slot.lock().expect("slot lock") = Some(request.cancel_handle());
    let error = request.await.expect_err("success after cancel is dropped");
    assert_eq!(error.code(), ErrorCode::Canceled);
    assert_eq!(transport.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn recovered_error_short_circuits_retry() {
    let transport = ScriptedTransport::new(|_, _: &TransportRequest| async { reply(500, "{}") });
    let client = client_for(&transport);
    client.interceptors().error().register(|error: Error| async move {
        if error.status() == Some(StatusCode::INTERNAL_SERVER_ERROR) {
            ErrorOutcome::Recovered(recovered(&error, json!({ "fallback": true })))
        } else {
            ErrorOutcome::Failing(error)
        }
    });

    let response = client
        .get("/unstable")
        .retry_policy(RetryPolicy::Count(3))
        .send()
        .await
        .expect("error interceptor recovers");
    assert_eq!(response.body().as_json(), Some(&json!({ "fallback": true })));
    assert_eq!(transport.count(), 1);
}

#[tokio::test]
async fn error_chain_sees_the_failure_before_it_is_returned() {
    let transport =
        ScriptedTransport::new(|_, _: &TransportRequest| async { reply(404, r#"{"error":"missing"}"#) });
    let client = client_for(&transport);
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    client.interceptors().error().register(move |error: Error| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { ErrorOutcome::Failing(error.with_message("lookup failed")) }
    });

    let error = client
        .get("/items/9")
        .send()
        .await
        .expect_err("404 fails");
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(error.message(), "lookup failed");
    assert_eq!(error.code(), ErrorCode::BadResponse);
    assert_eq!(
        error.body().and_then(ResponseBody::as_json),
        Some(&json!({ "error": "missing" }))
    );
    assert_eq!(
        error.response().map(|response| response.status_text.as_str()),
        Some("Not Found")
    );
}

#[tokio::test]
async fn failing_request_interceptor_enters_the_error_chain() {
    let transport = ScriptedTransport::new(|_, _: &TransportRequest| async { reply(200, "{}") });
    let client = client_for(&transport);
    let seen = Arc::new(AtomicUsize::new(0));
    client
        .interceptors()
        .request()
        .register(|_config: RequestConfig| async move {
            Err(Error::new(ErrorCode::Unknown, "no credentials available"))
        });
    let counter = Arc::clone(&seen);
    client.interceptors().error().register(move |error: Error| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { ErrorOutcome::Failing(error) }
    });

    let error = client.get("/items").send().await.expect_err("chain fails");
    assert_eq!(error.code(), ErrorCode::Unknown);
    assert!(error.config().is_some());
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(transport.count(), 0);
}

#[tokio::test]
async fn failing_response_interceptor_enters_the_error_chain() {
    let transport = ScriptedTransport::new(|_, _: &TransportRequest| async { reply(200, "{}") });
    let client = client_for(&transport);
    client
        .interceptors()
        .response()
        .register(|_response: Response| async move {
            Err(Error::new(ErrorCode::Unknown, "unexpected payload"))
        });
    client.interceptors().error().register(|error: Error| async move {
        ErrorOutcome::Recovered(recovered(&error, json!({ "replaced": true })))
    });

    let response = client.get("/items").send().await.expect("recovered");
    assert_eq!(response.body().as_json(), Some(&json!({ "replaced": true })));
}

#[tokio::test]
async fn bodyless_responses_are_never_read() {
    fn unreadable() -> TransportBody {
        TransportBody::Streaming(
            futures_util::stream::poll_fn(|_| -> Poll<Option<Result<Bytes, BoxError>>> {
                panic!("body of a 204 response must not be read")
            })
            .boxed(),
        )
    }

    let transport = ScriptedTransport::new(|_, _: &TransportRequest| async {
        Ok(TransportResponse::new(
            StatusCode::NO_CONTENT,
            HeaderMap::new(),
            unreadable(),
        ))
    });
    let client = client_for(&transport);

    for response_type in [
        ResponseType::Auto,
        ResponseType::Json,
        ResponseType::Text,
        ResponseType::Bytes,
        ResponseType::Raw,
    ] {
        let response = client
            .delete("/items/1")
            .response_type(response_type)
            .send()
            .await
            .expect("204 succeeds");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        match (response_type, response.body()) {
            (ResponseType::Auto | ResponseType::Json, ResponseBody::Json(value)) => {
                assert_eq!(value, &json!({}));
            }
            (ResponseType::Text, ResponseBody::Text(text)) => assert!(text.is_empty()),
            (ResponseType::Bytes, ResponseBody::Bytes(bytes)) => assert!(bytes.is_empty()),
            (ResponseType::Raw, ResponseBody::Raw(_)) => {}
            (hint, body) => panic!("unexpected body {body:?} for {hint:?}"),
        }
    }
}

#[tokio::test]
async fn structured_payload_round_trips_through_the_engine() {
    let transport = ScriptedTransport::new(|_, request: &TransportRequest| {
        let body = match &request.body {
            WireBody::Bytes(bytes) => bytes.clone(),
            _ => Bytes::new(),
        };
        let headers = request.headers.clone();
        async move {
            Ok(TransportResponse::new(
                StatusCode::OK,
                headers,
                TransportBody::Buffered(body),
            ))
        }
    });
    let client = client_for(&transport);
    let payload = json!({ "name": "widget", "tags": ["a", "b"], "meta": { "nested": {} } });

    let response = client
        .post("/echo")
        .json(&payload)
        .expect("payload serializes")
        .send()
        .await
        .expect("echo succeeds");
    assert_eq!(
        transport.header(0, "content-type").as_deref(),
        Some("application/json")
    );
    assert_eq!(response.body().as_json(), Some(&payload));
}

#[tokio::test]
async fn schema_mismatch_is_validation_failed_and_not_retried() {
    let transport =
        ScriptedTransport::new(|_, _: &TransportRequest| async { reply(200, r#"{"id":"seven"}"#) });
    let client = client_for(&transport);
    let schema = JsonSchema::new(&json!({
        "type": "object",
        "properties": { "id": { "type": "integer" } },
        "required": ["id"]
    }))
    .expect("schema compiles");

    let error = client
        .get("/items/7")
        .schema(schema)
        .retry_policy(RetryPolicy::Count(2))
        .send()
        .await
        .expect_err("shape is wrong");
    assert_eq!(error.code(), ErrorCode::ValidationFailed);
    assert_eq!(error.status(), Some(StatusCode::OK));
    assert_eq!(
        error.body().and_then(ResponseBody::as_json),
        Some(&json!({ "id": "seven" }))
    );
    assert_eq!(transport.count(), 1);
}

#[tokio::test]
async fn broken_validators_are_validation_unknown() {
    let transport = ScriptedTransport::new(|_, _: &TransportRequest| async { reply(200, "{}") });
    let client = client_for(&transport);

    let error = client
        .get("/items")
        .schema(|_body: &ResponseBody| -> Result<(), SchemaError> {
            Err(SchemaError::Internal("validator not loaded".to_owned()))
        })
        .send()
        .await
        .expect_err("validator fails");
    assert_eq!(error.code(), ErrorCode::ValidationUnknown);

    let error = client
        .get("/items")
        .schema(|_body: &ResponseBody| -> Result<(), SchemaError> {
            panic!("validator bug")
        })
        .send()
        .await
        .expect_err("validator panics");
    assert_eq!(error.code(), ErrorCode::ValidationUnknown);
    assert!(error.message().contains("validator bug"));
}

#[tokio::test]
async fn validation_failures_can_be_recovered() {
    let transport = ScriptedTransport::new(|_, _: &TransportRequest| async { reply(200, "[]") });
    let client = client_for(&transport);
    client.interceptors().error().register(|error: Error| async move {
        if error.code() == ErrorCode::ValidationFailed {
            ErrorOutcome::Recovered(recovered(&error, json!({ "items": [] })))
        } else {
            ErrorOutcome::Failing(error)
        }
    });

    let response = client
        .get("/items")
        .schema(|body: &ResponseBody| {
            if body.as_json().is_some_and(serde_json::Value::is_object) {
                Ok(())
            } else {
                Err(SchemaError::Mismatch(vec!["expected object".to_owned()]))
            }
        })
        .send()
        .await
        .expect("recovered");
    assert_eq!(response.body().as_json(), Some(&json!({ "items": [] })));
}

#[tokio::test]
async fn invalid_url_fails_through_the_returned_request() {
    let transport = ScriptedTransport::new(|_, _: &TransportRequest| async { reply(200, "{}") });
    let client = client_for(&transport);

    let error = client
        .get("ftp://files.example.com/a")
        .send()
        .await
        .expect_err("unsupported scheme");
    assert_eq!(error.code(), ErrorCode::Unknown);
    assert_eq!(transport.count(), 0);
}

#[tokio::test]
async fn client_defaults_merge_with_request_values() {
    let transport = ScriptedTransport::new(|_, _: &TransportRequest| async { reply(200, "{}") });
    let client = Client::builder()
        .base_url("http://engine.test/api/")
        .try_default_header("x-client", "reqflow-tests")
        .expect("valid header")
        .try_default_header("accept", "application/json")
        .expect("valid header")
        .transport_arc(transport.clone())
        .build();

    client
        .get("/items")
        .query_pair("page", "2")
        .try_header("accept", "text/plain")
        .expect("valid header")
        .send()
        .await
        .expect("call succeeds");
    assert_eq!(transport.url(0), "http://engine.test/api/items?page=2");
    assert_eq!(transport.header(0, "x-client").as_deref(), Some("reqflow-tests"));
    assert_eq!(transport.header(0, "accept").as_deref(), Some("text/plain"));
}

#[test]
fn build_rejects_base_url_with_userinfo() {
    let error = Client::builder()
        .base_url("https://user:pw@api.example.com")
        .try_build()
        .expect_err("userinfo is rejected");
    assert_eq!(error.code(), ErrorCode::Unknown);
    assert!(!error.message().contains("pw"));
}

#[tokio::test]
async fn send_json_deserializes_the_body() {
    #[derive(Debug, serde::Deserialize, PartialEq)]
    struct User {
        name: String,
    }

    let transport =
        ScriptedTransport::new(|_, _: &TransportRequest| async { reply(200, r#"{"name":"ada"}"#) });
    let client = client_for(&transport);
    let user: User = client.get("/me").send_json().await.expect("user");
    assert_eq!(
        user,
        User {
            name: "ada".to_owned()
        }
    );
}
