//! Cancellation for logical calls and their attempts.
//!
//! A [`CancelHandle`] exists once per logical call. Every attempt derives a
//! fresh [`AbortSignal`] from it; that signal is the only one a transport
//! ever sees. Aborting an attempt because its timeout fired records
//! [`AbortReason::Timeout`] so the executor can tell it apart from an
//! explicit cancel.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::response::Response;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    Canceled,
    Timeout,
}

/// Caller-facing cancellation for one logical call.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Whichever attempt is in flight is aborted and
    /// the call settles with a canceled error.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) async fn canceled(&self) {
        self.token.cancelled().await;
    }

    pub(crate) fn attempt_signal(&self) -> AbortSignal {
        AbortSignal::from_token(self.token.child_token())
    }
}

/// Per-attempt abort signal handed to the transport.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<AbortReason>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    /// A standalone signal, for driving a transport outside the engine.
    pub fn new() -> Self {
        Self::from_token(CancellationToken::new())
    }

    fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            reason: Arc::new(OnceLock::new()),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the attempt has been aborted.
    pub async fn aborted(&self) {
        self.token.cancelled().await;
    }

    /// Why the signal fired. A signal aborted through its parent call reports
    /// [`AbortReason::Canceled`].
    pub fn reason(&self) -> Option<AbortReason> {
        if let Some(reason) = self.reason.get() {
            return Some(*reason);
        }
        self.token.is_cancelled().then_some(AbortReason::Canceled)
    }

    /// Abort with a reason. The first recorded reason wins.
    pub fn abort(&self, reason: AbortReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }
}

/// Pending result of one logical call, with cancellation.
///
/// Awaiting it yields the envelope or the error. The call does not make
/// progress until polled.
pub struct CancelableRequest {
    handle: CancelHandle,
    future: BoxFuture<'static, crate::Result<Response>>,
}

impl CancelableRequest {
    pub(crate) fn new(
        handle: CancelHandle,
        future: BoxFuture<'static, crate::Result<Response>>,
    ) -> Self {
        Self { handle, future }
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.handle.is_canceled()
    }

    /// Handle that can cancel this call from elsewhere, e.g. another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }
}

impl std::fmt::Debug for CancelableRequest {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CancelableRequest")
            .field("canceled", &self.is_canceled())
            .finish_non_exhaustive()
    }
}

impl Future for CancelableRequest {
    type Output = crate::Result<Response>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().future.as_mut().poll(cx)
    }
}

/// Forward a caller-owned token into the call handle. Resolves once the call
/// has been canceled through it.
pub(crate) async fn forward_external_cancel(external: CancellationToken, handle: CancelHandle) {
    external.cancelled().await;
    handle.cancel();
}
