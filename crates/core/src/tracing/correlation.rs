//! Correlation context for the request currently being handled
//!
//! The active [`TraceContext`] lives in a tokio task-local slot, so every
//! in-flight request sees its own identity even when many of them are
//! interleaved on the same worker thread. Only code running outside of any
//! tokio runtime (startup, plain threads) falls back to a thread-local slot.
//!
//! On a runtime, a task that was not started through [`scope`], [`inherit`]
//! or [`spawn`] has no slot: [`set`] leaves nothing behind and [`get`]
//! returns `None`. Worker threads are shared by many tasks, so a value
//! written there would be visible to whichever task runs next.
//!
//! Child tasks do not see the slot of their parent automatically: wrap them
//! with [`inherit`] or start them with [`spawn`] to copy the current value in.

use std::cell::RefCell;
use std::future::Future;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::tracing::trace_context::TraceContext;

type Slot = RefCell<Option<TraceContext>>;

tokio::task_local! {
    static TASK_CONTEXT: Slot;
}

thread_local! {
    static THREAD_CONTEXT: Slot = const { RefCell::new(None) };
}

/// Run `f` against the innermost slot visible from here, if there is one
fn with_slot<R>(mut f: impl FnMut(&Slot) -> R) -> Option<R> {
    match TASK_CONTEXT.try_with(|slot| f(slot)) {
        Ok(value) => Some(value),
        Err(_) if Handle::try_current().is_ok() => None,
        Err(_) => Some(THREAD_CONTEXT.with(|slot| f(slot))),
    }
}

/// Captures the value that was active before a [`set`]
///
/// Hand it back to [`restore`] exactly once.
#[must_use = "the previous correlation context is lost unless the token is restored"]
#[derive(Debug)]
pub struct RestoreToken {
    previous: Option<TraceContext>,
    installed: bool,
}

/// Install `ctx` as the active context, returning a token for the old one
///
/// Without a slot (a task on a runtime that was not started through
/// [`scope`], [`inherit`] or [`spawn`]) nothing is installed and the token
/// restores nothing.
pub fn set(ctx: TraceContext) -> RestoreToken {
    match with_slot(|slot| slot.replace(Some(ctx))) {
        Some(previous) => RestoreToken {
            previous,
            installed: true,
        },
        None => RestoreToken {
            previous: None,
            installed: false,
        },
    }
}

/// Get the active context, if any
pub fn get() -> Option<TraceContext> {
    with_slot(|slot| *slot.borrow()).flatten()
}

/// Revert to the value captured by [`set`]
pub fn restore(token: RestoreToken) {
    if !token.installed {
        return;
    }
    let previous = token.previous;
    with_slot(|slot| {
        slot.replace(previous);
    });
}

/// Trace ID of the active context as lowercase hex
pub fn current_trace_id() -> Option<String> {
    get().map(|ctx| ctx.trace_id().to_hex())
}

/// Span ID of the active context as lowercase hex
pub fn current_span_id() -> Option<String> {
    get().map(|ctx| ctx.span_id().to_hex())
}

/// RAII guard for setting the correlation context in a scope
///
/// The previous value is put back when the guard drops, which also happens
/// while unwinding and when the owning future is cancelled.
#[derive(Debug)]
pub struct CorrelationScope {
    token: Option<RestoreToken>,
}

impl CorrelationScope {
    /// Create a new correlation scope
    pub fn enter(ctx: TraceContext) -> Self {
        Self {
            token: Some(set(ctx)),
        }
    }
}

impl Drop for CorrelationScope {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            restore(token);
        }
    }
}

/// Run `future` with `ctx` as its correlation context
///
/// The future gets a private slot, so concurrent scopes never observe each
/// other and the caller's own value is untouched once it completes.
pub fn scope<F>(ctx: TraceContext, future: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    TASK_CONTEXT.scope(RefCell::new(get()), async move {
        let _scope = CorrelationScope::enter(ctx);
        future.await
    })
}

/// Give `future` a copy of the current correlation context
pub fn inherit<F>(future: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    TASK_CONTEXT.scope(RefCell::new(get()), future)
}

/// Spawn a task that inherits the current correlation context by copy
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(inherit(future))
}
