//! Panic containment at the request boundary

use std::{
    any::Any,
    backtrace::Backtrace,
    cell::{Cell, RefCell},
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Once,
    task::Poll,
};

thread_local! {
    static GUARD_DEPTH: Cell<usize> = const { Cell::new(0) };
    static LAST_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// A panic converted into a plain value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    /// Panic payload rendered as text
    pub message: String,
    /// Backtrace taken where the panic was raised
    pub stack: String,
}

/// Panic caught by [`guarded`]
///
/// Keeps the original payload so routes that opt out of recovery can
/// re-raise it unchanged.
pub struct CaughtPanic {
    failure: HandlerFailure,
    payload: Box<dyn Any + Send>,
}

impl fmt::Debug for CaughtPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaughtPanic")
            .field("failure", &self.failure)
            .finish_non_exhaustive()
    }
}

impl CaughtPanic {
    fn new(payload: Box<dyn Any + Send>, stack: String) -> Self {
        let message = payload_message(payload.as_ref());
        Self {
            failure: HandlerFailure { message, stack },
            payload,
        }
    }

    pub const fn failure(&self) -> &HandlerFailure {
        &self.failure
    }

    pub fn into_failure(self) -> HandlerFailure {
        self.failure
    }

    /// Continue unwinding with the original payload
    pub fn resume(self) -> ! {
        panic::resume_unwind(self.payload)
    }
}

/// Drive `future` to completion, converting a panic in any poll into
/// [`CaughtPanic`]
///
/// Polls happen inside the caller's task, so request-local state such as
/// the attached OpenTelemetry context is still in effect when it fails.
pub async fn guarded<F: Future>(future: F) -> Result<F::Output, CaughtPanic> {
    install_hook();
    let mut future = std::pin::pin!(future);
    std::future::poll_fn(|cx| {
        let _depth = DepthGuard::enter();
        match panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(cx))) {
            Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => {
                let stack = take_stack()
                    .unwrap_or_else(|| Backtrace::force_capture().to_string());
                Poll::Ready(Err(CaughtPanic::new(payload, stack)))
            },
        }
    })
    .await
}

/// Run a synchronous closure the same way [`guarded`] runs a future
pub fn guarded_sync<T>(f: impl FnOnce() -> T) -> Result<T, CaughtPanic> {
    install_hook();
    let _depth = DepthGuard::enter();
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let stack = take_stack().unwrap_or_else(|| Backtrace::force_capture().to_string());
        CaughtPanic::new(payload, stack)
    })
}

/// Text of a panic payload; `panic!` produces `&str` or `String`
pub fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        GUARD_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        GUARD_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn take_stack() -> Option<String> {
    LAST_STACK.with(|slot| slot.borrow_mut().take())
}

/// Capture stacks for panics raised under a guard; leave every other
/// panic to the hook that was installed before
fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if GUARD_DEPTH.with(Cell::get) == 0 {
                previous(info);
                return;
            }
            let location = info
                .location()
                .map_or_else(|| "unknown location".to_string(), ToString::to_string);
            let stack = format!("panicked at {location}\n{}", Backtrace::force_capture());
            LAST_STACK.with(|slot| *slot.borrow_mut() = Some(stack));
        }));
    });
}
