//! Response streams that finish the call when they end

use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;
use observability::chain::guarded_sync;
use tonic::{Code, Status};

use crate::call::CallScope;

/// Server-streaming response body that logs the call once the stream
/// completes, fails or is dropped by the client
///
/// Panics raised while producing items are recovered into a final
/// `Internal` item.
pub struct InstrumentedStream<S> {
    inner: Pin<Box<S>>,
    scope: CallScope,
}

impl<S> fmt::Debug for InstrumentedStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentedStream")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl<S> InstrumentedStream<S> {
    pub(crate) fn new(inner: S, scope: CallScope) -> Self {
        Self {
            inner: Box::pin(inner),
            scope,
        }
    }
}

impl<S, T> Stream for InstrumentedStream<S>
where
    S: Stream<Item = Result<T, Status>>,
{
    type Item = Result<T, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.scope.is_finished() {
            return Poll::Ready(None);
        }

        let polled = {
            let _current = this.scope.context().attach();
            guarded_sync(|| this.inner.as_mut().poll_next(cx))
        };
        match polled {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(Some(Ok(item)))) => Poll::Ready(Some(Ok(item))),
            Ok(Poll::Ready(Some(Err(status)))) => {
                this.scope.finish(status.code(), Some(status.message()));
                Poll::Ready(Some(Err(status)))
            },
            Ok(Poll::Ready(None)) => {
                this.scope.finish(Code::Ok, None);
                Poll::Ready(None)
            },
            Err(caught) => Poll::Ready(Some(Err(this.scope.recover(caught)))),
        }
    }
}
