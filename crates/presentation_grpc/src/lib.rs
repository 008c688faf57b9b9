//! gRPC transport adapter for the observability chain
//!
//! tonic services call through [`GrpcInstrumentation`] from their trait
//! methods. Each call gets a server span continued from the request
//! metadata, panic recovery into `Internal`, and one request record.
//!
//! ```ignore
//! #[tonic::async_trait]
//! impl Greeter for GreeterService {
//!     async fn say_hello(
//!         &self,
//!         request: Request<HelloRequest>,
//!     ) -> Result<Response<HelloReply>, Status> {
//!         self.observability
//!             .unary(RpcInfo::unary("/helloworld.Greeter/SayHello"), request, |request| async move {
//!                 Ok(Response::new(HelloReply { message: request.into_inner().name }))
//!             })
//!             .await
//!     }
//! }
//! ```

mod call;
pub mod propagation;
mod stream;

use std::future::Future;

use futures::Stream;
use observability::{
    Instrumentation,
    chain::{attached, guarded},
};
use tonic::{Request, Response, Status};

pub use call::{INTERNAL_MESSAGE, RpcInfo, TRACE_ID_TRAILER, classify, code_name};
pub use propagation::{MetadataExtractor, MetadataInjector, extract_context, inject_context};
pub use stream::InstrumentedStream;

use crate::call::CallScope;

/// Tracing, recovery and logging for tonic handlers
#[derive(Debug, Clone)]
pub struct GrpcInstrumentation {
    instrumentation: Instrumentation,
}

impl GrpcInstrumentation {
    pub const fn new(instrumentation: Instrumentation) -> Self {
        Self { instrumentation }
    }

    pub const fn instrumentation(&self) -> &Instrumentation {
        &self.instrumentation
    }

    /// Run a call that produces a single response
    ///
    /// Covers unary and client-streaming methods. Dropping the returned
    /// future before it completes logs the call as `Cancelled`.
    pub async fn unary<Req, Res, F, Fut>(
        &self,
        info: RpcInfo,
        mut request: Request<Req>,
        handler: F,
    ) -> Result<Response<Res>, Status>
    where
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Res>, Status>>,
    {
        let mut scope = CallScope::start(self.instrumentation.clone(), info, &mut request);
        let call = guarded(async move { handler(request).await });

        match attached(scope.context(), call).await {
            Ok(result) => {
                match &result {
                    Ok(_) => scope.finish(tonic::Code::Ok, None),
                    Err(status) => scope.finish(status.code(), Some(status.message())),
                }
                result
            },
            Err(caught) => Err(scope.recover(caught)),
        }
    }

    /// Run a call that answers with a stream
    ///
    /// Covers server-streaming and bidirectional methods. The call is logged
    /// when the returned stream ends rather than when this future resolves.
    pub async fn streaming<Req, T, S, F, Fut>(
        &self,
        info: RpcInfo,
        mut request: Request<Req>,
        handler: F,
    ) -> Result<Response<InstrumentedStream<S>>, Status>
    where
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<S>, Status>>,
        S: Stream<Item = Result<T, Status>>,
    {
        let mut scope = CallScope::start(self.instrumentation.clone(), info, &mut request);
        let call = guarded(async move { handler(request).await });

        match attached(scope.context(), call).await {
            Ok(Ok(response)) => {
                let (metadata, stream, extensions) = response.into_parts();
                Ok(Response::from_parts(
                    metadata,
                    InstrumentedStream::new(stream, scope),
                    extensions,
                ))
            },
            Ok(Err(status)) => {
                scope.finish(status.code(), Some(status.message()));
                Err(status)
            },
            Err(caught) => Err(scope.recover(caught)),
        }
    }
}
