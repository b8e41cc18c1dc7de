//! Middleware pipeline. Composable before/after request handler logic.
//!
//! Each middleware wraps the next layer, enabling request inspection,
//! short-circuit responses, and response decoration. The cache engine is one
//! such layer: it answers from storage or forwards to the origin handler that
//! terminates the chain.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining middleware chain; call [`Next::run`] to
//!   advance to the next layer.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`from_middleware`] / [`from_handler`]: convert a [`Middleware`] or an
//!   origin handler into a [`MiddlewareHandler`].
//! - [`Pipeline`]: an ordered stack ending in an origin handler.

use std::{future::Future, pin::Pin, sync::Arc};

use crate::{Request, Response, StatusCode, context::Context};

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed on each call to [`run`](Self::run), so it cannot be called
/// more than once per middleware invocation.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

/// A type-erased, reference-counted middleware function.
///
/// The [`Arc`] wrapper makes handlers cheap to clone so that [`Next`] can
/// advance through the chain without copying closures.
pub type MiddlewareHandler = Arc<
    dyn Fn(Context, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static,
>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// Converts an origin handler into a terminal [`MiddlewareHandler`].
///
/// The handler never sees `next`; it is expected to sit last in the chain.
///
/// # Examples
///
/// ```rust,no_run
/// use rttp_cache::{Response, StatusCode, context::Context, middleware::from_handler};
///
/// let origin = from_handler(|_ctx: Context| async {
///     Response::new(StatusCode::Ok).header("Cache-Control", "max-age=60")
/// });
/// ```
pub fn from_handler<H, F>(handler: H) -> MiddlewareHandler
where
    H: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    Arc::new(
        move |ctx: Context, _next: Next| -> Pin<Box<dyn Future<Output = Response> + Send>> {
            Box::pin(handler(ctx))
        },
    )
}

impl Next {
    /// Creates a new `Next` positioned at the start of the given middleware stack.
    pub fn new(middlewares: impl Into<Arc<[MiddlewareHandler]>>) -> Self {
        Self {
            middlewares: middlewares.into(),
            index: 0,
        }
    }

    /// Invokes the next middleware in the chain and returns its response.
    ///
    /// If no handler remains (i.e. the chain is exhausted without producing a
    /// response), a `500 Internal Server Error` response is returned as a safe
    /// fallback.
    pub async fn run(mut self, ctx: Context) -> Response {
        match self.middlewares.get(self.index).cloned() {
            Some(handler) => {
                self.index += 1;
                handler(ctx, self).await
            }
            None => Response::new(StatusCode::InternalServerError)
                .body("No response generated by middleware pipeline"),
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may:
///
/// - **Pass through**: call `next.run(ctx).await` without modification.
/// - **Short-circuit**: return a [`Response`] directly without calling `next`.
/// - **Decorate**: call `next.run(ctx).await`, inspect the response, and return
///   a modified copy.
///
/// Implementations must be `Send + Sync` because middleware is shared across
/// Tokio tasks, and should not hold `&mut` references to shared state across
/// an `.await` point.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next middleware.
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

/// An ordered middleware stack terminated by an origin handler.
///
/// # Examples
///
/// ```rust,no_run
/// use rttp_cache::{Method, Request, Response, StatusCode, context::Context};
/// use rttp_cache::middleware::Pipeline;
///
/// # async fn example() {
/// let pipeline = Pipeline::new(|_ctx: Context| async { Response::new(StatusCode::Ok) });
/// let response = pipeline.call(Request::new(Method::Get, "/")).await;
/// assert_eq!(response.status(), StatusCode::Ok);
/// # }
/// ```
#[derive(Clone)]
pub struct Pipeline {
    layers: Vec<MiddlewareHandler>,
    origin: MiddlewareHandler,
}

impl Pipeline {
    /// Creates a pipeline whose only stage is the origin handler.
    pub fn new<H, F>(origin: H) -> Self
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        Self {
            layers: Vec::new(),
            origin: from_handler(origin),
        }
    }

    /// Adds a middleware behind the layers already registered.
    ///
    /// Layers run in registration order, outermost first.
    #[must_use]
    pub fn layer<M>(mut self, middleware: Arc<M>) -> Self
    where
        M: Middleware + 'static,
    {
        self.layers.push(from_middleware(middleware));
        self
    }

    /// Runs a request through every layer and the origin handler.
    pub async fn call(&self, request: Request) -> Response {
        let chain: Vec<MiddlewareHandler> = self
            .layers
            .iter()
            .cloned()
            .chain(std::iter::once(self.origin.clone()))
            .collect();
        Next::new(chain).run(Context::new(request)).await
    }
}
