//! Request handlers keyed by kind id.

use crate::message::{Request, Response};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Future returned by a [`RequestHandler`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Response> + Send + 'a>>;

/// Produces a response for every request of one kind.
pub trait RequestHandler: Send + Sync + 'static {
    /// The request kind this handler answers.
    fn kind_id(&self) -> u32;

    fn handle(&self, request: Request) -> HandlerFuture<'_>;
}

struct FnHandler<F> {
    kind_id: u32,
    f: F,
}

impl<F> RequestHandler for FnHandler<F>
where
    F: Fn(&Request) -> Response + Send + Sync + 'static,
{
    fn kind_id(&self) -> u32 {
        self.kind_id
    }

    fn handle(&self, request: Request) -> HandlerFuture<'_> {
        let response = (self.f)(&request);
        Box::pin(async move { response })
    }
}

struct AsyncFnHandler<F> {
    kind_id: u32,
    f: F,
}

impl<F, Fut> RequestHandler for AsyncFnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    fn kind_id(&self) -> u32 {
        self.kind_id
    }

    fn handle(&self, request: Request) -> HandlerFuture<'_> {
        Box::pin((self.f)(request))
    }
}

/// Wrap a synchronous closure as a handler.
pub fn handler_fn<F>(kind_id: u32, f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(&Request) -> Response + Send + Sync + 'static,
{
    Arc::new(FnHandler { kind_id, f })
}

/// Wrap an async closure as a handler.
pub fn handler_async<F, Fut>(kind_id: u32, f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(AsyncFnHandler { kind_id, f })
}

/// Handlers registered on an endpoint. At most one per kind id.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<u32, Arc<dyn RequestHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any existing one for the same kind id.
    pub async fn register(&self, handler: Arc<dyn RequestHandler>) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.write().await.insert(handler.kind_id(), handler)
    }

    pub async fn unregister(&self, kind_id: u32) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.write().await.remove(&kind_id)
    }

    pub async fn get(&self, kind_id: u32) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.read().await.get(&kind_id).cloned()
    }

    /// Registered kind ids in ascending order.
    pub async fn kind_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.handlers.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
