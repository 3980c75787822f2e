//! Middleware trait and type erasure.
//!
//! # How async middleware is stored
//!
//! A stack has to hold middleware of *different* concrete types in one
//! `Arc<[_]>`. Rust collections hold one concrete type, so every entry is a
//! trait object (`dyn Middleware`) behind an `Arc`. That is the same erasure
//! a router uses to keep handlers of different types in one table.
//!
//! The chain from user code to vtable call is:
//!
//! ```text
//! async fn auth(ctx: Ctx, next: Next<…>) -> Result<…> { … }  ← user writes this
//!        ↓ Compose::new().with(auth)
//! from_fn(auth).boxed()                                      ← FromFn wrapper
//!        ↓  stored as BoxedMiddleware = Arc<dyn Middleware>
//! middleware.call(ctx, next)  at dispatch time               ← one vtable dispatch
//!        ↓
//! Box::pin(auth(ctx, next))                                  ← BoxFuture
//! ```
//!
//! Each stage costs one virtual call and one boxed future.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::next::Next;

/// A heap-allocated, type-erased future.
///
/// `Send + 'static` so the whole chain can be spawned on a multi-threaded
/// tokio runtime.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A type-erased middleware shared by every invocation of a stack.
pub type BoxedMiddleware<C, R, E> = Arc<dyn Middleware<C, R, E>>;

/// One stage of a composed stack.
///
/// A middleware receives the shared context and the continuation for the
/// rest of the stack. What it does with `next` decides the control flow:
///
/// - `next.run().await` enters the downstream stages and resumes here once
///   they have all finished. Code after the await runs on the way back up.
/// - Not running `next` short-circuits the stack. The middleware's own
///   result becomes the result of the whole chain.
/// - Returning `Err` fails the whole chain. Upstream stages see the error
///   from their `next.run().await`.
///
/// Closures and `async fn`s get this trait through [`from_fn`]. Implement it
/// directly for middleware that carries configuration.
pub trait Middleware<C, R, E>: Send + Sync + 'static {
    fn call(&self, ctx: C, next: Next<C, R, E>) -> BoxFuture<Result<R, E>>;

    /// Erases the concrete type so the middleware can sit in a stack.
    fn boxed(self) -> BoxedMiddleware<C, R, E>
    where
        Self: Sized,
    {
        Arc::new(self)
    }
}

/// An already-erased middleware is still a middleware. `boxed` hands the
/// same `Arc` back instead of wrapping it again.
impl<C, R, E> Middleware<C, R, E> for BoxedMiddleware<C, R, E>
where
    C: 'static,
    R: 'static,
    E: 'static,
{
    fn call(&self, ctx: C, next: Next<C, R, E>) -> BoxFuture<Result<R, E>> {
        (**self).call(ctx, next)
    }

    fn boxed(self) -> BoxedMiddleware<C, R, E> {
        self
    }
}

/// Adapts a function into a [`Middleware`].
///
/// Any `Fn(C, Next<C, R, E>) -> impl Future<Output = Result<R, E>>` works:
///
/// - named `async fn` items
/// - closures returning an `async move { … }` block
/// - synchronous bodies returning `std::future::ready(…)` or `next.run()`
///
/// ```rust
/// use tsu_compose::{from_fn, BoxedMiddleware, Error, Middleware, Next};
///
/// async fn passthrough(_ctx: (), next: Next<(), (), Error>) -> Result<(), Error> {
///     next.run().await
/// }
///
/// let stage: BoxedMiddleware<(), (), Error> = from_fn(passthrough).boxed();
/// ```
pub fn from_fn<C, R, E, F, Fut>(f: F) -> FromFn<F>
where
    F: Fn(C, Next<C, R, E>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    FromFn(f)
}

/// Newtype wrapper that holds a function `F` and implements [`Middleware`],
/// bridging the typed world to the trait-object world.
#[derive(Clone, Copy)]
pub struct FromFn<F>(F);

impl<C, R, E, F, Fut> Middleware<C, R, E> for FromFn<F>
where
    F: Fn(C, Next<C, R, E>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    fn call(&self, ctx: C, next: Next<C, R, E>) -> BoxFuture<Result<R, E>> {
        Box::pin((self.0)(ctx, next))
    }
}
