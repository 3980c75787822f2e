//! Building a stack and running it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::Error;
use crate::middleware::{from_fn, BoxFuture, BoxedMiddleware, Middleware};
use crate::next::{self, Next, Tail};

/// What happens when dispatch runs past the end of the stack and no final
/// continuation is there to take over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Exhausted {
    /// Resolve with `R::default()`. The natural end of the chain.
    #[default]
    Succeed,
    /// Resolve with [`Error::NoContinuation`].
    Fail,
}

/// The immutable, shared part of a composed stack.
pub(crate) struct Stack<C, R, E> {
    layers: Box<[BoxedMiddleware<C, R, E>]>,
    exhausted: Exhausted,
}

impl<C, R, E> Stack<C, R, E> {
    pub(crate) fn new(layers: Vec<BoxedMiddleware<C, R, E>>, exhausted: Exhausted) -> Self {
        Self { layers: layers.into_boxed_slice(), exhausted }
    }

    pub(crate) fn get(&self, index: usize) -> Option<&BoxedMiddleware<C, R, E>> {
        self.layers.get(index)
    }

    pub(crate) fn len(&self) -> usize {
        self.layers.len()
    }

    pub(crate) fn exhausted(&self) -> Exhausted {
        self.exhausted
    }
}

/// Composes `stack` into one middleware that runs its entries in order.
///
/// The stack must be an ordered sequence of middleware. The compiler holds
/// you to that, so nothing is checked at runtime. A keyed map is rejected:
///
/// ```rust,compile_fail
/// use std::collections::HashMap;
/// use tsu_compose::{compose, BoxedMiddleware, Error};
///
/// let stack: HashMap<&str, BoxedMiddleware<(), (), Error>> = HashMap::new();
/// let composed = compose(stack);
/// ```
///
/// and so is an entry that is not callable:
///
/// ```rust,compile_fail
/// use tsu_compose::{compose, Error, Middleware};
///
/// let composed = compose::<(), (), Error>(vec![42.boxed()]);
/// ```
///
/// as is a single middleware passed where the sequence belongs:
///
/// ```rust,compile_fail
/// use tsu_compose::{compose, from_fn, Error, Next};
///
/// let composed = compose(from_fn(|_: (), next: Next<(), (), Error>| next.run()));
/// ```
pub fn compose<C, R, E>(
    stack: impl IntoIterator<Item = BoxedMiddleware<C, R, E>>,
) -> Composed<C, R, E> {
    Composed::from_stack(Stack::new(stack.into_iter().collect(), Exhausted::default()))
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// Fluent builder for a [`Composed`] stack.
///
/// Each call returns `self`, so registrations chain in the order they run:
///
/// ```rust
/// use tsu_compose::{Compose, Error, Exhausted};
///
/// let composed = Compose::<(), u32, Error>::new()
///     .with(|_ctx, next| async move { next.run().await.map(|n| n + 1) })
///     .with(|_ctx, _next| async { Ok(41) })
///     .on_exhausted(Exhausted::Fail)
///     .build();
/// ```
pub struct Compose<C, R, E> {
    layers: Vec<BoxedMiddleware<C, R, E>>,
    exhausted: Exhausted,
}

impl<C, R, E> Compose<C, R, E> {
    pub fn new() -> Self {
        Self { layers: Vec::new(), exhausted: Exhausted::default() }
    }

    /// Appends a function middleware. See [`from_fn`] for accepted shapes.
    pub fn with<F, Fut>(self, f: F) -> Self
    where
        F: Fn(C, Next<C, R, E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        self.with_middleware(from_fn(f))
    }

    /// Appends any [`Middleware`], including another [`Composed`] stack.
    pub fn with_middleware(mut self, middleware: impl Middleware<C, R, E>) -> Self {
        self.layers.push(middleware.boxed());
        self
    }

    /// Sets the [`Exhausted`] policy. Defaults to [`Exhausted::Succeed`].
    pub fn on_exhausted(mut self, policy: Exhausted) -> Self {
        self.exhausted = policy;
        self
    }

    pub fn build(self) -> Composed<C, R, E> {
        Composed::from_stack(Stack::new(self.layers, self.exhausted))
    }
}

impl<C, R, E> Default for Compose<C, R, E> {
    fn default() -> Self { Self::new() }
}

// ── Composed ──────────────────────────────────────────────────────────────────

/// A stack of middleware behaving as one middleware.
///
/// Cloning is one atomic increment. Every clone shares the same immutable
/// stack, and every run gets its own dispatch cursor, so one `Composed` can
/// serve any number of concurrent invocations.
pub struct Composed<C, R, E> {
    stack: Arc<Stack<C, R, E>>,
}

impl<C, R, E> Clone for Composed<C, R, E> {
    fn clone(&self) -> Self {
        Self { stack: Arc::clone(&self.stack) }
    }
}

impl<C, R, E> fmt::Debug for Composed<C, R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composed")
            .field("len", &self.stack.len())
            .field("exhausted", &self.stack.exhausted())
            .finish()
    }
}

impl<C, R, E> Composed<C, R, E> {
    fn from_stack(stack: Stack<C, R, E>) -> Self {
        Self { stack: Arc::new(stack) }
    }

    /// Number of middleware in the stack.
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.len() == 0
    }

    /// The [`Exhausted`] policy this stack was built with.
    pub fn exhaustion(&self) -> Exhausted {
        self.stack.exhausted()
    }
}

impl<C, R, E> Composed<C, R, E>
where
    C: Clone + Send + Sync + 'static,
    R: Default + Send + 'static,
    E: From<Error> + Send + 'static,
{
    /// Runs the stack against `ctx` with no final continuation.
    pub fn run(&self, ctx: C) -> BoxFuture<Result<R, E>> {
        next::start(Arc::clone(&self.stack), Tail::None, ctx)
    }

    /// Runs the stack against `ctx`, handing over to `last` once every
    /// middleware has called its `next`.
    pub fn run_with(&self, ctx: C, last: impl Middleware<C, R, E>) -> BoxFuture<Result<R, E>> {
        next::start(Arc::clone(&self.stack), Tail::Middleware(last.boxed()), ctx)
    }
}

/// Nesting: the enclosing stack's `next` becomes this stack's final
/// continuation.
impl<C, R, E> Middleware<C, R, E> for Composed<C, R, E>
where
    C: Clone + Send + Sync + 'static,
    R: Default + Send + 'static,
    E: From<Error> + Send + 'static,
{
    fn call(&self, ctx: C, next: Next<C, R, E>) -> BoxFuture<Result<R, E>> {
        next::start(Arc::clone(&self.stack), Tail::Next(next), ctx)
    }
}
