//! The continuation handed to every middleware, and the dispatch loop behind it.
//!
//! # One invocation, one cursor
//!
//! Running a [`Composed`](crate::Composed) allocates an `Invocation`. It holds
//! the shared stack, the optional final continuation, and the dispatch
//! cursor for that one call tree. Every [`Next`] created while the tree runs
//! points back at the same `Invocation`:
//!
//! ```text
//! composed.run(ctx)
//!        ↓  Arc<Invocation { stack, tail, cursor: 0 }>
//! dispatch(0) → stack[0].call(ctx, Next { index: 1 })
//!                    ↓ next.run()
//!               dispatch(1) → stack[1].call(ctx, Next { index: 2 })
//!                                  ↓ …
//!                             dispatch(len) → tail, or the exhaustion policy
//! ```
//!
//! Concurrent runs of the same stack never share an `Invocation`, so a
//! misbehaving middleware in one request cannot poison another.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use futures::future;
use tracing::{debug, trace};

use crate::compose::{Exhausted, Stack};
use crate::error::Error;
use crate::middleware::{BoxFuture, BoxedMiddleware, Middleware};

/// The rest of the stack, from the point of view of one middleware.
///
/// [`run`](Next::run) consumes the continuation, so the ordinary way of
/// calling it twice does not compile. Cloning a `Next` and running both
/// copies does compile, and the second run resolves to
/// [`Error::NextCalledMultipleTimes`] without touching any downstream
/// middleware. The same holds for running an earlier continuation after the
/// chain has moved past it.
pub struct Next<C, R, E> {
    ctx: C,
    index: usize,
    invocation: Arc<Invocation<C, R, E>>,
}

impl<C: Clone, R, E> Clone for Next<C, R, E> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            index: self.index,
            invocation: Arc::clone(&self.invocation),
        }
    }
}

impl<C, R, E> Next<C, R, E>
where
    C: Clone + Send + Sync + 'static,
    R: Default + Send + 'static,
    E: From<Error> + Send + 'static,
{
    /// Dispatches the next stage and resolves with its outcome, which covers
    /// everything downstream of it.
    pub fn run(self) -> BoxFuture<Result<R, E>> {
        dispatch(self.invocation, self.ctx, self.index)
    }

    /// The context this continuation will pass downstream.
    pub fn context(&self) -> &C {
        &self.ctx
    }

    /// The stack position [`run`](Next::run) dispatches.
    pub fn index(&self) -> usize {
        self.index
    }
}

// ── Per-invocation state ──────────────────────────────────────────────────────

/// What runs once the stack is exhausted.
pub(crate) enum Tail<C, R, E> {
    None,
    Middleware(BoxedMiddleware<C, R, E>),
    /// The enclosing stack's continuation, when a composed stack is nested.
    Next(Next<C, R, E>),
}

pub(crate) struct Invocation<C, R, E> {
    stack: Arc<Stack<C, R, E>>,
    tail: Tail<C, R, E>,
    /// One past the highest index dispatched so far. `0` means nothing has
    /// been dispatched yet.
    cursor: AtomicUsize,
}

impl<C, R, E> Invocation<C, R, E> {
    fn new(stack: Arc<Stack<C, R, E>>, tail: Tail<C, R, E>) -> Self {
        Self { stack, tail, cursor: AtomicUsize::new(0) }
    }

    /// Moves the cursor to `index` if the chain has not reached it yet.
    ///
    /// A single `fetch_update`, so two clones of one `Next` racing on
    /// different threads cannot both get through.
    fn advance(&self, index: usize) -> bool {
        self.cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reached| {
                (index >= reached).then_some(index + 1)
            })
            .is_ok()
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Starts a fresh invocation of `stack` at index 0.
pub(crate) fn start<C, R, E>(
    stack: Arc<Stack<C, R, E>>,
    tail: Tail<C, R, E>,
    ctx: C,
) -> BoxFuture<Result<R, E>>
where
    C: Clone + Send + Sync + 'static,
    R: Default + Send + 'static,
    E: From<Error> + Send + 'static,
{
    dispatch(Arc::new(Invocation::new(stack, tail)), ctx, 0)
}

fn dispatch<C, R, E>(
    invocation: Arc<Invocation<C, R, E>>,
    ctx: C,
    index: usize,
) -> BoxFuture<Result<R, E>>
where
    C: Clone + Send + Sync + 'static,
    R: Default + Send + 'static,
    E: From<Error> + Send + 'static,
{
    if !invocation.advance(index) {
        debug!(index, "next() called multiple times");
        return fail(Error::NextCalledMultipleTimes { index });
    }

    let len = invocation.stack.len();
    trace!(index, len, "dispatching middleware");

    let middleware = match invocation.stack.get(index) {
        Some(middleware) => middleware,
        None if index == len => match &invocation.tail {
            Tail::Middleware(last) => last,
            Tail::Next(outer) => return outer.clone().run(),
            Tail::None => return exhausted(invocation.stack.exhausted(), index),
        },
        None => return exhausted(invocation.stack.exhausted(), index),
    };

    let next = Next {
        ctx: ctx.clone(),
        index: index + 1,
        invocation: Arc::clone(&invocation),
    };
    call_guarded(&**middleware, ctx, next)
}

/// Calls `middleware` and funnels a panic, whether raised while building
/// the future or while polling it, into the future's `Err`.
fn call_guarded<C, R, E>(
    middleware: &dyn Middleware<C, R, E>,
    ctx: C,
    next: Next<C, R, E>,
) -> BoxFuture<Result<R, E>>
where
    C: 'static,
    R: Send + 'static,
    E: From<Error> + Send + 'static,
{
    match panic::catch_unwind(AssertUnwindSafe(move || middleware.call(ctx, next))) {
        Ok(fut) => Box::pin(
            AssertUnwindSafe(fut)
                .catch_unwind()
                .map(|outcome| outcome.unwrap_or_else(|payload| Err(panicked(payload)))),
        ),
        Err(payload) => Box::pin(future::ready(Err(panicked(payload)))),
    }
}

fn panicked<E: From<Error>>(payload: Box<dyn std::any::Any + Send>) -> E {
    Error::from_panic(payload).into()
}

fn exhausted<R, E>(policy: Exhausted, index: usize) -> BoxFuture<Result<R, E>>
where
    R: Default + Send + 'static,
    E: From<Error> + Send + 'static,
{
    match policy {
        Exhausted::Succeed => Box::pin(future::ready(Ok(R::default()))),
        Exhausted::Fail => {
            debug!(index, "stack exhausted without a final continuation");
            fail(Error::NoContinuation { index })
        }
    }
}

fn fail<R, E>(err: Error) -> BoxFuture<Result<R, E>>
where
    R: Send + 'static,
    E: From<Error> + Send + 'static,
{
    Box::pin(future::ready(Err(err.into())))
}
