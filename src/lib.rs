//! # tsu-compose
//!
//! Onion-style middleware composition for async Rust.
//! One mechanism. Nothing more. Nothing less.
//!
//! ## The contract
//!
//! You bring the context and the middleware. tsu-compose brings the order:
//!
//! - Middleware enters in stack order. Code after `next.run().await` runs in
//!   reverse stack order, exactly like nested function calls.
//! - A middleware that never runs `next` short-circuits everything below it.
//! - An `Err` from any stage is the `Err` of the whole chain. Nothing is
//!   caught, wrapped, retried or logged on the way up.
//! - Running a continuation twice is a bug and resolves to
//!   [`Error::NextCalledMultipleTimes`] instead of running downstream twice.
//!
//! What tsu-compose intentionally leaves to the host:
//!
//! - **Routing**: pick a stack per route yourself
//! - **Context construction**: any `Clone + Send + Sync` handle works
//! - **Timeouts and cancellation**: race or drop the returned future
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use tsu_compose::{Compose, Error};
//!
//! type Ctx = Arc<Mutex<Vec<&'static str>>>;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let app = Compose::<Ctx, (), Error>::new()
//!     .with(|ctx: Ctx, next| async move {
//!         ctx.lock().unwrap().push("outer in");
//!         let out = next.run().await;
//!         ctx.lock().unwrap().push("outer out");
//!         out
//!     })
//!     .with(|ctx: Ctx, _next| async move {
//!         ctx.lock().unwrap().push("inner");
//!         Ok(())
//!     })
//!     .build();
//!
//! let log = Ctx::default();
//! app.run(log.clone()).await.unwrap();
//! assert_eq!(*log.lock().unwrap(), ["outer in", "inner", "outer out"]);
//! # }
//! ```
//!
//! Composed stacks are middleware themselves, so they nest:
//!
//! ```rust
//! use tsu_compose::{Compose, Error};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let inner = Compose::<(), u32, Error>::new()
//!     .with(|_, next| async move { next.run().await.map(|n| n * 2) })
//!     .build();
//!
//! let outer = Compose::new()
//!     .with_middleware(inner)
//!     .with(|_, _| async { Ok(21) })
//!     .build();
//!
//! assert_eq!(outer.run(()).await, Ok(42));
//! # }
//! ```

mod compose;
mod error;
mod middleware;
mod next;

pub use compose::{compose, Compose, Composed, Exhausted};
pub use error::Error;
pub use middleware::{from_fn, BoxFuture, BoxedMiddleware, FromFn, Middleware};
pub use next::Next;
