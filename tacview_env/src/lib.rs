//! tacview Environment Abstraction Layer
//!
//! The engine's background work (periodic sweeps, queue draining) needs a
//! clock, a way to sleep and a way to spawn tasks. This crate hides those
//! behind [`TacticalContext`] so the same engine code runs in **Production**
//! (tokio, wall clock) and in the **Simulation** harness (virtual clock).
//!
//! # Example
//!
//! ```ignore
//! use tacview_env::{TacticalContext, TokioContext};
//!
//! async fn sweep_loop<Ctx: TacticalContext>(ctx: &Ctx) {
//!     loop {
//!         ctx.sleep(Duration::from_secs(5)).await;
//!         sweep(ctx.system_time());
//!     }
//! }
//! ```

mod context;
mod error;
mod tokio_impl;

pub use context::TacticalContext;
pub use error::EnvError;
pub use tokio_impl::TokioContext;
