//! caravan — an NVMe-over-TCP target engine.
//!
//! The target side of NVMe command transport over a reliable byte
//! stream: initiators open connections, each connection becomes a
//! queue, and the queue engine decodes command capsules, dispatches
//! them to an injected [`Executor`], and returns completions plus read
//! data.
//!
//! The distinguishing technique is the *caravan*: on I/O queues,
//! send-side emissions (data PDUs, read payload pages, responses, R2Ts)
//! are gathered into per-queue vectors and drained with single vectored
//! sends, coalescing many small outputs into few large socket writes.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use caravan::{Config, ExecRequest, Executor, TargetBuilder};
//!
//! struct Zeroes;
//!
//! impl Executor for Zeroes {
//!     fn init_request(&self, _cmd: &protocol_nvme_tcp::NvmeCommand, _qid: u16) -> Result<(), u16> {
//!         Ok(())
//!     }
//!     fn execute(&self, req: ExecRequest) {
//!         // Reads return zeroes; writes are discarded.
//!         req.complete(0);
//!     }
//! }
//!
//! fn main() -> Result<(), caravan::Error> {
//!     let (handle, workers) = TargetBuilder::new(Config::default())
//!         .bind("0.0.0.0:4420".parse().unwrap())
//!         .launch(Arc::new(Zeroes))?;
//!     for h in workers {
//!         h.join().unwrap()?;
//!     }
//!     let _ = handle;
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Linux only: worker threads pin to cores and the listener uses raw
//! socket options.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod caravan;
pub(crate) mod inbox;
pub(crate) mod pool;
pub(crate) mod port;
pub(crate) mod queue;
mod recv;
mod send;
mod sg;
mod worker;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod registry;

// ── Re-exports ──────────────────────────────────────────────────────────

/// Runtime configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Worker thread configuration.
pub use config::WorkerConfig;
/// Target setup errors.
pub use error::Error;
/// A command handed to the executor.
pub use executor::ExecRequest;
/// The injected NVMe command executor.
pub use executor::Executor;
/// Queue installation parameters from a connect completion.
pub use executor::QueueInstall;
/// Process-wide queue registry.
pub use registry::QueueRegistry;
/// Scatter-gather payload buffer.
pub use sg::SgBuffer;
/// Segment size for scatter-gather buffers.
pub use sg::PAGE_SIZE;
/// Handle for shutdown and admin operations.
pub use worker::ShutdownHandle;
/// Builder for launching the target.
pub use worker::TargetBuilder;
