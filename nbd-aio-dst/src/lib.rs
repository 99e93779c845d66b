//! Deterministic simulation testing for the `nbd-aio` client engine.
//!
//! This crate is intentionally separate from `nbd-aio` so test scaffolding
//! is never compiled into production binaries. It provides:
//!
//! - `server` - an in-memory (RAM disk) NBD server to exercise the client
//! - `oracle` - a shadow buffer for byte-for-byte data-integrity checks
//! - `driver` - readiness-poll driver loops for tokio transports
//! - `parallel` - the multi-connection parallel integrity workload
//! - `simulation` - seeded simulation runners
//!
//! ## Running simulations
//!
//! ```bash
//! # PR-level quick run
//! cargo test -p nbd-aio-dst parallel_simulation
//!
//! # Nightly long run, reproducible via DST_SEED
//! DST_SEED=42 cargo test -p nbd-aio-dst -- --ignored
//! ```

pub mod driver;
pub mod oracle;
pub mod parallel;
pub mod server;
pub mod simulation;

pub use driver::{drive, AsyncReadiness};
pub use oracle::ShadowBuffer;
pub use parallel::{ParallelHarness, ThreadStats, WorkloadConfig};
pub use server::{RamDisk, RamServer};
pub use simulation::{get_seed, run_parallel_simulation, SimulationError};
