//! Simulation runners and utilities.
//!
//! Failures reproduce by re-running with the same seed:
//!
//! ```bash
//! DST_SEED=12345 cargo test -p nbd-aio-dst parallel_simulation
//! ```

use crate::parallel::{ParallelHarness, ThreadStats, WorkloadConfig};

/// Error type for simulation failures.
#[derive(Debug)]
pub enum SimulationError {
    Mismatch { context: String },
    Unexpected(String),
}

impl std::fmt::Display for SimulationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mismatch { context } => write!(f, "oracle mismatch: {}", context),
            Self::Unexpected(msg) => write!(f, "unexpected error: {}", msg),
        }
    }
}

impl std::error::Error for SimulationError {}

/// Run the parallel integrity workload with the given seed.
pub async fn run_parallel_simulation(
    seed: u64,
    config: WorkloadConfig,
) -> Result<Vec<ThreadStats>, SimulationError> {
    eprintln!(
        "parallel simulation: seed={}, connections={}, window={}, requests={}",
        seed, config.connections, config.max_in_flight, config.requests_per_connection
    );

    let harness = ParallelHarness::new(seed, config);
    let stats = harness.run().await?;

    let requests: u64 = stats.iter().map(|s| s.requests).sum();
    let most_in_flight = stats.iter().map(|s| s.most_in_flight).max().unwrap_or(0);
    eprintln!(
        "parallel simulation complete: requests={}, most_in_flight={}",
        requests, most_in_flight
    );
    Ok(stats)
}

/// Get the seed from the environment or generate a random one.
pub fn get_seed() -> u64 {
    std::env::var("DST_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(rand::random)
}
