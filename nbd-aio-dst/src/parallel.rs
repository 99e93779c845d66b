//! Parallel data-integrity workload.
//!
//! N connections to one RAM-disk export, each owned and driven by its own
//! task with a fixed in-flight window. The export is partitioned into
//! disjoint regions per (connection, slot) so no two commands ever touch
//! overlapping bytes, and every read completion is compared byte-for-byte
//! against the shadow buffer.

use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::debug;

use nbd_aio::{ClientConfig, Connection, MultiConn};

use crate::oracle::ShadowBuffer;
use crate::server::{RamDisk, RamServer};
use crate::simulation::SimulationError;

/// Workload shape: 8 connections and 16 commands in flight per connection
/// by default.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub connections: usize,
    pub max_in_flight: usize,
    pub requests_per_connection: u64,
    pub buffer_size: usize,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            connections: 8,
            max_in_flight: 16,
            requests_per_connection: 256,
            buffer_size: 16384,
        }
    }
}

impl WorkloadConfig {
    /// Export size: two buffers of slack per (connection, slot) region.
    fn export_size(&self) -> u64 {
        (self.connections * self.max_in_flight * 2 * self.buffer_size) as u64
    }
}

/// Per-worker statistics.
#[derive(Debug, Default, Clone)]
pub struct ThreadStats {
    pub requests: u64,
    pub most_in_flight: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// One in-flight command slot.
struct Slot {
    handle: u64,
    offset: u64,
    is_read: bool,
}

/// The whole workload: server, shadow, N driven connections.
pub struct ParallelHarness {
    seed: u64,
    config: WorkloadConfig,
}

impl ParallelHarness {
    pub fn new(seed: u64, config: WorkloadConfig) -> Self {
        Self { seed, config }
    }

    pub async fn run(&self) -> Result<Vec<ThreadStats>, SimulationError> {
        let size = self.config.export_size();
        let disk = Arc::new(RamDisk::patterned(size));
        let server = RamServer::new(disk, "dst");
        let (addr, server_task) = server
            .listen_tcp()
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;

        let shadow = Arc::new(ShadowBuffer::patterned(size));
        let client_config = ClientConfig {
            export_name: "dst".to_string(),
            connections: self.config.connections,
            max_in_flight: self.config.max_in_flight,
        };
        let multi = MultiConn::connect_tcp(addr, &client_config)
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
        let (export, connections) = multi.into_connections();
        if export.size_bytes != size {
            return Err(SimulationError::Unexpected(format!(
                "negotiated size {} != expected {}",
                export.size_bytes, size
            )));
        }

        let mut workers: JoinSet<Result<ThreadStats, SimulationError>> = JoinSet::new();
        for (index, conn) in connections.into_iter().enumerate() {
            let shadow = Arc::clone(&shadow);
            let config = self.config.clone();
            let seed = self.seed.wrapping_add(index as u64);
            workers.spawn(worker(index, conn, shadow, config, seed, size));
        }

        let mut stats = Vec::new();
        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(s)) => stats.push(s),
                Ok(Err(e)) => failure = Some(e),
                Err(e) => failure = Some(SimulationError::Unexpected(e.to_string())),
            }
        }
        server_task.abort();

        match failure {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

/// Drive one connection: poll readiness, notify, submit into free slots,
/// retire completions against the shadow.
async fn worker(
    index: usize,
    mut conn: Connection<TcpStream>,
    shadow: Arc<ShadowBuffer>,
    config: WorkloadConfig,
    seed: u64,
    export_size: u64,
) -> Result<ThreadStats, SimulationError> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let window = config.max_in_flight;
    let target = config.requests_per_connection;
    let slot_len = export_size / (config.connections * window) as u64;
    let buffer = config.buffer_size as u64;

    let mut slots: Vec<Option<Slot>> = (0..window).map(|_| None).collect();
    let mut in_flight = 0usize;
    let mut issued = 0u64;
    let mut stats = ThreadStats::default();

    let err = |e: nbd_aio::Error| SimulationError::Unexpected(e.to_string());

    while issued < target || in_flight > 0 {
        if conn.is_dead() {
            return Err(SimulationError::Unexpected(format!(
                "worker {}: connection dead: {}",
                index,
                conn.dead_reason().unwrap_or("unknown")
            )));
        }

        // Windowed backpressure: never more than `window` in flight.
        let want_to_send = issued < target && in_flight < window;

        let direction = conn.direction();
        let Some(interest) = direction.interest(want_to_send) else {
            return Err(SimulationError::Unexpected(format!(
                "worker {}: connection closed unexpectedly",
                index
            )));
        };
        let ready = conn
            .transport()
            .ready(interest)
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;

        if direction.wants_read() && ready.is_readable() {
            conn.notify_readable().map_err(err)?;
        } else if ready.is_writable() {
            conn.notify_writable().map_err(err)?;
        }

        // Issue another request if there is room.
        if want_to_send && ready.is_writable() && conn.is_ready() {
            let slot_idx = slots
                .iter()
                .position(|s| s.is_none())
                .expect("in_flight < window implies a free slot");
            let slot_base = ((index * window + slot_idx) as u64) * slot_len;
            let offset = slot_base + rng.gen_range(0..=slot_len - buffer);

            let is_read = rng.gen_bool(0.5);
            let handle = if is_read {
                conn.read(offset, buffer as u32).map_err(err)?
            } else {
                let mut data = vec![0u8; config.buffer_size];
                rng.fill_bytes(&mut data);
                // The shadow is updated synchronously on submission;
                // regions are disjoint so ordering cannot be observed.
                shadow.write(offset, &data);
                conn.write(offset, Bytes::from(data)).map_err(err)?
            };

            slots[slot_idx] = Some(Slot {
                handle,
                offset,
                is_read,
            });
            in_flight += 1;
            issued += 1;
            stats.most_in_flight = stats.most_in_flight.max(in_flight);
        }

        // Retire whatever has completed.
        for slot in slots.iter_mut() {
            let Some(s) = slot else { continue };
            let Some(result) = conn.command_completed(s.handle) else {
                continue;
            };
            match result {
                Ok(data) => {
                    if s.is_read {
                        shadow.check(s.offset, &data)?;
                    }
                }
                Err(e) => {
                    return Err(SimulationError::Unexpected(format!(
                        "worker {}: command failed: {}",
                        index, e
                    )))
                }
            }
            *slot = None;
            in_flight -= 1;
            stats.requests += 1;
        }
    }

    stats.bytes_sent = conn.bytes_sent();
    stats.bytes_received = conn.bytes_received();
    debug!(
        worker = index,
        requests = stats.requests,
        most_in_flight = stats.most_in_flight,
        "worker finished"
    );
    Ok(stats)
}
