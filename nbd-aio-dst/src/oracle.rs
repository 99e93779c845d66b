//! Shadow-buffer oracle.
//!
//! A reference copy of the export, updated synchronously when a write is
//! submitted and compared byte-for-byte against read completions. Workers
//! on different connections must write disjoint regions; the oracle's lock
//! orders bookkeeping only, not cross-connection visibility.

use std::sync::Mutex;

use crate::simulation::SimulationError;

pub struct ShadowBuffer {
    data: Mutex<Vec<u8>>,
}

impl ShadowBuffer {
    /// A shadow initialized with the same offset pattern as
    /// [`crate::RamDisk::patterned`].
    pub fn patterned(size_bytes: u64) -> Self {
        let mut data = vec![0u8; size_bytes as usize];
        for i in (0..data.len()).step_by(8) {
            let end = (i + 8).min(data.len());
            data[i..end].copy_from_slice(&(i as u64).to_be_bytes()[..end - i]);
        }
        Self {
            data: Mutex::new(data),
        }
    }

    /// Record a write at submission time.
    pub fn write(&self, offset: u64, payload: &[u8]) {
        let mut data = self.data.lock().unwrap();
        data[offset as usize..offset as usize + payload.len()].copy_from_slice(payload);
    }

    /// Compare a completed read against the shadow.
    pub fn check(&self, offset: u64, actual: &[u8]) -> Result<(), SimulationError> {
        let data = self.data.lock().unwrap();
        let expected = &data[offset as usize..offset as usize + actual.len()];
        if expected != actual {
            let first_bad = expected
                .iter()
                .zip(actual)
                .position(|(e, a)| e != a)
                .unwrap_or(0);
            return Err(SimulationError::Mismatch {
                context: format!(
                    "read at offset {} length {}: first divergence at byte {}",
                    offset,
                    actual.len(),
                    first_bad
                ),
            });
        }
        Ok(())
    }
}
