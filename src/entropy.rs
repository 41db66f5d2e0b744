use crate::CoordinatorError;

use std::sync::Mutex;

///
/// The source of the participant-selection seed, e.g. the hash of a
/// blockchain block not yet mined when the ceremony is announced. The
/// seed must be unpredictable before it is observed and independently
/// recomputable afterwards, so the selection outcome is auditable.
///
pub trait EntropySource: Send + Sync {
    /// Returns the selection seed once it is available.
    fn seed(&self) -> Option<Vec<u8>>;
}

/// A pre-published fixed seed, for tests and rehearsal ceremonies.
pub struct FixedEntropy {
    seed: Vec<u8>,
}

impl FixedEntropy {
    pub fn new(seed: Vec<u8>) -> Self {
        Self { seed }
    }

    /// Parses a hex-encoded seed, e.g. a block hash copied from an
    /// explorer.
    pub fn from_hex(encoded: &str) -> Result<Self, CoordinatorError> {
        Ok(Self::new(hex::decode(encoded.trim_start_matches("0x"))?))
    }
}

impl EntropySource for FixedEntropy {
    fn seed(&self) -> Option<Vec<u8>> {
        Some(self.seed.clone())
    }
}

/// A seed supplied later by an external watcher, unavailable until the
/// selection block has been observed.
#[derive(Default)]
pub struct PendingEntropy {
    seed: Mutex<Option<Vec<u8>>>,
}

impl PendingEntropy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supplies the observed seed. Later calls are ignored; the first
    /// observation wins.
    pub fn supply(&self, seed: Vec<u8>) {
        if let Ok(mut slot) = self.seed.lock() {
            if slot.is_none() {
                *slot = Some(seed);
            }
        }
    }
}

impl EntropySource for PendingEntropy {
    fn seed(&self) -> Option<Vec<u8>> {
        self.seed.lock().ok().and_then(|slot| slot.clone())
    }
}
