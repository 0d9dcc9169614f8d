use ringsim_utils::hex;
use sha2::{Digest, Sha256};
use std::{sync::Mutex, time::Duration};

/// Track the actions processed by a scheduler for determinism auditing.
///
/// Every dequeued action folds its firing time, sequence number, and label into a running
/// hash. Two runs that process the same actions in the same order at the same virtual times
/// end with the same [Auditor::state].
#[derive(Default)]
pub struct Auditor {
    hash: Mutex<Vec<u8>>,
}

impl Auditor {
    pub(crate) fn process(&self, at: Duration, sequence: u64, label: &str) {
        let mut hash = self.hash.lock().unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&*hash);
        hasher.update(b"process");
        hasher.update(at.as_nanos().to_be_bytes());
        hasher.update(sequence.to_be_bytes());
        hasher.update(label.as_bytes());
        *hash = hasher.finalize().to_vec();
    }

    pub(crate) fn stopped(&self) {
        let mut hash = self.hash.lock().unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&*hash);
        hasher.update(b"stopped");
        *hash = hasher.finalize().to_vec();
    }

    /// Generate a representation of the current state of the scheduler.
    pub fn state(&self) -> String {
        let hash = self.hash.lock().unwrap().clone();
        hex(&hash)
    }
}
