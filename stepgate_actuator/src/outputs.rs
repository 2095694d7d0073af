use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Channel to output pin, as wired on the reference hardware.
pub const DEFAULT_MAPPING: [(u8, u8); 8] = [
    (0, 2),
    (1, 3),
    (2, 4),
    (3, 17),
    (4, 27),
    (5, 22),
    (6, 10),
    (7, 9),
];

pub fn default_mapping() -> BTreeMap<u8, u8> {
    DEFAULT_MAPPING.into_iter().collect()
}

/// Simulated output pins. An armed channel holds its release deadline;
/// everything else is idle.
#[derive(Debug, Clone)]
pub struct OutputBank {
    mapping: BTreeMap<u8, u8>,
    armed: BTreeMap<u8, Instant>,
}

impl OutputBank {
    pub fn new(mapping: BTreeMap<u8, u8>) -> Self {
        Self {
            mapping,
            armed: BTreeMap::new(),
        }
    }

    pub fn mapping(&self) -> &BTreeMap<u8, u8> {
        &self.mapping
    }

    pub fn pin(&self, channel: u8) -> Option<u8> {
        self.mapping.get(&channel).copied()
    }

    /// Arms `channel` for `duration`. Re-triggering an armed channel only
    /// moves its release deadline. False when the channel has no pin.
    pub fn trigger(&mut self, channel: u8, duration: Duration, now: Instant) -> bool {
        let Some(pin) = self.pin(channel) else {
            return false;
        };
        debug!(channel, pin, duration_ms = duration.as_millis() as u64, "output active");
        self.armed.insert(channel, now + duration);
        true
    }

    pub fn release(&mut self, channel: u8) -> bool {
        self.armed.remove(&channel).is_some()
    }

    pub fn release_all(&mut self) -> Vec<u8> {
        let released: Vec<u8> = self.armed.keys().copied().collect();
        self.armed.clear();
        released
    }

    /// Releases every channel whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<u8> {
        let due: Vec<u8> = self
            .armed
            .iter()
            .filter(|(_, &deadline)| deadline <= now)
            .map(|(&channel, _)| channel)
            .collect();
        for channel in &due {
            self.armed.remove(channel);
        }
        due
    }

    pub fn active_channels(&self) -> Vec<u8> {
        self.armed.keys().copied().collect()
    }
}

impl Default for OutputBank {
    fn default() -> Self {
        Self::new(default_mapping())
    }
}
