//! Staleness filter for `active` broadcasts.
//!
//! After a reconnect, or after a fresh evaluation, the engine may restart its
//! cycle numbering. Comparing bare cycles would then discard valid output, so
//! each message is keyed by the socket it arrived on and the evaluation
//! generation first, and by cycle last.

/// Ordering key of one `active` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActiveKey {
    /// Incremented by the link for every new socket.
    pub epoch: u64,
    pub generation: u64,
    pub cycle: i64,
}

impl ActiveKey {
    pub fn new(epoch: u64, generation: Option<u64>, cycle: i64) -> Self {
        Self {
            epoch,
            generation: generation.unwrap_or(0),
            cycle,
        }
    }
}

/// Accepts a message unless its key is smaller than the last accepted one.
#[derive(Debug, Clone, Default)]
pub struct ActiveFilter {
    last: Option<ActiveKey>,
}

impl ActiveFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, key: ActiveKey) -> bool {
        if self.last.is_some_and(|last| key < last) {
            return false;
        }
        self.last = Some(key);
        true
    }

    pub fn last(&self) -> Option<ActiveKey> {
        self.last
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
