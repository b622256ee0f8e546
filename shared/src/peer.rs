use std::fmt;

/// Process-wide peer address: the owning reactor's base id plus its local slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

impl PeerId {
    /// Sentinel returned when a connection attempt fails.
    pub const INVALID: PeerId = PeerId(u32::MAX);

    pub fn new(base: u32, slot: usize) -> Self {
        PeerId(base + slot as u32)
    }

    pub fn is_valid(&self) -> bool {
        *self != PeerId::INVALID
    }

    /// Local slot index for a reactor whose ids start at `base`, if it owns this id.
    pub fn slot(&self, base: u32, capacity: usize) -> Option<usize> {
        if !self.is_valid() || self.0 < base {
            return None;
        }
        let slot = (self.0 - base) as usize;
        (slot < capacity).then_some(slot)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "peer#{}", self.0)
        } else {
            f.write_str("peer#invalid")
        }
    }
}
