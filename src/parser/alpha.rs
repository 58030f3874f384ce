//! Alpha-conversion: rename aliased output keys so every slot in the owning
//! RunInfo has exactly one writer.
//!
//! Tensor slots are addressed by integer index rather than mangled key
//! strings, so alpha-conversion collapses to tracking which slot a name
//! currently points at and rebinding it on every write.

use std::collections::HashMap;

/// Tracks, for each name appearing in a DAG, the slot its most recent write
/// (or its LOAD) installed.
#[derive(Default)]
pub struct AlphaConverter {
    current_slot: HashMap<String, usize>,
}

impl AlphaConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `slot` as a result of a LOAD.
    pub fn load(&mut self, name: &str, slot: usize) {
        self.current_slot.insert(name.to_string(), slot);
    }

    /// Resolve a read of `name` to the slot of its most recent producer.
    pub fn read(&self, name: &str) -> Option<usize> {
        self.current_slot.get(name).copied()
    }

    /// Bind `name` to a freshly allocated `slot` as a result of a write,
    /// shadowing any earlier instance so later reads see this producer.
    pub fn write(&mut self, name: &str, slot: usize) {
        self.current_slot.insert(name.to_string(), slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_write_shadows_earlier_instance() {
        let mut a = AlphaConverter::new();
        a.load("x", 0);
        assert_eq!(a.read("x"), Some(0));
        a.write("x", 5);
        assert_eq!(a.read("x"), Some(5));
    }

    #[test]
    fn unknown_name_resolves_to_none() {
        let a = AlphaConverter::new();
        assert_eq!(a.read("never-seen"), None);
    }
}
