use std::sync::atomic::{AtomicI64, Ordering};

/// Approximate bytes held by loaded datums across a tree.
///
/// Datums report deltas on every mutation, load and unload; the total is
/// only a hint for callers deciding when to save with unload.
#[derive(Debug, Default)]
pub struct MemoryUsage {
    bytes: AtomicI64,
}

impl MemoryUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adjust(&self, delta: i64) {
        if delta != 0 {
            self.bytes.fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub fn current(&self) -> i64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_up_and_down() {
        let usage = MemoryUsage::new();
        usage.adjust(100);
        usage.adjust(-40);
        assert_eq!(usage.current(), 60);
    }
}
