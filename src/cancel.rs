//! Cooperative cancellation flag shared between a caller and a worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable handle to one shared stop signal.
///
/// Workers poll [`is_cancelled`](CancelFlag::is_cancelled) between units of
/// work (chunks, tokens); any clone may call [`cancel`](CancelFlag::cancel).
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let flag = CancelFlag::new();
        let worker_side = flag.clone();
        assert!(!worker_side.is_cancelled());
        flag.cancel();
        assert!(worker_side.is_cancelled());
    }
}
