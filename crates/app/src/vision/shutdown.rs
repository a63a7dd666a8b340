use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Cooperative cancellation flag shared by every pipeline thread.
///
/// Requesting shutdown has no side effects beyond the store, so it is safe to
/// call from a signal handler.
#[derive(Clone, Debug, Default)]
pub(crate) struct ShutdownToken {
    requested: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_observe_the_same_request() {
        let token = ShutdownToken::new();
        let observer = token.clone();
        assert!(!observer.is_requested());
        token.request();
        assert!(observer.is_requested());
    }
}
