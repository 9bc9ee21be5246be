use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Shared stop flag. Clones observe the same state, so a signal handler can hold one copy while
/// the learner polls another.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Installs a Ctrl-C handler that cancels a fresh token. The handler can only be installed
    /// once per process; later calls hand back a token that is not wired to the signal.
    pub fn from_ctrl_c() -> Self {
        let token = Self::new();
        let handler_token = token.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            tracing::warn!("interrupt received, stopping after the current step");
            handler_token.cancel();
        }) {
            tracing::warn!("could not install interrupt handler: {err}");
        }
        token
    }
}

#[cfg(test)]
mod test {
    use super::CancellationToken;

    #[test]
    fn clones_share_state() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }
}
