use dashmap::DashMap;
use taskschedule_core::ExecutionId;
use tokio_util::sync::CancellationToken;

/// Cancellation tokens for executions currently running on a worker.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    tokens: DashMap<ExecutionId, CancellationToken>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for `id`, replacing any previous one.
    pub fn token(&self, id: &ExecutionId) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.insert(id.clone(), token.clone());
        token
    }

    /// Signal the running execution. Returns `false` if none is registered.
    pub fn cancel(&self, id: &ExecutionId) -> bool {
        match self.tokens.get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &ExecutionId) {
        self.tokens.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reaches_registered_token() {
        let registry = CancelRegistry::new();
        let id = ExecutionId::new();
        assert!(!registry.cancel(&id));

        let token = registry.token(&id);
        assert!(registry.cancel(&id));
        assert!(token.is_cancelled());

        registry.remove(&id);
        assert!(!registry.cancel(&id));
    }
}
