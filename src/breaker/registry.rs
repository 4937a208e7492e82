use super::{BreakerConfig, BreakerSnapshot, BreakerTransition, CircuitBreaker};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lazily created breakers keyed by server name or remote endpoint.
///
/// The map lock is only held to look a breaker up; each breaker then
/// guards its own state.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the breaker for `key`, creating a closed one on first use.
    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.map();
        Arc::clone(
            breakers
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone()))),
        )
    }

    /// Resets the breaker for `key` if one exists.
    pub fn reset(&self, key: &str) -> Option<BreakerTransition> {
        let breaker = self.map().get(key).cloned();
        breaker.and_then(|b| b.reset())
    }

    pub fn snapshot_all(&self) -> HashMap<String, BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.map().values().cloned().collect();
        breakers
            .into_iter()
            .map(|b| (b.name().to_string(), b.snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerStatus;

    #[test]
    fn test_breakers_are_independent() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        for _ in 0..3 {
            registry.get("a").record_failure();
        }
        assert_eq!(registry.get("a").status(), BreakerStatus::Open);
        assert_eq!(registry.get("b").status(), BreakerStatus::Closed);
        assert!(Arc::ptr_eq(&registry.get("a"), &registry.get("a")));
    }

    #[test]
    fn test_reset_unknown_key() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        assert!(registry.reset("missing").is_none());
        assert!(registry.snapshot_all().is_empty());
    }
}
