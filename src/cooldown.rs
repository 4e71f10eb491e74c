use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Process-wide `source -> (until, reason)` map. Adapters consult this before
/// fetching and set a cooldown after detecting a block page; entries clear
/// themselves lazily once their deadline passes.
#[derive(Default)]
pub struct CooldownRegistry {
    records: RwLock<HashMap<String, (Instant, String)>>,
}

impl CooldownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self, source: &str) -> bool {
        let expired = match self.records.read().get(source) {
            None => return false,
            Some((until, _)) => *until <= Instant::now(),
        };
        if expired {
            self.records.write().remove(source);
            false
        } else {
            true
        }
    }

    pub fn left(&self, source: &str) -> Duration {
        match self.records.read().get(source) {
            None => Duration::ZERO,
            Some((until, _)) => until.saturating_duration_since(Instant::now()),
        }
    }

    pub fn reason(&self, source: &str) -> Option<String> {
        self.records.read().get(source).map(|(_, reason)| reason.clone())
    }

    /// `seconds <= 0` clears any existing cooldown for the source.
    pub fn set(&self, source: &str, seconds: f64, reason: &str) {
        if seconds <= 0.0 {
            self.records.write().remove(source);
            return;
        }
        let until = Instant::now() + Duration::from_secs_f64(seconds);
        self.records
            .write()
            .insert(source.to_string(), (until, reason.to_string()));
    }

    pub fn clear(&self, source: &str) {
        self.records.write().remove(source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_blocks_until_deadline() {
        let registry = CooldownRegistry::new();
        registry.set("avito.ru", 60.0, "ip-block");
        assert!(registry.active("avito.ru"));
        assert_eq!(registry.reason("avito.ru").as_deref(), Some("ip-block"));
    }

    #[test]
    fn zero_seconds_clears() {
        let registry = CooldownRegistry::new();
        registry.set("avito.ru", 60.0, "ip-block");
        registry.set("avito.ru", 0.0, "");
        assert!(!registry.active("avito.ru"));
    }

    #[test]
    fn unknown_source_is_never_active() {
        let registry = CooldownRegistry::new();
        assert!(!registry.active("unknown.example"));
        assert_eq!(registry.left("unknown.example"), Duration::ZERO);
    }
}
