//! Thread-safe registry of candidate brokers
//!
//! Holds one record per configured broker URI with its latest measured
//! metrics, availability, and weighted score, plus the selection predicates
//! the session manager acts on: `best()` and `should_switch()`.

use crate::scoring::{weighted_score, weights_for_category, ScoreWeights};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info};

/// Minimum score advantage required before a swap is suggested.
const SWITCH_THRESHOLD: f64 = 0.10;

/// Snapshot of one broker's state.
#[derive(Debug, Clone)]
pub struct BrokerRecord {
    pub uri: String,
    /// Round-trip time of the last self-loop publish, 0 if never measured.
    pub latency_ms: f64,
    /// Last sustained publish throughput in bytes/second, 0 if never measured.
    pub bandwidth_bps: f64,
    /// Last broker-reported active-client count, 0 if never measured.
    pub connection_count: u32,
    /// Weighted score in [0, 1]; always 0 while unavailable.
    pub score: f64,
    pub available: bool,
    pub last_check: Instant,
}

impl BrokerRecord {
    fn new(uri: String) -> Self {
        Self {
            uri,
            latency_ms: 0.0,
            bandwidth_bps: 0.0,
            connection_count: 0,
            score: 0.0,
            available: true,
            last_check: Instant::now(),
        }
    }

    fn rescore(&mut self, weights: &ScoreWeights) {
        self.score = if self.available {
            weighted_score(
                self.latency_ms,
                self.bandwidth_bps,
                self.connection_count,
                weights,
            )
        } else {
            0.0
        };
    }
}

struct RegistryState {
    brokers: Vec<BrokerRecord>,
    current: usize,
}

/// Ordered collection of broker records, shared between the session manager
/// and the monitor. All access goes through one mutex; no operation holds it
/// across I/O.
pub struct BrokerRegistry {
    state: Mutex<RegistryState>,
    weights: ScoreWeights,
    category: String,
}

impl BrokerRegistry {
    /// Create a registry whose weight profile is fixed by the device
    /// category for the registry's lifetime.
    pub fn new(category: &str) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                brokers: Vec::new(),
                current: 0,
            }),
            weights: weights_for_category(category),
            category: category.to_string(),
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Register a broker. Duplicates are ignored; the first broker ever
    /// added becomes the current one.
    pub fn add(&self, uri: &str) {
        let mut state = self.state.lock().unwrap();
        if state.brokers.iter().any(|b| b.uri == uri) {
            return;
        }
        state.brokers.push(BrokerRecord::new(uri.to_string()));
        if state.brokers.len() == 1 {
            state.current = 0;
        }
    }

    /// Remove a broker, re-anchoring the current index so it stays in range.
    pub fn remove(&self, uri: &str) {
        let mut state = self.state.lock().unwrap();
        let Some(removed) = state.brokers.iter().position(|b| b.uri == uri) else {
            return;
        };
        state.brokers.remove(removed);
        if removed < state.current {
            state.current -= 1;
        } else if state.current >= state.brokers.len() {
            state.current = state.brokers.len().saturating_sub(1);
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.brokers.clear();
        state.current = 0;
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().brokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the broker with this URI current. Returns false if unknown.
    pub fn set_current(&self, uri: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.brokers.iter().position(|b| b.uri == uri) {
            Some(index) => {
                state.current = index;
                true
            }
            None => false,
        }
    }

    pub fn current(&self) -> Option<BrokerRecord> {
        let state = self.state.lock().unwrap();
        state.brokers.get(state.current).cloned()
    }

    pub fn current_uri(&self) -> Option<String> {
        self.current().map(|b| b.uri)
    }

    pub fn get(&self, uri: &str) -> Option<BrokerRecord> {
        let state = self.state.lock().unwrap();
        state.brokers.iter().find(|b| b.uri == uri).cloned()
    }

    /// Ordered snapshot of every record.
    pub fn all(&self) -> Vec<BrokerRecord> {
        self.state.lock().unwrap().brokers.clone()
    }

    /// Registered URIs in registration order.
    pub fn uris(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.brokers.iter().map(|b| b.uri.clone()).collect()
    }

    /// URIs of available brokers in registration order.
    pub fn available_uris(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .brokers
            .iter()
            .filter(|b| b.available)
            .map(|b| b.uri.clone())
            .collect()
    }

    /// Replace all three metrics for a broker and recompute its score.
    ///
    /// Fresh metrics only exist after a successful probe, so this also
    /// restores availability.
    pub fn update_metrics(
        &self,
        uri: &str,
        latency_ms: f64,
        bandwidth_bps: f64,
        connection_count: u32,
    ) {
        let mut state = self.state.lock().unwrap();
        let Some(broker) = state.brokers.iter_mut().find(|b| b.uri == uri) else {
            return;
        };
        broker.latency_ms = latency_ms;
        broker.bandwidth_bps = bandwidth_bps;
        broker.connection_count = connection_count;
        broker.last_check = Instant::now();
        if !broker.available {
            info!(uri, "broker reachable again");
            broker.available = true;
        }
        broker.rescore(&self.weights);
        debug!(uri, score = broker.score, "broker metrics updated");
    }

    pub fn mark_unavailable(&self, uri: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(broker) = state.brokers.iter_mut().find(|b| b.uri == uri) {
            if broker.available {
                info!(uri, "broker marked unavailable");
            }
            broker.available = false;
            broker.score = 0.0;
        }
    }

    pub fn mark_available(&self, uri: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(broker) = state.brokers.iter_mut().find(|b| b.uri == uri) {
            broker.available = true;
            broker.rescore(&self.weights);
            info!(uri, score = broker.score, "broker marked available");
        }
    }

    pub fn is_available(&self, uri: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .brokers
            .iter()
            .find(|b| b.uri == uri)
            .is_some_and(|b| b.available)
    }

    /// Highest-scoring available broker; ties go to the earlier registration.
    pub fn best(&self) -> Option<BrokerRecord> {
        let state = self.state.lock().unwrap();
        let mut best: Option<&BrokerRecord> = None;
        for broker in state.brokers.iter().filter(|b| b.available) {
            match best {
                Some(current_best) if broker.score <= current_best.score => {}
                _ => best = Some(broker),
            }
        }
        best.cloned()
    }

    /// True when some other broker beats the current one by more than the
    /// hysteresis threshold.
    pub fn should_switch(&self) -> bool {
        let (Some(current), Some(best)) = (self.current(), self.best()) else {
            return false;
        };
        best.uri != current.uri && best.score - current.score > SWITCH_THRESHOLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(uris: &[&str]) -> BrokerRegistry {
        let registry = BrokerRegistry::new("sensor");
        for uri in uris {
            registry.add(uri);
        }
        registry
    }

    #[test]
    fn test_first_broker_becomes_current() {
        let registry = registry_with(&["mqtt://a:1883", "mqtt://b:1883"]);
        assert_eq!(registry.current_uri().as_deref(), Some("mqtt://a:1883"));
    }

    #[test]
    fn test_duplicate_add_is_ignored() {
        let registry = registry_with(&["mqtt://a:1883", "mqtt://a:1883"]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.uris(), vec!["mqtt://a:1883"]);
    }

    #[test]
    fn test_add_then_remove_leaves_registry_unchanged() {
        let registry = registry_with(&["mqtt://a:1883", "mqtt://b:1883"]);
        registry.add("mqtt://c:1883");
        registry.remove("mqtt://c:1883");
        assert_eq!(registry.uris(), vec!["mqtt://a:1883", "mqtt://b:1883"]);
        assert_eq!(registry.current_uri().as_deref(), Some("mqtt://a:1883"));
    }

    #[test]
    fn test_remove_before_current_shifts_index() {
        let registry = registry_with(&["mqtt://a:1883", "mqtt://b:1883", "mqtt://c:1883"]);
        registry.set_current("mqtt://b:1883");
        registry.remove("mqtt://a:1883");
        assert_eq!(registry.current_uri().as_deref(), Some("mqtt://b:1883"));
    }

    #[test]
    fn test_remove_current_at_tail_clamps_to_last() {
        let registry = registry_with(&["mqtt://a:1883", "mqtt://b:1883", "mqtt://c:1883"]);
        registry.set_current("mqtt://c:1883");
        registry.remove("mqtt://c:1883");
        assert_eq!(registry.current_uri().as_deref(), Some("mqtt://b:1883"));
    }

    #[test]
    fn test_remove_last_broker_empties_current() {
        let registry = registry_with(&["mqtt://a:1883"]);
        registry.remove("mqtt://a:1883");
        assert!(registry.is_empty());
        assert!(registry.current().is_none());
    }

    #[test]
    fn test_clear_resets_everything() {
        let registry = registry_with(&["mqtt://a:1883", "mqtt://b:1883"]);
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.current().is_none());
        assert!(registry.best().is_none());
    }

    #[test]
    fn test_set_current_unknown_uri_fails() {
        let registry = registry_with(&["mqtt://a:1883"]);
        assert!(!registry.set_current("mqtt://nowhere:1883"));
        assert_eq!(registry.current_uri().as_deref(), Some("mqtt://a:1883"));
    }

    #[test]
    fn test_update_metrics_scores_in_unit_range() {
        let registry = registry_with(&["mqtt://a:1883"]);
        registry.update_metrics("mqtt://a:1883", 50.0, 500_000.0, 50);
        let record = registry.get("mqtt://a:1883").unwrap();
        assert!((record.score - 0.5).abs() < 1e-9);
        assert!(record.score >= 0.0 && record.score <= 1.0);
    }

    #[test]
    fn test_last_check_is_monotonic() {
        let registry = registry_with(&["mqtt://a:1883"]);
        let before = registry.get("mqtt://a:1883").unwrap().last_check;
        registry.update_metrics("mqtt://a:1883", 10.0, 0.0, 0);
        let after = registry.get("mqtt://a:1883").unwrap().last_check;
        assert!(after >= before);
        registry.update_metrics("mqtt://a:1883", 20.0, 0.0, 0);
        assert!(registry.get("mqtt://a:1883").unwrap().last_check >= after);
    }

    #[test]
    fn test_unavailable_broker_scores_zero() {
        let registry = registry_with(&["mqtt://a:1883"]);
        registry.update_metrics("mqtt://a:1883", 10.0, 2_000_000.0, 5);
        registry.mark_unavailable("mqtt://a:1883");
        let record = registry.get("mqtt://a:1883").unwrap();
        assert!(!record.available);
        assert_eq!(record.score, 0.0);
    }

    #[test]
    fn test_mark_available_restores_score_from_stored_metrics() {
        let registry = registry_with(&["mqtt://a:1883"]);
        registry.update_metrics("mqtt://a:1883", 50.0, 500_000.0, 50);
        let previous = registry.get("mqtt://a:1883").unwrap().score;
        registry.mark_unavailable("mqtt://a:1883");
        registry.mark_available("mqtt://a:1883");
        let record = registry.get("mqtt://a:1883").unwrap();
        assert!(record.available);
        assert!((record.score - previous).abs() < 1e-9);
    }

    #[test]
    fn test_fresh_metrics_restore_availability() {
        let registry = registry_with(&["mqtt://a:1883"]);
        registry.mark_unavailable("mqtt://a:1883");
        registry.update_metrics("mqtt://a:1883", 10.0, 0.0, 0);
        assert!(registry.is_available("mqtt://a:1883"));
    }

    #[test]
    fn test_best_skips_unavailable_brokers() {
        let registry = registry_with(&["mqtt://a:1883", "mqtt://b:1883"]);
        registry.update_metrics("mqtt://a:1883", 10.0, 2_000_000.0, 5);
        registry.update_metrics("mqtt://b:1883", 80.0, 100_000.0, 90);
        registry.mark_unavailable("mqtt://a:1883");
        assert_eq!(registry.best().unwrap().uri, "mqtt://b:1883");
    }

    #[test]
    fn test_best_none_when_all_unavailable() {
        let registry = registry_with(&["mqtt://a:1883"]);
        registry.mark_unavailable("mqtt://a:1883");
        assert!(registry.best().is_none());
    }

    #[test]
    fn test_best_tie_goes_to_registration_order() {
        let registry = registry_with(&["mqtt://a:1883", "mqtt://b:1883"]);
        registry.update_metrics("mqtt://a:1883", 50.0, 500_000.0, 50);
        registry.update_metrics("mqtt://b:1883", 50.0, 500_000.0, 50);
        assert_eq!(registry.best().unwrap().uri, "mqtt://a:1883");
    }

    #[test]
    fn test_should_switch_hysteresis() {
        let registry = registry_with(&["mqtt://b:1883", "mqtt://c:1883"]);
        // Current scores 0.70, candidate 0.78: inside the dead band.
        registry.update_metrics("mqtt://b:1883", 50.0, 2_000_000.0, 0);
        registry.update_metrics("mqtt://c:1883", 50.0, 2_000_000.0, 60);
        registry.set_current("mqtt://b:1883");
        let b = registry.get("mqtt://b:1883").unwrap().score;
        registry.update_metrics("mqtt://c:1883", 37.0, 2_000_000.0, 0);
        let c = registry.get("mqtt://c:1883").unwrap().score;
        assert!(c - b > 0.0 && c - b <= SWITCH_THRESHOLD);
        assert!(!registry.should_switch());

        // Candidate pulls clearly ahead.
        registry.update_metrics("mqtt://c:1883", 20.0, 2_000_000.0, 0);
        let c = registry.get("mqtt://c:1883").unwrap().score;
        assert!(c - b > SWITCH_THRESHOLD);
        assert!(registry.should_switch());
    }

    #[test]
    fn test_should_switch_false_when_best_is_current() {
        let registry = registry_with(&["mqtt://a:1883", "mqtt://b:1883"]);
        registry.update_metrics("mqtt://a:1883", 10.0, 2_000_000.0, 5);
        assert_eq!(registry.best().unwrap().uri, "mqtt://a:1883");
        assert!(!registry.should_switch());
    }

    #[test]
    fn test_should_switch_false_on_empty_registry() {
        let registry = BrokerRegistry::new("sensor");
        assert!(!registry.should_switch());
    }

    #[test]
    fn test_available_uris_preserve_order() {
        let registry = registry_with(&["mqtt://a:1883", "mqtt://b:1883", "mqtt://c:1883"]);
        registry.mark_unavailable("mqtt://b:1883");
        assert_eq!(
            registry.available_uris(),
            vec!["mqtt://a:1883", "mqtt://c:1883"]
        );
    }
}
