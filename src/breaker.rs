//! Coarse per-domain circuit breaker sitting above the acquisition path.
//!
//! Independent from the per-proxy breakers: a domain circuit opens on a long
//! failure streak or a high error rate over the recent-outcome window, then
//! probes recovery through a bounded half-open state.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

const RECENT_OUTCOME_WINDOW: usize = 50;

/// Breaker configuration.
#[derive(Debug, Clone)]
pub struct DomainBreakerConfig {
    pub failure_threshold: u32,
    pub error_rate_threshold: f64,
    pub circuit_timeout: Duration,
    pub max_half_open_attempts: u32,
}

impl Default for DomainBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 20,
            error_rate_threshold: 0.8,
            circuit_timeout: Duration::from_secs(300),
            max_half_open_attempts: 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct DomainCircuit {
    consecutive_failures: u32,
    recent: VecDeque<bool>,
    is_open: bool,
    half_open: bool,
    opened_at: Option<DateTime<Utc>>,
    half_open_attempts: u32,
}

impl DomainCircuit {
    fn push_outcome(&mut self, success: bool) {
        if self.recent.len() == RECENT_OUTCOME_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(success);
    }

    fn error_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        self.recent.iter().filter(|ok| !**ok).count() as f64 / self.recent.len() as f64
    }
}

/// Public snapshot of one domain's circuit.
#[derive(Debug, Clone)]
pub struct DomainCircuitState {
    pub domain: String,
    pub consecutive_failures: u32,
    pub error_rate: f64,
    pub is_open: bool,
    pub is_half_open: bool,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_attempts: u32,
}

/// Per-domain circuit breakers owned by the coordinator.
pub struct DomainBreaker {
    config: DomainBreakerConfig,
    circuits: Mutex<HashMap<String, DomainCircuit>>,
}

impl DomainBreaker {
    pub fn new(config: DomainBreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Whether requests to the domain should be skipped. An open circuit
    /// turns half-open once its timeout elapses.
    pub fn is_open(&self, domain: &str) -> bool {
        let mut guard = self.circuits.lock().expect("breaker lock poisoned");
        let circuit = guard.entry(domain.to_string()).or_default();

        if circuit.is_open {
            let timed_out = matches!(
                circuit.opened_at,
                Some(at) if Utc::now() - at > chrono_duration(self.config.circuit_timeout)
            );
            if timed_out {
                circuit.is_open = false;
                circuit.half_open = true;
                circuit.half_open_attempts = 0;
                log::info!("circuit breaker half-open for {domain}");
                return false;
            }
            return true;
        }

        if circuit.half_open && circuit.half_open_attempts >= self.config.max_half_open_attempts {
            log::warn!("half-open attempt limit reached for {domain}; re-opening circuit");
            open_circuit(circuit, domain, self.config.circuit_timeout);
            return true;
        }

        false
    }

    /// Bookkeeping before an admitted request: half-open probes are counted.
    pub fn before_request(&self, domain: &str) {
        let mut guard = self.circuits.lock().expect("breaker lock poisoned");
        let circuit = guard.entry(domain.to_string()).or_default();
        if circuit.half_open {
            circuit.half_open_attempts += 1;
        }
    }

    pub fn record_success(&self, domain: &str) {
        let mut guard = self.circuits.lock().expect("breaker lock poisoned");
        let circuit = guard.entry(domain.to_string()).or_default();
        circuit.consecutive_failures = 0;
        circuit.push_outcome(true);
        if circuit.half_open {
            circuit.half_open = false;
            circuit.half_open_attempts = 0;
            circuit.opened_at = None;
            log::info!("circuit breaker closed for {domain} after successful probe");
        }
    }

    /// Record a failure; opens the circuit when the streak or the windowed
    /// error rate crosses its threshold, or when a half-open probe fails.
    pub fn record_failure(&self, domain: &str) {
        let mut guard = self.circuits.lock().expect("breaker lock poisoned");
        let circuit = guard.entry(domain.to_string()).or_default();
        circuit.consecutive_failures += 1;
        circuit.push_outcome(false);

        if circuit.half_open {
            circuit.half_open = false;
            circuit.half_open_attempts = 0;
            log::warn!("half-open probe failed for {domain}; reopening circuit");
            open_circuit(circuit, domain, self.config.circuit_timeout);
            return;
        }

        let streak_tripped = circuit.consecutive_failures >= self.config.failure_threshold;
        let rate_tripped = circuit.recent.len() >= RECENT_OUTCOME_WINDOW
            && circuit.error_rate() >= self.config.error_rate_threshold;

        if !circuit.is_open && (streak_tripped || rate_tripped) {
            if streak_tripped {
                log::warn!(
                    "opening circuit for {domain}: {} consecutive failures",
                    circuit.consecutive_failures
                );
            } else {
                log::warn!(
                    "opening circuit for {domain}: {:.1}% error rate",
                    circuit.error_rate() * 100.0
                );
            }
            open_circuit(circuit, domain, self.config.circuit_timeout);
        }
    }

    pub fn snapshot(&self, domain: &str) -> Option<DomainCircuitState> {
        let guard = self.circuits.lock().expect("breaker lock poisoned");
        guard.get(domain).map(|circuit| DomainCircuitState {
            domain: domain.to_string(),
            consecutive_failures: circuit.consecutive_failures,
            error_rate: circuit.error_rate(),
            is_open: circuit.is_open,
            is_half_open: circuit.half_open,
            opened_at: circuit.opened_at,
            half_open_attempts: circuit.half_open_attempts,
        })
    }

    pub fn open_count(&self) -> usize {
        let guard = self.circuits.lock().expect("breaker lock poisoned");
        guard.values().filter(|circuit| circuit.is_open).count()
    }

    #[cfg(test)]
    fn force_open_in_past(&self, domain: &str, age: Duration) {
        let mut guard = self.circuits.lock().expect("breaker lock poisoned");
        let circuit = guard.entry(domain.to_string()).or_default();
        circuit.is_open = true;
        circuit.opened_at = Some(Utc::now() - chrono_duration(age));
    }
}

impl Default for DomainBreaker {
    fn default() -> Self {
        Self::new(DomainBreakerConfig::default())
    }
}

fn open_circuit(circuit: &mut DomainCircuit, domain: &str, timeout: Duration) {
    circuit.is_open = true;
    circuit.half_open = false;
    circuit.half_open_attempts = 0;
    circuit.opened_at = Some(Utc::now());
    log::error!(
        "circuit breaker opened for {domain}, retry after {:.0} minutes",
        timeout.as_secs_f64() / 60.0
    );
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| {
        let millis = duration.as_millis().min(i64::MAX as u128);
        chrono::Duration::milliseconds(millis as i64)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_consecutive_failure_threshold() {
        let breaker = DomainBreaker::default();
        for _ in 0..19 {
            breaker.record_failure("shop.example");
            assert!(!breaker.is_open("shop.example"));
        }
        breaker.record_failure("shop.example");
        assert!(breaker.is_open("shop.example"));
    }

    #[test]
    fn opens_on_error_rate_over_window() {
        let breaker = DomainBreaker::default();
        // Interleave successes so the streak never reaches 20, but the
        // 50-outcome window ends up 80% failures.
        for chunk in 0..10 {
            breaker.record_success("shop.example");
            for _ in 0..4 {
                breaker.record_failure("shop.example");
            }
            if chunk < 9 {
                assert!(!breaker.is_open("shop.example"), "opened early at chunk {chunk}");
            }
        }
        assert!(breaker.is_open("shop.example"));
    }

    #[test]
    fn success_resets_streak() {
        let breaker = DomainBreaker::default();
        for _ in 0..19 {
            breaker.record_failure("shop.example");
        }
        breaker.record_success("shop.example");
        breaker.record_failure("shop.example");
        assert!(!breaker.is_open("shop.example"));
    }

    #[test]
    fn open_circuit_turns_half_open_after_timeout() {
        let breaker = DomainBreaker::default();
        breaker.force_open_in_past("shop.example", Duration::from_secs(600));

        assert!(!breaker.is_open("shop.example"));
        let state = breaker.snapshot("shop.example").unwrap();
        assert!(state.is_half_open);
        assert!(!state.is_open);
    }

    #[test]
    fn half_open_probe_success_closes() {
        let breaker = DomainBreaker::default();
        breaker.force_open_in_past("shop.example", Duration::from_secs(600));
        assert!(!breaker.is_open("shop.example"));

        breaker.before_request("shop.example");
        breaker.record_success("shop.example");

        let state = breaker.snapshot("shop.example").unwrap();
        assert!(!state.is_open);
        assert!(!state.is_half_open);
        assert!(state.opened_at.is_none());
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let breaker = DomainBreaker::default();
        breaker.force_open_in_past("shop.example", Duration::from_secs(600));
        assert!(!breaker.is_open("shop.example"));

        breaker.before_request("shop.example");
        breaker.record_failure("shop.example");
        assert!(breaker.is_open("shop.example"));
    }

    #[test]
    fn half_open_attempts_are_bounded() {
        let breaker = DomainBreaker::default();
        breaker.force_open_in_past("shop.example", Duration::from_secs(600));
        assert!(!breaker.is_open("shop.example"));

        breaker.before_request("shop.example");
        // A second probe while the first is still outstanding trips the
        // limit and re-opens.
        assert!(breaker.is_open("shop.example"));
    }

    #[test]
    fn domains_are_independent() {
        let breaker = DomainBreaker::default();
        for _ in 0..25 {
            breaker.record_failure("bad.example");
        }
        assert!(breaker.is_open("bad.example"));
        assert!(!breaker.is_open("good.example"));
        assert_eq!(breaker.open_count(), 1);
    }
}
