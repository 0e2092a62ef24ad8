//! Exponential backoff with per-identifier circuit breakers.
//!
//! Identifiers are typically proxy URLs or domains. Each error kind carries
//! its own retry strategy; delays get jitter plus an adaptive factor based on
//! the identifier's historical success rate.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::time::sleep;

const RECENT_FAILURE_LIMIT: usize = 20;

/// Error taxonomy shared by the retry, rotation, and escalation logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    RateLimit,
    Captcha,
    Blocked,
    Network,
    Http5xx,
    Http4xx,
    ProxyError,
    Authentication,
    SilentBlock,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Captcha => "captcha",
            ErrorKind::Blocked => "blocked",
            ErrorKind::Network => "network",
            ErrorKind::Http5xx => "http_5xx",
            ErrorKind::Http4xx => "http_4xx",
            ErrorKind::ProxyError => "proxy_error",
            ErrorKind::Authentication => "authentication",
            ErrorKind::SilentBlock => "silent_block",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Classify a free-form error message into a kind.
    pub fn classify(message: &str) -> Self {
        let lowered = message.to_lowercase();
        let normalized = lowered.replace('_', " ");

        if normalized.contains("timeout") || normalized.contains("timed out") {
            ErrorKind::Timeout
        } else if normalized.contains("rate limit") || lowered.contains("429") {
            ErrorKind::RateLimit
        } else if normalized.contains("captcha") {
            ErrorKind::Captcha
        } else if normalized.contains("blocked")
            || normalized.contains("access denied")
            || lowered.contains("403")
            || normalized.contains("forbidden")
        {
            ErrorKind::Blocked
        } else if normalized.contains("proxy") {
            ErrorKind::ProxyError
        } else if normalized.contains("network") || normalized.contains("connection") {
            ErrorKind::Network
        } else if ["500", "502", "503", "504"].iter().any(|c| lowered.contains(c)) {
            ErrorKind::Http5xx
        } else if normalized.contains("auth") || normalized.contains("unauthorized") {
            ErrorKind::Authentication
        } else if ["400", "401", "404"].iter().any(|c| lowered.contains(c)) {
            ErrorKind::Http4xx
        } else {
            ErrorKind::Unknown
        }
    }

    /// Map an HTTP status code onto the taxonomy. 404 is handled by the
    /// coordinator as a terminal outcome before this is consulted.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ErrorKind::RateLimit,
            401 => ErrorKind::Authentication,
            403 => ErrorKind::Blocked,
            400..=499 => ErrorKind::Http4xx,
            500..=599 => ErrorKind::Http5xx,
            _ => ErrorKind::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-error-kind retry parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryStrategy {
    pub max_attempts: u32,
    pub multiplier: f64,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryStrategy {
    fn new(max_attempts: u32, multiplier: f64, base_secs: f64, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            multiplier,
            base_delay: Duration::from_secs_f64(base_secs),
            max_delay,
        }
    }
}

/// Backoff and circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub enabled: bool,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    pub max_attempts: u32,
    pub circuit_breaker_enabled: bool,
    pub failure_threshold: u32,
    pub circuit_timeout: Duration,
    pub max_half_open_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: true,
            max_attempts: 5,
            circuit_breaker_enabled: true,
            failure_threshold: 5,
            circuit_timeout: Duration::from_secs(60),
            max_half_open_attempts: 1,
        }
    }
}

impl BackoffConfig {
    /// Strategy table per error kind; the global max delay caps all of them.
    pub fn strategy(&self, kind: ErrorKind) -> RetryStrategy {
        let cap = self.max_delay;
        match kind {
            ErrorKind::Timeout => RetryStrategy::new(3, 1.5, 2.0, cap),
            ErrorKind::RateLimit => RetryStrategy::new(5, 3.0, 10.0, cap),
            ErrorKind::Captcha => RetryStrategy::new(2, 5.0, 30.0, cap),
            ErrorKind::Blocked => RetryStrategy::new(1, 1.0, 0.0, cap),
            ErrorKind::Network => RetryStrategy::new(4, 2.0, 1.0, cap),
            ErrorKind::Http5xx => RetryStrategy::new(3, 2.0, 5.0, cap),
            ErrorKind::Http4xx => RetryStrategy::new(1, 1.0, 0.0, cap),
            ErrorKind::ProxyError => RetryStrategy::new(2, 1.5, 3.0, cap),
            ErrorKind::Authentication => RetryStrategy::new(1, 1.0, 0.0, cap),
            ErrorKind::SilentBlock => RetryStrategy::new(1, 1.0, 0.0, cap),
            ErrorKind::Unknown => RetryStrategy {
                max_attempts: self.max_attempts,
                multiplier: self.multiplier,
                base_delay: self.base_delay,
                max_delay: cap,
            },
        }
    }
}

/// Circuit breaker sub-state for one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { opened_at: DateTime<Utc> },
    HalfOpen { attempts: u32 },
}

/// Retry bookkeeping for one identifier.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub attempt_count: u64,
    pub success_count: u64,
    pub consecutive_failures: u32,
    pub first_failure: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub recent_failures: VecDeque<(DateTime<Utc>, ErrorKind)>,
    pub total_delay: Duration,
    pub circuit: CircuitState,
}

impl Default for RetryState {
    fn default() -> Self {
        Self {
            attempt_count: 0,
            success_count: 0,
            consecutive_failures: 0,
            first_failure: None,
            last_failure: None,
            last_success: None,
            recent_failures: VecDeque::with_capacity(RECENT_FAILURE_LIMIT),
            total_delay: Duration::ZERO,
            circuit: CircuitState::Closed,
        }
    }
}

impl RetryState {
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + u64::from(self.consecutive_failures);
        if total == 0 {
            return 1.0;
        }
        self.success_count as f64 / total as f64
    }

    fn push_failure(&mut self, now: DateTime<Utc>, kind: ErrorKind) {
        if self.recent_failures.len() == RECENT_FAILURE_LIMIT {
            self.recent_failures.pop_front();
        }
        self.recent_failures.push_back((now, kind));
    }
}

/// Read-only snapshot exposed to callers.
#[derive(Debug, Clone)]
pub struct RetryStateSnapshot {
    pub identifier: String,
    pub attempt_count: u64,
    pub success_count: u64,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub total_delay: Duration,
    pub circuit_open: bool,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub recent_failure_kinds: Vec<ErrorKind>,
}

/// Aggregate counters across all identifiers.
#[derive(Debug, Clone, Default)]
pub struct GlobalRetryStats {
    pub total_retries: u64,
    pub total_delay: Duration,
    pub circuits_opened: u64,
    pub successful_recoveries: u64,
}

struct PolicyState {
    states: HashMap<String, RetryState>,
    global: GlobalRetryStats,
}

/// Typed-error retry policy with per-identifier circuit breakers.
pub struct BackoffPolicy {
    config: BackoffConfig,
    inner: Mutex<PolicyState>,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(PolicyState {
                states: HashMap::new(),
                global: GlobalRetryStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Delay for a given attempt with jitter and adaptive scaling.
    pub fn calculate_delay(
        &self,
        attempt: u32,
        identifier: Option<&str>,
        kind: ErrorKind,
    ) -> Duration {
        if !self.config.enabled {
            return Duration::ZERO;
        }

        let strategy = self.config.strategy(kind);
        let raw = strategy.base_delay.as_secs_f64() * strategy.multiplier.powi(attempt as i32);
        let mut delay = raw.min(strategy.max_delay.as_secs_f64());

        if self.config.jitter && delay > 0.0 {
            let factor = 1.1 + rand::thread_rng().gen_range(0.0..0.4);
            delay *= factor;
        }

        if let Some(id) = identifier {
            let guard = self.inner.lock().expect("backoff lock poisoned");
            if let Some(state) = guard.states.get(id) {
                let rate = state.success_rate();
                if rate < 0.3 {
                    delay *= 1.5;
                } else if rate > 0.8 {
                    delay *= 0.8;
                }
            }
        }

        Duration::from_secs_f64(delay)
    }

    /// Retry decision based on error kind, attempt number, and circuit state.
    pub fn should_retry(&self, identifier: &str, attempt: u32, kind: ErrorKind) -> bool {
        if !self.config.enabled {
            return false;
        }

        match kind {
            ErrorKind::Blocked | ErrorKind::Authentication => return false,
            ErrorKind::Captcha => return attempt < 2,
            _ => {}
        }

        let mut guard = self.inner.lock().expect("backoff lock poisoned");
        let threshold = self.config.failure_threshold;
        let breaker_enabled = self.config.circuit_breaker_enabled;
        let inner = &mut *guard;
        let state = inner.states.entry(identifier.to_string()).or_default();

        if breaker_enabled && !circuit_admits(state, Utc::now(), &self.config) {
            log::debug!("circuit open for {identifier}, no retry");
            return false;
        }

        let strategy = self.config.strategy(kind);
        let max_attempts = if kind == ErrorKind::RateLimit {
            strategy.max_attempts.max(5)
        } else {
            strategy.max_attempts
        };

        if attempt >= max_attempts {
            return false;
        }

        // The threshold only trips a closed circuit; a half-open probe that
        // was just admitted still carries the old failure streak.
        if breaker_enabled
            && matches!(state.circuit, CircuitState::Closed)
            && state.consecutive_failures >= threshold
        {
            open_circuit(state, &mut inner.global, identifier);
            return false;
        }

        true
    }

    pub fn track_failure(&self, identifier: &str, kind: ErrorKind) {
        let mut guard = self.inner.lock().expect("backoff lock poisoned");
        let threshold = self.config.failure_threshold;
        let breaker_enabled = self.config.circuit_breaker_enabled;
        let inner = &mut *guard;
        let state = inner.states.entry(identifier.to_string()).or_default();

        let now = Utc::now();
        if state.first_failure.is_none() {
            state.first_failure = Some(now);
        }
        state.last_failure = Some(now);
        state.attempt_count += 1;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.push_failure(now, kind);

        // A failed half-open probe reopens immediately.
        let reopen = matches!(state.circuit, CircuitState::HalfOpen { .. })
            || state.consecutive_failures >= threshold;
        if breaker_enabled && reopen {
            open_circuit(state, &mut inner.global, identifier);
        }

        inner.global.total_retries += 1;
    }

    pub fn track_success(&self, identifier: &str) {
        let mut guard = self.inner.lock().expect("backoff lock poisoned");
        let inner = &mut *guard;
        let state = inner.states.entry(identifier.to_string()).or_default();

        state.last_success = Some(Utc::now());
        state.success_count += 1;
        state.consecutive_failures = 0;

        if !matches!(state.circuit, CircuitState::Closed) {
            state.circuit = CircuitState::Closed;
            inner.global.successful_recoveries += 1;
            log::info!("circuit closed for {identifier} after successful request");
        }
    }

    /// Reset failure state while keeping success history.
    pub fn reset(&self, identifier: &str) {
        let mut guard = self.inner.lock().expect("backoff lock poisoned");
        let kept = guard
            .states
            .get(identifier)
            .map(|old| (old.success_count, old.last_success));
        if let Some((success_count, last_success)) = kept {
            let fresh = RetryState {
                success_count,
                last_success,
                ..RetryState::default()
            };
            guard.states.insert(identifier.to_string(), fresh);
        }
    }

    /// Calculate the delay, record it, and sleep.
    pub async fn wait_with_backoff(
        &self,
        identifier: &str,
        attempt: u32,
        kind: ErrorKind,
    ) -> Duration {
        let delay = self.calculate_delay(attempt, Some(identifier), kind);

        if delay > Duration::ZERO {
            {
                let mut guard = self.inner.lock().expect("backoff lock poisoned");
                let inner = &mut *guard;
                let state = inner.states.entry(identifier.to_string()).or_default();
                state.total_delay += delay;
                inner.global.total_delay += delay;
            }
            log::debug!("waiting {:.2}s before retry for {identifier}", delay.as_secs_f64());
            sleep(delay).await;
        }

        delay
    }

    /// Healthy means: circuit not open, failure streak below threshold, and
    /// success rate not collapsed once enough attempts accumulated.
    pub fn is_healthy(&self, identifier: &str) -> bool {
        let guard = self.inner.lock().expect("backoff lock poisoned");
        let Some(state) = guard.states.get(identifier) else {
            return true;
        };

        match state.circuit {
            CircuitState::Open { opened_at } => {
                if Utc::now() < opened_at + chrono_duration(self.config.circuit_timeout) {
                    return false;
                }
            }
            CircuitState::HalfOpen { attempts } => {
                if attempts >= self.config.max_half_open_attempts {
                    return false;
                }
            }
            CircuitState::Closed => {}
        }

        if state.consecutive_failures >= self.config.failure_threshold {
            return false;
        }

        if state.success_rate() < 0.2 && state.attempt_count > 5 {
            return false;
        }

        true
    }

    pub fn healthy_subset(&self, identifiers: &[String]) -> Vec<String> {
        identifiers
            .iter()
            .filter(|id| self.is_healthy(id))
            .cloned()
            .collect()
    }

    pub fn force_reset_circuit(&self, identifier: &str) -> bool {
        let mut guard = self.inner.lock().expect("backoff lock poisoned");
        if let Some(state) = guard.states.get_mut(identifier)
            && !matches!(state.circuit, CircuitState::Closed)
        {
            state.circuit = CircuitState::Closed;
            state.consecutive_failures = 0;
            log::info!("force reset circuit breaker for {identifier}");
            return true;
        }
        false
    }

    /// Drop states with no recent activity. Open circuits are kept.
    pub fn cleanup_old_states(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - chrono_duration(max_age);
        let mut guard = self.inner.lock().expect("backoff lock poisoned");

        let stale: Vec<String> = guard
            .states
            .iter()
            .filter(|(_, state)| {
                let last = state.last_success.max(state.last_failure);
                let open = matches!(state.circuit, CircuitState::Open { .. });
                matches!(last, Some(ts) if ts < cutoff) && !open
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            guard.states.remove(id);
        }
        if !stale.is_empty() {
            log::info!("cleaned up {} old retry states", stale.len());
        }
        stale.len()
    }

    pub fn snapshot(&self, identifier: &str) -> Option<RetryStateSnapshot> {
        let guard = self.inner.lock().expect("backoff lock poisoned");
        guard.states.get(identifier).map(|state| RetryStateSnapshot {
            identifier: identifier.to_string(),
            attempt_count: state.attempt_count,
            success_count: state.success_count,
            consecutive_failures: state.consecutive_failures,
            success_rate: state.success_rate(),
            total_delay: state.total_delay,
            circuit_open: !matches!(state.circuit, CircuitState::Closed),
            last_failure: state.last_failure,
            last_success: state.last_success,
            recent_failure_kinds: state
                .recent_failures
                .iter()
                .map(|(_, kind)| *kind)
                .collect(),
        })
    }

    pub fn global_stats(&self) -> GlobalRetryStats {
        self.inner.lock().expect("backoff lock poisoned").global.clone()
    }

    pub fn open_circuit_count(&self) -> usize {
        let guard = self.inner.lock().expect("backoff lock poisoned");
        guard
            .states
            .values()
            .filter(|s| !matches!(s.circuit, CircuitState::Closed))
            .count()
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| {
        let millis = duration.as_millis().min(i64::MAX as u128);
        chrono::Duration::milliseconds(millis as i64)
    })
}

/// Lazily advance the circuit machine and report whether a request may pass.
/// Open circuits turn half-open once the timeout elapses; half-open admits a
/// bounded number of probes.
fn circuit_admits(state: &mut RetryState, now: DateTime<Utc>, config: &BackoffConfig) -> bool {
    match state.circuit {
        CircuitState::Closed => true,
        CircuitState::Open { opened_at } => {
            if now >= opened_at + chrono_duration(config.circuit_timeout) {
                state.circuit = CircuitState::HalfOpen { attempts: 1 };
                true
            } else {
                false
            }
        }
        CircuitState::HalfOpen { attempts } => {
            if attempts >= config.max_half_open_attempts {
                false
            } else {
                state.circuit = CircuitState::HalfOpen {
                    attempts: attempts + 1,
                };
                true
            }
        }
    }
}

fn open_circuit(state: &mut RetryState, global: &mut GlobalRetryStats, identifier: &str) {
    if !matches!(state.circuit, CircuitState::Open { .. }) {
        state.circuit = CircuitState::Open {
            opened_at: Utc::now(),
        };
        global.circuits_opened += 1;
        log::warn!(
            "circuit opened for {identifier} after {} consecutive failures",
            state.consecutive_failures
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_error_messages() {
        assert_eq!(ErrorKind::classify("connection timed out"), ErrorKind::Timeout);
        assert_eq!(ErrorKind::classify("HTTP 429 Too Many Requests"), ErrorKind::RateLimit);
        assert_eq!(ErrorKind::classify("access denied by origin"), ErrorKind::Blocked);
        assert_eq!(ErrorKind::classify("proxy refused"), ErrorKind::ProxyError);
        assert_eq!(ErrorKind::classify("connection reset by peer"), ErrorKind::Network);
        assert_eq!(ErrorKind::classify("503 service unavailable"), ErrorKind::Http5xx);
        assert_eq!(ErrorKind::classify("weird"), ErrorKind::Unknown);
    }

    #[test]
    fn delay_grows_with_attempts_and_respects_cap() {
        let mut config = BackoffConfig::default();
        config.jitter = false;
        let policy = BackoffPolicy::new(config);

        let d0 = policy.calculate_delay(0, None, ErrorKind::RateLimit);
        let d1 = policy.calculate_delay(1, None, ErrorKind::RateLimit);
        let d9 = policy.calculate_delay(9, None, ErrorKind::RateLimit);

        assert_eq!(d0, Duration::from_secs(10));
        assert_eq!(d1, Duration::from_secs(30));
        assert_eq!(d9, Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_in_expected_band() {
        let policy = BackoffPolicy::default();
        for _ in 0..50 {
            let delay = policy.calculate_delay(0, None, ErrorKind::RateLimit).as_secs_f64();
            assert!((11.0..=15.0).contains(&delay), "delay {delay} outside jitter band");
        }
    }

    #[test]
    fn blocked_and_auth_never_retry() {
        let policy = BackoffPolicy::default();
        assert!(!policy.should_retry("p", 0, ErrorKind::Blocked));
        assert!(!policy.should_retry("p", 0, ErrorKind::Authentication));
    }

    #[test]
    fn captcha_retries_twice() {
        let policy = BackoffPolicy::default();
        assert!(policy.should_retry("p", 0, ErrorKind::Captcha));
        assert!(policy.should_retry("p", 1, ErrorKind::Captcha));
        assert!(!policy.should_retry("p", 2, ErrorKind::Captcha));
    }

    #[test]
    fn circuit_opens_after_threshold_and_blocks_retries() {
        let mut config = BackoffConfig::default();
        config.failure_threshold = 3;
        let policy = BackoffPolicy::new(config);

        for _ in 0..3 {
            policy.track_failure("proxy-a", ErrorKind::Network);
        }

        assert!(!policy.is_healthy("proxy-a"));
        assert!(!policy.should_retry("proxy-a", 0, ErrorKind::Network));
        assert_eq!(policy.global_stats().circuits_opened, 1);
    }

    #[test]
    fn success_closes_circuit_and_resets_streak() {
        let mut config = BackoffConfig::default();
        config.failure_threshold = 2;
        let policy = BackoffPolicy::new(config);

        policy.track_failure("proxy-b", ErrorKind::Timeout);
        policy.track_failure("proxy-b", ErrorKind::Timeout);
        assert!(!policy.is_healthy("proxy-b"));

        policy.track_success("proxy-b");
        assert!(policy.is_healthy("proxy-b"));
        let snap = policy.snapshot("proxy-b").unwrap();
        assert_eq!(snap.consecutive_failures, 0);
        assert!(!snap.circuit_open);
        assert_eq!(policy.global_stats().successful_recoveries, 1);
    }

    #[test]
    fn half_open_admits_bounded_probes() {
        let config = BackoffConfig {
            failure_threshold: 1,
            circuit_timeout: Duration::ZERO,
            max_half_open_attempts: 1,
            ..BackoffConfig::default()
        };
        let policy = BackoffPolicy::new(config);

        policy.track_failure("proxy-c", ErrorKind::Network);
        // Timeout of zero means the next query moves the circuit half-open
        // and admits exactly one probe.
        assert!(policy.should_retry("proxy-c", 0, ErrorKind::Network));
        assert!(!policy.should_retry("proxy-c", 0, ErrorKind::Network));
    }

    #[test]
    fn failed_half_open_probe_reopens() {
        let config = BackoffConfig {
            failure_threshold: 1,
            circuit_timeout: Duration::ZERO,
            ..BackoffConfig::default()
        };
        let policy = BackoffPolicy::new(config);

        policy.track_failure("proxy-d", ErrorKind::Network);
        assert!(policy.should_retry("proxy-d", 0, ErrorKind::Network));
        policy.track_failure("proxy-d", ErrorKind::Network);

        let snap = policy.snapshot("proxy-d").unwrap();
        assert!(snap.circuit_open);
    }

    #[test]
    fn unknown_identifiers_are_healthy() {
        let policy = BackoffPolicy::default();
        assert!(policy.is_healthy("never-seen"));
    }

    #[test]
    fn healthy_subset_filters() {
        let mut config = BackoffConfig::default();
        config.failure_threshold = 1;
        let policy = BackoffPolicy::new(config);
        policy.track_failure("bad", ErrorKind::Network);

        let ids = vec!["good".to_string(), "bad".to_string()];
        assert_eq!(policy.healthy_subset(&ids), vec!["good".to_string()]);
    }

    #[test]
    fn recent_failures_ring_is_bounded() {
        let mut config = BackoffConfig::default();
        config.circuit_breaker_enabled = false;
        let policy = BackoffPolicy::new(config);
        for _ in 0..40 {
            policy.track_failure("noisy", ErrorKind::Timeout);
        }
        let snap = policy.snapshot("noisy").unwrap();
        assert_eq!(snap.recent_failure_kinds.len(), RECENT_FAILURE_LIMIT);
    }

    #[test]
    fn cleanup_keeps_open_circuits() {
        let mut config = BackoffConfig::default();
        config.failure_threshold = 1;
        let policy = BackoffPolicy::new(config);

        policy.track_failure("open-circuit", ErrorKind::Network);
        policy.track_success("recent");

        // Nothing is older than a day, so nothing is removed either way.
        assert_eq!(policy.cleanup_old_states(Duration::from_secs(86_400)), 0);
        // With a zero cutoff the recent state goes, the open circuit stays.
        assert_eq!(policy.cleanup_old_states(Duration::ZERO), 1);
        assert!(policy.snapshot("open-circuit").is_some());
    }
}
