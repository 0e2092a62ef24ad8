//! Proxy health probing and burn policy.
//!
//! Stats are owned here but only mutated through the rotator's calls; the
//! burn decision combines probe results with request-level history.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Semaphore;
use tokio::time::Instant;

const RESPONSE_TIME_WINDOW: usize = 100;
const RESPONSE_TIME_SAMPLE: usize = 50;
const FAILURE_REASON_LIMIT: usize = 20;

/// Per-proxy request and probe statistics.
#[derive(Debug, Clone)]
pub struct ProxyStats {
    pub proxy_url: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub response_times: VecDeque<f64>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub failure_reasons: VecDeque<String>,
    pub consecutive_failures: u32,
    pub is_burned: bool,
    pub burn_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ProxyStats {
    pub fn new(proxy_url: impl Into<String>) -> Self {
        Self {
            proxy_url: proxy_url.into(),
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            response_times: VecDeque::with_capacity(RESPONSE_TIME_WINDOW),
            last_check: None,
            last_failure: None,
            failure_reasons: VecDeque::with_capacity(FAILURE_REASON_LIMIT),
            consecutive_failures: 0,
            is_burned: false,
            burn_reason: None,
            created_at: Utc::now(),
        }
    }

    /// Success fraction in `[0, 1]`.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }

    /// Mean of the most recent response time samples, in seconds.
    pub fn avg_response_time(&self) -> f64 {
        if self.response_times.is_empty() {
            return f64::INFINITY;
        }
        let recent: Vec<f64> = self
            .response_times
            .iter()
            .rev()
            .take(RESPONSE_TIME_SAMPLE)
            .copied()
            .collect();
        recent.iter().sum::<f64>() / recent.len() as f64
    }

    /// `0.5·success + 0.3·min(1, 5s/avgRT) + 0.2·uptime`, zero when burned.
    pub fn health_score(&self) -> f64 {
        if self.total_requests == 0 || self.is_burned {
            return 0.0;
        }

        let success_score = self.success_rate();
        let response_score = if self.response_times.is_empty() {
            1.0
        } else {
            (5.0 / self.avg_response_time().max(1.0)).min(1.0)
        };
        let uptime_score = self.success_rate();

        success_score * 0.5 + response_score * 0.3 + uptime_score * 0.2
    }

    fn record(&mut self, success: bool, response_time: f64, error: Option<&str>) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
            self.consecutive_failures = 0;
            if self.response_times.len() == RESPONSE_TIME_WINDOW {
                self.response_times.pop_front();
            }
            self.response_times.push_back(response_time);
        } else {
            self.failed_requests += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.last_failure = Some(Utc::now());
            if let Some(error) = error {
                if self.failure_reasons.len() == FAILURE_REASON_LIMIT {
                    self.failure_reasons.pop_front();
                }
                self.failure_reasons
                    .push_back(format!("{}: {error}", Utc::now().to_rfc3339()));
            }
        }
        self.last_check = Some(Utc::now());
    }
}

/// Outcome of probing one echo endpoint through a proxy.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub url: String,
    pub status: u16,
    pub response_time: Duration,
    pub success: bool,
    pub content_valid: bool,
    pub ip_detected: Option<String>,
    pub error: Option<String>,
}

/// Aggregated probe result for one proxy.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub proxy: String,
    pub is_healthy: bool,
    pub health_score: f64,
    pub avg_response_time: Duration,
    pub successful_probes: usize,
    pub total_probes: usize,
    pub outcomes: Vec<ProbeOutcome>,
    pub checked_at: DateTime<Utc>,
}

/// Health checker configuration.
#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    pub test_urls: Vec<String>,
    pub health_threshold: f64,
    pub max_failures_before_replacement: u32,
    pub probe_timeout: Duration,
    pub concurrent_checks: usize,
    pub history_retention: Duration,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            test_urls: vec![
                "https://httpbin.org/ip".to_string(),
                "https://icanhazip.com".to_string(),
                "https://api.ipify.org".to_string(),
            ],
            health_threshold: 0.8,
            max_failures_before_replacement: 3,
            probe_timeout: Duration::from_secs(10),
            concurrent_checks: 5,
            history_retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Proxy health checker with burn tracking.
pub struct HealthChecker {
    config: HealthCheckerConfig,
    stats: Mutex<HashMap<String, ProxyStats>>,
    burned: Mutex<HashSet<String>>,
}

impl HealthChecker {
    pub fn new(config: HealthCheckerConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(HashMap::new()),
            burned: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &HealthCheckerConfig {
        &self.config
    }

    /// Probe a proxy against every echo endpoint and evaluate burn rules.
    pub async fn check_proxy(&self, proxy: &str) -> HealthReport {
        if self.is_burned(proxy) {
            return HealthReport {
                proxy: proxy.to_string(),
                is_healthy: false,
                health_score: 0.0,
                avg_response_time: Duration::ZERO,
                successful_probes: 0,
                total_probes: 0,
                outcomes: Vec::new(),
                checked_at: Utc::now(),
            };
        }

        let mut outcomes = Vec::new();
        let client = reqwest::Proxy::all(proxy)
            .map_err(|err| err.to_string())
            .and_then(|p| {
                reqwest::Client::builder()
                    .timeout(self.config.probe_timeout)
                    .proxy(p)
                    .build()
                    .map_err(|err| err.to_string())
            });

        match client {
            Ok(client) => {
                for url in &self.config.test_urls {
                    let outcome = probe_endpoint(&client, url).await;
                    self.record_outcome(
                        proxy,
                        outcome.success,
                        outcome.response_time.as_secs_f64(),
                        outcome.error.as_deref(),
                    );
                    outcomes.push(outcome);
                }
            }
            Err(err) => {
                log::warn!("cannot build probe client for {proxy}: {err}");
                self.record_outcome(proxy, false, 0.0, Some(&err));
            }
        }

        let successful = outcomes.iter().filter(|o| o.success).count();
        let score = if outcomes.is_empty() {
            0.0
        } else {
            successful as f64 / outcomes.len() as f64
        };
        let avg = if outcomes.is_empty() {
            Duration::ZERO
        } else {
            outcomes.iter().map(|o| o.response_time).sum::<Duration>() / outcomes.len() as u32
        };
        let is_healthy = score >= self.config.health_threshold;

        if !is_healthy {
            self.evaluate_burn(proxy, score);
        }

        log::debug!("health check for {proxy}: score={score:.2}, healthy={is_healthy}");
        HealthReport {
            proxy: proxy.to_string(),
            is_healthy,
            health_score: score,
            avg_response_time: avg,
            successful_probes: successful,
            total_probes: outcomes.len(),
            outcomes,
            checked_at: Utc::now(),
        }
    }

    /// Probe many proxies with bounded concurrency.
    pub async fn check_batch(self: &Arc<Self>, proxies: &[String]) -> HashMap<String, HealthReport> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrent_checks.max(1)));
        let mut handles = Vec::with_capacity(proxies.len());

        log::info!("starting batch validation of {} proxies", proxies.len());
        for proxy in proxies {
            let checker = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let proxy = proxy.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                let report = checker.check_proxy(&proxy).await;
                (proxy, report)
            }));
        }

        let mut results = HashMap::new();
        for handle in handles {
            if let Ok((proxy, report)) = handle.await {
                results.insert(proxy, report);
            }
        }

        let healthy = results.values().filter(|r| r.is_healthy).count();
        log::info!("batch validation completed: {healthy}/{} proxies healthy", results.len());
        results
    }

    /// Record one request-level outcome for a proxy.
    pub fn record_outcome(&self, proxy: &str, success: bool, response_time: f64, error: Option<&str>) {
        let mut guard = self.stats.lock().expect("health stats lock poisoned");
        guard
            .entry(proxy.to_string())
            .or_insert_with(|| ProxyStats::new(proxy))
            .record(success, response_time, error);
    }

    pub fn mark_burned(&self, proxy: &str, reason: &str) {
        self.burned
            .lock()
            .expect("burned set lock poisoned")
            .insert(proxy.to_string());

        let mut guard = self.stats.lock().expect("health stats lock poisoned");
        let stats = guard
            .entry(proxy.to_string())
            .or_insert_with(|| ProxyStats::new(proxy));
        stats.is_burned = true;
        stats.burn_reason = Some(reason.to_string());

        log::warn!("proxy {proxy} marked as burned: {reason}");
    }

    pub fn is_burned(&self, proxy: &str) -> bool {
        self.burned
            .lock()
            .expect("burned set lock poisoned")
            .contains(proxy)
    }

    pub fn is_healthy(&self, proxy: &str) -> bool {
        if self.is_burned(proxy) {
            return false;
        }
        let guard = self.stats.lock().expect("health stats lock poisoned");
        match guard.get(proxy) {
            // Unknown proxies are assumed healthy until tested.
            None => true,
            Some(stats) => {
                stats.health_score() >= self.config.health_threshold
                    && stats.consecutive_failures < self.config.max_failures_before_replacement
                    && !stats.is_burned
            }
        }
    }

    /// Healthy subset, best health score first.
    pub fn healthy_subset(&self, proxies: &[String]) -> Vec<String> {
        let guard = self.stats.lock().expect("health stats lock poisoned");
        let burned = self.burned.lock().expect("burned set lock poisoned");

        let mut healthy: Vec<(String, f64)> = proxies
            .iter()
            .filter(|proxy| !burned.contains(proxy.as_str()))
            .filter(|proxy| match guard.get(proxy.as_str()) {
                None => true,
                Some(stats) => {
                    stats.health_score() >= self.config.health_threshold
                        && stats.consecutive_failures < self.config.max_failures_before_replacement
                        && !stats.is_burned
                }
            })
            .map(|proxy| {
                let score = guard.get(proxy.as_str()).map(|s| s.health_score()).unwrap_or(0.0);
                (proxy.clone(), score)
            })
            .collect();

        healthy.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        healthy.into_iter().map(|(proxy, _)| proxy).collect()
    }

    pub fn snapshot(&self, proxy: &str) -> Option<ProxyStats> {
        self.stats
            .lock()
            .expect("health stats lock poisoned")
            .get(proxy)
            .cloned()
    }

    pub fn tracked_count(&self) -> usize {
        self.stats.lock().expect("health stats lock poisoned").len()
    }

    /// Drop statistics beyond the retention window; burned proxies stay.
    pub fn cleanup_old_statistics(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.history_retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24));

        let mut guard = self.stats.lock().expect("health stats lock poisoned");
        let stale: Vec<String> = guard
            .iter()
            .filter(|(_, stats)| {
                matches!(stats.last_check, Some(ts) if ts < cutoff) && !stats.is_burned
            })
            .map(|(proxy, _)| proxy.clone())
            .collect();

        for proxy in &stale {
            guard.remove(proxy);
        }
        if !stale.is_empty() {
            log::info!("cleaned up statistics for {} old proxies", stale.len());
        }
        stale.len()
    }

    /// Forget a proxy entirely, including its burned flag.
    pub fn reset_proxy(&self, proxy: &str) {
        self.stats
            .lock()
            .expect("health stats lock poisoned")
            .remove(proxy);
        self.burned
            .lock()
            .expect("burned set lock poisoned")
            .remove(proxy);
        log::info!("reset statistics for proxy {proxy}");
    }

    /// Request-level burn rules: failure streak, collapsed success rate, or
    /// a zeroed probe score with enough observations.
    fn evaluate_burn(&self, proxy: &str, probe_score: f64) {
        let decision = {
            let guard = self.stats.lock().expect("health stats lock poisoned");
            let Some(stats) = guard.get(proxy) else {
                return;
            };
            if stats.consecutive_failures >= self.config.max_failures_before_replacement {
                Some(format!(
                    "too many consecutive failures ({})",
                    stats.consecutive_failures
                ))
            } else if stats.success_rate() < 0.2 && stats.total_requests >= 10 {
                Some(format!(
                    "low success rate ({:.1}%)",
                    stats.success_rate() * 100.0
                ))
            } else if probe_score == 0.0 && stats.total_requests >= 5 {
                Some("zero health score with sufficient tests".to_string())
            } else {
                None
            }
        };

        if let Some(reason) = decision {
            self.mark_burned(proxy, &reason);
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(HealthCheckerConfig::default())
    }
}

async fn probe_endpoint(client: &reqwest::Client, url: &str) -> ProbeOutcome {
    let started = Instant::now();
    match client.get(url).send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let success = (200..300).contains(&status);
            match response.text().await {
                Ok(body) => ProbeOutcome {
                    url: url.to_string(),
                    status,
                    response_time: started.elapsed(),
                    success,
                    content_valid: body.len() > 10,
                    ip_detected: extract_ip(&body),
                    error: None,
                },
                Err(err) => ProbeOutcome {
                    url: url.to_string(),
                    status,
                    response_time: started.elapsed(),
                    success: false,
                    content_valid: false,
                    ip_detected: None,
                    error: Some(err.to_string()),
                },
            }
        }
        Err(err) => ProbeOutcome {
            url: url.to_string(),
            status: 0,
            response_time: started.elapsed(),
            success: false,
            content_valid: false,
            ip_detected: None,
            error: Some(err.to_string()),
        },
    }
}

static IP_JSON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""(?:origin|ip)":\s*"([^"]+)""#).expect("invalid ip json regex"));
static IP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b").expect("invalid ip regex"));

/// Extract an IPv4 address from an echo endpoint body.
fn extract_ip(body: &str) -> Option<String> {
    if let Some(caps) = IP_JSON_RE.captures(body) {
        let candidate = caps[1].to_string();
        if IP_RE.is_match(&candidate) {
            return Some(candidate);
        }
    }
    IP_RE.find(body.trim()).map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_score_blends_success_and_latency() {
        let mut stats = ProxyStats::new("http://p1");
        for _ in 0..10 {
            stats.record(true, 0.5, None);
        }
        // All successes with sub-second latency: 0.5 + 0.3 + 0.2.
        assert!((stats.health_score() - 1.0).abs() < 1e-9);

        stats.record(false, 0.0, Some("timeout"));
        assert!(stats.health_score() < 1.0);
    }

    #[test]
    fn burned_proxy_scores_zero() {
        let mut stats = ProxyStats::new("http://p1");
        stats.record(true, 0.2, None);
        stats.is_burned = true;
        assert_eq!(stats.health_score(), 0.0);
    }

    #[test]
    fn response_times_ring_is_bounded() {
        let mut stats = ProxyStats::new("http://p1");
        for i in 0..250 {
            stats.record(true, i as f64, None);
        }
        assert_eq!(stats.response_times.len(), RESPONSE_TIME_WINDOW);
    }

    #[test]
    fn failure_reasons_ring_is_bounded() {
        let mut stats = ProxyStats::new("http://p1");
        for _ in 0..50 {
            stats.record(false, 0.0, Some("connect refused"));
        }
        assert_eq!(stats.failure_reasons.len(), FAILURE_REASON_LIMIT);
    }

    #[test]
    fn burn_is_permanent_until_reset() {
        let checker = HealthChecker::default();
        checker.record_outcome("http://p1", true, 0.2, None);
        assert!(checker.is_healthy("http://p1"));

        checker.mark_burned("http://p1", "bot_detection");
        assert!(!checker.is_healthy("http://p1"));
        assert!(checker.is_burned("http://p1"));

        checker.reset_proxy("http://p1");
        assert!(checker.is_healthy("http://p1"));
    }

    #[test]
    fn consecutive_failures_trip_health() {
        let checker = HealthChecker::default();
        for _ in 0..3 {
            checker.record_outcome("http://p2", false, 0.0, Some("timeout"));
        }
        assert!(!checker.is_healthy("http://p2"));
    }

    #[test]
    fn healthy_subset_sorted_by_score() {
        let checker = HealthChecker::default();
        for _ in 0..10 {
            checker.record_outcome("http://fast", true, 0.2, None);
            checker.record_outcome("http://slow", true, 20.0, None);
        }
        checker.mark_burned("http://burned", "captcha");

        let pool = vec![
            "http://slow".to_string(),
            "http://burned".to_string(),
            "http://fast".to_string(),
        ];
        let healthy = checker.healthy_subset(&pool);
        assert_eq!(healthy.first().map(String::as_str), Some("http://fast"));
        assert!(!healthy.contains(&"http://burned".to_string()));
    }

    #[test]
    fn unknown_proxy_is_assumed_healthy() {
        let checker = HealthChecker::default();
        assert!(checker.is_healthy("http://never-seen"));
    }

    #[test]
    fn extract_ip_handles_json_and_plain() {
        assert_eq!(
            extract_ip("{\"origin\": \"203.0.113.7\"}").as_deref(),
            Some("203.0.113.7")
        );
        assert_eq!(extract_ip("198.51.100.2\n").as_deref(), Some("198.51.100.2"));
        assert_eq!(extract_ip("no address here"), None);
    }

    #[test]
    fn cleanup_retains_burned() {
        let config = HealthCheckerConfig {
            history_retention: Duration::ZERO,
            ..HealthCheckerConfig::default()
        };
        let checker = HealthChecker::new(config);
        checker.record_outcome("http://old", true, 0.1, None);
        checker.mark_burned("http://toxic", "blocked");
        checker.record_outcome("http://toxic", false, 0.0, Some("blocked"));

        std::thread::sleep(Duration::from_millis(10));
        let removed = checker.cleanup_old_statistics();
        assert_eq!(removed, 1);
        assert!(checker.snapshot("http://toxic").is_some());
        assert!(checker.snapshot("http://old").is_none());
    }
}
