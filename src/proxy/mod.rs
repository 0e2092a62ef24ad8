//! Proxy pool management: health-scored selection, burn-and-replace, and
//! autoscale recommendations.
//!
//! The rotator exclusively owns the mutable pool. Health checker, premium
//! manager, and backoff policy are consulted through their own APIs; nothing
//! else mutates pool membership.

pub mod health;
pub mod premium;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::backoff::{BackoffPolicy, ErrorKind};
use crate::validation::ContentValidator;

pub use health::{HealthChecker, HealthCheckerConfig, HealthReport, ProbeOutcome, ProxyStats};
pub use premium::{
    EnsureOutcome, PremiumError, PremiumProxyConfig, PremiumProxyManager, ProxyDescriptor,
    ProxyProtocol, PurchasePlan,
};

/// Optional constraints applied before selection scoring.
#[derive(Debug, Clone, Default)]
pub struct ProxyRequirements {
    pub country: Option<String>,
    pub protocol: Option<ProxyProtocol>,
}

/// Autoscale pool status relative to the optimal count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoscaleStatus {
    Sufficient,
    Warning,
    Critical,
}

/// Autoscale recommendation snapshot.
#[derive(Debug, Clone)]
pub struct AutoscaleRecommendation {
    pub optimal_proxy_count: usize,
    pub current_healthy: usize,
    pub deficit: usize,
    pub status: AutoscaleStatus,
    pub purchase: Option<PurchasePlan>,
}

/// Autoscale tuning.
#[derive(Debug, Clone)]
pub struct AutoscaleConfig {
    pub enabled: bool,
    pub safety_factor: f64,
    pub target_success_rate: f64,
    pub min_proxy_count: usize,
    pub max_proxy_count: usize,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub cooldown: Duration,
    pub default_concurrency: usize,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            safety_factor: 1.5,
            target_success_rate: 0.85,
            min_proxy_count: 5,
            max_proxy_count: 100,
            warning_threshold: 0.8,
            critical_threshold: 0.5,
            cooldown: Duration::from_secs(30 * 60),
            default_concurrency: 32,
        }
    }
}

/// Rotator configuration.
#[derive(Debug, Clone)]
pub struct RotatorConfig {
    pub auto_replace_burned: bool,
    pub min_healthy_proxies: usize,
    pub health_check_interval: Duration,
    pub intelligent_selection: bool,
    pub autoscale: AutoscaleConfig,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            auto_replace_burned: true,
            min_healthy_proxies: 3,
            health_check_interval: Duration::from_secs(300),
            intelligent_selection: true,
            autoscale: AutoscaleConfig::default(),
        }
    }
}

/// Rotator statistics snapshot.
#[derive(Debug, Clone)]
pub struct RotatorStats {
    pub total_proxies: usize,
    pub healthy_proxies: usize,
    pub failed_proxies: usize,
    pub burned_proxies: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub rotations: u64,
    pub open_circuits: usize,
}

#[derive(Default)]
struct PoolState {
    proxies: Vec<String>,
    cursor: usize,
    failed: HashSet<String>,
    burned: HashSet<String>,
    replacement_in_progress: HashSet<String>,
    total_requests: u64,
    successful_requests: u64,
    rotations: u64,
    last_autoscale: Option<DateTime<Utc>>,
}

/// Health-scored proxy rotator with a burn-and-replace pipeline.
pub struct ProxyRotator {
    config: RotatorConfig,
    health: Arc<HealthChecker>,
    premium: Arc<PremiumProxyManager>,
    backoff: Arc<BackoffPolicy>,
    validator: Arc<ContentValidator>,
    state: Mutex<PoolState>,
}

impl ProxyRotator {
    pub fn new(
        proxies: Vec<String>,
        config: RotatorConfig,
        health: Arc<HealthChecker>,
        premium: Arc<PremiumProxyManager>,
        backoff: Arc<BackoffPolicy>,
        validator: Arc<ContentValidator>,
    ) -> Self {
        log::info!("proxy rotator initialized with {} proxies", proxies.len());
        Self {
            config,
            health,
            premium,
            backoff,
            validator,
            state: Mutex::new(PoolState {
                proxies,
                ..PoolState::default()
            }),
        }
    }

    pub fn health_checker(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    pub fn premium_manager(&self) -> &Arc<PremiumProxyManager> {
        &self.premium
    }

    pub fn backoff(&self) -> &Arc<BackoffPolicy> {
        &self.backoff
    }

    pub fn health_check_interval(&self) -> Duration {
        self.config.health_check_interval
    }

    /// Acquire the best available proxy, refreshing the pool when empty.
    /// Returns `None` when nothing usable exists even after refresh.
    pub async fn acquire(&self, requirements: Option<&ProxyRequirements>) -> Option<String> {
        let mut healthy = self.healthy_proxies();

        if healthy.is_empty() {
            log::warn!("no healthy proxies available, attempting to refresh pool");
            self.refresh_from_premium().await;
            healthy = self.healthy_proxies();
            if healthy.is_empty() {
                log::error!("no proxies available after refresh attempt");
                return None;
            }
        }

        if let Some(requirements) = requirements {
            let filtered = self.filter_by_requirements(&healthy, requirements);
            if !filtered.is_empty() {
                healthy = filtered;
            }
        }

        let selected = self.select_best(&healthy);
        if let Some(ref proxy) = selected {
            let mut state = self.state.lock().expect("pool lock poisoned");
            state.rotations += 1;
            if let Some(index) = state.proxies.iter().position(|p| p == proxy) {
                state.cursor = index + 1;
            }
            log::debug!("selected proxy: {}", truncate(proxy));
        }
        selected
    }

    /// Every pool member that is neither failed, burned, nor circuit-open.
    pub fn healthy_proxies(&self) -> Vec<String> {
        let state = self.state.lock().expect("pool lock poisoned");
        state
            .proxies
            .iter()
            .filter(|proxy| !state.failed.contains(*proxy) && !state.burned.contains(*proxy))
            .filter(|proxy| self.health.is_healthy(proxy))
            .filter(|proxy| self.backoff.is_healthy(proxy))
            .cloned()
            .collect()
    }

    pub fn healthy_count(&self) -> usize {
        self.healthy_proxies().len()
    }

    /// Record a successful request. A provided body runs through content
    /// validation; an invalid body retroactively converts into a failure.
    pub async fn mark_success(&self, proxy: &str, response_time: Duration, body: Option<&str>) {
        {
            let mut state = self.state.lock().expect("pool lock poisoned");
            state.total_requests += 1;
            state.successful_requests += 1;
        }

        self.health
            .record_outcome(proxy, true, response_time.as_secs_f64(), None);
        self.premium
            .mark_proxy_used(proxy, response_time.as_secs_f64(), true, 0.0);
        self.backoff.track_success(proxy);

        if let Some(body) = body {
            let result = self.validator.validate(body, "");
            if !result.is_valid {
                log::warn!("proxy {} returned invalid content", truncate(proxy));
                self.mark_failure(proxy, ErrorKind::SilentBlock).await;
                return;
            }
        }

        let mut state = self.state.lock().expect("pool lock poisoned");
        state.failed.remove(proxy);
    }

    /// Record a failed request and evaluate burn conditions.
    pub async fn mark_failure(&self, proxy: &str, kind: ErrorKind) {
        {
            let mut state = self.state.lock().expect("pool lock poisoned");
            state.total_requests += 1;
            state.failed.insert(proxy.to_string());
        }

        self.health.record_outcome(proxy, false, 0.0, Some(kind.as_str()));
        self.premium.mark_proxy_used(proxy, 0.0, false, 0.0);
        self.backoff.track_failure(proxy, kind);

        if self.should_burn(proxy, kind) {
            self.mark_burned(proxy, kind.as_str()).await;
        }
        log::debug!("marked proxy failure: {} - {kind}", truncate(proxy));
    }

    /// Permanently exclude a proxy and kick off replacement.
    pub async fn mark_burned(&self, proxy: &str, reason: &str) {
        let already_replacing = {
            let mut state = self.state.lock().expect("pool lock poisoned");
            state.burned.insert(proxy.to_string());
            state.failed.insert(proxy.to_string());
            !state.replacement_in_progress.insert(proxy.to_string())
        };

        self.health.mark_burned(proxy, reason);
        log::warn!("proxy burned: {} - {reason}", truncate(proxy));

        if self.config.auto_replace_burned && !already_replacing {
            self.replace_burned(proxy).await;
        }
        {
            let mut state = self.state.lock().expect("pool lock poisoned");
            state.replacement_in_progress.remove(proxy);
        }

        if self.healthy_count() < self.config.min_healthy_proxies {
            log::warn!(
                "low healthy proxy count: {}/{}",
                self.healthy_count(),
                self.config.min_healthy_proxies
            );
            self.emergency_refresh().await;
        }
    }

    /// Probe the whole pool, drop unhealthy members, and top up from the
    /// premium service if the survivor count is low.
    pub async fn validate_and_refresh_pool(&self) -> usize {
        let proxies = {
            let state = self.state.lock().expect("pool lock poisoned");
            state.proxies.clone()
        };

        log::info!("starting proxy pool validation and refresh");
        let reports = self.health.check_batch(&proxies).await;

        let mut survivors = Vec::new();
        for proxy in &proxies {
            match reports.get(proxy) {
                Some(report) if report.is_healthy => {
                    survivors.push(proxy.clone());
                    let mut state = self.state.lock().expect("pool lock poisoned");
                    state.failed.remove(proxy);
                }
                _ => {
                    self.mark_burned(proxy, "failed_validation").await;
                }
            }
        }

        {
            let mut state = self.state.lock().expect("pool lock poisoned");
            state.proxies = survivors;
        }

        let count = {
            let state = self.state.lock().expect("pool lock poisoned");
            state.proxies.len()
        };
        log::info!("proxy validation completed: {count}/{} healthy", proxies.len());

        if count < self.config.min_healthy_proxies {
            self.refresh_from_premium().await;
        }
        self.pool_size()
    }

    pub fn add_proxies<I>(&self, proxies: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut state = self.state.lock().expect("pool lock poisoned");
        let mut added = 0;
        for proxy in proxies {
            if !state.proxies.contains(&proxy) {
                state.proxies.push(proxy);
                added += 1;
            }
        }
        added
    }

    pub fn pool_size(&self) -> usize {
        self.state.lock().expect("pool lock poisoned").proxies.len()
    }

    pub fn stats(&self) -> RotatorStats {
        let healthy = self.healthy_count();
        let state = self.state.lock().expect("pool lock poisoned");
        RotatorStats {
            total_proxies: state.proxies.len(),
            healthy_proxies: healthy,
            failed_proxies: state.failed.len(),
            burned_proxies: state.burned.len(),
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            rotations: state.rotations,
            open_circuits: self.backoff.open_circuit_count(),
        }
    }

    /// Optimal pool size for a given worker concurrency:
    /// `ceil(concurrency · safety / target_success_rate)` clamped to bounds.
    pub fn compute_optimal_proxy_count(&self, concurrency: usize) -> usize {
        let auto = &self.config.autoscale;
        if concurrency == 0 {
            return auto.min_proxy_count;
        }
        let safety = auto.safety_factor.max(1.0);
        let target = auto.target_success_rate.clamp(0.1, 0.99);
        let optimal = (concurrency as f64 * safety / target).ceil() as usize;
        optimal.clamp(auto.min_proxy_count, auto.max_proxy_count.max(auto.min_proxy_count))
    }

    pub fn autoscale_recommendations(&self, concurrency: usize) -> AutoscaleRecommendation {
        let optimal = self.compute_optimal_proxy_count(concurrency);
        let healthy = self.healthy_count();
        let deficit = optimal.saturating_sub(healthy);

        let ratio = if optimal == 0 {
            1.0
        } else {
            healthy as f64 / optimal as f64
        };
        let status = if ratio < self.config.autoscale.critical_threshold {
            AutoscaleStatus::Critical
        } else if ratio < self.config.autoscale.warning_threshold {
            AutoscaleStatus::Warning
        } else {
            AutoscaleStatus::Sufficient
        };

        AutoscaleRecommendation {
            optimal_proxy_count: optimal,
            current_healthy: healthy,
            deficit,
            status,
            purchase: (deficit > 0).then(|| self.premium.purchase_recommendation(deficit)),
        }
    }

    /// Purchase up to the optimal count when the deficit, budget, and
    /// cooldown all allow it.
    pub async fn auto_scale_if_needed(&self, concurrency: usize) -> bool {
        if !self.config.autoscale.enabled {
            return false;
        }

        let recommendation = self.autoscale_recommendations(concurrency);
        if recommendation.deficit == 0 {
            return false;
        }

        {
            let state = self.state.lock().expect("pool lock poisoned");
            if let Some(last) = state.last_autoscale {
                let elapsed = (Utc::now() - last).to_std().unwrap_or(Duration::ZERO);
                if elapsed < self.config.autoscale.cooldown {
                    return false;
                }
            }
        }

        let outcome = self
            .premium
            .ensure_min_proxy_pool(recommendation.optimal_proxy_count)
            .await;
        if outcome.success && outcome.purchased > 0 {
            self.add_proxies(self.premium.active_urls());
            let mut state = self.state.lock().expect("pool lock poisoned");
            state.last_autoscale = Some(Utc::now());
            log::info!(
                "autoscale executed: purchased {} proxies (target {})",
                outcome.purchased,
                outcome.target_count
            );
            return true;
        }
        false
    }

    /// One tick of background maintenance: scheduled premium refresh,
    /// emergency refresh when low, autoscale evaluation, and stats pruning.
    pub async fn run_maintenance(&self) {
        if self.premium.is_enabled() && self.premium.needs_refresh() {
            self.refresh_from_premium().await;
        }

        if self.healthy_count() < self.config.min_healthy_proxies {
            log::warn!("low proxy count detected: {}", self.healthy_count());
            self.emergency_refresh().await;
        }

        if self.config.autoscale.enabled {
            self.auto_scale_if_needed(self.config.autoscale.default_concurrency)
                .await;
        }

        self.health.cleanup_old_statistics();
        self.backoff.cleanup_old_states(Duration::from_secs(24 * 3600));
        self.premium.cleanup_expired();
    }

    async fn replace_burned(&self, burned: &str) {
        let replacements = self.premium.best_proxies(1, None, None);
        if let Some(replacement) = replacements.first() {
            if self.add_proxies([replacement.url.clone()]) > 0 {
                log::info!(
                    "replaced burned proxy with premium proxy: {}",
                    truncate(&replacement.url)
                );
                return;
            }
        } else {
            log::debug!("no premium replacement available for {}", truncate(burned));
        }
        self.refresh_from_premium().await;
    }

    async fn refresh_from_premium(&self) {
        if !self.premium.is_enabled() {
            return;
        }
        if self.premium.refresh_pool().await {
            let added = self.add_proxies(self.premium.active_urls());
            if added > 0 {
                log::info!("added {added} new proxies from premium service");
            }
        }
    }

    /// Emergency path when healthy count collapses: premium refresh first,
    /// then reset half of the failed set so they can be retried.
    async fn emergency_refresh(&self) {
        log::warn!("emergency proxy refresh triggered");
        self.refresh_from_premium().await;

        if self.healthy_count() < self.config.min_healthy_proxies {
            let to_reset: Vec<String> = {
                let state = self.state.lock().expect("pool lock poisoned");
                let failed: Vec<String> = state
                    .failed
                    .iter()
                    .filter(|proxy| !state.burned.contains(*proxy))
                    .cloned()
                    .collect();
                failed[..failed.len() / 2].to_vec()
            };
            for proxy in &to_reset {
                let mut state = self.state.lock().expect("pool lock poisoned");
                state.failed.remove(proxy);
                drop(state);
                self.backoff.reset(proxy);
            }
            if !to_reset.is_empty() {
                log::info!("reset {} failed proxies due to emergency", to_reset.len());
            }
        }
    }

    fn filter_by_requirements(
        &self,
        proxies: &[String],
        requirements: &ProxyRequirements,
    ) -> Vec<String> {
        if requirements.country.is_none() && requirements.protocol.is_none() {
            return proxies.to_vec();
        }

        proxies
            .iter()
            .filter(|proxy| match self.premium.descriptor(proxy) {
                // No metadata: keep the proxy rather than starve selection.
                None => true,
                Some(descriptor) => {
                    let country_ok = requirements
                        .country
                        .as_ref()
                        .map(|c| descriptor.country.eq_ignore_ascii_case(c))
                        .unwrap_or(true);
                    let protocol_ok = requirements
                        .protocol
                        .map(|p| descriptor.protocol == p)
                        .unwrap_or(true);
                    country_ok && protocol_ok
                }
            })
            .cloned()
            .collect()
    }

    /// Intelligent selection: blended health/backoff/usage score with noise.
    /// Falls back to round-robin when disabled.
    fn select_best(&self, candidates: &[String]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }

        if !self.config.intelligent_selection {
            let mut state = self.state.lock().expect("pool lock poisoned");
            let index = state.cursor % candidates.len();
            state.cursor = state.cursor.wrapping_add(1);
            return Some(candidates[index].clone());
        }

        let max_usage = candidates
            .iter()
            .filter_map(|proxy| self.health.snapshot(proxy))
            .map(|stats| stats.total_requests)
            .max()
            .unwrap_or(1)
            .max(1);

        let mut rng = rand::thread_rng();
        let mut best: Option<(String, f64)> = None;
        for proxy in candidates {
            let mut score = 0.0;

            if let Some(stats) = self.health.snapshot(proxy) {
                score += stats.health_score() * 0.4;
                score += (1.0 - stats.total_requests as f64 / max_usage as f64) * 0.2;
            }
            if let Some(retry) = self.backoff.snapshot(proxy) {
                score += retry.success_rate * 0.3;
            }
            score += rng.gen_range(0.0..0.1);

            if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                best = Some((proxy.clone(), score));
            }
        }

        best.map(|(proxy, _)| proxy)
    }

    fn should_burn(&self, proxy: &str, kind: ErrorKind) -> bool {
        if matches!(
            kind,
            ErrorKind::Blocked | ErrorKind::Captcha | ErrorKind::Authentication
        ) {
            return true;
        }

        if let Some(stats) = self.health.snapshot(proxy)
            && (stats.consecutive_failures >= self.health.config().max_failures_before_replacement
                || (stats.success_rate() < 0.2 && stats.total_requests >= 10)
                || (stats.health_score() == 0.0 && stats.total_requests >= 5))
        {
            return true;
        }

        if let Some(retry) = self.backoff.snapshot(proxy)
            && (retry.consecutive_failures >= 3
                || (retry.success_rate < 0.1 && retry.attempt_count >= 5))
        {
            return true;
        }

        false
    }
}

fn truncate(proxy: &str) -> &str {
    &proxy[..proxy.len().min(50)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffConfig;

    fn rotator_with(proxies: &[&str]) -> ProxyRotator {
        let backoff = BackoffPolicy::new(BackoffConfig {
            jitter: false,
            ..BackoffConfig::default()
        });
        ProxyRotator::new(
            proxies.iter().map(|p| p.to_string()).collect(),
            RotatorConfig::default(),
            Arc::new(HealthChecker::default()),
            Arc::new(PremiumProxyManager::new(PremiumProxyConfig::default())),
            Arc::new(backoff),
            Arc::new(ContentValidator::default()),
        )
    }

    #[tokio::test]
    async fn empty_pool_returns_none() {
        let rotator = rotator_with(&[]);
        assert!(rotator.acquire(None).await.is_none());
    }

    #[tokio::test]
    async fn sole_healthy_proxy_is_selected() {
        let rotator = rotator_with(&["http://p1"]);
        assert_eq!(rotator.acquire(None).await.as_deref(), Some("http://p1"));
    }

    #[tokio::test]
    async fn acquire_never_returns_burned_proxy() {
        let rotator = rotator_with(&["http://p1", "http://p2"]);
        rotator.mark_burned("http://p1", "bot_detection").await;

        for _ in 0..20 {
            let acquired = rotator.acquire(None).await;
            assert_eq!(acquired.as_deref(), Some("http://p2"));
        }
    }

    #[tokio::test]
    async fn burn_is_monotone_until_reset() {
        let rotator = rotator_with(&["http://p1"]);
        rotator.mark_burned("http://p1", "captcha").await;
        assert!(!rotator.health_checker().is_healthy("http://p1"));
        assert!(rotator.acquire(None).await.is_none());

        let stats = rotator.stats();
        assert_eq!(stats.burned_proxies, 1);
    }

    #[tokio::test]
    async fn categorical_failures_burn_immediately() {
        let rotator = rotator_with(&["http://p1", "http://p2"]);
        rotator.mark_failure("http://p1", ErrorKind::Blocked).await;

        let stats = rotator.stats();
        assert_eq!(stats.burned_proxies, 1);
        assert!(rotator.health_checker().is_burned("http://p1"));
    }

    #[tokio::test]
    async fn transient_failures_do_not_burn_immediately() {
        let rotator = rotator_with(&["http://p1", "http://p2"]);
        rotator.mark_failure("http://p1", ErrorKind::Timeout).await;

        let stats = rotator.stats();
        assert_eq!(stats.burned_proxies, 0);
        assert_eq!(stats.failed_proxies, 1);
    }

    #[tokio::test]
    async fn success_clears_failed_flag() {
        let rotator = rotator_with(&["http://p1", "http://p2"]);
        rotator.mark_failure("http://p1", ErrorKind::Timeout).await;
        rotator
            .mark_success("http://p1", Duration::from_millis(200), None)
            .await;

        let stats = rotator.stats();
        assert_eq!(stats.failed_proxies, 0);
        assert_eq!(stats.successful_requests, 1);
    }

    #[tokio::test]
    async fn invalid_body_converts_success_to_failure() {
        let rotator = rotator_with(&["http://p1", "http://p2"]);
        rotator
            .mark_success("http://p1", Duration::from_millis(200), Some("x"))
            .await;

        let stats = rotator.stats();
        // One success counter bump plus a retroactive failure.
        assert_eq!(stats.failed_proxies, 1);
        assert_eq!(stats.total_requests, 2);
    }

    #[tokio::test]
    async fn requirements_filter_uses_premium_metadata() {
        let rotator = rotator_with(&[]);
        let mut nl = test_descriptor("http://u:p@nl:1");
        nl.country = "NL".to_string();
        let mut ru = test_descriptor("http://u:p@ru:1");
        ru.country = "RU".to_string();
        rotator.premium_manager().insert_descriptor(nl);
        rotator.premium_manager().insert_descriptor(ru);
        rotator.add_proxies(["http://u:p@nl:1".to_string(), "http://u:p@ru:1".to_string()]);

        let requirements = ProxyRequirements {
            country: Some("NL".to_string()),
            protocol: None,
        };
        for _ in 0..10 {
            let acquired = rotator.acquire(Some(&requirements)).await;
            assert_eq!(acquired.as_deref(), Some("http://u:p@nl:1"));
        }
    }

    #[test]
    fn optimal_proxy_count_formula() {
        let rotator = rotator_with(&[]);
        // ceil(32 * 1.5 / 0.85) = 57, within [5, 100].
        assert_eq!(rotator.compute_optimal_proxy_count(32), 57);
        assert_eq!(rotator.compute_optimal_proxy_count(0), 5);
        assert_eq!(rotator.compute_optimal_proxy_count(1000), 100);
    }

    #[test]
    fn autoscale_status_thresholds() {
        let rotator = rotator_with(&[]);
        let recommendation = rotator.autoscale_recommendations(32);
        assert_eq!(recommendation.status, AutoscaleStatus::Critical);
        assert_eq!(recommendation.deficit, recommendation.optimal_proxy_count);
    }

    fn test_descriptor(url: &str) -> ProxyDescriptor {
        ProxyDescriptor {
            url: url.to_string(),
            host: "h".to_string(),
            port: 1,
            username: "u".to_string(),
            password: "p".to_string(),
            protocol: ProxyProtocol::Http,
            country: "RU".to_string(),
            region: None,
            city: None,
            isp: None,
            expires_at: None,
            created_at: Utc::now(),
            is_active: true,
            usage_count: 0,
            last_used: None,
            response_time_avg: 0.0,
            success_rate: 1.0,
            cost_per_gb: None,
            monthly_traffic_limit_gb: None,
            used_traffic_gb: 0.0,
        }
    }
}
