//! Configuration tree for the acquisition pipeline.
//!
//! Every section is optional in the TOML file; missing sections and fields
//! fall back to documented defaults. Secrets are never stored inline: API
//! keys are looked up through the environment variable named in the config.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::BackoffConfig;
use crate::breaker::DomainBreakerConfig;
use crate::captcha::CaptchaSolverConfig;
use crate::challenge::ChallengeSolverConfig;
use crate::proxy::{AutoscaleConfig, HealthCheckerConfig, PremiumProxyConfig, RotatorConfig};
use crate::robots::RobotsConfig;
use crate::session::SessionConfig;
use crate::user_agents::{RotationStrategy, UserAgentConfig};
use crate::validation::ValidatorConfig;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: String },
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub proxy_infrastructure: ProxyInfrastructureSection,
    #[serde(default)]
    pub captcha_solving: CaptchaSolvingSection,
    #[serde(default)]
    pub user_agent_rotation: UserAgentRotationSection,
    #[serde(default)]
    pub robots_compliance: RobotsComplianceSection,
    #[serde(default)]
    pub flaresolverr: FlareSolverrSection,
    #[serde(default)]
    pub guard_detection: GuardDetectionSection,
    #[serde(default)]
    pub antibot_integration: AntibotIntegrationSection,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            });
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Sanity-check the configuration. Problems come back as warnings; the
    /// caller decides whether any of them is fatal.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.captcha_solving.enabled
            && std::env::var(&self.captcha_solving.api_key_env)
                .unwrap_or_default()
                .is_empty()
        {
            warnings.push(format!(
                "captcha_solving enabled but env {} is not set",
                self.captcha_solving.api_key_env
            ));
        }

        if self.proxy_infrastructure.premium_proxies.enabled
            && std::env::var(&self.proxy_infrastructure.premium_proxies.api_key_env)
                .unwrap_or_default()
                .is_empty()
        {
            warnings.push(format!(
                "premium_proxies enabled but env {} is not set",
                self.proxy_infrastructure.premium_proxies.api_key_env
            ));
        }

        if self.flaresolverr.enabled && self.flaresolverr.endpoint.is_empty() {
            warnings.push("flaresolverr enabled with an empty endpoint".to_string());
        }

        if self.user_agent_rotation.pool_size == 0 {
            warnings.push("user_agent_rotation.pool_size of zero disables rotation".to_string());
        }

        for warning in &warnings {
            log::warn!("config: {warning}");
        }
        warnings
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        let section = &self.proxy_infrastructure.content_validation;
        ValidatorConfig {
            min_content_length: section.min_content_length,
            quality_threshold: section.quality_threshold,
            required_elements: section.required_elements.clone(),
            silent_detection_enabled: section.silent_block_detection,
            min_content_ratio: section.min_content_ratio,
            check_element_count: true,
            compare_with_previous: true,
        }
    }

    pub fn backoff_config(&self) -> BackoffConfig {
        let section = &self.proxy_infrastructure.backoff;
        BackoffConfig {
            enabled: section.enabled,
            base_delay: Duration::from_secs_f64(section.base_delay_seconds),
            max_delay: Duration::from_secs_f64(section.max_delay_seconds),
            multiplier: section.multiplier,
            jitter: section.jitter,
            max_attempts: section.max_attempts,
            circuit_breaker_enabled: section.circuit_breaker_enabled,
            failure_threshold: section.circuit_failure_threshold,
            circuit_timeout: Duration::from_secs_f64(section.circuit_timeout_seconds),
            max_half_open_attempts: section.circuit_recovery_attempts,
        }
    }

    pub fn health_config(&self) -> HealthCheckerConfig {
        let section = &self.proxy_infrastructure.proxy_health;
        HealthCheckerConfig {
            test_urls: section.test_urls.clone(),
            health_threshold: section.health_threshold,
            max_failures_before_replacement: section.max_failures_before_replacement,
            probe_timeout: Duration::from_secs_f64(section.timeout_seconds),
            concurrent_checks: section.concurrent_checks,
            history_retention: Duration::from_secs_f64(section.history_retention_hours * 3600.0),
        }
    }

    pub fn premium_config(&self) -> PremiumProxyConfig {
        let section = &self.proxy_infrastructure.premium_proxies;
        PremiumProxyConfig {
            enabled: section.enabled,
            api_key_env: section.api_key_env.clone(),
            api_url: section.api_url.clone(),
            proxy_type: section.proxy_type.clone(),
            country: section.country.clone(),
            refresh_interval: Duration::from_secs_f64(section.refresh_interval_seconds),
            min_proxy_count: section.min_proxy_count,
            max_monthly_cost: section.max_monthly_cost,
            auto_purchase_enabled: section.auto_purchase.enabled,
            max_purchase_batch_size: section.auto_purchase.max_batch_size,
            purchase_cooldown: Duration::from_secs_f64(
                section.auto_purchase.cooldown_minutes * 60.0,
            ),
            cost_per_proxy: section.auto_purchase.cost_per_proxy,
            purchase_period_days: section.auto_purchase.period_days,
        }
    }

    pub fn rotator_config(&self) -> RotatorConfig {
        let section = &self.proxy_infrastructure;
        RotatorConfig {
            auto_replace_burned: section.auto_replace_burned,
            min_healthy_proxies: section.min_healthy_proxies,
            health_check_interval: Duration::from_secs_f64(section.health_check_interval_seconds),
            intelligent_selection: section.intelligent_selection,
            autoscale: AutoscaleConfig {
                enabled: section.autoscale.enabled,
                safety_factor: section.autoscale.safety_factor,
                target_success_rate: section.autoscale.target_success_rate,
                min_proxy_count: section.autoscale.min_proxy_count,
                max_proxy_count: section.autoscale.max_proxy_count,
                warning_threshold: section.autoscale.warning_threshold,
                critical_threshold: section.autoscale.critical_threshold,
                cooldown: Duration::from_secs_f64(section.autoscale.cooldown_seconds),
                default_concurrency: section.autoscale.default_concurrency,
            },
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        let section = &self.proxy_infrastructure.session_management;
        SessionConfig {
            session_dir: section.session_dir.clone().into(),
            ttl: Duration::from_secs_f64(section.session_ttl_seconds),
            encryption_enabled: section.encryption_enabled,
            auto_refresh: section.auto_refresh,
            refresh_threshold: Duration::from_secs_f64(section.refresh_threshold_seconds),
            secret_env: section.secret_env.clone(),
        }
    }

    pub fn captcha_config(&self) -> CaptchaSolverConfig {
        let section = &self.captcha_solving;
        CaptchaSolverConfig {
            enabled: section.enabled,
            api_key_env: section.api_key_env.clone(),
            api_url: section.api_url.clone(),
            submit_timeout: Duration::from_secs_f64(section.timeout_seconds),
            polling_interval: Duration::from_secs_f64(section.polling_interval_seconds),
            max_solve_time: Duration::from_secs_f64(
                section.performance_settings.max_solve_time_seconds,
            ),
            prefer_fast_workers: section.performance_settings.prefer_fast_workers,
            daily_limit_usd: section.cost_tracking.daily_limit_usd,
            min_balance_usd: section.cost_tracking.min_balance_usd,
            alert_on_low_balance: section.cost_tracking.alert_on_low_balance,
            proxy_format: section.proxy_format.clone(),
        }
    }

    pub fn user_agent_config(&self) -> UserAgentConfig {
        let section = &self.user_agent_rotation;
        UserAgentConfig {
            enabled: section.enabled,
            strategy: RotationStrategy::parse(&section.strategy),
            pool_size: section.pool_size,
            refresh_interval: Duration::from_secs_f64(section.refresh_interval_hours * 3600.0),
            min_browser_version: section.filtering.min_browser_version,
            exclude_mobile: section.filtering.exclude_mobile,
            exclude_bots: section.filtering.exclude_bots,
            prefer_chrome: section.filtering.prefer_chrome,
            track_success_rates: section.performance_tracking.track_success_rates,
            domain_preferences: section.performance_tracking.domain_preferences,
        }
    }

    pub fn robots_config(&self) -> RobotsConfig {
        let section = &self.robots_compliance;
        RobotsConfig {
            enabled: section.enabled,
            respect_crawl_delay: section.respect_crawl_delay,
            respect_disallow: section.respect_disallow,
            default_user_agent: section.default_user_agent.clone(),
            cache_ttl: Duration::from_secs_f64(section.cache_ttl_hours * 3600.0),
            fetch_timeout: Duration::from_secs_f64(section.timeout_seconds),
            min_delay: Duration::from_secs_f64(section.crawl_delay_settings.min_delay_seconds),
            max_delay: Duration::from_secs_f64(section.crawl_delay_settings.max_delay_seconds),
            default_delay: Duration::from_secs_f64(
                section.crawl_delay_settings.default_delay_seconds,
            ),
            testing_mode: section.compliance_overrides.testing_mode,
            ignore_domains: section.compliance_overrides.ignore_for_domains.clone(),
            force_allow_patterns: section.compliance_overrides.force_allow_patterns.clone(),
        }
    }

    pub fn challenge_config(&self) -> ChallengeSolverConfig {
        let section = &self.flaresolverr;
        ChallengeSolverConfig {
            enabled: section.enabled,
            endpoint: section.endpoint.trim_end_matches('/').to_string(),
            max_timeout: Duration::from_millis(section.max_timeout_ms),
            max_retries: section.retry_policy.max_retries,
            retry_delay: Duration::from_secs_f64(section.retry_policy.retry_delay_seconds),
            backoff_multiplier: section.retry_policy.backoff_multiplier,
            session_enabled: section.session_management.enabled,
            session_ttl: Duration::from_secs_f64(section.session_management.ttl_seconds),
            service_max_session_ttl: section
                .session_management
                .service_max_ttl_seconds
                .map(Duration::from_secs_f64),
            health_interval: Duration::from_secs_f64(
                section.integration_settings.health_interval_seconds,
            ),
            default_headers: section.request_defaults.headers.clone(),
            default_user_agent: section.request_defaults.user_agent.clone(),
        }
    }

    pub fn breaker_config(&self) -> DomainBreakerConfig {
        let section = &self.antibot_integration.domain_breaker;
        DomainBreakerConfig {
            failure_threshold: section.failure_threshold,
            error_rate_threshold: section.error_rate_threshold,
            circuit_timeout: Duration::from_secs_f64(section.circuit_timeout_seconds),
            max_half_open_attempts: section.max_half_open_attempts,
        }
    }
}

// proxy_infrastructure

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyInfrastructureSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub proxies: Vec<String>,
    #[serde(default = "default_true")]
    pub auto_replace_burned: bool,
    #[serde(default = "default_min_healthy")]
    pub min_healthy_proxies: usize,
    #[serde(default = "default_health_interval")]
    pub health_check_interval_seconds: f64,
    #[serde(default = "default_true")]
    pub intelligent_selection: bool,
    #[serde(default)]
    pub proxy_health: ProxyHealthSection,
    #[serde(default)]
    pub premium_proxies: PremiumProxiesSection,
    #[serde(default)]
    pub backoff: BackoffSection,
    #[serde(default)]
    pub content_validation: ContentValidationSection,
    #[serde(default)]
    pub session_management: SessionManagementSection,
    #[serde(default)]
    pub autoscale: AutoscaleSection,
}

impl Default for ProxyInfrastructureSection {
    fn default() -> Self {
        toml::from_str("").expect("empty proxy_infrastructure section must deserialize")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyHealthSection {
    #[serde(default = "default_test_urls")]
    pub test_urls: Vec<String>,
    #[serde(default = "default_health_threshold")]
    pub health_threshold: f64,
    #[serde(default = "default_max_failures")]
    pub max_failures_before_replacement: u32,
    #[serde(default = "default_probe_timeout")]
    pub timeout_seconds: f64,
    #[serde(default = "default_concurrent_checks")]
    pub concurrent_checks: usize,
    #[serde(default = "default_retention_hours")]
    pub history_retention_hours: f64,
}

impl Default for ProxyHealthSection {
    fn default() -> Self {
        toml::from_str("").expect("empty proxy_health section must deserialize")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PremiumProxiesSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_provider_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_provider_url")]
    pub api_url: String,
    #[serde(default = "default_proxy_type")]
    pub proxy_type: String,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_refresh_seconds")]
    pub refresh_interval_seconds: f64,
    #[serde(default = "default_min_proxy_count")]
    pub min_proxy_count: usize,
    #[serde(default = "default_max_monthly_cost")]
    pub max_monthly_cost: f64,
    #[serde(default)]
    pub auto_purchase: AutoPurchaseSection,
}

impl Default for PremiumProxiesSection {
    fn default() -> Self {
        toml::from_str("").expect("empty premium_proxies section must deserialize")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AutoPurchaseSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_batch_size")]
    pub max_batch_size: u32,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: f64,
    #[serde(default = "default_cost_per_proxy")]
    pub cost_per_proxy: f64,
    #[serde(default = "default_period_days")]
    pub period_days: u32,
}

impl Default for AutoPurchaseSection {
    fn default() -> Self {
        toml::from_str("").expect("empty auto_purchase section must deserialize")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackoffSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_base_delay")]
    pub base_delay_seconds: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: f64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_true")]
    pub circuit_breaker_enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_timeout")]
    pub circuit_timeout_seconds: f64,
    #[serde(default = "default_recovery_attempts")]
    pub circuit_recovery_attempts: u32,
}

impl Default for BackoffSection {
    fn default() -> Self {
        toml::from_str("").expect("empty backoff section must deserialize")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContentValidationSection {
    #[serde(default = "default_min_content_length")]
    pub min_content_length: usize,
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f32,
    #[serde(default = "default_required_elements")]
    pub required_elements: Vec<String>,
    #[serde(default = "default_true")]
    pub silent_block_detection: bool,
    #[serde(default = "default_min_content_ratio")]
    pub min_content_ratio: f32,
}

impl Default for ContentValidationSection {
    fn default() -> Self {
        toml::from_str("").expect("empty content_validation section must deserialize")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionManagementSection {
    #[serde(default = "default_session_dir")]
    pub session_dir: String,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: f64,
    #[serde(default = "default_true")]
    pub encryption_enabled: bool,
    #[serde(default = "default_true")]
    pub auto_refresh: bool,
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_seconds: f64,
    #[serde(default = "default_session_secret_env")]
    pub secret_env: String,
}

impl Default for SessionManagementSection {
    fn default() -> Self {
        toml::from_str("").expect("empty session_management section must deserialize")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AutoscaleSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_safety_factor")]
    pub safety_factor: f64,
    #[serde(default = "default_target_success_rate")]
    pub target_success_rate: f64,
    #[serde(default = "default_autoscale_min")]
    pub min_proxy_count: usize,
    #[serde(default = "default_autoscale_max")]
    pub max_proxy_count: usize,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,
    #[serde(default = "default_autoscale_cooldown")]
    pub cooldown_seconds: f64,
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,
}

impl Default for AutoscaleSection {
    fn default() -> Self {
        toml::from_str("").expect("empty autoscale section must deserialize")
    }
}

// captcha_solving

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptchaSolvingSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_captcha_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_captcha_url")]
    pub api_url: String,
    #[serde(default = "default_captcha_timeout")]
    pub timeout_seconds: f64,
    #[serde(default = "default_polling_interval")]
    pub polling_interval_seconds: f64,
    #[serde(default = "default_proxy_type")]
    pub proxy_format: String,
    #[serde(default)]
    pub performance_settings: CaptchaPerformanceSection,
    #[serde(default)]
    pub cost_tracking: CaptchaCostSection,
}

impl Default for CaptchaSolvingSection {
    fn default() -> Self {
        toml::from_str("").expect("empty captcha_solving section must deserialize")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptchaPerformanceSection {
    #[serde(default = "default_true")]
    pub prefer_fast_workers: bool,
    #[serde(default = "default_max_solve_time")]
    pub max_solve_time_seconds: f64,
}

impl Default for CaptchaPerformanceSection {
    fn default() -> Self {
        toml::from_str("").expect("empty performance_settings section must deserialize")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptchaCostSection {
    #[serde(default = "default_daily_limit")]
    pub daily_limit_usd: f64,
    #[serde(default = "default_min_balance")]
    pub min_balance_usd: f64,
    #[serde(default = "default_true")]
    pub alert_on_low_balance: bool,
}

impl Default for CaptchaCostSection {
    fn default() -> Self {
        toml::from_str("").expect("empty cost_tracking section must deserialize")
    }
}

// user_agent_rotation

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserAgentRotationSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_ua_refresh_hours")]
    pub refresh_interval_hours: f64,
    #[serde(default)]
    pub filtering: UaFilteringSection,
    #[serde(default)]
    pub performance_tracking: UaPerformanceSection,
}

impl Default for UserAgentRotationSection {
    fn default() -> Self {
        toml::from_str("").expect("empty user_agent_rotation section must deserialize")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UaFilteringSection {
    #[serde(default = "default_min_browser_version")]
    pub min_browser_version: u32,
    #[serde(default)]
    pub exclude_mobile: bool,
    #[serde(default = "default_true")]
    pub exclude_bots: bool,
    #[serde(default = "default_true")]
    pub prefer_chrome: bool,
}

impl Default for UaFilteringSection {
    fn default() -> Self {
        toml::from_str("").expect("empty filtering section must deserialize")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UaPerformanceSection {
    #[serde(default = "default_true")]
    pub track_success_rates: bool,
    #[serde(default = "default_true")]
    pub domain_preferences: bool,
}

impl Default for UaPerformanceSection {
    fn default() -> Self {
        toml::from_str("").expect("empty performance_tracking section must deserialize")
    }
}

// robots_compliance

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RobotsComplianceSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub respect_crawl_delay: bool,
    #[serde(default = "default_true")]
    pub respect_disallow: bool,
    #[serde(default = "default_wildcard")]
    pub default_user_agent: String,
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: f64,
    #[serde(default = "default_probe_timeout")]
    pub timeout_seconds: f64,
    #[serde(default)]
    pub crawl_delay_settings: CrawlDelaySection,
    #[serde(default)]
    pub compliance_overrides: ComplianceOverridesSection,
}

impl Default for RobotsComplianceSection {
    fn default() -> Self {
        toml::from_str("").expect("empty robots_compliance section must deserialize")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CrawlDelaySection {
    #[serde(default = "default_min_crawl_delay")]
    pub min_delay_seconds: f64,
    #[serde(default = "default_max_crawl_delay")]
    pub max_delay_seconds: f64,
    #[serde(default = "default_min_crawl_delay")]
    pub default_delay_seconds: f64,
}

impl Default for CrawlDelaySection {
    fn default() -> Self {
        toml::from_str("").expect("empty crawl_delay_settings section must deserialize")
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ComplianceOverridesSection {
    #[serde(default)]
    pub testing_mode: bool,
    #[serde(default)]
    pub ignore_for_domains: Vec<String>,
    #[serde(default)]
    pub force_allow_patterns: Vec<String>,
}

// flaresolverr

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlareSolverrSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_solver_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_solver_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default)]
    pub retry_policy: SolverRetrySection,
    #[serde(default)]
    pub session_management: SolverSessionSection,
    #[serde(default)]
    pub integration_settings: SolverIntegrationSection,
    #[serde(default)]
    pub request_defaults: SolverRequestDefaultsSection,
}

impl Default for FlareSolverrSection {
    fn default() -> Self {
        toml::from_str("").expect("empty flaresolverr section must deserialize")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SolverRetrySection {
    #[serde(default = "default_solver_retries")]
    pub max_retries: u32,
    #[serde(default = "default_solver_retry_delay")]
    pub retry_delay_seconds: f64,
    #[serde(default = "default_solver_backoff")]
    pub backoff_multiplier: f64,
}

impl Default for SolverRetrySection {
    fn default() -> Self {
        toml::from_str("").expect("empty retry_policy section must deserialize")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SolverSessionSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_solver_session_ttl")]
    pub ttl_seconds: f64,
    #[serde(default)]
    pub service_max_ttl_seconds: Option<f64>,
}

impl Default for SolverSessionSection {
    fn default() -> Self {
        toml::from_str("").expect("empty session_management section must deserialize")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SolverIntegrationSection {
    #[serde(default = "default_solver_health_interval")]
    pub health_interval_seconds: f64,
}

impl Default for SolverIntegrationSection {
    fn default() -> Self {
        toml::from_str("").expect("empty integration_settings section must deserialize")
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SolverRequestDefaultsSection {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

// guard_detection / antibot_integration

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuardDetectionSection {
    #[serde(default = "default_bypass_attempts")]
    pub max_bypass_attempts: u32,
    #[serde(default = "default_guard_cooldown")]
    pub cooldown_seconds: f64,
    #[serde(default)]
    pub guard_keywords: Vec<String>,
    #[serde(default)]
    pub domain_overrides: HashMap<String, GuardDomainOverride>,
}

impl Default for GuardDetectionSection {
    fn default() -> Self {
        toml::from_str("").expect("empty guard_detection section must deserialize")
    }
}

/// Per-domain guard detection overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GuardDomainOverride {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub status_codes: Vec<u16>,
    #[serde(default)]
    pub max_bypass_attempts: Option<u32>,
    #[serde(default)]
    pub cooldown_seconds: Option<f64>,
    /// Suppresses the default 403/429 escalation for this domain.
    #[serde(default)]
    pub suppress_status_escalation: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AntibotIntegrationSection {
    #[serde(default)]
    pub domain_breaker: DomainBreakerSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DomainBreakerSection {
    #[serde(default = "default_domain_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_error_rate")]
    pub error_rate_threshold: f64,
    #[serde(default = "default_domain_circuit_timeout")]
    pub circuit_timeout_seconds: f64,
    #[serde(default = "default_recovery_attempts")]
    pub max_half_open_attempts: u32,
}

impl Default for DomainBreakerSection {
    fn default() -> Self {
        toml::from_str("").expect("empty domain_breaker section must deserialize")
    }
}

// defaults

fn default_true() -> bool {
    true
}
fn default_min_healthy() -> usize {
    3
}
fn default_health_interval() -> f64 {
    300.0
}
fn default_test_urls() -> Vec<String> {
    vec![
        "https://httpbin.org/ip".to_string(),
        "https://icanhazip.com".to_string(),
        "https://api.ipify.org".to_string(),
    ]
}
fn default_health_threshold() -> f64 {
    0.8
}
fn default_max_failures() -> u32 {
    3
}
fn default_probe_timeout() -> f64 {
    10.0
}
fn default_concurrent_checks() -> usize {
    5
}
fn default_retention_hours() -> f64 {
    24.0
}
fn default_provider_key_env() -> String {
    "PROXY_PROVIDER_API_KEY".to_string()
}
fn default_provider_url() -> String {
    "https://proxy6.net/api".to_string()
}
fn default_proxy_type() -> String {
    "http".to_string()
}
fn default_country() -> String {
    "RU".to_string()
}
fn default_refresh_seconds() -> f64 {
    3600.0
}
fn default_min_proxy_count() -> usize {
    10
}
fn default_max_monthly_cost() -> f64 {
    100.0
}
fn default_batch_size() -> u32 {
    10
}
fn default_cooldown_minutes() -> f64 {
    30.0
}
fn default_cost_per_proxy() -> f64 {
    2.0
}
fn default_period_days() -> u32 {
    30
}
fn default_base_delay() -> f64 {
    1.0
}
fn default_max_delay() -> f64 {
    300.0
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_attempts() -> u32 {
    5
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_circuit_timeout() -> f64 {
    60.0
}
fn default_recovery_attempts() -> u32 {
    1
}
fn default_min_content_length() -> usize {
    1000
}
fn default_quality_threshold() -> f32 {
    0.7
}
fn default_required_elements() -> Vec<String> {
    vec!["title".to_string(), "h1".to_string()]
}
fn default_min_content_ratio() -> f32 {
    0.3
}
fn default_session_dir() -> String {
    "data/sessions".to_string()
}
fn default_session_ttl() -> f64 {
    3600.0
}
fn default_refresh_threshold() -> f64 {
    300.0
}
fn default_session_secret_env() -> String {
    "SESSION_SECRET".to_string()
}
fn default_safety_factor() -> f64 {
    1.5
}
fn default_target_success_rate() -> f64 {
    0.85
}
fn default_autoscale_min() -> usize {
    5
}
fn default_autoscale_max() -> usize {
    100
}
fn default_warning_threshold() -> f64 {
    0.8
}
fn default_critical_threshold() -> f64 {
    0.5
}
fn default_autoscale_cooldown() -> f64 {
    1800.0
}
fn default_concurrency() -> usize {
    32
}
fn default_captcha_key_env() -> String {
    "CAPTCHA_API_KEY".to_string()
}
fn default_captcha_url() -> String {
    "http://2captcha.com".to_string()
}
fn default_captcha_timeout() -> f64 {
    30.0
}
fn default_polling_interval() -> f64 {
    5.0
}
fn default_max_solve_time() -> f64 {
    60.0
}
fn default_daily_limit() -> f64 {
    10.0
}
fn default_min_balance() -> f64 {
    5.0
}
fn default_strategy() -> String {
    "intelligent".to_string()
}
fn default_pool_size() -> usize {
    100
}
fn default_ua_refresh_hours() -> f64 {
    24.0
}
fn default_min_browser_version() -> u32 {
    90
}
fn default_wildcard() -> String {
    "*".to_string()
}
fn default_cache_ttl_hours() -> f64 {
    24.0
}
fn default_min_crawl_delay() -> f64 {
    1.0
}
fn default_max_crawl_delay() -> f64 {
    60.0
}
fn default_solver_endpoint() -> String {
    "http://localhost:8192".to_string()
}
fn default_solver_timeout_ms() -> u64 {
    180_000
}
fn default_solver_retries() -> u32 {
    2
}
fn default_solver_retry_delay() -> f64 {
    2.0
}
fn default_solver_backoff() -> f64 {
    1.5
}
fn default_solver_session_ttl() -> f64 {
    900.0
}
fn default_solver_health_interval() -> f64 {
    120.0
}
fn default_bypass_attempts() -> u32 {
    3
}
fn default_guard_cooldown() -> f64 {
    300.0
}
fn default_domain_failure_threshold() -> u32 {
    20
}
fn default_error_rate() -> f64 {
    0.8
}
fn default_domain_circuit_timeout() -> f64 {
    300.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gets_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.proxy_infrastructure.enabled);
        assert_eq!(config.proxy_infrastructure.min_healthy_proxies, 3);
        assert_eq!(config.user_agent_rotation.strategy, "intelligent");
        assert_eq!(config.robots_compliance.cache_ttl_hours, 24.0);
        assert!(!config.flaresolverr.enabled);
        assert_eq!(config.guard_detection.max_bypass_attempts, 3);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
[user_agent_rotation]
strategy = "sequential"
pool_size = 10

[robots_compliance.crawl_delay_settings]
min_delay_seconds = 2.5
"#,
        )
        .unwrap();

        assert_eq!(config.user_agent_rotation.strategy, "sequential");
        assert_eq!(config.user_agent_rotation.pool_size, 10);
        assert!(config.user_agent_rotation.enabled);
        assert_eq!(
            config.robots_compliance.crawl_delay_settings.min_delay_seconds,
            2.5
        );
        assert_eq!(
            config.robots_compliance.crawl_delay_settings.max_delay_seconds,
            60.0
        );
    }

    #[test]
    fn conversion_to_module_configs() {
        let config = Config::default();

        let backoff = config.backoff_config();
        assert_eq!(backoff.failure_threshold, 5);
        assert_eq!(backoff.circuit_timeout, Duration::from_secs(60));

        let robots = config.robots_config();
        assert_eq!(robots.cache_ttl, Duration::from_secs(24 * 3600));
        assert_eq!(robots.default_user_agent, "*");

        let breaker = config.breaker_config();
        assert_eq!(breaker.failure_threshold, 20);
        assert_eq!(breaker.circuit_timeout, Duration::from_secs(300));

        let challenge = config.challenge_config();
        assert_eq!(challenge.max_timeout, Duration::from_millis(180_000));
    }

    #[test]
    fn domain_overrides_parse() {
        let config: Config = toml::from_str(
            r#"
[guard_detection]
max_bypass_attempts = 5

[guard_detection.domain_overrides."shop.example"]
keywords = ["ddos-guard"]
status_codes = [403]
cooldown_seconds = 60.0
"#,
        )
        .unwrap();

        let overrides = config
            .guard_detection
            .domain_overrides
            .get("shop.example")
            .unwrap();
        assert_eq!(overrides.keywords, vec!["ddos-guard".to_string()]);
        assert_eq!(overrides.status_codes, vec![403]);
        assert_eq!(overrides.cooldown_seconds, Some(60.0));
    }

    #[test]
    fn validate_flags_missing_captcha_key() {
        let config: Config = toml::from_str(
            r#"
[captcha_solving]
enabled = true
api_key_env = "STEALTHFETCH_SURELY_UNSET_KEY"
"#,
        )
        .unwrap();
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("captcha_solving")));
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = Config::load("/definitely/not/here.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }
}
