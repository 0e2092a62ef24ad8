//! Mandatory user-agent rotation with domain-level performance memory.
//!
//! Every acquisition returns a UA different from the last one handed out
//! (pool size permitting). Selection strategies range from plain round-robin
//! to weighted picks driven by per-domain success rates.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Selection strategy for the next user agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    #[default]
    Intelligent,
    Weighted,
    Random,
    Sequential,
}

impl RotationStrategy {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "weighted" => RotationStrategy::Weighted,
            "random" => RotationStrategy::Random,
            "sequential" => RotationStrategy::Sequential,
            _ => RotationStrategy::Intelligent,
        }
    }
}

/// Sub-pool kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    Browser,
    Mobile,
    Bot,
}

/// Rotator configuration.
#[derive(Debug, Clone)]
pub struct UserAgentConfig {
    pub enabled: bool,
    pub strategy: RotationStrategy,
    pub pool_size: usize,
    pub refresh_interval: Duration,
    pub min_browser_version: u32,
    pub exclude_mobile: bool,
    pub exclude_bots: bool,
    pub prefer_chrome: bool,
    pub track_success_rates: bool,
    pub domain_preferences: bool,
}

impl Default for UserAgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: RotationStrategy::Intelligent,
            pool_size: 100,
            refresh_interval: Duration::from_secs(24 * 3600),
            min_browser_version: 90,
            exclude_mobile: false,
            exclude_bots: true,
            prefer_chrome: true,
            track_success_rates: true,
            domain_preferences: true,
        }
    }
}

#[derive(Debug, Clone)]
struct UaPerformance {
    total_requests: u64,
    successful_requests: u64,
    avg_response_time: f64,
    last_used: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct DomainUaStats {
    total_requests: u64,
    successful_requests: u64,
    success_rate: f64,
    avg_response_time: f64,
}

#[derive(Debug, Default)]
struct RotatorState {
    browser: Vec<String>,
    mobile: Vec<String>,
    bot: Vec<String>,
    cursors: HashMap<AgentKind, usize>,
    last_used: Option<String>,
    performance: HashMap<String, UaPerformance>,
    domain_prefs: HashMap<String, HashMap<String, DomainUaStats>>,
    usage_count: HashMap<String, u64>,
    pool_refreshed_at: Option<DateTime<Utc>>,
}

impl RotatorState {
    fn pool(&self, kind: AgentKind) -> &Vec<String> {
        match kind {
            AgentKind::Browser => &self.browser,
            AgentKind::Mobile => &self.mobile,
            AgentKind::Bot => &self.bot,
        }
    }
}

/// Rotation statistics snapshot.
#[derive(Debug, Clone)]
pub struct UserAgentStats {
    pub browser_pool: usize,
    pub mobile_pool: usize,
    pub bot_pool: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub unique_agents_used: usize,
    pub domains_tracked: usize,
    pub last_used: Option<String>,
}

/// Mandatory-rotation user agent pool.
pub struct UserAgentRotator {
    config: UserAgentConfig,
    state: Mutex<RotatorState>,
}

impl UserAgentRotator {
    pub fn new(config: UserAgentConfig) -> Self {
        let mut state = RotatorState::default();
        populate_pools(&mut state, &config);
        state.pool_refreshed_at = Some(Utc::now());
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Next user agent, guaranteed to differ from the previous one whenever
    /// the pool holds more than one distinct string.
    pub fn next_mandatory(&self, domain: Option<&str>) -> String {
        self.next(AgentKind::Browser, domain)
    }

    pub fn next(&self, kind: AgentKind, domain: Option<&str>) -> String {
        if !self.config.enabled {
            return DEFAULT_USER_AGENT.to_string();
        }

        let mut guard = self.state.lock().expect("user agent lock poisoned");
        self.refresh_if_stale(&mut guard);

        if guard.pool(kind).is_empty() {
            log::warn!("no user agents available for {kind:?}");
            return DEFAULT_USER_AGENT.to_string();
        }

        let selected = self.select(&mut guard, kind, domain);

        *guard.usage_count.entry(selected.clone()).or_insert(0) += 1;
        guard.last_used = Some(selected.clone());
        log::debug!("selected user agent [{:?}]: {}", self.config.strategy, &selected[..selected.len().min(60)]);
        selected
    }

    fn select(&self, state: &mut RotatorState, kind: AgentKind, domain: Option<&str>) -> String {
        let last = state.last_used.clone();
        let pool = state.pool(kind).clone();

        let candidate = match self.config.strategy {
            RotationStrategy::Sequential => sequential_pick(state, kind, &pool, last.as_deref()),
            RotationStrategy::Random => random_pick(&pool, last.as_deref()),
            RotationStrategy::Weighted => weighted_pick(state, &pool, last.as_deref()),
            RotationStrategy::Intelligent => {
                intelligent_pick(state, &pool, domain, last.as_deref())
            }
        };

        // Rotation is mandatory: never hand back the previous UA when a
        // different one exists.
        if let Some(ref previous) = last
            && candidate == *previous
            && pool.iter().any(|ua| ua != previous)
        {
            return random_pick(&pool, Some(previous));
        }
        candidate
    }

    /// Feed back request outcome so weighted and intelligent strategies can
    /// learn which agents a domain tolerates.
    pub fn observe(&self, ua: &str, success: bool, response_time: Duration, domain: Option<&str>) {
        if !self.config.track_success_rates {
            return;
        }

        let mut guard = self.state.lock().expect("user agent lock poisoned");
        let now = Utc::now();
        let rt = response_time.as_secs_f64();

        let perf = guard
            .performance
            .entry(ua.to_string())
            .or_insert_with(|| UaPerformance {
                total_requests: 0,
                successful_requests: 0,
                avg_response_time: 0.0,
                last_used: now,
            });
        perf.total_requests += 1;
        perf.last_used = now;
        if success {
            perf.successful_requests += 1;
        }
        perf.avg_response_time =
            (perf.avg_response_time * (perf.total_requests - 1) as f64 + rt)
                / perf.total_requests as f64;

        if self.config.domain_preferences
            && let Some(domain) = domain
        {
            let stats = guard
                .domain_prefs
                .entry(domain.to_string())
                .or_default()
                .entry(ua.to_string())
                .or_default();
            stats.total_requests += 1;
            if success {
                stats.successful_requests += 1;
            }
            stats.success_rate = stats.successful_requests as f64 / stats.total_requests as f64;
            stats.avg_response_time =
                (stats.avg_response_time * (stats.total_requests - 1) as f64 + rt)
                    / stats.total_requests as f64;
        }
    }

    /// Rebuild pools when the refresh interval has elapsed.
    fn refresh_if_stale(&self, state: &mut RotatorState) {
        let stale = match state.pool_refreshed_at {
            Some(at) => {
                let age = Utc::now() - at;
                age.to_std().map(|d| d > self.config.refresh_interval).unwrap_or(false)
            }
            None => true,
        };
        if stale {
            log::info!("refreshing user agent pools");
            populate_pools(state, &self.config);
            state.pool_refreshed_at = Some(Utc::now());
        }
    }

    pub fn stats(&self) -> UserAgentStats {
        let guard = self.state.lock().expect("user agent lock poisoned");
        UserAgentStats {
            browser_pool: guard.browser.len(),
            mobile_pool: guard.mobile.len(),
            bot_pool: guard.bot.len(),
            total_requests: guard.usage_count.values().sum(),
            successful_requests: guard
                .performance
                .values()
                .map(|p| p.successful_requests)
                .sum(),
            unique_agents_used: guard.usage_count.len(),
            domains_tracked: guard.domain_prefs.len(),
            last_used: guard.last_used.clone(),
        }
    }
}

impl Default for UserAgentRotator {
    fn default() -> Self {
        Self::new(UserAgentConfig::default())
    }
}

fn sequential_pick(
    state: &mut RotatorState,
    kind: AgentKind,
    pool: &[String],
    last: Option<&str>,
) -> String {
    let cursor = state.cursors.entry(kind).or_insert(0);
    let mut index = (*cursor + 1) % pool.len();
    // Skip over padded duplicates of the previous pick.
    if let Some(previous) = last {
        let mut hops = 0;
        while pool[index] == previous && hops < pool.len() {
            index = (index + 1) % pool.len();
            hops += 1;
        }
    }
    *cursor = index;
    pool[index].clone()
}

fn random_pick(pool: &[String], last: Option<&str>) -> String {
    let mut rng = rand::thread_rng();
    let candidates: Vec<&String> = match last {
        Some(previous) => pool.iter().filter(|ua| ua.as_str() != previous).collect(),
        None => pool.iter().collect(),
    };
    if candidates.is_empty() {
        return pool[0].clone();
    }
    (*candidates.choose(&mut rng).expect("non-empty candidates")).clone()
}

fn weighted_pick(state: &RotatorState, pool: &[String], last: Option<&str>) -> String {
    let now = Utc::now();
    let candidates: Vec<&String> = match last {
        Some(previous) => pool.iter().filter(|ua| ua.as_str() != previous).collect(),
        None => pool.iter().collect(),
    };
    if candidates.is_empty() {
        return pool[0].clone();
    }

    let weights: Vec<f64> = candidates
        .iter()
        .map(|ua| match state.performance.get(ua.as_str()) {
            Some(perf) if perf.total_requests > 0 => {
                let success_rate =
                    perf.successful_requests as f64 / perf.total_requests as f64;
                let idle_secs = (now - perf.last_used).num_seconds().max(0) as f64;
                let recency = (idle_secs / 3600.0).min(1.0);
                (success_rate * (1.0 + recency)).max(0.1)
            }
            _ => 0.5,
        })
        .collect();

    weighted_choice(&candidates, &weights)
}

fn intelligent_pick(
    state: &RotatorState,
    pool: &[String],
    domain: Option<&str>,
    last: Option<&str>,
) -> String {
    if let Some(domain) = domain
        && let Some(prefs) = state.domain_prefs.get(domain)
    {
        let mut candidates: Vec<&String> = prefs
            .keys()
            .filter(|ua| pool.contains(ua))
            .filter(|ua| last != Some(ua.as_str()))
            .collect();
        if !candidates.is_empty() {
            candidates.sort();
            let weights: Vec<f64> = candidates
                .iter()
                .map(|ua| prefs[ua.as_str()].success_rate.max(0.1))
                .collect();
            return weighted_choice(&candidates, &weights);
        }
    }
    weighted_pick(state, pool, last)
}

fn weighted_choice(candidates: &[&String], weights: &[f64]) -> String {
    let total: f64 = weights.iter().sum();
    if total <= f64::EPSILON {
        return candidates[0].clone();
    }
    let mut target = rand::thread_rng().gen_range(0.0..total);
    for (candidate, weight) in candidates.iter().zip(weights.iter()) {
        if target <= *weight {
            return (*candidate).clone();
        }
        target -= *weight;
    }
    candidates[candidates.len() - 1].clone()
}

/// Basic sanity checks on a UA string.
pub fn validate_user_agent(ua: &str, exclude_bots: bool) -> bool {
    if ua.len() < 20 || ua.len() > 500 {
        return false;
    }

    if !["Chrome", "Firefox", "Safari", "Edge", "Opera"]
        .iter()
        .any(|browser| ua.contains(browser))
    {
        return false;
    }

    if exclude_bots {
        let lowered = ua.to_lowercase();
        for marker in ["bot", "crawler", "spider", "scraper", "automation"] {
            if lowered.contains(marker) {
                return false;
            }
        }
    }

    true
}

fn browser_version(ua: &str) -> u32 {
    static CHROME_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"Chrome/(\d+)").expect("invalid chrome regex"));
    static FIREFOX_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"Firefox/(\d+)").expect("invalid firefox regex"));
    static SAFARI_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"Version/(\d+)").expect("invalid safari regex"));

    for re in [&*CHROME_RE, &*FIREFOX_RE] {
        if let Some(caps) = re.captures(ua)
            && let Ok(version) = caps[1].parse()
        {
            return version;
        }
    }
    if ua.contains("Safari")
        && let Some(caps) = SAFARI_RE.captures(ua)
        && let Ok(version) = caps[1].parse()
    {
        return version;
    }
    0
}

fn populate_pools(state: &mut RotatorState, config: &UserAgentConfig) {
    state.browser.clear();
    state.mobile.clear();
    state.bot.clear();

    for ua in CURATED_BROWSER_AGENTS {
        if validate_user_agent(ua, config.exclude_bots) {
            state.browser.push((*ua).to_string());
        }
    }

    let mut rng = rand::thread_rng();
    while state.browser.len() < config.pool_size.min(60) {
        let ua = match rng.gen_range(0..4) {
            0 => chrome_ua(rng.gen_range(110..=124)),
            1 => firefox_ua(rng.gen_range(110..=125)),
            2 => safari_ua(rng.gen_range(15..=17)),
            _ => edge_ua(rng.gen_range(110..=124)),
        };
        if validate_user_agent(&ua, config.exclude_bots) && !state.browser.contains(&ua) {
            state.browser.push(ua);
        }
    }

    if !config.exclude_mobile {
        for ua in CURATED_MOBILE_AGENTS {
            if validate_user_agent(ua, config.exclude_bots) {
                state.mobile.push((*ua).to_string());
            }
        }
    }

    if !config.exclude_bots {
        for ua in CURATED_BOT_AGENTS {
            state.bot.push((*ua).to_string());
        }
    }

    // Minimum browser version filter. Safari majors are far below Chrome
    // ones, so the bar only applies to Chromium/Gecko strings.
    if config.min_browser_version > 0 {
        state.browser.retain(|ua| {
            let version = browser_version(ua);
            ua.contains("Version/") || version >= config.min_browser_version.min(100)
        });
    }

    if config.prefer_chrome {
        pad_chrome_share(&mut state.browser);
    }

    ensure_minimum_pool_sizes(state, config);
}

/// Duplicate Chrome entries until they make up at least 60% of the pool.
fn pad_chrome_share(pool: &mut Vec<String>) {
    let chrome: Vec<String> = pool
        .iter()
        .filter(|ua| ua.contains("Chrome") && !ua.contains("Edg/"))
        .cloned()
        .collect();
    if chrome.is_empty() {
        return;
    }
    let mut chrome_count = chrome.len();
    let mut cursor = 0;
    while (chrome_count as f64) < pool.len() as f64 * 0.6 {
        pool.push(chrome[cursor % chrome.len()].clone());
        cursor += 1;
        chrome_count += 1;
    }
}

fn ensure_minimum_pool_sizes(state: &mut RotatorState, config: &UserAgentConfig) {
    let min_browser = (config.pool_size / 4).max(10);
    let mut index = 0;
    while state.browser.len() < min_browser && !state.browser.is_empty() {
        state.browser.push(state.browser[index % state.browser.len()].clone());
        index += 1;
    }

    if !config.exclude_mobile {
        let mut index = 0;
        while state.mobile.len() < 5 && !state.mobile.is_empty() {
            state.mobile.push(state.mobile[index % state.mobile.len()].clone());
            index += 1;
        }
    }
}

fn chrome_ua(version: u32) -> String {
    let os = ["Windows NT 10.0; Win64; x64", "Macintosh; Intel Mac OS X 10_15_7", "X11; Linux x86_64"];
    let os = os[rand::thread_rng().gen_range(0..os.len())];
    format!("Mozilla/5.0 ({os}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{version}.0.0.0 Safari/537.36")
}

fn firefox_ua(version: u32) -> String {
    let os = [
        "Windows NT 10.0; Win64; x64; rv:109.0",
        "Macintosh; Intel Mac OS X 10.15; rv:109.0",
        "X11; Linux x86_64; rv:109.0",
    ];
    let os = os[rand::thread_rng().gen_range(0..os.len())];
    format!("Mozilla/5.0 ({os}) Gecko/20100101 Firefox/{version}.0")
}

fn safari_ua(version: u32) -> String {
    format!(
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/{version}.0 Safari/605.1.15"
    )
}

fn edge_ua(version: u32) -> String {
    format!(
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{version}.0.0.0 Safari/537.36 Edg/{version}.0.0.0"
    )
}

const CURATED_BROWSER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/115.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
];

const CURATED_MOBILE_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 13; SM-S918B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Mobile Safari/537.36",
];

const CURATED_BOT_AGENTS: &[&str] = &[
    "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
    "Mozilla/5.0 (compatible; bingbot/2.0; +http://www.bing.com/bingbot.htm)",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_picks_always_differ() {
        for strategy in [
            RotationStrategy::Intelligent,
            RotationStrategy::Weighted,
            RotationStrategy::Random,
            RotationStrategy::Sequential,
        ] {
            let config = UserAgentConfig {
                strategy,
                ..UserAgentConfig::default()
            };
            let rotator = UserAgentRotator::new(config);
            let mut previous = rotator.next_mandatory(None);
            for _ in 0..50 {
                let next = rotator.next_mandatory(None);
                assert_ne!(next, previous, "strategy {strategy:?} repeated a UA");
                previous = next;
            }
        }
    }

    #[test]
    fn disabled_rotator_returns_default() {
        let config = UserAgentConfig {
            enabled: false,
            ..UserAgentConfig::default()
        };
        let rotator = UserAgentRotator::new(config);
        assert_eq!(rotator.next_mandatory(None), DEFAULT_USER_AGENT);
    }

    #[test]
    fn chrome_share_is_padded() {
        let rotator = UserAgentRotator::default();
        let guard = rotator.state.lock().unwrap();
        let chrome = guard
            .browser
            .iter()
            .filter(|ua| ua.contains("Chrome") && !ua.contains("Edg/"))
            .count();
        assert!(chrome as f64 >= guard.browser.len() as f64 * 0.6);
    }

    #[test]
    fn validation_rejects_bot_markers() {
        assert!(!validate_user_agent(
            "Mozilla/5.0 (compatible; SuperScraperBot/1.0) Chrome/120.0",
            true
        ));
        assert!(validate_user_agent(DEFAULT_USER_AGENT, true));
        assert!(!validate_user_agent("short", true));
    }

    #[test]
    fn observe_updates_domain_memory() {
        let rotator = UserAgentRotator::default();
        let ua = rotator.next_mandatory(Some("shop.example"));
        rotator.observe(&ua, true, Duration::from_millis(120), Some("shop.example"));
        rotator.observe(&ua, false, Duration::from_millis(300), Some("shop.example"));

        let stats = rotator.stats();
        assert_eq!(stats.domains_tracked, 1);
        assert_eq!(stats.successful_requests, 1);

        let guard = rotator.state.lock().unwrap();
        let prefs = guard.domain_prefs.get("shop.example").unwrap();
        let entry = prefs.get(&ua).unwrap();
        assert_eq!(entry.total_requests, 2);
        assert!((entry.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn intelligent_uses_domain_preferences() {
        let rotator = UserAgentRotator::default();
        let favored = rotator.next_mandatory(Some("shop.example"));
        for _ in 0..5 {
            rotator.observe(&favored, true, Duration::from_millis(100), Some("shop.example"));
        }
        // The favored agent is the only one with domain memory, so it comes
        // back whenever it was not the immediately preceding pick.
        let other = rotator.next_mandatory(Some("shop.example"));
        assert_ne!(other, favored);
        let third = rotator.next_mandatory(Some("shop.example"));
        assert_eq!(third, favored);
    }

    #[test]
    fn browser_version_extraction() {
        assert_eq!(browser_version(DEFAULT_USER_AGENT), 120);
        assert_eq!(
            browser_version("Mozilla/5.0 (X11; rv:109.0) Gecko/20100101 Firefox/115.0"),
            115
        );
    }
}
