//! Robots.txt compliance: permission checks, crawl-delay pacing, caching.
//!
//! Fetch or parse failures always fail open (allow with the default delay);
//! the acquisition pipeline favors resilience over enforcement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::time::{sleep, Instant};

/// Checker configuration.
#[derive(Debug, Clone)]
pub struct RobotsConfig {
    pub enabled: bool,
    pub respect_crawl_delay: bool,
    pub respect_disallow: bool,
    pub default_user_agent: String,
    pub cache_ttl: Duration,
    pub fetch_timeout: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub default_delay: Duration,
    pub testing_mode: bool,
    pub ignore_domains: Vec<String>,
    pub force_allow_patterns: Vec<String>,
}

impl Default for RobotsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            respect_crawl_delay: true,
            respect_disallow: true,
            default_user_agent: "*".to_string(),
            cache_ttl: Duration::from_secs(24 * 3600),
            fetch_timeout: Duration::from_secs(10),
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            default_delay: Duration::from_secs(1),
            testing_mode: false,
            ignore_domains: Vec::new(),
            force_allow_patterns: Vec::new(),
        }
    }
}

/// Outcome of a permission check.
#[derive(Debug, Clone)]
pub struct RobotsVerdict {
    pub allowed: bool,
    pub crawl_delay: Duration,
    pub reason: String,
    pub user_agent_used: String,
}

/// One user-agent group from a robots.txt file.
#[derive(Debug, Clone, Default)]
struct AgentGroup {
    agents: Vec<String>,
    allow: Vec<String>,
    disallow: Vec<String>,
    crawl_delay: Option<Duration>,
}

/// Parsed robots.txt rules.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    groups: Vec<AgentGroup>,
    pub sitemaps: Vec<String>,
    pub host: Option<String>,
}

impl RobotsRules {
    /// Parse raw robots.txt content. Unknown directives are ignored.
    pub fn parse(content: &str) -> Self {
        let mut rules = RobotsRules::default();
        let mut current: Option<AgentGroup> = None;
        let mut last_was_agent = false;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let directive = directive.trim().to_lowercase();
            let value = value.trim().to_string();

            match directive.as_str() {
                "user-agent" => {
                    if last_was_agent {
                        if let Some(group) = current.as_mut() {
                            group.agents.push(value.to_lowercase());
                        }
                    } else {
                        if let Some(group) = current.take() {
                            rules.groups.push(group);
                        }
                        current = Some(AgentGroup {
                            agents: vec![value.to_lowercase()],
                            ..AgentGroup::default()
                        });
                    }
                    last_was_agent = true;
                    continue;
                }
                "allow" => {
                    if let Some(group) = current.as_mut()
                        && !value.is_empty()
                    {
                        group.allow.push(value);
                    }
                }
                "disallow" => {
                    if let Some(group) = current.as_mut()
                        && !value.is_empty()
                    {
                        group.disallow.push(value);
                    }
                }
                "crawl-delay" => {
                    if let Some(group) = current.as_mut() {
                        match value.parse::<f64>() {
                            Ok(secs) if secs >= 0.0 => {
                                group.crawl_delay = Some(Duration::from_secs_f64(secs));
                            }
                            _ => log::warn!("invalid crawl-delay value: {value}"),
                        }
                    }
                }
                "sitemap" => rules.sitemaps.push(value),
                "host" => rules.host = Some(value),
                _ => {}
            }
            last_was_agent = false;
        }

        if let Some(group) = current.take() {
            rules.groups.push(group);
        }
        rules
    }

    fn group_for(&self, user_agent: &str) -> Option<&AgentGroup> {
        let lowered = user_agent.to_lowercase();
        // Specific product-token match first, wildcard group as fallback.
        self.groups
            .iter()
            .find(|group| {
                group
                    .agents
                    .iter()
                    .any(|agent| agent != "*" && lowered.contains(agent.as_str()))
            })
            .or_else(|| {
                self.groups
                    .iter()
                    .find(|group| group.agents.iter().any(|agent| agent == "*"))
            })
    }

    /// Longest-match rule between allow and disallow; allow wins ties.
    pub fn can_fetch(&self, user_agent: &str, path: &str) -> bool {
        let Some(group) = self.group_for(user_agent) else {
            return true;
        };

        let best_allow = group
            .allow
            .iter()
            .filter(|rule| path_matches(rule, path))
            .map(|rule| rule.len())
            .max();
        let best_disallow = group
            .disallow
            .iter()
            .filter(|rule| path_matches(rule, path))
            .map(|rule| rule.len())
            .max();

        match (best_allow, best_disallow) {
            (Some(allow), Some(disallow)) => allow >= disallow,
            (None, Some(_)) => false,
            _ => true,
        }
    }

    pub fn crawl_delay(&self, user_agent: &str) -> Option<Duration> {
        self.group_for(user_agent)
            .and_then(|group| group.crawl_delay)
            .or_else(|| {
                self.groups
                    .iter()
                    .find(|group| group.agents.iter().any(|agent| agent == "*"))
                    .and_then(|group| group.crawl_delay)
            })
    }
}

/// Rule path matching with `*` wildcards and a `$` end anchor.
fn path_matches(rule: &str, path: &str) -> bool {
    let (rule, anchored) = match rule.strip_suffix('$') {
        Some(stripped) => (stripped, true),
        None => (rule, false),
    };

    let mut position = 0usize;
    let mut segments = rule.split('*').peekable();
    let mut first = true;
    while let Some(segment) = segments.next() {
        if segment.is_empty() {
            first = false;
            continue;
        }
        if first {
            if !path[position..].starts_with(segment) {
                return false;
            }
            position += segment.len();
        } else {
            match path[position..].find(segment) {
                Some(found) => position += found + segment.len(),
                None => return false,
            }
        }
        if segments.peek().is_none() && anchored && !rule.ends_with('*') {
            return position == path.len();
        }
        first = false;
    }
    true
}

#[derive(Debug, Clone)]
struct CachedRobots {
    fetched_at: DateTime<Utc>,
    rules: Option<RobotsRules>,
}

#[derive(Debug, Clone)]
struct CachedSitemaps {
    fetched_at: DateTime<Utc>,
    sitemaps: Vec<String>,
}

/// Compliance statistics.
#[derive(Debug, Clone, Default)]
pub struct RobotsStats {
    pub total_checks: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    pub crawl_delays_applied: u64,
    pub fetches: u64,
    pub fetch_errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub sitemap_discoveries: u64,
}

/// Robots.txt checker with per-domain caching and crawl-delay pacing.
pub struct RobotsChecker {
    config: RobotsConfig,
    client: Option<reqwest::Client>,
    force_allow: Vec<Regex>,
    cache: Mutex<HashMap<String, CachedRobots>>,
    sitemap_cache: Mutex<HashMap<String, CachedSitemaps>>,
    // Per-domain pacing gates; the gate mutex is held across the sleep so
    // two workers cannot collapse the delay between them.
    access_gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Option<Instant>>>>>,
    stats: Mutex<RobotsStats>,
}

impl RobotsChecker {
    pub fn new(config: RobotsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|err| log::warn!("robots fetch client unavailable: {err}"))
            .ok();

        let force_allow = config
            .force_allow_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(err) => {
                    log::warn!("invalid force-allow pattern {pattern}: {err}");
                    None
                }
            })
            .collect();

        Self {
            config,
            client,
            force_allow,
            cache: Mutex::new(HashMap::new()),
            sitemap_cache: Mutex::new(HashMap::new()),
            access_gates: Mutex::new(HashMap::new()),
            stats: Mutex::new(RobotsStats::default()),
        }
    }

    /// Check whether a URL may be fetched under the given user agent.
    pub async fn check(&self, url: &str, user_agent: Option<&str>) -> RobotsVerdict {
        let ua = user_agent
            .unwrap_or(&self.config.default_user_agent)
            .to_string();

        if !self.config.enabled {
            return self.verdict(true, "robots_checking_disabled", &ua, None);
        }

        self.bump(|stats| stats.total_checks += 1);

        let Some((domain, path)) = split_url(url) else {
            return self.verdict(true, "unparseable_url", &ua, None);
        };

        if self.config.ignore_domains.iter().any(|d| d.eq_ignore_ascii_case(&domain)) {
            self.bump(|stats| stats.allowed_requests += 1);
            return self.verdict(true, "domain_in_ignore_list", &ua, None);
        }

        if let Some(pattern) = self.force_allow.iter().find(|re| re.is_match(url)) {
            self.bump(|stats| stats.allowed_requests += 1);
            return self.verdict(
                true,
                &format!("force_allow_pattern_matched: {pattern}"),
                &ua,
                None,
            );
        }

        let Some(rules) = self.rules_for(&domain).await else {
            log::warn!("could not fetch robots.txt for {domain}, defaulting to allowed");
            self.bump(|stats| stats.allowed_requests += 1);
            return self.verdict(true, "robots_txt_fetch_failed", &ua, None);
        };

        let mut allowed = !self.config.respect_disallow || rules.can_fetch(&ua, &path);
        let delay = self.resolve_delay(&rules, &ua);

        let reason = if allowed {
            self.bump(|stats| stats.allowed_requests += 1);
            "allowed_by_robots_txt"
        } else {
            self.bump(|stats| stats.blocked_requests += 1);
            if self.config.testing_mode {
                log::warn!("URL blocked by robots.txt (testing mode): {url}");
                allowed = true;
                "disallowed_but_testing_mode"
            } else {
                "disallowed_by_robots_txt"
            }
        };

        self.verdict(allowed, reason, &ua, Some(delay))
    }

    /// Wait until the domain's crawl delay has elapsed, then stamp access.
    /// Returns the delay actually slept.
    pub async fn apply_crawl_delay(&self, domain: &str, user_agent: Option<&str>) -> Duration {
        if !self.config.respect_crawl_delay {
            return Duration::ZERO;
        }

        let ua = user_agent.unwrap_or(&self.config.default_user_agent);
        let required = match self.rules_for(domain).await {
            Some(rules) => self.resolve_delay(&rules, ua),
            None => self.config.default_delay,
        };

        let gate = {
            let mut gates = self.access_gates.lock().expect("robots gate lock poisoned");
            gates
                .entry(domain.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
                .clone()
        };

        let mut last_access = gate.lock().await;
        let wait = match *last_access {
            Some(last) => required.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        };

        if wait > Duration::ZERO {
            log::debug!("applying crawl delay for {domain}: {:.2}s", wait.as_secs_f64());
            sleep(wait).await;
            self.bump(|stats| stats.crawl_delays_applied += 1);
        }
        *last_access = Some(Instant::now());
        wait
    }

    /// Sitemap URLs advertised by the domain's robots.txt.
    pub async fn sitemap_urls(&self, domain: &str) -> Vec<String> {
        {
            let cache = self.sitemap_cache.lock().expect("sitemap cache lock poisoned");
            if let Some(entry) = cache.get(domain)
                && !self.expired(entry.fetched_at)
            {
                return entry.sitemaps.clone();
            }
        }

        let sitemaps = match self.rules_for(domain).await {
            Some(rules) => rules
                .sitemaps
                .iter()
                .map(|sitemap| {
                    if sitemap.starts_with('/') {
                        format!("https://{domain}{sitemap}")
                    } else if !sitemap.starts_with("http://") && !sitemap.starts_with("https://") {
                        format!("https://{domain}/{sitemap}")
                    } else {
                        sitemap.clone()
                    }
                })
                .collect(),
            None => Vec::new(),
        };

        if !sitemaps.is_empty() {
            self.bump(|stats| stats.sitemap_discoveries += 1);
            log::info!("discovered {} sitemaps for {domain}", sitemaps.len());
        }

        let mut cache = self.sitemap_cache.lock().expect("sitemap cache lock poisoned");
        cache.insert(
            domain.to_string(),
            CachedSitemaps {
                fetched_at: Utc::now(),
                sitemaps: sitemaps.clone(),
            },
        );
        sitemaps
    }

    pub fn stats(&self) -> RobotsStats {
        self.stats.lock().expect("robots stats lock poisoned").clone()
    }

    pub fn clear_cache(&self) {
        self.cache.lock().expect("robots cache lock poisoned").clear();
        self.sitemap_cache
            .lock()
            .expect("sitemap cache lock poisoned")
            .clear();
        log::info!("cleared robots.txt cache");
    }

    async fn rules_for(&self, domain: &str) -> Option<RobotsRules> {
        {
            let cache = self.cache.lock().expect("robots cache lock poisoned");
            if let Some(entry) = cache.get(domain)
                && !self.expired(entry.fetched_at)
            {
                self.bump(|stats| stats.cache_hits += 1);
                return entry.rules.clone();
            }
        }
        self.bump(|stats| stats.cache_misses += 1);

        let rules = self.fetch_robots(domain).await.map(|raw| RobotsRules::parse(&raw));
        let mut cache = self.cache.lock().expect("robots cache lock poisoned");
        cache.insert(
            domain.to_string(),
            CachedRobots {
                fetched_at: Utc::now(),
                rules: rules.clone(),
            },
        );
        rules
    }

    async fn fetch_robots(&self, domain: &str) -> Option<String> {
        let client = self.client.as_ref()?;
        let robots_url = format!("https://{domain}/robots.txt");

        match client
            .get(&robots_url)
            .header("User-Agent", "robots.txt checker")
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                self.bump(|stats| stats.fetches += 1);
                match response.text().await {
                    Ok(text) => {
                        log::debug!("fetched robots.txt for {domain}");
                        Some(text)
                    }
                    Err(err) => {
                        self.bump(|stats| stats.fetch_errors += 1);
                        log::warn!("error reading robots.txt body for {domain}: {err}");
                        None
                    }
                }
            }
            Ok(response) => {
                log::debug!(
                    "robots.txt not found for {domain} (status: {})",
                    response.status()
                );
                None
            }
            Err(err) => {
                self.bump(|stats| stats.fetch_errors += 1);
                log::warn!("error fetching robots.txt for {domain}: {err}");
                None
            }
        }
    }

    fn resolve_delay(&self, rules: &RobotsRules, user_agent: &str) -> Duration {
        if !self.config.respect_crawl_delay {
            return self.config.default_delay;
        }
        match rules.crawl_delay(user_agent) {
            Some(delay) => delay.clamp(self.config.min_delay, self.config.max_delay),
            None => self.config.default_delay,
        }
    }

    fn expired(&self, fetched_at: DateTime<Utc>) -> bool {
        let age = Utc::now() - fetched_at;
        age.to_std().map(|d| d > self.config.cache_ttl).unwrap_or(true)
    }

    fn verdict(
        &self,
        allowed: bool,
        reason: &str,
        ua: &str,
        delay: Option<Duration>,
    ) -> RobotsVerdict {
        RobotsVerdict {
            allowed,
            crawl_delay: delay.unwrap_or(self.config.default_delay),
            reason: reason.to_string(),
            user_agent_used: ua.to_string(),
        }
    }

    fn bump<F: FnOnce(&mut RobotsStats)>(&self, f: F) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    #[cfg(test)]
    pub(crate) fn prime_cache(&self, domain: &str, content: &str) {
        let mut cache = self.cache.lock().unwrap();
        cache.insert(
            domain.to_string(),
            CachedRobots {
                fetched_at: Utc::now(),
                rules: Some(RobotsRules::parse(content)),
            },
        );
    }
}

impl Default for RobotsChecker {
    fn default() -> Self {
        Self::new(RobotsConfig::default())
    }
}

fn split_url(url: &str) -> Option<(String, String)> {
    let parsed = url::Url::parse(url).ok()?;
    let domain = parsed.host_str()?.to_lowercase();
    let mut path = parsed.path().to_string();
    if let Some(query) = parsed.query() {
        path.push('?');
        path.push_str(query);
    }
    Some((domain, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROBOTS: &str = "\
# storefront robots
User-agent: *
Disallow: /admin/
Disallow: /cart
Allow: /cart/shared
Crawl-delay: 2

User-agent: yarnbot
Disallow: /
Crawl-delay: 10

Sitemap: /sitemap.xml
Sitemap: https://shop.example/products.xml
";

    #[test]
    fn parses_groups_delays_and_sitemaps() {
        let rules = RobotsRules::parse(ROBOTS);
        assert_eq!(rules.sitemaps.len(), 2);
        assert_eq!(rules.crawl_delay("*"), Some(Duration::from_secs(2)));
        assert_eq!(
            rules.crawl_delay("Mozilla/5.0 compatible; YarnBot/2.1"),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn disallow_and_allow_longest_match() {
        let rules = RobotsRules::parse(ROBOTS);
        assert!(!rules.can_fetch("*", "/admin/settings"));
        assert!(!rules.can_fetch("*", "/cart"));
        assert!(rules.can_fetch("*", "/cart/shared/123"));
        assert!(rules.can_fetch("*", "/product/42"));
    }

    #[test]
    fn specific_agent_group_wins() {
        let rules = RobotsRules::parse(ROBOTS);
        assert!(!rules.can_fetch("yarnbot/1.0", "/product/42"));
        assert!(rules.can_fetch("otherbot/1.0", "/product/42"));
    }

    #[test]
    fn wildcard_and_anchor_rules() {
        let rules = RobotsRules::parse(
            "User-agent: *\nDisallow: /*.pdf$\nDisallow: /search*results\n",
        );
        assert!(!rules.can_fetch("*", "/docs/manual.pdf"));
        assert!(rules.can_fetch("*", "/docs/manual.pdf.html"));
        assert!(!rules.can_fetch("*", "/search/all/results"));
        assert!(rules.can_fetch("*", "/searching"));
    }

    #[test]
    fn empty_robots_allows_everything() {
        let rules = RobotsRules::parse("");
        assert!(rules.can_fetch("*", "/anything"));
        assert_eq!(rules.crawl_delay("*"), None);
    }

    #[tokio::test]
    async fn check_uses_cached_rules() {
        let checker = RobotsChecker::default();
        checker.prime_cache("shop.example", ROBOTS);

        let verdict = checker
            .check("https://shop.example/admin/panel", None)
            .await;
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, "disallowed_by_robots_txt");

        let verdict = checker.check("https://shop.example/product/1", None).await;
        assert!(verdict.allowed);
        assert_eq!(verdict.crawl_delay, Duration::from_secs(2));

        let stats = checker.stats();
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.cache_misses, 0);
    }

    #[tokio::test]
    async fn testing_mode_logs_but_allows() {
        let config = RobotsConfig {
            testing_mode: true,
            ..RobotsConfig::default()
        };
        let checker = RobotsChecker::new(config);
        checker.prime_cache("shop.example", ROBOTS);

        let verdict = checker.check("https://shop.example/admin/x", None).await;
        assert!(verdict.allowed);
        assert_eq!(verdict.reason, "disallowed_but_testing_mode");
    }

    #[tokio::test]
    async fn ignore_list_bypasses_rules() {
        let config = RobotsConfig {
            ignore_domains: vec!["shop.example".to_string()],
            ..RobotsConfig::default()
        };
        let checker = RobotsChecker::new(config);
        checker.prime_cache("shop.example", ROBOTS);

        let verdict = checker.check("https://shop.example/admin/x", None).await;
        assert!(verdict.allowed);
        assert_eq!(verdict.reason, "domain_in_ignore_list");
    }

    #[tokio::test]
    async fn crawl_delay_enforces_monotonic_spacing() {
        let config = RobotsConfig {
            default_delay: Duration::from_millis(50),
            min_delay: Duration::from_millis(10),
            ..RobotsConfig::default()
        };
        let checker = RobotsChecker::new(config);
        checker.prime_cache("shop.example", "User-agent: *\n");

        let first = checker.apply_crawl_delay("shop.example", None).await;
        assert_eq!(first, Duration::ZERO);

        let started = Instant::now();
        let second = checker.apply_crawl_delay("shop.example", None).await;
        assert!(second > Duration::ZERO);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn sitemaps_are_absolutized() {
        let checker = RobotsChecker::default();
        checker.prime_cache("shop.example", ROBOTS);

        let sitemaps = checker.sitemap_urls("shop.example").await;
        assert_eq!(
            sitemaps,
            vec![
                "https://shop.example/sitemap.xml".to_string(),
                "https://shop.example/products.xml".to_string(),
            ]
        );
    }
}
