//! CAPTCHA detection and solving through an external 2captcha-style service.
//!
//! Detection is an ordered regex scan (reCAPTCHA v3 first, it has the most
//! specific markers). Solving submits to `in.php` and polls `res.php`; every
//! successful solve is cost-accounted against a daily budget.

use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use tokio::time::{sleep, Instant};
use url::Url;

/// CAPTCHA flavors the solver can dispatch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptchaKind {
    RecaptchaV2,
    RecaptchaV3,
    HCaptcha,
    Image,
}

impl CaptchaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptchaKind::RecaptchaV2 => "recaptcha_v2",
            CaptchaKind::RecaptchaV3 => "recaptcha_v3",
            CaptchaKind::HCaptcha => "hcaptcha",
            CaptchaKind::Image => "image_captcha",
        }
    }

    fn cost_usd(&self) -> f64 {
        match self {
            CaptchaKind::Image => 0.001,
            _ => 0.002,
        }
    }
}

impl std::fmt::Display for CaptchaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detected CAPTCHA with the parameters needed to solve it.
#[derive(Debug, Clone)]
pub struct CaptchaDetection {
    pub kind: CaptchaKind,
    pub site_key: Option<String>,
    pub action: Option<String>,
    pub image_url: Option<String>,
    pub confidence: f32,
}

/// Token (or text, for image CAPTCHAs) returned by the solver.
#[derive(Debug, Clone)]
pub struct CaptchaSolution {
    pub kind: CaptchaKind,
    pub token: String,
}

/// Solver configuration.
#[derive(Debug, Clone)]
pub struct CaptchaSolverConfig {
    pub enabled: bool,
    pub api_key_env: String,
    pub api_url: String,
    pub submit_timeout: Duration,
    pub polling_interval: Duration,
    pub max_solve_time: Duration,
    pub prefer_fast_workers: bool,
    pub daily_limit_usd: f64,
    pub min_balance_usd: f64,
    pub alert_on_low_balance: bool,
    pub proxy_format: String,
}

impl Default for CaptchaSolverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key_env: "CAPTCHA_API_KEY".to_string(),
            api_url: "http://2captcha.com".to_string(),
            submit_timeout: Duration::from_secs(30),
            polling_interval: Duration::from_secs(5),
            max_solve_time: Duration::from_secs(60),
            prefer_fast_workers: true,
            daily_limit_usd: 10.0,
            min_balance_usd: 5.0,
            alert_on_low_balance: true,
            proxy_format: "http".to_string(),
        }
    }
}

/// Solve counters and cost ledger.
#[derive(Debug, Clone)]
pub struct SolveStats {
    pub total_attempts: u64,
    pub successful_solves: u64,
    pub failed_solves: u64,
    pub timeout_errors: u64,
    pub balance_errors: u64,
    pub avg_solve_time: f64,
    pub total_cost_usd: f64,
    pub daily_cost_usd: f64,
    pub last_reset_date: NaiveDate,
}

impl Default for SolveStats {
    fn default() -> Self {
        Self {
            total_attempts: 0,
            successful_solves: 0,
            failed_solves: 0,
            timeout_errors: 0,
            balance_errors: 0,
            avg_solve_time: 0.0,
            total_cost_usd: 0.0,
            daily_cost_usd: 0.0,
            last_reset_date: Utc::now().date_naive(),
        }
    }
}

/// External CAPTCHA solver client with cost accounting.
pub struct CaptchaSolver {
    config: CaptchaSolverConfig,
    api_key: String,
    client: Option<reqwest::Client>,
    stats: Mutex<SolveStats>,
}

impl CaptchaSolver {
    pub fn new(config: CaptchaSolverConfig) -> Self {
        let api_key = std::env::var(&config.api_key_env).unwrap_or_default();
        if config.enabled && api_key.is_empty() {
            log::warn!(
                "captcha solving enabled but API key not configured (env {})",
                config.api_key_env
            );
        }

        let client = reqwest::Client::builder()
            .timeout(config.submit_timeout)
            .build()
            .map_err(|err| log::warn!("captcha client unavailable: {err}"))
            .ok();

        Self {
            config,
            api_key,
            client,
            stats: Mutex::new(SolveStats::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && !self.api_key.is_empty() && self.client.is_some()
    }

    /// Detect a CAPTCHA in a page and solve it in one step.
    pub async fn detect_and_solve(
        &self,
        html: &str,
        url: &str,
        proxy: Option<&str>,
        user_agent: Option<&str>,
    ) -> Option<CaptchaSolution> {
        let detection = detect_captcha(html, url)?;
        log::info!("CAPTCHA detected: {} on {url}", detection.kind);

        let token = match detection.kind {
            CaptchaKind::RecaptchaV2 => {
                self.solve_recaptcha_v2(detection.site_key.as_deref()?, url, proxy, user_agent)
                    .await
            }
            CaptchaKind::RecaptchaV3 => {
                self.solve_recaptcha_v3(
                    detection.site_key.as_deref()?,
                    url,
                    detection.action.as_deref().unwrap_or("submit"),
                    proxy,
                    user_agent,
                )
                .await
            }
            CaptchaKind::HCaptcha => {
                self.solve_hcaptcha(detection.site_key.as_deref()?, url, proxy, user_agent)
                    .await
            }
            CaptchaKind::Image => {
                let image_url = detection.image_url.as_deref()?;
                let image = self.fetch_image(image_url, proxy, user_agent).await?;
                self.solve_image(&image).await
            }
        }?;

        Some(CaptchaSolution {
            kind: detection.kind,
            token,
        })
    }

    pub async fn solve_recaptcha_v2(
        &self,
        site_key: &str,
        page_url: &str,
        proxy: Option<&str>,
        user_agent: Option<&str>,
    ) -> Option<String> {
        let mut form = vec![
            ("method".to_string(), "userrecaptcha".to_string()),
            ("googlekey".to_string(), site_key.to_string()),
            ("pageurl".to_string(), page_url.to_string()),
        ];
        self.attach_common(&mut form, proxy, user_agent);
        self.solve_with(CaptchaKind::RecaptchaV2, form).await
    }

    pub async fn solve_recaptcha_v3(
        &self,
        site_key: &str,
        page_url: &str,
        action: &str,
        proxy: Option<&str>,
        user_agent: Option<&str>,
    ) -> Option<String> {
        let mut form = vec![
            ("method".to_string(), "userrecaptcha".to_string()),
            ("version".to_string(), "v3".to_string()),
            ("googlekey".to_string(), site_key.to_string()),
            ("pageurl".to_string(), page_url.to_string()),
            ("action".to_string(), action.to_string()),
        ];
        self.attach_common(&mut form, proxy, user_agent);
        self.solve_with(CaptchaKind::RecaptchaV3, form).await
    }

    pub async fn solve_hcaptcha(
        &self,
        site_key: &str,
        page_url: &str,
        proxy: Option<&str>,
        user_agent: Option<&str>,
    ) -> Option<String> {
        let mut form = vec![
            ("method".to_string(), "hcaptcha".to_string()),
            ("sitekey".to_string(), site_key.to_string()),
            ("pageurl".to_string(), page_url.to_string()),
        ];
        self.attach_common(&mut form, proxy, user_agent);
        self.solve_with(CaptchaKind::HCaptcha, form).await
    }

    /// Solve an image CAPTCHA from raw bytes; the answer text is the token.
    pub async fn solve_image(&self, image: &[u8]) -> Option<String> {
        let form = vec![
            ("method".to_string(), "base64".to_string()),
            ("body".to_string(), BASE64.encode(image)),
        ];
        self.solve_with(CaptchaKind::Image, form).await
    }

    /// Current solver account balance in USD.
    pub async fn balance(&self) -> Option<f64> {
        if !self.is_enabled() {
            return None;
        }
        let client = self.client.as_ref()?;
        let url = format!("{}/res.php", self.config.api_url);

        let payload: Value = client
            .get(&url)
            .query(&[
                ("key", self.api_key.as_str()),
                ("action", "getbalance"),
                ("json", "1"),
            ])
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()?;

        if payload.get("status").and_then(Value::as_i64) == Some(1) {
            let balance = match payload.get("request") {
                Some(Value::String(s)) => s.parse().ok()?,
                Some(Value::Number(n)) => n.as_f64()?,
                _ => return None,
            };
            log::info!("captcha solver balance: ${balance:.4} USD");
            Some(balance)
        } else {
            log::error!(
                "failed to get balance: {}",
                payload.get("error_text").and_then(Value::as_str).unwrap_or("unknown")
            );
            None
        }
    }

    pub fn stats(&self) -> SolveStats {
        self.stats.lock().expect("captcha stats lock poisoned").clone()
    }

    async fn solve_with(&self, kind: CaptchaKind, form: Vec<(String, String)>) -> Option<String> {
        if !self.is_enabled() {
            log::warn!("captcha solver is disabled or has no API key");
            return None;
        }

        log::info!("solving {kind}...");
        let started = Instant::now();
        self.bump(|stats| stats.total_attempts += 1);

        if !self.check_budget_and_balance(kind).await {
            return None;
        }

        let Some(captcha_id) = self.submit(form).await else {
            self.bump(|stats| stats.failed_solves += 1);
            return None;
        };

        let solution = self.poll(&captcha_id).await;
        let solve_time = started.elapsed().as_secs_f64();

        match solution {
            Some(token) => {
                self.bump(|stats| {
                    stats.successful_solves += 1;
                    let previous = stats.successful_solves.saturating_sub(1);
                    stats.avg_solve_time = (stats.avg_solve_time * previous as f64 + solve_time)
                        / stats.successful_solves as f64;
                });
                self.track_cost(kind);
                log::info!("{kind} solved successfully in {solve_time:.2}s");
                Some(token)
            }
            None => {
                self.bump(|stats| stats.failed_solves += 1);
                log::warn!("{kind} solving failed after {solve_time:.2}s");
                None
            }
        }
    }

    async fn submit(&self, mut form: Vec<(String, String)>) -> Option<String> {
        let client = self.client.as_ref()?;
        form.push(("key".to_string(), self.api_key.clone()));
        form.push(("json".to_string(), "1".to_string()));
        if self.config.prefer_fast_workers {
            form.push(("fast".to_string(), "1".to_string()));
        }

        let url = format!("{}/in.php", self.config.api_url);
        let payload: Value = match client.post(&url).form(&form).send().await {
            Ok(response) => match response.json().await {
                Ok(payload) => payload,
                Err(err) => {
                    log::error!("error reading submit response: {err}");
                    return None;
                }
            },
            Err(err) => {
                log::error!("error submitting CAPTCHA: {err}");
                return None;
            }
        };

        if payload.get("status").and_then(Value::as_i64) == Some(1) {
            let id = payload.get("request").and_then(Value::as_str)?.to_string();
            log::debug!("CAPTCHA submitted successfully, id: {id}");
            Some(id)
        } else {
            log::error!(
                "failed to submit CAPTCHA: {}",
                payload.get("error_text").and_then(Value::as_str).unwrap_or("unknown")
            );
            None
        }
    }

    async fn poll(&self, captcha_id: &str) -> Option<String> {
        let client = self.client.as_ref()?;
        let url = format!("{}/res.php", self.config.api_url);
        let deadline = Instant::now() + self.config.max_solve_time;

        while Instant::now() < deadline {
            let payload: Value = match client
                .get(&url)
                .query(&[
                    ("key", self.api_key.as_str()),
                    ("action", "get"),
                    ("id", captcha_id),
                    ("json", "1"),
                ])
                .send()
                .await
            {
                Ok(response) => match response.json().await {
                    Ok(payload) => payload,
                    Err(err) => {
                        log::error!("error reading poll response: {err}");
                        return None;
                    }
                },
                Err(err) => {
                    log::error!("error polling CAPTCHA result: {err}");
                    return None;
                }
            };

            if payload.get("status").and_then(Value::as_i64) == Some(1) {
                return payload.get("request").and_then(Value::as_str).map(String::from);
            }

            match payload.get("request").and_then(Value::as_str) {
                Some("CAPCHA_NOT_READY") => sleep(self.config.polling_interval).await,
                other => {
                    log::error!("CAPTCHA solving failed: {}", other.unwrap_or("unknown"));
                    return None;
                }
            }
        }

        log::warn!(
            "CAPTCHA solving timed out after {:.0}s",
            self.config.max_solve_time.as_secs_f64()
        );
        self.bump(|stats| stats.timeout_errors += 1);
        None
    }

    async fn fetch_image(
        &self,
        image_url: &str,
        proxy: Option<&str>,
        user_agent: Option<&str>,
    ) -> Option<Vec<u8>> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).ok()?);
        }
        let client = builder.build().ok()?;

        let mut request = client.get(image_url);
        if let Some(ua) = user_agent {
            request = request.header("User-Agent", ua);
        }

        let response = request.send().await.ok()?;
        if !response.status().is_success() {
            log::error!("failed to fetch image CAPTCHA: HTTP {}", response.status());
            return None;
        }
        response.bytes().await.ok().map(|b| b.to_vec())
    }

    /// Refuse to solve when the daily budget is spent or the account balance
    /// is below the per-solve cost.
    async fn check_budget_and_balance(&self, kind: CaptchaKind) -> bool {
        {
            let mut stats = self.stats.lock().expect("captcha stats lock poisoned");
            reset_daily_if_needed(&mut stats);
            if stats.daily_cost_usd >= self.config.daily_limit_usd {
                log::warn!(
                    "daily captcha budget exhausted: ${:.4} >= ${:.4}",
                    stats.daily_cost_usd,
                    self.config.daily_limit_usd
                );
                stats.balance_errors += 1;
                return false;
            }
        }

        let Some(balance) = self.balance().await else {
            self.bump(|stats| stats.balance_errors += 1);
            return false;
        };

        if balance < kind.cost_usd() {
            log::error!("insufficient balance: ${balance:.4} < ${:.4}", kind.cost_usd());
            self.bump(|stats| stats.balance_errors += 1);
            return false;
        }
        if balance < self.config.min_balance_usd && self.config.alert_on_low_balance {
            log::warn!(
                "low balance alert: ${balance:.4} < ${:.4}",
                self.config.min_balance_usd
            );
        }
        true
    }

    fn track_cost(&self, kind: CaptchaKind) {
        let mut stats = self.stats.lock().expect("captcha stats lock poisoned");
        reset_daily_if_needed(&mut stats);
        stats.total_cost_usd += kind.cost_usd();
        stats.daily_cost_usd += kind.cost_usd();

        if stats.daily_cost_usd > self.config.daily_limit_usd {
            log::warn!(
                "daily cost limit exceeded: ${:.4} > ${:.4}",
                stats.daily_cost_usd,
                self.config.daily_limit_usd
            );
        }
    }

    fn attach_common(
        &self,
        form: &mut Vec<(String, String)>,
        proxy: Option<&str>,
        user_agent: Option<&str>,
    ) {
        if let Some(proxy) = proxy
            && let Some((address, scheme)) = format_proxy(proxy, &self.config.proxy_format)
        {
            form.push(("proxy".to_string(), address));
            form.push(("proxytype".to_string(), scheme));
        }
        if let Some(ua) = user_agent {
            form.push(("userAgent".to_string(), ua.to_string()));
        }
    }

    fn bump<F: FnOnce(&mut SolveStats)>(&self, f: F) {
        if let Ok(mut stats) = self.stats.lock() {
            reset_daily_if_needed(&mut stats);
            f(&mut stats);
        }
    }
}

impl Default for CaptchaSolver {
    fn default() -> Self {
        Self::new(CaptchaSolverConfig::default())
    }
}

fn reset_daily_if_needed(stats: &mut SolveStats) {
    let today = Utc::now().date_naive();
    if today != stats.last_reset_date {
        stats.daily_cost_usd = 0.0;
        stats.last_reset_date = today;
    }
}

/// Format a proxy URL into the solver's `user:pass@host:port` + type pair.
fn format_proxy(proxy: &str, default_scheme: &str) -> Option<(String, String)> {
    if proxy.contains("://") {
        let parsed = Url::parse(proxy).ok()?;
        let host = parsed.host_str()?;
        let port = parsed.port()?;
        let scheme = parsed.scheme().to_uppercase();
        let address = if parsed.username().is_empty() {
            format!("{host}:{port}")
        } else {
            format!(
                "{}:{}@{host}:{port}",
                parsed.username(),
                parsed.password().unwrap_or("")
            )
        };
        return Some((address, scheme));
    }

    // host:port[:user:pass] shorthand.
    let parts: Vec<&str> = proxy.split(':').collect();
    if parts.len() < 2 {
        return None;
    }
    let port: u16 = parts[1].parse().ok()?;
    let address = if parts.len() >= 4 {
        format!("{}:{}@{}:{port}", parts[2], parts[3], parts[0])
    } else {
        format!("{}:{port}", parts[0])
    };
    Some((address, default_scheme.to_uppercase()))
}

/// Ordered CAPTCHA detection: v3, v2, hCaptcha, then generic image forms.
pub fn detect_captcha(html: &str, url: &str) -> Option<CaptchaDetection> {
    if RECAPTCHA_V3_RE.is_match(html) {
        let site_key = V3_RENDER_RE
            .captures(html)
            .map(|caps| caps[1].to_string())
            .filter(|key| key != "explicit" && key != "onload");
        let action = ACTION_RE.captures(html).map(|caps| caps[1].to_string());
        if let Some(site_key) = site_key {
            log::info!("detected reCAPTCHA v3 with site key {site_key}");
            return Some(CaptchaDetection {
                kind: CaptchaKind::RecaptchaV3,
                site_key: Some(site_key),
                action,
                image_url: None,
                confidence: 0.9,
            });
        }
    }

    if RECAPTCHA_V2_RE.is_match(html) {
        let site_key = SITEKEY_RE.captures(html).map(|caps| caps[1].to_string());
        log::info!("detected reCAPTCHA v2");
        return Some(CaptchaDetection {
            kind: CaptchaKind::RecaptchaV2,
            site_key,
            action: None,
            image_url: None,
            confidence: 0.8,
        });
    }

    if HCAPTCHA_RE.is_match(html) {
        let site_key = SITEKEY_RE.captures(html).map(|caps| caps[1].to_string());
        log::info!("detected hCaptcha");
        return Some(CaptchaDetection {
            kind: CaptchaKind::HCaptcha,
            site_key,
            action: None,
            image_url: None,
            confidence: 0.8,
        });
    }

    if IMAGE_CAPTCHA_RE.is_match(html) {
        let image_url = IMAGE_SRC_RE.captures(html).and_then(|caps| {
            let src = &caps[1];
            Url::parse(url).ok()?.join(src).ok().map(String::from)
        });
        log::info!("detected image CAPTCHA");
        return Some(CaptchaDetection {
            kind: CaptchaKind::Image,
            site_key: None,
            action: None,
            image_url,
            confidence: 0.6,
        });
    }

    None
}

fn build_regex(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("invalid captcha regex")
}

static RECAPTCHA_V3_RE: Lazy<Regex> = Lazy::new(|| {
    build_regex(r#"(recaptcha/api\.js\?render=[^&\s"']+|grecaptcha\.execute)"#)
});
static V3_RENDER_RE: Lazy<Regex> =
    Lazy::new(|| build_regex(r#"recaptcha/api\.js\?render=([^&\s"']+)"#));
static ACTION_RE: Lazy<Regex> = Lazy::new(|| build_regex(r#"data-action="([^"]+)""#));

static RECAPTCHA_V2_RE: Lazy<Regex> = Lazy::new(|| {
    build_regex(r#"(google\.com/recaptcha/api|grecaptcha\.render|class="g-recaptcha")"#)
});
static SITEKEY_RE: Lazy<Regex> = Lazy::new(|| build_regex(r#"data-sitekey="([^"]+)""#));

static HCAPTCHA_RE: Lazy<Regex> = Lazy::new(|| {
    build_regex(r#"(hcaptcha\.com/1/api\.js|class="h-captcha"|hcaptcha\.render)"#)
});

static IMAGE_CAPTCHA_RE: Lazy<Regex> = Lazy::new(|| {
    build_regex(r"(<img[^>]*captcha[^>]*>|captcha\.(?:jpg|png|gif))")
});
static IMAGE_SRC_RE: Lazy<Regex> =
    Lazy::new(|| build_regex(r#"<img[^>]*src="([^"]*captcha[^"]*)""#));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_recaptcha_v3_with_key_and_action() {
        let html = r#"<script src="https://www.google.com/recaptcha/api.js?render=6LcKeyV3"></script>
                      <button data-action="checkout">Buy</button>"#;
        let detection = detect_captcha(html, "https://shop.example/p/1").unwrap();
        assert_eq!(detection.kind, CaptchaKind::RecaptchaV3);
        assert_eq!(detection.site_key.as_deref(), Some("6LcKeyV3"));
        assert_eq!(detection.action.as_deref(), Some("checkout"));
    }

    #[test]
    fn detects_recaptcha_v2() {
        let html = r#"<div class="g-recaptcha" data-sitekey="6LcKeyV2"></div>"#;
        let detection = detect_captcha(html, "https://shop.example/p/1").unwrap();
        assert_eq!(detection.kind, CaptchaKind::RecaptchaV2);
        assert_eq!(detection.site_key.as_deref(), Some("6LcKeyV2"));
    }

    #[test]
    fn detects_hcaptcha() {
        let html = r#"<script src="https://hcaptcha.com/1/api.js"></script>
                      <div class="h-captcha" data-sitekey="hckey"></div>"#;
        let detection = detect_captcha(html, "https://shop.example/p/1").unwrap();
        assert_eq!(detection.kind, CaptchaKind::HCaptcha);
        assert_eq!(detection.site_key.as_deref(), Some("hckey"));
    }

    #[test]
    fn detects_image_captcha_with_absolute_url() {
        let html = r#"<form><img src="/captcha.png" alt="code"></form>"#;
        let detection = detect_captcha(html, "https://shop.example/login").unwrap();
        assert_eq!(detection.kind, CaptchaKind::Image);
        assert_eq!(
            detection.image_url.as_deref(),
            Some("https://shop.example/captcha.png")
        );
    }

    #[test]
    fn plain_page_detects_nothing() {
        let html = "<html><body><h1>Yarn</h1><p>No challenges here</p></body></html>";
        assert!(detect_captcha(html, "https://shop.example/p/1").is_none());
    }

    #[test]
    fn v3_wins_over_v2_markers() {
        let html = r#"<script src="https://www.google.com/recaptcha/api.js?render=v3key"></script>
                      <div class="g-recaptcha" data-sitekey="v2key"></div>"#;
        let detection = detect_captcha(html, "https://shop.example/p/1").unwrap();
        assert_eq!(detection.kind, CaptchaKind::RecaptchaV3);
        assert_eq!(detection.site_key.as_deref(), Some("v3key"));
    }

    #[test]
    fn format_proxy_full_url() {
        let (address, scheme) = format_proxy("http://alice:pw@203.0.113.1:8080", "http").unwrap();
        assert_eq!(address, "alice:pw@203.0.113.1:8080");
        assert_eq!(scheme, "HTTP");
    }

    #[test]
    fn format_proxy_host_port_shorthand() {
        let (address, scheme) = format_proxy("203.0.113.1:8080", "socks5").unwrap();
        assert_eq!(address, "203.0.113.1:8080");
        assert_eq!(scheme, "SOCKS5");
    }

    #[test]
    fn daily_cost_resets_on_new_day() {
        let mut stats = SolveStats {
            daily_cost_usd: 5.0,
            last_reset_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            ..SolveStats::default()
        };
        reset_daily_if_needed(&mut stats);
        assert_eq!(stats.daily_cost_usd, 0.0);
        assert_eq!(stats.last_reset_date, Utc::now().date_naive());
    }

    #[test]
    fn cost_tracking_accumulates() {
        let solver = CaptchaSolver::default();
        solver.track_cost(CaptchaKind::RecaptchaV2);
        solver.track_cost(CaptchaKind::Image);
        let stats = solver.stats();
        assert!((stats.total_cost_usd - 0.003).abs() < 1e-9);
        assert!((stats.daily_cost_usd - 0.003).abs() < 1e-9);
    }

    #[test]
    fn solver_without_key_is_disabled() {
        let config = CaptchaSolverConfig {
            api_key_env: "STEALTHFETCH_TEST_MISSING_KEY".to_string(),
            ..CaptchaSolverConfig::default()
        };
        let solver = CaptchaSolver::new(config);
        assert!(!solver.is_enabled());
    }
}
