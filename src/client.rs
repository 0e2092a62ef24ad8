//! High level acquisition orchestration.
//!
//! Wires together robots compliance, user-agent rotation, proxy selection,
//! content validation, CAPTCHA solving, and the challenge-solver fallback
//! into a single per-URL request protocol with per-domain circuit breaking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::Method;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use url::Url;

use crate::backoff::{BackoffPolicy, ErrorKind};
use crate::breaker::{DomainBreaker, DomainCircuitState};
use crate::captcha::{CaptchaKind, CaptchaSolver};
use crate::challenge::{looks_like_guard_html, ChallengeSolverClient, SolvedResponse};
use crate::config::{Config, GuardDomainOverride};
use crate::export::ProgressEmitter;
use crate::proxy::{HealthChecker, PremiumProxyManager, ProxyRotator};
use crate::robots::RobotsChecker;
use crate::session::{SessionStore, SessionUpdate};
use crate::user_agents::UserAgentRotator;
use crate::validation::{BlockType, ContentValidator};

/// Result alias for the orchestration layer.
pub type FetchResult = Result<FetchOutcome, FetchError>;

/// Hard errors surfaced by the coordinator.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Outcome of one coordinated acquisition.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Valid payload acquired.
    Success(FetchResponse),
    /// Terminal 404; never retried and never counted as site distress.
    NotFound { url: String, status: u16 },
    /// robots.txt forbids the URL; the coordinator does not retry these.
    RobotsDisallowed { url: String, reason: String },
    /// The domain circuit is open; the request was skipped outright.
    CircuitOpen { domain: String },
    /// Retries exhausted or a terminal error kind was hit.
    Failed {
        url: String,
        attempts: u32,
        last_error: Option<ErrorKind>,
    },
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success(_))
    }
}

/// Successful acquisition payload.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
    pub headers: HashMap<String, String>,
    pub proxy: Option<String>,
    pub user_agent: String,
    pub attempts: u32,
    pub via_challenge_solver: bool,
    pub final_url: String,
    pub response_time: Duration,
}

/// Coordinator request counters.
#[derive(Debug, Clone, Default)]
pub struct RequestStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub blocked_requests: u64,
    pub skipped_requests: u64,
}

/// Reqwest client pool keyed by proxy endpoint.
struct ClientPool {
    total_timeout: Duration,
    connect_timeout: Duration,
    clients: tokio::sync::Mutex<HashMap<Option<String>, reqwest::Client>>,
}

impl ClientPool {
    fn new(total_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            total_timeout,
            connect_timeout,
            clients: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, proxy: Option<&str>) -> Result<reqwest::Client, reqwest::Error> {
        let key = proxy.map(str::to_string);
        let mut guard = self.clients.lock().await;
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(self.total_timeout)
            .connect_timeout(self.connect_timeout);
        if let Some(endpoint) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(endpoint)?);
        }

        let client = builder.build()?;
        guard.insert(key, client.clone());
        Ok(client)
    }
}

/// Per-domain budget for challenge-solver escalation attempts.
struct GuardGate {
    max_bypass_attempts: u32,
    cooldown: Duration,
    keywords: Vec<String>,
    overrides: HashMap<String, GuardDomainOverride>,
    tracker: Mutex<HashMap<String, GuardTracker>>,
}

#[derive(Default)]
struct GuardTracker {
    attempts: u32,
    cooldown_until: Option<Instant>,
}

impl GuardGate {
    fn new(
        max_bypass_attempts: u32,
        cooldown: Duration,
        keywords: Vec<String>,
        overrides: HashMap<String, GuardDomainOverride>,
    ) -> Self {
        Self {
            max_bypass_attempts,
            cooldown,
            keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect(),
            overrides,
            tracker: Mutex::new(HashMap::new()),
        }
    }

    fn override_for(&self, domain: &str) -> Option<&GuardDomainOverride> {
        let normalized = domain.to_lowercase();
        self.overrides
            .get(&normalized)
            .or_else(|| self.overrides.get(normalized.strip_prefix("www.")?))
    }

    /// Decide whether a response warrants the challenge-solver fallback, and
    /// charge the domain's bypass budget when it does.
    fn should_escalate(
        &self,
        content: &str,
        block_type: Option<BlockType>,
        status: u16,
        domain: &str,
    ) -> bool {
        if content.is_empty() {
            return false;
        }

        let override_config = self.override_for(domain);
        let mut triggered = false;

        if let Some(config) = override_config {
            let lowered = content.to_lowercase();
            if config
                .keywords
                .iter()
                .any(|keyword| lowered.contains(&keyword.to_lowercase()))
            {
                triggered = true;
            }
            if config.status_codes.contains(&status) {
                triggered = true;
            }
        }

        if matches!(
            block_type,
            Some(BlockType::BotDetection)
                | Some(BlockType::Captcha)
                | Some(BlockType::RateLimit)
                | Some(BlockType::SilentBlock)
        ) {
            triggered = true;
        }

        if !triggered && looks_like_guard_html(content) {
            triggered = true;
        }

        if !triggered && !self.keywords.is_empty() {
            let lowered = content.to_lowercase();
            if self.keywords.iter().any(|keyword| lowered.contains(keyword)) {
                triggered = true;
            }
        }

        if !triggered
            && matches!(status, 403 | 429)
            && !override_config.map(|c| c.suppress_status_escalation).unwrap_or(false)
        {
            triggered = true;
        }

        if !triggered {
            return false;
        }

        let (max_attempts, cooldown) = match override_config {
            Some(config) => (
                config.max_bypass_attempts.unwrap_or(self.max_bypass_attempts),
                config
                    .cooldown_seconds
                    .map(Duration::from_secs_f64)
                    .unwrap_or(self.cooldown),
            ),
            None => (self.max_bypass_attempts, self.cooldown),
        };
        if max_attempts == 0 {
            return true;
        }

        let mut tracker = self.tracker.lock().expect("guard tracker lock poisoned");
        let entry = tracker.entry(domain.to_string()).or_default();

        if let Some(until) = entry.cooldown_until {
            if Instant::now() < until {
                log::debug!("guard bypass cooldown active for {domain}");
                return false;
            }
            entry.cooldown_until = None;
        }

        if entry.attempts >= max_attempts {
            entry.attempts = 0;
            entry.cooldown_until = Some(Instant::now() + cooldown);
            log::info!(
                "reached max guard bypass attempts for {domain}; cooling down {:.0}s",
                cooldown.as_secs_f64()
            );
            return false;
        }

        entry.attempts += 1;
        true
    }

    fn reset(&self, domain: &str) {
        let mut tracker = self.tracker.lock().expect("guard tracker lock poisoned");
        if let Some(entry) = tracker.get_mut(domain) {
            entry.attempts = 0;
            entry.cooldown_until = None;
        }
    }
}

/// Fluent builder for [`AntibotClient`].
pub struct AntibotClientBuilder {
    config: Config,
    proxies: Vec<String>,
    total_timeout: Duration,
    connect_timeout: Duration,
}

impl AntibotClientBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            proxies: Vec::new(),
            total_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.proxies = config.proxy_infrastructure.proxies.clone();
        self.config = config;
        self
    }

    pub fn with_proxies<I, S>(mut self, proxies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.proxies = proxies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeouts(mut self, total: Duration, connect: Duration) -> Self {
        self.total_timeout = total;
        self.connect_timeout = connect;
        self
    }

    pub fn build(self) -> AntibotClient {
        AntibotClient::with_config(self.config, self.proxies, self.total_timeout, self.connect_timeout)
    }
}

impl Default for AntibotClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Anti-bot acquisition coordinator.
pub struct AntibotClient {
    max_attempts: u32,
    validator: Arc<ContentValidator>,
    user_agents: Arc<UserAgentRotator>,
    robots: Arc<RobotsChecker>,
    rotator: Arc<ProxyRotator>,
    backoff: Arc<BackoffPolicy>,
    captcha: Arc<CaptchaSolver>,
    challenge: Arc<ChallengeSolverClient>,
    sessions: Arc<SessionStore>,
    breaker: Arc<DomainBreaker>,
    guard: GuardGate,
    client_pool: ClientPool,
    stats: Mutex<RequestStats>,
}

impl AntibotClient {
    pub fn builder() -> AntibotClientBuilder {
        AntibotClientBuilder::new()
    }

    fn with_config(
        config: Config,
        proxies: Vec<String>,
        total_timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        config.validate();

        let validator = Arc::new(ContentValidator::new(config.validator_config()));
        let backoff = Arc::new(BackoffPolicy::new(config.backoff_config()));
        let health = Arc::new(HealthChecker::new(config.health_config()));
        let premium = Arc::new(PremiumProxyManager::new(config.premium_config()));
        let rotator = Arc::new(ProxyRotator::new(
            proxies,
            config.rotator_config(),
            health,
            premium,
            Arc::clone(&backoff),
            Arc::clone(&validator),
        ));

        let guard = GuardGate::new(
            config.guard_detection.max_bypass_attempts,
            Duration::from_secs_f64(config.guard_detection.cooldown_seconds),
            config.guard_detection.guard_keywords.clone(),
            config.guard_detection.domain_overrides.clone(),
        );

        Self {
            max_attempts: config.backoff_config().max_attempts.max(1),
            validator,
            user_agents: Arc::new(UserAgentRotator::new(config.user_agent_config())),
            robots: Arc::new(RobotsChecker::new(config.robots_config())),
            rotator,
            backoff,
            captcha: Arc::new(CaptchaSolver::new(config.captcha_config())),
            challenge: Arc::new(ChallengeSolverClient::new(config.challenge_config())),
            sessions: Arc::new(SessionStore::new(config.session_config())),
            breaker: Arc::new(DomainBreaker::new(config.breaker_config())),
            guard,
            client_pool: ClientPool::new(total_timeout, connect_timeout),
            stats: Mutex::new(RequestStats::default()),
        }
    }

    /// Perform a GET acquisition for one URL.
    pub async fn fetch(&self, url: &str) -> FetchResult {
        self.request(Method::GET, url, None).await
    }

    /// Full per-request protocol: circuit check, robots, crawl delay, UA and
    /// proxy selection, then the attempt loop with validation and
    /// escalation.
    pub async fn request(&self, method: Method, url: &str, body: Option<String>) -> FetchResult {
        let parsed = Url::parse(url)?;
        let domain = parsed.host_str().unwrap_or_default().to_lowercase();

        if self.breaker.is_open(&domain) {
            log::warn!("circuit open for {domain}, skipping request to {url}");
            self.bump(|stats| stats.skipped_requests += 1);
            return Ok(FetchOutcome::CircuitOpen { domain });
        }
        self.breaker.before_request(&domain);

        let verdict = self.robots.check(url, None).await;
        if !verdict.allowed {
            log::info!("robots.txt disallows {url} ({})", verdict.reason);
            return Ok(FetchOutcome::RobotsDisallowed {
                url: url.to_string(),
                reason: verdict.reason,
            });
        }
        self.robots.apply_crawl_delay(&domain, None).await;

        let user_agent = self.user_agents.next_mandatory(Some(&domain));

        let mut proxy = if self.rotator.pool_size() == 0 {
            None
        } else {
            match self.rotator.acquire(None).await {
                Some(proxy) => Some(proxy),
                None => {
                    log::error!("no proxy available for {url}");
                    self.bump(|stats| stats.failed_requests += 1);
                    self.breaker.record_failure(&domain);
                    return Ok(FetchOutcome::Failed {
                        url: url.to_string(),
                        attempts: 0,
                        last_error: Some(ErrorKind::ProxyError),
                    });
                }
            }
        };

        let mut attempt: u32 = 0;
        let mut last_error: Option<ErrorKind> = None;
        let mut captcha_token: Option<(CaptchaKind, String)> = None;
        let mut captcha_retry_done = false;

        while attempt < self.max_attempts {
            self.bump(|stats| stats.total_requests += 1);

            let started = Instant::now();
            let send_result = self
                .send_once(&method, &parsed, &domain, &user_agent, proxy.as_deref(), body.as_deref(), captcha_token.as_ref())
                .await;
            let response_time = started.elapsed();

            let (status, final_url, headers, text) = match send_result {
                Ok(parts) => parts,
                Err(err) => {
                    let kind = classify_reqwest_error(&err);
                    log::warn!("request failed (attempt {}): {kind}", attempt + 1);
                    last_error = Some(kind);
                    self.user_agents
                        .observe(&user_agent, false, response_time, Some(&domain));

                    let identifier = proxy.clone().unwrap_or_else(|| domain.clone());
                    if let Some(ref proxy_url) = proxy {
                        self.rotator.mark_failure(proxy_url, kind).await;
                    } else {
                        self.backoff.track_failure(&identifier, kind);
                    }

                    if self.backoff.should_retry(&identifier, attempt, kind) {
                        self.backoff.wait_with_backoff(&identifier, attempt, kind).await;
                        if proxy.is_some() {
                            proxy = self.rotator.acquire(None).await;
                        }
                        attempt += 1;
                        continue;
                    }
                    break;
                }
            };

            // 404 is a terminal outcome, not a signal of site distress.
            if status == 404 {
                log::warn!("HTTP 404 for {url}, skipping");
                return Ok(FetchOutcome::NotFound {
                    url: url.to_string(),
                    status,
                });
            }

            let validation = self.validator.validate(&text, url);

            if validation.is_valid && (200..400).contains(&status) {
                // Guard pages can score well on quality; the heuristic gets
                // a look at the body even on an otherwise valid response.
                if self.challenge.is_enabled()
                    && self.guard.should_escalate(&text, None, status, &domain)
                    && self.challenge.is_available().await
                    && let Some(solved) = self
                        .solve_with_challenge(&method, url, &domain, proxy.as_deref(), body.as_deref())
                        .await
                {
                    self.guard.reset(&domain);
                    self.breaker.record_success(&domain);
                    self.bump(|stats| stats.successful_requests += 1);
                    return Ok(FetchOutcome::Success(FetchResponse {
                        status: solved.status,
                        body: solved.html,
                        headers: solved.headers,
                        proxy,
                        user_agent: solved.user_agent.unwrap_or(user_agent),
                        attempts: attempt + 1,
                        via_challenge_solver: true,
                        final_url: solved.final_url.unwrap_or_else(|| url.to_string()),
                        response_time: solved.response_time.unwrap_or(response_time),
                    }));
                }

                self.record_success(&domain, &user_agent, proxy.as_deref(), &text, url, response_time)
                    .await;
                return Ok(FetchOutcome::Success(FetchResponse {
                    status,
                    body: text,
                    headers,
                    proxy,
                    user_agent,
                    attempts: attempt + 1,
                    via_challenge_solver: false,
                    final_url,
                    response_time,
                }));
            }

            // Invalid content or error status from here on.
            let block_type = validation.block_type;
            let kind = block_type
                .map(|b| b.error_kind())
                .unwrap_or_else(|| ErrorKind::from_status(status));
            last_error = Some(kind);

            if validation.block_detected {
                self.bump(|stats| stats.blocked_requests += 1);
                log::warn!(
                    "invalid content detected for {url}: {}",
                    block_type.map(|b| b.as_str()).unwrap_or("unknown_block")
                );
            }

            // Escalate to the challenge solver when the page looks guarded.
            // The solver check comes first so an absent solver does not
            // drain the domain's bypass budget.
            if self.challenge.is_enabled()
                && self.guard.should_escalate(&text, block_type, status, &domain)
                && self.challenge.is_available().await
            {
                if let Some(solved) = self
                    .solve_with_challenge(&method, url, &domain, proxy.as_deref(), body.as_deref())
                    .await
                {
                    self.guard.reset(&domain);
                    self.breaker.record_success(&domain);
                    self.bump(|stats| stats.successful_requests += 1);
                    return Ok(FetchOutcome::Success(FetchResponse {
                        status: solved.status,
                        body: solved.html,
                        headers: solved.headers,
                        proxy,
                        user_agent: solved.user_agent.unwrap_or(user_agent),
                        attempts: attempt + 1,
                        via_challenge_solver: true,
                        final_url: solved.final_url.unwrap_or_else(|| url.to_string()),
                        response_time: solved.response_time.unwrap_or(response_time),
                    }));
                }
            }

            // A detected CAPTCHA gets one solve-and-retry on the same URL.
            if kind == ErrorKind::Captcha && !captcha_retry_done && self.captcha.is_enabled() {
                if let Some(solution) = self
                    .captcha
                    .detect_and_solve(&text, url, proxy.as_deref(), Some(&user_agent))
                    .await
                {
                    captcha_token = Some((solution.kind, solution.token));
                    captcha_retry_done = true;
                    attempt += 1;
                    continue;
                }
            }

            self.user_agents
                .observe(&user_agent, false, response_time, Some(&domain));

            let identifier = proxy.clone().unwrap_or_else(|| domain.clone());
            if let Some(ref proxy_url) = proxy {
                match kind {
                    ErrorKind::Blocked | ErrorKind::Captcha => {
                        self.rotator.mark_burned(proxy_url, kind.as_str()).await;
                    }
                    _ => self.rotator.mark_failure(proxy_url, kind).await,
                }
            } else {
                self.backoff.track_failure(&identifier, kind);
            }

            if kind == ErrorKind::Authentication {
                // No retry; surface to the caller.
                break;
            }

            // Validator-detected blocks rotate to a fresh proxy and press
            // on; rate limits additionally back off first. Everything else
            // follows the per-kind retry policy.
            let retry = if validation.block_detected {
                if kind == ErrorKind::RateLimit {
                    self.backoff.wait_with_backoff(&identifier, attempt, kind).await;
                }
                true
            } else if self.backoff.should_retry(&identifier, attempt, kind) {
                self.backoff.wait_with_backoff(&identifier, attempt, kind).await;
                true
            } else {
                false
            };

            if retry {
                if proxy.is_some() {
                    proxy = self.rotator.acquire(None).await;
                }
                attempt += 1;
                continue;
            }
            break;
        }

        log::error!("request failed after {} attempts: {url}", attempt.max(1));
        self.bump(|stats| stats.failed_requests += 1);
        self.breaker.record_failure(&domain);
        Ok(FetchOutcome::Failed {
            url: url.to_string(),
            attempts: attempt.max(1),
            last_error,
        })
    }

    /// Bounded fan-out over many URLs. Outputs arrive in input order; there
    /// is no cross-URL ordering guarantee during execution.
    pub async fn fetch_many(
        self: &Arc<Self>,
        urls: &[String],
        concurrency: usize,
        progress: Option<Arc<ProgressEmitter>>,
    ) -> Vec<(String, FetchResult)> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut handles = Vec::with_capacity(urls.len());

        for url in urls {
            let client = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let progress = progress.clone();
            let url = url.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                let result = client.fetch(&url).await;
                if let Some(ref emitter) = progress {
                    let success = matches!(&result, Ok(outcome) if outcome.is_success());
                    emitter.record(success);
                }
                (url, result)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(entry) = handle.await {
                results.push(entry);
            }
        }
        results
    }

    /// Pre-flight domain health probe: one unproxied GET to the domain root.
    /// A status below 500 counts as healthy. Advisory only.
    pub async fn check_domain_health(&self, domain: &str, timeout: Duration) -> bool {
        let test_url = format!("https://{domain}/");
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(err) => {
                log::error!("health check client error for {domain}: {err}");
                return false;
            }
        };

        match client.get(&test_url).send().await {
            Ok(response) => {
                let healthy = response.status().as_u16() < 500;
                log::info!(
                    "health check for {domain}: status={}, healthy={healthy}",
                    response.status()
                );
                healthy
            }
            Err(err) => {
                log::error!("health check failed for {domain}: {err}");
                false
            }
        }
    }

    /// Spawn the background maintenance loops (proxy pool upkeep and session
    /// expiry). The returned handle stops them on shutdown.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> BackgroundTasks {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let mut handles = Vec::new();

        {
            let client = Arc::clone(self);
            let mut shutdown = shutdown_rx.clone();
            let interval = client.rotator.health_check_interval();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            client.rotator.run_maintenance().await;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        {
            let client = Arc::clone(self);
            let mut shutdown = shutdown_rx;
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1800)) => {
                            client.sessions.clear_expired().await;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        BackgroundTasks {
            shutdown: shutdown_tx,
            handles,
        }
    }

    pub fn stats(&self) -> RequestStats {
        self.stats.lock().expect("stats lock poisoned").clone()
    }

    pub fn domain_circuit(&self, domain: &str) -> Option<DomainCircuitState> {
        self.breaker.snapshot(domain)
    }

    pub fn rotator(&self) -> &Arc<ProxyRotator> {
        &self.rotator
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn robots(&self) -> &Arc<RobotsChecker> {
        &self.robots
    }

    pub fn user_agents(&self) -> &Arc<UserAgentRotator> {
        &self.user_agents
    }

    pub fn captcha(&self) -> &Arc<CaptchaSolver> {
        &self.captcha
    }

    pub fn challenge_solver(&self) -> &Arc<ChallengeSolverClient> {
        &self.challenge
    }

    pub fn breaker(&self) -> &Arc<DomainBreaker> {
        &self.breaker
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &Url,
        domain: &str,
        user_agent: &str,
        proxy: Option<&str>,
        body: Option<&str>,
        captcha_token: Option<&(CaptchaKind, String)>,
    ) -> Result<(u16, String, HashMap<String, String>, String), reqwest::Error> {
        let client = self.client_pool.client(proxy).await?;

        let mut cookies = self.sessions.cookies(domain).await;
        if let Some((kind, token)) = captcha_token {
            cookies.insert(captcha_cookie_name(*kind).to_string(), token.clone());
        }
        let sticky_headers = self.sessions.headers(domain).await;

        let mut request = client
            .request(method.clone(), url.clone())
            .header("User-Agent", user_agent);
        for (name, value) in &sticky_headers {
            if !name.eq_ignore_ascii_case("user-agent") && !name.eq_ignore_ascii_case("cookie") {
                request = request.header(name.as_str(), value.as_str());
            }
        }
        if !cookies.is_empty() {
            let cookie_header = cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            request = request.header("Cookie", cookie_header);
        }
        if let Some(body) = body {
            request = request.body(body.to_string());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();

        let mut headers = HashMap::new();
        let mut response_cookies: HashMap<String, String> = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                if name == &http::header::SET_COOKIE {
                    if let Some((cookie_name, cookie_value)) = parse_set_cookie(value) {
                        response_cookies.insert(cookie_name, cookie_value);
                    }
                } else {
                    headers.insert(name.to_string(), value.to_string());
                }
            }
        }

        let body: bytes::Bytes = response.bytes().await?;
        let text = String::from_utf8_lossy(&body).to_string();

        if !response_cookies.is_empty()
            && let Err(err) = self
                .sessions
                .update(domain, SessionUpdate::with_cookies(response_cookies))
                .await
        {
            log::warn!("failed to persist response cookies for {domain}: {err}");
        }

        Ok((status, final_url, headers, text))
    }

    async fn record_success(
        &self,
        domain: &str,
        user_agent: &str,
        proxy: Option<&str>,
        body: &str,
        url: &str,
        response_time: Duration,
    ) {
        if let Some(proxy) = proxy {
            self.rotator.mark_success(proxy, response_time, None).await;
        }
        self.validator.update_baseline(url, body);
        self.user_agents.observe(user_agent, true, response_time, Some(domain));
        self.breaker.record_success(domain);
        self.bump(|stats| stats.successful_requests += 1);

        let mut update = SessionUpdate::default();
        update.user_agent = Some(user_agent.to_string());
        if let Err(err) = self.sessions.update(domain, update).await {
            log::warn!("failed to update session for {domain}: {err}");
        }
    }

    /// Delegate to the external challenge solver, enclosing the attempt in a
    /// named solver session and replaying stored cookies.
    async fn solve_with_challenge(
        &self,
        method: &Method,
        url: &str,
        domain: &str,
        proxy: Option<&str>,
        body: Option<&str>,
    ) -> Option<SolvedResponse> {
        let session_name = self.challenge.ensure_session(domain).await;

        let mut cookies = self.sessions.cookies(domain).await;
        let stored = self.sessions.load(domain).await;
        let mut headers: HashMap<String, String> = stored
            .as_ref()
            .map(|record| record.headers.clone())
            .unwrap_or_default();
        if let Some(record) = stored
            && let Some(ua) = record.user_agent
        {
            headers.entry("User-Agent".to_string()).or_insert(ua);
        }
        cookies.retain(|name, _| !name.is_empty());

        let result = if *method == Method::GET {
            self.challenge
                .solve_get(
                    url,
                    (!headers.is_empty()).then_some(&headers),
                    (!cookies.is_empty()).then_some(&cookies),
                    proxy,
                    session_name.as_deref(),
                )
                .await
        } else {
            self.challenge
                .solve_post(
                    url,
                    body.unwrap_or_default(),
                    (!headers.is_empty()).then_some(&headers),
                    (!cookies.is_empty()).then_some(&cookies),
                    proxy,
                    session_name.as_deref(),
                )
                .await
        };

        match result {
            Ok(solved) => {
                log::info!("challenge solver bypass successful for {url}");
                let mut update = SessionUpdate::with_cookies(solved.cookies.clone());
                update.headers = solved.headers.clone();
                if let Some(ref ua) = solved.user_agent {
                    update.user_agent = Some(ua.clone());
                }
                if let Err(err) = self.sessions.update(domain, update).await {
                    log::warn!("failed to store solved session for {domain}: {err}");
                }
                Some(solved)
            }
            Err(err) => {
                log::warn!("challenge solver failed for {url}: {err}");
                None
            }
        }
    }

    fn bump<F: FnOnce(&mut RequestStats)>(&self, f: F) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

/// Handle over the background maintenance tasks.
pub struct BackgroundTasks {
    shutdown: tokio::sync::watch::Sender<bool>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Signal shutdown and wait for every loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

fn captcha_cookie_name(kind: CaptchaKind) -> &'static str {
    match kind {
        CaptchaKind::RecaptchaV2 | CaptchaKind::RecaptchaV3 => "g-recaptcha-response",
        CaptchaKind::HCaptcha => "h-captcha-response",
        CaptchaKind::Image => "captcha_solution",
    }
}

fn parse_set_cookie(raw: &str) -> Option<(String, String)> {
    let first = raw.split(';').next()?;
    let (name, value) = first.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

fn classify_reqwest_error(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_connect() {
        ErrorKind::Network
    } else {
        ErrorKind::classify(&err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> AntibotClient {
        AntibotClient::builder().build()
    }

    #[tokio::test]
    async fn open_domain_circuit_skips_without_http() {
        let client = test_client();
        for _ in 0..25 {
            client.breaker.record_failure("blocked.example");
        }

        let outcome = client.fetch("https://blocked.example/p/1").await.unwrap();
        assert!(matches!(outcome, FetchOutcome::CircuitOpen { ref domain } if domain == "blocked.example"));
        assert_eq!(client.stats().skipped_requests, 1);
        assert_eq!(client.stats().total_requests, 0);
    }

    #[tokio::test]
    async fn robots_disallow_short_circuits() {
        let client = test_client();
        client
            .robots
            .prime_cache("shop.example", "User-agent: *\nDisallow: /private/\n");

        let outcome = client
            .fetch("https://shop.example/private/catalog")
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::RobotsDisallowed { .. }));
        // Robots denials are not circuit failures.
        assert!(client.domain_circuit("shop.example").map(|c| !c.is_open).unwrap_or(true));
    }

    #[tokio::test]
    async fn invalid_url_is_a_hard_error() {
        let client = test_client();
        assert!(client.fetch("not a url").await.is_err());
    }

    #[test]
    fn guard_gate_triggers_on_guard_html() {
        let gate = GuardGate::new(3, Duration::from_secs(60), Vec::new(), HashMap::new());
        assert!(gate.should_escalate(
            "<title>Just a moment...</title>",
            None,
            200,
            "shop.example"
        ));
    }

    #[test]
    fn guard_gate_triggers_on_block_types_and_status() {
        let gate = GuardGate::new(10, Duration::from_secs(60), Vec::new(), HashMap::new());
        assert!(gate.should_escalate("<html>x</html>", Some(BlockType::BotDetection), 200, "a.example"));
        assert!(gate.should_escalate("<html>x</html>", None, 403, "b.example"));
        assert!(gate.should_escalate("<html>x</html>", None, 429, "c.example"));
        assert!(!gate.should_escalate("<html>regular page</html>", None, 200, "d.example"));
    }

    #[test]
    fn guard_gate_budget_and_cooldown() {
        let gate = GuardGate::new(2, Duration::from_secs(300), Vec::new(), HashMap::new());
        assert!(gate.should_escalate("x", Some(BlockType::BotDetection), 200, "shop.example"));
        assert!(gate.should_escalate("x", Some(BlockType::BotDetection), 200, "shop.example"));
        // Third trigger exhausts the budget and starts the cooldown.
        assert!(!gate.should_escalate("x", Some(BlockType::BotDetection), 200, "shop.example"));
        assert!(!gate.should_escalate("x", Some(BlockType::BotDetection), 200, "shop.example"));
    }

    #[test]
    fn guard_gate_reset_restores_budget() {
        let gate = GuardGate::new(1, Duration::from_secs(300), Vec::new(), HashMap::new());
        assert!(gate.should_escalate("x", Some(BlockType::Captcha), 200, "shop.example"));
        assert!(!gate.should_escalate("x", Some(BlockType::Captcha), 200, "shop.example"));
        gate.reset("shop.example");
        // Cooldown was cleared together with the attempt counter.
        assert!(gate.should_escalate("x", Some(BlockType::Captcha), 200, "shop.example"));
    }

    #[test]
    fn guard_override_suppresses_status_escalation() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "quiet.example".to_string(),
            GuardDomainOverride {
                suppress_status_escalation: true,
                ..GuardDomainOverride::default()
            },
        );
        let gate = GuardGate::new(3, Duration::from_secs(60), Vec::new(), overrides);
        assert!(!gate.should_escalate("<html>x</html>", None, 403, "quiet.example"));
        assert!(gate.should_escalate("<html>x</html>", None, 403, "loud.example"));
    }

    #[test]
    fn guard_override_matches_www_alias() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "shop.example".to_string(),
            GuardDomainOverride {
                keywords: vec!["ddos-guard".to_string()],
                ..GuardDomainOverride::default()
            },
        );
        let gate = GuardGate::new(3, Duration::from_secs(60), Vec::new(), overrides);
        assert!(gate.should_escalate("served by DDoS-Guard", None, 200, "www.shop.example"));
    }

    #[test]
    fn set_cookie_parsing() {
        assert_eq!(
            parse_set_cookie("sid=abc123; Path=/; HttpOnly"),
            Some(("sid".to_string(), "abc123".to_string()))
        );
        assert_eq!(parse_set_cookie("garbage"), None);
    }

    #[test]
    fn captcha_cookie_names() {
        assert_eq!(captcha_cookie_name(CaptchaKind::RecaptchaV2), "g-recaptcha-response");
        assert_eq!(captcha_cookie_name(CaptchaKind::HCaptcha), "h-captcha-response");
        assert_eq!(captcha_cookie_name(CaptchaKind::Image), "captcha_solution");
    }
}
