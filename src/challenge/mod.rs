//! Client for an external browser-based challenge solver (FlareSolverr wire
//! protocol): `POST <endpoint>/v1` with `request.get`/`request.post` and
//! `sessions.create`/`sessions.destroy` commands.
//!
//! Used as the escape hatch when content validation reports a guard page the
//! plain HTTP path cannot get past.

use std::collections::HashMap;
use std::time::Duration;

use once_cell::sync::Lazy;
use rand::Rng;
use regex::RegexBuilder;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::{sleep, Instant};

/// Errors from the solver client.
#[derive(Debug, Error)]
pub enum ChallengeSolverError {
    #[error("challenge solver is disabled")]
    Disabled,
    #[error("challenge solver http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("challenge solver service error: {0}")]
    Service(String),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ChallengeSolverConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub max_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub session_enabled: bool,
    pub session_ttl: Duration,
    /// TTL advertised by the service itself; the effective TTL never
    /// exceeds it.
    pub service_max_session_ttl: Option<Duration>,
    pub health_interval: Duration,
    pub default_headers: HashMap<String, String>,
    pub default_user_agent: Option<String>,
}

impl Default for ChallengeSolverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:8192".to_string(),
            max_timeout: Duration::from_secs(180),
            max_retries: 2,
            retry_delay: Duration::from_secs(2),
            backoff_multiplier: 1.5,
            session_enabled: false,
            session_ttl: Duration::from_secs(900),
            service_max_session_ttl: None,
            health_interval: Duration::from_secs(120),
            default_headers: HashMap::new(),
            default_user_agent: None,
        }
    }
}

impl ChallengeSolverConfig {
    /// Effective session TTL: the configured value clamped by whatever the
    /// service declares as its maximum.
    pub fn effective_session_ttl(&self) -> Duration {
        match self.service_max_session_ttl {
            Some(service_max) => self.session_ttl.min(service_max),
            None => self.session_ttl,
        }
    }
}

/// Normalized solver response.
#[derive(Debug, Clone)]
pub struct SolvedResponse {
    pub status: u16,
    pub html: String,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub user_agent: Option<String>,
    pub final_url: Option<String>,
    pub response_time: Option<Duration>,
    pub session: Option<String>,
}

#[derive(Default)]
struct SolverState {
    session_name: Option<String>,
    session_created: Option<Instant>,
    last_health_check: Option<Instant>,
    last_health: bool,
}

/// Challenge-solver service client with cached health checks and named
/// session reuse.
pub struct ChallengeSolverClient {
    config: ChallengeSolverConfig,
    client: Option<reqwest::Client>,
    state: tokio::sync::Mutex<SolverState>,
}

impl ChallengeSolverClient {
    pub fn new(config: ChallengeSolverConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.max_timeout + Duration::from_secs(10))
            .build()
            .map_err(|err| log::warn!("challenge solver client unavailable: {err}"))
            .ok();
        Self {
            config,
            client,
            state: tokio::sync::Mutex::new(SolverState::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.client.is_some()
    }

    pub fn config(&self) -> &ChallengeSolverConfig {
        &self.config
    }

    /// Uncached health probe against `<endpoint>/health`.
    pub async fn health_check(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let Some(client) = self.client.as_ref() else {
            return false;
        };

        match client
            .get(format!("{}/health", self.config.endpoint.trim_end_matches('/')))
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response
                .json::<Value>()
                .await
                .map(|data| data.get("status").and_then(Value::as_str) == Some("ok"))
                .unwrap_or(false),
            Ok(_) => false,
            Err(err) => {
                log::debug!("challenge solver health check failed: {err}");
                false
            }
        }
    }

    /// Health state cached for the configured interval.
    pub async fn is_available(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }

        {
            let state = self.state.lock().await;
            if let Some(checked) = state.last_health_check
                && checked.elapsed() < self.config.health_interval
                && state.last_health
            {
                return true;
            }
        }

        let available = self.health_check().await;
        let mut state = self.state.lock().await;
        state.last_health_check = Some(Instant::now());
        state.last_health = available;
        if !available {
            log::debug!("challenge solver unavailable; disabling temporarily");
        }
        available
    }

    /// Create a named session on the solver.
    pub async fn create_session(&self, name: Option<&str>) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }
        let session_name = name
            .map(String::from)
            .unwrap_or_else(|| format!("ws-{}", random_hex(12)));

        let payload = json!({
            "cmd": "sessions.create",
            "session": session_name,
            "maxTimeout": self.config.max_timeout.as_millis() as u64,
        });

        match self.post_with_retry(&payload).await {
            Ok(_) => Some(session_name),
            Err(err) => {
                log::warn!("failed to create challenge solver session: {err}");
                None
            }
        }
    }

    pub async fn destroy_session(&self, name: &str) -> bool {
        if !self.is_enabled() || name.is_empty() {
            return false;
        }
        let payload = json!({"cmd": "sessions.destroy", "session": name});
        self.post_with_retry(&payload).await.is_ok()
    }

    /// Reuse the current named session while it is younger than the
    /// effective TTL, creating (and rolling) it as needed.
    pub async fn ensure_session(&self, domain: &str) -> Option<String> {
        if !self.config.session_enabled {
            return None;
        }

        let ttl = self.config.effective_session_ttl();
        {
            let state = self.state.lock().await;
            if let (Some(name), Some(created)) =
                (state.session_name.clone(), state.session_created)
                && created.elapsed() < ttl
            {
                return Some(name);
            }
        }

        let stale = {
            let state = self.state.lock().await;
            state.session_name.clone()
        };
        if let Some(stale) = stale {
            self.destroy_session(&stale).await;
        }

        let name = format!("ws-{}-{}", domain.replace('.', "-"), random_hex(8));
        let created = self.create_session(Some(&name)).await?;

        let mut state = self.state.lock().await;
        state.session_name = Some(created.clone());
        state.session_created = Some(Instant::now());
        Some(created)
    }

    /// Solve a GET request through the service.
    pub async fn solve_get(
        &self,
        url: &str,
        headers: Option<&HashMap<String, String>>,
        cookies: Option<&HashMap<String, String>>,
        proxy: Option<&str>,
        session: Option<&str>,
    ) -> Result<SolvedResponse, ChallengeSolverError> {
        let payload = self.build_payload("request.get", url, headers, cookies, proxy, session, None);
        let data = self.post_with_retry(&payload).await?;
        normalize_solution(&data).ok_or_else(|| {
            ChallengeSolverError::Service("solver returned no solution".to_string())
        })
    }

    /// Solve a POST request through the service.
    #[allow(clippy::too_many_arguments)]
    pub async fn solve_post(
        &self,
        url: &str,
        post_data: &str,
        headers: Option<&HashMap<String, String>>,
        cookies: Option<&HashMap<String, String>>,
        proxy: Option<&str>,
        session: Option<&str>,
    ) -> Result<SolvedResponse, ChallengeSolverError> {
        let payload = self.build_payload(
            "request.post",
            url,
            headers,
            cookies,
            proxy,
            session,
            Some(post_data),
        );
        let data = self.post_with_retry(&payload).await?;
        normalize_solution(&data).ok_or_else(|| {
            ChallengeSolverError::Service("solver returned no solution".to_string())
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_payload(
        &self,
        cmd: &str,
        url: &str,
        headers: Option<&HashMap<String, String>>,
        cookies: Option<&HashMap<String, String>>,
        proxy: Option<&str>,
        session: Option<&str>,
        post_data: Option<&str>,
    ) -> Value {
        let mut payload = json!({
            "cmd": cmd,
            "url": url,
            "maxTimeout": self.config.max_timeout.as_millis() as u64,
        });

        let mut merged_headers = self.config.default_headers.clone();
        if let Some(ua) = &self.config.default_user_agent {
            merged_headers
                .entry("User-Agent".to_string())
                .or_insert_with(|| ua.clone());
        }
        if let Some(headers) = headers {
            merged_headers.extend(headers.clone());
        }
        if !merged_headers.is_empty() {
            payload["headers"] = json!(merged_headers);
        }

        if let Some(cookies) = cookies
            && !cookies.is_empty()
        {
            payload["cookies"] = Value::Array(
                cookies
                    .iter()
                    .map(|(name, value)| json!({"name": name, "value": value}))
                    .collect(),
            );
        }

        if let Some(proxy) = proxy {
            payload["proxy"] = json!({"url": proxy});
        }
        if let Some(session) = session {
            payload["session"] = json!(session);
        }
        if let Some(data) = post_data {
            payload["postData"] = json!(data);
        }

        payload
    }

    /// POST to `/v1` with bounded multiplicative-backoff retries. This retry
    /// policy is independent of the HTTP acquisition backoff.
    async fn post_with_retry(&self, payload: &Value) -> Result<Value, ChallengeSolverError> {
        if !self.is_enabled() {
            return Err(ChallengeSolverError::Disabled);
        }

        let mut attempt = 0u32;
        let mut delay = self.config.retry_delay;
        let mut last_error: Option<ChallengeSolverError> = None;

        while attempt <= self.config.max_retries {
            match self.post_once(payload).await {
                Ok(data) => return Ok(data),
                Err(err) => {
                    log::warn!(
                        "challenge solver request failed (attempt {}/{}): {err}",
                        attempt + 1,
                        self.config.max_retries + 1
                    );
                    last_error = Some(err);
                    if attempt >= self.config.max_retries {
                        break;
                    }
                    sleep(delay).await;
                    delay = Duration::from_secs_f64(
                        delay.as_secs_f64() * self.config.backoff_multiplier,
                    );
                    attempt += 1;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ChallengeSolverError::Service("retries exhausted".to_string())))
    }

    async fn post_once(&self, payload: &Value) -> Result<Value, ChallengeSolverError> {
        let client = self.client.as_ref().ok_or(ChallengeSolverError::Disabled)?;
        let endpoint = format!("{}/v1", self.config.endpoint.trim_end_matches('/'));

        let response = client.post(&endpoint).json(payload).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(ChallengeSolverError::Service(format!(
                "HTTP {status} from solver: {snippet}"
            )));
        }

        let data: Value = response.json().await?;
        if data.get("status").and_then(Value::as_str) != Some("ok") {
            return Err(ChallengeSolverError::Service(data.to_string()));
        }
        Ok(data)
    }
}

/// Extract and normalize the `solution` object from a solver response.
fn normalize_solution(data: &Value) -> Option<SolvedResponse> {
    let solution = data.get("solution")?;

    let mut headers = HashMap::new();
    match solution.get("headers") {
        Some(Value::Object(map)) => {
            for (name, value) in map {
                if let Some(value) = value.as_str() {
                    headers.insert(name.clone(), value.to_string());
                }
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                if let (Some(name), Some(value)) = (
                    item.get("name").and_then(Value::as_str),
                    item.get("value").and_then(Value::as_str),
                ) {
                    headers.insert(name.to_string(), value.to_string());
                }
            }
        }
        _ => {}
    }

    let cookies = solution
        .get("cookies")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|cookie| {
                    let name = cookie.get("name").and_then(Value::as_str)?;
                    let value = cookie.get("value").and_then(Value::as_str)?;
                    Some((name.to_string(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    let response_time = solution
        .get("responseTime")
        .and_then(Value::as_f64)
        .map(|ms| Duration::from_secs_f64(ms / 1000.0));

    Some(SolvedResponse {
        status: solution
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
            .unwrap_or(0),
        html: solution
            .get("response")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        headers,
        cookies,
        user_agent: solution
            .get("userAgent")
            .and_then(Value::as_str)
            .map(String::from),
        final_url: solution.get("url").and_then(Value::as_str).map(String::from),
        response_time,
        session: data.get("session").and_then(Value::as_str).map(String::from),
    })
}

fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| std::char::from_digit(rng.gen_range(0..16u32), 16).unwrap_or('0'))
        .collect()
}

static GUARD_HTML_RE: Lazy<regex::Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r"(checking your browser|just a moment|ddos-guard|cf-browser-verification|attention required|enable javascript and cookies|browser verification)",
    )
    .case_insensitive(true)
    .build()
    .expect("invalid guard html regex")
});

/// Heuristic for guard pages served by bot-challenge intermediaries.
pub fn looks_like_guard_html(content: &str) -> bool {
    !content.is_empty() && GUARD_HTML_RE.is_match(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_ttl_takes_service_minimum() {
        let config = ChallengeSolverConfig {
            session_ttl: Duration::from_secs(900),
            service_max_session_ttl: Some(Duration::from_secs(600)),
            ..ChallengeSolverConfig::default()
        };
        assert_eq!(config.effective_session_ttl(), Duration::from_secs(600));

        let config = ChallengeSolverConfig {
            session_ttl: Duration::from_secs(300),
            service_max_session_ttl: Some(Duration::from_secs(600)),
            ..ChallengeSolverConfig::default()
        };
        assert_eq!(config.effective_session_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn normalizes_solution_with_object_headers() {
        let data = json!({
            "status": "ok",
            "session": "ws-1",
            "solution": {
                "status": 200,
                "response": "<html>real page</html>",
                "headers": {"content-type": "text/html"},
                "cookies": [{"name": "cf_clearance", "value": "tok"}],
                "userAgent": "Mozilla/5.0",
                "url": "https://shop.example/p/1",
                "responseTime": 1500.0,
            }
        });
        let solved = normalize_solution(&data).unwrap();
        assert_eq!(solved.status, 200);
        assert_eq!(solved.html, "<html>real page</html>");
        assert_eq!(solved.cookies.get("cf_clearance").map(String::as_str), Some("tok"));
        assert_eq!(solved.headers.get("content-type").map(String::as_str), Some("text/html"));
        assert_eq!(solved.response_time, Some(Duration::from_millis(1500)));
        assert_eq!(solved.session.as_deref(), Some("ws-1"));
    }

    #[test]
    fn normalizes_solution_with_header_list() {
        let data = json!({
            "status": "ok",
            "solution": {
                "status": 200,
                "response": "",
                "headers": [{"name": "server", "value": "ddos-guard"}],
                "cookies": [],
            }
        });
        let solved = normalize_solution(&data).unwrap();
        assert_eq!(solved.headers.get("server").map(String::as_str), Some("ddos-guard"));
    }

    #[test]
    fn missing_solution_is_none() {
        assert!(normalize_solution(&json!({"status": "ok"})).is_none());
    }

    #[test]
    fn guard_html_heuristic() {
        assert!(looks_like_guard_html(
            "<title>Just a moment...</title>Checking your browser before accessing"
        ));
        assert!(looks_like_guard_html("<h1>DDoS-Guard</h1>"));
        assert!(!looks_like_guard_html("<h1>Merino yarn 50g</h1>"));
        assert!(!looks_like_guard_html(""));
    }

    #[test]
    fn disabled_client_refuses_requests() {
        let client = ChallengeSolverClient::new(ChallengeSolverConfig::default());
        assert!(!client.is_enabled());
    }

    #[tokio::test]
    async fn disabled_client_errors_on_solve() {
        let client = ChallengeSolverClient::new(ChallengeSolverConfig::default());
        let result = client.solve_get("https://x.example", None, None, None, None).await;
        assert!(matches!(result, Err(ChallengeSolverError::Disabled)));
    }

    #[test]
    fn payload_includes_session_proxy_and_cookies() {
        let client = ChallengeSolverClient::new(ChallengeSolverConfig {
            enabled: true,
            ..ChallengeSolverConfig::default()
        });
        let mut cookies = HashMap::new();
        cookies.insert("sid".to_string(), "1".to_string());

        let payload = client.build_payload(
            "request.get",
            "https://shop.example/p/1",
            None,
            Some(&cookies),
            Some("http://u:p@h:1"),
            Some("ws-1"),
            None,
        );
        assert_eq!(payload["cmd"], "request.get");
        assert_eq!(payload["proxy"]["url"], "http://u:p@h:1");
        assert_eq!(payload["session"], "ws-1");
        assert_eq!(payload["cookies"][0]["name"], "sid");
    }

    #[test]
    fn random_hex_has_requested_length() {
        let hex = random_hex(12);
        assert_eq!(hex.len(), 12);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
