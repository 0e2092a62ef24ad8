//! Content validation for detecting blocked responses and silent blocks.
//!
//! Classifies response bodies as valid, blocked (CAPTCHA, rate limit, bot
//! detection, HTTP error page), or silently suppressed, and produces a
//! quality score usable as a routing signal by the coordinator.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use scraper::{Html, Selector};
use url::Url;

use crate::backoff::ErrorKind;

const BASELINE_HISTORY_LIMIT: usize = 10;

/// Block categories surfaced by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Captcha,
    RateLimit,
    BotDetection,
    HttpError,
    SilentBlock,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Captcha => "captcha",
            BlockType::RateLimit => "rate_limit",
            BlockType::BotDetection => "bot_detection",
            BlockType::HttpError => "http_error",
            BlockType::SilentBlock => "silent_block",
        }
    }

    /// Map the block category onto the retry error taxonomy.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            BlockType::Captcha => ErrorKind::Captcha,
            BlockType::RateLimit => ErrorKind::RateLimit,
            BlockType::BotDetection => ErrorKind::Blocked,
            BlockType::HttpError => ErrorKind::Http5xx,
            BlockType::SilentBlock => ErrorKind::SilentBlock,
        }
    }
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of validating one response body.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub confidence_score: f32,
    pub quality_score: f32,
    pub block_detected: bool,
    pub block_type: Option<BlockType>,
    pub indicators: Vec<String>,
    pub missing_elements: Vec<String>,
    pub content_length: usize,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn passing(content_length: usize) -> Self {
        Self {
            is_valid: true,
            confidence_score: 1.0,
            quality_score: 1.0,
            block_detected: false,
            block_type: None,
            indicators: Vec::new(),
            missing_elements: Vec::new(),
            content_length,
            warnings: Vec::new(),
        }
    }
}

/// Validator configuration.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub min_content_length: usize,
    pub quality_threshold: f32,
    pub required_elements: Vec<String>,
    pub silent_detection_enabled: bool,
    pub min_content_ratio: f32,
    pub check_element_count: bool,
    pub compare_with_previous: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_content_length: 1000,
            quality_threshold: 0.7,
            required_elements: vec!["title".to_string(), "h1".to_string()],
            silent_detection_enabled: true,
            min_content_ratio: 0.3,
            check_element_count: true,
            compare_with_previous: true,
        }
    }
}

#[derive(Debug, Default)]
struct ElementBaseline {
    history: VecDeque<usize>,
    avg: f64,
}

impl ElementBaseline {
    fn record(&mut self, count: usize) {
        if self.history.len() == BASELINE_HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(count);
        self.avg = self.history.iter().sum::<usize>() as f64 / self.history.len() as f64;
    }
}

/// Content validator with per-domain element-count baselines.
pub struct ContentValidator {
    config: ValidatorConfig,
    baselines: RwLock<HashMap<String, ElementBaseline>>,
}

impl ContentValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self {
            config,
            baselines: RwLock::new(HashMap::new()),
        }
    }

    /// Validate a response body against block patterns and quality metrics.
    pub fn validate(&self, content: &str, url: &str) -> ValidationResult {
        self.validate_with_previous(content, url, None)
    }

    /// Same as [`validate`](Self::validate) with a prior body for the
    /// similarity signal of silent-block detection.
    pub fn validate_with_previous(
        &self,
        content: &str,
        url: &str,
        previous: Option<&str>,
    ) -> ValidationResult {
        let mut result = ValidationResult::passing(content.len());

        if content.trim().len() < 10 {
            result.is_valid = false;
            result.confidence_score = 0.0;
            result.quality_score = 0.0;
            result.warnings.push("empty or minimal content".to_string());
            return result;
        }

        let document = Html::parse_document(content);

        let block = detect_block_patterns(content);
        if block.blocked {
            result.block_detected = true;
            result.block_type = block.block_type;
            result.indicators = block.indicators;
            result.is_valid = false;
            result.confidence_score = block.confidence;
        }

        if !result.block_detected && is_captcha_page(content, &document) {
            result.block_detected = true;
            result.block_type = Some(BlockType::Captcha);
            result.is_valid = false;
            result.confidence_score = 0.95;
            result.warnings.push("CAPTCHA challenge detected".to_string());
        }

        result.quality_score = quality_score(content, &document, &self.config);
        if result.quality_score < self.config.quality_threshold {
            result
                .warnings
                .push(format!("low quality score: {:.2}", result.quality_score));
        }

        let missing = missing_required_elements(&document, &self.config.required_elements);
        if !missing.is_empty() {
            result.quality_score *= 0.8;
            result
                .warnings
                .push(format!("missing required elements: {}", missing.join(", ")));
            result.missing_elements = missing;
        }

        if !result.block_detected
            && self.config.silent_detection_enabled
            && self.detect_silent_block(content, &document, url, previous)
        {
            result.block_detected = true;
            result.block_type = Some(BlockType::SilentBlock);
            result.is_valid = false;
            result.confidence_score = 0.7;
            result.warnings.push("silent block detected".to_string());
        }

        if result.block_detected {
            result.is_valid = false;
        } else if result.quality_score < 0.5 {
            result.is_valid = false;
            result.confidence_score = result.quality_score;
        } else if result.quality_score < self.config.quality_threshold {
            // Borderline quality stays valid with reduced confidence.
            result.confidence_score = result.quality_score;
        }

        log::debug!(
            "content validation for {url}: valid={}, quality={:.2}",
            result.is_valid,
            result.quality_score
        );
        result
    }

    /// Record a known-good body so future silent-block checks have a domain
    /// element-count baseline.
    pub fn update_baseline(&self, url: &str, content: &str) {
        let Some(domain) = domain_of(url) else {
            return;
        };
        let document = Html::parse_document(content);
        let count = element_count(&document);
        if let Ok(mut guard) = self.baselines.write() {
            guard.entry(domain).or_default().record(count);
        }
    }

    /// Silent-block heuristic: at least two weak signals, or an outright
    /// error structure in the page.
    fn detect_silent_block(
        &self,
        content: &str,
        document: &Html,
        url: &str,
        previous: Option<&str>,
    ) -> bool {
        let mut signals = 0u32;
        let stripped = content.trim();
        let length_threshold = (self.config.min_content_length as f32
            * self.config.min_content_ratio)
            .max(200.0) as usize;

        if stripped.len() < length_threshold {
            signals += 1;
        }

        if self.config.check_element_count
            && let Some(domain) = domain_of(url)
        {
            let count = element_count(document);
            let mut guard = match self.baselines.write() {
                Ok(guard) => guard,
                Err(_) => return false,
            };
            let known_avg = guard
                .get(&domain)
                .filter(|baseline| !baseline.history.is_empty())
                .map(|baseline| baseline.avg);
            match known_avg {
                Some(avg) => {
                    if (count as f64) < avg * f64::from(self.config.min_content_ratio) {
                        signals += 1;
                    }
                }
                None => {
                    guard.entry(domain).or_default().record(count);
                }
            }
        }

        if self.config.compare_with_previous
            && let Some(prev) = previous
            && content_similarity(content, prev) > 0.95
        {
            signals += 1;
        }

        if !content.to_lowercase().contains("<body") {
            return true;
        }

        if has_error_structure(document) {
            return true;
        }

        let text = document_text(document);
        let words: Vec<&str> = text.split_whitespace().collect();

        if words.len() < 20 {
            signals += 1;
        }

        if !words.is_empty() {
            let mut frequency: HashMap<String, usize> = HashMap::new();
            for word in &words {
                *frequency.entry(word.to_lowercase()).or_insert(0) += 1;
            }
            let most_common = frequency.values().copied().max().unwrap_or(0);
            if most_common as f64 / words.len() as f64 > 0.35 {
                signals += 1;
            }
        }

        let raw_words = content.split_whitespace().count().max(1);
        if (words.len() as f64 / raw_words as f64) < 0.2 {
            signals += 1;
        }

        if PLACEHOLDER_RE.is_match(&text) {
            signals += 1;
        }

        signals >= 2
    }
}

impl Default for ContentValidator {
    fn default() -> Self {
        Self::new(ValidatorConfig::default())
    }
}

struct BlockScan {
    blocked: bool,
    block_type: Option<BlockType>,
    indicators: Vec<String>,
    confidence: f32,
}

/// Scan for block markers. The first matching category wins the type label
/// while confidence takes the strongest signal seen.
fn detect_block_patterns(content: &str) -> BlockScan {
    let lowered = content.to_lowercase();
    let mut indicators = Vec::new();
    let mut block_type = None;
    let mut confidence: f32 = 0.0;

    for marker in BLOCK_INDICATORS {
        if lowered.contains(marker) {
            indicators.push((*marker).to_string());
        }
    }

    if let Some(m) = CAPTCHA_RE.find(&lowered) {
        block_type = Some(BlockType::Captcha);
        indicators.push(m.as_str().to_string());
        confidence = 0.95;
    }

    if let Some(m) = RATE_LIMIT_RE.find(&lowered) {
        block_type.get_or_insert(BlockType::RateLimit);
        indicators.push(m.as_str().to_string());
        confidence = confidence.max(0.9);
    }

    if let Some(m) = BOT_DETECTION_RE.find(&lowered) {
        block_type.get_or_insert(BlockType::BotDetection);
        indicators.push(m.as_str().to_string());
        confidence = confidence.max(0.85);
    }

    for marker in HTTP_ERROR_INDICATORS {
        if lowered.contains(marker) {
            block_type.get_or_insert(BlockType::HttpError);
            indicators.push((*marker).to_string());
            confidence = confidence.max(0.8);
        }
    }

    if !indicators.is_empty() && confidence == 0.0 {
        confidence = (indicators.len() as f32 * 0.2).min(0.8);
    }

    BlockScan {
        blocked: !indicators.is_empty(),
        block_type,
        indicators,
        confidence,
    }
}

/// CAPTCHA detection over markers, service names, and DOM containers.
fn is_captcha_page(content: &str, document: &Html) -> bool {
    let lowered = content.to_lowercase();

    if CAPTCHA_RE.is_match(&lowered) {
        return true;
    }

    for service in ["recaptcha", "hcaptcha", "funcaptcha", "geetest", "turnstile"] {
        if lowered.contains(service) {
            return true;
        }
    }

    for selector in [
        "div.g-recaptcha",
        "div.h-captcha",
        "input[name*=captcha]",
        "img[src*=captcha]",
    ] {
        if document.select(&sel(selector)).next().is_some() {
            return true;
        }
    }

    false
}

fn missing_required_elements(document: &Html, required: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|name| {
            Selector::parse(name)
                .map(|s| document.select(&s).next().is_none())
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

fn has_error_structure(document: &Html) -> bool {
    for el in document.select(&sel("div")) {
        if let Some(class) = el.value().attr("class")
            && ERROR_CLASS_RE.is_match(class)
        {
            return true;
        }
    }
    for selector in ["h1", "title"] {
        for el in document.select(&sel(selector)) {
            let text: String = el.text().collect();
            if ERROR_TEXT_RE.is_match(&text) {
                return true;
            }
        }
    }
    false
}

/// Quality score from length, word count, structure, text density, element
/// diversity, with navigation/main-content bonuses and error penalties.
fn quality_score(content: &str, document: &Html, config: &ValidatorConfig) -> f32 {
    let text = document_text(document);
    let word_count = text.split_whitespace().count();

    let effective_min_length = ((config.min_content_length as f32) * 0.3).max(300.0);
    let word_baseline = (effective_min_length / 4.0).max(80.0);

    let length_score = (content.len() as f32 / effective_min_length).min(1.0);
    let word_score = (word_count as f32 / word_baseline).min(1.0);
    let structure = structure_score(document);

    let text_ratio = if content.is_empty() {
        0.0
    } else {
        text.len() as f32 / content.len() as f32
    };

    let diversity = element_diversity(document);

    let mut score = length_score * 0.25
        + word_score * 0.20
        + structure * 0.25
        + (text_ratio * 2.0).min(1.0) * 0.15
        + (diversity * 2.0).min(1.0) * 0.10;

    if document.select(&sel("nav, header, menu")).next().is_some() {
        score += 0.025;
    }
    if document.select(&sel("main, article, section")).next().is_some() {
        score += 0.025;
    }

    let lowered = content.to_lowercase();
    let error_hits = ERROR_INDICATORS
        .iter()
        .filter(|marker| lowered.contains(**marker))
        .count();
    let penalty = (error_hits as f32 * 0.05).min(0.2);

    (score - penalty).clamp(0.0, 1.0)
}

fn structure_score(document: &Html) -> f32 {
    let basic = ["html", "head", "body", "title"];
    let basic_hits = basic
        .iter()
        .filter(|name| document.select(&sel(name)).next().is_some())
        .count();
    let basic_score = basic_hits as f32 / basic.len() as f32;

    let semantic = ["header", "nav", "main", "article", "section", "aside", "footer"];
    let semantic_hits = semantic
        .iter()
        .filter(|name| document.select(&sel(name)).next().is_some())
        .count();
    let semantic_score = (semantic_hits as f32 / 3.0).min(1.0);

    let content_tags = ["h1", "h2", "h3", "p", "div", "span"];
    let content_count: usize = content_tags
        .iter()
        .map(|name| document.select(&sel(name)).count())
        .sum();
    let content_score = (content_count as f32 / 10.0).min(1.0);

    basic_score * 0.3 + semantic_score * 0.4 + content_score * 0.3
}

fn element_count(document: &Html) -> usize {
    document.select(&sel("*")).count()
}

fn element_diversity(document: &Html) -> f32 {
    let mut total = 0usize;
    let mut unique = std::collections::HashSet::new();
    for el in document.select(&sel("*")) {
        total += 1;
        unique.insert(el.value().name().to_string());
    }
    if total == 0 {
        return 0.0;
    }
    unique.len() as f32 / total as f32
}

fn document_text(document: &Html) -> String {
    document
        .root_element()
        .text()
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn domain_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}

/// Dice coefficient over line multisets; cheap stand-in for sequence
/// similarity that still flags near-identical bodies.
fn content_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    let mut len_a = 0usize;
    let mut len_b = 0usize;
    for line in a.lines() {
        counts.entry(line).or_default().0 += 1;
        len_a += 1;
    }
    for line in b.lines() {
        counts.entry(line).or_default().1 += 1;
        len_b += 1;
    }
    if len_a + len_b == 0 {
        return 0.0;
    }
    let matches: usize = counts.values().map(|(x, y)| *x.min(y)).sum();
    2.0 * matches as f64 / (len_a + len_b) as f64
}

fn sel(selector: &str) -> Selector {
    Selector::parse(selector).expect("invalid static selector")
}

fn build_regex(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("invalid validator regex")
}

const BLOCK_INDICATORS: &[&str] = &[
    "access denied",
    "ddos protection",
    "security check",
    "заблокирован",
    "доступ запрещен",
];

const HTTP_ERROR_INDICATORS: &[&str] = &[
    "403 forbidden",
    "429 too many requests",
    "503 service unavailable",
    "error 403",
    "error 429",
    "error 503",
];

const ERROR_INDICATORS: &[&str] = &[
    "error",
    "exception",
    "failed",
    "not found",
    "unavailable",
    "ошибка",
    "не найдено",
    "недоступно",
];

static CAPTCHA_RE: Lazy<Regex> = Lazy::new(|| {
    build_regex(
        r"(captcha|recaptcha|hcaptcha|prove you are human|robot verification|security verification|verify.{0,20}human|solve.{0,20}challenge|капча)",
    )
});

static RATE_LIMIT_RE: Lazy<Regex> = Lazy::new(|| {
    build_regex(
        r"(rate limit|too many requests|request limit|throttled|slow down|try again later|превышен лимит|слишком много запросов|\b429\b)",
    )
});

static BOT_DETECTION_RE: Lazy<Regex> = Lazy::new(|| {
    build_regex(
        r"(bot detected|automated traffic|suspicious activity|bot.{0,10}block|anti.{0,5}bot|robot.{0,10}detect|access denied|banned your access|обнаружен бот)",
    )
});

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    build_regex(
        r"(page not found|temporarily unavailable|maintenance|coming soon|under construction|please try again|service unavailable)",
    )
});

static ERROR_CLASS_RE: Lazy<Regex> = Lazy::new(|| build_regex(r"(error|404|not.?found)"));

static ERROR_TEXT_RE: Lazy<Regex> = Lazy::new(|| build_regex(r"(error|404|not found|blocked)"));

#[cfg(test)]
mod tests {
    use super::*;

    fn product_page() -> String {
        let items: String = (0..40)
            .map(|i| format!("<p>Merino wool yarn color {i} in stock for knitting</p>"))
            .collect();
        format!(
            "<html><head><title>Yarn Shop</title></head><body>\
             <nav><a href=\"/\">Home</a></nav><main><h1>Merino Yarn</h1>{items}</main>\
             <footer>Contact us</footer></body></html>"
        )
    }

    #[test]
    fn empty_body_is_invalid_without_block() {
        let validator = ContentValidator::default();
        let result = validator.validate("", "https://shop.example/p/1");
        assert!(!result.is_valid);
        assert_eq!(result.confidence_score, 0.0);
        assert!(!result.block_detected);
    }

    #[test]
    fn accepts_real_product_page() {
        let validator = ContentValidator::default();
        let result = validator.validate(&product_page(), "https://shop.example/p/1");
        assert!(result.is_valid, "quality={}", result.quality_score);
        assert!(!result.block_detected);
        assert!(result.quality_score >= 0.5);
    }

    #[test]
    fn detects_captcha_markers() {
        let validator = ContentValidator::default();
        let body = "<html><body><div class=\"g-recaptcha\" data-sitekey=\"k\"></div>\
                    Please solve the captcha to continue</body></html>";
        let result = validator.validate(body, "https://shop.example/p/1");
        assert!(result.block_detected);
        assert_eq!(result.block_type, Some(BlockType::Captcha));
        assert!(result.confidence_score >= 0.9);
    }

    #[test]
    fn detects_rate_limit_markers() {
        let validator = ContentValidator::default();
        let body = "<html><body><h2>429</h2>Too many requests, slow down</body></html>";
        let result = validator.validate(body, "https://shop.example/p/1");
        assert!(result.block_detected);
        assert_eq!(result.block_type, Some(BlockType::RateLimit));
        assert!(result.confidence_score >= 0.9);
    }

    #[test]
    fn detects_bot_detection_markers() {
        let validator = ContentValidator::default();
        let body = "<html><body>Automated traffic from your network was detected</body></html>";
        let result = validator.validate(body, "https://shop.example/p/1");
        assert!(result.block_detected);
        assert_eq!(result.block_type, Some(BlockType::BotDetection));
    }

    #[test]
    fn captcha_wins_over_rate_limit_label() {
        let validator = ContentValidator::default();
        let body = "<html><body>captcha required because of too many requests</body></html>";
        let result = validator.validate(body, "https://shop.example/p/1");
        assert_eq!(result.block_type, Some(BlockType::Captcha));
        assert!(result.confidence_score >= 0.95);
    }

    #[test]
    fn silent_block_on_shrunken_body() {
        let validator = ContentValidator::default();
        // Establish a baseline from a healthy page first.
        validator.update_baseline("https://shop.example/p/1", &product_page());

        let stub = "<html><body><p>maintenance</p></body></html>";
        let result = validator.validate(stub, "https://shop.example/p/2");
        assert!(result.block_detected);
        assert_eq!(result.block_type, Some(BlockType::SilentBlock));
    }

    #[test]
    fn similarity_flags_identical_bodies() {
        assert!(content_similarity("a\nb\nc", "a\nb\nc") > 0.99);
        assert!(content_similarity("a\nb\nc", "x\ny\nz") < 0.1);
    }

    #[test]
    fn baseline_window_is_bounded() {
        let validator = ContentValidator::default();
        for _ in 0..25 {
            validator.update_baseline("https://shop.example/", &product_page());
        }
        let guard = validator.baselines.read().unwrap();
        let baseline = guard.get("shop.example").unwrap();
        assert_eq!(baseline.history.len(), BASELINE_HISTORY_LIMIT);
    }

    #[test]
    fn missing_required_elements_reduce_quality() {
        let validator = ContentValidator::default();
        let body = format!(
            "<html><head></head><body>{}</body></html>",
            "<p>plain paragraph body text for scoring with many words here</p>".repeat(30)
        );
        let result = validator.validate(&body, "https://shop.example/p/1");
        assert!(result.missing_elements.contains(&"title".to_string()));
        assert!(result.missing_elements.contains(&"h1".to_string()));
    }
}
