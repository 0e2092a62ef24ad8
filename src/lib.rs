//! # stealthfetch
//!
//! Resilient HTTP acquisition for bot-protected storefronts.
//!
//! The crate wires the per-request protocol (robots compliance, mandatory
//! user-agent rotation, health-scored proxy selection, content validation,
//! CAPTCHA solving, and a browser-based challenge-solver fallback) behind a
//! single coordinator, and ships the crash-safe incremental exporter used to
//! persist product payloads.
//!
//! ## Example
//!
//! ```no_run
//! use stealthfetch::{AntibotClient, FetchOutcome};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = AntibotClient::builder().build();
//!     match client.fetch("https://shop.example/product/42").await? {
//!         FetchOutcome::Success(response) => println!("{}", response.body),
//!         other => eprintln!("acquisition failed: {other:?}"),
//!     }
//!     Ok(())
//! }
//! ```

mod client;

pub mod backoff;
pub mod breaker;
pub mod captcha;
pub mod challenge;
pub mod config;
pub mod export;
pub mod proxy;
pub mod robots;
pub mod session;
pub mod user_agents;
pub mod validation;

pub use crate::client::{
    AntibotClient,
    AntibotClientBuilder,
    BackgroundTasks,
    FetchError,
    FetchOutcome,
    FetchResponse,
    FetchResult,
    RequestStats,
};

pub use crate::backoff::{
    BackoffConfig,
    BackoffPolicy,
    CircuitState,
    ErrorKind,
    GlobalRetryStats,
    RetryState,
    RetryStateSnapshot,
    RetryStrategy,
};

pub use crate::breaker::{DomainBreaker, DomainBreakerConfig, DomainCircuitState};

pub use crate::captcha::{
    detect_captcha,
    CaptchaDetection,
    CaptchaKind,
    CaptchaSolution,
    CaptchaSolver,
    CaptchaSolverConfig,
    SolveStats,
};

pub use crate::challenge::{
    looks_like_guard_html,
    ChallengeSolverClient,
    ChallengeSolverConfig,
    ChallengeSolverError,
    SolvedResponse,
};

pub use crate::config::{Config, ConfigError, GuardDomainOverride};

pub use crate::export::{
    error_product,
    load_export_products,
    merge_products,
    prime_writer_from_export,
    write_product_exports,
    ExportArtifacts,
    ExportError,
    IncrementalWriter,
    ProcessLock,
    ProgressEmitter,
};

pub use crate::proxy::{
    AutoscaleRecommendation,
    AutoscaleStatus,
    HealthChecker,
    HealthCheckerConfig,
    HealthReport,
    PremiumProxyConfig,
    PremiumProxyManager,
    ProxyDescriptor,
    ProxyProtocol,
    ProxyRequirements,
    ProxyRotator,
    ProxyStats,
    RotatorConfig,
    RotatorStats,
};

pub use crate::robots::{RobotsChecker, RobotsConfig, RobotsRules, RobotsStats, RobotsVerdict};

pub use crate::session::{SessionConfig, SessionRecord, SessionStore, SessionUpdate};

pub use crate::user_agents::{
    validate_user_agent,
    AgentKind,
    RotationStrategy,
    UserAgentConfig,
    UserAgentRotator,
    UserAgentStats,
};

pub use crate::validation::{BlockType, ContentValidator, ValidationResult, ValidatorConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
