use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution_engine::RetryPolicy;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub extraction: ExtractionConfig,
    pub planner: PlannerConfig,
    pub executor: ExecutorConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub escalation: EscalationConfig,
    pub synthesis: SynthesisConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct ExtractionConfig {
    /// Join timeout for each extraction strategy.
    pub strategy_timeout_ms: u64,
    pub model_strategy: bool,
}

#[derive(Clone, Debug)]
pub struct PlannerConfig {
    /// Prior exchanges included in the planning prompt.
    pub recent_turns: usize,
    pub heuristic_fallback: bool,
    /// Budget for the planning completion before the heuristic takes over.
    pub timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub turn_deadline_ms: u64,
    pub call_timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Bucket capacity shared by every call to the same upstream.
    pub burst: u32,
    /// Longest a call waits for a token before failing as rate limited.
    pub wait_ceiling_ms: u64,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
}

#[derive(Clone, Debug)]
pub struct EscalationConfig {
    pub negative_sentiment_threshold: f64,
    pub negative_streak: u32,
    pub low_confidence_threshold: f64,
    pub max_clarifications: u32,
    pub max_consecutive_tool_failures: Option<u32>,
    pub max_turns: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct SynthesisConfig {
    pub mode: SynthesisMode,
    pub timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Ollama,
    /// No model calls; every completion fails as unavailable.
    Offline,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisMode {
    Model,
    Template,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub synthesis_mode: Option<SynthesisMode>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://clerk.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434/v1".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
                max_retries: 1,
            },
            extraction: ExtractionConfig { strategy_timeout_ms: 1_500, model_strategy: true },
            planner: PlannerConfig { recent_turns: 3, heuristic_fallback: true, timeout_ms: 10_000 },
            executor: ExecutorConfig { turn_deadline_ms: 8_000, call_timeout_ms: 3_000 },
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 200,
                max_delay_ms: 2_000,
                jitter_ratio: 0.2,
            },
            rate_limit: RateLimitConfig { burst: 10, wait_ceiling_ms: 2_000 },
            cache: CacheConfig { enabled: true, max_entries: 1_024 },
            escalation: EscalationConfig {
                negative_sentiment_threshold: -0.3,
                negative_streak: 3,
                low_confidence_threshold: 0.4,
                max_clarifications: 2,
                max_consecutive_tool_failures: None,
                max_turns: None,
            },
            synthesis: SynthesisConfig { mode: SynthesisMode::Model, timeout_ms: 10_000 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl ExecutorConfig {
    pub fn turn_deadline(&self) -> Duration {
        Duration::from_millis(self.turn_deadline_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: 2,
            jitter_ratio: self.jitter_ratio,
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            "offline" => Ok(Self::Offline),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|ollama|offline)"
            ))),
        }
    }
}

impl std::str::FromStr for SynthesisMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "model" => Ok(Self::Model),
            "template" => Ok(Self::Template),
            other => Err(ConfigError::Validation(format!(
                "unsupported synthesis mode `{other}` (expected model|template)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("clerk.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(extraction) = patch.extraction {
            if let Some(strategy_timeout_ms) = extraction.strategy_timeout_ms {
                self.extraction.strategy_timeout_ms = strategy_timeout_ms;
            }
            if let Some(model_strategy) = extraction.model_strategy {
                self.extraction.model_strategy = model_strategy;
            }
        }

        if let Some(planner) = patch.planner {
            if let Some(recent_turns) = planner.recent_turns {
                self.planner.recent_turns = recent_turns;
            }
            if let Some(heuristic_fallback) = planner.heuristic_fallback {
                self.planner.heuristic_fallback = heuristic_fallback;
            }
            if let Some(timeout_ms) = planner.timeout_ms {
                self.planner.timeout_ms = timeout_ms;
            }
        }

        if let Some(executor) = patch.executor {
            if let Some(turn_deadline_ms) = executor.turn_deadline_ms {
                self.executor.turn_deadline_ms = turn_deadline_ms;
            }
            if let Some(call_timeout_ms) = executor.call_timeout_ms {
                self.executor.call_timeout_ms = call_timeout_ms;
            }
        }

        if let Some(retry) = patch.retry {
            if let Some(max_attempts) = retry.max_attempts {
                self.retry.max_attempts = max_attempts;
            }
            if let Some(base_delay_ms) = retry.base_delay_ms {
                self.retry.base_delay_ms = base_delay_ms;
            }
            if let Some(max_delay_ms) = retry.max_delay_ms {
                self.retry.max_delay_ms = max_delay_ms;
            }
            if let Some(jitter_ratio) = retry.jitter_ratio {
                self.retry.jitter_ratio = jitter_ratio;
            }
        }

        if let Some(rate_limit) = patch.rate_limit {
            if let Some(burst) = rate_limit.burst {
                self.rate_limit.burst = burst;
            }
            if let Some(wait_ceiling_ms) = rate_limit.wait_ceiling_ms {
                self.rate_limit.wait_ceiling_ms = wait_ceiling_ms;
            }
        }

        if let Some(cache) = patch.cache {
            if let Some(enabled) = cache.enabled {
                self.cache.enabled = enabled;
            }
            if let Some(max_entries) = cache.max_entries {
                self.cache.max_entries = max_entries;
            }
        }

        if let Some(escalation) = patch.escalation {
            if let Some(threshold) = escalation.negative_sentiment_threshold {
                self.escalation.negative_sentiment_threshold = threshold;
            }
            if let Some(negative_streak) = escalation.negative_streak {
                self.escalation.negative_streak = negative_streak;
            }
            if let Some(threshold) = escalation.low_confidence_threshold {
                self.escalation.low_confidence_threshold = threshold;
            }
            if let Some(max_clarifications) = escalation.max_clarifications {
                self.escalation.max_clarifications = max_clarifications;
            }
            if let Some(limit) = escalation.max_consecutive_tool_failures {
                self.escalation.max_consecutive_tool_failures = (limit > 0).then_some(limit);
            }
            if let Some(limit) = escalation.max_turns {
                self.escalation.max_turns = (limit > 0).then_some(limit);
            }
        }

        if let Some(synthesis) = patch.synthesis {
            if let Some(mode) = synthesis.mode {
                self.synthesis.mode = mode;
            }
            if let Some(timeout_ms) = synthesis.timeout_ms {
                self.synthesis.timeout_ms = timeout_ms;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CLERK_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("CLERK_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("CLERK_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CLERK_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("CLERK_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CLERK_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("CLERK_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CLERK_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("CLERK_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("CLERK_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("CLERK_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("CLERK_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("CLERK_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("CLERK_PLANNER_TIMEOUT_MS") {
            self.planner.timeout_ms = parse_u64("CLERK_PLANNER_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("CLERK_EXECUTOR_TURN_DEADLINE_MS") {
            self.executor.turn_deadline_ms = parse_u64("CLERK_EXECUTOR_TURN_DEADLINE_MS", &value)?;
        }
        if let Some(value) = read_env("CLERK_EXECUTOR_CALL_TIMEOUT_MS") {
            self.executor.call_timeout_ms = parse_u64("CLERK_EXECUTOR_CALL_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("CLERK_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_u32("CLERK_RETRY_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("CLERK_RATE_LIMIT_WAIT_CEILING_MS") {
            self.rate_limit.wait_ceiling_ms =
                parse_u64("CLERK_RATE_LIMIT_WAIT_CEILING_MS", &value)?;
        }
        if let Some(value) = read_env("CLERK_SYNTHESIS_MODE") {
            self.synthesis.mode = value.parse()?;
        }
        if let Some(value) = read_env("CLERK_SYNTHESIS_TIMEOUT_MS") {
            self.synthesis.timeout_ms = parse_u64("CLERK_SYNTHESIS_TIMEOUT_MS", &value)?;
        }

        let log_level = read_env("CLERK_LOGGING_LEVEL").or_else(|| read_env("CLERK_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format = read_env("CLERK_LOGGING_FORMAT").or_else(|| read_env("CLERK_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(synthesis_mode) = overrides.synthesis_mode {
            self.synthesis.mode = synthesis_mode;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_runtime(self)?;
        validate_escalation(&self.escalation)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("clerk.toml"), PathBuf::from("config/clerk.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    match llm.provider {
        LlmProvider::OpenAi => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for the openai provider".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for the ollama provider".to_string(),
                ));
            }
        }
        LlmProvider::Offline => {}
    }

    if let Some(base_url) = &llm.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "llm.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_runtime(config: &AppConfig) -> Result<(), ConfigError> {
    if config.extraction.strategy_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "extraction.strategy_timeout_ms must be greater than zero".to_string(),
        ));
    }
    if config.planner.timeout_ms == 0 || config.synthesis.timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "planner.timeout_ms and synthesis.timeout_ms must be greater than zero".to_string(),
        ));
    }

    let executor = &config.executor;
    if executor.call_timeout_ms == 0 || executor.turn_deadline_ms == 0 {
        return Err(ConfigError::Validation(
            "executor.call_timeout_ms and executor.turn_deadline_ms must be greater than zero"
                .to_string(),
        ));
    }
    if executor.call_timeout_ms > executor.turn_deadline_ms {
        return Err(ConfigError::Validation(
            "executor.call_timeout_ms must not exceed executor.turn_deadline_ms".to_string(),
        ));
    }

    let retry = &config.retry;
    if retry.max_attempts == 0 || retry.max_attempts > 10 {
        return Err(ConfigError::Validation(
            "retry.max_attempts must be in range 1..=10".to_string(),
        ));
    }
    if retry.base_delay_ms > retry.max_delay_ms {
        return Err(ConfigError::Validation(
            "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&retry.jitter_ratio) {
        return Err(ConfigError::Validation(
            "retry.jitter_ratio must be in range 0.0..=1.0".to_string(),
        ));
    }

    if config.rate_limit.burst == 0 {
        return Err(ConfigError::Validation(
            "rate_limit.burst must be greater than zero".to_string(),
        ));
    }

    if config.cache.enabled && config.cache.max_entries == 0 {
        return Err(ConfigError::Validation(
            "cache.max_entries must be greater than zero when the cache is enabled".to_string(),
        ));
    }

    Ok(())
}

fn validate_escalation(escalation: &EscalationConfig) -> Result<(), ConfigError> {
    if !(-1.0..=0.0).contains(&escalation.negative_sentiment_threshold) {
        return Err(ConfigError::Validation(
            "escalation.negative_sentiment_threshold must be in range -1.0..=0.0".to_string(),
        ));
    }
    if escalation.negative_streak == 0 {
        return Err(ConfigError::Validation(
            "escalation.negative_streak must be greater than zero".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&escalation.low_confidence_threshold) {
        return Err(ConfigError::Validation(
            "escalation.low_confidence_threshold must be in range 0.0..=1.0".to_string(),
        ));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    extraction: Option<ExtractionPatch>,
    planner: Option<PlannerPatch>,
    executor: Option<ExecutorPatch>,
    retry: Option<RetryPatch>,
    rate_limit: Option<RateLimitPatch>,
    cache: Option<CachePatch>,
    escalation: Option<EscalationPatch>,
    synthesis: Option<SynthesisPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ExtractionPatch {
    strategy_timeout_ms: Option<u64>,
    model_strategy: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct PlannerPatch {
    recent_turns: Option<usize>,
    heuristic_fallback: Option<bool>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ExecutorPatch {
    turn_deadline_ms: Option<u64>,
    call_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RetryPatch {
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    jitter_ratio: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitPatch {
    burst: Option<u32>,
    wait_ceiling_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CachePatch {
    enabled: Option<bool>,
    max_entries: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct EscalationPatch {
    negative_sentiment_threshold: Option<f64>,
    negative_streak: Option<u32>,
    low_confidence_threshold: Option<f64>,
    max_clarifications: Option<u32>,
    max_consecutive_tool_failures: Option<u32>,
    max_turns: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct SynthesisPatch {
    mode: Option<SynthesisMode>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{
        AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat,
        SynthesisMode,
    };

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_validate_without_file_or_env() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.escalation.negative_streak == 3, "default streak should be three turns")?;
        ensure(
            config.escalation.max_turns.is_none(),
            "supplemental turn limit should be off by default",
        )?;
        ensure(config.retry.policy().max_attempts == 3, "retry policy mirrors retry config")?;
        ensure(
            matches!(config.logging.format, LogFormat::Compact),
            "default logging format should be compact",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_CLERK_LLM_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("clerk.toml");
            fs::write(
                &path,
                r#"
[llm]
provider = "open_ai"
api_key = "${TEST_CLERK_LLM_KEY}"
base_url = "https://api.openai.com/v1"
model = "gpt-4o-mini"

[escalation]
max_turns = 20
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.llm.provider == LlmProvider::OpenAi, "provider should come from file")?;
            ensure(
                config.llm.api_key.as_ref().map(|key| key.expose_secret().to_string())
                    == Some("sk-from-env".to_string()),
                "api key should be interpolated from environment",
            )?;
            ensure(config.escalation.max_turns == Some(20), "turn limit should come from file")?;
            Ok(())
        })();

        clear_vars(&["TEST_CLERK_LLM_KEY"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CLERK_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("CLERK_SYNTHESIS_MODE", "template");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("clerk.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[synthesis]
mode = "model"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.synthesis.mode == SynthesisMode::Template,
                "env synthesis mode should win over file",
            )?;
            Ok(())
        })();

        clear_vars(&["CLERK_DATABASE_URL", "CLERK_SYNTHESIS_MODE"]);
        result
    }

    #[test]
    fn openai_without_key_fails_fast() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CLERK_LLM_PROVIDER", "openai");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("llm.api_key")
            );
            ensure(has_message, "validation failure should mention llm.api_key")
        })();

        clear_vars(&["CLERK_LLM_PROVIDER"]);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CLERK_EXECUTOR_CALL_TIMEOUT_MS", "soon");

        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) => {
                ensure(key == "CLERK_EXECUTOR_CALL_TIMEOUT_MS", "error should name the variable")
            }
            _ => Err("expected invalid env override error".to_string()),
        };

        clear_vars(&["CLERK_EXECUTOR_CALL_TIMEOUT_MS"]);
        result
    }

    #[test]
    fn call_timeout_may_not_exceed_turn_deadline() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CLERK_EXECUTOR_CALL_TIMEOUT_MS", "9000");
        env::set_var("CLERK_EXECUTOR_TURN_DEADLINE_MS", "5000");

        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::Validation(message)) => ensure(
                message.contains("executor.call_timeout_ms"),
                "validation should mention executor.call_timeout_ms",
            ),
            _ => Err("expected executor validation failure".to_string()),
        };

        clear_vars(&["CLERK_EXECUTOR_CALL_TIMEOUT_MS", "CLERK_EXECUTOR_TURN_DEADLINE_MS"]);
        result
    }

    #[test]
    fn model_call_timeouts_come_from_env_and_reject_zero() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CLERK_PLANNER_TIMEOUT_MS", "2500");
        env::set_var("CLERK_SYNTHESIS_TIMEOUT_MS", "4000");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            ensure(config.planner.timeout_ms == 2_500, "planner timeout should come from env")?;
            ensure(config.synthesis.timeout_ms == 4_000, "synthesis timeout should come from env")?;

            env::set_var("CLERK_SYNTHESIS_TIMEOUT_MS", "0");
            match AppConfig::load(LoadOptions::default()) {
                Err(ConfigError::Validation(message)) => ensure(
                    message.contains("synthesis.timeout_ms"),
                    "validation should mention synthesis.timeout_ms",
                ),
                _ => Err("expected zero synthesis timeout to be rejected".to_string()),
            }
        })();

        clear_vars(&["CLERK_PLANNER_TIMEOUT_MS", "CLERK_SYNTHESIS_TIMEOUT_MS"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CLERK_LLM_PROVIDER", "openai");
        env::set_var("CLERK_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")
        })();

        clear_vars(&["CLERK_LLM_PROVIDER", "CLERK_LLM_API_KEY"]);
        result
    }
}
