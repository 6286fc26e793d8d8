use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use clerk_core::config::{resolve_config_path, AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run(options: &LoadOptions) -> String {
    let config = match AppConfig::load(options.clone()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = resolve_config_path(options.config_path.as_deref());
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines =
        vec!["effective config (source precedence: override > env > file > default):".to_string()];
    for (key_path, value, env_keys) in effective_values(&config) {
        let source =
            field_source(key_path, env_keys, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key_path, &value, source));
    }

    lines.join("\n")
}

fn effective_values(config: &AppConfig) -> Vec<(&'static str, String, &'static [&'static str])> {
    let optional = |value: Option<u32>| value.map_or_else(|| "<off>".to_string(), |v| v.to_string());

    vec![
        ("database.url", config.database.url.clone(), &["CLERK_DATABASE_URL"]),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["CLERK_DATABASE_MAX_CONNECTIONS"],
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["CLERK_DATABASE_TIMEOUT_SECS"],
        ),
        ("llm.provider", format!("{:?}", config.llm.provider), &["CLERK_LLM_PROVIDER"]),
        ("llm.model", config.llm.model.clone(), &["CLERK_LLM_MODEL"]),
        (
            "llm.base_url",
            config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
            &["CLERK_LLM_BASE_URL"],
        ),
        (
            "llm.api_key",
            config
                .llm
                .api_key
                .as_ref()
                .map_or_else(|| "<unset>".to_string(), |key| redact_token(key.expose_secret())),
            &["CLERK_LLM_API_KEY"],
        ),
        ("llm.timeout_secs", config.llm.timeout_secs.to_string(), &["CLERK_LLM_TIMEOUT_SECS"]),
        ("llm.max_retries", config.llm.max_retries.to_string(), &["CLERK_LLM_MAX_RETRIES"]),
        (
            "extraction.strategy_timeout_ms",
            config.extraction.strategy_timeout_ms.to_string(),
            &[],
        ),
        ("extraction.model_strategy", config.extraction.model_strategy.to_string(), &[]),
        ("planner.recent_turns", config.planner.recent_turns.to_string(), &[]),
        ("planner.heuristic_fallback", config.planner.heuristic_fallback.to_string(), &[]),
        ("planner.timeout_ms", config.planner.timeout_ms.to_string(), &["CLERK_PLANNER_TIMEOUT_MS"]),
        (
            "executor.turn_deadline_ms",
            config.executor.turn_deadline_ms.to_string(),
            &["CLERK_EXECUTOR_TURN_DEADLINE_MS"],
        ),
        (
            "executor.call_timeout_ms",
            config.executor.call_timeout_ms.to_string(),
            &["CLERK_EXECUTOR_CALL_TIMEOUT_MS"],
        ),
        ("retry.max_attempts", config.retry.max_attempts.to_string(), &["CLERK_RETRY_MAX_ATTEMPTS"]),
        ("retry.base_delay_ms", config.retry.base_delay_ms.to_string(), &[]),
        ("retry.max_delay_ms", config.retry.max_delay_ms.to_string(), &[]),
        ("retry.jitter_ratio", config.retry.jitter_ratio.to_string(), &[]),
        ("rate_limit.burst", config.rate_limit.burst.to_string(), &[]),
        (
            "rate_limit.wait_ceiling_ms",
            config.rate_limit.wait_ceiling_ms.to_string(),
            &["CLERK_RATE_LIMIT_WAIT_CEILING_MS"],
        ),
        ("cache.enabled", config.cache.enabled.to_string(), &[]),
        ("cache.max_entries", config.cache.max_entries.to_string(), &[]),
        (
            "escalation.negative_sentiment_threshold",
            config.escalation.negative_sentiment_threshold.to_string(),
            &[],
        ),
        ("escalation.negative_streak", config.escalation.negative_streak.to_string(), &[]),
        (
            "escalation.low_confidence_threshold",
            config.escalation.low_confidence_threshold.to_string(),
            &[],
        ),
        ("escalation.max_clarifications", config.escalation.max_clarifications.to_string(), &[]),
        (
            "escalation.max_consecutive_tool_failures",
            optional(config.escalation.max_consecutive_tool_failures),
            &[],
        ),
        ("escalation.max_turns", optional(config.escalation.max_turns), &[]),
        ("synthesis.mode", format!("{:?}", config.synthesis.mode), &["CLERK_SYNTHESIS_MODE"]),
        (
            "synthesis.timeout_ms",
            config.synthesis.timeout_ms.to_string(),
            &["CLERK_SYNTHESIS_TIMEOUT_MS"],
        ),
        (
            "logging.level",
            config.logging.level.clone(),
            &["CLERK_LOGGING_LEVEL", "CLERK_LOG_LEVEL"],
        ),
        (
            "logging.format",
            format!("{:?}", config.logging.format),
            &["CLERK_LOGGING_FORMAT", "CLERK_LOG_FORMAT"],
        ),
    ]
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("config file"));
            return format!("file ({})", file_path.display());
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps a recognizable key prefix such as `sk-`; everything else is hidden.
fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}
