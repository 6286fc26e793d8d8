use std::env;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use clerk_cli::commands::{chat, config, doctor, migrate, state};
use clerk_core::config::LoadOptions;
use serde_json::Value;
use tempfile::TempDir;

#[test]
fn migrate_returns_success_with_valid_env() {
    let dir = TempDir::new().expect("tempdir");
    with_env(&offline_env(dir.path()), || {
        let result = migrate::run(&LoadOptions::default());
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["message"], "applied 1 pending migration(s)");

        let again = parse_payload(&migrate::run(&LoadOptions::default()).output);
        assert_eq!(again["message"], "schema is up to date");
    });
}

#[test]
fn migrate_returns_config_failure_for_invalid_env() {
    let dir = TempDir::new().expect("tempdir");
    let mut vars = offline_env(dir.path());
    vars.push(("CLERK_SYNTHESIS_MODE", "poetry".to_string()));
    with_env(&vars, || {
        let result = migrate::run(&LoadOptions::default());
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn chat_answers_a_product_search_offline() {
    let dir = TempDir::new().expect("tempdir");
    with_env(&offline_env(dir.path()), || {
        let result = chat::run(
            &LoadOptions::default(),
            Some("cli-chat".to_string()),
            vec!["Sony headphones under $100".to_string()],
        );
        assert_eq!(result.exit_code, 0, "expected chat success: {}", result.output);

        let turns = parse_payload(&result.output);
        let turn = &turns[0];
        assert_eq!(turn["conversation_id"], "cli-chat");
        assert_eq!(turn["turn_index"], 1);
        assert_eq!(turn["escalate"], false);
        assert!(turn["reply"].as_str().unwrap_or_default().contains("$89.99"));
        assert_eq!(turn["tools"][0]["tool"], "search_products");
        assert_eq!(turn["tools"][0]["status"], "ok");
    });
}

#[test]
fn chat_reports_recovered_tool_failures() {
    let dir = TempDir::new().expect("tempdir");
    with_env(&offline_env(dir.path()), || {
        let result = chat::run(
            &LoadOptions::default(),
            Some("cli-missing-order".to_string()),
            vec!["where is order #9999?".to_string()],
        );
        assert_eq!(result.exit_code, 0, "expected chat success: {}", result.output);

        let turns = parse_payload(&result.output);
        let turn = &turns[0];
        assert_eq!(turn["tools"][0]["tool"], "get_order_status");
        assert_eq!(turn["tools"][0]["status"], "error");
        let recovered = turn["recovered"][0].as_str().unwrap_or_default();
        assert!(recovered.starts_with("bad request: not_found"), "{recovered}");
    });
}

#[test]
fn state_reports_the_stored_conversation_and_its_checkpoints() {
    let dir = TempDir::new().expect("tempdir");
    with_env(&offline_env(dir.path()), || {
        let options = LoadOptions::default();
        let chat_result = chat::run(
            &options,
            Some("cli-state".to_string()),
            vec!["What's your return policy?".to_string()],
        );
        assert_eq!(chat_result.exit_code, 0, "expected chat success: {}", chat_result.output);

        let latest = state::run(&options, "cli-state", false);
        assert_eq!(latest.exit_code, 0);
        let snapshot = parse_payload(&latest.output);
        assert_eq!(snapshot["turn_index"], 1);
        assert_eq!(snapshot["checkpoint_version"], 4);
        assert!(snapshot.get("pending_turn").is_none());

        let history = state::run(&options, "cli-state", true);
        assert_eq!(history.exit_code, 0);
        let records = parse_payload(&history.output);
        let stages: Vec<&str> = records
            .as_array()
            .expect("history array")
            .iter()
            .filter_map(|record| record["stage"].as_str())
            .collect();
        assert_eq!(stages, vec!["extracted", "planned", "executed", "completed"]);
    });
}

#[test]
fn state_reports_unknown_conversation_as_not_found() {
    let dir = TempDir::new().expect("tempdir");
    with_env(&offline_env(dir.path()), || {
        let result = state::run(&LoadOptions::default(), "never-seen", false);
        assert_eq!(result.exit_code, 1);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "state");
        assert_eq!(payload["error_class"], "not_found");
    });
}

#[test]
fn doctor_passes_after_migrations() {
    let dir = TempDir::new().expect("tempdir");
    with_env(&offline_env(dir.path()), || {
        assert_eq!(migrate::run(&LoadOptions::default()).exit_code, 0);

        let (output, passed) = doctor::run(&LoadOptions::default(), true);
        assert!(passed, "expected every check to pass: {output}");

        let report = parse_payload(&output);
        assert_eq!(report["overall_status"], "pass");
        let names: Vec<&str> = report["checks"]
            .as_array()
            .expect("checks array")
            .iter()
            .filter_map(|check| check["name"].as_str())
            .collect();
        assert_eq!(names, vec!["config_validation", "database_connectivity", "llm_readiness"]);
    });
}

#[test]
fn doctor_flags_pending_migrations() {
    let dir = TempDir::new().expect("tempdir");
    with_env(&offline_env(dir.path()), || {
        let (output, passed) = doctor::run(&LoadOptions::default(), false);
        assert!(!passed);
        assert!(output.contains("[fail] database_connectivity"));
        assert!(output.contains("run `clerk migrate`"));
    });
}

#[test]
fn config_attributes_env_values_and_redacts_keys() {
    let dir = TempDir::new().expect("tempdir");
    let mut vars = offline_env(dir.path());
    vars.push(("CLERK_LLM_API_KEY", "sk-very-secret".to_string()));
    with_env(&vars, || {
        let output = config::run(&LoadOptions::default());
        assert!(output.contains("- llm.provider = Offline (source: env (CLERK_LLM_PROVIDER))"));
        assert!(output.contains("- llm.api_key = sk-*** (source: env (CLERK_LLM_API_KEY))"));
        assert!(output.contains("- executor.call_timeout_ms = "));
        assert!(!output.contains("very-secret"));
    });
}

fn offline_env(dir: &Path) -> Vec<(&'static str, String)> {
    vec![
        ("CLERK_DATABASE_URL", format!("sqlite://{}", dir.join("clerk.db").display())),
        ("CLERK_LLM_PROVIDER", "offline".to_string()),
        ("CLERK_LOG_LEVEL", "warn".to_string()),
    ]
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, String)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard = ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    let keys = [
        "CLERK_DATABASE_URL",
        "CLERK_DATABASE_MAX_CONNECTIONS",
        "CLERK_DATABASE_TIMEOUT_SECS",
        "CLERK_LLM_PROVIDER",
        "CLERK_LLM_API_KEY",
        "CLERK_LLM_BASE_URL",
        "CLERK_LLM_MODEL",
        "CLERK_LLM_TIMEOUT_SECS",
        "CLERK_LLM_MAX_RETRIES",
        "CLERK_PLANNER_TIMEOUT_MS",
        "CLERK_EXECUTOR_TURN_DEADLINE_MS",
        "CLERK_EXECUTOR_CALL_TIMEOUT_MS",
        "CLERK_RETRY_MAX_ATTEMPTS",
        "CLERK_RATE_LIMIT_WAIT_CEILING_MS",
        "CLERK_SYNTHESIS_MODE",
        "CLERK_SYNTHESIS_TIMEOUT_MS",
        "CLERK_LOGGING_LEVEL",
        "CLERK_LOGGING_FORMAT",
        "CLERK_LOG_LEVEL",
        "CLERK_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
