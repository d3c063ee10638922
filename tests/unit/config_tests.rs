use std::time::Duration;

use agent_fleet::config::GlobalConfig;
use agent_fleet::AppError;

fn minimal_toml(root: &str) -> String {
    format!(
        r#"
workspace_root = '{root}/workspaces'
data_root = '{root}/data'

[container]
image = "ghcr.io/example/agent:latest"
"#
    )
}

#[test]
fn minimal_config_fills_defaults() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_str().expect("utf8");

    let config = GlobalConfig::from_toml_str(&minimal_toml(root)).expect("valid config");

    assert_eq!(config.http_port, 8080);
    assert_eq!(config.bind_address, "127.0.0.1");
    assert_eq!(config.forge_base_url, "https://github.com");
    assert_eq!(config.clone_timeout(), Duration::from_secs(600));
    assert_eq!(config.container.name_prefix, "agent-fleet-");
    assert_eq!(config.stop_grace(), Duration::from_secs(10));
    assert_eq!(config.runner.command, "agent-fleet-runner");
    assert_eq!(config.runner.agent_command, "claude");
    assert_eq!(config.reconcile_interval(), Duration::from_secs(30));
    assert_eq!(config.dispatcher.subscriber_buffer, 256);
    assert_eq!(config.retry_policy().max_attempts, 4);
}

#[test]
fn storage_roots_are_created_and_canonical() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_str().expect("utf8");

    let config = GlobalConfig::from_toml_str(&minimal_toml(root)).expect("valid config");

    assert!(config.workspace_root.is_dir());
    assert!(config.data_root.is_dir());
    assert!(config.workspace_root.is_absolute());
    assert_eq!(config.db_path(), config.data_root.join("fleet.db"));
}

#[test]
fn per_session_paths_and_names() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_str().expect("utf8");
    let config = GlobalConfig::from_toml_str(&minimal_toml(root)).expect("valid config");

    assert_eq!(
        config.session_workspace_dir("abc"),
        config.workspace_root.join("abc")
    );
    assert_eq!(config.session_data_dir("abc"), config.data_root.join("abc"));
    assert_eq!(config.container_name("abc"), "agent-fleet-abc");
}

#[test]
fn explicit_values_override_defaults() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_str().expect("utf8");
    let toml = format!(
        r#"
workspace_root = '{root}/ws'
data_root = '{root}/data'
db_path = '{root}/custom.db'
http_port = 9000
forge_base_url = "https://git.example.com"
clone_timeout_seconds = 45

[container]
image = "agent:dev"
name_prefix = "fleet-"
stop_grace_seconds = 3
env = ["FOO=bar"]

[runner]
agent_command = "fake-agent"
agent_args = ["--dangerously-skip-permissions"]
connect_timeout_ms = 250

[reconcile]
interval_seconds = 5

[retry]
max_attempts = 2
initial_backoff_ms = 10
max_backoff_ms = 40

[dispatcher]
subscriber_buffer = 8
"#
    );

    let config = GlobalConfig::from_toml_str(&toml).expect("valid config");

    assert_eq!(config.db_path(), std::path::PathBuf::from(format!("{root}/custom.db")));
    assert_eq!(config.http_port, 9000);
    assert_eq!(config.clone_timeout(), Duration::from_secs(45));
    assert_eq!(config.container_name("x"), "fleet-x");
    assert_eq!(config.stop_grace(), Duration::from_secs(3));
    assert_eq!(config.container.env, vec!["FOO=bar".to_owned()]);
    assert_eq!(config.runner.agent_command, "fake-agent");
    assert_eq!(config.runner.command, "agent-fleet-runner");
    assert_eq!(config.reconcile_interval(), Duration::from_secs(5));

    let policy = config.retry_policy();
    assert_eq!(policy.max_attempts, 2);
    assert_eq!(policy.initial_backoff, Duration::from_millis(10));
    assert_eq!(policy.max_backoff, Duration::from_millis(40));
    assert_eq!(config.dispatcher.subscriber_buffer, 8);
}

#[test]
fn invalid_values_are_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_str().expect("utf8");
    let base = minimal_toml(root);

    let cases = [
        base.replace("ghcr.io/example/agent:latest", " "),
        base.replace("data_root =", "clone_timeout_seconds = 0\ndata_root ="),
        format!("{base}\n[reconcile]\ninterval_seconds = 0\n"),
        format!("{base}\n[retry]\nmax_attempts = 0\n"),
        format!("{base}\n[retry]\ninitial_backoff_ms = 500\nmax_backoff_ms = 100\n"),
        format!("{base}\n[dispatcher]\nsubscriber_buffer = 0\n"),
    ];

    for toml in cases {
        match GlobalConfig::from_toml_str(&toml) {
            Err(AppError::Config(_)) => {}
            other => panic!("expected config error for:\n{toml}\ngot {other:?}"),
        }
    }
}

#[test]
fn missing_container_section_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_str().expect("utf8");
    let toml = format!("workspace_root = '{root}/ws'\ndata_root = '{root}/data'\n");

    assert!(matches!(
        GlobalConfig::from_toml_str(&toml),
        Err(AppError::Config(_))
    ));
}

#[test]
fn load_from_missing_file_fails() {
    let result = GlobalConfig::load_from_path("/nonexistent/agent-fleet/config.toml");
    assert!(matches!(result, Err(AppError::Config(_))));
}
