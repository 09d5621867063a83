//! Integration tests for layered configuration loading

use crate::integration::test_utils::with_config_env;
use cosync::config::{global_config_path, ConfigLoader, SyncConfig};
use tempfile::TempDir;

fn write(path: &std::path::Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[test]
fn test_workspace_without_files_uses_defaults() {
    let test_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();
    let config = with_config_env(&test_dir, || ConfigLoader::load(workspace.path()).unwrap());
    assert_eq!(config, SyncConfig::default());
}

#[test]
fn test_workspace_file_overrides_defaults() {
    let test_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();
    write(
        &workspace.path().join("config/config.toml"),
        r#"
[server]
evict_empty_contexts = false

[logging]
level = "info"
"#,
    );

    let config = with_config_env(&test_dir, || ConfigLoader::load(workspace.path()).unwrap());
    assert!(!config.server.evict_empty_contexts);
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.logging.format, "text");
}

#[test]
fn test_env_specific_file_wins_over_base_file() {
    let test_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();
    write(
        &workspace.path().join("config/config.toml"),
        "[logging]\nlevel = \"info\"\nformat = \"json\"\n",
    );
    write(
        &workspace.path().join("config/staging.toml"),
        "[logging]\nlevel = \"error\"\n",
    );

    let config = with_config_env(&test_dir, || {
        std::env::set_var("COSYNC_ENV", "staging");
        ConfigLoader::load(workspace.path()).unwrap()
    });
    assert_eq!(config.logging.level, "error");
    assert_eq!(config.logging.format, "json");
}

#[test]
fn test_global_file_is_below_workspace_file() {
    let test_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();
    write(
        &workspace.path().join("config/config.toml"),
        "[logging]\nlevel = \"debug\"\n",
    );

    let config = with_config_env(&test_dir, || {
        if let Some(global) = global_config_path() {
            write(
                &global,
                "[server]\nevict_empty_contexts = false\n[logging]\nlevel = \"trace\"\n",
            );
        }
        ConfigLoader::load(workspace.path()).unwrap()
    });

    assert_eq!(config.logging.level, "debug");
    if cfg!(target_os = "linux") {
        assert!(!config.server.evict_empty_contexts);
    }
}

#[test]
fn test_invalid_values_fail_validation() {
    let test_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();
    write(
        &workspace.path().join("config/config.toml"),
        "[logging]\noutput = \"syslog\"\n",
    );

    let result = with_config_env(&test_dir, || SyncConfig::load(workspace.path()));
    let err = result.unwrap_err();
    assert!(err.to_string().contains("Invalid log output"));
}

#[test]
fn test_malformed_file_is_config_error() {
    let test_dir = TempDir::new().unwrap();
    let file = test_dir.path().join("broken.toml");
    std::fs::write(&file, "[server\nevict_empty_contexts = ").unwrap();
    assert!(ConfigLoader::load_from_file(&file).is_err());
}

#[test]
fn test_environment_overrides_files() {
    let test_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();
    write(
        &workspace.path().join("config/config.toml"),
        "[server]\nevict_empty_contexts = true\n",
    );

    let config = with_config_env(&test_dir, || {
        std::env::set_var("COSYNC__SERVER__EVICT_EMPTY_CONTEXTS", "false");
        let loaded = ConfigLoader::load(workspace.path());
        std::env::remove_var("COSYNC__SERVER__EVICT_EMPTY_CONTEXTS");
        loaded.unwrap()
    });
    assert!(!config.server.evict_empty_contexts);
}
