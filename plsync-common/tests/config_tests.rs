//! Configuration loading and root folder resolution
//!
//! Tests that touch PLSYNC_ROOT_FOLDER or PLSYNC_CONFIG are marked #[serial]
//! so they never race on process environment.

use plsync_common::config::{
    load_toml_config, resolve_config_path, resolve_root_folder, write_toml_config, TomlConfig,
    CONFIG_ENV, ROOT_FOLDER_ENV,
};
use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[test]
fn test_missing_config_file_yields_defaults() {
    let temp = TempDir::new().unwrap();
    let config = load_toml_config(Some(&temp.path().join("absent.toml"))).unwrap();
    assert_eq!(config, TomlConfig::default());
}

#[test]
fn test_partial_config_fills_defaults() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
root_folder = "/srv/plsync"

[download]
attempts_per_strategy = 5

[proxy]
enabled = false

[[strategies.tools]]
id = "custom-dl"
program = "custom-dl"
args = ["--out", "{output_dir}", "{url}"]
"#,
    )
    .unwrap();

    let config = load_toml_config(Some(&path)).unwrap();
    assert_eq!(config.root_folder, Some(PathBuf::from("/srv/plsync")));
    assert_eq!(config.download.attempts_per_strategy, 5);
    assert_eq!(config.download.proxy_after_attempt, 2);
    assert!(!config.proxy.enabled);
    assert_eq!(config.governor.base_interval_ms, 1000);
    assert_eq!(config.strategies.tools.len(), 1);
    assert_eq!(config.strategies.tools[0].timeout_secs, 180);
    assert!(config.strategies.direct_api.is_some());
}

#[test]
fn test_malformed_config_is_an_error() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(&path, "[download\nattempts_per_strategy = ").unwrap();
    assert!(load_toml_config(Some(&path)).is_err());
}

#[test]
fn test_invalid_values_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(&path, "[download]\nattempts_per_strategy = 0\n").unwrap();
    assert!(load_toml_config(Some(&path)).is_err());
}

#[test]
fn test_write_then_load_preserves_config() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("nested").join("config.toml");

    let mut config = TomlConfig::default();
    config.logging.level = "debug".to_string();
    config.governor.max_interval_ms = 4500;
    write_toml_config(&config, &path).unwrap();

    assert_eq!(load_toml_config(Some(&path)).unwrap(), config);
    assert!(!path.with_extension("toml.tmp").exists());
}

#[test]
#[serial]
fn test_root_folder_priority() {
    let config = TomlConfig {
        root_folder: Some(PathBuf::from("/from/toml")),
        ..TomlConfig::default()
    };

    env::set_var(ROOT_FOLDER_ENV, "/from/env");
    assert_eq!(
        resolve_root_folder(Some(Path::new("/from/cli")), &config),
        PathBuf::from("/from/cli")
    );
    assert_eq!(resolve_root_folder(None, &config), PathBuf::from("/from/env"));

    env::remove_var(ROOT_FOLDER_ENV);
    assert_eq!(resolve_root_folder(None, &config), PathBuf::from("/from/toml"));

    let resolved = resolve_root_folder(None, &TomlConfig::default());
    assert!(resolved.ends_with("plsync") || resolved.ends_with("plsync_data"));
}

#[test]
#[serial]
fn test_empty_env_var_ignored() {
    env::set_var(ROOT_FOLDER_ENV, "  ");
    let config = TomlConfig {
        root_folder: Some(PathBuf::from("/from/toml")),
        ..TomlConfig::default()
    };
    assert_eq!(resolve_root_folder(None, &config), PathBuf::from("/from/toml"));
    env::remove_var(ROOT_FOLDER_ENV);
}

#[test]
#[serial]
fn test_config_path_priority() {
    env::set_var(CONFIG_ENV, "/env/config.toml");
    assert_eq!(
        resolve_config_path(Some(Path::new("/cli/config.toml"))),
        Some(PathBuf::from("/cli/config.toml"))
    );
    assert_eq!(resolve_config_path(None), Some(PathBuf::from("/env/config.toml")));

    env::remove_var(CONFIG_ENV);
    if let Some(path) = resolve_config_path(None) {
        assert!(path.ends_with("plsync/config.toml"));
    }
}
