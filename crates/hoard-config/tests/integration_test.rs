//! Integration tests for hoard-config
//!
//! These tests verify the full config loading pipeline with real file system operations.

use std::path::PathBuf;
use tempfile::tempdir;

/// Test config loading from real global config file
#[test]
fn test_load_global_config_from_file() {
    let temp = tempdir().unwrap();
    let hoard_dir = temp.path().join(".hoard");
    std::fs::create_dir_all(&hoard_dir).unwrap();

    let config_content = r#"
[storage]
pool_root = "/custom/pool"
hosts_root = "/custom/hosts"

[chunking]
chunk_size = 1048576

[pipeline]
parallelism = 4
"#;
    let path = hoard_dir.join("config.toml");
    std::fs::write(&path, config_content).unwrap();

    let config = hoard_config::Config::load_from(Some(&path), None).unwrap();

    assert_eq!(config.storage.pool_root, PathBuf::from("/custom/pool"));
    assert_eq!(config.storage.hosts_root, PathBuf::from("/custom/hosts"));
    assert_eq!(config.chunking.chunk_size, 1048576);
    assert_eq!(config.pipeline.parallelism, 4);
    assert!(config.journal.compress);
}

/// Test config hierarchy: project config overrides global
#[test]
fn test_config_hierarchy_project_overrides_global() {
    let temp = tempdir().unwrap();

    let global = temp.path().join("global.toml");
    std::fs::write(
        &global,
        r#"
[storage]
pool_root = "/global/pool"

[integrity]
strict = false

[journal]
compress = true
compression_level = 9
"#,
    )
    .unwrap();

    let project = temp.path().join("project.toml");
    std::fs::write(
        &project,
        r#"
[integrity]
strict = true
"#,
    )
    .unwrap();

    let config = hoard_config::Config::load_from(Some(&global), Some(&project)).unwrap();

    assert_eq!(config.storage.pool_root, PathBuf::from("/global/pool"));
    assert!(config.integrity.strict);
    assert_eq!(config.journal.compression_level, 9);
}

/// Missing files fall back to defaults
#[test]
fn test_missing_files_yield_defaults() {
    let temp = tempdir().unwrap();
    let missing = temp.path().join("nope.toml");
    let config = hoard_config::Config::load_from(Some(&missing), Some(&missing)).unwrap();
    assert_eq!(config.chunking.chunk_size, hoard_config::DEFAULT_CHUNK_SIZE);
}

/// Test config with environment variable override
#[test]
fn test_config_env_override_integration() {
    std::env::set_var("HOARD_LOCK_TIMEOUT", "99");
    let config = hoard_config::Config::load_from(None, None).unwrap();
    std::env::remove_var("HOARD_LOCK_TIMEOUT");

    assert_eq!(config.locks.timeout_secs, 99);
}

/// Malformed TOML surfaces a parse error
#[test]
fn test_invalid_toml_is_error() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("bad.toml");
    std::fs::write(&path, "[storage\npool_root = ").unwrap();
    let err = hoard_config::Config::load_from(Some(&path), None).unwrap_err();
    assert!(matches!(err, hoard_config::ConfigError::Toml(_)));
}

/// Test complete config serialization/deserialization cycle
#[test]
fn test_config_full_roundtrip_with_all_sections() {
    let original = hoard_config::Config::default();

    let temp = tempdir().unwrap();
    let config_path = temp.path().join("config.toml");
    std::fs::write(&config_path, hoard_config::Config::default_toml()).unwrap();

    let contents = std::fs::read_to_string(&config_path).unwrap();
    let loaded: hoard_config::Config = toml::from_str(&contents).unwrap();

    assert_eq!(original, loaded);
}

/// A zero chunk size would back up every file without content
#[test]
fn test_zero_chunk_size_is_rejected() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(&path, "[chunking]\nchunk_size = 0\n").unwrap();

    let result = hoard_config::Config::load_from(Some(&path), None);
    assert!(matches!(result, Err(hoard_config::ConfigError::Invalid(_))));
}
