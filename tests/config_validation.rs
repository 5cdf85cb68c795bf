//! Integration tests for configuration loading and validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use peerlink::config::{PeerConfig, RetryConfig};
use peerlink::translator::CompressionKind;
use std::io::Write;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = PeerConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_documented_defaults() {
    let config = PeerConfig::default();
    assert_eq!(config.connection.queue_capacity, 64);
    assert_eq!(config.connection.connection_timeout, Duration::from_secs(30));
    assert_eq!(config.connection.keepalive_interval, Duration::from_secs(5));
    assert_eq!(config.connection.close_grace, Duration::from_secs(5));
    assert_eq!(config.retry.initial_backoff, Duration::from_millis(250));
    assert_eq!(config.retry.max_attempts, 6);
    assert_eq!(config.translator.key_block_bits, 1024);
    assert_eq!(config.translator.compression_threshold_bytes, 512);
    assert_eq!(config.remote.invocation_timeout, Duration::from_secs(10));
}

#[test]
fn test_zero_queue_capacity() {
    let config = PeerConfig::default_with_overrides(|c| c.connection.queue_capacity = 0);
    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Queue capacity must be greater than 0")));
}

#[test]
fn test_keepalive_must_be_shorter_than_timeout() {
    let config = PeerConfig::default_with_overrides(|c| {
        c.connection.keepalive_interval = Duration::from_secs(60);
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Keep-alive interval")));
}

#[test]
fn test_retry_schedule_checks() {
    let retry = RetryConfig {
        initial_backoff: Duration::from_millis(500),
        multiplier: 0.5,
        max_backoff: Duration::from_millis(100),
        max_attempts: 0,
    };
    let errors = retry.validate();
    assert!(errors.iter().any(|e| e.contains("max attempts")));
    assert!(errors.iter().any(|e| e.contains("Max backoff")));
    assert!(errors.iter().any(|e| e.contains("multiplier")));
}

#[test]
fn test_key_block_must_be_whole_bytes() {
    let config = PeerConfig::default_with_overrides(|c| c.translator.key_block_bits = 1020);
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("multiple of 8")));
}

#[test]
fn test_strict_validation_lists_every_problem() {
    let config = PeerConfig::default_with_overrides(|c| {
        c.connection.queue_capacity = 0;
        c.logging.app_name = String::new();
    });
    let err = config.validate_strict().unwrap_err().to_string();
    assert!(err.contains("Queue capacity"));
    assert!(err.contains("Application name"));
}

#[test]
fn test_partial_toml_keeps_defaults() {
    let config = PeerConfig::from_toml(
        r#"
        [connection]
        queue_capacity = 10
        connection_timeout = 2000
        keepalive_interval = 500
        close_grace = 1000
        update_interval = 5
        duplicate_window = 128

        [translator]
        encryption_enabled = true
        key_block_bits = 2048
        compression_enabled = true
        compression_kind = "zstd"
        compression_threshold_bytes = 256
        max_payload_size = 1048576

        [logging]
        app_name = "arena"
        log_level = "debug"
        json_format = true
        "#,
    )
    .unwrap();

    assert_eq!(config.connection.queue_capacity, 10);
    assert_eq!(config.connection.connection_timeout, Duration::from_secs(2));
    assert_eq!(config.translator.compression_kind, CompressionKind::Zstd);
    assert_eq!(config.logging.log_level, Level::DEBUG);
    assert_eq!(config.retry.max_attempts, RetryConfig::default().max_attempts);
    assert!(config.validate().is_empty());
}

#[test]
fn test_malformed_toml_is_config_error() {
    let err = PeerConfig::from_toml("[connection\nqueue_capacity = 1").unwrap_err();
    assert!(err.to_string().contains("Failed to parse TOML"));
}

#[test]
fn test_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("peer.toml");
    let original = PeerConfig::default_with_overrides(|c| {
        c.connection.queue_capacity = 99;
        c.retry.max_attempts = 3;
    });
    original.save_to_file(&path).unwrap();

    let loaded = PeerConfig::from_file(&path).unwrap();
    assert_eq!(loaded.connection.queue_capacity, 99);
    assert_eq!(loaded.retry.max_attempts, 3);
}

#[test]
fn test_example_config_parses() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(PeerConfig::example_config().as_bytes())
        .unwrap();
    assert!(PeerConfig::from_file(file.path()).is_ok());
}

#[test]
fn test_missing_file_is_config_error() {
    let err = PeerConfig::from_file("/definitely/not/here.toml").unwrap_err();
    assert!(err.to_string().contains("Failed to open config file"));
}
