//! Settings loading from TOML files and environment overrides.

use std::io::Write;

use detector_sync::config::{FluxHandshake, FluxMode, Settings, SyncMode};
use serial_test::serial;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::with_suffix(".toml").expect("create temp config");
    file.write_all(contents.as_bytes()).expect("write temp config");
    file
}

#[test]
#[serial]
fn test_partial_file_keeps_defaults() {
    let file = write_config(
        r#"
[engine]
settle_delay_ms = 40

[flux]
mode = "source_b"
"#,
    );

    let settings = Settings::load_from(file.path()).unwrap();
    assert_eq!(settings.engine.settle_delay_ms, 40);
    assert_eq!(settings.engine.poll_interval_ms, 1);
    assert_eq!(settings.flux.mode, FluxMode::SourceB);
    assert_eq!(settings.flux.source_b.name, "OXFORD");
    assert!(!settings.report.enabled);
}

#[test]
#[serial]
fn test_missing_file_uses_defaults() {
    let settings = Settings::load_from("does/not/exist.toml").unwrap();
    assert_eq!(settings.application.name, "detector_sync");
    assert_eq!(settings.engine.sync_mode, None);
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = write_config(
        r#"
[engine]
ready_timeout_ms = 2000
"#,
    );

    std::env::set_var("DETSYNC_ENGINE__READY_TIMEOUT_MS", "3000");
    std::env::set_var("DETSYNC_ENGINE__SYNC_MODE", "soft");
    let result = Settings::load_from(file.path());
    std::env::remove_var("DETSYNC_ENGINE__READY_TIMEOUT_MS");
    std::env::remove_var("DETSYNC_ENGINE__SYNC_MODE");

    let settings = result.unwrap();
    assert_eq!(settings.engine.ready_timeout_ms, 3000);
    assert_eq!(settings.engine.sync_mode, Some(SyncMode::Soft));
}

#[test]
#[serial]
fn test_invalid_values_rejected_on_load() {
    let file = write_config(
        r#"
[engine]
poll_interval_ms = 0
"#,
    );
    assert!(Settings::load_from(file.path()).is_err());

    let file = write_config(
        r#"
[flux.source_a]
name = "  "
"#,
    );
    assert!(Settings::load_from(file.path()).is_err());
}

#[test]
#[serial]
fn test_endpoint_handshake_from_file() {
    let file = write_config(
        r#"
[flux.source_a]
name = "SRI-2"
handshake = "status"
"#,
    );
    let settings = Settings::load_from(file.path()).unwrap();
    assert_eq!(settings.flux.source_a.name, "SRI-2");
    assert_eq!(settings.flux.source_a.handshake, FluxHandshake::Status);
}

#[test]
#[serial]
fn test_shipped_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/sync.toml");
    let settings = Settings::load_from(path).unwrap();
    assert_eq!(settings.flux.mode, FluxMode::None);
    assert_eq!(settings.report.discard_leading_duty, 2);
}
