use super::*;

#[test]
fn defaults_validate() {
    let config = CoreConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.rate_limit.max_requests, 120);
    assert_eq!(config.ledger.default_ttl_seconds, 300);
    assert_eq!(config.ledger.max_reservations_per_key, 50);
    assert_eq!(config.ledger.auto_expire_interval_ms, 30_000);
}

#[test]
fn rejects_zero_sub_windows() {
    let mut config = CoreConfig::default();
    config.rate_limit.sub_windows = 0;
    assert!(config.validate().is_err());
}

#[test]
fn rejects_non_positive_max_reservation_amount() {
    let mut config = CoreConfig::default();
    config.ledger.max_reservation_amount = Some(0.0);
    assert!(config.validate().is_err());
}

#[test]
fn load_missing_file_falls_back_to_defaults() {
    let path = std::path::Path::new("/nonexistent/creditgate-config-test.toml");
    let config = CoreConfig::load(path).expect("defaults should load");
    assert_eq!(config.rate_limit.window_ms, 60_000);
}

#[test]
fn load_toml_overrides_defaults() {
    let dir = std::env::temp_dir();
    let path = dir.join(format!(
        "creditgate-test-{}.toml",
        std::process::id()
    ));
    std::fs::write(
        &path,
        r#"
        [rate_limit]
        max_requests = 7
        "#,
    )
    .unwrap();

    let config = CoreConfig::load(&path).expect("config should load");
    assert_eq!(config.rate_limit.max_requests, 7);
    // Untouched sections keep their defaults.
    assert_eq!(config.dedup.ttl_ms, 60_000);

    let _ = std::fs::remove_file(&path);
}
