//! Configuration tests

use super::*;

#[test]
fn defaults_are_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.storage.backend, StorageBackendKind::Memory);
    assert_eq!(config.session.inflight_window, 10);
    assert_eq!(config.session.retry_interval, Duration::from_secs(20));
}

#[test]
fn parses_full_toml() {
    let toml = r#"
        [log]
        level = "debug"

        [session]
        inflight_window = 32
        retry_interval = "5s"
        outbound_capacity = 256

        [storage]
        backend = "fjall"

        [storage.fjall]
        path = "/var/lib/postmq"
    "#;

    let config = Config::from_toml_str(toml).unwrap();
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.session.inflight_window, 32);
    assert_eq!(config.session.retry_interval, Duration::from_secs(5));
    assert_eq!(config.storage.backend, StorageBackendKind::Fjall);
    assert_eq!(config.storage.fjall.path, PathBuf::from("/var/lib/postmq"));
}

#[test]
fn parses_redis_backend() {
    let toml = r#"
        [storage]
        backend = "redis"

        [storage.redis]
        url = "redis://10.0.0.5:6379"
        key_prefix = "mq:"
    "#;

    let config = Config::from_toml_str(toml).unwrap();
    assert_eq!(config.storage.backend, StorageBackendKind::Redis);
    assert_eq!(config.storage.redis.url, "redis://10.0.0.5:6379");
    assert_eq!(config.storage.redis.key_prefix, "mq:");
}

#[test]
fn rejects_zero_inflight_window() {
    let toml = r#"
        [session]
        inflight_window = 0
    "#;
    assert!(matches!(
        Config::from_toml_str(toml),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn rejects_unknown_log_level() {
    let toml = r#"
        [log]
        level = "loud"
    "#;
    assert!(matches!(
        Config::from_toml_str(toml),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn substitutes_env_vars_with_defaults() {
    let content = "path = \"${POSTMQ_TEST_UNSET_VAR:-/tmp/fallback}\"";
    let substituted = substitute_env_vars(content);
    assert_eq!(substituted, "path = \"/tmp/fallback\"");
}
