use shared_utils::config::{Config, ConfigError};
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

fn no_env(_: &str) -> Option<String> {
    None
}

#[test]
fn test_load_service_config() {
    let mut file = NamedTempFile::new().unwrap();

    let config_str = r#"
        [tunnel]
        name = "ZitiTUN"
        mtu = 1420

        [[tunnel.peers]]
        public_key = "AgICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgI="
        allowed_ips = ["10.0.0.0/24", "fd00::/64"]

        [[tunnel.peers]]
        public_key = "AwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwM="

        [service]
        runtime_dir = "/run/edgetun"
        grace_period_ms = 2000
        run_as_user = "nobody"

        [firewall]
        enabled = false
    "#;

    file.write_all(config_str.as_bytes()).unwrap();

    let config = Config::load_with_env(file.path(), no_env).unwrap();

    assert_eq!(config.tunnel.name, "ZitiTUN");
    assert_eq!(config.tunnel.mtu, Some(1420));
    assert_eq!(config.tunnel.peers.len(), 2);
    assert!(config.tunnel.peers[1].allowed_ips.is_empty());
    assert_eq!(config.service.runtime_dir, PathBuf::from("/run/edgetun"));
    assert_eq!(config.service.grace_period_ms, 2000);
    assert_eq!(config.service.run_as_user.as_deref(), Some("nobody"));
    assert_eq!(config.watcher.queue_capacity, 64);
    assert!(!config.firewall.enabled);
}

#[test]
fn test_malformed_toml() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"[tunnel\nname = ").unwrap();

    let err = Config::load_with_env(file.path(), no_env).unwrap_err();
    assert!(matches!(err, ConfigError::TomlError(_)));
}

#[test]
fn test_wrong_value_type() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"[watcher]\ndebounce_ms = \"soon\"\n").unwrap();

    let err = Config::load_with_env(file.path(), no_env).unwrap_err();
    assert!(matches!(err, ConfigError::TomlError(_)));
}

#[test]
fn test_zero_grace_period_rejected() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"[service]\ngrace_period_ms = 0\n").unwrap();

    match Config::load_with_env(file.path(), no_env) {
        Err(ConfigError::InvalidValue { key, .. }) => {
            assert_eq!(key, "service.grace_period_ms");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_default_path_names_edgetun() {
    let path = Config::default_path();
    assert!(path.ends_with("edgetun.toml"));
}
