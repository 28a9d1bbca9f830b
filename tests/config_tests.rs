//! Configuration loading from the environment.

use std::time::Duration;

use overcast::EngineConfig;
use overcast::config::ConfigError;
use overcast::provider::scaleway::ScalewayConfig;
use overcast::test_support::EnvGuard;

#[tokio::test]
async fn engine_settings_come_from_prefixed_environment() {
    let _guard = EnvGuard::set_vars(&[
        ("OVERCAST_SSH_BIN", "/opt/openssh/bin/ssh"),
        ("OVERCAST_RETRY_ATTEMPTS", "5"),
        ("OVERCAST_READINESS_DELAY_SECS", "4"),
        ("OVERCAST_CONFIG_DIR", "/srv/fleet"),
        ("OVERCAST_MULTIPASS_BIN", "/snap/bin/multipass"),
    ])
    .await;

    let config = EngineConfig::load_without_cli_args().expect("environment loads");

    assert_eq!(config.ssh_bin, "/opt/openssh/bin/ssh");
    assert_eq!(config.retry_policy().max_retries, 5);
    assert_eq!(config.readiness_delay(), Duration::from_secs(4));
    assert_eq!(config.config_dir().as_str(), "/srv/fleet");
    assert_eq!(config.multipass_bin, "/snap/bin/multipass");
    config.validate().expect("loaded settings are usable");
}

#[tokio::test]
async fn scaleway_credentials_load_from_scw_variables() {
    let _guard = EnvGuard::set_vars(&[
        ("SCW_SECRET_KEY", "SCWSECRETKEYEXAMPLE"),
        ("SCW_DEFAULT_PROJECT_ID", "11111111-2222-3333-4444-555555555555"),
        ("SCW_DEFAULT_ZONE", "nl-ams-1"),
    ])
    .await;

    let config = ScalewayConfig::load_without_cli_args().expect("environment loads");

    assert_eq!(config.secret_key().expect("secret set"), "SCWSECRETKEYEXAMPLE");
    assert_eq!(config.default_zone, "nl-ams-1");
    config.validate().expect("credentials are complete");
}

#[test]
fn missing_project_explains_every_way_to_set_it() {
    let config = ScalewayConfig {
        secret_key: Some(String::from("SCWSECRETKEYEXAMPLE")),
        ..ScalewayConfig::default()
    };

    let err = config.validate().expect_err("project is required");
    let ConfigError::MissingField(ref message) = err else {
        panic!("expected MissingField, got {err:?}");
    };
    assert!(message.contains("SCW_DEFAULT_PROJECT_ID"), "{message}");
    assert!(message.contains("default_project_id"), "{message}");
    assert!(message.contains("overcast.toml"), "{message}");
}
