use assetgen::config::{Config, WorkerSettings};
use secrecy::ExposeSecret;

// Env vars are process-global, so every env case runs in this one test.
#[test]
fn config_from_env() {
    unsafe {
        std::env::remove_var("ASSETGEN_DATA_ROOT");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("ASSETGEN_DATA_ROOT", "/tmp/assetgen-data");
        std::env::set_var("COMFYUI_URL", "http://gpu-box:8188///");
        std::env::set_var("COMFYUI_API_TOKEN", "tok-123");
        std::env::set_var("OTEL_ENDPOINT", "  ");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.data_root.to_str(), Some("/tmp/assetgen-data"));
    assert_eq!(config.comfyui_url, "http://gpu-box:8188");
    assert_eq!(
        config.comfyui_api_token.as_ref().map(|t| t.expose_secret().to_string()),
        Some("tok-123".to_string())
    );
    assert!(config.otel_endpoint.is_none(), "blank means unset");
    assert!(!config.log_level.is_empty());

    unsafe {
        std::env::remove_var("ASSETGEN_DATA_ROOT");
        std::env::remove_var("COMFYUI_URL");
        std::env::remove_var("COMFYUI_API_TOKEN");
        std::env::remove_var("OTEL_ENDPOINT");
    }
}

#[test]
fn worker_settings_default_without_file() {
    let settings = WorkerSettings::load(None).unwrap();
    assert_eq!(settings.poll_interval_ms, 1_500);
    assert_eq!(settings.project_concurrency, 1);
    assert_eq!(settings.lease_ttl().as_secs(), 30);
    assert_eq!(settings.stuck_threshold().num_minutes(), 15);
    assert_eq!(settings.generate_timeout().as_secs(), 600);
}

#[test]
fn worker_settings_partial_toml() {
    let settings = WorkerSettings::from_toml(
        r#"
        project_concurrency = 3
        generate_poll_ms = 250

        [adapters]
        bg_remove_command = "tools/bg_remove"
        "#,
    )
    .unwrap();
    assert_eq!(settings.project_concurrency, 3);
    assert_eq!(settings.generate_poll().as_millis(), 250);
    assert_eq!(settings.heartbeat_interval_ms, 5_000);
    assert_eq!(
        settings.adapters.bg_remove_command.as_deref().and_then(|p| p.to_str()),
        Some("tools/bg_remove")
    );
    assert!(settings.adapters.atlas_pack_command.is_none());
}

#[test]
fn worker_settings_missing_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = WorkerSettings::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
    assert!(matches!(err, assetgen::Error::Config(_)));
}
