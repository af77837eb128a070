// ABOUTME: Integration tests for configuration parsing and validation.
// ABOUTME: Tests YAML parsing, file discovery and environment overrides.

use berth::config::*;
use berth::error::Error;
use berth::runtime::{BackendKind, Endpoint};
use std::time::Duration;

mod parsing {
    use super::*;

    #[test]
    fn parse_full_config() {
        let yaml = r#"
backend:
  kind: docker
  endpoint: unix:///var/run/docker.sock
  connect_timeout: 3s
  call_timeout: 1m
  namespace: ci
  log_root: /tmp/berth-logs

retry:
  max_attempts: 6
  initial_backoff: 50ms
  max_backoff: 2s
  multiplier: 1.5

poll_interval: 1s
stop_timeout: 20s
kill_grace: 2s
remove_on_close: true

labels:
  team: infra
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.backend.kind, Some(BackendKind::Docker));
        assert_eq!(
            config.backend.endpoint().unwrap(),
            Some(Endpoint::Unix("/var/run/docker.sock".into()))
        );
        assert_eq!(config.backend.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.backend.call_timeout, Duration::from_secs(60));
        assert_eq!(config.retry.max_attempts, 6);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(50));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.stop_timeout, Duration::from_secs(20));
        assert!(config.remove_on_close);
        assert_eq!(config.labels["team"], ConfigValue::from("infra"));

        let cri = config.backend.cri_options();
        assert_eq!(cri.namespace, "ci");
        assert_eq!(cri.log_root, std::path::PathBuf::from("/tmp/berth-logs"));
    }

    #[test]
    fn tcp_endpoint() {
        let config =
            Config::from_yaml("backend:\n  kind: cri\n  endpoint: tcp://10.0.0.5:10010\n").unwrap();
        assert_eq!(
            config.backend.endpoint().unwrap(),
            Some(Endpoint::Tcp {
                host: "10.0.0.5".to_string(),
                port: 10010
            })
        );
    }

    #[test]
    fn unknown_backend_kind_returns_error() {
        let err = Config::from_yaml("backend:\n  kind: lxc\n").unwrap_err();
        assert!(matches!(err, Error::Yaml(_)), "{err}");
    }

    #[test]
    fn zero_call_timeout_is_invalid() {
        let err = Config::from_yaml("backend:\n  call_timeout: 0s\n").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn zero_attempts_is_invalid() {
        let err = Config::from_yaml("retry:\n  max_attempts: 0\n").unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn missing_env_label_without_default_fails() {
        let config =
            Config::from_yaml("labels:\n  commit: { env: BERTH_TEST_SURELY_UNSET }\n").unwrap();
        temp_env::with_var_unset("BERTH_TEST_SURELY_UNSET", || {
            let err = config.resolved_labels().unwrap_err();
            assert!(matches!(err, Error::MissingEnvVar(var) if var == "BERTH_TEST_SURELY_UNSET"));
        });
    }
}

mod discovery {
    use super::*;
    use std::fs;

    #[test]
    fn finds_primary_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("berth.yml"), "stop_timeout: 42s\n").unwrap();

        let config = Config::discover(dir.path()).unwrap();
        assert_eq!(config.stop_timeout, Duration::from_secs(42));
    }

    #[test]
    fn prefers_yml_over_yaml() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("berth.yml"), "kill_grace: 1s\n").unwrap();
        fs::write(dir.path().join("berth.yaml"), "kill_grace: 9s\n").unwrap();

        let config = Config::discover(dir.path()).unwrap();
        assert_eq!(config.kill_grace, Duration::from_secs(1));
    }

    #[test]
    fn finds_dot_directory_config() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".berth")).unwrap();
        fs::write(
            dir.path().join(".berth/config.yml"),
            "remove_on_close: true\n",
        )
        .unwrap();

        let config = Config::discover(dir.path()).unwrap();
        assert!(config.remove_on_close);
    }

    #[test]
    fn missing_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::discover(dir.path()).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(_)));

        let config = Config::discover_or_default(dir.path()).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
    }
}

mod environment {
    use super::*;

    #[test]
    fn env_overrides_file_values() {
        let mut config = Config::from_yaml("backend:\n  kind: docker\n").unwrap();
        temp_env::with_vars(
            [
                (ENV_BACKEND, Some("containerd")),
                (ENV_ENDPOINT, Some("unix:///run/containerd/containerd.sock")),
            ],
            || config.apply_env().unwrap(),
        );
        assert_eq!(config.backend.kind, Some(BackendKind::Cri));
        assert_eq!(
            config.backend.endpoint.as_deref(),
            Some("unix:///run/containerd/containerd.sock")
        );
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut config = Config::from_yaml("backend:\n  kind: docker\n").unwrap();
        temp_env::with_vars(
            [(ENV_BACKEND, Some("")), (ENV_ENDPOINT, None::<&str>)],
            || config.apply_env().unwrap(),
        );
        assert_eq!(config.backend.kind, Some(BackendKind::Docker));
        assert_eq!(config.backend.endpoint, None);
    }

    #[test]
    fn bad_env_backend_is_invalid_config() {
        let mut config = Config::default();
        let result = temp_env::with_var(ENV_BACKEND, Some("lxc"), || config.apply_env());
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn bad_env_endpoint_is_invalid_config() {
        let mut config = Config::default();
        let result = temp_env::with_var(ENV_ENDPOINT, Some("ftp://nope"), || config.apply_env());
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
