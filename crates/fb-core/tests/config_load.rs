use fb_core::config::{
    load_config_from_path, load_config_from_str, AuthAlgorithm, ConfigError, DataType,
};
use std::io::Write;
use std::time::Duration;

const FULL_CONFIG: &str = r#"
[gateway]
bind = "127.0.0.1:9100"
max_message_size = 65536
message_rate_limit_per_second = 50
outgoing_buffer_size = 32
authentication_timeout_seconds = 5
ping_interval_seconds = 20
ping_timeout_seconds = 4

[auth]
algorithm = "hs256"
secret = "super-secret"
issuer = "idp.example"
leeway_seconds = 10

[bus]
url = "memory://local"
client_name = "bridge-test"

[bus.reconnect]
initial_delay_ms = 100
max_delay_ms = 2000
max_attempts = 7

[[bus.streams]]
name = "telemetry"
subjects = ["telemetry.>"]
retention = "limits"
storage = "memory"
max_age_seconds = 3600
max_messages = 100000
description = "device telemetry"

[[bus.streams]]
name = "commands"
subjects = ["commands.>"]

[[bus.consumers]]
name = "historian-telemetry"
stream = "telemetry"
filter_subject = "telemetry.>"
ack_policy = "explicit"
ack_wait_seconds = 10
max_deliver = 3
deliver_policy = "all"

[bus.default_consumer]
default_batch_size = 16
fetch_timeout_ms = 250

[bus.publish_retry]
initial_delay_ms = 50
max_delay_ms = 1000
backoff_multiplier = 2.0
max_retries = 3
add_jitter = false

[historian]
batch_size = 100
batch_timeout_ms = 500
db_connection_string = "memory"

[[historian.consumers]]
name = "historian-telemetry"
stream = "telemetry"
data_type = "telemetry"
"#;

#[test]
fn full_config_round_trips_every_section() {
    let cfg = load_config_from_str(FULL_CONFIG).unwrap();

    assert_eq!(cfg.gateway.bind, "127.0.0.1:9100");
    assert_eq!(cfg.gateway.max_message_size, 65536);
    assert_eq!(cfg.gateway.message_rate_limit_per_second, 50);
    assert_eq!(cfg.gateway.authentication_timeout, Duration::from_secs(5));

    assert_eq!(cfg.auth.algorithm, AuthAlgorithm::Hs256);
    assert_eq!(cfg.auth.key_material, b"super-secret".to_vec());
    assert_eq!(cfg.auth.issuer.as_deref(), Some("idp.example"));

    assert_eq!(cfg.bus.streams.len(), 2);
    assert_eq!(cfg.bus.streams[0].name, "telemetry");
    assert_eq!(cfg.bus.streams[0].max_age, Some(Duration::from_secs(3600)));
    assert_eq!(cfg.bus.streams[1].retention, "limits");
    assert_eq!(cfg.bus.consumers[0].max_deliver, 3);
    assert_eq!(cfg.bus.default_consumer.default_batch_size, 16);
    assert_eq!(cfg.bus.reconnect.max_attempts, 7);
    assert!(!cfg.bus.publish_retry.add_jitter);

    assert!(cfg.historian.enabled, "consumers present implies enabled");
    assert_eq!(cfg.historian.batch_size, 100);
    assert_eq!(cfg.historian.consumers[0].data_type, DataType::Telemetry);
}

#[test]
fn minimal_config_fills_defaults() {
    let cfg = load_config_from_str(
        r#"
[auth]
secret = "s"
"#,
    )
    .unwrap();
    assert_eq!(cfg.gateway.bind, "0.0.0.0:8080");
    assert_eq!(cfg.gateway.max_message_size, 1024 * 1024);
    assert_eq!(cfg.gateway.authentication_timeout, Duration::from_secs(30));
    assert_eq!(cfg.bus.url, "memory://local");
    assert!(cfg.bus.streams.is_empty());
    assert!(!cfg.historian.enabled);
}

#[test]
fn missing_auth_section_is_an_error() {
    let err = load_config_from_str("[gateway]\n").unwrap_err();
    assert!(matches!(err, ConfigError::MissingField(f) if f == "auth"));
}

#[test]
fn stream_without_subjects_is_rejected() {
    let err = load_config_from_str(
        r#"
[auth]
secret = "s"

[[bus.streams]]
name = "telemetry"
"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::MissingField(f) if f.contains("subjects")));
}

#[test]
fn invalid_enumerations_are_rejected_with_field_names() {
    let err = load_config_from_str(
        r#"
[auth]
secret = "s"

[[bus.streams]]
name = "telemetry"
subjects = ["telemetry.>"]
retention = "forever"
"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue(m) if m.contains("retention")));

    let err = load_config_from_str(
        r#"
[auth]
secret = "s"

[[historian.consumers]]
name = "c"
stream = "s"
data_type = "video"
"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue(m) if m.contains("data_type")));
}

#[test]
fn push_consumer_requires_deliver_subject() {
    let err = load_config_from_str(
        r#"
[auth]
secret = "s"

[[bus.consumers]]
name = "pusher"
stream = "telemetry"
type = "push"
"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::MissingField(f) if f.contains("deliver_subject")));
}

#[test]
fn unknown_keys_are_ignored_not_fatal() {
    let cfg = load_config_from_str(
        r#"
[auth]
secret = "s"
future_option = true

[gateway]
max_message_size = 123
some_new_knob = "x"

[experimental]
anything = 1
"#,
    )
    .unwrap();
    assert_eq!(cfg.gateway.max_message_size, 123);
}

#[test]
fn secret_file_is_read_and_trimmed() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "  file-secret  ").unwrap();
    let cfg = load_config_from_str(&format!(
        "[auth]\nsecret_file = \"{}\"\n",
        file.path().display()
    ))
    .unwrap();
    assert_eq!(cfg.auth.key_material, b"file-secret".to_vec());
}

#[test]
fn load_from_path_reports_missing_file() {
    let err = load_config_from_path(std::path::Path::new("/nonexistent/bridge.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}
