//! Bridge configuration loading.
//!
//! TOML is the sole config source.  Raw `Option`-typed structs are
//! deserialized first, then validated into concrete config with defaults.
//! Unknown keys warn instead of failing so operators can forward-declare
//! options for newer builds.
//!
//! # Required fields
//! - `auth.secret` or `auth.secret_file` (hs256), or `auth.public_key_pem_file` (rs256)
//!
//! Everything else has a default.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

/// Top-level bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub gateway: GatewayConfig,
    pub auth: AuthConfig,
    pub bus: BusConfig,
    pub historian: HistorianConfig,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: String,
    /// Validator payload cap, in bytes.
    pub max_message_size: usize,
    pub message_rate_limit_per_second: u64,
    /// Outbound buffer bound, drop-oldest.
    pub outgoing_buffer_size: usize,
    pub authentication_timeout: Duration,
    /// Idle threshold before the server pings.
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub drain_window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAlgorithm {
    Hs256,
    Rs256,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub algorithm: AuthAlgorithm,
    /// HS256 secret bytes, or the PEM bytes for RS256.
    pub key_material: Vec<u8>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub leeway_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub url: String,
    pub client_name: String,
    pub reconnect: ReconnectConfig,
    pub streams: Vec<StreamSpec>,
    pub consumers: Vec<ConsumerSpec>,
    pub default_consumer: DefaultConsumerConfig,
    pub publish_retry: PublishRetryConfig,
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// 0 means retry forever.
    pub max_attempts: u32,
}

/// Declarative stream definition (declaration order is resolution order).
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: String,
    pub storage: String,
    pub max_age: Option<Duration>,
    pub max_messages: Option<u64>,
    pub max_bytes: Option<u64>,
    pub max_message_size: Option<usize>,
    pub replicas: u8,
    pub discard: String,
    pub deny_delete: bool,
    pub deny_purge: bool,
    pub allow_direct: bool,
    pub allow_rollup: bool,
    pub description: Option<String>,
}

/// Declarative durable-consumer definition.
#[derive(Debug, Clone)]
pub struct ConsumerSpec {
    pub name: String,
    pub stream: String,
    pub filter_subject: Option<String>,
    pub ack_policy: String,
    pub ack_wait: Duration,
    pub max_deliver: u32,
    pub max_ack_pending: usize,
    pub deliver_policy: String,
    pub replay_policy: String,
    pub kind: String,
    pub deliver_subject: Option<String>,
    pub deliver_group: Option<String>,
    pub idle_heartbeat: Option<Duration>,
    pub flow_control: bool,
}

#[derive(Debug, Clone)]
pub struct DefaultConsumerConfig {
    pub default_batch_size: usize,
    pub fetch_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PublishRetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_retries: u32,
    pub add_jitter: bool,
}

#[derive(Debug, Clone)]
pub struct HistorianConfig {
    pub enabled: bool,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub writer_queue_size: usize,
    pub enable_audit_logging: bool,
    pub enable_integrity_checks: bool,
    pub db_connection_string: String,
    pub consumers: Vec<HistorianConsumerSpec>,
}

#[derive(Debug, Clone)]
pub struct HistorianConsumerSpec {
    pub name: String,
    pub stream: String,
    pub filter_subject: Option<String>,
    pub data_type: DataType,
    pub enabled: bool,
}

/// Payload family a historian consumer ingests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Telemetry,
    Event,
    Alert,
    QualityInspection,
}

impl DataType {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "telemetry" => DataType::Telemetry,
            "event" => DataType::Event,
            "alert" => DataType::Alert,
            "quality_inspection" => DataType::QualityInspection,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    gateway: Option<RawGateway>,
    auth: Option<RawAuth>,
    bus: Option<RawBus>,
    historian: Option<RawHistorian>,
}

#[derive(Debug, Deserialize)]
struct RawGateway {
    bind: Option<String>,
    max_message_size: Option<usize>,
    message_rate_limit_per_second: Option<u64>,
    outgoing_buffer_size: Option<usize>,
    authentication_timeout_seconds: Option<u64>,
    ping_interval_seconds: Option<u64>,
    ping_timeout_seconds: Option<u64>,
    drain_window_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawAuth {
    algorithm: Option<String>,
    secret: Option<String>,
    secret_file: Option<String>,
    public_key_pem_file: Option<String>,
    issuer: Option<String>,
    audience: Option<String>,
    leeway_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawBus {
    url: Option<String>,
    client_name: Option<String>,
    reconnect: Option<RawReconnect>,
    streams: Option<Vec<RawStream>>,
    consumers: Option<Vec<RawConsumer>>,
    default_consumer: Option<RawDefaultConsumer>,
    publish_retry: Option<RawPublishRetry>,
}

#[derive(Debug, Deserialize)]
struct RawReconnect {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawStream {
    name: Option<String>,
    subjects: Option<Vec<String>>,
    retention: Option<String>,
    storage: Option<String>,
    max_age_seconds: Option<u64>,
    max_messages: Option<u64>,
    max_bytes: Option<u64>,
    max_message_size: Option<usize>,
    replicas: Option<u8>,
    discard: Option<String>,
    deny_delete: Option<bool>,
    deny_purge: Option<bool>,
    allow_direct: Option<bool>,
    allow_rollup: Option<bool>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConsumer {
    name: Option<String>,
    stream: Option<String>,
    filter_subject: Option<String>,
    ack_policy: Option<String>,
    ack_wait_seconds: Option<u64>,
    max_deliver: Option<u32>,
    max_ack_pending: Option<usize>,
    deliver_policy: Option<String>,
    replay_policy: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    deliver_subject: Option<String>,
    deliver_group: Option<String>,
    idle_heartbeat_seconds: Option<u64>,
    flow_control: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawDefaultConsumer {
    default_batch_size: Option<usize>,
    fetch_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawPublishRetry {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    backoff_multiplier: Option<f64>,
    max_retries: Option<u32>,
    add_jitter: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawHistorian {
    enabled: Option<bool>,
    batch_size: Option<usize>,
    batch_timeout_ms: Option<u64>,
    writer_queue_size: Option<usize>,
    enable_audit_logging: Option<bool>,
    enable_integrity_checks: Option<bool>,
    db_connection_string: Option<String>,
    consumers: Option<Vec<RawHistorianConsumer>>,
}

#[derive(Debug, Deserialize)]
struct RawHistorianConsumer {
    name: Option<String>,
    stream: Option<String>,
    filter_subject: Option<String>,
    data_type: Option<String>,
    enabled: Option<bool>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load bridge config from a file path.
pub fn load_config_from_path(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load bridge config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<BridgeConfig, ConfigError> {
    let value: toml::Value =
        toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    warn_unknown_keys(&value);

    let raw: RawConfig =
        value.try_into().map_err(|e| ConfigError::Parse(e.to_string()))?;

    let gateway = build_gateway(raw.gateway);
    let auth = build_auth(raw.auth)?;
    let bus = build_bus(raw.bus)?;
    let historian = build_historian(raw.historian)?;

    Ok(BridgeConfig {
        gateway,
        auth,
        bus,
        historian,
    })
}

// ---------------------------------------------------------------------------
// Section builders
// ---------------------------------------------------------------------------

fn build_gateway(raw: Option<RawGateway>) -> GatewayConfig {
    let g = raw.unwrap_or(RawGateway {
        bind: None,
        max_message_size: None,
        message_rate_limit_per_second: None,
        outgoing_buffer_size: None,
        authentication_timeout_seconds: None,
        ping_interval_seconds: None,
        ping_timeout_seconds: None,
        drain_window_seconds: None,
    });
    GatewayConfig {
        bind: g.bind.unwrap_or_else(|| "0.0.0.0:8080".to_owned()),
        max_message_size: g.max_message_size.unwrap_or(1024 * 1024),
        message_rate_limit_per_second: g.message_rate_limit_per_second.unwrap_or(100),
        outgoing_buffer_size: g.outgoing_buffer_size.unwrap_or(256),
        authentication_timeout: Duration::from_secs(
            g.authentication_timeout_seconds.unwrap_or(30),
        ),
        ping_interval: Duration::from_secs(g.ping_interval_seconds.unwrap_or(30)),
        ping_timeout: Duration::from_secs(g.ping_timeout_seconds.unwrap_or(10)),
        drain_window: Duration::from_secs(g.drain_window_seconds.unwrap_or(10)),
    }
}

fn build_auth(raw: Option<RawAuth>) -> Result<AuthConfig, ConfigError> {
    let a = raw.ok_or_else(|| ConfigError::MissingField("auth".to_owned()))?;
    let algorithm = match a.algorithm.as_deref().unwrap_or("hs256") {
        "hs256" => AuthAlgorithm::Hs256,
        "rs256" => AuthAlgorithm::Rs256,
        other => {
            return Err(ConfigError::InvalidValue(format!(
                "auth.algorithm must be hs256 or rs256, got '{other}'"
            )))
        }
    };
    let key_material = match algorithm {
        AuthAlgorithm::Hs256 => match (a.secret, a.secret_file) {
            (Some(secret), _) => secret.into_bytes(),
            (None, Some(path)) => read_key_file(&path)?,
            (None, None) => {
                return Err(ConfigError::MissingField(
                    "auth.secret or auth.secret_file".to_owned(),
                ))
            }
        },
        AuthAlgorithm::Rs256 => {
            let path = a.public_key_pem_file.ok_or_else(|| {
                ConfigError::MissingField("auth.public_key_pem_file".to_owned())
            })?;
            read_key_file(&path)?
        }
    };
    Ok(AuthConfig {
        algorithm,
        key_material,
        issuer: a.issuer,
        audience: a.audience,
        leeway_seconds: a.leeway_seconds.unwrap_or(30),
    })
}

fn build_bus(raw: Option<RawBus>) -> Result<BusConfig, ConfigError> {
    let b = raw.unwrap_or(RawBus {
        url: None,
        client_name: None,
        reconnect: None,
        streams: None,
        consumers: None,
        default_consumer: None,
        publish_retry: None,
    });

    let reconnect = match b.reconnect {
        Some(r) => ReconnectConfig {
            initial_delay: Duration::from_millis(r.initial_delay_ms.unwrap_or(500)),
            max_delay: Duration::from_millis(r.max_delay_ms.unwrap_or(10_000)),
            max_attempts: r.max_attempts.unwrap_or(0),
        },
        None => ReconnectConfig {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(10_000),
            max_attempts: 0,
        },
    };

    let mut streams = Vec::new();
    for (i, s) in b.streams.unwrap_or_default().into_iter().enumerate() {
        let name = s
            .name
            .ok_or_else(|| ConfigError::MissingField(format!("bus.streams[{i}].name")))?;
        let subjects = s
            .subjects
            .ok_or_else(|| ConfigError::MissingField(format!("bus.streams[{i}].subjects")))?;
        if subjects.is_empty() {
            return Err(ConfigError::InvalidValue(format!(
                "bus.streams[{i}].subjects must not be empty"
            )));
        }
        streams.push(StreamSpec {
            name,
            subjects,
            retention: validate_choice(
                s.retention.unwrap_or_else(|| "limits".to_owned()),
                &["limits", "interest", "work_queue"],
                &format!("bus.streams[{i}].retention"),
            )?,
            storage: validate_choice(
                s.storage.unwrap_or_else(|| "file".to_owned()),
                &["memory", "file"],
                &format!("bus.streams[{i}].storage"),
            )?,
            max_age: s.max_age_seconds.map(Duration::from_secs),
            max_messages: s.max_messages,
            max_bytes: s.max_bytes,
            max_message_size: s.max_message_size,
            replicas: s.replicas.unwrap_or(1),
            discard: validate_choice(
                s.discard.unwrap_or_else(|| "old".to_owned()),
                &["old", "new"],
                &format!("bus.streams[{i}].discard"),
            )?,
            deny_delete: s.deny_delete.unwrap_or(false),
            deny_purge: s.deny_purge.unwrap_or(false),
            allow_direct: s.allow_direct.unwrap_or(true),
            allow_rollup: s.allow_rollup.unwrap_or(false),
            description: s.description,
        });
    }

    let mut consumers = Vec::new();
    for (i, c) in b.consumers.unwrap_or_default().into_iter().enumerate() {
        let name = c
            .name
            .ok_or_else(|| ConfigError::MissingField(format!("bus.consumers[{i}].name")))?;
        let stream = c
            .stream
            .ok_or_else(|| ConfigError::MissingField(format!("bus.consumers[{i}].stream")))?;
        let kind = validate_choice(
            c.kind.unwrap_or_else(|| "pull".to_owned()),
            &["pull", "push"],
            &format!("bus.consumers[{i}].type"),
        )?;
        if kind == "push" && c.deliver_subject.is_none() {
            return Err(ConfigError::MissingField(format!(
                "bus.consumers[{i}].deliver_subject (required for push consumers)"
            )));
        }
        consumers.push(ConsumerSpec {
            name,
            stream,
            filter_subject: c.filter_subject,
            ack_policy: validate_choice(
                c.ack_policy.unwrap_or_else(|| "explicit".to_owned()),
                &["none", "all", "explicit"],
                &format!("bus.consumers[{i}].ack_policy"),
            )?,
            ack_wait: Duration::from_secs(c.ack_wait_seconds.unwrap_or(30)),
            max_deliver: c.max_deliver.unwrap_or(5),
            max_ack_pending: c.max_ack_pending.unwrap_or(1000),
            deliver_policy: validate_choice(
                c.deliver_policy.unwrap_or_else(|| "all".to_owned()),
                &["all", "new", "last", "last_per_subject"],
                &format!("bus.consumers[{i}].deliver_policy"),
            )?,
            replay_policy: validate_choice(
                c.replay_policy.unwrap_or_else(|| "instant".to_owned()),
                &["instant", "original"],
                &format!("bus.consumers[{i}].replay_policy"),
            )?,
            kind,
            deliver_subject: c.deliver_subject,
            deliver_group: c.deliver_group,
            idle_heartbeat: c.idle_heartbeat_seconds.map(Duration::from_secs),
            flow_control: c.flow_control.unwrap_or(false),
        });
    }

    let default_consumer = match b.default_consumer {
        Some(d) => DefaultConsumerConfig {
            default_batch_size: d.default_batch_size.unwrap_or(64),
            fetch_timeout: Duration::from_millis(d.fetch_timeout_ms.unwrap_or(5000)),
        },
        None => DefaultConsumerConfig {
            default_batch_size: 64,
            fetch_timeout: Duration::from_millis(5000),
        },
    };

    let publish_retry = match b.publish_retry {
        Some(p) => PublishRetryConfig {
            initial_delay: Duration::from_millis(p.initial_delay_ms.unwrap_or(100)),
            max_delay: Duration::from_millis(p.max_delay_ms.unwrap_or(5000)),
            backoff_multiplier: p.backoff_multiplier.unwrap_or(2.0),
            max_retries: p.max_retries.unwrap_or(5),
            add_jitter: p.add_jitter.unwrap_or(true),
        },
        None => PublishRetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5000),
            backoff_multiplier: 2.0,
            max_retries: 5,
            add_jitter: true,
        },
    };

    Ok(BusConfig {
        url: b.url.unwrap_or_else(|| "memory://local".to_owned()),
        client_name: b.client_name.unwrap_or_else(|| "fluxbridge".to_owned()),
        reconnect,
        streams,
        consumers,
        default_consumer,
        publish_retry,
    })
}

fn build_historian(raw: Option<RawHistorian>) -> Result<HistorianConfig, ConfigError> {
    let Some(h) = raw else {
        return Ok(HistorianConfig {
            enabled: false,
            batch_size: 500,
            batch_timeout: Duration::from_millis(1000),
            writer_queue_size: 1000,
            enable_audit_logging: true,
            enable_integrity_checks: true,
            db_connection_string: "memory".to_owned(),
            consumers: Vec::new(),
        });
    };

    let mut consumers = Vec::new();
    for (i, c) in h.consumers.unwrap_or_default().into_iter().enumerate() {
        let data_type_str = c
            .data_type
            .ok_or_else(|| ConfigError::MissingField(format!("historian.consumers[{i}].data_type")))?;
        let data_type = DataType::parse(&data_type_str).ok_or_else(|| {
            ConfigError::InvalidValue(format!(
                "historian.consumers[{i}].data_type '{data_type_str}' is not one of \
                 telemetry, event, alert, quality_inspection"
            ))
        })?;
        consumers.push(HistorianConsumerSpec {
            name: c
                .name
                .ok_or_else(|| ConfigError::MissingField(format!("historian.consumers[{i}].name")))?,
            stream: c
                .stream
                .ok_or_else(|| ConfigError::MissingField(format!("historian.consumers[{i}].stream")))?,
            filter_subject: c.filter_subject,
            data_type,
            enabled: c.enabled.unwrap_or(true),
        });
    }

    Ok(HistorianConfig {
        enabled: h.enabled.unwrap_or(!consumers.is_empty()),
        batch_size: h.batch_size.unwrap_or(500),
        batch_timeout: Duration::from_millis(h.batch_timeout_ms.unwrap_or(1000)),
        writer_queue_size: h.writer_queue_size.unwrap_or(1000),
        enable_audit_logging: h.enable_audit_logging.unwrap_or(true),
        enable_integrity_checks: h.enable_integrity_checks.unwrap_or(true),
        db_connection_string: h.db_connection_string.unwrap_or_else(|| "memory".to_owned()),
        consumers,
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate_choice(
    value: String,
    choices: &[&str],
    field: &str,
) -> Result<String, ConfigError> {
    if choices.contains(&value.as_str()) {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue(format!(
            "{field} must be one of {choices:?}, got '{value}'"
        )))
    }
}

fn read_key_file(path: &str) -> Result<Vec<u8>, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading key file '{path}': {e}")))?;
    Ok(content.trim().as_bytes().to_vec())
}

const KNOWN_SECTIONS: &[&str] = &["gateway", "auth", "bus", "historian"];

const KNOWN_KEYS: &[(&str, &[&str])] = &[
    (
        "gateway",
        &[
            "bind",
            "max_message_size",
            "message_rate_limit_per_second",
            "outgoing_buffer_size",
            "authentication_timeout_seconds",
            "ping_interval_seconds",
            "ping_timeout_seconds",
            "drain_window_seconds",
        ],
    ),
    (
        "auth",
        &[
            "algorithm",
            "secret",
            "secret_file",
            "public_key_pem_file",
            "issuer",
            "audience",
            "leeway_seconds",
        ],
    ),
    (
        "bus",
        &[
            "url",
            "client_name",
            "reconnect",
            "streams",
            "consumers",
            "default_consumer",
            "publish_retry",
        ],
    ),
    (
        "historian",
        &[
            "enabled",
            "batch_size",
            "batch_timeout_ms",
            "writer_queue_size",
            "enable_audit_logging",
            "enable_integrity_checks",
            "db_connection_string",
            "consumers",
        ],
    ),
];

fn warn_unknown_keys(value: &toml::Value) {
    let Some(table) = value.as_table() else { return };
    for (section, entry) in table {
        if !KNOWN_SECTIONS.contains(&section.as_str()) {
            warn!(key = %section, "unrecognized config section, ignoring");
            continue;
        }
        let Some(known) = KNOWN_KEYS
            .iter()
            .find(|(name, _)| name == section)
            .map(|(_, keys)| *keys)
        else {
            continue;
        };
        if let Some(section_table) = entry.as_table() {
            for key in section_table.keys() {
                if !known.contains(&key.as_str()) {
                    warn!(key = %format!("{section}.{key}"), "unrecognized config key, ignoring");
                }
            }
        }
    }
}
