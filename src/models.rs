use anyhow::Context as _;
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A named upstream target configuration that sessions belong to. The stored
/// `config_json` is always the normalized shape produced by
/// [`normalize_project_config`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub config_json: String,
    pub created_at: String,
}

/// A named, sealable capture slot under a project. Sealed sessions may not be
/// recorded into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub created_at: String,
    pub sealed: bool,
}

/// One captured request/response exchange, ordered within its session by a
/// gap-free `seq` starting at 1. Bodies hold the raw captured bytes, capped at
/// the proxy's capture limit; in JSON they appear base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub session_id: String,
    pub seq: i64,
    pub started_at: String,
    pub ended_at: String,
    pub method: String,
    pub url: String,
    pub status: i64,
    pub req_headers: String,
    pub resp_headers: String,
    #[serde(with = "base64_bytes")]
    pub req_body: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub resp_body: Vec<u8>,
    pub redaction_applied: String,
}

mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

pub fn generate_project_id() -> String {
    format!("proj_{}", uuid::Uuid::new_v4())
}

pub fn generate_session_id() -> String {
    format!("sess_{}", uuid::Uuid::new_v4())
}

pub fn generate_event_id() -> String {
    format!("event_{}", uuid::Uuid::new_v4())
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Normalized upstream target read by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectConfig {
    pub name: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl ProjectConfig {
    pub fn upstream_base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Loose input shape: normalized keys with legacy aliases as fallback.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawProjectConfig {
    #[serde(rename = "targetName")]
    target_name: String,
    #[serde(rename = "targetScheme")]
    target_scheme: String,
    #[serde(rename = "targetHost")]
    target_host: String,
    #[serde(rename = "targetPort")]
    target_port: i64,
    scheme: String,
    host: String,
    port: i64,
}

#[derive(Debug, Serialize)]
struct NormalizedProjectConfig<'a> {
    #[serde(rename = "targetName")]
    target_name: &'a str,
    #[serde(rename = "targetScheme")]
    target_scheme: &'a str,
    #[serde(rename = "targetHost")]
    target_host: &'a str,
    #[serde(rename = "targetPort")]
    target_port: u16,
}

/// Parses project config JSON, resolving legacy aliases and validating the
/// scheme/host/port contract.
pub fn parse_project_config(config_json: &str) -> anyhow::Result<ProjectConfig> {
    let raw: RawProjectConfig =
        serde_json::from_str(config_json).context("invalid config_json")?;

    let scheme = first_non_empty(raw.target_scheme.trim(), raw.scheme.trim());
    let scheme = if scheme.is_empty() { "http" } else { scheme };
    let host = first_non_empty(raw.target_host.trim(), raw.host.trim());
    let port = if raw.target_port != 0 {
        raw.target_port
    } else {
        raw.port
    };

    if scheme != "http" && scheme != "https" {
        anyhow::bail!("config_json: scheme must be http or https");
    }
    if host.is_empty() {
        anyhow::bail!("config_json: host is required");
    }
    let port =
        u16::try_from(port).ok().filter(|port| *port > 0).ok_or_else(|| {
            anyhow::anyhow!("config_json: port out of range")
        })?;

    Ok(ProjectConfig {
        name: raw.target_name.trim().to_owned(),
        scheme: scheme.to_owned(),
        host: host.to_owned(),
        port,
    })
}

/// Validates and rewrites config JSON into the canonical normalized shape.
/// Runs once at project create/update so every downstream reader consumes only
/// normalized keys.
pub fn normalize_project_config(config_json: &str) -> anyhow::Result<String> {
    let config = parse_project_config(config_json)?;
    let normalized = NormalizedProjectConfig {
        target_name: &config.name,
        target_scheme: &config.scheme,
        target_host: &config.host,
        target_port: config.port,
    };
    serde_json::to_string(&normalized).context("serialize normalized config_json")
}

fn first_non_empty<'a>(primary: &'a str, fallback: &'a str) -> &'a str {
    if primary.is_empty() { fallback } else { primary }
}

#[cfg(test)]
mod tests {
    use super::{
        Event, encode_base64, generate_event_id, generate_project_id, generate_session_id,
        normalize_project_config, now_rfc3339, parse_project_config,
    };

    #[test]
    fn parses_normalized_config_shape() {
        let config = parse_project_config(
            r#"{"targetName":"demo","targetScheme":"https","targetHost":"api.example.com","targetPort":443}"#,
        )
        .unwrap();
        assert_eq!(config.name, "demo");
        assert_eq!(config.scheme, "https");
        assert_eq!(config.host, "api.example.com");
        assert_eq!(config.port, 443);
        assert_eq!(config.upstream_base_url(), "https://api.example.com:443");
    }

    #[test]
    fn legacy_aliases_are_accepted_as_fallback() {
        let config =
            parse_project_config(r#"{"scheme":"http","host":"legacy.example.com","port":8080}"#)
                .unwrap();
        assert_eq!(config.scheme, "http");
        assert_eq!(config.host, "legacy.example.com");
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn normalized_keys_win_over_aliases() {
        let config = parse_project_config(
            r#"{"targetHost":"new.example.com","host":"old.example.com","targetPort":9000,"port":1}"#,
        )
        .unwrap();
        assert_eq!(config.host, "new.example.com");
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn missing_scheme_defaults_to_http() {
        let config =
            parse_project_config(r#"{"targetHost":"api.example.com","targetPort":80}"#).unwrap();
        assert_eq!(config.scheme, "http");
    }

    #[test]
    fn rejects_invalid_scheme_host_and_port() {
        let err = parse_project_config(
            r#"{"targetScheme":"ftp","targetHost":"api.example.com","targetPort":80}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("scheme must be http or https"));

        let err = parse_project_config(r#"{"targetScheme":"http","targetPort":80}"#).unwrap_err();
        assert!(err.to_string().contains("host is required"));

        let err = parse_project_config(
            r#"{"targetHost":"api.example.com","targetPort":65536}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("port out of range"));

        let err =
            parse_project_config(r#"{"targetHost":"api.example.com","targetPort":-1}"#).unwrap_err();
        assert!(err.to_string().contains("port out of range"));
    }

    #[test]
    fn normalize_rewrites_aliases_to_canonical_keys() {
        let normalized =
            normalize_project_config(r#"{"host":"api.example.com","port":80}"#).unwrap();
        assert_eq!(
            normalized,
            r#"{"targetName":"","targetScheme":"http","targetHost":"api.example.com","targetPort":80}"#
        );

        // Already-normalized input is a fixpoint.
        assert_eq!(normalize_project_config(&normalized).unwrap(), normalized);
    }

    #[test]
    fn generated_ids_carry_typed_prefixes() {
        assert!(generate_project_id().starts_with("proj_"));
        assert!(generate_session_id().starts_with("sess_"));
        assert!(generate_event_id().starts_with("event_"));
    }

    #[test]
    fn timestamps_are_rfc3339() {
        let now = now_rfc3339();
        assert!(chrono::DateTime::parse_from_rfc3339(&now).is_ok(), "{now}");
    }

    #[test]
    fn event_json_round_trips_bodies_as_base64() {
        let event = Event {
            id: "event_1".to_owned(),
            session_id: "sess_1".to_owned(),
            seq: 1,
            started_at: now_rfc3339(),
            ended_at: now_rfc3339(),
            method: "POST".to_owned(),
            url: "/widgets?x=1".to_owned(),
            status: 201,
            req_headers: "{}".to_owned(),
            resp_headers: "{}".to_owned(),
            req_body: vec![0x00, 0xff, 0x80],
            resp_body: b"plain".to_vec(),
            redaction_applied: String::new(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(&encode_base64(&[0x00, 0xff, 0x80])));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
