use anyhow::bail;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat};

/// Environment override for the log filter, e.g. `ECHOWIRE_LOG=debug`.
pub const LOG_ENV_VAR: &str = "ECHOWIRE_LOG";

/// Installs the global tracing subscriber. Filter precedence: `--log-level`,
/// then `ECHOWIRE_LOG`, then the config file, then `info`.
pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let env_level = std::env::var(LOG_ENV_VAR).ok();
    let filter = resolve_log_filter(config, cli_level_override, env_level.as_deref())?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match resolve_log_format(config) {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    }
    .map_err(|err| anyhow::anyhow!("install tracing subscriber: {err}"))?;

    Ok(())
}

fn resolve_log_filter(
    config: &Config,
    cli_level: Option<&str>,
    env_level: Option<&str>,
) -> anyhow::Result<EnvFilter> {
    let level = cli_level
        .or(env_level)
        .or_else(|| {
            config
                .logging
                .as_ref()
                .and_then(|logging| logging.level.as_deref())
        })
        .unwrap_or("info")
        .trim()
        .to_ascii_lowercase();

    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" | "off" => Ok(EnvFilter::new(level)),
        other => bail!(
            "unrecognized log level `{other}` (expected trace, debug, info, warn, error, or off)"
        ),
    }
}

fn resolve_log_format(config: &Config) -> LogFormat {
    config
        .logging
        .as_ref()
        .and_then(|logging| logging.format)
        .unwrap_or(LogFormat::Json)
}

#[cfg(test)]
mod tests {
    use super::{resolve_log_filter, resolve_log_format};
    use crate::config::{Config, LogFormat};

    fn configured_logging() -> Config {
        Config::from_toml_str(
            r#"
[logging]
level = "warn"
format = "pretty"
"#,
        )
        .expect("config should parse")
    }

    fn filter_string(config: &Config, cli: Option<&str>, env: Option<&str>) -> String {
        resolve_log_filter(config, cli, env)
            .expect("filter should resolve")
            .to_string()
    }

    #[test]
    fn log_filter_defaults_to_info() {
        assert_eq!(filter_string(&Config::default(), None, None), "info");
    }

    #[test]
    fn log_filter_precedence_is_cli_then_env_then_config() {
        let config = configured_logging();
        assert_eq!(filter_string(&config, Some("debug"), Some("error")), "debug");
        assert_eq!(filter_string(&config, None, Some("error")), "error");
        assert_eq!(filter_string(&config, None, None), "warn");
    }

    #[test]
    fn unrecognized_log_level_is_rejected() {
        let err = resolve_log_filter(&Config::default(), Some("verbose"), None).unwrap_err();
        assert!(
            err.to_string().contains("unrecognized log level"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn log_format_defaults_to_json_and_can_be_pretty() {
        assert_eq!(resolve_log_format(&Config::default()), LogFormat::Json);
        assert_eq!(resolve_log_format(&configured_logging()), LogFormat::Pretty);
    }
}
