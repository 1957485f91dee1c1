use std::path::PathBuf;

use clap::{Parser, Subcommand};
use echowire::{
    config::Config, control, logging, proxy, recorder::EventRecorder, recording::RecordingState,
    resolver::UpstreamResolver, store::Store,
};

#[derive(Debug, Parser)]
#[command(name = "echowire")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the control and proxy listeners.
    Serve {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_level } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;

            let store = Store::open(&config.storage.db_path)?;
            let recording = RecordingState::load(store.clone()).await?;
            let resolver = UpstreamResolver::new(
                store.clone(),
                recording.clone(),
                config.upstream.default_url.clone(),
            );
            let recorder = EventRecorder::new(store.clone());

            let control = control::serve(&config.control.listen, store, recording).await?;
            let proxy = proxy::serve(&config.proxy.listen, resolver, recorder).await?;
            eprintln!(
                "{}",
                startup_summary(&config, control.listen_addr, proxy.listen_addr)
            );

            tokio::signal::ctrl_c().await?;
            proxy.shutdown().await;
            control.shutdown().await;
        }
    }

    Ok(())
}

fn startup_summary(
    config: &Config,
    control_listen_addr: std::net::SocketAddr,
    proxy_listen_addr: std::net::SocketAddr,
) -> String {
    let default_upstream = config
        .upstream
        .default_url
        .as_deref()
        .unwrap_or("none");
    format!(
        "startup config: control_listen={}, proxy_listen={}, db_path={}, default_upstream={}",
        control_listen_addr,
        proxy_listen_addr,
        config.storage.db_path.display(),
        default_upstream
    )
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{Cli, Command, startup_summary};
    use clap::Parser;
    use echowire::config::Config;

    #[test]
    fn serve_parses_without_flags() {
        let cli = Cli::try_parse_from(["echowire", "serve"]).expect("cli parse should succeed");
        let Command::Serve { config, log_level } = cli.command;
        assert_eq!(config, None);
        assert_eq!(log_level, None);
    }

    #[test]
    fn serve_parses_with_config_and_log_level_flags() {
        let cli = Cli::try_parse_from([
            "echowire",
            "serve",
            "--config",
            "custom.toml",
            "--log-level",
            "debug",
        ])
        .expect("cli parse should succeed");
        let Command::Serve { config, log_level } = cli.command;
        assert_eq!(config, Some(PathBuf::from("custom.toml")));
        assert_eq!(log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn startup_summary_names_both_listeners() {
        let config = Config::from_toml_str(
            r#"
[upstream]
default_url = "http://fallback.example.com:8000"
"#,
        )
        .expect("config should parse");

        let summary = startup_summary(
            &config,
            "127.0.0.1:8080".parse().unwrap(),
            "127.0.0.1:9090".parse().unwrap(),
        );
        assert!(summary.contains("control_listen=127.0.0.1:8080"), "{summary}");
        assert!(summary.contains("proxy_listen=127.0.0.1:9090"), "{summary}");
        assert!(
            summary.contains("default_upstream=http://fallback.example.com:8000"),
            "{summary}"
        );
    }
}
