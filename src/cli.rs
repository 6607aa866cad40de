//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Request-time authentication and authorization for the API gateway
#[derive(Parser, Debug)]
#[command(name = "gateway-auth")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "GATEWAY_AUTH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "GATEWAY_AUTH_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "GATEWAY_AUTH_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "GATEWAY_AUTH_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "GATEWAY_AUTH_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the auth server (default)
    Serve,

    /// Load and validate the configuration, print the effective settings
    CheckConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_serve_mode() {
        let cli = Cli::try_parse_from(["gateway-auth"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn parses_overrides_and_subcommand() {
        let cli = Cli::try_parse_from([
            "gateway-auth",
            "--config",
            "auth.yaml",
            "--port",
            "8443",
            "check-config",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.port, Some(8443));
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("auth.yaml")));
        assert_eq!(cli.log_format.as_deref(), Some("json"));
        assert!(matches!(cli.command, Some(Command::CheckConfig)));
    }
}
