//! Replica: fetch and cache JSON resources from the command line.
//!
//! Subcommands:
//! - `fetch`: load a URL through a replica, optionally cached in a file

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod fetch;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "replica")]
#[command(about = "Fetch and cache JSON resources", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a JSON resource and print it
    Fetch {
        /// URL of the resource
        url: String,

        /// Bearer access token
        #[arg(long, env = "REPLICA_TOKEN")]
        token: Option<String>,

        /// URL that exchanges the refresh token for a new access token
        #[arg(long, env = "REPLICA_REFRESH_URL")]
        refresh_url: Option<String>,

        /// Refresh token sent to the refresh URL
        #[arg(long, env = "REPLICA_REFRESH_TOKEN")]
        refresh_token: Option<String>,

        /// Cache the value in this JSON file
        #[arg(long, env = "REPLICA_CACHE_FILE")]
        cache_file: Option<std::path::PathBuf>,

        /// JSON file with replica settings
        #[arg(long, env = "REPLICA_CONFIG")]
        config: Option<std::path::PathBuf>,

        /// Ignore cached data and always fetch
        #[arg(long)]
        force: bool,

        /// Keep observing and print every state change until interrupted.
        /// REPLICA_WATCH accepts 1/true/yes/on or 0/false/no/off.
        #[arg(long, env = "REPLICA_WATCH", value_parser = parse_bool_env, default_value = "false")]
        watch: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "replica=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Fetch {
            url,
            token,
            refresh_url,
            refresh_token,
            cache_file,
            config,
            force,
            watch,
        } => {
            fetch::run(fetch::FetchOptions {
                url,
                token,
                refresh_url,
                refresh_token,
                cache_file,
                config,
                force,
                watch,
            })
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_env() {
        assert_eq!(parse_bool_env("YES"), Ok(true));
        assert_eq!(parse_bool_env("off"), Ok(false));
        assert_eq!(parse_bool_env(""), Ok(false));
        assert!(parse_bool_env("maybe").is_err());
    }

    #[test]
    fn test_fetch_args() {
        let cli = Cli::try_parse_from([
            "replica",
            "fetch",
            "https://example.com/items",
            "--token",
            "abc",
            "--watch",
        ])
        .unwrap();

        let Commands::Fetch {
            url, token, watch, ..
        } = cli.command;
        assert_eq!(url, "https://example.com/items");
        assert_eq!(token.as_deref(), Some("abc"));
        assert!(watch);
    }

    #[test]
    fn test_watch_defaults_to_false() {
        let cli = Cli::try_parse_from(["replica", "fetch", "https://example.com/items"]).unwrap();

        let Commands::Fetch { watch, .. } = cli.command;
        assert!(!watch);
    }
}
