use clap::{Parser, Subcommand};
use std::path::PathBuf;

use livecook_viewer::config;

#[derive(Parser, Debug)]
#[command(name = "livecook-viewer")]
#[command(version)]
#[command(about = "Receive-only WebRTC viewer for live cooking streams", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/livecook-viewer.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    /// Signaling service base URL
    #[arg(long)]
    pub signaling_url: Option<String>,

    /// Streams API base URL
    #[arg(long)]
    pub catalog_url: Option<String>,

    /// Connection attempts per join
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Delay between attempts in milliseconds
    #[arg(long)]
    pub retry_delay_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Watch a live stream until Ctrl-C
    Join {
        /// Stream identifier
        stream_id: String,
    },
    /// List live and ended streams
    Streams,
    /// Show one stream's details
    Show {
        /// Stream identifier
        stream_id: String,
    },
    /// Run the HTTP control surface
    Serve {
        /// HTTP port
        #[arg(short, long)]
        port: Option<u16>,
    },
}

impl Args {
    /// Load the config file and apply command line overrides
    pub fn load_config(&self) -> anyhow::Result<config::Config> {
        let mut config = config::Config::load(&self.config)?;

        if let Some(url) = &self.signaling_url {
            config.signaling.base_url = url.clone();
        }
        if let Some(url) = &self.catalog_url {
            config.catalog.base_url = url.clone();
        }
        if let Some(max_attempts) = self.max_attempts {
            config.viewer.max_attempts = max_attempts;
        }
        if let Some(delay) = self.retry_delay_ms {
            config.viewer.retry_delay_ms = delay;
        }
        if let Command::Serve { port: Some(port) } = self.command {
            config.http.port = port;
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let args = Args::parse_from([
            "livecook-viewer",
            "--config",
            "/nonexistent/livecook-viewer.toml",
            "--signaling-url",
            "http://signal.local:5000",
            "--max-attempts",
            "5",
            "serve",
            "--port",
            "9000",
        ]);
        let config = args.load_config().unwrap();
        assert_eq!(config.signaling.consumer_url(), "http://signal.local:5000/consumer");
        assert_eq!(config.viewer.max_attempts, 5);
        assert_eq!(config.http.port, 9000);
    }

    #[test]
    fn invalid_override_fails_validation() {
        let args = Args::parse_from([
            "livecook-viewer",
            "--config",
            "/nonexistent/livecook-viewer.toml",
            "--max-attempts",
            "0",
            "streams",
        ]);
        assert!(args.load_config().is_err());
    }
}
