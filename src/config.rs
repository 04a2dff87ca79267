use std::path::PathBuf;

use clap::Parser;

/// Default JSONL output path, matching `OUTPUT_FILE`'s documented default.
pub const DEFAULT_OUTPUT_FILE: &str = "/tmp/endpoints.json";

/// Default read-only mount path for the service registry config document,
/// re-exported so the CLI help text and [`beacon_registry::ServiceRegistry`]
/// never drift apart.
pub const DEFAULT_CONFIG_PATH: &str = beacon_registry::DEFAULT_MOUNT_PATH;

#[derive(Parser, Debug)]
#[command(
    name = "beacon",
    about = "Node-resident HTTP traffic observer and API-inventory sync agent",
    version
)]
pub struct Cli {
    /// Comma-separated interface names to capture on, overriding auto-selection.
    #[arg(long, value_delimiter = ',')]
    pub interfaces: Option<Vec<String>>,

    /// JSONL capture log destination; overrides `OUTPUT_FILE`.
    #[arg(long)]
    pub output_file: Option<PathBuf>,

    /// Service registry mount path; overrides `SERVICE_CONFIG_PATH`.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Node name reported on every capture; overrides `NODE_NAME`/hostname detection.
    #[arg(long)]
    pub node_name: Option<String>,
}

/// Fully resolved process configuration: CLI flags take precedence over
/// environment variables, which take precedence over built-in defaults —
/// the same precedence order the registry applies to its own config fields.
pub struct RuntimeConfig {
    pub interfaces: Option<Vec<String>>,
    pub output_file: PathBuf,
    pub config_path: PathBuf,
    pub node_name: String,
    pub enable_sync: bool,
    pub clear_saved_mappings: bool,
}

impl RuntimeConfig {
    pub fn resolve(cli: Cli) -> Self {
        let output_file = cli
            .output_file
            .or_else(|| std::env::var_os("OUTPUT_FILE").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_FILE));

        let config_path = cli
            .config
            .or_else(|| std::env::var_os("SERVICE_CONFIG_PATH").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let node_name = cli
            .node_name
            .or_else(|| std::env::var("NODE_NAME").ok())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
            .unwrap_or_else(|| "unknown-node".to_string());

        let enable_sync = env_flag("ENABLE_DEV_WEBSITE_INTEGRATION");
        let clear_saved_mappings = env_flag("CLEAR_SAVED_MAPPINGS");

        Self {
            interfaces: cli.interfaces,
            output_file,
            config_path,
            node_name,
            enable_sync,
            clear_saved_mappings,
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
