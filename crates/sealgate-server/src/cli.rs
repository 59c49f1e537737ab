use clap::{Args, Parser, Subcommand};
use sealgate_core::config::LogFormat;
use sealgate_core::ServiceConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "sealgate",
    version,
    about = "Issue and redeem capability tokens for pre-authorized SQL/CQL statements"
)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonArgs,

    // serve flags for a bare `sealgate` invocation
    #[command(flatten)]
    pub serve: ServeArgs,

    // defaults to `serve`
    #[command(subcommand)]
    pub cmd: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the HTTP API
    Serve(ServeArgs),
    /// Run only the expiry sweeper
    Worker,
}

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Log level or filter directive (RUST_LOG overrides)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// text | json
    #[arg(long, env = "LOG_FORMAT", default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Capability store file
    #[arg(long, env = "STORE_PATH", default_value = "sealgate.db", global = true)]
    pub store_path: PathBuf,

    /// Redis host; when set, the store is shared over the network
    #[arg(long, env = "STORE_HOST", global = true)]
    pub store_host: Option<String>,

    #[arg(long, env = "STORE_PORT", default_value_t = 6379, global = true)]
    pub store_port: u16,

    #[arg(long, env = "STORE_PASS", hide_env_values = true, global = true)]
    pub store_pass: Option<String>,

    #[arg(long, env = "STORE_PREFIX", default_value = "keys:", global = true)]
    pub store_prefix: String,

    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 60, global = true)]
    pub sweep_interval_secs: u64,

    #[arg(long, env = "SWEEP_BATCH_SIZE", default_value_t = 100, global = true)]
    pub sweep_batch_size: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Mount POST /sign on this instance
    #[arg(long, env = "SIGN_SERVER")]
    pub sign_server: bool,

    /// Also run the expiry sweeper in this process
    #[arg(long, env = "BACKGROUND_WORKER")]
    pub background_worker: bool,

    /// Comma-separated allowed origins; `*` allows any
    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    pub cors_origins: Vec<String>,

    /// Deadline for one backend call, in seconds
    #[arg(long, env = "EXEC_TIMEOUT_SECS", default_value_t = 30)]
    pub exec_timeout_secs: u64,
}

impl Cli {
    /// The command to run. Without a subcommand the binary serves, taking
    /// its serve flags from the top level.
    pub fn effective_command(&self) -> Command {
        self.cmd
            .clone()
            .unwrap_or_else(|| Command::Serve(self.serve.clone()))
    }

    pub fn config(&self) -> ServiceConfig {
        let c = &self.common;
        let mut config = ServiceConfig::default()
            .with_log_level(c.log_level.clone())
            .with_log_format(c.log_format)
            .with_store_path(c.store_path.clone())
            .with_store_prefix(c.store_prefix.clone())
            .with_sweep_interval(Duration::from_secs(c.sweep_interval_secs))
            .with_sweep_batch_size(c.sweep_batch_size);
        if let Some(host) = &c.store_host {
            config = config.with_store_host(host.clone(), c.store_port);
        }
        if let Some(pass) = &c.store_pass {
            config = config.with_store_pass(pass.clone());
        }

        match self.effective_command() {
            Command::Serve(s) => config
                .with_port(s.port)
                .with_sign_server(s.sign_server)
                .with_background_worker(s.background_worker)
                .with_cors_origins(s.cors_origins)
                .with_exec_timeout(Duration::from_secs(s.exec_timeout_secs)),
            Command::Worker => config.with_background_worker(true),
        }
    }
}
