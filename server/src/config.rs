//! Supervisor configuration

use indiweb_indi::INDI_DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default path of the server control FIFO
pub const DEFAULT_FIFO_PATH: &str = "/tmp/indiFIFO";

/// Default directory holding driver descriptor files
pub const DEFAULT_DATA_DIR: &str = "/usr/share/indi/";

/// Paths and timing used to run `indiserver`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Named pipe the server reads driver commands from (default: /tmp/indiFIFO)
    pub fifo_path: PathBuf,
    /// Per-user INDI configuration directory (default: $HOME/.indi)
    pub config_dir: PathBuf,
    /// Directory scanned for driver descriptors (default: /usr/share/indi/)
    pub data_dir: PathBuf,
    /// Port used when none is given (default: 7624)
    pub port: u16,
    /// Server executable (default: indiserver)
    pub server_binary: String,
    /// Maximum queued messages per client, `-m` (default: 1000)
    pub max_queue: u32,
    /// Pass `-v` to the server
    pub verbose: bool,
    /// How long a FIFO write waits for the server to open its end (default: 5000ms)
    pub fifo_open_timeout_ms: u64,
    /// How long `stop` waits for output readers to finish (default: 5 seconds)
    pub shutdown_join_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            fifo_path: PathBuf::from(DEFAULT_FIFO_PATH),
            config_dir: default_config_dir(std::env::var_os("HOME").map(PathBuf::from)),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            port: INDI_DEFAULT_PORT,
            server_binary: "indiserver".to_string(),
            max_queue: 1000,
            verbose: true,
            fifo_open_timeout_ms: 5000,
            shutdown_join_secs: 5,
        }
    }
}

fn default_config_dir(home: Option<PathBuf>) -> PathBuf {
    match home {
        Some(home) => home.join(".indi"),
        None => PathBuf::from("/tmp/indi"),
    }
}

impl ServerConfig {
    /// Defaults with `INDI_DATA_DIR` and `HOME` taken from the environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self {
            config_dir: default_config_dir(lookup("HOME").map(PathBuf::from)),
            ..Self::default()
        };
        if let Some(dir) = lookup("INDI_DATA_DIR").filter(|d| !d.is_empty()) {
            config.data_dir = PathBuf::from(dir);
        }
        config
    }

    /// Control socket path, derived from the FIFO path
    pub fn socket_path(&self) -> PathBuf {
        let mut path = self.fifo_path.clone().into_os_string();
        path.push("_sock");
        PathBuf::from(path)
    }

    /// Full server command line for `port`
    pub fn command_line(&self, port: u16) -> String {
        let mut cmd = format!("{} -p {} -m {}", self.server_binary, port, self.max_queue);
        if self.verbose {
            cmd.push_str(" -v");
        }
        cmd.push_str(&format!(
            " -f {} -u {}",
            display(&self.fifo_path),
            display(&self.socket_path())
        ));
        cmd
    }

    pub fn fifo_open_timeout(&self) -> Duration {
        Duration::from_millis(self.fifo_open_timeout_ms)
    }

    pub fn shutdown_join_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_join_secs)
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
