//! Process table inspection
//!
//! Finds server processes by command line so a server started by an earlier
//! manager instance (or by hand) can still be detected and killed.

use crate::error::{ServerError, ServerResult};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};

/// Access to the running processes of the host
pub trait ProcessTable: Send + Sync {
    /// Pids of processes named `binary` whose arguments contain `-p <port>`
    fn find_server(&self, binary: &str, port: u16) -> ServerResult<Vec<i32>>;

    /// Kill one process with SIGKILL; a process that is already gone is not an error
    fn kill(&self, pid: i32) -> ServerResult<()>;
}

/// [`ProcessTable`] backed by a procfs mount
#[derive(Debug, Clone)]
pub struct ProcFsTable {
    root: PathBuf,
}

impl Default for ProcFsTable {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFsTable {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn command_line(&self, pid: i32) -> Option<Vec<String>> {
        let raw = std::fs::read(self.root.join(pid.to_string()).join("cmdline")).ok()?;
        Some(
            raw.split(|b| *b == 0)
                .filter(|arg| !arg.is_empty())
                .map(|arg| String::from_utf8_lossy(arg).into_owned())
                .collect(),
        )
    }
}

impl ProcessTable for ProcFsTable {
    fn find_server(&self, binary: &str, port: u16) -> ServerResult<Vec<i32>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| {
            ServerError::ProcessTableUnavailable(format!("{}: {}", self.root.display(), e))
        })?;

        let wanted = program_name(binary);
        let mut pids: Vec<i32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
            .filter(|pid| {
                // Processes can exit between listing and reading
                self.command_line(*pid)
                    .map_or(false, |argv| matches_server(&argv, wanted, port))
            })
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    fn kill(&self, pid: i32) -> ServerResult<()> {
        match kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ServerError::Io(std::io::Error::from(e))),
        }
    }
}

/// Last path component of a program, as process tables report it
pub(crate) fn program_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

fn matches_server(argv: &[String], binary: &str, port: u16) -> bool {
    let name_matches = argv
        .first()
        .map_or(false, |arg0| program_name(arg0) == binary);
    name_matches
        && argv
            .windows(2)
            .any(|pair| pair[0] == "-p" && pair[1].parse::<u16>().ok() == Some(port))
}
