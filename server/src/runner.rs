//! Background process runner
//!
//! Runs a command as the leader of a new process group and captures its
//! output line by line. Terminating the runner signals the whole group, so
//! children the command forks (INDI drivers under `indiserver`) go with it.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Captured output lines kept per runner
const OUTPUT_HISTORY: usize = 500;

#[derive(Debug, Default)]
struct RunnerState {
    started: bool,
    finished: bool,
    pid: Option<u32>,
    output: VecDeque<String>,
    error: Option<String>,
}

/// One background process and its captured output
pub struct ProcessRunner {
    program: String,
    args: Vec<String>,
    state: Arc<Mutex<RunnerState>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessRunner {
    /// Run `program` with `args` directly
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            state: Arc::new(Mutex::new(RunnerState::default())),
            monitor: Mutex::new(None),
        }
    }

    /// Run a shell command line through `sh -c`
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new("sh", ["-c".to_string(), command.into()])
    }

    /// The command line as it would be typed
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Spawn the process and its output readers.
    ///
    /// Must be called within a tokio runtime. A spawn failure is recorded
    /// (see [`error`](Self::error)) and leaves the runner finished; the
    /// return value says whether a process is now running.
    pub fn start(&self) -> bool {
        let mut state = lock(&self.state);
        if state.started {
            tracing::warn!("Process already started: {}", self.command_line());
            return !state.finished;
        }
        state.started = true;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(false);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("Failed to spawn '{}': {}", self.command_line(), e);
                state.error = Some(e.to_string());
                state.finished = true;
                return false;
            }
        };

        state.pid = child.id();
        tracing::info!(
            "Started '{}' (pid {})",
            self.command_line(),
            state.pid.map(|p| p.to_string()).unwrap_or_default()
        );

        let stdout = child
            .stdout
            .take()
            .map(|out| spawn_reader(out, Arc::clone(&self.state)));
        let stderr = child
            .stderr
            .take()
            .map(|err| spawn_reader(err, Arc::clone(&self.state)));

        let monitor_state = Arc::clone(&self.state);
        let command_line = self.command_line();
        let monitor = tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!("'{}' exited: {}", command_line, status),
                Err(e) => tracing::warn!("Failed waiting for '{}': {}", command_line, e),
            }
            for reader in [stdout, stderr].into_iter().flatten() {
                let _ = reader.await;
            }
            lock(&monitor_state).finished = true;
        });
        drop(state);

        *lock(&self.monitor) = Some(monitor);
        true
    }

    /// True from a successful start until the process exits and its output is drained
    pub fn is_running(&self) -> bool {
        let state = lock(&self.state);
        state.started && !state.finished
    }

    /// Send SIGTERM to the whole process group.
    ///
    /// Does nothing when the runner never started or already finished.
    /// Signal failures are logged.
    pub fn terminate(&self) {
        let mut state = lock(&self.state);
        if !state.started || state.finished {
            return;
        }

        match state.pid.and_then(|pid| i32::try_from(pid).ok()) {
            Some(pid) => {
                tracing::info!("Terminating process group {}", pid);
                if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGTERM) {
                    tracing::warn!("Failed to signal process group {}: {}", pid, e);
                }
            }
            None => tracing::warn!("No pid for '{}', cannot signal", self.command_line()),
        }
        state.finished = true;
    }

    /// Wait for the process to exit and its readers to finish.
    ///
    /// Returns false if `timeout` elapsed first.
    pub async fn join(&self, timeout: Duration) -> bool {
        let monitor = lock(&self.monitor).take();
        match monitor {
            Some(monitor) => match tokio::time::timeout(timeout, monitor).await {
                Ok(_) => true,
                Err(_) => {
                    tracing::warn!("Timed out joining '{}'", self.command_line());
                    false
                }
            },
            None => true,
        }
    }

    /// Most recent captured output lines, stdout and stderr interleaved
    pub fn output(&self) -> Vec<String> {
        lock(&self.state).output.iter().cloned().collect()
    }

    /// Spawn error, if the process could not be started
    pub fn error(&self) -> Option<String> {
        lock(&self.state).error.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.state).pid
    }
}

fn spawn_reader<R>(stream: R, state: Arc<Mutex<RunnerState>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::info!(target: "indiserver", "{}", line);
                    let mut state = lock(&state);
                    if state.output.len() >= OUTPUT_HISTORY {
                        state.output.pop_front();
                    }
                    state.output.push_back(line);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("Output reader stopped: {}", e);
                    break;
                }
            }
        }
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let runner = ProcessRunner::shell("echo hello; echo oops 1>&2");
        assert!(runner.start());
        assert!(runner.pid().is_some());
        assert!(runner.join(Duration::from_secs(5)).await);

        assert!(!runner.is_running());
        let output = runner.output();
        assert!(output.contains(&"hello".to_string()));
        assert!(output.contains(&"oops".to_string()));
        assert!(runner.error().is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_finished() {
        let runner = ProcessRunner::new("/nonexistent/indiserver", ["-p", "7624"]);
        assert!(!runner.start());
        assert!(!runner.is_running());
        assert!(runner.error().is_some());
        assert!(runner.join(Duration::from_millis(100)).await);
        runner.terminate();
    }

    #[tokio::test]
    async fn test_terminate_kills_group_and_is_idempotent() {
        let runner = ProcessRunner::shell("sleep 30 & sleep 30; wait");
        assert!(runner.start());
        assert!(runner.is_running());

        runner.terminate();
        assert!(!runner.is_running());
        assert!(runner.join(Duration::from_secs(5)).await);

        runner.terminate();
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn test_terminate_before_start_is_noop() {
        let runner = ProcessRunner::shell("true");
        runner.terminate();
        assert!(!runner.is_running());
        assert!(runner.start());
        assert!(runner.join(Duration::from_secs(5)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_terminate_racing_start_leaves_no_process() {
        for _ in 0..10 {
            let runner = Arc::new(ProcessRunner::shell("sleep 30"));
            let barrier = Arc::new(std::sync::Barrier::new(2));

            let starter = {
                let (runner, barrier) = (Arc::clone(&runner), Arc::clone(&barrier));
                tokio::task::spawn_blocking(move || {
                    barrier.wait();
                    runner.start()
                })
            };
            let stopper = {
                let (runner, barrier) = (Arc::clone(&runner), Arc::clone(&barrier));
                tokio::task::spawn_blocking(move || {
                    barrier.wait();
                    runner.terminate();
                })
            };
            assert!(starter.await.unwrap());
            stopper.await.unwrap();

            // Either the race killed it or this does
            runner.terminate();
            assert!(!runner.is_running());
            assert!(runner.join(Duration::from_secs(5)).await);

            let pid = Pid::from_raw(runner.pid().unwrap() as i32);
            assert!(nix::sys::signal::kill(pid, None).is_err());
        }
    }

    #[test]
    fn test_command_line() {
        let runner = ProcessRunner::new("indiserver", ["-p", "7624", "-v"]);
        assert_eq!(runner.command_line(), "indiserver -p 7624 -v");
        assert_eq!(ProcessRunner::shell("ls").command_line(), "sh -c ls");
    }
}
