//! `ScriptRunner` — runs one script in an isolated child process.
//!
//! Each call writes the script to its own temporary file, launches the
//! configured interpreter on it with a clean working directory, and races the
//! child against its timeout and a cancellation token. The temporary file is a
//! [`tempfile::NamedTempFile`], so it is removed on every exit path when the
//! guard drops.

use std::collections::HashMap;
use std::io::Write;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use taskschedule_core::config::RunnerConfig;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{Result, RunnerError},
    truncate,
    types::RunOutcome,
};

/// Hard ceiling on bytes buffered per stream before truncation; anything past
/// it is drained and dropped so the child never blocks on a full pipe.
const MAX_CAPTURE_BYTES: usize = 64 * 1024 * 1024;

/// How long to wait for the pipes to close after the child is gone.
const STREAM_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// How the wait on the child ended.
enum Ending {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// Executes scripts according to a [`RunnerConfig`].
///
/// Cheap to clone and safe to share between worker tasks: it holds no
/// per-run state.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    config: RunnerConfig,
}

impl ScriptRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run `script` with `env` overlaid on this process's environment.
    ///
    /// Never fails: launch errors come back as an outcome with no exit code
    /// and an `Execution error: ...` message in `stderr`.
    pub async fn run(
        &self,
        script: &str,
        env: &HashMap<String, String>,
        timeout_secs: u64,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        match self.try_run(script, env, timeout_secs, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "script could not be executed");
                RunOutcome::launch_failed(format!("Execution error: {e}"))
            }
        }
    }

    async fn try_run(
        &self,
        script: &str,
        env: &HashMap<String, String>,
        timeout_secs: u64,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let mut script_file = tempfile::Builder::new()
            .prefix("taskschedule-")
            .suffix(&self.config.script_suffix)
            .tempfile()?;
        script_file.write_all(script.as_bytes())?;
        script_file.flush()?;

        let mut cmd = Command::new(&self.config.interpreter);
        cmd.args(&self.config.interpreter_args)
            .arg(script_file.path())
            .envs(env)
            .current_dir(std::env::temp_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        isolate(&mut cmd, &self.config);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            interpreter: self.config.interpreter.clone(),
            source,
        })?;
        debug!(pid = ?child.id(), path = %script_file.path().display(), "script started");

        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        let deadline = Duration::from_secs(timeout_secs);
        let ending = tokio::select! {
            waited = tokio::time::timeout(deadline, child.wait()) => match waited {
                Ok(status) => Ending::Exited(status?),
                Err(_elapsed) => Ending::TimedOut,
            },
            _ = cancel.cancelled() => Ending::Cancelled,
        };

        if !matches!(ending, Ending::Exited(_)) {
            kill_process_group(&mut child).await;
        }
        let duration_ms = start.elapsed().as_millis() as u64;

        let stdout = self.finish_stream(stdout_task).await;
        let mut stderr = self.finish_stream(stderr_task).await;

        // removes the temp file; early returns above remove it on drop
        drop(script_file);

        let outcome = match ending {
            Ending::Exited(status) => {
                if let Some(note) = signal_note(&status) {
                    append_line(&mut stderr, &note);
                }
                RunOutcome {
                    exit_code: status.code(),
                    stdout,
                    stderr,
                    timed_out: false,
                    cancelled: false,
                    duration_ms,
                }
            }
            Ending::TimedOut => {
                append_line(
                    &mut stderr,
                    &format!("Script execution timed out after {timeout_secs} seconds"),
                );
                RunOutcome {
                    exit_code: None,
                    stdout,
                    stderr,
                    timed_out: true,
                    cancelled: false,
                    duration_ms,
                }
            }
            Ending::Cancelled => {
                append_line(&mut stderr, "Script execution cancelled");
                RunOutcome {
                    exit_code: None,
                    stdout,
                    stderr,
                    timed_out: false,
                    cancelled: true,
                    duration_ms,
                }
            }
        };
        Ok(outcome)
    }

    async fn finish_stream(&self, task: JoinHandle<Vec<u8>>) -> String {
        let abort = task.abort_handle();
        let raw = match tokio::time::timeout(STREAM_DRAIN_GRACE, task).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!(error = %e, "output reader task failed");
                Vec::new()
            }
            Err(_) => {
                // a grandchild outside the process group still holds the pipe
                abort.abort();
                warn!("output stream still open after child exit; capture abandoned");
                Vec::new()
            }
        };
        truncate::truncate_output(&strip_text(&raw), self.config.max_output_chars)
    }
}

/// Read a stream to EOF, keeping at most [`MAX_CAPTURE_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    let Some(mut reader) = handle else {
        return buf;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = MAX_CAPTURE_BYTES.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                debug!(error = %e, "output stream read error");
                break;
            }
        }
    }
    buf
}

/// Put the child in its own process group and apply rlimits before exec.
#[cfg(unix)]
fn isolate(cmd: &mut Command, config: &RunnerConfig) {
    cmd.process_group(0);

    let memory_bytes = config.max_memory_mb.map(|mb| mb.saturating_mul(1024 * 1024));
    let cpu_secs = config.max_cpu_secs;
    if memory_bytes.is_none() && cpu_secs.is_none() {
        return;
    }

    // Safety: the closure runs between fork and exec and only calls
    // setrlimit(2), which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || {
            if let Some(bytes) = memory_bytes {
                let limit = rlimit(bytes);
                if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            if let Some(secs) = cpu_secs {
                let limit = rlimit(secs);
                if libc::setrlimit(libc::RLIMIT_CPU, &limit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
}

#[cfg(unix)]
fn rlimit(value: u64) -> libc::rlimit {
    libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    }
}

/// SIGKILL the child's whole process group, then reap it.
async fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // Safety: the child leads its own group (process_group(0)), so the
            // negated pid addresses exactly the processes it spawned.
            unsafe {
                libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
            }
        }
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "start_kill after group kill");
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "failed to reap killed child");
    }
}

#[cfg(unix)]
fn signal_note(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status
        .signal()
        .map(|sig| format!("Process terminated by signal {sig}"))
}

#[cfg(not(unix))]
fn signal_note(_status: &ExitStatus) -> Option<String> {
    None
}

fn append_line(buf: &mut String, line: &str) {
    if !buf.is_empty() && !buf.ends_with('\n') {
        buf.push('\n');
    }
    buf.push_str(line);
}

/// Strip ANSI escape codes and convert bytes to a UTF-8 string.
fn strip_text(raw: &[u8]) -> String {
    let clean = strip_ansi_escapes::strip(raw);
    String::from_utf8_lossy(&clean).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_runner() -> ScriptRunner {
        ScriptRunner::new(RunnerConfig {
            interpreter: "sh".to_string(),
            script_suffix: ".sh".to_string(),
            ..RunnerConfig::default()
        })
    }

    fn no_env() -> HashMap<String, String> {
        HashMap::new()
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let outcome = sh_runner()
            .run("echo hello\n", &no_env(), 10, &CancellationToken::new())
            .await;
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout.trim(), "hello");
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn nonzero_exit_and_stderr() {
        let outcome = sh_runner()
            .run("echo oops >&2\nexit 3\n", &no_env(), 10, &CancellationToken::new())
            .await;
        assert_eq!(outcome.exit_code, Some(3));
        assert!(outcome.stderr.contains("oops"));
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn env_overlay_wins_over_inherited() {
        let mut env = no_env();
        env.insert("PATH_MARKER".to_string(), "overlay".to_string());
        env.insert("HOME".to_string(), "/nowhere".to_string());
        let outcome = sh_runner()
            .run(
                "echo \"$PATH_MARKER $HOME\"\n",
                &env,
                10,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.stdout.trim(), "overlay /nowhere");
    }

    #[tokio::test]
    async fn runs_in_temp_dir() {
        let outcome = sh_runner()
            .run("pwd\n", &no_env(), 10, &CancellationToken::new())
            .await;
        let expected = std::env::temp_dir().canonicalize().unwrap();
        let actual = std::path::PathBuf::from(outcome.stdout.trim())
            .canonicalize()
            .unwrap();
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn timeout_kills_child() {
        let started = Instant::now();
        let outcome = sh_runner()
            .run("sleep 5\n", &no_env(), 1, &CancellationToken::new())
            .await;
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome
            .stderr
            .contains("Script execution timed out after 1 seconds"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn cancellation_kills_child() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let outcome = sh_runner().run("sleep 5\n", &no_env(), 30, &cancel).await;
        assert!(outcome.cancelled);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
    }

    #[tokio::test]
    async fn missing_interpreter_is_reported_not_raised() {
        let runner = ScriptRunner::new(RunnerConfig {
            interpreter: "/definitely/not/an/interpreter".to_string(),
            ..RunnerConfig::default()
        });
        let outcome = runner
            .run("print(1)", &no_env(), 10, &CancellationToken::new())
            .await;
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.stderr.starts_with("Execution error:"));
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn temp_script_is_removed() {
        // the script prints its own path ($0) so we can check it afterwards
        let outcome = sh_runner()
            .run("echo \"$0\"\n", &no_env(), 10, &CancellationToken::new())
            .await;
        let path = std::path::PathBuf::from(outcome.stdout.trim());
        assert!(path.file_name().is_some());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn output_is_capped() {
        let runner = ScriptRunner::new(RunnerConfig {
            interpreter: "sh".to_string(),
            script_suffix: ".sh".to_string(),
            max_output_chars: 100,
            ..RunnerConfig::default()
        });
        let outcome = runner
            .run(
                "i=0; while [ $i -lt 200 ]; do echo line$i; i=$((i+1)); done\n",
                &no_env(),
                10,
                &CancellationToken::new(),
            )
            .await;
        assert!(outcome.stdout.contains("OUTPUT TRUNCATED"));
        assert!(outcome.stdout.starts_with("line0"));
        assert!(outcome.stdout.trim_end().ends_with("line199"));
    }
}
