//! Executor backed by real child processes.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender, unbounded};

use super::{CommandSpec, ExecResult, Executor, Invocation, OutputSink};

/// Default polling interval while waiting on a child after its pipes closed.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs each command as a child process with piped stdout/stderr.
///
/// Output from both streams is funnelled through a channel so lines reach the
/// sink as soon as they are read. A command that outlives the invocation
/// timeout is killed and reported as failed.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    poll_interval: Duration,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Which pipe a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Output gathered across every command of one invocation.
#[derive(Default)]
struct Captured {
    lines: Vec<String>,
    stdout: Vec<u8>,
}

impl Captured {
    fn push(&mut self, stream: Stream, chunk: &[u8], sink: &dyn OutputSink) {
        if stream == Stream::Stdout {
            self.stdout.extend_from_slice(chunk);
        }
        let line = clean_line(chunk);
        sink.write_line(&line);
        self.lines.push(line);
    }
}

/// How a single command ended.
enum Outcome {
    Exited(ExitStatus),
    TimedOut(Duration),
    SpawnFailed(std::io::Error),
    WaitFailed(std::io::Error),
}

impl Executor for ProcessExecutor {
    fn execute(&self, invocation: &Invocation, sink: &dyn OutputSink) -> ExecResult {
        let mut captured = Captured::default();
        let mut exit_code = None;

        for command in &invocation.commands {
            sink.write_line(&format!("» {}", command));
            log::debug!(
                "running `{}` in {}",
                command,
                invocation.working_dir.display()
            );

            let outcome = self.run(
                command,
                &invocation.working_dir,
                invocation.timeout,
                sink,
                &mut captured,
            );

            let failure = match outcome {
                Outcome::Exited(status) => {
                    exit_code = status.code();
                    if status.success() {
                        continue;
                    }
                    match status.code() {
                        Some(_) => None,
                        None => Some(format!("`{}` was terminated by a signal", command)),
                    }
                }
                Outcome::TimedOut(limit) => {
                    exit_code = None;
                    Some(format!("`{}` timed out after {:?}", command, limit))
                }
                Outcome::SpawnFailed(err) => {
                    exit_code = None;
                    Some(format!("failed to start `{}`: {}", command, err))
                }
                Outcome::WaitFailed(err) => {
                    exit_code = None;
                    Some(format!("failed to wait for `{}`: {}", command, err))
                }
            };

            if let Some(message) = failure {
                sink.write_line(&message);
                captured.lines.push(message);
            }
            return ExecResult::failed(exit_code, captured.lines).with_stdout(captured.stdout);
        }

        ExecResult {
            success: true,
            exit_code,
            output: captured.lines,
            stdout: captured.stdout,
        }
    }
}

impl ProcessExecutor {
    fn run(
        &self,
        command: &CommandSpec,
        working_dir: &Path,
        timeout: Option<Duration>,
        sink: &dyn OutputSink,
        captured: &mut Captured,
    ) -> Outcome {
        let mut cmd = Command::new(command.program());
        cmd.args(command.get_args())
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in command.get_envs() {
            cmd.env(key, value);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return Outcome::SpawnFailed(err),
        };

        let (tx, rx) = unbounded();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Stream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Stream::Stderr, tx.clone()));
        }
        drop(tx);

        // A limit too large to represent as an instant is no limit at all.
        let deadline = timeout.and_then(|limit| Instant::now().checked_add(limit));

        loop {
            let received = match deadline {
                Some(deadline) => rx.recv_deadline(deadline),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok((stream, chunk)) => captured.push(stream, &chunk, sink),
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    kill(&mut child);
                    // Keep whatever was already read; the readers finish on their own
                    // once every holder of the pipes is gone.
                    for (stream, chunk) in rx.try_iter() {
                        captured.push(stream, &chunk, sink);
                    }
                    return Outcome::TimedOut(timeout.unwrap_or_default());
                }
            }
        }

        for reader in readers {
            let _ = reader.join();
        }

        self.wait(&mut child, deadline, timeout)
    }

    /// Wait for a child whose pipes are already closed, honouring the deadline.
    fn wait(
        &self,
        child: &mut Child,
        deadline: Option<Instant>,
        timeout: Option<Duration>,
    ) -> Outcome {
        let Some(deadline) = deadline else {
            return match child.wait() {
                Ok(status) => Outcome::Exited(status),
                Err(err) => Outcome::WaitFailed(err),
            };
        };

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Outcome::Exited(status),
                Ok(None) if Instant::now() >= deadline => {
                    kill(child);
                    return Outcome::TimedOut(timeout.unwrap_or_default());
                }
                Ok(None) => thread::sleep(self.poll_interval),
                Err(err) => return Outcome::WaitFailed(err),
            }
        }
    }
}

fn kill(child: &mut Child) {
    if let Err(err) = child.kill() {
        log::warn!("failed to kill timed out child {}: {}", child.id(), err);
    }
    let _ = child.wait();
}

/// Forward raw chunks, each ending with its `\n` when it had one.
fn spawn_reader<R: Read + Send + 'static>(
    pipe: R,
    stream: Stream,
    tx: Sender<(Stream, Vec<u8>)>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        loop {
            let mut chunk = Vec::new();
            match reader.read_until(b'\n', &mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if tx.send((stream, chunk)).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Decode one output line for display, dropping its `\n` or `\r\n` ending.
fn clean_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::exec::BufferSink;
    use tempfile::tempdir;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").args(["-c", script])
    }

    #[test]
    fn clean_line_strips_trailing_carriage_return() {
        assert_eq!(clean_line(b"done\r"), "done");
    }

    #[test]
    fn clean_line_keeps_inner_carriage_returns() {
        assert_eq!(clean_line(b"a\rb\r"), "a\rb");
    }

    #[test]
    fn clean_line_handles_invalid_utf8() {
        assert_eq!(clean_line(b"caf\xff"), "caf\u{fffd}");
    }

    #[test]
    fn successful_command_captures_output() {
        let dir = tempdir().unwrap();
        let sink = BufferSink::new();
        let invocation = Invocation::new(dir.path(), sh("echo one; echo two"));

        let result = ProcessExecutor::new().execute(&invocation, &sink);

        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.output, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(
            sink.lines(),
            vec![
                "» sh -c echo one; echo two".to_string(),
                "one".to_string(),
                "two".to_string()
            ]
        );
    }

    #[test]
    fn stderr_is_captured_alongside_stdout() {
        let dir = tempdir().unwrap();
        let invocation = Invocation::new(dir.path(), sh("echo out; echo err >&2"));

        let result = ProcessExecutor::new().execute(&invocation, &BufferSink::new());

        assert!(result.success);
        assert_eq!(result.output.len(), 2);
        assert!(result.output.contains(&"out".to_string()));
        assert!(result.output.contains(&"err".to_string()));
    }

    #[test]
    fn failing_command_reports_exit_code() {
        let dir = tempdir().unwrap();
        let invocation = Invocation::new(dir.path(), sh("echo nope >&2; exit 3"));

        let result = ProcessExecutor::new().execute(&invocation, &BufferSink::new());

        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.output, vec!["nope".to_string()]);
    }

    #[test]
    fn sequence_stops_at_first_failure() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("ran");
        let invocation = Invocation::new(dir.path(), CommandSpec::new("false"))
            .then(CommandSpec::new("touch").arg(&marker));

        let result = ProcessExecutor::new().execute(&invocation, &BufferSink::new());

        assert!(!result.success);
        assert!(!marker.exists(), "second command must not run");
    }

    #[test]
    fn sequence_runs_every_command_on_success() {
        let dir = tempdir().unwrap();
        let invocation = Invocation::new(dir.path(), sh("echo a"))
            .then(sh("echo b"))
            .then(sh("echo c"));

        let result = ProcessExecutor::new().execute(&invocation, &BufferSink::new());

        assert!(result.success);
        assert_eq!(result.output, vec!["a", "b", "c"]);
    }

    #[test]
    fn commands_run_in_working_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let invocation = Invocation::new(dir.path(), CommandSpec::new("ls"));

        let result = ProcessExecutor::new().execute(&invocation, &BufferSink::new());

        assert!(result.success);
        assert_eq!(result.output, vec!["marker.txt".to_string()]);
    }

    #[test]
    fn working_dir_does_not_leak_between_invocations() {
        let dir = tempdir().unwrap();
        let before = std::env::current_dir().unwrap();
        let invocation = Invocation::new(dir.path(), CommandSpec::new("true"));

        ProcessExecutor::new().execute(&invocation, &BufferSink::new());

        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[test]
    fn env_is_passed_to_child() {
        let dir = tempdir().unwrap();
        let invocation = Invocation::new(
            dir.path(),
            sh("echo $REPOCACHE_TEST_VALUE").env("REPOCACHE_TEST_VALUE", "hello"),
        );

        let result = ProcessExecutor::new().execute(&invocation, &BufferSink::new());

        assert_eq!(result.output, vec!["hello".to_string()]);
    }

    #[test]
    fn missing_program_is_a_failure_not_a_panic() {
        let dir = tempdir().unwrap();
        let invocation = Invocation::new(
            dir.path(),
            CommandSpec::new("repocache-definitely-not-a-binary"),
        );

        let result = ProcessExecutor::new().execute(&invocation, &BufferSink::new());

        assert!(!result.success);
        assert_eq!(result.exit_code, None);
        assert!(result.text().contains("failed to start"));
    }

    #[test]
    fn clean_line_drops_line_ending() {
        assert_eq!(clean_line(b"v1.0\n"), "v1.0");
        assert_eq!(clean_line(b"v1.0\r\n"), "v1.0");
    }

    #[test]
    fn stdout_bytes_keep_crlf_and_invalid_utf8() {
        let dir = tempdir().unwrap();
        let invocation = Invocation::new(dir.path(), sh(r"printf 'a\r\nb\377\r\n'"));

        let result = ProcessExecutor::new().execute(&invocation, &BufferSink::new());

        assert!(result.success);
        assert_eq!(result.stdout, b"a\r\nb\xff\r\n");
        assert_eq!(result.output, vec!["a".to_string(), "b\u{fffd}".to_string()]);
    }

    #[test]
    fn stdout_bytes_exclude_stderr() {
        let dir = tempdir().unwrap();
        let invocation = Invocation::new(dir.path(), sh("echo out; echo err >&2"));

        let result = ProcessExecutor::new().execute(&invocation, &BufferSink::new());

        assert_eq!(result.stdout, b"out\n");
    }

    #[test]
    fn unrepresentable_timeout_means_no_deadline() {
        let dir = tempdir().unwrap();
        let invocation = Invocation::new(dir.path(), CommandSpec::new("true"))
            .with_timeout(Some(Duration::from_secs(u64::MAX)));

        let result = ProcessExecutor::new().execute(&invocation, &BufferSink::new());

        assert!(result.success);
    }

    #[test]
    fn timeout_kills_long_running_command() {
        let dir = tempdir().unwrap();
        let invocation = Invocation::new(dir.path(), CommandSpec::new("sleep").arg("5"))
            .with_timeout(Some(Duration::from_millis(200)));

        let start = Instant::now();
        let result = ProcessExecutor::new().execute(&invocation, &BufferSink::new());

        assert!(!result.success);
        assert!(result.text().contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(4));
    }
}
