//! Local subprocess runner.
//!
//! Output from both pipes is streamed line by line into the log files (and
//! the optional tee) while the supervisor loop polls for exit, timeout and
//! cancellation. The child runs in its own process group so termination
//! reaches anything it spawned.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::command::{CommandError, CommandOutput, CommandRunner, CommandSpec, LineSink, Stream};
use crate::outerr::FileOutErr;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Time an exited child's output gets to drain before its group is reaped
const GROUP_SETTLE: Duration = Duration::from_millis(200);

/// Runs commands as local child processes.
#[derive(Debug, Clone)]
pub struct LocalCommandRunner {
    termination_grace: Duration,
}

impl Default for LocalCommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Why the supervisor stopped the child
enum Stopped {
    Exited(ExitStatus),
    TimedOut(Duration),
    Cancelled,
}

impl LocalCommandRunner {
    /// `termination_grace` is the wait between SIGTERM and SIGKILL.
    pub fn new(termination_grace: Duration) -> Self {
        Self { termination_grace }
    }

    fn supervise(
        &self,
        child: &mut Child,
        timeout: Option<Duration>,
        cancel: &AtomicBool,
        start: Instant,
    ) -> Result<Stopped, CommandError> {
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Stopped::Exited(status));
            }
            if cancel.load(Ordering::SeqCst) {
                debug!(pid = child.id(), "cancel requested, terminating child");
                self.terminate_child(child)?;
                return Ok(Stopped::Cancelled);
            }
            if let Some(limit) = timeout {
                if start.elapsed() >= limit {
                    warn!(pid = child.id(), ?limit, "timeout exceeded, terminating child");
                    self.terminate_child(child)?;
                    return Ok(Stopped::TimedOut(limit));
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Terminate a child process gracefully then forcefully.
    fn terminate_child(&self, child: &mut Child) -> Result<(), CommandError> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            let pgid = Pid::from_raw(child.id() as i32);
            let _ = signal::killpg(pgid, Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = child.kill();
        }

        let start = Instant::now();
        while start.elapsed() < self.termination_grace {
            if child.try_wait()?.is_some() {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            let _ = signal::killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
        }
        let _ = child.kill();
        let _ = child.wait();
        Ok(())
    }

    /// Terminate what is left of an exited child's process group once
    /// `drained` stays false past a short settling period.
    fn reap_group(&self, pid: u32, drained: impl Fn() -> bool) {
        if wait_until(&drained, GROUP_SETTLE) {
            return;
        }
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            let pgid = Pid::from_raw(pid as i32);
            debug!(pgid = pid, "terminating leftover process group");
            let _ = signal::killpg(pgid, Signal::SIGTERM);
            if !wait_until(&drained, self.termination_grace) {
                warn!(pgid = pid, "process group ignored SIGTERM, killing");
                let _ = signal::killpg(pgid, Signal::SIGKILL);
            }
        }
        #[cfg(not(unix))]
        {
            warn!(pid, "output pipes still open after exit");
        }
    }
}

fn wait_until(done: &impl Fn() -> bool, limit: Duration) -> bool {
    let start = Instant::now();
    while !done() {
        if start.elapsed() >= limit {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    true
}

/// Copy a pipe into its log file line by line, forwarding each line to the tee.
fn pump<R: Read>(pipe: R, mut log: &File, tee: Option<&dyn LineSink>, stream: Stream) {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if let Err(e) = log.write_all(&buf) {
                    warn!(error = %e, "failed to write process output to log");
                }
                if let Some(sink) = tee {
                    let line = String::from_utf8_lossy(&buf);
                    sink.line(stream, line.trim_end_matches(['\n', '\r']));
                }
            }
            Err(e) => {
                debug!(error = %e, "output pipe closed with error");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn signal_of(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &ExitStatus) -> Option<i32> {
    None
}

impl CommandRunner for LocalCommandRunner {
    fn run(
        &self,
        spec: &CommandSpec,
        outerr: &FileOutErr,
        tee: Option<&dyn LineSink>,
        cancel: &AtomicBool,
    ) -> Result<CommandOutput, CommandError> {
        let (program, args) = spec.argv.split_first().ok_or(CommandError::EmptyCommand)?;

        if cancel.load(Ordering::SeqCst) {
            return Err(CommandError::Cancelled);
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&spec.working_dir)
            .env_clear()
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let start = Instant::now();
        let mut child = command.spawn().map_err(|source| CommandError::SpawnFailed {
            program: program.clone(),
            source,
        })?;
        debug!(pid = child.id(), program = %program, "spawned");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stopped = std::thread::scope(|scope| {
            let mut pumps = Vec::new();
            if let Some(pipe) = stdout {
                pumps.push(scope.spawn(move || pump(pipe, outerr.out(), tee, Stream::Stdout)));
            }
            if let Some(pipe) = stderr {
                pumps.push(scope.spawn(move || pump(pipe, outerr.err(), tee, Stream::Stderr)));
            }
            let stopped = self.supervise(&mut child, spec.timeout, cancel, start);
            if matches!(stopped, Ok(Stopped::Exited(_))) {
                // leftover group members would hold the pipes open
                self.reap_group(child.id(), || pumps.iter().all(|p| p.is_finished()));
            }
            stopped
        })?;

        let duration = start.elapsed();
        match stopped {
            Stopped::Cancelled => Err(CommandError::Cancelled),
            Stopped::TimedOut(after) => Err(CommandError::TimedOut { after }),
            Stopped::Exited(status) if status.success() => Ok(CommandOutput {
                exit_code: 0,
                duration,
                stdout: outerr.out_path().to_path_buf(),
                stderr: outerr.err_path().to_path_buf(),
            }),
            Stopped::Exited(status) => Err(CommandError::NonZeroExit {
                code: status.code(),
                signal: signal_of(&status),
                duration,
            }),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<(Stream, String)>>);

    impl LineSink for Collect {
        fn line(&self, stream: Stream, line: &str) {
            self.0.lock().unwrap().push((stream, line.to_string()));
        }
    }

    fn sh(script: &str, dir: &std::path::Path) -> CommandSpec {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        CommandSpec::new(
            vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            dir,
        )
        .with_env(env)
    }

    fn outerr(dir: &std::path::Path) -> FileOutErr {
        FileOutErr::create(dir.join("out.log"), dir.join("err.log")).unwrap()
    }

    #[test]
    fn test_success_writes_both_logs() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalCommandRunner::default();
        let io = outerr(dir.path());
        let cancel = AtomicBool::new(false);

        let output = runner
            .run(&sh("echo hello; echo oops >&2", dir.path()), &io, None, &cancel)
            .unwrap();

        assert_eq!(output.exit_code, 0);
        assert_eq!(fs::read_to_string(io.out_path()).unwrap(), "hello\n");
        assert_eq!(fs::read_to_string(io.err_path()).unwrap(), "oops\n");
    }

    #[test]
    fn test_non_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalCommandRunner::default();
        let io = outerr(dir.path());
        let cancel = AtomicBool::new(false);

        let err = runner
            .run(&sh("exit 3", dir.path()), &io, None, &cancel)
            .unwrap_err();

        assert_eq!(err.exit_code(), Some(3));
        assert!(!err.is_environmental());
    }

    #[test]
    fn test_spawn_failure_is_environmental() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalCommandRunner::default();
        let io = outerr(dir.path());
        let cancel = AtomicBool::new(false);
        let spec = CommandSpec::new(vec!["/nonexistent/keel-test-binary".to_string()], dir.path());

        let err = runner.run(&spec, &io, None, &cancel).unwrap_err();

        assert!(matches!(err, CommandError::SpawnFailed { .. }));
        assert!(err.is_environmental());
    }

    #[test]
    fn test_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalCommandRunner::default();
        let io = outerr(dir.path());
        let cancel = AtomicBool::new(false);
        let spec = CommandSpec::new(Vec::new(), dir.path());

        assert!(matches!(
            runner.run(&spec, &io, None, &cancel),
            Err(CommandError::EmptyCommand)
        ));
    }

    #[test]
    fn test_timeout_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalCommandRunner::new(Duration::from_millis(200));
        let io = outerr(dir.path());
        let cancel = AtomicBool::new(false);
        let spec = sh("sleep 10", dir.path()).with_timeout(Some(Duration::from_millis(100)));

        let start = Instant::now();
        let err = runner.run(&spec, &io, None, &cancel).unwrap_err();

        assert!(matches!(err, CommandError::TimedOut { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_background_process_does_not_outlive_exit() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalCommandRunner::new(Duration::from_millis(200));
        let io = outerr(dir.path());
        let cancel = AtomicBool::new(false);
        let spec = sh("echo started; sleep 8 & exit 0", dir.path())
            .with_timeout(Some(Duration::from_secs(1)));

        let start = Instant::now();
        let output = runner.run(&spec, &io, None, &cancel).unwrap();

        assert_eq!(output.exit_code, 0);
        assert!(start.elapsed() < Duration::from_secs(4));
        assert_eq!(fs::read_to_string(io.out_path()).unwrap(), "started\n");
    }

    #[test]
    fn test_cancel_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalCommandRunner::default();
        let io = outerr(dir.path());
        let cancel = AtomicBool::new(true);

        let err = runner
            .run(&sh("echo never", dir.path()), &io, None, &cancel)
            .unwrap_err();

        assert!(matches!(err, CommandError::Cancelled));
        assert_eq!(fs::read_to_string(io.out_path()).unwrap(), "");
    }

    #[test]
    fn test_tee_receives_lines() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalCommandRunner::default();
        let io = outerr(dir.path());
        let cancel = AtomicBool::new(false);
        let sink = Collect::default();

        runner
            .run(&sh("echo one; echo two", dir.path()), &io, Some(&sink), &cancel)
            .unwrap();

        let lines = sink.0.lock().unwrap();
        assert_eq!(
            *lines,
            vec![
                (Stream::Stdout, "one".to_string()),
                (Stream::Stdout, "two".to_string())
            ]
        );
    }

    #[test]
    fn test_environment_is_exactly_spec_env() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalCommandRunner::default();
        let io = outerr(dir.path());
        let cancel = AtomicBool::new(false);
        let mut env = BTreeMap::new();
        env.insert("KEEL_ONLY".to_string(), "yes".to_string());
        let spec = sh("echo \"$KEEL_ONLY:${HOME:-unset}\"", dir.path()).with_env(env);

        runner.run(&spec, &io, None, &cancel).unwrap();

        assert_eq!(fs::read_to_string(io.out_path()).unwrap(), "yes:unset\n");
    }
}
