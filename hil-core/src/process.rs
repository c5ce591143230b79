//! External process invocation with a wall-clock guard time.
//!
//! Every privileged operation of the pipeline (builder, flasher, environment
//! scripts, tool version queries) goes through a [`ProcessRunner`]. A guard
//! time expiry kills the whole process group and is reported as an ordinary
//! failure; callers cannot tell the two apart.

use std::borrow::Cow;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::Instant;

use crate::env::Environment;

/// One external command to run.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub guard_time: Option<Duration>,
    /// Run through `sh -c` instead of executing `argv[0]` directly.
    pub shell: bool,
    /// Variables set on top of the inherited environment.
    pub env: Environment,
    /// Source the command in a shell and capture the environment it leaves.
    pub capture_env: bool,
    pub working_dir: Option<PathBuf>,
}

impl Invocation {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn guard_time(mut self, guard_time: Duration) -> Self {
        self.guard_time = Some(guard_time);
        self
    }

    pub fn shell(mut self) -> Self {
        self.shell = true;
        self
    }

    pub fn env(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    pub fn capture_env(mut self) -> Self {
        self.capture_env = true;
        self.shell = true;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// The argument list as one shell-safe command line.
    pub fn command_line(&self) -> String {
        quote(self.argv.iter().map(String::as_str))
    }

    /// The command line for `.`, which searches `PATH` for a bare script
    /// name, so relative scripts are anchored to the working directory.
    fn sourced_line(&self) -> String {
        let mut argv = self.argv.iter().map(|arg| Cow::Borrowed(arg.as_str()));
        let script = argv.next().map(|script| {
            if Path::new(&*script).is_relative() && !script.starts_with("./") {
                Cow::Owned(format!("./{}", script))
            } else {
                script
            }
        });
        quote(script.into_iter().chain(argv))
    }
}

fn quote<'a, I, S>(argv: I) -> String
where
    I: IntoIterator<Item = S>,
    S: Into<Cow<'a, str>>,
{
    argv.into_iter()
        .map(|arg| shell_escape::escape(arg.into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// What came back from an invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub success: bool,
    /// Only populated in capture mode, and only on success.
    pub captured_env: Environment,
}

impl RunOutcome {
    pub fn failed() -> Self {
        RunOutcome::default()
    }

    pub fn succeeded() -> Self {
        RunOutcome {
            success: true,
            captured_env: Environment::new(),
        }
    }
}

/// Runs external commands. Never fails: problems are logged and reported as
/// an unsuccessful [`RunOutcome`].
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> RunOutcome;
}

/// [`ProcessRunner`] backed by `tokio::process` and `/bin/sh`.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        ShellRunner
    }

    fn command(invocation: &Invocation) -> io::Result<Command> {
        let mut command = if invocation.capture_env {
            // Script chatter goes to stderr so stdout carries only the dump.
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(format!(". {} 1>&2 && env", invocation.sourced_line()));
            cmd
        } else if invocation.shell {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(invocation.command_line());
            cmd
        } else {
            let (program, args) = invocation
                .argv
                .split_first()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argv"))?;
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        };

        command
            .envs(invocation.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }
        command.process_group(0);
        Ok(command)
    }

    async fn execute(&self, invocation: &Invocation) -> io::Result<RunOutcome> {
        // One deadline covers the child and everything holding its pipes.
        let deadline = invocation.guard_time.map(|limit| Instant::now() + limit);
        let mut child = Self::command(invocation)?.spawn()?;
        let pid = child.id();

        let keep_stdout = invocation.capture_env;
        let mut stdout_task = tokio::spawn(drain(child.stdout.take(), "stdout", keep_stdout));
        let mut stderr_task = tokio::spawn(drain(child.stderr.take(), "stderr", false));

        let finished = async {
            let status = child.wait().await?;
            let captured = (&mut stdout_task).await.unwrap_or_default();
            let _ = (&mut stderr_task).await;
            Ok::<_, io::Error>((status, captured))
        };
        let finished = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, finished).await,
            None => Ok(finished.await),
        };

        let (status, captured) = match finished {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    command = %invocation.command_line(),
                    guard_secs = invocation.guard_time.map(|d| d.as_secs()),
                    "Guard time expired, killing process group"
                );
                kill_group(pid);
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Ok(RunOutcome::failed());
            }
        };

        if !status.success() {
            tracing::warn!(
                command = %invocation.command_line(),
                status = %status,
                "Command failed"
            );
            return Ok(RunOutcome::failed());
        }

        let captured_env = if keep_stdout {
            Environment::parse_dump(&captured.join("\n"))
        } else {
            Environment::new()
        };
        Ok(RunOutcome {
            success: true,
            captured_env,
        })
    }
}

#[async_trait]
impl ProcessRunner for ShellRunner {
    async fn run(&self, invocation: &Invocation) -> RunOutcome {
        let cwd = invocation
            .working_dir
            .as_ref()
            .map(|dir| dir.display().to_string())
            .unwrap_or_else(|| ".".to_string());
        tracing::info!(
            cwd = %cwd,
            command = %invocation.command_line(),
            guard_secs = invocation.guard_time.map(|d| d.as_secs()),
            "Calling"
        );

        match self.execute(invocation).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    command = %invocation.command_line(),
                    err = %e,
                    "Unable to run command"
                );
                RunOutcome::failed()
            }
        }
    }
}

/// Read a child stream to the end, logging each line or keeping it.
async fn drain<R>(reader: Option<R>, stream: &'static str, keep: bool) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let Some(reader) = reader else {
        return kept;
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if keep {
            kept.push(line);
        } else {
            tracing::debug!(stream, "{}", line);
        }
    }
    kept
}

/// SIGKILL the process group led by `pid` so shell grandchildren die too.
fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        tracing::debug!(pid, err = %e, "Process group already gone");
    }
}
