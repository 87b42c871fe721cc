//! External tool execution.
//!
//! Every interaction with an external binary (docker, tar, restic, hook
//! shells, infisical) goes through the [`CommandRunner`] trait so the
//! orchestration logic can be exercised without real tools. The production
//! implementation drives `tokio::process` with a hard timeout per command;
//! an expired timeout kills the child process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::time::timeout;

use crate::utils::TOOL_PROBE_TIMEOUT;

/// One external command invocation: program, arguments, working directory,
/// extra environment and a mandatory timeout.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// The command line as one string, for log and error messages.
    pub fn display_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a completed command. A non-zero exit status is not an
/// error at this level; callers that require success use [`run_checked`].
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("'{program}' not found on PATH")]
    NotFound { program: String },

    #[error("'{program}' timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("'{program}' exited with status {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion, capturing stdout and stderr.
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, ToolError>;

    /// Run the command, streaming its stdout through a gzip encoder into
    /// `dest`. Returns the compressed size on disk. Unlike [`run`], a
    /// non-zero exit status is an error here: a partial dump is worthless.
    ///
    /// [`run`]: CommandRunner::run
    async fn run_gzip_to_file(&self, spec: CommandSpec, dest: &Path) -> Result<u64, ToolError>;
}

/// Run a command and require a zero exit status.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    spec: CommandSpec,
) -> Result<CommandOutput, ToolError> {
    let program = spec.program.clone();
    let output = runner.run(spec).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(ToolError::Failed {
            program,
            code: output.status,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// Probe whether a binary is installed by invoking `--version`.
pub async fn tool_available(runner: &dyn CommandRunner, program: &str) -> bool {
    let spec = CommandSpec::new(program, TOOL_PROBE_TIMEOUT).arg("--version");
    !matches!(runner.run(spec).await, Err(ToolError::NotFound { .. }))
}

/// Run a configured hook command through `sh -c`. Hook failures never fail
/// the enclosing job; they are reported and swallowed.
pub async fn run_hook(
    runner: &dyn CommandRunner,
    label: &str,
    command: &str,
    cwd: &Path,
    timeout: Duration,
) {
    let spec = CommandSpec::new("sh", timeout).args(["-c", command]).cwd(cwd);
    match runner.run(spec).await {
        Ok(output) if output.success() => {}
        Ok(output) => println!(
            "⚠ {} hook exited with status {:?}: {}",
            label,
            output.status,
            output.stderr.trim()
        ),
        Err(err) => println!("⚠ {} hook failed: {}", label, err),
    }
}

/// Production runner backed by `tokio::process`. `kill_on_drop` guarantees
/// that a timed-out child does not outlive its invocation.
pub struct SystemRunner;

impl SystemRunner {
    fn command(spec: &CommandSpec) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd
    }

    fn spawn_error(program: &str, err: std::io::Error) -> ToolError {
        if err.kind() == std::io::ErrorKind::NotFound {
            ToolError::NotFound {
                program: program.to_string(),
            }
        } else {
            ToolError::Io(err)
        }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, ToolError> {
        let child = Self::command(&spec)
            .spawn()
            .map_err(|e| Self::spawn_error(&spec.program, e))?;

        let output = timeout(spec.timeout, child.wait_with_output())
            .await
            .map_err(|_| ToolError::TimedOut {
                program: spec.program.clone(),
                timeout: spec.timeout,
            })??;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_gzip_to_file(&self, spec: CommandSpec, dest: &Path) -> Result<u64, ToolError> {
        use async_compression::tokio::write::GzipEncoder;

        let mut child = Self::command(&spec)
            .spawn()
            .map_err(|e| Self::spawn_error(&spec.program, e))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            ToolError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "child stdout was not piped",
            ))
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| {
            ToolError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "child stderr was not piped",
            ))
        })?;

        let work = async {
            let file = tokio::fs::File::create(dest).await?;
            let mut encoder = GzipEncoder::new(BufWriter::new(file));
            let mut reader = BufReader::new(stdout);
            let mut err_buf = String::new();

            let copy = tokio::io::copy(&mut reader, &mut encoder);
            let drain = stderr.read_to_string(&mut err_buf);
            tokio::try_join!(copy, drain)?;

            encoder.shutdown().await?;
            let status = child.wait().await?;
            std::io::Result::Ok((status, err_buf))
        };

        let (status, err_buf) = timeout(spec.timeout, work)
            .await
            .map_err(|_| ToolError::TimedOut {
                program: spec.program.clone(),
                timeout: spec.timeout,
            })??;

        if !status.success() {
            return Err(ToolError::Failed {
                program: spec.program.clone(),
                code: status.code(),
                stderr: err_buf.trim().to_string(),
            });
        }

        Ok(tokio::fs::metadata(dest).await?.len())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_status() {
        let runner = SystemRunner;
        let spec = CommandSpec::new("sh", Duration::from_secs(5)).args(["-c", "echo hello; exit 3"]);
        let out = runner.run(spec).await.unwrap();
        assert_eq!(out.status, Some(3));
        assert_eq!(out.stdout.trim(), "hello");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn missing_program_maps_to_not_found() {
        let runner = SystemRunner;
        let spec = CommandSpec::new("definitely-not-a-real-binary-xyz", Duration::from_secs(5));
        match runner.run(spec).await {
            Err(ToolError::NotFound { program }) => assert!(program.contains("definitely")),
            other => panic!("expected NotFound, got {:?}", other.map(|o| o.status)),
        }
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let runner = SystemRunner;
        let started = std::time::Instant::now();
        let spec = CommandSpec::new("sh", Duration::from_millis(200)).args(["-c", "sleep 30"]);
        match runner.run(spec).await {
            Err(ToolError::TimedOut { .. }) => {}
            other => panic!("expected TimedOut, got {:?}", other.map(|o| o.status)),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn run_checked_rejects_nonzero_exit() {
        let runner = SystemRunner;
        let spec = CommandSpec::new("sh", Duration::from_secs(5)).args(["-c", "echo oops >&2; exit 1"]);
        match run_checked(&runner, spec).await {
            Err(ToolError::Failed { code, stderr, .. }) => {
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "oops");
            }
            other => panic!("expected Failed, got {:?}", other.map(|o| o.status)),
        }
    }

    #[tokio::test]
    async fn gzip_stream_writes_compressed_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.gz");
        let runner = SystemRunner;
        let spec = CommandSpec::new("sh", Duration::from_secs(5)).args(["-c", "printf abcabcabc"]);
        let written = runner.run_gzip_to_file(spec, &dest).await.unwrap();
        assert!(written > 0);
        let bytes = std::fs::read(&dest).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
    }

    #[tokio::test]
    async fn gzip_stream_surfaces_dump_failure() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.gz");
        let runner = SystemRunner;
        let spec = CommandSpec::new("sh", Duration::from_secs(5)).args(["-c", "echo broken >&2; exit 2"]);
        match runner.run_gzip_to_file(spec, &dest).await {
            Err(ToolError::Failed { code, stderr, .. }) => {
                assert_eq!(code, Some(2));
                assert_eq!(stderr, "broken");
            }
            Err(other) => panic!("expected Failed, got {}", other),
            Ok(n) => panic!("expected Failed, got {} bytes", n),
        }
    }

    #[tokio::test]
    async fn command_spec_renders_display_line() {
        let spec = CommandSpec::new("docker", Duration::from_secs(1))
            .args(["compose", "up", "-d"])
            .env("KEY", "value");
        assert_eq!(spec.display_line(), "docker compose up -d");
        assert_eq!(spec.env, vec![("KEY".to_string(), "value".to_string())]);
    }
}
