//! Process spawning with streamed, capped output and a kill deadline.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::logging::targets;

use super::env::EnvMap;
use super::output::{OutputCapture, OutputStream, Utf8Decoder, DEFAULT_OUTPUT_CAP_CHARS};
use super::ExecResult;

/// How long to keep draining pipes after the child has exited. A background
/// grandchild can hold the pipe open indefinitely.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// A fully authorized command, ready to spawn.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Complete child environment; `None` inherits the parent's.
    pub env: Option<EnvMap>,
    pub timeout: Option<Duration>,
    pub output_cap: usize,
}

impl RunSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            cwd: None,
            env: None,
            timeout: None,
            output_cap: DEFAULT_OUTPUT_CAP_CHARS,
        }
    }
}

/// Runs authorized commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. Always yields exactly one result; launch failures
    /// are reported in [`ExecResult::error`].
    async fn run(&self, spec: RunSpec) -> ExecResult;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: RunSpec) -> ExecResult {
        run_process(spec).await
    }
}

fn build_command(spec: &RunSpec) -> Option<Command> {
    let (program, args) = spec.argv.split_first()?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    if let Some(env) = &spec.env {
        cmd.env_clear();
        cmd.envs(env);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    Some(cmd)
}

async fn run_process(spec: RunSpec) -> ExecResult {
    let Some(mut cmd) = build_command(&spec) else {
        return ExecResult::launch_failure("command is empty");
    };

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(
                target: targets::EXEC,
                program = %spec.argv[0],
                error = %e,
                "spawn failed"
            );
            return ExecResult::launch_failure(format!("spawn failed: {e}"));
        }
    };

    let capture = Arc::new(Mutex::new(OutputCapture::new(spec.output_cap)));
    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, OutputStream::Stdout, capture.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, OutputStream::Stderr, capture.clone()));
    }

    let mut result = ExecResult::default();
    let status = match spec.timeout.filter(|t| !t.is_zero()) {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::info!(
                    target: targets::EXEC,
                    timeout_ms = limit.as_millis() as u64,
                    "command timed out, killing"
                );
                result.timed_out = true;
                if let Err(e) = child.start_kill() {
                    tracing::warn!(
                        target: targets::EXEC,
                        error = %e,
                        "failed to kill timed out command"
                    );
                }
                child.wait().await
            }
        },
        None => child.wait().await,
    };

    match status {
        Ok(status) => result.exit_code = status.code(),
        Err(e) => result.error = Some(format!("wait failed: {e}")),
    }

    let drain = async {
        for reader in readers.iter_mut() {
            let _ = reader.await;
        }
    };
    if tokio::time::timeout(PIPE_DRAIN_GRACE, drain).await.is_err() {
        tracing::debug!(
            target: targets::EXEC,
            "output pipes still open after exit, abandoning readers"
        );
        for reader in &readers {
            reader.abort();
        }
    }

    let captured = {
        let mut guard = capture.lock();
        std::mem::replace(&mut *guard, OutputCapture::new(0)).finish()
    };
    result.stdout = captured.stdout;
    result.stderr = captured.stderr;
    result.truncated = captured.truncated;
    result.compute_success();
    result
}

fn spawn_reader<R>(
    mut reader: R,
    stream: OutputStream,
    capture: Arc<Mutex<OutputCapture>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut decoder = Utf8Decoder::new();
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.decode(&buf[..n]);
                    capture.lock().push(stream, &text);
                }
                Err(e) => {
                    tracing::debug!(target: targets::EXEC, error = %e, "output read failed");
                    break;
                }
            }
        }
        let rest = decoder.finish();
        capture.lock().push(stream, &rest);
    })
}
