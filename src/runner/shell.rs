//! Local shell runner - runs step scripts with `bash -eo pipefail -c`

use crate::runner::{
    CommandOutput, CommandRunner, OutputSink, RunnerConfig, RunnerError, ShellCommand, StreamKind,
};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Lines longer than this are truncated
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Runs steps directly on the host
#[derive(Debug, Clone)]
pub struct ShellRunner {
    config: RunnerConfig,
}

impl ShellRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        command: &ShellCommand,
        sink: Option<&dyn OutputSink>,
    ) -> Result<CommandOutput, RunnerError> {
        debug!(
            "Running in {}: {}",
            command.working_dir.display(),
            command.script.lines().next().unwrap_or("")
        );

        let mut cmd = Command::new(&self.config.shell);
        cmd.args(self.config.shell_args(&command.script))
            .current_dir(&command.working_dir)
            .envs(&command.env);

        run_process(
            cmd,
            &self.config.shell,
            self.config.effective_timeout(command.timeout_secs),
            sink,
        )
        .await
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// Spawn a prepared command, stream its output and wait for it
///
/// The child is killed if the timeout expires or the future is dropped.
pub(crate) async fn run_process(
    mut cmd: Command,
    program: &str,
    timeout_secs: u64,
    sink: Option<&dyn OutputSink>,
) -> Result<CommandOutput, RunnerError> {
    let started = Instant::now();

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RunnerError::Io(std::io::Error::other("stdout pipe not available")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RunnerError::Io(std::io::Error::other("stderr pipe not available")))?;

    let work = async {
        let mut out_reader = BufReader::new(stdout);
        let mut err_reader = BufReader::new(stderr);
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let mut collected_out = String::new();
        let mut collected_err = String::new();
        let mut out_done = false;
        let mut err_done = false;

        while !(out_done && err_done) {
            tokio::select! {
                read = out_reader.read_until(b'\n', &mut out_buf), if !out_done => {
                    match read {
                        Ok(0) => out_done = true,
                        Ok(_) => emit_line(&mut out_buf, StreamKind::Stdout, &mut collected_out, sink),
                        Err(e) => {
                            warn!("Error reading stdout: {}", e);
                            out_done = true;
                        }
                    }
                }
                read = err_reader.read_until(b'\n', &mut err_buf), if !err_done => {
                    match read {
                        Ok(0) => err_done = true,
                        Ok(_) => emit_line(&mut err_buf, StreamKind::Stderr, &mut collected_err, sink),
                        Err(e) => {
                            warn!("Error reading stderr: {}", e);
                            err_done = true;
                        }
                    }
                }
            }
        }

        let status = child.wait().await?;
        Ok::<_, RunnerError>((status, collected_out, collected_err))
    };

    let (status, stdout, stderr) = timeout(Duration::from_secs(timeout_secs), work)
        .await
        .map_err(|_| RunnerError::Timeout(timeout_secs))??;

    let exit_code = status.code().unwrap_or(-1);
    debug!("{} exited with code {}", program, exit_code);

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

fn emit_line(buf: &mut Vec<u8>, stream: StreamKind, collected: &mut String, sink: Option<&dyn OutputSink>) {
    let mut line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();

    if line.len() > MAX_LINE_LENGTH {
        let mut cut = MAX_LINE_LENGTH;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        line.truncate(cut);
        line.push_str("... [truncated]\n");
    }

    collected.push_str(&line);
    if !line.ends_with('\n') {
        collected.push('\n');
    }

    if let Some(sink) = sink {
        sink.on_line(stream, line.trim_end_matches(['\n', '\r']));
    }
}
