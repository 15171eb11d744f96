// Streaming child-process execution with staged cancellation.

use crate::trace::TraceWriter;
use anyhow::{Context, Result};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Signals sent to a cancelled process, each followed by a grace period.
/// A process still alive after the last one is killed.
const ESCALATION: [(Signal, Duration); 2] = [
    (Signal::Interrupt, Duration::from_millis(7500)),
    (Signal::Terminate, Duration::from_millis(2500)),
];

/// A non-zero exit when one was not allowed.
#[derive(Debug, thiserror::Error)]
#[error("{program} {arguments:?} exited with code {exit_code}")]
pub struct ProcessExitCodeError {
    pub exit_code: i32,
    pub program: String,
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of child output, without its trailing newline.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Runs one prepared [`Command`] and forwards its output line by line.
pub struct ProcessInvoker {
    trace: Arc<dyn TraceWriter>,
    lines_tx: mpsc::UnboundedSender<OutputLine>,
    lines_rx: Option<mpsc::UnboundedReceiver<OutputLine>>,
}

impl ProcessInvoker {
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        Self {
            trace,
            lines_tx,
            lines_rx: Some(lines_rx),
        }
    }

    /// The receiving end of the output channel; `None` once taken.
    ///
    /// The channel closes after the process exits, both pipes are drained and
    /// the invoker is dropped.
    pub fn take_output_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<OutputLine>> {
        self.lines_rx.take()
    }

    /// Run `cmd` to completion and return its exit code (`-1` when killed by a signal).
    ///
    /// Stdin is closed and both output pipes are captured whatever `cmd` was
    /// configured with. A cancelled run is an error. With `require_exit_code_zero`
    /// a non-zero exit is a [`ProcessExitCodeError`].
    pub async fn execute(
        &self,
        mut cmd: Command,
        require_exit_code_zero: bool,
        cancel: CancellationToken,
    ) -> Result<i32> {
        let std_cmd = cmd.as_std();
        let program = std_cmd.get_program().to_string_lossy().into_owned();
        let arguments: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to start {program}"))?;
        let pid = child.id().unwrap_or_default();
        self.trace.verbose(&format!("started {program} {arguments:?} as pid {pid}"));

        let readers = [
            forward_lines(child.stdout.take(), OutputStream::Stdout, self.lines_tx.clone()),
            forward_lines(child.stderr.take(), OutputStream::Stderr, self.lines_tx.clone()),
        ];

        let (exit_code, cancelled) = tokio::select! {
            status = child.wait() => {
                let status = status.context("failed to wait for process")?;
                (status.code().unwrap_or(-1), false)
            }
            _ = cancel.cancelled() => {
                self.trace.info(&format!("cancelling pid {pid}"));
                (self.stop(&mut child).await, true)
            }
        };

        for reader in readers {
            let _ = reader.await;
        }

        self.trace.verbose(&format!(
            "pid {pid} exited with code {exit_code} after {:.2?}",
            started.elapsed()
        ));

        if cancelled {
            anyhow::bail!("{program} was cancelled");
        }
        if require_exit_code_zero && exit_code != 0 {
            return Err(ProcessExitCodeError {
                exit_code,
                program,
                arguments,
            }
            .into());
        }
        Ok(exit_code)
    }

    /// Walk the escalation table, then kill.
    async fn stop(&self, child: &mut Child) -> i32 {
        for (signal, grace) in ESCALATION {
            if self.signal_and_wait(child, signal, grace).await {
                return exit_code_of(child).await;
            }
        }

        self.trace.info("process ignored every signal, killing it");
        let _ = child.kill().await;
        exit_code_of(child).await
    }

    /// Returns `true` if the process exited within `grace`.
    #[cfg(unix)]
    async fn signal_and_wait(&self, child: &mut Child, signal: Signal, grace: Duration) -> bool {
        use nix::sys::signal::{kill, Signal as NixSignal};
        use nix::unistd::Pid;

        let Some(pid) = child.id() else {
            return true;
        };
        let sig = match signal {
            Signal::Interrupt => NixSignal::SIGINT,
            Signal::Terminate => NixSignal::SIGTERM,
        };
        if let Err(e) = kill(Pid::from_raw(pid as i32), sig) {
            self.trace.info(&format!("failed to send {sig:?} to pid {pid}: {e}"));
            return false;
        }

        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(grace) => {
                self.trace.info(&format!("pid {pid} still running {:.1}s after {sig:?}", grace.as_secs_f64()));
                false
            }
        }
    }

    #[cfg(not(unix))]
    async fn signal_and_wait(&self, child: &mut Child, _signal: Signal, grace: Duration) -> bool {
        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(grace) => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Interrupt,
    Terminate,
}

async fn exit_code_of(child: &mut Child) -> i32 {
    match child.wait().await {
        Ok(status) => status.code().unwrap_or(-1),
        Err(_) => -1,
    }
}

fn forward_lines<R>(
    pipe: Option<R>,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<OutputLine>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(pipe) = pipe else {
            return;
        };
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(text)) = lines.next_line().await {
            if tx.send(OutputLine { stream, text }).is_err() {
                break;
            }
        }
    })
}
