//! The externally running function host and the log lines it produces.

mod logs;

pub use logs::{LogBuffer, LogSink, LogView};

use std::cell::{Cell, RefCell};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::config::HostConfig;
use crate::poll::{wait_until_cancellable, PollError, PollSuccess, RetryPolicy};

const READY_LOG_TAIL: usize = 20;

#[derive(Debug)]
pub enum HostError {
    Spawn(String),
    NotReady(PollError),
    Stop(String),
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostError::Spawn(e) => write!(f, "failed to start function host: {}", e),
            HostError::NotReady(e) => write!(f, "function host not ready: {}", e),
            HostError::Stop(e) => write!(f, "failed to stop function host: {}", e),
        }
    }
}

impl std::error::Error for HostError {}

/// A spawned host process whose stdout and stderr feed a [`LogSink`].
pub struct FunctionHost {
    child: Child,
    readers: Vec<JoinHandle<()>>,
    logs: LogView,
}

impl FunctionHost {
    pub fn start(config: &HostConfig, sink: LogSink) -> Result<Self, HostError> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| HostError::Spawn(format!("{} {:?}: {}", config.command, config.args, e)))?;
        info!(
            command = %config.command,
            pid = child.id(),
            "function host started"
        );

        let logs = sink.view();
        let sink = Arc::new(sink);
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(stdout, "stdout", sink.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(stderr, "stderr", sink)));
        }

        Ok(Self {
            child,
            readers,
            logs,
        })
    }

    /// Poll the captured output until `ready_line` shows up, or `cancel`
    /// fires.
    pub async fn wait_ready(
        &mut self,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        ready_line: &str,
    ) -> Result<PollSuccess, HostError> {
        let exited: Cell<Option<ExitStatus>> = Cell::new(None);
        let child = &mut self.child;
        let logs = &self.logs;

        let last_output = RefCell::new(String::new());

        let probe = || {
            if exited.get().is_none() {
                exited.set(child.try_wait().ok().flatten());
            }
            let logs = logs.clone();
            let last_output = &last_output;
            async move {
                let tail = logs.tail(READY_LOG_TAIL).await;
                *last_output.borrow_mut() = tail;
                logs.contains(ready_line).await
            }
        };
        let message = || {
            let status = match exited.get() {
                Some(status) => format!("host exited with {status}"),
                None => "host still running".to_string(),
            };
            format!(
                "host log line '{}' ({}); last output:\n{}",
                ready_line,
                status,
                last_output.borrow()
            )
        };

        wait_until_cancellable(policy, cancel, probe, message)
            .await
            .map_err(HostError::NotReady)
    }

    pub async fn stop(mut self) -> Result<(), HostError> {
        self.child
            .kill()
            .await
            .map_err(|e| HostError::Stop(e.to_string()))?;
        for reader in self.readers.drain(..) {
            if let Err(e) = reader.await {
                warn!(error = %e, "host output reader ended abnormally");
            }
        }
        info!("function host stopped");
        Ok(())
    }
}

async fn pump<R>(stream: R, name: &'static str, sink: Arc<LogSink>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                trace!(target: "functions_e2e::host", stream = name, %line);
                sink.push(line).await;
            }
            Ok(None) => break,
            Err(e) => {
                warn!(stream = name, error = %e, "failed reading host output");
                break;
            }
        }
    }
}
