// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Native process spawner.
//!
//! Workers run as plain child processes. IPC travels over the child's
//! stdin (supervisor -> worker) and stdout (worker -> supervisor); stdout
//! lines that are not IPC messages and all stderr lines are logged and
//! forwarded to the configured [`OutputSink`].

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use shardline_protocol::{Incoming, IpcReader, IpcWriter, ManagerMessage, WorkerMessage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::traits::*;
use crate::model::{SpawnRequest, WorkerId};

/// Spawns workers as child processes of the current process.
pub struct NativeSpawner {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    output: Option<Arc<dyn OutputSink>>,
}

impl NativeSpawner {
    /// Spawner running `program` for every worker.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            output: None,
        }
    }

    /// Spawner re-running the current executable, which selects the worker
    /// role from the environment contract.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Extra arguments passed to every worker.
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Extra environment variable passed to every worker.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Forward child output lines to `sink`.
    pub fn output(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.output = Some(sink);
        self
    }
}

#[derive(Clone)]
struct LineContext {
    pid: u32,
    worker: WorkerId,
    cluster_id: Option<u32>,
    manager: bool,
    created_at: DateTime<Utc>,
    output: Option<Arc<dyn OutputSink>>,
}

impl LineContext {
    fn emit(&self, stream: OutputStream, text: String) {
        if let Some(output) = &self.output {
            output.line(OutputLine {
                pid: self.pid,
                worker: self.worker,
                cluster_id: self.cluster_id,
                manager: self.manager,
                created_at: self.created_at,
                stream,
                text,
            });
        }
    }
}

#[async_trait]
impl ProcessSpawner for NativeSpawner {
    fn spawner_type(&self) -> &'static str {
        "native"
    }

    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, SpawnError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .envs(request.env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        let mut child = command.spawn()?;
        let pid = child.id().ok_or(SpawnError::ExitedImmediately)?;
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SpawnError::MissingPipe("stderr"))?;

        let context = LineContext {
            pid,
            worker: request.worker,
            cluster_id: request.role.cluster().map(|spec| spec.id),
            manager: request.role.cluster().is_none(),
            created_at: Utc::now(),
            output: self.output.clone(),
        };

        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let stdout_task = tokio::spawn(read_stdout(stdout, message_tx, context.clone()));
        tokio::spawn(read_stderr(stderr, context.clone()));

        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ExitInfo {
                    code: status.code(),
                    signal: status.signal(),
                },
                Err(e) => {
                    warn!(pid, error = %e, "Failed to wait for worker process");
                    ExitInfo::default()
                }
            };
            // Deliver every message the process wrote before reporting the exit.
            let _ = stdout_task.await;
            debug!(pid, exit = %exit, "Worker process exited");
            let _ = exit_tx.send(exit);
        });

        info!(
            pid,
            worker = %request.worker,
            role = %request.role.describe(),
            program = %self.program.display(),
            "Spawned worker process"
        );

        Ok(SpawnedProcess {
            pid,
            control: Arc::new(NativeControl {
                pid,
                stdin: Mutex::new(IpcWriter::new(stdin)),
            }),
            messages: message_rx,
            exit: exit_rx,
        })
    }
}

async fn read_stdout(
    stdout: ChildStdout,
    messages: mpsc::UnboundedSender<WorkerMessage>,
    context: LineContext,
) {
    let mut reader = IpcReader::new(stdout);
    loop {
        match reader.recv::<WorkerMessage>().await {
            Ok(Some(Incoming::Message(message))) => {
                if messages.send(message).is_err() {
                    debug!(pid = context.pid, "Worker message receiver dropped");
                }
            }
            Ok(Some(Incoming::Malformed { line, error })) => {
                warn!(pid = context.pid, error = %error, "Malformed IPC message from worker");
                context.emit(OutputStream::Stdout, line);
            }
            Ok(Some(Incoming::Text(line))) => {
                info!(pid = context.pid, worker = %context.worker, "{}", line);
                context.emit(OutputStream::Stdout, line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(pid = context.pid, error = %e, "Worker stdout read failed");
                break;
            }
        }
    }
}

async fn read_stderr(stderr: ChildStderr, context: LineContext) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                info!(pid = context.pid, worker = %context.worker, "{}", line);
                context.emit(OutputStream::Stderr, line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(pid = context.pid, error = %e, "Worker stderr read failed");
                break;
            }
        }
    }
}

struct NativeControl {
    pid: u32,
    stdin: Mutex<IpcWriter<ChildStdin>>,
}

impl std::fmt::Debug for NativeControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeControl")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProcessControl for NativeControl {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn send(&self, message: &ManagerMessage) -> Result<(), SpawnError> {
        let mut stdin = self.stdin.lock().await;
        stdin.send(message).await?;
        Ok(())
    }

    fn signal(&self, signal: Signal) -> Result<(), SpawnError> {
        let pid = i32::try_from(self.pid).map_err(|_| SpawnError::Signal {
            pid: self.pid,
            reason: "pid out of range".to_string(),
        })?;
        signal::kill(Pid::from_raw(pid), signal).map_err(|errno| SpawnError::Signal {
            pid: self.pid,
            reason: errno.to_string(),
        })
    }
}
