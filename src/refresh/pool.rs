// Worker subprocess handles

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::protocol::{FieldCacheOptions, Request, Response};
use crate::error::{WorkerError, WorkerResult};
use crate::index::field_cache::FieldIndex;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How to start a worker: a program plus arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The running binary's hidden `worker` subcommand
    pub fn current_exe() -> WorkerResult<Self> {
        let program = std::env::current_exe().map_err(|e| WorkerError::SpawnFailed {
            reason: format!("cannot locate the current executable: {}", e),
        })?;
        Ok(Self::new(program, ["worker"]))
    }
}

/// One live worker process speaking JSON lines
pub struct WorkerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl WorkerProcess {
    pub fn spawn(command: &WorkerCommand) -> WorkerResult<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::SpawnFailed {
                reason: format!("{}: {}", command.program.display(), e),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| WorkerError::SpawnFailed {
            reason: "failed to capture stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| WorkerError::SpawnFailed {
            reason: "failed to capture stdout".to_string(),
        })?;
        debug!("Spawned worker {:?}", child.id());

        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
        })
    }

    pub async fn send(&mut self, request: &Request) -> WorkerResult<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| WorkerError::Protocol {
            reason: "worker stdin already closed".to_string(),
        })?;
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Next message, or `None` once the worker closed its stdout.
    pub async fn recv(&mut self) -> WorkerResult<Option<Response>> {
        loop {
            let Some(line) = self.stdout.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&line).map(Some).map_err(|e| WorkerError::Protocol {
                reason: format!("invalid message {:?}: {}", line, e),
            });
        }
    }

    /// Signal end of input; the worker exits once it has answered.
    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    pub async fn wait(&mut self) -> WorkerResult<ExitStatus> {
        self.close_stdin();
        Ok(self.child.wait().await?)
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Close stdin and wait briefly, killing the process if it lingers.
    pub async fn shutdown(mut self) {
        self.close_stdin();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => debug!("Worker exited with {}", status),
            Ok(Err(e)) => warn!("Failed to wait for worker: {}", e),
            Err(_) => {
                warn!("Worker did not exit within {:?}, killing it", SHUTDOWN_TIMEOUT);
                let _ = self.child.kill().await;
            }
        }
    }
}

/// The single long-lived worker that serves field-index updates.
///
/// Requests are serialized behind an async mutex, and each result is persisted
/// before the lock is released, so an update always starts from the files the
/// previous one wrote. A dead worker is replaced on the next request.
pub struct FieldIndexWorker {
    command: WorkerCommand,
    process: Mutex<Option<WorkerProcess>>,
}

impl FieldIndexWorker {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            process: Mutex::new(None),
        }
    }

    /// Run one update and save the result to `options.global_storage_path`.
    pub async fn update(&self, options: FieldCacheOptions) -> WorkerResult<FieldIndex> {
        let cache_dir = options.global_storage_path.clone();
        let mut guard = self.process.lock().await;
        let alive = match guard.as_mut() {
            Some(process) => process.is_alive(),
            None => false,
        };
        if !alive {
            if guard.is_some() {
                warn!("Field index worker died, respawning");
            }
            *guard = Some(WorkerProcess::spawn(&self.command)?);
        }
        let Some(process) = guard.as_mut() else {
            return Err(WorkerError::SpawnFailed {
                reason: "field index worker unavailable".to_string(),
            });
        };

        let result = exchange_field_cache(process, options).await;
        if matches!(
            result,
            Err(WorkerError::Crashed { .. } | WorkerError::Io(_) | WorkerError::Protocol { .. })
        ) {
            // Drop it so the next request starts a fresh process.
            *guard = None;
        }
        let index = result?;
        index.save(&cache_dir)?;
        Ok(index)
    }

    /// Forward a level change to the running worker, if any.
    pub async fn set_log_level(&self, level: &str) -> WorkerResult<()> {
        let mut guard = self.process.lock().await;
        if let Some(process) = guard.as_mut() {
            process
                .send(&Request::SetLogLevel {
                    log_level: level.to_string(),
                })
                .await?;
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        let mut guard = self.process.lock().await;
        guard.as_mut().is_some_and(|p| p.is_alive())
    }

    pub async fn shutdown(&self) {
        let process = self.process.lock().await.take();
        if let Some(process) = process {
            process.shutdown().await;
        }
    }
}

async fn exchange_field_cache(process: &mut WorkerProcess, options: FieldCacheOptions) -> WorkerResult<FieldIndex> {
    process.send(&Request::UpdateFieldCache { options }).await?;
    loop {
        match process.recv().await? {
            None => {
                return Err(WorkerError::Crashed {
                    reason: "field index worker exited before replying".to_string(),
                })
            }
            Some(Response::FieldCacheData {
                table_fields_cache,
                page_source_table_cache,
                metadata,
                contributions,
            }) => {
                return Ok(FieldIndex {
                    table_fields: table_fields_cache,
                    page_sources: page_source_table_cache,
                    watermarks: metadata,
                    contributions,
                })
            }
            Some(Response::FieldCacheError { message }) | Some(Response::Error { message, .. }) => {
                return Err(WorkerError::Remote(message))
            }
            Some(Response::Progress { message }) => debug!("Field index worker: {}", message),
            Some(Response::Warning { message }) => warn!("Field index worker: {}", message),
            Some(other) => {
                return Err(WorkerError::Protocol {
                    reason: format!("unexpected {} message", other.kind()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_command() {
        let command = WorkerCommand::new("/usr/bin/alcache", ["worker"]);
        assert_eq!(command.program, PathBuf::from("/usr/bin/alcache"));
        assert_eq!(command.args, vec![OsString::from("worker")]);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let command = WorkerCommand::new("/nonexistent/alcache-worker", Vec::<OsString>::new());
        let err = WorkerProcess::spawn(&command).err().unwrap();
        assert!(matches!(err, WorkerError::SpawnFailed { .. }));

        let worker = FieldIndexWorker::new(command);
        let options = FieldCacheOptions {
            src_extraction_path: PathBuf::from("/nonexistent/src"),
            global_storage_path: PathBuf::from("/nonexistent/cache"),
            app_name: None,
            log_level: "warn".to_string(),
        };
        assert!(matches!(worker.update(options).await, Err(WorkerError::SpawnFailed { .. })));
        assert!(!worker.is_running().await);
    }
}
