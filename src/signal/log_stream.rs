//! Log stream pattern watcher.

use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::{PendingOutcome, Resolver, SignalOutcome, SignalWatcher, once_channel};
use crate::error::{BootError, Result};

#[derive(Debug, Default)]
struct StreamState {
    matcher: Option<(String, Resolver)>,
    finished: bool,
    drained: u64,
}

/// Watches a line-oriented stream for a target substring.
///
/// Reading starts immediately in drain mode: lines are consumed and dropped so
/// the producer never blocks and backlog written before `arm` cannot match.
/// `arm` switches to matching; a match resolves `Success`, end of stream
/// resolves `Failure`, and either stops the reader.
pub struct LogStreamWatcher {
    name: String,
    target: String,
    state: Arc<Mutex<StreamState>>,
    reader: Option<JoinHandle<()>>,
    child: Option<Child>,
    pending: Option<PendingOutcome>,
}

impl std::fmt::Debug for LogStreamWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStreamWatcher")
            .field("name", &self.name)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl LogStreamWatcher {
    /// Spawn `program args...` and drain its stdout.
    pub fn spawn(program: &str, args: &[String], target: impl Into<String>) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BootError::SignalFailure(format!("failed to spawn {program}: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BootError::SignalFailure(format!("{program} has no stdout")))?;

        let mut watcher = Self::from_reader(program, stdout, target);
        watcher.child = Some(child);
        info!("Draining {program} output");
        Ok(watcher)
    }

    /// Drain an arbitrary reader.
    pub fn from_reader<R>(name: impl Into<String>, reader: R, target: impl Into<String>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let name = name.into();
        let state = Arc::new(Mutex::new(StreamState::default()));
        let reader = tokio::spawn(read_lines(name.clone(), reader, state.clone()));
        Self {
            name,
            target: target.into(),
            state,
            reader: Some(reader),
            child: None,
            pending: None,
        }
    }

    /// Number of lines consumed before the watcher was armed.
    pub fn drained_lines(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).drained
    }
}

async fn read_lines<R>(name: String, reader: R, state: Arc<Mutex<StreamState>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf).await;

        let done = {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            match read {
                Ok(0) => {
                    debug!("{name} stream ended");
                    finish(&mut state, SignalOutcome::Failure);
                    true
                }
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let matched = match &state.matcher {
                        Some((target, _)) => line.contains(target.as_str()),
                        None => {
                            state.drained += 1;
                            false
                        }
                    };
                    if matched {
                        info!("{name} matched: {}", line.trim_end());
                        finish(&mut state, SignalOutcome::Success);
                    }
                    matched
                }
                Err(e) => {
                    warn!("{name} stream read failed: {e}");
                    finish(&mut state, SignalOutcome::Failure);
                    true
                }
            }
        };

        if done {
            break;
        }
    }
}

fn finish(state: &mut StreamState, outcome: SignalOutcome) {
    state.finished = true;
    if let Some((_, resolver)) = state.matcher.take() {
        resolver.resolve(outcome);
    }
}

#[async_trait]
impl SignalWatcher for LogStreamWatcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn arm(&mut self) -> Result<()> {
        let (resolver, pending) = once_channel();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.finished {
                resolver.resolve(SignalOutcome::Failure);
            } else {
                debug!("{} armed for {:?} after {} drained lines", self.name, self.target, state.drained);
                state.matcher = Some((self.target.clone(), resolver));
            }
        }
        self.pending = Some(pending);
        Ok(())
    }

    fn take_pending(&mut self) -> Option<PendingOutcome> {
        self.pending.take()
    }

    fn cancel(&mut self) {
        self.pending = None;
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.matcher = None;
            state.finished = true;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                debug!("Failed to stop {}: {e}", self.name);
            }
        }
    }
}

impl Drop for LogStreamWatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}
