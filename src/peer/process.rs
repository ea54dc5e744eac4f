//! Child-process transport: the host runs as a subprocess and frames travel
//! over its stdio, the way a browser launches native hosts.

use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

use super::{Connection, Connector, TransportError};
use crate::protocol::{read_json_frame, write_json_frame, FrameError, LengthPrefix};

pub struct ProcessConnector {
    program: PathBuf,
    args: Vec<String>,
    max_inbound_bytes: usize,
    max_outbound_bytes: usize,
}

impl ProcessConnector {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            max_inbound_bytes: 50 * 1024 * 1024,
            max_outbound_bytes: 1024 * 1024,
        }
    }

    pub fn with_limits(mut self, max_inbound_bytes: usize, max_outbound_bytes: usize) -> Self {
        self.max_inbound_bytes = max_inbound_bytes;
        self.max_outbound_bytes = max_outbound_bytes;
        self
    }
}

impl Connector for ProcessConnector {
    fn connect(&mut self) -> Result<Connection, TransportError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Unavailable("host stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Unavailable("host stdout unavailable".to_string()))?;
        let pid = child.id();
        tracing::info!(pid = ?pid, program = %self.program.display(), "host process started");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(stdin, outbound_rx, self.max_outbound_bytes));
        let max_inbound = self.max_inbound_bytes;
        tokio::spawn(async move {
            read_loop(stdout, inbound_tx, max_inbound).await;
            // Reader is done; reap the child so it does not linger.
            match child.wait().await {
                Ok(status) => tracing::info!(pid = ?pid, status = %status, "host process exited"),
                Err(err) => tracing::warn!(pid = ?pid, error = %err, "failed to reap host process"),
            }
        });

        Ok(Connection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

async fn write_loop(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<Value>, max_bytes: usize) {
    while let Some(frame) = rx.recv().await {
        match write_json_frame(&mut stdin, LengthPrefix::LittleEndian, &frame, max_bytes).await {
            Ok(()) => {}
            Err(FrameError::Io(err)) => {
                tracing::warn!(error = %err, "host stdin closed");
                break;
            }
            Err(err) => tracing::warn!(error = %err, "outbound frame dropped"),
        }
    }
}

async fn read_loop(mut stdout: ChildStdout, tx: mpsc::UnboundedSender<Value>, max_bytes: usize) {
    loop {
        match read_json_frame(&mut stdout, LengthPrefix::LittleEndian, max_bytes).await {
            Ok(Some(value)) => {
                if tx.send(value).is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::info!("host stdout closed");
                break;
            }
            Err(err) if err.is_recoverable() => {
                tracing::warn!(error = %err, "dropping unreadable frame from host");
            }
            Err(err) => {
                tracing::warn!(error = %err, "host stdout failed");
                break;
            }
        }
    }
}
