//! Gate command worker - writes gate commands off the allocator's path
//!
//! The allocator enqueues commands through `GateController`; this worker owns
//! the byte channel and performs the actual writes. Nothing is read back and
//! nothing is retried.

use crate::infra::metrics::Metrics;
use crate::services::gate::{GateCommand, GateController};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Worker that writes gate commands to the actuator link
pub struct GateCmdWorker<W> {
    /// Actuator byte channel; `None` when the port could not be opened
    link: Option<W>,
    cmd_rx: mpsc::Receiver<GateCommand>,
    metrics: Arc<Metrics>,
}

impl<W: AsyncWrite + Unpin + Send> GateCmdWorker<W> {
    pub fn new(link: Option<W>, cmd_rx: mpsc::Receiver<GateCommand>, metrics: Arc<Metrics>) -> Self {
        Self { link, cmd_rx, metrics }
    }

    async fn write_command(link: &mut W, line: &str) -> std::io::Result<()> {
        link.write_all(line.as_bytes()).await?;
        link.flush().await
    }

    /// Run the worker, processing commands until every controller is dropped
    pub async fn run(mut self) {
        info!(connected = %self.link.is_some(), "gate_cmd_worker_started");

        while let Some(cmd) = self.cmd_rx.recv().await {
            let queue_delay_us = cmd.enqueued_at.elapsed().as_micros() as u64;
            let line = cmd.encode();

            let Some(link) = self.link.as_mut() else {
                self.metrics.record_gate_failure();
                warn!(slot = %cmd.slot, action = %cmd.action, "gate_link_unavailable");
                continue;
            };

            match Self::write_command(link, &line).await {
                Ok(()) => {
                    self.metrics.record_gate_command();
                    info!(
                        slot = %cmd.slot,
                        action = %cmd.action,
                        queue_delay_us = %queue_delay_us,
                        "gate_command_sent"
                    );
                }
                Err(e) => {
                    self.metrics.record_gate_failure();
                    error!(
                        slot = %cmd.slot,
                        action = %cmd.action,
                        error = %e,
                        "gate_command_send_failed"
                    );
                }
            }
        }

        info!("gate_cmd_worker_stopped");
    }
}

/// Create a gate controller and the worker that serves it
///
/// Returns the controller (for the allocator) and the worker (to be spawned)
pub fn create_gate_worker<W: AsyncWrite + Unpin + Send>(
    link: Option<W>,
    metrics: Arc<Metrics>,
    buffer_size: usize,
) -> (GateController, GateCmdWorker<W>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(buffer_size);
    let controller = GateController::new(cmd_tx, metrics.clone());
    let worker = GateCmdWorker::new(link, cmd_rx, metrics);
    (controller, worker)
}
