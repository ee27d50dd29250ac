// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::agent::{AgentStats, SamplePayload, SpanAgent};
use crate::events::{ClientReceive, ClientSend, LifecycleEvent, ServerReceive, ServerSend};

#[derive(Debug)]
pub enum AgentCommand {
    Event(LifecycleEvent),
    Flush(oneshot::Sender<SamplePayload>),
    GetStats(oneshot::Sender<AgentStats>),
    Shutdown,
}

/// Instrumentation-facing entry point. Cheap to clone; never blocks.
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::UnboundedSender<AgentCommand>,
}

impl AgentHandle {
    pub fn send_event(
        &self,
        event: LifecycleEvent,
    ) -> Result<(), mpsc::error::SendError<AgentCommand>> {
        self.tx.send(AgentCommand::Event(event))
    }

    pub fn server_receive(&self, event: ServerReceive) {
        self.submit(LifecycleEvent::ServerReceive(event));
    }

    pub fn server_send(&self, event: ServerSend) {
        self.submit(LifecycleEvent::ServerSend(event));
    }

    pub fn client_send(&self, event: ClientSend) {
        self.submit(LifecycleEvent::ClientSend(event));
    }

    pub fn client_receive(&self, event: ClientReceive) {
        self.submit(LifecycleEvent::ClientReceive(event));
    }

    // instrumentation call sites must never fail because the agent is gone
    fn submit(&self, event: LifecycleEvent) {
        if let Err(mpsc::error::SendError(AgentCommand::Event(event))) = self.send_event(event) {
            debug!(
                "Agent service stopped, dropping event for transaction {}",
                event.transaction_id()
            );
        }
    }

    pub async fn flush(&self) -> Result<SamplePayload, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AgentCommand::Flush(response_tx))
            .map_err(|e| format!("Failed to send flush command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive flush response: {}", e))
    }

    pub async fn stats(&self) -> Result<AgentStats, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AgentCommand::GetStats(response_tx))
            .map_err(|e| format!("Failed to send stats command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive stats response: {}", e))
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<AgentCommand>> {
        self.tx.send(AgentCommand::Shutdown)
    }
}

/// Owns the [`SpanAgent`] and applies commands one at a time, in submission order.
pub struct AgentService {
    agent: SpanAgent,
    rx: mpsc::UnboundedReceiver<AgentCommand>,
}

impl AgentService {
    pub fn new(agent: SpanAgent) -> (Self, AgentHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AgentService { agent, rx }, AgentHandle { tx })
    }

    pub async fn run(mut self) {
        debug!("Agent service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                AgentCommand::Event(event) => self.agent.handle_event(event),

                AgentCommand::Flush(response_tx) => {
                    let payload = self.agent.flush();
                    if response_tx.send(payload).is_err() {
                        error!("Failed to send flush response - receiver dropped");
                    }
                }

                AgentCommand::GetStats(response_tx) => {
                    if response_tx.send(self.agent.stats()).is_err() {
                        error!("Failed to send stats response - receiver dropped");
                    }
                }

                AgentCommand::Shutdown => {
                    debug!("Agent service shutting down");
                    break;
                }
            }
        }

        debug!("Agent service stopped");
    }
}
