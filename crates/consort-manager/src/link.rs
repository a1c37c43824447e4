//! The remote hook a run's pipeline exchanges results through.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument};

use consort_bus::Topics;
use consort_core::{
    ControlMessage, Mode, PipelineError, Qos, RemoteHandler, RemoteKind, RemoteRequest,
    RemoteResponse,
};
use consort_transfer::archive_directory_async;

use crate::manager::{Inner, Outbound};
use crate::registry::{Outgoing, Registration, Reply, RunState};
use crate::remote::fan_out;

/// Connects one run's step controllers to the manager.
pub(crate) struct RunLink {
    inner: Arc<Inner>,
    run_id: String,
}

impl RunLink {
    pub(crate) fn new(inner: Arc<Inner>, run_id: impl Into<String>) -> Self {
        Self {
            inner,
            run_id: run_id.into(),
        }
    }

    fn evicted(&self) -> PipelineError {
        PipelineError::RemoteCommunication(format!("run {} is no longer active", self.run_id))
    }

    async fn wait(&self, rx: oneshot::Receiver<Reply>) -> Reply {
        rx.await.map_err(|_| self.evicted())?
    }

    /// Remote node: broadcast the aggregate, then wait for every client.
    async fn remote_exchange(&self, request: RemoteRequest) -> Reply {
        let inner = &self.inner;
        let run_id = self.run_id.as_str();

        if request.kind == RemoteKind::Kickoff {
            let (rx, outbox) = {
                let mut registry = inner.registry.lock().await;
                let entry = registry.runs.get_mut(run_id).ok_or_else(|| self.evicted())?;
                entry.iteration = request.iteration;
                let rx = entry.park();
                let mut outbox = Vec::new();
                if entry.state == RunState::Created {
                    entry.state = RunState::Running;
                    let clients = entry.clients.clone();
                    for client in clients {
                        registry.enroll(&client, run_id).registration = Registration::Registered;
                        outbox.push(Outbound::new(
                            Topics::client_register(&client),
                            ControlMessage::register(&inner.config.client_id, run_id),
                            Qos::AtLeastOnce,
                        ));
                    }
                    info!(run_id = %run_id, clients = outbox.len(), "Run kicked off");
                }
                (rx, outbox)
            };
            inner.publish_all(outbox).await;
            return self.wait(rx).await;
        }

        let transfer = {
            let registry = inner.registry.lock().await;
            let entry = registry.runs.get(run_id).ok_or_else(|| self.evicted())?;
            if let Some(error) = &entry.error {
                return Err(PipelineError::Peer(error.clone()));
            }
            entry.directories.transfer.clone()
        };
        let archive = format!("{run_id}-{}-tempOutput.tar.gz", uuid::Uuid::new_v4());
        let files = archive_directory_async(
            transfer.clone(),
            transfer,
            archive,
            inner.config.transfer.chunk_size,
        )
        .await?;

        let (rx, outbox) = {
            let mut registry = inner.registry.lock().await;
            let entry = registry.runs.get_mut(run_id).ok_or_else(|| self.evicted())?;
            entry.state = RunState::Running;
            let rx = match request.kind {
                RemoteKind::TransmitOnly => {
                    // the next exchange of this run is a new step's kickoff
                    entry.iteration = 0;
                    None
                }
                _ => {
                    entry.iteration = request.iteration;
                    Some(entry.park())
                }
            };
            if request.success && !files.is_empty() {
                entry.final_transfer = Some(HashSet::new());
            }

            let mut message = ControlMessage::data(
                &inner.config.client_id,
                run_id,
                request.iteration,
                request.output,
                request.success,
            );
            if !files.is_empty() {
                message = message.with_files(files);
            }
            let outbox = fan_out(
                &entry.clients,
                entry.owner.as_deref(),
                entry.limit_output_to_owner,
                &message,
            );
            (rx, outbox)
        };
        inner.publish_all(outbox).await;

        match rx {
            Some(rx) => self.wait(rx).await,
            None => Ok(RemoteResponse::default()),
        }
    }

    /// Local node: send this node's output, then wait for the aggregate.
    async fn local_exchange(&self, request: RemoteRequest) -> Reply {
        let inner = &self.inner;
        let outgoing = Outgoing {
            output: request.output,
            success: request.success,
            iteration: request.iteration,
        };

        let (rx, send_now) = {
            let mut registry = inner.registry.lock().await;
            let entry = registry
                .runs
                .get_mut(&self.run_id)
                .ok_or_else(|| self.evicted())?;
            if let Some(error) = &entry.error {
                return Err(PipelineError::Peer(error.clone()));
            }
            entry.iteration = request.iteration;
            let rx = (request.kind != RemoteKind::TransmitOnly).then(|| entry.park());
            if request.kind == RemoteKind::Kickoff {
                (rx, false)
            } else if entry.registered {
                entry.state = RunState::Running;
                (rx, true)
            } else {
                debug!(run_id = %self.run_id, iteration = request.iteration, "Not registered yet, output stashed");
                entry.stashed = Some(outgoing.clone());
                (rx, false)
            }
        };

        if send_now {
            inner.send_output(&self.run_id, outgoing).await;
        }
        match rx {
            Some(rx) => self.wait(rx).await,
            None => Ok(RemoteResponse::default()),
        }
    }
}

#[async_trait]
impl RemoteHandler for RunLink {
    #[instrument(skip(self, request), fields(run_id = %self.run_id, step = request.step, iteration = request.iteration, kind = ?request.kind))]
    async fn exchange(&self, request: RemoteRequest) -> Reply {
        match self.inner.config.mode {
            Mode::Remote => self.remote_exchange(request).await,
            Mode::Local => self.local_exchange(request).await,
        }
    }
}
