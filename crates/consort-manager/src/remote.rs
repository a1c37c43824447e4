//! Remote-node side of the control and file channels.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::MutexGuard;
use tracing::{debug, error, info, instrument, warn};

use consort_bus::Topics;
use consort_core::{ControlMessage, PipelineError, Qos, RemoteResponse, RunError};
use consort_transfer::{extract_parts_async, TransferHandler};

use crate::manager::{clear_dir, Inner, Outbound};
use crate::registry::{Extraction, Registration, Registry, RunState};

/// Output non-owners receive for an owner-limited final result.
pub const OWNER_ONLY_MESSAGE: &str = "output sent to consortium owner";

/// Address `message` to every participant.
///
/// A successful result of an owner-limited run goes in full to the owner
/// only; everyone else gets the result without files and with a generic
/// output.
pub(crate) fn fan_out(
    clients: &[String],
    owner: Option<&str>,
    limit_output_to_owner: bool,
    message: &ControlMessage,
) -> Vec<Outbound> {
    let limited = limit_output_to_owner && message.success == Some(true);
    clients
        .iter()
        .map(|client| {
            let topic = Topics::client_run(client);
            if !limited {
                return Outbound::new(topic, message.clone(), Qos::AtMostOnce);
            }
            if owner == Some(client.as_str()) {
                Outbound::new(topic, message.clone(), Qos::AtLeastOnce)
            } else {
                let redacted = ControlMessage {
                    output: Some(json!({ "message": OWNER_ONLY_MESSAGE })),
                    files: None,
                    ..message.clone()
                };
                Outbound::new(topic, redacted, Qos::AtMostOnce)
            }
        })
        .collect()
}

/// File server callbacks; uploads land in `input/<remote>/<run>/<client>`.
pub(crate) struct TransferHooks {
    inner: Weak<Inner>,
}

impl TransferHooks {
    pub(crate) fn new(inner: Weak<Inner>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl TransferHandler for TransferHooks {
    async fn staging_dir(&self, client_id: &str, run_id: &str) -> Option<PathBuf> {
        let inner = self.inner.upgrade()?;
        let registry = inner.registry.lock().await;
        registry
            .runs
            .get(run_id)
            .filter(|entry| entry.clients.iter().any(|c| c == client_id))
            .map(|entry| entry.directories.base.join(client_id))
    }

    async fn file_received(&self, client_id: &str, run_id: &str, filename: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_file_received(client_id, run_id, filename).await;
        }
    }

    async fn served_dir(&self, client_id: &str, run_id: &str) -> Option<PathBuf> {
        let inner = self.inner.upgrade()?;
        let registry = inner.registry.lock().await;
        registry
            .runs
            .get(run_id)
            .filter(|entry| entry.clients.iter().any(|c| c == client_id))
            .map(|entry| entry.directories.transfer.clone())
    }
}

impl Inner {
    /// `register`: a client announces itself for a run.
    pub(crate) async fn on_register(&self, message: ControlMessage) {
        let ControlMessage { id, run_id, .. } = message;
        let kicked_off = {
            let mut registry = self.registry.lock().await;
            let running = registry
                .runs
                .get(&run_id)
                .is_some_and(|entry| entry.state != RunState::Created);
            let record = registry.enroll(&id, &run_id);
            record.last_seen = Some(Utc::now());
            if running {
                record.registration = Registration::Registered;
            } else if record.registration != Registration::Registered {
                record.registration = Registration::PreRegistered;
            }
            running
        };

        if kicked_off {
            info!(client_id = %id, run_id = %run_id, "Client registered");
            self.publish(
                &Topics::client_register(&id),
                &ControlMessage::register(&self.config.client_id, &run_id),
                Qos::AtLeastOnce,
            )
            .await;
        } else {
            debug!(client_id = %id, run_id = %run_id, "Client pre-registered");
        }
    }

    /// `run`: iteration data or an error from a client.
    #[instrument(skip(self, message), fields(client_id = %message.id, run_id = %message.run_id, iteration = ?message.iteration))]
    pub(crate) async fn on_client_data(self: &Arc<Self>, message: ControlMessage) {
        let ControlMessage {
            id,
            run_id,
            iteration,
            output,
            error,
            files,
            ..
        } = message;

        let mut registry = self.registry.lock().await;
        let known = registry.runs.contains_key(&run_id)
            && registry
                .clients
                .get(&id)
                .is_some_and(|record| record.runs.contains_key(&run_id));
        if !known {
            drop(registry);
            debug!("Data for an unknown run");
            self.publish(
                &Topics::client_run(&id),
                &ControlMessage::error(
                    &self.config.client_id,
                    &run_id,
                    RunError::new("Remote has no such pipeline run"),
                ),
                Qos::AtMostOnce,
            )
            .await;
            return;
        }
        if let Some(record) = registry.clients.get_mut(&id) {
            record.last_seen = Some(Utc::now());
        }

        if let Some(error) = error {
            let outbox = client_failed(&mut registry, &self.config.client_id, &run_id, &id, &error);
            drop(registry);
            self.publish_all(outbox).await;
            return;
        }

        let Some(entry) = registry.runs.get(&run_id) else {
            return;
        };
        if let Some(run_error) = entry.error.clone() {
            // the run already failed; repeat the error to whoever is still sending
            let outbox = fan_out(
                &entry.clients,
                entry.owner.as_deref(),
                entry.limit_output_to_owner,
                &ControlMessage::error(&self.config.client_id, &run_id, run_error),
            );
            drop(registry);
            self.publish_all(outbox).await;
            return;
        }

        let expected = entry.iteration + 1;
        if registry.store.has(&run_id, &id) || iteration != Some(expected) {
            debug!(expected, "Duplicate or out of order data dropped");
            return;
        }

        registry.store.put(&run_id, &id, output.unwrap_or(Value::Null));
        let mut extract = false;
        if let Some(files_state) = registry.client_run_mut(&id, &run_id) {
            files_state.expected.extend(files.unwrap_or_default());
            if files_state.ready_to_extract() {
                files_state.extraction = Extraction::Running;
                extract = true;
            }
        }

        self.progress(registry, &run_id).await;
        if extract {
            tokio::spawn(self.clone().extract_upload(id, run_id));
        }
    }

    /// `finished`: a client is done with a run's final transfer or error.
    pub(crate) async fn on_finished(&self, message: ControlMessage) {
        let ControlMessage { id, run_id, .. } = message;
        let cleanup = {
            let mut registry = self.registry.lock().await;
            let Some(entry) = registry.runs.get_mut(&run_id) else {
                debug!(client_id = %id, run_id = %run_id, "Acknowledgement for an unknown run");
                return;
            };
            if !entry.clients.contains(&id) || entry.final_transfer.is_none() {
                return;
            }
            debug!(client_id = %id, run_id = %run_id, "Client acknowledged");
            entry.acknowledge(&id) && entry.finished
        };

        if cleanup {
            if let Err(e) = self.cleanup_run(&run_id).await {
                warn!(run_id = %run_id, error = %e, "Cleanup failed");
            }
        }
    }

    pub(crate) async fn on_file_received(self: &Arc<Self>, client_id: &str, run_id: &str, filename: &str) {
        let extract = {
            let mut registry = self.registry.lock().await;
            let Some(files_state) = registry.client_run_mut(client_id, run_id) else {
                return;
            };
            files_state.received.insert(filename.to_string());
            debug!(client_id = %client_id, run_id = %run_id, file = %filename, "Upload recorded");
            if files_state.ready_to_extract() {
                files_state.extraction = Extraction::Running;
                true
            } else {
                false
            }
        };

        if extract {
            tokio::spawn(self.clone().extract_upload(client_id.to_string(), run_id.to_string()));
        }
    }

    /// Unpack a client's uploaded chunks into its staging directory.
    async fn extract_upload(self: Arc<Self>, client_id: String, run_id: String) {
        let Some((staging, parts)) = ({
            let mut registry = self.registry.lock().await;
            let staging = registry
                .runs
                .get(&run_id)
                .map(|entry| entry.directories.base.join(&client_id));
            let parts = registry
                .client_run_mut(&client_id, &run_id)
                .map(|files_state| files_state.expected.iter().cloned().collect::<Vec<_>>());
            staging.zip(parts)
        }) else {
            return;
        };

        let paths: Vec<PathBuf> = parts.iter().map(|part| staging.join(part)).collect();
        let result = extract_parts_async(paths.clone(), staging).await;
        for path in &paths {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(file = %path.display(), error = %e, "Could not remove archive part");
            }
        }

        let mut registry = self.registry.lock().await;
        match result {
            Ok(()) => {
                debug!(client_id = %client_id, run_id = %run_id, parts = parts.len(), "Client files extracted");
                if let Some(files_state) = registry.client_run_mut(&client_id, &run_id) {
                    files_state.extraction = Extraction::Done;
                }
                self.progress(registry, &run_id).await;
            }
            Err(e) => {
                error!(client_id = %client_id, run_id = %run_id, error = %e, "Could not extract client files");
                if let Some(entry) = registry.runs.get_mut(&run_id) {
                    entry.resolve(Err(e.into()));
                }
            }
        }
    }

    /// Report who the run still waits on; resume it once nobody.
    ///
    /// Takes the registry guard so the transfer directory is cleared
    /// without holding it.
    async fn progress(&self, mut registry: MutexGuard<'_, Registry>, run_id: &str) {
        let waiting_on = registry.waiting_on(run_id);
        let Some(entry) = registry.runs.get(run_id) else {
            return;
        };
        if entry.state == RunState::ReceivedAllClientsData {
            return;
        }
        entry.emit_waiting_on(waiting_on.clone());
        if !waiting_on.is_empty() {
            debug!(run_id = %run_id, ?waiting_on, "Waiting on clients");
            return;
        }

        let clients = entry.clients.clone();
        for client in &clients {
            if let Some(files_state) = registry.client_run_mut(client, run_id) {
                files_state.reset();
            }
        }
        let outputs = registry.store.take_run(run_id);
        let Some(entry) = registry.runs.get_mut(run_id) else {
            return;
        };
        entry.state = RunState::ReceivedAllClientsData;
        // replays of the consumed iteration are now out of order
        entry.iteration += 1;
        let transfer = entry.directories.transfer.clone();
        drop(registry);

        if let Err(e) = clear_dir(&transfer).await {
            warn!(run_id = %run_id, error = %e, "Could not clear transfer directory");
        }

        let mut registry = self.registry.lock().await;
        if let Some(entry) = registry.runs.get_mut(run_id) {
            info!(run_id = %run_id, clients = clients.len(), "Received all clients data");
            entry.resolve(Ok(RemoteResponse::new(Value::Object(outputs), false)));
        }
    }
}

/// Book a client's error against its run and address it, signed by
/// `sender`, to every participant.
fn client_failed(
    registry: &mut Registry,
    sender: &str,
    run_id: &str,
    client_id: &str,
    error: &RunError,
) -> Vec<Outbound> {
    let Some(entry) = registry.runs.get_mut(run_id) else {
        return Vec::new();
    };
    let mut annotated = RunError::from_client(run_id, client_id, &error.message);
    annotated.stack.clone_from(&error.stack);
    warn!(run_id = %run_id, client_id = %client_id, error = %error.message, "Client reported an error");

    entry.state = RunState::ReceivedClientError;
    entry.error = Some(annotated.clone());
    entry.final_transfer = Some(HashSet::from([client_id.to_string()]));
    entry.resolve(Err(PipelineError::Peer(annotated.clone())));

    fan_out(
        &entry.clients,
        entry.owner.as_deref(),
        entry.limit_output_to_owner,
        &ControlMessage::error(sender, run_id, annotated),
    )
}
