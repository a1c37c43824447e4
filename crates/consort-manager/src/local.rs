//! Local-node side of the control and file channels.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use consort_bus::Topics;
use consort_core::{ControlMessage, PipelineError, Qos, RemoteResponse, RunError};
use consort_transfer::{archive_directory_async, extract_parts_async};

use crate::manager::{clear_dir, Inner};
use crate::registry::{Outgoing, RunState};

impl Inner {
    /// `<id>-register`: the remote accepted this node for a run.
    pub(crate) async fn on_registered(&self, message: ControlMessage) {
        let run_id = message.run_id;
        let stashed = {
            let mut registry = self.registry.lock().await;
            let Some(entry) = registry.runs.get_mut(&run_id) else {
                debug!(run_id = %run_id, "Registration for an unknown run");
                return;
            };
            if entry.registered {
                debug!(run_id = %run_id, "Already registered");
                return;
            }
            entry.registered = true;
            if entry.state == RunState::Created {
                entry.state = RunState::Registered;
            }
            entry.stashed.take()
        };

        info!(run_id = %run_id, "Registered with remote");
        if let Some(outgoing) = stashed {
            self.send_output(&run_id, outgoing).await;
        }
    }

    /// Send this node's output for an iteration, uploading any files the
    /// computation left in the transfer directory.
    pub(crate) async fn send_output(&self, run_id: &str, outgoing: Outgoing) {
        let client_id = self.config.client_id.as_str();
        let Some(transfer) = self
            .registry
            .lock()
            .await
            .runs
            .get(run_id)
            .map(|entry| entry.directories.transfer.clone())
        else {
            return;
        };

        let archive = format!("{run_id}-{client_id}-tempOutput.tar.gz");
        let files = match archive_directory_async(
            transfer.clone(),
            transfer.clone(),
            archive,
            self.config.transfer.chunk_size,
        )
        .await
        {
            Ok(files) => files,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Could not archive transfer directory");
                self.fail_exchange(run_id, e.into()).await;
                return;
            }
        };

        let message = ControlMessage::data(
            client_id,
            run_id,
            outgoing.iteration,
            outgoing.output,
            outgoing.success,
        );
        if files.is_empty() {
            self.publish(Topics::RUN, &message, Qos::AtLeastOnce).await;
            return;
        }

        self.publish(Topics::RUN, &message.with_files(files.clone()), Qos::AtMostOnce)
            .await;
        debug!(run_id = %run_id, files = files.len(), "Uploading files");
        let upload = self
            .transfer
            .upload_files(
                &files,
                client_id,
                run_id,
                &transfer,
                self.config.transfer.upload_retry_limit,
            )
            .await;
        if let Err(e) = upload {
            let err = PipelineError::from(e);
            error!(run_id = %run_id, error = %err, "Upload failed");
            self.publish(
                Topics::RUN,
                &ControlMessage::error(client_id, run_id, RunError::from(&err)),
                Qos::AtLeastOnce,
            )
            .await;
            self.fail_exchange(run_id, err).await;
        }
    }

    /// `<id>-run`: the remote's aggregate, final result or error.
    #[instrument(skip(self, message), fields(run_id = %message.run_id, iteration = ?message.iteration))]
    pub(crate) async fn on_central_data(self: &Arc<Self>, message: ControlMessage) {
        let ControlMessage {
            run_id,
            iteration,
            output,
            success,
            error,
            files,
            ..
        } = message;
        let client_id = self.config.client_id.as_str();

        if let Some(run_error) = error {
            let known = {
                let mut registry = self.registry.lock().await;
                match registry.runs.get_mut(&run_id) {
                    Some(entry) => {
                        warn!(error = %run_error.message, "Remote reported an error");
                        entry.state = RunState::ReceivedError;
                        entry.error = Some(run_error.clone());
                        entry.resolve(Err(PipelineError::Peer(run_error)));
                        true
                    }
                    None => false,
                }
            };
            if known {
                self.publish(
                    Topics::FINISHED,
                    &ControlMessage::finished(client_id, &run_id),
                    Qos::AtLeastOnce,
                )
                .await;
            }
            return;
        }

        let success = success.unwrap_or(false);
        let files = files.unwrap_or_default();
        let (target, transfer): (PathBuf, PathBuf) = {
            let mut registry = self.registry.lock().await;
            let Some(entry) = registry.runs.get_mut(&run_id) else {
                debug!("Data for an unknown run");
                return;
            };
            if iteration != Some(entry.iteration) || !entry.is_parked() {
                debug!(expected = entry.iteration, "Duplicate or out of order data dropped");
                return;
            }
            entry.state = RunState::ReceivedCentralNodeData;
            let target = if success {
                entry.directories.output.clone()
            } else {
                entry.directories.base.clone()
            };
            (target, entry.directories.transfer.clone())
        };

        if !files.is_empty() {
            if let Err(err) = self.fetch(&run_id, &files, target).await {
                error!(error = %err, "Could not fetch remote files");
                if !success {
                    self.publish(
                        Topics::RUN,
                        &ControlMessage::error(client_id, &run_id, RunError::from(&err)),
                        Qos::AtLeastOnce,
                    )
                    .await;
                }
                self.fail_exchange(&run_id, err).await;
                return;
            }
            if success {
                self.publish(
                    Topics::FINISHED,
                    &ControlMessage::finished(client_id, &run_id),
                    Qos::AtLeastOnce,
                )
                .await;
            }
        }

        if let Err(e) = clear_dir(&transfer).await {
            warn!(error = %e, "Could not clear transfer directory");
        }

        let mut registry = self.registry.lock().await;
        if let Some(entry) = registry.runs.get_mut(&run_id) {
            entry.resolve(Ok(RemoteResponse::new(
                output.unwrap_or_default(),
                success,
            )));
        }
    }

    /// Download announced files into `target` and unpack them there.
    async fn fetch(&self, run_id: &str, files: &[String], target: PathBuf) -> Result<(), PipelineError> {
        let parts = self
            .transfer
            .download_files(
                files,
                &self.config.client_id,
                run_id,
                &target,
                self.config.transfer.download_retry_limit,
            )
            .await?;
        extract_parts_async(parts.clone(), target).await?;
        for part in &parts {
            tokio::fs::remove_file(part).await?;
        }
        debug!(run_id = %run_id, parts = parts.len(), "Remote files extracted");
        Ok(())
    }

    async fn fail_exchange(&self, run_id: &str, err: PipelineError) {
        if let Some(entry) = self.registry.lock().await.runs.get_mut(run_id) {
            entry.resolve(Err(err));
        }
    }
}
