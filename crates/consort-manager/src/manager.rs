//! The pipeline manager: owns the runs of one node.

use futures::StreamExt;
use serde_json::Value;
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use consort_bus::{MessageBus, MessageStream, NatsBus, Topics};
use consort_container::{ContainerRuntime, DockerRuntime};
use consort_core::{
    ControlMessage, ControllerType, Mode, Pipeline, PipelineError, PipelineHandle,
    PipelineOptions, PipelineSpec, Qos, RemoteHandler, RunDirectories, RunError, StateUpdate,
};
use consort_transfer::{TransferClient, TransferServer};

use crate::config::ManagerConfig;
use crate::link::RunLink;
use crate::registry::{ClientStatus, Registry, RunEntry, RunState};
use crate::remote::{fan_out, TransferHooks};

/// A control message waiting to be published.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Outbound {
    pub(crate) topic: String,
    pub(crate) message: ControlMessage,
    pub(crate) qos: Qos,
}

impl Outbound {
    pub(crate) fn new(topic: impl Into<String>, message: ControlMessage, qos: Qos) -> Self {
        Self {
            topic: topic.into(),
            message,
            qos,
        }
    }
}

/// Subscriptions a manager listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Listener {
    Register,
    Run,
    Finished,
    ClientRegister,
    ClientRun,
}

pub(crate) struct Inner {
    pub(crate) config: ManagerConfig,
    pub(crate) bus: Arc<dyn MessageBus>,
    runtime: Arc<dyn ContainerRuntime>,
    pub(crate) transfer: TransferClient,
    pub(crate) registry: Mutex<Registry>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    server: Mutex<Option<TransferServer>>,
    server_addr: OnceLock<SocketAddr>,
    owns_bus: bool,
}

/// Handle to a started run.
pub struct RunHandle {
    pub run_id: String,
    /// Status and stop control of the run's pipeline
    pub pipeline: PipelineHandle,
    /// State updates, including the remote's waiting-on lists
    pub state: broadcast::Receiver<StateUpdate>,
    result: JoinHandle<Result<Value, PipelineError>>,
}

impl RunHandle {
    /// Wait for the run to settle and return its final output.
    ///
    /// # Errors
    ///
    /// Returns the error the run failed with.
    pub async fn result(self) -> Result<Value, PipelineError> {
        match self.result.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(PipelineError::Stopped),
        }
    }
}

/// Builder for [`PipelineManager`].
pub struct ManagerBuilder {
    config: ManagerConfig,
    bus: Arc<dyn MessageBus>,
    runtime: Arc<dyn ContainerRuntime>,
    transfer: Option<TransferClient>,
    owns_bus: bool,
}

impl ManagerBuilder {
    /// Start from explicit collaborators.
    #[must_use]
    pub fn new(
        config: ManagerConfig,
        bus: Arc<dyn MessageBus>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            config,
            bus,
            runtime,
            transfer: None,
            owns_bus: false,
        }
    }

    /// Use this file client instead of one built from the config.
    #[must_use]
    pub fn with_transfer_client(mut self, client: TransferClient) -> Self {
        self.transfer = Some(client);
        self
    }

    /// Disconnect the bus on [`PipelineManager::shutdown`].
    #[must_use]
    pub fn with_owned_bus(mut self, owned: bool) -> Self {
        self.owns_bus = owned;
        self
    }

    /// Bind the file server (remote mode), subscribe to the node's topics
    /// and return the manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the file server cannot bind or a subscription
    /// cannot be established.
    pub async fn build(self) -> Result<PipelineManager, PipelineError> {
        let transfer = self.transfer.unwrap_or_else(|| {
            TransferClient::new(self.config.remote.url())
                .with_base_delay(self.config.transfer.retry_base_delay())
        });

        let inner = Arc::new(Inner {
            config: self.config,
            bus: self.bus,
            runtime: self.runtime,
            transfer,
            registry: Mutex::new(Registry::default()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            server: Mutex::new(None),
            server_addr: OnceLock::new(),
            owns_bus: self.owns_bus,
        });

        let client_id = inner.config.client_id.clone();
        let listeners = match inner.config.mode {
            Mode::Remote => {
                let hooks = Arc::new(TransferHooks::new(Arc::downgrade(&inner)));
                let server =
                    TransferServer::bind(inner.config.listen_addr, &inner.config.remote.pathname, hooks)
                        .await?;
                let _ = inner.server_addr.set(server.local_addr());
                *inner.server.lock().await = Some(server);

                vec![
                    (Listener::Register, Topics::REGISTER.to_string()),
                    (Listener::Run, Topics::RUN.to_string()),
                    (Listener::Finished, Topics::FINISHED.to_string()),
                ]
            }
            Mode::Local => vec![
                (Listener::ClientRegister, Topics::client_register(&client_id)),
                (Listener::ClientRun, Topics::client_run(&client_id)),
            ],
        };

        let mut tasks = Vec::with_capacity(listeners.len());
        for (listener, topic) in listeners {
            let stream = inner.bus.channel(&topic).subscribe().await?;
            debug!(topic = %topic, "Subscribed");
            tasks.push(tokio::spawn(inner.clone().listen(listener, stream)));
        }
        inner.tasks.lock().await.extend(tasks);

        info!(client_id = %client_id, mode = %inner.config.mode, "Pipeline manager ready");
        Ok(PipelineManager { inner })
    }
}

/// Runs pipelines for one node and talks to the other nodes of each run.
#[derive(Clone)]
pub struct PipelineManager {
    inner: Arc<Inner>,
}

impl PipelineManager {
    /// Builder over explicit collaborators.
    #[must_use]
    pub fn builder(
        config: ManagerConfig,
        bus: Arc<dyn MessageBus>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> ManagerBuilder {
        ManagerBuilder::new(config, bus, runtime)
    }

    /// Connect to NATS and the Docker Engine named in `config`.
    ///
    /// # Errors
    ///
    /// Fails if the bus cannot be reached, or as [`ManagerBuilder::build`].
    #[instrument(skip(config), fields(client_id = %config.client_id, mode = %config.mode))]
    pub async fn create(config: ManagerConfig) -> Result<Self, PipelineError> {
        let bus = NatsBus::connect(&config.bus_url, &config.client_id).await?;
        let runtime = DockerRuntime::new(config.docker_url.clone()).build();

        Self::builder(config, Arc::new(bus), Arc::new(runtime))
            .with_owned_bus(true)
            .build()
            .await
    }

    /// This node's client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.inner.config.mode
    }

    /// Address the file server is bound to (remote mode).
    #[must_use]
    pub fn transfer_addr(&self) -> Option<SocketAddr> {
        self.inner.server_addr.get().copied()
    }

    /// Create the run's directories and start its pipeline in the background.
    ///
    /// `clients` lists the participants of a decentralized run (remote mode).
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DuplicatePipeline`] while a run with this id
    /// is still active, [`PipelineError::InvalidSpec`] for an unusable spec,
    /// and IO or bus errors from setting the run up.
    #[instrument(skip(self, spec, clients), fields(client_id = %self.inner.config.client_id, clients = clients.len()))]
    pub async fn start_pipeline(
        &self,
        spec: PipelineSpec,
        clients: Vec<String>,
        run_id: &str,
    ) -> Result<RunHandle, PipelineError> {
        let inner = &self.inner;
        let stale = {
            let registry = inner.registry.lock().await;
            match registry.runs.get(run_id) {
                Some(entry) if !entry.finished => {
                    return Err(PipelineError::DuplicatePipeline(run_id.to_string()))
                }
                Some(_) => true,
                None => false,
            }
        };
        if stale {
            // finished, still waiting on acknowledgements
            inner.cleanup_run(run_id).await?;
        }

        let config = &inner.config;
        let directories =
            RunDirectories::new(&config.operating_directory, &config.client_id, run_id);
        let decentralized = spec
            .steps
            .iter()
            .any(|step| step.controller.kind == ControllerType::Decentralized);
        let owner = spec.owner.clone();
        let limit_output_to_owner = spec.limit_output_to_owner;
        let pipeline_id = spec.id.clone();

        let pipeline = Pipeline::new(
            spec,
            run_id,
            PipelineOptions {
                mode: config.mode,
                client_id: config.client_id.clone(),
                directories: directories.clone(),
                runtime: inner.runtime.clone(),
            },
        )?;
        let handle = pipeline.handle();
        let state = handle.subscribe();

        {
            let mut registry = inner.registry.lock().await;
            if registry.runs.contains_key(run_id) {
                return Err(PipelineError::DuplicatePipeline(run_id.to_string()));
            }
            if config.mode == Mode::Remote {
                for client in &clients {
                    registry.enroll(client, run_id);
                }
            }
            let mut entry = RunEntry::new(
                directories.clone(),
                clients,
                owner,
                limit_output_to_owner,
                decentralized,
                handle.clone(),
            );
            entry.pipeline_id = pipeline_id;
            registry.runs.insert(run_id.to_string(), entry);
        }

        if let Err(e) = create_directories(&directories).await {
            inner.cleanup_run(run_id).await?;
            return Err(e.into());
        }

        if config.mode == Mode::Local && decentralized {
            let register = ControlMessage::register(&config.client_id, run_id);
            if let Err(e) = inner
                .bus
                .publish(Topics::REGISTER, &register, Qos::AtLeastOnce)
                .await
            {
                inner.cleanup_run(run_id).await?;
                return Err(e.into());
            }
        }

        let link: Arc<dyn RemoteHandler> = Arc::new(RunLink::new(inner.clone(), run_id));
        let driver = inner.clone();
        let id = run_id.to_string();
        let result = tokio::spawn(async move {
            let outcome = pipeline.run(link).await;
            driver.settle(&id, outcome).await
        });

        info!(run_id = %run_id, "Pipeline started");
        Ok(RunHandle {
            run_id: run_id.to_string(),
            pipeline: handle,
            state,
            result,
        })
    }

    /// Ask the active step of a run to stop.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidPipelineId`] for an unknown run, or a
    /// run started from a spec with a different id.
    pub async fn stop_pipeline(&self, pipeline_id: &str, run_id: &str) -> Result<(), PipelineError> {
        let registry = self.inner.registry.lock().await;
        let entry = registry
            .runs
            .get(run_id)
            .ok_or_else(|| PipelineError::InvalidPipelineId(run_id.to_string()))?;
        if entry
            .pipeline_id
            .as_deref()
            .is_some_and(|id| id != pipeline_id)
        {
            return Err(PipelineError::InvalidPipelineId(pipeline_id.to_string()));
        }
        entry.handle.stop();
        info!(run_id = %run_id, "Stop requested");
        Ok(())
    }

    /// Subscribe to a run's state updates.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidPipelineId`] for an unknown run.
    pub async fn get_pipeline_state_listener(
        &self,
        run_id: &str,
    ) -> Result<broadcast::Receiver<StateUpdate>, PipelineError> {
        self.inner
            .registry
            .lock()
            .await
            .runs
            .get(run_id)
            .map(|entry| entry.handle.subscribe())
            .ok_or_else(|| PipelineError::InvalidPipelineId(run_id.to_string()))
    }

    /// Participants of a run that have not delivered output and files for
    /// the current iteration.
    pub async fn waiting_on_for_run(&self, run_id: &str) -> Vec<String> {
        self.inner.registry.lock().await.waiting_on(run_id)
    }

    /// Manager-level state of a run, `None` once evicted.
    pub async fn run_state(&self, run_id: &str) -> Option<RunState> {
        self.inner
            .registry
            .lock()
            .await
            .runs
            .get(run_id)
            .map(|entry| entry.state)
    }

    /// Records of the clients known to this remote.
    pub async fn remote_clients(&self) -> Vec<ClientStatus> {
        self.inner.registry.lock().await.client_statuses()
    }

    /// Remove a run's directories and bookkeeping. A no-op for unknown runs.
    ///
    /// # Errors
    ///
    /// Returns an IO error if a directory exists but cannot be removed.
    pub async fn cleanup_run(&self, run_id: &str) -> Result<(), PipelineError> {
        self.inner.cleanup_run(run_id).await
    }

    /// Stop every run, the subscription loops and the file server.
    ///
    /// # Errors
    ///
    /// Returns an error if the owned bus cannot be disconnected cleanly.
    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        let inner = &self.inner;
        inner.shutdown.cancel();
        for entry in inner.registry.lock().await.runs.values() {
            entry.handle.stop();
        }

        let tasks: Vec<_> = inner.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Listener task failed");
            }
        }
        if let Some(server) = inner.server.lock().await.take() {
            server.shutdown().await;
        }
        if inner.owns_bus {
            inner.bus.disconnect().await?;
        }
        info!(client_id = %inner.config.client_id, "Pipeline manager stopped");
        Ok(())
    }
}

impl Inner {
    async fn listen(self: Arc<Self>, listener: Listener, mut stream: MessageStream) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                message = stream.next() => match message {
                    Some(message) => self.dispatch(listener, message).await,
                    None => {
                        debug!(?listener, "Subscription closed");
                        break;
                    }
                },
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, listener: Listener, message: ControlMessage) {
        debug!(?listener, client_id = %message.id, run_id = %message.run_id, "Message received");
        match listener {
            Listener::Register => self.on_register(message).await,
            Listener::Run => self.on_client_data(message).await,
            Listener::Finished => self.on_finished(message).await,
            Listener::ClientRegister => self.on_registered(message).await,
            Listener::ClientRun => self.on_central_data(message).await,
        }
    }

    /// Publish, logging instead of failing.
    pub(crate) async fn publish(&self, topic: &str, message: &ControlMessage, qos: Qos) {
        match self.bus.publish(topic, message, qos).await {
            Ok(()) => debug!(topic = %topic, run_id = %message.run_id, "Published"),
            Err(e) => error!(topic = %topic, run_id = %message.run_id, error = %e, "Publish failed"),
        }
    }

    pub(crate) async fn publish_all(&self, outbox: Vec<Outbound>) {
        for out in outbox {
            self.publish(&out.topic, &out.message, out.qos).await;
        }
    }

    /// Book the outcome of a run's pipeline and clean up when no peer still
    /// owes an acknowledgement.
    async fn settle(
        &self,
        run_id: &str,
        outcome: Result<Value, PipelineError>,
    ) -> Result<Value, PipelineError> {
        let mut outbox = Vec::new();
        let cleanup = {
            let mut registry = self.registry.lock().await;
            let Some(entry) = registry.runs.get_mut(run_id) else {
                return outcome;
            };
            entry.finished = true;

            match &outcome {
                Ok(_) => {
                    entry.state = RunState::Finished;
                    info!(run_id = %run_id, "Pipeline finished");
                }
                Err(err) => {
                    warn!(run_id = %run_id, error = %err, "Pipeline failed");
                    match self.config.mode {
                        Mode::Remote if entry.error.is_none() => {
                            let run_error = RunError::from_central_node(&err.to_string());
                            entry.state = RunState::CentralNodeError;
                            entry.error = Some(run_error.clone());
                            entry.final_transfer = Some(HashSet::new());
                            outbox = fan_out(
                                &entry.clients,
                                entry.owner.as_deref(),
                                entry.limit_output_to_owner,
                                &ControlMessage::error(&self.config.client_id, run_id, run_error),
                            );
                        }
                        Mode::Local if entry.decentralized && entry.error.is_none() => {
                            outbox.push(Outbound::new(
                                Topics::RUN,
                                ControlMessage::error(&self.config.client_id, run_id, RunError::from(err)),
                                Qos::AtLeastOnce,
                            ));
                        }
                        _ => {}
                    }
                }
            }
            self.config.mode == Mode::Local || entry.clients.is_empty() || entry.all_acknowledged()
        };

        self.publish_all(outbox).await;
        if cleanup {
            if let Err(e) = self.cleanup_run(run_id).await {
                warn!(run_id = %run_id, error = %e, "Cleanup failed");
            }
        } else {
            debug!(run_id = %run_id, "Waiting on acknowledgements before cleanup");
        }
        outcome
    }

    pub(crate) async fn cleanup_run(&self, run_id: &str) -> Result<(), PipelineError> {
        let Some(entry) = self.registry.lock().await.evict(run_id) else {
            debug!(run_id = %run_id, "Nothing to clean up");
            return Ok(());
        };
        entry.handle.stop();

        for dir in entry.directories.all() {
            if self.config.preserve_output && dir == entry.directories.output.as_path() {
                continue;
            }
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(run_id = %run_id, "Run cleaned up");
        Ok(())
    }
}

async fn create_directories(directories: &RunDirectories) -> io::Result<()> {
    for dir in directories.all() {
        tokio::fs::create_dir_all(dir).await?;
    }
    Ok(())
}

/// Remove everything inside `dir`, keeping `dir` itself.
pub(crate) async fn clear_dir(dir: &Path) -> io::Result<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(entry.path()).await?;
        } else {
            tokio::fs::remove_file(entry.path()).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clear_dir_keeps_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"a").await.unwrap();
        tokio::fs::create_dir_all(dir.path().join("nested/deeper")).await.unwrap();

        clear_dir(dir.path()).await.unwrap();

        assert!(dir.path().exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_clear_missing_dir_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        clear_dir(&dir.path().join("missing")).await.unwrap();
    }
}
