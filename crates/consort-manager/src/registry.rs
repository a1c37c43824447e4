//! Bookkeeping for active runs and the clients taking part in them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::oneshot;
use tracing::warn;

use consort_core::{
    PipelineError, PipelineHandle, RemoteResponse, RunDirectories, RunError, StateUpdate,
};

use crate::store::IoStore;

/// Lifecycle of a run as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Constructed; the remote has not kicked the run off yet
    Created,
    /// Local node acknowledged by the remote
    Registered,
    Running,
    /// Remote: every participant delivered data and files for the iteration
    ReceivedAllClientsData,
    /// Local: the remote's aggregate arrived
    ReceivedCentralNodeData,
    Finished,
    /// Remote: the remote's own pipeline failed
    CentralNodeError,
    /// Remote: a participant reported an error
    ReceivedClientError,
    /// Local: the remote reported an error
    ReceivedError,
}

/// Registration of a client with the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Registration {
    #[default]
    Unregistered,
    /// Registered before the run was kicked off
    PreRegistered,
    Registered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Extraction {
    #[default]
    Idle,
    Running,
    Done,
}

/// File accounting of one client in one run, for the current exchange.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClientRun {
    pub(crate) expected: BTreeSet<String>,
    pub(crate) received: BTreeSet<String>,
    pub(crate) extraction: Extraction,
}

impl ClientRun {
    /// Announced files that are not on disk and unpacked yet.
    pub(crate) fn files_pending(&self) -> bool {
        !self.expected.is_empty() && self.extraction != Extraction::Done
    }

    /// Every announced file arrived and nobody is unpacking them.
    pub(crate) fn ready_to_extract(&self) -> bool {
        !self.expected.is_empty()
            && self.extraction == Extraction::Idle
            && self.expected.is_subset(&self.received)
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A client known to the remote.
#[derive(Debug, Clone, Default)]
pub(crate) struct RemoteClient {
    pub(crate) registration: Registration,
    pub(crate) last_seen: Option<DateTime<Utc>>,
    pub(crate) runs: HashMap<String, ClientRun>,
}

/// Snapshot of a remote-client record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatus {
    pub id: String,
    pub registration: Registration,
    pub last_seen: Option<DateTime<Utc>>,
    /// Runs the client takes part in
    pub runs: Vec<String>,
}

/// Output a local node could not send before it was registered.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Outgoing {
    pub(crate) output: Value,
    pub(crate) success: bool,
    pub(crate) iteration: u64,
}

pub(crate) type Reply = Result<RemoteResponse, PipelineError>;

/// One active run.
pub(crate) struct RunEntry {
    pub(crate) state: RunState,
    /// Id of the spec the run was started from
    pub(crate) pipeline_id: Option<String>,
    pub(crate) directories: RunDirectories,
    pub(crate) clients: Vec<String>,
    pub(crate) owner: Option<String>,
    pub(crate) limit_output_to_owner: bool,
    /// Any step exchanges data with peers
    pub(crate) decentralized: bool,
    pub(crate) handle: PipelineHandle,
    /// Controller iteration of the exchange in progress
    pub(crate) iteration: u64,
    pub(crate) error: Option<RunError>,
    pub(crate) registered: bool,
    pub(crate) stashed: Option<Outgoing>,
    pending: Option<oneshot::Sender<Reply>>,
    early: Option<Reply>,
    /// Clients that acknowledged the final transfer or the run error
    pub(crate) final_transfer: Option<HashSet<String>>,
    /// The pipeline future has settled
    pub(crate) finished: bool,
}

impl RunEntry {
    pub(crate) fn new(
        directories: RunDirectories,
        clients: Vec<String>,
        owner: Option<String>,
        limit_output_to_owner: bool,
        decentralized: bool,
        handle: PipelineHandle,
    ) -> Self {
        Self {
            state: RunState::Created,
            pipeline_id: None,
            directories,
            clients,
            owner,
            limit_output_to_owner,
            decentralized,
            handle,
            iteration: 0,
            error: None,
            registered: false,
            stashed: None,
            pending: None,
            early: None,
            final_transfer: None,
            finished: false,
        }
    }

    /// Park the controller's exchange; returns the receiver it waits on.
    ///
    /// A reply that arrived before the exchange was parked is delivered
    /// immediately.
    pub(crate) fn park(&mut self) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        match self.early.take() {
            Some(reply) => {
                let _ = tx.send(reply);
            }
            None => self.pending = Some(tx),
        }
        rx
    }

    /// Whether a controller is waiting on a reply.
    pub(crate) fn is_parked(&self) -> bool {
        self.pending.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Hand `reply` to the parked exchange.
    pub(crate) fn resolve(&mut self, reply: Reply) {
        match self.pending.take() {
            Some(tx) => {
                if tx.send(reply).is_err() {
                    warn!("Exchange was dropped before its reply arrived");
                }
            }
            None => self.early = Some(reply),
        }
    }

    /// Acknowledge `client_id`; true once cleanup may proceed.
    pub(crate) fn acknowledge(&mut self, client_id: &str) -> bool {
        if let Some(acked) = self.final_transfer.as_mut() {
            acked.insert(client_id.to_string());
        }
        self.all_acknowledged()
    }

    /// Every participant, or the owner of an owner-limited run, acknowledged.
    pub(crate) fn all_acknowledged(&self) -> bool {
        let Some(acked) = &self.final_transfer else {
            return true;
        };
        if self.limit_output_to_owner
            && self.owner.as_ref().is_some_and(|owner| acked.contains(owner))
        {
            return true;
        }
        self.clients.iter().all(|client| acked.contains(client))
    }

    /// Re-emit the run's latest status with a waiting-on list.
    pub(crate) fn emit_waiting_on(&self, waiting_on: Vec<String>) {
        let status = self.handle.status();
        let update = StateUpdate {
            run_id: self.handle.run_id().to_string(),
            step: status.current_step,
            iteration: status.current_iteration,
            state: status.step_state,
            command: status.command,
            waiting_on,
        };
        let _ = self.handle.events().send(update);
    }
}

/// All runs and remote clients of one manager.
#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) runs: HashMap<String, RunEntry>,
    pub(crate) clients: HashMap<String, RemoteClient>,
    pub(crate) store: IoStore,
}

impl Registry {
    /// Participants of `run_id` that still owe output or files.
    pub(crate) fn waiting_on(&self, run_id: &str) -> Vec<String> {
        let Some(run) = self.runs.get(run_id) else {
            return Vec::new();
        };
        run.clients
            .iter()
            .filter(|client| {
                let files_pending = self
                    .clients
                    .get(client.as_str())
                    .and_then(|record| record.runs.get(run_id))
                    .is_some_and(ClientRun::files_pending);
                !self.store.has(run_id, client) || files_pending
            })
            .cloned()
            .collect()
    }

    /// The record of `client_id` for `run_id`, if both exist.
    pub(crate) fn client_run_mut(&mut self, client_id: &str, run_id: &str) -> Option<&mut ClientRun> {
        self.clients.get_mut(client_id)?.runs.get_mut(run_id)
    }

    /// Ensure `client_id` has a record for `run_id`.
    pub(crate) fn enroll(&mut self, client_id: &str, run_id: &str) -> &mut RemoteClient {
        let record = self.clients.entry(client_id.to_string()).or_default();
        record.runs.entry(run_id.to_string()).or_default();
        record
    }

    /// Remove a run and everything recorded for it.
    pub(crate) fn evict(&mut self, run_id: &str) -> Option<RunEntry> {
        let entry = self.runs.remove(run_id)?;
        for record in self.clients.values_mut() {
            record.runs.remove(run_id);
        }
        self.store.remove_run(run_id);
        Some(entry)
    }

    pub(crate) fn client_statuses(&self) -> Vec<ClientStatus> {
        let mut statuses: Vec<ClientStatus> = self
            .clients
            .iter()
            .map(|(id, record)| {
                let mut runs: Vec<String> = record.runs.keys().cloned().collect();
                runs.sort();
                ClientStatus {
                    id: id.clone(),
                    registration: record.registration,
                    last_seen: record.last_seen,
                    runs,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }
}
