use crate::{
    coordinator_state::CoordinatorState,
    entropy::EntropySource,
    environment::Environment,
    objects::{Address, Ceremony, CeremonyState, ParticipantUpdate},
    queue::CancelableQueue,
    storage::TranscriptStorage,
    transfer::{DownloadItem, Downloader, RemoteStore, TransferEvent, Uploader},
    verifier::{VerificationRunner, Verifier, VerifyItem},
};

use chrono::{DateTime, Utc};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("the ceremony has already left preselection")]
    CeremonyAlreadyStarted,

    #[error("the ceremony has not sealed")]
    CeremonyNotSealing,

    #[error("the delta entry position is beyond the cached participant list")]
    DeltaOutOfRange,

    #[error("invalid entropy encoding: {0}")]
    EntropyInvalid(#[from] hex::FromHexError),

    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JsonError: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("participant has already been added")]
    ParticipantAlreadyAdded,

    #[error("participant has already started")]
    ParticipantAlreadyStarted,

    #[error("participant is missing")]
    ParticipantMissing,

    #[error("participant does not hold the running slot")]
    ParticipantNotRunning,

    #[error("start sequence mismatch, a full resync is required")]
    StartSequenceMismatch,

    #[error("state lock failed")]
    StateLockFailed,

    #[error("transcript is already complete")]
    TranscriptAlreadyComplete,

    #[error("transcript is missing")]
    TranscriptMissing,

    #[error("transcript is not complete")]
    TranscriptNotComplete,

    #[error("transcript set is empty")]
    TranscriptSetEmpty,
}

///
/// The ceremony coordinator: owns the state machine behind a single
/// lock, drives it on a fixed tick, and wires the verification and
/// transfer pipelines around it. The transport layer calls into the
/// public operations here; pollers read the ceremony document or a
/// sequence-delimited delta of it.
///
pub struct Coordinator {
    environment: Environment,
    state: Arc<RwLock<CoordinatorState>>,
    storage: Arc<dyn TranscriptStorage>,
    entropy: Arc<dyn EntropySource>,
    verifier: Arc<Verifier>,
    uploader: Arc<Uploader>,
    downloader: Arc<Downloader>,
    transfer_events: Mutex<Option<UnboundedReceiver<TransferEvent>>>,
    shutdown: AtomicBool,
}

impl Coordinator {
    ///
    /// Creates a new instance of the `Coordinator`, resuming from the
    /// persisted ceremony document when one exists.
    ///
    pub fn new(
        environment: Environment,
        storage: Arc<dyn TranscriptStorage>,
        runner: Arc<dyn VerificationRunner>,
        remote: Arc<dyn RemoteStore>,
        entropy: Arc<dyn EntropySource>,
    ) -> Result<Self, CoordinatorError> {
        let state = match storage.load_ceremony()? {
            Some(ceremony) => {
                info!("Resuming the ceremony at sequence {}", ceremony.sequence());
                CoordinatorState::from_ceremony(ceremony)
            }
            None => CoordinatorState::new(&environment, Utc::now()),
        };
        let state = Arc::new(RwLock::new(state));

        let (events, receiver) = unbounded_channel();
        let publish = Arc::new(CancelableQueue::new());
        let downloads = Arc::new(CancelableQueue::new());
        let verifier = Arc::new(Verifier::new(
            state.clone(),
            storage.clone(),
            runner,
            Some(publish.clone()),
        ));
        let uploader = Arc::new(Uploader::new(storage.clone(), remote.clone(), publish, events.clone()));
        let downloader = Arc::new(Downloader::new(storage.clone(), remote, downloads, events));

        Ok(Self {
            environment,
            state,
            storage,
            entropy,
            verifier,
            uploader,
            downloader,
            transfer_events: Mutex::new(Some(receiver)),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    ///
    /// Returns the ceremony document for a poller: the full document
    /// when no sequence is given, otherwise a delta containing only the
    /// participants modified after it.
    ///
    pub fn ceremony(&self, after: Option<u64>) -> Result<Ceremony, CoordinatorError> {
        let state = self.read()?;
        Ok(match after {
            Some(sequence) => state.ceremony().delta_since(sequence),
            None => state.ceremony().clone(),
        })
    }

    /// Registers a participant during preselection.
    pub fn add_participant(&self, address: Address, tier: u8) -> Result<(), CoordinatorError> {
        self.write()?.add_participant(address, tier, Utc::now())?;
        self.persist();
        Ok(())
    }

    /// Records a heartbeat for the given participant.
    pub fn ping(&self, address: &Address) -> Result<(), CoordinatorError> {
        self.write()?.ping(address, Utc::now())
    }

    /// Applies a client-reported progress update to the running
    /// participant.
    pub fn update_participant(&self, address: &Address, update: &ParticipantUpdate) -> Result<(), CoordinatorError> {
        self.write()?.update_participant(address, update, Utc::now())
    }

    /// Pauses or resumes dispatching.
    pub fn set_paused(&self, paused: bool) -> Result<(), CoordinatorError> {
        self.write()?.set_paused(paused);
        self.persist();
        Ok(())
    }

    /// Overrides the timeout budget of a single participant.
    pub fn set_participant_timeout(&self, address: &Address, seconds: Option<u64>) -> Result<(), CoordinatorError> {
        self.write()?.set_participant_timeout(address, seconds)?;
        self.persist();
        Ok(())
    }

    /// Marks the sealed ceremony as complete, once the external
    /// publisher has finished with the final artifacts.
    pub fn complete_ceremony(&self) -> Result<(), CoordinatorError> {
        self.write()?.complete_ceremony()?;
        self.persist();
        Ok(())
    }

    ///
    /// Runs the participant selection with the given entropy seed.
    /// A no-op once the ceremony has left preselection.
    ///
    pub fn select_participants(&self, seed: &[u8]) -> Result<bool, CoordinatorError> {
        let selected = self.write()?.select_participants(seed);
        if selected {
            self.persist();
        }
        Ok(selected)
    }

    ///
    /// Accepts an uploaded transcript payload and its detached
    /// signature, stages both, and queues the transcript for
    /// verification. Protocol violations are rejected before anything
    /// is written.
    ///
    pub fn upload_transcript(
        &self,
        address: &Address,
        num: u64,
        data: &[u8],
        signature: &str,
    ) -> Result<(), CoordinatorError> {
        {
            let state = self.read()?;
            if state.running_address() != Some(address) {
                return Err(CoordinatorError::ParticipantNotRunning);
            }
            let participant = state
                .ceremony()
                .participant(address)
                .ok_or(CoordinatorError::ParticipantMissing)?;
            let transcript = participant.transcript(num).ok_or(CoordinatorError::TranscriptMissing)?;
            if transcript.is_complete() {
                return Err(CoordinatorError::TranscriptAlreadyComplete);
            }
        }

        self.storage.stage_transcript(address, num, data)?;
        self.storage.stage_signature(address, num, signature)?;

        if let Err(error) = self
            .write()?
            .transcript_uploaded(address, num, data.len() as u64, Utc::now())
        {
            // The running slot moved between validation and recording;
            // leave no stray staged artifact behind.
            let _ = self.storage.erase_staged_transcript(address, num);
            return Err(error);
        }
        self.persist();

        self.verifier.submit(VerifyItem {
            address: address.clone(),
            num,
        });
        Ok(())
    }

    /// Reads back a verified transcript payload, e.g. for the running
    /// participant to build on.
    pub fn download_transcript(&self, address: &Address, num: u64) -> Result<Vec<u8>, CoordinatorError> {
        self.storage.read_verified_transcript(address, num)
    }

    ///
    /// Drives the ceremony one step with the given clock reading:
    /// selection once the entropy seed is available, then the state
    /// machine, then the storage and pipeline side effects it asked for.
    ///
    pub fn tick(&self, now: DateTime<Utc>) {
        let awaiting_selection = match self.read() {
            Ok(state) => state.ceremony().state() == CeremonyState::Preselection,
            Err(_) => return,
        };
        if awaiting_selection {
            if let Some(seed) = self.entropy.seed() {
                if let Ok(mut state) = self.state.write() {
                    state.select_participants(&seed);
                }
            }
        }

        let actions = match self.state.write() {
            Ok(mut state) => state.advance(now),
            Err(_) => return,
        };

        for address in &actions.invalidated {
            // Stop any in-flight verification for the evicted address and
            // drop its partial uploads. Queued items for it fall to the
            // verifier's stale guard.
            self.verifier.interrupt();
            if let Err(e) = self.storage.erase_staged(address) {
                warn!("Failed to erase staged data of {}: {}", address, e);
            }
        }

        if let Some(address) = &actions.dispatched {
            if let Err(e) = self.storage.erase_staged(address) {
                warn!("Failed to erase staged data of {}: {}", address, e);
            }
            self.fetch_missing_anchor_data(address);
        }

        self.persist();
    }

    ///
    /// Runs the coordinator until shutdown: spawns the pipeline workers
    /// and ticks the state machine on the configured interval.
    ///
    pub async fn run(self: Arc<Self>) {
        let mut handles = Vec::new();
        let verifier = self.verifier.clone();
        handles.push(tokio::spawn(async move { verifier.run().await }));
        let uploader = self.uploader.clone();
        handles.push(tokio::spawn(async move { uploader.run().await }));
        let downloader = self.downloader.clone();
        handles.push(tokio::spawn(async move { downloader.run().await }));

        // Transfer progress surfaces in the log; the channel keeps the
        // pipelines decoupled from any front-end.
        let events = self.transfer_events.lock().ok().and_then(|mut slot| slot.take());
        let progress = events.map(|mut events| {
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    debug!("Transfer progress: {:?}", event);
                }
            })
        });

        let mut interval = tokio::time::interval(self.environment.tick_interval());
        while !self.shutdown.load(Ordering::SeqCst) {
            interval.tick().await;
            self.tick(Utc::now());
        }

        futures::future::join_all(handles).await;
        if let Some(progress) = progress {
            progress.abort();
        }
        info!("Coordinator has shut down");
    }

    ///
    /// Shuts the coordinator down: the verifier is cancelled (killing
    /// any in-flight external process), the transfer queues drain, and
    /// the tick loop exits. Idempotent.
    ///
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down the coordinator");
        self.verifier.cancel();
        self.uploader.end();
        self.downloader.end();
    }

    /// The dispatched participant builds on the anchor's verified
    /// transcripts; refetch any lost to a crash from the publish store.
    fn fetch_missing_anchor_data(&self, address: &Address) {
        let links: Vec<(Address, u64)> = match self.read() {
            Ok(state) => match state.ceremony().participant(address) {
                Some(participant) => participant
                    .transcripts()
                    .iter()
                    .filter_map(|t| t.from_address().map(|a| (a.clone(), t.num())))
                    .collect(),
                None => Vec::new(),
            },
            Err(_) => Vec::new(),
        };
        for (anchor, num) in links {
            if self.storage.verified_transcript_size(&anchor, num).is_none() {
                self.downloader.submit(DownloadItem { address: anchor, num });
            }
        }
    }

    /// Persists the ceremony document, logging rather than propagating
    /// failures; the next mutation will retry.
    fn persist(&self) {
        let ceremony = match self.read() {
            Ok(state) => state.ceremony().clone(),
            Err(_) => return,
        };
        if let Err(e) = self.storage.save_ceremony(&ceremony) {
            error!("Failed to persist the ceremony document: {}", e);
        }
    }

    /// Attempts to acquire the read lock for the ceremony state.
    fn read(&self) -> Result<RwLockReadGuard<CoordinatorState>, CoordinatorError> {
        self.state.read().map_err(|_| CoordinatorError::StateLockFailed)
    }

    /// Attempts to acquire the write lock for the ceremony state.
    fn write(&self) -> Result<RwLockWriteGuard<CoordinatorState>, CoordinatorError> {
        self.state.write().map_err(|_| CoordinatorError::StateLockFailed)
    }
}
