use crate::{
    coordinator_state::CoordinatorState,
    environment::RETRY_DELAY,
    objects::Address,
    queue::CancelableQueue,
    storage::TranscriptStorage,
    CoordinatorError,
};

use chrono::Utc;
use futures::future::BoxFuture;
use std::{
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};
use tokio::{process::Command, sync::Notify};
use tracing::{debug, error, info, trace, warn};

/// A transcript awaiting verification.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VerifyItem {
    pub address: Address,
    pub num: u64,
}

/// The argument contract of one verification invocation.
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub num_g1_points: u64,
    pub num_g2_points: u64,
    pub points_per_transcript: u64,
    pub num: u64,
    /// The staged transcript under verification.
    pub transcript_path: PathBuf,
    /// Transcript 0 of the same participant, the baseline of its set.
    pub baseline_path: PathBuf,
    /// The verified transcript this one must chain to: the previous
    /// participant's transcript 0 for ordinal 0, this participant's own
    /// previous transcript otherwise.
    pub chain_link_path: PathBuf,
}

///
/// The seam to the external verification procedure. `verify` resolves
/// to `Ok(true)` when the procedure accepted the transcript, `Ok(false)`
/// when it rejected it, and `Err` on transient spawn or I/O failures.
///
pub trait VerificationRunner: Send + Sync {
    fn verify(&self, request: VerifyRequest) -> BoxFuture<'_, Result<bool, CoordinatorError>>;

    /// Terminates any in-flight verification process. Idempotent.
    fn terminate(&self);
}

///
/// Runs the external verification executable with the positional
/// arguments of the contract. Exit code 0 means verified; stdout and
/// stderr are diagnostic only.
///
pub struct ProcessRunner {
    executable: String,
    interrupt: Notify,
}

impl ProcessRunner {
    pub fn new<S: Into<String>>(executable: S) -> Self {
        Self {
            executable: executable.into(),
            interrupt: Notify::new(),
        }
    }
}

impl VerificationRunner for ProcessRunner {
    fn verify(&self, request: VerifyRequest) -> BoxFuture<'_, Result<bool, CoordinatorError>> {
        Box::pin(async move {
            let mut child = Command::new(&self.executable)
                .arg(request.num_g1_points.to_string())
                .arg(request.num_g2_points.to_string())
                .arg(request.points_per_transcript.to_string())
                .arg(request.num.to_string())
                .arg(&request.transcript_path)
                .arg(&request.baseline_path)
                .arg(&request.chain_link_path)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()?;

            let status = tokio::select! {
                status = child.wait() => Some(status?),
                _ = self.interrupt.notified() => None,
            };
            let status = match status {
                Some(status) => status,
                None => {
                    debug!("Terminating the in-flight verification process");
                    let _ = child.start_kill();
                    child.wait().await?
                }
            };

            Ok(status.success())
        })
    }

    fn terminate(&self) {
        self.interrupt.notify_waiters();
    }
}

///
/// The verification pipeline: a single worker draining a queue of
/// uploaded transcripts, validating each against the chain-of-custody
/// rules and feeding the outcome back into the ceremony state.
///
pub struct Verifier {
    state: Arc<RwLock<CoordinatorState>>,
    storage: Arc<dyn TranscriptStorage>,
    runner: Arc<dyn VerificationRunner>,
    queue: CancelableQueue<VerifyItem>,
    /// The queue fed with a participant's verified transcripts once it
    /// completes, for the upload pipeline to publish.
    publish: Option<Arc<CancelableQueue<crate::transfer::UploadItem>>>,
    cancelled: AtomicBool,
}

impl Verifier {
    pub fn new(
        state: Arc<RwLock<CoordinatorState>>,
        storage: Arc<dyn TranscriptStorage>,
        runner: Arc<dyn VerificationRunner>,
        publish: Option<Arc<CancelableQueue<crate::transfer::UploadItem>>>,
    ) -> Self {
        Self {
            state,
            storage,
            runner,
            queue: CancelableQueue::new(),
            publish,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Enqueues a transcript for verification. Returns `false` once the
    /// pipeline has been shut down.
    pub fn submit(&self, item: VerifyItem) -> bool {
        trace!("Queueing transcript {} of {} for verification", item.num, item.address);
        self.queue.put(item)
    }

    /// Drains the queue until it ends or is cancelled. The single
    /// consumer keeps verification strictly ordered.
    pub async fn run(&self) {
        while let Some(item) = self.queue.get().await {
            self.process(item).await;
        }
        trace!("Verification queue has completed");
    }

    /// Finishes the queued work, then lets the worker exit.
    pub fn end(&self) {
        self.queue.end();
    }

    /// Stops the pipeline immediately: queued items are discarded, any
    /// in-flight external process is terminated, and no further state
    /// callbacks fire. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.queue.cancel();
        self.runner.terminate();
    }

    /// Terminates any in-flight verification without shutting the
    /// pipeline down, e.g. when the running slot was just evicted.
    /// Queued items for the evicted address fall to the stale guard.
    pub fn interrupt(&self) {
        self.runner.terminate();
    }

    async fn process(&self, item: VerifyItem) {
        // Re-confirm that the ceremony still waits on this address; the
        // participant may have been invalidated or completed since the
        // item was queued, and must not be resurrected.
        let request = match self.build_request(&item) {
            Some(request) => request,
            None => {
                trace!("Discarding stale verification of {} {}", item.address, item.num);
                return;
            }
        };

        let verified = loop {
            match self.runner.verify(request.clone()).await {
                Ok(verified) => break verified,
                Err(error) => {
                    if self.cancelled.load(Ordering::SeqCst) {
                        return;
                    }
                    warn!(
                        "Verification of transcript {} of {} errored, retrying: {}",
                        item.num, item.address, error
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        };

        // A cancellation may race the external procedure; suppress the
        // callback so a reset in progress is not clobbered.
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }

        match verified {
            true => self.accept(&item).await,
            false => self.reject(&item),
        }
    }

    /// Builds the verification request for the item, or `None` if the
    /// item is stale.
    fn build_request(&self, item: &VerifyItem) -> Option<VerifyRequest> {
        let state = match self.state.read() {
            Ok(state) => state,
            Err(_) => return None,
        };

        if state.running_address() != Some(&item.address) {
            return None;
        }

        let ceremony = state.ceremony();
        let transcript_path = self.storage.staged_transcript_path(&item.address, item.num);
        let baseline_path = match item.num {
            0 => transcript_path.clone(),
            _ => self.storage.verified_transcript_path(&item.address, 0),
        };
        let chain_link_path = match item.num {
            // The first transcript chains across participants, to the
            // anchor's verified transcript 0. The very first contribution
            // of the ceremony has nothing prior and chains to itself.
            0 => match state.last_complete_address() {
                Some(anchor) => self.storage.verified_transcript_path(anchor, 0),
                None => transcript_path.clone(),
            },
            // Later transcripts chain within the participant's own set.
            num => self.storage.verified_transcript_path(&item.address, num - 1),
        };

        Some(VerifyRequest {
            num_g1_points: ceremony.num_g1_points(),
            num_g2_points: ceremony.num_g2_points(),
            points_per_transcript: ceremony.points_per_transcript(),
            num: item.num,
            transcript_path,
            baseline_path,
            chain_link_path,
        })
    }

    async fn accept(&self, item: &VerifyItem) {
        // Persist the verified artifact before the state mutation, so a
        // poller never observes a complete transcript without its data.
        loop {
            match self.storage.promote_transcript(&item.address, item.num) {
                Ok(()) => break,
                Err(error) => {
                    if self.cancelled.load(Ordering::SeqCst) {
                        return;
                    }
                    warn!(
                        "Failed to persist verified transcript {} of {}, retrying: {}",
                        item.num, item.address, error
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }

        let finished = {
            let mut state = match self.state.write() {
                Ok(state) => state,
                Err(_) => return,
            };
            match state.transcript_verified(&item.address, item.num, Utc::now()) {
                Ok(finished) => finished,
                Err(error) => {
                    // The ceremony moved on while the procedure ran.
                    trace!("Dropping verification result for {} {}: {}", item.address, item.num, error);
                    return;
                }
            }
        };
        debug!("Verified transcript {} of {}", item.num, item.address);

        if finished {
            info!("All transcripts of {} verified", item.address);
            self.queue_for_publication(&item.address);
        }
    }

    fn reject(&self, item: &VerifyItem) {
        if let Err(error) = self.storage.erase_staged_transcript(&item.address, item.num) {
            warn!("Failed to erase rejected transcript {} of {}: {}", item.num, item.address, error);
        }

        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(_) => return,
        };
        match state.invalidate_participant(&item.address, "verify failed") {
            Ok(()) => error!("Transcript {} of {} failed verification", item.num, item.address),
            Err(error) => trace!("Dropping rejection of {} {}: {}", item.address, item.num, error),
        }
    }

    /// Hands the completed participant's verified transcripts to the
    /// upload pipeline.
    fn queue_for_publication(&self, address: &Address) {
        let publish = match &self.publish {
            Some(publish) => publish,
            None => return,
        };
        let nums: Vec<u64> = match self.state.read() {
            Ok(state) => match state.ceremony().participant(address) {
                Some(participant) => participant.transcripts().iter().map(|t| t.num()).collect(),
                None => return,
            },
            Err(_) => return,
        };
        for num in nums {
            publish.put(crate::transfer::UploadItem {
                address: address.clone(),
                num,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        environment::Environment,
        objects::ParticipantState,
        storage::Disk,
        transfer::UploadItem,
    };

    use chrono::Duration;
    use serial_test::serial;
    use std::sync::Mutex;

    /// A runner that records its requests and replays scripted verdicts.
    struct ScriptedRunner {
        verdicts: Mutex<Vec<Result<bool, CoordinatorError>>>,
        requests: Mutex<Vec<VerifyRequest>>,
    }

    impl ScriptedRunner {
        fn new(verdicts: Vec<Result<bool, CoordinatorError>>) -> Self {
            Self {
                verdicts: Mutex::new(verdicts),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<VerifyRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl VerificationRunner for ScriptedRunner {
        fn verify(&self, request: VerifyRequest) -> BoxFuture<'_, Result<bool, CoordinatorError>> {
            Box::pin(async move {
                self.requests.lock().unwrap().push(request);
                self.verdicts.lock().unwrap().remove(0)
            })
        }

        fn terminate(&self) {}
    }

    fn address(id: u64) -> Address {
        Address::new(format!("0x{:040x}", id))
    }

    /// A running two-participant ceremony with its first participant
    /// dispatched and a staged transcript 0.
    fn running_fixture(name: &str) -> (Arc<RwLock<CoordinatorState>>, Arc<Disk>, Address) {
        let base = std::env::temp_dir().join("ceremony-coordinator").join(name);
        let _ = std::fs::remove_dir_all(&base);
        let storage = Arc::new(Disk::at(base).unwrap());

        let now = Utc::now();
        let mut state = CoordinatorState::new(&Environment::Test, now);
        state.add_participant(address(0), 2, now).unwrap();
        state.add_participant(address(1), 2, now + Duration::seconds(1)).unwrap();
        state.select_participants(b"seed");
        state.ping(&address(0), now).unwrap();
        state.ping(&address(1), now).unwrap();
        state.advance(now);

        let running = state.running_address().unwrap().clone();
        state.transcript_uploaded(&running, 0, 7, now).unwrap();
        storage.stage_transcript(&running, 0, b"payload").unwrap();

        (Arc::new(RwLock::new(state)), storage, running)
    }

    #[tokio::test]
    #[serial]
    async fn test_stale_item_is_discarded_without_callbacks() {
        let (state, storage, running) = running_fixture("verifier-stale");
        let runner = Arc::new(ScriptedRunner::new(vec![Ok(true)]));
        let verifier = Verifier::new(state.clone(), storage, runner.clone(), None);

        // An address that does not hold the running slot.
        let stale = match running == address(0) {
            true => address(1),
            false => address(0),
        };
        let sequence = state.read().unwrap().ceremony().sequence();

        verifier.submit(VerifyItem { address: stale, num: 0 });
        verifier.end();
        verifier.run().await;

        // The runner was never invoked and no state was touched.
        assert!(runner.requests().is_empty());
        assert_eq!(sequence, state.read().unwrap().ceremony().sequence());
    }

    #[tokio::test]
    #[serial]
    async fn test_accepted_transcript_is_promoted_and_recorded() {
        let (state, storage, running) = running_fixture("verifier-accept");
        let runner = Arc::new(ScriptedRunner::new(vec![Ok(true)]));
        let verifier = Verifier::new(state.clone(), storage.clone(), runner.clone(), None);

        verifier.submit(VerifyItem {
            address: running.clone(),
            num: 0,
        });
        verifier.end();
        verifier.run().await;

        // The artifact moved into the verified area.
        assert_eq!(None, storage.staged_transcript_size(&running, 0));
        assert_eq!(Some(7), storage.verified_transcript_size(&running, 0));

        let state = state.read().unwrap();
        let participant = state.ceremony().participant(&running).unwrap();
        assert!(participant.transcript(0).unwrap().is_complete());
        assert!(participant.is_running());

        // The first contribution of the ceremony chains to itself.
        let request = &runner.requests()[0];
        assert_eq!(request.transcript_path, request.baseline_path);
        assert_eq!(request.transcript_path, request.chain_link_path);
    }

    #[tokio::test]
    #[serial]
    async fn test_rejected_transcript_invalidates_the_participant() {
        let (state, storage, running) = running_fixture("verifier-reject");
        let runner = Arc::new(ScriptedRunner::new(vec![Ok(false)]));
        let verifier = Verifier::new(state.clone(), storage.clone(), runner, None);

        verifier.submit(VerifyItem {
            address: running.clone(),
            num: 0,
        });
        verifier.end();
        verifier.run().await;

        // The bad artifact is gone and the participant is out.
        assert_eq!(None, storage.staged_transcript_size(&running, 0));
        let state = state.read().unwrap();
        let participant = state.ceremony().participant(&running).unwrap();
        assert_eq!(ParticipantState::Invalidated, participant.state());
        assert_eq!(Some("verify failed"), participant.error());
        assert_eq!(None, state.running_address());
    }

    #[tokio::test]
    #[serial]
    async fn test_transient_errors_are_retried() {
        let (state, storage, running) = running_fixture("verifier-retry");
        let transient = std::io::Error::new(std::io::ErrorKind::Other, "spawn failed");
        let runner = Arc::new(ScriptedRunner::new(vec![Err(transient.into()), Ok(true)]));
        let verifier = Verifier::new(state.clone(), storage, runner.clone(), None);

        verifier.submit(VerifyItem {
            address: running.clone(),
            num: 0,
        });
        verifier.end();
        verifier.run().await;

        assert_eq!(2, runner.requests().len());
        let state = state.read().unwrap();
        assert!(state.ceremony().participant(&running).unwrap().transcript(0).unwrap().is_complete());
    }

    #[tokio::test]
    #[serial]
    async fn test_later_transcripts_chain_within_the_participant() {
        let (state, storage, running) = running_fixture("verifier-chain");
        storage.stage_transcript(&running, 1, b"payload2").unwrap();
        state
            .write()
            .unwrap()
            .transcript_uploaded(&running, 1, 8, Utc::now())
            .unwrap();

        let runner = Arc::new(ScriptedRunner::new(vec![Ok(true), Ok(true)]));
        let verifier = Verifier::new(state.clone(), storage.clone(), runner.clone(), None);

        verifier.submit(VerifyItem {
            address: running.clone(),
            num: 0,
        });
        verifier.submit(VerifyItem {
            address: running.clone(),
            num: 1,
        });
        verifier.end();
        verifier.run().await;

        let requests = runner.requests();
        assert_eq!(storage.verified_transcript_path(&running, 0), requests[1].baseline_path);
        assert_eq!(storage.verified_transcript_path(&running, 0), requests[1].chain_link_path);
        assert_eq!(storage.staged_transcript_path(&running, 1), requests[1].transcript_path);
    }

    #[tokio::test]
    #[serial]
    async fn test_completion_queues_transcripts_for_publication() {
        let (state, storage, running) = running_fixture("verifier-publish");

        // Upload and stage every remaining transcript of the set.
        let nums: Vec<u64> = state
            .read()
            .unwrap()
            .ceremony()
            .participant(&running)
            .unwrap()
            .transcripts()
            .iter()
            .map(|t| t.num())
            .collect();
        for num in nums.iter().skip(1) {
            storage.stage_transcript(&running, *num, b"payload").unwrap();
            state
                .write()
                .unwrap()
                .transcript_uploaded(&running, *num, 7, Utc::now())
                .unwrap();
        }

        let publish = Arc::new(CancelableQueue::<UploadItem>::new());
        let runner = Arc::new(ScriptedRunner::new(nums.iter().map(|_| Ok(true)).collect()));
        let verifier = Verifier::new(state.clone(), storage, runner, Some(publish.clone()));

        for num in &nums {
            verifier.submit(VerifyItem {
                address: running.clone(),
                num: *num,
            });
        }
        verifier.end();
        verifier.run().await;

        let state = state.read().unwrap();
        let participant = state.ceremony().participant(&running).unwrap();
        assert!(participant.is_complete());
        assert_eq!(Some(&running), state.last_complete_address());
        assert_eq!(nums.len(), publish.len());
    }
}
