use ceremony_coordinator::{
    entropy::FixedEntropy,
    environment::Environment,
    objects::{Address, Ceremony, ParticipantState},
    storage::Disk,
    transfer::{transcript_key, DirectoryStore, RemoteStore},
    verifier::{VerificationRunner, VerifyRequest},
    Coordinator, CoordinatorError,
};

use futures::future::BoxFuture;
use serial_test::serial;
use std::{path::PathBuf, sync::Arc, time::Duration};

/// A verification procedure that accepts every transcript.
struct AcceptAll;

impl VerificationRunner for AcceptAll {
    fn verify(&self, _request: VerifyRequest) -> BoxFuture<'_, Result<bool, CoordinatorError>> {
        Box::pin(async { Ok(true) })
    }

    fn terminate(&self) {}
}

/// A verification procedure that rejects every transcript.
struct RejectAll;

impl VerificationRunner for RejectAll {
    fn verify(&self, _request: VerifyRequest) -> BoxFuture<'_, Result<bool, CoordinatorError>> {
        Box::pin(async { Ok(false) })
    }

    fn terminate(&self) {}
}

fn test_base(name: &str) -> PathBuf {
    let base = std::env::temp_dir().join("ceremony-coordinator-it").join(name);
    let _ = std::fs::remove_dir_all(&base);
    base
}

fn build_coordinator(base: &PathBuf, runner: Arc<dyn VerificationRunner>) -> Arc<Coordinator> {
    let storage = Arc::new(Disk::at(base.join("store")).unwrap());
    let remote = Arc::new(DirectoryStore::at(base.join("publish")).unwrap());
    let entropy = Arc::new(FixedEntropy::new(b"integration-seed".to_vec()));
    Arc::new(Coordinator::new(Environment::Test, storage, runner, remote, entropy).unwrap())
}

fn address(id: u64) -> Address {
    Address::new(format!("0x{:040x}", id))
}

/// Polls the ceremony until the predicate holds, keeping the given
/// participants online with heartbeats along the way.
async fn wait_for<F>(coordinator: &Coordinator, addresses: &[Address], predicate: F) -> Ceremony
where
    F: Fn(&Ceremony) -> bool,
{
    for _ in 0..200 {
        for address in addresses {
            let _ = coordinator.ping(address);
        }
        let ceremony = coordinator.ceremony(None).unwrap();
        if predicate(&ceremony) {
            return ceremony;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("the expected ceremony state was not reached in time");
}

#[tokio::test]
#[serial]
async fn test_two_participants_complete_and_chain() {
    let base = test_base("flow");
    let remote = Arc::new(DirectoryStore::at(base.join("publish")).unwrap());
    let storage = Arc::new(Disk::at(base.join("store")).unwrap());
    let entropy = Arc::new(FixedEntropy::new(b"integration-seed".to_vec()));
    let coordinator = Arc::new(
        Coordinator::new(Environment::Test, storage, Arc::new(AcceptAll), remote.clone(), entropy).unwrap(),
    );

    let addresses = [address(0), address(1)];
    coordinator.add_participant(addresses[0].clone(), 2).unwrap();
    coordinator.add_participant(addresses[1].clone(), 2).unwrap();

    let handle = tokio::spawn(coordinator.clone().run());

    // Walk both participants through their turns.
    for _ in 0..2 {
        let ceremony = wait_for(&coordinator, &addresses, |c| c.running_participant().is_some()).await;
        let running = ceremony.running_participant().unwrap().address().clone();
        let nums: Vec<u64> = ceremony
            .running_participant()
            .unwrap()
            .transcripts()
            .iter()
            .map(|t| t.num())
            .collect();
        for num in &nums {
            coordinator
                .upload_transcript(&running, *num, b"transcript-data", "detached-signature")
                .unwrap();
        }

        let done = running.clone();
        wait_for(&coordinator, &addresses, move |c| {
            c.participant(&done).map(|p| p.is_complete()).unwrap_or(false)
        })
        .await;
    }

    let ceremony = coordinator.ceremony(None).unwrap();
    assert_eq!(2, ceremony.participants().iter().filter(|p| p.is_complete()).count());

    // The later contribution chains to the earlier one.
    let first = ceremony
        .participants()
        .iter()
        .min_by_key(|p| p.completed_at())
        .unwrap();
    let second = ceremony
        .participants()
        .iter()
        .max_by_key(|p| p.completed_at())
        .unwrap();
    assert_ne!(first.address(), second.address());
    for transcript in second.transcripts() {
        assert_eq!(Some(first.address()), transcript.from_address());
    }

    // The verified transcripts reach the publish store.
    let _ = wait_for(&coordinator, &addresses, |_| {
        (0..5).all(|num| remote.object_size(&transcript_key(first.address(), num)).unwrap().is_some())
    })
    .await;

    coordinator.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_failed_verification_invalidates_and_moves_on() {
    let base = test_base("reject");
    let coordinator = build_coordinator(&base, Arc::new(RejectAll));

    let addresses = [address(0), address(1)];
    coordinator.add_participant(addresses[0].clone(), 2).unwrap();
    coordinator.add_participant(addresses[1].clone(), 2).unwrap();

    let handle = tokio::spawn(coordinator.clone().run());

    let ceremony = wait_for(&coordinator, &addresses, |c| c.running_participant().is_some()).await;
    let first = ceremony.running_participant().unwrap().address().clone();
    coordinator
        .upload_transcript(&first, 0, b"bad-transcript", "detached-signature")
        .unwrap();

    let failed = first.clone();
    let ceremony = wait_for(&coordinator, &addresses, move |c| {
        c.participant(&failed)
            .map(|p| p.state() == ParticipantState::Invalidated)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(Some("verify failed"), ceremony.participant(&first).unwrap().error());

    // The slot moves to the other participant.
    let ceremony = wait_for(&coordinator, &addresses, |c| c.running_participant().is_some()).await;
    assert_ne!(&first, ceremony.running_participant().unwrap().address());

    coordinator.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_upload_rejected_for_non_running_participant() {
    let base = test_base("unauthorized");
    let coordinator = build_coordinator(&base, Arc::new(AcceptAll));

    let addresses = [address(0), address(1)];
    coordinator.add_participant(addresses[0].clone(), 2).unwrap();
    coordinator.add_participant(addresses[1].clone(), 2).unwrap();

    let handle = tokio::spawn(coordinator.clone().run());

    let ceremony = wait_for(&coordinator, &addresses, |c| c.running_participant().is_some()).await;
    let running = ceremony.running_participant().unwrap().address().clone();
    let waiting = addresses.iter().find(|a| **a != running).unwrap();

    assert!(matches!(
        coordinator.upload_transcript(waiting, 0, b"data", "sig"),
        Err(CoordinatorError::ParticipantNotRunning)
    ));
    assert!(matches!(
        coordinator.upload_transcript(&running, 99, b"data", "sig"),
        Err(CoordinatorError::TranscriptMissing)
    ));

    coordinator.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_delta_polling_and_epoch_resync() {
    let base = test_base("delta");
    let coordinator = build_coordinator(&base, Arc::new(AcceptAll));

    for i in 0..3 {
        coordinator.add_participant(address(i), 2).unwrap();
    }

    // A poller caches the full document and follows with deltas.
    let mut cached = coordinator.ceremony(None).unwrap();
    coordinator.ping(&address(1)).unwrap();

    let delta = coordinator.ceremony(Some(cached.sequence())).unwrap();
    cached.apply_delta(&delta).unwrap();
    assert_eq!(
        serde_json::to_value(&cached).unwrap(),
        serde_json::to_value(&coordinator.ceremony(None).unwrap()).unwrap()
    );

    // Applying the same delta again changes nothing.
    cached.apply_delta(&delta).unwrap();
    assert_eq!(
        serde_json::to_value(&cached).unwrap(),
        serde_json::to_value(&coordinator.ceremony(None).unwrap()).unwrap()
    );

    // Selection re-creates the order: the stale cache must resync.
    coordinator.select_participants(b"integration-seed").unwrap();
    let delta = coordinator.ceremony(Some(cached.sequence())).unwrap();
    assert!(matches!(
        cached.apply_delta(&delta),
        Err(CoordinatorError::StartSequenceMismatch)
    ));

    // A full refetch re-establishes the new epoch.
    let refreshed = coordinator.ceremony(None).unwrap();
    assert!(refreshed.start_sequence() > 0);
    assert_eq!(refreshed.sequence(), refreshed.delta_since(0).sequence());
}

#[tokio::test]
#[serial]
async fn test_resume_from_persisted_document() {
    let base = test_base("resume");

    let original = {
        let coordinator = build_coordinator(&base, Arc::new(AcceptAll));
        for i in 0..3 {
            coordinator.add_participant(address(i), 2).unwrap();
        }
        coordinator.select_participants(b"integration-seed").unwrap();
        coordinator.ceremony(None).unwrap()
    };

    // A new coordinator over the same storage resumes where we left off.
    let storage = Arc::new(Disk::at(base.join("store")).unwrap());
    let remote = Arc::new(DirectoryStore::at(base.join("publish")).unwrap());
    let entropy = Arc::new(FixedEntropy::new(b"integration-seed".to_vec()));
    let resumed = Coordinator::new(Environment::Test, storage, Arc::new(AcceptAll), remote, entropy).unwrap();

    assert_eq!(
        serde_json::to_value(&original).unwrap(),
        serde_json::to_value(&resumed.ceremony(None).unwrap()).unwrap()
    );
}
