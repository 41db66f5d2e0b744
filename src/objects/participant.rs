use crate::{objects::Transcript, CoordinatorError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_aux::prelude::*;
use serde_with::skip_serializing_none;
use std::fmt;

/// The unique identity of a participant. Assigned at registration
/// and immutable for the lifetime of the ceremony.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Address(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The scheduling state of a participant. Each participant moves
/// `Waiting -> Running -> {Complete | Invalidated}` at most once.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantState {
    Waiting,
    Running,
    Complete,
    Invalidated,
}

/// The client-reported activity of the running participant.
/// Informational only; scheduling decisions never depend on it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunningState {
    Waiting,
    Downloading,
    Computing,
    Uploading,
    Verifying,
    Complete,
    Offline,
}

/// A client-reported progress update for the running participant.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParticipantUpdate {
    pub running_state: Option<RunningState>,
    pub compute_progress: Option<f64>,
    pub verify_progress: Option<f64>,
    pub transcripts: Option<Vec<TranscriptProgress>>,
}

/// Transfer progress for a single transcript, reported by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptProgress {
    pub num: u64,
    pub downloaded: u64,
    pub uploaded: u64,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    /// The unique identity of the participant.
    address: Address,
    /// The global sequence number at the participant's last modification.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    sequence: u64,
    /// The scheduling state of the participant.
    state: ParticipantState,
    /// The client-reported activity of the participant.
    running_state: RunningState,
    /// The 1-based queue rank, recomputed on every reorder.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    position: u64,
    /// The tie-break key within a tier. Lower runs sooner.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    priority: u64,
    /// The scheduling class: 0 manual-pinned, 1 pre-registered,
    /// 2 early-bird, 3 late.
    tier: u8,
    /// Whether a recent heartbeat has been seen for the participant.
    online: bool,
    /// The timestamp when the participant was registered.
    added_at: DateTime<Utc>,
    /// The timestamp when the participant took the running slot.
    started_at: Option<DateTime<Utc>>,
    /// The timestamp of the last heartbeat or progress report.
    last_update: Option<DateTime<Utc>>,
    /// The timestamp of the last successfully verified transcript.
    last_verified: Option<DateTime<Utc>>,
    /// The timestamp when the participant finished the ceremony.
    completed_at: Option<DateTime<Utc>>,
    /// The reason the participant was invalidated, if it was.
    error: Option<String>,
    /// The client-reported computation progress, from 0 to 1.
    compute_progress: f64,
    /// The fraction of this participant's transcripts verified so far.
    verify_progress: f64,
    /// A per-participant override of the ceremony timeout budget, in seconds.
    invalidate_after: Option<u64>,
    /// The transcripts making up this participant's contribution.
    transcripts: Vec<Transcript>,
}

impl ParticipantInfo {
    pub fn new(address: Address, tier: u8, position: u64, priority: u64, added_at: DateTime<Utc>) -> Self {
        Self {
            address,
            sequence: 0,
            state: ParticipantState::Waiting,
            running_state: RunningState::Offline,
            position,
            priority,
            tier,
            online: false,
            added_at,
            started_at: None,
            last_update: None,
            last_verified: None,
            completed_at: None,
            error: None,
            compute_progress: 0.0,
            verify_progress: 0.0,
            invalidate_after: None,
            transcripts: Vec::new(),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn state(&self) -> ParticipantState {
        self.state
    }

    pub fn running_state(&self) -> RunningState {
        self.running_state
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn priority(&self) -> u64 {
        self.priority
    }

    pub fn tier(&self) -> u8 {
        self.tier
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    pub fn last_verified(&self) -> Option<DateTime<Utc>> {
        self.last_verified
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn compute_progress(&self) -> f64 {
        self.compute_progress
    }

    pub fn verify_progress(&self) -> f64 {
        self.verify_progress
    }

    pub fn invalidate_after(&self) -> Option<u64> {
        self.invalidate_after
    }

    pub fn transcripts(&self) -> &[Transcript] {
        &self.transcripts
    }

    pub fn transcript(&self, num: u64) -> Option<&Transcript> {
        self.transcripts.iter().find(|t| t.num() == num)
    }

    /// Returns `true` if the participant is waiting for its turn.
    pub fn is_waiting(&self) -> bool {
        self.state == ParticipantState::Waiting
    }

    /// Returns `true` if the participant currently holds the running slot.
    pub fn is_running(&self) -> bool {
        self.state == ParticipantState::Running
    }

    /// Returns `true` if the participant has completed its contribution.
    pub fn is_complete(&self) -> bool {
        self.state == ParticipantState::Complete
    }

    /// Returns `true` if the participant was invalidated.
    pub fn is_invalidated(&self) -> bool {
        self.state == ParticipantState::Invalidated
    }

    ///
    /// Records a heartbeat from the participant, refreshing its last
    /// update time. Returns `true` if the participant came online.
    ///
    pub fn heartbeat(&mut self, now: DateTime<Utc>) -> bool {
        let was_online = self.online;
        self.online = true;
        self.last_update = Some(now);
        !was_online
    }

    ///
    /// Assigns the participant the running slot with the given transcript
    /// set, and saves the current time as the start time.
    ///
    pub fn start(&mut self, now: DateTime<Utc>, transcripts: Vec<Transcript>) -> Result<(), CoordinatorError> {
        // Check that the participant is still waiting for its turn.
        if self.state != ParticipantState::Waiting {
            return Err(CoordinatorError::ParticipantAlreadyStarted);
        }

        // Check that the participant has not started before.
        if self.started_at.is_some() {
            return Err(CoordinatorError::ParticipantAlreadyStarted);
        }

        // Check that the transcript set is nonempty.
        if transcripts.is_empty() {
            return Err(CoordinatorError::TranscriptSetEmpty);
        }

        // Set the participant info to reflect them starting now.
        self.state = ParticipantState::Running;
        self.running_state = RunningState::Waiting;
        self.started_at = Some(now);
        self.last_update = Some(now);
        self.transcripts = transcripts;

        Ok(())
    }

    ///
    /// Applies a client-reported progress update. The update is validated
    /// in full before any field is written, so a rejected update leaves
    /// the participant untouched.
    ///
    pub fn update(&mut self, now: DateTime<Utc>, update: &ParticipantUpdate) -> Result<(), CoordinatorError> {
        // Check that the participant currently holds the running slot.
        if self.state != ParticipantState::Running {
            return Err(CoordinatorError::ParticipantNotRunning);
        }

        // Check that every reported transcript exists and is still mutable.
        if let Some(progress) = &update.transcripts {
            for entry in progress {
                match self.transcript(entry.num) {
                    Some(transcript) if transcript.is_complete() => {
                        return Err(CoordinatorError::TranscriptAlreadyComplete);
                    }
                    Some(_) => {}
                    None => return Err(CoordinatorError::TranscriptMissing),
                }
            }
        }

        if let Some(running_state) = update.running_state {
            self.running_state = running_state;
        }
        if let Some(compute_progress) = update.compute_progress {
            self.compute_progress = compute_progress.max(0.0).min(1.0);
        }
        if let Some(verify_progress) = update.verify_progress {
            self.verify_progress = verify_progress.max(0.0).min(1.0);
        }
        if let Some(progress) = &update.transcripts {
            for entry in progress {
                let transcript = self
                    .transcripts
                    .iter_mut()
                    .find(|t| t.num() == entry.num)
                    .ok_or(CoordinatorError::TranscriptMissing)?;
                transcript.update_downloaded(entry.downloaded)?;
                transcript.update_uploaded(entry.uploaded)?;
            }
        }

        self.heartbeat(now);

        Ok(())
    }

    ///
    /// Records a fully uploaded transcript payload of the given size.
    ///
    pub fn record_upload(&mut self, num: u64, size: u64) -> Result<(), CoordinatorError> {
        // Check that the participant currently holds the running slot.
        if self.state != ParticipantState::Running {
            return Err(CoordinatorError::ParticipantNotRunning);
        }

        let transcript = self
            .transcripts
            .iter_mut()
            .find(|t| t.num() == num)
            .ok_or(CoordinatorError::TranscriptMissing)?;
        transcript.record_upload(size)
    }

    ///
    /// Marks the given transcript as verified and refreshes the last
    /// verified time. Returns `true` once every transcript is complete.
    ///
    pub fn complete_transcript(&mut self, num: u64, now: DateTime<Utc>) -> Result<bool, CoordinatorError> {
        // Check that the participant currently holds the running slot.
        if self.state != ParticipantState::Running {
            return Err(CoordinatorError::ParticipantNotRunning);
        }

        let transcript = self
            .transcripts
            .iter_mut()
            .find(|t| t.num() == num)
            .ok_or(CoordinatorError::TranscriptMissing)?;
        transcript.mark_complete()?;

        self.last_verified = Some(now);

        let completed = self.transcripts.iter().filter(|t| t.is_complete()).count();
        self.verify_progress = completed as f64 / self.transcripts.len() as f64;

        Ok(completed == self.transcripts.len())
    }

    ///
    /// Sets the participant to complete and saves the current time as the
    /// completed time.
    ///
    pub fn finish(&mut self, now: DateTime<Utc>) -> Result<(), CoordinatorError> {
        // Check that the participant currently holds the running slot.
        if self.state != ParticipantState::Running {
            return Err(CoordinatorError::ParticipantNotRunning);
        }

        // Check that every transcript has been verified.
        if self.transcripts.iter().any(|t| !t.is_complete()) {
            return Err(CoordinatorError::TranscriptNotComplete);
        }

        self.state = ParticipantState::Complete;
        self.running_state = RunningState::Complete;
        self.completed_at = Some(now);
        self.compute_progress = 1.0;
        self.verify_progress = 1.0;

        Ok(())
    }

    ///
    /// Sets the participant to invalidated with the given reason and
    /// clears its transcripts. Terminal for the participant.
    ///
    pub fn invalidate(&mut self, reason: &str) -> Result<(), CoordinatorError> {
        // Check that the participant currently holds the running slot.
        if self.state != ParticipantState::Running {
            return Err(CoordinatorError::ParticipantNotRunning);
        }

        self.state = ParticipantState::Invalidated;
        self.error = Some(reason.to_string());
        self.transcripts.clear();

        Ok(())
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    pub(crate) fn set_position(&mut self, position: u64) {
        self.position = position;
    }

    pub(crate) fn set_priority(&mut self, priority: u64) {
        self.priority = priority;
    }

    pub(crate) fn set_tier(&mut self, tier: u8) {
        self.tier = tier;
    }

    pub(crate) fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    pub(crate) fn set_invalidate_after(&mut self, seconds: Option<u64>) {
        self.invalidate_after = seconds;
    }
}
