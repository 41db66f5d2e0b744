use crate::{
    environment::{Environment, OFFLINE_AFTER_SECS},
    objects::{Address, Ceremony, CeremonyState, ParticipantInfo, ParticipantUpdate, Transcript},
    CoordinatorError,
};

use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use rand::seq::SliceRandom;
use rand_chacha::{rand_core::SeedableRng, ChaCha20Rng};
use std::cmp::Ordering;
use tracing::{debug, info, trace, warn};

/// The side effects a call to `advance` requires from its caller, so
/// that storage and pipeline work happens outside the state lock.
#[derive(Debug, Default)]
pub struct AdvanceActions {
    /// Addresses whose running slot ended abruptly this tick.
    pub invalidated: Vec<Address>,
    /// The address dispatched into the running slot this tick, whose
    /// staging data must be erased before it uploads.
    pub dispatched: Option<Address>,
}

///
/// The authoritative ceremony state machine. All mutation paths (the
/// periodic tick, transport handlers, the verifier callback) are
/// serialized behind a single lock held by the coordinator, so every
/// method here runs as one linearized read-modify-write step.
///
pub struct CoordinatorState {
    /// The ceremony document observed by pollers. Carries every runtime
    /// parameter, so a resumed coordinator keeps the schedule it was
    /// created with.
    ceremony: Ceremony,
    /// The address currently holding the running slot.
    running: Option<Address>,
    /// The most recently completed participant, whose verified
    /// transcripts seed the next contribution.
    last_complete: Option<Address>,
}

impl CoordinatorState {
    ///
    /// Creates a new instance of `CoordinatorState`, scheduling the
    /// ceremony from the delays configured in the environment.
    ///
    pub(crate) fn new(environment: &Environment, now: DateTime<Utc>) -> Self {
        let start_time = now + Duration::seconds(environment.start_delay() as i64);
        let end_time = start_time + Duration::seconds(environment.ceremony_duration() as i64);
        let ceremony = Ceremony::new(environment, start_time, end_time);
        Self {
            ceremony,
            running: None,
            last_complete: None,
        }
    }

    ///
    /// Restores the state machine from a persisted ceremony document,
    /// recomputing the running slot and the chain anchor from it.
    ///
    pub(crate) fn from_ceremony(ceremony: Ceremony) -> Self {
        let running = ceremony.running_participant().map(|p| p.address().clone());
        let last_complete = ceremony
            .participants()
            .iter()
            .filter(|p| p.is_complete())
            .max_by_key(|p| p.completed_at())
            .map(|p| p.address().clone());
        Self {
            ceremony,
            running,
            last_complete,
        }
    }

    /// Returns the ceremony document.
    pub(crate) fn ceremony(&self) -> &Ceremony {
        &self.ceremony
    }

    /// Returns the address currently holding the running slot.
    pub(crate) fn running_address(&self) -> Option<&Address> {
        self.running.as_ref()
    }

    /// Returns the chain anchor, the most recently completed participant.
    pub(crate) fn last_complete_address(&self) -> Option<&Address> {
        self.last_complete.as_ref()
    }

    /// Allocates the next sequence number. Must be called in the same
    /// logical step as the mutation it stamps.
    fn next_sequence(&mut self) -> u64 {
        self.ceremony.sequence += 1;
        self.ceremony.sequence
    }

    /// Bumps the sequence for a ceremony-level change, so pollers can
    /// cheaply detect it via the status sequence.
    fn bump_status(&mut self) {
        let sequence = self.next_sequence();
        self.ceremony.status_sequence = sequence;
    }

    ///
    /// Registers a participant during preselection. Addresses are unique
    /// and the registration window closes once selection has run.
    ///
    pub(crate) fn add_participant(
        &mut self,
        address: Address,
        tier: u8,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinatorError> {
        // Check that the registration window is still open.
        if self.ceremony.state != CeremonyState::Preselection {
            return Err(CoordinatorError::CeremonyAlreadyStarted);
        }

        // Check that the address has not been registered before.
        if self.ceremony.participant(&address).is_some() {
            return Err(CoordinatorError::ParticipantAlreadyAdded);
        }

        let index = self.ceremony.participants.len() as u64;
        let sequence = self.next_sequence();
        let mut participant = ParticipantInfo::new(address.clone(), tier, index + 1, index + 1, now);
        participant.set_sequence(sequence);
        self.ceremony.participants.push(participant);

        info!("Added participant {} at position {}", address, index + 1);
        Ok(())
    }

    ///
    /// Overrides the timeout budget of a single participant.
    ///
    pub(crate) fn set_participant_timeout(
        &mut self,
        address: &Address,
        seconds: Option<u64>,
    ) -> Result<(), CoordinatorError> {
        let sequence = self.ceremony.sequence + 1;
        let participant = self
            .ceremony
            .participant_mut(address)
            .ok_or(CoordinatorError::ParticipantMissing)?;
        participant.set_invalidate_after(seconds);
        participant.set_sequence(sequence);
        self.ceremony.sequence = sequence;
        Ok(())
    }

    ///
    /// Assigns tiers and priorities from the given entropy seed and
    /// transitions the ceremony to `Selected`. The shuffle is a seeded
    /// Fisher-Yates, so the outcome is unpredictable before the seed is
    /// known and independently recomputable afterwards. A no-op once the
    /// ceremony has left preselection. Returns `true` if selection ran.
    ///
    pub(crate) fn select_participants(&mut self, seed: &[u8]) -> bool {
        // Selection happens exactly once, at the end of preselection.
        if self.ceremony.state != CeremonyState::Preselection {
            trace!("Ignoring selection, the ceremony is already selected");
            return false;
        }

        let mut rng = seed_rng(seed);

        // Pinned participants keep their manual ordering; pre-registered
        // participants and the early-bird candidates are each shuffled.
        let participants = std::mem::take(&mut self.ceremony.participants);
        let (tier0, rest): (Vec<_>, Vec<_>) = participants.into_iter().partition(|p| p.tier() == 0);
        let (mut tier1, mut candidates): (Vec<_>, Vec<_>) = rest.into_iter().partition(|p| p.tier() == 1);
        tier1.shuffle(&mut rng);
        candidates.shuffle(&mut rng);

        // Of the shuffled candidates, at most `max_tier2` keep the
        // early-bird tier; the overflow is served in arrival order.
        let max_tier2 = self.ceremony.max_tier2 as usize;
        let overflow = if candidates.len() > max_tier2 {
            candidates.split_off(max_tier2)
        } else {
            Vec::new()
        };
        let mut late = overflow.into_iter().sorted_by_key(|p| p.added_at()).collect::<Vec<_>>();
        for participant in &mut candidates {
            participant.set_tier(2);
        }
        for participant in &mut late {
            participant.set_tier(3);
        }

        let mut ordered = tier0;
        ordered.extend(tier1);
        ordered.extend(candidates);
        ordered.extend(late);
        for (index, participant) in ordered.iter_mut().enumerate() {
            participant.set_priority(index as u64 + 1);
            participant.set_position(index as u64 + 1);
        }
        self.ceremony.participants = ordered;

        self.ceremony.state = CeremonyState::Selected;

        // The participant order was re-created wholesale: move the epoch
        // so cached deltas are discarded, and restamp every participant.
        let sequence = self.next_sequence();
        self.ceremony.status_sequence = sequence;
        self.ceremony.start_sequence = sequence;
        for participant in self.ceremony.participants.iter_mut() {
            participant.set_sequence(sequence);
        }

        self.order_waiting_participants();

        info!(
            "Selected {} participants from a {}-byte seed",
            self.ceremony.participants.len(),
            seed.len()
        );
        true
    }

    ///
    /// Recomputes the queue order of the waiting participants. Resolved
    /// and active participants are pinned at their slots; only the
    /// waiting entries re-rank, among themselves, across the slots they
    /// already occupy. A participant's sequence is bumped only if its
    /// position actually changed, so idle pollers are not handed
    /// spurious deltas.
    ///
    pub(crate) fn order_waiting_participants(&mut self) {
        let mut sequence = self.ceremony.sequence;
        let participants = &mut self.ceremony.participants;

        let slots: Vec<usize> = participants
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_waiting())
            .map(|(index, _)| index)
            .collect();

        // Pinned entries rank purely by priority; the rest prefer online
        // participants, then lower tiers, then lower priorities.
        let mut waiting: Vec<ParticipantInfo> = slots.iter().map(|&index| participants[index].clone()).collect();
        waiting.sort_by(|a, b| match (a.tier(), b.tier()) {
            (0, 0) => a.priority().cmp(&b.priority()),
            (0, _) => Ordering::Less,
            (_, 0) => Ordering::Greater,
            _ => b
                .is_online()
                .cmp(&a.is_online())
                .then(a.tier().cmp(&b.tier()))
                .then(a.priority().cmp(&b.priority())),
        });
        for (&slot, participant) in slots.iter().zip(waiting.into_iter()) {
            participants[slot] = participant;
        }

        for (index, participant) in participants.iter_mut().enumerate() {
            let position = index as u64 + 1;
            if participant.position() != position {
                sequence += 1;
                participant.set_position(position);
                participant.set_sequence(sequence);
            }
        }
        self.ceremony.sequence = sequence;
    }

    ///
    /// Records a heartbeat for the given participant. Coming online may
    /// change the queue order, so ordering is re-run when it happens.
    ///
    pub(crate) fn ping(&mut self, address: &Address, now: DateTime<Utc>) -> Result<(), CoordinatorError> {
        let sequence = self.ceremony.sequence + 1;
        let participant = self
            .ceremony
            .participant_mut(address)
            .ok_or(CoordinatorError::ParticipantMissing)?;
        let came_online = participant.heartbeat(now);
        participant.set_sequence(sequence);
        self.ceremony.sequence = sequence;

        if came_online {
            trace!("{} is back online", address);
            self.order_waiting_participants();
            self.bump_status();
        }
        Ok(())
    }

    ///
    /// Applies a client-reported progress update to the running
    /// participant. Also counts as a heartbeat.
    ///
    pub(crate) fn update_participant(
        &mut self,
        address: &Address,
        update: &ParticipantUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinatorError> {
        let sequence = self.ceremony.sequence + 1;
        let participant = self
            .ceremony
            .participant_mut(address)
            .ok_or(CoordinatorError::ParticipantMissing)?;
        participant.update(now, update)?;
        participant.set_sequence(sequence);
        self.ceremony.sequence = sequence;
        Ok(())
    }

    ///
    /// Records a fully uploaded transcript payload for the running
    /// participant.
    ///
    pub(crate) fn transcript_uploaded(
        &mut self,
        address: &Address,
        num: u64,
        size: u64,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinatorError> {
        // Check that the uploader holds the running slot.
        if self.running.as_ref() != Some(address) {
            return Err(CoordinatorError::ParticipantNotRunning);
        }

        let sequence = self.ceremony.sequence + 1;
        let participant = self
            .ceremony
            .participant_mut(address)
            .ok_or(CoordinatorError::ParticipantMissing)?;
        participant.record_upload(num, size)?;
        participant.heartbeat(now);
        participant.set_sequence(sequence);
        self.ceremony.sequence = sequence;
        Ok(())
    }

    ///
    /// Marks a transcript of the running participant as verified. Once
    /// every transcript is complete the participant finishes and becomes
    /// the new chain anchor. Returns `true` when that happened.
    ///
    pub(crate) fn transcript_verified(
        &mut self,
        address: &Address,
        num: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, CoordinatorError> {
        // Check that the address still holds the running slot.
        if self.running.as_ref() != Some(address) {
            return Err(CoordinatorError::ParticipantNotRunning);
        }

        let sequence = self.ceremony.sequence + 1;
        let participant = self
            .ceremony
            .participant_mut(address)
            .ok_or(CoordinatorError::ParticipantMissing)?;
        let finished = participant.complete_transcript(num, now)?;
        participant.set_sequence(sequence);
        self.ceremony.sequence = sequence;

        if finished {
            let sequence = self.ceremony.sequence + 1;
            let participant = self
                .ceremony
                .participant_mut(address)
                .ok_or(CoordinatorError::ParticipantMissing)?;
            participant.finish(now)?;
            participant.set_sequence(sequence);
            self.ceremony.sequence = sequence;

            self.last_complete = Some(address.clone());
            self.running = None;
            info!("{} has completed its contribution", address);
        }

        Ok(finished)
    }

    ///
    /// Invalidates the running participant with the given reason, e.g.
    /// after a failed verification. Terminal for the participant.
    ///
    pub(crate) fn invalidate_participant(&mut self, address: &Address, reason: &str) -> Result<(), CoordinatorError> {
        let sequence = self.ceremony.sequence + 1;
        let participant = self
            .ceremony
            .participant_mut(address)
            .ok_or(CoordinatorError::ParticipantMissing)?;
        participant.invalidate(reason)?;
        participant.set_sequence(sequence);
        self.ceremony.sequence = sequence;

        if self.running.as_ref() == Some(address) {
            self.running = None;
        }
        warn!("{} was invalidated: {}", address, reason);
        Ok(())
    }

    ///
    /// Marks the sealed ceremony as complete, once the external
    /// publisher has finished writing the final artifacts.
    ///
    pub(crate) fn complete_ceremony(&mut self) -> Result<(), CoordinatorError> {
        // Check that the ceremony has sealed.
        if self.ceremony.state != CeremonyState::Sealing {
            return Err(CoordinatorError::CeremonyNotSealing);
        }

        self.ceremony.state = CeremonyState::Complete;
        self.bump_status();
        info!("Ceremony is complete");
        Ok(())
    }

    ///
    /// Pauses or resumes dispatching. The running participant, the
    /// verifier and the transfer pipelines are unaffected.
    ///
    pub(crate) fn set_paused(&mut self, paused: bool) {
        if self.ceremony.paused != paused {
            self.ceremony.paused = paused;
            self.bump_status();
            info!("Ceremony {}", if paused { "paused" } else { "resumed" });
        }
    }

    ///
    /// Drives the ceremony state machine one step with the given clock
    /// reading. Called on a fixed tick by the coordinator.
    ///
    pub(crate) fn advance(&mut self, now: DateTime<Utc>) -> AdvanceActions {
        let mut actions = AdvanceActions::default();

        // Mark participants without a recent heartbeat offline. Offline
        // status affects scheduling, so the queue order is recomputed.
        let offline_after = Duration::seconds(OFFLINE_AFTER_SECS);
        let mut sequence = self.ceremony.sequence;
        let mut any_idle = false;
        for participant in self.ceremony.participants.iter_mut() {
            if !participant.is_online() {
                continue;
            }
            let stale = match participant.last_update() {
                Some(at) => now - at > offline_after,
                None => true,
            };
            if stale {
                sequence += 1;
                participant.set_online(false);
                participant.set_sequence(sequence);
                any_idle = true;
                debug!("{} has gone offline", participant.address());
            }
        }
        self.ceremony.sequence = sequence;
        if any_idle {
            self.order_waiting_participants();
            self.bump_status();
        }

        // The ceremony only moves between its scheduled start and its end
        // states.
        if now < self.ceremony.start_time {
            return actions;
        }
        if !matches!(self.ceremony.state, CeremonyState::Selected | CeremonyState::Running) {
            return actions;
        }

        if self.ceremony.state != CeremonyState::Running {
            self.ceremony.state = CeremonyState::Running;
            self.bump_status();
            info!("Ceremony is now running");
        }

        // Evict the running participant once its timeout budget is spent,
        // then fall through and re-schedule within the same tick.
        if let Some(address) = self.running.clone() {
            if !self.timed_out(&address, now) {
                return actions;
            }

            let sequence = self.ceremony.sequence + 1;
            if let Some(participant) = self.ceremony.participant_mut(&address) {
                if participant.invalidate("timed out").is_ok() {
                    participant.set_sequence(sequence);
                    self.ceremony.sequence = sequence;
                    warn!("{} timed out and was invalidated", address);
                }
            }
            self.running = None;
            actions.invalidated.push(address);
        }

        // Seal once enough contributions are in and the scheduled end has
        // passed.
        if self.ceremony.number_of_complete_participants() >= self.ceremony.min_participants
            && now >= self.ceremony.end_time
        {
            self.ceremony.state = CeremonyState::Sealing;
            self.bump_status();
            info!("Ceremony is sealing");
            return actions;
        }

        // Hand the running slot to the first waiting participant that is
        // online, chaining its transcripts to the current anchor.
        if self.ceremony.paused {
            return actions;
        }
        let next = self
            .ceremony
            .participants
            .iter()
            .find(|p| p.is_waiting() && p.is_online())
            .map(|p| p.address().clone());
        if let Some(address) = next {
            let transcripts = self.transcripts_for_next();
            let sequence = self.ceremony.sequence + 1;
            if let Some(participant) = self.ceremony.participant_mut(&address) {
                match participant.start(now, transcripts) {
                    Ok(()) => {
                        participant.set_sequence(sequence);
                        self.ceremony.sequence = sequence;
                        self.bump_status();
                        self.running = Some(address.clone());
                        actions.dispatched = Some(address.clone());
                        info!("{} now holds the running slot", address);
                    }
                    Err(error) => warn!("Refusing to dispatch {}: {}", address, error),
                }
            }
        }

        actions
    }

    /// Returns `true` if the running participant has exceeded either its
    /// overall timeout budget or, for non-privileged tiers, the expected
    /// verification rate.
    fn timed_out(&self, address: &Address, now: DateTime<Utc>) -> bool {
        let participant = match self.ceremony.participant(address) {
            Some(participant) => participant,
            None => return false,
        };
        let started_at = match participant.started_at() {
            Some(started_at) => started_at,
            None => return false,
        };

        let complete_within = participant.invalidate_after().unwrap_or(self.ceremony.invalidate_after);
        if now - started_at > Duration::seconds(complete_within as i64) {
            return true;
        }

        // Higher tiers must also keep verifying at a steady rate, so a
        // stalled upload stream does not consume the whole budget.
        if participant.tier() > 1 {
            let points = std::cmp::max(self.ceremony.num_g1_points, self.ceremony.num_g2_points);
            let per = points / self.ceremony.points_per_transcript;
            if per > 0 {
                let verify_within = 2 * complete_within / per;
                let from = participant.last_verified().unwrap_or(started_at);
                if now - from > Duration::seconds(verify_within as i64) {
                    return true;
                }
            }
        }

        false
    }

    /// Builds the transcript set for the next running participant:
    /// fresh placeholders if nobody has completed yet, otherwise
    /// references to the anchor's verified transcripts.
    fn transcripts_for_next(&self) -> Vec<Transcript> {
        match self.last_complete.as_ref().and_then(|a| self.ceremony.participant(a)) {
            Some(anchor) => anchor
                .transcripts()
                .iter()
                .map(|t| Transcript::from_anchor(t.num(), t.size(), anchor.address().clone()))
                .collect(),
            None => (0..self.ceremony.transcripts_per_participant())
                .map(Transcript::new)
                .collect(),
        }
    }
}

/// Builds the selection PRNG from an externally supplied entropy buffer,
/// e.g. a block hash unknown before the selection block is mined.
fn seed_rng(seed: &[u8]) -> ChaCha20Rng {
    let mut key = [0u8; 32];
    let len = seed.len().min(32);
    key[..len].copy_from_slice(&seed[..len]);
    ChaCha20Rng::from_seed(key)
}
