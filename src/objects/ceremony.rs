use crate::{
    environment::Environment,
    objects::{Address, ParticipantInfo},
    CoordinatorError,
};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_aux::prelude::*;

/// The lifecycle state of the ceremony itself. Transitions are
/// monotonic: `Preselection -> Selected -> Running -> Sealing -> Complete`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CeremonyState {
    Preselection,
    Selected,
    Running,
    Sealing,
    Complete,
}

///
/// The authoritative ceremony document. Every observable mutation bumps
/// `sequence`; ceremony-level field changes additionally move
/// `status_sequence`, and a wholesale re-creation of the participant
/// order moves `start_sequence` (the epoch), forcing pollers to resync
/// in full.
///
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ceremony {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub(crate) sequence: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub(crate) status_sequence: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub(crate) start_sequence: u64,
    #[serde(rename = "ceremonyState")]
    pub(crate) state: CeremonyState,
    pub(crate) paused: bool,
    pub(crate) start_time: DateTime<Utc>,
    pub(crate) end_time: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub(crate) min_participants: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub(crate) max_tier2: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub(crate) num_g1_points: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub(crate) num_g2_points: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub(crate) points_per_transcript: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub(crate) invalidate_after: u64,
    pub(crate) participants: Vec<ParticipantInfo>,
}

impl Ceremony {
    /// Creates a new ceremony document with the parameters of the given
    /// environment and the given schedule.
    pub fn new(environment: &Environment, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            sequence: 0,
            status_sequence: 0,
            start_sequence: 0,
            state: CeremonyState::Preselection,
            paused: false,
            start_time,
            end_time,
            min_participants: environment.minimum_participants(),
            max_tier2: environment.maximum_tier2(),
            num_g1_points: environment.number_of_g1_points(),
            num_g2_points: environment.number_of_g2_points(),
            points_per_transcript: environment.points_per_transcript(),
            invalidate_after: environment.default_invalidate_after(),
            participants: Vec::new(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn status_sequence(&self) -> u64 {
        self.status_sequence
    }

    pub fn start_sequence(&self) -> u64 {
        self.start_sequence
    }

    pub fn state(&self) -> CeremonyState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    pub fn min_participants(&self) -> u64 {
        self.min_participants
    }

    pub fn max_tier2(&self) -> u64 {
        self.max_tier2
    }

    pub fn invalidate_after(&self) -> u64 {
        self.invalidate_after
    }

    pub fn num_g1_points(&self) -> u64 {
        self.num_g1_points
    }

    pub fn num_g2_points(&self) -> u64 {
        self.num_g2_points
    }

    pub fn points_per_transcript(&self) -> u64 {
        self.points_per_transcript
    }

    /// Returns the participants in queue order.
    pub fn participants(&self) -> &[ParticipantInfo] {
        &self.participants
    }

    /// Returns the participant with the given address, if registered.
    pub fn participant(&self, address: &Address) -> Option<&ParticipantInfo> {
        self.participants.iter().find(|p| p.address() == address)
    }

    pub(crate) fn participant_mut(&mut self, address: &Address) -> Option<&mut ParticipantInfo> {
        self.participants.iter_mut().find(|p| p.address() == address)
    }

    /// Returns the number of transcripts each participant contributes,
    /// derived from the point counts of the ceremony.
    pub fn transcripts_per_participant(&self) -> u64 {
        let points = std::cmp::max(self.num_g1_points, self.num_g2_points);
        (points + self.points_per_transcript - 1) / self.points_per_transcript
    }

    /// Returns the number of participants that have completed.
    pub fn number_of_complete_participants(&self) -> u64 {
        self.participants.par_iter().filter(|p| p.is_complete()).count() as u64
    }

    /// Returns the participant currently holding the running slot, if any.
    pub fn running_participant(&self) -> Option<&ParticipantInfo> {
        self.participants.iter().find(|p| p.is_running())
    }

    ///
    /// Returns a delta of this ceremony against the given sequence
    /// number: ceremony-level fields in full, but only the participants
    /// modified after `after`.
    ///
    pub fn delta_since(&self, after: u64) -> Ceremony {
        let mut delta = self.clone();
        delta.participants = self
            .participants
            .iter()
            .filter(|p| p.sequence() > after)
            .cloned()
            .collect();
        delta
    }

    ///
    /// Merges a delta into this cached ceremony document. The caller must
    /// discard its cache and fetch the full state instead when this
    /// returns a start sequence mismatch, since positional deltas are
    /// meaningless across a reordering epoch.
    ///
    pub fn apply_delta(&mut self, delta: &Ceremony) -> Result<(), CoordinatorError> {
        // Check that the delta belongs to the same ordering epoch.
        if delta.start_sequence != self.start_sequence {
            return Err(CoordinatorError::StartSequenceMismatch);
        }

        self.sequence = delta.sequence;
        self.status_sequence = delta.status_sequence;
        self.state = delta.state;
        self.paused = delta.paused;
        self.start_time = delta.start_time;
        self.end_time = delta.end_time;
        self.min_participants = delta.min_participants;
        self.max_tier2 = delta.max_tier2;
        self.num_g1_points = delta.num_g1_points;
        self.num_g2_points = delta.num_g2_points;
        self.points_per_transcript = delta.points_per_transcript;
        self.invalidate_after = delta.invalidate_after;

        for participant in &delta.participants {
            // Positions are 1-based and contiguous, so a delta entry either
            // replaces an existing slot or appends the next one.
            let index = participant.position() as usize - 1;
            if index < self.participants.len() {
                self.participants[index] = participant.clone();
            } else if index == self.participants.len() {
                self.participants.push(participant.clone());
            } else {
                return Err(CoordinatorError::DeltaOutOfRange);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::ParticipantState;

    fn ceremony_with_participants(count: u64) -> Ceremony {
        let now = Utc::now();
        let mut ceremony = Ceremony::new(&Environment::Test, now, now + chrono::Duration::hours(1));
        for i in 0..count {
            let mut participant =
                ParticipantInfo::new(Address::new(format!("0x{:040x}", i)), 2, i + 1, i + 1, now);
            ceremony.sequence += 1;
            participant.set_sequence(ceremony.sequence);
            ceremony.participants.push(participant);
        }
        ceremony
    }

    #[test]
    fn test_delta_contains_only_modified_participants() {
        let mut ceremony = ceremony_with_participants(4);

        // Touch the third participant.
        ceremony.sequence += 1;
        let sequence = ceremony.sequence;
        ceremony.participants[2].set_sequence(sequence);

        let delta = ceremony.delta_since(4);
        assert_eq!(1, delta.participants.len());
        assert_eq!(3, delta.participants[0].position());
        assert_eq!(ceremony.sequence, delta.sequence);

        // A poller that is already up to date receives no participants.
        assert!(ceremony.delta_since(sequence).participants.is_empty());
    }

    #[test]
    fn test_apply_delta_is_idempotent() {
        let server = ceremony_with_participants(4);
        let mut client = ceremony_with_participants(4);

        let mut mutated = server.clone();
        mutated.sequence += 1;
        let sequence = mutated.sequence;
        mutated.participants[1].set_sequence(sequence);
        let delta = mutated.delta_since(4);

        client.apply_delta(&delta).unwrap();
        let once = client.clone();
        client.apply_delta(&delta).unwrap();

        assert_eq!(once.sequence, client.sequence);
        assert_eq!(once.participants.len(), client.participants.len());
        for (a, b) in once.participants.iter().zip(client.participants.iter()) {
            assert_eq!(a.sequence(), b.sequence());
            assert_eq!(a.position(), b.position());
        }
    }

    #[test]
    fn test_apply_delta_rejects_stale_epoch() {
        let mut server = ceremony_with_participants(2);
        let mut client = server.clone();

        // The server re-creates its participant order.
        server.sequence += 1;
        server.start_sequence = server.sequence;

        let delta = server.delta_since(client.sequence());
        assert!(matches!(
            client.apply_delta(&delta),
            Err(CoordinatorError::StartSequenceMismatch)
        ));
    }

    #[test]
    fn test_apply_delta_appends_new_participants() {
        let server = ceremony_with_participants(3);
        let mut client = ceremony_with_participants(2);

        let delta = server.delta_since(2);
        client.apply_delta(&delta).unwrap();

        assert_eq!(3, client.participants.len());
        assert_eq!(3, client.participants[2].position());
    }

    #[test]
    fn test_transcripts_per_participant_rounds_up() {
        let now = Utc::now();
        let ceremony = Ceremony::new(&Environment::Test, now, now);
        // 20 G1 points at 4 points per transcript.
        assert_eq!(5, ceremony.transcripts_per_participant());
    }

    #[test]
    fn test_running_participant_lookup() {
        let now = Utc::now();
        let mut ceremony = ceremony_with_participants(2);
        ceremony.participants[1]
            .start(now, vec![crate::objects::Transcript::new(0)])
            .unwrap();

        let running = ceremony.running_participant().unwrap();
        assert_eq!(ParticipantState::Running, running.state());
        assert_eq!(2, running.position());
    }
}
