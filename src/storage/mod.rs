pub mod disk;
pub use disk::*;

use crate::{
    objects::{Address, Ceremony},
    CoordinatorError,
};

use std::path::PathBuf;

///
/// The shared transcript store. Staged (unverified) artifacts are
/// written by the transport boundary and the download pipeline; the
/// verifier promotes them into the verified area once the external
/// verification has accepted them. All writes are atomic-rename based,
/// so a concurrent reader never observes a partially-written file.
///
pub trait TranscriptStorage: Send + Sync {
    /// Writes an unverified transcript payload into the staging area.
    fn stage_transcript(&self, address: &Address, num: u64, data: &[u8]) -> Result<(), CoordinatorError>;

    /// Writes the detached signature accompanying a staged transcript.
    fn stage_signature(&self, address: &Address, num: u64, signature: &str) -> Result<(), CoordinatorError>;

    /// Returns the path of a staged transcript.
    fn staged_transcript_path(&self, address: &Address, num: u64) -> PathBuf;

    /// Returns the size of a staged transcript, if it exists.
    fn staged_transcript_size(&self, address: &Address, num: u64) -> Option<u64>;

    /// Returns the path of a verified transcript.
    fn verified_transcript_path(&self, address: &Address, num: u64) -> PathBuf;

    /// Returns the size of a verified transcript, if it exists.
    fn verified_transcript_size(&self, address: &Address, num: u64) -> Option<u64>;

    /// Moves a staged transcript and its signature into the verified
    /// area.
    fn promote_transcript(&self, address: &Address, num: u64) -> Result<(), CoordinatorError>;

    /// Reads back a verified transcript payload.
    fn read_verified_transcript(&self, address: &Address, num: u64) -> Result<Vec<u8>, CoordinatorError>;

    /// Writes an already-verified transcript payload fetched back from
    /// the publish store, e.g. while recovering from a crash.
    fn restore_verified_transcript(&self, address: &Address, num: u64, data: &[u8]) -> Result<(), CoordinatorError>;

    /// Removes a single staged transcript, e.g. after a rejected
    /// verification.
    fn erase_staged_transcript(&self, address: &Address, num: u64) -> Result<(), CoordinatorError>;

    /// Removes all staged data for the given address.
    fn erase_staged(&self, address: &Address) -> Result<(), CoordinatorError>;

    /// Persists the ceremony document.
    fn save_ceremony(&self, ceremony: &Ceremony) -> Result<(), CoordinatorError>;

    /// Loads the persisted ceremony document, if one exists.
    fn load_ceremony(&self) -> Result<Option<Ceremony>, CoordinatorError>;
}
