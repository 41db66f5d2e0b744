use crate::{objects::Address, CoordinatorError};

use serde::{Deserialize, Serialize};
use serde_aux::prelude::*;

///
/// One chunk of a participant's contribution. A transcript with a
/// `from_address` builds on the verified output of that participant;
/// a transcript without one is a fresh starting point.
///
/// `complete` is controlled by the coordinator and is only set once the
/// external verification of the uploaded data has succeeded. A complete
/// transcript is immutable.
///
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    num: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    size: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    downloaded: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    uploaded: u64,
    complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    from_address: Option<Address>,
}

impl Transcript {
    /// Creates a placeholder transcript with the given ordinal,
    /// for a participant starting from a fresh ceremony.
    pub fn new(num: u64) -> Self {
        Self {
            num,
            size: 0,
            downloaded: 0,
            uploaded: 0,
            complete: false,
            from_address: None,
        }
    }

    /// Creates a transcript that builds on the verified transcript of
    /// a prior participant with the given address and size.
    pub fn from_anchor(num: u64, size: u64, from_address: Address) -> Self {
        Self {
            num,
            size,
            downloaded: 0,
            uploaded: 0,
            complete: false,
            from_address: Some(from_address),
        }
    }

    /// Returns the ordinal of this transcript within the participant's
    /// contribution set.
    pub fn num(&self) -> u64 {
        self.num
    }

    /// Returns the size of the transcript data in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the number of bytes the participant has downloaded.
    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Returns the number of bytes the participant has uploaded.
    pub fn uploaded(&self) -> u64 {
        self.uploaded
    }

    /// Returns `true` if the transcript has been verified.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Returns the address of the participant whose verified output
    /// seeds this transcript, if any.
    pub fn from_address(&self) -> Option<&Address> {
        self.from_address.as_ref()
    }

    ///
    /// Updates the number of bytes the participant has downloaded.
    ///
    pub fn update_downloaded(&mut self, bytes: u64) -> Result<(), CoordinatorError> {
        // Check that the transcript is not already complete.
        if self.complete {
            return Err(CoordinatorError::TranscriptAlreadyComplete);
        }

        self.downloaded = bytes;
        Ok(())
    }

    ///
    /// Updates the number of bytes the participant has uploaded.
    ///
    pub fn update_uploaded(&mut self, bytes: u64) -> Result<(), CoordinatorError> {
        // Check that the transcript is not already complete.
        if self.complete {
            return Err(CoordinatorError::TranscriptAlreadyComplete);
        }

        self.uploaded = bytes;
        Ok(())
    }

    ///
    /// Records a fully uploaded transcript payload of the given size.
    ///
    pub fn record_upload(&mut self, size: u64) -> Result<(), CoordinatorError> {
        // Check that the transcript is not already complete.
        if self.complete {
            return Err(CoordinatorError::TranscriptAlreadyComplete);
        }

        self.size = size;
        self.uploaded = size;
        Ok(())
    }

    ///
    /// Marks this transcript as verified. A complete transcript is
    /// immutable, so marking twice is rejected.
    ///
    pub fn mark_complete(&mut self) -> Result<(), CoordinatorError> {
        // Check that the transcript is not already complete.
        if self.complete {
            return Err(CoordinatorError::TranscriptAlreadyComplete);
        }

        self.complete = true;
        Ok(())
    }
}
