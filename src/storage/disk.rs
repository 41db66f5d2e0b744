use crate::{
    environment::Environment,
    objects::{Address, Ceremony},
    storage::TranscriptStorage,
    CoordinatorError,
};

use fs_err as fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

///
/// A disk-backed transcript store. Staged artifacts live under
/// `staging/<address>/`, verified artifacts under `verified/<address>/`,
/// and the ceremony document at `ceremony.json`, all below a single
/// base directory.
///
#[derive(Debug)]
pub struct Disk {
    base: PathBuf,
}

impl Disk {
    /// Loads a new instance of `Disk` at the base directory configured
    /// in the given environment.
    pub fn new(environment: &Environment) -> Result<Self, CoordinatorError> {
        Self::at(PathBuf::from(environment.local_base_directory()))
    }

    /// Loads a new instance of `Disk` at the given base directory.
    pub fn at(base: PathBuf) -> Result<Self, CoordinatorError> {
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    fn staging_directory(&self, address: &Address) -> PathBuf {
        self.base.join("staging").join(address.as_str())
    }

    fn verified_directory(&self, address: &Address) -> PathBuf {
        self.base.join("verified").join(address.as_str())
    }

    fn ceremony_path(&self) -> PathBuf {
        self.base.join("ceremony.json")
    }

    fn signature_path(path: &Path) -> PathBuf {
        path.with_extension("sig")
    }

    /// Writes the data to a temporary sibling first, then renames it
    /// into place, so a reader never observes a partial file.
    fn write_atomic(path: &Path, data: &[u8]) -> Result<(), CoordinatorError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temporary = path.with_extension("tmp");
        fs::write(&temporary, data)?;
        fs::rename(&temporary, path)?;
        Ok(())
    }

    fn file_size(path: &Path) -> Option<u64> {
        fs::metadata(path).map(|metadata| metadata.len()).ok()
    }
}

impl TranscriptStorage for Disk {
    fn stage_transcript(&self, address: &Address, num: u64, data: &[u8]) -> Result<(), CoordinatorError> {
        let path = self.staged_transcript_path(address, num);
        debug!("Staging transcript {} of {} ({} bytes)", num, address, data.len());
        Self::write_atomic(&path, data)
    }

    fn stage_signature(&self, address: &Address, num: u64, signature: &str) -> Result<(), CoordinatorError> {
        let path = Self::signature_path(&self.staged_transcript_path(address, num));
        Self::write_atomic(&path, signature.as_bytes())
    }

    fn staged_transcript_path(&self, address: &Address, num: u64) -> PathBuf {
        self.staging_directory(address).join(format!("transcript{}.dat", num))
    }

    fn staged_transcript_size(&self, address: &Address, num: u64) -> Option<u64> {
        Self::file_size(&self.staged_transcript_path(address, num))
    }

    fn verified_transcript_path(&self, address: &Address, num: u64) -> PathBuf {
        self.verified_directory(address).join(format!("transcript{}.dat", num))
    }

    fn verified_transcript_size(&self, address: &Address, num: u64) -> Option<u64> {
        Self::file_size(&self.verified_transcript_path(address, num))
    }

    fn promote_transcript(&self, address: &Address, num: u64) -> Result<(), CoordinatorError> {
        let staged = self.staged_transcript_path(address, num);
        let verified = self.verified_transcript_path(address, num);
        if let Some(parent) = verified.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&staged, &verified)?;

        // The signature travels with its transcript.
        let staged_signature = Self::signature_path(&staged);
        if staged_signature.exists() {
            fs::rename(&staged_signature, Self::signature_path(&verified))?;
        }

        debug!("Promoted transcript {} of {}", num, address);
        Ok(())
    }

    fn read_verified_transcript(&self, address: &Address, num: u64) -> Result<Vec<u8>, CoordinatorError> {
        Ok(fs::read(self.verified_transcript_path(address, num))?)
    }

    fn restore_verified_transcript(&self, address: &Address, num: u64, data: &[u8]) -> Result<(), CoordinatorError> {
        let path = self.verified_transcript_path(address, num);
        debug!("Restoring verified transcript {} of {} ({} bytes)", num, address, data.len());
        Self::write_atomic(&path, data)
    }

    fn erase_staged_transcript(&self, address: &Address, num: u64) -> Result<(), CoordinatorError> {
        let path = self.staged_transcript_path(address, num);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let signature = Self::signature_path(&path);
        if signature.exists() {
            fs::remove_file(&signature)?;
        }
        Ok(())
    }

    fn erase_staged(&self, address: &Address) -> Result<(), CoordinatorError> {
        let directory = self.staging_directory(address);
        if directory.exists() {
            trace!("Erasing staged data of {}", address);
            fs::remove_dir_all(&directory)?;
        }
        Ok(())
    }

    fn save_ceremony(&self, ceremony: &Ceremony) -> Result<(), CoordinatorError> {
        let document = serde_json::to_vec_pretty(ceremony)?;
        Self::write_atomic(&self.ceremony_path(), &document)
    }

    fn load_ceremony(&self) -> Result<Option<Ceremony>, CoordinatorError> {
        let path = self.ceremony_path();
        if !path.exists() {
            return Ok(None);
        }
        let document = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&document)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serial_test::serial;

    fn test_disk(name: &str) -> Disk {
        let base = std::env::temp_dir().join("ceremony-coordinator").join(name);
        let _ = std::fs::remove_dir_all(&base);
        Disk::at(base).unwrap()
    }

    fn address() -> Address {
        Address::new("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
    }

    #[test]
    #[serial]
    fn test_stage_and_promote_transcript() {
        let disk = test_disk("promote");
        let address = address();

        disk.stage_transcript(&address, 0, b"payload").unwrap();
        disk.stage_signature(&address, 0, "sig").unwrap();
        assert_eq!(Some(7), disk.staged_transcript_size(&address, 0));
        assert_eq!(None, disk.verified_transcript_size(&address, 0));

        disk.promote_transcript(&address, 0).unwrap();
        assert_eq!(None, disk.staged_transcript_size(&address, 0));
        assert_eq!(Some(7), disk.verified_transcript_size(&address, 0));
        assert_eq!(b"payload".to_vec(), disk.read_verified_transcript(&address, 0).unwrap());

        let signature = Disk::signature_path(&disk.verified_transcript_path(&address, 0));
        assert!(signature.exists());
    }

    #[test]
    #[serial]
    fn test_erase_staged_data() {
        let disk = test_disk("erase");
        let address = address();

        disk.stage_transcript(&address, 0, b"a").unwrap();
        disk.stage_transcript(&address, 1, b"b").unwrap();

        disk.erase_staged_transcript(&address, 0).unwrap();
        assert_eq!(None, disk.staged_transcript_size(&address, 0));
        assert_eq!(Some(1), disk.staged_transcript_size(&address, 1));

        disk.erase_staged(&address).unwrap();
        assert_eq!(None, disk.staged_transcript_size(&address, 1));

        // Erasing an address with no staged data is fine.
        disk.erase_staged(&address).unwrap();
    }

    #[test]
    #[serial]
    fn test_ceremony_document_round_trip() {
        let disk = test_disk("ceremony");
        assert!(disk.load_ceremony().unwrap().is_none());

        let now = Utc::now();
        let ceremony = Ceremony::new(&Environment::Test, now, now + chrono::Duration::hours(1));
        disk.save_ceremony(&ceremony).unwrap();

        let restored = disk.load_ceremony().unwrap().unwrap();
        assert_eq!(ceremony.sequence(), restored.sequence());
        assert_eq!(ceremony.state(), restored.state());
        assert_eq!(ceremony.min_participants(), restored.min_participants());
    }
}
