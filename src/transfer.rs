use crate::{
    environment::RETRY_DELAY,
    objects::Address,
    queue::CancelableQueue,
    storage::TranscriptStorage,
    CoordinatorError,
};

use fs_err as fs;
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace, warn};

/// A verified transcript to push into the publish store.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UploadItem {
    pub address: Address,
    pub num: u64,
}

/// A published transcript to fetch back into the local store.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DownloadItem {
    pub address: Address,
    pub num: u64,
}

/// Progress reported by the transfer pipelines, delivered at least once
/// per item over an explicit channel.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Uploaded { address: Address, num: u64, bytes: u64 },
    Downloaded { address: Address, num: u64, bytes: u64 },
    Skipped { address: Address, num: u64 },
}

///
/// The remote object store transcripts are published into. The real
/// deployment keeps this behind an S3-compatible service; the seam only
/// assumes whole-object reads and writes.
///
pub trait RemoteStore: Send + Sync {
    fn put_object(&self, key: &str, data: &[u8]) -> Result<(), CoordinatorError>;
    fn get_object(&self, key: &str) -> Result<Vec<u8>, CoordinatorError>;
    fn object_size(&self, key: &str) -> Result<Option<u64>, CoordinatorError>;
}

/// A filesystem-backed `RemoteStore`, the default publish target for
/// development deployments.
#[derive(Debug)]
pub struct DirectoryStore {
    base: PathBuf,
}

impl DirectoryStore {
    pub fn at(base: PathBuf) -> Result<Self, CoordinatorError> {
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.base.join(key)
    }

    fn write_atomic(path: &Path, data: &[u8]) -> Result<(), CoordinatorError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temporary = path.with_extension("tmp");
        fs::write(&temporary, data)?;
        fs::rename(&temporary, path)?;
        Ok(())
    }
}

impl RemoteStore for DirectoryStore {
    fn put_object(&self, key: &str, data: &[u8]) -> Result<(), CoordinatorError> {
        Self::write_atomic(&self.object_path(key), data)
    }

    fn get_object(&self, key: &str) -> Result<Vec<u8>, CoordinatorError> {
        Ok(fs::read(self.object_path(key))?)
    }

    fn object_size(&self, key: &str) -> Result<Option<u64>, CoordinatorError> {
        Ok(fs::metadata(self.object_path(key)).map(|m| m.len()).ok())
    }
}

/// Returns the object key of a transcript in the publish store.
pub fn transcript_key(address: &Address, num: u64) -> String {
    format!("{}/transcript{}.dat", address, num)
}

///
/// The upload pipeline: pushes verified transcripts into the publish
/// store, retrying failures indefinitely with a fixed delay. An object
/// already present with the expected size is skipped, so requeueing an
/// item is cheap.
///
pub struct Uploader {
    storage: Arc<dyn TranscriptStorage>,
    remote: Arc<dyn RemoteStore>,
    queue: Arc<CancelableQueue<UploadItem>>,
    events: UnboundedSender<TransferEvent>,
    cancelled: AtomicBool,
}

impl Uploader {
    pub fn new(
        storage: Arc<dyn TranscriptStorage>,
        remote: Arc<dyn RemoteStore>,
        queue: Arc<CancelableQueue<UploadItem>>,
        events: UnboundedSender<TransferEvent>,
    ) -> Self {
        Self {
            storage,
            remote,
            queue,
            events,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn submit(&self, item: UploadItem) -> bool {
        self.queue.put(item)
    }

    pub async fn run(&self) {
        while let Some(item) = self.queue.get().await {
            self.process(item).await;
        }
        trace!("Upload queue has completed");
    }

    pub fn end(&self) {
        self.queue.end();
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.queue.cancel();
    }

    async fn process(&self, item: UploadItem) {
        let key = transcript_key(&item.address, item.num);
        loop {
            match self.transfer(&item, &key) {
                Ok(Some(bytes)) => {
                    debug!("Published transcript {} of {} ({} bytes)", item.num, item.address, bytes);
                    let _ = self.events.send(TransferEvent::Uploaded {
                        address: item.address,
                        num: item.num,
                        bytes,
                    });
                    return;
                }
                Ok(None) => {
                    trace!("Transcript {} of {} is already published", item.num, item.address);
                    let _ = self.events.send(TransferEvent::Skipped {
                        address: item.address,
                        num: item.num,
                    });
                    return;
                }
                Err(error) => {
                    if self.cancelled.load(Ordering::SeqCst) {
                        return;
                    }
                    warn!("Publishing transcript {} of {} failed, retrying: {}", item.num, item.address, error);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    /// Returns the bytes transferred, or `None` when the object was
    /// already in place.
    fn transfer(&self, item: &UploadItem, key: &str) -> Result<Option<u64>, CoordinatorError> {
        let data = self.storage.read_verified_transcript(&item.address, item.num)?;
        if self.remote.object_size(key)? == Some(data.len() as u64) {
            return Ok(None);
        }
        self.remote.put_object(key, &data)?;
        Ok(Some(data.len() as u64))
    }
}

///
/// The download pipeline: fetches published transcripts back into the
/// local verified store, e.g. to rebuild the chain anchor after a crash.
/// Mirrors the retry and idempotent-skip behavior of the uploader.
///
pub struct Downloader {
    storage: Arc<dyn TranscriptStorage>,
    remote: Arc<dyn RemoteStore>,
    queue: Arc<CancelableQueue<DownloadItem>>,
    events: UnboundedSender<TransferEvent>,
    cancelled: AtomicBool,
}

impl Downloader {
    pub fn new(
        storage: Arc<dyn TranscriptStorage>,
        remote: Arc<dyn RemoteStore>,
        queue: Arc<CancelableQueue<DownloadItem>>,
        events: UnboundedSender<TransferEvent>,
    ) -> Self {
        Self {
            storage,
            remote,
            queue,
            events,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn submit(&self, item: DownloadItem) -> bool {
        self.queue.put(item)
    }

    pub async fn run(&self) {
        while let Some(item) = self.queue.get().await {
            self.process(item).await;
        }
        trace!("Download queue has completed");
    }

    pub fn end(&self) {
        self.queue.end();
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.queue.cancel();
    }

    async fn process(&self, item: DownloadItem) {
        let key = transcript_key(&item.address, item.num);
        loop {
            match self.transfer(&item, &key) {
                Ok(Some(bytes)) => {
                    debug!("Fetched transcript {} of {} ({} bytes)", item.num, item.address, bytes);
                    let _ = self.events.send(TransferEvent::Downloaded {
                        address: item.address,
                        num: item.num,
                        bytes,
                    });
                    return;
                }
                Ok(None) => {
                    let _ = self.events.send(TransferEvent::Skipped {
                        address: item.address,
                        num: item.num,
                    });
                    return;
                }
                Err(error) => {
                    if self.cancelled.load(Ordering::SeqCst) {
                        return;
                    }
                    warn!("Fetching transcript {} of {} failed, retrying: {}", item.num, item.address, error);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    fn transfer(&self, item: &DownloadItem, key: &str) -> Result<Option<u64>, CoordinatorError> {
        let remote_size = self.remote.object_size(key)?;
        if remote_size.is_some() && remote_size == self.storage.verified_transcript_size(&item.address, item.num) {
            return Ok(None);
        }
        let data = self.remote.get_object(key)?;
        self.storage.restore_verified_transcript(&item.address, item.num, &data)?;
        Ok(Some(data.len() as u64))
    }
}
