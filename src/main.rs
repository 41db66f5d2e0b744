use ceremony_coordinator::{
    entropy::{EntropySource, FixedEntropy, PendingEntropy},
    environment::Environment,
    logger::initialize_logger,
    storage::Disk,
    transfer::DirectoryStore,
    verifier::ProcessRunner,
    Coordinator,
};

use std::{path::PathBuf, sync::Arc};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let environment = Environment::Development;
    initialize_logger(&environment);

    let base = PathBuf::from(environment.local_base_directory());
    let storage = Arc::new(Disk::new(&environment)?);
    let remote = Arc::new(DirectoryStore::at(base.join("publish"))?);
    let runner = Arc::new(ProcessRunner::new(environment.verifier_executable()));

    // The selection seed may be supplied up front, e.g. from a block
    // hash already observed; otherwise selection waits for a watcher.
    let entropy: Arc<dyn EntropySource> = match std::env::var("SELECTION_SEED") {
        Ok(encoded) => Arc::new(FixedEntropy::from_hex(&encoded)?),
        Err(_) => Arc::new(PendingEntropy::new()),
    };

    let coordinator = Arc::new(Coordinator::new(environment, storage, runner, remote, entropy)?);

    tokio::select! {
        _ = coordinator.clone().run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received");
            coordinator.shutdown();
        }
    }

    Ok(())
}
