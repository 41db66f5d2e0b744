pub mod coordinator;
pub mod coordinator_state;
pub mod entropy;
pub mod environment;
pub mod logger;
pub mod objects;
pub mod queue;
pub mod storage;
pub mod transfer;
pub mod verifier;

pub use coordinator::*;
pub use objects::{Address, Ceremony, CeremonyState, ParticipantInfo, ParticipantState, RunningState, Transcript};
pub use queue::CancelableQueue;
