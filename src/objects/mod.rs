pub mod ceremony;
pub use ceremony::*;

pub mod participant;
pub use participant::*;

pub mod transcript;
pub use transcript::*;
