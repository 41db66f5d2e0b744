use std::time::Duration;
use tracing::Level;

/// The number of seconds without a heartbeat before a participant
/// is considered offline by the scheduler.
pub const OFFLINE_AFTER_SECS: i64 = 10;

/// The fixed delay between retries of transfer and verification I/O.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Environment {
    Test,
    Development,
    Production,
}

impl Environment {
    /// Returns the minimum number of completed participants required
    /// before the ceremony is allowed to seal.
    pub fn minimum_participants(&self) -> u64 {
        match self {
            Environment::Test => 2,
            Environment::Development => 3,
            Environment::Production => 24,
        }
    }

    /// Returns the maximum number of participants permitted to retain
    /// the early-bird tier after selection.
    pub fn maximum_tier2(&self) -> u64 {
        match self {
            Environment::Test => 2,
            Environment::Development => 5,
            Environment::Production => 50,
        }
    }

    /// Returns the total number of G1 points in the ceremony output.
    pub fn number_of_g1_points(&self) -> u64 {
        match self {
            Environment::Test => 20,
            Environment::Development => 10_000,
            Environment::Production => 100_000_000,
        }
    }

    /// Returns the total number of G2 points in the ceremony output.
    pub fn number_of_g2_points(&self) -> u64 {
        match self {
            Environment::Test => 10,
            Environment::Development => 10_000,
            Environment::Production => 1,
        }
    }

    /// Returns the number of points carried by a single transcript.
    pub fn points_per_transcript(&self) -> u64 {
        match self {
            Environment::Test => 4,
            Environment::Development => 2_500,
            Environment::Production => 5_000_000,
        }
    }

    /// Returns the default number of seconds a participant may hold the
    /// running slot before being invalidated.
    pub fn default_invalidate_after(&self) -> u64 {
        match self {
            Environment::Test => 180,
            Environment::Development => 600,
            Environment::Production => 10_800,
        }
    }

    /// Returns the interval between state machine ticks.
    pub fn tick_interval(&self) -> Duration {
        match self {
            Environment::Test => Duration::from_millis(100),
            Environment::Development => Duration::from_millis(500),
            Environment::Production => Duration::from_millis(500),
        }
    }

    /// Returns the number of seconds between construction of the ceremony
    /// and its scheduled start time.
    pub fn start_delay(&self) -> u64 {
        match self {
            Environment::Test => 0,
            Environment::Development => 60,
            Environment::Production => 86_400,
        }
    }

    /// Returns the scheduled duration of the ceremony in seconds. Once
    /// elapsed, the ceremony seals as soon as enough participants have
    /// completed and nobody is running.
    pub fn ceremony_duration(&self) -> u64 {
        match self {
            Environment::Test => 3_600,
            Environment::Development => 86_400,
            Environment::Production => 2_592_000,
        }
    }

    /// Returns the base directory for staged and verified transcripts
    /// and the persisted ceremony document.
    pub fn local_base_directory(&self) -> &str {
        match self {
            Environment::Test => "./transcripts/test",
            Environment::Development => "./transcripts/development",
            Environment::Production => "./transcripts/production",
        }
    }

    /// Returns the path of the external verification executable.
    pub fn verifier_executable(&self) -> &str {
        match self {
            Environment::Test => "./verify",
            Environment::Development => "./verify",
            Environment::Production => "/usr/local/bin/verify",
        }
    }

    /// Returns the logging verbosity for this environment.
    pub fn verbosity(&self) -> Level {
        match self {
            Environment::Test => Level::TRACE,
            Environment::Development => Level::DEBUG,
            Environment::Production => Level::INFO,
        }
    }
}
