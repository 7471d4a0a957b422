//! Tunable limits and parameters.
//!
//! Every knob can be overridden with an environment variable of the same
//! name. Each should carry a comment saying what it's for so an oncall
//! engineer can adjust it safely.

use std::{
    env,
    fmt::Debug,
    str::FromStr,
    sync::LazyLock,
    time::Duration,
};

pub fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    let var_s = match env::var(name) {
        Ok(s) => s,
        Err(env::VarError::NotPresent) => return default,
        Err(env::VarError::NotUnicode(..)) => {
            tracing::warn!("Invalid value for {name}, falling back to {default:?}.");
            return default;
        },
    };
    match T::from_str(&var_s) {
        Ok(v) => {
            tracing::info!("Overriding {name} to {v:?} from environment");
            v
        },
        Err(e) => {
            tracing::warn!("Invalid value {var_s} for {name}, falling back to {default:?}: {e:?}");
            default
        },
    }
}

/// Transactions that live longer than this get one structured log line at
/// termination.
pub static SLOW_TRANSACTION_THRESHOLD: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_millis(env_config("SLOW_TRANSACTION_THRESHOLD_MS", 100))
});

/// How many times an idempotent remote command (abort, commit cleanup) is
/// attempted across transport-retryable failures.
pub static REMOTE_RETRY_ATTEMPTS: LazyLock<u32> =
    LazyLock::new(|| env_config("REMOTE_RETRY_ATTEMPTS", 3));

/// First delay of the exponential backoff used while waiting for a
/// migration's commit/abort op-time to become majority-committed.
pub static MAJORITY_WAIT_INITIAL_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("MAJORITY_WAIT_INITIAL_BACKOFF_SECS", 1)));

/// Ceiling for that backoff; the wait retries at this cadence until the
/// blocker shuts down.
pub static MAJORITY_WAIT_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("MAJORITY_WAIT_MAX_BACKOFF_SECS", 60)));

/// Sane cap on deadlines we bother scheduling a timeout for; anything longer
/// is treated as unbounded.
pub static MIGRATION_BLOCKER_MAX_TIMEOUT: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("MIGRATION_BLOCKER_MAX_TIMEOUT_SECS", 3600 * 10_000))
});
