//! Tunable parameters. Every knob can be overridden locally with an
//! environment variable; components additionally take explicit overrides in
//! their constructors for tests.

use std::{
    env,
    fmt::Debug,
    str::FromStr,
    sync::LazyLock,
    time::Duration,
};

/// How long to sleep before reconnecting after a transient driver fault,
/// in the tailer and in each applier. Intentionally coarse: replication is
/// expected to run under an external supervisor that restarts the process
/// when the single retry is also exhausted.
pub static RECONNECT_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("REPLICATOR_RECONNECT_BACKOFF_SECS", 60)));

/// How long the tailer idles before polling an exhausted oplog cursor
/// again.
pub static IDLE_POLL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("REPLICATOR_IDLE_POLL_MS", 1000)));

fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
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
