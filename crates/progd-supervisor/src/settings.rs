use std::time::Duration;

const DEFAULT_START_GRACE_MS: u64 = 500;
const DEFAULT_STOP_TERM_TIMEOUT_MS: u64 = 6_000;
const DEFAULT_STOP_KILL_TIMEOUT_MS: u64 = 4_000;
const DEFAULT_PROBE_INTERVAL_MS: u64 = 200;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_millis(name: &str, min: u64, max: u64, default: u64) -> Duration {
    Duration::from_millis(env_u64(name).map(|v| v.clamp(min, max)).unwrap_or(default))
}

/// Timing knobs for launching and stopping children.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunnerSettings {
    /// Delay between spawn and the first liveness probe.
    pub start_grace: Duration,
    /// How long to poll after SIGTERM before escalating.
    pub term_timeout: Duration,
    /// How long to poll after each SIGKILL round.
    pub kill_timeout: Duration,
    pub probe_interval: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            start_grace: Duration::from_millis(DEFAULT_START_GRACE_MS),
            term_timeout: Duration::from_millis(DEFAULT_STOP_TERM_TIMEOUT_MS),
            kill_timeout: Duration::from_millis(DEFAULT_STOP_KILL_TIMEOUT_MS),
            probe_interval: Duration::from_millis(DEFAULT_PROBE_INTERVAL_MS),
        }
    }
}

impl RunnerSettings {
    pub fn from_env() -> Self {
        Self {
            start_grace: env_millis("PROGD_START_GRACE_MS", 50, 10_000, DEFAULT_START_GRACE_MS),
            term_timeout: env_millis(
                "PROGD_STOP_TERM_TIMEOUT_MS",
                100,
                60_000,
                DEFAULT_STOP_TERM_TIMEOUT_MS,
            ),
            kill_timeout: env_millis(
                "PROGD_STOP_KILL_TIMEOUT_MS",
                100,
                60_000,
                DEFAULT_STOP_KILL_TIMEOUT_MS,
            ),
            probe_interval: env_millis(
                "PROGD_PROBE_INTERVAL_MS",
                10,
                2_000,
                DEFAULT_PROBE_INTERVAL_MS,
            ),
        }
    }
}
