use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use dotenvy::dotenv;

/// How often a waiting user refreshes `lastSeen`.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Idle time after which a ticket is a ghost (three missed heartbeats).
pub const GHOST_THRESHOLD: Duration = Duration::from_secs(15);

/// Maximum number of tickets a single scan looks at.
pub const SCAN_WINDOW: usize = 10;

/// Delay between observing an ended session and returning to idle.
pub const ENDED_GRACE: Duration = Duration::from_secs(3);

/// How a sent message is written to the session document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppendMode {
    /// Write back the sender's last-known full sequence plus the new message.
    /// Two near-simultaneous senders can overwrite each other.
    #[default]
    ReadModifyWrite,
    /// Ask the store to append atomically. Only for stores that support it.
    Atomic,
}

impl FromStr for AppendMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read_modify_write" | "rmw" => Ok(AppendMode::ReadModifyWrite),
            "atomic" => Ok(AppendMode::Atomic),
            other => bail!("unknown append mode '{}'", other),
        }
    }
}

/// Matchmaking and session timing configuration.
#[derive(Debug, Clone)]
pub struct MatchConfig {
    pub heartbeat_interval: Duration,
    pub ghost_threshold: Duration,
    pub scan_window: usize,
    pub ended_grace: Duration,
    pub append_mode: AppendMode,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            ghost_threshold: GHOST_THRESHOLD,
            scan_window: SCAN_WINDOW,
            ended_grace: ENDED_GRACE,
            append_mode: AppendMode::default(),
        }
    }
}

impl MatchConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset.
    ///
    /// Reads `MATCHROOM_HEARTBEAT_SECS`, `MATCHROOM_GHOST_THRESHOLD_SECS`,
    /// `MATCHROOM_SCAN_WINDOW`, `MATCHROOM_ENDED_GRACE_SECS` and
    /// `MATCHROOM_APPEND_MODE`.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_vars(|name| env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            heartbeat_interval: secs_var(&lookup, "MATCHROOM_HEARTBEAT_SECS")?
                .unwrap_or(defaults.heartbeat_interval),
            ghost_threshold: secs_var(&lookup, "MATCHROOM_GHOST_THRESHOLD_SECS")?
                .unwrap_or(defaults.ghost_threshold),
            scan_window: lookup("MATCHROOM_SCAN_WINDOW")
                .map(|v| v.parse::<usize>())
                .transpose()
                .context("MATCHROOM_SCAN_WINDOW must be a positive integer")?
                .unwrap_or(defaults.scan_window),
            ended_grace: secs_var(&lookup, "MATCHROOM_ENDED_GRACE_SECS")?
                .unwrap_or(defaults.ended_grace),
            append_mode: lookup("MATCHROOM_APPEND_MODE")
                .map(|v| v.parse::<AppendMode>())
                .transpose()
                .context("MATCHROOM_APPEND_MODE must be 'read_modify_write' or 'atomic'")?
                .unwrap_or(defaults.append_mode),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the protocol cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.scan_window > 0, "scan window must be at least 1");
        ensure!(
            !self.heartbeat_interval.is_zero(),
            "heartbeat interval must be non-zero"
        );
        ensure!(
            self.ghost_threshold > self.heartbeat_interval,
            "ghost threshold ({:?}) must exceed the heartbeat interval ({:?})",
            self.ghost_threshold,
            self.heartbeat_interval
        );
        Ok(())
    }
}

fn secs_var<F>(lookup: &F, name: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| {
            v.parse::<u64>()
                .with_context(|| format!("{} must be a number of seconds", name))
        })
        .transpose()
        .map(|secs| secs.map(Duration::from_secs))
}
