//! Session options and connection settings.
//!
//! [`Config`] mirrors the options stored server-side for the session. The
//! client only commits a new value after the server acknowledges the `SET`.
//! [`ClientSettings`] covers everything the server never sees: where to
//! connect, how to wait, where the bundled corpus lives.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PoliqarpError;

/// Default port of poliqarpd.
pub const DEFAULT_PORT: u16 = 4567;
/// Default number of segments in each short context.
pub const DEFAULT_CONTEXT_WIDTH: u32 = 5;
/// Default maximum number of results buffered per query.
pub const DEFAULT_BUFFER_CAPACITY: u64 = 500_000;
/// Default interval between `BUFFER-STATE` polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The four segment groups retrieval flags apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Group {
    LeftContext,
    LeftMatch,
    RightMatch,
    RightContext,
}

impl Group {
    /// All groups in wire order.
    pub const ALL: [Group; 4] = [
        Group::LeftContext,
        Group::LeftMatch,
        Group::RightMatch,
        Group::RightContext,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// One boolean per [`Group`].
///
/// Sent to the server as four `0`/`1` characters in group order, e.g.
/// `1001` for both contexts only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupFlags([bool; 4]);

impl GroupFlags {
    pub const NONE: GroupFlags = GroupFlags([false; 4]);
    pub const ALL: GroupFlags = GroupFlags([true; 4]);

    pub fn only(groups: &[Group]) -> Self {
        let mut flags = Self::NONE;
        for group in groups {
            flags.set(*group, true);
        }
        flags
    }

    pub fn get(&self, group: Group) -> bool {
        self.0[group.index()]
    }

    pub fn set(&mut self, group: Group, enabled: bool) {
        self.0[group.index()] = enabled;
    }

    pub fn with(mut self, group: Group, enabled: bool) -> Self {
        self.set(group, enabled);
        self
    }
}

impl fmt::Display for GroupFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for flag in self.0 {
            f.write_str(if flag { "1" } else { "0" })?;
        }
        Ok(())
    }
}

/// Width of a short context, always greater than zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextWidth(u32);

impl ContextWidth {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for ContextWidth {
    fn default() -> Self {
        ContextWidth(DEFAULT_CONTEXT_WIDTH)
    }
}

impl TryFrom<i64> for ContextWidth {
    type Error = PoliqarpError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match u32::try_from(value) {
            Ok(width) if width > 0 => Ok(ContextWidth(width)),
            _ => Err(PoliqarpError::InvalidConfig(format!(
                "context width must be an integer greater than 0, got {}",
                value
            ))),
        }
    }
}

impl FromStr for ContextWidth {
    type Err = PoliqarpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().parse::<i64>().map_err(|_| {
            PoliqarpError::InvalidConfig(format!(
                "context width must be an integer greater than 0, got {:?}",
                s
            ))
        })?;
        ContextWidth::try_from(value)
    }
}

impl fmt::Display for ContextWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Options of the current session as acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub left_context_width: ContextWidth,
    pub right_context_width: ContextWidth,
    pub tags: GroupFlags,
    pub lemmata: GroupFlags,
    /// Capacity used for jobs submitted from now on.
    pub buffer_capacity: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            left_context_width: ContextWidth::default(),
            right_context_width: ContextWidth::default(),
            tags: GroupFlags::NONE,
            lemmata: GroupFlags::NONE,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl Config {
    /// Whether a reading-count line follows each segment of `group`.
    pub fn retrieves_readings(&self, group: Group) -> bool {
        self.tags.get(group) || self.lemmata.get(group)
    }

    pub(crate) fn validate_capacity(capacity: u64) -> Result<u64, PoliqarpError> {
        if capacity == 0 {
            return Err(PoliqarpError::InvalidConfig(
                "buffer capacity must be greater than 0".to_string(),
            ));
        }
        Ok(capacity)
    }
}

/// Where and how to talk to poliqarpd.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub host: String,
    pub port: u16,
    /// Name sent with `MAKE-SESSION`.
    pub session_name: String,
    /// Interval between `BUFFER-STATE` polls while a job fills.
    pub poll_interval: Duration,
    /// Upper bound for any wait on a job milestone. `None` waits forever.
    pub wait_timeout: Option<Duration>,
    /// Location opened for [`CorpusPath::Default`](crate::CorpusPath::Default).
    pub default_corpus: Option<PathBuf>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            session_name: "RUST".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            wait_timeout: None,
            default_corpus: None,
        }
    }
}

impl ClientSettings {
    /// Settings from the environment, falling back to defaults.
    ///
    /// Resolution:
    /// 1. `POLIQARP_HOST`, `POLIQARP_PORT`, `POLIQARP_SESSION`
    /// 2. `POLIQARP_DEFAULT_CORPUS`, else `<data dir>/poliqarp/default`
    ///    when that directory exists
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Ok(host) = std::env::var("POLIQARP_HOST") {
            settings.host = host;
        }
        if let Ok(port) = std::env::var("POLIQARP_PORT") {
            match port.parse() {
                Ok(port) => settings.port = port,
                Err(_) => tracing::warn!("Ignoring invalid POLIQARP_PORT: {}", port),
            }
        }
        if let Ok(name) = std::env::var("POLIQARP_SESSION") {
            settings.session_name = name;
        }
        settings.default_corpus = std::env::var_os("POLIQARP_DEFAULT_CORPUS")
            .map(PathBuf::from)
            .or_else(bundled_corpus_path);

        settings
    }
}

/// Bundled corpus installed under the user data directory, if present.
pub fn bundled_corpus_path() -> Option<PathBuf> {
    let path = dirs::data_dir()?.join("poliqarp").join("default");
    if path.exists() {
        tracing::debug!("Found bundled corpus at {}", path.display());
        Some(path)
    } else {
        None
    }
}
