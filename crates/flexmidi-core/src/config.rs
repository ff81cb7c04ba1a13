//! Configuration system for flexmidi.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FLEXMIDI_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/flexmidi/config.toml
//!   3. ~/.config/flexmidi/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire::{
    ANNOUNCE_INTERVAL_SECS, DEFAULT_MTU, DISCOVERY_MULTICAST_ADDR, DISCOVERY_PORT,
    PEER_TTL_SECS, PROTOCOL_VERSION,
};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlexConfig {
    pub session: SessionConfig,
    pub discovery: DiscoveryConfig,
    pub reliability: ReliabilityConfig,
    pub bridge: BridgeConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Instance name carried in discovery announcements.
    pub local_name: String,
    /// Local UDP address. Port 0 = OS-assigned.
    pub bind_addr: String,
    /// Remote session address. Empty = use discovery, else self-loopback.
    pub peer_addr: String,
    pub mtu: usize,
    pub enable_discovery: bool,
    pub enable_negotiation: bool,
    pub negotiation_timeout_ms: u64,
    /// Fail `open()` instead of proceeding unnegotiated on timeout.
    pub require_negotiation: bool,
    pub protocol_version: u8,
    pub group: u8,
    pub channel: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub multicast_addr: String,
    pub port: u16,
    pub announce_interval_secs: u64,
    pub peer_ttl_secs: u64,
    /// How long `open()` waits for a discovered peer before falling back.
    pub discovery_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    pub replay_window_ms: u64,
    pub max_replay_entries: usize,
    /// Resend buffer capacity in keys.
    pub max_buffered: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Journal directory. Empty = in-memory journal.
    pub journal_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// `data` longer than this is split into fragments.
    pub max_fragment_bytes: usize,
    /// Cumulative ack after this many delivered events.
    pub ack_every: u64,
    /// Out-of-order events held before the gap is skipped.
    pub max_reorder: usize,
    /// Largest `frag.n` a receiver accepts for one event.
    pub max_fragments: u32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_name: "flexmidi".to_string(),
            bind_addr: "0.0.0.0:5004".to_string(),
            peer_addr: String::new(),
            mtu: DEFAULT_MTU,
            enable_discovery: true,
            enable_negotiation: true,
            negotiation_timeout_ms: 2000,
            require_negotiation: false,
            protocol_version: PROTOCOL_VERSION,
            group: 0,
            channel: 0,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_addr: DISCOVERY_MULTICAST_ADDR.to_string(),
            port: DISCOVERY_PORT,
            announce_interval_secs: ANNOUNCE_INTERVAL_SECS,
            peer_ttl_secs: PEER_TTL_SECS,
            discovery_wait_ms: 1500,
        }
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            replay_window_ms: 60_000,
            max_replay_entries: 100_000,
            max_buffered: 512,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            journal_dir: data_dir().join("journal"),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_fragment_bytes: 256,
            ack_every: 16,
            max_reorder: 64,
            max_fragments: 1024,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("flexmidi")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("flexmidi")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid value for {0}: {1:?}")]
    InvalidValue(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FlexConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a config file, or defaults if it does not exist.
    pub fn load_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(FlexConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FLEXMIDI_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &std::path::Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&FlexConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply FLEXMIDI_<SECTION>__<FIELD> overrides. `lookup` is the variable
    /// source so tests need not touch the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        macro_rules! string {
            ($key:literal, $field:expr) => {
                if let Some(v) = lookup($key) {
                    $field = v;
                }
            };
        }
        macro_rules! parsed {
            ($key:literal, $field:expr) => {
                if let Some(v) = lookup($key) {
                    $field = v
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue($key, v.clone()))?;
                }
            };
        }
        macro_rules! flag {
            ($key:literal, $field:expr) => {
                if let Some(v) = lookup($key) {
                    $field = v == "true" || v == "1";
                }
            };
        }

        string!("FLEXMIDI_SESSION__LOCAL_NAME", self.session.local_name);
        string!("FLEXMIDI_SESSION__BIND_ADDR", self.session.bind_addr);
        string!("FLEXMIDI_SESSION__PEER_ADDR", self.session.peer_addr);
        parsed!("FLEXMIDI_SESSION__MTU", self.session.mtu);
        flag!("FLEXMIDI_SESSION__ENABLE_DISCOVERY", self.session.enable_discovery);
        flag!("FLEXMIDI_SESSION__ENABLE_NEGOTIATION", self.session.enable_negotiation);
        parsed!("FLEXMIDI_SESSION__NEGOTIATION_TIMEOUT_MS", self.session.negotiation_timeout_ms);
        flag!("FLEXMIDI_SESSION__REQUIRE_NEGOTIATION", self.session.require_negotiation);
        parsed!("FLEXMIDI_SESSION__PROTOCOL_VERSION", self.session.protocol_version);
        parsed!("FLEXMIDI_SESSION__GROUP", self.session.group);
        parsed!("FLEXMIDI_SESSION__CHANNEL", self.session.channel);

        string!("FLEXMIDI_DISCOVERY__MULTICAST_ADDR", self.discovery.multicast_addr);
        parsed!("FLEXMIDI_DISCOVERY__PORT", self.discovery.port);
        parsed!("FLEXMIDI_DISCOVERY__ANNOUNCE_INTERVAL_SECS", self.discovery.announce_interval_secs);
        parsed!("FLEXMIDI_DISCOVERY__PEER_TTL_SECS", self.discovery.peer_ttl_secs);
        parsed!("FLEXMIDI_DISCOVERY__DISCOVERY_WAIT_MS", self.discovery.discovery_wait_ms);

        parsed!("FLEXMIDI_RELIABILITY__REPLAY_WINDOW_MS", self.reliability.replay_window_ms);
        parsed!("FLEXMIDI_RELIABILITY__MAX_REPLAY_ENTRIES", self.reliability.max_replay_entries);
        parsed!("FLEXMIDI_RELIABILITY__MAX_BUFFERED", self.reliability.max_buffered);

        if let Some(v) = lookup("FLEXMIDI_BRIDGE__JOURNAL_DIR") {
            self.bridge.journal_dir = PathBuf::from(v);
        }

        parsed!("FLEXMIDI_STREAM__MAX_FRAGMENT_BYTES", self.stream.max_fragment_bytes);
        parsed!("FLEXMIDI_STREAM__ACK_EVERY", self.stream.ack_every);
        parsed!("FLEXMIDI_STREAM__MAX_REORDER", self.stream.max_reorder);
        parsed!("FLEXMIDI_STREAM__MAX_FRAGMENTS", self.stream.max_fragments);
        Ok(())
    }
}
