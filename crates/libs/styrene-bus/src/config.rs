use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::buffer::Endianness;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EndiannessSetting {
    Little,
    Big,
    #[default]
    Native,
}

impl EndiannessSetting {
    pub fn resolve(self) -> Endianness {
        match self {
            Self::Little => Endianness::Little,
            Self::Big => Endianness::Big,
            Self::Native => Endianness::native(),
        }
    }
}

/// Codec tuning, loaded from TOML.
///
/// ```toml
/// pedantic = true
/// check_sender = true
/// outbound_endianness = "big"
/// pull_timeout_base_ms = 20000
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CodecConfig {
    /// Validate name grammars on inbound headers.
    pub pedantic: bool,
    /// Cross-check the sender field against the transport endpoint name.
    pub check_sender: bool,
    /// Fail header decode for messages whose time-to-live has elapsed.
    pub reject_expired: bool,
    pub outbound_endianness: EndiannessSetting,
    pub pull_timeout_base_ms: u64,
    /// Largest single read requested from a source.
    pub max_pull: usize,
    /// Authentication version handed to the body cipher when the peer's
    /// capability is unknown, as for broadcast signals.
    pub fallback_auth_version: u32,
}

pub const DEFAULT_PULL_TIMEOUT_BASE_MS: u64 = 20_000;
pub const DEFAULT_MAX_PULL: usize = 128 * 1024;

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            pedantic: true,
            check_sender: true,
            reject_expired: false,
            outbound_endianness: EndiannessSetting::Native,
            pull_timeout_base_ms: DEFAULT_PULL_TIMEOUT_BASE_MS,
            max_pull: DEFAULT_MAX_PULL,
            fallback_auth_version: 0,
        }
    }
}

impl CodecConfig {
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        let config: Self = toml::from_str(input)?;
        if config.max_pull == 0 {
            return Err(serde::de::Error::custom("max_pull must be at least 1"));
        }
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    /// Per-pull timeout: the base plus half a millisecond per outstanding byte.
    pub fn pull_timeout(&self, remaining: usize) -> Duration {
        Duration::from_millis(self.pull_timeout_base_ms + (remaining / 2) as u64)
    }

    pub fn endianness(&self) -> Endianness {
        self.outbound_endianness.resolve()
    }
}
