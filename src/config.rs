//! Configuration for Sluice.
//!
//! The configuration is parsed from a TOML file into [`Config`] and then
//! published as a whole behind an [`arc_swap::ArcSwap`]; see
//! [`crate::server::Server`].  Event handlers clone the current snapshot
//! once and read only that snapshot for their entire run, so a concurrent
//! reconfiguration can never change a handler's view midway.

use std::fmt;
use std::fs;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use sluice_base::DomainName;

//----------- Config -----------------------------------------------------------

/// The Sluice configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Daemon-wide settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,

    /// Journal settings.
    #[serde(default)]
    pub journal: JournalConfig,

    /// Remote I/O settings.
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Signing policies, by name.
    #[serde(default, rename = "policy")]
    pub policies: Vec<Policy>,

    /// The served zones.
    #[serde(default, rename = "zone")]
    pub zones: Vec<ZoneConfig>,
}

impl Config {
    /// Load the configuration from a TOML file.
    pub fn load(path: &camino::Utf8Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_owned(), e))?;
        let config: Self =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(path.to_owned(), e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Verify cross-references within the configuration.
    fn check(&self) -> Result<(), ConfigError> {
        for zone in &self.zones {
            if let Some(policy) = &zone.policy
                && self.policy(policy).is_none()
            {
                return Err(ConfigError::NoSuchPolicy(
                    zone.name.clone(),
                    policy.clone(),
                ));
            }
            if zone.role == ZoneRole::Secondary && zone.primaries.is_empty() {
                return Err(ConfigError::NoPrimaries(zone.name.clone()));
            }
        }
        Ok(())
    }

    /// Look up a policy by name.
    pub fn policy(&self, name: &str) -> Option<&Policy> {
        self.policies.iter().find(|p| &*p.name == name)
    }

    /// Look up a zone entry by name.
    pub fn zone(&self, name: &DomainName) -> Option<&ZoneConfig> {
        self.zones.iter().find(|z| &z.name == name)
    }

    /// The policy configured for a zone, if any.
    pub fn zone_policy(&self, name: &DomainName) -> Option<&Policy> {
        self.zone(name)?.policy.as_deref().and_then(|p| self.policy(p))
    }
}

//----------- DaemonConfig -----------------------------------------------------

/// Daemon-wide settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// The directory holding per-zone state files.
    pub state_dir: Utf8PathBuf,

    /// The directory holding zone snapshots.
    pub zone_dir: Utf8PathBuf,

    /// The journal database directory.
    pub journal_db: Utf8PathBuf,

    /// The directory holding signing keys.
    pub keys_dir: Utf8PathBuf,

    /// The number of zone event worker threads.
    pub workers: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: "/var/lib/sluice/state".into(),
            zone_dir: "/var/lib/sluice/zones".into(),
            journal_db: "/var/lib/sluice/journal".into(),
            keys_dir: "/var/lib/sluice/keys".into(),
            workers: 4,
        }
    }
}

//----------- LogConfig --------------------------------------------------------

/// Logging settings.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// The minimum level to log at.
    #[serde(default)]
    pub level: LogLevel,

    /// Where log output goes.
    #[serde(default)]
    pub target: LogTarget,
}

/// A minimum log level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

/// A log output target: "stdout", "stderr", or a file path.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct LogTarget(pub String);

impl Default for LogTarget {
    fn default() -> Self {
        Self("stdout".into())
    }
}

//----------- JournalConfig ----------------------------------------------------

/// Journal settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct JournalConfig {
    /// The most bytes one zone may occupy in the journal.
    pub max_usage: u64,

    /// The most changesets one zone may keep in the journal.
    pub max_changesets: usize,

    /// Whether zones may be flushed to their snapshot files.
    ///
    /// When disabled, the journal holds a whole-zone baseline instead and
    /// merges old changesets into it under occupancy pressure.
    pub zonefile_sync: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            max_usage: 100 * 1024 * 1024,
            max_changesets: 20,
            zonefile_sync: true,
        }
    }
}

//----------- RemoteConfig -----------------------------------------------------

/// Remote I/O settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteConfig {
    /// The per-operation timeout for remote I/O, in seconds.
    pub io_timeout: u64,
}

impl RemoteConfig {
    /// The per-operation timeout as a [`Duration`].
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self { io_timeout: 10 }
    }
}

//----------- Policy -----------------------------------------------------------

/// A signing policy.
///
/// A policy is a named template shared by any number of zones.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    /// The name of this policy.
    pub name: Box<str>,

    /// The DNSSEC algorithm number for new keys.
    #[serde(default = "default_algorithm")]
    pub algorithm: u8,

    /// How long signatures remain valid, in seconds.
    #[serde(default = "default_rrsig_lifetime")]
    pub rrsig_lifetime: u32,

    /// How long before expiration signatures are refreshed, in seconds.
    #[serde(default = "default_rrsig_refresh")]
    pub rrsig_refresh_before: u32,

    /// The TTL of the DNSKEY record set.
    #[serde(default = "default_dnskey_ttl")]
    pub dnskey_ttl: u32,

    /// Whether to use reproducible signatures where the algorithm allows.
    #[serde(default)]
    pub reproducible_sign: bool,

    /// Accept expired signatures during validation.
    ///
    /// For debugging and disaster recovery only.
    #[serde(default)]
    pub unsafe_expired: bool,
}

fn default_algorithm() -> u8 {
    // ED25519
    15
}

fn default_rrsig_lifetime() -> u32 {
    14 * 24 * 3600
}

fn default_rrsig_refresh() -> u32 {
    7 * 24 * 3600
}

fn default_dnskey_ttl() -> u32 {
    3600
}

//----------- ZoneConfig -------------------------------------------------------

/// The role of a zone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneRole {
    /// The zone is authored here.
    #[default]
    Primary,

    /// The zone is transferred in from primaries.
    Secondary,
}

/// Configuration of a single zone.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ZoneConfig {
    /// The zone name.
    pub name: DomainName,

    /// The role of this zone.
    #[serde(default)]
    pub role: ZoneRole,

    /// The signing policy, by name.
    ///
    /// Zones without a policy are served unsigned.
    #[serde(default)]
    pub policy: Option<Box<str>>,

    /// The primaries to transfer this zone from (secondary role).
    #[serde(default)]
    pub primaries: Vec<String>,

    /// The secondaries to send NOTIFY to.
    #[serde(default)]
    pub secondaries: Vec<String>,

    /// The parent-side servers for DS maintenance.
    #[serde(default)]
    pub parents: Vec<String>,

    /// The endpoints to synchronize DNSKEY records to.
    #[serde(default)]
    pub dnskey_sync: Vec<String>,
}

//----------- ConfigError ------------------------------------------------------

/// An error in loading the configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read.
    Io(Utf8PathBuf, io::Error),

    /// The file could not be parsed.
    Parse(Utf8PathBuf, String),

    /// A zone references an unknown policy.
    NoSuchPolicy(DomainName, Box<str>),

    /// A secondary zone has no primaries.
    NoPrimaries(DomainName),
}

impl std::error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(path, err) => write!(f, "cannot read '{path}': {err}"),
            Self::Parse(path, err) => write!(f, "cannot parse '{path}': {err}"),
            Self::NoSuchPolicy(zone, policy) => {
                write!(f, "zone '{zone}' references unknown policy '{policy}'")
            }
            Self::NoPrimaries(zone) => {
                write!(f, "secondary zone '{zone}' has no primaries configured")
            }
        }
    }
}

/// A shared snapshot of the configuration.
pub type ConfigSnapshot = Arc<Config>;

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        let config: Config = toml::from_str(
            r#"
            [daemon]
            state_dir = "/tmp/sluice/state"
            zone_dir = "/tmp/sluice/zones"
            journal_db = "/tmp/sluice/journal"
            keys_dir = "/tmp/sluice/keys"
            workers = 2

            [journal]
            max_usage = 1048576
            max_changesets = 4
            zonefile_sync = false

            [[policy]]
            name = "default"
            rrsig_lifetime = 86400
            rrsig_refresh_before = 3600

            [[zone]]
            name = "example.com"
            role = "secondary"
            policy = "default"
            primaries = ["192.0.2.1:53"]
            "#,
        )
        .unwrap();
        config.check().unwrap();

        let name: DomainName = "example.com.".parse().unwrap();
        let zone = config.zone(&name).unwrap();
        assert_eq!(zone.role, ZoneRole::Secondary);
        let policy = config.zone_policy(&name).unwrap();
        assert_eq!(policy.rrsig_lifetime, 86400);
        assert_eq!(policy.algorithm, 15);
    }

    #[test]
    fn rejects_dangling_policy() {
        let config: Config = toml::from_str(
            r#"
            [[zone]]
            name = "example.com"
            policy = "nonexistent"
            "#,
        )
        .unwrap();
        assert!(matches!(config.check(), Err(ConfigError::NoSuchPolicy(..))));
    }
}
