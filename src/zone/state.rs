//! Persisted zone state.
//!
//! The timers a zone needs across restarts are kept in a small JSON file,
//! one per zone.  Everything else about the zone is recoverable from the
//! snapshot and the journal.

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::write_file;

use super::ZoneTimers;

//----------- Spec -------------------------------------------------------------

/// The stored form of a zone's state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Spec {
    /// When the zone was last refreshed from a primary.
    #[serde(default)]
    pub last_refresh: u64,

    /// When the next refresh is planned.
    #[serde(default)]
    pub next_refresh: u64,

    /// When the zone expires unless refreshed.
    #[serde(default)]
    pub next_expire: u64,

    /// When the zone was last flushed to its snapshot.
    #[serde(default)]
    pub last_flush: u64,

    /// The serial the secondaries were last notified about.
    #[serde(default)]
    pub last_notified_serial: Option<u32>,

    /// Whether a snapshot file is expected to exist.
    #[serde(default)]
    pub snapshot_exists: bool,
}

impl Spec {
    /// Load the state file, if it exists.
    pub fn load(path: &Utf8Path) -> Result<Option<Self>> {
        match std::fs::read(path) {
            Ok(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|_| Error::Invalid),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Save the state file, atomically.
    pub fn save(&self, path: &Utf8Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self).map_err(|_| Error::Fatal)?;
        write_file(path, &data)?;
        Ok(())
    }

    /// Build the stored form from live timers.
    pub fn build(timers: &ZoneTimers, snapshot_exists: bool) -> Self {
        Self {
            last_refresh: timers.last_refresh,
            next_refresh: timers.next_refresh,
            next_expire: timers.next_expire,
            last_flush: timers.last_flush,
            last_notified_serial: timers.last_notified_serial,
            snapshot_exists,
        }
    }

    /// Merge the stored form into live timers.
    pub fn parse_into(&self, timers: &mut ZoneTimers) {
        timers.last_refresh = self.last_refresh;
        timers.next_refresh = self.next_refresh;
        timers.next_expire = self.next_expire;
        timers.last_flush = self.last_flush;
        timers.last_notified_serial = self.last_notified_serial;
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from(dir.path().to_str().unwrap()).join("z.state.json");

        assert!(Spec::load(&path).unwrap().is_none());

        let timers = ZoneTimers {
            last_refresh: 100,
            next_refresh: 200,
            next_expire: 300,
            last_flush: 50,
            last_notified_serial: Some(7),
        };
        Spec::build(&timers, true).save(&path).unwrap();

        let spec = Spec::load(&path).unwrap().unwrap();
        let mut restored = ZoneTimers::default();
        spec.parse_into(&mut restored);
        assert_eq!(restored, timers);
        assert!(spec.snapshot_exists);
    }
}
