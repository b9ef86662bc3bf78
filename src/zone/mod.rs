//! Zone-specific state and management.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use arc_swap::ArcSwapOption;
use camino::Utf8PathBuf;
use tracing::{debug, error};

use sluice_base::DomainName;
use sluice_base::rrset::{Rdata, Record, Rtype};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::ZoneEvents;
use crate::journal::Journal;
use crate::server::Server;

pub mod contents;
pub mod snapshot;
pub mod state;

pub use contents::ZoneContents;

//----------- ZoneTimers -------------------------------------------------------

/// The refresh/expire bookkeeping of a zone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ZoneTimers {
    /// When the zone was last refreshed from a primary.
    pub last_refresh: u64,

    /// When the next refresh is planned.
    pub next_refresh: u64,

    /// When the zone expires unless refreshed; 0 = never.
    pub next_expire: u64,

    /// When the zone was last flushed to its snapshot.
    pub last_flush: u64,

    /// The serial the secondaries were last notified about.
    pub last_notified_serial: Option<u32>,
}

//----------- Dynamic updates --------------------------------------------------

/// A prerequisite of a dynamic update (RFC 2136, section 2.4).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Prereq {
    /// A record set of this type exists at the name.
    RrsetExists(DomainName, Rtype),

    /// No record set of this type exists at the name.
    RrsetAbsent(DomainName, Rtype),

    /// The name owns at least one record.
    NameInUse(DomainName),

    /// The name owns no records.
    NameNotInUse(DomainName),
}

/// One operation of a dynamic update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOp {
    /// Add a record.
    Add(Record),

    /// Delete one specific record.
    DeleteRecord(DomainName, Rtype, Rdata),

    /// Delete a whole record set.
    DeleteRrset(DomainName, Rtype),

    /// Delete every record set at a name.
    DeleteName(DomainName),
}

/// A queued dynamic update.
#[derive(Clone, Debug, Default)]
pub struct UpdateRequest {
    pub prereqs: Vec<Prereq>,
    pub ops: Vec<UpdateOp>,
}

//----------- BackupRequest ----------------------------------------------------

/// A pending backup or restore, set up before the event is scheduled.
#[derive(Clone, Debug)]
pub struct BackupRequest {
    /// The backup directory.
    pub dir: Utf8PathBuf,

    /// Whether this is a restore from the directory.
    pub restore: bool,
}

//----------- Zone -------------------------------------------------------------

/// A zone.
#[derive(Debug)]
pub struct Zone {
    /// The name of this zone.
    pub name: DomainName,

    /// The published contents.
    ///
    /// Readers load a snapshot handle and keep it for the duration of one
    /// operation; writers build a new version and swap the pointer.  The
    /// replaced version is deep-freed when its last reader lets go.
    contents: ArcSwapOption<ZoneContents>,

    /// The event table of this zone.
    pub events: Arc<ZoneEvents>,

    /// The zone's journal handle.
    pub journal: Journal,

    /// Refresh/expire bookkeeping.
    pub timers: Mutex<ZoneTimers>,

    /// Queued dynamic updates, drained by the update event.
    pub ddns_queue: Mutex<Vec<UpdateRequest>>,

    /// A pending backup or restore request.
    pub backup_ctx: Mutex<Option<BackupRequest>>,

    /// Whether the next refresh must pull a full transfer.
    pub force_axfr: AtomicBool,

    /// Whether a snapshot file is expected on disk.
    pub snapshot_exists: AtomicBool,

    /// The server this zone belongs to.
    server: Weak<Server>,
}

impl Zone {
    /// Construct a new [`Zone`].
    pub fn new(name: DomainName, server: Weak<Server>, journal: Journal) -> Self {
        Self {
            events: Arc::new(ZoneEvents::new(name.clone())),
            name,
            contents: ArcSwapOption::empty(),
            journal,
            timers: Mutex::new(ZoneTimers::default()),
            ddns_queue: Mutex::new(Vec::new()),
            backup_ctx: Mutex::new(None),
            force_axfr: AtomicBool::new(false),
            snapshot_exists: AtomicBool::new(false),
            server,
        }
    }

    /// The server this zone belongs to.
    pub fn server(&self) -> Result<Arc<Server>> {
        self.server.upgrade().ok_or(Error::Fatal)
    }

    /// The currently published contents, if any.
    pub fn contents(&self) -> Option<Arc<ZoneContents>> {
        self.contents.load_full()
    }

    /// The published contents, or [`Error::NotFound`] for an empty zone.
    pub fn expect_contents(&self) -> Result<Arc<ZoneContents>> {
        self.contents().ok_or(Error::NotFound)
    }

    /// Publish a new version (or none), returning the previous one.
    ///
    /// The swap is the only synchronization between readers and writers;
    /// readers that loaded the old version keep it alive until they drop
    /// their handles.
    pub fn switch_contents(
        &self,
        new: Option<Arc<ZoneContents>>,
    ) -> Option<Arc<ZoneContents>> {
        self.contents.swap(new)
    }

    //--- Paths

    /// The snapshot file of this zone.
    pub fn snapshot_path(&self, config: &Config) -> Utf8PathBuf {
        config.daemon.zone_dir.join(format!("{}db", self.name))
    }

    /// The state file of this zone.
    pub fn state_path(&self, config: &Config) -> Utf8PathBuf {
        config.daemon.state_dir.join(format!("{}state.json", self.name))
    }

    /// The key file of this zone (within the key store directory).
    pub fn keys_path(&self, config: &Config) -> Utf8PathBuf {
        config.daemon.keys_dir.join(format!("{}keys.json", self.name))
    }

    //--- State persistence

    /// Load the persisted zone state, if present.
    pub fn load_state(&self, config: &Config) {
        match state::Spec::load(&self.state_path(config)) {
            Ok(Some(spec)) => {
                let mut timers = self.timers.lock().unwrap();
                spec.parse_into(&mut timers);
                self.snapshot_exists
                    .store(spec.snapshot_exists, Ordering::Relaxed);
                debug!("zone '{}': loaded state", self.name);
            }
            Ok(None) => {}
            Err(err) => {
                error!("zone '{}': cannot load state ({err})", self.name);
            }
        }
    }

    /// Persist the zone state.
    pub fn save_state(&self, config: &Config) {
        let spec = {
            let timers = self.timers.lock().unwrap();
            state::Spec::build(&timers, self.snapshot_exists.load(Ordering::Relaxed))
        };
        let path = self.state_path(config);
        if let Err(err) = spec.save(&path) {
            error!("zone '{}': cannot save state to '{path}' ({err})", self.name);
        }
    }

    /// Queue a dynamic update for the update event.
    pub fn queue_update(&self, request: UpdateRequest) {
        self.ddns_queue.lock().unwrap().push(request);
    }
}
