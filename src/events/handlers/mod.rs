//! The zone event handlers.
//!
//! One handler per event kind, all with the same shape: a configuration
//! snapshot and the zone, a taxonomy error out.  Handlers run on worker
//! threads with no zone lock held; everything they publish goes through
//! the zone's pointer swap and the journal transaction.

use std::sync::Arc;

use sluice_base::Changeset;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::zone::Zone;

pub mod backup;
pub mod dnskey_sync;
pub mod dnssec;
pub mod ds;
pub mod expire;
pub mod flush;
pub mod freeze;
pub mod load;
pub mod notify;
pub mod refresh;
pub mod update;
pub mod validate;

/// Dispatch one event to its handler.
pub fn run(kind: EventKind, conf: &Arc<Config>, zone: &Arc<Zone>) -> Result<()> {
    match kind {
        EventKind::Load => load::event_load(conf, zone),
        EventKind::Refresh => refresh::event_refresh(conf, zone),
        EventKind::Update => update::event_update(conf, zone),
        EventKind::Expire => expire::event_expire(conf, zone),
        EventKind::Flush => flush::event_flush(conf, zone),
        EventKind::Backup => backup::event_backup(conf, zone),
        EventKind::Notify => notify::event_notify(conf, zone),
        EventKind::Dnssec => dnssec::event_dnssec(conf, zone),
        EventKind::Validate => validate::event_validate(conf, zone),
        EventKind::Ufreeze => freeze::event_ufreeze(conf, zone),
        EventKind::Uthaw => freeze::event_uthaw(conf, zone),
        EventKind::DsCheck => ds::event_ds_check(conf, zone),
        EventKind::DsPush => ds::event_ds_push(conf, zone),
        EventKind::DnskeySync => dnskey_sync::event_dnskey_sync(conf, zone),
    }
}

/// Store a changeset, riding out the journal's flush hand-off.
///
/// On [`Error::Busy`] the zone is flushed to its snapshot, the flush
/// horizon advanced, and the insert retried once.
pub(crate) fn store_changeset(
    conf: &Arc<Config>,
    zone: &Arc<Zone>,
    ch: &Changeset,
    extra: Option<&Changeset>,
) -> Result<()> {
    match zone.journal.insert(ch, extra) {
        Err(Error::Busy) => {
            flush::flush_now(conf, zone)?;
            zone.journal.insert(ch, extra)
        }
        other => other,
    }
}
