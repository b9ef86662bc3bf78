//! Control operations on zones.
//!
//! These are the entry points an external control surface calls into.
//! Each operation resolves a zone, drives its event table, and reports a
//! taxonomy error code.

use std::sync::Arc;

use camino::Utf8PathBuf;

use sluice_base::DomainName;

use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::server::Server;
use crate::zone::{BackupRequest, UpdateRequest, Zone};

//----------- ZoneStatus -------------------------------------------------------

/// A report on one zone.
#[derive(Clone, Debug)]
pub struct ZoneStatus {
    /// The zone name.
    pub name: DomainName,

    /// The served serial, if the zone has contents.
    pub serial: Option<u32>,

    /// Whether the zone is update-frozen.
    pub ufrozen: bool,

    /// The event being handled right now, if any.
    pub running: Option<EventKind>,

    /// Scheduled events and their times.
    pub scheduled: Vec<(EventKind, u64)>,
}

fn zone_of(server: &Server, name: &DomainName) -> Result<Arc<Zone>> {
    server.zone(name).ok_or(Error::NotFound)
}

/// Reload the zone from storage.
pub fn zone_load(server: &Server, name: &DomainName) -> Result<()> {
    zone_of(server, name)?.events.schedule_user(EventKind::Load);
    Ok(())
}

/// Refresh the zone from its primaries now.
pub fn zone_refresh(server: &Server, name: &DomainName) -> Result<()> {
    zone_of(server, name)?
        .events
        .schedule_user(EventKind::Refresh);
    Ok(())
}

/// Force a full transfer on the next refresh, and refresh now.
pub fn zone_retransfer(server: &Server, name: &DomainName) -> Result<()> {
    let zone = zone_of(server, name)?;
    zone.force_axfr
        .store(true, std::sync::atomic::Ordering::Relaxed);
    zone.events.schedule_user(EventKind::Refresh);
    Ok(())
}

/// Send NOTIFY to the configured secondaries now.
pub fn zone_notify(server: &Server, name: &DomainName) -> Result<()> {
    zone_of(server, name)?
        .events
        .schedule_user(EventKind::Notify);
    Ok(())
}

/// Flush the zone to its snapshot, waiting for the result.
pub fn zone_flush(server: &Server, name: &DomainName) -> Result<()> {
    zone_of(server, name)?
        .events
        .schedule_blocking(EventKind::Flush, true)
}

/// Back the zone up into a directory, waiting for the result.
pub fn zone_backup(server: &Server, name: &DomainName, dir: Utf8PathBuf) -> Result<()> {
    let zone = zone_of(server, name)?;
    *zone.backup_ctx.lock().unwrap() = Some(BackupRequest {
        dir,
        restore: false,
    });
    zone.events.schedule_blocking(EventKind::Backup, true)
}

/// Restore the zone from a backup directory, waiting for the result.
pub fn zone_restore(server: &Server, name: &DomainName, dir: Utf8PathBuf) -> Result<()> {
    let zone = zone_of(server, name)?;
    *zone.backup_ctx.lock().unwrap() = Some(BackupRequest { dir, restore: true });
    zone.events.schedule_blocking(EventKind::Backup, true)
}

/// Re-sign the zone now.
pub fn zone_sign(server: &Server, name: &DomainName) -> Result<()> {
    zone_of(server, name)?
        .events
        .schedule_user(EventKind::Dnssec);
    Ok(())
}

/// Submit the zone's DS to the parent now.
pub fn zone_ksk_submit(server: &Server, name: &DomainName) -> Result<()> {
    zone_of(server, name)?
        .events
        .schedule_user(EventKind::DsPush);
    Ok(())
}

/// Freeze zone updates (an operator update session begins).
pub fn zone_freeze(server: &Server, name: &DomainName) -> Result<()> {
    zone_of(server, name)?
        .events
        .schedule_user(EventKind::Ufreeze);
    Ok(())
}

/// Thaw zone updates; accumulated events fire in time order.
pub fn zone_thaw(server: &Server, name: &DomainName) -> Result<()> {
    zone_of(server, name)?.events.schedule_user(EventKind::Uthaw);
    Ok(())
}

/// Queue a dynamic update and schedule its application.
pub fn zone_update(server: &Server, name: &DomainName, request: UpdateRequest) -> Result<()> {
    let zone = zone_of(server, name)?;
    zone.queue_update(request);
    zone.events.enqueue(EventKind::Update);
    Ok(())
}

/// Report the zone's serial, freeze state and event schedule.
pub fn zone_status(server: &Server, name: &DomainName) -> Result<ZoneStatus> {
    let zone = zone_of(server, name)?;
    let mut scheduled = Vec::new();
    for kind in EventKind::ALL {
        if let Some(time) = zone.events.time_of(kind) {
            scheduled.push((kind, time));
        }
    }
    Ok(ZoneStatus {
        name: zone.name.clone(),
        serial: zone.contents().map(|c| c.serial()),
        ufrozen: zone.events.is_ufrozen(),
        running: zone.events.running_kind(),
        scheduled,
    })
}
