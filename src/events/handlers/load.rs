//! The load event: bring a zone's contents up from storage.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{info, warn};

use crate::config::{Config, ZoneConfig, ZoneRole};
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::util::unix_now;
use crate::zone::{Zone, ZoneContents, snapshot};

/// Load a zone from its snapshot and journal, publish it, and plan the
/// follow-up events.
pub fn event_load(conf: &Arc<Config>, zone: &Arc<Zone>) -> Result<()> {
    let entry = conf.zone(&zone.name).ok_or(Error::NotFound)?;

    // The snapshot is the fastest starting point; failing that, a baseline
    // stored in the journal serves.
    let mut contents = match snapshot::load(&zone.snapshot_path(conf)) {
        Ok(contents) => contents,
        Err(err) => {
            warn!("zone '{}': unusable snapshot ({err})", zone.name);
            None
        }
    };
    if contents.is_some() {
        zone.snapshot_exists.store(true, Ordering::Relaxed);
    } else if let Some(baseline) = zone.journal.baseline()? {
        contents = Some(ZoneContents::from_baseline(&baseline)?);
    }

    let mut contents = match contents {
        Some(contents) => contents,
        None if entry.role == ZoneRole::Secondary => {
            // Nothing stored yet; bootstrap over a transfer.
            info!("zone '{}': no stored data, awaiting transfer", zone.name);
            zone.events.schedule_now(EventKind::Refresh);
            return Ok(());
        }
        None => return Err(Error::NotFound),
    };

    // Roll forward whatever the journal has beyond the stored version.
    match zone.journal.changesets_from(contents.serial()) {
        Ok(chain) => {
            for ch in &chain {
                contents = contents.apply(ch)?;
            }
        }
        // An empty or unrelated journal just means nothing to roll forward.
        Err(Error::NotFound) => {}
        Err(err) => return Err(err),
    }

    info!(
        "zone '{}': loaded, serial {}, {} bytes",
        zone.name,
        contents.serial(),
        contents.size()
    );
    let soa = contents.soa_fields()?;
    zone.switch_contents(Some(Arc::new(contents)));

    plan_after_load(conf, zone, entry, &soa);
    Ok(())
}

/// Plan the events that follow a successful load.
fn plan_after_load(
    conf: &Arc<Config>,
    zone: &Arc<Zone>,
    entry: &ZoneConfig,
    soa: &sluice_base::rrset::SoaFields,
) {
    let now = unix_now();
    let mut plan: Vec<(EventKind, Option<u64>)> = Vec::new();

    if entry.policy.is_some() {
        plan.push((EventKind::Dnssec, Some(now)));
    }
    if !entry.secondaries.is_empty() {
        plan.push((EventKind::Notify, Some(now)));
    }
    if entry.role == ZoneRole::Secondary {
        let timers = zone.timers.lock().unwrap();
        let refresh_at = if timers.next_refresh != 0 {
            timers.next_refresh
        } else {
            now + soa.refresh as u64
        };
        let expire_at = if timers.next_expire != 0 {
            timers.next_expire
        } else {
            now + soa.expire as u64
        };
        plan.push((EventKind::Refresh, None));
        plan.push((EventKind::Refresh, Some(refresh_at)));
        plan.push((EventKind::Expire, None));
        plan.push((EventKind::Expire, Some(expire_at)));
    }

    zone.events.schedule_at(&plan);
}
