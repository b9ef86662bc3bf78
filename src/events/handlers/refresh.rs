//! The refresh event: keep a secondary in step with its primaries.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use sluice_base::rrset::SoaFields;
use sluice_base::serial::serial_leq;

use crate::config::{Config, ZoneRole};
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::remote::Transfer;
use crate::util::unix_now;
use crate::zone::{Zone, ZoneContents};

use super::store_changeset;

/// The refresh retry delay when no SOA is available to consult.
const RETRY_FALLBACK: u64 = 300;

/// Probe the primaries and transfer the zone when it moved on.
pub fn event_refresh(conf: &Arc<Config>, zone: &Arc<Zone>) -> Result<()> {
    let entry = conf.zone(&zone.name).ok_or(Error::NotFound)?;
    if entry.role != ZoneRole::Secondary {
        return Ok(());
    }

    let force_axfr = zone.force_axfr.swap(false, Ordering::Relaxed);
    let mut last_err = Error::Timeout;
    for primary in &entry.primaries {
        match try_refresh(conf, zone, primary, force_axfr) {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!("zone '{}': refresh from '{primary}' failed ({err})", zone.name);
                last_err = err;
            }
        }
    }

    // Every primary failed; retry at the SOA retry interval.
    let retry = zone
        .contents()
        .and_then(|c| c.soa_fields().ok())
        .map_or(RETRY_FALLBACK, |soa| soa.retry as u64);
    zone.events
        .schedule_at(&[(EventKind::Refresh, Some(unix_now() + retry))]);
    Err(last_err)
}

fn try_refresh(
    conf: &Arc<Config>,
    zone: &Arc<Zone>,
    primary: &str,
    force_axfr: bool,
) -> Result<()> {
    let server = zone.server()?;
    let timeout = conf.remote.io_timeout();
    let current = zone.contents();

    let remote_serial = server.remote.probe_soa(primary, &zone.name, timeout)?;
    if let Some(current) = &current
        && !force_axfr
        && serial_leq(remote_serial, current.serial())
    {
        debug!(
            "zone '{}': up to date (serial {}, primary has {remote_serial})",
            zone.name,
            current.serial()
        );
        return finish_refresh(conf, zone, &current.soa_fields()?, false);
    }

    let base_serial = if force_axfr {
        None
    } else {
        current.as_ref().map(|c| c.serial())
    };
    let new = match server.remote.transfer(primary, &zone.name, base_serial, timeout)? {
        Transfer::Full(records) => {
            let contents = Arc::new(ZoneContents::from_records(zone.name.clone(), records)?);
            // A full transfer reseeds the journal with a baseline; losing
            // the journal is not worth losing the transfer, though.
            if let Err(err) = zone.journal.insert_zone(&contents.to_baseline()) {
                warn!("zone '{}': cannot journal transferred zone ({err})", zone.name);
            }
            info!(
                "zone '{}': full transfer from '{primary}', serial {}",
                zone.name,
                contents.serial()
            );
            contents
        }
        Transfer::Incremental(chain) => {
            let mut contents = current.ok_or(Error::Invalid)?;
            for ch in &chain {
                store_changeset(conf, zone, ch, None)?;
                contents = Arc::new(contents.apply(ch)?);
            }
            info!(
                "zone '{}': incremental transfer from '{primary}', {} changesets, serial {}",
                zone.name,
                chain.len(),
                contents.serial()
            );
            contents
        }
    };

    let soa = new.soa_fields()?;
    zone.switch_contents(Some(new));
    finish_refresh(conf, zone, &soa, true)
}

/// Update the refresh timers and plan the follow-up events.
fn finish_refresh(
    conf: &Arc<Config>,
    zone: &Arc<Zone>,
    soa: &SoaFields,
    changed: bool,
) -> Result<()> {
    let entry = conf.zone(&zone.name).ok_or(Error::NotFound)?;
    let now = unix_now();
    {
        let mut timers = zone.timers.lock().unwrap();
        timers.last_refresh = now;
        timers.next_refresh = now + soa.refresh as u64;
        timers.next_expire = now + soa.expire as u64;
    }
    zone.save_state(conf);

    // Timer events move *later* after a successful refresh; unschedule
    // before setting, since a bare set only ever moves a slot earlier.
    let mut plan = vec![
        (EventKind::Refresh, None),
        (EventKind::Refresh, Some(now + soa.refresh as u64)),
        (EventKind::Expire, None),
        (EventKind::Expire, Some(now + soa.expire as u64)),
    ];
    if changed {
        if !entry.secondaries.is_empty() {
            plan.push((EventKind::Notify, Some(now)));
        }
        if entry.policy.is_some() {
            plan.push((EventKind::Dnssec, Some(now)));
        }
    }
    zone.events.schedule_at(&plan);
    Ok(())
}
