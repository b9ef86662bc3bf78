//! DS maintenance toward the parent zone.
//!
//! `ds_check` compares the parent's DS set with our CDS; `ds_push` sends a
//! dynamic update replacing the parent-side DS set.  Both retry with a
//! fixed backoff on failure.

use std::sync::Arc;

use tracing::{info, warn};

use sluice_base::rrset::{Class, RRset, Rtype};
use sluice_base::Rdata;

use crate::config::Config;
use crate::dnssec::ds::CDS_DELETE;
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::util::unix_now;
use crate::zone::Zone;

/// The retry backoff for DS operations, in seconds.
const DS_PUSH_RETRY: u64 = 600;

/// The zone's CDS set, if it publishes one.
fn zone_cds(zone: &Arc<Zone>) -> Result<Option<RRset>> {
    let contents = zone.expect_contents()?;
    Ok(contents.rrset(&zone.name, Rtype::CDS).cloned())
}

/// Compare the parent-side DS set with our CDS.
pub fn event_ds_check(conf: &Arc<Config>, zone: &Arc<Zone>) -> Result<()> {
    let entry = conf.zone(&zone.name).ok_or(Error::NotFound)?;
    if entry.parents.is_empty() {
        return Ok(());
    }
    let Some(cds) = zone_cds(zone)? else {
        return Ok(());
    };
    let server = zone.server()?;
    let timeout = conf.remote.io_timeout();

    let mut all_match = true;
    for parent in &entry.parents {
        match server.remote.query_parent_ds(parent, &zone.name, timeout) {
            Ok(parent_ds) => {
                let missing = cds
                    .rdatas
                    .iter()
                    .filter(|rdata| rdata.as_slice() != CDS_DELETE)
                    .any(|rdata| !parent_ds.contains(rdata));
                if missing {
                    warn!(
                        "zone '{}': parent '{parent}' does not publish our DS yet",
                        zone.name
                    );
                    all_match = false;
                }
            }
            Err(err) => {
                warn!("zone '{}': DS check at '{parent}' failed ({err})", zone.name);
                all_match = false;
            }
        }
    }

    if all_match {
        info!("zone '{}': parent DS is up to date", zone.name);
    } else {
        // Check again after the backoff; an operator may also push.
        zone.events
            .schedule_at(&[(EventKind::DsCheck, Some(unix_now() + DS_PUSH_RETRY))]);
    }
    Ok(())
}

/// Push our CDS to the parent as its new DS set.
pub fn event_ds_push(conf: &Arc<Config>, zone: &Arc<Zone>) -> Result<()> {
    let entry = conf.zone(&zone.name).ok_or(Error::NotFound)?;
    if entry.parents.is_empty() {
        return Ok(());
    }
    let Some(cds) = zone_cds(zone)? else {
        return Ok(());
    };
    let server = zone.server()?;
    let timeout = conf.remote.io_timeout();

    // The all-zero CDS means "remove the DS"; otherwise the CDS RDATA is
    // the DS RDATA, carried with the DNSKEY TTL.
    let dnskey_ttl = zone
        .expect_contents()?
        .rrset(&zone.name, Rtype::DNSKEY)
        .map_or(cds.ttl, |set| set.ttl);
    let mut ds_set = RRset::new(zone.name.clone(), Rtype::DS, Class::IN, dnskey_ttl);
    for rdata in &cds.rdatas {
        if rdata.as_slice() != CDS_DELETE {
            ds_set.push(Rdata(rdata.0.clone()));
        }
    }
    ds_set.sort_canonical();

    for parent in &entry.parents {
        match server
            .remote
            .send_ds_update(parent, &zone.name, &ds_set, timeout)
        {
            Ok(()) => {
                info!(
                    "zone '{}': DS push to '{parent}' succeeded ({} records)",
                    zone.name,
                    ds_set.len()
                );
                zone.events.schedule_now(EventKind::DsCheck);
                return Ok(());
            }
            Err(err) => {
                warn!("zone '{}': DS push to '{parent}' failed ({err})", zone.name);
            }
        }
    }

    // No parent took the update; retry after the backoff.
    zone.events
        .schedule_at(&[(EventKind::DsPush, Some(unix_now() + DS_PUSH_RETRY))]);
    Ok(())
}
