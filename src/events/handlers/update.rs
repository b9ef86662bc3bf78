//! The update event: apply queued dynamic updates.

use std::sync::Arc;

use tracing::{info, warn};

use sluice_base::rrset::{Record, Rtype};
use sluice_base::serial::serial_add;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::util::unix_now;
use crate::zone::contents::ZoneContents;
use crate::zone::{Prereq, UpdateOp, UpdateRequest, Zone};

use super::store_changeset;

/// Drain the zone's update queue into one new zone version.
///
/// Requests whose prerequisites fail are skipped individually; the rest
/// are folded into a single changeset with a bumped serial.
pub fn event_update(conf: &Arc<Config>, zone: &Arc<Zone>) -> Result<()> {
    let requests = std::mem::take(&mut *zone.ddns_queue.lock().unwrap());
    if requests.is_empty() {
        return Ok(());
    }

    let old = zone.expect_contents()?;
    let mut builder = old.to_builder();
    let mut applied = 0;

    for request in &requests {
        if let Err(err) = check_prereqs(&old, request) {
            warn!(
                "zone '{}': dynamic update prerequisite not satisfied ({err})",
                zone.name
            );
            continue;
        }
        for op in &request.ops {
            apply_op(zone, &mut builder, op);
        }
        applied += 1;
    }

    if applied == 0 {
        return Err(Error::Denied);
    }

    // Bump the serial so the change is visible downstream.
    let mut soa = old.soa_fields()?;
    soa.serial = serial_add(soa.serial, 1);
    let soa_record = Record::new(
        zone.name.clone(),
        Rtype::SOA,
        old.soa().class,
        old.soa().ttl,
        soa.to_rdata(),
    );
    builder.set_soa(soa_record)?;

    let new = Arc::new(builder.finish()?);
    let ch = old.diff(&new);
    if ch.is_empty() {
        info!("zone '{}': dynamic updates changed nothing", zone.name);
        return Ok(());
    }

    store_changeset(conf, zone, &ch, None)?;
    zone.switch_contents(Some(new));

    info!(
        "zone '{}': applied {applied} dynamic updates, serial {}",
        zone.name, soa.serial
    );

    let now = unix_now();
    let entry = conf.zone(&zone.name);
    let mut plan: Vec<(EventKind, Option<u64>)> = Vec::new();
    if entry.is_some_and(|e| e.policy.is_some()) {
        plan.push((EventKind::Dnssec, Some(now)));
    }
    if entry.is_some_and(|e| !e.secondaries.is_empty()) {
        plan.push((EventKind::Notify, Some(now)));
    }
    zone.events.schedule_at(&plan);
    Ok(())
}

/// Check a request's prerequisites against the pre-update version.
fn check_prereqs(contents: &ZoneContents, request: &UpdateRequest) -> Result<()> {
    for prereq in &request.prereqs {
        let ok = match prereq {
            Prereq::RrsetExists(owner, rtype) => contents.rrset(owner, *rtype).is_some(),
            Prereq::RrsetAbsent(owner, rtype) => contents.rrset(owner, *rtype).is_none(),
            Prereq::NameInUse(owner) => contents.node(owner).is_some(),
            Prereq::NameNotInUse(owner) => contents.node(owner).is_none(),
        };
        if !ok {
            return Err(Error::Denied);
        }
    }
    Ok(())
}

/// Apply one update operation to the builder.
///
/// Deletions are lenient (a miss changes nothing); the apex SOA and NS
/// are shielded from blanket deletions.
fn apply_op(zone: &Arc<Zone>, builder: &mut crate::zone::contents::ContentsBuilder, op: &UpdateOp) {
    match op {
        UpdateOp::Add(record) => {
            if record.rtype == Rtype::SOA {
                // SOA changes ride the serial bump, not the record list.
                return;
            }
            if let Err(err) = builder.add_record(record.clone()) {
                warn!(
                    "zone '{}': dynamic update cannot add {}/{} ({err})",
                    zone.name, record.owner, record.rtype
                );
            }
        }
        UpdateOp::DeleteRecord(owner, rtype, rdata) => {
            builder.delete_rdata(owner, *rtype, rdata);
        }
        UpdateOp::DeleteRrset(owner, rtype) => {
            if owner == &zone.name && matches!(*rtype, Rtype::SOA | Rtype::NS) {
                return;
            }
            builder.delete_rrset_at(owner, *rtype);
        }
        UpdateOp::DeleteName(owner) => {
            builder.delete_name(owner);
        }
    }
}
