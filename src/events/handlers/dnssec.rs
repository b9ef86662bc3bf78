//! The re-sign event: key lifecycle tick and a fresh signing pass.

use std::sync::Arc;

use tracing::info;

use sluice_base::rrset::{Record, Rtype};
use sluice_base::serial::serial_add;

use crate::config::Config;
use crate::dnssec::keys::ensure_keys;
use crate::dnssec::sign::SignContext;
use crate::dnssec::signer::sign_zone;
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::util::unix_now;
use crate::zone::Zone;

use super::store_changeset;

/// Sign the zone with the current keyset and plan the next signing run.
///
/// The next run lands at whichever comes first: the next key lifecycle
/// change, or the point where the signatures come within the refresh
/// window of expiring.
pub fn event_dnssec(conf: &Arc<Config>, zone: &Arc<Zone>) -> Result<()> {
    let Some(policy) = conf.zone_policy(&zone.name) else {
        // No policy, nothing to sign.
        return Ok(());
    };
    let server = zone.server()?;
    let old = zone.expect_contents()?;
    let now = unix_now();

    let keys = ensure_keys(&*server.keystore, &zone.name, policy.algorithm)?;
    let ctx = SignContext::from_policy(policy, now);

    // Bump the serial; the re-signed zone must be transferable.
    let mut soa = old.soa_fields()?;
    soa.serial = serial_add(soa.serial, 1);
    let mut builder = old.to_builder();
    builder.set_soa(Record::new(
        zone.name.clone(),
        Rtype::SOA,
        old.soa().class,
        old.soa().ttl,
        soa.to_rdata(),
    ))?;
    let bumped = builder.finish()?;

    let signed = Arc::new(sign_zone(&bumped, &keys, &ctx)?);

    let ch = old.diff(&signed);
    store_changeset(conf, zone, &ch, None)?;
    zone.switch_contents(Some(signed.clone()));

    // Plan the next run.
    let resign_at = signed
        .dnssec_expire()
        .saturating_sub(policy.rrsig_refresh_before as u64);
    let key_change = keys
        .iter()
        .filter_map(|key| key.timings.next_change(now))
        .min();
    let next = key_change.map_or(resign_at, |change| change.min(resign_at));

    let entry = conf.zone(&zone.name).ok_or(Error::NotFound)?;
    let mut plan = vec![
        (EventKind::Dnssec, None),
        (EventKind::Dnssec, Some(next)),
    ];
    if !entry.secondaries.is_empty() {
        plan.push((EventKind::Notify, Some(now)));
    }
    if !entry.parents.is_empty() {
        plan.push((EventKind::DsCheck, Some(now)));
    }
    if !entry.dnskey_sync.is_empty() {
        plan.push((EventKind::DnskeySync, Some(now)));
    }
    zone.events.schedule_at(&plan);

    info!(
        "zone '{}': re-signed, serial {}, next signing at {next}",
        zone.name, soa.serial
    );
    Ok(())
}
