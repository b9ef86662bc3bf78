//! Whole-zone signing and validation.

use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info};

use sluice_base::rrset::{RRset, Rtype};
use sluice_base::wire::WireRead;
use sluice_base::DomainName;

use crate::error::{Error, Result};
use crate::zone::contents::ZoneContents;

use super::keys::{KeyState, SigningKey, dnskey_rrset};
use super::sign::{RrsigFields, SignContext, check_rrsig, empty_rrsigs, sign_rrset};

/// Whether a key signs a given record set.
///
/// KSKs sign the key material at the apex (DNSKEY, CDS, CDNSKEY), ZSKs
/// sign everything else.  A keyset without an active ZSK is treated as
/// using a CSK: its KSK covers the whole zone, and vice versa.
fn use_key(key: &SigningKey, rrset: &RRset, has_zsk: bool, has_ksk: bool) -> bool {
    let key_material = matches!(rrset.rtype, Rtype::DNSKEY | Rtype::CDS | Rtype::CDNSKEY);
    if key_material {
        key.is_ksk() || !has_ksk
    } else {
        key.is_zsk() || !has_zsk
    }
}

/// Sign a zone version with a keyset, producing the signed next version.
///
/// All previous RRSIGs are dropped, the DNSKEY set is rebuilt from the
/// keyset, and a fresh RRSIG is generated per record set and selected key.
/// The produced version's DNSSEC expiration is the earliest signature
/// expiration.
pub fn sign_zone(
    contents: &ZoneContents,
    keys: &[Arc<SigningKey>],
    ctx: &SignContext,
) -> Result<ZoneContents> {
    let active: Vec<&Arc<SigningKey>> = keys
        .iter()
        .filter(|key| key.state(ctx.now) == KeyState::Active)
        .collect();
    if active.is_empty() {
        return Err(Error::Invalid);
    }
    let has_zsk = active.iter().any(|key| key.is_zsk());
    let has_ksk = active.iter().any(|key| key.is_ksk());

    // Refresh the published key material first, so it is signed along with
    // the rest of the zone.
    let mut builder = contents.to_builder();
    builder.strip_rrsigs();
    let dnskeys = dnskey_rrset(contents.apex(), keys, ctx.dnskey_ttl, ctx.now);
    builder.put_rrset(dnskeys);
    let unsigned = builder.finish()?;

    let rrsets: Vec<RRset> = unsigned.rrsets().cloned().collect();
    let rrsig_sets: Vec<RRset> = rrsets
        .par_iter()
        .map(|rrset| {
            let mut rrsigs = empty_rrsigs(rrset);
            for key in &active {
                if use_key(key, rrset, has_zsk, has_ksk) {
                    sign_rrset(&mut rrsigs, rrset, key, ctx)?;
                }
            }
            Ok(rrsigs)
        })
        .collect::<Result<_>>()?;

    // Fold the per-set signatures into one RRSIG set per node.
    let mut by_owner: Vec<(DomainName, RRset)> = Vec::new();
    for rrsigs in rrsig_sets.into_iter().filter(|set| !set.is_empty()) {
        match by_owner.iter_mut().find(|(owner, _)| owner == &rrsigs.owner) {
            Some((_, merged)) => {
                merged.ttl = merged.ttl.min(rrsigs.ttl);
                merged.rdatas.extend(rrsigs.rdatas);
            }
            None => by_owner.push((rrsigs.owner.clone(), rrsigs)),
        }
    }

    let mut builder = unsigned.to_builder();
    let mut rrsig_count = 0;
    for (_, mut rrsigs) in by_owner {
        rrsig_count += rrsigs.len();
        rrsigs.sort_canonical();
        builder.put_rrset(rrsigs);
    }

    let signed = builder.finish()?;
    let expire = ctx.now + ctx.rrsig_lifetime as u64;
    signed.set_dnssec_expire(expire);

    info!(
        "zone '{}': signed serial {} with {} keys, {rrsig_count} signatures, expire {expire}",
        contents.apex(),
        contents.serial(),
        active.len(),
    );
    Ok(signed)
}

/// The public keys of a zone's DNSKEY set, as (keytag, algorithm, key).
fn zone_public_keys(contents: &ZoneContents) -> Vec<(u16, u8, Vec<u8>)> {
    let Some(dnskeys) = contents.rrset(contents.apex(), Rtype::DNSKEY) else {
        return Vec::new();
    };
    let mut keys = Vec::with_capacity(dnskeys.len());
    for rdata in &dnskeys.rdatas {
        let mut read = WireRead::new(rdata.as_slice());
        let Ok(_flags) = read.get_u16() else { continue };
        let Ok(_protocol) = read.get_u8() else { continue };
        let Ok(algorithm) = read.get_u8() else { continue };
        let Ok(public) = read.take(read.remaining()) else {
            continue;
        };
        keys.push((
            super::keys::keytag(rdata.as_slice()),
            algorithm,
            public.to_vec(),
        ));
    }
    keys
}

/// Check every signature in a zone version.
///
/// Each record set outside the RRSIG type must carry at least one
/// signature that checks out against the zone's DNSKEY set.
pub fn verify_zone(contents: &ZoneContents, ctx: &SignContext) -> Result<()> {
    let public_keys = zone_public_keys(contents);
    if public_keys.is_empty() {
        return Err(Error::InvalidSignature);
    }

    for rrset in contents.rrsets() {
        if rrset.rtype == Rtype::RRSIG {
            continue;
        }

        let rrsigs = contents
            .node(&rrset.owner)
            .and_then(|node| node.rrsets.get(&Rtype::RRSIG))
            .ok_or(Error::InvalidSignature)?;

        let mut last = Error::InvalidSignature;
        let mut good = false;
        for rrsig in &rrsigs.rdatas {
            let Ok(fields) = RrsigFields::parse(rrsig) else {
                continue;
            };
            if fields.type_covered != rrset.rtype {
                continue;
            }
            let Some((_, _, public)) = public_keys
                .iter()
                .find(|(tag, alg, _)| *tag == fields.keytag && *alg == fields.algorithm)
            else {
                continue;
            };
            match check_rrsig(rrset, rrsig, public, ctx, ctx.rrsig_refresh_before) {
                Ok(()) => {
                    good = true;
                    break;
                }
                Err(err) => last = err,
            }
        }
        if !good {
            debug!(
                "zone '{}': no valid signature over {}/{}",
                contents.apex(),
                rrset.owner,
                rrset.rtype
            );
            return Err(last);
        }
    }
    Ok(())
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dnssec::keys::{FileKeyStore, KeyStore, KeyTimings, algorithm};
    use crate::util::unix_now;
    use sluice_base::rrset::{Class, Record, SoaFields};
    use sluice_base::Rdata;

    fn sample_contents() -> ZoneContents {
        let apex: DomainName = "example.".parse().unwrap();
        let soa = SoaFields {
            mname: "ns1.example.".parse().unwrap(),
            rname: "host.example.".parse().unwrap(),
            serial: 7,
            refresh: 3600,
            retry: 600,
            expire: 86400,
            minimum: 300,
        };
        ZoneContents::from_records(
            apex.clone(),
            vec![
                Record::new(apex.clone(), Rtype::SOA, Class::IN, 3600, soa.to_rdata()),
                Record::new(
                    apex,
                    Rtype::NS,
                    Class::IN,
                    3600,
                    Rdata::new(b"\x03ns1\x07example\x00".to_vec()),
                ),
                Record::new(
                    "www.example.".parse().unwrap(),
                    Rtype::A,
                    Class::IN,
                    300,
                    Rdata::new(vec![192, 0, 2, 1]),
                ),
            ],
        )
        .unwrap()
    }

    fn keyset(zone: &DomainName, dir: &tempfile::TempDir) -> Vec<Arc<SigningKey>> {
        let store = FileKeyStore::new(dir.path().to_str().unwrap());
        let now = unix_now();
        let timings = KeyTimings {
            publish: now,
            activate: now,
            retire: 0,
            remove: 0,
        };
        vec![
            store
                .generate(zone, algorithm::ED25519, true, timings)
                .unwrap(),
            store
                .generate(zone, algorithm::ED25519, false, timings)
                .unwrap(),
        ]
    }

    #[test]
    fn sign_and_verify_zone() {
        let dir = tempfile::tempdir().unwrap();
        let contents = sample_contents();
        let keys = keyset(contents.apex(), &dir);
        let ctx = SignContext {
            now: unix_now(),
            rrsig_lifetime: 86400,
            rrsig_refresh_before: 3600,
            dnskey_ttl: 3600,
            reproducible: false,
            unsafe_expired: false,
        };

        let signed = sign_zone(&contents, &keys, &ctx).unwrap();
        assert!(signed.is_dnssec());
        assert_eq!(signed.dnssec_expire(), ctx.now + 86400);
        assert!(signed
            .rrset(contents.apex(), Rtype::DNSKEY)
            .is_some_and(|set| set.len() == 2));

        verify_zone(&signed, &ctx).unwrap();

        // The DNSKEY set is KSK-signed, the address records ZSK-signed.
        let ksk = keys.iter().find(|k| k.is_ksk()).unwrap();
        let apex_sigs = signed.rrset(contents.apex(), Rtype::RRSIG).unwrap();
        let dnskey_sig = apex_sigs
            .rdatas
            .iter()
            .map(|r| RrsigFields::parse(r).unwrap())
            .find(|f| f.type_covered == Rtype::DNSKEY)
            .unwrap();
        assert_eq!(dnskey_sig.keytag, ksk.keytag);
    }

    #[test]
    fn validation_catches_removal() {
        let dir = tempfile::tempdir().unwrap();
        let contents = sample_contents();
        let keys = keyset(contents.apex(), &dir);
        let ctx = SignContext {
            now: unix_now(),
            rrsig_lifetime: 86400,
            rrsig_refresh_before: 3600,
            dnskey_ttl: 3600,
            reproducible: false,
            unsafe_expired: false,
        };
        let signed = sign_zone(&contents, &keys, &ctx).unwrap();

        // Grow a signed set without re-signing; validation must fail.
        let mut builder = signed.to_builder();
        builder
            .add_record(Record::new(
                "www.example.".parse().unwrap(),
                Rtype::A,
                Class::IN,
                300,
                Rdata::new(vec![192, 0, 2, 99]),
            ))
            .unwrap();
        let broken = builder.finish().unwrap();
        assert!(verify_zone(&broken, &ctx).is_err());
    }

    #[test]
    fn single_csk_signs_everything() {
        let dir = tempfile::tempdir().unwrap();
        let contents = sample_contents();
        let store = FileKeyStore::new(dir.path().to_str().unwrap());
        let now = unix_now();
        let timings = KeyTimings {
            publish: now,
            activate: now,
            retire: 0,
            remove: 0,
        };
        let csk = store
            .generate(contents.apex(), algorithm::ED25519, true, timings)
            .unwrap();
        let ctx = SignContext {
            now,
            rrsig_lifetime: 86400,
            rrsig_refresh_before: 3600,
            dnskey_ttl: 3600,
            reproducible: false,
            unsafe_expired: false,
        };

        let signed = sign_zone(&contents, &[csk], &ctx).unwrap();
        verify_zone(&signed, &ctx).unwrap();
    }
}
