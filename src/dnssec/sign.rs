//! Creating and checking RRSIGs.
//!
//! The signed data is assembled exactly as validators reconstruct it: the
//! 18-byte RRSIG RDATA header, the canonical (lowercased) signer name, and
//! the covered record set in canonical wire form with RDATA sorted by wire
//! bytes.  Timestamps are 32-bit and compared with serial arithmetic.

use sluice_base::rrset::{RRset, Rtype};
use sluice_base::serial::{SerialCmp, serial_cmp, serial_sub};
use sluice_base::wire::{ParseError, WireBuf, WireRead};
use sluice_base::{DomainName, Rdata};

use crate::error::{Error, Result};

use super::keys::{SigningKey, verify_raw};

/// How far in the past signature inception is placed, to absorb clock skew.
pub const INCEPT_IN_PAST: u32 = 90 * 60;

/// The offset of the signer name within RRSIG RDATA.
const RRSIG_SIGNER_OFFSET: usize = 18;

//----------- SignContext ------------------------------------------------------

/// Everything a signing pass needs beyond the keys.
#[derive(Clone, Copy, Debug)]
pub struct SignContext {
    /// The current time, as a UNIX timestamp.
    pub now: u64,

    /// How long produced signatures remain valid, in seconds.
    pub rrsig_lifetime: u32,

    /// How long before expiration a signature counts as stale.
    pub rrsig_refresh_before: u32,

    /// The TTL for the DNSKEY record set.
    pub dnskey_ttl: u32,

    /// Prefer deterministic signatures where the algorithm allows.
    ///
    /// Ed25519 is deterministic by construction; for ECDSA this is
    /// best-effort and recorded for operators only.
    pub reproducible: bool,

    /// Accept expired signatures during validation.
    pub unsafe_expired: bool,
}

impl SignContext {
    /// Build a context from a configured policy.
    pub fn from_policy(policy: &crate::config::Policy, now: u64) -> Self {
        Self {
            now,
            rrsig_lifetime: policy.rrsig_lifetime,
            rrsig_refresh_before: policy.rrsig_refresh_before,
            dnskey_ttl: policy.dnskey_ttl,
            reproducible: policy.reproducible_sign,
            unsafe_expired: policy.unsafe_expired,
        }
    }
}

//----------- RrsigFields ------------------------------------------------------

/// The decoded fields of an RRSIG RDATA.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RrsigFields {
    pub type_covered: Rtype,
    pub algorithm: u8,
    pub labels: u8,
    pub original_ttl: u32,
    pub expiration: u32,
    pub inception: u32,
    pub keytag: u16,
    pub signer: DomainName,
    pub signature: Vec<u8>,
}

impl RrsigFields {
    /// Parse RRSIG RDATA.
    pub fn parse(rdata: &Rdata) -> Result<Self> {
        let mut read = WireRead::new(rdata.as_slice());
        let fields = Self {
            type_covered: Rtype(read.get_u16()?),
            algorithm: read.get_u8()?,
            labels: read.get_u8()?,
            original_ttl: read.get_u32()?,
            expiration: read.get_u32()?,
            inception: read.get_u32()?,
            keytag: read.get_u16()?,
            signer: DomainName::parse_wire(&mut read)?,
            signature: read.take(read.remaining())?.to_vec(),
        };
        if fields.signature.is_empty() {
            return Err(ParseError::Malformed.into());
        }
        Ok(fields)
    }
}

/// The number of labels an RRSIG advertises for an owner.
///
/// A wildcard's asterisk label is not counted.
fn owner_labels(owner: &DomainName) -> u8 {
    let labels = owner.label_count();
    if owner.is_wildcard() { labels - 1 } else { labels }
}

/// Write the RRSIG RDATA header and canonical signer name.
fn write_rrsig_header(
    buf: &mut WireBuf,
    covered: &RRset,
    key: &SigningKey,
    inception: u32,
    expiration: u32,
) {
    buf.put_u16(covered.rtype.0);
    buf.put_u8(key.algorithm);
    buf.put_u8(owner_labels(&covered.owner));
    buf.put_u32(covered.ttl);
    buf.put_u32(expiration);
    buf.put_u32(inception);
    buf.put_u16(key.keytag);
    key.owner.to_lowercase().write_wire(buf);
}

/// Assemble the byte stream that is signed and verified.
fn signed_data(header_and_signer: &[u8], covered: &RRset) -> Vec<u8> {
    let mut buf = WireBuf::with_capacity(header_and_signer.len() + covered.wire_len());
    buf.put_slice(header_and_signer);
    covered.write_canonical_wire(&mut buf);
    buf.into_vec()
}

//----------- Signing ----------------------------------------------------------

/// Sign a record set with one key, appending the RRSIG to `rrsigs`.
pub fn sign_rrset(
    rrsigs: &mut RRset,
    covered: &RRset,
    key: &SigningKey,
    ctx: &SignContext,
) -> Result<()> {
    if covered.is_empty() || rrsigs.rtype != Rtype::RRSIG || rrsigs.owner != covered.owner {
        return Err(Error::Invalid);
    }

    let inception = serial_sub(ctx.now as u32, INCEPT_IN_PAST);
    let expiration = (ctx.now as u32).wrapping_add(ctx.rrsig_lifetime);
    if serial_cmp(inception, expiration) != SerialCmp::Lower {
        return Err(Error::Invalid);
    }

    let mut rdata = WireBuf::with_capacity(RRSIG_SIGNER_OFFSET + key.owner.wire_len() + 64);
    write_rrsig_header(&mut rdata, covered, key, inception, expiration);

    let signature = key.sign(&signed_data(rdata.as_slice(), covered))?;
    rdata.put_slice(&signature);

    rrsigs.push(Rdata(rdata.freeze()));
    Ok(())
}

/// Make an empty RRSIG set to sign into.
pub fn empty_rrsigs(covered: &RRset) -> RRset {
    RRset::new(covered.owner.clone(), Rtype::RRSIG, covered.class, covered.ttl)
}

//----------- Verification -----------------------------------------------------

/// Whether a signature's validity window has closed (or not yet opened).
fn is_expired(fields: &RrsigFields, now: u32, refresh_before: u32) -> bool {
    let stale_at = serial_sub(fields.expiration, refresh_before);
    !matches!(serial_cmp(now, stale_at), SerialCmp::Lower)
        || serial_cmp(now, fields.inception) == SerialCmp::Lower
}

/// Check one RRSIG over a record set against a public key.
///
/// `refresh_before` shifts the expiration horizon: a signature that will
/// expire within that window already counts as expired, so re-signing
/// happens before resolvers see stale signatures.
pub fn check_rrsig(
    covered: &RRset,
    rrsig: &Rdata,
    public_key: &[u8],
    ctx: &SignContext,
    refresh_before: u32,
) -> Result<()> {
    let fields = RrsigFields::parse(rrsig)?;

    if serial_cmp(fields.inception, fields.expiration) != SerialCmp::Lower {
        return Err(Error::Invalid);
    }
    if fields.type_covered != covered.rtype || fields.original_ttl != covered.ttl {
        return Err(Error::InvalidSignature);
    }
    if !ctx.unsafe_expired && is_expired(&fields, ctx.now as u32, refresh_before) {
        return Err(Error::Expired);
    }

    // The signed stream is the RDATA up to the signature, with the signer
    // name canonicalized, followed by the canonical covered set.
    let mut header = WireBuf::with_capacity(rrsig.len());
    header.put_slice(&rrsig.as_slice()[..RRSIG_SIGNER_OFFSET]);
    fields.signer.to_lowercase().write_wire(&mut header);

    verify_raw(
        fields.algorithm,
        public_key,
        &signed_data(header.as_slice(), covered),
        &fields.signature,
    )
}

//============ Tests ===========================================================
