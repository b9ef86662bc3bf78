//! Signing keys and the key store.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, Ed25519KeyPair, KeyPair as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use sluice_base::rrset::{Class, RRset, Rtype};
use sluice_base::wire::WireBuf;
use sluice_base::{DomainName, Rdata};

use crate::error::{Error, Result};
use crate::util::{unix_now, write_file};

//----------- Algorithms -------------------------------------------------------

/// DNSSEC algorithm numbers supported by the signer.
pub mod algorithm {
    pub const ECDSAP256SHA256: u8 = 13;
    pub const ECDSAP384SHA384: u8 = 14;
    pub const ED25519: u8 = 15;
}

/// The SEP bit in DNSKEY flags; set on key-signing keys.
pub const DNSKEY_FLAG_SEP: u16 = 0x0001;

/// The zone-key bit in DNSKEY flags; set on every zone key.
pub const DNSKEY_FLAG_ZONE: u16 = 0x0100;

/// Compute a key tag over DNSKEY RDATA (RFC 4034, appendix B).
pub fn keytag(dnskey_rdata: &[u8]) -> u16 {
    let mut acc: u32 = 0;
    for (i, &b) in dnskey_rdata.iter().enumerate() {
        acc += if i & 1 == 1 { b as u32 } else { (b as u32) << 8 };
    }
    acc += (acc >> 16) & 0xffff;
    (acc & 0xffff) as u16
}

//----------- KeyState ---------------------------------------------------------

/// The lifecycle state of a key.
///
/// Keys move `Published → Active → Retired → Removed`, driven purely by the
/// timing fields; there is no separate state variable to fall out of sync.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyState {
    /// In the DNSKEY set, not yet signing.
    Published,

    /// Signing.
    Active,

    /// In the DNSKEY set, no longer signing.
    Retired,

    /// Out of the DNSKEY set.
    Removed,
}

/// The lifecycle timings of a key, as UNIX timestamps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyTimings {
    /// When the key enters the DNSKEY set.
    pub publish: u64,

    /// When the key starts signing.
    pub activate: u64,

    /// When the key stops signing; 0 = never.
    #[serde(default)]
    pub retire: u64,

    /// When the key leaves the DNSKEY set; 0 = never.
    #[serde(default)]
    pub remove: u64,
}

impl KeyTimings {
    /// The key state at a point in time.
    pub fn state(&self, now: u64) -> KeyState {
        if self.remove != 0 && now >= self.remove {
            KeyState::Removed
        } else if self.retire != 0 && now >= self.retire {
            KeyState::Retired
        } else if now >= self.activate {
            KeyState::Active
        } else {
            KeyState::Published
        }
    }

    /// The next time the state changes, if any.
    pub fn next_change(&self, now: u64) -> Option<u64> {
        [self.publish, self.activate, self.retire, self.remove]
            .into_iter()
            .filter(|&t| t != 0 && t > now)
            .min()
    }
}

//----------- SigningKey -------------------------------------------------------

/// A zone signing key with its private-key handle.
pub struct SigningKey {
    /// The name the key signs for.
    pub owner: DomainName,

    /// The DNSSEC algorithm number.
    pub algorithm: u8,

    /// The DNSKEY flags field.
    pub flags: u16,

    /// The public key, in DNSKEY presentation (no framing).
    pub public_key: Bytes,

    /// The key tag, derived from the DNSKEY RDATA.
    pub keytag: u16,

    /// Lifecycle timings.
    pub timings: KeyTimings,

    /// The private key.
    pair: PrivateKey,

    /// Randomness for signature generation.
    rng: SystemRandom,
}

enum PrivateKey {
    Ed25519(Ed25519KeyPair),
    Ecdsa(EcdsaKeyPair),
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("owner", &self.owner)
            .field("algorithm", &self.algorithm)
            .field("keytag", &self.keytag)
            .field("flags", &self.flags)
            .finish()
    }
}

impl SigningKey {
    /// Reconstruct a key from its stored PKCS#8 document.
    pub fn from_pkcs8(
        owner: DomainName,
        algorithm: u8,
        flags: u16,
        pkcs8: &[u8],
        timings: KeyTimings,
    ) -> Result<Self> {
        let rng = SystemRandom::new();
        let (pair, public_key) = match algorithm {
            algorithm::ED25519 => {
                let pair = Ed25519KeyPair::from_pkcs8(pkcs8).map_err(|_| Error::Invalid)?;
                let public = Bytes::copy_from_slice(pair.public_key().as_ref());
                (PrivateKey::Ed25519(pair), public)
            }
            algorithm::ECDSAP256SHA256 | algorithm::ECDSAP384SHA384 => {
                let alg = if algorithm == algorithm::ECDSAP256SHA256 {
                    &signature::ECDSA_P256_SHA256_FIXED_SIGNING
                } else {
                    &signature::ECDSA_P384_SHA384_FIXED_SIGNING
                };
                let pair =
                    EcdsaKeyPair::from_pkcs8(alg, pkcs8, &rng).map_err(|_| Error::Invalid)?;
                // DNSKEY carries the uncompressed point without the SEC 1
                // prefix byte.
                let public = Bytes::copy_from_slice(&pair.public_key().as_ref()[1..]);
                (PrivateKey::Ecdsa(pair), public)
            }
            _ => return Err(Error::Invalid),
        };

        let mut key = Self {
            owner,
            algorithm,
            flags,
            public_key,
            keytag: 0,
            timings,
            pair,
            rng,
        };
        key.keytag = keytag(key.dnskey_rdata().as_slice());
        Ok(key)
    }

    /// Whether this is a key-signing key.
    pub fn is_ksk(&self) -> bool {
        self.flags & DNSKEY_FLAG_SEP != 0
    }

    /// Whether this is a zone-signing key.
    pub fn is_zsk(&self) -> bool {
        self.flags & DNSKEY_FLAG_SEP == 0
    }

    /// The key state at a point in time.
    pub fn state(&self, now: u64) -> KeyState {
        self.timings.state(now)
    }

    /// The DNSKEY RDATA of this key.
    pub fn dnskey_rdata(&self) -> Rdata {
        let mut buf = WireBuf::with_capacity(4 + self.public_key.len());
        buf.put_u16(self.flags);
        buf.put_u8(3); // protocol, always 3
        buf.put_u8(self.algorithm);
        buf.put_slice(&self.public_key);
        Rdata(buf.freeze())
    }

    /// Produce a raw signature over `data`.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        match &self.pair {
            PrivateKey::Ed25519(pair) => Ok(pair.sign(data).as_ref().to_vec()),
            PrivateKey::Ecdsa(pair) => Ok(pair
                .sign(&self.rng, data)
                .map_err(|_| Error::Fatal)?
                .as_ref()
                .to_vec()),
        }
    }
}

/// Verify a raw signature against a DNSKEY-format public key.
pub fn verify_raw(
    algorithm: u8,
    public_key: &[u8],
    data: &[u8],
    signature_bytes: &[u8],
) -> Result<()> {
    let check = |alg: &'static dyn signature::VerificationAlgorithm, key: &[u8]| {
        signature::UnparsedPublicKey::new(alg, key)
            .verify(data, signature_bytes)
            .map_err(|_| Error::InvalidSignature)
    };
    match algorithm {
        algorithm::ED25519 => check(&signature::ED25519, public_key),
        algorithm::ECDSAP256SHA256 | algorithm::ECDSAP384SHA384 => {
            // Re-add the SEC 1 uncompressed-point prefix.
            let mut point = Vec::with_capacity(1 + public_key.len());
            point.push(0x04);
            point.extend_from_slice(public_key);
            let alg: &'static dyn signature::VerificationAlgorithm =
                if algorithm == algorithm::ECDSAP256SHA256 {
                    &signature::ECDSA_P256_SHA256_FIXED
                } else {
                    &signature::ECDSA_P384_SHA384_FIXED
                };
            check(alg, &point)
        }
        _ => Err(Error::Invalid),
    }
}

/// Assemble the DNSKEY record set for a keyset.
///
/// Keys in the `Removed` state are left out.
pub fn dnskey_rrset(
    owner: &DomainName,
    keys: &[Arc<SigningKey>],
    ttl: u32,
    now: u64,
) -> RRset {
    let mut set = RRset::new(owner.clone(), Rtype::DNSKEY, Class::IN, ttl);
    for key in keys {
        if key.state(now) != KeyState::Removed {
            set.push(key.dnskey_rdata());
        }
    }
    set.sort_canonical();
    set
}

//----------- KeyStore ---------------------------------------------------------

/// Storage for signing keys.
///
/// The trait hides where private keys live; the daemon ships a file-backed
/// store, an HSM-backed one can take its place.
pub trait KeyStore: Send + Sync {
    /// The keys of a zone, in no particular order.
    fn keys(&self, zone: &DomainName) -> Result<Vec<Arc<SigningKey>>>;

    /// Generate and persist a new key.
    fn generate(
        &self,
        zone: &DomainName,
        algorithm: u8,
        ksk: bool,
        timings: KeyTimings,
    ) -> Result<Arc<SigningKey>>;

    /// Import and persist an existing key from its PKCS#8 document.
    fn import(
        &self,
        zone: &DomainName,
        algorithm: u8,
        ksk: bool,
        pkcs8: &[u8],
        timings: KeyTimings,
    ) -> Result<Arc<SigningKey>>;

    /// Remove a key by its tag.
    fn remove(&self, zone: &DomainName, keytag: u16) -> Result<()>;
}

//----------- FileKeyStore -----------------------------------------------------

/// The stored form of one key.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct KeyRecord {
    algorithm: u8,
    flags: u16,
    pkcs8: Vec<u8>,
    timings: KeyTimings,
}

/// A key store keeping PKCS#8 documents in per-zone JSON files.
#[derive(Clone, Debug)]
pub struct FileKeyStore {
    dir: Utf8PathBuf,
}

impl FileKeyStore {
    /// Open a file key store rooted at `dir`.
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn zone_path(&self, zone: &DomainName) -> Utf8PathBuf {
        self.dir.join(format!("{zone}keys.json"))
    }

    fn load_records(&self, path: &Utf8Path) -> Result<Vec<KeyRecord>> {
        match std::fs::read(path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|_| Error::Invalid),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn store_records(&self, path: &Utf8Path, records: &[KeyRecord]) -> Result<()> {
        let data = serde_json::to_vec_pretty(records).map_err(|_| Error::Fatal)?;
        write_file(path, &data)?;
        Ok(())
    }
}

impl KeyStore for FileKeyStore {
    fn keys(&self, zone: &DomainName) -> Result<Vec<Arc<SigningKey>>> {
        let records = self.load_records(&self.zone_path(zone))?;
        let mut keys = Vec::with_capacity(records.len());
        for record in records {
            keys.push(Arc::new(SigningKey::from_pkcs8(
                zone.clone(),
                record.algorithm,
                record.flags,
                &record.pkcs8,
                record.timings,
            )?));
        }
        Ok(keys)
    }

    fn generate(
        &self,
        zone: &DomainName,
        algorithm: u8,
        ksk: bool,
        timings: KeyTimings,
    ) -> Result<Arc<SigningKey>> {
        let rng = SystemRandom::new();
        let pkcs8 = match algorithm {
            algorithm::ED25519 => Ed25519KeyPair::generate_pkcs8(&rng)
                .map_err(|_| Error::Fatal)?
                .as_ref()
                .to_vec(),
            algorithm::ECDSAP256SHA256 => {
                EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
                    .map_err(|_| Error::Fatal)?
                    .as_ref()
                    .to_vec()
            }
            algorithm::ECDSAP384SHA384 => {
                EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P384_SHA384_FIXED_SIGNING, &rng)
                    .map_err(|_| Error::Fatal)?
                    .as_ref()
                    .to_vec()
            }
            _ => return Err(Error::Invalid),
        };

        let flags = DNSKEY_FLAG_ZONE | if ksk { DNSKEY_FLAG_SEP } else { 0 };
        let key = Arc::new(SigningKey::from_pkcs8(
            zone.clone(),
            algorithm,
            flags,
            &pkcs8,
            timings,
        )?);

        let path = self.zone_path(zone);
        let mut records = self.load_records(&path)?;
        records.push(KeyRecord {
            algorithm,
            flags,
            pkcs8,
            timings,
        });
        self.store_records(&path, &records)?;

        info!(
            "zone '{zone}': generated {} key, tag {}",
            if ksk { "KSK" } else { "ZSK" },
            key.keytag
        );
        Ok(key)
    }

    fn import(
        &self,
        zone: &DomainName,
        algorithm: u8,
        ksk: bool,
        pkcs8: &[u8],
        timings: KeyTimings,
    ) -> Result<Arc<SigningKey>> {
        let flags = DNSKEY_FLAG_ZONE | if ksk { DNSKEY_FLAG_SEP } else { 0 };
        let key = Arc::new(SigningKey::from_pkcs8(
            zone.clone(),
            algorithm,
            flags,
            pkcs8,
            timings,
        )?);

        let path = self.zone_path(zone);
        let mut records = self.load_records(&path)?;
        if records.iter().any(|record| record.pkcs8 == pkcs8) {
            return Err(Error::Exists);
        }
        records.push(KeyRecord {
            algorithm,
            flags,
            pkcs8: pkcs8.to_vec(),
            timings,
        });
        self.store_records(&path, &records)?;

        info!("zone '{zone}': imported key with tag {}", key.keytag);
        Ok(key)
    }

    fn remove(&self, zone: &DomainName, tag: u16) -> Result<()> {
        let path = self.zone_path(zone);
        let records = self.load_records(&path)?;
        let mut kept = Vec::with_capacity(records.len());
        let mut found = false;
        for record in records {
            let key = SigningKey::from_pkcs8(
                zone.clone(),
                record.algorithm,
                record.flags,
                &record.pkcs8,
                record.timings,
            )?;
            if key.keytag == tag {
                found = true;
                debug!("zone '{zone}': removing key with tag {tag}");
            } else {
                kept.push(record);
            }
        }
        if !found {
            return Err(Error::NotFound);
        }
        self.store_records(&path, &kept)
    }
}

/// Ensure a zone has a usable keyset, generating an initial one if needed.
///
/// A fresh zone gets a CSK: a single SEP-flagged key that signs everything,
/// active immediately.
pub fn ensure_keys(
    store: &dyn KeyStore,
    zone: &DomainName,
    algorithm: u8,
) -> Result<Vec<Arc<SigningKey>>> {
    let keys = store.keys(zone)?;
    if !keys.is_empty() {
        return Ok(keys);
    }
    let now = unix_now();
    let timings = KeyTimings {
        publish: now,
        activate: now,
        retire: 0,
        remove: 0,
    };
    let key = store.generate(zone, algorithm, true, timings)?;
    Ok(vec![key])
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keytag_accumulates_big_endian_pairs() {
        // Worked by hand: 0x0101 + 0x030d + 0x0a0b = 3609, no carry.
        let rdata = [0x01, 0x01, 0x03, 0x0d, 0x0a, 0x0b];
        assert_eq!(keytag(&rdata), 3609);

        // Carry folding: 0xffff + 0xffff = 0x1fffe; 0xfffe + 1 = 0xffff.
        let rdata = [0xff, 0xff, 0xff, 0xff];
        assert_eq!(keytag(&rdata), 0xffff);
    }

    #[test]
    fn generated_key_round_trips_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().to_str().unwrap());
        let zone: DomainName = "example.com.".parse().unwrap();

        let now = unix_now();
        let timings = KeyTimings {
            publish: now,
            activate: now,
            retire: 0,
            remove: 0,
        };
        let key = store
            .generate(&zone, algorithm::ED25519, true, timings)
            .unwrap();
        assert!(key.is_ksk());
        assert_eq!(key.state(now), KeyState::Active);

        let loaded = store.keys(&zone).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].keytag, key.keytag);
        assert_eq!(loaded[0].public_key, key.public_key);

        store.remove(&zone, key.keytag).unwrap();
        assert!(store.keys(&zone).unwrap().is_empty());
        assert_eq!(store.remove(&zone, key.keytag), Err(Error::NotFound));
    }

    #[test]
    fn import_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().to_str().unwrap());
        let zone: DomainName = "example.com.".parse().unwrap();

        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let timings = KeyTimings::default();

        let key = store
            .import(&zone, algorithm::ED25519, false, pkcs8.as_ref(), timings)
            .unwrap();
        assert!(key.is_zsk());
        assert_eq!(
            store
                .import(&zone, algorithm::ED25519, false, pkcs8.as_ref(), timings)
                .err(),
            Some(Error::Exists)
        );
        assert_eq!(store.keys(&zone).unwrap().len(), 1);
    }

    #[test]
    fn lifecycle_states_follow_timings() {
        let timings = KeyTimings {
            publish: 100,
            activate: 200,
            retire: 300,
            remove: 400,
        };
        assert_eq!(timings.state(150), KeyState::Published);
        assert_eq!(timings.state(200), KeyState::Active);
        assert_eq!(timings.state(300), KeyState::Retired);
        assert_eq!(timings.state(400), KeyState::Removed);
        assert_eq!(timings.next_change(150), Some(200));
        assert_eq!(timings.next_change(350), Some(400));
        assert_eq!(timings.next_change(450), None);
    }
}
