//! The zone journal.
//!
//! The journal is a durable, ordered, keyed log of changesets, with one
//! optional whole-zone baseline per zone ("zone in journal").  It is backed
//! by a single sled tree shared by all zones.
//!
//! Chunk keys are laid out as
//! `[zone wire name][kind:u8][from serial:u32 BE][chunk index:u32 BE]`,
//! so one prefix scan enumerates the chunks of one changeset in order, and
//! a shorter prefix enumerates everything a zone has stored.  Chunk values
//! carry a 12-byte `[to serial:u32 BE][write time:u64 BE]` header before
//! the payload.
//!
//! All mutations are staged in a [`Txn`] and applied as one atomic batch;
//! an abandoned transaction leaves no trace.  Reads through the
//! transaction observe its own staged writes.

use std::collections::BTreeMap;

use sluice_base::DomainName;
use sluice_base::wire::{WireBuf, WireRead};

use crate::config::JournalConfig;
use crate::error::Result;

mod read;
mod serialize;
mod write;

pub use read::read_changeset;
pub(crate) use serialize::{changeset_stream, group_records, parse_stream, sort_records};

/// Chunks are closed once their payload reaches this size.
pub const CHUNK_THRESH: usize = 64 * 1024;

/// No chunk may exceed this size.
pub const CHUNK_MAX: usize = 256 * 1024;

/// The size of the per-chunk header.
pub const CHUNK_HEADER_SIZE: usize = 12;

/// The key tag of diff changeset chunks.
const KIND_DIFF: u8 = 0x00;

/// The key tag of zone-in-journal (baseline) chunks.
const KIND_ZIJ: u8 = 0x01;

/// The key tag of the per-zone metadata record.
const KIND_METADATA: u8 = 0x02;

//----------- Keys -------------------------------------------------------------

/// The key prefix covering everything a zone stores.
fn zone_prefix(zone: &DomainName) -> Vec<u8> {
    zone.as_wire().to_ascii_lowercase()
}

/// The key prefix covering every chunk of one changeset.
fn changeset_prefix(zone: &DomainName, zij: bool, from: u32) -> Vec<u8> {
    let mut key = zone_prefix(zone);
    key.push(if zij { KIND_ZIJ } else { KIND_DIFF });
    key.extend_from_slice(&from.to_be_bytes());
    key
}

/// The key of one chunk.
fn chunk_key(zone: &DomainName, zij: bool, from: u32, chunk: u32) -> Vec<u8> {
    let mut key = changeset_prefix(zone, zij, from);
    key.extend_from_slice(&chunk.to_be_bytes());
    key
}

/// The key of the zone's metadata record.
fn metadata_key(zone: &DomainName) -> Vec<u8> {
    let mut key = zone_prefix(zone);
    key.push(KIND_METADATA);
    key
}

//----------- Metadata ---------------------------------------------------------

/// `serial_to` names a valid chain end.
pub const MD_SERIAL_TO_VALID: u32 = 1 << 0;

/// `flushed_upto` names a valid flush horizon.
pub const MD_FLUSHED_VALID: u32 = 1 << 1;

/// `merged_serial` names a live merged record.
pub const MD_MERGED_VALID: u32 = 1 << 2;

/// Per-zone journal bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Validity bits over the serial fields.
    pub flags: u32,

    /// The serial the diff chain starts from.
    pub first_serial: u32,

    /// Changes up to this serial have reached the zone snapshot.
    pub flushed_upto: u32,

    /// The serial the chain currently ends at.
    pub serial_to: u32,

    /// The from-serial of the running merged record, if any.
    pub merged_serial: u32,

    /// The number of stored diff changesets (the baseline not included).
    pub changeset_count: u32,

    /// The bytes of chunk values the zone occupies.
    pub occupied: u64,
}

impl Metadata {
    fn encode(&self) -> Vec<u8> {
        let mut buf = WireBuf::with_capacity(32);
        buf.put_u32(self.flags);
        buf.put_u32(self.first_serial);
        buf.put_u32(self.flushed_upto);
        buf.put_u32(self.serial_to);
        buf.put_u32(self.merged_serial);
        buf.put_u32(self.changeset_count);
        buf.put_u64(self.occupied);
        buf.into_vec()
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut read = WireRead::new(data);
        Ok(Self {
            flags: read.get_u32()?,
            first_serial: read.get_u32()?,
            flushed_upto: read.get_u32()?,
            serial_to: read.get_u32()?,
            merged_serial: read.get_u32()?,
            changeset_count: read.get_u32()?,
            occupied: read.get_u64()?,
        })
    }

    /// Whether the chain end is known.
    pub fn serial_to_valid(&self) -> bool {
        self.flags & MD_SERIAL_TO_VALID != 0
    }

    /// Whether the flush horizon is known.
    pub fn flushed_valid(&self) -> bool {
        self.flags & MD_FLUSHED_VALID != 0
    }

    /// Whether a merged record exists.
    pub fn merged_valid(&self) -> bool {
        self.flags & MD_MERGED_VALID != 0
    }
}

//----------- Txn --------------------------------------------------------------

/// A staged set of journal mutations.
///
/// Writes go into a [`sled::Batch`]; reads merge the staged writes over the
/// backing tree, so the transaction sees its own effects.  Nothing reaches
/// the tree until [`Txn::commit`].
pub(crate) struct Txn<'j> {
    tree: &'j sled::Tree,

    /// Staged writes: `Some` = insert, `None` = remove.
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'j> Txn<'j> {
    fn new(tree: &'j sled::Tree) -> Self {
        Self {
            tree,
            staged: BTreeMap::new(),
        }
    }

    /// Read one key, observing staged writes.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(staged) = self.staged.get(key) {
            return Ok(staged.clone());
        }
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    /// Scan a key prefix in key order, observing staged writes.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        for entry in self.tree.scan_prefix(prefix) {
            let (key, value) = entry?;
            merged.insert(key.to_vec(), Some(value.to_vec()));
        }
        for (key, staged) in self.staged.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            merged.insert(key.clone(), staged.clone());
        }
        Ok(merged
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect())
    }

    /// Whether any key with the prefix exists.
    pub fn contains_prefix(&self, prefix: &[u8]) -> Result<bool> {
        Ok(!self.scan_prefix(prefix)?.is_empty())
    }

    /// Stage an insert.
    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.staged.insert(key, Some(value));
    }

    /// Stage a removal.
    pub fn remove(&mut self, key: Vec<u8>) {
        self.staged.insert(key, None);
    }

    /// Apply everything staged so far, atomically and durably.
    ///
    /// The transaction can keep being used afterwards; this mirrors the
    /// partial-commit point inside the occupancy machinery.
    pub fn commit(&mut self) -> Result<()> {
        let mut batch = sled::Batch::default();
        for (key, staged) in std::mem::take(&mut self.staged) {
            match staged {
                Some(value) => batch.insert(key, value),
                None => batch.remove(key),
            }
        }
        self.tree.apply_batch(batch)?;
        self.tree.flush()?;
        Ok(())
    }
}

//----------- Journal ----------------------------------------------------------

/// A zone's handle onto the journal.
#[derive(Clone, Debug)]
pub struct Journal {
    /// The backing tree, shared among zones.
    tree: sled::Tree,

    /// The zone this handle serves.
    zone: DomainName,

    /// The most bytes this zone may occupy.
    max_usage: u64,

    /// The most diff changesets this zone may keep.
    max_changesets: usize,

    /// Whether the zone can be asked to flush to its snapshot.
    flushable: bool,
}

impl Journal {
    /// Open a zone's journal handle.
    pub fn open(db: &sled::Db, zone: &DomainName, config: &JournalConfig) -> Result<Self> {
        let tree = db.open_tree("journal")?;
        Ok(Self {
            tree,
            zone: zone.clone(),
            max_usage: config.max_usage,
            max_changesets: config.max_changesets,
            flushable: config.zonefile_sync,
        })
    }

    pub(crate) fn begin(&self) -> Txn<'_> {
        Txn::new(&self.tree)
    }

    /// The zone this handle serves.
    pub fn zone(&self) -> &DomainName {
        &self.zone
    }

    pub(crate) fn load_metadata(&self, txn: &Txn<'_>) -> Result<Metadata> {
        match txn.get(&metadata_key(&self.zone))? {
            Some(data) => Metadata::decode(&data),
            None => Ok(Metadata::default()),
        }
    }

    pub(crate) fn store_metadata(&self, txn: &mut Txn<'_>, md: &Metadata) {
        txn.insert(metadata_key(&self.zone), md.encode());
    }

    /// The zone's current metadata.
    pub fn metadata(&self) -> Result<Metadata> {
        let txn = self.begin();
        self.load_metadata(&txn)
    }

    /// Whether a changeset starting at the given position exists.
    pub(crate) fn contains(&self, txn: &Txn<'_>, zij: bool, from: u32) -> Result<bool> {
        txn.contains_prefix(&changeset_prefix(&self.zone, zij, from))
    }

    /// Record that the zone snapshot now covers the whole chain.
    pub fn mark_flushed(&self) -> Result<()> {
        let mut txn = self.begin();
        let mut md = self.load_metadata(&txn)?;
        if md.serial_to_valid() {
            md.flushed_upto = md.serial_to;
            md.flags |= MD_FLUSHED_VALID;
            self.store_metadata(&mut txn, &md);
            txn.commit()?;
        }
        Ok(())
    }

    /// Drop everything the zone has stored.
    pub fn wipe(&self) -> Result<()> {
        let mut txn = self.begin();
        self.purge(&mut txn)?;
        txn.remove(metadata_key(&self.zone));
        txn.commit()
    }

    /// Stage removal of every chunk of the zone (metadata survives).
    pub(crate) fn purge(&self, txn: &mut Txn<'_>) -> Result<()> {
        let prefix = zone_prefix(&self.zone);
        for (key, _) in txn.scan_prefix(&prefix)? {
            if key.get(prefix.len()) == Some(&KIND_METADATA) {
                continue;
            }
            txn.remove(key);
        }
        Ok(())
    }
}
