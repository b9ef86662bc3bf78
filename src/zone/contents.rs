//! The contents of a zone.
//!
//! [`ZoneContents`] is an immutable snapshot of a zone version.  Updates go
//! through [`ContentsBuilder`], which clones the node maps, applies the
//! change and produces a fresh snapshot; the zone then publishes it with a
//! single pointer swap (see [`crate::zone::Zone::switch_contents`]).
//! Readers hold an [`std::sync::Arc`] to the snapshot they started with;
//! the deep free of a replaced version happens when its last reader drops
//! the handle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use sluice_base::rrset::{RRset, Record, Rtype, SoaFields};
use sluice_base::wire::WireRead;
use sluice_base::{Changeset, DomainName, Rdata};

use crate::error::{Error, Result};

//----------- Node -------------------------------------------------------------

/// One owner name and its record sets.
#[derive(Clone, Debug, Default)]
pub struct Node {
    /// The record sets at this name, by type.
    pub rrsets: foldhash::HashMap<Rtype, RRset>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.rrsets.is_empty()
    }
}

//----------- Nsec3Params ------------------------------------------------------

/// NSEC3 parameters, from the apex NSEC3PARAM record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nsec3Params {
    pub algorithm: u8,
    pub flags: u8,
    pub iterations: u16,
    pub salt: Bytes,
}

impl Nsec3Params {
    /// Parse NSEC3PARAM RDATA.
    pub fn parse(rdata: &Rdata) -> Result<Self> {
        let mut read = WireRead::new(rdata.as_slice());
        let algorithm = read.get_u8()?;
        let flags = read.get_u8()?;
        let iterations = read.get_u16()?;
        let salt_len = read.get_u8()? as usize;
        let salt = Bytes::copy_from_slice(read.take(salt_len)?);
        Ok(Self {
            algorithm,
            flags,
            iterations,
            salt,
        })
    }
}

//----------- ZoneContents -----------------------------------------------------

/// An immutable version of a zone.
#[derive(Debug)]
pub struct ZoneContents {
    /// The apex name.
    apex: DomainName,

    /// All regular nodes, in canonical order; the apex node included.
    nodes: BTreeMap<DomainName, Node>,

    /// NSEC3 nodes, kept apart from the regular tree.
    nsec3_nodes: BTreeMap<DomainName, Node>,

    /// The NSEC3 parameters, from the apex NSEC3PARAM record.
    nsec3_params: Option<Nsec3Params>,

    /// The earliest RRSIG expiration in the zone; 0 when unknown.
    ///
    /// Updated by the signer after the snapshot is built, hence atomic.
    dnssec_expire: AtomicU64,

    /// The summed wire size of all records.
    size: usize,

    /// The largest TTL in the zone.
    max_ttl: u32,

    /// Whether the zone carries signatures.
    is_dnssec: bool,
}

impl ZoneContents {
    /// Build contents from a flat record list.
    ///
    /// The list must contain exactly one SOA record set, at the apex.
    pub fn from_records(apex: DomainName, records: Vec<Record>) -> Result<Self> {
        let mut builder = ContentsBuilder::new(apex);
        for record in records {
            builder.add_record(record)?;
        }
        builder.finish()
    }

    /// The apex name.
    pub fn apex(&self) -> &DomainName {
        &self.apex
    }

    /// The apex SOA record set.
    pub fn soa(&self) -> &RRset {
        self.rrset(&self.apex, Rtype::SOA)
            .expect("complete contents always carry an apex SOA")
    }

    /// The apex SOA as a single record.
    pub fn soa_record(&self) -> Record {
        let soa = self.soa();
        Record::new(
            soa.owner.clone(),
            soa.rtype,
            soa.class,
            soa.ttl,
            soa.rdatas[0].clone(),
        )
    }

    /// The SOA serial.
    pub fn serial(&self) -> u32 {
        SoaFields::serial_of(&self.soa().rdatas[0]).unwrap_or(0)
    }

    /// The SOA fields.
    pub fn soa_fields(&self) -> Result<SoaFields> {
        Ok(SoaFields::parse(&self.soa().rdatas[0])?)
    }

    /// Look up a node.
    pub fn node(&self, name: &DomainName) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Look up a record set.
    pub fn rrset(&self, name: &DomainName, rtype: Rtype) -> Option<&RRset> {
        self.nodes.get(name)?.rrsets.get(&rtype)
    }

    /// Iterate over every record set, in canonical owner order.
    pub fn rrsets(&self) -> impl Iterator<Item = &RRset> {
        self.nodes
            .values()
            .chain(self.nsec3_nodes.values())
            .flat_map(|node| node.rrsets.values())
    }

    /// Flatten the zone into records: the SOA first, the rest in canonical
    /// owner order.
    pub fn to_records(&self) -> Vec<Record> {
        let mut records = vec![self.soa_record()];
        for (name, node) in self.nodes.iter().chain(self.nsec3_nodes.iter()) {
            let mut rtypes: Vec<Rtype> = node.rrsets.keys().copied().collect();
            rtypes.sort_unstable();
            for rtype in rtypes {
                if name == &self.apex && rtype == Rtype::SOA {
                    continue;
                }
                records.extend(node.rrsets[&rtype].to_records());
            }
        }
        records
    }

    /// The NSEC3 parameters, if the zone uses NSEC3.
    pub fn nsec3_params(&self) -> Option<&Nsec3Params> {
        self.nsec3_params.as_ref()
    }

    /// The summed wire size of all records.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The largest TTL in the zone.
    pub fn max_ttl(&self) -> u32 {
        self.max_ttl
    }

    /// Whether the zone carries signatures.
    pub fn is_dnssec(&self) -> bool {
        self.is_dnssec
    }

    /// The earliest RRSIG expiration, as a UNIX timestamp; 0 if unknown.
    pub fn dnssec_expire(&self) -> u64 {
        self.dnssec_expire.load(Ordering::Relaxed)
    }

    /// Record the earliest RRSIG expiration.
    pub fn set_dnssec_expire(&self, expire: u64) {
        self.dnssec_expire.store(expire, Ordering::Relaxed);
    }

    /// Begin building the next version from this one.
    pub fn to_builder(&self) -> ContentsBuilder {
        ContentsBuilder {
            apex: self.apex.clone(),
            nodes: self.nodes.clone(),
            nsec3_nodes: self.nsec3_nodes.clone(),
        }
    }

    /// Produce the next version by applying a changeset.
    ///
    /// The changeset must start at this version's serial.
    pub fn apply(&self, ch: &Changeset) -> Result<ZoneContents> {
        if ch.is_baseline() || ch.from_serial() != self.serial() {
            return Err(Error::Invalid);
        }

        let mut builder = self.to_builder();
        for rrset in &ch.removals {
            builder.remove_rrset(rrset)?;
        }
        for rrset in &ch.additions {
            for record in rrset.to_records() {
                builder.add_record(record)?;
            }
        }
        builder.set_soa(ch.soa_to.clone())?;
        builder.finish()
    }

    /// Build contents from a baseline changeset.
    pub fn from_baseline(ch: &Changeset) -> Result<ZoneContents> {
        if !ch.is_baseline() {
            return Err(Error::Invalid);
        }
        let mut builder = ContentsBuilder::new(ch.soa_to.owner.clone());
        builder.add_record(ch.soa_to.clone())?;
        for rrset in &ch.additions {
            for record in rrset.to_records() {
                builder.add_record(record)?;
            }
        }
        builder.finish()
    }

    /// Express this version as a baseline changeset.
    pub fn to_baseline(&self) -> Changeset {
        let mut ch = Changeset::new(None, self.soa_record());
        let mut records = self.to_records();
        records.remove(0);
        ch.additions = crate::journal::group_records(records);
        ch
    }

    /// The changeset taking this version to `newer`.
    pub fn diff(&self, newer: &ZoneContents) -> Changeset {
        let mut counts: foldhash::HashMap<Record, i64> = foldhash::HashMap::default();
        for record in self.to_records().into_iter().skip(1) {
            *counts.entry(record).or_insert(0) -= 1;
        }
        for record in newer.to_records().into_iter().skip(1) {
            *counts.entry(record).or_insert(0) += 1;
        }

        let mut removals = Vec::new();
        let mut additions = Vec::new();
        for (record, count) in counts {
            if count < 0 {
                removals.push(record);
            } else if count > 0 {
                additions.push(record);
            }
        }
        crate::journal::sort_records(&mut removals);
        crate::journal::sort_records(&mut additions);

        let mut ch = Changeset::new(Some(self.soa_record()), newer.soa_record());
        ch.removals = crate::journal::group_records(removals);
        ch.additions = crate::journal::group_records(additions);
        ch
    }
}

//----------- ContentsBuilder --------------------------------------------------

/// A private, mutable builder for the next version of a zone.
#[derive(Clone, Debug)]
pub struct ContentsBuilder {
    apex: DomainName,
    nodes: BTreeMap<DomainName, Node>,
    nsec3_nodes: BTreeMap<DomainName, Node>,
}

impl ContentsBuilder {
    /// Start from an empty zone.
    pub fn new(apex: DomainName) -> Self {
        Self {
            apex,
            nodes: BTreeMap::new(),
            nsec3_nodes: BTreeMap::new(),
        }
    }

    fn tree_for(&mut self, rtype: Rtype) -> &mut BTreeMap<DomainName, Node> {
        if rtype == Rtype::NSEC3 {
            &mut self.nsec3_nodes
        } else {
            &mut self.nodes
        }
    }

    /// Add one record.
    pub fn add_record(&mut self, record: Record) -> Result<()> {
        if !record.owner.ends_with(&self.apex) {
            return Err(Error::Invalid);
        }
        let node = self.tree_for(record.rtype).entry(record.owner.clone()).or_default();
        let rrset = node
            .rrsets
            .entry(record.rtype)
            .or_insert_with(|| RRset::new(record.owner, record.rtype, record.class, record.ttl));
        if !rrset.contains(&record.rdata) {
            rrset.push(record.rdata);
            // TTLs are normalized across the set at load.
            rrset.ttl = rrset.ttl.min(record.ttl);
        }
        Ok(())
    }

    /// Remove the records of one set.
    ///
    /// Removing a record that is not present is a semantic error; the
    /// changesets applied here are derived from a version that held them.
    pub fn remove_rrset(&mut self, rrset: &RRset) -> Result<()> {
        let tree = self.tree_for(rrset.rtype);
        let Some(node) = tree.get_mut(&rrset.owner) else {
            return Err(Error::Invalid);
        };
        let Some(existing) = node.rrsets.get_mut(&rrset.rtype) else {
            return Err(Error::Invalid);
        };
        for rdata in &rrset.rdatas {
            let before = existing.rdatas.len();
            existing.rdatas.retain(|r| r != rdata);
            if existing.rdatas.len() == before {
                return Err(Error::Invalid);
            }
        }
        if existing.is_empty() {
            node.rrsets.remove(&rrset.rtype);
        }
        if node.is_empty() {
            tree.remove(&rrset.owner);
        }
        Ok(())
    }

    /// Replace the apex SOA.
    pub fn set_soa(&mut self, soa: Record) -> Result<()> {
        if soa.rtype != Rtype::SOA || soa.owner != self.apex {
            return Err(Error::Invalid);
        }
        let node = self.nodes.entry(self.apex.clone()).or_default();
        let mut rrset = RRset::new(soa.owner, soa.rtype, soa.class, soa.ttl);
        rrset.push(soa.rdata);
        node.rrsets.insert(Rtype::SOA, rrset);
        Ok(())
    }

    /// Remove one record, if present.
    ///
    /// Dynamic updates delete leniently; a miss is not an error.
    pub fn delete_rdata(&mut self, owner: &DomainName, rtype: Rtype, rdata: &Rdata) -> bool {
        let tree = self.tree_for(rtype);
        let Some(node) = tree.get_mut(owner) else {
            return false;
        };
        let Some(existing) = node.rrsets.get_mut(&rtype) else {
            return false;
        };
        let before = existing.rdatas.len();
        existing.rdatas.retain(|r| r != rdata);
        let hit = existing.rdatas.len() != before;
        if existing.is_empty() {
            node.rrsets.remove(&rtype);
        }
        if node.is_empty() {
            tree.remove(owner);
        }
        hit
    }

    /// Remove a whole record set, if present.
    pub fn delete_rrset_at(&mut self, owner: &DomainName, rtype: Rtype) -> bool {
        let tree = self.tree_for(rtype);
        let Some(node) = tree.get_mut(owner) else {
            return false;
        };
        let hit = node.rrsets.remove(&rtype).is_some();
        if node.is_empty() {
            tree.remove(owner);
        }
        hit
    }

    /// Remove every record set at a name, keeping the apex SOA and NS.
    pub fn delete_name(&mut self, owner: &DomainName) -> bool {
        if owner == &self.apex {
            let Some(node) = self.nodes.get_mut(owner) else {
                return false;
            };
            node.rrsets
                .retain(|&rtype, _| rtype == Rtype::SOA || rtype == Rtype::NS);
            true
        } else {
            self.nodes.remove(owner).is_some()
        }
    }

    /// Remove every RRSIG in the zone.
    pub fn strip_rrsigs(&mut self) {
        for tree in [&mut self.nodes, &mut self.nsec3_nodes] {
            tree.retain(|_, node| {
                node.rrsets.remove(&Rtype::RRSIG);
                !node.is_empty()
            });
        }
    }

    /// Insert or replace a whole record set.
    pub fn put_rrset(&mut self, rrset: RRset) {
        let node = self.tree_for(rrset.rtype).entry(rrset.owner.clone()).or_default();
        node.rrsets.insert(rrset.rtype, rrset);
    }

    /// Seal the builder into an immutable version.
    pub fn finish(self) -> Result<ZoneContents> {
        let Self {
            apex,
            nodes,
            nsec3_nodes,
        } = self;

        let apex_node = nodes.get(&apex).ok_or(Error::Invalid)?;
        let soa = apex_node.rrsets.get(&Rtype::SOA).ok_or(Error::Invalid)?;
        if soa.len() != 1 {
            return Err(Error::Invalid);
        }

        let mut size = 0;
        let mut max_ttl = 0;
        let mut is_dnssec = false;
        for node in nodes.values().chain(nsec3_nodes.values()) {
            for rrset in node.rrsets.values() {
                size += rrset.wire_len();
                max_ttl = max_ttl.max(rrset.ttl);
                is_dnssec |= rrset.rtype == Rtype::RRSIG;
            }
        }

        let nsec3_params = apex_node
            .rrsets
            .get(&Rtype::NSEC3PARAM)
            .and_then(|set| set.rdatas.first())
            .map(Nsec3Params::parse)
            .transpose()?;

        Ok(ZoneContents {
            apex,
            nodes,
            nsec3_nodes,
            nsec3_params,
            dnssec_expire: AtomicU64::new(0),
            size,
            max_ttl,
            is_dnssec,
        })
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_base::rrset::Class;

    fn name(s: &str) -> DomainName {
        s.parse().unwrap()
    }

    fn soa_record(serial: u32) -> Record {
        let fields = SoaFields {
            mname: name("ns1.example."),
            rname: name("host.example."),
            serial,
            refresh: 3600,
            retry: 600,
            expire: 86400,
            minimum: 300,
        };
        Record::new(name("example."), Rtype::SOA, Class::IN, 3600, fields.to_rdata())
    }

    fn a_record(owner: &str, addr: [u8; 4]) -> Record {
        Record::new(
            name(owner),
            Rtype::A,
            Class::IN,
            300,
            Rdata::new(addr.to_vec()),
        )
    }

    fn sample() -> ZoneContents {
        ZoneContents::from_records(
            name("example."),
            vec![
                soa_record(1),
                a_record("www.example.", [192, 0, 2, 1]),
                a_record("www.example.", [192, 0, 2, 2]),
                a_record("mail.example.", [192, 0, 2, 3]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn builds_and_reads_back() {
        let contents = sample();
        assert_eq!(contents.serial(), 1);
        assert_eq!(contents.rrset(&name("www.example."), Rtype::A).unwrap().len(), 2);
        assert_eq!(contents.max_ttl(), 3600);
        assert!(!contents.is_dnssec());
        assert!(contents.size() > 0);
    }

    #[test]
    fn rejects_out_of_zone_records() {
        let result = ZoneContents::from_records(
            name("example."),
            vec![soa_record(1), a_record("www.elsewhere.", [192, 0, 2, 1])],
        );
        assert_eq!(result.err(), Some(Error::Invalid));
    }

    #[test]
    fn apply_changeset() {
        let contents = sample();

        let mut removal = RRset::new(name("www.example."), Rtype::A, Class::IN, 300);
        removal.push(Rdata::new(vec![192, 0, 2, 1]));
        let mut ch = Changeset::new(Some(contents.soa_record()), soa_record(2));
        ch.remove(removal);
        let mut addition = RRset::new(name("ftp.example."), Rtype::A, Class::IN, 300);
        addition.push(Rdata::new(vec![192, 0, 2, 9]));
        ch.add(addition);

        let next = contents.apply(&ch).unwrap();
        assert_eq!(next.serial(), 2);
        assert_eq!(next.rrset(&name("www.example."), Rtype::A).unwrap().len(), 1);
        assert!(next.rrset(&name("ftp.example."), Rtype::A).is_some());

        // The old version is untouched.
        assert_eq!(contents.serial(), 1);
        assert_eq!(contents.rrset(&name("www.example."), Rtype::A).unwrap().len(), 2);
    }

    #[test]
    fn apply_rejects_wrong_base() {
        let contents = sample();
        let ch = Changeset::new(Some(soa_record(7)), soa_record(8));
        assert_eq!(contents.apply(&ch).err(), Some(Error::Invalid));
    }

    #[test]
    fn apply_rejects_removal_of_absent_record() {
        let contents = sample();
        let mut removal = RRset::new(name("www.example."), Rtype::A, Class::IN, 300);
        removal.push(Rdata::new(vec![203, 0, 113, 1]));
        let mut ch = Changeset::new(Some(contents.soa_record()), soa_record(2));
        ch.remove(removal);
        assert_eq!(contents.apply(&ch).err(), Some(Error::Invalid));
    }

    #[test]
    fn baseline_round_trip() {
        let contents = sample();
        let baseline = contents.to_baseline();
        assert!(baseline.is_baseline());
        let rebuilt = ZoneContents::from_baseline(&baseline).unwrap();
        assert_eq!(rebuilt.serial(), contents.serial());
        assert_eq!(rebuilt.to_records(), contents.to_records());
    }

    #[test]
    fn replay_reproduces_contents() {
        // Replaying (baseline, C1..Cn) reproduces the directly-updated
        // result.
        let mut live = sample();
        let baseline = live.to_baseline();
        let mut chain = Vec::new();

        for step in 0u32..5 {
            let serial = live.serial();
            let mut ch = Changeset::new(Some(live.soa_record()), soa_record(serial + 1));
            let mut addition = RRset::new(
                name(&format!("h{step}.example.")),
                Rtype::A,
                Class::IN,
                300,
            );
            addition.push(Rdata::new(vec![192, 0, 2, 100 + step as u8]));
            ch.add(addition);
            if step == 3 {
                let mut removal = RRset::new(name("mail.example."), Rtype::A, Class::IN, 300);
                removal.push(Rdata::new(vec![192, 0, 2, 3]));
                ch.remove(removal);
            }
            live = live.apply(&ch).unwrap();
            chain.push(ch);
        }

        let mut replayed = ZoneContents::from_baseline(&baseline).unwrap();
        for ch in &chain {
            replayed = replayed.apply(ch).unwrap();
        }
        assert_eq!(replayed.to_records(), live.to_records());
        assert_eq!(replayed.serial(), live.serial());
    }

    #[test]
    fn nsec3param_is_parsed() {
        let nsec3param = Record::new(
            name("example."),
            Rtype::NSEC3PARAM,
            Class::IN,
            0,
            Rdata::new(vec![1, 0, 0, 10, 2, 0xab, 0xcd]),
        );
        let contents = ZoneContents::from_records(
            name("example."),
            vec![soa_record(1), nsec3param],
        )
        .unwrap();
        let params = contents.nsec3_params().unwrap();
        assert_eq!(params.algorithm, 1);
        assert_eq!(params.iterations, 10);
        assert_eq!(params.salt.as_ref(), &[0xab, 0xcd]);
    }
}
