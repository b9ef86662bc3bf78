//! Writing, merging and evicting journal changesets.
//!
//! The occupancy machinery mirrors the cooperative contract of the journal:
//! before a new changeset is admitted, old flushed changesets are deleted
//! or merged into a running composite record.  When the zone is allowed to
//! flush instead, the caller is handed [`Error::Busy`] with all partial
//! work committed, flushes the zone, and retries.

use foldhash::HashMap;

use sluice_base::Changeset;
use sluice_base::rrset::Record;

use crate::error::{Error, Result};

use super::serialize::{group_records, sort_records};
use super::{
    Journal, MD_FLUSHED_VALID, MD_MERGED_VALID, MD_SERIAL_TO_VALID, Metadata, Txn,
    changeset_prefix,
};

impl Metadata {
    /// Account for a newly written diff changeset.
    fn after_insert(&mut self, from: u32, to: u32, bytes: u64) {
        if !self.serial_to_valid() {
            self.first_serial = from;
            self.flags |= MD_SERIAL_TO_VALID;
        }
        if !self.flushed_valid() {
            self.flushed_upto = self.first_serial;
            self.flags |= MD_FLUSHED_VALID;
        }
        self.serial_to = to;
        self.changeset_count += 1;
        self.occupied += bytes;
    }

    /// Account for an extra changeset (a second edge onto `serial_to`).
    fn after_extra(&mut self, bytes: u64) {
        self.changeset_count += 1;
        self.occupied += bytes;
    }

    /// Account for deleted changesets.
    fn after_delete(&mut self, stopped_at: u32, removed: u64, freed: u64) {
        self.first_serial = stopped_at;
        self.changeset_count = self.changeset_count.saturating_sub(removed as u32);
        self.occupied = self.occupied.saturating_sub(freed);
    }
}

impl Journal {
    /// Store a whole-zone baseline, purging prior content of the zone.
    pub fn insert_zone(&self, baseline: &Changeset) -> Result<()> {
        if !baseline.is_baseline() {
            return Err(Error::Invalid);
        }
        if baseline.serialized_size() as u64 >= self.max_usage {
            return Err(Error::OutOfSpace);
        }

        let mut txn = self.begin();
        self.purge(&mut txn)?;
        let written = self.write_changeset(&mut txn, baseline)?;

        let serial = baseline.to_serial();
        let md = Metadata {
            flags: MD_SERIAL_TO_VALID,
            first_serial: serial,
            flushed_upto: 0,
            serial_to: serial,
            merged_serial: 0,
            changeset_count: 0,
            occupied: written,
        };
        self.store_metadata(&mut txn, &md);
        txn.commit()
    }

    /// Store a diff changeset, with an optional extra changeset arriving at
    /// the same target serial from a different source serial.
    ///
    /// Returns [`Error::Busy`] when the caller must flush the zone and
    /// retry; everything staged so far is committed in that case.
    pub fn insert(&self, ch: &Changeset, extra: Option<&Changeset>) -> Result<()> {
        if ch.is_baseline() {
            return Err(Error::Invalid);
        }
        ch.check_serials()?;
        let mut ch_size = ch.serialized_size() as u64;
        if let Some(extra) = extra {
            if extra.to_serial() != ch.to_serial() || extra.from_serial() == ch.from_serial() {
                return Err(Error::Invalid);
            }
            extra.check_serials()?;
        }

        let mut txn = self.begin();
        let mut md = self.load_metadata(&txn)?;

        if let Some(extra) = extra {
            if self.contains(&txn, true, 0)? {
                return Err(Error::Invalid);
            }
            // The merged record and the extra changeset serve the same
            // clients; replace the one with the other.
            if md.merged_valid() {
                if let Some((freed, _)) = self.delete_one(&mut txn, false, md.merged_serial)? {
                    md.changeset_count = md.changeset_count.saturating_sub(1);
                    md.occupied = md.occupied.saturating_sub(freed);
                }
                md.merged_serial = 0;
                md.flags &= !MD_MERGED_VALID;
            }
            ch_size += extra.serialized_size() as u64;
            md.flushed_upto = md.serial_to;
            md.flags |= MD_FLUSHED_VALID;
        }

        if ch_size >= self.max_usage {
            return Err(Error::OutOfSpace);
        }

        self.fix_occupation(
            &mut txn,
            &mut md,
            self.max_usage as i64 - ch_size as i64,
            self.max_changesets as i64 - 1,
        )?;

        // Avoid discontinuity: a diff must attach to the chain end.  With a
        // baseline present that is a semantic error; without one, the stale
        // chain is wiped and reseeded.
        if md.serial_to_valid() && md.serial_to != ch.from_serial() {
            if self.contains(&txn, true, 0)? {
                return Err(Error::Invalid);
            }
            self.purge(&mut txn)?;
            md = Metadata::default();
        }

        // Avoid a cycle: if the target serial is already a chain position,
        // collapse the chain to a single record first.
        if self.contains(&txn, false, ch.to_serial())? {
            self.fix_occupation(&mut txn, &mut md, i64::MAX, 1)?;
        }

        let written = self.write_changeset(&mut txn, ch)?;
        md.after_insert(ch.from_serial(), ch.to_serial(), written);

        if let Some(extra) = extra {
            let written = self.write_changeset(&mut txn, extra)?;
            md.after_extra(written);
        }

        self.store_metadata(&mut txn, &md);
        txn.commit()
    }

    /// Delete the record at one chain position.
    ///
    /// Returns the freed bytes and the record's `to` serial.
    fn delete_one(&self, txn: &mut Txn<'_>, zij: bool, from: u32) -> Result<Option<(u64, u32)>> {
        let chunks = txn.scan_prefix(&changeset_prefix(&self.zone, zij, from))?;
        let Some((_, first_value)) = chunks.first() else {
            return Ok(None);
        };
        let mut header = sluice_base::wire::WireRead::new(first_value);
        let to_serial = header.get_u32()?;

        let mut freed = 0u64;
        for (key, value) in chunks {
            freed += value.len() as u64;
            txn.remove(key);
        }
        Ok(Some((freed, to_serial)))
    }

    /// Walk the diff chain from `from`, deleting records until the byte and
    /// count budgets are both met or `stop_at` is reached.
    ///
    /// Returns the freed bytes, the number of deleted records and where the
    /// walk stopped.
    pub(crate) fn delete(
        &self,
        txn: &mut Txn<'_>,
        from: u32,
        tofree_bytes: u64,
        tofree_count: u64,
        stop_at: u32,
    ) -> Result<(u64, u64, u32)> {
        let mut freed = 0u64;
        let mut removed = 0u64;
        let mut cursor = from;
        while cursor != stop_at && (freed < tofree_bytes || removed < tofree_count) {
            let Some((bytes, to_serial)) = self.delete_one(txn, false, cursor)? else {
                break;
            };
            freed += bytes;
            removed += 1;
            cursor = to_serial;
        }
        Ok((freed, removed, cursor))
    }

    /// Merge the record at (`zij`, `merge_serial`) with every following
    /// diff into a single composite record, rewritten in place.
    ///
    /// The composite keeps the chain end serial, so continuity holds.
    /// Returns the number of diffs folded in.
    pub(crate) fn merge(
        &self,
        txn: &mut Txn<'_>,
        md: &mut Metadata,
        zij: bool,
        merge_serial: u32,
    ) -> Result<u32> {
        let Some(start) = self.read_stored(txn, zij, merge_serial)? else {
            return Ok(0);
        };
        let mut composite = start.changeset;
        let mut freed = 0u64;
        let mut merged = 0u32;
        let mut cursor = start.to_serial;

        loop {
            let Some(next) = self.read_stored(txn, false, cursor)? else {
                break;
            };
            merge_changesets(&mut composite, &next.changeset);
            self.delete_one(txn, false, cursor)?;
            freed += next.size;
            merged += 1;
            cursor = next.to_serial;
        }
        if merged == 0 {
            return Ok(0);
        }

        // Rewrite the merge record itself.  Deleting first matters: the new
        // composite may have fewer chunks than the old record, and a
        // leftover tail chunk would corrupt replay.
        self.delete_one(txn, zij, merge_serial)?;
        freed += start.size;
        let written = self.write_changeset(txn, &composite)?;

        md.occupied = md.occupied.saturating_sub(freed) + written;
        md.changeset_count = md.changeset_count.saturating_sub(merged);
        if zij {
            // The baseline swallowed the whole diff chain; the chain now
            // starts (and ends) at the composite's serial.
            md.first_serial = cursor;
        }
        Ok(merged)
    }

    /// Consolidate the journal under occupancy pressure.
    ///
    /// With a baseline stored, old diffs fold into it.  Without one, and
    /// with zone flushing disabled, diffs fold into a running merged
    /// record.  With flushing enabled, the staged work is committed and
    /// [`Error::Busy`] asks the caller to flush the zone and retry.
    ///
    /// Returns whether any consolidation happened.
    pub(crate) fn try_flush(&self, txn: &mut Txn<'_>, md: &mut Metadata) -> Result<bool> {
        let mut progressed = false;

        if self.contains(&*txn, true, 0)? {
            progressed = self.merge(txn, md, true, 0)? > 0;
        } else if !self.flushable {
            let merge_serial = if md.merged_valid() {
                md.merged_serial
            } else {
                md.first_serial
            };
            progressed = self.merge(txn, md, false, merge_serial)? > 0;
            if progressed {
                md.merged_serial = merge_serial;
                md.flags |= MD_MERGED_VALID;
            }
        }

        if self.flushable {
            // Commit the partial job and ask the zone to flush itself.
            self.store_metadata(txn, md);
            txn.commit()?;
            return Err(Error::Busy);
        }

        Ok(progressed)
    }

    /// Iteratively delete and consolidate until the zone fits the limits.
    ///
    /// Fails with [`Error::OutOfSpace`] when no further progress is
    /// possible, and passes [`Error::Busy`] through from the flush
    /// hand-off.
    pub(crate) fn fix_occupation(
        &self,
        txn: &mut Txn<'_>,
        md: &mut Metadata,
        max_usage: i64,
        max_count: i64,
    ) -> Result<()> {
        loop {
            let need_free = (md.occupied as i64 - max_usage).max(0) as u64;
            let need_del = (md.changeset_count as i64 - max_count).max(0) as u64;
            if need_free == 0 && need_del == 0 {
                return Ok(());
            }

            let del_from = md.first_serial;
            let mut del_upto = if md.flushed_valid() {
                md.flushed_upto
            } else {
                md.first_serial
            };
            // With a baseline present, everything up to its serial is
            // covered by it and may go regardless of the flush horizon.
            if let Some(zij_to) = self.serial_to_of(&*txn, true, 0)? {
                del_upto = zij_to;
            }

            let (freed, removed, stopped_at) =
                self.delete(txn, del_from, need_free, need_del, del_upto)?;
            if freed > 0 {
                md.after_delete(stopped_at, removed, freed);
                continue;
            }

            if del_upto != md.serial_to && self.try_flush(txn, md)? {
                continue;
            }
            return Err(Error::OutOfSpace);
        }
    }
}

//----------- Changeset merging ------------------------------------------------

/// Fold `next` into `base`.
///
/// Removals and additions cancel pairwise; the surviving records keep the
/// canonical order.  The composite takes `next`'s target SOA.
fn merge_changesets(base: &mut Changeset, next: &Changeset) {
    let mut counts: HashMap<Record, i64> = HashMap::default();
    for set in &base.additions {
        for record in set.to_records() {
            *counts.entry(record).or_insert(0) += 1;
        }
    }
    for set in &base.removals {
        for record in set.to_records() {
            *counts.entry(record).or_insert(0) -= 1;
        }
    }
    for set in &next.removals {
        for record in set.to_records() {
            *counts.entry(record).or_insert(0) -= 1;
        }
    }
    for set in &next.additions {
        for record in set.to_records() {
            *counts.entry(record).or_insert(0) += 1;
        }
    }

    let mut removals = Vec::new();
    let mut additions = Vec::new();
    for (record, count) in counts {
        if count > 0 {
            additions.push(record);
        } else if count < 0 {
            removals.push(record);
        }
    }
    sort_records(&mut removals);
    sort_records(&mut additions);

    base.removals = group_records(removals);
    base.additions = group_records(additions);
    base.soa_to = next.soa_to.clone();
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JournalConfig;
    use sluice_base::DomainName;
    use sluice_base::rrset::{Class, RRset, Rdata, Rtype, SoaFields};
    use sluice_base::serial::{SerialCmp, serial_cmp};

    fn soa(serial: u32) -> Record {
        let fields = SoaFields {
            mname: "ns1.example.".parse().unwrap(),
            rname: "host.example.".parse().unwrap(),
            serial,
            refresh: 3600,
            retry: 600,
            expire: 86400,
            minimum: 300,
        };
        Record::new(
            "example.".parse().unwrap(),
            Rtype::SOA,
            Class::IN,
            3600,
            fields.to_rdata(),
        )
    }

    fn a_set(owner: &str, addr: [u8; 4]) -> RRset {
        let owner: DomainName = owner.parse().unwrap();
        let mut set = RRset::new(owner, Rtype::A, Class::IN, 300);
        set.push(Rdata::new(addr.to_vec()));
        set
    }

    fn diff(from: u32, to: u32) -> Changeset {
        let mut ch = Changeset::new(Some(soa(from)), soa(to));
        ch.add(a_set(&format!("host-{to}.example."), [192, 0, 2, (to % 250) as u8]));
        if from % 2 == 0 {
            ch.remove(a_set(&format!("host-{from}.example."), [192, 0, 2, (from % 250) as u8]));
        }
        ch
    }

    fn baseline(serial: u32) -> Changeset {
        let mut ch = Changeset::new(None, soa(serial));
        ch.add(a_set("www.example.", [192, 0, 2, 1]));
        ch.add(a_set("mail.example.", [192, 0, 2, 2]));
        ch
    }

    struct Rig {
        _dir: tempfile::TempDir,
        db: sled::Db,
    }

    impl Rig {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let db = sled::Config::new().path(dir.path()).open().unwrap();
            Self { _dir: dir, db }
        }

        fn journal(&self, config: &JournalConfig) -> Journal {
            let zone: DomainName = "example.".parse().unwrap();
            Journal::open(&self.db, &zone, config).unwrap()
        }
    }

    /// Every stored diff either hangs off the chain start or has a
    /// predecessor arriving at its from-serial.
    fn assert_chain_integrity(journal: &Journal) {
        let md = journal.metadata().unwrap();
        if !md.serial_to_valid() {
            return;
        }
        let txn = journal.begin();
        let mut cursor = md.first_serial;
        let mut steps = 0;
        while cursor != md.serial_to {
            let to = journal
                .serial_to_of(&txn, false, cursor)
                .unwrap()
                .unwrap_or_else(|| panic!("chain broken at serial {cursor}"));
            assert_eq!(serial_cmp(cursor, to), SerialCmp::Lower);
            cursor = to;
            steps += 1;
            assert!(steps <= md.changeset_count, "chain loops");
        }
        assert_eq!(steps, md.changeset_count);
    }

    #[test]
    fn insert_builds_a_chain() {
        let rig = Rig::new();
        let journal = rig.journal(&JournalConfig::default());

        journal.insert_zone(&baseline(100)).unwrap();
        journal.insert(&diff(100, 101), None).unwrap();
        journal.insert(&diff(101, 102), None).unwrap();

        let md = journal.metadata().unwrap();
        assert_eq!(md.changeset_count, 2);
        assert_eq!(md.first_serial, 100);
        assert_eq!(md.serial_to, 102);
        assert_chain_integrity(&journal);

        let chs = journal.changesets_from(100).unwrap();
        assert_eq!(chs.len(), 2);
        assert_eq!(chs[0].to_serial(), 101);
        assert_eq!(chs[1].to_serial(), 102);
    }

    #[test]
    fn rejects_backward_serials() {
        let rig = Rig::new();
        let journal = rig.journal(&JournalConfig::default());
        journal.insert_zone(&baseline(100)).unwrap();
        assert_eq!(
            journal.insert(&diff(100, 100), None),
            Err(Error::Invalid)
        );
    }

    #[test]
    fn discontinuity_with_baseline_is_semantic_error() {
        let rig = Rig::new();
        let journal = rig.journal(&JournalConfig::default());
        journal.insert_zone(&baseline(100)).unwrap();
        journal.insert(&diff(100, 101), None).unwrap();
        assert_eq!(journal.insert(&diff(105, 106), None), Err(Error::Invalid));
    }

    #[test]
    fn discontinuity_without_baseline_reseeds() {
        let config = JournalConfig {
            zonefile_sync: true,
            ..Default::default()
        };
        let rig = Rig::new();
        let journal = rig.journal(&config);
        journal.insert(&diff(1, 2), None).unwrap();
        journal.insert(&diff(7, 8), None).unwrap();

        let md = journal.metadata().unwrap();
        assert_eq!(md.first_serial, 7);
        assert_eq!(md.serial_to, 8);
        assert_eq!(md.changeset_count, 1);
        assert_chain_integrity(&journal);
    }

    #[test]
    fn occupancy_merges_into_baseline() {
        let config = JournalConfig {
            max_changesets: 2,
            ..Default::default()
        };
        let rig = Rig::new();
        let journal = rig.journal(&config);

        journal.insert_zone(&baseline(100)).unwrap();
        journal.insert(&diff(100, 101), None).unwrap();
        journal.insert(&diff(101, 102), None).unwrap();
        // The budget is two diffs; admitting the third consolidates.
        journal.insert(&diff(102, 103), None).unwrap();

        let md = journal.metadata().unwrap();
        assert!(md.changeset_count <= 2);
        assert_chain_integrity(&journal);

        // The baseline absorbed the folded diffs.
        let base = journal.baseline().unwrap().unwrap();
        assert_eq!(base.to_serial(), md.first_serial);
    }

    #[test]
    fn busy_asks_for_flush_then_succeeds() {
        let config = JournalConfig {
            max_changesets: 1,
            zonefile_sync: true,
            ..Default::default()
        };
        let rig = Rig::new();
        let journal = rig.journal(&config);

        journal.insert(&diff(1, 2), None).unwrap();
        // No flushed region to delete from; the journal hands the problem
        // back.
        assert_eq!(journal.insert(&diff(2, 3), None), Err(Error::Busy));

        // The zone flushes its snapshot, then retries.
        journal.mark_flushed().unwrap();
        journal.insert(&diff(2, 3), None).unwrap();

        let md = journal.metadata().unwrap();
        assert_eq!(md.serial_to, 3);
        assert_chain_integrity(&journal);
    }

    #[test]
    fn no_flush_config_keeps_merged_record() {
        let config = JournalConfig {
            max_changesets: 2,
            zonefile_sync: false,
            ..Default::default()
        };
        let rig = Rig::new();
        let journal = rig.journal(&config);

        journal.insert(&diff(1, 2), None).unwrap();
        journal.insert(&diff(2, 3), None).unwrap();
        journal.insert(&diff(3, 4), None).unwrap();

        let md = journal.metadata().unwrap();
        assert!(md.changeset_count <= 2);
        assert!(md.merged_valid());
        assert_chain_integrity(&journal);

        // The full history from the chain start is still replayable.
        let chs = journal.changesets_from(md.first_serial).unwrap();
        assert_eq!(chs.last().unwrap().to_serial(), 4);
    }

    #[test]
    fn oversized_changeset_is_rejected() {
        let config = JournalConfig {
            max_usage: 64,
            ..Default::default()
        };
        let rig = Rig::new();
        let journal = rig.journal(&config);
        assert_eq!(journal.insert_zone(&baseline(1)), Err(Error::OutOfSpace));
    }

    #[test]
    fn merge_cancels_opposing_changes() {
        let mut base = Changeset::new(Some(soa(1)), soa(2));
        base.add(a_set("a.example.", [192, 0, 2, 1]));
        base.add(a_set("b.example.", [192, 0, 2, 2]));

        let mut next = Changeset::new(Some(soa(2)), soa(3));
        next.remove(a_set("a.example.", [192, 0, 2, 1]));
        next.add(a_set("c.example.", [192, 0, 2, 3]));

        merge_changesets(&mut base, &next);
        assert_eq!(base.to_serial(), 3);
        assert!(base.removals.is_empty());
        let added: Vec<_> = base
            .additions
            .iter()
            .map(|set| set.owner.to_string())
            .collect();
        assert_eq!(added, vec!["b.example.", "c.example."]);
    }

    #[test]
    fn wipe_clears_everything() {
        let rig = Rig::new();
        let journal = rig.journal(&JournalConfig::default());
        journal.insert_zone(&baseline(100)).unwrap();
        journal.insert(&diff(100, 101), None).unwrap();
        journal.wipe().unwrap();
        assert_eq!(journal.metadata().unwrap(), Metadata::default());
        assert!(journal.baseline().unwrap().is_none());
    }
}
