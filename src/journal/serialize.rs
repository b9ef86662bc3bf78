//! Serializing changesets into journal chunks.
//!
//! A changeset serializes as a plain stream of wire-format records:
//!
//! - a diff: the old SOA, the removed records, the new SOA, the added
//!   records; the second apex SOA doubles as the removals/additions
//!   divider, exactly as in incremental transfers;
//! - a baseline: the SOA followed by every other record of the zone.
//!
//! The stream is cut into chunks of at most [`CHUNK_THRESH`] payload
//! bytes, well under the hard chunk ceiling.  A chunk is only written if
//! its payload is non-empty: an empty chunk would be indistinguishable
//! from corruption when replaying.

use sluice_base::rrset::Record;
use sluice_base::{Changeset, RRset};

use crate::error::{Error, Result};
use crate::util::unix_now;

use super::{CHUNK_HEADER_SIZE, CHUNK_THRESH, Journal, Txn, chunk_key};

/// Flatten a changeset into its record stream.
pub(crate) fn changeset_stream(ch: &Changeset) -> Vec<u8> {
    let mut buf = sluice_base::wire::WireBuf::with_capacity(ch.serialized_size());
    if let Some(soa_from) = &ch.soa_from {
        soa_from.write_wire(&mut buf);
        for rrset in &ch.removals {
            for record in rrset.to_records() {
                record.write_wire(&mut buf);
            }
        }
    }
    ch.soa_to.write_wire(&mut buf);
    for rrset in &ch.additions {
        for record in rrset.to_records() {
            record.write_wire(&mut buf);
        }
    }
    buf.into_vec()
}

/// Parse a record stream back into a changeset.
pub(crate) fn parse_stream(data: &[u8], zij: bool) -> Result<Changeset> {
    let mut read = sluice_base::wire::WireRead::new(data);
    let first = Record::parse_wire(&mut read)?;
    if first.rtype != sluice_base::Rtype::SOA {
        return Err(Error::Invalid);
    }
    let apex = first.owner.clone();

    let mut ch;
    let mut removals: Vec<Record> = Vec::new();
    let mut additions: Vec<Record> = Vec::new();
    if zij {
        ch = Changeset::new(None, first);
        while !read.is_empty() {
            additions.push(Record::parse_wire(&mut read)?);
        }
    } else {
        let mut soa_to = None;
        while !read.is_empty() {
            let record = Record::parse_wire(&mut read)?;
            if record.rtype == sluice_base::Rtype::SOA && record.owner == apex {
                soa_to = Some(record);
                break;
            }
            removals.push(record);
        }
        let soa_to = soa_to.ok_or(Error::Invalid)?;
        ch = Changeset::new(Some(first), soa_to);
        while !read.is_empty() {
            additions.push(Record::parse_wire(&mut read)?);
        }
    }

    ch.removals = group_records(removals);
    ch.additions = group_records(additions);
    Ok(ch)
}

/// Group a record stream into record sets.
///
/// Consecutive records with matching owner, type, class and TTL fold into
/// one set; the writer emits them that way.
pub(crate) fn group_records(records: Vec<Record>) -> Vec<RRset> {
    let mut sets: Vec<RRset> = Vec::new();
    for record in records {
        match sets.last_mut() {
            Some(set)
                if set.owner == record.owner
                    && set.rtype == record.rtype
                    && set.class == record.class
                    && set.ttl == record.ttl =>
            {
                set.push(record.rdata);
            }
            _ => {
                let mut set = RRset::new(record.owner, record.rtype, record.class, record.ttl);
                set.push(record.rdata);
                sets.push(set);
            }
        }
    }
    sets
}

/// Sort records into canonical owner order, then by type and RDATA.
pub(crate) fn sort_records(records: &mut [Record]) {
    records.sort_by(|a, b| {
        a.owner
            .cmp(&b.owner)
            .then(a.rtype.cmp(&b.rtype))
            .then(a.rdata.cmp(&b.rdata))
    });
}

impl Journal {
    /// Stage the chunks of one serialized changeset.
    ///
    /// Returns the number of chunk-value bytes staged.
    pub(crate) fn write_chunks(
        &self,
        txn: &mut Txn<'_>,
        zij: bool,
        from: u32,
        to: u32,
        stream: &[u8],
    ) -> Result<u64> {
        if stream.is_empty() {
            return Err(Error::Invalid);
        }
        let now = unix_now();
        let mut written = 0u64;
        let chunk_payload = CHUNK_THRESH - CHUNK_HEADER_SIZE;
        for (index, piece) in stream.chunks(chunk_payload).enumerate() {
            // The chunker cannot produce an empty piece, but replay breaks
            // badly on empty chunks, so prove progress before each write.
            if piece.is_empty() {
                break;
            }
            let mut value = Vec::with_capacity(CHUNK_HEADER_SIZE + piece.len());
            value.extend_from_slice(&to.to_be_bytes());
            value.extend_from_slice(&now.to_be_bytes());
            value.extend_from_slice(piece);
            written += value.len() as u64;
            txn.insert(chunk_key(&self.zone, zij, from, index as u32), value);
        }
        Ok(written)
    }

    /// Stage a whole changeset, diff or baseline.
    pub(crate) fn write_changeset(&self, txn: &mut Txn<'_>, ch: &Changeset) -> Result<u64> {
        let stream = changeset_stream(ch);
        if ch.is_baseline() {
            self.write_chunks(txn, true, 0, ch.to_serial(), &stream)
        } else {
            self.write_chunks(txn, false, ch.from_serial(), ch.to_serial(), &stream)
        }
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_base::rrset::{Class, Rdata, Rtype, SoaFields};
    use sluice_base::DomainName;

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

    #[test]
    fn diff_stream_round_trip() {
        let mut ch = Changeset::new(Some(soa(1)), soa(2));
        ch.remove(a_set("old.example.", [192, 0, 2, 1]));
        ch.add(a_set("new.example.", [192, 0, 2, 2]));
        ch.add(a_set("other.example.", [192, 0, 2, 3]));

        let stream = changeset_stream(&ch);
        let parsed = parse_stream(&stream, false).unwrap();
        assert_eq!(parsed, ch);
        assert_eq!(parsed.from_serial(), 1);
        assert_eq!(parsed.to_serial(), 2);
    }

    #[test]
    fn baseline_stream_round_trip() {
        let mut ch = Changeset::new(None, soa(100));
        ch.add(a_set("www.example.", [192, 0, 2, 1]));

        let stream = changeset_stream(&ch);
        let parsed = parse_stream(&stream, true).unwrap();
        assert_eq!(parsed, ch);
        assert!(parsed.is_baseline());
    }

    #[test]
    fn grouping_folds_consecutive_records() {
        let mut set = a_set("www.example.", [192, 0, 2, 1]);
        set.push(Rdata::new(vec![192, 0, 2, 2]));
        let grouped = group_records(set.to_records());
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].len(), 2);
    }
}
