//! Reading changesets back out of the journal.

use sluice_base::Changeset;
use sluice_base::serial::{SerialCmp, serial_cmp};
use sluice_base::wire::WireRead;

use crate::error::{Error, Result};

use super::serialize::parse_stream;
use super::{CHUNK_HEADER_SIZE, Journal, Txn, changeset_prefix};

/// A changeset read from the journal, with its chunk bookkeeping.
#[derive(Clone, Debug)]
pub(crate) struct StoredChangeset {
    pub changeset: Changeset,

    /// The `to` serial from the chunk headers.
    pub to_serial: u32,

    /// When the record was written, from the chunk headers.
    pub write_time: u64,

    /// The summed size of the chunk values.
    pub size: u64,

    /// The number of chunks.
    pub chunk_count: u32,
}

impl Journal {
    /// Read the changeset stored at a chain position, if any.
    pub(crate) fn read_stored(
        &self,
        txn: &Txn<'_>,
        zij: bool,
        from: u32,
    ) -> Result<Option<StoredChangeset>> {
        let chunks = txn.scan_prefix(&changeset_prefix(&self.zone, zij, from))?;
        if chunks.is_empty() {
            return Ok(None);
        }

        let mut stream = Vec::new();
        let mut size = 0u64;
        let mut to_serial = 0;
        let mut write_time = 0;
        for (index, (key, value)) in chunks.iter().enumerate() {
            // Chunk indices are the key suffix; the scan returns them in
            // order.  A gap or an empty payload means the record is
            // damaged.
            let Some(suffix) = key.len().checked_sub(4).map(|at| &key[at..]) else {
                return Err(Error::Invalid);
            };
            let chunk_index = u32::from_be_bytes(suffix.try_into().expect("4-byte slice"));
            if chunk_index != index as u32 || value.len() <= CHUNK_HEADER_SIZE {
                return Err(Error::Invalid);
            }
            let mut header = WireRead::new(value);
            to_serial = header.get_u32()?;
            write_time = header.get_u64()?;
            stream.extend_from_slice(&value[CHUNK_HEADER_SIZE..]);
            size += value.len() as u64;
        }

        let changeset = parse_stream(&stream, zij)?;
        Ok(Some(StoredChangeset {
            changeset,
            to_serial,
            write_time,
            size,
            chunk_count: chunks.len() as u32,
        }))
    }

    /// The `to` serial of the record at a chain position, if present.
    pub(crate) fn serial_to_of(&self, txn: &Txn<'_>, zij: bool, from: u32) -> Result<Option<u32>> {
        let prefix = changeset_prefix(&self.zone, zij, from);
        let chunks = txn.scan_prefix(&prefix)?;
        let Some((_, value)) = chunks.first() else {
            return Ok(None);
        };
        let mut header = WireRead::new(value);
        Ok(Some(header.get_u32()?))
    }

    /// The whole-zone baseline, if one is stored.
    pub fn baseline(&self) -> Result<Option<Changeset>> {
        let txn = self.begin();
        Ok(self
            .read_stored(&txn, true, 0)?
            .map(|stored| stored.changeset))
    }

    /// Every diff changeset from `from` to the end of the chain, in order.
    ///
    /// Returns [`Error::NotFound`] if `from` does not sit on the chain.
    pub fn changesets_from(&self, from: u32) -> Result<Vec<Changeset>> {
        let txn = self.begin();
        let md = self.load_metadata(&txn)?;
        if !md.serial_to_valid() {
            return Err(Error::NotFound);
        }

        let mut out = Vec::new();
        let mut cursor = from;
        while serial_cmp(cursor, md.serial_to) == SerialCmp::Lower {
            let Some(stored) = self.read_stored(&txn, false, cursor)? else {
                return Err(Error::NotFound);
            };
            cursor = stored.to_serial;
            out.push(stored.changeset);
        }
        Ok(out)
    }
}

/// Read one stored changeset (baseline or diff) through a fresh view.
pub fn read_changeset(journal: &Journal, zij: bool, from: u32) -> Result<Option<Changeset>> {
    let txn = journal.begin();
    Ok(journal
        .read_stored(&txn, zij, from)?
        .map(|stored| stored.changeset))
}
