//! Zone snapshots on disk.
//!
//! A snapshot is the zone's own wire serialization of a complete version:
//! a small header followed by the record stream, written atomically.
//! Parsing and producing zone-file *text* is the scanner collaborator's
//! business; the daemon persists and recovers zones through this format.

use camino::Utf8Path;

use sluice_base::DomainName;
use sluice_base::rrset::Record;
use sluice_base::wire::{WireBuf, WireRead};

use crate::error::{Error, Result};
use crate::util::write_file;

use super::contents::ZoneContents;

const MAGIC: &[u8; 4] = b"SLZ0";

/// Write a zone version to a snapshot file, atomically.
pub fn store(path: &Utf8Path, contents: &ZoneContents) -> Result<()> {
    let records = contents.to_records();

    let mut buf = WireBuf::with_capacity(contents.size() + 64);
    buf.put_slice(MAGIC);
    contents.apex().write_wire(&mut buf);
    buf.put_u32(records.len() as u32);
    for record in &records {
        record.write_wire(&mut buf);
    }

    write_file(path, buf.as_slice())?;
    Ok(())
}

/// Load a zone version from a snapshot file.
///
/// Returns `Ok(None)` if no snapshot exists.
pub fn load(path: &Utf8Path) -> Result<Option<ZoneContents>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let mut read = WireRead::new(&data);
    if read.take(4)? != MAGIC {
        return Err(Error::Invalid);
    }
    let apex = DomainName::parse_wire(&mut read)?;
    let count = read.get_u32()? as usize;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        records.push(Record::parse_wire(&mut read)?);
    }
    if !read.is_empty() {
        return Err(Error::Invalid);
    }

    Ok(Some(ZoneContents::from_records(apex, records)?))
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_base::Rdata;
    use sluice_base::rrset::{Class, Rtype, SoaFields};

    fn sample() -> ZoneContents {
        let apex: DomainName = "example.com.".parse().unwrap();
        let soa = SoaFields {
            mname: "ns1.example.com.".parse().unwrap(),
            rname: "host.example.com.".parse().unwrap(),
            serial: 42,
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
                    "www.example.com.".parse().unwrap(),
                    Rtype::A,
                    Class::IN,
                    300,
                    Rdata::new(vec![192, 0, 2, 1]),
                ),
            ],
        )
        .unwrap()
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from(dir.path().to_str().unwrap()).join("example.com.db");

        assert!(load(&path).unwrap().is_none());

        let contents = sample();
        store(&path, &contents).unwrap();
        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.serial(), 42);
        assert_eq!(loaded.to_records(), contents.to_records());
    }

    #[test]
    fn rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from(dir.path().to_str().unwrap()).join("bogus.db");
        std::fs::write(&path, b"definitely not a snapshot").unwrap();
        assert!(load(&path).is_err());
    }
}
