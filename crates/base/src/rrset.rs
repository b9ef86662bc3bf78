//! Resource records and record sets.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::dname::DomainName;
use crate::wire::{ParseError, WireBuf, WireRead};

//----------- Rtype ------------------------------------------------------------

/// A resource record type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rtype(pub u16);

impl Rtype {
    pub const A: Self = Self(1);
    pub const NS: Self = Self(2);
    pub const CNAME: Self = Self(5);
    pub const SOA: Self = Self(6);
    pub const PTR: Self = Self(12);
    pub const MX: Self = Self(15);
    pub const TXT: Self = Self(16);
    pub const AAAA: Self = Self(28);
    pub const SRV: Self = Self(33);
    pub const DS: Self = Self(43);
    pub const RRSIG: Self = Self(46);
    pub const NSEC: Self = Self(47);
    pub const DNSKEY: Self = Self(48);
    pub const NSEC3: Self = Self(50);
    pub const NSEC3PARAM: Self = Self(51);
    pub const CDS: Self = Self(59);
    pub const CDNSKEY: Self = Self(60);
    pub const ANY: Self = Self(255);
}

impl fmt::Display for Rtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::A => "A",
            Self::NS => "NS",
            Self::CNAME => "CNAME",
            Self::SOA => "SOA",
            Self::PTR => "PTR",
            Self::MX => "MX",
            Self::TXT => "TXT",
            Self::AAAA => "AAAA",
            Self::SRV => "SRV",
            Self::DS => "DS",
            Self::RRSIG => "RRSIG",
            Self::NSEC => "NSEC",
            Self::DNSKEY => "DNSKEY",
            Self::NSEC3 => "NSEC3",
            Self::NSEC3PARAM => "NSEC3PARAM",
            Self::CDS => "CDS",
            Self::CDNSKEY => "CDNSKEY",
            // Unknown types print in the RFC 3597 generic form.
            Self(value) => return write!(f, "TYPE{value}"),
        };
        f.write_str(name)
    }
}

//----------- Class ------------------------------------------------------------

/// A resource record class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Class(pub u16);

impl Class {
    pub const IN: Self = Self(1);

    /// The NONE class, used by dynamic updates to delete specific records.
    pub const NONE: Self = Self(254);

    /// The ANY class, used by dynamic updates to delete whole record sets.
    pub const ANY: Self = Self(255);
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IN => f.write_str("IN"),
            Self::NONE => f.write_str("NONE"),
            Self::ANY => f.write_str("ANY"),
            Self(value) => write!(f, "CLASS{value}"),
        }
    }
}

//----------- Rdata ------------------------------------------------------------

/// The opaque RDATA of a resource record.
///
/// The ordering is by the raw wire bytes, which is exactly the DNSSEC
/// canonical RDATA order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Rdata(pub Bytes);

impl Rdata {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Rdata {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

//----------- Record -----------------------------------------------------------

/// A single resource record.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Record {
    pub owner: DomainName,
    pub rtype: Rtype,
    pub class: Class,
    pub ttl: u32,
    pub rdata: Rdata,
}

impl Record {
    pub fn new(owner: DomainName, rtype: Rtype, class: Class, ttl: u32, rdata: Rdata) -> Self {
        Self {
            owner,
            rtype,
            class,
            ttl,
            rdata,
        }
    }

    /// The wire size of this record.
    pub fn wire_len(&self) -> usize {
        self.owner.wire_len() + 10 + self.rdata.len()
    }

    /// Append this record in wire format.
    pub fn write_wire(&self, buf: &mut WireBuf) {
        self.owner.write_wire(buf);
        buf.put_u16(self.rtype.0);
        buf.put_u16(self.class.0);
        buf.put_u32(self.ttl);
        buf.put_u16(self.rdata.len() as u16);
        buf.put_slice(self.rdata.as_slice());
    }

    /// Read one record from a wire reader.
    pub fn parse_wire(read: &mut WireRead<'_>) -> Result<Self, ParseError> {
        let owner = DomainName::parse_wire(read)?;
        let rtype = Rtype(read.get_u16()?);
        let class = Class(read.get_u16()?);
        let ttl = read.get_u32()?;
        let rdlen = read.get_u16()? as usize;
        let rdata = Rdata(Bytes::copy_from_slice(read.take(rdlen)?));
        Ok(Self {
            owner,
            rtype,
            class,
            ttl,
            rdata,
        })
    }
}

impl DomainName {
    /// Append this name in wire format.
    pub fn write_wire(&self, buf: &mut WireBuf) {
        buf.put_slice(self.as_wire());
    }
}

//----------- RRset ------------------------------------------------------------

/// A set of resource records sharing owner, type and class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RRset {
    pub owner: DomainName,
    pub rtype: Rtype,
    pub class: Class,

    /// The TTL shared by every record in the set.
    ///
    /// TTLs are normalized when the zone is loaded, so a single value
    /// suffices.
    pub ttl: u32,

    /// The RDATA of the member records.
    ///
    /// Sorted canonically (by wire bytes) whenever the set is signed,
    /// compared or transferred; see [`RRset::sort_canonical`].
    pub rdatas: Vec<Rdata>,
}

impl RRset {
    /// Construct a new, empty [`RRset`].
    pub fn new(owner: DomainName, rtype: Rtype, class: Class, ttl: u32) -> Self {
        Self {
            owner,
            rtype,
            class,
            ttl,
            rdatas: Vec::new(),
        }
    }

    /// Whether the set holds no records.
    pub fn is_empty(&self) -> bool {
        self.rdatas.is_empty()
    }

    /// The number of records in the set.
    pub fn len(&self) -> usize {
        self.rdatas.len()
    }

    /// Add one RDATA to the set.
    pub fn push(&mut self, rdata: Rdata) {
        self.rdatas.push(rdata);
    }

    /// Whether the set contains the given RDATA.
    pub fn contains(&self, rdata: &Rdata) -> bool {
        self.rdatas.iter().any(|r| r == rdata)
    }

    /// Sort the RDATA into canonical order and drop duplicates.
    pub fn sort_canonical(&mut self) {
        self.rdatas.sort_unstable();
        self.rdatas.dedup();
    }

    /// The summed wire size of the member records.
    pub fn wire_len(&self) -> usize {
        let per_rr = self.owner.wire_len() + 10;
        self.rdatas.len() * per_rr + self.rdatas.iter().map(Rdata::len).sum::<usize>()
    }

    /// Append the member records in canonical wire form.
    ///
    /// The owner is lowercased and the records are emitted in canonical
    /// RDATA order, as required for signing and signature verification.
    pub fn write_canonical_wire(&self, buf: &mut WireBuf) {
        let owner = self.owner.to_lowercase();
        let mut rdatas: Vec<&Rdata> = self.rdatas.iter().collect();
        rdatas.sort_unstable();
        for rdata in rdatas {
            owner.write_wire(buf);
            buf.put_u16(self.rtype.0);
            buf.put_u16(self.class.0);
            buf.put_u32(self.ttl);
            buf.put_u16(rdata.len() as u16);
            buf.put_slice(rdata.as_slice());
        }
    }

    /// Split the set into individual records.
    pub fn to_records(&self) -> Vec<Record> {
        self.rdatas
            .iter()
            .map(|rdata| {
                Record::new(
                    self.owner.clone(),
                    self.rtype,
                    self.class,
                    self.ttl,
                    rdata.clone(),
                )
            })
            .collect()
    }

    /// Collect records of one (owner, type, class) into a set.
    ///
    /// The records' TTLs are normalized to the minimum among them.
    pub fn from_records(records: &[Record]) -> Option<Self> {
        let first = records.first()?;
        let mut set = Self::new(first.owner.clone(), first.rtype, first.class, first.ttl);
        for record in records {
            set.ttl = set.ttl.min(record.ttl);
            set.push(record.rdata.clone());
        }
        Some(set)
    }
}

//----------- SOA helpers ------------------------------------------------------

/// Fields of an SOA RDATA.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SoaFields {
    pub mname: DomainName,
    pub rname: DomainName,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

impl SoaFields {
    /// Parse SOA RDATA.
    pub fn parse(rdata: &Rdata) -> Result<Self, ParseError> {
        let mut read = WireRead::new(rdata.as_slice());
        let fields = Self {
            mname: DomainName::parse_wire(&mut read)?,
            rname: DomainName::parse_wire(&mut read)?,
            serial: read.get_u32()?,
            refresh: read.get_u32()?,
            retry: read.get_u32()?,
            expire: read.get_u32()?,
            minimum: read.get_u32()?,
        };
        if !read.is_empty() {
            return Err(ParseError::Malformed);
        }
        Ok(fields)
    }

    /// Assemble SOA RDATA.
    pub fn to_rdata(&self) -> Rdata {
        let mut buf = WireBuf::with_capacity(self.mname.wire_len() + self.rname.wire_len() + 20);
        self.mname.write_wire(&mut buf);
        self.rname.write_wire(&mut buf);
        buf.put_u32(self.serial);
        buf.put_u32(self.refresh);
        buf.put_u32(self.retry);
        buf.put_u32(self.expire);
        buf.put_u32(self.minimum);
        Rdata(buf.freeze())
    }

    /// Extract just the serial from SOA RDATA.
    pub fn serial_of(rdata: &Rdata) -> Result<u32, ParseError> {
        Ok(Self::parse(rdata)?.serial)
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> DomainName {
        s.parse().unwrap()
    }

    #[test]
    fn rtype_names() {
        assert_eq!(Rtype::SOA.to_string(), "SOA");
        assert_eq!(Rtype(4242).to_string(), "TYPE4242");
    }

    #[test]
    fn canonical_rdata_order() {
        let mut set = RRset::new(name("www.example."), Rtype::A, Class::IN, 300);
        set.push(Rdata::new(vec![192, 0, 2, 9]));
        set.push(Rdata::new(vec![192, 0, 2, 1]));
        set.push(Rdata::new(vec![10, 0, 0, 1]));
        set.push(Rdata::new(vec![192, 0, 2, 1]));
        set.sort_canonical();
        assert_eq!(
            set.rdatas,
            vec![
                Rdata::new(vec![10, 0, 0, 1]),
                Rdata::new(vec![192, 0, 2, 1]),
                Rdata::new(vec![192, 0, 2, 9]),
            ]
        );
    }

    #[test]
    fn record_wire_round_trip() {
        let record = Record::new(
            name("www.example.com."),
            Rtype::AAAA,
            Class::IN,
            3600,
            Rdata::new(vec![0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]),
        );
        let mut buf = WireBuf::new();
        record.write_wire(&mut buf);
        let bytes = buf.freeze();
        let mut read = WireRead::new(&bytes);
        let parsed = Record::parse_wire(&mut read).unwrap();
        assert!(read.is_empty());
        assert_eq!(parsed, record);
    }

    #[test]
    fn soa_round_trip() {
        let soa = SoaFields {
            mname: name("ns1.example.com."),
            rname: name("hostmaster.example.com."),
            serial: 2024010101,
            refresh: 10800,
            retry: 3600,
            expire: 1209600,
            minimum: 300,
        };
        let rdata = soa.to_rdata();
        assert_eq!(SoaFields::parse(&rdata).unwrap(), soa);
        assert_eq!(SoaFields::serial_of(&rdata).unwrap(), 2024010101);
    }
}
