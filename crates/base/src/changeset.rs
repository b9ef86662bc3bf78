//! Changesets between zone versions.

use std::fmt;

use crate::dname::DomainName;
use crate::rrset::{RRset, Record, Rtype, SoaFields};
use crate::serial::{SerialCmp, serial_cmp};

//----------- Changeset --------------------------------------------------------

/// A delta between two versions of a zone.
///
/// A changeset removes `removals` and adds `additions`, taking the zone from
/// the version identified by `soa_from` to the one identified by `soa_to`.
/// The SOA records themselves are carried separately and are not listed
/// among the removals or additions.
///
/// A changeset without `soa_from` is a *baseline*: it carries a complete
/// zone as its additions and anchors a diff chain (the "zone in journal"
/// record).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Changeset {
    /// The SOA record of the version this changeset applies to.
    pub soa_from: Option<Record>,

    /// The SOA record of the version this changeset produces.
    pub soa_to: Record,

    /// The record sets removed by this changeset.
    pub removals: Vec<RRset>,

    /// The record sets added by this changeset.
    pub additions: Vec<RRset>,
}

impl Changeset {
    /// Construct an empty changeset between two SOA records.
    pub fn new(soa_from: Option<Record>, soa_to: Record) -> Self {
        debug_assert_eq!(soa_to.rtype, Rtype::SOA);
        Self {
            soa_from,
            soa_to,
            removals: Vec::new(),
            additions: Vec::new(),
        }
    }

    /// Whether this changeset is a whole-zone baseline.
    pub fn is_baseline(&self) -> bool {
        self.soa_from.is_none()
    }

    /// The serial this changeset applies to.
    ///
    /// Baselines report serial 0; their position in the chain comes from the
    /// journal key, not from the data.
    pub fn from_serial(&self) -> u32 {
        self.soa_from
            .as_ref()
            .and_then(|soa| SoaFields::serial_of(&soa.rdata).ok())
            .unwrap_or(0)
    }

    /// The serial this changeset produces.
    pub fn to_serial(&self) -> u32 {
        SoaFields::serial_of(&self.soa_to.rdata).unwrap_or(0)
    }

    /// The apex this changeset belongs to.
    pub fn apex(&self) -> &DomainName {
        &self.soa_to.owner
    }

    /// Whether the changeset changes nothing.
    pub fn is_empty(&self) -> bool {
        self.removals.iter().all(RRset::is_empty) && self.additions.iter().all(RRset::is_empty)
    }

    /// Record a removed record set.
    pub fn remove(&mut self, rrset: RRset) {
        if !rrset.is_empty() {
            self.removals.push(rrset);
        }
    }

    /// Record an added record set.
    pub fn add(&mut self, rrset: RRset) {
        if !rrset.is_empty() {
            self.additions.push(rrset);
        }
    }

    /// A rough measure of the serialized size, in bytes.
    pub fn serialized_size(&self) -> usize {
        let soas = self.soa_to.wire_len()
            + self.soa_from.as_ref().map_or(0, Record::wire_len);
        let sets = self
            .removals
            .iter()
            .chain(self.additions.iter())
            .map(RRset::wire_len)
            .sum::<usize>();
        soas + sets
    }

    /// Check that the serial step of this changeset is sound.
    ///
    /// A changeset must move strictly forward in serial arithmetic.
    pub fn check_serials(&self) -> Result<(), SerialStepError> {
        if self.is_baseline() {
            return Ok(());
        }
        match serial_cmp(self.from_serial(), self.to_serial()) {
            SerialCmp::Lower => Ok(()),
            _ => Err(SerialStepError {
                from: self.from_serial(),
                to: self.to_serial(),
            }),
        }
    }
}

//----------- SerialStepError --------------------------------------------------

/// A changeset whose serials do not step forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SerialStepError {
    pub from: u32,
    pub to: u32,
}

impl std::error::Error for SerialStepError {}

impl fmt::Display for SerialStepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "changeset serial does not advance (from {} to {})",
            self.from, self.to
        )
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rrset::{Class, Rdata};

    fn soa(owner: &str, serial: u32) -> Record {
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
            owner.parse().unwrap(),
            Rtype::SOA,
            Class::IN,
            3600,
            fields.to_rdata(),
        )
    }

    #[test]
    fn serials() {
        let ch = Changeset::new(Some(soa("example.", 7)), soa("example.", 8));
        assert_eq!(ch.from_serial(), 7);
        assert_eq!(ch.to_serial(), 8);
        assert!(ch.check_serials().is_ok());
        assert!(ch.is_empty());

        let backwards = Changeset::new(Some(soa("example.", 8)), soa("example.", 8));
        assert!(backwards.check_serials().is_err());
    }

    #[test]
    fn baseline() {
        let mut ch = Changeset::new(None, soa("example.", 100));
        assert!(ch.is_baseline());

        let mut a = RRset::new("www.example.".parse().unwrap(), Rtype::A, Class::IN, 300);
        a.push(Rdata::new(vec![192, 0, 2, 1]));
        ch.add(a);
        assert!(!ch.is_empty());
        assert!(ch.check_serials().is_ok());
    }
}
