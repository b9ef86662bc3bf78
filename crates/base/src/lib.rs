//! DNS data types for [Sluice].
//!
//! [Sluice]: https://nlnetlabs.nl/projects/sluice
//!
//! This crate provides the data model shared by every part of Sluice:
//!
//! - Wire-format domain names with DNSSEC canonical ordering.
//! - RFC 1982 serial arithmetic.
//! - Resource records, record sets and their wire encoding.
//! - Changesets (additions and removals between two zone serials).
//!
//! The types here carry *data* only; parsing DNS packets, transports and
//! zone-file text are the business of other components.

pub mod changeset;
pub mod dname;
pub mod rrset;
pub mod serial;
pub mod wire;

pub use changeset::Changeset;
pub use dname::DomainName;
pub use rrset::{Class, RRset, Rdata, Record, Rtype};
pub use serial::SerialCmp;
