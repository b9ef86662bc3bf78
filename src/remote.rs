//! Interfaces to the transport collaborators.
//!
//! Zone event handlers speak to the outside world (SOA probes, zone
//! transfers, NOTIFY, dynamic updates toward the parent) through the
//! [`RemoteOps`] trait.  The packet codec and the sockets behind it are
//! separate components; the daemon links a real implementation in, and the
//! tests script one.

use std::time::Duration;

use tracing::debug;

use sluice_base::rrset::RRset;
use sluice_base::{Changeset, DomainName, Rdata};

use crate::error::{Error, Result};

//----------- Transfer ---------------------------------------------------------

/// The result of a zone transfer.
#[derive(Clone, Debug)]
pub enum Transfer {
    /// A full transfer: every record of the zone, the SOA included.
    Full(Vec<sluice_base::Record>),

    /// An incremental transfer: a chain of changesets.
    Incremental(Vec<Changeset>),
}

//----------- RemoteOps --------------------------------------------------------

/// Outbound DNS operations, with explicit per-operation timeouts.
pub trait RemoteOps: Send + Sync {
    /// Query a remote for the zone's SOA serial.
    fn probe_soa(&self, remote: &str, zone: &DomainName, timeout: Duration) -> Result<u32>;

    /// Transfer the zone from a remote.
    ///
    /// With `current` given, the remote may answer incrementally from that
    /// serial; without it, a full transfer is requested.
    fn transfer(
        &self,
        remote: &str,
        zone: &DomainName,
        current: Option<u32>,
        timeout: Duration,
    ) -> Result<Transfer>;

    /// Send a NOTIFY for the zone's serial.
    fn send_notify(
        &self,
        remote: &str,
        zone: &DomainName,
        serial: u32,
        timeout: Duration,
    ) -> Result<()>;

    /// Send a dynamic update replacing the zone's DS set at the parent.
    ///
    /// `ds_set` empty means remove-only.
    fn send_ds_update(
        &self,
        parent: &str,
        zone: &DomainName,
        ds_set: &RRset,
        timeout: Duration,
    ) -> Result<()>;

    /// Fetch the DS RDATAs the parent publishes for the zone.
    fn query_parent_ds(
        &self,
        parent: &str,
        zone: &DomainName,
        timeout: Duration,
    ) -> Result<Vec<Rdata>>;

    /// Publish the zone's DNSKEY set to an external endpoint.
    fn publish_dnskeys(
        &self,
        endpoint: &str,
        zone: &DomainName,
        dnskeys: &RRset,
        timeout: Duration,
    ) -> Result<()>;
}

//----------- NullRemote -------------------------------------------------------

/// A remote backend with no transport attached.
///
/// Every operation times out.  Useful for running the event machinery
/// without network plumbing; the affected handlers log and retry per
/// their own policy.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullRemote;

impl RemoteOps for NullRemote {
    fn probe_soa(&self, remote: &str, zone: &DomainName, _timeout: Duration) -> Result<u32> {
        debug!("zone '{zone}': no transport to probe '{remote}'");
        Err(Error::Timeout)
    }

    fn transfer(
        &self,
        remote: &str,
        zone: &DomainName,
        _current: Option<u32>,
        _timeout: Duration,
    ) -> Result<Transfer> {
        debug!("zone '{zone}': no transport to transfer from '{remote}'");
        Err(Error::Timeout)
    }

    fn send_notify(
        &self,
        remote: &str,
        zone: &DomainName,
        _serial: u32,
        _timeout: Duration,
    ) -> Result<()> {
        debug!("zone '{zone}': no transport to notify '{remote}'");
        Err(Error::Timeout)
    }

    fn send_ds_update(
        &self,
        parent: &str,
        zone: &DomainName,
        _ds_set: &RRset,
        _timeout: Duration,
    ) -> Result<()> {
        debug!("zone '{zone}': no transport for DS update toward '{parent}'");
        Err(Error::Timeout)
    }

    fn query_parent_ds(
        &self,
        parent: &str,
        zone: &DomainName,
        _timeout: Duration,
    ) -> Result<Vec<Rdata>> {
        debug!("zone '{zone}': no transport to query '{parent}'");
        Err(Error::Timeout)
    }

    fn publish_dnskeys(
        &self,
        endpoint: &str,
        zone: &DomainName,
        _dnskeys: &RRset,
        _timeout: Duration,
    ) -> Result<()> {
        debug!("zone '{zone}': no transport to publish keys to '{endpoint}'");
        Err(Error::Timeout)
    }
}
