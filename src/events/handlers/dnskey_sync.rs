//! The DNSKEY-sync event: publish the keyset to external endpoints.

use std::sync::Arc;

use tracing::{debug, warn};

use sluice_base::rrset::Rtype;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::zone::Zone;

pub fn event_dnskey_sync(conf: &Arc<Config>, zone: &Arc<Zone>) -> Result<()> {
    let entry = conf.zone(&zone.name).ok_or(Error::NotFound)?;
    if entry.dnskey_sync.is_empty() {
        return Ok(());
    }
    let contents = zone.expect_contents()?;
    let Some(dnskeys) = contents.rrset(&zone.name, Rtype::DNSKEY) else {
        return Ok(());
    };
    let server = zone.server()?;
    let timeout = conf.remote.io_timeout();

    let mut last_err = None;
    for endpoint in &entry.dnskey_sync {
        match server
            .remote
            .publish_dnskeys(endpoint, &zone.name, dnskeys, timeout)
        {
            Ok(()) => {
                debug!("zone '{}': DNSKEY set published to '{endpoint}'", zone.name);
            }
            Err(err) => {
                warn!(
                    "zone '{}': DNSKEY sync to '{endpoint}' failed ({err})",
                    zone.name
                );
                last_err = Some(err);
            }
        }
    }
    match last_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
