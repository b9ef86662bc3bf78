//! The notify event: tell the secondaries about a new serial.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::zone::Zone;

pub fn event_notify(conf: &Arc<Config>, zone: &Arc<Zone>) -> Result<()> {
    let entry = conf.zone(&zone.name).ok_or(Error::NotFound)?;
    if entry.secondaries.is_empty() {
        return Ok(());
    }
    let contents = zone.expect_contents()?;
    let serial = contents.serial();
    let server = zone.server()?;
    let timeout = conf.remote.io_timeout();

    let mut reached = 0;
    for secondary in &entry.secondaries {
        match server
            .remote
            .send_notify(secondary, &zone.name, serial, timeout)
        {
            Ok(()) => {
                debug!("zone '{}': notified '{secondary}', serial {serial}", zone.name);
                reached += 1;
            }
            Err(err) => {
                warn!("zone '{}': notify to '{secondary}' failed ({err})", zone.name);
            }
        }
    }

    if reached > 0 {
        let mut timers = zone.timers.lock().unwrap();
        timers.last_notified_serial = Some(serial);
    }
    Ok(())
}
