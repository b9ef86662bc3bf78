//! Update-freeze and update-thaw.
//!
//! While update-frozen, freezable events accumulate in the zone's slots
//! but do not dispatch; on thaw they fire in scheduled-time order.  The
//! freeze events themselves are not freezable, so a frozen zone can
//! always be thawed.

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::zone::Zone;

pub fn event_ufreeze(_conf: &Arc<Config>, zone: &Arc<Zone>) -> Result<()> {
    zone.events.set_ufrozen(true);
    info!("zone '{}': zone updates frozen", zone.name);
    Ok(())
}

pub fn event_uthaw(_conf: &Arc<Config>, zone: &Arc<Zone>) -> Result<()> {
    zone.events.set_ufrozen(false);
    info!("zone '{}': zone updates unfrozen", zone.name);
    // The accumulated events re-arm when this handler's run completes.
    Ok(())
}
