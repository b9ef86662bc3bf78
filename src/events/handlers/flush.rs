//! The flush event: write the zone to its snapshot file.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::debug;

use crate::config::Config;
use crate::error::Result;
use crate::util::unix_now;
use crate::zone::{Zone, snapshot};

pub fn event_flush(conf: &Arc<Config>, zone: &Arc<Zone>) -> Result<()> {
    flush_now(conf, zone)
}

/// Write the current contents to the snapshot and advance the journal's
/// flush horizon.
///
/// Also called directly when a journal insert returns the flush hand-off.
pub(crate) fn flush_now(conf: &Arc<Config>, zone: &Arc<Zone>) -> Result<()> {
    let contents = zone.expect_contents()?;
    let path = zone.snapshot_path(conf);
    snapshot::store(&path, &contents)?;
    zone.snapshot_exists.store(true, Ordering::Relaxed);
    zone.journal.mark_flushed()?;

    {
        let mut timers = zone.timers.lock().unwrap();
        timers.last_flush = unix_now();
    }
    zone.save_state(conf);

    debug!(
        "zone '{}': flushed serial {} to '{path}'",
        zone.name,
        contents.serial()
    );
    Ok(())
}
