//! The expire event: drop a secondary that fell out of touch.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::events::EventKind;
use crate::util::unix_now;
use crate::zone::Zone;

/// Expire the zone: unpublish its contents and wait for a refresh to
/// bootstrap it again.
pub fn event_expire(conf: &Arc<Config>, zone: &Arc<Zone>) -> Result<()> {
    // The swap unpublishes atomically; readers holding the old version
    // keep it alive until they finish, then it is deep-freed.
    let expired = zone.switch_contents(None);
    if expired.is_none() {
        return Ok(());
    }
    info!("zone '{}': zone expired", zone.name);

    zone.snapshot_exists.store(false, Ordering::Relaxed);

    let now = unix_now();
    {
        let mut timers = zone.timers.lock().unwrap();
        timers.next_expire = now;
        timers.next_refresh = now;
        timers.last_notified_serial = None;
    }
    zone.save_state(conf);

    // Only a successful refresh revives the zone.
    zone.events.schedule_now(EventKind::Refresh);
    Ok(())
}
