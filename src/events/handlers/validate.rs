//! The validate event: check every signature in the zone.

use std::sync::Arc;

use tracing::{error, info};

use crate::config::Config;
use crate::dnssec::sign::SignContext;
use crate::dnssec::signer::verify_zone;
use crate::error::Result;
use crate::util::unix_now;
use crate::zone::Zone;

pub fn event_validate(conf: &Arc<Config>, zone: &Arc<Zone>) -> Result<()> {
    let Some(policy) = conf.zone_policy(&zone.name) else {
        return Ok(());
    };
    let contents = zone.expect_contents()?;
    let ctx = SignContext::from_policy(policy, unix_now());

    match verify_zone(&contents, &ctx) {
        Ok(()) => {
            info!(
                "zone '{}': DNSSEC validation passed, serial {}",
                zone.name,
                contents.serial()
            );
            Ok(())
        }
        Err(err) => {
            error!(
                "zone '{}': DNSSEC validation failed, serial {} ({err})",
                zone.name,
                contents.serial()
            );
            Err(err)
        }
    }
}
