//! Backup and restore of a zone's durable state.
//!
//! A backup directory holds the zone snapshot, the key file, the state
//! file and an export of the journal chain.  The directory is built under
//! a `.part` name and renamed into place, so a half-written backup is
//! never mistaken for a complete one.

use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};

use sluice_base::wire::{WireBuf, WireRead};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::journal;
use crate::util::write_file;
use crate::zone::{Zone, snapshot, state};

pub fn event_backup(conf: &Arc<Config>, zone: &Arc<Zone>) -> Result<()> {
    let request = zone
        .backup_ctx
        .lock()
        .unwrap()
        .take()
        .ok_or(Error::Invalid)?;
    if request.restore {
        restore(conf, zone, &request.dir)
    } else {
        backup(conf, zone, &request.dir)
    }
}

fn snapshot_name(zone: &Zone) -> String {
    format!("{}db", zone.name)
}

fn keys_name(zone: &Zone) -> String {
    format!("{}keys.json", zone.name)
}

fn state_name(zone: &Zone) -> String {
    format!("{}state.json", zone.name)
}

fn backup(conf: &Arc<Config>, zone: &Arc<Zone>, dir: &Utf8Path) -> Result<()> {
    if dir.as_std_path().exists() {
        return Err(Error::Exists);
    }
    let part = Utf8PathBuf::from(format!("{dir}.part"));
    if part.as_std_path().exists() {
        fs::remove_dir_all(part.as_std_path())?;
    }
    fs::create_dir_all(part.as_std_path())?;

    // Zone data.
    if let Some(contents) = zone.contents() {
        snapshot::store(&part.join(snapshot_name(zone)), &contents)?;
    }

    // Keys and state.
    copy_if_present(&zone.keys_path(conf), &part.join(keys_name(zone)))?;
    {
        let timers = zone.timers.lock().unwrap();
        let exists = zone
            .snapshot_exists
            .load(std::sync::atomic::Ordering::Relaxed);
        state::Spec::build(&timers, exists).save(&part.join(state_name(zone)))?;
    }

    // The journal chain.
    export_journal(zone, &part.join("journal.bin"))?;

    fs::rename(part.as_std_path(), dir.as_std_path())?;
    info!("zone '{}': zone backed up to '{dir}'", zone.name);
    Ok(())
}

fn restore(conf: &Arc<Config>, zone: &Arc<Zone>, dir: &Utf8Path) -> Result<()> {
    if !dir.as_std_path().exists() {
        return Err(Error::NotFound);
    }

    // Unpublish the current contents; the restored data replaces them.
    zone.switch_contents(None);

    copy_if_present(&dir.join(snapshot_name(zone)), &zone.snapshot_path(conf))?;
    copy_if_present(&dir.join(keys_name(zone)), &zone.keys_path(conf))?;
    copy_if_present(&dir.join(state_name(zone)), &zone.state_path(conf))?;
    import_journal(zone, &dir.join("journal.bin"))?;

    zone.load_state(conf);
    zone.events.schedule_now(EventKind::Load);
    info!("zone '{}': zone restored from '{dir}'", zone.name);
    Ok(())
}

/// Copy a file, treating a missing source as nothing to do.
fn copy_if_present(from: &Utf8Path, to: &Utf8Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent.as_std_path())?;
    }
    match fs::copy(from.as_std_path(), to.as_std_path()) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Export the zone's journal chain into one framed file.
fn export_journal(zone: &Arc<Zone>, path: &Utf8Path) -> Result<()> {
    let mut buf = WireBuf::new();
    let mut entries = 0;

    let mut push = |baseline: bool, stream: Vec<u8>| {
        buf.put_u8(baseline as u8);
        buf.put_u32(stream.len() as u32);
        buf.put_slice(&stream);
    };

    if let Some(base) = zone.journal.baseline()? {
        push(true, journal::changeset_stream(&base));
        entries += 1;
    }
    let md = zone.journal.metadata()?;
    if md.serial_to_valid()
        && let Ok(chain) = zone.journal.changesets_from(md.first_serial)
    {
        for ch in &chain {
            push(false, journal::changeset_stream(ch));
            entries += 1;
        }
    }

    write_file(path, buf.as_slice())?;
    info!("zone '{}': exported {entries} journal records", zone.name);
    Ok(())
}

/// Rebuild the zone's journal from an exported file.
fn import_journal(zone: &Arc<Zone>, path: &Utf8Path) -> Result<()> {
    let data = match fs::read(path.as_std_path()) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    zone.journal.wipe()?;

    let mut read = WireRead::new(&data);
    while !read.is_empty() {
        let baseline = read.get_u8()? != 0;
        let len = read.get_u32()? as usize;
        let stream = read.take(len)?;
        let ch = journal::parse_stream(stream, baseline)?;
        let result = if baseline {
            zone.journal.insert_zone(&ch)
        } else {
            zone.journal.insert(&ch, None)
        };
        match result {
            Ok(()) => {}
            Err(Error::Busy) => {
                // The imported chain exceeds the configured budget; keep
                // what fits and let normal operation settle the rest.
                warn!("zone '{}': journal import truncated by occupancy", zone.name);
                break;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
