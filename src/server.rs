//! The server: zones, scheduler, workers and shared stores.

use std::sync::{Arc, Mutex, Weak};

use arc_swap::ArcSwap;
use tracing::{debug, info};

use sluice_base::DomainName;

use crate::config::Config;
use crate::dnssec::keys::{FileKeyStore, KeyStore};
use crate::error::{Error, Result};
use crate::events::pool::WorkerPool;
use crate::events::scheduler::TimeHeap;
use crate::events::{self, EventKind};
use crate::journal::Journal;
use crate::remote::RemoteOps;
use crate::zone::Zone;

//----------- Server -----------------------------------------------------------

/// The running server.
pub struct Server {
    /// The configuration.
    ///
    /// Handlers load one snapshot at dispatch and read only that snapshot
    /// for their whole run.
    pub config: ArcSwap<Config>,

    /// The shared event scheduler.
    pub heap: TimeHeap,

    /// The shared zone event workers.
    pub pool: Arc<WorkerPool>,

    /// The journal database, shared by all zones.
    pub db: sled::Db,

    /// The signing key store.
    pub keystore: Arc<dyn KeyStore>,

    /// The transport backend.
    pub remote: Arc<dyn RemoteOps>,

    /// The served zones, by name.
    zones: Mutex<foldhash::HashMap<DomainName, Arc<Zone>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

impl Server {
    /// Bring the server up.
    ///
    /// Opens the journal database and key store, starts the scheduler and
    /// the worker pool, registers every configured zone and schedules its
    /// initial load.
    pub fn launch(config: Config, remote: Arc<dyn RemoteOps>) -> Result<Arc<Self>> {
        let db = sled::Config::new()
            .path(config.daemon.journal_db.as_std_path())
            .open()?;
        let keystore = Arc::new(FileKeyStore::new(config.daemon.keys_dir.clone()));
        let pool = WorkerPool::create(config.daemon.workers);

        let server = Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            heap: TimeHeap::new(),
            pool: pool.clone(),
            db,
            keystore,
            remote,
            zones: Mutex::new(foldhash::HashMap::default()),
        });

        server.heap.start();
        pool.start();

        let config = server.config_snapshot();
        for entry in &config.zones {
            let zone = server.insert_zone(entry.name.clone())?;
            zone.load_state(&config);
            zone.events.schedule_now(EventKind::Load);
        }

        info!("started with {} zones", config.zones.len());
        Ok(server)
    }

    /// The current configuration snapshot.
    pub fn config_snapshot(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// Register a zone and wire its event table up.
    pub fn insert_zone(self: &Arc<Self>, name: DomainName) -> Result<Arc<Zone>> {
        let mut zones = self.zones.lock().unwrap();
        if zones.contains_key(&name) {
            return Err(Error::Exists);
        }

        let config = self.config_snapshot();
        let journal = Journal::open(&self.db, &name, &config.journal)?;
        let zone = Arc::new(Zone::new(name.clone(), Arc::downgrade(self), journal));

        // The runner ties the event table back to the handler set; it picks
        // up the configuration snapshot of the moment it runs.
        let runner: events::Runner = {
            let zone: Weak<Zone> = Arc::downgrade(&zone);
            let server: Weak<Server> = Arc::downgrade(self);
            Arc::new(move |kind| {
                let zone = zone.upgrade().ok_or(Error::Fatal)?;
                let server = server.upgrade().ok_or(Error::Fatal)?;
                let config = server.config_snapshot();
                events::handlers::run(kind, &config, &zone)
            })
        };
        zone.events.setup(&self.heap, self.pool.clone(), runner);

        debug!("registered zone '{name}'");
        zones.insert(name, zone.clone());
        Ok(zone)
    }

    /// Drop a zone, waiting for its running event to finish.
    pub fn remove_zone(&self, name: &DomainName) -> Result<()> {
        let zone = self
            .zones
            .lock()
            .unwrap()
            .remove(name)
            .ok_or(Error::NotFound)?;
        zone.events.freeze_blocking();
        info!("removed zone '{name}'");
        Ok(())
    }

    /// Look up a zone by name.
    pub fn zone(&self, name: &DomainName) -> Option<Arc<Zone>> {
        self.zones.lock().unwrap().get(name).cloned()
    }

    /// Every registered zone.
    pub fn zones(&self) -> Vec<Arc<Zone>> {
        self.zones.lock().unwrap().values().cloned().collect()
    }

    /// Freeze all zones, stop the machinery and wait for it.
    pub fn shutdown(&self) {
        info!("shutting down");
        for zone in self.zones() {
            zone.events.freeze_blocking();
            zone.save_state(&self.config_snapshot());
        }
        self.heap.stop();
        self.pool.stop();
        self.heap.join();
        self.pool.join();
    }

    /// Block until the scheduler thread exits.
    ///
    /// This is the daemon's idle loop; service managers stop the process
    /// with a signal.
    pub fn wait(&self) {
        self.heap.join();
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use sluice_base::rrset::{Class, Record, Rtype, SoaFields};
    use sluice_base::{Changeset, Rdata};

    use crate::control;
    use crate::remote::{RemoteOps, Transfer};

    fn soa_record(serial: u32) -> Record {
        let fields = SoaFields {
            mname: "ns1.example.com.".parse().unwrap(),
            rname: "host.example.com.".parse().unwrap(),
            serial,
            refresh: 3600,
            retry: 600,
            expire: 86400,
            minimum: 300,
        };
        Record::new(
            "example.com.".parse().unwrap(),
            Rtype::SOA,
            Class::IN,
            3600,
            fields.to_rdata(),
        )
    }

    fn a_record(owner: &str, addr: [u8; 4]) -> Record {
        Record::new(
            owner.parse().unwrap(),
            Rtype::A,
            Class::IN,
            300,
            Rdata::new(addr.to_vec()),
        )
    }

    /// A scripted primary: serves a serial, full records, and an optional
    /// incremental chain; records every NOTIFY it receives.
    #[derive(Default)]
    struct MockPrimary {
        state: Mutex<MockState>,
        notified: Mutex<Vec<(String, u32)>>,
    }

    #[derive(Default)]
    struct MockState {
        serial: u32,
        records: Vec<Record>,
        chain: Vec<Changeset>,
    }

    impl RemoteOps for MockPrimary {
        fn probe_soa(
            &self,
            _remote: &str,
            _zone: &DomainName,
            _timeout: Duration,
        ) -> crate::error::Result<u32> {
            Ok(self.state.lock().unwrap().serial)
        }

        fn transfer(
            &self,
            _remote: &str,
            _zone: &DomainName,
            current: Option<u32>,
            _timeout: Duration,
        ) -> crate::error::Result<Transfer> {
            let state = self.state.lock().unwrap();
            match current {
                Some(from) if state.chain.first().is_some_and(|ch| ch.from_serial() == from) => {
                    Ok(Transfer::Incremental(state.chain.clone()))
                }
                _ => Ok(Transfer::Full(state.records.clone())),
            }
        }

        fn send_notify(
            &self,
            remote: &str,
            _zone: &DomainName,
            serial: u32,
            _timeout: Duration,
        ) -> crate::error::Result<()> {
            self.notified.lock().unwrap().push((remote.into(), serial));
            Ok(())
        }

        fn send_ds_update(
            &self,
            _parent: &str,
            _zone: &DomainName,
            _ds_set: &sluice_base::RRset,
            _timeout: Duration,
        ) -> crate::error::Result<()> {
            Ok(())
        }

        fn query_parent_ds(
            &self,
            _parent: &str,
            _zone: &DomainName,
            _timeout: Duration,
        ) -> crate::error::Result<Vec<Rdata>> {
            Ok(Vec::new())
        }

        fn publish_dnskeys(
            &self,
            _endpoint: &str,
            _zone: &DomainName,
            _dnskeys: &sluice_base::RRset,
            _timeout: Duration,
        ) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn test_config(dir: &std::path::Path) -> Config {
        let base = dir.to_str().unwrap();
        toml::from_str(&format!(
            r#"
            [daemon]
            state_dir = "{base}/state"
            zone_dir = "{base}/zones"
            journal_db = "{base}/journal"
            keys_dir = "{base}/keys"
            workers = 2

            [[zone]]
            name = "example.com"
            role = "secondary"
            primaries = ["primary-a"]
            secondaries = ["secondary-b"]
            "#
        ))
        .unwrap()
    }

    fn wait_for_serial(server: &Server, name: &DomainName, serial: u32) {
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let current = server.zone(name).and_then(|z| z.contents()).map(|c| c.serial());
            if current == Some(serial) {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "zone never reached serial {serial} (at {current:?})"
            );
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn secondary_bootstraps_and_follows_the_primary() {
        let dir = tempfile::tempdir().unwrap();
        let name: DomainName = "example.com.".parse().unwrap();

        let remote = Arc::new(MockPrimary::default());
        {
            let mut state = remote.state.lock().unwrap();
            state.serial = 1;
            state.records = vec![soa_record(1), a_record("www.example.com.", [192, 0, 2, 1])];
        }

        let server = Server::launch(test_config(dir.path()), remote.clone()).unwrap();

        // The load event finds nothing stored and falls through to a full
        // transfer from the scripted primary.
        wait_for_serial(&server, &name, 1);
        let zone = server.zone(&name).unwrap();
        assert!(zone.journal.baseline().unwrap().is_some());

        // The primary moves on; the next refresh applies the incremental
        // chain and journals it.
        {
            let mut ch = Changeset::new(Some(soa_record(1)), soa_record(2));
            let mut set = sluice_base::RRset::new(
                "mail.example.com.".parse().unwrap(),
                Rtype::A,
                Class::IN,
                300,
            );
            set.push(Rdata::new(vec![192, 0, 2, 25]));
            ch.add(set);

            let mut state = remote.state.lock().unwrap();
            state.serial = 2;
            state.chain = vec![ch];
        }
        control::zone_refresh(&server, &name).unwrap();
        wait_for_serial(&server, &name, 2);

        let md = zone.journal.metadata().unwrap();
        assert_eq!(md.serial_to, 2);

        // Both versions were announced downstream.
        let deadline = Instant::now() + Duration::from_secs(10);
        while remote.notified.lock().unwrap().len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        let notified = remote.notified.lock().unwrap().clone();
        assert!(notified.contains(&("secondary-b".into(), 1)));
        assert!(notified.contains(&("secondary-b".into(), 2)));

        // The status report reflects the served zone.
        let status = control::zone_status(&server, &name).unwrap();
        assert_eq!(status.serial, Some(2));
        assert!(!status.ufrozen);

        // A blocking flush writes the snapshot and reports success.
        control::zone_flush(&server, &name).unwrap();
        assert!(zone.snapshot_path(&server.config_snapshot()).as_std_path().exists());

        server.shutdown();
    }

    #[test]
    fn dynamic_update_bumps_serial_and_journals() {
        use crate::zone::{Prereq, UpdateOp, UpdateRequest};

        let dir = tempfile::tempdir().unwrap();
        let name: DomainName = "example.com.".parse().unwrap();

        let remote = Arc::new(MockPrimary::default());
        {
            let mut state = remote.state.lock().unwrap();
            state.serial = 1;
            state.records = vec![soa_record(1), a_record("www.example.com.", [192, 0, 2, 1])];
        }
        let server = Server::launch(test_config(dir.path()), remote.clone()).unwrap();
        wait_for_serial(&server, &name, 1);

        // A satisfied prerequisite lets the update through.
        let request = UpdateRequest {
            prereqs: vec![Prereq::RrsetExists(
                "www.example.com.".parse().unwrap(),
                Rtype::A,
            )],
            ops: vec![UpdateOp::Add(a_record("ftp.example.com.", [192, 0, 2, 21]))],
        };
        control::zone_update(&server, &name, request).unwrap();
        wait_for_serial(&server, &name, 2);

        let zone = server.zone(&name).unwrap();
        let contents = zone.contents().unwrap();
        assert!(contents
            .rrset(&"ftp.example.com.".parse().unwrap(), Rtype::A)
            .is_some());
        assert_eq!(zone.journal.metadata().unwrap().serial_to, 2);

        // A failed prerequisite rejects the whole request.
        let request = UpdateRequest {
            prereqs: vec![Prereq::NameInUse("absent.example.com.".parse().unwrap())],
            ops: vec![UpdateOp::DeleteName("www.example.com.".parse().unwrap())],
        };
        control::zone_update(&server, &name, request).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        let contents = zone.contents().unwrap();
        assert_eq!(contents.serial(), 2);
        assert!(contents
            .rrset(&"www.example.com.".parse().unwrap(), Rtype::A)
            .is_some());

        server.shutdown();
    }

    #[test]
    fn retransfer_forces_a_full_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let name: DomainName = "example.com.".parse().unwrap();

        let remote = Arc::new(MockPrimary::default());
        {
            let mut state = remote.state.lock().unwrap();
            state.serial = 5;
            state.records = vec![soa_record(5), a_record("www.example.com.", [192, 0, 2, 1])];
        }

        let server = Server::launch(test_config(dir.path()), remote.clone()).unwrap();
        wait_for_serial(&server, &name, 5);

        // Same serial, different content; only a forced full transfer
        // picks it up.
        {
            let mut state = remote.state.lock().unwrap();
            state.serial = 6;
            state.records = vec![soa_record(6), a_record("www.example.com.", [192, 0, 2, 9])];
            state.chain = Vec::new();
        }
        control::zone_retransfer(&server, &name).unwrap();
        wait_for_serial(&server, &name, 6);

        let zone = server.zone(&name).unwrap();
        let contents = zone.contents().unwrap();
        let www = contents
            .rrset(&"www.example.com.".parse().unwrap(), Rtype::A)
            .unwrap();
        assert_eq!(www.rdatas[0], Rdata::new(vec![192, 0, 2, 9]));

        server.shutdown();
    }
}
