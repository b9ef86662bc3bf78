//! Zone events and their scheduling.
//!
//! Every zone owns a table with one slot per event kind.  The scheduler
//! ([`scheduler::TimeHeap`]) fires a per-zone timed event when the earliest
//! slot falls due; the event hands a task to the worker pool
//! ([`pool::WorkerPool`]); the task picks the due slot, runs its handler,
//! and re-arms the timer.  At most one handler runs per zone at any time.
//!
//! Lock order: `reschedule_lock` before `mx` before the heap's own lock.
//! Helpers that expect `reschedule_lock` to be held take the guard as a
//! parameter.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use tracing::{debug, error, trace};

use sluice_base::DomainName;

use crate::error::{Error, Result};
use crate::util::unix_now;

pub mod handlers;
pub mod pool;
pub mod scheduler;

use pool::{Task, WorkerPool};
use scheduler::{TimeHeap, TimedEvent};

//----------- EventKind --------------------------------------------------------

/// A kind of zone event.
///
/// The declaration order doubles as the tie-break among events scheduled
/// for the same time: earlier kinds run first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    Load,
    Refresh,
    Update,
    Expire,
    Flush,
    Backup,
    Notify,
    Dnssec,
    Validate,
    Ufreeze,
    Uthaw,
    DsCheck,
    DsPush,
    DnskeySync,
}

/// The number of event kinds.
pub const KIND_COUNT: usize = 14;

impl EventKind {
    /// All event kinds, in declaration order.
    pub const ALL: [Self; KIND_COUNT] = [
        Self::Load,
        Self::Refresh,
        Self::Update,
        Self::Expire,
        Self::Flush,
        Self::Backup,
        Self::Notify,
        Self::Dnssec,
        Self::Validate,
        Self::Ufreeze,
        Self::Uthaw,
        Self::DsCheck,
        Self::DsPush,
        Self::DnskeySync,
    ];

    /// The slot index of this kind.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Whether an update-freeze holds this kind back.
    pub const fn freezable(self) -> bool {
        matches!(
            self,
            Self::Load | Self::Refresh | Self::Update | Self::Flush | Self::Dnssec | Self::DsCheck
        )
    }

    /// The human name of this kind, as used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Refresh => "refresh",
            Self::Update => "update",
            Self::Expire => "expiration",
            Self::Flush => "flush",
            Self::Backup => "backup/restore",
            Self::Notify => "notify",
            Self::Dnssec => "re-sign",
            Self::Validate => "DNSSEC-validate",
            Self::Ufreeze => "update-freeze",
            Self::Uthaw => "update-thaw",
            Self::DsCheck => "DS-check",
            Self::DsPush => "DS-push",
            Self::DnskeySync => "DNSKEY-sync",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The scheduled time marking a fast-tracked event.
///
/// Real scheduled times are UNIX timestamps and are always far larger.
const IMMEDIATE: u64 = 1;

/// The handler invoked for a due event.
pub type Runner = Arc<dyn Fn(EventKind) -> Result<()> + Send + Sync>;

//----------- ZoneEvents -------------------------------------------------------

/// The event table of one zone.
pub struct ZoneEvents {
    /// The zone this table belongs to, for logging.
    name: DomainName,

    /// Serializes rescheduling against dispatch completion.
    ///
    /// Always taken before `mx`; never taken inside a handler.
    reschedule_lock: Mutex<()>,

    /// The table itself.
    mx: Mutex<Table>,

    /// Signaled whenever a handler run completes.
    run_end: Condvar,

    /// The scheduler slot of this zone.
    event: OnceLock<Arc<TimedEvent>>,

    /// The worker pool handlers run on.
    pool: OnceLock<Arc<WorkerPool>>,

    /// The handler dispatch function.
    runner: OnceLock<Runner>,
}

struct Table {
    /// Scheduled times, one slot per kind; UNIX seconds.
    time: [Option<u64>; KIND_COUNT],

    /// Whether the slot was forced by an operator.
    ///
    /// Forced events ignore the update-freeze, and an explicit unschedule
    /// does not clear them.
    forced: [bool; KIND_COUNT],

    /// When the running handler started; 0 when idle.
    running: u64,

    /// The kind being run right now.
    current: Option<EventKind>,

    /// Whether the whole table is frozen (shutdown, backup).
    frozen: bool,

    /// Whether freezable kinds are held back (operator update session).
    ufrozen: bool,

    /// Callers blocked on a kind, one slot per kind.
    blocking: [Option<Arc<Blocker>>; KIND_COUNT],

    /// The most recent handler result per kind.
    result: [Option<Result<()>>; KIND_COUNT],
}

impl Table {
    fn new() -> Self {
        Self {
            time: [None; KIND_COUNT],
            forced: [false; KIND_COUNT],
            running: 0,
            current: None,
            frozen: false,
            ufrozen: false,
            blocking: std::array::from_fn(|_| None),
            result: [None; KIND_COUNT],
        }
    }

    /// Whether the kind may dispatch despite the table state.
    fn eligible(&self, kind: EventKind) -> bool {
        self.forced[kind.index()] || !self.ufrozen || !kind.freezable()
    }

    /// The next eligible event, earliest first; ties go to the earlier kind.
    fn next_event(&self) -> Option<(EventKind, u64)> {
        let mut next: Option<(EventKind, u64)> = None;
        for kind in EventKind::ALL {
            let Some(time) = self.time[kind.index()] else {
                continue;
            };
            if !self.eligible(kind) {
                continue;
            }
            if next.is_none_or(|(_, t)| time < t) {
                next = Some((kind, time));
            }
        }
        next
    }

    /// The time of the next eligible event.
    fn next_time(&self) -> Option<u64> {
        self.next_event().map(|(_, time)| time)
    }

    /// The next eligible event that is already due.
    fn next_due(&self, now: u64) -> Option<EventKind> {
        self.next_event()
            .filter(|&(_, time)| time <= now)
            .map(|(kind, _)| kind)
    }
}

/// A caller blocked on an event's completion.
struct Blocker {
    /// Signaled when the slot is handed back.
    cond: Condvar,

    /// The handler result, transferred to the waiter.
    result: Mutex<Option<Result<()>>>,
}

impl Blocker {
    fn new() -> Self {
        Self {
            cond: Condvar::new(),
            result: Mutex::new(None),
        }
    }
}

impl fmt::Debug for ZoneEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZoneEvents").field("name", &self.name).finish()
    }
}

impl ZoneEvents {
    /// Construct the event table for a zone.
    pub fn new(name: DomainName) -> Self {
        Self {
            name,
            reschedule_lock: Mutex::new(()),
            mx: Mutex::new(Table::new()),
            run_end: Condvar::new(),
            event: OnceLock::new(),
            pool: OnceLock::new(),
            runner: OnceLock::new(),
        }
    }

    /// Wire the table into a scheduler and a worker pool.
    ///
    /// `runner` is invoked on a worker thread for each dispatched event.
    pub fn setup(self: &Arc<Self>, heap: &TimeHeap, pool: Arc<WorkerPool>, runner: Runner) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let event = heap.create(Box::new(move || {
            if let Some(events) = weak.upgrade() {
                events.dispatch();
            }
        }));
        let _ = self.event.set(event);
        let _ = self.pool.set(pool);
        let _ = self.runner.set(runner);
    }

    //--- Scheduling

    /// Update a batch of event slots.
    ///
    /// `None` unschedules a slot (unless the slot is forced); a time only
    /// replaces an occupied slot if it is earlier.  The batch is installed
    /// under a single critical section.
    pub fn schedule_at(&self, entries: &[(EventKind, Option<u64>)]) {
        let guard = self.reschedule_lock.lock().unwrap();
        let mut table = self.mx.lock().unwrap();

        let old_next = table.next_time();

        for &(kind, planned) in entries {
            let i = kind.index();
            let current = table.time[i];
            let update = match (current, planned) {
                (None, _) => true,
                (Some(_), None) => !table.forced[i],
                (Some(current), Some(planned)) => planned < current,
            };
            if update {
                table.time[i] = planned;
            }
        }

        if table.next_time() != old_next {
            self.reschedule(&guard, table);
        }
    }

    /// Schedule an event to run as soon as possible.
    pub fn schedule_now(&self, kind: EventKind) {
        self.schedule_at(&[(kind, Some(unix_now()))]);
    }

    /// Schedule an event on behalf of an operator.
    ///
    /// Forced events dispatch even during an update-freeze.
    pub fn schedule_user(&self, kind: EventKind) {
        {
            let mut table = self.mx.lock().unwrap();
            table.forced[kind.index()] = true;
        }
        self.schedule_now(kind);

        // Forcing may have changed which event is next, independent of any
        // time change; re-arm explicitly.
        let guard = self.reschedule_lock.lock().unwrap();
        let table = self.mx.lock().unwrap();
        self.reschedule(&guard, table);
    }

    /// Schedule an event and wait for its completion.
    ///
    /// Returns exactly the handler's result.  If another caller is already
    /// blocked on this kind, waits for that run to finish first.
    pub fn schedule_blocking(&self, kind: EventKind, user: bool) -> Result<()> {
        let mine = Arc::new(Blocker::new());
        {
            let mut table = self.mx.lock().unwrap();
            loop {
                let Some(prev) = table.blocking[kind.index()].clone() else {
                    break;
                };
                table = prev.cond.wait(table).unwrap();
            }
            table.blocking[kind.index()] = Some(mine.clone());
        }

        if user {
            self.schedule_user(kind);
        } else {
            self.schedule_now(kind);
        }

        let mut table = self.mx.lock().unwrap();
        while table.blocking[kind.index()]
            .as_ref()
            .is_some_and(|b| Arc::ptr_eq(b, &mine))
        {
            table = mine.cond.wait(table).unwrap();
        }
        drop(table);

        let result = mine.result.lock().unwrap().take();
        result.unwrap_or(Err(Error::Fatal))
    }

    /// Fast-track an event, bypassing the scheduler if the zone is idle.
    pub fn enqueue(self: &Arc<Self>, kind: EventKind) {
        {
            let mut table = self.mx.lock().unwrap();
            if table.running == 0
                && !table.frozen
                && (!table.ufrozen || !kind.freezable())
            {
                table.running = unix_now();
                table.time[kind.index()] = Some(IMMEDIATE);
                drop(table);
                self.assign_wrap();
                return;
            }
        }

        // The zone is busy or frozen; take the scheduled path.
        self.schedule_now(kind);
    }

    //--- Freezing

    /// Freeze the table: no events dispatch until [`ZoneEvents::start`].
    pub fn freeze(&self) {
        let _guard = self.reschedule_lock.lock().unwrap();
        {
            let mut table = self.mx.lock().unwrap();
            table.frozen = true;
        }
        // Cancel the pending wakeup.  The dispatch callback does not take
        // 'reschedule_lock', so waiting for it here cannot deadlock.
        if let Some(event) = self.event.get() {
            event.cancel();
        }
    }

    /// Freeze the table and wait for a running handler to finish.
    pub fn freeze_blocking(&self) {
        self.freeze();
        let mut table = self.mx.lock().unwrap();
        while table.running != 0 {
            table = self.run_end.wait(table).unwrap();
        }
    }

    /// Unfreeze the table and re-arm the next event.
    pub fn start(&self) {
        let guard = self.reschedule_lock.lock().unwrap();
        let mut table = self.mx.lock().unwrap();
        table.frozen = false;
        self.reschedule(&guard, table);
    }

    /// Enter or leave an update-freeze.
    ///
    /// While update-frozen, freezable kinds accumulate but do not dispatch;
    /// forced events still run.  Callers outside a handler must re-arm via
    /// [`ZoneEvents::rearm`]; handler completion re-arms on its own.
    pub fn set_ufrozen(&self, ufrozen: bool) {
        let mut table = self.mx.lock().unwrap();
        table.ufrozen = ufrozen;
    }

    /// Whether the zone is update-frozen.
    pub fn is_ufrozen(&self) -> bool {
        self.mx.lock().unwrap().ufrozen
    }

    /// Re-arm the scheduler slot from the current table.
    pub fn rearm(&self) {
        let guard = self.reschedule_lock.lock().unwrap();
        let table = self.mx.lock().unwrap();
        self.reschedule(&guard, table);
    }

    //--- Status

    /// The scheduled time of a kind.
    pub fn time_of(&self, kind: EventKind) -> Option<u64> {
        self.mx.lock().unwrap().time[kind.index()]
    }

    /// The next eligible event and its time.
    pub fn next(&self) -> Option<(EventKind, u64)> {
        self.mx.lock().unwrap().next_event()
    }

    /// The kind being handled right now.
    pub fn running_kind(&self) -> Option<EventKind> {
        self.mx.lock().unwrap().current
    }

    /// The most recent result of a kind.
    pub fn last_result(&self, kind: EventKind) -> Option<Result<()>> {
        self.mx.lock().unwrap().result[kind.index()]
    }

    //--- Dispatch internals

    /// Re-arm the scheduler slot.
    ///
    /// The caller holds `reschedule_lock` (witnessed by `_proof`) and hands
    /// over the table guard, which is released before the heap is touched.
    fn reschedule(&self, _proof: &MutexGuard<'_, ()>, table: MutexGuard<'_, Table>) {
        let Some(event) = self.event.get() else {
            return;
        };
        if table.running != 0 || table.frozen {
            return;
        }
        let Some((_, time)) = table.next_event() else {
            return;
        };
        drop(table);

        let delta = time.saturating_sub(unix_now());
        event.schedule(Duration::from_secs(delta));
    }

    /// The scheduler callback: move the zone's work onto the worker pool.
    fn dispatch(self: &Arc<Self>) {
        let mut table = self.mx.lock().unwrap();
        if table.running == 0 && !table.frozen {
            table.running = unix_now();
            drop(table);
            self.assign_wrap();
        }
    }

    fn assign_wrap(self: &Arc<Self>) {
        let Some(pool) = self.pool.get() else {
            return;
        };
        let events = self.clone();
        pool.assign(Task::new(move || events.wrap()));
    }

    /// The worker-side wrapper around one handler run.
    ///
    /// Picks the next due event, clears its slot, runs the handler, records
    /// the result, releases any blocker and re-arms the next event.
    fn wrap(self: &Arc<Self>) {
        let now = unix_now();

        let (kind, blocker) = {
            let mut table = self.mx.lock().unwrap();
            let Some(kind) = table.next_due(now) else {
                // A schedule race emptied the table; this dispatch is void.
                table.running = 0;
                drop(table);
                self.rearm();
                return;
            };
            let i = kind.index();
            let blocker = table.blocking[i].clone();
            table.current = Some(kind);
            table.time[i] = None;
            table.forced[i] = false;
            (kind, blocker)
        };

        trace!("zone '{}': running event '{kind}'", self.name);
        let result = match self.runner.get() {
            Some(runner) => runner(kind),
            None => Err(Error::Fatal),
        };

        if let Err(err) = result {
            error!("zone '{}': event '{kind}' failed ({err})", self.name);
        } else {
            debug!("zone '{}': event '{kind}' finished", self.name);
        }

        let guard = self.reschedule_lock.lock().unwrap();
        let mut table = self.mx.lock().unwrap();
        table.running = 0;
        table.current = None;
        table.result[kind.index()] = Some(result);

        // Release the blocker captured before the run; one installed during
        // the run belongs to the next run of this kind.
        if let Some(blocker) = blocker
            && table.blocking[kind.index()]
                .as_ref()
                .is_some_and(|b| Arc::ptr_eq(b, &blocker))
        {
            table.blocking[kind.index()] = None;
            *blocker.result.lock().unwrap() = Some(result);
            blocker.cond.notify_all();
        }

        self.run_end.notify_all();
        self.reschedule(&guard, table);
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct Rig {
        heap: TimeHeap,
        pool: Arc<WorkerPool>,
        events: Arc<ZoneEvents>,
        log: Arc<Mutex<Vec<EventKind>>>,
    }

    impl Rig {
        /// A zone event rig whose handler records each run.
        fn new(handler: impl Fn(EventKind) -> Result<()> + Send + Sync + 'static) -> Self {
            let heap = TimeHeap::new();
            let pool = WorkerPool::create(2);
            let events = Arc::new(ZoneEvents::new("example.com.".parse().unwrap()));
            let log = Arc::new(Mutex::new(Vec::new()));
            let runner: Runner = {
                let log = log.clone();
                Arc::new(move |kind| {
                    log.lock().unwrap().push(kind);
                    handler(kind)
                })
            };
            events.setup(&heap, pool.clone(), runner);
            heap.start();
            pool.start();
            Self {
                heap,
                pool,
                events,
                log,
            }
        }

        fn wait_for_runs(&self, count: usize) {
            let deadline = Instant::now() + Duration::from_secs(10);
            while self.log.lock().unwrap().len() < count && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        fn shutdown(&self) {
            self.heap.stop();
            self.heap.join();
            self.pool.stop();
            self.pool.join();
        }
    }

    #[test]
    fn runs_in_scheduled_order() {
        let rig = Rig::new(|_| Ok(()));
        let now = unix_now();
        // Refresh later, re-sign sooner; the observed order must follow the
        // scheduled times, not the submission order.
        rig.events
            .schedule_at(&[(EventKind::Refresh, Some(now + 2)), (EventKind::Dnssec, Some(now + 1))]);
        rig.wait_for_runs(2);
        assert_eq!(*rig.log.lock().unwrap(), vec![EventKind::Dnssec, EventKind::Refresh]);
        assert_eq!(rig.events.time_of(EventKind::Dnssec), None);
        rig.shutdown();
    }

    #[test]
    fn equal_times_break_by_kind_order() {
        let rig = Rig::new(|_| Ok(()));
        let at = unix_now() + 1;
        rig.events.schedule_at(&[
            (EventKind::Notify, Some(at)),
            (EventKind::Flush, Some(at)),
            (EventKind::Refresh, Some(at)),
        ]);
        rig.wait_for_runs(3);
        assert_eq!(
            *rig.log.lock().unwrap(),
            vec![EventKind::Refresh, EventKind::Flush, EventKind::Notify]
        );
        rig.shutdown();
    }

    #[test]
    fn at_most_one_handler_per_zone() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let rig = Rig::new({
            let active = active.clone();
            let peak = peak.clone();
            move |_| {
                let n = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(n, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(30));
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });
        for kind in [EventKind::Refresh, EventKind::Flush, EventKind::Notify] {
            rig.events.enqueue(kind);
        }
        rig.wait_for_runs(3);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        rig.shutdown();
    }

    #[test]
    fn blocking_returns_handler_result() {
        let rig = Rig::new(|kind| match kind {
            EventKind::Dnssec => Err(Error::InvalidSignature),
            _ => Ok(()),
        });
        let result = rig.events.schedule_blocking(EventKind::Dnssec, true);
        assert_eq!(result, Err(Error::InvalidSignature));
        assert_eq!(
            rig.events.last_result(EventKind::Dnssec),
            Some(Err(Error::InvalidSignature))
        );
        rig.shutdown();
    }

    #[test]
    fn freeze_blocks_dispatch_until_start() {
        let rig = Rig::new(|_| Ok(()));
        rig.events.freeze();
        rig.events.schedule_now(EventKind::Notify);
        std::thread::sleep(Duration::from_millis(100));
        assert!(rig.log.lock().unwrap().is_empty());
        rig.events.start();
        rig.wait_for_runs(1);
        assert_eq!(*rig.log.lock().unwrap(), vec![EventKind::Notify]);
        rig.shutdown();
    }

    #[test]
    fn ufreeze_holds_back_freezable_kinds() {
        let rig = Rig::new(|_| Ok(()));
        rig.events.set_ufrozen(true);
        // 'update' is freezable, 'expiration' is not.
        rig.events.schedule_now(EventKind::Update);
        rig.events.schedule_now(EventKind::Expire);
        rig.wait_for_runs(1);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(*rig.log.lock().unwrap(), vec![EventKind::Expire]);

        rig.events.set_ufrozen(false);
        rig.events.rearm();
        rig.wait_for_runs(2);
        assert_eq!(
            *rig.log.lock().unwrap(),
            vec![EventKind::Expire, EventKind::Update]
        );
        rig.shutdown();
    }

    #[test]
    fn forced_events_ignore_ufreeze() {
        let rig = Rig::new(|_| Ok(()));
        rig.events.set_ufrozen(true);
        rig.events.schedule_user(EventKind::Flush);
        rig.wait_for_runs(1);
        assert_eq!(*rig.log.lock().unwrap(), vec![EventKind::Flush]);
        rig.shutdown();
    }

    #[test]
    fn second_blocker_waits_for_first() {
        let rig = Rig::new(|_| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(())
        });
        let events = rig.events.clone();
        let first = std::thread::spawn({
            let events = events.clone();
            move || events.schedule_blocking(EventKind::Flush, false)
        });
        let second = std::thread::spawn({
            let events = events.clone();
            move || events.schedule_blocking(EventKind::Flush, false)
        });
        assert_eq!(first.join().unwrap(), Ok(()));
        assert_eq!(second.join().unwrap(), Ok(()));
        assert_eq!(*rig.log.lock().unwrap(), vec![EventKind::Flush, EventKind::Flush]);
        rig.shutdown();
    }
}
