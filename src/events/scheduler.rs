//! The event scheduler.
//!
//! [`TimeHeap`] keeps a min-heap of timed events and a dispatcher thread
//! that fires each event's callback when it falls due.  Callbacks are meant
//! to be cheap: zone events use them only to hand a task to the worker pool.
//!
//! Rescheduling does not search the heap.  Every `schedule` call pushes a
//! fresh entry carrying a generation number; stale entries are recognized
//! and dropped when they surface at the top.  This keeps `schedule` cheap
//! and makes the cancel/schedule race benign: a cancelled generation can
//! never fire.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::trace;

/// A callback run when a timed event fires.
pub type EventCallback = Box<dyn Fn() + Send + Sync>;

//----------- TimeHeap ---------------------------------------------------------

/// A thread-safe min-heap of timed events.
#[derive(Debug)]
pub struct TimeHeap {
    inner: Arc<HeapInner>,

    /// The dispatcher thread, while running.
    thread: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
struct HeapInner {
    /// The heap and its lifecycle flags.
    ///
    /// Lock order: an event's own lock may be held while taking this lock
    /// (schedule does so); the reverse order is forbidden.  The dispatcher
    /// therefore pops entries first and validates them against the event
    /// afterwards, without nesting the locks.
    state: Mutex<HeapState>,

    /// Wakes the dispatcher on schedule, resume and stop.
    notify: Condvar,
}

#[derive(Debug)]
struct HeapState {
    heap: BinaryHeap<HeapEntry>,
    paused: bool,
    stopped: bool,
}

impl Default for TimeHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeHeap {
    /// Construct a new, empty [`TimeHeap`].
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HeapInner {
                state: Mutex::new(HeapState {
                    heap: BinaryHeap::new(),
                    paused: false,
                    stopped: false,
                }),
                notify: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Create an event bound to this heap.
    ///
    /// The event is unscheduled; it is owned by the caller until scheduled.
    pub fn create(&self, cb: EventCallback) -> Arc<TimedEvent> {
        Arc::new(TimedEvent {
            state: Mutex::new(EventState {
                scheduled: None,
                running: false,
            }),
            done: Condvar::new(),
            cb,
            heap: Arc::downgrade(&self.inner),
        })
    }

    /// Start the dispatcher thread.
    pub fn start(&self) {
        let mut thread = self.thread.lock().unwrap();
        if thread.is_some() {
            return;
        }
        let inner = self.inner.clone();
        inner.state.lock().unwrap().stopped = false;
        *thread = Some(
            std::thread::Builder::new()
                .name("evsched".into())
                .spawn(move || inner.dispatch_loop())
                .expect("spawning the scheduler thread"),
        );
    }

    /// Ask the dispatcher thread to stop.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.stopped = true;
        self.inner.notify.notify_all();
    }

    /// Wait for the dispatcher thread to finish.
    pub fn join(&self) {
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }

    /// Temporarily stop firing events.
    ///
    /// The heap keeps its ordering; due events fire once resumed.
    pub fn pause(&self) {
        self.inner.state.lock().unwrap().paused = true;
    }

    /// Resume firing events.
    pub fn resume(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.paused = false;
        self.inner.notify.notify_all();
    }
}

impl HeapInner {
    fn dispatch_loop(self: Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.stopped {
                break;
            }
            if state.paused {
                state = self.notify.wait(state).unwrap();
                continue;
            }

            // Re-read the heap top after every wakeup; both spurious wakeups
            // and schedule races change what is due next.
            let now = Instant::now();
            match state.heap.peek() {
                None => {
                    state = self.notify.wait(state).unwrap();
                }
                Some(entry) if entry.due > now => {
                    let timeout = entry.due - now;
                    (state, _) = self.notify.wait_timeout(state, timeout).unwrap();
                }
                Some(_) => {
                    let entry = state.heap.pop().unwrap();
                    drop(state);
                    entry.fire();
                    state = self.state.lock().unwrap();
                }
            }
        }
    }
}

//----------- TimedEvent -------------------------------------------------------

/// A single schedulable event.
pub struct TimedEvent {
    /// The schedule state of this event.
    state: Mutex<EventState>,

    /// Signaled when a callback invocation returns.
    done: Condvar,

    /// The callback fired when the event falls due.
    cb: EventCallback,

    /// The heap this event belongs to.
    heap: Weak<HeapInner>,
}

impl std::fmt::Debug for TimedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedEvent")
            .field("state", &self.state)
            .finish()
    }
}

#[derive(Debug)]
struct EventState {
    /// The live schedule entry, as (due time, generation).
    ///
    /// Heap entries whose generation no longer matches are stale and are
    /// dropped when popped.
    scheduled: Option<(Instant, u64)>,

    /// Whether the callback is being invoked right now.
    running: bool,
}

/// The generation counter behind schedule entries.
static GENERATION: AtomicU64 = AtomicU64::new(1);

impl TimedEvent {
    /// Schedule this event after the given delay.
    ///
    /// If the event is already scheduled, the new time replaces the old one,
    /// whether earlier or later.  A running callback is not interrupted.
    pub fn schedule(self: &Arc<Self>, delta: Duration) {
        let Some(heap) = self.heap.upgrade() else {
            return;
        };
        let due = Instant::now() + delta;
        let generation = GENERATION.fetch_add(1, AtomicOrdering::Relaxed);

        self.state.lock().unwrap().scheduled = Some((due, generation));

        let mut state = heap.state.lock().unwrap();
        state.heap.push(HeapEntry {
            due,
            generation,
            event: self.clone(),
        });
        heap.notify.notify_all();
    }

    /// Cancel this event.
    ///
    /// Blocks until a callback invocation in progress returns.  Never call
    /// this from within the event's own callback; it cannot finish then.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        state.scheduled = None;
        while state.running {
            state = self.done.wait(state).unwrap();
        }
    }

    /// Whether the event is currently scheduled.
    pub fn is_scheduled(&self) -> bool {
        self.state.lock().unwrap().scheduled.is_some()
    }
}

//----------- HeapEntry --------------------------------------------------------

struct HeapEntry {
    due: Instant,
    generation: u64,
    event: Arc<TimedEvent>,
}

impl std::fmt::Debug for HeapEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapEntry")
            .field("due", &self.due)
            .field("generation", &self.generation)
            .finish()
    }
}

impl HeapEntry {
    /// Run the event's callback, unless this entry went stale.
    fn fire(self) {
        {
            let mut state = self.event.state.lock().unwrap();
            match state.scheduled {
                Some((_, generation)) if generation == self.generation => {
                    state.scheduled = None;
                    state.running = true;
                }
                // Rescheduled or cancelled since this entry was pushed.
                _ => {
                    trace!("dropping stale schedule entry");
                    return;
                }
            }
        }

        (self.event.cb)();

        let mut state = self.event.state.lock().unwrap();
        state.running = false;
        self.event.done.notify_all();
    }
}

// The heap is a max-heap; invert the ordering to pop the earliest entry.
// Ties fall back to generation order so the heap stays a total order.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.generation).cmp(&(self.due, self.generation))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.generation == other.generation
    }
}

impl Eq for HeapEntry {}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn counting_event(heap: &TimeHeap) -> (Arc<TimedEvent>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let event = heap.create(Box::new(move || {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        }));
        (event, count)
    }

    #[test]
    fn fires_in_order() {
        let heap = TimeHeap::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut events = Vec::new();
        for tag in ["second", "first"] {
            let order = order.clone();
            events.push(heap.create(Box::new(move || {
                order.lock().unwrap().push(tag);
            })));
        }

        heap.start();
        events[0].schedule(Duration::from_millis(60));
        events[1].schedule(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(150));
        heap.stop();
        heap.join();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn reschedule_replaces() {
        let heap = TimeHeap::new();
        let (event, count) = counting_event(&heap);

        heap.start();
        // The second schedule wins; only one fire results.
        event.schedule(Duration::from_millis(20));
        event.schedule(Duration::from_millis(50));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(AtomicOrdering::SeqCst), 0);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);

        heap.stop();
        heap.join();
    }

    #[test]
    fn cancel_prevents_fire() {
        let heap = TimeHeap::new();
        let (event, count) = counting_event(&heap);

        heap.start();
        event.schedule(Duration::from_millis(30));
        event.cancel();
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(count.load(AtomicOrdering::SeqCst), 0);

        heap.stop();
        heap.join();
    }

    #[test]
    fn cancel_schedule_race() {
        // Post-state is either cancelled or scheduled; a cancelled
        // generation never fires late ("no phantom fire").
        let heap = TimeHeap::new();
        let (event, count) = counting_event(&heap);
        heap.start();

        for _ in 0..100 {
            let e1 = event.clone();
            let e2 = event.clone();
            let t1 = std::thread::spawn(move || e1.cancel());
            let t2 = std::thread::spawn(move || e2.schedule(Duration::from_millis(5)));
            t1.join().unwrap();
            t2.join().unwrap();
            let scheduled = event.is_scheduled();
            let before = count.load(AtomicOrdering::SeqCst);
            std::thread::sleep(Duration::from_millis(15));
            let after = count.load(AtomicOrdering::SeqCst);
            if scheduled {
                // The surviving schedule fires exactly once; it may already
                // be counted in `before`.
                assert!((before..=before + 1).contains(&after));
            } else {
                assert_eq!(after, before);
            }
        }

        heap.stop();
        heap.join();
    }

    #[test]
    fn pause_retains_events() {
        let heap = TimeHeap::new();
        let (event, count) = counting_event(&heap);

        heap.start();
        heap.pause();
        event.schedule(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(AtomicOrdering::SeqCst), 0);
        heap.resume();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);

        heap.stop();
        heap.join();
    }
}
