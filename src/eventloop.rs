//! The cooperative event loop.
//!
//! One owner thread per loop runs the iteration: process reactor events,
//! park when idle, drain the cross-thread submit queue (bounded), run the
//! scheduler tick, run local tasks, fire due timers. All mutable loop
//! state lives in [`LoopCore`], touched only by the owner thread; the
//! cloneable [`EventLoop`] handle exposes the cross-thread surface
//! (`execute`, `offer`, `wakeup`, `shutdown`, `await_termination`) backed
//! by the `state`/`wakeup_needed` atomics and an MPSC channel.
//!
//! The park protocol is the classical check-then-arm-then-recheck
//! handshake: the loop sets `wakeup_needed` immediately before a kernel
//! wait and clears it after; producers enqueue first, then wake only when
//! they observe-and-clear the flag.

use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::rc::Rc;
use std::sync::atomic::{fence, AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error};

use crate::config::Config;
use crate::error::Error;
use crate::iobuffer::IoBuffer;
use crate::metrics;
use crate::reactor::{IoEvent, ParkMode, Reactor, Wakener};
use crate::scheduler::{NoopScheduler, Scheduler};
use crate::socket::ChannelTable;

/// Tasks handed in from other threads.
pub(crate) type LoopTask = Box<dyn FnOnce(&LoopCore) + Send>;
/// Tasks queued by the owner thread (timers, deferred work).
pub(crate) type LocalTask = Box<dyn FnOnce(&LoopCore)>;

/// Concurrent-queue drain budget per iteration, so a submit storm cannot
/// starve I/O dispatch.
const CONCURRENT_BATCH: usize = 1024;

/// Loop lifecycle. Transitions are monotonic:
/// NEW → RUNNING → SHUTDOWN → TERMINATED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    New = 0,
    Running = 1,
    Shutdown = 2,
    Terminated = 3,
}

impl LoopState {
    fn from_u8(v: u8) -> LoopState {
        match v {
            0 => LoopState::New,
            1 => LoopState::Running,
            2 => LoopState::Shutdown,
            _ => LoopState::Terminated,
        }
    }
}

pub(crate) struct LoopShared {
    pub(crate) index: usize,
    pub(crate) name: String,
    pub(crate) spin: bool,
    state: AtomicU8,
    pub(crate) wakeup_needed: AtomicBool,
    tasks_tx: Sender<LoopTask>,
    wakener: Arc<dyn Wakener>,
    owner: OnceLock<thread::ThreadId>,
    terminated: Mutex<bool>,
    terminated_cv: Condvar,
}

impl LoopShared {
    pub(crate) fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn mark_terminated(&self) {
        self.state
            .store(LoopState::Terminated as u8, Ordering::Release);
        let mut done = self.terminated.lock().unwrap();
        *done = true;
        self.terminated_cv.notify_all();
    }
}

/// Seed moved into the owner thread on `start()`.
struct CoreSeed {
    reactor: Box<dyn Reactor + Send>,
    tasks_rx: Receiver<LoopTask>,
    scheduler: Box<dyn Scheduler + Send>,
    config: Config,
}

/// Handle to one event loop. Cheap to clone; safe from any thread.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<LoopShared>,
    seed: Arc<Mutex<Option<CoreSeed>>>,
    join: Arc<Mutex<Option<thread::JoinHandle<()>>>>,
}

impl EventLoop {
    /// Construct a loop (state NEW). The reactor backend is created here
    /// so setup failures surface before any thread spawns.
    pub fn new(index: usize, config: &Config) -> Result<EventLoop, Error> {
        config.validate()?;
        let reactor = crate::reactor::open(config)?;
        let wakener = reactor.wakener();
        let (tasks_tx, tasks_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(LoopShared {
            index,
            name: format!("{}-loop-{}", config.name, index),
            spin: config.spin,
            state: AtomicU8::new(LoopState::New as u8),
            wakeup_needed: AtomicBool::new(false),
            tasks_tx,
            wakener,
            owner: OnceLock::new(),
            terminated: Mutex::new(false),
            terminated_cv: Condvar::new(),
        });
        Ok(EventLoop {
            shared,
            seed: Arc::new(Mutex::new(Some(CoreSeed {
                reactor,
                tasks_rx,
                scheduler: Box::new(NoopScheduler),
                config: config.clone(),
            }))),
            join: Arc::new(Mutex::new(None)),
        })
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn state(&self) -> LoopState {
        self.shared.state()
    }

    /// Install the cooperative scheduler. Must run before `start()`.
    pub fn set_scheduler(&self, scheduler: Box<dyn Scheduler + Send>) -> Result<(), Error> {
        let mut seed = self.seed.lock().unwrap();
        match seed.as_mut() {
            Some(seed) => {
                seed.scheduler = scheduler;
                Ok(())
            }
            None => Err(Error::InvalidConfig("loop already started".into())),
        }
    }

    /// Spawn the owner thread and enter the loop.
    pub fn start(&self) -> Result<(), Error> {
        let seed = self
            .seed
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::InvalidConfig("loop already started".into()))?;
        if self
            .shared
            .state
            .compare_exchange(
                LoopState::New as u8,
                LoopState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::Shutdown);
        }
        let shared = self.shared.clone();
        let pin = seed.config.pin_to_core.then(|| seed.config.core_offset + shared.index);
        let handle = thread::Builder::new()
            .name(shared.name.clone())
            .spawn(move || {
                if let Some(core_id) = pin {
                    if let Err(e) = pin_to_core(core_id) {
                        debug!("{}: could not pin to core {core_id}: {e}", shared.name);
                    }
                }
                let _ = shared.owner.set(thread::current().id());
                let core = Rc::new(LoopCore {
                    shared: shared.clone(),
                    config: seed.config,
                    reactor: RefCell::new(seed.reactor),
                    channels: RefCell::new(ChannelTable::new()),
                    tasks_rx: seed.tasks_rx,
                    local_tasks: RefCell::new(VecDeque::new()),
                    timers: RefCell::new(BinaryHeap::new()),
                    timer_seq: Cell::new(0),
                    scheduler: RefCell::new(seed.scheduler),
                    events: RefCell::new(Vec::with_capacity(256)),
                });
                CURRENT.with(|c| *c.borrow_mut() = Some(core.clone()));
                debug!("{} running", shared.name);
                if let Err(e) = core.run() {
                    error!("{} terminating on reactor error: {e}", shared.name);
                }
                core.terminate();
                CURRENT.with(|c| *c.borrow_mut() = None);
            })
            .map_err(Error::Io)?;
        *self.join.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Enqueue a task on the concurrent run queue. Safe from any thread;
    /// rejected once the loop is shutting down.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> Result<(), Error> {
        self.submit(Box::new(move |_core| task()))
    }

    pub(crate) fn submit(&self, task: LoopTask) -> Result<(), Error> {
        if self.shared.state() >= LoopState::Shutdown {
            return Err(Error::Shutdown);
        }
        self.shared
            .tasks_tx
            .send(task)
            .map_err(|_| Error::Shutdown)?;
        self.wakeup();
        Ok(())
    }

    /// Hand a request buffer to this loop's scheduler. Loop-local fast
    /// path from the owner thread; routed through the concurrent queue
    /// otherwise. A rejected buffer is released.
    pub fn offer(&self, buffer: IoBuffer) -> Result<(), Error> {
        if let Some(core) = current_if(&self.shared) {
            core.schedule_request(buffer);
            return Ok(());
        }
        self.submit(Box::new(move |core| core.schedule_request(buffer)))
    }

    /// Run `task` at `deadline`. Only callable from the owning thread;
    /// anything else is a programming error.
    pub fn schedule_at(&self, deadline: Instant, task: impl FnOnce() + 'static) {
        let core = current_if(&self.shared)
            .expect("schedule_at called from a thread that does not own this loop");
        core.schedule_local(deadline, Box::new(move |_core| task()));
    }

    /// Run `task` after `delay` on the owning thread.
    pub fn schedule_after(&self, delay: Duration, task: impl FnOnce() + 'static) {
        self.schedule_at(Instant::now() + delay, task);
    }

    /// Idempotent cross-thread nudge. A no-op from the owner thread, in
    /// spin mode, and whenever no park is armed.
    pub fn wakeup(&self) {
        if self.shared.spin || self.is_owner() {
            return;
        }
        if self
            .shared
            .wakeup_needed
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            metrics::WAKEUPS.increment();
            self.shared.wakener.wake();
        }
    }

    /// Request termination. Idempotent.
    pub fn shutdown(&self) {
        loop {
            match self.shared.state() {
                LoopState::New => {
                    // Never started: terminate in place.
                    if self
                        .shared
                        .state
                        .compare_exchange(
                            LoopState::New as u8,
                            LoopState::Terminated as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.seed.lock().unwrap().take();
                        self.shared.mark_terminated();
                        return;
                    }
                }
                LoopState::Running => {
                    if self
                        .shared
                        .state
                        .compare_exchange(
                            LoopState::Running as u8,
                            LoopState::Shutdown as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.shared.wakener.wake();
                        return;
                    }
                }
                LoopState::Shutdown | LoopState::Terminated => return,
            }
        }
    }

    /// Block until the loop reaches TERMINATED or the timeout elapses.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.shared.terminated.lock().unwrap();
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, res) = self
                .shared
                .terminated_cv
                .wait_timeout(done, deadline - now)
                .unwrap();
            done = guard;
            if res.timed_out() && !*done {
                return false;
            }
        }
        // Reap the thread so fds and TLS are fully gone.
        if let Some(handle) = self.join.lock().unwrap().take() {
            let _ = handle.join();
        }
        true
    }

    pub fn is_owner(&self) -> bool {
        self.shared
            .owner
            .get()
            .is_some_and(|id| *id == thread::current().id())
    }

    pub(crate) fn shared(&self) -> &Arc<LoopShared> {
        &self.shared
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("index", &self.shared.index)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialOrd for LoopState {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LoopState {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

// ── Owner-thread state ──────────────────────────────────────────────

thread_local! {
    static CURRENT: RefCell<Option<Rc<LoopCore>>> = const { RefCell::new(None) };
}

/// The loop core running on the current thread, if any.
pub(crate) fn current() -> Option<Rc<LoopCore>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// The current core only when it is exactly this loop (two engines in
/// one process may both have a loop at the same index).
pub(crate) fn current_if(shared: &Arc<LoopShared>) -> Option<Rc<LoopCore>> {
    current().filter(|core| Arc::ptr_eq(&core.shared, shared))
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    task: LocalTask,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert for earliest-deadline-first.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Loop-local state. Owned by the loop thread; fields are `pub(crate)`
/// so socket code in this crate can drive the channel table.
pub(crate) struct LoopCore {
    pub(crate) shared: Arc<LoopShared>,
    pub(crate) config: Config,
    pub(crate) reactor: RefCell<Box<dyn Reactor + Send>>,
    pub(crate) channels: RefCell<ChannelTable>,
    tasks_rx: Receiver<LoopTask>,
    pub(crate) local_tasks: RefCell<VecDeque<LocalTask>>,
    timers: RefCell<BinaryHeap<TimerEntry>>,
    timer_seq: Cell<u64>,
    scheduler: RefCell<Box<dyn Scheduler + Send>>,
    events: RefCell<Vec<IoEvent>>,
}

impl LoopCore {
    fn run(self: &Rc<LoopCore>) -> io::Result<()> {
        let mut more_work = false;
        while self.shared.state() == LoopState::Running {
            // 1. Process whatever is ready, without blocking.
            let had_events = {
                let mut events = self.events.borrow_mut();
                events.clear();
                self.reactor
                    .borrow_mut()
                    .poll(ParkMode::NoWait, &mut events)?;
                !events.is_empty()
            };
            if had_events {
                self.dispatch_events();
            } else if self.shared.spin || more_work {
                // 2. Keep the kernel fed but never park.
                self.reactor.borrow_mut().submit()?;
            } else {
                // 3. Arm the wakeup flag, then re-check the queue: a
                // producer enqueues first and wakes only if it observes
                // the armed flag, so one side always sees the other.
                self.shared.wakeup_needed.store(true, Ordering::SeqCst);
                fence(Ordering::SeqCst);
                if self.tasks_rx.is_empty() {
                    metrics::PARKS.increment();
                    match self.next_deadline() {
                        Some(deadline) => {
                            let now = Instant::now();
                            if deadline > now {
                                let mut events = self.events.borrow_mut();
                                events.clear();
                                self.reactor
                                    .borrow_mut()
                                    .poll(ParkMode::Timeout(deadline - now), &mut events)?;
                            } else {
                                self.reactor.borrow_mut().submit()?;
                            }
                        }
                        None => {
                            let mut events = self.events.borrow_mut();
                            events.clear();
                            self.reactor.borrow_mut().poll(ParkMode::Wait, &mut events)?;
                        }
                    }
                } else {
                    self.reactor.borrow_mut().submit()?;
                }
                self.shared.wakeup_needed.store(false, Ordering::SeqCst);
                self.dispatch_events();
            }

            self.run_timers();
            // 4. Bounded drain of externally submitted tasks.
            self.run_concurrent_tasks();
            // 5. Cooperative user work.
            more_work = self.scheduler.borrow_mut().tick();
            // 6. Owner-thread deque.
            self.run_local_tasks();
        }
        Ok(())
    }

    fn dispatch_events(self: &Rc<LoopCore>) {
        // Detach the batch so handlers may arm operations and close
        // channels without tripping over an active borrow.
        let mut events = std::mem::take(&mut *self.events.borrow_mut());
        for ev in events.drain(..) {
            match ev {
                IoEvent::Wakeup | IoEvent::TimerFired => {}
                IoEvent::Readable { fd } => self.handle_readable(fd),
                IoEvent::Writable { fd } => self.handle_writable(fd),
                IoEvent::Failed { fd } => self.handle_failed(fd),
                IoEvent::ReadDone { fd, result } => self.handle_read_done(fd, result),
                IoEvent::WriteDone { fd, result } => self.handle_write_done(fd, result),
                IoEvent::AcceptDone { fd, result } => self.handle_accept_done(fd, result),
                IoEvent::ConnectDone { fd, result } => self.handle_connect_done(fd, result),
            }
        }
        let mut slot = self.events.borrow_mut();
        if slot.capacity() < events.capacity() {
            *slot = events;
        }
    }

    pub(crate) fn schedule_request(&self, buffer: IoBuffer) {
        match self.scheduler.try_borrow_mut() {
            Ok(mut scheduler) => scheduler.schedule(buffer),
            // Offered from inside tick(): defer one beat.
            Err(_) => self.local_tasks.borrow_mut().push_back(Box::new(
                move |core: &LoopCore| core.scheduler.borrow_mut().schedule(buffer),
            )),
        }
    }

    pub(crate) fn schedule_local(&self, deadline: Instant, task: LocalTask) {
        let seq = self.timer_seq.get();
        self.timer_seq.set(seq + 1);
        self.timers.borrow_mut().push(TimerEntry {
            deadline,
            seq,
            task,
        });
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.borrow().peek().map(|t| t.deadline)
    }

    fn run_timers(self: &Rc<LoopCore>) {
        let now = Instant::now();
        loop {
            let task = {
                let mut timers = self.timers.borrow_mut();
                match timers.peek() {
                    Some(entry) if entry.deadline <= now => timers.pop().map(|e| e.task),
                    _ => None,
                }
            };
            match task {
                Some(task) => task(self),
                None => break,
            }
        }
    }

    fn run_concurrent_tasks(self: &Rc<LoopCore>) {
        for _ in 0..CONCURRENT_BATCH {
            match self.tasks_rx.try_recv() {
                Ok(task) => {
                    metrics::TASKS_EXECUTED.increment();
                    task(self);
                }
                Err(_) => break,
            }
        }
    }

    fn run_local_tasks(self: &Rc<LoopCore>) {
        loop {
            let task = self.local_tasks.borrow_mut().pop_front();
            match task {
                Some(task) => task(self),
                None => break,
            }
        }
    }

    /// Final cleanup once the loop leaves RUNNING: close every registered
    /// channel, drop queued work, and publish TERMINATED.
    fn terminate(self: &Rc<LoopCore>) {
        let fds = self.channels.borrow().fds();
        for fd in fds {
            self.close_channel(fd, Some(io::Error::other("loop shut down")));
        }
        // Channels still draining cancelled kernel operations keep their
        // storage parked until the core drops (the reactor is torn down
        // first, by field order); only the fds are released here.
        for fd in self.channels.borrow().fds() {
            unsafe { libc::close(fd) };
        }
        while self.tasks_rx.try_recv().is_ok() {}
        self.local_tasks.borrow_mut().clear();
        self.timers.borrow_mut().clear();
        debug!("{} terminated", self.shared.name);
        self.shared.mark_terminated();
    }
}

/// Pin the current thread to a specific CPU core.
fn pin_to_core(core: usize) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
