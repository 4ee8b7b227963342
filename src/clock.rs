use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
};

use slabmap::SlabMap;

use crate::core::Runtime;

/// Callback handed to the host; it runs with the runtime when the host fires.
pub type ClockTask = Box<dyn FnOnce(&mut Runtime)>;

/// Cancellation handle for a scheduled frame or timeout.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ClockHandle(pub(crate) usize);

/// The host boundary: the only place execution yields. `now` is monotonic
/// milliseconds.
pub trait HostClock: 'static {
    fn now(&self) -> u64;
    fn microtask(&self, task: ClockTask);
    fn frame(&self, task: ClockTask) -> ClockHandle;
    fn cancel_frame(&self, handle: ClockHandle);
    fn timeout(&self, delay_ms: u64, task: ClockTask) -> ClockHandle;
    fn cancel_timeout(&self, handle: ClockHandle);
}

/// Deterministic host for tests and headless embeddings: time only moves
/// when the embedder advances it.
pub struct ManualClock {
    now: Cell<u64>,
    microtasks: RefCell<VecDeque<ClockTask>>,
    frames: RefCell<SlabMap<ClockTask>>,
    timeouts: RefCell<SlabMap<(u64, ClockTask)>>,
    microtasks_scheduled: Cell<usize>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Cell::new(0),
            microtasks: RefCell::new(VecDeque::new()),
            frames: RefCell::new(SlabMap::new()),
            timeouts: RefCell::new(SlabMap::new()),
            microtasks_scheduled: Cell::new(0),
        }
    }

    /// Total microtask dispatches the runtime has requested so far.
    pub fn microtasks_scheduled(&self) -> usize {
        self.microtasks_scheduled.get()
    }

    /// Drain the microtask queue, including microtasks scheduled while
    /// draining.
    pub fn run_microtasks(&self, rt: &mut Runtime) {
        crate::asynx::apply_wakes(rt);
        loop {
            let task = self.microtasks.borrow_mut().pop_front();
            match task {
                Some(task) => task(rt),
                None => break,
            }
            crate::asynx::apply_wakes(rt);
        }
    }

    /// Fire every scheduled frame callback once, then drain microtasks.
    pub fn run_frame(&self, rt: &mut Runtime) {
        let frames: Vec<ClockTask> = {
            let mut slab = self.frames.borrow_mut();
            let keys: Vec<usize> = slab.iter().map(|(key, _)| key).collect();
            keys.into_iter().filter_map(|k| slab.remove(k)).collect()
        };
        for task in frames {
            task(rt);
        }
        self.run_microtasks(rt);
    }

    /// Advance time by `ms`, firing due timeouts in due order and draining
    /// microtasks after each.
    pub fn advance(&self, ms: u64, rt: &mut Runtime) {
        let target = self.now.get() + ms;
        loop {
            let next = {
                let slab = self.timeouts.borrow();
                slab.iter()
                    .filter(|entry| entry.1.0 <= target)
                    .min_by_key(|entry| (entry.1.0, entry.0))
                    .map(|entry| (entry.0, entry.1.0))
            };
            let Some((key, due)) = next else {
                break;
            };
            self.now.set(due);
            let task = self.timeouts.borrow_mut().remove(key);
            if let Some((_, task)) = task {
                task(rt);
            }
            self.run_microtasks(rt);
        }
        self.now.set(target);
        self.run_microtasks(rt);
    }
}

impl HostClock for ManualClock {
    fn now(&self) -> u64 {
        self.now.get()
    }

    fn microtask(&self, task: ClockTask) {
        self.microtasks.borrow_mut().push_back(task);
        self.microtasks_scheduled
            .set(self.microtasks_scheduled.get() + 1);
    }

    fn frame(&self, task: ClockTask) -> ClockHandle {
        ClockHandle(self.frames.borrow_mut().insert(task))
    }

    fn cancel_frame(&self, handle: ClockHandle) {
        self.frames.borrow_mut().remove(handle.0);
    }

    fn timeout(&self, delay_ms: u64, task: ClockTask) -> ClockHandle {
        let due = self.now.get() + delay_ms;
        ClockHandle(self.timeouts.borrow_mut().insert((due, task)))
    }

    fn cancel_timeout(&self, handle: ClockHandle) {
        self.timeouts.borrow_mut().remove(handle.0);
    }
}
