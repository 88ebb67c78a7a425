//! Deterministic cooperative run loop.
//!
//! Single-threaded: a FIFO microtask queue plus a virtual-clock timer heap.
//! The same sequence of spawns and timeouts produces the same execution
//! order across runs — timers fire by ascending due time with insertion
//! order as the tie-break, and the clock only advances when the queue is
//! empty.
//!
//! Timeout callbacks are wrapped in context-bind semantics: the callback
//! runs under the merge of the context captured at scheduling time and the
//! context current when it fires.

use crate::supertext::Supertext;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

type Job = Box<dyn FnOnce()>;

struct Timer {
    due: u64,
    seq: u64,
    job: Job,
}

/// Order key: `(due, seq)`, earliest first through `Reverse` in the heap.
impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Timer {}

/// Cooperative scheduler with virtual time.
pub struct Scheduler {
    queue: RefCell<VecDeque<Job>>,
    timers: RefCell<BinaryHeap<std::cmp::Reverse<Timer>>>,
    now: Cell<u64>,
    seq: Cell<u64>,
}

impl Scheduler {
    /// Creates an idle scheduler at virtual time zero.
    pub fn new() -> Self {
        Self {
            queue: RefCell::new(VecDeque::new()),
            timers: RefCell::new(BinaryHeap::new()),
            now: Cell::new(0),
            seq: Cell::new(0),
        }
    }

    /// Current virtual time.
    pub fn now(&self) -> u64 {
        self.now.get()
    }

    /// Enqueues a microtask at the back of the queue.
    pub fn spawn(&self, job: impl FnOnce() + 'static) {
        self.queue.borrow_mut().push_back(Box::new(job));
    }

    /// Schedules `job` to run `delay` virtual ticks from now, bound to the
    /// ambient context at this call.
    pub fn set_timeout_with_context(&self, delay: u64, job: impl FnOnce() + 'static) {
        let bound = Supertext::bind_once(job);
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        self.timers.borrow_mut().push(std::cmp::Reverse(Timer {
            due: self.now.get().saturating_add(delay),
            seq,
            job: Box::new(bound),
        }));
    }

    /// Drains the queue; when it runs dry, advances the clock to the next
    /// timer and keeps going. Returns the number of jobs run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = self.queue.borrow_mut().pop_front();
            if let Some(job) = job {
                job();
                ran += 1;
                continue;
            }
            let timer = self.timers.borrow_mut().pop();
            match timer {
                Some(std::cmp::Reverse(timer)) => {
                    self.now.set(timer.due.max(self.now.get()));
                    (timer.job)();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
