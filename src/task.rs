//! Promise-shaped settlement containers with a synchronous fast path and
//! ambient-context capture.
//!
//! A `Task` moves `UNSETTLED -> SETTLING -> RESOLVED | REJECTED`. The first
//! `resolve`/`reject` wins; resolving with another task moves to `SETTLING`
//! and adopts that task's eventual outcome. Reactions registered on a
//! pending task fire in registration order at settlement; reactions
//! registered on a settled task fire *synchronously, before `then`
//! returns* — a required deviation from always-asynchronous promise
//! delivery, preserved deliberately.
//!
//! Every task captures a lightweight context at construction: the ambient
//! supertext plus a weak link to the constructing task's context. The chain
//! exists for diagnostics and never owns task objects. Executors and
//! reaction handlers run with the owning task's context established.
//!
//! The future conversion (`to_future`) mirrors settlement into one shared
//! cell per task, so converting twice observes the same underlying future
//! state.
//!
//! # Citations
//! - Promises: Liskov & Shrira, "Promises: linguistic support for efficient
//!   asynchronous procedure calls" (PLDI 1988)
//! - Thenable assimilation: Promises/A+ specification, §2.3

use crate::supertext::Supertext;
use crate::value::{Obj, Value};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

/// Settlement phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// No settlement yet.
    Unsettled,
    /// Adopting another task's outcome.
    Settling,
    /// Settled with a value.
    Resolved,
    /// Settled with a reason.
    Rejected,
}

/// Final settlement of a task.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The task's value.
    Resolved(Value),
    /// The rejection reason.
    Rejected(Value),
}

/// What a task may be resolved with: a plain value, or another task whose
/// outcome is adopted.
pub enum TaskInput {
    /// Settles immediately.
    Value(Value),
    /// Adopts through `SETTLING`.
    Task(Task),
}

impl From<Value> for TaskInput {
    fn from(value: Value) -> Self {
        TaskInput::Value(value)
    }
}

impl From<Task> for TaskInput {
    fn from(task: Task) -> Self {
        TaskInput::Task(task)
    }
}

/// Settlement handler: transforms a value or reason into the child task's
/// input. An `Err` rejects the child.
pub type Handler = Box<dyn FnOnce(Value) -> Result<TaskInput, Value>>;

struct ContextCell {
    supertext: Supertext,
    parent: Option<Weak<ContextCell>>,
}

/// Lightweight per-task context: the captured supertext plus a weak
/// diagnostic link to the constructing task's context.
#[derive(Clone)]
pub struct TaskContext {
    cell: Rc<ContextCell>,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("depth", &self.ancestry().len())
            .finish()
    }
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<Weak<ContextCell>>> = const { RefCell::new(None) };
}

impl TaskContext {
    fn capture() -> TaskContext {
        TaskContext {
            cell: Rc::new(ContextCell {
                supertext: Supertext::current(),
                parent: CURRENT_TASK.with(|current| current.borrow().clone()),
            }),
        }
    }

    /// The supertext captured at task construction.
    pub fn supertext(&self) -> &Supertext {
        &self.cell.supertext
    }

    /// The constructing task's context, if it is still alive. The link is
    /// weak; a finished ancestor may already be gone.
    pub fn parent(&self) -> Option<TaskContext> {
        self.cell
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|cell| TaskContext { cell })
    }

    /// The still-live ancestor chain, nearest first.
    pub fn ancestry(&self) -> Vec<TaskContext> {
        let mut chain = Vec::new();
        let mut cursor = self.parent();
        while let Some(context) = cursor {
            cursor = context.parent();
            chain.push(context);
        }
        chain
    }
}

/// Restores the previous task context on drop, panic included.
struct TaskScope {
    previous: Option<Weak<ContextCell>>,
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        CURRENT_TASK.with(|current| {
            *current.borrow_mut() = self.previous.take();
        });
    }
}

fn enter_task(context: &TaskContext) -> TaskScope {
    CURRENT_TASK.with(|current| TaskScope {
        previous: current
            .borrow_mut()
            .replace(Rc::downgrade(&context.cell)),
    })
}

type Reaction = Box<dyn FnOnce(&Outcome)>;

struct FutureCell {
    outcome: RefCell<Option<Outcome>>,
    wakers: RefCell<Vec<Waker>>,
}

struct TaskCell {
    state: Cell<TaskState>,
    outcome: RefCell<Option<Outcome>>,
    reactions: RefCell<Vec<Reaction>>,
    context: TaskContext,
    future: RefCell<Option<Rc<FutureCell>>>,
}

/// Settlement container with synchronous delivery on settled tasks.
#[derive(Clone)]
pub struct Task {
    cell: Rc<TaskCell>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

thread_local! {
    static VOID: Task = Task::resolved(Value::undefined());
}

impl Task {
    /// Creates a task with no executor; settle it through
    /// [`resolve`](Self::resolve) / [`reject`](Self::reject).
    pub fn unsettled() -> Task {
        Task {
            cell: Rc::new(TaskCell {
                state: Cell::new(TaskState::Unsettled),
                outcome: RefCell::new(None),
                reactions: RefCell::new(Vec::new()),
                context: TaskContext::capture(),
                future: RefCell::new(None),
            }),
        }
    }

    /// Creates a task and runs `executor` synchronously with the task's
    /// context established. An `Err` from the executor rejects the task.
    pub fn new(executor: impl FnOnce(&Task) -> Result<(), Value>) -> Task {
        let task = Task::unsettled();
        let result = task.run_in_context(|| executor(&task));
        if let Err(reason) = result {
            task.reject(reason);
        }
        task
    }

    /// The shared void task, resolved with `undefined`.
    pub fn void() -> Task {
        VOID.with(Task::clone)
    }

    /// A task already resolved with `value`.
    pub fn resolved(value: Value) -> Task {
        let task = Task::unsettled();
        task.resolve(value);
        task
    }

    /// A task already rejected with `reason`.
    pub fn rejected(reason: Value) -> Task {
        let task = Task::unsettled();
        task.reject(reason);
        task
    }

    /// Current settlement phase.
    pub fn state(&self) -> TaskState {
        self.cell.state.get()
    }

    /// Whether `self` and `other` are the same task.
    #[inline]
    pub fn same(&self, other: &Task) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }

    /// This task's context record.
    pub fn context(&self) -> &TaskContext {
        &self.cell.context
    }

    fn run_in_context<R>(&self, f: impl FnOnce() -> R) -> R {
        let context = self.cell.context.clone();
        context.supertext().clone().run(|| {
            let _scope = enter_task(&context);
            f()
        })
    }

    /// Resolves the task. Idempotent: only the first settlement counts.
    /// Resolving with another task adopts its outcome through `SETTLING`.
    pub fn resolve(&self, input: impl Into<TaskInput>) {
        if self.state() != TaskState::Unsettled {
            return;
        }
        match input.into() {
            TaskInput::Value(value) => self.settle(Outcome::Resolved(value)),
            TaskInput::Task(inner) => {
                if inner.same(self) {
                    self.settle(Outcome::Rejected(Value::str(
                        "task resolved with itself",
                    )));
                    return;
                }
                self.cell.state.set(TaskState::Settling);
                let target = self.clone();
                inner.on_settle(Box::new(move |outcome| {
                    target.settle(outcome.clone());
                }));
            }
        }
    }

    /// Rejects the task. Idempotent: only the first settlement counts.
    pub fn reject(&self, reason: Value) {
        if self.state() != TaskState::Unsettled {
            return;
        }
        self.settle(Outcome::Rejected(reason));
    }

    /// Final settlement: records the outcome and drains reactions in
    /// registration order. Reactions observe the terminal state.
    fn settle(&self, outcome: Outcome) {
        debug_assert!(matches!(
            self.state(),
            TaskState::Unsettled | TaskState::Settling
        ));
        self.cell.state.set(match &outcome {
            Outcome::Resolved(_) => TaskState::Resolved,
            Outcome::Rejected(_) => TaskState::Rejected,
        });
        *self.cell.outcome.borrow_mut() = Some(outcome.clone());
        let reactions = std::mem::take(&mut *self.cell.reactions.borrow_mut());
        for reaction in reactions {
            reaction(&outcome);
        }
    }

    /// Runs `f` now if the task is terminal, otherwise queues it.
    fn on_settle(&self, f: Reaction) {
        let settled = self.cell.outcome.borrow().clone();
        match settled {
            Some(outcome) => f(&outcome),
            None => self.cell.reactions.borrow_mut().push(f),
        }
    }

    /// Registers settlement handlers and returns the derived child task.
    ///
    /// On a terminal task the handler runs — and the child settles — before
    /// `then` returns. Handlers run with the child's context established
    /// (the ambient context of this `then` call).
    pub fn then(&self, on_resolved: Option<Handler>, on_rejected: Option<Handler>) -> Task {
        let child = Task::unsettled();
        let feeder = child.clone();
        self.on_settle(Box::new(move |outcome| {
            let (value, handler, is_rejection) = match outcome {
                Outcome::Resolved(v) => (v.clone(), on_resolved, false),
                Outcome::Rejected(e) => (e.clone(), on_rejected, true),
            };
            match handler {
                Some(f) => match feeder.run_in_context(|| f(value)) {
                    Ok(input) => feeder.resolve(input),
                    Err(reason) => feeder.reject(reason),
                },
                None if is_rejection => feeder.reject(value),
                None => feeder.resolve(value),
            }
        }));
        child
    }

    /// Transforms the resolution value; rejections pass through.
    pub fn map(&self, f: impl FnOnce(Value) -> Value + 'static) -> Task {
        self.then(Some(Box::new(move |v| Ok(TaskInput::Value(f(v))))), None)
    }

    /// Recovers from rejection; resolutions pass through.
    pub fn catch(&self, f: impl FnOnce(Value) -> Value + 'static) -> Task {
        self.then(None, Some(Box::new(move |e| Ok(TaskInput::Value(f(e))))))
    }

    /// Resolves when every input resolves, with the list of results in input
    /// order. Non-task inputs pass through. The first rejection rejects the
    /// whole.
    pub fn all(inputs: impl IntoIterator<Item = TaskInput>) -> Task {
        let result = Task::unsettled();
        let slots: Rc<RefCell<Vec<Option<Value>>>> = Rc::new(RefCell::new(Vec::new()));
        let mut pending: Vec<(usize, Task)> = Vec::new();
        for (at, input) in inputs.into_iter().enumerate() {
            match input {
                TaskInput::Value(v) => slots.borrow_mut().push(Some(v)),
                TaskInput::Task(t) => {
                    slots.borrow_mut().push(None);
                    pending.push((at, t));
                }
            }
        }
        let remaining = Rc::new(Cell::new(pending.len()));
        let deliver = {
            let slots = slots.clone();
            let result = result.clone();
            move || {
                let values: Vec<Value> = slots
                    .borrow()
                    .iter()
                    .map(|slot| slot.clone().unwrap_or(Value::undefined()))
                    .collect();
                result.resolve(Value::from(Obj::list(values)));
            }
        };
        if pending.is_empty() {
            deliver();
            return result;
        }
        let deliver = Rc::new(deliver);
        for (at, task) in pending {
            let slots = slots.clone();
            let remaining = remaining.clone();
            let result = result.clone();
            let deliver = deliver.clone();
            task.on_settle(Box::new(move |outcome| match outcome {
                Outcome::Resolved(v) => {
                    slots.borrow_mut()[at] = Some(v.clone());
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        deliver();
                    }
                }
                Outcome::Rejected(e) => result.reject(e.clone()),
            }));
        }
        result
    }

    /// The task's future view. Idempotent: every call shares one settlement
    /// cell, mirrored from the task when it settles.
    pub fn to_future(&self) -> TaskFuture {
        let mut slot = self.cell.future.borrow_mut();
        let cell = match &*slot {
            Some(cell) => cell.clone(),
            None => {
                let cell = Rc::new(FutureCell {
                    outcome: RefCell::new(None),
                    wakers: RefCell::new(Vec::new()),
                });
                let mirror = cell.clone();
                self.on_settle(Box::new(move |outcome| {
                    *mirror.outcome.borrow_mut() = Some(outcome.clone());
                    for waker in mirror.wakers.borrow_mut().drain(..) {
                        waker.wake();
                    }
                }));
                *slot = Some(cell.clone());
                cell
            }
        };
        TaskFuture { cell }
    }
}

/// Future view of a task's settlement.
pub struct TaskFuture {
    cell: Rc<FutureCell>,
}

impl TaskFuture {
    /// Whether two views share the same settlement cell.
    pub fn same(&self, other: &TaskFuture) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Future for TaskFuture {
    type Output = Result<Value, Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = &*self.cell.outcome.borrow() {
            return Poll::Ready(match outcome {
                Outcome::Resolved(v) => Ok(v.clone()),
                Outcome::Rejected(e) => Err(e.clone()),
            });
        }
        self.cell.wakers.borrow_mut().push(cx.waker().clone());
        Poll::Pending
    }
}
