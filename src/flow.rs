//! Step machines adapted into tasks.
//!
//! A [`StepMachine`] is the poll-driven shape of a suspended computation: it
//! is fed either a delivered value or an injected failure, runs to its next
//! suspension point, and reports whether it yielded an intermediate task or
//! finished. [`drive`] adapts such a machine into one `Task`, re-entering the
//! machine as each yielded task settles.
//!
//! The ambient context is captured once, when the drive starts, and
//! reinstated around every resumption — a machine observes the same
//! supertext at every step no matter where its awaited tasks settle.
//!
//! Settled intermediate tasks resume the machine synchronously, so a machine
//! that only awaits settled tasks runs to completion before `drive` returns.

use crate::supertext::Supertext;
use crate::task::{Handler, Task, TaskInput};
use crate::value::Value;
use std::cell::RefCell;
use std::rc::Rc;

/// What a resumption delivers into the machine.
pub enum Feed {
    /// The awaited task resolved with this value.
    Next(Value),
    /// The awaited task rejected with this reason.
    Throw(Value),
}

/// What the machine does with one resumption.
pub enum Step {
    /// Suspend until this task settles.
    Yield(Task),
    /// Finish with this value.
    Done(Value),
}

/// A poll-driven suspended computation.
pub trait StepMachine {
    /// Runs to the next suspension point. An `Err` rejects the driving task.
    fn poll(&mut self, feed: Feed) -> Result<Step, Value>;
}

/// Adapts a step machine into a task.
pub fn drive(machine: impl StepMachine + 'static) -> Task {
    let task = Task::unsettled();
    let machine: Rc<RefCell<dyn StepMachine>> = Rc::new(RefCell::new(machine));
    let context = task.context().supertext().clone();
    step(&machine, &task, &context, Feed::Next(Value::undefined()));
    task
}

fn step(
    machine: &Rc<RefCell<dyn StepMachine>>,
    task: &Task,
    context: &Supertext,
    feed: Feed,
) {
    let result = context.clone().run(|| machine.borrow_mut().poll(feed));
    match result {
        Ok(Step::Done(value)) => task.resolve(value),
        Ok(Step::Yield(awaited)) => {
            let machine = machine.clone();
            let task_for_next = task.clone();
            let task_for_throw = task.clone();
            let context_for_next = context.clone();
            let context_for_throw = context.clone();
            let machine_for_throw = machine.clone();
            let on_resolved: Handler = Box::new(move |value| {
                step(&machine, &task_for_next, &context_for_next, Feed::Next(value));
                Ok(TaskInput::Value(Value::undefined()))
            });
            let on_rejected: Handler = Box::new(move |reason| {
                step(
                    &machine_for_throw,
                    &task_for_throw,
                    &context_for_throw,
                    Feed::Throw(reason),
                );
                Ok(TaskInput::Value(Value::undefined()))
            });
            awaited.then(Some(on_resolved), Some(on_rejected));
        }
        Err(reason) => task.reject(reason),
    }
}
