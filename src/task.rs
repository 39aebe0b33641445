//! Cooperative tasks created by calling `async` functions.
//!
//! Tasks run on a single thread. A task starts when it is first awaited, when
//! a `yield` drains the ready queue, or when the program finishes.

use std::{cell::RefCell, collections::VecDeque, fmt, rc::Rc};

use crate::{
    diagnostics::{SourceSpan, Thrown},
    value::{Receiver, UserFunction, Value},
};

pub type TaskRef = Rc<RefCell<Task>>;

/// A deferred call, captured when the task was spawned.
pub struct Invocation {
    pub function: UserFunction,
    pub receiver: Option<Receiver>,
    pub args: Vec<Value>,
    pub span: SourceSpan,
}

pub enum TaskState {
    Pending(Invocation),
    Running,
    Completed(Value),
    Failed(Thrown),
}

pub struct Task {
    pub id: u64,
    pub name: String,
    pub state: TaskState,
}

impl Task {
    /// Moves a pending task to `Running` and hands out its invocation.
    pub fn start(&mut self) -> Option<Invocation> {
        match std::mem::replace(&mut self.state, TaskState::Running) {
            TaskState::Pending(invocation) => Some(invocation),
            other => {
                self.state = other;
                None
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, TaskState::Pending(_))
    }

    pub fn status(&self) -> &'static str {
        match self.state {
            TaskState::Pending(_) => "pending",
            TaskState::Running => "running",
            TaskState::Completed(_) => "completed",
            TaskState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<task #{} {} ({})>", self.id, self.name, self.status())
    }
}

/// FIFO of spawned tasks awaiting a turn.
#[derive(Default)]
pub struct TaskQueue {
    ready: VecDeque<TaskRef>,
    next_id: u64,
}

impl TaskQueue {
    pub fn spawn(&mut self, name: impl Into<String>, invocation: Invocation) -> TaskRef {
        self.next_id += 1;
        let task = Rc::new(RefCell::new(Task {
            id: self.next_id,
            name: name.into(),
            state: TaskState::Pending(invocation),
        }));
        self.ready.push_back(Rc::clone(&task));
        task
    }

    /// Next task that has not started yet; finished ones are dropped.
    pub fn next_pending(&mut self) -> Option<TaskRef> {
        while let Some(task) = self.ready.pop_front() {
            if task.borrow().is_pending() {
                return Some(task);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub fn clear(&mut self) {
        self.ready.clear();
    }
}
