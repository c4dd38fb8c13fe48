//! Per-thread call stacks
//!
//! Each thread's stack is created lazily on first use and lives as long as
//! the table. The table lock only covers lookup and insertion; a stack's own
//! lock is taken after the table lock has been released.

use fnv::FnvHashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::thread_id::ThreadId;

/// Exit hook that does not match the innermost entry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackMismatch {
    #[error("function stack mismatch on {thread}: exiting '{exiting}' but '{top}' is on top")]
    WrongTop {
        thread: ThreadId,
        exiting: String,
        top: String,
    },

    #[error("function stack mismatch on {thread}: exiting '{exiting}' with an empty stack")]
    Empty { thread: ThreadId, exiting: String },
}

/// Ordered routine names, innermost last
#[derive(Debug, Default, Clone)]
pub struct CallStack {
    frames: Vec<Arc<str>>,
}

impl CallStack {
    pub fn push(&mut self, name: Arc<str>) {
        self.frames.push(name);
    }

    /// Pop `name`; the stack stays unchanged if it is not on top
    pub fn pop(&mut self, thread: ThreadId, name: &str) -> Result<(), StackMismatch> {
        match self.frames.last() {
            Some(top) if &**top == name => {
                self.frames.pop();
                Ok(())
            }
            Some(top) => Err(StackMismatch::WrongTop {
                thread,
                exiting: name.to_string(),
                top: top.to_string(),
            }),
            None => Err(StackMismatch::Empty {
                thread,
                exiting: name.to_string(),
            }),
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[Arc<str>] {
        &self.frames
    }
}

/// All threads' stacks
#[derive(Debug, Default)]
pub struct StackTable {
    stacks: Mutex<FnvHashMap<ThreadId, Arc<Mutex<CallStack>>>>,
}

impl StackTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn stack(&self, thread: ThreadId) -> Option<Arc<Mutex<CallStack>>> {
        let mut stacks = self.stacks.lock().ok()?;
        Some(Arc::clone(stacks.entry(thread).or_default()))
    }

    fn with_stack<R>(&self, thread: ThreadId, f: impl FnOnce(&mut CallStack) -> R) -> Option<R> {
        let stack = self.stack(thread)?;
        let mut guard = stack.lock().ok()?;
        Some(f(&mut guard))
    }

    pub fn push(&self, thread: ThreadId, name: &str) {
        self.with_stack(thread, |stack| stack.push(Arc::from(name)));
    }

    pub fn pop(&self, thread: ThreadId, name: &str) -> Result<(), StackMismatch> {
        self.with_stack(thread, |stack| stack.pop(thread, name))
            .unwrap_or(Ok(()))
    }

    /// Copy of the thread's frames, outermost first
    pub fn snapshot(&self, thread: ThreadId) -> Vec<Arc<str>> {
        self.with_stack(thread, |stack| stack.frames().to_vec())
            .unwrap_or_default()
    }

    pub fn depth(&self, thread: ThreadId) -> usize {
        self.with_stack(thread, |stack| stack.depth()).unwrap_or(0)
    }

    pub fn thread_count(&self) -> usize {
        self.stacks.lock().map(|stacks| stacks.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_balanced() {
        let table = StackTable::new();
        let t = ThreadId::from_raw(1);
        table.push(t, "main");
        table.push(t, "worker");
        assert_eq!(table.depth(t), 2);
        assert!(table.pop(t, "worker").is_ok());
        assert!(table.pop(t, "main").is_ok());
        assert_eq!(table.depth(t), 0);
    }

    #[test]
    fn test_mismatch_leaves_stack_unchanged() {
        let table = StackTable::new();
        let t = ThreadId::from_raw(1);
        table.push(t, "main");
        table.push(t, "worker");

        let err = table.pop(t, "main").unwrap_err();
        assert!(matches!(err, StackMismatch::WrongTop { ref top, .. } if top == "worker"));
        let frames: Vec<String> = table.snapshot(t).iter().map(|f| f.to_string()).collect();
        assert_eq!(frames, vec!["main", "worker"]);
    }

    #[test]
    fn test_pop_on_empty_stack() {
        let table = StackTable::new();
        let err = table.pop(ThreadId::from_raw(3), "orphan").unwrap_err();
        assert!(err.to_string().contains("empty stack"));
    }

    #[test]
    fn test_stacks_are_per_thread() {
        let table = StackTable::new();
        table.push(ThreadId::from_raw(1), "a");
        table.push(ThreadId::from_raw(2), "b");
        assert_eq!(table.thread_count(), 2);
        assert_eq!(&*table.snapshot(ThreadId::from_raw(2))[0], "b");
    }
}
