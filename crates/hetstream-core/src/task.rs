//! Waiting-task primitive: the pending host-side notification a scope
//! owns while asynchronous GPU work is in flight.
//!
//! The host scheduler hands each asynchronous stage a
//! [`WaitingTaskHolder`]. The stage (through its scope) either fires it
//! directly or composes further continuations in front of it with
//! [`WaitingTaskHolder::chain`]; in both cases every notification target
//! that was ever held fires exactly once.

use tracing::debug;

use crate::error::HetstreamError;

/// Outcome delivered to a waiting task.
#[derive(Debug, Clone)]
pub enum TaskStatus {
    /// All asynchronous work the stage queued has completed.
    Done,
    /// The stage failed; the pipeline run is aborted.
    Failed(HetstreamError),
}

impl TaskStatus {
    /// Wraps an error into a failure status.
    #[must_use]
    pub fn failed(err: HetstreamError) -> Self {
        Self::Failed(err)
    }

    /// True when the status is [`TaskStatus::Done`].
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

type TaskFn = Box<dyn FnOnce(TaskStatus) + Send + 'static>;

/// Single-slot owner of one pending host notification.
///
/// A holder fires its target exactly once: through
/// [`done_waiting`](Self::done_waiting), or on drop as a normal release
/// (the scheduler counts the handle as done). Composing with
/// [`chain`](Self::chain) never discards the held target; it is subsumed
/// into the new chain and still fires.
pub struct WaitingTaskHolder {
    task: Option<TaskFn>,
}

impl WaitingTaskHolder {
    /// Creates a holder around the scheduler callback to fire.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(TaskStatus) + Send + 'static,
    {
        Self {
            task: Some(Box::new(f)),
        }
    }

    /// Fires the held notification with `status`, consuming the holder.
    pub fn done_waiting(mut self, status: TaskStatus) {
        if let Some(task) = self.task.take() {
            task(status);
        }
    }

    /// Composes a new callback in front of the held notification.
    ///
    /// The returned holder, when fired with [`TaskStatus::Done`], hands
    /// this holder to `f`; `f` is then responsible for releasing it (for
    /// scope-managed continuations that happens in the task scope's
    /// drop). The held notification is subsumed, never lost. A
    /// [`TaskStatus::Failed`] bypasses `f` and is forwarded directly.
    #[must_use]
    pub fn chain<F>(self, f: F) -> WaitingTaskHolder
    where
        F: FnOnce(WaitingTaskHolder) + Send + 'static,
    {
        WaitingTaskHolder::new(move |status| match status {
            TaskStatus::Done => f(self),
            failed @ TaskStatus::Failed(_) => self.done_waiting(failed),
        })
    }

    /// True while the notification has not fired yet.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for WaitingTaskHolder {
    fn drop(&mut self) {
        // Dropping an armed holder is a normal release: the handle is
        // done with its part of the work. Failures must be delivered
        // explicitly via done_waiting before the holder goes away.
        if let Some(task) = self.task.take() {
            debug!("waiting task holder released on drop");
            task(TaskStatus::Done);
        }
    }
}

impl std::fmt::Debug for WaitingTaskHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitingTaskHolder")
            .field("armed", &self.is_armed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;

    fn counting_holder(fired: &Arc<AtomicUsize>) -> WaitingTaskHolder {
        let fired = Arc::clone(fired);
        WaitingTaskHolder::new(move |_| {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_done_waiting_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let holder = counting_holder(&fired);
        assert!(holder.is_armed());

        holder.done_waiting(TaskStatus::Done);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases_as_done() {
        let (tx, rx) = mpsc::channel();
        let holder = WaitingTaskHolder::new(move |status| {
            tx.send(status.is_done()).unwrap();
        });
        drop(holder);
        assert!(rx.recv().unwrap());
    }

    fn order_log() -> std::sync::Mutex<Vec<&'static str>> {
        std::sync::Mutex::new(Vec::new())
    }

    #[test]
    fn test_chain_runs_callback_then_inner() {
        let order = Arc::new(order_log());
        let order_cb = Arc::clone(&order);
        let order_inner = Arc::clone(&order);

        let inner = WaitingTaskHolder::new(move |status| {
            assert!(status.is_done());
            order_inner.lock().unwrap().push("inner");
        });

        let chained = inner.chain(move |subsumed| {
            order_cb.lock().unwrap().push("callback");
            subsumed.done_waiting(TaskStatus::Done);
        });

        chained.done_waiting(TaskStatus::Done);
        assert_eq!(*order.lock().unwrap(), vec!["callback", "inner"]);
    }

    #[test]
    fn test_chain_twice_fires_latest_first_and_honors_all() {
        let order = Arc::new(order_log());
        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);
        let o3 = Arc::clone(&order);

        let inner = WaitingTaskHolder::new(move |_| o1.lock().unwrap().push("inner"));
        let once = inner.chain(move |h| {
            o2.lock().unwrap().push("first");
            h.done_waiting(TaskStatus::Done);
        });
        let twice = once.chain(move |h| {
            o3.lock().unwrap().push("second");
            h.done_waiting(TaskStatus::Done);
        });

        // Only the outermost holder is fired; every subsumed target still
        // runs, newest to oldest.
        twice.done_waiting(TaskStatus::Done);
        assert_eq!(*order.lock().unwrap(), vec!["second", "first", "inner"]);
    }

    #[test]
    fn test_chain_failure_bypasses_callback() {
        let (tx, rx) = mpsc::channel();
        let callback_ran = Arc::new(AtomicUsize::new(0));
        let callback_ran_in = Arc::clone(&callback_ran);

        let inner = WaitingTaskHolder::new(move |status| {
            tx.send(status).unwrap();
        });
        let chained = inner.chain(move |h| {
            callback_ran_in.fetch_add(1, Ordering::SeqCst);
            h.done_waiting(TaskStatus::Done);
        });

        chained.done_waiting(TaskStatus::failed(HetstreamError::MissingContextState));

        let status = rx.recv().unwrap();
        assert!(matches!(
            status,
            TaskStatus::Failed(HetstreamError::MissingContextState)
        ));
        assert_eq!(callback_ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_chain_callback_dropping_holder_still_releases() {
        let fired = Arc::new(AtomicUsize::new(0));
        let inner = counting_holder(&fired);

        // A careless callback that forgets to fire the subsumed holder:
        // the drop safety net still releases it.
        let chained = inner.chain(|subsumed| {
            drop(subsumed);
        });
        chained.done_waiting(TaskStatus::Done);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
