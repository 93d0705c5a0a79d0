use std::sync::Mutex as StdMutex;
use tokio::task::JoinHandle;

/// Tracks long-lived tokio tasks so shutdown can wait for all of them, or
/// abort what is left after a second interrupt.
pub struct TaskManager {
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: StdMutex::new(Vec::new()),
        }
    }

    #[track_caller]
    pub fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        use tracing::Instrument;
        let caller = std::panic::Location::caller();
        let span = tracing::trace_span!("task", file = caller.file(), line = caller.line());

        let mut tasks = self.tasks.lock().unwrap();
        // sessions come and go; don't let finished handles pile up
        tasks.retain(|handle| !handle.is_finished());
        tasks.push(tokio::spawn(fut.instrument(span)));
    }

    /// Waits for every tracked task to finish.
    pub async fn join_all(&self) {
        loop {
            let handles: Vec<_> = {
                let mut tasks = self.tasks.lock().unwrap();
                std::mem::take(&mut *tasks)
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                let _ = handle.await;
            }
            // tasks spawned while we were joining get a second pass
        }
    }

    /// Cancels every tracked task without waiting for completion.
    pub fn abort_all(&self) {
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}
