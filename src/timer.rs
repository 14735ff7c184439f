use std::future::Future;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// A spawned timer task owned by the client.
///
/// Dropping the handle aborts the task, so a timer can never outlive the
/// state slot that holds it.
#[derive(Debug)]
pub(crate) struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn spawn<F>(runtime: &Handle, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: runtime.spawn(task),
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
