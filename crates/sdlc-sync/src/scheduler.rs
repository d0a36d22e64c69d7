use std::future::Future;
use tokio::task::JoinHandle;
use tracing::debug;

/// Owner of one background task. Replacing, stopping or dropping the owner
/// aborts the task, so timers never outlive the component that started them.
#[derive(Debug)]
pub struct Poller {
    name: &'static str,
    task: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn new(name: &'static str) -> Self {
        Self { name, task: None }
    }

    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.stop();
        debug!("poller_start: {}", self.name);
        self.task = Some(tokio::spawn(task));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            debug!("poller_stop: {}", self.name);
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn ticking(counter: Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_and_drop_cancel_the_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut poller = Poller::new("test");
        poller.spawn(ticking(counter.clone()));
        assert!(poller.is_running());

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        poller.stop();
        assert!(!poller.is_running());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        poller.spawn(ticking(counter.clone()));
        tokio::time::sleep(Duration::from_millis(500)).await;
        drop(poller);
        let after_drop = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_drop);
    }
}
