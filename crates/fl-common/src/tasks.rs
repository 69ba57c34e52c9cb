//! Cancelable scheduled tasks, registry-of-handles style.
//!
//! Each engine owns one `TaskRegistry` for all of its timer-driven work
//! (ticker loops, delayed callbacks). `shutdown()` cancels everything the
//! registry owns; tasks requested after shutdown never run, so a stopped
//! engine cannot be resurrected by a stale caller.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::error;

pub struct TaskRegistry {
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Run `tick` every `period` until shutdown. The first tick fires after
    /// one full period. A tick that fails is logged and does not stop the
    /// loop.
    pub fn every<F, Fut>(&self, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = tick().await {
                            error!(error = %e, "Scheduled tick failed");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        self.register(handle);
    }

    /// Run `task` once after `delay`, unless shutdown happens first.
    pub fn after<F, Fut>(&self, delay: Duration, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = task().await {
                        error!(error = %e, "Delayed task failed");
                    }
                }
                _ = shutdown_rx.recv() => {}
            }
        });
        self.register(handle);
    }

    /// Subscribe to the registry's shutdown signal. For loops that need more
    /// structure than `every` gives (dynamic periods, multi-stage ticks),
    /// spawn manually, select against this receiver, and `register` the
    /// handle.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Track a manually spawned task so shutdown cancels it.
    pub fn register(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Cancel every pending task. Idempotent; in-flight timers are not
    /// waited for.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            handle.abort();
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test]
    async fn every_ticks_until_shutdown() {
        let registry = TaskRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        registry.every(Duration::from_millis(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(55)).await;
        registry.shutdown();
        let ticked = count.load(Ordering::SeqCst);
        assert!(ticked >= 3, "expected at least 3 ticks, got {}", ticked);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), ticked, "ticks after shutdown");
    }

    #[tokio::test]
    async fn after_is_canceled_by_shutdown() {
        let registry = TaskRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        registry.after(Duration::from_millis(50), move || {
            let f = f.clone();
            async move {
                f.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        registry.shutdown();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tasks_after_shutdown_never_run() {
        let registry = TaskRegistry::new();
        registry.shutdown();
        registry.shutdown(); // idempotent

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        registry.after(Duration::from_millis(5), move || {
            let f = f.clone();
            async move {
                f.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_tick_does_not_stop_loop() {
        let registry = TaskRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        registry.every(Duration::from_millis(10), move || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    anyhow::bail!("first tick fails");
                }
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(45)).await;
        registry.shutdown();
        assert!(count.load(Ordering::SeqCst) >= 2);
    }
}
