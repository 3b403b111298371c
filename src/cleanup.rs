//! Cleanup registry for provisioned cluster resources.
//!
//! Any step that creates an external resource (a PVC, a helper pod) pushes a
//! teardown action here right after creation succeeds, and pops it once the
//! resource's fate is decided. On SIGINT/SIGTERM the remaining actions run in
//! reverse registration order, so a pod mounting a volume is always deleted
//! before the volume itself.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type TeardownFut = Pin<Box<dyn Future<Output = ()> + Send>>;
type TeardownFn = Box<dyn FnOnce() -> TeardownFut + Send>;

pub struct CleanupRegistry {
    stack: Mutex<Vec<TeardownFn>>,
    interrupted: AtomicBool,
    done_tx: watch::Sender<bool>,
}

impl Default for CleanupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CleanupRegistry {
    pub fn new() -> Self {
        let (done_tx, _) = watch::channel(false);
        CleanupRegistry {
            stack: Mutex::new(Vec::new()),
            interrupted: AtomicBool::new(false),
            done_tx,
        }
    }

    /// Appends a teardown action. Actions run in reverse order (LIFO).
    pub fn register<F, Fut>(&self, teardown: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut stack = self.stack.lock().unwrap();
        stack.push(Box::new(move || Box::pin(teardown()) as TeardownFut));
    }

    /// Removes the most recently added teardown action. Call this exactly once
    /// after the registered resource has been kept or disposed of through the
    /// normal path, so it is not torn down a second time.
    pub fn unregister(&self) {
        let mut stack = self.stack.lock().unwrap();
        stack.pop();
    }

    /// Takes ownership of the current stack and runs every action,
    /// last-registered first.
    pub async fn run_all(&self) {
        let actions = {
            let mut stack = self.stack.lock().unwrap();
            std::mem::take(&mut *stack)
        };
        debug!(count = actions.len(), "running cleanup actions");
        for teardown in actions.into_iter().rev() {
            teardown().await;
        }
    }

    /// True once the interrupt handler has started tearing down resources.
    /// In-flight operations check this to skip their own failure-path cleanup.
    pub fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Blocks until the interrupt-driven teardown has finished. Returns
    /// immediately if no interrupt was delivered.
    pub async fn wait_for_cleanup(&self) {
        if !self.was_interrupted() {
            return;
        }
        let mut done = self.done_tx.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }

    fn begin_interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn finish_interrupt(&self) {
        let _ = self.done_tx.send(true);
    }
}

/// Spawns the task that listens for SIGINT/SIGTERM. The first signal cancels
/// the operation token, runs every registered teardown, then exits the
/// process with code 1. Further signals are not listened for, so they cannot
/// start a second teardown.
pub fn install_interrupt_handler(registry: Arc<CleanupRegistry>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                eprintln!("failed to install SIGTERM handler: {err}");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }

        eprintln!("\nInterrupted, cleaning up...");
        registry.begin_interrupt();
        cancel.cancel();
        registry.run_all().await;
        registry.finish_interrupt();
        std::process::exit(1);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn recorder(order: &Arc<Mutex<Vec<u32>>>, id: u32) -> impl FnOnce() -> TeardownFut {
        let order = order.clone();
        move || {
            Box::pin(async move {
                order.lock().unwrap().push(id);
            })
        }
    }

    #[tokio::test]
    async fn run_all_is_lifo() {
        let registry = CleanupRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        registry.register(recorder(&order, 1));
        registry.register(recorder(&order, 2));
        registry.register(recorder(&order, 3));

        registry.run_all().await;
        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn run_all_clears_the_stack() {
        let registry = CleanupRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        registry.register(recorder(&order, 1));

        registry.run_all().await;
        registry.run_all().await;
        assert_eq!(*order.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn unregister_removes_newest_entry() {
        let registry = CleanupRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        registry.register(recorder(&order, 1));
        registry.register(recorder(&order, 2));
        registry.unregister();

        registry.run_all().await;
        assert_eq!(*order.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn unregister_on_empty_stack_is_a_noop() {
        let registry = CleanupRegistry::new();
        registry.unregister();
        registry.run_all().await;
    }

    #[tokio::test]
    async fn wait_for_cleanup_returns_immediately_without_interrupt() {
        let registry = CleanupRegistry::new();
        assert!(!registry.was_interrupted());
        registry.wait_for_cleanup().await;
    }

    #[tokio::test]
    async fn wait_for_cleanup_blocks_until_interrupt_teardown_finishes() {
        let registry = Arc::new(CleanupRegistry::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        registry.register(recorder(&order, 1));

        registry.begin_interrupt();
        assert!(registry.was_interrupted());

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry.wait_for_cleanup().await;
            })
        };
        // The waiter must still be blocked while teardown has not run.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        registry.run_all().await;
        registry.finish_interrupt();
        waiter.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1]);
    }
}
