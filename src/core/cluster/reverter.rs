// src/core/cluster/reverter.rs

//! Explicit LIFO compensating-action list, replacing the inline defer-on-failure idiom
//! (§9). Armed on each mutation, disarmed on success, safe to call twice.

type Compensation = Box<dyn FnOnce() -> futures::future::BoxFuture<'static, ()> + Send>;

/// Accumulates compensating closures and runs them in reverse order on `revert()`.
/// Calling `revert()` more than once is a no-op after the first call drains the list.
#[derive(Default)]
pub struct Reverter {
    actions: Vec<Compensation>,
}

impl Reverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a compensating action. Pushed actions run most-recent-first.
    pub fn arm<F, Fut>(&mut self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.actions.push(Box::new(move || Box::pin(action())));
    }

    /// Disarms every compensating action without running them (the scope succeeded).
    pub fn disarm(&mut self) {
        self.actions.clear();
    }

    /// Runs every armed compensation, most recently armed first, then clears the list.
    /// Idempotent: a second call with nothing armed does nothing.
    pub async fn revert(&mut self) {
        while let Some(action) = self.actions.pop() {
            action().await;
        }
    }

    pub fn is_armed(&self) -> bool {
        !self.actions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn revert_runs_in_lifo_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut reverter = Reverter::new();

        let o1 = order.clone();
        reverter.arm(move || {
            async move {
                o1.lock().push(1);
            }
        });
        let o2 = order.clone();
        reverter.arm(move || {
            async move {
                o2.lock().push(2);
            }
        });

        reverter.revert().await;
        assert_eq!(*order.lock(), vec![2, 1]);
    }

    #[tokio::test]
    async fn disarm_prevents_revert() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut reverter = Reverter::new();
        let r = ran.clone();
        reverter.arm(move || {
            async move {
                r.fetch_add(1, Ordering::SeqCst);
            }
        });
        reverter.disarm();
        reverter.revert().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn revert_is_idempotent() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut reverter = Reverter::new();
        let r = ran.clone();
        reverter.arm(move || {
            async move {
                r.fetch_add(1, Ordering::SeqCst);
            }
        });
        reverter.revert().await;
        reverter.revert().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
