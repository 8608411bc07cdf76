//! Trailing-edge debouncer.
//!
//! Triggers are collapsed inside a sliding window; once the window passes
//! with no new trigger the action runs once with the most recent value.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::trace;

pub struct Debouncer<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for Debouncer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> Debouncer<T> {
    /// Spawn the debounce task.  The task ends when every handle is dropped.
    pub fn spawn<F, Fut>(window: Duration, mut action: F) -> Self
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                let mut latest = first;
                let mut collapsed = 1u32;
                loop {
                    tokio::select! {
                        next = rx.recv() => match next {
                            Some(v) => {
                                latest = v;
                                collapsed += 1;
                            }
                            None => break,
                        },
                        _ = tokio::time::sleep(window) => break,
                    }
                }
                trace!("debounce: {} trigger(s) collapsed", collapsed);
                action(latest).await;
            }
        });
        Self { tx }
    }

    pub fn trigger(&self, value: T) {
        // The task only stops once all senders are gone.
        let _ = self.tx.send(value);
    }
}
