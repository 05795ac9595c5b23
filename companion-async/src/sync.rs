//! Blocking bridge for synchronous call sites.
//!
//! These helpers park the calling thread until a future is terminal. They
//! exist only to interoperate with code that cannot be made asynchronous;
//! nothing inside this crate uses them. Never call them from a queue or
//! runtime thread that the future itself needs in order to resolve.

use crate::errors::{FutureError, FutureResult};
use crate::future::Future;
use crate::queue::Queue;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Rendezvous<T> {
    result: Mutex<Option<FutureResult<T>>>,
    ready: Condvar,
}

impl<T> Future<T>
where
    T: Clone + Send + 'static,
{
    /// Blocks until the future is terminal or `timeout` elapses.
    ///
    /// Timing out only abandons the wait: the future keeps running and is
    /// not cancelled. The waiter then receives [`FutureError::TimedOut`].
    pub fn await_timeout(&self, timeout: Duration) -> FutureResult<T> {
        self.block_until(Some(Instant::now() + timeout))
    }

    /// Blocks until the future is terminal.
    pub fn block(&self) -> FutureResult<T> {
        self.block_until(None)
    }

    /// Blocks until terminal and discards the value.
    pub fn succeeds(&self, timeout: Duration) -> FutureResult<()> {
        self.await_timeout(timeout).map(|_| ())
    }

    fn block_until(&self, deadline: Option<Instant>) -> FutureResult<T> {
        if let Some(result) = self.result() {
            return result;
        }

        let rendezvous = Arc::new(Rendezvous {
            result: Mutex::new(None),
            ready: Condvar::new(),
        });
        let notify = rendezvous.clone();
        self.on_completion(&Queue::inline(), move |result| {
            *notify.result.lock() = Some(result);
            notify.ready.notify_all();
        });

        let mut slot = rendezvous.result.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            match deadline {
                Some(deadline) => {
                    if rendezvous.ready.wait_until(&mut slot, deadline).timed_out() {
                        return slot.take().unwrap_or_else(|| {
                            Err(FutureError::timed_out(self.describe()))
                        });
                    }
                }
                None => rendezvous.ready.wait(&mut slot),
            }
        }
    }

    fn describe(&self) -> String {
        self.name().unwrap_or_else(|| "future".to_string())
    }
}
