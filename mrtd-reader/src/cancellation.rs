//! Cooperative cancellation of a running session.


use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};


/// A cancellation flag shared between the caller and the session worker.
///
/// The worker observes the flag between card exchanges and while sleeping before a retry.
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    inner: Arc<(Mutex<bool>, Condvar)>,
}
impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation and wakes up any waiter.
    pub fn cancel(&self) {
        let (lock, condvar) = &*self.inner;
        let mut cancelled = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *cancelled = true;
        condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        match lock.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Sleeps for up to `duration`, returning early if cancellation is requested.
    ///
    /// Returns whether cancellation has been requested.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let (lock, condvar) = &*self.inner;
        let deadline = Instant::now() + duration;
        let mut cancelled = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            cancelled = match condvar.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *cancelled
    }
}


#[cfg(test)]
mod tests {
    use super::Cancellation;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn wait_returns_early_on_cancel() {
        let cancellation = Cancellation::new();
        let remote = cancellation.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        let start = Instant::now();
        assert!(cancellation.wait_timeout(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(30));
        canceller.join().unwrap();
    }

    #[test]
    fn wait_times_out_without_cancel() {
        let cancellation = Cancellation::new();
        assert!(!cancellation.wait_timeout(Duration::from_millis(5)));
        assert!(!cancellation.is_cancelled());
    }
}
