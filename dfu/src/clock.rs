use std::time::Duration;

/// Time source used while waiting on the device
pub trait Clock: Send {
    fn sleep(&self, duration: Duration);
}

/// Blocks the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

#[cfg(test)]
pub(crate) use mock::MockClock;

#[cfg(test)]
mod mock {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records requested sleeps without sleeping.
    #[derive(Debug, Default, Clone)]
    pub(crate) struct MockClock {
        sleeps: Arc<Mutex<Vec<Duration>>>,
    }

    impl MockClock {
        pub(crate) fn sleeps(&self) -> Vec<Duration> {
            self.sleeps.lock().unwrap().clone()
        }

        pub(crate) fn total(&self) -> Duration {
            self.sleeps().iter().sum()
        }
    }

    impl Clock for MockClock {
        fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
        }
    }
}
