//! Background update loop.
//!
//! A [`Driver`] owns one thread that calls [`Drivable::drive`] every
//! `interval` until the target reports it is finished or the driver is
//! stopped. Dropping the driver stops and joins the thread.

use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Something with a periodic update pass
pub trait Drivable: Send + Sync {
    /// Run one pass; `false` ends the loop
    fn drive(&self) -> bool;
}

#[derive(Debug)]
pub struct Driver {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Driver {
    pub fn spawn(target: Arc<dyn Drivable>, interval: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("peerlink-driver".to_string())
            .spawn(move || {
                debug!(interval_ms = interval.as_millis() as u64, "Driver started");
                while !flag.load(Ordering::Acquire) {
                    if !target.drive() {
                        break;
                    }
                    thread::sleep(interval);
                }
                debug!("Driver finished");
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signal the thread and wait for it
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Driver thread panicked");
            }
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Countdown(AtomicUsize);

    impl Drivable for Countdown {
        fn drive(&self) -> bool {
            self.0.fetch_sub(1, Ordering::SeqCst) > 1
        }
    }

    #[test]
    fn test_driver_ends_when_target_finishes() {
        let target = Arc::new(Countdown(AtomicUsize::new(3)));
        let driver = Driver::spawn(target.clone(), Duration::from_millis(1)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !driver.is_finished() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(driver.is_finished());
        assert_eq!(target.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_joins_running_driver() {
        let target = Arc::new(Countdown(AtomicUsize::new(usize::MAX)));
        let driver = Driver::spawn(target, Duration::from_millis(1)).unwrap();
        driver.stop();
    }
}
