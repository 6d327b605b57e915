//! Waiting for a device to come back after a firmware upload.
//!
//! A freshly uploaded device drops off the bus and renumerates at a new
//! address. The wait is measured from the upload timestamp, not from when
//! the caller starts waiting, so time spent elsewhere counts against it.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, trace};

use crate::error::BringupError;
use crate::events::{BringupEvent, BringupObserver};
use crate::protocol::constants::{MAX_RENUM_DELAY_MS, RENUM_POLL_INTERVAL_MS, RENUM_SETTLE_MS};

/// Timing of the renumeration wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenumerationPolicy {
    /// Initial sleep before the first attempt.
    pub settle: Duration,
    /// Sleep between attempts.
    pub poll_interval: Duration,
    /// Give up once this much time has passed since the upload.
    pub max_delay: Duration,
}

impl RenumerationPolicy {
    pub fn from_millis(settle: u64, poll_interval: u64, max_delay: u64) -> Self {
        Self {
            settle: Duration::from_millis(settle),
            poll_interval: Duration::from_millis(poll_interval),
            max_delay: Duration::from_millis(max_delay),
        }
    }
}

impl Default for RenumerationPolicy {
    fn default() -> Self {
        Self::from_millis(RENUM_SETTLE_MS, RENUM_POLL_INTERVAL_MS, MAX_RENUM_DELAY_MS)
    }
}

/// Every attempt failed before the deadline.
#[derive(Debug)]
pub struct DeadlineExceeded<E> {
    pub elapsed: Duration,
    pub last_error: E,
    pub attempts: usize,
}

/// Call `attempt` until it succeeds or `max_delay` has passed since `start`.
///
/// `attempt` runs at least once. After each failure the loop sleeps
/// `poll_interval`, then gives up if the deadline has passed. `on_retry`
/// sees the elapsed time after every sleep.
pub fn retry_until_deadline<T, E, F, R>(
    start: Instant,
    poll_interval: Duration,
    max_delay: Duration,
    mut attempt: F,
    mut on_retry: R,
) -> Result<T, DeadlineExceeded<E>>
where
    F: FnMut() -> Result<T, E>,
    R: FnMut(Duration),
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        let last_error = match attempt() {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        thread::sleep(poll_interval);
        let elapsed = start.elapsed();
        on_retry(elapsed);
        if elapsed > max_delay {
            return Err(DeadlineExceeded {
                elapsed,
                last_error,
                attempts,
            });
        }
    }
}

/// Run `acquire` until the renumerated device answers.
///
/// Without an upload timestamp there is nothing to wait for: `acquire` runs
/// once and its result is returned as is.
pub fn wait_for_renumeration<T, F, O>(
    fw_updated: Option<Instant>,
    policy: &RenumerationPolicy,
    observer: &O,
    mut acquire: F,
) -> Result<T, BringupError>
where
    F: FnMut() -> Result<T, BringupError>,
    O: BringupObserver + ?Sized,
{
    let Some(uploaded_at) = fw_updated else {
        info!("Firmware upload was not needed");
        return acquire();
    };

    info!("Waiting for device to reset");
    thread::sleep(policy.settle);

    let result = retry_until_deadline(
        uploaded_at,
        policy.poll_interval,
        policy.max_delay,
        &mut acquire,
        |elapsed| {
            let elapsed_ms = elapsed.as_millis() as u64;
            trace!("Waited {}ms", elapsed_ms);
            observer.on_event(&BringupEvent::WaitingForRenumeration { elapsed_ms });
        },
    );

    match result {
        Ok(value) => {
            info!(
                "Device came back after {}ms",
                uploaded_at.elapsed().as_millis()
            );
            Ok(value)
        }
        Err(e) => Err(BringupError::RenumerationTimeout {
            waited_ms: e.elapsed.as_millis() as u64,
            last_error: e.last_error.to_string(),
        }),
    }
}
