use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

/// Runs a function on request, no more often than `min_interval` (with a
/// small burst allowance) and at least every `max_interval`.
///
/// Requests made while a run is pending are folded into it.
pub struct BoundedFrequencyRunner {
    name: String,
    min_interval: Duration,
    max_interval: Duration,
    burst: u32,
    run_tx: mpsc::Sender<()>,
    run_rx: Mutex<mpsc::Receiver<()>>,
}

impl BoundedFrequencyRunner {
    pub fn new(name: &str, min_interval: Duration, max_interval: Duration, burst: u32) -> Self {
        let (run_tx, run_rx) = mpsc::channel(1);
        Self {
            name: name.to_string(),
            min_interval,
            max_interval,
            burst: burst.max(1),
            run_tx,
            run_rx: Mutex::new(run_rx),
        }
    }

    /// Request a run. Never blocks.
    pub fn run(&self) {
        match self.run_tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Closed(())) => debug!("{} runner is gone, dropping run request", self.name),
        }
    }

    /// Drive `f` until `stop` turns true or its sender is dropped.
    pub async fn run_loop<F, Fut>(&self, mut stop: watch::Receiver<bool>, mut f: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut run_rx = self.run_rx.lock().await;
        let mut bucket = TokenBucket::new(self.burst, self.min_interval, Instant::now());
        let mut periodic =
            tokio::time::interval_at(Instant::now() + self.max_interval, self.max_interval);
        periodic.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "{} runner started (min={:?}, max={:?}, burst={})",
            self.name, self.min_interval, self.max_interval, self.burst
        );

        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                res = stop.changed() => {
                    if res.is_err() {
                        break;
                    }
                    continue;
                }
                _ = periodic.tick() => {
                    debug!("{} runner: periodic run", self.name);
                    bucket.take(Instant::now());
                }
                Some(()) = run_rx.recv() => {
                    if let Some(wait) = bucket.take(Instant::now()) {
                        debug!("{} runner: rate limited, waiting {:?}", self.name, wait);
                        tokio::select! {
                            res = stop.changed() => {
                                if res.is_err() || *stop.borrow() {
                                    break;
                                }
                            }
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                    while run_rx.try_recv().is_ok() {}
                }
            }
            f().await;
            periodic.reset();
        }
        info!("{} runner stopped", self.name);
    }
}

/// Token bucket refilled at one token per `refill`. Tokens may go negative:
/// a caller that has to wait has already reserved its token.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill: Duration,
    last: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill: Duration, now: Instant) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill,
            last: now,
        }
    }

    /// Take one token. Returns how long to wait before it is valid.
    fn take(&mut self, now: Instant) -> Option<Duration> {
        if self.refill.is_zero() {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.last);
        self.last = now;
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() / self.refill.as_secs_f64()).min(self.capacity);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            None
        } else {
            Some(self.refill.mul_f64(-self.tokens))
        }
    }
}
