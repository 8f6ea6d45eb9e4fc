use std::sync::{Arc, Mutex};
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::time;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};


type ExpiryCallback = Box<dyn FnOnce() + Send>;

struct WatchdogEntry {
    touched: Instant,
    expires_after: Duration,
    on_expired: Option<ExpiryCallback>,
}

#[derive(Default)]
struct TickerState {
    watchdogs: FxHashMap<u64, WatchdogEntry>,
    next_id: u64,
    running: bool,
}

/// Drives all [Watchdog]s created from it with a single periodic check. The ticking task is
///  started when the first watchdog is armed, and it stops when no watchdog is left.
///
/// Expiry is detected with the granularity of the check interval, so a watchdog fires no earlier
///  than its timeout, and at most one check interval later.
#[derive(Clone)]
pub struct WatchdogTicker {
    check_interval: Duration,
    state: Arc<Mutex<TickerState>>,
}

impl WatchdogTicker {
    pub fn new(check_interval: Duration) -> WatchdogTicker {
        WatchdogTicker {
            check_interval,
            state: Default::default(),
        }
    }

    /// Arms a new watchdog. `on_expired` is called at most once, from the ticker's task.
    pub fn arm(&self, expires_after: Duration, on_expired: impl FnOnce() + Send + 'static) -> Watchdog {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.watchdogs.insert(id, WatchdogEntry {
            touched: Instant::now(),
            expires_after,
            on_expired: Some(Box::new(on_expired)),
        });

        if !state.running {
            state.running = true;
            debug!("starting watchdog ticker");
            tokio::spawn(Self::run_ticks(self.check_interval, self.state.clone()));
        }

        Watchdog {
            id,
            state: self.state.clone(),
        }
    }

    pub fn num_armed(&self) -> usize {
        self.state.lock().unwrap().watchdogs.len()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    async fn run_ticks(check_interval: Duration, state: Arc<Mutex<TickerState>>) {
        let mut ticks = time::interval_at(Instant::now() + check_interval, check_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticks.tick().await;

            let (callbacks, still_running) = {
                let mut state = state.lock().unwrap();
                let expired_ids = state.watchdogs.iter()
                    .filter(|(_, w)| w.touched.elapsed() >= w.expires_after)
                    .map(|(&id, _)| id)
                    .collect::<Vec<_>>();

                let expired = expired_ids.into_iter()
                    .flat_map(|id| state.watchdogs.remove(&id))
                    .flat_map(|w| w.on_expired)
                    .collect::<Vec<_>>();

                if state.watchdogs.is_empty() {
                    state.running = false;
                }
                (expired, state.running)
            };

            trace!("watchdog tick: {} expired", callbacks.len());
            for callback in callbacks {
                callback();
            }

            if !still_running {
                debug!("no armed watchdogs left - stopping ticker");
                return;
            }
        }
    }
}


/// Handle to an armed watchdog. Dropping the handle disarms it.
pub struct Watchdog {
    id: u64,
    state: Arc<Mutex<TickerState>>,
}

impl Watchdog {
    /// resets the elapsed time
    pub fn touch(&self) {
        if let Some(w) = self.state.lock().unwrap().watchdogs.get_mut(&self.id) {
            w.touched = Instant::now();
        }
    }

    /// Changes the timeout without resetting the elapsed time.
    pub fn rearm(&self, expires_after: Duration) {
        if let Some(w) = self.state.lock().unwrap().watchdogs.get_mut(&self.id) {
            w.expires_after = expires_after;
        }
    }

    pub fn stop(self) {}

    pub fn is_armed(&self) -> bool {
        self.state.lock().unwrap().watchdogs.contains_key(&self.id)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.watchdogs.remove(&self.id);
        }
    }
}
