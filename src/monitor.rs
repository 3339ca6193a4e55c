//! Reader monitoring over PC/SC status changes
//!
//! A dedicated worker thread waits on `SCardGetStatusChange` and translates
//! the raw transitions into [`MonitorEvent`]s. The worker is the sole owner
//! of the tracked reader map; readers are keyed by name, never by position
//! in the watch array, because the reader set can churn between waits.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pcsc::{Context, ReaderState, Scope, State};
use tracing::{debug, trace, warn};

use crate::detect::{CardChange, detect};
use crate::error::Error;
use crate::event::{MonitorEvent, MonitorEventHandler};

/// Iterations between full `UNAWARE` state refreshes.
///
/// Some resource managers (Windows in particular) fail to set `CHANGED` on
/// every real transition, so stored state is periodically compared against a
/// forced fresh snapshot.
const REFRESH_INTERVAL: u32 = 10;

/// Upper bound on a single status-change wait.
const WAIT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Pause after an unexpected wait failure.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Tracked state for one attached reader.
#[derive(Debug, Clone)]
struct ReaderInfo {
    /// Last observed state, with `CHANGED` masked out.
    last_state: State,
    atr: Vec<u8>,
}

/// Background monitor producing reader and card lifecycle events.
///
/// [`ReaderMonitor::start`] establishes a PC/SC context, spawns the worker
/// and synthesizes `ReaderAttached` events for every reader already present,
/// so consumers observe pre-existing readers. [`ReaderMonitor::stop`] cancels
/// the in-flight wait and joins the worker; no handler invocation happens
/// after it returns.
#[allow(missing_debug_implementations)]
pub struct ReaderMonitor {
    running: Arc<AtomicBool>,
    context: Option<Context>,
    worker: Option<JoinHandle<()>>,
}

impl ReaderMonitor {
    /// Create a stopped monitor.
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            context: None,
            worker: None,
        }
    }

    /// Start the worker thread.
    ///
    /// Context establishment failures are returned synchronously; runtime
    /// failures are delivered as [`MonitorEvent::Error`]. Starting a running
    /// monitor is a no-op.
    pub fn start<H>(&mut self, handler: H) -> Result<(), Error>
    where
        H: MonitorEventHandler + Send + 'static,
    {
        if self.worker.is_some() {
            return Ok(());
        }
        let context = Context::establish(Scope::User).map_err(Error::from)?;
        self.running.store(true, Ordering::SeqCst);

        let worker = Worker {
            context: context.clone(),
            handler,
            readers: HashMap::new(),
            running: Arc::clone(&self.running),
        };
        let thread = thread::Builder::new()
            .name("cardwatch-monitor".into())
            .spawn(move || worker.run())
            .map_err(|err| {
                self.running.store(false, Ordering::SeqCst);
                Error::other(format!("failed to spawn monitor thread: {err}"))
            })?;

        self.context = Some(context);
        self.worker = Some(thread);
        Ok(())
    }

    /// Stop the worker and wait for it to drain. Idempotent.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.running.store(false, Ordering::SeqCst);
        if let Some(context) = self.context.take() {
            // Wakes an in-flight get_status_change with Cancelled; a worker
            // between waits notices the flag within one timeout.
            if let Err(err) = context.cancel() {
                debug!(%err, "monitor cancel failed");
            }
        }
        if worker.join().is_err() {
            warn!("monitor worker panicked");
        }
    }

    /// Whether the worker is running.
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl Default for ReaderMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReaderMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker<H> {
    context: Context,
    handler: H,
    readers: HashMap<String, ReaderInfo>,
    running: Arc<AtomicBool>,
}

impl<H: MonitorEventHandler> Worker<H> {
    fn run(mut self) {
        if let Err(err) = self.update_reader_list() {
            self.emit(MonitorEvent::Error {
                message: err.to_string(),
            });
        }

        // Announce readers that were attached before the monitor started.
        let initial: Vec<(String, ReaderInfo)> = self
            .readers
            .iter()
            .map(|(name, info)| (name.clone(), info.clone()))
            .collect();
        for (reader, info) in initial {
            self.emit(MonitorEvent::ReaderAttached {
                reader,
                state: info.last_state,
                atr: info.atr,
            });
        }

        let mut iteration = 0u32;
        while self.running.load(Ordering::SeqCst) {
            iteration = iteration.wrapping_add(1);
            if iteration % REFRESH_INTERVAL == 0 {
                self.reconcile_states();
            }

            let mut watch = self.build_watch_set();
            match self.context.get_status_change(Some(WAIT_TIMEOUT), &mut watch) {
                Err(pcsc::Error::Cancelled) => break,
                Err(pcsc::Error::Timeout) => {
                    // The event state a timeout leaves behind can be stale;
                    // only a forced fresh snapshot is trustworthy here.
                    self.reconcile_states();
                }
                Err(err) => {
                    warn!(%err, "status change wait failed");
                    self.emit(MonitorEvent::Error {
                        message: Error::from(err).to_string(),
                    });
                    thread::sleep(ERROR_BACKOFF);
                }
                Ok(()) => self.process_changes(&watch),
            }
        }

        self.readers.clear();
    }

    /// One watch entry per known reader, from stored state, plus the PnP
    /// sentinel. Rebuilt from the map on every wait.
    fn build_watch_set(&self) -> Vec<ReaderState> {
        let mut watch = Vec::with_capacity(self.readers.len() + 1);
        watch.push(ReaderState::new(pcsc::PNP_NOTIFICATION(), State::UNAWARE));
        for (name, info) in &self.readers {
            let Ok(cname) = CString::new(name.as_str()) else {
                continue;
            };
            watch.push(ReaderState::new(cname, info.last_state));
        }
        watch
    }

    fn process_changes(&mut self, watch: &[ReaderState]) {
        let pnp = &watch[0];
        if pnp.event_state().contains(State::CHANGED) {
            debug!("reader set changed");
            self.process_pnp_change();
            // The positional watch set no longer matches the map; per-reader
            // changes are picked up on the next wait.
            return;
        }

        for entry in &watch[1..] {
            if !entry.event_state().contains(State::CHANGED) {
                continue;
            }
            let name = entry.name().to_string_lossy().into_owned();
            let new_state = entry.event_state() & !State::CHANGED;
            self.apply_state(&name, new_state, entry.atr().to_vec());
        }
    }

    /// Diff the reader list after a PnP notification and emit attach/detach
    /// events for the churn.
    fn process_pnp_change(&mut self) {
        let previous = std::mem::take(&mut self.readers);
        if let Err(err) = self.update_reader_list() {
            self.emit(MonitorEvent::Error {
                message: err.to_string(),
            });
            return;
        }

        let added: Vec<(String, ReaderInfo)> = self
            .readers
            .iter()
            .filter(|(name, _)| !previous.contains_key(*name))
            .map(|(name, info)| (name.clone(), info.clone()))
            .collect();
        let removed: Vec<String> = previous
            .keys()
            .filter(|name| !self.readers.contains_key(*name))
            .cloned()
            .collect();

        for (reader, info) in added {
            debug!(reader = %reader, atr = %hex::encode(&info.atr), "reader attached");
            self.emit(MonitorEvent::ReaderAttached {
                reader,
                state: info.last_state,
                atr: info.atr,
            });
        }
        for reader in removed {
            debug!(reader = %reader, "reader detached");
            self.emit(MonitorEvent::ReaderDetached { reader });
        }
    }

    /// Rebuild the reader map from a fresh listing, seeding each entry with
    /// an initial state snapshot.
    fn update_reader_list(&mut self) -> Result<(), Error> {
        let names = match self.context.list_readers_owned() {
            Ok(names) => names,
            Err(pcsc::Error::NoReadersAvailable) => {
                self.readers.clear();
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let mut states: Vec<ReaderState> = names
            .into_iter()
            .map(|name| ReaderState::new(name, State::UNAWARE))
            .collect();
        if let Err(err) = self
            .context
            .get_status_change(Some(Duration::ZERO), &mut states)
        {
            debug!(%err, "initial state snapshot failed");
        }

        self.readers = states
            .iter()
            .map(|state| {
                (
                    state.name().to_string_lossy().into_owned(),
                    ReaderInfo {
                        last_state: state.event_state() & !State::CHANGED,
                        atr: state.atr().to_vec(),
                    },
                )
            })
            .collect();
        Ok(())
    }

    /// Re-query every known reader with a forced `UNAWARE` snapshot and emit
    /// the transitions the platform failed to flag.
    fn reconcile_states(&mut self) {
        let names: Vec<String> = self.readers.keys().cloned().collect();
        for name in names {
            let Ok(cname) = CString::new(name.as_str()) else {
                continue;
            };
            let mut probe = [ReaderState::new(cname, State::UNAWARE)];
            if self
                .context
                .get_status_change(Some(Duration::ZERO), &mut probe)
                .is_err()
            {
                continue;
            }
            let fresh = probe[0].event_state() & !State::CHANGED;
            self.apply_state(&name, fresh, probe[0].atr().to_vec());
        }
    }

    /// Run the presence detector against stored state, update the entry and
    /// emit the transition, if any. Lookup is by name only.
    fn apply_state(&mut self, name: &str, new_state: State, atr: Vec<u8>) {
        let change = {
            let Some(info) = self.readers.get_mut(name) else {
                trace!(reader = name, "state change for untracked reader");
                return;
            };
            let change = detect(info.last_state, new_state);
            info.last_state = new_state;
            info.atr = atr.clone();
            change
        };

        match change {
            CardChange::Inserted => {
                debug!(reader = name, atr = %hex::encode(&atr), "card inserted");
                self.emit(MonitorEvent::CardInserted {
                    reader: name.to_owned(),
                    state: new_state,
                    atr,
                });
            }
            CardChange::Removed => {
                debug!(reader = name, "card removed");
                self.emit(MonitorEvent::CardRemoved {
                    reader: name.to_owned(),
                    state: new_state,
                });
            }
            CardChange::None => {}
        }
    }

    fn emit(&mut self, event: MonitorEvent) {
        trace!(?event, "monitor event");
        self.handler.handle_event(event);
    }
}
