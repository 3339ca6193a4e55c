//! Device manager: a serialized event pipeline over the reader monitor
//!
//! The manager owns one PC/SC context for listing and connecting, consumes
//! monitor events through a single serial queue task and tracks a slot per
//! reader. Serialization is the ordering guarantee: a handler that suspends
//! (a connect in flight) blocks every later event, so users never observe a
//! `CardRemoved` overtaking the `CardInserted` it follows.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use pcsc::{Context, Disposition, Protocols, Scope, State};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ConnectConfig;
use crate::error::Error;
use crate::event::{
    DeviceEvent, DeviceEventReceiver, EventDispatcher, EventHandler, MonitorEvent,
    device_event_channel,
};
use crate::monitor::ReaderMonitor;
use crate::session::CardSession;

/// Per-reader connection state.
#[derive(Debug, Default)]
struct ReaderSlot {
    has_card: bool,
    card: Option<CardSession>,
    connect_attempts: u32,
}

struct Shared {
    slots: Mutex<HashMap<String, ReaderSlot>>,
    dispatcher: Mutex<EventDispatcher<DeviceEvent>>,
}

/// User-facing facade over reader monitoring and card connection.
///
/// Register handlers with [`DeviceManager::on_event`] or drain a channel
/// from [`DeviceManager::subscribe`], then [`DeviceManager::start`]. Events
/// arrive strictly in the order the monitor produced them. Within a reader
/// the order is always attach, insert, remove, detach.
///
/// `start` must be called from within a tokio runtime; card connections run
/// on blocking worker tasks.
#[allow(missing_debug_implementations)]
pub struct DeviceManager {
    config: ConnectConfig,
    running: AtomicBool,
    context: Mutex<Option<Context>>,
    monitor: Mutex<Option<ReaderMonitor>>,
    queue_tx: Mutex<Option<UnboundedSender<MonitorEvent>>>,
    queue_task: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl DeviceManager {
    /// Create a manager with the default connection configuration.
    pub fn new() -> Self {
        Self::with_config(ConnectConfig::default())
    }

    /// Create a manager with a custom connection configuration.
    pub fn with_config(config: ConnectConfig) -> Self {
        Self {
            config,
            running: AtomicBool::new(false),
            context: Mutex::new(None),
            monitor: Mutex::new(None),
            queue_tx: Mutex::new(None),
            queue_task: Mutex::new(None),
            shared: Arc::new(Shared {
                slots: Mutex::new(HashMap::new()),
                dispatcher: Mutex::new(EventDispatcher::new()),
            }),
        }
    }

    /// Register a handler for device events.
    pub fn on_event<H>(&self, handler: H)
    where
        H: EventHandler<DeviceEvent> + Send + 'static,
    {
        self.shared.dispatcher.lock().add_handler(handler);
    }

    /// Subscribe to device events through a channel.
    pub fn subscribe(&self) -> DeviceEventReceiver {
        let (tx, rx) = device_event_channel();
        self.on_event(move |event: DeviceEvent| {
            let _ = tx.send(event);
        });
        rx
    }

    /// Start monitoring and connecting. Idempotent.
    ///
    /// Establishes the listing/connecting context and spawns the serial
    /// event queue; context establishment failures are returned
    /// synchronously.
    pub fn start(&self) -> Result<(), Error> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let context = Context::establish(Scope::User).map_err(|err| {
            self.running.store(false, Ordering::SeqCst);
            Error::from(err)
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = Arc::clone(&self.shared);
        let queue_context = context.clone();
        let config = self.config;
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                shared
                    .handle_monitor_event(&queue_context, config, event)
                    .await;
            }
        });

        let mut monitor = ReaderMonitor::new();
        let sink = tx.clone();
        if let Err(err) = monitor.start(move |event| {
            let _ = sink.send(event);
        }) {
            self.running.store(false, Ordering::SeqCst);
            task.abort();
            return Err(err);
        }

        *self.context.lock() = Some(context);
        *self.monitor.lock() = Some(monitor);
        *self.queue_tx.lock() = Some(tx);
        *self.queue_task.lock() = Some(task);
        Ok(())
    }

    /// Stop monitoring, disconnect every owned session and clear state.
    ///
    /// Idempotent; cleanup failures are swallowed. A later
    /// [`DeviceManager::start`] begins again with a fresh monitor.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let monitor = self.monitor.lock().take();
        if let Some(mut monitor) = monitor {
            let _ = tokio::task::spawn_blocking(move || monitor.stop()).await;
        }

        // Closing the channel lets the queue task drain what the monitor
        // already produced, then exit.
        self.queue_tx.lock().take();
        let task = self.queue_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let slots = std::mem::take(&mut *self.shared.slots.lock());
        for (reader, slot) in slots {
            if let Some(card) = slot.card {
                if let Err(err) = card.disconnect(Disposition::LeaveCard) {
                    debug!(reader = %reader, %err, "disconnect during stop failed");
                }
            }
        }
        self.context.lock().take();
    }

    /// Whether the manager is started.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// List currently attached reader names.
    ///
    /// An empty system and a stopped manager both yield an empty list.
    pub fn list_readers(&self) -> Result<Vec<String>, Error> {
        let guard = self.context.lock();
        let Some(context) = guard.as_ref() else {
            return Ok(Vec::new());
        };
        match context.list_readers_owned() {
            Ok(names) => Ok(names
                .iter()
                .map(|name| name.to_string_lossy().into_owned())
                .collect()),
            Err(pcsc::Error::NoReadersAvailable) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// All connected sessions, keyed by reader name.
    pub fn cards(&self) -> HashMap<String, CardSession> {
        self.shared.cards()
    }

    /// The connected session for one reader, if any.
    pub fn card(&self, reader: &str) -> Option<CardSession> {
        self.shared.card(reader)
    }

    /// How many connection attempts the last card in this reader took.
    pub fn connect_attempts(&self, reader: &str) -> Option<u32> {
        self.shared.connect_attempts(reader)
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    async fn handle_monitor_event(
        &self,
        context: &Context,
        config: ConnectConfig,
        event: MonitorEvent,
    ) {
        match event {
            MonitorEvent::ReaderAttached { reader, state, .. } => {
                self.register_reader(&reader);
                if state.contains(State::PRESENT) {
                    self.connect_inserted_card(context, config, reader).await;
                }
            }
            MonitorEvent::CardInserted { reader, .. } => {
                self.connect_inserted_card(context, config, reader).await;
            }
            MonitorEvent::CardRemoved { reader, .. } => self.remove_card(&reader),
            MonitorEvent::ReaderDetached { reader } => self.detach_reader(&reader),
            MonitorEvent::Error { message } => {
                self.emit(DeviceEvent::Error(Error::other(message)));
            }
        }
    }

    fn register_reader(&self, reader: &str) {
        self.slots
            .lock()
            .insert(reader.to_owned(), ReaderSlot::default());
        self.emit(DeviceEvent::ReaderAttached {
            reader: reader.to_owned(),
        });
    }

    async fn connect_inserted_card(
        &self,
        context: &Context,
        config: ConnectConfig,
        reader: String,
    ) {
        self.mark_card_present(&reader);
        let outcome = connect_card(context, config, &reader).await;
        self.apply_connect_outcome(reader, outcome);
    }

    fn mark_card_present(&self, reader: &str) {
        self.slots
            .lock()
            .entry(reader.to_owned())
            .or_default()
            .has_card = true;
    }

    fn apply_connect_outcome(
        &self,
        reader: String,
        outcome: Result<(CardSession, u32), Error>,
    ) {
        match outcome {
            Ok((card, attempts)) => {
                {
                    let mut slots = self.slots.lock();
                    let slot = slots.entry(reader.clone()).or_default();
                    slot.card = Some(card.clone());
                    slot.connect_attempts = attempts;
                }
                self.emit(DeviceEvent::CardInserted { reader, card });
            }
            Err(err) => {
                warn!(reader = %reader, %err, "card connection failed");
                self.emit(DeviceEvent::Error(err));
            }
        }
    }

    fn remove_card(&self, reader: &str) {
        let card = {
            let mut slots = self.slots.lock();
            // A removal for an unknown reader (already detached) emits
            // nothing.
            let Some(slot) = slots.get_mut(reader) else {
                return;
            };
            slot.has_card = false;
            slot.card.take()
        };
        if let Some(card) = &card {
            if let Err(err) = card.disconnect(Disposition::LeaveCard) {
                debug!(reader = %reader, %err, "disconnect after removal failed");
            }
        }
        self.emit(DeviceEvent::CardRemoved {
            reader: reader.to_owned(),
            card,
        });
    }

    fn detach_reader(&self, reader: &str) {
        let has_card = self
            .slots
            .lock()
            .get(reader)
            .is_some_and(|slot| slot.has_card);
        if has_card {
            self.remove_card(reader);
        }
        self.slots.lock().remove(reader);
        self.emit(DeviceEvent::ReaderDetached {
            reader: reader.to_owned(),
        });
    }

    fn emit(&self, event: DeviceEvent) {
        self.dispatcher.lock().dispatch(event);
    }

    fn cards(&self) -> HashMap<String, CardSession> {
        self.slots
            .lock()
            .iter()
            .filter_map(|(name, slot)| {
                slot.card.as_ref().map(|card| (name.clone(), card.clone()))
            })
            .collect()
    }

    fn card(&self, reader: &str) -> Option<CardSession> {
        self.slots
            .lock()
            .get(reader)
            .and_then(|slot| slot.card.clone())
    }

    fn connect_attempts(&self, reader: &str) -> Option<u32> {
        self.slots
            .lock()
            .get(reader)
            .map(|slot| slot.connect_attempts)
    }
}

/// Connect to the card in `reader` on a blocking worker task.
async fn connect_card(
    context: &Context,
    config: ConnectConfig,
    reader: &str,
) -> Result<(CardSession, u32), Error> {
    let context = context.clone();
    let reader_name = reader.to_owned();
    let (card, attempts) = tokio::task::spawn_blocking(move || {
        let cname = CString::new(reader_name.as_str())
            .map_err(|_| Error::other(format!("invalid reader name: {reader_name}")))?;
        connect_with_fallback(config, |protocols| {
            context
                .connect(&cname, config.share_mode, protocols)
                .map_err(Error::from)
        })
    })
    .await
    .map_err(|err| Error::other(format!("connect worker failed: {err}")))??;
    Ok((CardSession::new(card, reader.to_owned()), attempts))
}

/// Attempt a connection, retrying once with T=0 only when dual-protocol
/// negotiation fails against an unresponsive card.
fn connect_with_fallback<T>(
    config: ConnectConfig,
    mut attempt: impl FnMut(Protocols) -> Result<T, Error>,
) -> Result<(T, u32), Error> {
    match attempt(config.protocols) {
        Ok(card) => Ok((card, 1)),
        Err(err) if err.is_unresponsive() && config.protocols.contains(Protocols::T1) => {
            debug!("dual-protocol negotiation failed, retrying with T=0");
            let card = attempt(Protocols::T0)?;
            Ok((card, 2))
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn shared_with_probe() -> (Shared, DeviceEventReceiver) {
        let shared = Shared {
            slots: Mutex::new(HashMap::new()),
            dispatcher: Mutex::new(EventDispatcher::new()),
        };
        let (tx, rx) = device_event_channel();
        shared.dispatcher.lock().add_handler(move |event: DeviceEvent| {
            let _ = tx.send(event);
        });
        (shared, rx)
    }

    #[test]
    fn fallback_retries_once_for_unresponsive_cards() {
        let mut offered = Vec::new();
        let ((), attempts) = connect_with_fallback(ConnectConfig::default(), |protocols| {
            offered.push(protocols);
            if offered.len() == 1 {
                Err(Error::other("The smart card is unresponsive"))
            } else {
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(attempts, 2);
        assert_eq!(offered, vec![Protocols::ANY, Protocols::T0]);
    }

    #[test]
    fn fallback_does_not_mask_other_failures() {
        let mut calls = 0;
        let err = connect_with_fallback(ConnectConfig::default(), |_| {
            calls += 1;
            Err::<(), _>(Error::from_code(0x8010_000B, "sharing violation"))
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert_eq!(err.kind(), ErrorKind::SharingViolation);
    }

    #[test]
    fn no_fallback_when_only_t0_was_offered() {
        let config = ConnectConfig::default().with_protocols(Protocols::T0);
        let mut calls = 0;
        let err = connect_with_fallback(config, |_| {
            calls += 1;
            Err::<(), _>(Error::other("card is unresponsive"))
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(err.is_unresponsive());
    }

    #[test]
    fn insertion_connection_and_removal_flow() {
        let (shared, rx) = shared_with_probe();

        shared.register_reader("Reader A");
        shared.mark_card_present("Reader A");
        shared.apply_connect_outcome(
            "Reader A".to_owned(),
            Ok((CardSession::detached("Reader A", &[0x3B, 0x65]), 2)),
        );

        assert_eq!(shared.connect_attempts("Reader A"), Some(2));
        assert_eq!(shared.cards().len(), 1);
        assert!(shared.card("Reader A").is_some());

        shared.remove_card("Reader A");
        assert!(shared.cards().is_empty());

        let events: Vec<DeviceEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], DeviceEvent::ReaderAttached { reader } if reader == "Reader A"));
        match &events[1] {
            DeviceEvent::CardInserted { reader, card } => {
                assert_eq!(reader, "Reader A");
                assert!(card.is_connected());
            }
            other => panic!("expected CardInserted, got {other:?}"),
        }
        match &events[2] {
            DeviceEvent::CardRemoved { reader, card } => {
                assert_eq!(reader, "Reader A");
                // The removed-card event exposes the pre-clear session in
                // its terminal, disconnected state.
                assert!(!card.as_ref().unwrap().is_connected());
            }
            other => panic!("expected CardRemoved, got {other:?}"),
        }
    }

    #[test]
    fn detach_synthesizes_removal_before_detach() {
        let (shared, rx) = shared_with_probe();

        shared.register_reader("Reader B");
        shared.mark_card_present("Reader B");
        shared.apply_connect_outcome(
            "Reader B".to_owned(),
            Ok((CardSession::detached("Reader B", &[]), 1)),
        );
        shared.detach_reader("Reader B");

        let events: Vec<DeviceEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], DeviceEvent::ReaderAttached { .. }));
        assert!(matches!(&events[1], DeviceEvent::CardInserted { .. }));
        assert!(matches!(&events[2], DeviceEvent::CardRemoved { .. }));
        assert!(matches!(&events[3], DeviceEvent::ReaderDetached { .. }));

        // The slot is gone entirely after the detach.
        assert!(shared.card("Reader B").is_none());
        assert_eq!(shared.connect_attempts("Reader B"), None);
    }

    #[test]
    fn detach_without_card_skips_removal() {
        let (shared, rx) = shared_with_probe();

        shared.register_reader("Reader C");
        shared.detach_reader("Reader C");

        let events: Vec<DeviceEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], DeviceEvent::ReaderAttached { .. }));
        assert!(matches!(&events[1], DeviceEvent::ReaderDetached { .. }));
    }

    #[test]
    fn removal_after_detach_is_silent() {
        let (shared, rx) = shared_with_probe();

        shared.register_reader("Reader E");
        shared.detach_reader("Reader E");
        rx.try_iter().count();

        shared.remove_card("Reader E");
        assert!(rx.try_iter().next().is_none());
    }

    #[test]
    fn failed_connection_emits_error_not_insertion() {
        let (shared, rx) = shared_with_probe();

        shared.register_reader("Reader D");
        shared.mark_card_present("Reader D");
        shared.apply_connect_outcome(
            "Reader D".to_owned(),
            Err(Error::from_code(0x8010_000B, "sharing violation")),
        );

        let events: Vec<DeviceEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], DeviceEvent::ReaderAttached { .. }));
        match &events[1] {
            DeviceEvent::Error(err) => {
                assert_eq!(err.kind(), ErrorKind::SharingViolation);
            }
            other => panic!("expected Error, got {other:?}"),
        }
        assert!(shared.cards().is_empty());

        // A later physical removal still settles the slot.
        shared.remove_card("Reader D");
        let events: Vec<DeviceEvent> = rx.try_iter().collect();
        assert!(matches!(
            &events[0],
            DeviceEvent::CardRemoved { card: None, .. }
        ));
    }
}
