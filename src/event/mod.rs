//! Event types and handling

pub mod channel;
pub use channel::*;

use pcsc::State;

use crate::error::Error;
use crate::session::CardSession;

/// Raw reader/card transitions produced by [`crate::ReaderMonitor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// A reader appeared (or was already attached when the monitor started).
    ReaderAttached {
        /// Reader name.
        reader: String,
        /// Reader state at the time of the event.
        state: State,
        /// ATR of the card in the reader, empty when none.
        atr: Vec<u8>,
    },
    /// A reader disappeared.
    ReaderDetached {
        /// Reader name.
        reader: String,
    },
    /// A card was inserted into a reader.
    CardInserted {
        /// Reader name.
        reader: String,
        /// Reader state at the time of the event.
        state: State,
        /// ATR of the inserted card.
        atr: Vec<u8>,
    },
    /// A card was removed from a reader.
    CardRemoved {
        /// Reader name.
        reader: String,
        /// Reader state at the time of the event.
        state: State,
    },
    /// The worker hit a non-fatal failure.
    Error {
        /// Failure description.
        message: String,
    },
}

/// High-level events emitted by [`crate::DeviceManager`].
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A reader is available.
    ReaderAttached {
        /// Reader name.
        reader: String,
    },
    /// A reader went away.
    ReaderDetached {
        /// Reader name.
        reader: String,
    },
    /// A card was inserted and connected.
    CardInserted {
        /// Reader name.
        reader: String,
        /// The connected session.
        card: CardSession,
    },
    /// A card was removed.
    CardRemoved {
        /// Reader name.
        reader: String,
        /// The session that was connected to the card, now in its terminal
        /// disconnected state; `None` when no connection had been made.
        card: Option<CardSession>,
    },
    /// A non-fatal runtime failure.
    Error(Error),
}

/// Trait for handling monitor events.
pub trait MonitorEventHandler {
    /// Handle one event.
    fn handle_event(&mut self, event: MonitorEvent);
}

impl<F> MonitorEventHandler for F
where
    F: FnMut(MonitorEvent),
{
    fn handle_event(&mut self, event: MonitorEvent) {
        self(event)
    }
}

/// A trait for types that can be used as event handlers.
pub trait EventHandler<T> {
    /// Handle an event.
    fn handle(&mut self, event: T);
}

impl<T, F> EventHandler<T> for F
where
    F: FnMut(T),
{
    fn handle(&mut self, event: T) {
        self(event)
    }
}

/// Event dispatcher fanning each event out to the registered handlers.
#[allow(missing_debug_implementations)]
pub struct EventDispatcher<T> {
    handlers: Vec<Box<dyn EventHandler<T> + Send>>,
}

impl<T> EventDispatcher<T> {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a new handler.
    pub fn add_handler<H>(&mut self, handler: H)
    where
        H: EventHandler<T> + Send + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    /// Dispatch an event to all handlers, in registration order.
    pub fn dispatch(&mut self, event: T)
    where
        T: Clone,
    {
        for handler in &mut self.handlers {
            handler.handle(event.clone());
        }
    }

    /// Clear all handlers.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}

impl<T> Default for EventDispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}
