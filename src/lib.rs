//! PC/SC reader monitoring and card sessions
//!
//! This crate watches the OS PC/SC resource manager for reader and card
//! lifecycle transitions, connects to inserted cards with a T=0 fallback
//! for mute dual-protocol negotiation, and exposes card I/O sessions that
//! transparently follow the ISO/IEC 7816 T=0 chaining idioms (`61 XX`
//! GET RESPONSE continuation and `6C XX` Le correction).
//!
//! The central type is [`DeviceManager`]: it runs a [`ReaderMonitor`] worker
//! thread, serializes its events through a single queue and hands out
//! [`CardSession`]s for inserted cards. Events arrive strictly in order;
//! within one reader the sequence is always attach, insert, remove, detach.
//!
//! # Examples
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use cardwatch::{DeviceEvent, DeviceManager, TransmitOptions, transmit_with_auto_response};
//!
//! let manager = DeviceManager::new();
//! let events = manager.subscribe();
//! manager.start()?;
//!
//! loop {
//!     match events.recv()? {
//!         DeviceEvent::CardInserted { reader, card } => {
//!             println!("card in {reader}, ATR {}", hex::encode(card.atr()));
//!             let select = [0x00, 0xA4, 0x04, 0x00, 0x0E];
//!             let opts = TransmitOptions::default();
//!             let response = transmit_with_auto_response(&card, &select, &opts).await?;
//!             println!("response: {}", hex::encode(&response));
//!         }
//!         DeviceEvent::CardRemoved { reader, .. } => println!("card left {reader}"),
//!         DeviceEvent::Error(err) => eprintln!("{err}"),
//!         _ => {}
//!     }
//! }
//! # }
//! ```
#![warn(missing_docs)]

pub mod ccid;
mod config;
mod detect;
mod error;
pub mod event;
mod manager;
mod monitor;
mod session;
mod t0;
mod util;

pub use ccid::{CM_IOCTL_GET_FEATURE_REQUEST, ctl_code, parse_features};
pub use config::ConnectConfig;
pub use detect::{CardChange, detect};
pub use error::{
    CODE_CANCELLED, CODE_CARD_REMOVED, CODE_NO_READERS, CODE_NO_SERVICE,
    CODE_SCARD_CANCELLED, CODE_SHARING_VIOLATION, CODE_TIMEOUT, CODE_UNRESPONSIVE,
    CODE_UNRESPONSIVE_CARD, Error, ErrorKind, classify,
};
pub use event::{DeviceEvent, MonitorEvent};
pub use manager::DeviceManager;
pub use monitor::ReaderMonitor;
pub use session::{
    CardSession, DEFAULT_RECV_LENGTH, MAX_APDU_LENGTH, MAX_RECV_LENGTH, SessionStatus,
};
pub use t0::{ApduTransmit, TransmitOptions, correct_le, transmit_with_auto_response};
pub use util::{decode_multi_string, encode_multi_string};

// Re-export the pcsc wire types for convenience.
pub use pcsc::{
    Disposition, MAX_ATR_SIZE, MAX_BUFFER_SIZE, Protocol, Protocols, Scope, ShareMode,
    State, Status,
};
