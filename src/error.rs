//! Error classification for PC/SC operations
//!
//! Every failure surfaced by this crate carries a [`ErrorKind`] from a closed
//! taxonomy together with the OS-provided message and numeric status code.

use thiserror::Error as ThisError;

/// `SCARD_W_REMOVED_CARD`: the card was withdrawn mid-operation.
pub const CODE_CARD_REMOVED: u32 = 0x8010_0069;
/// `SCARD_E_TIMEOUT`: the operation's time bound elapsed.
pub const CODE_TIMEOUT: u32 = 0x8010_000A;
/// `SCARD_E_NO_READERS_AVAILABLE`: no readers attached to the system.
pub const CODE_NO_READERS: u32 = 0x8010_002E;
/// `SCARD_E_NO_SERVICE`: the PC/SC resource manager is not running.
pub const CODE_NO_SERVICE: u32 = 0x8010_001D;
/// `SCARD_E_SHARING_VIOLATION`: another process holds an exclusive lock.
pub const CODE_SHARING_VIOLATION: u32 = 0x8010_000B;
/// Negotiation-failure code reported by some resource managers when a card
/// rejects the offered protocol set.
pub const CODE_UNRESPONSIVE: u32 = 0x8010_0010;
/// `SCARD_W_UNRESPONSIVE_CARD`: the card is mute.
pub const CODE_UNRESPONSIVE_CARD: u32 = 0x8010_0066;
/// `ERROR_CANCELLED`: a blocking wait was cancelled.
pub const CODE_CANCELLED: u32 = 0x0000_0002;
/// `SCARD_E_CANCELLED`: the wait was woken by `SCardCancel`.
pub const CODE_SCARD_CANCELLED: u32 = 0x8010_0002;

/// Closed taxonomy of failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Card withdrawn while an operation was in flight.
    CardRemoved,
    /// An operation's time bound elapsed.
    Timeout,
    /// No readers are attached; listing treats this as non-fatal.
    NoReaders,
    /// The PC/SC daemon or service is absent.
    ServiceNotRunning,
    /// The card is locked exclusively by another connection.
    SharingViolation,
    /// Protocol negotiation failed against a mute card.
    Unresponsive,
    /// A blocking wait observed `cancel()`.
    Cancelled,
    /// The session was already disconnected.
    SessionClosed,
    /// Any status code outside the taxonomy; the raw code is preserved.
    Unknown,
}

/// Map a raw PC/SC status code onto the closed taxonomy.
pub const fn classify(code: u32) -> ErrorKind {
    match code {
        CODE_CARD_REMOVED => ErrorKind::CardRemoved,
        CODE_TIMEOUT => ErrorKind::Timeout,
        CODE_NO_READERS => ErrorKind::NoReaders,
        CODE_NO_SERVICE => ErrorKind::ServiceNotRunning,
        CODE_SHARING_VIOLATION => ErrorKind::SharingViolation,
        CODE_UNRESPONSIVE | CODE_UNRESPONSIVE_CARD => ErrorKind::Unresponsive,
        CODE_CANCELLED | CODE_SCARD_CANCELLED => ErrorKind::Cancelled,
        _ => ErrorKind::Unknown,
    }
}

/// A classified PC/SC failure.
///
/// The OS message and numeric code are kept verbatim so callers can log or
/// re-match on them.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("{message} (code 0x{code:08X})")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    code: u32,
}

impl Error {
    /// Create an error from its parts.
    pub fn new(kind: ErrorKind, message: impl Into<String>, code: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            code,
        }
    }

    /// Create an error from a raw status code, classifying it.
    pub fn from_code(code: u32, message: impl Into<String>) -> Self {
        Self::new(classify(code), message, code)
    }

    /// A library-level error with no PC/SC status code.
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message, 0)
    }

    /// The error for operations on a session whose card handle is gone.
    pub fn session_closed(reader: &str) -> Self {
        Self::new(
            ErrorKind::SessionClosed,
            format!("session for reader {reader} is disconnected"),
            0,
        )
    }

    /// The taxonomy kind.
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The preserved message text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The preserved numeric status code (0 for library-level errors).
    pub const fn code(&self) -> u32 {
        self.code
    }

    /// Whether this failure is the dual-protocol negotiation symptom.
    ///
    /// Checks the numeric classification first and falls back to a
    /// case-insensitive substring match on the message, since some resource
    /// managers only expose the condition through the message text.
    pub fn is_unresponsive(&self) -> bool {
        self.kind == ErrorKind::Unresponsive
            || self.message.to_ascii_lowercase().contains("unresponsive")
    }
}

impl From<pcsc::Error> for Error {
    fn from(err: pcsc::Error) -> Self {
        Self::from_code(err as u32, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_known_codes() {
        assert_eq!(classify(0x8010_0069), ErrorKind::CardRemoved);
        assert_eq!(classify(0x8010_000A), ErrorKind::Timeout);
        assert_eq!(classify(0x8010_002E), ErrorKind::NoReaders);
        assert_eq!(classify(0x8010_001D), ErrorKind::ServiceNotRunning);
        assert_eq!(classify(0x8010_000B), ErrorKind::SharingViolation);
        assert_eq!(classify(0x8010_0010), ErrorKind::Unresponsive);
        assert_eq!(classify(0x0000_0002), ErrorKind::Cancelled);
    }

    #[test]
    fn classify_platform_variants() {
        // The resource manager reports these codes for the same conditions.
        assert_eq!(classify(0x8010_0066), ErrorKind::Unresponsive);
        assert_eq!(classify(0x8010_0002), ErrorKind::Cancelled);
    }

    #[test]
    fn unknown_codes_keep_raw_value() {
        let err = Error::from_code(0x8010_0042, "mystery failure");
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert_eq!(err.code(), 0x8010_0042);
        assert_eq!(err.message(), "mystery failure");
    }

    #[test]
    fn pcsc_errors_are_classified() {
        let err = Error::from(pcsc::Error::RemovedCard);
        assert_eq!(err.kind(), ErrorKind::CardRemoved);
        assert_eq!(err.code(), 0x8010_0069);

        let err = Error::from(pcsc::Error::Cancelled);
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn unresponsive_by_code_and_by_message() {
        let by_code = Error::from_code(CODE_UNRESPONSIVE, "negotiation failed");
        assert!(by_code.is_unresponsive());

        let by_message = Error::other("The smart card is Unresponsive");
        assert!(by_message.is_unresponsive());

        let neither = Error::from_code(CODE_TIMEOUT, "timed out");
        assert!(!neither.is_unresponsive());
    }
}
