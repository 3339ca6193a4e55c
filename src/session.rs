//! Connected card sessions

use core::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use pcsc::{Card, Disposition, Protocol, Protocols, ShareMode, Status};
use tracing::trace;

use crate::error::Error;
use crate::t0::{ApduTransmit, TransmitOptions};

/// Default receive buffer capacity for a transmit.
pub const DEFAULT_RECV_LENGTH: usize = 258;
/// Upper bound on the receive buffer capacity.
pub const MAX_RECV_LENGTH: usize = 262_144;
/// Upper bound on an outgoing APDU (extended-length command).
pub const MAX_APDU_LENGTH: usize = 65_544;

/// Receive capacity used by control exchanges.
const CONTROL_RECV_LENGTH: usize = 256;

pub(crate) fn clamp_recv_length(requested: usize) -> usize {
    requested.clamp(DEFAULT_RECV_LENGTH, MAX_RECV_LENGTH)
}

/// Snapshot of a session's card status.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    /// Raw card status flags.
    pub status: Status,
    /// Active protocol, if negotiated.
    pub protocol: Option<Protocol>,
    /// Current ATR.
    pub atr: Vec<u8>,
}

/// A connection to the card in a specific reader.
///
/// The session is a cheap-clone handle; all clones share one card handle.
/// Blocking PC/SC calls run on worker tasks, so `transmit`, `control` and
/// `reconnect` are async. After [`CardSession::disconnect`] every operation
/// except another `disconnect` fails immediately.
#[derive(Clone)]
pub struct CardSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    reader_name: String,
    card: Mutex<Option<Card>>,
    protocol: Mutex<Option<Protocol>>,
    atr: Vec<u8>,
    connected: AtomicBool,
}

impl fmt::Debug for CardSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardSession")
            .field("reader_name", &self.inner.reader_name)
            .field("protocol", &*self.inner.protocol.lock())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl CardSession {
    /// Wrap a freshly connected card handle.
    pub(crate) fn new(card: Card, reader_name: String) -> Self {
        let (protocol, atr) = match card.status2_owned() {
            Ok(status) => (status.protocol2(), status.atr().to_vec()),
            Err(_) => (None, Vec::new()),
        };
        Self {
            inner: Arc::new(SessionInner {
                reader_name,
                card: Mutex::new(Some(card)),
                protocol: Mutex::new(protocol),
                atr,
                connected: AtomicBool::new(true),
            }),
        }
    }

    /// A session in its terminal state, with no underlying card handle.
    #[cfg(test)]
    pub(crate) fn detached(reader_name: &str, atr: &[u8]) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                reader_name: reader_name.to_owned(),
                card: Mutex::new(None),
                protocol: Mutex::new(None),
                atr: atr.to_vec(),
                connected: AtomicBool::new(true),
            }),
        }
    }

    /// Name of the reader holding the card.
    pub fn reader_name(&self) -> &str {
        &self.inner.reader_name
    }

    /// ATR captured when the session was established.
    pub fn atr(&self) -> &[u8] {
        &self.inner.atr
    }

    /// Protocol negotiated for this session.
    pub fn protocol(&self) -> Option<Protocol> {
        *self.inner.protocol.lock()
    }

    /// Whether the session still owns its card handle.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<(), Error> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::session_closed(&self.inner.reader_name))
        }
    }

    /// Send an APDU and return the raw response including the status word.
    ///
    /// The receive capacity is `opts.max_recv_length`, clamped to the
    /// [`DEFAULT_RECV_LENGTH`]..=[`MAX_RECV_LENGTH`] range.
    pub async fn transmit(
        &self,
        command: &[u8],
        opts: &TransmitOptions,
    ) -> Result<Bytes, Error> {
        self.ensure_connected()?;
        if command.len() > MAX_APDU_LENGTH {
            return Err(Error::other(format!(
                "APDU of {} bytes exceeds the {MAX_APDU_LENGTH}-byte limit",
                command.len()
            )));
        }
        let recv_length = clamp_recv_length(opts.max_recv_length);
        let inner = Arc::clone(&self.inner);
        let command = command.to_vec();
        tokio::task::spawn_blocking(move || inner.transmit_blocking(&command, recv_length))
            .await
            .map_err(|err| Error::other(format!("transmit worker failed: {err}")))?
    }

    /// Send a control exchange to the reader.
    pub async fn control(&self, code: u32, data: &[u8]) -> Result<Bytes, Error> {
        self.ensure_connected()?;
        let inner = Arc::clone(&self.inner);
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || inner.control_blocking(code, &data))
            .await
            .map_err(|err| Error::other(format!("control worker failed: {err}")))?
    }

    /// Query the current card status.
    pub fn status(&self) -> Result<SessionStatus, Error> {
        self.ensure_connected()?;
        let guard = self.inner.card.lock();
        let card = guard
            .as_ref()
            .ok_or_else(|| Error::session_closed(&self.inner.reader_name))?;
        let status = card.status2_owned().map_err(Error::from)?;
        Ok(SessionStatus {
            status: status.status(),
            protocol: status.protocol2(),
            atr: status.atr().to_vec(),
        })
    }

    /// Disconnect from the card. Idempotent.
    ///
    /// A transmit failure never disconnects implicitly; ending the session
    /// is always the caller's call.
    pub fn disconnect(&self, disposition: Disposition) -> Result<(), Error> {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let card = self.inner.card.lock().take();
        trace!(reader = %self.inner.reader_name, "disconnecting session");
        if let Some(card) = card {
            card.disconnect(disposition).map_err(|(_, err)| Error::from(err))?;
        }
        Ok(())
    }

    /// Re-negotiate the connection, preserving the card handle.
    ///
    /// Returns the newly active protocol.
    pub async fn reconnect(
        &self,
        share_mode: ShareMode,
        preferred_protocols: Protocols,
        initialization: Disposition,
    ) -> Result<Protocol, Error> {
        self.ensure_connected()?;
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            inner.reconnect_blocking(share_mode, preferred_protocols, initialization)
        })
        .await
        .map_err(|err| Error::other(format!("reconnect worker failed: {err}")))?
    }
}

impl SessionInner {
    fn transmit_blocking(&self, command: &[u8], recv_length: usize) -> Result<Bytes, Error> {
        let guard = self.card.lock();
        let card = guard
            .as_ref()
            .ok_or_else(|| Error::session_closed(&self.reader_name))?;
        let mut buffer = vec![0u8; recv_length];
        let received = card.transmit(command, &mut buffer).map_err(Error::from)?;
        trace!(
            reader = %self.reader_name,
            command = %hex::encode(command),
            response = %hex::encode(received),
            "apdu exchange"
        );
        Ok(Bytes::copy_from_slice(received))
    }

    fn control_blocking(&self, code: u32, data: &[u8]) -> Result<Bytes, Error> {
        let guard = self.card.lock();
        let card = guard
            .as_ref()
            .ok_or_else(|| Error::session_closed(&self.reader_name))?;
        let mut buffer = vec![0u8; CONTROL_RECV_LENGTH];
        // DWORD is u32 on Windows and c_ulong elsewhere.
        let received = card
            .control(code as _, data, &mut buffer)
            .map_err(Error::from)?;
        Ok(Bytes::copy_from_slice(received))
    }

    fn reconnect_blocking(
        &self,
        share_mode: ShareMode,
        preferred_protocols: Protocols,
        initialization: Disposition,
    ) -> Result<Protocol, Error> {
        let mut guard = self.card.lock();
        let card = guard
            .as_mut()
            .ok_or_else(|| Error::session_closed(&self.reader_name))?;
        card.reconnect(share_mode, preferred_protocols, initialization)
            .map_err(Error::from)?;
        let status = card.status2_owned().map_err(Error::from)?;
        let protocol = status
            .protocol2()
            .ok_or_else(|| Error::other("no active protocol after reconnect"))?;
        *self.protocol.lock() = Some(protocol);
        Ok(protocol)
    }
}

impl ApduTransmit for CardSession {
    async fn transmit_apdu(
        &self,
        command: &[u8],
        opts: &TransmitOptions,
    ) -> Result<Bytes, Error> {
        self.transmit(command, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn recv_length_is_clamped() {
        assert_eq!(clamp_recv_length(0), DEFAULT_RECV_LENGTH);
        assert_eq!(clamp_recv_length(100), DEFAULT_RECV_LENGTH);
        assert_eq!(clamp_recv_length(258), 258);
        assert_eq!(clamp_recv_length(4096), 4096);
        assert_eq!(clamp_recv_length(usize::MAX), MAX_RECV_LENGTH);
    }

    #[tokio::test]
    async fn operations_fail_after_disconnect() {
        let session = CardSession::detached("Test Reader 00", &[0x3B, 0x00]);
        session.disconnect(Disposition::LeaveCard).unwrap();
        assert!(!session.is_connected());

        let err = session
            .transmit(&[0x00, 0xA4, 0x04, 0x00], &TransmitOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);

        let err = session.control(0x4200_0D48, &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);

        let err = session.status().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let session = CardSession::detached("Test Reader 00", &[]);
        session.disconnect(Disposition::LeaveCard).unwrap();
        session.disconnect(Disposition::LeaveCard).unwrap();
        assert!(!session.is_connected());
    }
}
