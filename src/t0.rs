//! T=0 response chaining
//!
//! T=0 cards signal oversized responses through the status word instead of
//! streaming them: `61 XX` means "XX more bytes via GET RESPONSE", `6C XX`
//! means "retry with Le = XX". [`transmit_with_auto_response`] follows both
//! idioms on top of any [`ApduTransmit`] implementation.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::session::DEFAULT_RECV_LENGTH;

const SW1_MORE_DATA: u8 = 0x61;
const SW1_WRONG_LE: u8 = 0x6C;

/// Options applied to a transmit operation.
#[derive(Debug, Clone, Copy)]
pub struct TransmitOptions {
    /// Receive buffer capacity; clamped to [258, 262144] by the session.
    pub max_recv_length: usize,
    /// Follow `61XX`/`6CXX` status words automatically.
    pub auto_get_response: bool,
}

impl Default for TransmitOptions {
    fn default() -> Self {
        Self {
            max_recv_length: DEFAULT_RECV_LENGTH,
            auto_get_response: true,
        }
    }
}

impl TransmitOptions {
    /// Create the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the receive buffer capacity.
    pub const fn with_max_recv_length(mut self, length: usize) -> Self {
        self.max_recv_length = length;
        self
    }

    /// Enable or disable automatic status-word chaining.
    pub const fn with_auto_get_response(mut self, auto: bool) -> Self {
        self.auto_get_response = auto;
        self
    }
}

/// Capability seam for anything that can exchange a raw APDU.
///
/// [`crate::CardSession`] implements it over PC/SC; test doubles implement
/// it over scripted byte sequences.
#[allow(async_fn_in_trait)]
pub trait ApduTransmit {
    /// Send one APDU and return the raw response including the status word.
    async fn transmit_apdu(
        &self,
        command: &[u8],
        opts: &TransmitOptions,
    ) -> Result<Bytes, Error>;
}

/// Send a command, transparently following T=0 chaining status words.
///
/// Payloads preceding a `61 XX` status are accumulated and each continuation
/// is fetched with `GET RESPONSE`. A `6C XX` status replays the original
/// command with the corrected Le and does not accumulate, since it replaces
/// the request rather than continuing it. The loop runs until the card
/// returns a non-chaining status word; a malfunctioning card that chains
/// forever is the caller's deadline to enforce.
pub async fn transmit_with_auto_response<T: ApduTransmit>(
    card: &T,
    command: &[u8],
    opts: &TransmitOptions,
) -> Result<Bytes, Error> {
    let mut response = card.transmit_apdu(command, opts).await?;
    if !opts.auto_get_response {
        return Ok(response);
    }

    let mut collected = BytesMut::new();
    loop {
        if response.len() < 2 {
            break;
        }
        let sw1 = response[response.len() - 2];
        let sw2 = response[response.len() - 1];
        match sw1 {
            SW1_MORE_DATA => {
                if response.len() > 2 {
                    collected.put_slice(&response[..response.len() - 2]);
                }
                let get_response = [0x00, 0xC0, 0x00, 0x00, sw2];
                response = card.transmit_apdu(&get_response, opts).await?;
            }
            SW1_WRONG_LE => {
                let corrected = correct_le(command, sw2);
                response = card.transmit_apdu(&corrected, opts).await?;
            }
            _ => break,
        }
    }

    if collected.is_empty() {
        Ok(response)
    } else {
        collected.put_slice(&response);
        Ok(collected.freeze())
    }
}

/// Rewrite a command's Le field after a `6C XX` status word.
///
/// A 4-byte command has no Le and gets one appended; a 5-byte command has
/// its Le at offset 4; anything longer carries Le as its final byte.
pub fn correct_le(command: &[u8], le: u8) -> Vec<u8> {
    let mut corrected = command.to_vec();
    match corrected.len() {
        4 => corrected.push(le),
        5 => corrected[4] = le,
        _ => {
            if let Some(last) = corrected.last_mut() {
                *last = le;
            }
        }
    }
    corrected
}
