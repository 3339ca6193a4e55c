//! CCID control codes and feature discovery
//!
//! Readers expose pad, display and escape operations through vendor control
//! codes enumerated by the `GET_FEATURE_REQUEST` escape. The response is a
//! TLV stream mapping feature tags to 32-bit control codes.

use std::collections::HashMap;

/// Derive a reader control code from a function number.
#[cfg(windows)]
pub const fn ctl_code(code: u32) -> u32 {
    (0x31 << 16) + (code << 2)
}

/// Derive a reader control code from a function number.
#[cfg(not(windows))]
pub const fn ctl_code(code: u32) -> u32 {
    0x4200_0000 + code
}

/// Control code that asks a CCID reader for its feature TLV list.
pub const CM_IOCTL_GET_FEATURE_REQUEST: u32 = ctl_code(3400);

/// Feature tags reported in a `GET_FEATURE_REQUEST` response.
pub mod features {
    /// Begin a PIN verification on the pad.
    pub const VERIFY_PIN_START: u8 = 0x01;
    /// Finish a PIN verification started with `VERIFY_PIN_START`.
    pub const VERIFY_PIN_FINISH: u8 = 0x02;
    /// Begin a PIN modification on the pad.
    pub const MODIFY_PIN_START: u8 = 0x03;
    /// Finish a PIN modification started with `MODIFY_PIN_START`.
    pub const MODIFY_PIN_FINISH: u8 = 0x04;
    /// Poll the pad for a key press.
    pub const GET_KEY_PRESSED: u8 = 0x05;
    /// One-shot PIN verification.
    pub const VERIFY_PIN_DIRECT: u8 = 0x06;
    /// One-shot PIN modification.
    pub const MODIFY_PIN_DIRECT: u8 = 0x07;
    /// Multifunctional card terminal pass-through.
    pub const MCT_READER_DIRECT: u8 = 0x08;
    /// Multifunctional card terminal universal command.
    pub const MCT_UNIVERSAL: u8 = 0x09;
    /// Query pad PIN properties.
    pub const IFD_PIN_PROPERTIES: u8 = 0x0A;
    /// Abort a pad operation in progress.
    pub const ABORT: u8 = 0x0B;
    /// Set the message shown during secure PIN entry.
    pub const SET_SPE_MESSAGE: u8 = 0x0C;
    /// One-shot PIN verification selecting an application first.
    pub const VERIFY_PIN_DIRECT_APP_ID: u8 = 0x0D;
    /// One-shot PIN modification selecting an application first.
    pub const MODIFY_PIN_DIRECT_APP_ID: u8 = 0x0E;
    /// Write to the reader display.
    pub const WRITE_DISPLAY: u8 = 0x0F;
    /// Read a key from the pad.
    pub const GET_KEY: u8 = 0x10;
    /// Query display properties.
    pub const IFD_DISPLAY_PROPERTIES: u8 = 0x11;
    /// Query the reader's TLV property list.
    pub const GET_TLV_PROPERTIES: u8 = 0x12;
    /// Raw CCID escape command.
    pub const CCID_ESC_COMMAND: u8 = 0x13;
}

/// Parse a CCID feature TLV stream into tag-to-control-code pairs.
///
/// Each entry is `(tag: u8, length: u8, value: [u8; length])`. Only entries
/// whose length is exactly 4 contribute, with the value read as a big-endian
/// u32. Entries of any other length are skipped; an entry whose value would
/// overrun the buffer terminates parsing.
pub fn parse_features(data: &[u8]) -> HashMap<u8, u32> {
    let mut map = HashMap::new();
    let mut pos = 0;
    while pos + 2 <= data.len() {
        let tag = data[pos];
        let len = data[pos + 1] as usize;
        let end = pos + 2 + len;
        if end > data.len() {
            break;
        }
        if len == 4 {
            let value = u32::from_be_bytes([
                data[pos + 2],
                data[pos + 3],
                data[pos + 4],
                data[pos + 5],
            ]);
            map.insert(tag, value);
        }
        pos = end;
    }
    map
}
