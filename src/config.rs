//! Connection configuration

use pcsc::{Protocols, ShareMode};

/// Configuration for the card connections a [`crate::DeviceManager`] opens.
///
/// The default offers both T=0 and T=1 with shared access; the manager falls
/// back to a T=0-only attempt when negotiation fails against a mute card.
#[derive(Debug, Clone, Copy)]
pub struct ConnectConfig {
    /// Sharing mode used when connecting to cards.
    pub share_mode: ShareMode,
    /// Protocol set offered during negotiation.
    pub protocols: Protocols,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            share_mode: ShareMode::Shared,
            protocols: Protocols::ANY,
        }
    }
}

impl ConnectConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sharing mode.
    pub const fn with_share_mode(mut self, mode: ShareMode) -> Self {
        self.share_mode = mode;
        self
    }

    /// Set the protocols offered during negotiation.
    pub const fn with_protocols(mut self, protocols: Protocols) -> Self {
        self.protocols = protocols;
        self
    }
}
