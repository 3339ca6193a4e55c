//! Channel-based event delivery
//!
//! Convenience aliases for consumers that drain events from a thread rather
//! than registering callbacks.

use crossbeam_channel::{Receiver, Sender, unbounded};

use super::{DeviceEvent, MonitorEvent};

/// Sender for monitor events.
pub type MonitorEventSender = Sender<MonitorEvent>;
/// Receiver for monitor events.
pub type MonitorEventReceiver = Receiver<MonitorEvent>;

/// Sender for device events.
pub type DeviceEventSender = Sender<DeviceEvent>;
/// Receiver for device events.
pub type DeviceEventReceiver = Receiver<DeviceEvent>;

/// Create an unbounded channel for monitor events.
pub fn monitor_event_channel() -> (MonitorEventSender, MonitorEventReceiver) {
    unbounded()
}

/// Create an unbounded channel for device events.
pub fn device_event_channel() -> (DeviceEventSender, DeviceEventReceiver) {
    unbounded()
}
