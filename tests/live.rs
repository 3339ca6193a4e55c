//! Hardware-backed smoke tests
//!
//! Every test returns early when no PC/SC service (or no reader) is
//! available, so the suite passes on machines without smartcard hardware.

use std::time::Duration;

use cardwatch::{DeviceEvent, DeviceManager, MonitorEvent, ReaderMonitor};

#[test]
fn monitor_start_and_stop_are_idempotent() {
    let mut monitor = ReaderMonitor::new();
    match monitor.start(|_event: MonitorEvent| {}) {
        Ok(()) => {}
        Err(err) => {
            println!("Skipping test, PC/SC not available: {err}");
            return;
        }
    }
    assert!(monitor.is_running());

    // Starting a running monitor is a no-op.
    monitor.start(|_event: MonitorEvent| {}).unwrap();

    monitor.stop();
    monitor.stop();
    assert!(!monitor.is_running());
}

#[tokio::test(flavor = "multi_thread")]
async fn manager_restarts_cleanly() {
    let manager = DeviceManager::new();
    match manager.start() {
        Ok(()) => {}
        Err(err) => {
            println!("Skipping test, PC/SC not available: {err}");
            return;
        }
    }
    assert!(manager.is_running());

    manager.stop().await;
    manager.stop().await;
    assert!(!manager.is_running());
    assert!(manager.cards().is_empty());

    manager.start().expect("restart after stop");
    assert!(manager.is_running());
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn preexisting_readers_are_announced_before_insertions() {
    let manager = DeviceManager::new();
    let events = manager.subscribe();
    match manager.start() {
        Ok(()) => {}
        Err(err) => {
            println!("Skipping test, PC/SC not available: {err}");
            return;
        }
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    manager.stop().await;

    let mut attached: Vec<String> = Vec::new();
    for event in events.try_iter() {
        match event {
            DeviceEvent::ReaderAttached { reader } => attached.push(reader),
            DeviceEvent::CardInserted { reader, card } => {
                // A reader's attach event always precedes its insertion.
                assert!(attached.contains(&reader));
                assert!(card.is_connected());
            }
            _ => {}
        }
    }
    println!("observed {} pre-existing readers", attached.len());
}
