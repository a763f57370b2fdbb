//! Command queue tests: commands are applied in order on the dispatcher task.

use meshtun::config::ControllerConfig;
use meshtun::controller::{ControllerState, TunController};
use meshtun::netlink::SequenceCounter;
use meshtun::service::{self, ServiceError};
use meshtun::test_util::{FakeBackend, ManualClock, address_info, fake_device, prefix_config};
use meshtun::{ControllerDispatcher, ControllerError};
use std::net::Ipv6Addr;

const IFNAME: &str = "wpan0";

fn ready_controller(backend: FakeBackend) -> TunController<FakeBackend> {
    let config = ControllerConfig::new(IFNAME, 1280).unwrap();
    let mut controller = TunController::new(config, backend, SequenceCounter::new())
        .with_clock(ManualClock::new(5_000));
    controller.initialize(fake_device(IFNAME)).unwrap();
    controller
}

#[tokio::test]
async fn test_commands_apply_in_order() {
    let backend = FakeBackend::new();
    let (handle, rx) = service::channel();
    let task = tokio::spawn(ControllerDispatcher::new(rx, ready_controller(backend.clone())).run());

    handle.set_up(true).await.unwrap();
    handle
        .update_addresses(vec![
            address_info("fd00:db8::1", 64, true, false, true),
            address_info("ff03::fc", 128, false, false, false),
        ])
        .await
        .unwrap();
    handle
        .update_prefixes(vec![prefix_config("fd22:1::", 64)])
        .await
        .unwrap();

    let properties = handle.link_properties().await.unwrap();
    assert_eq!(properties.interface_name, IFNAME);
    assert_eq!(properties.addresses().len(), 1);
    assert_eq!(properties.routes().len(), 2);
    assert!(backend.kernel().link_up);

    handle.update_addresses(vec![]).await.unwrap();
    let properties = handle.link_properties().await.unwrap();
    assert!(properties.addresses().is_empty());
    assert_eq!(properties.routes().len(), 1);

    handle.destroy().await.unwrap();
    let controller = task.await.unwrap();
    assert_eq!(controller.state(), ControllerState::Destroyed);
    assert!(controller.link_properties().routes().is_empty());
    assert!(backend.kernel().addresses.is_empty());
}

#[tokio::test]
async fn test_daemon_died_takes_link_down() {
    let backend = FakeBackend::new();
    let (handle, rx) = service::channel();
    let task = tokio::spawn(ControllerDispatcher::new(rx, ready_controller(backend.clone())).run());

    handle.set_up(true).await.unwrap();
    handle
        .update_addresses(vec![address_info("fd00:db8::1", 64, true, false, true)])
        .await
        .unwrap();
    handle.daemon_died().await.unwrap();

    let properties = handle.link_properties().await.unwrap();
    assert!(properties.addresses().is_empty());
    assert!(!backend.kernel().link_up);
    assert_eq!(backend.kernel().link_calls, vec![true, false]);

    drop(handle);
    let controller = task.await.unwrap();
    assert_eq!(controller.state(), ControllerState::Destroyed);
}

#[tokio::test]
async fn test_set_up_error_reaches_caller() {
    let backend = FakeBackend::new();
    backend.kernel().fail_link = true;
    let (handle, rx) = service::channel();
    let task = tokio::spawn(ControllerDispatcher::new(rx, ready_controller(backend.clone())).run());

    let err = handle.set_up(true).await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Controller(ControllerError::LinkState(_, "up", _))
    ));

    handle.destroy().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_handle_fails_after_destroy() {
    let (handle, rx) = service::channel();
    let task = tokio::spawn(ControllerDispatcher::new(rx, ready_controller(FakeBackend::new())).run());

    handle.destroy().await.unwrap();
    task.await.unwrap();

    assert!(matches!(
        handle.daemon_died().await,
        Err(ServiceError::Closed)
    ));
    assert!(matches!(
        handle.link_properties().await,
        Err(ServiceError::Closed)
    ));
}

#[tokio::test]
async fn test_clones_share_one_queue() {
    let backend = FakeBackend::new();
    let (handle, rx) = service::channel();
    let task = tokio::spawn(ControllerDispatcher::new(rx, ready_controller(backend.clone())).run());
    handle.set_up(true).await.unwrap();

    let other = handle.clone();
    other
        .update_addresses(vec![address_info("fd00:db8::1", 64, true, false, true)])
        .await
        .unwrap();
    handle
        .update_addresses(vec![address_info("fd00:db8::2", 64, true, false, true)])
        .await
        .unwrap();

    let properties = other.link_properties().await.unwrap();
    let addresses: Vec<Ipv6Addr> = properties.addresses().iter().map(|a| a.address).collect();
    assert_eq!(addresses, vec!["fd00:db8::2".parse::<Ipv6Addr>().unwrap()]);

    drop(other);
    drop(handle);
    task.await.unwrap();
    assert!(backend.kernel().addresses.is_empty());
}
