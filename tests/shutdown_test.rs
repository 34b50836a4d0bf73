use mdns_core::{
    DaemonStatus, Error, MdnsConfig, PublicationOptions, ServiceDaemon, SubscriptionOptions,
};
use std::thread::sleep;
use std::time::{Duration, Instant};
use test_log::test;

/// Test that a daemon reports running, then shuts down for good.
#[test]
fn test_shutdown_status() {
    let d = ServiceDaemon::new(MdnsConfig::new("shutdown-host")).expect("Failed to create daemon");

    let status = d.status().unwrap().recv().unwrap();
    assert_eq!(status, DaemonStatus::Running);

    let shutdown_receiver = d.shutdown().unwrap();
    let status = shutdown_receiver.recv().unwrap();
    assert_eq!(status, DaemonStatus::Shutdown);

    // The daemon thread goes away shortly after.
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut stopped = false;
    while Instant::now() < deadline {
        if let Ok(DaemonStatus::Shutdown) = d.status().unwrap().recv() {
            stopped = true;
            break;
        }
        sleep(Duration::from_millis(50));
    }
    assert!(stopped, "daemon should be stopped after shutdown");

    // Commands after shutdown fail instead of hanging.
    assert!(d
        .subscribe_to_service("_shutdown-test._udp.", SubscriptionOptions::default())
        .is_err());
}

#[test]
fn test_invalid_names_are_rejected() {
    assert!(matches!(
        ServiceDaemon::new(MdnsConfig::new("bad.host")),
        Err(Error::InvalidName(_))
    ));

    let d = ServiceDaemon::new(MdnsConfig::new("names-host")).expect("Failed to create daemon");
    assert!(matches!(
        d.subscribe_to_service("printer", SubscriptionOptions::default()),
        Err(Error::InvalidName(_))
    ));
    assert!(matches!(
        d.publish_service_instance("_ipp._tcp.", "a.b", PublicationOptions::default()),
        Err(Error::InvalidName(_))
    ));
    assert!(matches!(
        d.set_subtypes("_ipp._tcp.", "office", vec!["_x.y".to_string()]),
        Err(Error::InvalidName(_))
    ));

    let status = d.shutdown().unwrap().recv().unwrap();
    assert_eq!(status, DaemonStatus::Shutdown);
}

#[test]
fn test_metrics_before_ready() {
    let d = ServiceDaemon::new(MdnsConfig::new("metrics-host")).expect("Failed to create daemon");

    // Metrics are served even while the host name is being probed.
    let metrics = d
        .get_metrics()
        .unwrap()
        .recv_timeout(Duration::from_secs(2))
        .expect("metrics");
    assert!(metrics.values().all(|v| *v >= 0));

    d.shutdown().unwrap().recv().unwrap();
}
