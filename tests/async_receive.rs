use std::{sync::Arc, time::Duration};

use wintunapi::{Error, StubDriver, Wintun};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn awaits_packets_injected_later() {
    let stub = Arc::new(StubDriver::new());
    let wintun = Wintun::with_binding(stub.clone());
    let adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
    let session = adapter.start_session(0x400000).unwrap();
    let handle = session.handle();

    let injector = {
        let stub = stub.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stub.inject_batch(handle, [&[0x45u8, 1][..], &[0x45u8, 2][..]]);
        })
    };

    let mut receiver = session.async_receiver().unwrap();
    let first = receiver.receive().await.unwrap();
    assert_eq!(&first[..], &[0x45, 1]);
    first.release();
    // Left over from the same wake-up; must not wait for another signal.
    let second = receiver.receive().await.unwrap();
    assert_eq!(&second[..], &[0x45, 2]);
    second.release();
    injector.await.unwrap();

    drop(receiver);
    session.end().unwrap();
    assert!(stub.violations().is_empty());
}

#[tokio::test]
async fn receive_after_end_fails() {
    let stub = Arc::new(StubDriver::new());
    let wintun = Wintun::with_binding(stub);
    let adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
    let session = adapter.start_session(0x400000).unwrap();
    session.end().unwrap();
    assert_eq!(session.async_receiver().err(), Some(Error::SessionEnded));
}
