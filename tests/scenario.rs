use std::{
    ops::ControlFlow,
    sync::{Arc, Mutex},
    thread,
};

use wintunapi::{
    AdapterHandle, Error, LoopExit, Operation, SessionState, StubDriver, Wintun,
    RING_CAPACITY_MAX, RING_CAPACITY_MIN,
};

fn stub_wintun() -> (Arc<StubDriver>, Wintun) {
    let stub = Arc::new(StubDriver::new());
    let wintun = Wintun::with_binding(stub.clone());
    (stub, wintun)
}

#[test]
fn adapter_and_session_scenario() {
    let (stub, wintun) = stub_wintun();

    let mut adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
    assert_eq!(adapter.handle(), AdapterHandle(1));
    assert_eq!(adapter.name(), "VPN0");

    stub.set_version(0);
    assert!(matches!(
        wintun.running_driver_version().unwrap_err(),
        Error::DriverNotLoaded { .. }
    ));

    assert!(matches!(
        adapter.start_session(0x1000).unwrap_err(),
        Error::InvalidParameter { .. }
    ));
    assert_eq!(stub.calls(Operation::StartSession), 0);

    let session = adapter.start_session(0x400000).unwrap();
    assert_eq!(session.state(), SessionState::Active);
    session.end().unwrap();
    assert_eq!(session.receive_packet().unwrap_err(), Error::SessionEnded);
    drop(session);

    adapter.close().unwrap();
    adapter.close().unwrap();
    assert_eq!(stub.calls(Operation::CloseAdapter), 1);
    assert!(stub.violations().is_empty());
}

#[test]
fn capacity_range_edges() {
    let (stub, wintun) = stub_wintun();
    let adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();

    let step = (RING_CAPACITY_MAX - RING_CAPACITY_MIN) / 7;
    for capacity in (0..8).map(|i| RING_CAPACITY_MIN + i * step) {
        let session = adapter.start_session(capacity).unwrap();
        assert_eq!(session.ring_capacity(), capacity);
        session.end().unwrap();
    }
    let started = stub.calls(Operation::StartSession);

    for capacity in [1, RING_CAPACITY_MIN - 1, RING_CAPACITY_MAX + 1, u32::MAX] {
        assert!(adapter.start_session(capacity).is_err());
    }
    assert_eq!(stub.calls(Operation::StartSession), started);
}

#[test]
fn sent_packet_is_observed_once_unchanged() {
    let (stub, wintun) = stub_wintun();
    let adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
    let session = adapter.start_session(0x400000).unwrap();

    let payload: Vec<u8> = (0..=255u8).cycle().take(1280).collect();
    let mut packet = session.allocate_send_packet(payload.len()).unwrap();
    packet.copy_from_slice(&payload);
    session.send_packet(packet).unwrap();

    let sent = stub.take_sent(session.handle());
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0], payload);
    assert!(stub.take_sent(session.handle()).is_empty());
    session.end().unwrap();
}

#[test]
fn receive_loop_drains_before_rewaiting() {
    let (stub, wintun) = stub_wintun();
    let adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
    let session = adapter.start_session(0x400000).unwrap();
    let event = stub.event(session.handle()).unwrap();
    let received = Mutex::new(Vec::new());

    thread::scope(|s| {
        let receiver = s.spawn(|| {
            session.receive_loop(|packet| {
                received.lock().unwrap().push(packet.to_vec());
                ControlFlow::Continue(())
            })
        });

        while event.wait_count() < 1 {
            thread::yield_now();
        }
        let packets: Vec<Vec<u8>> = (1..=5u8).map(|n| vec![0x45, n]).collect();
        stub.inject_batch(session.handle(), packets.iter().map(Vec::as_slice));

        while event.wait_count() < 2 {
            thread::yield_now();
        }
        assert_eq!(*received.lock().unwrap(), packets);
        assert_eq!(stub.outstanding_receives(session.handle()), 0);

        session.end().unwrap();
        assert_eq!(receiver.join().unwrap().unwrap(), LoopExit::SessionEnded);
    });
    assert!(stub.violations().is_empty());
}

#[test]
fn receive_loop_stops_on_handler_request() {
    let (stub, wintun) = stub_wintun();
    let adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
    let session = adapter.start_session(0x400000).unwrap();
    stub.inject_batch(session.handle(), [&[1u8][..], &[2u8][..], &[3u8][..]]);

    let mut seen = 0;
    let exit = session
        .receive_loop(|_| {
            seen += 1;
            if seen == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .unwrap();
    assert_eq!(exit, LoopExit::Stopped);
    assert_eq!(seen, 2);
    assert_eq!(stub.outstanding_receives(session.handle()), 0);

    // The third packet is still queued.
    assert_eq!(&session.receive_packet().unwrap()[..], &[3]);
    session.end().unwrap();
}

#[test]
fn ring_full_recovers_after_driver_drains() {
    let (stub, wintun) = stub_wintun();
    let adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
    let session = adapter.start_session(RING_CAPACITY_MIN).unwrap();

    let packet = [0x45u8; 1400];
    let mut sent = 0;
    loop {
        match session.send(&packet) {
            Ok(()) => sent += 1,
            Err(err) => {
                assert_eq!(err, Error::RingFull);
                assert!(err.is_transient());
                break;
            }
        }
    }
    assert_eq!(stub.take_sent(session.handle()).len(), sent);
    session.send(&packet).unwrap();
    session.end().unwrap();
}

#[test]
fn uninstall_reports_busy_while_adapters_are_open_elsewhere() {
    let stub = Arc::new(StubDriver::new());
    let other = Wintun::with_binding(stub.clone());
    let mut wintun = Wintun::with_binding(stub.clone());

    let mut held = other.create_adapter("VPN1", "Tunnel", None).unwrap();
    assert!(matches!(
        wintun.uninstall_driver().unwrap_err(),
        Error::ResourceBusy { .. }
    ));
    held.close().unwrap();
    wintun.uninstall_driver().unwrap();
    assert!(stub.is_deleted());
}

#[test]
fn concurrent_senders_lose_nothing() {
    const THREADS: u8 = 8;
    const PER_THREAD: u16 = 200;

    let (stub, wintun) = stub_wintun();
    let adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
    let session = adapter.start_session(0x400000).unwrap();

    thread::scope(|s| {
        for sender in 0..THREADS {
            let session = &session;
            s.spawn(move || {
                for seq in 0..PER_THREAD {
                    let [hi, lo] = seq.to_be_bytes();
                    let mut packet = session.allocate_send_packet(16).unwrap();
                    packet.fill(sender);
                    packet[..3].copy_from_slice(&[sender, hi, lo]);
                    packet.send().unwrap();
                }
            });
        }
    });

    let sent = stub.take_sent(session.handle());
    assert_eq!(sent.len(), THREADS as usize * PER_THREAD as usize);
    for sender in 0..THREADS {
        let seqs: Vec<u16> = sent
            .iter()
            .filter(|packet| packet[0] == sender)
            .map(|packet| {
                assert_eq!(packet.len(), 16);
                assert!(packet[3..].iter().all(|&b| b == sender));
                u16::from_be_bytes([packet[1], packet[2]])
            })
            .collect();
        // Each sender's packets arrive complete and in its own commit order.
        assert_eq!(seqs, (0..PER_THREAD).collect::<Vec<_>>());
    }
    assert!(stub.violations().is_empty());
    session.end().unwrap();
}

#[test]
fn concurrent_receivers_take_each_packet_once() {
    let (stub, wintun) = stub_wintun();
    let adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
    let session = adapter.start_session(0x400000).unwrap();

    let packets: Vec<Vec<u8>> = (0..400u16).map(|n| n.to_be_bytes().to_vec()).collect();
    stub.inject_batch(session.handle(), packets.iter().map(Vec::as_slice));

    let received = Mutex::new(Vec::new());
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| loop {
                match session.receive_packet() {
                    Ok(packet) => {
                        received.lock().unwrap().push(packet.to_vec());
                        packet.release();
                    }
                    Err(err) => {
                        assert_eq!(err, Error::WouldBlock);
                        break;
                    }
                }
            });
        }
    });

    let mut received = received.into_inner().unwrap();
    received.sort();
    assert_eq!(received, packets);
    assert_eq!(stub.outstanding_receives(session.handle()), 0);
    assert!(stub.violations().is_empty());
    session.end().unwrap();
}

#[test]
fn ending_from_the_handler_unwinds_the_loop() {
    let (stub, wintun) = stub_wintun();
    let adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
    let session = adapter.start_session(0x400000).unwrap();
    stub.inject(session.handle(), &[0x45, 0, 0, 20]);

    let exit = session
        .receive_loop(|_| {
            session.end().unwrap();
            ControlFlow::Continue(())
        })
        .unwrap();
    assert_eq!(exit, LoopExit::SessionEnded);
    assert_eq!(stub.active_sessions(), 0);
    assert!(stub.violations().is_empty());
}
