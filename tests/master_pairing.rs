//! Master-side pairing and forwarding between a scripted client and a
//! scripted child, with no processes forked.

use docgate::config::GatewayConfig;
use docgate::core::supervisor::Supervisor;
use docgate::protocol::framing::{MessageChannel, RecvEvent, FRAME_CLOSE};
use docgate::session::master::{run_client_session, run_prisoner_session};
use docgate::session::pairing::PairingTable;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn channel_pair() -> (MessageChannel, MessageChannel) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let addr = listener.local_addr().unwrap();
    let join = thread::spawn(move || listener.accept().unwrap().0);
    let near = TcpStream::connect(addr).unwrap();
    let far = join.join().unwrap();
    (
        MessageChannel::new(near).unwrap(),
        MessageChannel::new(far).unwrap(),
    )
}

fn test_config() -> GatewayConfig {
    GatewayConfig {
        port: 0,
        cache_dir: std::env::temp_dir(),
        sys_template: std::env::temp_dir(),
        lo_template: std::env::temp_dir(),
        child_root: std::env::temp_dir(),
        lo_subpath: "lo".to_string(),
        num_prespawn: 0,
        interactive_test: false,
        debug_uid: None,
    }
}

fn receive_frame(channel: &mut MessageChannel) -> Vec<u8> {
    match channel.receive().unwrap() {
        RecvEvent::Frame { payload, flags } if flags & FRAME_CLOSE == 0 => payload,
        other => panic!("expected a data frame, got {other:?}"),
    }
}

#[test]
fn routes_traffic_between_a_paired_client_and_child() {
    let supervisor = Arc::new(Supervisor::new(test_config()));
    let pairing = Arc::new(PairingTable::new());

    // Child back-connects and claims its identity.
    let (mut child_end, prisoner_end) = channel_pair();
    let prisoner_thread = {
        let supervisor = supervisor.clone();
        let pairing = pairing.clone();
        thread::spawn(move || run_prisoner_session(prisoner_end, supervisor, pairing))
    };
    child_end.writer().send_text("child 99").unwrap();

    // Wait until the prisoner is registered before letting a client claim it.
    let deadline = Instant::now() + Duration::from_secs(5);
    while pairing.available_sessions() == 0 {
        assert!(Instant::now() < deadline, "prisoner never registered");
        thread::sleep(Duration::from_millis(10));
    }

    let (mut client_end, toclient_end) = channel_pair();
    let client_thread = {
        let supervisor = supervisor.clone();
        let pairing = pairing.clone();
        thread::spawn(move || run_client_session(toclient_end, supervisor, pairing))
    };

    // Client → master → child.
    client_end
        .writer()
        .send_text("key type=input char=97 key=0")
        .unwrap();
    let to_child = receive_frame(&mut child_end);
    assert_eq!(to_child, b"key type=input char=97 key=0");

    // Child → master → client.
    child_end.writer().send_text("statusindicator: ready").unwrap();
    let to_client = receive_frame(&mut client_end);
    assert_eq!(to_client, b"statusindicator: ready");

    // The client hangs up; the master closes the child's channel in turn.
    client_end.writer().close();
    client_thread.join().unwrap();
    loop {
        match child_end.receive() {
            Ok(RecvEvent::Frame { flags, .. }) if flags & FRAME_CLOSE == 0 => continue,
            _ => break,
        }
    }
    child_end.writer().close();
    prisoner_thread.join().unwrap();
}

#[test]
fn canceltiles_reaches_the_child_even_with_an_empty_queue() {
    let supervisor = Arc::new(Supervisor::new(test_config()));
    let pairing = Arc::new(PairingTable::new());

    let (mut child_end, prisoner_end) = channel_pair();
    let prisoner_thread = {
        let supervisor = supervisor.clone();
        let pairing = pairing.clone();
        thread::spawn(move || run_prisoner_session(prisoner_end, supervisor, pairing))
    };
    child_end.writer().send_text("child 101").unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while pairing.available_sessions() == 0 {
        assert!(Instant::now() < deadline, "prisoner never registered");
        thread::sleep(Duration::from_millis(10));
    }

    let (client_end, toclient_end) = channel_pair();
    let client_thread = {
        let supervisor = supervisor.clone();
        let pairing = pairing.clone();
        thread::spawn(move || run_client_session(toclient_end, supervisor, pairing))
    };

    // Nothing queued; the cancel is still forwarded synchronously.
    client_end.writer().send_text("canceltiles").unwrap();
    let forwarded = receive_frame(&mut child_end);
    assert_eq!(forwarded, b"canceltiles");

    client_end.writer().close();
    client_thread.join().unwrap();
    child_end.writer().close();
    prisoner_thread.join().unwrap();
}
