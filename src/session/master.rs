//! Master-side session endpoints.
//!
//! A ToClient session pairs with one child and forwards client traffic to it;
//! the matching ToPrisoner session forwards the child's replies back. The
//! `canceltiles` fast path runs on the receiver so pending `tile` work is
//! pruned before the consumer can observe it.

use crate::config::types::ChildId;
use crate::core::supervisor::Supervisor;
use crate::protocol::framing::{payload_flags, MessageChannel, RecvEvent, FRAME_CLOSE};
use crate::protocol::{abbreviated, first_line_str, is_prunable_tile, tokenize, CMD_CHILD};
use crate::queue::{MessageQueue, EOF_SENTINEL};
use crate::session::pairing::PairingTable;
use crate::session::{classify_frame, run_consumer, FrameClass, Polarity};
use log::{error, info, warn};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How long a fresh client connection waits for the supervisor to provide a
/// child before giving up.
const CLAIM_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state of one master-side endpoint; the receiver and the consumer
/// both route through it.
pub struct MasterSession {
    polarity: Polarity,
    child_id: ChildId,
    pairing: Arc<PairingTable>,
}

impl MasterSession {
    /// Forward one message to the paired peer. Returns false when the session
    /// should close.
    pub fn handle_input(&self, message: &[u8]) -> bool {
        let target = match self.polarity {
            Polarity::ToClient => self.pairing.prisoner_writer(self.child_id),
            Polarity::ToPrisoner => self.pairing.client_writer(self.child_id),
            Polarity::ToChild => unreachable!("child endpoints live in session::child"),
        };
        match target {
            Some(writer) => match writer.send_message(message, payload_flags(message)) {
                Ok(()) => true,
                Err(err) => {
                    error!(
                        "forward from {} session for child {} failed: {err}",
                        self.polarity, self.child_id
                    );
                    false
                }
            },
            // A child may speak before any client is attached; drop it.
            None if self.polarity == Polarity::ToPrisoner => {
                warn!(
                    "dropping message from unpaired child {}: {}",
                    self.child_id,
                    abbreviated(message)
                );
                true
            }
            None => {
                info!("pair for child {} is gone, closing session", self.child_id);
                false
            }
        }
    }
}

/// Serve one client connection to completion. Runs on the accept thread,
/// which acts as the session's receiver.
pub fn run_client_session(
    mut channel: MessageChannel,
    supervisor: Arc<Supervisor>,
    pairing: Arc<PairingTable>,
) {
    let writer = channel.writer();
    let child_id = match pairing.claim(CLAIM_TIMEOUT) {
        Ok(child_id) => child_id,
        Err(err) => {
            error!("unable to pair client with a child: {err}");
            writer.close();
            return;
        }
    };
    if !pairing.attach_client(child_id, writer.clone()) {
        error!("child {child_id} vanished before pairing completed");
        writer.close();
        return;
    }
    supervisor.mark_in_use(child_id);
    info!("client session paired with child {child_id}");

    let session = Arc::new(MasterSession {
        polarity: Polarity::ToClient,
        child_id,
        pairing: pairing.clone(),
    });
    let queue = Arc::new(MessageQueue::new());
    let consumer = {
        let queue = queue.clone();
        let session = session.clone();
        let writer = writer.clone();
        thread::spawn(move || {
            run_consumer(&queue, |message| session.handle_input(message));
            // Unblocks the receiver if the handler asked to close.
            writer.shutdown();
        })
    };

    receiver_loop(&mut channel, &queue, &session);

    queue.clear();
    queue.put(EOF_SENTINEL.to_vec());
    let _ = consumer.join();
    pairing.release_client(child_id);
    info!("client session for child {child_id} closed");
}

/// Serve one child back-connection to completion.
pub fn run_prisoner_session(
    mut channel: MessageChannel,
    supervisor: Arc<Supervisor>,
    pairing: Arc<PairingTable>,
) {
    let writer = channel.writer();
    let child_id = match read_child_claim(&mut channel) {
        Ok(child_id) => child_id,
        Err(message) => {
            error!("{message}");
            writer.close();
            return;
        }
    };
    pairing.register_prisoner(child_id, writer.clone());
    supervisor.mark_connected(child_id);
    info!("child {child_id} connected and available");

    let session = Arc::new(MasterSession {
        polarity: Polarity::ToPrisoner,
        child_id,
        pairing: pairing.clone(),
    });
    let queue = Arc::new(MessageQueue::new());
    let consumer = {
        let queue = queue.clone();
        let session = session.clone();
        let writer = writer.clone();
        thread::spawn(move || {
            run_consumer(&queue, |message| session.handle_input(message));
            writer.shutdown();
        })
    };

    receiver_loop(&mut channel, &queue, &session);

    queue.clear();
    queue.put(EOF_SENTINEL.to_vec());
    let _ = consumer.join();
    pairing.remove_prisoner(child_id);
    info!("prisoner session for child {child_id} closed");
}

/// First frame after back-connect must claim an identity: `child <ChildId>`.
fn read_child_claim(channel: &mut MessageChannel) -> Result<ChildId, String> {
    match channel.receive() {
        Ok(RecvEvent::Frame { payload, flags }) if flags & FRAME_CLOSE == 0 => {
            let line = first_line_str(&payload);
            let tokens = tokenize(&line);
            if tokens.len() == 2 && tokens[0] == CMD_CHILD {
                if let Ok(child_id) = tokens[1].parse::<ChildId>() {
                    if child_id != 0 {
                        return Ok(child_id);
                    }
                }
            }
            Err(format!("expected child claim, got: {}", abbreviated(&payload)))
        }
        Ok(_) => Err("child closed before claiming an identity".to_string()),
        Err(err) => Err(format!("channel error before child claim: {err}")),
    }
}

fn receiver_loop(channel: &mut MessageChannel, queue: &MessageQueue, session: &MasterSession) {
    // Only the client side intercepts canceltiles; children run their own
    // cancellation against their local queue.
    let intercept_cancel = session.polarity == Polarity::ToClient;
    loop {
        let event = match channel.receive() {
            Ok(event) => event,
            Err(err) => {
                error!("{} session channel error: {err}", session.polarity);
                break;
            }
        };
        let (payload, flags) = match event {
            RecvEvent::Frame { payload, flags } => (payload, flags),
            RecvEvent::Closed => break,
        };
        if flags & FRAME_CLOSE != 0 {
            break;
        }
        match classify_frame(&payload) {
            FrameClass::CancelTiles if intercept_cancel => {
                queue.remove_if(is_prunable_tile);
                // Forwarded synchronously so in-flight renders are preempted
                // ahead of anything still queued.
                if !session.handle_input(&payload) {
                    break;
                }
            }
            FrameClass::LargeFollowup(size) => match channel.receive_large(size) {
                Ok(RecvEvent::Frame { payload, flags }) if flags & FRAME_CLOSE == 0 => {
                    queue.put(payload)
                }
                Ok(_) => break,
                Err(err) => {
                    error!("{} session large frame error: {err}", session.polarity);
                    break;
                }
            },
            _ => queue.put(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::framing::{MessageChannel, RecvEvent};
    use std::net::{TcpListener, TcpStream};

    fn channel_pair() -> (MessageChannel, MessageChannel) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let join = thread::spawn(move || listener.accept().unwrap().0);
        let client = TcpStream::connect(addr).unwrap();
        let server = join.join().unwrap();
        (
            MessageChannel::new(client).unwrap(),
            MessageChannel::new(server).unwrap(),
        )
    }

    #[test]
    fn client_session_forwards_to_the_prisoner_writer() {
        let pairing = Arc::new(PairingTable::new());
        let (master_end, mut child_end) = channel_pair();
        pairing.register_prisoner(11, master_end.writer());
        let session = MasterSession {
            polarity: Polarity::ToClient,
            child_id: 11,
            pairing: pairing.clone(),
        };
        assert!(session.handle_input(b"tile part=0 x=0 y=0 width=256 height=256"));
        match child_end.receive().unwrap() {
            RecvEvent::Frame { payload, .. } => assert!(payload.starts_with(b"tile ")),
            RecvEvent::Closed => panic!("unexpected close"),
        }
    }

    #[test]
    fn prisoner_session_drops_traffic_until_paired() {
        let pairing = Arc::new(PairingTable::new());
        let (master_end, _child_end) = channel_pair();
        pairing.register_prisoner(13, master_end.writer());
        let session = MasterSession {
            polarity: Polarity::ToPrisoner,
            child_id: 13,
            pairing,
        };
        // No client attached yet: dropped, session stays up.
        assert!(session.handle_input(b"status ok"));
    }

    #[test]
    fn client_session_closes_once_the_pair_is_gone() {
        let pairing = Arc::new(PairingTable::new());
        let session = MasterSession {
            polarity: Polarity::ToClient,
            child_id: 17,
            pairing,
        };
        assert!(!session.handle_input(b"key type=input char=97 key=0"));
    }
}
