//! Pairing of client-facing and child-facing sessions.
//!
//! Sessions never reference each other directly: each side holds only the
//! ChildId and resolves its peer through this table, so there is no ownership
//! cycle to break on teardown. Writers are cloned out before any send; no
//! lock is held across a channel write.

use crate::config::types::{ChildId, GatewayError, Result};
use crate::protocol::framing::ChannelWriter;
use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct PairEntry {
    prisoner: ChannelWriter,
    client: Option<ChannelWriter>,
}

#[derive(Default)]
struct PairingState {
    /// Connected children not yet assigned to a client, oldest first.
    ready: VecDeque<ChildId>,
    pairs: HashMap<ChildId, PairEntry>,
}

/// Registry of connected children and their client assignments.
pub struct PairingTable {
    state: Mutex<PairingState>,
    available: Condvar,
}

impl PairingTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PairingState::default()),
            available: Condvar::new(),
        }
    }

    /// A child back-connected and claimed its identity.
    pub fn register_prisoner(&self, child_id: ChildId, writer: ChannelWriter) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pairs.insert(
            child_id,
            PairEntry {
                prisoner: writer,
                client: None,
            },
        );
        state.ready.push_back(child_id);
        self.available.notify_one();
    }

    /// Take the oldest unassigned child, waiting up to `timeout` for the
    /// supervisor to connect one.
    pub fn claim(&self, timeout: Duration) -> Result<ChildId> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(child_id) = state.ready.pop_front() {
                return Ok(child_id);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GatewayError::Process(
                    "no child session became available".to_string(),
                ));
            }
            let (guard, _timeout_result) = self
                .available
                .wait_timeout(state, remaining)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    /// Attach the client writer to a claimed child. False when the child
    /// disappeared between claim and attach.
    pub fn attach_client(&self, child_id: ChildId, writer: ChannelWriter) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.pairs.get_mut(&child_id) {
            Some(entry) => {
                entry.client = Some(writer);
                true
            }
            None => false,
        }
    }

    pub fn prisoner_writer(&self, child_id: ChildId) -> Option<ChannelWriter> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pairs.get(&child_id).map(|entry| entry.prisoner.clone())
    }

    pub fn client_writer(&self, child_id: ChildId) -> Option<ChannelWriter> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .pairs
            .get(&child_id)
            .and_then(|entry| entry.client.clone())
    }

    /// The client side closed: detach it and close the child's channel so the
    /// child exits and is replaced by the reaper.
    pub fn release_client(&self, child_id: ChildId) {
        let prisoner = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match state.pairs.get_mut(&child_id) {
                Some(entry) => {
                    entry.client = None;
                    Some(entry.prisoner.clone())
                }
                None => None,
            }
        };
        if let Some(writer) = prisoner {
            writer.close();
        }
    }

    /// The child's channel closed: drop the pair and close the client side.
    pub fn remove_prisoner(&self, child_id: ChildId) {
        let client = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.ready.retain(|id| *id != child_id);
            state.pairs.remove(&child_id).and_then(|entry| entry.client)
        };
        if let Some(writer) = client {
            writer.close();
        }
    }

    /// Count of connected children not currently assigned to a client.
    pub fn available_sessions(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ready
            .len()
    }
}

impl Default for PairingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::framing::MessageChannel;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn writer_pair() -> (ChannelWriter, MessageChannel) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let join = thread::spawn(move || listener.accept().unwrap().0);
        let client = TcpStream::connect(addr).unwrap();
        let server = join.join().unwrap();
        let near = MessageChannel::new(client).unwrap();
        let far = MessageChannel::new(server).unwrap();
        (near.writer(), far)
    }

    #[test]
    fn claims_children_oldest_first() {
        let table = PairingTable::new();
        let (w1, _c1) = writer_pair();
        let (w2, _c2) = writer_pair();
        table.register_prisoner(3, w1);
        table.register_prisoner(5, w2);
        assert_eq!(table.available_sessions(), 2);
        assert_eq!(table.claim(Duration::from_millis(10)).unwrap(), 3);
        assert_eq!(table.claim(Duration::from_millis(10)).unwrap(), 5);
        assert_eq!(table.available_sessions(), 0);
    }

    #[test]
    fn claim_times_out_when_no_child_arrives() {
        let table = PairingTable::new();
        assert!(table.claim(Duration::from_millis(20)).is_err());
    }

    #[test]
    fn attach_fails_after_the_prisoner_is_removed() {
        let table = PairingTable::new();
        let (prisoner, _far) = writer_pair();
        let (client, _far2) = writer_pair();
        table.register_prisoner(7, prisoner);
        let id = table.claim(Duration::from_millis(10)).unwrap();
        table.remove_prisoner(id);
        assert!(!table.attach_client(id, client));
    }

    #[test]
    fn writers_resolve_only_while_paired() {
        let table = PairingTable::new();
        let (prisoner, _far) = writer_pair();
        let (client, _far2) = writer_pair();
        table.register_prisoner(9, prisoner);
        assert!(table.prisoner_writer(9).is_some());
        assert!(table.client_writer(9).is_none());
        assert!(table.attach_client(9, client));
        assert!(table.client_writer(9).is_some());
        table.release_client(9);
        assert!(table.client_writer(9).is_none());
        assert!(table.prisoner_writer(9).is_some());
    }
}
