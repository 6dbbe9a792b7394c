//! Session endpoints and routing.
//!
//! Every session runs two schedulers: a receiver that blocks on the framed
//! channel and either acts immediately or enqueues, and a consumer that
//! drains the work queue into `handle_input`. They exchange work only through
//! the queue, plus the synchronous `canceltiles` forward on the master side.

pub mod child;
pub mod master;
pub mod pairing;

use crate::protocol::{first_line, tokenize, token_u64, CMD_CANCEL_TILES, CMD_NEXT_MESSAGE};
use crate::queue::{MessageQueue, EOF_SENTINEL};
use std::fmt;

/// Which end of the broker a session endpoint faces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Polarity {
    /// Master side, facing a browser-like client.
    ToClient,
    /// Master side, facing a child process.
    ToPrisoner,
    /// Child side, facing the master.
    ToChild,
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Polarity::ToClient => write!(f, "client"),
            Polarity::ToPrisoner => write!(f, "prisoner"),
            Polarity::ToChild => write!(f, "child"),
        }
    }
}

/// What the receiver should do with one inbound frame.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameClass {
    /// A lone `canceltiles` line: prune the queue, then (master side)
    /// forward synchronously past the queue.
    CancelTiles,
    /// `nextmessage: size=N`: the next frame carries N bytes and bypasses
    /// the default receive window.
    LargeFollowup(usize),
    /// Everything else: enqueue for the consumer.
    Deliver,
}

/// Classify a frame payload. `canceltiles` only counts when the frame is a
/// single line with exactly that one token.
pub fn classify_frame(payload: &[u8]) -> FrameClass {
    let line = first_line(payload);
    let text = String::from_utf8_lossy(line);
    let tokens = tokenize(&text);
    if line.len() == payload.len() && tokens.len() == 1 && tokens[0] == CMD_CANCEL_TILES {
        return FrameClass::CancelTiles;
    }
    if tokens.len() == 2 && tokens[0] == CMD_NEXT_MESSAGE {
        if let Some(size) = token_u64(tokens[1], "size").filter(|size| *size > 0) {
            return FrameClass::LargeFollowup(size as usize);
        }
    }
    FrameClass::Deliver
}

/// Drain the queue into `handle` until the `eof` sentinel or until the
/// handler asks for the session to close.
pub fn run_consumer<F: FnMut(&[u8]) -> bool>(queue: &MessageQueue, mut handle: F) {
    loop {
        let message = queue.get();
        if message == EOF_SENTINEL {
            break;
        }
        if !handle(&message) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::is_prunable_tile;

    #[test]
    fn lone_canceltiles_is_the_fast_path() {
        assert_eq!(classify_frame(b"canceltiles"), FrameClass::CancelTiles);
    }

    #[test]
    fn multi_line_canceltiles_is_not_intercepted() {
        assert_eq!(classify_frame(b"canceltiles\nextra"), FrameClass::Deliver);
        assert_eq!(classify_frame(b"canceltiles now"), FrameClass::Deliver);
    }

    #[test]
    fn nextmessage_announces_the_followup_size() {
        assert_eq!(
            classify_frame(b"nextmessage: size=123456"),
            FrameClass::LargeFollowup(123_456)
        );
        assert_eq!(classify_frame(b"nextmessage: size=0"), FrameClass::Deliver);
        assert_eq!(classify_frame(b"nextmessage: bytes=5"), FrameClass::Deliver);
    }

    #[test]
    fn ordinary_commands_are_delivered() {
        assert_eq!(classify_frame(b"tile part=0 x=0 y=0"), FrameClass::Deliver);
        assert_eq!(classify_frame(b"load url=file:///d.odt"), FrameClass::Deliver);
    }

    #[test]
    fn cancel_prunes_only_unidentified_tiles() {
        let queue = MessageQueue::new();
        queue.put(b"tile part=0 x=0 y=0 width=256 height=256".to_vec());
        queue.put(b"tile part=0 x=256 y=0 width=256 height=256".to_vec());
        queue.put(b"tile part=0 x=0 y=0 width=256 height=256 id=7".to_vec());
        queue.put(b"key type=input char=97 key=0".to_vec());
        queue.remove_if(is_prunable_tile);
        assert_eq!(queue.len(), 2);
        assert!(queue.get().ends_with(b"id=7"));
        assert!(queue.get().starts_with(b"key "));
    }

    #[test]
    fn consumer_stops_at_eof_after_draining() {
        let queue = MessageQueue::new();
        queue.put(b"one".to_vec());
        queue.put(b"two".to_vec());
        queue.put(crate::queue::EOF_SENTINEL.to_vec());
        let mut seen = Vec::new();
        run_consumer(&queue, |message| {
            seen.push(message.to_vec());
            true
        });
        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn consumer_stops_when_the_handler_declines() {
        let queue = MessageQueue::new();
        queue.put(b"one".to_vec());
        queue.put(b"two".to_vec());
        let mut seen = 0;
        run_consumer(&queue, |_| {
            seen += 1;
            false
        });
        assert_eq!(seen, 1);
        assert_eq!(queue.len(), 1);
    }
}
