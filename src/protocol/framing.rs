//! Framed message channel over a bidirectional byte stream.
//!
//! Frames are self-delimited by a five-byte header: one flags byte and a
//! big-endian u32 payload length. Explicit length framing is authoritative;
//! first-line parsing happens above this layer. Receives block indefinitely
//! until data or close.

use crate::config::types::{GatewayError, Result};
use crate::protocol::MAX_FRAME_BYTES;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex};

/// Text frame.
pub const FRAME_TEXT: u8 = 0x1;
/// Binary frame.
pub const FRAME_BINARY: u8 = 0x2;
/// Close flag; a frame carrying it (even zero-byte) ends the session.
pub const FRAME_CLOSE: u8 = 0x8;

const HEADER_LEN: usize = 5;

/// Outcome of one receive. Transport failures surface as `Err` and are
/// treated like `Closed` by every receiver.
#[derive(Debug)]
pub enum RecvEvent {
    Frame { payload: Vec<u8>, flags: u8 },
    Closed,
}

/// One end of a framed connection. The read half is owned by the session's
/// receiver; any number of `ChannelWriter` clones may send.
pub struct MessageChannel {
    reader: TcpStream,
    writer: ChannelWriter,
}

impl MessageChannel {
    pub fn new(stream: TcpStream) -> Result<Self> {
        let reader = stream
            .try_clone()
            .map_err(|e| GatewayError::Channel(format!("failed to clone stream: {e}")))?;
        Ok(Self {
            reader,
            writer: ChannelWriter {
                stream: Arc::new(Mutex::new(stream)),
            },
        })
    }

    /// A cloneable handle to the write half.
    pub fn writer(&self) -> ChannelWriter {
        self.writer.clone()
    }

    /// Blocking receive of one frame, capped at `MAX_FRAME_BYTES`.
    pub fn receive(&mut self) -> Result<RecvEvent> {
        self.receive_with_cap(MAX_FRAME_BYTES)
    }

    /// Blocking receive of one announced oversized frame of up to `size` bytes.
    pub fn receive_large(&mut self, size: usize) -> Result<RecvEvent> {
        self.receive_with_cap(size)
    }

    fn receive_with_cap(&mut self, cap: usize) -> Result<RecvEvent> {
        let mut header = [0u8; HEADER_LEN];
        if let Err(err) = self.reader.read_exact(&mut header) {
            return Self::end_of_stream(err);
        }
        let flags = header[0];
        let len = u32::from_be_bytes(header[1..HEADER_LEN].try_into().unwrap()) as usize;
        if len > cap {
            return Err(GatewayError::Channel(format!(
                "frame of {len} bytes exceeds the {cap}-byte receive window"
            )));
        }
        let mut payload = vec![0u8; len];
        if let Err(err) = self.reader.read_exact(&mut payload) {
            return Self::end_of_stream(err);
        }
        Ok(RecvEvent::Frame { payload, flags })
    }

    fn end_of_stream(err: std::io::Error) -> Result<RecvEvent> {
        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => Ok(RecvEvent::Closed),
            _ => Err(GatewayError::Channel(format!("receive failed: {err}"))),
        }
    }
}

/// The shared write half of a channel.
#[derive(Clone)]
pub struct ChannelWriter {
    stream: Arc<Mutex<TcpStream>>,
}

fn write_frame(stream: &mut TcpStream, payload: &[u8], flags: u8) -> Result<()> {
    let mut header = [0u8; HEADER_LEN];
    header[0] = flags;
    header[1..HEADER_LEN].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    stream.write_all(&header)?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

impl ChannelWriter {
    fn send_raw(&self, payload: &[u8], flags: u8) -> Result<()> {
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        write_frame(&mut stream, payload, flags)
    }

    /// Send one frame of at most `MAX_FRAME_BYTES`.
    pub fn send(&self, payload: &[u8], flags: u8) -> Result<()> {
        if payload.len() > MAX_FRAME_BYTES {
            return Err(GatewayError::Channel(format!(
                "frame of {} bytes exceeds the {MAX_FRAME_BYTES}-byte send limit",
                payload.len()
            )));
        }
        self.send_raw(payload, flags)
    }

    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send(text.as_bytes(), FRAME_TEXT)
    }

    /// Send a message of any size: oversized payloads are announced with a
    /// `nextmessage: size=N` control frame and then sent un-capped. The lock
    /// is held across both frames so another sender cannot slip in between
    /// the announce and its payload.
    pub fn send_message(&self, payload: &[u8], flags: u8) -> Result<()> {
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        if payload.len() > MAX_FRAME_BYTES {
            let announce = format!("nextmessage: size={}", payload.len());
            write_frame(&mut stream, announce.as_bytes(), FRAME_TEXT)?;
        }
        write_frame(&mut stream, payload, flags)
    }

    /// Signal end-of-stream to the peer and abort the socket.
    pub fn close(&self) {
        let _ = self.send_raw(&[], FRAME_CLOSE);
        self.shutdown();
    }

    /// Abort the socket in both directions, unblocking any receiver.
    pub fn shutdown(&self) {
        let stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        let _ = stream.shutdown(Shutdown::Both);
    }
}

/// Flags describing a forwarded payload: text when it decodes as UTF-8.
pub fn payload_flags(payload: &[u8]) -> u8 {
    if std::str::from_utf8(payload).is_ok() {
        FRAME_TEXT
    } else {
        FRAME_BINARY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn loopback_pair() -> (MessageChannel, MessageChannel) {
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
    fn round_trips_frames_up_to_the_cap() {
        let (a, mut b) = loopback_pair();
        let payload = vec![0x5au8; MAX_FRAME_BYTES];
        a.writer().send(&payload, FRAME_BINARY).unwrap();
        match b.receive().unwrap() {
            RecvEvent::Frame { payload: got, flags } => {
                assert_eq!(got, payload);
                assert_eq!(flags, FRAME_BINARY);
            }
            RecvEvent::Closed => panic!("unexpected close"),
        }
    }

    #[test]
    fn refuses_oversized_send_without_announce() {
        let (a, _b) = loopback_pair();
        let payload = vec![0u8; MAX_FRAME_BYTES + 1];
        assert!(a.writer().send(&payload, FRAME_BINARY).is_err());
    }

    #[test]
    fn announces_then_delivers_oversized_messages() {
        let (a, mut b) = loopback_pair();
        let payload: Vec<u8> = (0..123_456u32).map(|i| (i % 251) as u8).collect();
        let len = payload.len();
        a.writer().send_message(&payload, FRAME_BINARY).unwrap();

        let announce = match b.receive().unwrap() {
            RecvEvent::Frame { payload, .. } => String::from_utf8(payload).unwrap(),
            RecvEvent::Closed => panic!("unexpected close"),
        };
        assert_eq!(announce, format!("nextmessage: size={len}"));

        match b.receive_large(len).unwrap() {
            RecvEvent::Frame { payload: got, .. } => assert_eq!(got, payload),
            RecvEvent::Closed => panic!("unexpected close"),
        }
    }

    #[test]
    fn oversized_frame_without_announce_is_a_channel_error() {
        let (a, mut b) = loopback_pair();
        a.writer()
            .send_message(&vec![1u8; MAX_FRAME_BYTES + 1], FRAME_BINARY)
            .unwrap();
        // Skip the announce and read with the default window.
        match b.receive().unwrap() {
            RecvEvent::Frame { .. } => {}
            RecvEvent::Closed => panic!("unexpected close"),
        }
        assert!(b.receive().is_err());
    }

    #[test]
    fn close_frame_and_hangup_both_read_as_closed() {
        let (a, mut b) = loopback_pair();
        a.writer().close();
        match b.receive().unwrap() {
            RecvEvent::Frame { payload, flags } => {
                assert!(payload.is_empty());
                assert_ne!(flags & FRAME_CLOSE, 0);
            }
            RecvEvent::Closed => {}
        }
        // The socket is shut down afterwards.
        match b.receive() {
            Ok(RecvEvent::Closed) | Err(_) => {}
            Ok(RecvEvent::Frame { .. }) => panic!("frame after close"),
        }
    }
}
