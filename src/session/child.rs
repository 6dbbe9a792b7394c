//! Child-side session endpoint.
//!
//! Translates protocol commands into document-kit calls and sends replies on
//! the channel. Structurally the same receiver/consumer split as the master
//! side, but `canceltiles` only prunes the local queue; the master already
//! forwarded it synchronously.

use crate::config::types::Result;
use crate::kit::{DocumentKit, KeyEvent, TileRequest};
use crate::protocol::framing::{
    ChannelWriter, MessageChannel, RecvEvent, FRAME_BINARY, FRAME_CLOSE,
};
use crate::protocol::{abbreviated, first_line, is_prunable_tile, tokenize, token_value, CMD_TILE};
use crate::queue::{MessageQueue, EOF_SENTINEL};
use crate::session::{classify_frame, run_consumer, FrameClass};
use log::{debug, error, warn};
use std::sync::Arc;
use std::thread;

/// The ToChild endpoint: owns the document kit for this process.
pub struct ChildSession {
    kit: Box<dyn DocumentKit>,
    writer: ChannelWriter,
}

impl ChildSession {
    pub fn new(kit: Box<dyn DocumentKit>, writer: ChannelWriter) -> Self {
        Self { kit, writer }
    }

    /// Handle one dequeued message. Returns false when the session should end.
    pub fn handle_input(&mut self, message: &[u8]) -> bool {
        let line = String::from_utf8_lossy(first_line(message)).into_owned();
        let tokens = tokenize(&line);
        let command = match tokens.first() {
            Some(command) => *command,
            None => {
                warn!("ignoring empty command line");
                return true;
            }
        };
        let outcome = match command {
            CMD_TILE => self.render_tile(&line, &tokens),
            "key" => KeyEvent::parse(&tokens[1..]).and_then(|event| self.kit.keystroke(&event)),
            "load" => match token_value(&tokens[1..], "url") {
                Some(url) => self.kit.open_document(url),
                None => {
                    error!("load command is missing url=");
                    return false;
                }
            },
            "canceltiles" => Ok(()), // queue was already pruned by the receiver
            // The document is closed by `finish` once the consumer drains.
            "disconnect" => return false,
            _ => self.forward_to_kit(message),
        };
        match outcome {
            Ok(()) => true,
            Err(err) => {
                error!("handling '{}' failed: {err}", abbreviated(message));
                false
            }
        }
    }

    fn render_tile(&mut self, line: &str, tokens: &[&str]) -> Result<()> {
        let request = TileRequest::parse(&tokens[1..])?;
        let pixels = self.kit.render_tile(&request)?;
        debug!("rendered tile {line} ({} bytes)", pixels.len());
        let mut reply = Vec::with_capacity(line.len() + 1 + pixels.len());
        reply.extend_from_slice(line.as_bytes());
        reply.push(b'\n');
        reply.extend_from_slice(&pixels);
        self.writer.send_message(&reply, FRAME_BINARY)
    }

    fn forward_to_kit(&mut self, message: &[u8]) -> Result<()> {
        if let Some(reply) = self.kit.dispatch(message)? {
            self.writer.send_message(&reply, FRAME_BINARY)?;
        }
        Ok(())
    }

    /// Close the document when the session winds down.
    pub fn finish(&mut self) {
        self.kit.close_document();
    }
}

/// Run the child's receiver and consumer until the master hangs up.
pub fn serve(mut channel: MessageChannel, kit: Box<dyn DocumentKit>) {
    let writer = channel.writer();
    let queue = Arc::new(MessageQueue::new());
    let consumer = {
        let queue = queue.clone();
        let writer = writer.clone();
        thread::spawn(move || {
            let mut session = ChildSession::new(kit, writer.clone());
            run_consumer(&queue, |message| session.handle_input(message));
            session.finish();
            writer.shutdown();
        })
    };

    loop {
        let event = match channel.receive() {
            Ok(event) => event,
            Err(err) => {
                error!("child channel error: {err}");
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
            FrameClass::CancelTiles => queue.remove_if(is_prunable_tile),
            FrameClass::LargeFollowup(size) => match channel.receive_large(size) {
                Ok(RecvEvent::Frame { payload, flags }) if flags & FRAME_CLOSE == 0 => {
                    queue.put(payload)
                }
                Ok(_) => break,
                Err(err) => {
                    error!("child large frame error: {err}");
                    break;
                }
            },
            FrameClass::Deliver => queue.put(payload),
        }
    }

    queue.clear();
    queue.put(EOF_SENTINEL.to_vec());
    let _ = consumer.join();
}
