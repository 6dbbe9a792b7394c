//! Interface to the embedded document engine.
//!
//! The engine itself is an external collaborator; the broker only consumes
//! the operations below, always from inside a child process after chroot.

pub mod stub;

use crate::config::types::{GatewayError, Result};
use crate::protocol::token_value;
use std::path::Path;

/// One tile render request parsed from a `tile ...` command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileRequest {
    pub part: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Requests carrying an id are exempt from `canceltiles` pruning.
    pub id: Option<String>,
}

impl TileRequest {
    /// Parse the tokens of a `tile part=.. x=.. y=.. width=.. height=..
    /// [id=..]` line; the leading `tile` token must already be verified.
    pub fn parse(tokens: &[&str]) -> Result<Self> {
        fn required(tokens: &[&str], name: &str) -> Result<u32> {
            token_value(tokens, name)
                .and_then(|value| value.parse().ok())
                .ok_or_else(|| {
                    GatewayError::Protocol(format!("tile request is missing {name}="))
                })
        }
        Ok(Self {
            part: required(tokens, "part")?,
            x: required(tokens, "x")?,
            y: required(tokens, "y")?,
            width: required(tokens, "width")?,
            height: required(tokens, "height")?,
            id: token_value(tokens, "id").map(str::to_string),
        })
    }
}

/// One keystroke parsed from a `key type=.. char=.. key=..` command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyEvent {
    pub kind: String,
    pub char_code: u32,
    pub key_code: u32,
}

impl KeyEvent {
    pub fn parse(tokens: &[&str]) -> Result<Self> {
        let kind = token_value(tokens, "type")
            .ok_or_else(|| GatewayError::Protocol("key event is missing type=".to_string()))?;
        let char_code = token_value(tokens, "char")
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| GatewayError::Protocol("key event is missing char=".to_string()))?;
        let key_code = token_value(tokens, "key")
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| GatewayError::Protocol("key event is missing key=".to_string()))?;
        Ok(Self {
            kind: kind.to_string(),
            char_code,
            key_code,
        })
    }
}

/// The document engine as seen by a child session.
pub trait DocumentKit: Send {
    fn open_document(&mut self, url: &str) -> Result<()>;
    fn render_tile(&mut self, request: &TileRequest) -> Result<Vec<u8>>;
    fn keystroke(&mut self, event: &KeyEvent) -> Result<()>;
    /// Commands the broker treats as opaque, delivered whole (first line is
    /// the command, any remainder is payload); an optional reply is sent back.
    fn dispatch(&mut self, message: &[u8]) -> Result<Option<Vec<u8>>>;
    fn close_document(&mut self);
}

/// Initialize the engine from its (post-chroot) installation root.
/// Failure here is startup-fatal for the child.
pub fn bootstrap(install_root: &Path) -> Result<Box<dyn DocumentKit>> {
    let program_dir = install_root.join("program");
    if !program_dir.is_dir() {
        return Err(GatewayError::Kit(format!(
            "document engine installation missing at {}",
            program_dir.display()
        )));
    }
    log::info!(
        "document kit initialised from {}",
        install_root.display()
    );
    Ok(Box::new(stub::StubKit::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_tile_request() {
        let tokens: Vec<&str> = "tile part=0 x=256 y=512 width=256 height=256 id=7"
            .split_whitespace()
            .collect();
        let request = TileRequest::parse(&tokens[1..]).unwrap();
        assert_eq!(request.part, 0);
        assert_eq!(request.x, 256);
        assert_eq!(request.y, 512);
        assert_eq!(request.id.as_deref(), Some("7"));
    }

    #[test]
    fn rejects_tile_requests_missing_dimensions() {
        let tokens: Vec<&str> = "tile part=0 x=0 y=0".split_whitespace().collect();
        assert!(TileRequest::parse(&tokens[1..]).is_err());
    }

    #[test]
    fn parses_key_events() {
        let tokens: Vec<&str> = "key type=input char=97 key=0".split_whitespace().collect();
        let event = KeyEvent::parse(&tokens[1..]).unwrap();
        assert_eq!(event.kind, "input");
        assert_eq!(event.char_code, 97);
        assert_eq!(event.key_code, 0);
    }
}
