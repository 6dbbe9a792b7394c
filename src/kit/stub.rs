//! Placeholder document engine shipped with the broker.
//!
//! Renders deterministic filler tiles so the session plumbing can be driven
//! end to end without a real engine. Real engines implement `DocumentKit`
//! out of tree.

use super::{DocumentKit, KeyEvent, TileRequest};
use crate::config::types::{GatewayError, Result};
use crate::protocol::abbreviated;
use log::{debug, info};

pub struct StubKit {
    document: Option<String>,
    keystrokes: u64,
}

impl StubKit {
    pub fn new() -> Self {
        Self {
            document: None,
            keystrokes: 0,
        }
    }
}

impl Default for StubKit {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentKit for StubKit {
    fn open_document(&mut self, url: &str) -> Result<()> {
        if url.is_empty() {
            return Err(GatewayError::Kit("empty document url".to_string()));
        }
        info!("opening document {url}");
        self.document = Some(url.to_string());
        Ok(())
    }

    fn render_tile(&mut self, request: &TileRequest) -> Result<Vec<u8>> {
        if self.document.is_none() {
            return Err(GatewayError::Kit("no document loaded".to_string()));
        }
        // One byte per 8 pixels, seeded from the tile position so distinct
        // tiles render distinct payloads.
        let len = ((request.width as usize * request.height as usize) / 8).max(1);
        let seed = (request.part ^ request.x ^ request.y) as u8;
        Ok((0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect())
    }

    fn keystroke(&mut self, event: &KeyEvent) -> Result<()> {
        if self.document.is_none() {
            return Err(GatewayError::Kit("no document loaded".to_string()));
        }
        self.keystrokes += 1;
        debug!(
            "keystroke {} type={} char={} key={}",
            self.keystrokes, event.kind, event.char_code, event.key_code
        );
        Ok(())
    }

    fn dispatch(&mut self, message: &[u8]) -> Result<Option<Vec<u8>>> {
        debug!("ignoring engine command: {}", abbreviated(message));
        Ok(None)
    }

    fn close_document(&mut self) {
        if let Some(url) = self.document.take() {
            info!("closing document {url} after {} keystrokes", self.keystrokes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(x: u32, y: u32) -> TileRequest {
        TileRequest {
            part: 0,
            x,
            y,
            width: 256,
            height: 256,
            id: None,
        }
    }

    #[test]
    fn rendering_requires_an_open_document() {
        let mut kit = StubKit::new();
        assert!(kit.render_tile(&tile(0, 0)).is_err());
        kit.open_document("file:///doc.odt").unwrap();
        let pixels = kit.render_tile(&tile(0, 0)).unwrap();
        assert_eq!(pixels.len(), 256 * 256 / 8);
    }

    #[test]
    fn tiles_are_deterministic_and_position_dependent() {
        let mut kit = StubKit::new();
        kit.open_document("file:///doc.odt").unwrap();
        let first = kit.render_tile(&tile(0, 0)).unwrap();
        let again = kit.render_tile(&tile(0, 0)).unwrap();
        let other = kit.render_tile(&tile(256, 0)).unwrap();
        assert_eq!(first, again);
        assert_ne!(first, other);
    }
}
