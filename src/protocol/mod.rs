//! Wire-protocol text helpers.
//!
//! Every frame's first line is a space-separated command followed by
//! `key=value` tokens; anything after the first newline is payload.

pub mod framing;
pub mod handshake;

/// Default receive window for a single frame. Larger payloads must be
/// announced with a `nextmessage: size=N` control frame first.
pub const MAX_FRAME_BYTES: usize = 100_000;

/// First frame a child sends after back-connecting: `child <ChildId>`.
pub const CMD_CHILD: &str = "child";
/// Client request to drop pending unidentified tile renders.
pub const CMD_CANCEL_TILES: &str = "canceltiles";
/// Tile render request; prunable by `canceltiles` iff it carries no `id=`.
pub const CMD_TILE: &str = "tile";
/// Announces an oversized follow-up frame: `nextmessage: size=N`.
pub const CMD_NEXT_MESSAGE: &str = "nextmessage:";

/// The bytes of a message up to (not including) the first newline.
pub fn first_line(message: &[u8]) -> &[u8] {
    match message.iter().position(|b| *b == b'\n') {
        Some(pos) => &message[..pos],
        None => message,
    }
}

/// The first line of a message as text, lossily decoded.
pub fn first_line_str(message: &[u8]) -> String {
    String::from_utf8_lossy(first_line(message)).into_owned()
}

/// Whitespace-separated tokens of a command line, empty tokens ignored.
pub fn tokenize(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

/// Parse a `name=value` token into its integer value.
pub fn token_u64(token: &str, name: &str) -> Option<u64> {
    let value = token.strip_prefix(name)?.strip_prefix('=')?;
    value.parse().ok()
}

/// Find the value of the `name=value` token in a token list.
pub fn token_value<'a>(tokens: &[&'a str], name: &str) -> Option<&'a str> {
    tokens
        .iter()
        .find_map(|token| token.strip_prefix(name).and_then(|rest| rest.strip_prefix('=')))
}

/// Whether a queued message is a tile request that `canceltiles` may drop:
/// first token `tile`, no `id=` anywhere in the first line.
pub fn is_prunable_tile(message: &[u8]) -> bool {
    let line = first_line_str(message);
    let mut tokens = line.split_whitespace();
    tokens.next() == Some(CMD_TILE) && !line.contains("id=")
}

/// Short rendering of a message for logs: the first line, truncated.
pub fn abbreviated(message: &[u8]) -> String {
    const LIMIT: usize = 120;
    let line = first_line_str(message);
    if line.len() <= LIMIT && line.len() == message.len() {
        line
    } else {
        let head: String = line.chars().take(LIMIT).collect();
        format!("{head}... ({} bytes)", message.len())
    }
}
