//! File-transfer side channel.
//!
//! A loopback listener accepts newline-delimited `SRC DST` commands, links
//! (or copies) the file into place after creating the destination's parent
//! directories, and replies `OK` or an error text. One request is in flight
//! at a time across all connections.

use crate::config::types::Result;
use crate::config::FILE_PORT_NUMBER;
use crate::sandbox::jail::link_or_copy_file;
use log::{info, warn};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;

/// Bind the well-known loopback port and serve it on a background thread.
pub fn spawn_default() -> Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", FILE_PORT_NUMBER))?;
    thread::Builder::new()
        .name("filetransfer".to_string())
        .spawn(move || serve(listener))?;
    Ok(())
}

/// Accept loop; the listener is injectable so tests can bind an ephemeral
/// port.
pub fn serve(listener: TcpListener) {
    let in_flight = Arc::new(Mutex::new(()));
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let guard = in_flight.clone();
                thread::spawn(move || handle_connection(stream, guard));
            }
            Err(err) => warn!("file-transfer accept failed: {err}"),
        }
    }
}

fn handle_connection(stream: TcpStream, in_flight: Arc<Mutex<()>>) {
    let reader = match stream.try_clone() {
        Ok(clone) => BufReader::new(clone),
        Err(err) => {
            warn!("file-transfer stream clone failed: {err}");
            return;
        }
    };
    let mut writer = stream;
    for line in reader.lines() {
        let command = match line {
            Ok(command) => command,
            Err(_) => break,
        };
        let reply = {
            let _guard = in_flight.lock().unwrap_or_else(|e| e.into_inner());
            transfer_file(&command)
        };
        if writeln!(writer, "{reply}").is_err() {
            break;
        }
    }
}

/// Execute one `SRC DST` command and describe the outcome.
pub fn transfer_file(command: &str) -> String {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    if tokens.len() != 2 {
        return format!("source and destination are needed: {command}");
    }
    let source = Path::new(tokens[0]);
    let target = Path::new(tokens[1]);

    if let Some(parent) = target.parent() {
        if let Err(err) = fs::create_dir_all(parent) {
            return err.to_string();
        }
    }

    info!("linking {} to {}", source.display(), target.display());
    match link_or_copy_file(source, target) {
        Ok(()) => "OK".to_string(),
        Err(err) => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfers_into_a_fresh_directory_tree() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("cache/tile.png");
        let target = root.path().join("jail/user/tile.png");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, b"png bytes").unwrap();

        let reply = transfer_file(&format!(
            "{} {}",
            source.display(),
            target.display()
        ));
        assert_eq!(reply, "OK");
        assert_eq!(fs::read(&target).unwrap(), b"png bytes");
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(transfer_file("only-one-path").contains("needed"));
        assert!(transfer_file("a b c").contains("needed"));
    }
}
