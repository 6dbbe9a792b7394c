//! Entry point of a forked child process.
//!
//! Sequence: build and enter the jail, drop the chroot privilege, initialize
//! the document kit, wait for the master's listeners, back-connect, claim an
//! identity, then serve the session until the master hangs up. A child never
//! unwinds into the master; every failure becomes an exit code.

use crate::config::types::{ChildId, EXIT_OK, EXIT_UNAVAILABLE};
use crate::config::{
    GatewayConfig, CHILD_URI, MASTER_PORT_NUMBER, SLEEP_FOR_DEBUGGER_ENV, STARTUP_LOCK_NAME,
};
use crate::kit;
use crate::protocol::framing::MessageChannel;
use crate::protocol::handshake;
use crate::sandbox::{capabilities, jail};
use crate::session::child as child_session;
use crate::startup_lock;
use log::{error, info, warn};
use std::net::TcpStream;
use std::path::Path;

pub fn child_main(config: &GatewayConfig, child_id: ChildId) -> i32 {
    info!("child {child_id} starting in pid {}", std::process::id());

    // Opened before chroot: the lock file lives in the host's temp dir.
    let startup_waiter = match startup_lock::Waiter::open(STARTUP_LOCK_NAME) {
        Ok(waiter) => Some(waiter),
        Err(err) => {
            warn!("startup lock unavailable: {err}");
            None
        }
    };

    let builder = jail::JailBuilder::new(config, child_id);
    let jail_path = match builder.build() {
        Ok(path) => path,
        Err(err) => {
            error!("jail construction failed: {err}");
            return EXIT_UNAVAILABLE;
        }
    };
    if let Err(err) = jail::enter(&jail_path) {
        error!("{err}");
        return EXIT_UNAVAILABLE;
    }
    if let Err(err) = capabilities::drop_chroot_capability(config.debug_uid) {
        error!("{err}");
        return EXIT_UNAVAILABLE;
    }

    sleep_for_debugger();

    let install_root = Path::new("/").join(&config.lo_subpath);
    let kit = match kit::bootstrap(&install_root) {
        Ok(kit) => kit,
        Err(err) => {
            error!("{err}");
            return EXIT_UNAVAILABLE;
        }
    };

    // The master holds the startup lock until it can accept back-connections.
    if let Some(waiter) = startup_waiter {
        if let Err(err) = waiter.wait() {
            warn!("startup lock wait failed: {err}");
        }
    }

    let mut stream = match TcpStream::connect(("127.0.0.1", MASTER_PORT_NUMBER)) {
        Ok(stream) => stream,
        Err(err) => {
            error!("back-connect to master failed: {err}");
            return EXIT_UNAVAILABLE;
        }
    };
    if let Err(err) = handshake::client_upgrade(&mut stream, CHILD_URI) {
        error!("child upgrade failed: {err}");
        return EXIT_UNAVAILABLE;
    }
    let channel = match MessageChannel::new(stream) {
        Ok(channel) => channel,
        Err(err) => {
            error!("{err}");
            return EXIT_UNAVAILABLE;
        }
    };
    if let Err(err) = channel.writer().send_text(&format!("child {child_id}")) {
        error!("identity claim failed: {err}");
        return EXIT_UNAVAILABLE;
    }

    child_session::serve(channel, kit);
    info!("child {child_id} finished");
    EXIT_OK
}

fn sleep_for_debugger() {
    if let Ok(value) = std::env::var(SLEEP_FOR_DEBUGGER_ENV) {
        match value.parse::<u64>() {
            Ok(seconds) => {
                info!(
                    "sleeping {seconds} seconds, attach process {} in a debugger now",
                    std::process::id()
                );
                std::thread::sleep(std::time::Duration::from_secs(seconds));
            }
            Err(_) => warn!("ignoring unparseable {SLEEP_FOR_DEBUGGER_ENV}={value}"),
        }
    }
}
