//! Master listeners and gateway lifecycle.
//!
//! Two listeners are bound while the startup lock is held: the public client
//! port and the loopback child port. Every accepted connection is upgraded
//! and served on its own thread; the accept thread doubles as the session's
//! receiver. The main thread then runs the reaper until the pool drains.

use crate::config::types::{Result, EXIT_OK};
use crate::config::{GatewayConfig, CHILD_URI, MASTER_PORT_NUMBER, STARTUP_LOCK_NAME};
use crate::core::filetransfer;
use crate::core::supervisor::{Supervisor, SHUTDOWN_REQUESTED};
use crate::protocol::framing::{MessageChannel, RecvEvent, FRAME_CLOSE};
use crate::protocol::{abbreviated, handshake};
use crate::session::master::{run_client_session, run_prisoner_session};
use crate::session::pairing::PairingTable;
use crate::startup_lock::StartupLock;
use log::{error, info, warn};
use std::io::BufRead;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

extern "C" fn handle_termination(_signal: libc::c_int) {
    // Only async-signal-safe work here; the reaper polls the flag.
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, handle_termination as usize);
        libc::signal(libc::SIGINT, handle_termination as usize);
    }
}

/// Run the gateway to completion and return the process exit code.
pub fn run(config: GatewayConfig) -> Result<i32> {
    install_signal_handlers();

    if let Ok(snapshot) = serde_json::to_string(&config) {
        info!("effective configuration: {snapshot}");
    }

    let lock = StartupLock::acquire(STARTUP_LOCK_NAME)?;
    let pairing = Arc::new(PairingTable::new());
    let supervisor = Arc::new(Supervisor::new(config.clone()));

    supervisor.pre_spawn(config.num_prespawn)?;

    let public = TcpListener::bind(("0.0.0.0", config.port))?;
    let internal = TcpListener::bind(("127.0.0.1", MASTER_PORT_NUMBER))?;
    info!(
        "listening for clients on port {} and children on {MASTER_PORT_NUMBER}",
        config.port
    );
    filetransfer::spawn_default()?;

    spawn_accept_loop(public, false, supervisor.clone(), pairing.clone());
    spawn_accept_loop(internal, true, supervisor.clone(), pairing.clone());

    // Children block on this until the listeners can take their connections.
    lock.release();

    if config.interactive_test {
        let port = config.port;
        let supervisor = supervisor.clone();
        thread::spawn(move || {
            if let Err(err) = run_interactive(port) {
                error!("interactive session failed: {err}");
            }
            supervisor.request_shutdown();
        });
    }

    supervisor.reaper_loop();
    supervisor.terminate_children();
    Ok(EXIT_OK)
}

fn spawn_accept_loop(
    listener: TcpListener,
    internal: bool,
    supervisor: Arc<Supervisor>,
    pairing: Arc<PairingTable>,
) {
    let name = if internal { "accept-child" } else { "accept-client" };
    let _ = thread::Builder::new().name(name.to_string()).spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let supervisor = supervisor.clone();
                    let pairing = pairing.clone();
                    thread::spawn(move || {
                        handle_connection(stream, internal, supervisor, pairing)
                    });
                }
                Err(err) => warn!("accept failed: {err}"),
            }
        }
    });
}

fn handle_connection(
    mut stream: TcpStream,
    internal: bool,
    supervisor: Arc<Supervisor>,
    pairing: Arc<PairingTable>,
) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let request = match handshake::accept_upgrade(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            info!("rejected request from {peer}: {err}");
            return;
        }
    };
    let mut line = format!("request from {peer}: {}", request.request_line());
    for (name, value) in &request.headers {
        line.push_str(&format!(" / {name}: {value}"));
    }
    info!("{line}");

    let channel = match MessageChannel::new(stream) {
        Ok(channel) => channel,
        Err(err) => {
            error!("{err}");
            return;
        }
    };

    if internal && request.uri == CHILD_URI {
        run_prisoner_session(channel, supervisor, pairing);
    } else {
        run_client_session(channel, supervisor, pairing);
    }
}

/// Interactive testing: connect to our own public port, print everything the
/// gateway sends back, and forward stdin lines as frames until EOF.
fn run_interactive(port: u16) -> Result<()> {
    let mut stream = TcpStream::connect(("127.0.0.1", port))?;
    handshake::client_upgrade(&mut stream, "/ws")?;
    let mut channel = MessageChannel::new(stream)?;
    let writer = channel.writer();

    let printer = thread::spawn(move || loop {
        match channel.receive() {
            Ok(RecvEvent::Frame { payload, flags }) if flags & FRAME_CLOSE == 0 => {
                println!("got {} bytes: {}", payload.len(), abbreviated(&payload));
            }
            _ => break,
        }
    });

    if unsafe { libc::isatty(0) } == 1 {
        println!("Enter gateway requests, one per line. Enter EOF to finish.");
    }
    for line in std::io::stdin().lock().lines() {
        match line {
            Ok(line) => {
                if writer.send_text(&line).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }

    writer.close();
    let _ = printer.join();
    Ok(())
}
