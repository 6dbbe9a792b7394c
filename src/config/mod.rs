//! Gateway configuration and the well-known ports, paths and names shared
//! between the master and its children.

pub mod types;

use serde::Serialize;
use std::path::PathBuf;

/// Default public port clients connect to.
pub const DEFAULT_CLIENT_PORT_NUMBER: u16 = 9980;
/// Loopback port the master listens on for child back-connections.
pub const MASTER_PORT_NUMBER: u16 = 9981;
/// Loopback port for the file-transfer side channel.
pub const FILE_PORT_NUMBER: u16 = 9982;
/// Request URI a child uses when back-connecting to the master.
pub const CHILD_URI: &str = "/loolws/child/";
/// Name of the inter-process lock that orders master and child startup.
pub const STARTUP_LOCK_NAME: &str = "loolwsd";
/// Environment variable that pauses a child before its main loop.
pub const SLEEP_FOR_DEBUGGER_ENV: &str = "SLEEPFORDEBUGGER";

/// Settings resolved from the command line, shared by the master process and
/// inherited by every forked child.
#[derive(Clone, Debug, Serialize)]
pub struct GatewayConfig {
    /// Public port to listen on; must not equal `MASTER_PORT_NUMBER`.
    pub port: u16,
    /// Persistent tile cache directory; must be accessible at startup.
    pub cache_dir: PathBuf,
    /// Template tree with shared libraries etc, replicated into each jail.
    pub sys_template: PathBuf,
    /// Document-engine installation tree, replicated under `lo_subpath`.
    pub lo_template: PathBuf,
    /// Parent directory of all jails.
    pub child_root: PathBuf,
    /// Relative path of the engine replica inside a jail.
    pub lo_subpath: String,
    /// Number of children kept forked in advance.
    pub num_prespawn: usize,
    /// Interactive testing mode; forces the pool size to one.
    pub interactive_test: bool,
    /// Uid to assume when debugging under sudo.
    pub debug_uid: Option<u32>,
}
