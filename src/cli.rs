//! Command-line entry point for the master process.

use crate::config::types::{EXIT_UNAVAILABLE, EXIT_USAGE};
use crate::config::{GatewayConfig, DEFAULT_CLIENT_PORT_NUMBER, MASTER_PORT_NUMBER};
use anyhow::Context;
use clap::Parser;
use nix::unistd::{access, AccessFlags};
use std::path::PathBuf;

const DEFAULT_CACHE_DIR: &str = "/var/cache/docgate";

#[derive(Parser)]
#[command(
    name = "docgate",
    version,
    about = "Office-document gateway: one master, one sandboxed child per session"
)]
struct Cli {
    /// Port number to listen to; must not be the internal child port.
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Directory for the persistent tile cache.
    #[arg(long, value_name = "DIR")]
    cache: Option<PathBuf>,

    /// Template tree with shared libraries etc, used as source for the jails.
    #[arg(long, value_name = "DIR")]
    systemplate: Option<PathBuf>,

    /// Document-engine installation to be copied (linked) into the jails.
    /// Should be on the same file system as the system template.
    #[arg(long, value_name = "DIR")]
    lotemplate: Option<PathBuf>,

    /// Directory under which the jails are created. Should be on the same
    /// file system as both templates.
    #[arg(long, value_name = "DIR")]
    childroot: Option<PathBuf>,

    /// Relative path where the engine installation lands inside a jail.
    #[arg(long, value_name = "REL", default_value = "lo")]
    losubpath: String,

    /// Number of child processes to keep started in advance.
    #[arg(long, value_name = "N", default_value_t = 10)]
    numprespawns: usize,

    /// Interactive testing; forces the pool size to one.
    #[arg(long)]
    test: bool,

    /// For internal use only.
    #[arg(long, hide = true, value_name = "ID")]
    child: Option<u64>,

    /// For internal use only.
    #[arg(long, hide = true, value_name = "DIR")]
    jail: Option<PathBuf>,

    /// Uid to assume if running under sudo for debugging purposes.
    #[arg(long, hide = true, value_name = "UID")]
    uid: Option<u32>,
}

pub fn run() -> i32 {
    env_logger::init();
    let cli = Cli::parse();

    let cache_dir = cli
        .cache
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
    if let Err(err) = check_cache_dir(&cache_dir) {
        eprintln!("docgate: {err:#}");
        return EXIT_UNAVAILABLE;
    }

    let config = match validate(cli, cache_dir) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("docgate: {message}");
            return EXIT_USAGE;
        }
    };

    match crate::core::server::run(config) {
        Ok(code) => code,
        Err(err) => {
            log::error!("gateway failed: {err}");
            EXIT_UNAVAILABLE
        }
    }
}

fn check_cache_dir(cache_dir: &PathBuf) -> anyhow::Result<()> {
    access(
        cache_dir.as_path(),
        AccessFlags::R_OK | AccessFlags::W_OK | AccessFlags::X_OK,
    )
    .with_context(|| {
        format!(
            "unable to access {}, please make sure it exists and is writable",
            cache_dir.display()
        )
    })
}

fn validate(cli: Cli, cache_dir: PathBuf) -> Result<GatewayConfig, String> {
    let sys_template = cli
        .systemplate
        .ok_or_else(|| "missing required option --systemplate".to_string())?;
    let lo_template = cli
        .lotemplate
        .ok_or_else(|| "missing required option --lotemplate".to_string())?;
    let child_root = cli
        .childroot
        .ok_or_else(|| "missing required option --childroot".to_string())?;

    if cli.child.is_some() {
        return Err("option --child is for internal use only".to_string());
    }
    if cli.jail.is_some() {
        return Err("option --jail is for internal use only".to_string());
    }

    let port = cli.port.unwrap_or(DEFAULT_CLIENT_PORT_NUMBER);
    if port == MASTER_PORT_NUMBER {
        return Err(format!("--port must not be {MASTER_PORT_NUMBER}"));
    }

    let num_prespawn = if cli.test { 1 } else { cli.numprespawns };

    Ok(GatewayConfig {
        port,
        cache_dir,
        sys_template,
        lo_template,
        child_root,
        lo_subpath: cli.losubpath,
        num_prespawn,
        interactive_test: cli.test,
        debug_uid: cli.uid,
    })
}
