//! Privilege drop after the jail is entered.
//!
//! chroot plus this drop is the isolation boundary; no syscall filtering is
//! assumed beyond it.

use crate::config::types::{GatewayError, Result};
use log::{error, info};
use nix::unistd::{geteuid, getuid, setuid, Uid, User};

#[cfg(target_os = "linux")]
const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;
#[cfg(target_os = "linux")]
const CAP_SYS_CHROOT: u32 = 18;

#[cfg(target_os = "linux")]
#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: libc::c_int,
}

#[cfg(target_os = "linux")]
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// Clear CAP_SYS_CHROOT from the effective and permitted sets, so the child
/// cannot escape its jail with a second chroot.
#[cfg(target_os = "linux")]
fn clear_chroot_capability() -> Result<()> {
    // The v3 layout carries two data words; CAP_SYS_CHROOT (18) lives in the
    // first.
    let mut header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let mut data = [CapUserData::default(); 2];

    let rc = unsafe {
        libc::syscall(
            libc::SYS_capget,
            &mut header as *mut CapUserHeader,
            data.as_mut_ptr(),
        )
    };
    if rc != 0 {
        return Err(GatewayError::Privilege(format!(
            "capget failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let mask = !(1u32 << CAP_SYS_CHROOT);
    data[0].effective &= mask;
    data[0].permitted &= mask;

    let rc = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &mut header as *mut CapUserHeader,
            data.as_ptr(),
        )
    };
    if rc != 0 {
        return Err(GatewayError::Privilege(format!(
            "capset failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    info!("dropped CAP_SYS_CHROOT from the effective and permitted sets");
    Ok(())
}

/// Drop the chroot privilege. On Linux the capability is cleared; elsewhere
/// (and for setuid-root installs) the effective uid falls back to the real
/// uid. A debug build still fully root (running under sudo, most likely being
/// debugged) sheds superuser rights to `debug_uid`, the `nobody` account, or
/// uid 65534.
pub fn drop_chroot_capability(debug_uid: Option<u32>) -> Result<()> {
    #[cfg(target_os = "linux")]
    clear_chroot_capability()?;

    if geteuid().is_root() && !getuid().is_root() {
        setuid(getuid())
            .map_err(|e| GatewayError::Privilege(format!("setuid({}) failed: {e}", getuid())))?;
    }

    if cfg!(debug_assertions) && geteuid().is_root() && getuid().is_root() {
        let uid = debug_uid
            .map(Uid::from_raw)
            .unwrap_or_else(fallback_unprivileged_uid);
        if let Err(err) = setuid(uid) {
            error!("setuid({uid}) failed: {err}");
        }
    }

    Ok(())
}

fn fallback_unprivileged_uid() -> Uid {
    match User::from_name("nobody") {
        Ok(Some(user)) => user.uid,
        _ => Uid::from_raw(65534),
    }
}
