//! Master-process core: child supervision, listeners, and side channels.

pub mod childmain;
pub mod filetransfer;
pub mod server;
pub mod supervisor;
