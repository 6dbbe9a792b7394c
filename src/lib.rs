//! docgate: a session broker for collaborative office-document editing
//! One master process accepts client connections on a public port; every
//! session is served by a pre-spawned child process that runs a document
//! engine inside a chroot jail and talks back to the master over an
//! internal framed channel.

pub mod cli;
pub mod config;
pub mod core;
pub mod kit;
pub mod protocol;
pub mod queue;
pub mod sandbox;
pub mod session;
pub mod startup_lock;
