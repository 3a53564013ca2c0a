#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(unused_qualifications)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

//! This crate implements a host-resident agent that finds the 3D printers
//! attached to (or reachable from) this machine, and keeps one session per
//! printer with a remote control service, relaying status, commands and
//! print jobs between the two.

pub mod agent;
pub mod config;
pub mod discover;
pub mod download;
pub mod drivers;
mod file;
pub mod identity;
pub mod login;
mod noop;
pub mod orchestrator;
pub mod profile;
pub mod server;
pub mod session;
pub mod storage;
mod traits;

pub use config::Config;
pub use file::TemporaryFile;
pub use identity::DeviceIdentity;
pub use noop::Noop;
pub use profile::DeviceProfile;
pub use traits::{Detector, Driver, DriverFactory, JobPayload, Temperatures};

/// Version reported to the remote service.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
