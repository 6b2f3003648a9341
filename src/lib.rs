//! sstun - personal split-tunnel VPN session manager
//!
//! Wraps two external binaries into one supervised VPN session: `sslocal`
//! (the Shadowsocks relay client, exposing a local SOCKS proxy) and
//! `tun2socks` (forwarding packets between a TUN interface and that proxy).
//! The crate owns the session lifecycle: descriptor parsing, child process
//! supervision, kernel network configuration, and guaranteed cleanup so a
//! crash or interrupt at any stage leaves the host network as it was.
//!
//! # Architecture
//!
//! - `config`: layered settings resolution (env over TOML file over defaults)
//! - `descriptor`: `ss://` connection URI parsing
//! - `process`: child spawning, liveness polling, termination, port reaping
//! - `net`: TUN interface and split-tunnel route management
//! - `session`: the orchestrating state machine, status probe, and stop
//! - `state`: persisted session record for cross-invocation cleanup
//! - `install`: portable download of the two external binaries
//!
//! # Usage
//!
//! ```bash
//! SS_URL='ss://...' sstun start
//! sstun status
//! sstun stop
//! ```

pub mod config;
pub mod descriptor;
pub mod install;
pub mod net;
pub mod process;
pub mod session;
pub mod state;

pub use config::SessionConfig;
pub use descriptor::ConnectionDescriptor;
pub use session::{Session, SessionError, SessionState, StatusReport, probe_status, stop};
pub use state::SessionRecord;
