//! Terminal core
//!
//! - **term**: screen buffer, VT100 interpreter, telnet negotiation
//! - **host**: the one active connection and its reader thread
//! - **ssh**: SSH session layer shared by shells, transfers and tunnels
//! - **script**: blocking helpers for scripted command/response
//! - **session**: terminal + host + script bridge, as seen by a front end
//! - **cmd**: the `!` command table
//! - **xmodem**: XMODEM upload over any transport
//!
//! ```text
//! Session
//! ├── Terminal (Arc<Mutex<_>>)
//! │   ├── ScreenBuffer
//! │   └── VtParser / telnet / xml
//! ├── Host ── reader thread ── Transport (serial, telnet, ssh, process)
//! └── ScriptBridge
//! ```

pub mod cmd;
pub mod host;
pub mod script;
pub mod session;
pub mod ssh;
pub mod term;
pub mod xmodem;
