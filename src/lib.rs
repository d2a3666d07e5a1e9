//! tterm - terminal emulator core
//!
//! A VT100 screen buffer with serial, telnet, SSH, SFTP, netconf and local
//! process hosts, plus the blocking helpers scripts use to drive them.

pub mod config;
pub mod core;
pub mod ui;
