//! Console front end
//!
//! - **keymapper**: crossterm key events to VT byte sequences
//! - **renderer**: draws the viewport snapshot and a status line

pub mod keymapper;
pub mod renderer;

pub use keymapper::{is_quit_key, KeyMapper, Modifiers};
pub use renderer::Renderer;
