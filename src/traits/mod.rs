//! Trait definitions for the transport and the outbound controllers.
//!
//! These are the two seams of the crate:
//!
//! - `io`: the [`IoHandler`] transport contract the kernel drives
//!   (hardware serial bridge, TCP, or simulation)
//! - `controllers`: the narrow interfaces bus observations are dispatched
//!   to, plus the shared value types ([`TriState`], [`Direction`],
//!   [`DecoderState`])
//!
//! Everything here is implementable on the desktop without hardware; see
//! [`crate::hal`] for the bundled implementations.

pub mod controllers;
pub mod io;

pub use controllers::*;
pub use io::*;
