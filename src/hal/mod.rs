//! Concrete I/O handlers.
//!
//! - [`SimIoHandler`]: simulated bus (echoes, optional command-station
//!   emulation) for tests and offline development
//! - [`TcpIoHandler`] (`std` feature): LocoNet-over-TCP bridges
//!
//! Hardware serial adapters implement [`crate::traits::IoHandler`] the
//! same way; the kernel is transport-agnostic.

pub mod sim;

#[cfg(feature = "std")]
pub mod tcp;

pub use sim::SimIoHandler;

#[cfg(feature = "std")]
pub use tcp::TcpIoHandler;
