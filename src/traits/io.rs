//! Transport abstraction for the LocoNet bus.
//!
//! The kernel drives exactly one [`IoHandler`]: a byte-oriented transport
//! (serial adapter, TCP bridge, or simulator) that frames incoming bytes
//! into complete, checksum-valid messages and writes outgoing frames to
//! the wire. Handlers run inside the kernel's event loop and must never
//! block; `recv` returns whatever complete frame is available *right now*
//! or `None`.
//!
//! Concrete implementations live in [`crate::hal`]:
//! [`SimIoHandler`](crate::hal::SimIoHandler) for tests and offline use,
//! and `TcpIoHandler` (with the `std` feature) for LocoNet-over-TCP
//! interfaces.

use crate::message::Message;

/// Error starting or driving a transport.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// The transport could not be opened.
    #[error("failed to open transport: {0}")]
    Open(&'static str),
    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,
    /// An OS-level I/O error.
    #[cfg(feature = "std")]
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Byte-oriented transport owned and driven by the kernel.
///
/// # Contract
///
/// - All methods are called from the kernel's event-loop thread only.
/// - `recv` is non-blocking and surfaces only complete frames that passed
///   checksum validation; framing and checksum errors are counted by the
///   handler's internal decoder and never reach the kernel.
/// - `send` returns `false` when the frame could not be handed to the
///   transport (the kernel logs and drops the message; the bus-level
///   echo discipline means a lost frame is never silently retried).
pub trait IoHandler {
    /// Open the transport. Called once from `start`.
    fn start(&mut self) -> Result<(), IoError>;

    /// Close the transport and release resources.
    fn stop(&mut self);

    /// Queue one frame for transmission.
    fn send(&mut self, message: &Message) -> bool;

    /// Return the next complete received frame, if any.
    fn recv(&mut self) -> Option<Message>;

    /// Drain the `(framing, checksum)` error counts accumulated by the
    /// handler's decoder since the last call.
    ///
    /// The default suits transports that cannot observe malformed
    /// frames (such as the simulator).
    fn take_decode_errors(&mut self) -> (u32, u32) {
        (0, 0)
    }
}
