//! # rs-loconet
//!
//! A LocoNet protocol kernel for model-railway control: framing codec,
//! priority transmit queues with the bus's echo/response handshake,
//! locomotive slot cache, input/output/identification dispatch, fast-clock
//! master, and LNCV module programming.
//!
//! ## Features
//!
//! - **Deterministic core**: every operation takes an explicit `now_ms`,
//!   so the whole protocol runs and tests on the desktop without threads,
//!   timers, or hardware
//! - **Echo discipline**: one frame in flight, confirmed by its bus echo,
//!   with separate echo and response timeouts
//! - **Three-level priority queueing**: emergency traffic preempts
//!   throttle traffic preempts background sync, FIFO within each level
//! - **Slot management**: on-demand slot acquisition with per-address
//!   queues for commands issued before the slot is known
//! - **Shadow state**: inputs, outputs, and functions are tri-state and
//!   only updated from confirmed bus traffic
//!
//! ## Architecture
//!
//! The crate is structured so everything interesting is testable without
//! hardware:
//!
//! - `message` / `codec` - frame type, opcode constructors, streaming decoder
//! - `queue` - per-priority byte-arena FIFOs
//! - `slots` - slot shadows, reverse address index, pending queues
//! - `fastclock` / `lncv` / `config` - fast clock, LNCV dialog, configuration
//! - `traits` - transport and controller seams
//! - `kernel` - the protocol state machine tying it all together
//! - `service` - `std` worker thread with a post-from-any-thread mailbox
//! - `hal` - simulator and TCP transports
//!
//! ## Example
//!
//! ```rust
//! use rs_loconet::hal::SimIoHandler;
//! use rs_loconet::kernel::Kernel;
//! use rs_loconet::{Config, TriState};
//!
//! // A kernel driving a simulated command station.
//! let sim = SimIoHandler::new().with_command_station();
//! let mut kernel = Kernel::new(Config::default(), sim);
//! kernel.start(0).unwrap();
//!
//! // Switch an accessory; the echo confirms it into the shadow.
//! kernel.set_output(1, true, 0);
//! kernel.poll(1);
//! assert_eq!(kernel.output_value(1), TriState::True);
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]

extern crate alloc;

/// Streaming receive decoder with framing/checksum recovery.
pub mod codec;
/// Kernel configuration snapshot and builder.
pub mod config;
/// Fast-clock value and shared atomic cell.
pub mod fastclock;
/// Bundled I/O handlers (simulator, TCP).
pub mod hal;
/// The protocol kernel: handshake, timers, dispatch.
pub mod kernel;
/// LNCV module-programming dialog.
pub mod lncv;
/// Frame type, opcodes, and per-opcode constructors.
pub mod message;
/// Per-priority transmit FIFOs.
pub mod queue;
/// Locomotive slot cache.
pub mod slots;
/// Transport and controller traits.
pub mod traits;

/// Worker-thread runner with a post-from-any-thread mailbox.
#[cfg(feature = "std")]
pub mod service;

// Re-exports for convenience
pub use codec::{Decoded, DecodeError, FrameDecoder};
pub use config::Config;
pub use fastclock::{FastClock, FastClockCell};
pub use kernel::{Kernel, KernelStats};
pub use lncv::{LncvFrame, LncvState};
pub use message::Message;
pub use queue::{Priority, PrioritySendQueue, SendQueue};
pub use slots::{LocoSlot, SlotTable};
pub use traits::{
    DecoderChangeFlags,
    DecoderController,
    DecoderState,
    Direction,
    IdentificationController,
    InputController,
    IoError,
    IoHandler,
    OutputController,
    TriState,
    FUNCTION_COUNT,
};

#[cfg(feature = "std")]
pub use service::KernelRunner;
