//! Controller traits and the shared value types they exchange.
//!
//! The kernel never interprets what a decoder, sensor, or accessory *means*
//! for the layout — it forwards bus observations to narrow controller
//! interfaces and accepts commands keyed by plain addresses. This module
//! defines those interfaces and the value types flowing across them.
//!
//! # Key Traits
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`DecoderController`] | Receives locomotive state observed on the bus |
//! | [`InputController`] | Receives feedback/sensor changes |
//! | [`OutputController`] | Receives accessory/switch changes |
//! | [`IdentificationController`] | Receives transponder reports |
//!
//! Controllers are wired into the kernel only while it is stopped and are
//! invoked on the kernel's event-loop thread.
//!
//! # Tri-state values
//!
//! Inputs, outputs, and locomotive functions use [`TriState`] rather than
//! `bool`: until the bus has reported a value, the kernel genuinely does
//! not know it, and "unknown" is observable by callers.
//!
//! ```rust
//! use rs_loconet::TriState;
//!
//! let v = TriState::default();
//! assert_eq!(v, TriState::Undefined);
//! assert_eq!(v.as_bool(), None);
//! assert_eq!(TriState::from_bool(true).as_bool(), Some(true));
//! ```

use bitflags::bitflags;

/// Number of locomotive functions tracked per slot (F0..=F28).
pub const FUNCTION_COUNT: usize = 29;

/// Logical value with first-class "unknown".
///
/// Used for the input/output shadow arrays and for per-slot function
/// state. Shadows start out `Undefined` and only become `True`/`False`
/// once the bus has confirmed a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TriState {
    /// Known off/false.
    False,
    /// Known on/true.
    True,
    /// Not yet observed.
    #[default]
    Undefined,
}

impl TriState {
    /// Convert a known boolean into a tri-state.
    #[inline]
    pub const fn from_bool(value: bool) -> Self {
        if value {
            TriState::True
        } else {
            TriState::False
        }
    }

    /// Returns the boolean value, or `None` for [`Undefined`](Self::Undefined).
    #[inline]
    pub const fn as_bool(self) -> Option<bool> {
        match self {
            TriState::False => Some(false),
            TriState::True => Some(true),
            TriState::Undefined => None,
        }
    }
}

/// Direction of locomotive travel.
///
/// Defaults to [`Unknown`](Self::Unknown): a freshly acquired slot has no
/// confirmed direction until the command station reports one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Direction {
    /// Moving forward.
    Forward,
    /// Moving in reverse.
    Reverse,
    /// Not yet observed.
    #[default]
    Unknown,
}

bitflags! {
    /// Which aspects of a decoder changed in a [`DecoderState`] delta.
    ///
    /// Passed to the kernel's `decoder_changed` so it only encodes and
    /// transmits the messages that are actually needed.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DecoderChangeFlags: u8 {
        /// Emergency-stop flag changed.
        const EMERGENCY_STOP = 0x01;
        /// Direction changed.
        const DIRECTION = 0x02;
        /// Speed step changed.
        const SPEED = 0x04;
        /// A single function output changed (its number is passed alongside).
        const FUNCTION_VALUE = 0x08;
    }
}

/// Plain snapshot of one locomotive's requested or observed state.
///
/// This is the value crossing the kernel boundary in both directions:
/// callers pass the *requested* state into `decoder_changed`, and the
/// kernel pushes the *observed* state to the [`DecoderController`] when
/// other throttles drive the same locomotive.
///
/// # Example
///
/// ```rust
/// use rs_loconet::{DecoderState, Direction};
///
/// let state = DecoderState::new(3)
///     .with_speed_step(40)
///     .with_direction(Direction::Forward)
///     .with_function(0, true);
///
/// assert_eq!(state.address, 3);
/// assert_eq!(state.speed_step, 40);
/// assert!(state.functions[0]);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecoderState {
    /// DCC decoder address (1..=9999 for long addresses).
    pub address: u16,
    /// Whether the locomotive is emergency-stopped.
    pub emergency_stop: bool,
    /// Direction of travel.
    pub direction: Direction,
    /// Speed step, 0 (stop) ..= 126.
    pub speed_step: u8,
    /// Function outputs F0..=F28.
    pub functions: [bool; FUNCTION_COUNT],
}

impl DecoderState {
    /// Maximum speed step.
    pub const MAX_SPEED_STEP: u8 = 126;

    /// Create a stopped, all-functions-off snapshot for an address.
    pub const fn new(address: u16) -> Self {
        Self {
            address,
            emergency_stop: false,
            direction: Direction::Unknown,
            speed_step: 0,
            functions: [false; FUNCTION_COUNT],
        }
    }

    /// Set the speed step (clamped to [`MAX_SPEED_STEP`](Self::MAX_SPEED_STEP)).
    pub fn with_speed_step(mut self, step: u8) -> Self {
        self.speed_step = step.min(Self::MAX_SPEED_STEP);
        self
    }

    /// Set the direction.
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Set the emergency-stop flag.
    pub fn with_emergency_stop(mut self, stopped: bool) -> Self {
        self.emergency_stop = stopped;
        self
    }

    /// Set a single function output. Out-of-range numbers are ignored.
    pub fn with_function(mut self, number: usize, on: bool) -> Self {
        if number < FUNCTION_COUNT {
            self.functions[number] = on;
        }
        self
    }
}

/// Receives locomotive state observed on the bus.
///
/// Invoked when slot traffic from *other* throttles changes a locomotive
/// the kernel tracks, so the domain layer can mirror the change.
pub trait DecoderController {
    /// A locomotive's state changed on the bus.
    fn update_decoder(&mut self, state: &DecoderState);
}

/// Receives feedback/sensor input changes.
///
/// Only called when a value actually differs from the kernel's shadow;
/// repeated identical reports are suppressed.
pub trait InputController {
    /// Input `address` (1..=4096) changed to `value`.
    fn update_input_value(&mut self, address: u16, value: TriState);
}

/// Receives accessory/switch output changes.
///
/// Called both when the kernel's own switch request is confirmed by its
/// echo and when another throttle on the bus moves a switch.
pub trait OutputController {
    /// Output `address` (1..=4096) changed to `value`.
    fn update_output_value(&mut self, address: u16, value: TriState);
}

/// Receives transponder/RFID identification reports.
pub trait IdentificationController {
    /// A vehicle tag was reported in detection zone `address` (1..=4096).
    ///
    /// `tag` is the reported locomotive address, or 0 when a vehicle left
    /// the zone.
    fn identification_event(&mut self, address: u16, tag: u16);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tristate_default_is_undefined() {
        assert_eq!(TriState::default(), TriState::Undefined);
    }

    #[test]
    fn tristate_from_bool() {
        assert_eq!(TriState::from_bool(true), TriState::True);
        assert_eq!(TriState::from_bool(false), TriState::False);
    }

    #[test]
    fn tristate_as_bool() {
        assert_eq!(TriState::True.as_bool(), Some(true));
        assert_eq!(TriState::False.as_bool(), Some(false));
        assert_eq!(TriState::Undefined.as_bool(), None);
    }

    #[test]
    fn direction_default_is_unknown() {
        assert_eq!(Direction::default(), Direction::Unknown);
    }

    #[test]
    fn decoder_state_new_is_stopped() {
        let state = DecoderState::new(42);
        assert_eq!(state.address, 42);
        assert_eq!(state.speed_step, 0);
        assert!(!state.emergency_stop);
        assert_eq!(state.direction, Direction::Unknown);
        assert!(state.functions.iter().all(|f| !f));
    }

    #[test]
    fn decoder_state_speed_step_clamped() {
        let state = DecoderState::new(1).with_speed_step(200);
        assert_eq!(state.speed_step, DecoderState::MAX_SPEED_STEP);
    }

    #[test]
    fn decoder_state_function_out_of_range_ignored() {
        let state = DecoderState::new(1).with_function(FUNCTION_COUNT, true);
        assert!(state.functions.iter().all(|f| !f));
    }

    #[test]
    fn change_flags_combine() {
        let flags = DecoderChangeFlags::SPEED | DecoderChangeFlags::DIRECTION;
        assert!(flags.contains(DecoderChangeFlags::SPEED));
        assert!(!flags.contains(DecoderChangeFlags::FUNCTION_VALUE));
    }
}
