//! LocoNet frame type, opcodes, and per-opcode constructors.
//!
//! A LocoNet frame is 2, 4, 6, or N bytes. The first byte is the opcode
//! (high bit always set); bits 6–5 of the opcode select the length class;
//! variable-length frames carry their total length in byte 1. The last
//! byte is the checksum: the ones' complement of the XOR of all preceding
//! bytes, so the XOR over a complete valid frame is always `0xFF`.
//!
//! [`Message`] is an immutable byte record compared by content — the bus
//! echo handshake relies on byte-for-byte equality between a transmitted
//! frame and its observed echo.
//!
//! # Example
//!
//! ```rust
//! use rs_loconet::message::{Message, opcode};
//!
//! let gpon = Message::gpon();
//! assert_eq!(gpon.as_bytes(), &[0x83, 0x7C]);
//! assert_eq!(gpon.opcode(), opcode::GPON);
//! assert!(gpon.checksum_valid());
//!
//! let spd = Message::loco_spd(5, 0x30);
//! assert_eq!(spd.slot(), Some(5));
//! ```

use heapless::Vec;

use crate::traits::Direction;

/// Largest frame the kernel handles (slot data is 14, LNCV dialog is 15).
pub const MAX_FRAME_LEN: usize = 16;

/// LocoNet opcodes understood by the kernel.
pub mod opcode {
    /// Global power off (2 bytes).
    pub const GPOFF: u8 = 0x82;
    /// Global power on (2 bytes).
    pub const GPON: u8 = 0x83;
    /// Force idle: broadcast emergency stop (2 bytes).
    pub const IDLE: u8 = 0x85;
    /// Set slot speed (4 bytes).
    pub const LOCO_SPD: u8 = 0xA0;
    /// Set slot direction and F0–F4 (4 bytes).
    pub const LOCO_DIRF: u8 = 0xA1;
    /// Set slot sound functions F5–F8 (4 bytes).
    pub const LOCO_SND: u8 = 0xA2;
    /// Set slot functions F9–F12 (4 bytes).
    pub const LOCO_F9F12: u8 = 0xA3;
    /// Switch request (4 bytes).
    pub const SW_REQ: u8 = 0xB0;
    /// Switch state report (4 bytes).
    pub const SW_REP: u8 = 0xB1;
    /// Sensor input report (4 bytes).
    pub const INPUT_REP: u8 = 0xB2;
    /// Long acknowledge (4 bytes).
    pub const LONG_ACK: u8 = 0xB4;
    /// Write slot status byte (4 bytes).
    pub const SLOT_STAT1: u8 = 0xB5;
    /// Move/link slots; src == dst is the "null move" claiming a slot (4 bytes).
    pub const MOVE_SLOTS: u8 = 0xBA;
    /// Request slot data (4 bytes).
    pub const RQ_SL_DATA: u8 = 0xBB;
    /// Request slot for a locomotive address (4 bytes).
    pub const LOCO_ADR: u8 = 0xBF;
    /// Transponder / multi-sense report (6 bytes).
    pub const MULTI_SENSE: u8 = 0xD0;
    /// Extended function groups F13–F19 / F21–F27 / F12,F20,F28 (6 bytes).
    pub const EXP_FUNCTIONS: u8 = 0xD4;
    /// Peer transfer; carries the LNCV configuration dialog (15 bytes).
    pub const PEER_XFER: u8 = 0xE5;
    /// Slot data read response (14 bytes).
    pub const SL_RD_DATA: u8 = 0xE7;
    /// Slot data write (14 bytes).
    pub const WR_SL_DATA: u8 = 0xEF;
}

/// Slot number carrying the fast clock in slot read/write frames.
pub const FAST_CLOCK_SLOT: u8 = 0x7B;

/// Expected frame length for an opcode, or `None` for variable length.
///
/// Length class is opcode bits 6–5: `00` → 2, `01` → 4, `10` → 6,
/// `11` → variable (total length in byte 1).
#[inline]
pub const fn fixed_len(op: u8) -> Option<usize> {
    match op & 0x60 {
        0x00 => Some(2),
        0x20 => Some(4),
        0x40 => Some(6),
        _ => None,
    }
}

/// Checksum over a frame body: ones' complement of the XOR of the bytes.
#[inline]
pub fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0xFF, |acc, b| acc ^ b)
}

// Switch / sensor bit layout shared by SW_REQ, SW_REP, and INPUT_REP.
const SW_ON: u8 = 0x10;
const SW_DIR: u8 = 0x20;
const INPUT_CONTROL: u8 = 0x40;

// DIRF bit layout: bit 5 = direction (set = reverse), bit 4 = F0,
// bits 0–3 = F1–F4.
const DIRF_REVERSE: u8 = 0x20;
const DIRF_F0: u8 = 0x10;

// EXP_FUNCTIONS sub-groups (byte 3).
/// F13–F19 group selector.
pub const EXP_GROUP_F13F19: u8 = 0x08;
/// F21–F27 group selector.
pub const EXP_GROUP_F21F27: u8 = 0x09;
/// F12/F20/F28 group selector.
pub const EXP_GROUP_F12F20F28: u8 = 0x05;

/// One LocoNet frame, compared by byte content.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    bytes: Vec<u8, MAX_FRAME_LEN>,
}

impl core::fmt::Debug for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Message[")?;
        for (i, b) in self.bytes.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{b:02X}")?;
        }
        write!(f, "]")
    }
}

impl Message {
    /// Build a frame from a body, appending the checksum.
    ///
    /// Internal constructor; panics only on a body exceeding
    /// [`MAX_FRAME_LEN`], which no opcode constructor produces.
    fn from_body(body: &[u8]) -> Self {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(body).unwrap();
        bytes.push(checksum(body)).unwrap();
        Self { bytes }
    }

    /// Reassemble a frame from raw bytes, as received off the wire.
    ///
    /// Returns `None` when the length does not fit a frame or exceeds
    /// [`MAX_FRAME_LEN`]. The checksum is *not* validated here; use
    /// [`checksum_valid`](Self::checksum_valid).
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < 2 || raw.len() > MAX_FRAME_LEN {
            return None;
        }
        let mut bytes = Vec::new();
        bytes.extend_from_slice(raw).ok()?;
        Some(Self { bytes })
    }

    /// The serialized frame, checksum included.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Frame length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; a frame has at least an opcode and a checksum.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The opcode byte.
    #[inline]
    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }

    /// Whether the trailing checksum matches the body.
    ///
    /// The XOR over a complete valid frame, checksum included, is `0xFF`.
    pub fn checksum_valid(&self) -> bool {
        self.bytes.iter().fold(0u8, |acc, b| acc ^ b) == 0xFF
    }

    // ------------------------------------------------------------------
    // Power and emergency stop
    // ------------------------------------------------------------------

    /// Global power on: `83 7C`.
    pub fn gpon() -> Self {
        Self::from_body(&[opcode::GPON])
    }

    /// Global power off: `82 7D`.
    pub fn gpoff() -> Self {
        Self::from_body(&[opcode::GPOFF])
    }

    /// Force idle (broadcast emergency stop): `85 7A`.
    pub fn idle() -> Self {
        Self::from_body(&[opcode::IDLE])
    }

    // ------------------------------------------------------------------
    // Slot traffic
    // ------------------------------------------------------------------

    /// Request a slot for a decoder address.
    pub fn loco_adr(address: u16) -> Self {
        Self::from_body(&[
            opcode::LOCO_ADR,
            ((address >> 7) & 0x7F) as u8,
            (address & 0x7F) as u8,
        ])
    }

    /// Set slot speed. `spd`: 0 = stop, 1 = emergency stop, 2..=127 = step + 1.
    pub fn loco_spd(slot: u8, spd: u8) -> Self {
        Self::from_body(&[opcode::LOCO_SPD, slot & 0x7F, spd & 0x7F])
    }

    /// Set slot direction and F0–F4.
    pub fn loco_dirf(slot: u8, direction: Direction, functions: &[bool]) -> Self {
        let mut dirf = 0u8;
        if direction == Direction::Reverse {
            dirf |= DIRF_REVERSE;
        }
        if functions.first().copied().unwrap_or(false) {
            dirf |= DIRF_F0;
        }
        for n in 1..=4 {
            if functions.get(n).copied().unwrap_or(false) {
                dirf |= 1 << (n - 1);
            }
        }
        Self::from_body(&[opcode::LOCO_DIRF, slot & 0x7F, dirf])
    }

    /// Set slot sound functions F5–F8.
    pub fn loco_snd(slot: u8, functions: &[bool]) -> Self {
        let mut snd = 0u8;
        for n in 5..=8 {
            if functions.get(n).copied().unwrap_or(false) {
                snd |= 1 << (n - 5);
            }
        }
        Self::from_body(&[opcode::LOCO_SND, slot & 0x7F, snd])
    }

    /// Set slot functions F9–F12.
    pub fn loco_f9f12(slot: u8, functions: &[bool]) -> Self {
        let mut fnk = 0u8;
        for n in 9..=12 {
            if functions.get(n).copied().unwrap_or(false) {
                fnk |= 1 << (n - 9);
            }
        }
        Self::from_body(&[opcode::LOCO_F9F12, slot & 0x7F, fnk])
    }

    /// Set one of the extended function groups (F13 and up).
    ///
    /// `group` is one of [`EXP_GROUP_F13F19`], [`EXP_GROUP_F21F27`],
    /// [`EXP_GROUP_F12F20F28`]; `bits` carries the group's function bits.
    pub fn exp_functions(slot: u8, group: u8, bits: u8) -> Self {
        Self::from_body(&[opcode::EXP_FUNCTIONS, 0x20, slot & 0x7F, group, bits & 0x7F])
    }

    /// F13–F19 group frame built from a function array.
    pub fn loco_f13f19(slot: u8, functions: &[bool]) -> Self {
        let mut bits = 0u8;
        for n in 13..=19 {
            if functions.get(n).copied().unwrap_or(false) {
                bits |= 1 << (n - 13);
            }
        }
        Self::exp_functions(slot, EXP_GROUP_F13F19, bits)
    }

    /// F21–F27 group frame built from a function array.
    pub fn loco_f21f27(slot: u8, functions: &[bool]) -> Self {
        let mut bits = 0u8;
        for n in 21..=27 {
            if functions.get(n).copied().unwrap_or(false) {
                bits |= 1 << (n - 21);
            }
        }
        Self::exp_functions(slot, EXP_GROUP_F21F27, bits)
    }

    /// F12/F20/F28 group frame built from a function array.
    pub fn loco_f12f20f28(slot: u8, functions: &[bool]) -> Self {
        let mut bits = 0u8;
        if functions.get(12).copied().unwrap_or(false) {
            bits |= 0x10;
        }
        if functions.get(20).copied().unwrap_or(false) {
            bits |= 0x20;
        }
        if functions.get(28).copied().unwrap_or(false) {
            bits |= 0x40;
        }
        Self::exp_functions(slot, EXP_GROUP_F12F20F28, bits)
    }

    /// Request slot data for a slot number.
    pub fn rq_sl_data(slot: u8) -> Self {
        Self::from_body(&[opcode::RQ_SL_DATA, slot & 0x7F, 0])
    }

    /// Null move: claim a slot by moving it onto itself.
    pub fn null_move(slot: u8) -> Self {
        Self::from_body(&[opcode::MOVE_SLOTS, slot & 0x7F, slot & 0x7F])
    }

    /// Write a slot status byte.
    pub fn slot_stat1(slot: u8, stat1: u8) -> Self {
        Self::from_body(&[opcode::SLOT_STAT1, slot & 0x7F, stat1 & 0x7F])
    }

    /// Slot data response frame (14 bytes), as a command station sends it.
    ///
    /// Used by the simulator and by tests to synthesize command-station
    /// traffic.
    pub fn slot_read_data(slot: u8, address: u16, spd: u8, dirf: u8) -> Self {
        Self::from_body(&[
            opcode::SL_RD_DATA,
            0x0E,
            slot & 0x7F,
            0x03, // 128-step, active
            (address & 0x7F) as u8,
            spd & 0x7F,
            dirf & 0x7F,
            0x00,
            0x00,
            ((address >> 7) & 0x7F) as u8,
            0x00,
            0x00,
            0x00,
        ])
    }

    /// Long acknowledge for a request opcode.
    pub fn long_ack(request_opcode: u8, ack1: u8) -> Self {
        Self::from_body(&[opcode::LONG_ACK, request_opcode & 0x7F, ack1 & 0x7F])
    }

    // ------------------------------------------------------------------
    // Switches and sensors
    // ------------------------------------------------------------------

    /// Switch request for a 1-based address.
    ///
    /// `on` is the coil-drive bit; `closed` selects the closed/green
    /// direction. Addresses above 2048 use the otherwise spare bit 6 of
    /// the second byte as a twelfth address bit.
    pub fn sw_req(address: u16, on: bool, closed: bool) -> Self {
        let a0 = address - 1;
        let mut sw2 = ((a0 >> 7) & 0x0F) as u8 | (((a0 >> 11) & 0x01) as u8) << 6;
        if on {
            sw2 |= SW_ON;
        }
        if closed {
            sw2 |= SW_DIR;
        }
        Self::from_body(&[opcode::SW_REQ, (a0 & 0x7F) as u8, sw2])
    }

    /// Sensor input report for a 1-based address.
    pub fn input_rep(address: u16, on: bool) -> Self {
        let a0 = address - 1;
        let mut in2 = ((a0 >> 8) & 0x0F) as u8 | INPUT_CONTROL;
        if a0 & 1 != 0 {
            in2 |= SW_DIR;
        }
        if on {
            in2 |= SW_ON;
        }
        Self::from_body(&[opcode::INPUT_REP, ((a0 >> 1) & 0x7F) as u8, in2])
    }

    /// Transponder report for a detection zone.
    pub fn multi_sense(zone: u16, present: bool, loco_address: u16) -> Self {
        let z0 = zone - 1;
        let m1 = if present { 0x20 } else { 0x00 } | ((z0 >> 7) & 0x1F) as u8;
        Self::from_body(&[
            opcode::MULTI_SENSE,
            m1,
            (z0 & 0x7F) as u8,
            ((loco_address >> 7) & 0x7F) as u8,
            (loco_address & 0x7F) as u8,
        ])
    }

    // ------------------------------------------------------------------
    // Fast clock
    // ------------------------------------------------------------------

    /// Fast-clock write frame (slot `0x7B`).
    pub fn wr_fast_clock(rate: u8, hour: u8, minute: u8) -> Self {
        Self::fast_clock_frame(opcode::WR_SL_DATA, rate, hour, minute)
    }

    /// Fast-clock read response frame, as a command station sends it.
    pub fn fast_clock_data(rate: u8, hour: u8, minute: u8) -> Self {
        Self::fast_clock_frame(opcode::SL_RD_DATA, rate, hour, minute)
    }

    fn fast_clock_frame(op: u8, rate: u8, hour: u8, minute: u8) -> Self {
        Self::from_body(&[
            op,
            0x0E,
            FAST_CLOCK_SLOT,
            rate & 0x7F,
            0x00,
            0x00,
            encode_clock_minute(minute),
            0x00,
            encode_clock_hour(hour),
            0x00,
            0x40, // clock data valid
            0x00,
            0x00,
        ])
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Slot number for slot-addressed frames, if this opcode carries one.
    pub fn slot(&self) -> Option<u8> {
        match self.opcode() {
            opcode::LOCO_SPD | opcode::LOCO_DIRF | opcode::LOCO_SND | opcode::LOCO_F9F12 => {
                Some(self.bytes[1])
            }
            opcode::EXP_FUNCTIONS => Some(self.bytes[2]),
            opcode::RQ_SL_DATA | opcode::SLOT_STAT1 | opcode::MOVE_SLOTS => Some(self.bytes[1]),
            opcode::SL_RD_DATA | opcode::WR_SL_DATA => Some(self.bytes[2]),
            _ => None,
        }
    }

    /// Rewrite the slot number of a slot-addressed frame and fix the
    /// checksum. Used when draining messages queued before a slot was
    /// acquired. Returns `false` if this opcode carries no slot.
    pub fn set_slot(&mut self, slot: u8) -> bool {
        let index = match self.opcode() {
            opcode::LOCO_SPD | opcode::LOCO_DIRF | opcode::LOCO_SND | opcode::LOCO_F9F12 => 1,
            opcode::EXP_FUNCTIONS => 2,
            _ => return false,
        };
        self.bytes[index] = slot & 0x7F;
        let last = self.bytes.len() - 1;
        self.bytes[last] = checksum(&self.bytes[..last]);
        true
    }

    /// Decoder address carried by a `LOCO_ADR` request.
    pub fn loco_adr_address(&self) -> Option<u16> {
        (self.opcode() == opcode::LOCO_ADR)
            .then(|| ((self.bytes[1] as u16) << 7) | self.bytes[2] as u16)
    }

    /// Decoded slot-data fields `(slot, address, spd, dirf)` of a
    /// `SL_RD_DATA` / `WR_SL_DATA` frame.
    pub fn slot_data(&self) -> Option<SlotData> {
        match self.opcode() {
            opcode::SL_RD_DATA | opcode::WR_SL_DATA if self.len() == 14 => Some(SlotData {
                slot: self.bytes[2],
                address: ((self.bytes[9] as u16) << 7) | self.bytes[4] as u16,
                spd: self.bytes[5],
                dirf: self.bytes[6],
            }),
            _ => None,
        }
    }

    /// Fast-clock fields of a slot `0x7B` data frame.
    pub fn fast_clock(&self) -> Option<(u8, u8, u8)> {
        let data = match self.opcode() {
            opcode::SL_RD_DATA | opcode::WR_SL_DATA if self.len() == 14 => &self.bytes,
            _ => return None,
        };
        if data[2] != FAST_CLOCK_SLOT {
            return None;
        }
        Some((
            data[3],
            decode_clock_hour(data[8]),
            decode_clock_minute(data[6]),
        ))
    }

    /// Switch request fields `(address, on, closed)`.
    pub fn sw_req_fields(&self) -> Option<(u16, bool, bool)> {
        if self.opcode() != opcode::SW_REQ && self.opcode() != opcode::SW_REP {
            return None;
        }
        let a0 = self.bytes[1] as u16
            | (((self.bytes[2] & 0x0F) as u16) << 7)
            | ((((self.bytes[2] >> 6) & 0x01) as u16) << 11);
        Some((
            a0 + 1,
            self.bytes[2] & SW_ON != 0,
            self.bytes[2] & SW_DIR != 0,
        ))
    }

    /// Input report fields `(address, on)`.
    pub fn input_rep_fields(&self) -> Option<(u16, bool)> {
        if self.opcode() != opcode::INPUT_REP {
            return None;
        }
        let a0 = ((self.bytes[1] as u16) << 1)
            | (((self.bytes[2] & 0x0F) as u16) << 8)
            | ((self.bytes[2] & SW_DIR != 0) as u16);
        Some((a0 + 1, self.bytes[2] & SW_ON != 0))
    }

    /// Transponder report fields `(zone, present, loco_address)`.
    pub fn multi_sense_fields(&self) -> Option<(u16, bool, u16)> {
        if self.opcode() != opcode::MULTI_SENSE {
            return None;
        }
        let zone = ((((self.bytes[1] & 0x1F) as u16) << 7) | self.bytes[2] as u16) + 1;
        let present = self.bytes[1] & 0x60 == 0x20;
        let address = ((self.bytes[3] as u16) << 7) | self.bytes[4] as u16;
        Some((zone, present, address))
    }

    /// Long-acknowledge fields `(request opcode with high bit restored, ack1)`.
    pub fn long_ack_fields(&self) -> Option<(u8, u8)> {
        (self.opcode() == opcode::LONG_ACK).then(|| (self.bytes[1] | 0x80, self.bytes[2]))
    }
}

/// Decoded locomotive fields of a slot data frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotData {
    /// Slot number.
    pub slot: u8,
    /// 14-bit decoder address; 0 means the slot is free.
    pub address: u16,
    /// Raw speed byte (0 stop, 1 emergency stop, 2..=127 step + 1).
    pub spd: u8,
    /// Raw direction/function byte.
    pub dirf: u8,
}

impl SlotData {
    /// Direction carried by the `dirf` byte.
    pub fn direction(&self) -> Direction {
        if self.dirf & DIRF_REVERSE != 0 {
            Direction::Reverse
        } else {
            Direction::Forward
        }
    }

    /// Speed step (0..=126) carried by the `spd` byte, or `None` for the
    /// emergency-stop encoding.
    pub fn speed_step(&self) -> Option<u8> {
        match self.spd {
            0 => Some(0),
            1 => None,
            n => Some(n - 1),
        }
    }
}

/// Direction/F0–F4 byte for a slot write, from a function array.
pub fn dirf_byte(direction: Direction, functions: &[bool]) -> u8 {
    let mut dirf = 0u8;
    if direction == Direction::Reverse {
        dirf |= DIRF_REVERSE;
    }
    if functions.first().copied().unwrap_or(false) {
        dirf |= DIRF_F0;
    }
    for n in 1..=4 {
        if functions.get(n).copied().unwrap_or(false) {
            dirf |= 1 << (n - 1);
        }
    }
    dirf
}

/// Speed byte for a slot write: 0 stop, 1 emergency stop, else step + 1.
pub fn spd_byte(speed_step: u8, emergency_stop: bool) -> u8 {
    if emergency_stop {
        1
    } else if speed_step == 0 {
        0
    } else {
        (speed_step + 1).min(0x7F)
    }
}

// Fast-clock field encoding: minutes as (256 - (60 - m)) masked to seven
// bits, hours as (256 - (24 - h)) likewise.
fn encode_clock_minute(minute: u8) -> u8 {
    (256u16 - (60 - minute.min(59)) as u16) as u8 & 0x7F
}

fn decode_clock_minute(byte: u8) -> u8 {
    let m = byte.wrapping_sub((256u16 - 60) as u8 & 0x7F);
    if m < 60 {
        m
    } else {
        0
    }
}

fn encode_clock_hour(hour: u8) -> u8 {
    (256u16 - (24 - hour.min(23)) as u16) as u8 & 0x7F
}

fn decode_clock_hour(byte: u8) -> u8 {
    let h = byte.wrapping_sub((256u16 - 24) as u8 & 0x7F);
    if h < 24 {
        h
    } else {
        0
    }
}
