//! LNCV module configuration dialog.
//!
//! LNCV (LocoNet Configuration Variables) is a read/write address space
//! on LocoNet accessory modules, programmed through a serialized dialog:
//! start a programming session for one module, read or write variables
//! one at a time, stop the session. The dialog rides on `PEER_XFER`
//! frames carrying a command byte and three 16-bit fields (module id,
//! variable number, value/module address) split into 7-bit wire bytes
//! with the high bits gathered in a PXCT byte.
//!
//! The kernel keeps a [`LncvSession`] and admits at most one outstanding
//! operation; see the kernel's `lncv_*` operations.

use crate::message::{opcode, Message};

// PEER_XFER signature of the LNCV dialog.
const LNCV_SRC: u8 = 0x05;
const LNCV_DST_L: u8 = 0x49;
const LNCV_DST_H: u8 = 0x4B;
const LNCV_LEN: u8 = 0x0F;

/// Dialog command bytes.
pub mod command {
    /// Open a programming session.
    pub const PROG_START: u8 = 0x21;
    /// Read one variable.
    pub const READ: u8 = 0x22;
    /// Write one variable.
    pub const WRITE: u8 = 0x23;
    /// Close the programming session.
    pub const PROG_STOP: u8 = 0x24;
    /// Module response (session confirm or read result).
    pub const RESPONSE: u8 = 0x1F;
}

/// Decoded LNCV dialog frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LncvFrame {
    /// Dialog command (see [`command`]).
    pub command: u8,
    /// Module article/id the dialog addresses.
    pub module_id: u16,
    /// Variable number.
    pub lncv: u16,
    /// Variable value, or the module address for session control.
    pub value: u16,
}

impl LncvFrame {
    /// Encode into a `PEER_XFER` frame.
    pub fn encode(&self) -> Message {
        let mut pxct = 0u8;
        let mut body = [0u8; 14];
        body[0] = opcode::PEER_XFER;
        body[1] = LNCV_LEN;
        body[2] = LNCV_SRC;
        body[3] = LNCV_DST_L;
        body[4] = LNCV_DST_H;
        body[5] = self.command;
        for (i, v) in [self.module_id, self.lncv, self.value].into_iter().enumerate() {
            body[7 + 2 * i] = (v & 0x7F) as u8;
            body[8 + 2 * i] = ((v >> 7) & 0x7F) as u8;
            pxct |= (((v >> 14) & 0x03) as u8) << (2 * i);
        }
        body[6] = pxct;
        // body[13] spare, zero.
        // Infallible: the body fits every frame buffer.
        let mut raw = heapless::Vec::<u8, { crate::message::MAX_FRAME_LEN }>::new();
        raw.extend_from_slice(&body).unwrap();
        raw.push(crate::message::checksum(&body)).unwrap();
        Message::from_bytes(&raw).unwrap()
    }

    /// Decode an LNCV dialog frame, if this `PEER_XFER` carries one.
    pub fn decode(message: &Message) -> Option<Self> {
        let bytes = message.as_bytes();
        if message.opcode() != opcode::PEER_XFER
            || bytes.len() != LNCV_LEN as usize
            || bytes[2] != LNCV_SRC
            || bytes[3] != LNCV_DST_L
            || bytes[4] != LNCV_DST_H
        {
            return None;
        }
        let pxct = bytes[6];
        let field = |i: usize| -> u16 {
            (bytes[7 + 2 * i] as u16)
                | ((bytes[8 + 2 * i] as u16) << 7)
                | ((((pxct >> (2 * i)) & 0x03) as u16) << 14)
        };
        Some(Self {
            command: bytes[5],
            module_id: field(0),
            lncv: field(1),
            value: field(2),
        })
    }

    /// Session-start request for a module.
    pub fn prog_start(module_id: u16, module_address: u16) -> Self {
        Self {
            command: command::PROG_START,
            module_id,
            lncv: 0,
            value: module_address,
        }
    }

    /// Read request for one variable.
    pub fn read(module_id: u16, lncv: u16, module_address: u16) -> Self {
        Self {
            command: command::READ,
            module_id,
            lncv,
            value: module_address,
        }
    }

    /// Write request for one variable.
    pub fn write(module_id: u16, lncv: u16, value: u16) -> Self {
        Self {
            command: command::WRITE,
            module_id,
            lncv,
            value,
        }
    }

    /// Session-stop request.
    pub fn prog_stop(module_id: u16, module_address: u16) -> Self {
        Self {
            command: command::PROG_STOP,
            module_id,
            lncv: 0,
            value: module_address,
        }
    }

    /// Module response frame (used by the simulator and tests).
    pub fn response(module_id: u16, lncv: u16, value: u16) -> Self {
        Self {
            command: command::RESPONSE,
            module_id,
            lncv,
            value,
        }
    }
}

/// Programming-session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LncvState {
    /// No session.
    #[default]
    Inactive,
    /// Start request sent, awaiting the module's confirmation.
    Starting,
    /// Session open; reads and writes are admitted.
    Active,
    /// Stop request sent, awaiting its echo.
    Stopping,
}

/// One module's programming session.
#[derive(Debug, Default)]
pub struct LncvSession {
    /// Current dialog state.
    pub state: LncvState,
    /// Module id the session addresses.
    pub module_id: u16,
    /// Module address the session addresses.
    pub module_address: u16,
    /// Variable number of the outstanding read, if any.
    pub pending_read: Option<u16>,
}

impl LncvSession {
    /// Reset to [`LncvState::Inactive`], dropping any outstanding read.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        for frame in [
            LncvFrame::prog_start(6312, 1),
            LncvFrame::read(6312, 7, 1),
            LncvFrame::write(6312, 2, 0xFFFF),
            LncvFrame::prog_stop(6312, 1),
            LncvFrame::response(6312, 7, 4711),
        ] {
            let encoded = frame.encode();
            assert!(encoded.checksum_valid());
            assert_eq!(encoded.len(), LNCV_LEN as usize);
            assert_eq!(LncvFrame::decode(&encoded), Some(frame));
        }
    }

    #[test]
    fn full_16_bit_values_survive() {
        let frame = LncvFrame::write(0xFFFF, 0x8001, 0xC000);
        assert_eq!(LncvFrame::decode(&frame.encode()), Some(frame));
    }

    #[test]
    fn wire_bytes_stay_seven_bit() {
        let encoded = LncvFrame::write(0xFFFF, 0xFFFF, 0xFFFF).encode();
        for &b in &encoded.as_bytes()[1..encoded.len() - 1] {
            assert_eq!(b & 0x80, 0);
        }
    }

    #[test]
    fn decode_rejects_foreign_peer_xfer() {
        let mut body = [0u8; 14];
        body[0] = opcode::PEER_XFER;
        body[1] = LNCV_LEN;
        body[2] = 0x01; // some other source
        let mut raw = body.to_vec();
        raw.push(crate::message::checksum(&body));
        let msg = Message::from_bytes(&raw).unwrap();
        assert_eq!(LncvFrame::decode(&msg), None);
    }

    #[test]
    fn session_reset() {
        let mut session = LncvSession {
            state: LncvState::Active,
            module_id: 6312,
            module_address: 1,
            pending_read: Some(7),
        };
        session.reset();
        assert_eq!(session.state, LncvState::Inactive);
        assert_eq!(session.pending_read, None);
    }
}
