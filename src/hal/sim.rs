//! Simulation I/O handler for testing without hardware.
//!
//! [`SimIoHandler`] behaves like a quiet, well-behaved LocoNet bus: every
//! transmitted frame is echoed back (the bus is half duplex, so a sender
//! always observes its own bytes), and tests can inject arbitrary inbound
//! traffic. With [`with_command_station`](SimIoHandler::with_command_station)
//! it additionally emulates the command-station side of the protocol —
//! slot assignment, fast-clock reads, write acknowledges, and the LNCV
//! module dialog — which is enough to run the full kernel offline.
//!
//! # Example
//!
//! ```rust
//! use rs_loconet::hal::SimIoHandler;
//! use rs_loconet::message::Message;
//! use rs_loconet::traits::IoHandler;
//!
//! let mut sim = SimIoHandler::new();
//! sim.start().unwrap();
//!
//! assert!(sim.send(&Message::gpon()));
//! assert_eq!(sim.recv(), Some(Message::gpon())); // the bus echo
//! assert_eq!(sim.recv(), None);
//! ```

extern crate alloc;
use alloc::vec::Vec;

use heapless::{Deque, FnvIndexMap};

use crate::lncv::{command as lncv_command, LncvFrame};
use crate::message::{opcode, Message, FAST_CLOCK_SLOT};
use crate::traits::{IoError, IoHandler};

const RX_CAPACITY: usize = 64;

/// Simulated LocoNet bus (and optional command station).
pub struct SimIoHandler {
    started: bool,
    command_station: bool,
    rx: Deque<Message, RX_CAPACITY>,
    /// Every frame handed to `send`, in order. Public for test assertions.
    pub sent: Vec<Message>,
    next_slot: u8,
    assigned_slots: FnvIndexMap<u16, u8, 32>,
    lncv_values: FnvIndexMap<u16, u16, 16>,
    fast_clock: (u8, u8, u8),
}

impl Default for SimIoHandler {
    fn default() -> Self {
        Self {
            started: false,
            command_station: false,
            rx: Deque::new(),
            sent: Vec::new(),
            next_slot: 1,
            assigned_slots: FnvIndexMap::new(),
            lncv_values: FnvIndexMap::new(),
            fast_clock: (1, 0, 0),
        }
    }
}

impl SimIoHandler {
    /// Create a plain echoing bus with no command station.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable command-station emulation.
    pub fn with_command_station(mut self) -> Self {
        self.command_station = true;
        self
    }

    /// Set the emulated command station's fast clock.
    pub fn set_fast_clock(&mut self, rate: u8, hour: u8, minute: u8) {
        self.fast_clock = (rate, hour, minute);
    }

    /// Queue an inbound frame, as if another device transmitted it.
    pub fn inject(&mut self, message: Message) {
        if self.rx.push_back(message).is_err() {
            // Receive overflow only happens when a test forgets to pump.
            self.rx.pop_front();
        }
    }

    /// Frames sent with a given opcode, for test assertions.
    pub fn sent_with_opcode(&self, op: u8) -> Vec<&Message> {
        self.sent.iter().filter(|m| m.opcode() == op).collect()
    }

    /// Forget the sent-frame log.
    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }

    fn respond(&mut self, message: &Message) {
        match message.opcode() {
            opcode::LOCO_ADR => {
                if let Some(address) = message.loco_adr_address() {
                    let slot = match self.assigned_slots.get(&address).copied() {
                        Some(slot) => slot,
                        None => {
                            let slot = self.next_slot;
                            self.next_slot = (self.next_slot % 119) + 1;
                            let _ = self.assigned_slots.insert(address, slot);
                            slot
                        }
                    };
                    self.inject(Message::slot_read_data(slot, address, 0, 0));
                }
            }
            opcode::RQ_SL_DATA => {
                if message.slot() == Some(FAST_CLOCK_SLOT) {
                    let (rate, hour, minute) = self.fast_clock;
                    self.inject(Message::fast_clock_data(rate, hour, minute));
                }
            }
            opcode::WR_SL_DATA => {
                if let Some(clock) = message.fast_clock() {
                    self.fast_clock = clock;
                }
                self.inject(Message::long_ack(opcode::WR_SL_DATA, 0x7F));
            }
            opcode::PEER_XFER => {
                if let Some(frame) = LncvFrame::decode(message) {
                    match frame.command {
                        lncv_command::PROG_START => {
                            self.inject(
                                LncvFrame::response(frame.module_id, 0, frame.value).encode(),
                            );
                        }
                        lncv_command::READ => {
                            let value =
                                self.lncv_values.get(&frame.lncv).copied().unwrap_or(0);
                            self.inject(
                                LncvFrame::response(frame.module_id, frame.lncv, value).encode(),
                            );
                        }
                        lncv_command::WRITE => {
                            let _ = self.lncv_values.insert(frame.lncv, frame.value);
                            self.inject(Message::long_ack(opcode::PEER_XFER, 0x7F));
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
}

impl IoHandler for SimIoHandler {
    fn start(&mut self) -> Result<(), IoError> {
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.started = false;
        self.rx.clear();
    }

    fn send(&mut self, message: &Message) -> bool {
        if !self.started {
            return false;
        }
        self.sent.push(message.clone());
        // Half duplex: the sender observes its own frame.
        self.inject(message.clone());
        if self.command_station {
            self.respond(message);
        }
        true
    }

    fn recv(&mut self) -> Option<Message> {
        self.rx.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_before_start_fails() {
        let mut sim = SimIoHandler::new();
        assert!(!sim.send(&Message::gpon()));
    }

    #[test]
    fn every_send_is_echoed_in_order() {
        let mut sim = SimIoHandler::new();
        sim.start().unwrap();
        assert!(sim.send(&Message::gpon()));
        assert!(sim.send(&Message::idle()));
        assert_eq!(sim.recv(), Some(Message::gpon()));
        assert_eq!(sim.recv(), Some(Message::idle()));
        assert_eq!(sim.recv(), None);
    }

    #[test]
    fn inject_queues_inbound_traffic() {
        let mut sim = SimIoHandler::new();
        sim.start().unwrap();
        sim.inject(Message::input_rep(17, true));
        assert_eq!(sim.recv(), Some(Message::input_rep(17, true)));
    }

    #[test]
    fn command_station_assigns_stable_slots() {
        let mut sim = SimIoHandler::new().with_command_station();
        sim.start().unwrap();

        let _ = sim.send(&Message::loco_adr(3));
        assert_eq!(sim.recv(), Some(Message::loco_adr(3))); // echo
        let first = sim.recv().unwrap().slot_data().unwrap();
        assert_eq!(first.address, 3);

        let _ = sim.send(&Message::loco_adr(3));
        let _ = sim.recv();
        let second = sim.recv().unwrap().slot_data().unwrap();
        assert_eq!(second.slot, first.slot);
    }

    #[test]
    fn command_station_acknowledges_clock_writes() {
        let mut sim = SimIoHandler::new().with_command_station();
        sim.start().unwrap();
        let _ = sim.send(&Message::wr_fast_clock(4, 13, 37));
        let _ = sim.recv(); // echo
        let ack = sim.recv().unwrap();
        assert_eq!(ack.long_ack_fields().map(|(op, _)| op), Some(opcode::WR_SL_DATA));
        assert_eq!(sim.fast_clock, (4, 13, 37));
    }

    #[test]
    fn command_station_answers_lncv_dialog() {
        let mut sim = SimIoHandler::new().with_command_station();
        sim.start().unwrap();

        let _ = sim.send(&LncvFrame::write(6312, 7, 42).encode());
        let _ = sim.recv(); // echo
        let _ = sim.recv(); // write acknowledge

        let _ = sim.send(&LncvFrame::read(6312, 7, 1).encode());
        let _ = sim.recv(); // echo
        let response = LncvFrame::decode(&sim.recv().unwrap()).unwrap();
        assert_eq!(response.command, lncv_command::RESPONSE);
        assert_eq!(response.lncv, 7);
        assert_eq!(response.value, 42);
    }

    #[test]
    fn sent_log_filters_by_opcode() {
        let mut sim = SimIoHandler::new();
        sim.start().unwrap();
        let _ = sim.send(&Message::gpon());
        let _ = sim.send(&Message::sw_req(1, true, true));
        assert_eq!(sim.sent_with_opcode(opcode::SW_REQ).len(), 1);
        sim.clear_sent();
        assert!(sim.sent.is_empty());
    }
}
