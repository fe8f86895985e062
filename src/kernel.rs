//! The LocoNet kernel: bus protocol state machine and dispatch.
//!
//! This module is the deterministic core of the crate. It owns the I/O
//! handler, the three priority transmit queues, the slot cache, the
//! input/output shadows, the fast-clock broadcaster, and the LNCV
//! session, and it enforces the bus discipline: one frame in flight,
//! confirmed by its echo, optionally followed by a command-station
//! response, with separate timeouts for each.
//!
//! Every operation takes an explicit `now_ms` timestamp, so the whole
//! protocol is testable without threads or a wall clock — the same
//! pattern the rest of the crate uses for time. The `std` service layer
//! ([`crate::service::KernelRunner`]) runs a [`Kernel`] on a worker
//! thread and feeds it real time.
//!
//! # Example
//!
//! ```rust
//! use rs_loconet::hal::SimIoHandler;
//! use rs_loconet::kernel::Kernel;
//! use rs_loconet::Config;
//!
//! let mut kernel = Kernel::new(Config::default(), SimIoHandler::new());
//! kernel.start(0).unwrap();
//!
//! // Power on goes out at high priority...
//! kernel.set_power_on(true, 0);
//! kernel.poll(0);
//!
//! // ...and the simulated bus echo confirms it.
//! kernel.poll(1);
//! assert_eq!(kernel.global_power(), rs_loconet::TriState::True);
//! ```

use core::sync::atomic::{AtomicU32, Ordering};

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::config::Config;
use crate::fastclock::{FastClock, FastClockCell};
use crate::lncv::{command as lncv_command, LncvFrame, LncvSession, LncvState};
use crate::message::{opcode, Message, FAST_CLOCK_SLOT};
use crate::queue::{Priority, PrioritySendQueue};
use crate::slots::SlotTable;
use crate::traits::{
    DecoderChangeFlags, DecoderController, DecoderState, Direction, IdentificationController,
    InputController, IoError, IoHandler, OutputController, TriState, FUNCTION_COUNT,
};

/// Lowest valid input address.
pub const INPUT_ADDRESS_MIN: u16 = 1;
/// Highest valid input address.
pub const INPUT_ADDRESS_MAX: u16 = 4096;
/// Lowest valid output address.
pub const OUTPUT_ADDRESS_MIN: u16 = 1;
/// Highest valid output address.
pub const OUTPUT_ADDRESS_MAX: u16 = 4096;
/// Lowest valid identification address.
pub const IDENTIFICATION_ADDRESS_MIN: u16 = 1;
/// Highest valid identification address.
pub const IDENTIFICATION_ADDRESS_MAX: u16 = 4096;

/// Highest decoder address transmittable in a slot request (14 bit).
pub const DECODER_ADDRESS_MAX: u16 = 0x3FFF;

/// Error and recovery counters, shared with callers through an `Arc`.
///
/// Protocol-level errors are recovered locally (resync, drop, proceed);
/// these counters make the recovery observable.
#[derive(Debug, Default)]
pub struct KernelStats {
    framing_errors: AtomicU32,
    checksum_errors: AtomicU32,
    echo_timeouts: AtomicU32,
    response_timeouts: AtomicU32,
    queue_full_drops: AtomicU32,
    io_faults: AtomicU32,
}

impl KernelStats {
    fn add(counter: &AtomicU32, n: u32) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Frames lost to framing errors.
    pub fn framing_errors(&self) -> u32 {
        self.framing_errors.load(Ordering::Relaxed)
    }

    /// Frames rejected by checksum validation.
    pub fn checksum_errors(&self) -> u32 {
        self.checksum_errors.load(Ordering::Relaxed)
    }

    /// Transmitted frames never observed back on the bus.
    pub fn echo_timeouts(&self) -> u32 {
        self.echo_timeouts.load(Ordering::Relaxed)
    }

    /// Expected command-station responses that never arrived.
    pub fn response_timeouts(&self) -> u32 {
        self.response_timeouts.load(Ordering::Relaxed)
    }

    /// Messages dropped because a queue was full.
    pub fn queue_full_drops(&self) -> u32 {
        self.queue_full_drops.load(Ordering::Relaxed)
    }

    /// Transport-level send failures.
    pub fn io_faults(&self) -> u32 {
        self.io_faults.load(Ordering::Relaxed)
    }
}

/// What the in-flight request is waiting for after its echo.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ExpectedResponse {
    /// Slot data for a decoder address (after a slot request).
    SlotDataForAddress(u16),
    /// Slot data for a slot number (after a slot data request).
    SlotData(u8),
    /// Command-station acknowledge of a fast-clock broadcast.
    FastClockAck,
    /// Module confirmation of an LNCV session start.
    LncvStartResponse,
    /// Module answer to an LNCV read.
    LncvReadResponse(u16),
    /// Module acknowledge of an LNCV write.
    LncvWriteAck,
}

impl ExpectedResponse {
    fn matches(&self, msg: &Message) -> bool {
        match *self {
            Self::SlotDataForAddress(address) => match msg.slot_data() {
                Some(data) => {
                    data.slot != FAST_CLOCK_SLOT && (data.address == address || data.address == 0)
                }
                // A long acknowledge of the slot request means no free slot.
                None => matches!(msg.long_ack_fields(), Some((opcode::LOCO_ADR, _))),
            },
            Self::SlotData(slot) => msg.slot_data().is_some_and(|d| d.slot == slot),
            Self::FastClockAck => {
                matches!(msg.long_ack_fields(), Some((opcode::WR_SL_DATA, _)))
            }
            Self::LncvStartResponse | Self::LncvReadResponse(_) => LncvFrame::decode(msg)
                .is_some_and(|f| f.command == lncv_command::RESPONSE),
            Self::LncvWriteAck => {
                matches!(msg.long_ack_fields(), Some((opcode::PEER_XFER, _)))
            }
        }
    }
}

type PowerCallback = Box<dyn FnMut(bool) + Send + Sync>;
type IdleCallback = Box<dyn FnMut() + Send + Sync>;
type LncvReadCallback = Box<dyn FnMut(bool, u16, u16) + Send + Sync>;

/// The protocol kernel. See the [module documentation](self).
pub struct Kernel<H: IoHandler> {
    config: Config,
    io: H,

    send_queue: PrioritySendQueue,
    waiting_for_echo: bool,
    sent_priority: Priority,
    echo_deadline_ms: Option<u64>,
    expected_response: Option<ExpectedResponse>,
    response_deadline_ms: Option<u64>,
    idle_pending: bool,

    global_power: TriState,
    emergency_stop: TriState,

    slots: SlotTable,
    input_values: [TriState; INPUT_ADDRESS_MAX as usize],
    output_values: [TriState; OUTPUT_ADDRESS_MAX as usize],

    fast_clock: Arc<FastClockCell>,
    fast_clock_supported: bool,
    fast_clock_ack_misses: u8,
    next_fast_clock_sync_ms: Option<u64>,

    lncv: LncvSession,

    decoder_controller: Option<Box<dyn DecoderController + Send + Sync>>,
    input_controller: Option<Box<dyn InputController + Send + Sync>>,
    output_controller: Option<Box<dyn OutputController + Send + Sync>>,
    identification_controller: Option<Box<dyn IdentificationController + Send + Sync>>,
    on_global_power_changed: Option<PowerCallback>,
    on_idle: Option<IdleCallback>,
    on_lncv_read_response: Option<LncvReadCallback>,

    stats: Arc<KernelStats>,
}

impl<H: IoHandler> Kernel<H> {
    /// Create a kernel owning the given I/O handler.
    pub fn new(config: Config, io: H) -> Self {
        Self {
            config,
            io,
            send_queue: PrioritySendQueue::new(),
            waiting_for_echo: false,
            sent_priority: Priority::Normal,
            echo_deadline_ms: None,
            expected_response: None,
            response_deadline_ms: None,
            idle_pending: false,
            global_power: TriState::Undefined,
            emergency_stop: TriState::Undefined,
            slots: SlotTable::new(),
            input_values: [TriState::Undefined; INPUT_ADDRESS_MAX as usize],
            output_values: [TriState::Undefined; OUTPUT_ADDRESS_MAX as usize],
            fast_clock: Arc::new(FastClockCell::default()),
            fast_clock_supported: true,
            fast_clock_ack_misses: 0,
            next_fast_clock_sync_ms: None,
            lncv: LncvSession::default(),
            decoder_controller: None,
            input_controller: None,
            output_controller: None,
            identification_controller: None,
            on_global_power_changed: None,
            on_idle: None,
            on_lncv_read_response: None,
            stats: Arc::new(KernelStats::default()),
        }
    }

    // ------------------------------------------------------------------
    // Wiring and accessors
    // ------------------------------------------------------------------

    /// Access the I/O handler.
    ///
    /// The handler runs inside the kernel's loop; only use this while
    /// the kernel is not running, or from the loop itself.
    pub fn io_handler(&mut self) -> &mut H {
        &mut self.io
    }

    /// The shared fast-clock cell; the layout clock stores into it.
    pub fn fast_clock(&self) -> Arc<FastClockCell> {
        Arc::clone(&self.fast_clock)
    }

    /// The shared error counters.
    pub fn stats(&self) -> Arc<KernelStats> {
        Arc::clone(&self.stats)
    }

    /// Wire the decoder controller.
    pub fn set_decoder_controller(&mut self, controller: Box<dyn DecoderController + Send + Sync>) {
        self.decoder_controller = Some(controller);
    }

    /// Wire the input controller.
    pub fn set_input_controller(&mut self, controller: Box<dyn InputController + Send + Sync>) {
        self.input_controller = Some(controller);
    }

    /// Wire the output controller.
    pub fn set_output_controller(&mut self, controller: Box<dyn OutputController + Send + Sync>) {
        self.output_controller = Some(controller);
    }

    /// Wire the identification controller.
    pub fn set_identification_controller(
        &mut self,
        controller: Box<dyn IdentificationController + Send + Sync>,
    ) {
        self.identification_controller = Some(controller);
    }

    /// Wire the global-power change callback.
    pub fn set_on_global_power_changed(&mut self, callback: PowerCallback) {
        self.on_global_power_changed = Some(callback);
    }

    /// Wire the idle callback, invoked when the transmit side drains.
    pub fn set_on_idle(&mut self, callback: IdleCallback) {
        self.on_idle = Some(callback);
    }

    /// Wire the LNCV read-response callback.
    pub fn set_on_lncv_read_response(&mut self, callback: LncvReadCallback) {
        self.on_lncv_read_response = Some(callback);
    }

    /// Confirmed global track power state.
    pub fn global_power(&self) -> TriState {
        self.global_power
    }

    /// Confirmed emergency-stop state.
    pub fn emergency_stop_state(&self) -> TriState {
        self.emergency_stop
    }

    /// Shadowed input value (1-based address).
    pub fn input_value(&self, address: u16) -> TriState {
        if (INPUT_ADDRESS_MIN..=INPUT_ADDRESS_MAX).contains(&address) {
            self.input_values[(address - 1) as usize]
        } else {
            TriState::Undefined
        }
    }

    /// Shadowed output value (1-based address).
    pub fn output_value(&self, address: u16) -> TriState {
        if (OUTPUT_ADDRESS_MIN..=OUTPUT_ADDRESS_MAX).contains(&address) {
            self.output_values[(address - 1) as usize]
        } else {
            TriState::Undefined
        }
    }

    /// Whether the command station acknowledged fast-clock broadcasts.
    pub fn fast_clock_supported(&self) -> bool {
        self.fast_clock_supported
    }

    /// Current LNCV session state.
    pub fn lncv_state(&self) -> LncvState {
        self.lncv.state
    }

    /// The active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open the I/O handler and schedule periodic work.
    pub fn start(&mut self, now_ms: u64) -> Result<(), IoError> {
        self.io.start()?;
        if self.config.fast_clock_master {
            // First broadcast right away; its acknowledge doubles as
            // fast-clock support detection.
            self.next_fast_clock_sync_ms = Some(now_ms);
        }
        Ok(())
    }

    /// Cancel timers, flush queues, and close the I/O handler.
    pub fn stop(&mut self) {
        self.echo_deadline_ms = None;
        self.response_deadline_ms = None;
        self.next_fast_clock_sync_ms = None;
        self.waiting_for_echo = false;
        self.expected_response = None;
        self.send_queue.clear();
        self.io.stop();
    }

    /// Replace the configuration; active deadlines are rebased onto the
    /// new timeouts and the fast-clock schedule is recomputed.
    pub fn set_config(&mut self, config: Config, now_ms: u64) {
        let became_master = config.fast_clock_master && !self.config.fast_clock_master;
        let lost_master = !config.fast_clock_master && self.config.fast_clock_master;
        self.config = config;

        if self.echo_deadline_ms.is_some() {
            self.echo_deadline_ms = Some(now_ms + self.config.echo_timeout_ms as u64);
        }
        if self.response_deadline_ms.is_some() {
            self.response_deadline_ms = Some(now_ms + self.config.response_timeout_ms as u64);
        }
        if became_master {
            self.fast_clock_supported = true;
            self.fast_clock_ack_misses = 0;
            self.next_fast_clock_sync_ms = Some(now_ms);
        } else if lost_master {
            self.next_fast_clock_sync_ms = None;
        }
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    /// Drive the kernel: pump received frames, expire deadlines, emit
    /// scheduled broadcasts. Call frequently (the service layer does).
    pub fn poll(&mut self, now_ms: u64) {
        let (framing, checksum) = self.io.take_decode_errors();
        KernelStats::add(&self.stats.framing_errors, framing);
        KernelStats::add(&self.stats.checksum_errors, checksum);

        while let Some(msg) = self.io.recv() {
            self.receive(msg, now_ms);
        }

        if self
            .echo_deadline_ms
            .is_some_and(|deadline| now_ms >= deadline)
        {
            self.echo_timeout_expired(now_ms);
        }

        if self
            .response_deadline_ms
            .is_some_and(|deadline| now_ms >= deadline)
        {
            self.response_timeout_expired(now_ms);
        }

        if self
            .next_fast_clock_sync_ms
            .is_some_and(|deadline| now_ms >= deadline)
        {
            self.broadcast_fast_clock(now_ms);
        }

        self.send_next(now_ms);

        if self.idle_pending
            && self.send_queue.is_empty()
            && !self.waiting_for_echo
            && self.expected_response.is_none()
        {
            self.idle_pending = false;
            if let Some(on_idle) = self.on_idle.as_mut() {
                on_idle();
            }
        }
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Consume one complete frame from the bus.
    ///
    /// Called by the I/O pump and, for synthetic traffic, directly by
    /// `simulate_input_change` and tests.
    pub fn receive(&mut self, msg: Message, now_ms: u64) {
        if self.config.debug_log {
            log::debug!("rx {msg:?}");
        }

        if self.waiting_for_echo
            && self.send_queue.front_at(self.sent_priority).as_ref() == Some(&msg)
        {
            self.waiting_for_echo = false;
            self.echo_deadline_ms = None;
            self.send_queue.pop(self.sent_priority);
            self.echo_confirmed(&msg);
            match self.response_expectation(&msg) {
                Some(expected) => {
                    self.expected_response = Some(expected);
                    self.response_deadline_ms =
                        Some(now_ms + self.config.response_timeout_ms as u64);
                }
                None => self.send_next(now_ms),
            }
            return;
        }

        if let Some(expected) = self.expected_response {
            if expected.matches(&msg) {
                self.expected_response = None;
                self.response_deadline_ms = None;
                self.handle_response(expected, &msg, now_ms);
                self.send_next(now_ms);
                return;
            }
        }

        self.dispatch(&msg, now_ms);
    }

    /// Effects of our own frame, applied once its echo confirms it.
    fn echo_confirmed(&mut self, msg: &Message) {
        match msg.opcode() {
            opcode::GPON => {
                self.emergency_stop = TriState::Undefined;
                self.set_global_power(TriState::True);
            }
            opcode::GPOFF => self.set_global_power(TriState::False),
            opcode::IDLE => self.emergency_stop = TriState::True,
            opcode::SW_REQ => {
                if let Some((address, _on, closed)) = msg.sw_req_fields() {
                    self.set_output_value(address, TriState::from_bool(closed));
                }
            }
            opcode::LOCO_SPD
            | opcode::LOCO_DIRF
            | opcode::LOCO_SND
            | opcode::LOCO_F9F12
            | opcode::EXP_FUNCTIONS => self.apply_slot_write(msg, false),
            opcode::PEER_XFER => {
                if let Some(frame) = LncvFrame::decode(msg) {
                    if frame.command == lncv_command::PROG_STOP {
                        self.lncv.reset();
                    }
                }
            }
            _ => {}
        }
    }

    fn response_expectation(&self, msg: &Message) -> Option<ExpectedResponse> {
        match msg.opcode() {
            opcode::LOCO_ADR => msg
                .loco_adr_address()
                .map(ExpectedResponse::SlotDataForAddress),
            opcode::RQ_SL_DATA => msg.slot().map(ExpectedResponse::SlotData),
            opcode::WR_SL_DATA if msg.slot() == Some(FAST_CLOCK_SLOT) => {
                Some(ExpectedResponse::FastClockAck)
            }
            opcode::PEER_XFER => {
                let frame = LncvFrame::decode(msg)?;
                match frame.command {
                    lncv_command::PROG_START => Some(ExpectedResponse::LncvStartResponse),
                    lncv_command::READ => Some(ExpectedResponse::LncvReadResponse(frame.lncv)),
                    lncv_command::WRITE => Some(ExpectedResponse::LncvWriteAck),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn handle_response(&mut self, expected: ExpectedResponse, msg: &Message, now_ms: u64) {
        match expected {
            ExpectedResponse::SlotDataForAddress(address) => {
                if msg.slot_data().is_some() {
                    self.process_slot_data(msg, Some(address), now_ms);
                } else {
                    // Long acknowledge: the command station has no free slot.
                    log::warn!("no free slot for address {address}");
                    let _ = self.slots.take_pending(address);
                }
            }
            ExpectedResponse::SlotData(_) => self.process_slot_data(msg, None, now_ms),
            ExpectedResponse::FastClockAck => {
                self.fast_clock_ack_misses = 0;
                self.fast_clock_supported = true;
            }
            ExpectedResponse::LncvStartResponse => {
                if self.lncv.state == LncvState::Starting {
                    self.lncv.state = LncvState::Active;
                }
            }
            ExpectedResponse::LncvReadResponse(lncv) => {
                self.lncv.pending_read = None;
                let value = LncvFrame::decode(msg).map(|f| f.value).unwrap_or(0);
                if let Some(callback) = self.on_lncv_read_response.as_mut() {
                    callback(true, lncv, value);
                }
            }
            ExpectedResponse::LncvWriteAck => {}
        }
    }

    /// Bus traffic that is neither the awaited echo nor response.
    fn dispatch(&mut self, msg: &Message, now_ms: u64) {
        match msg.opcode() {
            // Another throttle may drive power and emergency stop too.
            opcode::GPON => {
                self.emergency_stop = TriState::Undefined;
                self.set_global_power(TriState::True);
            }
            opcode::GPOFF => self.set_global_power(TriState::False),
            opcode::IDLE => self.emergency_stop = TriState::True,
            opcode::INPUT_REP => {
                if let Some((address, on)) = msg.input_rep_fields() {
                    self.set_input_value(address, TriState::from_bool(on));
                }
            }
            opcode::SW_REQ | opcode::SW_REP => {
                if let Some((address, _on, closed)) = msg.sw_req_fields() {
                    self.set_output_value(address, TriState::from_bool(closed));
                }
            }
            opcode::SL_RD_DATA => self.process_slot_data(msg, None, now_ms),
            opcode::LOCO_SPD
            | opcode::LOCO_DIRF
            | opcode::LOCO_SND
            | opcode::LOCO_F9F12
            | opcode::EXP_FUNCTIONS => self.apply_slot_write(msg, true),
            opcode::MULTI_SENSE => {
                if let Some((zone, present, address)) = msg.multi_sense_fields() {
                    if (IDENTIFICATION_ADDRESS_MIN..=IDENTIFICATION_ADDRESS_MAX).contains(&zone) {
                        if let Some(controller) = self.identification_controller.as_mut() {
                            controller
                                .identification_event(zone, if present { address } else { 0 });
                        }
                    }
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Transmit path
    // ------------------------------------------------------------------

    /// Queue a frame for transmission. Returns `false` on a full queue.
    fn enqueue(&mut self, msg: Message, priority: Priority, now_ms: u64) -> bool {
        if self.config.listen_only {
            log::debug!("listen-only, dropping {msg:?}");
            return true;
        }
        if !self.send_queue.append(&msg, priority) {
            KernelStats::add(&self.stats.queue_full_drops, 1);
            log::warn!("send queue full, dropping {msg:?}");
            return false;
        }
        self.idle_pending = true;
        self.send_next(now_ms);
        true
    }

    /// Transmit the head of the highest-priority queue unless a frame is
    /// already in flight.
    fn send_next(&mut self, now_ms: u64) {
        while !self.waiting_for_echo && self.expected_response.is_none() {
            let Some((priority, msg)) = self.send_queue.front() else {
                return;
            };
            if self.io.send(&msg) {
                if self.config.debug_log {
                    log::debug!("tx {msg:?}");
                }
                self.waiting_for_echo = true;
                self.sent_priority = priority;
                self.echo_deadline_ms = Some(now_ms + self.config.echo_timeout_ms as u64);
                return;
            }
            // Transport refused the frame: drop it and move on.
            KernelStats::add(&self.stats.io_faults, 1);
            log::error!("transport rejected {msg:?}");
            self.send_queue.pop(priority);
        }
    }

    fn echo_timeout_expired(&mut self, now_ms: u64) {
        KernelStats::add(&self.stats.echo_timeouts, 1);
        if let Some(msg) = self.send_queue.front_at(self.sent_priority) {
            log::warn!("echo timeout, dropping {msg:?}");
        }
        self.send_queue.pop(self.sent_priority);
        self.waiting_for_echo = false;
        self.echo_deadline_ms = None;
        self.send_next(now_ms);
    }

    fn response_timeout_expired(&mut self, now_ms: u64) {
        KernelStats::add(&self.stats.response_timeouts, 1);
        self.response_deadline_ms = None;
        let Some(expected) = self.expected_response.take() else {
            return;
        };
        log::warn!("response timeout ({expected:?})");
        match expected {
            ExpectedResponse::LncvReadResponse(lncv) => {
                self.lncv.pending_read = None;
                if let Some(callback) = self.on_lncv_read_response.as_mut() {
                    callback(false, lncv, 0);
                }
            }
            ExpectedResponse::FastClockAck => {
                self.fast_clock_ack_misses = self.fast_clock_ack_misses.saturating_add(1);
                if self.fast_clock_ack_misses >= self.config.fast_clock_ack_limit {
                    log::warn!("fast clock not acknowledged, disabling broadcasts");
                    self.fast_clock_supported = false;
                    self.next_fast_clock_sync_ms = None;
                }
            }
            ExpectedResponse::SlotDataForAddress(address) => {
                let _ = self.slots.take_pending(address);
            }
            ExpectedResponse::LncvStartResponse => self.lncv.reset(),
            _ => {}
        }
        self.send_next(now_ms);
    }

    // ------------------------------------------------------------------
    // Power and emergency stop
    // ------------------------------------------------------------------

    /// Queue a global power command at high priority.
    pub fn set_power_on(&mut self, on: bool, now_ms: u64) {
        let msg = if on { Message::gpon() } else { Message::gpoff() };
        let _ = self.enqueue(msg, Priority::High, now_ms);
    }

    /// Queue a broadcast emergency stop at high priority.
    pub fn emergency_stop(&mut self, now_ms: u64) {
        let _ = self.enqueue(Message::idle(), Priority::High, now_ms);
    }

    /// Resume from emergency stop (re-enables track power).
    pub fn resume(&mut self, now_ms: u64) {
        let _ = self.enqueue(Message::gpon(), Priority::High, now_ms);
    }

    fn set_global_power(&mut self, value: TriState) {
        if self.global_power == value {
            return;
        }
        self.global_power = value;
        if let (Some(callback), Some(on)) =
            (self.on_global_power_changed.as_mut(), value.as_bool())
        {
            callback(on);
        }
    }

    // ------------------------------------------------------------------
    // Throttle flow
    // ------------------------------------------------------------------

    /// Diff a requested decoder state against the slot shadow and queue
    /// whatever frames are needed at normal priority.
    ///
    /// With no slot cached for the address, the frames wait per address
    /// while a single slot request goes out; the arriving slot data
    /// drains them in order.
    pub fn decoder_changed(
        &mut self,
        decoder: &DecoderState,
        changes: DecoderChangeFlags,
        function_number: u32,
        now_ms: u64,
    ) {
        if decoder.address == 0 || decoder.address > DECODER_ADDRESS_MAX {
            log::warn!("decoder address {} out of range", decoder.address);
            return;
        }

        match self.slots.slot_for_address(decoder.address) {
            Some(slot) => {
                let messages = self.throttle_messages(Some(slot), decoder, changes, function_number);
                for msg in messages {
                    let _ = self.enqueue(msg, Priority::Normal, now_ms);
                }
            }
            None => {
                // Slot placeholder 0 is rewritten when the slot arrives.
                let first_request = !self.slots.has_pending(decoder.address);
                let messages = self.throttle_messages(None, decoder, changes, function_number);
                for msg in messages {
                    if !self.slots.push_pending(decoder.address, msg) {
                        KernelStats::add(&self.stats.queue_full_drops, 1);
                        log::warn!("pending queue full for address {}", decoder.address);
                    }
                }
                if first_request && self.slots.has_pending(decoder.address) {
                    let _ = self.enqueue(
                        Message::loco_adr(decoder.address),
                        Priority::Normal,
                        now_ms,
                    );
                }
            }
        }
    }

    /// Frames implementing a decoder delta. `slot` of `None` builds them
    /// against an unknown shadow (everything requested is emitted).
    fn throttle_messages(
        &self,
        slot: Option<u8>,
        decoder: &DecoderState,
        changes: DecoderChangeFlags,
        function_number: u32,
    ) -> heapless::Vec<Message, 4> {
        let shadow = slot.and_then(|n| self.slots.slot(n)).copied();
        let slot_number = slot.unwrap_or(0);
        let mut messages = heapless::Vec::new();

        if changes.intersects(DecoderChangeFlags::SPEED | DecoderChangeFlags::EMERGENCY_STOP) {
            let spd = crate::message::spd_byte(decoder.speed_step, decoder.emergency_stop);
            if shadow.map_or(true, |s| s.speed != spd) {
                let _ = messages.push(Message::loco_spd(slot_number, spd));
            }
        }

        let function_changed = changes.contains(DecoderChangeFlags::FUNCTION_VALUE);
        let dirf_function = function_changed && function_number <= 4;
        if changes.contains(DecoderChangeFlags::DIRECTION) || dirf_function {
            let differs = shadow.map_or(true, |s| {
                s.direction != decoder.direction
                    || (0..=4).any(|n| {
                        s.functions[n] != TriState::from_bool(decoder.functions[n])
                    })
            });
            if differs {
                let _ = messages.push(Message::loco_dirf(
                    slot_number,
                    decoder.direction,
                    &decoder.functions,
                ));
            }
        }

        if function_changed {
            let n = function_number as usize;
            let group = match n {
                5..=8 => Some(Message::loco_snd(slot_number, &decoder.functions)),
                9..=12 => Some(Message::loco_f9f12(slot_number, &decoder.functions)),
                13..=19 => Some(Message::loco_f13f19(slot_number, &decoder.functions)),
                21..=27 => Some(Message::loco_f21f27(slot_number, &decoder.functions)),
                20 | 28 => Some(Message::loco_f12f20f28(slot_number, &decoder.functions)),
                _ => None,
            };
            if let Some(msg) = group {
                let differs = match (shadow, n) {
                    (Some(s), _) if n < FUNCTION_COUNT => {
                        s.functions[n] != TriState::from_bool(decoder.functions[n])
                    }
                    _ => true,
                };
                if differs {
                    let _ = messages.push(msg);
                }
            }
        }

        messages
    }

    /// Update a slot shadow from a throttle frame confirmed on the bus.
    ///
    /// `notify` distinguishes foreign traffic (pushed to the decoder
    /// controller) from our own echoes (shadow update only).
    fn apply_slot_write(&mut self, msg: &Message, notify: bool) {
        let Some(slot_number) = msg.slot() else {
            return;
        };
        let Some(slot) = self.slots.slot_mut(slot_number) else {
            return;
        };
        if !slot.is_address_valid() {
            return;
        }
        let bytes = msg.as_bytes();
        match msg.opcode() {
            opcode::LOCO_SPD => slot.speed = bytes[2],
            opcode::LOCO_DIRF => {
                let dirf = bytes[2];
                slot.direction = if dirf & 0x20 != 0 {
                    Direction::Reverse
                } else {
                    Direction::Forward
                };
                slot.functions[0] = TriState::from_bool(dirf & 0x10 != 0);
                for n in 1..=4usize {
                    slot.functions[n] = TriState::from_bool(dirf & (1 << (n - 1)) != 0);
                }
            }
            opcode::LOCO_SND => {
                for n in 5..=8usize {
                    slot.functions[n] = TriState::from_bool(bytes[2] & (1 << (n - 5)) != 0);
                }
            }
            opcode::LOCO_F9F12 => {
                for n in 9..=12usize {
                    slot.functions[n] = TriState::from_bool(bytes[2] & (1 << (n - 9)) != 0);
                }
            }
            opcode::EXP_FUNCTIONS => {
                let bits = bytes[4];
                match bytes[3] {
                    crate::message::EXP_GROUP_F13F19 => {
                        for n in 13..=19usize {
                            slot.functions[n] = TriState::from_bool(bits & (1 << (n - 13)) != 0);
                        }
                    }
                    crate::message::EXP_GROUP_F21F27 => {
                        for n in 21..=27usize {
                            slot.functions[n] = TriState::from_bool(bits & (1 << (n - 21)) != 0);
                        }
                    }
                    crate::message::EXP_GROUP_F12F20F28 => {
                        slot.functions[12] = TriState::from_bool(bits & 0x10 != 0);
                        slot.functions[20] = TriState::from_bool(bits & 0x20 != 0);
                        slot.functions[28] = TriState::from_bool(bits & 0x40 != 0);
                    }
                    _ => {}
                }
            }
            _ => {}
        }

        if notify {
            let snapshot = Self::slot_snapshot(slot);
            if let Some(controller) = self.decoder_controller.as_mut() {
                controller.update_decoder(&snapshot);
            }
        }
    }

    fn slot_snapshot(slot: &crate::slots::LocoSlot) -> DecoderState {
        let mut state = DecoderState::new(slot.address);
        state.direction = slot.direction;
        if slot.speed != crate::slots::LocoSlot::INVALID_SPEED {
            match slot.speed {
                0 => state.speed_step = 0,
                1 => state.emergency_stop = true,
                n => state.speed_step = (n & 0x7F) - 1,
            }
        }
        for (n, f) in slot.functions.iter().enumerate() {
            state.functions[n] = *f == TriState::True;
        }
        state
    }

    /// Slot data arrived: bind the slot, refresh its shadow, and drain
    /// any frames waiting on the address.
    fn process_slot_data(&mut self, msg: &Message, awaited_address: Option<u16>, now_ms: u64) {
        if let Some((rate, hour, minute)) = msg.fast_clock() {
            if !self.config.fast_clock_master {
                self.fast_clock.store(FastClock::new(rate, hour, minute));
            }
            return;
        }
        let Some(data) = msg.slot_data() else {
            return;
        };

        if let Some(address) = awaited_address {
            // A free slot offered while we wait is ours to claim.
            if data.address == address || data.address == 0 {
                self.slots.assign(data.slot, address);
                if data.address != 0 {
                    self.refresh_slot_shadow(data);
                }
                self.drain_pending(address, data.slot, now_ms);
                return;
            }
        }

        if data.address == 0 {
            self.slots.clear_slot(data.slot);
            return;
        }

        self.slots.assign(data.slot, data.address);
        self.refresh_slot_shadow(data);
        // Also satisfies throttle changes that raced the slot request.
        self.drain_pending(data.address, data.slot, now_ms);
    }

    fn refresh_slot_shadow(&mut self, data: crate::message::SlotData) {
        if let Some(slot) = self.slots.slot_mut(data.slot) {
            slot.speed = data.spd;
            slot.direction = data.direction();
            slot.functions[0] = TriState::from_bool(data.dirf & 0x10 != 0);
            for n in 1..=4usize {
                slot.functions[n] = TriState::from_bool(data.dirf & (1 << (n - 1)) != 0);
            }
        }
    }

    fn drain_pending(&mut self, address: u16, slot: u8, now_ms: u64) {
        let pending = self.slots.take_pending(address);
        for mut msg in pending {
            if msg.set_slot(slot) {
                let _ = self.enqueue(msg, Priority::Normal, now_ms);
            }
        }
    }

    // ------------------------------------------------------------------
    // Inputs, outputs, identification
    // ------------------------------------------------------------------

    /// Queue a switch request. Returns `false` for an out-of-range
    /// address or a full queue; the shadow updates on echo.
    pub fn set_output(&mut self, address: u16, value: bool, now_ms: u64) -> bool {
        if !(OUTPUT_ADDRESS_MIN..=OUTPUT_ADDRESS_MAX).contains(&address) {
            return false;
        }
        self.enqueue(Message::sw_req(address, true, value), Priority::Normal, now_ms)
    }

    /// Inject a synthetic, toggled input report into the receive path.
    pub fn simulate_input_change(&mut self, address: u16, now_ms: u64) {
        if !(INPUT_ADDRESS_MIN..=INPUT_ADDRESS_MAX).contains(&address) {
            return;
        }
        let on = self.input_values[(address - 1) as usize] != TriState::True;
        self.receive(Message::input_rep(address, on), now_ms);
    }

    fn set_input_value(&mut self, address: u16, value: TriState) {
        if !(INPUT_ADDRESS_MIN..=INPUT_ADDRESS_MAX).contains(&address) {
            return;
        }
        let shadow = &mut self.input_values[(address - 1) as usize];
        if *shadow == value {
            return;
        }
        *shadow = value;
        if let Some(controller) = self.input_controller.as_mut() {
            controller.update_input_value(address, value);
        }
    }

    fn set_output_value(&mut self, address: u16, value: TriState) {
        if !(OUTPUT_ADDRESS_MIN..=OUTPUT_ADDRESS_MAX).contains(&address) {
            return;
        }
        let shadow = &mut self.output_values[(address - 1) as usize];
        if *shadow == value {
            return;
        }
        *shadow = value;
        if let Some(controller) = self.output_controller.as_mut() {
            controller.update_output_value(address, value);
        }
    }

    // ------------------------------------------------------------------
    // Fast clock
    // ------------------------------------------------------------------

    /// The layout clock changed: broadcast immediately when master.
    pub fn fast_clock_changed(&mut self, now_ms: u64) {
        if self.config.fast_clock_master && self.fast_clock_supported {
            self.broadcast_fast_clock(now_ms);
        }
    }

    /// Ask the command station for the current fast time (follower
    /// mode); the answer lands in the shared cell.
    pub fn request_fast_clock(&mut self, now_ms: u64) {
        if self.config.fast_clock_master {
            return;
        }
        let _ = self.enqueue(
            Message::rq_sl_data(FAST_CLOCK_SLOT),
            Priority::Low,
            now_ms,
        );
    }

    fn broadcast_fast_clock(&mut self, now_ms: u64) {
        let clock = self.fast_clock.load();
        let _ = self.enqueue(
            Message::wr_fast_clock(clock.multiplier, clock.hour, clock.minute),
            Priority::Low,
            now_ms,
        );
        self.next_fast_clock_sync_ms =
            Some(now_ms + self.config.fast_clock_sync_interval_ms as u64);
    }

    // ------------------------------------------------------------------
    // LNCV session
    // ------------------------------------------------------------------

    /// Open a programming session for a module.
    pub fn lncv_start(&mut self, module_id: u16, module_address: u16, now_ms: u64) {
        if self.lncv.state != LncvState::Inactive {
            log::warn!("LNCV session already open");
            return;
        }
        self.lncv.state = LncvState::Starting;
        self.lncv.module_id = module_id;
        self.lncv.module_address = module_address;
        let frame = LncvFrame::prog_start(module_id, module_address);
        let _ = self.enqueue(frame.encode(), Priority::Normal, now_ms);
    }

    /// Read one variable; the result arrives through the wired
    /// read-response callback. Valid only in the active session state
    /// with no read outstanding.
    pub fn lncv_read(&mut self, lncv: u16, now_ms: u64) {
        if self.lncv.state != LncvState::Active || self.lncv.pending_read.is_some() {
            log::warn!("LNCV read rejected (state {:?})", self.lncv.state);
            return;
        }
        self.lncv.pending_read = Some(lncv);
        let frame = LncvFrame::read(self.lncv.module_id, lncv, self.lncv.module_address);
        let _ = self.enqueue(frame.encode(), Priority::Normal, now_ms);
    }

    /// Write one variable (fire and forget; the module acknowledges).
    pub fn lncv_write(&mut self, lncv: u16, value: u16, now_ms: u64) {
        if self.lncv.state != LncvState::Active {
            log::warn!("LNCV write rejected (state {:?})", self.lncv.state);
            return;
        }
        let frame = LncvFrame::write(self.lncv.module_id, lncv, value);
        let _ = self.enqueue(frame.encode(), Priority::Normal, now_ms);
    }

    /// Close the session; the state returns to inactive on echo.
    pub fn lncv_stop(&mut self, now_ms: u64) {
        if matches!(self.lncv.state, LncvState::Inactive | LncvState::Stopping) {
            return;
        }
        self.lncv.state = LncvState::Stopping;
        let frame = LncvFrame::prog_stop(self.lncv.module_id, self.lncv.module_address);
        let _ = self.enqueue(frame.encode(), Priority::Normal, now_ms);
    }
}
