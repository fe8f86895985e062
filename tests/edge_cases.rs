//! Edge case and boundary condition tests for the kernel.

use rs_loconet::hal::SimIoHandler;
use rs_loconet::kernel::Kernel;
use rs_loconet::message::{opcode, Message};
use rs_loconet::{Config, DecoderChangeFlags, DecoderState, Direction, TriState};

fn started_kernel(sim: SimIoHandler) -> Kernel<SimIoHandler> {
    let mut kernel = Kernel::new(Config::default(), sim);
    kernel.start(0).unwrap();
    kernel
}

fn settle(kernel: &mut Kernel<SimIoHandler>, mut now_ms: u64) {
    for _ in 0..32 {
        kernel.poll(now_ms);
        now_ms += 1;
    }
}

// ============================================================================
// Address boundaries
// ============================================================================

#[test]
fn output_address_bounds() {
    let mut kernel = started_kernel(SimIoHandler::new());
    assert!(!kernel.set_output(0, true, 0));
    assert!(!kernel.set_output(4097, true, 0));
    assert!(kernel.set_output(1, true, 0));
    assert!(kernel.set_output(4096, true, 0));
    settle(&mut kernel, 1);
    assert_eq!(kernel.output_value(1), TriState::True);
    assert_eq!(kernel.output_value(4096), TriState::True);
}

#[test]
fn out_of_range_shadow_reads_are_undefined() {
    let kernel = started_kernel(SimIoHandler::new());
    assert_eq!(kernel.input_value(0), TriState::Undefined);
    assert_eq!(kernel.input_value(5000), TriState::Undefined);
    assert_eq!(kernel.output_value(0), TriState::Undefined);
}

#[test]
fn simulate_input_change_on_invalid_address_is_a_no_op() {
    let mut kernel = started_kernel(SimIoHandler::new());
    kernel.simulate_input_change(0, 0);
    kernel.simulate_input_change(4097, 0);
    assert!(kernel.io_handler().sent.is_empty());
}

#[test]
fn decoder_address_bounds() {
    let mut kernel = started_kernel(SimIoHandler::new());
    kernel.decoder_changed(
        &DecoderState::new(0).with_speed_step(1),
        DecoderChangeFlags::SPEED,
        0,
        0,
    );
    kernel.decoder_changed(
        &DecoderState::new(0x4000).with_speed_step(1),
        DecoderChangeFlags::SPEED,
        0,
        0,
    );
    assert!(kernel.io_handler().sent.is_empty());
}

// ============================================================================
// Queue saturation
// ============================================================================

#[test]
fn queue_full_is_reported_and_counted() {
    let mut kernel = started_kernel(SimIoHandler::new());
    let stats = kernel.stats();

    // Never poll: the first frame stays in flight and the rest pile up
    // until the arena is full.
    let mut accepted = 0u32;
    let mut rejected = 0u32;
    for i in 0..2_000u16 {
        if kernel.set_output(1 + (i % 4096), true, 0) {
            accepted += 1;
        } else {
            rejected += 1;
        }
    }
    assert!(accepted > 0);
    assert!(rejected > 0);
    assert_eq!(stats.queue_full_drops(), rejected);
}

// ============================================================================
// Input report bit packing
// ============================================================================

#[test]
fn input_addresses_with_odd_and_even_encoding() {
    let mut kernel = started_kernel(SimIoHandler::new());
    // Adjacent addresses differ only in the DS select bit; make sure
    // they land on distinct shadow entries.
    for address in [1u16, 2, 3, 4, 4095, 4096] {
        kernel.io_handler().inject(Message::input_rep(address, true));
    }
    kernel.poll(1);
    for address in [1u16, 2, 3, 4, 4095, 4096] {
        assert_eq!(kernel.input_value(address), TriState::True, "address {address}");
    }
    assert_eq!(kernel.input_value(5), TriState::Undefined);
}

// ============================================================================
// Speed encoding extremes
// ============================================================================

#[test]
fn emergency_stop_flag_wins_over_speed_step() {
    let sim = SimIoHandler::new().with_command_station();
    let mut kernel = started_kernel(sim);

    let decoder = DecoderState::new(3)
        .with_speed_step(100)
        .with_emergency_stop(true);
    kernel.decoder_changed(&decoder, DecoderChangeFlags::EMERGENCY_STOP, 0, 0);
    settle(&mut kernel, 1);

    let spd = kernel.io_handler().sent_with_opcode(opcode::LOCO_SPD);
    assert_eq!(spd[0].as_bytes()[2], 1); // emergency-stop encoding
}

#[test]
fn max_speed_step_encodes_to_seven_bits() {
    let sim = SimIoHandler::new().with_command_station();
    let mut kernel = started_kernel(sim);

    let decoder = DecoderState::new(3).with_speed_step(126);
    kernel.decoder_changed(&decoder, DecoderChangeFlags::SPEED, 0, 0);
    settle(&mut kernel, 1);

    let spd = kernel.io_handler().sent_with_opcode(opcode::LOCO_SPD);
    assert_eq!(spd[0].as_bytes()[2], 127);
}

// ============================================================================
// Function groups
// ============================================================================

#[test]
fn function_changes_pick_the_right_group_message() {
    let sim = SimIoHandler::new().with_command_station();
    let mut kernel = started_kernel(sim);

    // Acquire a slot first.
    let base = DecoderState::new(3);
    kernel.decoder_changed(&base, DecoderChangeFlags::SPEED, 0, 0);
    settle(&mut kernel, 1);
    kernel.io_handler().clear_sent();

    let cases: &[(usize, u8)] = &[
        (0, opcode::LOCO_DIRF),
        (4, opcode::LOCO_DIRF),
        (5, opcode::LOCO_SND),
        (8, opcode::LOCO_SND),
        (9, opcode::LOCO_F9F12),
        (13, opcode::EXP_FUNCTIONS),
        (21, opcode::EXP_FUNCTIONS),
        (28, opcode::EXP_FUNCTIONS),
    ];
    let mut now = 100;
    for &(function, expected_opcode) in cases {
        kernel.io_handler().clear_sent();
        let state = base.with_function(function, true);
        kernel.decoder_changed(
            &state,
            DecoderChangeFlags::FUNCTION_VALUE,
            function as u32,
            now,
        );
        settle(&mut kernel, now + 1);
        let sent = kernel.io_handler().sent_with_opcode(expected_opcode);
        assert!(
            !sent.is_empty(),
            "function {function} produced no {expected_opcode:#04X} frame"
        );
        now += 100;
        // Reset the function for the next case.
        kernel.decoder_changed(
            &base,
            DecoderChangeFlags::FUNCTION_VALUE,
            function as u32,
            now,
        );
        settle(&mut kernel, now + 1);
        now += 100;
    }
}

// ============================================================================
// Slot table consistency
// ============================================================================

#[test]
fn command_station_moving_an_address_rebinds_the_slot() {
    let mut kernel = started_kernel(SimIoHandler::new());

    kernel.decoder_changed(
        &DecoderState::new(3).with_speed_step(10),
        DecoderChangeFlags::SPEED,
        0,
        0,
    );
    kernel.poll(1);
    kernel.io_handler().inject(Message::slot_read_data(5, 3, 0, 0));
    settle(&mut kernel, 2);

    // The command station later reports the same address in a new slot.
    kernel.io_handler().inject(Message::slot_read_data(9, 3, 0, 0));
    settle(&mut kernel, 100);
    kernel.io_handler().clear_sent();

    // New traffic for the address uses the new slot.
    kernel.decoder_changed(
        &DecoderState::new(3).with_speed_step(50),
        DecoderChangeFlags::SPEED,
        0,
        200,
    );
    settle(&mut kernel, 201);
    let spd = kernel.io_handler().sent_with_opcode(opcode::LOCO_SPD);
    assert_eq!(spd[0].as_bytes()[1], 9);
}

#[test]
fn slot_request_timeout_drops_pending_then_recovers() {
    let mut kernel = started_kernel(SimIoHandler::new());
    let stats = kernel.stats();

    kernel.decoder_changed(
        &DecoderState::new(3).with_speed_step(10),
        DecoderChangeFlags::SPEED,
        0,
        0,
    );
    kernel.poll(1); // echo consumed, awaiting slot data

    // No slot data ever arrives.
    kernel.poll(1_000);
    assert_eq!(stats.response_timeouts(), 1);

    // A later change starts a fresh acquisition.
    kernel.decoder_changed(
        &DecoderState::new(3).with_speed_step(20),
        DecoderChangeFlags::SPEED,
        0,
        2_000,
    );
    assert_eq!(
        kernel.io_handler().sent_with_opcode(opcode::LOCO_ADR).len(),
        2
    );
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn listen_only_never_transmits() {
    let config = Config::default().with_listen_only(true);
    let mut kernel = Kernel::new(config, SimIoHandler::new());
    kernel.start(0).unwrap();

    kernel.set_power_on(true, 0);
    assert!(kernel.set_output(1, true, 0));
    settle(&mut kernel, 1);
    assert!(kernel.io_handler().sent.is_empty());

    // Receiving still works.
    kernel.io_handler().inject(Message::input_rep(9, true));
    kernel.poll(100);
    assert_eq!(kernel.input_value(9), TriState::True);
}

#[test]
fn set_config_rebases_a_running_echo_timer() {
    struct NullIo;
    impl rs_loconet::IoHandler for NullIo {
        fn start(&mut self) -> Result<(), rs_loconet::IoError> {
            Ok(())
        }
        fn stop(&mut self) {}
        fn send(&mut self, _message: &Message) -> bool {
            true
        }
        fn recv(&mut self) -> Option<Message> {
            None
        }
    }

    let mut kernel = Kernel::new(Config::default(), NullIo);
    let stats = kernel.stats();
    kernel.start(0).unwrap();

    assert!(kernel.set_output(1, true, 0)); // in flight, deadline 250
    kernel.set_config(Config::default().with_echo_timeout_ms(100), 50); // deadline 150

    kernel.poll(149);
    assert_eq!(stats.echo_timeouts(), 0);
    kernel.poll(151);
    assert_eq!(stats.echo_timeouts(), 1);
}

#[test]
fn becoming_fast_clock_master_at_runtime_schedules_a_broadcast() {
    let sim = SimIoHandler::new().with_command_station();
    let mut kernel = started_kernel(sim);
    assert!(kernel.io_handler().sent_with_opcode(opcode::WR_SL_DATA).is_empty());

    kernel.set_config(Config::default().with_fast_clock_master(true), 10);
    settle(&mut kernel, 10);
    assert_eq!(
        kernel.io_handler().sent_with_opcode(opcode::WR_SL_DATA).len(),
        1
    );
}

// ============================================================================
// Direction edge
// ============================================================================

#[test]
fn direction_reversal_round_trips_through_the_slot_shadow() {
    let sim = SimIoHandler::new().with_command_station();
    let mut kernel = started_kernel(sim);

    let forward = DecoderState::new(3).with_direction(Direction::Forward);
    kernel.decoder_changed(&forward, DecoderChangeFlags::DIRECTION, 0, 0);
    settle(&mut kernel, 1);
    kernel.io_handler().clear_sent();

    // Same direction again: suppressed by the shadow diff.
    kernel.decoder_changed(&forward, DecoderChangeFlags::DIRECTION, 0, 100);
    settle(&mut kernel, 101);
    assert!(kernel.io_handler().sent_with_opcode(opcode::LOCO_DIRF).is_empty());

    // Reversal goes out.
    let reverse = forward.with_direction(Direction::Reverse);
    kernel.decoder_changed(&reverse, DecoderChangeFlags::DIRECTION, 0, 200);
    settle(&mut kernel, 201);
    let dirf = kernel.io_handler().sent_with_opcode(opcode::LOCO_DIRF);
    assert_eq!(dirf.len(), 1);
    assert_ne!(dirf[0].as_bytes()[2] & 0x20, 0);
}
