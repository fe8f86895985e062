//! Threaded kernel runner: the post-from-any-thread surface.
//!
//! [`KernelRunner`] owns a [`Kernel`] and runs it on a dedicated worker
//! thread. All kernel state lives on that thread; public methods post
//! copy-by-value tasks onto a mailbox the loop drains between I/O pumps,
//! so they are safe to call from any thread while the kernel runs.
//! Collaborators (controllers and callbacks) are wired only while the
//! runner is stopped — wiring methods panic otherwise, which turns a
//! lifecycle misuse into an immediate, loud failure instead of a race.
//!
//! The loop waits on the mailbox with a short timeout, so posted tasks
//! run promptly while timers and the I/O pump still tick when the bus
//! is quiet. A unified `Instant`-based time base feeds every kernel
//! operation, mirroring how the deterministic core is tested.
//!
//! # Example
//!
//! ```rust
//! use rs_loconet::hal::SimIoHandler;
//! use rs_loconet::service::KernelRunner;
//! use rs_loconet::Config;
//!
//! let mut runner = KernelRunner::new(Config::default(), SimIoHandler::new());
//! runner.start();
//! runner.set_power_on(true);
//! runner.stop();
//! ```

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::fastclock::FastClockCell;
use crate::kernel::{Kernel, KernelStats, OUTPUT_ADDRESS_MAX, OUTPUT_ADDRESS_MIN};
use crate::traits::{
    DecoderChangeFlags, DecoderController, DecoderState, IdentificationController,
    InputController, IoHandler, OutputController,
};

/// Mailbox wait, and therefore the timer/I/O tick when the bus is quiet.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Work posted onto the event loop.
enum Task {
    SetPowerOn(bool),
    EmergencyStop,
    Resume,
    DecoderChanged {
        state: DecoderState,
        changes: DecoderChangeFlags,
        function_number: u32,
    },
    SetOutput {
        address: u16,
        value: bool,
    },
    SimulateInputChange(u16),
    LncvStart {
        module_id: u16,
        module_address: u16,
    },
    LncvRead(u16),
    LncvWrite {
        lncv: u16,
        value: u16,
    },
    LncvStop,
    FastClockChanged,
    SetConfig(Config),
    Shutdown,
}

/// Runs a [`Kernel`] on a worker thread. See the [module docs](self).
pub struct KernelRunner<H: IoHandler + Send + 'static> {
    kernel: Option<Kernel<H>>,
    on_started: Option<Box<dyn FnMut() + Send + Sync>>,
    tx: Option<mpsc::Sender<Task>>,
    thread: Option<JoinHandle<Kernel<H>>>,
    fast_clock: Arc<FastClockCell>,
    stats: Arc<KernelStats>,
}

impl<H: IoHandler + Send + 'static> KernelRunner<H> {
    /// Create a stopped runner owning a new kernel.
    pub fn new(config: Config, io: H) -> Self {
        let kernel = Kernel::new(config, io);
        let fast_clock = kernel.fast_clock();
        let stats = kernel.stats();
        Self {
            kernel: Some(kernel),
            on_started: None,
            tx: None,
            thread: None,
            fast_clock,
            stats,
        }
    }

    /// True while the worker thread runs.
    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// The shared fast-clock cell (valid across start/stop cycles).
    pub fn fast_clock(&self) -> Arc<FastClockCell> {
        Arc::clone(&self.fast_clock)
    }

    /// The shared error counters.
    pub fn stats(&self) -> Arc<KernelStats> {
        Arc::clone(&self.stats)
    }

    fn kernel_mut(&mut self) -> &mut Kernel<H> {
        self.kernel
            .as_mut()
            .expect("kernel collaborators may only be wired while stopped")
    }

    // ------------------------------------------------------------------
    // Wiring (stopped only)
    // ------------------------------------------------------------------

    /// Wire the startup callback, invoked once the transport opens.
    ///
    /// # Panics
    ///
    /// Panics while running, as do all wiring methods.
    pub fn set_on_started(&mut self, callback: Box<dyn FnMut() + Send + Sync>) {
        assert!(!self.is_running(), "wiring while running");
        self.on_started = Some(callback);
    }

    /// Wire the global-power change callback.
    pub fn set_on_global_power_changed(&mut self, callback: Box<dyn FnMut(bool) + Send + Sync>) {
        self.kernel_mut().set_on_global_power_changed(callback);
    }

    /// Wire the idle callback.
    pub fn set_on_idle(&mut self, callback: Box<dyn FnMut() + Send + Sync>) {
        self.kernel_mut().set_on_idle(callback);
    }

    /// Wire the LNCV read-response callback.
    pub fn set_on_lncv_read_response(&mut self, callback: Box<dyn FnMut(bool, u16, u16) + Send + Sync>) {
        self.kernel_mut().set_on_lncv_read_response(callback);
    }

    /// Wire the decoder controller.
    pub fn set_decoder_controller(&mut self, controller: Box<dyn DecoderController + Send + Sync>) {
        self.kernel_mut().set_decoder_controller(controller);
    }

    /// Wire the input controller.
    pub fn set_input_controller(&mut self, controller: Box<dyn InputController + Send + Sync>) {
        self.kernel_mut().set_input_controller(controller);
    }

    /// Wire the output controller.
    pub fn set_output_controller(&mut self, controller: Box<dyn OutputController + Send + Sync>) {
        self.kernel_mut().set_output_controller(controller);
    }

    /// Wire the identification controller.
    pub fn set_identification_controller(
        &mut self,
        controller: Box<dyn IdentificationController + Send + Sync>,
    ) {
        self.kernel_mut().set_identification_controller(controller);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Spawn the worker thread and open the transport on it.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let mut kernel = self.kernel.take().expect("kernel present while stopped");
        let mut on_started = self.on_started.take();
        let (tx, rx) = mpsc::channel();
        self.tx = Some(tx);

        let thread = std::thread::Builder::new()
            .name("loconet-kernel".into())
            .spawn(move || {
                let start_time = Instant::now();
                let now = || start_time.elapsed().as_millis() as u64;

                match kernel.start(now()) {
                    Ok(()) => {
                        if let Some(callback) = on_started.as_mut() {
                            callback();
                        }
                    }
                    Err(e) => log::error!("failed to open transport: {e}"),
                }

                'run: loop {
                    match rx.recv_timeout(POLL_INTERVAL) {
                        Ok(Task::Shutdown) | Err(RecvTimeoutError::Disconnected) => break 'run,
                        Ok(task) => {
                            apply(&mut kernel, task, now());
                            // Drain whatever else was posted meanwhile.
                            while let Ok(task) = rx.try_recv() {
                                if matches!(task, Task::Shutdown) {
                                    break 'run;
                                }
                                apply(&mut kernel, task, now());
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    kernel.poll(now());
                }

                kernel.stop();
                kernel
            })
            .expect("spawn kernel thread");
        self.thread = Some(thread);
    }

    /// Stop the worker thread, recovering the kernel for re-wiring.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Task::Shutdown);
        }
        match thread.join() {
            Ok(kernel) => self.kernel = Some(kernel),
            Err(_) => log::error!("kernel thread panicked"),
        }
    }

    fn post(&self, task: Task) -> bool {
        match &self.tx {
            Some(tx) => tx.send(task).is_ok(),
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Operations (any thread)
    // ------------------------------------------------------------------

    /// Queue a global power command.
    pub fn set_power_on(&self, on: bool) {
        let _ = self.post(Task::SetPowerOn(on));
    }

    /// Queue a broadcast emergency stop.
    pub fn emergency_stop(&self) {
        let _ = self.post(Task::EmergencyStop);
    }

    /// Resume from emergency stop.
    pub fn resume(&self) {
        let _ = self.post(Task::Resume);
    }

    /// Diff-and-transmit a decoder change.
    pub fn decoder_changed(
        &self,
        state: DecoderState,
        changes: DecoderChangeFlags,
        function_number: u32,
    ) {
        let _ = self.post(Task::DecoderChanged {
            state,
            changes,
            function_number,
        });
    }

    /// Queue a switch request. Returns `false` for an out-of-range
    /// address or when the kernel is not running; queue-full conditions
    /// surface through [`stats`](Self::stats) on the event loop.
    pub fn set_output(&self, address: u16, value: bool) -> bool {
        if !(OUTPUT_ADDRESS_MIN..=OUTPUT_ADDRESS_MAX).contains(&address) {
            return false;
        }
        self.post(Task::SetOutput { address, value })
    }

    /// Inject a synthetic toggled input report.
    pub fn simulate_input_change(&self, address: u16) {
        let _ = self.post(Task::SimulateInputChange(address));
    }

    /// Open an LNCV programming session.
    pub fn lncv_start(&self, module_id: u16, module_address: u16) {
        let _ = self.post(Task::LncvStart {
            module_id,
            module_address,
        });
    }

    /// Read an LNCV; the wired read-response callback receives the result.
    pub fn lncv_read(&self, lncv: u16) {
        let _ = self.post(Task::LncvRead(lncv));
    }

    /// Write an LNCV.
    pub fn lncv_write(&self, lncv: u16, value: u16) {
        let _ = self.post(Task::LncvWrite { lncv, value });
    }

    /// Close the LNCV programming session.
    pub fn lncv_stop(&self) {
        let _ = self.post(Task::LncvStop);
    }

    /// Announce that the layout clock changed (see
    /// [`fast_clock`](Self::fast_clock) for the value itself).
    pub fn fast_clock_changed(&self) {
        let _ = self.post(Task::FastClockChanged);
    }

    /// Replace the configuration, live.
    pub fn set_config(&mut self, config: Config) {
        if self.is_running() {
            let _ = self.post(Task::SetConfig(config));
        } else {
            self.kernel_mut().set_config(config, 0);
        }
    }
}

impl<H: IoHandler + Send + 'static> Drop for KernelRunner<H> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn apply<H: IoHandler>(kernel: &mut Kernel<H>, task: Task, now_ms: u64) {
    match task {
        Task::SetPowerOn(on) => kernel.set_power_on(on, now_ms),
        Task::EmergencyStop => kernel.emergency_stop(now_ms),
        Task::Resume => kernel.resume(now_ms),
        Task::DecoderChanged {
            state,
            changes,
            function_number,
        } => kernel.decoder_changed(&state, changes, function_number, now_ms),
        Task::SetOutput { address, value } => {
            let _ = kernel.set_output(address, value, now_ms);
        }
        Task::SimulateInputChange(address) => kernel.simulate_input_change(address, now_ms),
        Task::LncvStart {
            module_id,
            module_address,
        } => kernel.lncv_start(module_id, module_address, now_ms),
        Task::LncvRead(lncv) => kernel.lncv_read(lncv, now_ms),
        Task::LncvWrite { lncv, value } => kernel.lncv_write(lncv, value, now_ms),
        Task::LncvStop => kernel.lncv_stop(now_ms),
        Task::FastClockChanged => kernel.fast_clock_changed(now_ms),
        Task::SetConfig(config) => kernel.set_config(config, now_ms),
        Task::Shutdown => unreachable!("handled by the loop"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SimIoHandler;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    fn wait_until(mut predicate: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !predicate() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn start_invokes_on_started() {
        let started = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&started);

        let mut runner = KernelRunner::new(Config::default(), SimIoHandler::new());
        runner.set_on_started(Box::new(move || flag.store(true, Ordering::SeqCst)));
        runner.start();
        wait_until(|| started.load(Ordering::SeqCst));
        runner.stop();
        assert!(!runner.is_running());
    }

    #[test]
    fn power_on_round_trips_through_the_loop() {
        let power = Arc::new(Mutex::new(None));
        let observed = Arc::clone(&power);

        let mut runner = KernelRunner::new(Config::default(), SimIoHandler::new());
        runner.set_on_global_power_changed(Box::new(move |on| {
            *observed.lock().unwrap() = Some(on);
        }));
        runner.start();
        runner.set_power_on(true);
        wait_until(|| power.lock().unwrap().is_some());
        assert_eq!(*power.lock().unwrap(), Some(true));
        runner.stop();
    }

    #[test]
    fn stop_recovers_kernel_for_rewiring() {
        let mut runner = KernelRunner::new(Config::default(), SimIoHandler::new());
        runner.start();
        runner.stop();
        // Wiring after stop must not panic.
        runner.set_on_idle(Box::new(|| {}));
        runner.start();
        runner.stop();
    }

    #[test]
    #[should_panic(expected = "wiring")]
    fn wiring_while_running_panics() {
        let mut runner = KernelRunner::new(Config::default(), SimIoHandler::new());
        runner.start();
        // Drop stops the runner during unwind.
        runner.set_on_started(Box::new(|| {}));
    }

    #[test]
    fn set_output_validates_address() {
        let mut runner = KernelRunner::new(Config::default(), SimIoHandler::new());
        runner.start();
        assert!(!runner.set_output(0, true));
        assert!(!runner.set_output(4097, true));
        assert!(runner.set_output(1, true));
        runner.stop();
    }

    #[test]
    fn set_output_while_stopped_reports_failure() {
        let runner = KernelRunner::new(Config::default(), SimIoHandler::new());
        assert!(!runner.set_output(1, true));
    }

    #[test]
    fn api_is_callable_from_many_threads() {
        let mut runner = KernelRunner::new(Config::default(), SimIoHandler::new());
        runner.start();
        let runner = Arc::new(runner);

        let calls = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for worker in 0..4u16 {
            let runner = Arc::clone(&runner);
            let calls = Arc::clone(&calls);
            handles.push(std::thread::spawn(move || {
                for i in 0..50u16 {
                    runner.set_power_on(i % 2 == 0);
                    let _ = runner.set_output(1 + worker * 10 + i % 5, i % 2 == 0);
                    runner.simulate_input_change(1 + worker);
                    calls.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(calls.load(Ordering::Relaxed), 200);

        let mut runner = Arc::try_unwrap(runner).unwrap_or_else(|_| panic!("still shared"));
        runner.stop();
    }
}
