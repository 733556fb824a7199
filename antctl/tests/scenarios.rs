// Part of antctl. Copyright 2022-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! End-to-end scenarios against a mock bus: two simulated CiA-402 drives
//! whose statuswords react to the controlwords the cycle engine sends.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use antctl::axis::{power_state, PowerState, SW_SETPOINT_ACK};
use antctl::{
    obj, Axis, AxisState, Bus, BusError, Control, ControlOpts, DriveConfig, OperationMode,
    PdoOffsets, SdoValue, SystemState, AXIS_COUNT,
};

// Mock process image layout: 32 bytes per axis, RxPDO block then TxPDO
// block, same entry order as the production mapping.
const STRIDE: usize = 32;

fn mock_offsets() -> [PdoOffsets; AXIS_COUNT] {
    let mut offsets = [PdoOffsets::default(); AXIS_COUNT];
    for (i, off) in offsets.iter_mut().enumerate() {
        let base = i * STRIDE;
        off.controlword = base;
        off.mode_of_operation = base + 2;
        off.target_position = base + 3;
        off.target_velocity = base + 7;
        off.statusword = base + 11;
        off.mode_display = base + 13;
        off.position_actual = base + 14;
        off.velocity_actual = base + 18;
        off.torque_actual = base + 22;
        off.error_code = base + 24;
        off.temperature = [base + 26, base + 28, base + 30];
    }
    offsets
}

const ST_DISABLED: u16 = 0x0040;
const ST_READY: u16 = 0x0031;
const ST_SWITCHED_ON: u16 = 0x0033;
const ST_ENABLED: u16 = 0x0037;
const ST_FAULT: u16 = 0x0008;

const MOCK_PPR: u32 = 1 << 20;

#[derive(Debug)]
struct SlaveSim {
    statusword: u16,
    mode_display: i8,
    position: i32,
    velocity: i32,
    torque: i16,
    error_code: u16,
    last_cw: u16,
    /// Controlword transitions, consecutive duplicates collapsed.
    cw_trace: Vec<u16>,
}

impl SlaveSim {
    fn new() -> Self {
        SlaveSim {
            statusword: ST_DISABLED,
            mode_display: 0,
            position: 0,
            velocity: 0,
            torque: 0,
            error_code: 0,
            last_cw: 0,
            cw_trace: Vec::new(),
        }
    }

    fn faulted(&self) -> bool {
        matches!(
            power_state(self.statusword),
            PowerState::Fault | PowerState::FaultReactionActive
        )
    }

    /// React to one cycle's RxPDO like a well-behaved drive.
    fn step(&mut self, cw: u16, mode: i8, tgt_pos: i32, tgt_vel: i32) {
        let rising_reset = cw & 0x80 != 0 && self.last_cw & 0x80 == 0;
        if cw != self.last_cw {
            self.cw_trace.push(cw);
        }
        self.last_cw = cw;
        self.mode_display = mode;

        if self.faulted() {
            if rising_reset {
                self.statusword = ST_DISABLED;
                self.error_code = 0;
            }
            return;
        }

        match power_state(self.statusword) {
            PowerState::NotReadyToSwitchOn | PowerState::SwitchOnDisabled => {
                if cw == 0x0006 {
                    self.statusword = ST_READY;
                }
            }
            PowerState::ReadyToSwitchOn => match cw {
                0x0007 => self.statusword = ST_SWITCHED_ON,
                0x0006 => {}
                _ => {}
            },
            PowerState::SwitchedOn => match cw & 0x000F {
                0x000F => self.statusword = ST_ENABLED,
                0x0006 => self.statusword = ST_READY,
                _ => {}
            },
            PowerState::OperationEnabled => match cw & 0x000F {
                0x0006 => self.statusword = ST_READY,
                0x0007 => self.statusword = ST_SWITCHED_ON,
                0x000F => {
                    if OperationMode::from(self.mode_display) == OperationMode::Point {
                        if cw & 0x0010 != 0 {
                            // New set-point: acknowledge and move instantly.
                            self.statusword |= SW_SETPOINT_ACK;
                            self.position = tgt_pos;
                        } else {
                            self.statusword &= !SW_SETPOINT_ACK;
                        }
                    }
                    self.velocity =
                        if OperationMode::from(self.mode_display) == OperationMode::Scan {
                            tgt_vel
                        } else {
                            0
                        };
                }
                _ => {}
            },
            PowerState::QuickStopActive
            | PowerState::FaultReactionActive
            | PowerState::Fault => {}
        }

        if power_state(self.statusword) != PowerState::OperationEnabled {
            self.velocity = 0;
        }
    }
}

#[derive(Debug)]
struct MockState {
    slaves: [SlaveSim; AXIS_COUNT],
    /// receive() reports not-ready for this many upcoming cycles.
    notready: u32,
    ok_receives: u64,
    sends: u64,
    sdo_writes: Vec<(Axis, u16, SdoValue)>,
    shutdown: bool,
}

struct MockBus {
    data: Vec<u8>,
    offsets: [PdoOffsets; AXIS_COUNT],
    state: Arc<Mutex<MockState>>,
}

impl MockBus {
    fn new() -> (Self, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState {
            slaves: [SlaveSim::new(), SlaveSim::new()],
            notready: 0,
            ok_receives: 0,
            sends: 0,
            sdo_writes: Vec::new(),
            shutdown: false,
        }));
        let bus = MockBus {
            data: vec![0; AXIS_COUNT * STRIDE],
            offsets: mock_offsets(),
            state: Arc::clone(&state),
        };
        (bus, state)
    }
}

impl Bus for MockBus {
    fn configure(&mut self) -> Result<[PdoOffsets; AXIS_COUNT], BusError> {
        Ok(self.offsets)
    }

    fn activate(&mut self) -> Result<(), BusError> {
        Ok(())
    }

    fn check_operational(&mut self, _timeout: Duration) -> Result<(), BusError> {
        Ok(())
    }

    fn receive(&mut self) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        if state.notready > 0 {
            state.notready -= 1;
            return Err(BusError::NotReady);
        }
        state.ok_receives += 1;
        for (i, off) in self.offsets.iter().enumerate() {
            let s = &state.slaves[i];
            self.data[off.statusword..off.statusword + 2].copy_from_slice(&s.statusword.to_ne_bytes());
            self.data[off.mode_display] = s.mode_display as u8;
            self.data[off.position_actual..off.position_actual + 4]
                .copy_from_slice(&s.position.to_ne_bytes());
            self.data[off.velocity_actual..off.velocity_actual + 4]
                .copy_from_slice(&s.velocity.to_ne_bytes());
            self.data[off.torque_actual..off.torque_actual + 2]
                .copy_from_slice(&s.torque.to_ne_bytes());
            self.data[off.error_code..off.error_code + 2]
                .copy_from_slice(&s.error_code.to_ne_bytes());
            for (t, &toff) in off.temperature.iter().enumerate() {
                let temp = 40i16 + t as i16;
                self.data[toff..toff + 2].copy_from_slice(&temp.to_ne_bytes());
            }
        }
        Ok(())
    }

    fn send(&mut self) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        state.sends += 1;
        for (i, off) in self.offsets.iter().enumerate() {
            let cw = u16::from_ne_bytes(self.data[off.controlword..off.controlword + 2].try_into().unwrap());
            let mode = self.data[off.mode_of_operation] as i8;
            let tgt_pos = i32::from_ne_bytes(
                self.data[off.target_position..off.target_position + 4].try_into().unwrap(),
            );
            let tgt_vel = i32::from_ne_bytes(
                self.data[off.target_velocity..off.target_velocity + 4].try_into().unwrap(),
            );
            state.slaves[i].step(cw, mode, tgt_pos, tgt_vel);
        }
        Ok(())
    }

    fn process_data(&mut self) -> Result<&mut [u8], BusError> {
        Ok(&mut self.data)
    }

    fn sdo_write(
        &mut self,
        axis: Axis,
        index: u16,
        _sub: u8,
        value: SdoValue,
    ) -> Result<(), BusError> {
        self.state.lock().unwrap().sdo_writes.push((axis, index, value));
        Ok(())
    }

    fn sdo_read(
        &mut self,
        _axis: Axis,
        index: u16,
        _sub: u8,
        buf: &mut [u8],
    ) -> Result<usize, BusError> {
        let data: Vec<u8> = match index {
            obj::DEVICE_NAME => b"L7NHA-MOCK".to_vec(),
            obj::HW_VERSION => b"1.10".to_vec(),
            obj::SW_VERSION => b"0.9.4".to_vec(),
            obj::ENCODER_RESOLUTION => MOCK_PPR.to_ne_bytes().to_vec(),
            _ => vec![0],
        };
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn shutdown(&mut self) {
        self.state.lock().unwrap().shutdown = true;
    }
}

fn test_opts() -> ControlOpts {
    ControlOpts {
        master_idx: 0,
        cycle_period: Duration::from_micros(500),
        rt_priority: None,
        cpu_affinity: None,
        op_timeout: Duration::from_secs(1),
    }
}

fn start() -> (Control, Arc<Mutex<MockState>>) {
    let config = DriveConfig::parse("test", "6083=20000\n6084=20000\n60FF=0\n").unwrap();
    let (bus, state) = MockBus::new();
    let control = Control::with_bus(&config, test_opts(), Box::new(bus)).unwrap();
    (control, state)
}

fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("timed out waiting for {what}");
}

fn contains_subsequence(trace: &[u16], pattern: &[u16]) -> bool {
    let mut it = trace.iter();
    pattern.iter().all(|p| it.any(|t| t == p))
}

#[test]
fn init_happy_path() {
    let (control, state) = start();

    // Static info came from the mock's SDO dictionary.
    for info in &control.info().axes {
        assert_eq!(info.dev_name, "L7NHA-MOCK");
        assert_eq!(info.hw_version, "1.10");
        assert_eq!(info.sw_version, "0.9.4");
        assert_eq!(info.encoder_pulses_per_rev, MOCK_PPR);
    }

    // The parameter file was replayed once per axis, in order.
    {
        let state = state.lock().unwrap();
        assert_eq!(state.sdo_writes.len(), 2 * 3);
        let az: Vec<_> = state
            .sdo_writes
            .iter()
            .filter(|(a, _, _)| *a == Axis::Azimuth)
            .collect();
        assert_eq!(az[0].1, 0x6083);
        assert_eq!(az[0].2, SdoValue::U32(20_000));
        assert_eq!(az[2].1, 0x60FF);
        assert_eq!(az[2].2, SdoValue::I32(0));
    }

    // Both axes settle into idle; the system is ready.
    wait_for(
        || {
            let s = control.status();
            s.axes.iter().all(|a| a.state == AxisState::Idle) && s.state == SystemState::Ready
        },
        "both axes idle",
    );
    let status = control.status();
    assert!(status.apptime > 0);
    assert!(status.reftime > 0);
}

#[test]
fn point_to_point() {
    let (control, state) = start();
    wait_for(
        || control.status().axes[0].state == AxisState::Idle,
        "azimuth idle",
    );

    control.run_point(Axis::Azimuth, 1_048_576);
    wait_for(
        || {
            let a = &control.status().axes[0];
            a.state == AxisState::Enabled && a.mode == OperationMode::Point && a.cur_pos == 1_048_576
        },
        "azimuth positioned",
    );

    let status = control.status();
    let a = &status.axes[0];
    assert_eq!(a.tgt_pos, 1_048_576);
    assert!((a.tgt_pos_deg - 360.0).abs() < 1e-9);

    // The drive saw the canonical CiA-402 enable ladder with exactly one
    // set-point handshake.
    let state = state.lock().unwrap();
    let trace = &state.slaves[0].cw_trace;
    assert!(
        contains_subsequence(trace, &[0x0006, 0x0007, 0x000F, 0x001F, 0x000F]),
        "unexpected controlword trace: {trace:04x?}"
    );
    assert_eq!(trace.iter().filter(|&&cw| cw == 0x001F).count(), 1);
}

#[test]
fn scan_reversal_keeps_mode() {
    let (control, state) = start();

    control.run_scan(Axis::Azimuth, 100_000);
    wait_for(
        || {
            let a = &control.status().axes[0];
            a.state == AxisState::Enabled && a.mode == OperationMode::Scan && a.cur_vel == 100_000
        },
        "azimuth scanning forward",
    );

    let trace_len = state.lock().unwrap().slaves[0].cw_trace.len();

    control.run_scan(Axis::Azimuth, -100_000);
    wait_for(
        || control.status().axes[0].cur_vel == -100_000,
        "azimuth scanning reversed",
    );

    let status = control.status();
    assert_eq!(status.axes[0].mode, OperationMode::Scan);
    assert_eq!(status.axes[0].state, AxisState::Enabled);
    assert_eq!(status.state, SystemState::Processing);

    // No intermediate idle: the reversal leaves the controlword at
    // "enable operation" throughout.
    let state = state.lock().unwrap();
    let tail = &state.slaves[0].cw_trace[trace_len..];
    assert!(
        !tail.contains(&0x0006) && !tail.contains(&0x0007),
        "drive was bounced through idle: {tail:04x?}"
    );
}

#[test]
fn fault_is_reported_and_reset_once() {
    let (control, state) = start();

    control.run_scan(Axis::Azimuth, 50_000);
    wait_for(
        || control.status().axes[0].state == AxisState::Enabled,
        "azimuth enabled",
    );

    // Overvoltage fault out of nowhere.
    {
        let mut state = state.lock().unwrap();
        state.slaves[0].statusword = ST_FAULT;
        state.slaves[0].error_code = 0x7320;
    }
    wait_for(
        || control.status().axes[0].state == AxisState::Error,
        "fault observed",
    );
    let status = control.status();
    assert_eq!(status.axes[0].error_code, 0x7320);
    assert_eq!(status.state, SystemState::Error);

    // RUN intents are ignored while faulted.
    control.run_scan(Axis::Azimuth, 75_000);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(control.status().axes[0].state, AxisState::Error);
    assert_eq!(control.status().axes[0].tgt_vel, 50_000);

    control.reset_fault(Axis::Azimuth);
    wait_for(
        || control.status().axes[0].state == AxisState::Idle,
        "fault cleared, axis idle",
    );
    assert_eq!(control.status().axes[0].error_code, 0);

    // Exactly one rising fault-reset edge, followed by shutdown.
    let state = state.lock().unwrap();
    let trace = &state.slaves[0].cw_trace;
    assert_eq!(trace.iter().filter(|&&cw| cw & 0x80 != 0).count(), 1);
    let reset_at = trace.iter().position(|&cw| cw & 0x80 != 0).unwrap();
    assert!(
        trace[reset_at + 1..].contains(&0x0006),
        "no shutdown after reset: {trace:04x?}"
    );
}

#[test]
fn bus_hiccup_skips_one_cycle() {
    let (control, state) = start();
    wait_for(
        || control.status().state == SystemState::Ready,
        "system ready",
    );
    let before = control.status();

    state.lock().unwrap().notready = 1;
    wait_for(
        || control.status().missed_cycles == 1,
        "missed cycle accounted",
    );

    let after = control.status();
    // State survives the hiccup untouched; snapshots stay monotonic.
    assert_eq!(after.state, SystemState::Ready);
    assert_eq!(after.axes[0].state, before.axes[0].state);
    assert!(after.apptime >= before.apptime);
    assert_eq!(after.missed_cycles, 1);
}

#[test]
fn invalid_intents_are_counted_not_applied() {
    let (control, _state) = start();
    wait_for(
        || control.status().state == SystemState::Ready,
        "system ready",
    );

    control.run_scan(Axis::Azimuth, antctl::MAX_TARGET_VELOCITY + 1);
    wait_for(
        || control.status().invalid_intents == 1,
        "invalid intent counted",
    );
    let status = control.status();
    assert_eq!(status.axes[0].state, AxisState::Idle);
    assert_eq!(status.axes[0].tgt_vel, 0);
}

#[test]
fn snapshots_are_monotonic_and_self_consistent() {
    let (control, _state) = start();
    control.run_scan(Axis::Elevation, 10_000);
    let mut last = 0u64;
    for _ in 0..100 {
        let status = control.status();
        assert!(status.apptime >= last);
        assert!(status.apptime >= status.reftime);
        last = status.apptime;
        // The published logical state always matches the statusword of the
        // same snapshot.
        for axis in &status.axes {
            assert_eq!(antctl::axis::decode_statusword(axis.statusword), axis.state);
        }
        thread::sleep(Duration::from_micros(200));
    }
}

#[test]
fn shutdown_leaves_drives_safe() {
    let (control, state) = start();

    control.run_scan(Axis::Azimuth, 100_000);
    control.run_scan(Axis::Elevation, -50_000);
    wait_for(
        || {
            control
                .status()
                .axes
                .iter()
                .all(|a| a.state == AxisState::Enabled)
        },
        "both axes scanning",
    );

    let sends_before = state.lock().unwrap().sends;
    drop(control);

    let state = state.lock().unwrap();
    assert!(state.shutdown, "bus was not released");
    assert!(state.sends > sends_before, "no final safe-state send");
    for slave in &state.slaves {
        assert_eq!(
            slave.last_cw, 0x0006,
            "drive left with controlword {:#06x}",
            slave.last_cw
        );
    }
}
