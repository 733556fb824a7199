// Part of antctl. Copyright 2022-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! The cyclic engine: a dedicated thread that owns the bus, advances
//! both drives' CiA-402 state machines and publishes one status snapshot
//! per cycle.
//!
//! The per-cycle order is fixed: wait for the absolute deadline, receive
//! process data, decode inputs, fold in pending operator intents, sequence
//! controlwords and setpoints, send, publish the snapshot, record timing.
//! After startup the loop takes no locks, performs no blocking I/O beyond
//! the bus exchange and does not allocate.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, NativeEndian as NE};
use crossbeam_channel::Sender;
use log::{debug, error, info, warn};

use crate::axis::{
    decode_statusword, power_state, AxisSequencer, DesiredState, PowerState, CW_SHUTDOWN,
};
use crate::bus::{Bus, PdoOffsets};
use crate::sync::{IntentSlot, SeqLock};
use crate::timing::{monotonic_ns, realtime_ns, sleep_until_ns, CycleTimeInfo, TimingMonitor};
use crate::types::{
    counts_to_deg, Axis, AxisState, AxisStatus, Intent, IntentKind, MoveMode, OperationMode,
    ParamsMode, SystemState, SystemStatus, AXIS_COUNT, MAX_TARGET_POSITION, MAX_TARGET_VELOCITY,
};

/// Consecutive not-ready cycles tolerated before the system goes fatal.
pub(crate) const FATAL_RECEIVE_THRESHOLD: u32 = 100;

// Move-distance buckets reported in AxisStatus::move_mode.
const MOVE_MODE_NEAR: MoveMode = 0;
const MOVE_MODE_MID: MoveMode = 1;
const MOVE_MODE_FAR: MoveMode = 2;
const MOVE_MODE_SCAN: MoveMode = 3;

/// State shared between the cycle thread and the operator side.
pub(crate) struct Shared {
    pub intents: [IntentSlot; AXIS_COUNT],
    pub status: SeqLock<SystemStatus>,
    pub timing: SeqLock<CycleTimeInfo>,
    pub stop: AtomicBool,
}

impl Shared {
    pub fn new() -> Self {
        Shared {
            intents: [IntentSlot::new(), IntentSlot::new()],
            status: SeqLock::new(SystemStatus::default()),
            timing: SeqLock::new(CycleTimeInfo::default()),
            stop: AtomicBool::new(false),
        }
    }
}

pub(crate) struct EngineConfig {
    pub cycle_period_ns: u64,
    pub rt_priority: Option<i32>,
    pub cpu_affinity: Option<usize>,
    pub pulses_per_rev: [u32; AXIS_COUNT],
}

/// TxPDO values of one axis for one cycle.
#[derive(Debug, Clone, Copy, Default)]
struct AxisInputs {
    statusword: u16,
    mode_display: i8,
    position: i32,
    velocity: i32,
    torque: i16,
    error_code: u16,
    temperatures: [i16; 3],
}

impl AxisInputs {
    fn read(data: &[u8], off: &PdoOffsets) -> AxisInputs {
        AxisInputs {
            statusword: NE::read_u16(&data[off.statusword..]),
            mode_display: data[off.mode_display] as i8,
            position: NE::read_i32(&data[off.position_actual..]),
            velocity: NE::read_i32(&data[off.velocity_actual..]),
            torque: NE::read_i16(&data[off.torque_actual..]),
            error_code: NE::read_u16(&data[off.error_code..]),
            temperatures: [
                NE::read_i16(&data[off.temperature[0]..]),
                NE::read_i16(&data[off.temperature[1]..]),
                NE::read_i16(&data[off.temperature[2]..]),
            ],
        }
    }
}

/// RxPDO values of one axis for one cycle.
#[derive(Debug, Clone, Copy, Default)]
struct AxisOutputs {
    controlword: u16,
    mode: i8,
    target_position: i32,
    target_velocity: i32,
}

impl AxisOutputs {
    fn write(&self, data: &mut [u8], off: &PdoOffsets) {
        NE::write_u16(&mut data[off.controlword..], self.controlword);
        data[off.mode_of_operation] = self.mode as u8;
        NE::write_i32(&mut data[off.target_position..], self.target_position);
        NE::write_i32(&mut data[off.target_velocity..], self.target_velocity);
    }
}

/// Cycle-side state of one drive.
struct AxisDrive {
    axis: Axis,
    sequencer: AxisSequencer,
    desired: DesiredState,
    mode: OperationMode,
    tgt_pos: i32,
    tgt_vel: i32,
    consumed_seq: u64,
    pulses_per_rev: u32,
    /// Set when a fault is observed; RUN intents are ignored until an
    /// explicit ResetFault arrives.
    faulted: bool,
    /// A RunPoint target waiting for Operation Enabled + profile position
    /// mode before the set-point handshake starts.
    setpoint_to_commit: bool,
}

impl AxisDrive {
    fn new(axis: Axis, pulses_per_rev: u32) -> Self {
        AxisDrive {
            axis,
            sequencer: AxisSequencer::new(),
            desired: DesiredState::Idle,
            mode: OperationMode::NotSet,
            tgt_pos: 0,
            tgt_vel: 0,
            consumed_seq: 0,
            pulses_per_rev,
            faulted: false,
            setpoint_to_commit: false,
        }
    }

    fn apply_intent(&mut self, intent: Intent, invalid_intents: &mut u64) {
        // Mark the sequence consumed no matter the outcome: dropped intents
        // must not be retried on later cycles.
        self.consumed_seq = intent.seq;
        match intent.kind {
            IntentKind::RunPoint => {
                if self.faulted {
                    debug!("{}: ignoring RunPoint while faulted", self.axis);
                    return;
                }
                if intent.target_position.unsigned_abs() > MAX_TARGET_POSITION as u32 {
                    *invalid_intents += 1;
                    return;
                }
                self.desired = DesiredState::Enabled;
                self.mode = OperationMode::Point;
                self.tgt_pos = intent.target_position;
                self.setpoint_to_commit = true;
            }
            IntentKind::RunScan => {
                if self.faulted {
                    debug!("{}: ignoring RunScan while faulted", self.axis);
                    return;
                }
                if intent.target_velocity == 0
                    || intent.target_velocity.unsigned_abs() > MAX_TARGET_VELOCITY as u32
                {
                    *invalid_intents += 1;
                    return;
                }
                self.desired = DesiredState::Enabled;
                self.mode = OperationMode::Scan;
                self.tgt_vel = intent.target_velocity;
            }
            IntentKind::Idle => {
                self.desired = DesiredState::Idle;
            }
            IntentKind::ResetFault => {
                self.desired = DesiredState::Idle;
                self.sequencer.arm_fault_reset();
                self.faulted = false;
            }
            IntentKind::None => {}
        }
    }

    /// One cycle step for this axis: track faults, fold in an intent,
    /// sequence the controlword and compose the published status.
    fn advance(
        &mut self,
        inp: &AxisInputs,
        intent: Option<Intent>,
        invalid_intents: &mut u64,
    ) -> (AxisOutputs, AxisStatus) {
        let state = decode_statusword(inp.statusword);
        if state == AxisState::Error && !self.faulted {
            self.faulted = true;
            self.setpoint_to_commit = false;
            warn!(
                "{}: drive fault, error code {:#06x}",
                self.axis, inp.error_code
            );
        }

        if let Some(intent) = intent {
            self.apply_intent(intent, invalid_intents);
        }

        // A committed target starts the set-point handshake only once the
        // drive is enabled and confirms profile position mode; a mode
        // change costs one or two cycles and must not eat the handshake.
        if self.setpoint_to_commit
            && power_state(inp.statusword) == PowerState::OperationEnabled
            && OperationMode::from(inp.mode_display) == OperationMode::Point
        {
            self.sequencer.commit_setpoint();
            self.setpoint_to_commit = false;
        }

        let controlword = self.sequencer.step(inp.statusword, self.desired);
        let scanning = self.mode == OperationMode::Scan && self.desired == DesiredState::Enabled;
        let out = AxisOutputs {
            controlword,
            mode: self.mode as i8,
            target_position: self.tgt_pos,
            target_velocity: if scanning { self.tgt_vel } else { 0 },
        };

        let ppr = self.pulses_per_rev;
        let status = AxisStatus {
            tgt_pos_deg: counts_to_deg(self.tgt_pos, ppr),
            cur_pos_deg: counts_to_deg(inp.position, ppr),
            dmd_pos_deg: counts_to_deg(out.target_position, ppr),
            tgt_vel_deg: counts_to_deg(self.tgt_vel, ppr),
            cur_vel_deg: counts_to_deg(inp.velocity, ppr),
            dmd_vel_deg: counts_to_deg(out.target_velocity, ppr),
            cur_pos: inp.position,
            dmd_pos: out.target_position,
            tgt_pos: self.tgt_pos,
            cur_vel: inp.velocity,
            dmd_vel: out.target_velocity,
            tgt_vel: self.tgt_vel,
            cur_torque: inp.torque,
            state,
            error_code: inp.error_code,
            temperatures: inp.temperatures,
            controlword,
            statusword: inp.statusword,
            mode: OperationMode::from(inp.mode_display),
            move_mode: self.move_mode(inp),
            params_mode: ParamsMode::Automatic,
        };
        (out, status)
    }

    fn move_mode(&self, inp: &AxisInputs) -> MoveMode {
        if self.desired != DesiredState::Enabled {
            return MOVE_MODE_NEAR;
        }
        match self.mode {
            OperationMode::Scan => MOVE_MODE_SCAN,
            OperationMode::Point => {
                let dist =
                    counts_to_deg(self.tgt_pos.wrapping_sub(inp.position), self.pulses_per_rev)
                        .abs();
                if dist < 1.0 {
                    MOVE_MODE_NEAR
                } else if dist < 10.0 {
                    MOVE_MODE_MID
                } else {
                    MOVE_MODE_FAR
                }
            }
            OperationMode::NotSet => MOVE_MODE_NEAR,
        }
    }
}

pub(crate) struct CycleEngine {
    bus: Box<dyn Bus>,
    offsets: [PdoOffsets; AXIS_COUNT],
    shared: Arc<Shared>,
    cfg: EngineConfig,
    axes: [AxisDrive; AXIS_COUNT],
    monitor: TimingMonitor,
    missed_cycles: u64,
    invalid_intents: u64,
    consecutive_misses: u32,
    started: bool,
    started_tx: Sender<()>,
    exit_tx: Sender<()>,
}

impl CycleEngine {
    pub fn new(
        bus: Box<dyn Bus>,
        offsets: [PdoOffsets; AXIS_COUNT],
        shared: Arc<Shared>,
        cfg: EngineConfig,
        started_tx: Sender<()>,
        exit_tx: Sender<()>,
    ) -> Self {
        let axes = [
            AxisDrive::new(Axis::Azimuth, cfg.pulses_per_rev[0]),
            AxisDrive::new(Axis::Elevation, cfg.pulses_per_rev[1]),
        ];
        CycleEngine {
            bus,
            offsets,
            shared,
            cfg,
            axes,
            monitor: TimingMonitor::new(),
            missed_cycles: 0,
            invalid_intents: 0,
            consecutive_misses: 0,
            started: false,
            started_tx,
            exit_tx,
        }
    }

    /// The cycle thread body.  Returns only on stop request or fatal bus
    /// failure; the bus is released before returning.
    pub fn run(mut self) {
        self.rt_setup();
        let period = self.cfg.cycle_period_ns;
        let mut deadline = monotonic_ns() + period;

        loop {
            sleep_until_ns(deadline);
            let wake = monotonic_ns();
            self.monitor.record_wake(wake, deadline);
            deadline += period;

            if self.shared.stop.load(Ordering::Acquire) {
                self.safe_stop();
                break;
            }

            match self.bus.receive() {
                Ok(()) => self.consecutive_misses = 0,
                Err(e) if e.is_transient() => {
                    // Policy: a missed cycle publishes nothing; readers keep
                    // the previous snapshot.
                    self.missed_cycles += 1;
                    self.consecutive_misses += 1;
                    if self.consecutive_misses >= FATAL_RECEIVE_THRESHOLD {
                        error!(
                            "bus not ready for {} consecutive cycles",
                            self.consecutive_misses
                        );
                        self.fatal();
                        break;
                    }
                    self.monitor.record_exec(wake, monotonic_ns());
                    self.shared.timing.write(self.monitor.info());
                    continue;
                }
                Err(e) => {
                    error!("bus receive failed: {}", e);
                    self.fatal();
                    break;
                }
            }
            let reftime = realtime_ns();

            if let Err(e) = self.exchange(reftime) {
                error!("bus exchange failed: {}", e);
                self.fatal();
                break;
            }

            self.monitor.record_exec(wake, monotonic_ns());
            self.shared.timing.write(self.monitor.info());
        }

        self.bus.shutdown();
        let _ = self.exit_tx.send(());
    }

    /// Steps 3-7 of the cycle: decode, intents, sequence, send, publish.
    fn exchange(&mut self, reftime: u64) -> Result<(), crate::bus::BusError> {
        let mut inputs = [AxisInputs::default(); AXIS_COUNT];
        {
            let data = self.bus.process_data()?;
            for (i, off) in self.offsets.iter().enumerate() {
                inputs[i] = AxisInputs::read(data, off);
            }
        }

        let mut outputs = [AxisOutputs::default(); AXIS_COUNT];
        let mut axes = [AxisStatus::default(); AXIS_COUNT];
        for i in 0..AXIS_COUNT {
            let intent = self.shared.intents[i].fresher_than(self.axes[i].consumed_seq);
            let (out, status) = self.axes[i].advance(&inputs[i], intent, &mut self.invalid_intents);
            outputs[i] = out;
            axes[i] = status;
        }

        {
            let data = self.bus.process_data()?;
            for (i, off) in self.offsets.iter().enumerate() {
                outputs[i].write(data, off);
            }
        }

        let apptime = realtime_ns();
        self.bus.sync_clocks(apptime);
        self.bus.send()?;

        let status = SystemStatus {
            axes,
            state: SystemState::aggregate(&axes),
            reftime,
            apptime,
            // Host-side upper bound: the scheduling error of this cycle.
            dcsync: self.monitor.info().latency_ns.min(u32::MAX as u64) as u32,
            missed_cycles: self.missed_cycles,
            invalid_intents: self.invalid_intents,
        };
        self.shared.status.write(status);

        if !self.started {
            self.started = true;
            let _ = self.started_tx.try_send(());
        }
        Ok(())
    }

    /// Final iteration on stop: command both drives to the safe state and
    /// send once.
    fn safe_stop(&mut self) {
        info!("stop requested, commanding drives to idle");
        if let Ok(data) = self.bus.process_data() {
            for (i, off) in self.offsets.iter().enumerate() {
                let out = AxisOutputs {
                    controlword: CW_SHUTDOWN,
                    mode: self.axes[i].mode as i8,
                    target_position: self.axes[i].tgt_pos,
                    target_velocity: 0,
                };
                out.write(data, off);
            }
        }
        if let Err(e) = self.bus.send() {
            warn!("final send failed: {}", e);
        }
    }

    /// Sustained or hard bus failure: record the verdict for readers, then
    /// leave the drives as safe as the bus still allows.
    fn fatal(&mut self) {
        let mut status = self.shared.status.read();
        status.state = SystemState::FatalError;
        status.apptime = realtime_ns();
        status.missed_cycles = self.missed_cycles;
        self.shared.status.write(status);
        self.safe_stop();
    }

    /// Best-effort RT discipline: FIFO scheduling, locked pages, CPU pin.
    /// The loop runs degraded if the host refuses any of it.
    fn rt_setup(&self) {
        if let Some(prio) = self.cfg.rt_priority {
            unsafe {
                let param = libc::sched_param {
                    sched_priority: prio,
                };
                if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
                    warn!(
                        "SCHED_FIFO priority {} unavailable: {}",
                        prio,
                        io::Error::last_os_error()
                    );
                }
                if libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) != 0 {
                    warn!("mlockall failed: {}", io::Error::last_os_error());
                }
            }
        }
        if let Some(cpu) = self.cfg.cpu_affinity {
            unsafe {
                let mut set: libc::cpu_set_t = std::mem::zeroed();
                libc::CPU_SET(cpu, &mut set);
                if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                    warn!(
                        "cannot pin cycle thread to CPU {}: {}",
                        cpu,
                        io::Error::last_os_error()
                    );
                }
            }
        }
    }
}
