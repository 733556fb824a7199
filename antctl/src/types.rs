// Part of antctl. Copyright 2022-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Shared data model: axis identifiers, CiA-402 object constants, operator
//! intents and the snapshots published by the cycle engine.

use std::fmt;

/// Number of drives on the bus.  Azimuth is slave 0, elevation is slave 1.
pub const AXIS_COUNT: usize = 2;

/// Largest velocity accepted from an operator intent [counts/s].
pub const MAX_TARGET_VELOCITY: i32 = 20_000_000;
/// Largest absolute position accepted from an operator intent [counts].
pub const MAX_TARGET_POSITION: i32 = 1 << 30;

/// CiA-402 / CoE object dictionary indices used on this bus.
pub mod obj {
    pub const DEVICE_NAME: u16 = 0x1008;
    pub const HW_VERSION: u16 = 0x1009;
    pub const SW_VERSION: u16 = 0x100A;

    pub const ERROR_CODE: u16 = 0x603F;
    pub const CONTROLWORD: u16 = 0x6040;
    pub const STATUSWORD: u16 = 0x6041;
    pub const MODE_OF_OPERATION: u16 = 0x6060;
    pub const MODE_OF_OPERATION_DISPLAY: u16 = 0x6061;
    pub const POSITION_ACTUAL: u16 = 0x6064;
    pub const VELOCITY_ACTUAL: u16 = 0x606C;
    pub const TORQUE_ACTUAL: u16 = 0x6077;
    pub const TARGET_POSITION: u16 = 0x607A;
    pub const TARGET_VELOCITY: u16 = 0x60FF;

    /// Vendor object: encoder pulses per revolution.
    pub const ENCODER_RESOLUTION: u16 = 0x2002;
    /// Vendor object: amplifier temperatures on subindices 1..=3.
    pub const AMP_TEMPERATURE: u16 = 0x2610;
}

/// Drive index.  The numeric values are array offsets throughout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Axis {
    Azimuth = 0,
    Elevation = 1,
}

impl Axis {
    pub const ALL: [Axis; AXIS_COUNT] = [Axis::Azimuth, Axis::Elevation];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Axis::Azimuth => write!(f, "azimuth"),
            Axis::Elevation => write!(f, "elevation"),
        }
    }
}

/// Observable per-axis state, derived from the CiA-402 statusword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AxisState {
    /// Switch on disabled: motor not powered.
    #[default]
    Disabled,
    /// Not ready / ready to switch on: power-up sequence in progress.
    Init,
    /// Switched on: powered, operation disabled.
    Idle,
    /// Operation enabled: executing a move.
    Enabled,
    /// Quick stop active.
    QuickStop,
    /// Statusword warning bit set.
    Warning,
    /// CiA-402 fault.
    Error,
}

/// Drive operation mode.  The discriminants are the CiA-402
/// modes-of-operation written to 0x6060.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i8)]
pub enum OperationMode {
    #[default]
    NotSet = 0,
    /// Profile position mode.
    Point = 1,
    /// Profile velocity mode.
    Scan = 3,
}

impl From<i8> for OperationMode {
    fn from(raw: i8) -> Self {
        match raw {
            1 => OperationMode::Point,
            3 => OperationMode::Scan,
            _ => OperationMode::NotSet,
        }
    }
}

/// Move-distance bucket, reported for observability.  Scan always uses the
/// largest identifier.
pub type MoveMode = u16;

/// Drive parameter setup policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParamsMode {
    /// Parameters are chosen for the commanded move.
    #[default]
    Automatic,
    /// Parameters are left untouched.
    Manual,
}

/// What the operator wants one axis to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntentKind {
    #[default]
    None,
    RunPoint,
    RunScan,
    Idle,
    ResetFault,
}

/// One operator command for one axis.  A newer intent supersedes an older
/// unconsumed one; nothing queues.
#[derive(Debug, Clone, Copy, Default)]
pub struct Intent {
    pub kind: IntentKind,
    /// Absolute target position [counts]; meaningful for `RunPoint`.
    pub target_position: i32,
    /// Signed target velocity [counts/s]; meaningful for `RunScan`.
    pub target_velocity: i32,
    /// Monotonic per-axis sequence number, stamped by the inbox.
    pub seq: u64,
}

/// Per-axis values published once per cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct AxisStatus {
    pub tgt_pos_deg: f64,
    pub cur_pos_deg: f64,
    pub dmd_pos_deg: f64,
    pub tgt_vel_deg: f64,
    pub cur_vel_deg: f64,
    pub dmd_vel_deg: f64,
    /// Current position [counts].
    pub cur_pos: i32,
    /// Demand position written to the drive this cycle [counts].
    pub dmd_pos: i32,
    /// Operator target position [counts].
    pub tgt_pos: i32,
    /// Current velocity [counts/s].
    pub cur_vel: i32,
    /// Demand velocity written to the drive this cycle [counts/s].
    pub dmd_vel: i32,
    /// Operator target velocity [counts/s].
    pub tgt_vel: i32,
    /// Current torque [0.1% of rated].
    pub cur_torque: i16,
    pub state: AxisState,
    /// Last CiA-402 error code (0x603F).
    pub error_code: u16,
    /// Amplifier temperatures [°C].
    pub temperatures: [i16; 3],
    pub controlword: u16,
    pub statusword: u16,
    pub mode: OperationMode,
    pub move_mode: MoveMode,
    pub params_mode: ParamsMode,
}

/// System-level aggregate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemState {
    #[default]
    Off,
    Init,
    Ready,
    Processing,
    Warning,
    Error,
    FatalError,
}

impl SystemState {
    /// Aggregate both axes into the system state.  Processing wins over
    /// Ready; an axis mid-transition keeps the system in Init.
    pub fn aggregate(axes: &[AxisStatus; AXIS_COUNT]) -> SystemState {
        let any = |s: AxisState| axes.iter().any(|a| a.state == s);
        let transitioning = any(AxisState::Init) || any(AxisState::QuickStop);
        if any(AxisState::Error) && !transitioning {
            SystemState::Error
        } else if any(AxisState::Warning) {
            SystemState::Warning
        } else if any(AxisState::Enabled) {
            SystemState::Processing
        } else if axes
            .iter()
            .all(|a| matches!(a.state, AxisState::Idle | AxisState::Disabled))
        {
            SystemState::Ready
        } else {
            SystemState::Init
        }
    }
}

/// One coherent snapshot of the whole system, produced once per cycle.
/// All fields of both axes come from the same cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemStatus {
    pub axes: [AxisStatus; AXIS_COUNT],
    pub state: SystemState,
    /// Time the cycle's input data was taken [ns since epoch].
    pub reftime: u64,
    /// Time of publication [ns since epoch].
    pub apptime: u64,
    /// Upper estimate of host/drive clock skew [ns].
    pub dcsync: u32,
    /// Cycles skipped because the bus was not ready.
    pub missed_cycles: u64,
    /// Operator intents dropped for out-of-range targets.
    pub invalid_intents: u64,
}

/// Static per-axis information, read over SDO during init.
#[derive(Debug, Clone, Default)]
pub struct AxisInfo {
    pub encoder_pulses_per_rev: u32,
    pub dev_name: String,
    pub hw_version: String,
    pub sw_version: String,
}

/// Static information for both axes.
#[derive(Debug, Clone, Default)]
pub struct SystemInfo {
    pub axes: [AxisInfo; AXIS_COUNT],
}

/// Convert encoder counts to degrees.  `pulses_per_rev` must be positive;
/// init guarantees this before the cycle engine starts.
#[inline]
pub fn counts_to_deg(counts: i32, pulses_per_rev: u32) -> f64 {
    debug_assert!(pulses_per_rev > 0);
    counts as f64 * 360.0 / pulses_per_rev as f64
}

/// Convert degrees to the nearest encoder count.
#[inline]
pub fn deg_to_counts(deg: f64, pulses_per_rev: u32) -> i32 {
    debug_assert!(pulses_per_rev > 0);
    (deg * pulses_per_rev as f64 / 360.0).round() as i32
}
