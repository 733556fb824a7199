// Part of antctl. Copyright 2022-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! CiA-402 motion control for the dual-axis antenna of a meteorological
//! radar: two servo amplifiers on an EtherCAT ring, driven by a 1 ms
//! real-time cycle that sequences the drives' state machines, executes
//! operator commands and publishes lock-free status snapshots.
//!
//! The [`Control`] object is the whole public surface: construct it with a
//! drive parameter file, post position/velocity/idle intents per axis, and
//! read [`SystemStatus`] snapshots from any thread.

pub mod axis;
pub mod bus;
pub mod config;
pub mod control;
mod cycle;
pub mod sync;
pub mod timing;
pub mod types;

pub use self::bus::{Bus, BusError, EthercatBus, PdoOffsets, SdoValue};
pub use self::config::{ConfigError, DriveConfig, DriveParam};
pub use self::control::{Control, ControlOpts, InitError};
pub use self::timing::CycleTimeInfo;
pub use self::types::{
    counts_to_deg, deg_to_counts, obj, Axis, AxisInfo, AxisState, AxisStatus, Intent, IntentKind,
    MoveMode, OperationMode, ParamsMode, SystemInfo, SystemState, SystemStatus, AXIS_COUNT,
    MAX_TARGET_POSITION, MAX_TARGET_VELOCITY,
};
