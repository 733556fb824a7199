// Part of antctl. Copyright 2022-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Lifecycle controller and the public face of the crate.
//!
//! [`Control`] owns construction (config, bus bring-up, drive setup over
//! SDO, spawning the cycle thread) and destruction (cooperative stop,
//! bounded join, bus release).  In between, operator threads post intents
//! and read snapshots through it; all of that is lock-free and safe to
//! call from blocking contexts.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use log::{info, warn};
use thiserror::Error;

use crate::bus::{Bus, BusError, EthercatBus};
use crate::config::{ConfigError, DriveConfig};
use crate::cycle::{CycleEngine, EngineConfig, Shared};
use crate::timing::CycleTimeInfo;
use crate::types::{
    obj, Axis, Intent, IntentKind, SystemInfo, SystemStatus, AXIS_COUNT,
};

/// Cycle periods granted to the engine for its first snapshot, and to the
/// final iteration during shutdown.
const STARTUP_TIMEOUT_CYCLES: u32 = 100;
const JOIN_TIMEOUT_CYCLES: u32 = 100;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("bus: {0}")]
    Bus(#[from] BusError),
    #[error("{0} reports zero encoder resolution")]
    EncoderResolution(Axis),
    #[error("spawning cycle thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("cycle engine published no snapshot within the startup window")]
    StartupTimeout,
}

/// Tunables for [`Control::new`].  The defaults match the production
/// deployment: master 0, 1 ms cycle, RT priority 80.
#[derive(Debug, Clone)]
pub struct ControlOpts {
    pub master_idx: u32,
    pub cycle_period: Duration,
    /// SCHED_FIFO priority for the cycle thread; `None` leaves the
    /// default scheduler.
    pub rt_priority: Option<i32>,
    /// Pin the cycle thread to this CPU.
    pub cpu_affinity: Option<usize>,
    /// How long slaves may take to reach OP during init.
    pub op_timeout: Duration,
}

impl Default for ControlOpts {
    fn default() -> Self {
        ControlOpts {
            master_idx: 0,
            cycle_period: Duration::from_millis(1),
            rt_priority: Some(80),
            cpu_affinity: None,
            op_timeout: Duration::from_secs(5),
        }
    }
}

/// Handle to the running motion-control system.
///
/// Dropping it stops the cycle thread, brings both drives to a safe state
/// and releases the bus, bounded in wall time.
pub struct Control {
    shared: Arc<Shared>,
    info: SystemInfo,
    handle: Option<JoinHandle<()>>,
    exit_rx: Receiver<()>,
    cycle_period: Duration,
}

impl Control {
    /// Bring the system up against the real EtherCAT master.
    pub fn new<P: AsRef<Path>>(cfg_path: P, opts: ControlOpts) -> Result<Control, InitError> {
        let config = DriveConfig::read_file(cfg_path)?;
        let bus = EthercatBus::open(opts.master_idx)?;
        Self::with_bus(&config, opts, Box::new(bus))
    }

    /// Bring the system up on an externally supplied bus.  This is the
    /// seam the scenario tests (and any simulation) plug a mock into.
    pub fn with_bus(
        config: &DriveConfig,
        opts: ControlOpts,
        mut bus: Box<dyn Bus>,
    ) -> Result<Control, InitError> {
        let offsets = bus.configure()?;
        bus.activate()?;
        bus.check_operational(opts.op_timeout)?;

        // Replay the parameter file against both amplifiers.
        for axis in Axis::ALL {
            for param in &config.params {
                bus.sdo_write(axis, param.index, 0, param.sdo_value())?;
            }
        }

        let mut info = SystemInfo::default();
        let mut pulses_per_rev = [0u32; AXIS_COUNT];
        for axis in Axis::ALL {
            let entry = &mut info.axes[axis.index()];
            entry.dev_name = read_sdo_string(bus.as_mut(), axis, obj::DEVICE_NAME)?;
            entry.hw_version = read_sdo_string(bus.as_mut(), axis, obj::HW_VERSION)?;
            entry.sw_version = read_sdo_string(bus.as_mut(), axis, obj::SW_VERSION)?;
            entry.encoder_pulses_per_rev = read_sdo_u32(bus.as_mut(), axis, obj::ENCODER_RESOLUTION)?;
            if entry.encoder_pulses_per_rev == 0 {
                return Err(InitError::EncoderResolution(axis));
            }
            pulses_per_rev[axis.index()] = entry.encoder_pulses_per_rev;
            info!(
                "{}: {} hw {} sw {}, {} pulses/rev",
                axis,
                entry.dev_name,
                entry.hw_version,
                entry.sw_version,
                entry.encoder_pulses_per_rev
            );
        }

        let shared = Arc::new(Shared::new());
        let (started_tx, started_rx) = bounded(1);
        let (exit_tx, exit_rx) = bounded(1);
        let engine = CycleEngine::new(
            bus,
            offsets,
            Arc::clone(&shared),
            EngineConfig {
                cycle_period_ns: opts.cycle_period.as_nanos() as u64,
                rt_priority: opts.rt_priority,
                cpu_affinity: opts.cpu_affinity,
                pulses_per_rev,
            },
            started_tx,
            exit_tx,
        );
        let handle = thread::Builder::new()
            .name("antctl-cycle".into())
            .spawn(move || engine.run())
            .map_err(InitError::Spawn)?;

        let window = opts.cycle_period * STARTUP_TIMEOUT_CYCLES;
        if started_rx.recv_timeout(window).is_err() {
            // Roll back: stop the engine and wait for it to release the bus.
            shared.stop.store(true, Ordering::Release);
            let _ = exit_rx.recv_timeout(window);
            let _ = handle.join();
            return Err(InitError::StartupTimeout);
        }

        info!("control initialized, cycle period {:?}", opts.cycle_period);
        Ok(Control {
            shared,
            info,
            handle: Some(handle),
            exit_rx,
            cycle_period: opts.cycle_period,
        })
    }

    /// Move an axis to an absolute position [counts] in profile position
    /// mode.  Returns the intent sequence number.
    pub fn run_point(&self, axis: Axis, target_position: i32) -> u64 {
        self.post(
            axis,
            Intent {
                kind: IntentKind::RunPoint,
                target_position,
                ..Intent::default()
            },
        )
    }

    /// Scan an axis at a constant velocity [counts/s]; the sign picks the
    /// direction (azimuth: positive = clockwise; elevation: positive =
    /// raising).
    pub fn run_scan(&self, axis: Axis, target_velocity: i32) -> u64 {
        self.post(
            axis,
            Intent {
                kind: IntentKind::RunScan,
                target_velocity,
                ..Intent::default()
            },
        )
    }

    /// Put an axis into idle (motor powered, operation disabled).
    pub fn set_idle(&self, axis: Axis) -> u64 {
        self.post(
            axis,
            Intent {
                kind: IntentKind::Idle,
                ..Intent::default()
            },
        )
    }

    /// Acknowledge a drive fault and return the axis to idle.
    pub fn reset_fault(&self, axis: Axis) -> u64 {
        self.post(
            axis,
            Intent {
                kind: IntentKind::ResetFault,
                ..Intent::default()
            },
        )
    }

    fn post(&self, axis: Axis, intent: Intent) -> u64 {
        self.shared.intents[axis.index()].post(intent)
    }

    /// The latest coherent snapshot; never blocks the cycle thread.
    pub fn status(&self) -> SystemStatus {
        self.shared.status.read()
    }

    /// Static drive information, read once during init.
    pub fn info(&self) -> &SystemInfo {
        &self.info
    }

    /// Cycle timing diagnostics.
    pub fn cycle_time_info(&self) -> CycleTimeInfo {
        self.shared.timing.read()
    }
}

impl Drop for Control {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        let window = self.cycle_period * JOIN_TIMEOUT_CYCLES;
        match self.exit_rx.recv_timeout(window) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                // Detach; the bus is released whenever the thread finally
                // drops it.
                warn!("cycle thread did not stop within {:?}", window);
                self.handle.take();
            }
        }
    }
}

fn read_sdo_string(bus: &mut dyn Bus, axis: Axis, index: u16) -> Result<String, BusError> {
    let mut buf = [0u8; 64];
    let n = bus.sdo_read(axis, index, 0, &mut buf)?;
    let text = String::from_utf8_lossy(&buf[..n]);
    Ok(text.trim_end_matches('\0').trim().to_string())
}

fn read_sdo_u32(bus: &mut dyn Bus, axis: Axis, index: u16) -> Result<u32, BusError> {
    let mut buf = [0u8; 4];
    let n = bus.sdo_read(axis, index, 0, &mut buf)?;
    let mut raw = [0u8; 4];
    raw[..n.min(4)].copy_from_slice(&buf[..n.min(4)]);
    Ok(u32::from_ne_bytes(raw))
}
