// Part of antctl. Copyright 2022-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Thin facade over the EtherCAT master.
//!
//! The cycle engine and the lifecycle controller only ever talk to the
//! [`Bus`] trait; [`EthercatBus`] implements it on top of the IgH master
//! via the `ethercat` crate.  Tests substitute a mock.  The PDO map is
//! fixed: one RxPDO (0x1600) and one TxPDO (0x1A00) per drive, mapping the
//! CiA-402 objects the cycle exchanges every millisecond.

use std::io;
use std::thread;
use std::time::{Duration, Instant};

use ethercat::{
    DomainIdx, Idx, Master, MasterAccess, PdoCfg, PdoEntryIdx, PdoEntryInfo, PdoEntryPos, PdoIdx,
    SdoIdx, SlaveAddr, SlaveConfig, SlaveId, SlavePos, SmCfg, SubIdx,
};
use log::{debug, info, warn};
use thiserror::Error;

use crate::types::{obj, Axis, AXIS_COUNT};

/// Identity of the servo amplifiers on this ring (L7NH series).
pub const DRIVE_VENDOR_ID: u32 = 0x0000_7595;
pub const DRIVE_PRODUCT_CODE: u32 = 0x0000_0001;

#[derive(Debug, Error)]
pub enum BusError {
    /// Process data was not exchanged this cycle; retrying next cycle is
    /// the expected reaction.
    #[error("bus not ready")]
    NotReady,
    #[error("bus I/O: {0}")]
    Io(#[from] io::Error),
    #[error("slave {0} missing or not matching its configuration")]
    SlaveMissing(u16),
    #[error("PDO mapping: {0}")]
    Mapping(String),
    #[error("slaves not operational after {0:?}")]
    OpTimeout(Duration),
    #[error("SDO 0x{index:04X}:{sub} on {axis}: {source}")]
    Sdo {
        axis: Axis,
        index: u16,
        sub: u8,
        #[source]
        source: io::Error,
    },
}

impl BusError {
    /// Transient conditions are retried by the cycle engine; everything
    /// else escalates.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::NotReady)
    }
}

impl From<ethercat::Error> for BusError {
    fn from(e: ethercat::Error) -> Self {
        BusError::Io(e.into())
    }
}

/// Typed SDO payload; the wire width follows the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
}

/// Byte offsets of one axis' mapped PDO entries within the process image.
/// Filled in by [`Bus::configure`], consumed by the cycle engine's codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdoOffsets {
    // RxPDO (host -> drive)
    pub controlword: usize,
    pub mode_of_operation: usize,
    pub target_position: usize,
    pub target_velocity: usize,
    // TxPDO (drive -> host)
    pub statusword: usize,
    pub mode_display: usize,
    pub position_actual: usize,
    pub velocity_actual: usize,
    pub torque_actual: usize,
    pub error_code: usize,
    pub temperature: [usize; 3],
}

/// The narrow bus surface the rest of the crate depends on.
///
/// `receive`/`send` are non-blocking and called exactly once per cycle in
/// that order.  The SDO calls block and are only used during init and
/// fault recovery, never from the steady-state cycle.
pub trait Bus: Send {
    /// Configure the fixed PDO mapping for both drives and return the
    /// per-axis entry offsets within the process image.
    fn configure(&mut self) -> Result<[PdoOffsets; AXIS_COUNT], BusError>;

    /// Activate the master; process data may be exchanged afterwards.
    fn activate(&mut self) -> Result<(), BusError>;

    /// Block until all slaves report OP, or fail after `timeout`.
    fn check_operational(&mut self, timeout: Duration) -> Result<(), BusError>;

    /// Fetch the datagrams of the running cycle.
    fn receive(&mut self) -> Result<(), BusError>;

    /// Queue and send this cycle's datagrams.
    fn send(&mut self) -> Result<(), BusError>;

    /// The process image, valid between `receive` and `send`.
    fn process_data(&mut self) -> Result<&mut [u8], BusError>;

    fn sdo_write(&mut self, axis: Axis, index: u16, sub: u8, value: SdoValue)
        -> Result<(), BusError>;

    /// Read an SDO into `buf`, returning the number of bytes transferred.
    fn sdo_read(&mut self, axis: Axis, index: u16, sub: u8, buf: &mut [u8])
        -> Result<usize, BusError>;

    /// Distributed-clock housekeeping, once per cycle before `send`.
    fn sync_clocks(&mut self, _app_time_ns: u64) {}

    /// Release bus resources.  Called once, after the last cycle.
    fn shutdown(&mut self);
}

/// Production bus over the IgH EtherCAT master.
pub struct EthercatBus {
    master: Master,
    domain: DomainIdx,
}

impl EthercatBus {
    /// Reserve the master and create the process-data domain.
    pub fn open(master_idx: u32) -> Result<Self, BusError> {
        let mut master = Master::open(master_idx, MasterAccess::ReadWrite)?;
        master.reserve()?;
        let domain = master.create_domain()?;
        debug!("EtherCAT master {} reserved", master_idx);
        Ok(EthercatBus { master, domain })
    }

    fn slave_pos(axis: Axis) -> SlavePos {
        SlavePos::from(axis.index() as u16)
    }

    fn register(
        config: &mut SlaveConfig,
        domain: DomainIdx,
        index: u16,
        sub: u8,
    ) -> Result<usize, BusError> {
        let entry = PdoEntryIdx {
            idx: Idx::from(index),
            sub_idx: SubIdx::from(sub),
        };
        let offset = config.register_pdo_entry(entry, domain)?;
        if offset.bit != 0 {
            return Err(BusError::Mapping(format!(
                "entry 0x{index:04X}:{sub} not byte-aligned: {offset:?}"
            )));
        }
        Ok(offset.byte)
    }
}

fn pdo_entry(index: u16, sub: u8, bit_len: u8, pos: u8) -> PdoEntryInfo {
    PdoEntryInfo {
        entry_idx: PdoEntryIdx {
            idx: Idx::from(index),
            sub_idx: SubIdx::from(sub),
        },
        bit_len,
        name: String::new(),
        pos: PdoEntryPos::from(pos),
    }
}

impl Bus for EthercatBus {
    fn configure(&mut self) -> Result<[PdoOffsets; AXIS_COUNT], BusError> {
        let mut offsets = [PdoOffsets::default(); AXIS_COUNT];

        for axis in Axis::ALL {
            let pos = Self::slave_pos(axis);
            self.master.request_state(pos, ethercat::AlState::PreOp)?;

            let rx = PdoCfg {
                idx: PdoIdx::from(0x1600),
                entries: vec![
                    pdo_entry(obj::CONTROLWORD, 0, 16, 0),
                    pdo_entry(obj::MODE_OF_OPERATION, 0, 8, 1),
                    pdo_entry(obj::TARGET_POSITION, 0, 32, 2),
                    pdo_entry(obj::TARGET_VELOCITY, 0, 32, 3),
                ],
            };
            let tx = PdoCfg {
                idx: PdoIdx::from(0x1A00),
                entries: vec![
                    pdo_entry(obj::STATUSWORD, 0, 16, 0),
                    pdo_entry(obj::MODE_OF_OPERATION_DISPLAY, 0, 8, 1),
                    pdo_entry(obj::POSITION_ACTUAL, 0, 32, 2),
                    pdo_entry(obj::VELOCITY_ACTUAL, 0, 32, 3),
                    pdo_entry(obj::TORQUE_ACTUAL, 0, 16, 4),
                    pdo_entry(obj::ERROR_CODE, 0, 16, 5),
                    pdo_entry(obj::AMP_TEMPERATURE, 1, 16, 6),
                    pdo_entry(obj::AMP_TEMPERATURE, 2, 16, 7),
                    pdo_entry(obj::AMP_TEMPERATURE, 3, 16, 8),
                ],
            };

            let mut config = self.master.configure_slave(
                SlaveAddr::ByPos(axis.index() as u16),
                SlaveId {
                    vendor_id: DRIVE_VENDOR_ID,
                    product_code: DRIVE_PRODUCT_CODE,
                },
            )?;
            config.config_sm_pdos(SmCfg::output(2.into()), &[rx])?;
            config.config_sm_pdos(SmCfg::input(3.into()), &[tx])?;

            let off = &mut offsets[axis.index()];
            off.controlword = Self::register(&mut config, self.domain, obj::CONTROLWORD, 0)?;
            off.mode_of_operation =
                Self::register(&mut config, self.domain, obj::MODE_OF_OPERATION, 0)?;
            off.target_position =
                Self::register(&mut config, self.domain, obj::TARGET_POSITION, 0)?;
            off.target_velocity =
                Self::register(&mut config, self.domain, obj::TARGET_VELOCITY, 0)?;
            off.statusword = Self::register(&mut config, self.domain, obj::STATUSWORD, 0)?;
            off.mode_display =
                Self::register(&mut config, self.domain, obj::MODE_OF_OPERATION_DISPLAY, 0)?;
            off.position_actual =
                Self::register(&mut config, self.domain, obj::POSITION_ACTUAL, 0)?;
            off.velocity_actual =
                Self::register(&mut config, self.domain, obj::VELOCITY_ACTUAL, 0)?;
            off.torque_actual =
                Self::register(&mut config, self.domain, obj::TORQUE_ACTUAL, 0)?;
            off.error_code = Self::register(&mut config, self.domain, obj::ERROR_CODE, 0)?;
            for (i, t) in off.temperature.iter_mut().enumerate() {
                *t = Self::register(&mut config, self.domain, obj::AMP_TEMPERATURE, i as u8 + 1)?;
            }

            let cfg_index = config.index();
            drop(config);

            // The configuration must have attached to a live slave.
            if self.master.get_config_info(cfg_index)?.slave_position.is_none() {
                return Err(BusError::SlaveMissing(axis.index() as u16));
            }
            debug!("{}: PDOs configured, offsets {:?}", axis, offsets[axis.index()]);
        }

        Ok(offsets)
    }

    fn activate(&mut self) -> Result<(), BusError> {
        self.master.activate()?;
        info!("EtherCAT master activated");
        Ok(())
    }

    fn check_operational(&mut self, timeout: Duration) -> Result<(), BusError> {
        let start = Instant::now();
        loop {
            // Keep the cyclic exchange going; slaves only progress to OP
            // while datagrams circulate.
            let _ = self.receive();
            let _ = self.send();

            let state = self.master.state()?;
            if state.link_up
                && state.slaves_responding >= AXIS_COUNT as u32
                && state.al_states == 8
            {
                info!("all {} slaves operational", state.slaves_responding);
                return Ok(());
            }
            if start.elapsed() > timeout {
                warn!(
                    "slaves not OP: link_up={} responding={} al_states={:#x}",
                    state.link_up, state.slaves_responding, state.al_states
                );
                return Err(BusError::OpTimeout(timeout));
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn receive(&mut self) -> Result<(), BusError> {
        self.master.receive()?;
        self.master.domain(self.domain).process()?;
        // Datagrams only count once the link is up and every slave is OP.
        let state = self.master.state()?;
        if !state.link_up
            || state.slaves_responding < AXIS_COUNT as u32
            || state.al_states != 8
        {
            return Err(BusError::NotReady);
        }
        Ok(())
    }

    fn send(&mut self) -> Result<(), BusError> {
        self.master.domain(self.domain).queue()?;
        self.master.send()?;
        Ok(())
    }

    fn process_data(&mut self) -> Result<&mut [u8], BusError> {
        Ok(self.master.domain_data(self.domain)?)
    }

    fn sdo_write(
        &mut self,
        axis: Axis,
        index: u16,
        sub: u8,
        value: SdoValue,
    ) -> Result<(), BusError> {
        let pos = Self::slave_pos(axis);
        let idx = SdoIdx::new(index, sub);
        let res = match value {
            SdoValue::U8(v) => self.master.sdo_download(pos, idx, false, &v),
            SdoValue::I8(v) => self.master.sdo_download(pos, idx, false, &v),
            SdoValue::U16(v) => self.master.sdo_download(pos, idx, false, &v),
            SdoValue::I16(v) => self.master.sdo_download(pos, idx, false, &v),
            SdoValue::U32(v) => self.master.sdo_download(pos, idx, false, &v),
            SdoValue::I32(v) => self.master.sdo_download(pos, idx, false, &v),
        };
        res.map_err(|source| BusError::Sdo {
            axis,
            index,
            sub,
            source: source.into(),
        })
    }

    fn sdo_read(
        &mut self,
        axis: Axis,
        index: u16,
        sub: u8,
        buf: &mut [u8],
    ) -> Result<usize, BusError> {
        let pos = Self::slave_pos(axis);
        let idx = SdoIdx::new(index, sub);
        let data = self
            .master
            .sdo_upload(pos, idx, false, buf)
            .map_err(|source| BusError::Sdo {
                axis,
                index,
                sub,
                source: source.into(),
            })?;
        Ok(data.len())
    }

    fn shutdown(&mut self) {
        // Dropping the master releases the reservation and deactivates the
        // domain; nothing else to unwind.
        info!("releasing EtherCAT master");
    }
}
