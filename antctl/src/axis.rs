// Part of antctl. Copyright 2022-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! CiA-402 per-axis state tracking: statusword decoding and the controlword
//! sequencer that walks a drive towards the desired logical state.
//!
//! The sequencer is a pure function of (statusword, desired state) plus two
//! pieces of memory: the last controlword written (for edge detection) and
//! the profile-position new-setpoint handshake.

use crate::types::AxisState;

// Statusword bits (0x6041).
pub const SW_READY_TO_SWITCH_ON: u16 = 1 << 0;
pub const SW_SWITCHED_ON: u16 = 1 << 1;
pub const SW_OPERATION_ENABLED: u16 = 1 << 2;
pub const SW_FAULT: u16 = 1 << 3;
pub const SW_VOLTAGE_ENABLED: u16 = 1 << 4;
pub const SW_QUICK_STOP: u16 = 1 << 5;
pub const SW_SWITCH_ON_DISABLED: u16 = 1 << 6;
pub const SW_WARNING: u16 = 1 << 7;
pub const SW_TARGET_REACHED: u16 = 1 << 10;
/// Profile position mode: set-point acknowledge.
pub const SW_SETPOINT_ACK: u16 = 1 << 12;

// Controlwords (0x6040).
pub const CW_DISABLE_VOLTAGE: u16 = 0x0000;
pub const CW_SHUTDOWN: u16 = 0x0006;
pub const CW_SWITCH_ON: u16 = 0x0007;
pub const CW_ENABLE_OPERATION: u16 = 0x000F;
/// Enable operation with the new-setpoint bit (bit 4) raised.
pub const CW_NEW_SETPOINT: u16 = 0x001F;
/// Fault reset, effective on the rising edge of bit 7.
pub const CW_FAULT_RESET: u16 = 0x0080;

/// The CiA-402 power states as decoded from statusword bits 0-3, 5 and 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    NotReadyToSwitchOn,
    SwitchOnDisabled,
    ReadyToSwitchOn,
    SwitchedOn,
    OperationEnabled,
    QuickStopActive,
    FaultReactionActive,
    Fault,
}

/// Standard CiA-402 statusword decoding.
pub fn power_state(statusword: u16) -> PowerState {
    match statusword & 0x4F {
        0x00 => return PowerState::NotReadyToSwitchOn,
        0x40 => return PowerState::SwitchOnDisabled,
        0x0F => return PowerState::FaultReactionActive,
        0x08 => return PowerState::Fault,
        _ => {}
    }
    match statusword & 0x6F {
        0x21 => PowerState::ReadyToSwitchOn,
        0x23 => PowerState::SwitchedOn,
        0x27 => PowerState::OperationEnabled,
        0x07 => PowerState::QuickStopActive,
        _ => PowerState::NotReadyToSwitchOn,
    }
}

/// Map a statusword to the observable logical state.  Fault wins over
/// everything, the warning bit over all non-fault states.
pub fn decode_statusword(statusword: u16) -> AxisState {
    match power_state(statusword) {
        PowerState::Fault | PowerState::FaultReactionActive => return AxisState::Error,
        _ if statusword & SW_WARNING != 0 => return AxisState::Warning,
        _ => {}
    }
    match power_state(statusword) {
        PowerState::SwitchOnDisabled => AxisState::Disabled,
        PowerState::NotReadyToSwitchOn | PowerState::ReadyToSwitchOn => AxisState::Init,
        PowerState::SwitchedOn => AxisState::Idle,
        PowerState::OperationEnabled => AxisState::Enabled,
        PowerState::QuickStopActive => AxisState::QuickStop,
        PowerState::Fault | PowerState::FaultReactionActive => AxisState::Error,
    }
}

/// Logical state the cycle engine wants an axis in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    /// Switched On: motor powered, operation disabled.
    Idle,
    /// Operation Enabled.
    Enabled,
}

/// Controlword sequencer for one axis.
#[derive(Debug)]
pub struct AxisSequencer {
    last_controlword: u16,
    /// A ResetFault intent arms exactly one fault-reset edge.
    fault_reset_armed: bool,
    /// A committed target position awaiting the drive's set-point handshake.
    setpoint_pending: bool,
}

impl AxisSequencer {
    pub fn new() -> Self {
        AxisSequencer {
            last_controlword: CW_DISABLE_VOLTAGE,
            fault_reset_armed: false,
            setpoint_pending: false,
        }
    }

    pub fn last_controlword(&self) -> u16 {
        self.last_controlword
    }

    /// Arm a one-shot fault-reset edge, consumed next time the drive is
    /// observed in Fault.
    pub fn arm_fault_reset(&mut self) {
        self.fault_reset_armed = true;
    }

    /// A new target position has been committed; raise the new-setpoint bit
    /// until the drive acknowledges via statusword bit 12.
    pub fn commit_setpoint(&mut self) {
        self.setpoint_pending = true;
    }

    pub fn setpoint_pending(&self) -> bool {
        self.setpoint_pending
    }

    /// Compute the next controlword from the observed statusword and the
    /// desired logical state.
    pub fn step(&mut self, statusword: u16, desired: DesiredState) -> u16 {
        let cw = match power_state(statusword) {
            PowerState::Fault | PowerState::FaultReactionActive => {
                if self.fault_reset_armed && self.last_controlword & CW_FAULT_RESET == 0 {
                    // Rising edge: bit 7 was low on the previous cycle.
                    self.fault_reset_armed = false;
                    self.setpoint_pending = false;
                    CW_FAULT_RESET
                } else {
                    CW_DISABLE_VOLTAGE
                }
            }
            PowerState::NotReadyToSwitchOn
            | PowerState::SwitchOnDisabled
            | PowerState::QuickStopActive => CW_SHUTDOWN,
            PowerState::ReadyToSwitchOn => CW_SWITCH_ON,
            PowerState::SwitchedOn => match desired {
                DesiredState::Enabled => CW_ENABLE_OPERATION,
                DesiredState::Idle => CW_SWITCH_ON,
            },
            PowerState::OperationEnabled => match desired {
                DesiredState::Idle => CW_SWITCH_ON,
                DesiredState::Enabled => {
                    if self.setpoint_pending {
                        if statusword & SW_SETPOINT_ACK != 0 {
                            self.setpoint_pending = false;
                            CW_ENABLE_OPERATION
                        } else {
                            CW_NEW_SETPOINT
                        }
                    } else {
                        CW_ENABLE_OPERATION
                    }
                }
            },
        };
        self.last_controlword = cw;
        cw
    }
}

impl Default for AxisSequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Plausible statuswords for each power state (voltage bit set where the
    // drive would set it).
    const ST_NOT_READY: u16 = 0x0000;
    const ST_DISABLED: u16 = 0x0040;
    const ST_READY: u16 = 0x0031;
    const ST_SWITCHED_ON: u16 = 0x0033;
    const ST_ENABLED: u16 = 0x0037;
    const ST_QUICK_STOP: u16 = 0x0017;
    const ST_FAULT: u16 = 0x0008;

    #[test]
    fn decodes_power_states() {
        assert_eq!(power_state(ST_NOT_READY), PowerState::NotReadyToSwitchOn);
        assert_eq!(power_state(ST_DISABLED), PowerState::SwitchOnDisabled);
        assert_eq!(power_state(ST_READY), PowerState::ReadyToSwitchOn);
        assert_eq!(power_state(ST_SWITCHED_ON), PowerState::SwitchedOn);
        assert_eq!(power_state(ST_ENABLED), PowerState::OperationEnabled);
        assert_eq!(power_state(ST_QUICK_STOP), PowerState::QuickStopActive);
        assert_eq!(power_state(ST_FAULT), PowerState::Fault);
        assert_eq!(power_state(0x000F), PowerState::FaultReactionActive);
    }

    #[test]
    fn decodes_logical_states() {
        assert_eq!(decode_statusword(ST_DISABLED), AxisState::Disabled);
        assert_eq!(decode_statusword(ST_READY), AxisState::Init);
        assert_eq!(decode_statusword(ST_SWITCHED_ON), AxisState::Idle);
        assert_eq!(decode_statusword(ST_ENABLED), AxisState::Enabled);
        assert_eq!(decode_statusword(ST_QUICK_STOP), AxisState::QuickStop);
        assert_eq!(decode_statusword(ST_FAULT), AxisState::Error);
        // The warning bit overrides any non-fault state.
        assert_eq!(decode_statusword(ST_ENABLED | SW_WARNING), AxisState::Warning);
        // But never the fault state.
        assert_eq!(decode_statusword(ST_FAULT | SW_WARNING), AxisState::Error);
    }

    #[test]
    fn walks_the_enable_ladder() {
        let mut seq = AxisSequencer::new();
        assert_eq!(seq.step(ST_DISABLED, DesiredState::Enabled), CW_SHUTDOWN);
        assert_eq!(seq.step(ST_READY, DesiredState::Enabled), CW_SWITCH_ON);
        assert_eq!(seq.step(ST_SWITCHED_ON, DesiredState::Enabled), CW_ENABLE_OPERATION);
        assert_eq!(seq.step(ST_ENABLED, DesiredState::Enabled), CW_ENABLE_OPERATION);
    }

    #[test]
    fn idles_from_enabled() {
        let mut seq = AxisSequencer::new();
        assert_eq!(seq.step(ST_ENABLED, DesiredState::Idle), CW_SWITCH_ON);
        assert_eq!(seq.step(ST_SWITCHED_ON, DesiredState::Idle), CW_SWITCH_ON);
    }

    #[test]
    fn quick_stop_recovers_through_shutdown() {
        let mut seq = AxisSequencer::new();
        assert_eq!(seq.step(ST_QUICK_STOP, DesiredState::Enabled), CW_SHUTDOWN);
        assert_eq!(seq.step(ST_READY, DesiredState::Enabled), CW_SWITCH_ON);
    }

    #[test]
    fn fault_reset_is_a_single_rising_edge() {
        let mut seq = AxisSequencer::new();
        // Unarmed: hold, no reset bit.
        assert_eq!(seq.step(ST_FAULT, DesiredState::Idle), CW_DISABLE_VOLTAGE);
        seq.arm_fault_reset();
        assert_eq!(seq.step(ST_FAULT, DesiredState::Idle), CW_FAULT_RESET);
        // Still faulted next cycle: the edge is not repeated.
        assert_eq!(seq.step(ST_FAULT, DesiredState::Idle), CW_DISABLE_VOLTAGE);
        // Once the drive recovers the normal ladder resumes.
        assert_eq!(seq.step(ST_DISABLED, DesiredState::Idle), CW_SHUTDOWN);
    }

    #[test]
    fn setpoint_handshake_toggles_bit_4() {
        let mut seq = AxisSequencer::new();
        seq.commit_setpoint();
        // Not yet acknowledged: keep the bit raised.
        assert_eq!(seq.step(ST_ENABLED, DesiredState::Enabled), CW_NEW_SETPOINT);
        assert_eq!(seq.step(ST_ENABLED, DesiredState::Enabled), CW_NEW_SETPOINT);
        // Acknowledge: bit drops and the handshake completes.
        assert_eq!(
            seq.step(ST_ENABLED | SW_SETPOINT_ACK, DesiredState::Enabled),
            CW_ENABLE_OPERATION
        );
        assert!(!seq.setpoint_pending());
        assert_eq!(seq.step(ST_ENABLED, DesiredState::Enabled), CW_ENABLE_OPERATION);
    }
}
