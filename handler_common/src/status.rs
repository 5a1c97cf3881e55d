//! Decoded handler conditions.
//!
//! Every handler model reports a raw status word with its own bit layout.
//! The driver maps each raw bit to one of the abstract conditions below;
//! the rest of the system only ever sees [`HandlerCondition`].

use bitflags::bitflags;

bitflags! {
    /// Abstract handler conditions decoded from a model-specific status word.
    ///
    /// NOT READY conditions (→ `handler_ready() == false`): STOPPED, JAMMED,
    /// DOOR_OPEN, ALARM, PAUSED, TEMPERATURE_ALARM, MAINTENANCE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HandlerCondition: u32 {
        /// Handler stopped (operator or error stop).
        const STOPPED           = 0x0001;
        /// Device jam in the transport path.
        const JAMMED            = 0x0002;
        /// Safety door open.
        const DOOR_OPEN         = 0x0004;
        /// Devices soaking in the thermal chamber.
        const SOAKING           = 0x0008;
        /// Input tray or tube empty.
        const INPUT_EMPTY       = 0x0010;
        /// Output bin or tray full.
        const OUTPUT_FULL       = 0x0020;
        /// Generic alarm.
        const ALARM             = 0x0040;
        /// Chamber temperature outside its guard band.
        const TEMPERATURE_ALARM = 0x0080;
        /// Cycle paused by the operator.
        const PAUSED            = 0x0100;
        /// End of lot reached.
        const LOT_END           = 0x0200;
        /// Maintenance or setup mode.
        const MAINTENANCE       = 0x0400;
        /// Retest (second pass) in progress.
        const RETEST            = 0x0800;
        /// Vacuum pick-up failure.
        const PICK_FAILURE      = 0x1000;
        /// Handler waiting for the tester (all sites loaded).
        const WAITING_FOR_TEST  = 0x2000;
    }
}

impl HandlerCondition {
    /// Conditions that prevent the handler from delivering devices.
    pub const NOT_READY_MASK: Self = Self::from_bits_truncate(
        Self::STOPPED.bits()
            | Self::JAMMED.bits()
            | Self::DOOR_OPEN.bits()
            | Self::ALARM.bits()
            | Self::PAUSED.bits()
            | Self::TEMPERATURE_ALARM.bits()
            | Self::MAINTENANCE.bits(),
    );

    /// True if none of the NOT READY conditions is set.
    #[inline]
    pub const fn handler_ready(&self) -> bool {
        !self.intersects(Self::NOT_READY_MASK)
    }
}

impl Default for HandlerCondition {
    fn default() -> Self {
        Self::empty()
    }
}

/// One named, independently settable flag decoded from the status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusBit {
    /// Abstract condition this bit reports.
    pub key: HandlerCondition,
    /// Current value.
    pub value: bool,
    /// Bit position in the raw status word.
    pub bit: u8,
    /// Display name.
    pub name: &'static str,
}
