// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! The scanner's register file, and the host-side shadow of it.
use arrayvec::ArrayVec;
use bitvec::array::BitArray;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use paste::paste;

use crate::profile::SensorVariant;

/// The number of 8-bit registers on the device.
pub const REGISTER_COUNT: usize = 0x16;

/// Register addresses.
// NOTE: discriminants are written out so they can be compared against register dumps.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Register {
    /// Lamp, motor and sensor select bits.
    Control = 0x00,

    /// 0 for single channel (gray) sampling, 1 for three channel sampling.
    Mode = 0x01,

    /// Which sensor(s) and paper path to read from.
    Source = 0x02,

    /// Take every n-th native column.
    XDivider = 0x03,

    /// Motor steps per hardware line.
    YStep = 0x04,

    XStartHigh = 0x05,
    XStartLow = 0x06,

    /// Pixels per line, per side.
    WidthHigh = 0x07,
    WidthLow = 0x08,

    /// Raw lines to transfer, a 24-bit value.
    LinesHigh = 0x09,
    LinesMid = 0x0A,
    LinesLow = 0x0B,

    /// Sample every line twice. Only valid at the motor's highest resolution.
    Oversample = 0x0C,

    Exposure = 0x0D,
    MotorSpeed = 0x0E,

    GainRed = 0x10,
    GainGreen = 0x11,
    GainBlue = 0x12,

    OffsetRed = 0x13,
    OffsetGreen = 0x14,
    OffsetBlue = 0x15,
}

impl Register {
    fn index(self) -> usize {
        u8::from(self) as usize
    }
}

const CONTROL_LAMP: u8 = 0x01;
const CONTROL_MOTOR: u8 = 0x02;
const CONTROL_ALTERNATE_SENSOR: u8 = 0x04;

/// Generate the getter and setter for a bit of the control register.
macro_rules! control_flag {
    { $name:ident, $mask:ident, $doc:literal } => {
    paste! {
        #[doc = $doc]
        pub fn $name(&self) -> bool {
            self.get(Register::Control) & $mask != 0
        }

        pub fn [< set_ $name >](&mut self, enabled: bool) {
            let current = self.get(Register::Control);
            let updated = if enabled {
                current | $mask
            } else {
                current & !$mask
            };
            self.set(Register::Control, updated);
        }
    }};
}

/// Generate accessors for a red/green/blue register triple.
macro_rules! channel_registers {
    { $name:ident, $red:ident, $green:ident, $blue:ident, $doc:literal } => {
    paste! {
        #[doc = $doc]
        pub fn $name(&self) -> [u8; 3] {
            [
                self.get(Register::$red),
                self.get(Register::$green),
                self.get(Register::$blue),
            ]
        }

        pub fn [< set_ $name >](&mut self, values: [u8; 3]) {
            self.set(Register::$red, values[0]);
            self.set(Register::$green, values[1]);
            self.set(Register::$blue, values[2]);
        }
    }};
}

/// Everything the host knows about the device's current state.
///
/// The registers are stateful on the device side, so the host keeps a shadow copy and only sends
/// registers that have changed since the last flush.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceState {
    registers: [u8; REGISTER_COUNT],

    /// Registers that differ from what the device has.
    dirty: BitArray<[u32; 1]>,

    /// Head position in motor steps from home.
    pub(crate) head: u32,

    /// Head position of the origin edge, once found.
    pub(crate) origin: Option<u32>,

    /// First native column past the frame, once found.
    pub(crate) margin: Option<u16>,
}

impl Default for DeviceState {
    fn default() -> Self {
        let mut state = Self {
            registers: [0u8; REGISTER_COUNT],
            dirty: BitArray::new([0; 1]),
            head: 0,
            origin: None,
            margin: None,
        };
        // The device's power-on state isn't known, so everything is sent on first flush.
        state.mark_all_dirty();
        state
    }
}

impl DeviceState {
    pub fn get(&self, register: Register) -> u8 {
        self.registers[register.index()]
    }

    /// Update a register, marking it for the next flush only if the value changed.
    pub fn set(&mut self, register: Register, value: u8) {
        let index = register.index();
        if self.registers[index] != value {
            self.registers[index] = value;
            self.dirty.set(index, true);
        }
    }

    pub fn set_all(&mut self, values: &[(Register, u8)]) {
        for (register, value) in values {
            self.set(*register, *value);
        }
    }

    control_flag! {
        lamp,
        CONTROL_LAMP,
        "Whether the lamp is on."
    }

    control_flag! {
        motor,
        CONTROL_MOTOR,
        "Whether the head advances while scanning. Calibration strips are taken with it held."
    }

    channel_registers! {
        gains,
        GainRed,
        GainGreen,
        GainBlue,
        "Amplifier gain for each channel."
    }

    channel_registers! {
        offsets,
        OffsetRed,
        OffsetGreen,
        OffsetBlue,
        "Analog offset for each channel."
    }

    pub fn variant(&self) -> SensorVariant {
        if self.get(Register::Control) & CONTROL_ALTERNATE_SENSOR != 0 {
            SensorVariant::Alternate
        } else {
            SensorVariant::Primary
        }
    }

    pub fn set_variant(&mut self, variant: SensorVariant) {
        let current = self.get(Register::Control) & !CONTROL_ALTERNATE_SENSOR;
        let updated = match variant {
            SensorVariant::Primary => current,
            SensorVariant::Alternate => current | CONTROL_ALTERNATE_SENSOR,
        };
        self.set(Register::Control, updated);
    }

    pub fn set_x_start(&mut self, column: u16) {
        let [high, low] = column.to_be_bytes();
        self.set(Register::XStartHigh, high);
        self.set(Register::XStartLow, low);
    }

    pub fn set_width(&mut self, pixels: u16) {
        let [high, low] = pixels.to_be_bytes();
        self.set(Register::WidthHigh, high);
        self.set(Register::WidthLow, low);
    }

    /// Set the number of raw lines to transfer. Only the low 24 bits are used.
    pub fn set_lines(&mut self, lines: u32) {
        let [_, high, mid, low] = lines.to_be_bytes();
        self.set(Register::LinesHigh, high);
        self.set(Register::LinesMid, mid);
        self.set(Register::LinesLow, low);
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn origin(&self) -> Option<u32> {
        self.origin
    }

    pub fn margin(&self) -> Option<u16> {
        self.margin
    }

    /// Register writes needed to bring the device in line with the shadow copy, in address order.
    pub fn pending_writes(&self) -> ArrayVec<(u8, u8), REGISTER_COUNT> {
        self.dirty
            .iter_ones()
            .filter(|index| *index < REGISTER_COUNT)
            .map(|index| (index as u8, self.registers[index]))
            .collect()
    }

    /// Record that the device now matches the shadow copy.
    pub fn mark_clean(&mut self) {
        self.dirty.fill(false);
    }

    /// Forget what the device has, forcing every register out on the next flush.
    pub fn mark_all_dirty(&mut self) {
        for index in 0..REGISTER_COUNT {
            // Skip the holes in the address map.
            if Register::try_from_primitive(index as u8).is_ok() {
                self.dirty.set(index, true);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{DeviceState, Register};
    use crate::profile::SensorVariant;

    fn clean_state() -> DeviceState {
        let mut state = DeviceState::default();
        state.mark_clean();
        state
    }

    #[test]
    fn fresh_state_writes_every_register() {
        let state = DeviceState::default();
        let writes = state.pending_writes();
        // 0x0F is a hole in the address map.
        assert_eq!(writes.len(), super::REGISTER_COUNT - 1);
        assert!(writes.iter().all(|(address, _)| *address != 0x0F));
    }

    #[test]
    fn unchanged_value_is_not_dirty() {
        let mut state = clean_state();
        state.set(Register::Exposure, 0);
        assert!(state.pending_writes().is_empty());
        state.set(Register::Exposure, 7);
        assert_eq!(&state.pending_writes()[..], &[(0x0D, 7)]);
    }

    #[test]
    fn control_flags_are_independent() {
        let mut state = clean_state();
        state.set_lamp(true);
        state.set_variant(SensorVariant::Alternate);
        assert!(state.lamp());
        assert!(!state.motor());
        assert_eq!(state.variant(), SensorVariant::Alternate);
        state.set_motor(true);
        state.set_lamp(false);
        assert_eq!(state.get(Register::Control), 0x06);
        // Three changes to one register are still one write.
        assert_eq!(state.pending_writes().len(), 1);
    }

    #[test]
    fn channel_triples() {
        let mut state = clean_state();
        state.set_gains([1, 2, 3]);
        state.set_offsets([200, 201, 202]);
        assert_eq!(state.gains(), [1, 2, 3]);
        assert_eq!(state.offsets(), [200, 201, 202]);
        let writes = state.pending_writes();
        assert_eq!(
            &writes[..],
            &[
                (0x10, 1),
                (0x11, 2),
                (0x12, 3),
                (0x13, 200),
                (0x14, 201),
                (0x15, 202)
            ]
        );
        state.mark_clean();
        assert!(state.pending_writes().is_empty());
    }

    #[test]
    fn wide_registers_are_big_endian() {
        let mut state = clean_state();
        state.set_width(0x1234);
        state.set_lines(0x00AB_CDEF);
        state.set_x_start(0x0102);
        assert_eq!(state.get(Register::WidthHigh), 0x12);
        assert_eq!(state.get(Register::WidthLow), 0x34);
        assert_eq!(state.get(Register::LinesHigh), 0xAB);
        assert_eq!(state.get(Register::LinesMid), 0xCD);
        assert_eq!(state.get(Register::LinesLow), 0xEF);
        assert_eq!(state.get(Register::XStartHigh), 0x01);
        assert_eq!(state.get(Register::XStartLow), 0x02);
    }
}
