// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::i2c;

const ACK: u8 = 0x06;
const BUSY: u8 = 0x11;
const NAK: u8 = 0x15;

const WRITE_REGISTERS: u8 = 0x10;
const READ_REGISTERS: u8 = 0x11;
const MOVE: u8 = 0x20;
const PARK: u8 = 0x21;
const START_SCAN: u8 = 0x30;
const READ_DATA: u8 = 0x31;
const ABORT: u8 = 0x3F;
const WRITE_SHADING: u8 = 0x40;
const READ_STATUS: u8 = 0x50;

const SHADING_TERMINATOR: u8 = 0xAA;

const REGISTER_COUNT: usize = 0x16;

// Register addresses the simulator acts on.
const CONTROL: usize = 0x00;
const MODE: usize = 0x01;
const SOURCE: usize = 0x02;
const X_DIVIDER: usize = 0x03;
const Y_STEP: usize = 0x04;
const X_START: usize = 0x05;
const WIDTH: usize = 0x07;
const LINES: usize = 0x09;
const OVERSAMPLE: usize = 0x0C;
const GAIN: usize = 0x10;
const OFFSET: usize = 0x13;

/// Unused address in the register map.
const REGISTER_HOLE: usize = 0x0F;

const CONTROL_LAMP: u8 = 0x01;
const CONTROL_MOTOR: u8 = 0x02;
const CONTROL_ALTERNATE_SENSOR: u8 = 0x04;

const SOURCE_DUPLEX: u8 = 3;

/// Lines sent before the first real line when oversampling.
const RIPPLE_LINES: usize = 2;

/// Reflectance of the frame to the left of the margin.
const FRAME_REFLECTANCE: f32 = 0.03;

/// Reflectance of the bed before the origin edge.
const DARK_REFLECTANCE: f32 = 0.04;

/// Reflectance of the grey calibration strip.
const GREY_REFLECTANCE: f32 = 0.5;

/// Signal level with the offset at its midpoint and no light.
const PEDESTAL: f32 = 2.0;

/// Document reflectance at a step into the document area and a native column.
pub type Pattern = fn(u32, usize) -> f32;

/// The physical setup being simulated.
///
/// The bed is laid out along the motor axis, measured in steps from home: a dark area up to
/// `edge_steps`, then the white strip, then the grey strip, then the document.
#[derive(Clone, Debug)]
pub struct SimConfig {
    /// Bus address the simulator answers on.
    pub address: u8,

    /// Native columns across the sensor.
    pub pitch: usize,

    /// Native columns covered by the frame on the left.
    pub margin: usize,

    pub edge_steps: u32,
    pub white_steps: u32,
    pub grey_steps: u32,

    /// Reflectance of the document when there's no pattern.
    pub document_level: f32,

    /// Reflectance of the back side of the document.
    pub back_level: f32,

    pub document: Option<Pattern>,

    /// How far behind the head each channel's sensor row sits, in steps.
    pub channel_offsets: [u32; 3],

    /// Front and back columns are interleaved in runs of this many when duplexing.
    pub duplex_group: usize,

    /// Whether the fitted sensor is the alternate variant.
    ///
    /// Scanning with the wrong variant selected gives a much weaker signal.
    pub alternate_sensor: bool,

    /// The most data bytes sent in one reply.
    pub max_chunk: usize,

    /// Status polls a move keeps the motor busy for.
    pub motor_busy_polls: u32,

    /// How much each channel's gain leaks into the others.
    pub crosstalk: f32,

    /// Scales the effect of the gain registers.
    pub gain_scale: f32,

    pub lamp_broken: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            address: 0x2A,
            pitch: 96,
            margin: 6,
            edge_steps: 40,
            white_steps: 60,
            grey_steps: 40,
            document_level: 0.8,
            back_level: 0.4,
            document: None,
            channel_offsets: [0, 8, 16],
            duplex_group: 1,
            alternate_sensor: false,
            max_chunk: usize::MAX,
            motor_busy_polls: 2,
            crosstalk: 0.05,
            gain_scale: 1.0,
            lamp_broken: false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SimError {
    /// Nothing answers at this bus address.
    UnknownAddress(u8),

    /// More bytes were read than the simulator has queued.
    Underrun { requested: usize, available: usize },

    /// A write too short to carry a command header.
    Malformed,
}

/// Scan geometry latched from the registers at the start of a scan.
#[derive(Clone, Copy, Debug)]
struct Geometry {
    color: bool,
    sides: usize,
    divider: usize,
    y_step: u32,
    x_start: usize,
    width: usize,
    lines: usize,
    oversample: bool,
    lamp: bool,
    motor: bool,
    alternate: bool,
}

#[derive(Debug)]
struct Inner {
    config: SimConfig,
    registers: [u8; REGISTER_COUNT],
    head: u32,
    motor_busy: u32,
    scanning: bool,

    /// Scan data not yet transferred.
    pending: VecDeque<u8>,

    /// The reply to the most recent command.
    replies: VecDeque<u8>,

    nak_remaining: u32,
    naks_sent: u32,
    stall_remaining: u32,

    opcodes: Vec<u8>,
    register_writes: Vec<(u8, u8)>,
    data_requests: Vec<usize>,
    shading_uploads: Vec<Vec<u8>>,
}

impl Inner {
    fn new(config: SimConfig) -> Self {
        Self {
            config,
            registers: [0u8; REGISTER_COUNT],
            head: 0,
            motor_busy: 0,
            scanning: false,
            pending: VecDeque::new(),
            replies: VecDeque::new(),
            nak_remaining: 0,
            naks_sent: 0,
            stall_remaining: 0,
            opcodes: Vec::new(),
            register_writes: Vec::new(),
            data_requests: Vec::new(),
            shading_uploads: Vec::new(),
        }
    }

    fn reply(&mut self, bytes: &[u8]) {
        self.replies.extend(bytes.iter().copied());
    }

    /// Data replies always carry a length, even when rejected.
    fn nak(&mut self, opcode: u8) {
        if opcode == READ_DATA {
            self.reply(&[NAK, 0, 0, 0]);
        } else {
            self.reply(&[NAK]);
        }
    }

    fn handle(&mut self, bytes: &[u8]) -> Result<(), SimError> {
        self.replies.clear();
        let (&opcode, rest) = bytes.split_first().ok_or(SimError::Malformed)?;
        self.opcodes.push(opcode);
        if self.nak_remaining > 0 {
            self.nak_remaining -= 1;
            self.naks_sent += 1;
            self.nak(opcode);
            return Ok(());
        }
        if opcode == WRITE_SHADING {
            match rest.split_last() {
                Some((&SHADING_TERMINATOR, table)) if !table.contains(&SHADING_TERMINATOR) => {
                    self.shading_uploads.push(table.to_vec());
                    self.reply(&[ACK]);
                }
                _ => self.nak(opcode),
            }
            return Ok(());
        }
        if rest.len() < 2 {
            return Err(SimError::Malformed);
        }
        let length = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        let payload = &rest[2..];
        if payload.len() != length {
            self.nak(opcode);
            return Ok(());
        }
        match opcode {
            WRITE_REGISTERS => self.write_registers(payload),
            READ_REGISTERS => match payload {
                [start, count] if (*start as usize + *count as usize) <= REGISTER_COUNT => {
                    let start = *start as usize;
                    let values = self.registers[start..start + *count as usize].to_vec();
                    self.reply(&[ACK]);
                    self.reply(&values);
                }
                _ => self.nak(opcode),
            },
            MOVE => match payload {
                [direction @ (0 | 1), high, low] => {
                    let steps = u16::from_be_bytes([*high, *low]) as u32;
                    self.head = if *direction == 0 {
                        self.head + steps
                    } else {
                        self.head.saturating_sub(steps)
                    };
                    self.motor_busy = self.config.motor_busy_polls;
                    self.reply(&[ACK]);
                }
                _ => self.nak(opcode),
            },
            PARK => {
                self.head = 0;
                self.motor_busy = self.config.motor_busy_polls;
                self.reply(&[ACK]);
            }
            START_SCAN => {
                self.start_scan();
                self.reply(&[ACK]);
            }
            READ_DATA => match payload {
                [high, mid, low] => {
                    let requested = u32::from_be_bytes([0, *high, *mid, *low]) as usize;
                    self.read_data(requested);
                }
                _ => self.nak(opcode),
            },
            ABORT => {
                self.pending.clear();
                self.scanning = false;
                self.reply(&[ACK]);
            }
            READ_STATUS => {
                let flags = (self.motor_busy > 0) as u8
                    | ((self.head == 0) as u8) << 1
                    | (self.scanning as u8) << 2;
                self.motor_busy = self.motor_busy.saturating_sub(1);
                self.reply(&[ACK, flags]);
            }
            _ => self.nak(opcode),
        }
        Ok(())
    }

    fn write_registers(&mut self, payload: &[u8]) {
        let valid = payload.len() % 2 == 0
            && payload.chunks_exact(2).all(|pair| {
                let address = pair[0] as usize;
                address < REGISTER_COUNT && address != REGISTER_HOLE
            });
        if !valid {
            self.nak(WRITE_REGISTERS);
            return;
        }
        for pair in payload.chunks_exact(2) {
            self.registers[pair[0] as usize] = pair[1];
            self.register_writes.push((pair[0], pair[1]));
        }
        self.reply(&[ACK]);
    }

    fn read_data(&mut self, requested: usize) {
        self.data_requests.push(requested);
        if self.stall_remaining > 0 || self.pending.is_empty() {
            self.stall_remaining = self.stall_remaining.saturating_sub(1);
            self.reply(&[BUSY, 0, 0, 0]);
            return;
        }
        let count = requested.min(self.pending.len()).min(self.config.max_chunk);
        let [_, high, mid, low] = (count as u32).to_be_bytes();
        self.reply(&[ACK, high, mid, low]);
        let data: Vec<u8> = self.pending.drain(..count).collect();
        self.reply(&data);
        if self.pending.is_empty() {
            self.scanning = false;
        }
    }

    fn register_u16(&self, address: usize) -> usize {
        u16::from_be_bytes([self.registers[address], self.registers[address + 1]]) as usize
    }

    fn geometry(&self) -> Geometry {
        let control = self.registers[CONTROL];
        let lines = u32::from_be_bytes([
            0,
            self.registers[LINES],
            self.registers[LINES + 1],
            self.registers[LINES + 2],
        ]);
        Geometry {
            color: self.registers[MODE] != 0,
            sides: if self.registers[SOURCE] == SOURCE_DUPLEX {
                2
            } else {
                1
            },
            divider: (self.registers[X_DIVIDER] as usize).max(1),
            y_step: self.registers[Y_STEP] as u32,
            x_start: self.register_u16(X_START),
            width: self.register_u16(WIDTH),
            lines: lines as usize,
            oversample: self.registers[OVERSAMPLE] != 0,
            lamp: control & CONTROL_LAMP != 0,
            motor: control & CONTROL_MOTOR != 0,
            alternate: control & CONTROL_ALTERNATE_SENSOR != 0,
        }
    }

    /// Render the whole scan into the pending buffer.
    fn start_scan(&mut self) {
        let geometry = self.geometry();
        let channels: &[usize] = if geometry.color { &[0, 1, 2] } else { &[1] };
        let columns = geometry.width * geometry.sides;
        let mut sequence: Vec<usize> = Vec::new();
        if geometry.oversample {
            sequence.extend(std::iter::repeat(0).take(RIPPLE_LINES));
            for line in 0..geometry.lines {
                sequence.extend([line, line]);
            }
        } else {
            sequence.extend(0..geometry.lines);
        }
        let mut data = Vec::with_capacity(sequence.len() * columns * channels.len());
        for line in sequence {
            let travel = if geometry.motor {
                line as i64 * geometry.y_step as i64
            } else {
                0
            };
            for &channel in channels {
                let step = self.head as i64 + travel - self.config.channel_offsets[channel] as i64;
                for hardware_column in 0..columns {
                    let (side, index) = self.locate(hardware_column, geometry.width, geometry.sides);
                    let column = geometry.x_start + index * geometry.divider;
                    data.push(self.sample(&geometry, step, column, channel, side));
                }
            }
        }
        if geometry.motor {
            self.head += geometry.lines as u32 * geometry.y_step;
        }
        self.pending = data.into();
        self.scanning = !self.pending.is_empty();
    }

    /// Front and back alternate in runs of `duplex_group`, with a short last run on each side.
    fn locate(&self, column: usize, width: usize, sides: usize) -> (usize, usize) {
        if sides == 1 {
            return (0, column);
        }
        let group = self.config.duplex_group.max(1);
        let full = width / group * group;
        if column < 2 * full {
            ((column / group) % 2, (column / (2 * group)) * group + column % group)
        } else {
            let offset = column - 2 * full;
            let tail = width - full;
            (offset / tail, full + offset % tail)
        }
    }

    fn reflectance(&self, step: i64, column: usize, side: usize) -> f32 {
        let config = &self.config;
        let white_start = config.edge_steps as i64;
        let grey_start = white_start + config.white_steps as i64;
        let document_start = grey_start + config.grey_steps as i64;
        if column < config.margin {
            FRAME_REFLECTANCE
        } else if step < white_start {
            DARK_REFLECTANCE
        } else if step < grey_start {
            1.0
        } else if step < document_start {
            GREY_REFLECTANCE
        } else if side == 1 {
            config.back_level
        } else {
            match config.document {
                Some(pattern) => pattern((step - document_start) as u32, column),
                None => config.document_level,
            }
        }
    }

    /// Lamp brightness, with some fall-off across the sensor.
    fn light(&self, geometry: &Geometry, column: usize) -> f32 {
        if !geometry.lamp || self.config.lamp_broken {
            return 0.0;
        }
        let sensitivity = if geometry.alternate == self.config.alternate_sensor {
            1.0
        } else {
            0.25
        };
        (80.0 + 8.0 * (column as f32 * 0.05).sin()) * sensitivity
    }

    fn sample(
        &self,
        geometry: &Geometry,
        step: i64,
        column: usize,
        channel: usize,
        side: usize,
    ) -> u8 {
        let column = column.min(self.config.pitch.saturating_sub(1));
        let offset = self.registers[OFFSET + channel] as f32;
        let signal = self.reflectance(step, column, side) * self.light(geometry, column);
        let level = (signal + PEDESTAL + (offset - 128.0) * 0.25).max(0.0);
        let gains = &self.registers[GAIN..GAIN + 3];
        let own = gains[channel] as f32;
        let others = gains.iter().map(|gain| *gain as f32).sum::<f32>() - own;
        let factor = 1.0 + self.config.gain_scale * (own + self.config.crosstalk * others) / 21.0;
        (level * factor).round().clamp(0.0, 255.0) as u8
    }
}

/// A scanner on an I²C bus.
///
/// Clones share the same device, so a test can keep one to inspect while the driver owns another.
#[derive(Clone)]
pub struct SimulatedScanner {
    inner: Rc<RefCell<Inner>>,
}

impl SimulatedScanner {
    pub fn new(config: SimConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner::new(config))),
        }
    }

    pub fn config(&self) -> SimConfig {
        self.inner.borrow().config.clone()
    }

    /// Every `(address, value)` pair written, in order.
    pub fn register_writes(&self) -> Vec<(u8, u8)> {
        self.inner.borrow().register_writes.clone()
    }

    /// The opcode of every command received, in order.
    pub fn opcodes(&self) -> Vec<u8> {
        self.inner.borrow().opcodes.clone()
    }

    /// The length of every data request, in order.
    pub fn data_requests(&self) -> Vec<usize> {
        self.inner.borrow().data_requests.clone()
    }

    /// Every shading table received, without the terminator.
    pub fn shading_uploads(&self) -> Vec<Vec<u8>> {
        self.inner.borrow().shading_uploads.clone()
    }

    /// Forget the recorded commands, register writes and data requests.
    pub fn clear_history(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.opcodes.clear();
        inner.register_writes.clear();
        inner.data_requests.clear();
    }

    pub fn register(&self, address: u8) -> u8 {
        self.inner.borrow().registers[address as usize]
    }

    pub fn head(&self) -> u32 {
        self.inner.borrow().head
    }

    pub fn lamp(&self) -> bool {
        self.inner.borrow().registers[CONTROL] & CONTROL_LAMP != 0
    }

    pub fn scanning(&self) -> bool {
        self.inner.borrow().scanning
    }

    /// Reject the next `count` commands with a NAK.
    pub fn nak_next(&self, count: u32) {
        self.inner.borrow_mut().nak_remaining = count;
    }

    pub fn naks_sent(&self) -> u32 {
        self.inner.borrow().naks_sent
    }

    /// Answer the next `count` data requests with "not ready", even if data is waiting.
    pub fn stall_next(&self, count: u32) {
        self.inner.borrow_mut().stall_remaining = count;
    }
}

impl fmt::Debug for SimulatedScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("SimulatedScanner")
            .field("address", &inner.config.address)
            .field("head", &inner.head)
            .field("scanning", &inner.scanning)
            .field("pending", &inner.pending.len())
            .finish()
    }
}

impl i2c::Write for SimulatedScanner {
    type Error = SimError;

    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), Self::Error> {
        let mut inner = self.inner.borrow_mut();
        if address != inner.config.address {
            return Err(SimError::UnknownAddress(address));
        }
        inner.handle(bytes)
    }
}

impl i2c::Read for SimulatedScanner {
    type Error = SimError;

    fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<(), Self::Error> {
        let mut inner = self.inner.borrow_mut();
        if address != inner.config.address {
            return Err(SimError::UnknownAddress(address));
        }
        let requested = buffer.len();
        if inner.replies.len() < requested {
            return Err(SimError::Underrun {
                requested,
                available: inner.replies.len(),
            });
        }
        for (byte, reply) in buffer.iter_mut().zip(inner.replies.drain(..requested)) {
            *byte = reply;
        }
        Ok(())
    }
}

/// A delay that returns immediately, keeping a tally of the time it should have waited.
#[derive(Clone, Debug, Default)]
pub struct NoopDelay {
    waited: Rc<Cell<u32>>,
}

impl NoopDelay {
    pub fn waited_ms(&self) -> u32 {
        self.waited.get()
    }
}

impl DelayMs<u32> for NoopDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.waited.set(self.waited.get().saturating_add(ms));
    }
}
