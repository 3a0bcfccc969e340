// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! Command framing and the host side of the device link.
//!
//! Every request is `[opcode, length (u16, big endian), payload…]`, except for the shading table
//! upload which is `[opcode, table…, terminator]`. Every reply starts with a status byte.
use core::convert::TryFrom;

use embedded_hal::blocking::delay::DelayMs;
use log::{debug, trace};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::TransportError;
use crate::options::SessionOptions;
use crate::profile::{CommandTemplate, DeviceProfile};
use crate::register::{DeviceState, REGISTER_COUNT};
use crate::transport::{retry, Transport};
use crate::util::{u24_from_be_bytes, u24_to_be_bytes};

/// Terminates a shading table upload. Table bytes must never take this value.
pub const SHADING_TERMINATOR: u8 = 0xAA;

/// The largest distance a single move command can cover.
const MAX_MOVE_STEPS: u32 = u16::MAX as u32;

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Payload is a sequence of `(address, value)` pairs.
    WriteRegisters = 0x10,

    /// Payload is `[start, count]`, the reply carries `count` register values.
    ReadRegisters = 0x11,

    /// Payload is `[direction, steps (u16)]`.
    Move = 0x20,

    Park = 0x21,
    StartScan = 0x30,

    /// Payload is the requested length as a 24-bit value.
    ReadData = 0x31,

    Abort = 0x3F,

    /// The only unframed command, see [`SHADING_TERMINATOR`].
    WriteShading = 0x40,

    ReadStatus = 0x50,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Status {
    Ack = 0x06,
    Busy = 0x11,
    Nak = 0x15,
}

/// Direction byte of a move command.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
pub enum Direction {
    Forward = 0,
    Backward = 1,
}

/// Flags from a status query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StatusFlags(u8);

impl StatusFlags {
    const MOTOR_BUSY: u8 = 0x01;
    const AT_HOME: u8 = 0x02;
    const SCANNING: u8 = 0x04;

    pub fn motor_busy(self) -> bool {
        self.0 & Self::MOTOR_BUSY != 0
    }

    pub fn at_home(self) -> bool {
        self.0 & Self::AT_HOME != 0
    }

    pub fn scanning(self) -> bool {
        self.0 & Self::SCANNING != 0
    }
}

impl From<u8> for StatusFlags {
    fn from(raw: u8) -> Self {
        Self(raw)
    }
}

/// The result of a single data request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DataReply {
    /// The device has nothing buffered yet.
    NotReady,
    Data(Vec<u8>),
}

/// Frame a request.
pub fn frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut request = Vec::with_capacity(payload.len() + 3);
    request.push(opcode.into());
    request.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    request.extend_from_slice(payload);
    request
}

/// Map a reply status to an error, unless it's an ACK.
fn check_status(opcode: Opcode, status: u8) -> Result<(), TransportError> {
    match Status::try_from(status) {
        Ok(Status::Ack) => Ok(()),
        Ok(Status::Nak) => Err(TransportError::Rejected(opcode.into())),
        _ => Err(TransportError::Protocol {
            opcode: opcode.into(),
            status,
        }),
    }
}

fn expect_len(bytes: &[u8], expected: usize) -> Result<(), TransportError> {
    if bytes.len() < expected {
        Err(TransportError::ShortRead {
            expected,
            received: bytes.len(),
        })
    } else {
        Ok(())
    }
}

/// A transport and delay bound to a device profile, along with the host's view of the device.
#[derive(Debug)]
pub struct Device<T, D> {
    transport: T,
    delay: D,
    state: DeviceState,
    profile: &'static DeviceProfile,
    options: SessionOptions,
}

impl<T, D> Device<T, D>
where
    T: Transport,
    D: DelayMs<u32>,
{
    pub fn new(
        transport: T,
        delay: D,
        profile: &'static DeviceProfile,
        options: SessionOptions,
    ) -> Self {
        let mut transport = transport;
        transport.set_timeout(options.command_timeout);
        Self {
            transport,
            delay,
            state: DeviceState::default(),
            profile,
            options,
        }
    }

    pub fn profile(&self) -> &'static DeviceProfile {
        self.profile
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: SessionOptions) {
        self.options = options;
        self.transport.set_timeout(options.command_timeout);
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut DeviceState {
        &mut self.state
    }

    /// Give back the transport and delay.
    pub fn into_parts(self) -> (T, D) {
        (self.transport, self.delay)
    }

    /// Send a framed command whose reply is only a status byte.
    fn command(&mut self, opcode: Opcode, payload: &[u8]) -> Result<(), TransportError> {
        let request = frame(opcode, payload);
        let transport = &mut self.transport;
        retry(self.options.retries, || {
            trace!("{:?}", opcode);
            transport.send(&request)?;
            let reply = transport.receive(1)?;
            expect_len(&reply, 1)?;
            check_status(opcode, reply[0])
        })
    }

    /// Write every register that changed since the last flush.
    pub fn flush(&mut self) -> Result<(), TransportError> {
        let writes = self.state.pending_writes();
        if writes.is_empty() {
            return Ok(());
        }
        let payload: Vec<u8> = writes
            .iter()
            .flat_map(|(address, value)| [*address, *value])
            .collect();
        debug!("writing {} registers", writes.len());
        self.command(Opcode::WriteRegisters, &payload)?;
        self.state.mark_clean();
        Ok(())
    }

    /// Apply a command template to the register shadow. Nothing is sent until the next flush.
    pub fn apply_template(&mut self, template: &CommandTemplate) {
        self.state.set_all(template.registers);
    }

    /// Read `count` registers from the device, starting at `start`.
    pub fn read_registers(&mut self, start: u8, count: u8) -> Result<Vec<u8>, TransportError> {
        let count = count.min(REGISTER_COUNT.saturating_sub(start as usize) as u8);
        let request = frame(Opcode::ReadRegisters, &[start, count]);
        let transport = &mut self.transport;
        retry(self.options.retries, || {
            transport.send(&request)?;
            let status = transport.receive(1)?;
            expect_len(&status, 1)?;
            check_status(Opcode::ReadRegisters, status[0])?;
            let values = transport.receive(count as usize)?;
            expect_len(&values, count as usize)?;
            Ok(values)
        })
    }

    pub fn read_status(&mut self) -> Result<StatusFlags, TransportError> {
        let request = frame(Opcode::ReadStatus, &[]);
        let transport = &mut self.transport;
        retry(self.options.retries, || {
            transport.send(&request)?;
            let status = transport.receive(1)?;
            expect_len(&status, 1)?;
            check_status(Opcode::ReadStatus, status[0])?;
            let flags = transport.receive(1)?;
            expect_len(&flags, 1)?;
            Ok(StatusFlags::from(flags[0]))
        })
    }

    /// Poll until the motor stops.
    pub fn wait_for_motor(&mut self) -> Result<(), TransportError> {
        for _ in 0..self.options.max_polls {
            if !self.read_status()?.motor_busy() {
                return Ok(());
            }
            self.delay.delay_ms(self.options.poll_interval_ms);
        }
        Err(TransportError::Timeout(self.options.command_timeout))
    }

    /// Move the head to an absolute position, in motor steps from home.
    pub fn move_to(&mut self, position: u32) -> Result<(), TransportError> {
        let head = self.state.head;
        let (direction, mut remaining) = if position >= head {
            (Direction::Forward, position - head)
        } else {
            (Direction::Backward, head - position)
        };
        if remaining > 0 {
            debug!("moving head from {} to {}", head, position);
        }
        while remaining > 0 {
            let steps = remaining.min(MAX_MOVE_STEPS);
            let [high, low] = (steps as u16).to_be_bytes();
            self.command(Opcode::Move, &[direction.into(), high, low])?;
            self.wait_for_motor()?;
            remaining -= steps;
            self.state.head = match direction {
                Direction::Forward => self.state.head + steps,
                Direction::Backward => self.state.head - steps,
            };
        }
        Ok(())
    }

    /// Return the head to its home position.
    pub fn park(&mut self) -> Result<(), TransportError> {
        self.command(Opcode::Park, &[])?;
        self.wait_for_motor()?;
        self.state.head = 0;
        Ok(())
    }

    pub fn start_scan(&mut self) -> Result<(), TransportError> {
        self.command(Opcode::StartScan, &[])
    }

    pub fn abort(&mut self) -> Result<(), TransportError> {
        self.command(Opcode::Abort, &[])
    }

    /// Send the shading table. `table` must already be escaped.
    ///
    /// The device is assumed to store the table for its own use and to send scan data
    /// uncorrected. [`Decoder`](crate::decode::Decoder) applies the same table on the host, so
    /// hardware that corrects the data stream itself would be corrected twice.
    pub fn upload_shading(&mut self, table: &[u8]) -> Result<(), TransportError> {
        let mut request = Vec::with_capacity(table.len() + 2);
        request.push(Opcode::WriteShading.into());
        request.extend_from_slice(table);
        request.push(SHADING_TERMINATOR);
        debug!("uploading {} bytes of shading data", table.len());
        let transport = &mut self.transport;
        retry(self.options.retries, || {
            transport.send(&request)?;
            let reply = transport.receive(1)?;
            expect_len(&reply, 1)?;
            check_status(Opcode::WriteShading, reply[0])
        })
    }

    /// Ask for up to `len` bytes of scan data.
    ///
    /// Only the request and its header are retried. Once the device has accepted the request it
    /// starts sending the payload, and asking again would skip whatever was lost, so a short
    /// payload is an error.
    pub fn request_data(&mut self, len: usize) -> Result<DataReply, TransportError> {
        let request = frame(Opcode::ReadData, &u24_to_be_bytes(len as u32));
        self.transport.set_timeout(self.options.data_timeout);
        let transport = &mut self.transport;
        let result = retry(self.options.retries, || {
            transport.send(&request)?;
            let header = transport.receive(4)?;
            expect_len(&header, 4)?;
            let count = u24_from_be_bytes([header[1], header[2], header[3]]) as usize;
            match Status::try_from(header[0]) {
                Ok(Status::Busy) if count == 0 => return Ok(None),
                _ => check_status(Opcode::ReadData, header[0])?,
            }
            if count > len {
                return Err(TransportError::Protocol {
                    opcode: Opcode::ReadData.into(),
                    status: header[0],
                });
            }
            Ok(Some(count))
        })
        .and_then(|accepted| match accepted {
            None => Ok(DataReply::NotReady),
            Some(count) => {
                let data = transport.receive(count)?;
                expect_len(&data, count)?;
                trace!("received {} of {} requested bytes", count, len);
                Ok(DataReply::Data(data))
            }
        });
        self.transport.set_timeout(self.options.command_timeout);
        result
    }

    /// Read exactly `total` bytes of scan data, waiting out "not ready" replies.
    ///
    /// Used for strips, where the whole transfer is consumed at once.
    pub fn read_all(&mut self, total: usize) -> Result<Vec<u8>, TransportError> {
        let mut data = Vec::with_capacity(total);
        let mut polls = 0;
        while data.len() < total {
            let wanted = (total - data.len()).min(self.options.block_size);
            match self.request_data(wanted)? {
                DataReply::Data(bytes) if !bytes.is_empty() => {
                    polls = 0;
                    data.extend_from_slice(&bytes);
                }
                _ => {
                    polls += 1;
                    if polls >= self.options.max_polls {
                        return Err(TransportError::Timeout(self.options.data_timeout));
                    }
                    self.delay.delay_ms(self.options.poll_interval_ms);
                }
            }
        }
        Ok(data)
    }
}

#[cfg(test)]
mod test {
    use core::time::Duration;

    use linescan_test_data::{NoopDelay, SimConfig, SimulatedScanner};

    use super::{frame, DataReply, Device, Opcode};
    use crate::error::TransportError;
    use crate::options::SessionOptions;
    use crate::register::Register;
    use crate::test::{sim_device, SIM_PROFILE};
    use crate::transport::{BusTransport, Transport};

    #[test]
    fn framing() {
        assert_eq!(
            frame(Opcode::ReadRegisters, &[0x10, 0x03]),
            vec![0x11, 0x00, 0x02, 0x10, 0x03]
        );
        assert_eq!(frame(Opcode::Park, &[]), vec![0x21, 0x00, 0x00]);
    }

    #[test]
    fn flush_only_sends_changes() {
        let (sim, mut device) = sim_device(SimConfig::default());
        device.flush().unwrap();
        assert_eq!(sim.register_writes().len(), crate::register::REGISTER_COUNT - 1);
        sim.clear_history();
        device.flush().unwrap();
        assert!(sim.opcodes().is_empty(), "A clean shadow should not be written");
        device.state_mut().set(Register::Exposure, 0x42);
        device.state_mut().set_gains([1, 2, 3]);
        device.flush().unwrap();
        assert_eq!(
            sim.register_writes(),
            vec![(0x0D, 0x42), (0x10, 1), (0x11, 2), (0x12, 3)]
        );
        assert_eq!(device.read_registers(0x10, 3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn nak_is_retried() {
        let (sim, mut device) = sim_device(SimConfig::default());
        sim.nak_next(2);
        device.state_mut().set(Register::Exposure, 0x42);
        device.flush().unwrap();
        assert_eq!(sim.register(0x0D), 0x42);
        assert_eq!(sim.naks_sent(), 2);
    }

    #[test]
    fn nak_retries_are_bounded() {
        let (sim, mut device) = sim_device(SimConfig::default());
        device.set_options(SessionOptions::default().with_retries(2));
        sim.nak_next(5);
        let result = device.start_scan();
        assert_eq!(result, Err(TransportError::Rejected(0x30)));
        assert_eq!(sim.naks_sent(), 2);
        // The shadow isn't marked clean by a failed flush.
        device.state_mut().set(Register::Exposure, 0x42);
        assert!(device.flush().is_err());
        assert!(!device.state().pending_writes().is_empty());
    }

    #[test]
    fn moves_wait_for_the_motor() {
        let config = SimConfig {
            motor_busy_polls: 3,
            ..SimConfig::default()
        };
        let (sim, mut device) = sim_device(config);
        device.move_to(70_000).unwrap();
        assert_eq!(sim.head(), 70_000);
        assert_eq!(device.state().head(), 70_000);
        // Split into two moves, each followed by polling until idle.
        let moves = sim
            .opcodes()
            .into_iter()
            .filter(|opcode| *opcode == 0x20)
            .count();
        assert_eq!(moves, 2);
        device.move_to(100).unwrap();
        assert_eq!(sim.head(), 100);
        device.park().unwrap();
        assert_eq!(sim.head(), 0);
        assert!(device.read_status().unwrap().at_home());
    }

    #[test]
    fn stuck_motor_times_out() {
        let config = SimConfig {
            motor_busy_polls: 1_000,
            ..SimConfig::default()
        };
        let (_sim, mut device) = sim_device(config);
        device.set_options(SessionOptions::default().with_polling(1, 5));
        assert!(matches!(device.park(), Err(TransportError::Timeout(_))));
    }

    #[test]
    fn not_ready_data() {
        let (sim, mut device) = sim_device(SimConfig::default());
        sim.stall_next(1);
        assert_eq!(device.request_data(16).unwrap(), DataReply::NotReady);
    }

    #[test]
    fn shading_upload_is_terminated() {
        let (sim, mut device) = sim_device(SimConfig::default());
        device.upload_shading(&[0x00, 0x10, 0xA9, 0x0F]).unwrap();
        assert_eq!(sim.shading_uploads(), vec![vec![0x00, 0x10, 0xA9, 0x0F]]);
    }

    #[test]
    fn wrong_address_is_a_bus_error() {
        let sim = SimulatedScanner::new(SimConfig::default());
        let transport = BusTransport::new(sim, 0x01);
        let mut device = Device::new(
            transport,
            NoopDelay::default(),
            &SIM_PROFILE,
            SessionOptions::default(),
        );
        assert!(matches!(device.park(), Err(TransportError::Bus(_))));
    }

    /// Answers every data request in full, then streams a running count. The first payload is
    /// cut short.
    #[derive(Default)]
    struct TruncatingTransport {
        requests: usize,
        header: Option<Vec<u8>>,
        next: u8,
        truncated: bool,
    }

    impl Transport for TruncatingTransport {
        fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            assert_eq!(bytes[0], 0x31);
            self.requests += 1;
            self.header = Some(vec![0x06, bytes[3], bytes[4], bytes[5]]);
            Ok(())
        }

        fn receive(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
            if let Some(header) = self.header.take() {
                return Ok(header);
            }
            let len = if self.truncated { len } else { len / 2 };
            self.truncated = true;
            let data = (0..len).map(|i| self.next.wrapping_add(i as u8)).collect();
            self.next = self.next.wrapping_add(len as u8);
            Ok(data)
        }

        fn set_timeout(&mut self, _timeout: Duration) {}
    }

    #[test]
    fn short_payload_is_not_requested_again() {
        let mut device = Device::new(
            TruncatingTransport::default(),
            NoopDelay::default(),
            &SIM_PROFILE,
            SessionOptions::default().with_retries(3),
        );
        assert_eq!(
            device.request_data(8),
            Err(TransportError::ShortRead {
                expected: 8,
                received: 4
            })
        );
        let (transport, _) = device.into_parts();
        assert_eq!(transport.requests, 1);
    }
}
