// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! The byte channel to the scanner.
//!
//! Everything above this module only needs ordered, byte-exact delivery. Framing details of the
//! physical link (nibble/ECP/EPP negotiation on a parallel port, USB bulk endpoints, checksums)
//! belong to the [`Transport`] implementation.
use core::fmt::Debug;
use core::time::Duration;

use embedded_hal::blocking::i2c;
use log::{debug, trace};

use crate::error::TransportError;

/// The timeout a freshly created transport starts with.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A command/response byte channel to the scanner.
pub trait Transport {
    /// Write all of `bytes` to the device.
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read exactly `len` bytes from the device.
    fn receive(&mut self, len: usize) -> Result<Vec<u8>, TransportError>;

    /// Set how long `send` and `receive` may block.
    fn set_timeout(&mut self, timeout: Duration);
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).send(bytes)
    }

    fn receive(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        (**self).receive(len)
    }

    fn set_timeout(&mut self, timeout: Duration) {
        (**self).set_timeout(timeout)
    }
}

/// Run `exchange` up to `attempts` times, stopping at the first success or at the first error
/// that resending can't fix.
///
/// The whole exchange is repeated, so `exchange` must start by sending its command.
pub fn retry<T, F>(attempts: u8, mut exchange: F) -> Result<T, TransportError>
where
    F: FnMut() -> Result<T, TransportError>,
{
    let mut remaining = attempts.max(1);
    loop {
        match exchange() {
            Err(err) if err.is_retryable() && remaining > 1 => {
                remaining -= 1;
                debug!("resynchronizing after '{}', {} attempts left", err, remaining);
            }
            result => return result,
        }
    }
}

/// A [`Transport`] over an `embedded-hal` blocking I²C bus.
///
/// Every `send` is a single write transaction, and every `receive` a single read transaction, to
/// the device's bus address.
#[derive(Clone, Debug)]
pub struct BusTransport<I2C> {
    bus: I2C,

    /// The bus address of the scanner.
    address: u8,

    timeout: Duration,
}

impl<I2C> BusTransport<I2C> {
    pub fn new(bus: I2C, address: u8) -> Self {
        Self {
            bus,
            address,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// The bus address of the scanner.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// The most recently configured timeout.
    ///
    /// Blocking I²C has no notion of a timeout, so this is only recorded for bus implementations
    /// that are configured out of band.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn bus(&self) -> &I2C {
        &self.bus
    }

    /// Give the bus back.
    pub fn release(self) -> I2C {
        self.bus
    }
}

impl<I2C> Transport for BusTransport<I2C>
where
    I2C: i2c::Write + i2c::Read,
    <I2C as i2c::Write>::Error: Debug,
    <I2C as i2c::Read>::Error: Debug,
{
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        trace!("-> {:02x?}", bytes);
        self.bus
            .write(self.address, bytes)
            .map_err(|err| TransportError::Bus(format!("{:?}", err)))
    }

    fn receive(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut buffer = vec![0u8; len];
        // A zero-length read is not a valid bus transaction.
        if len > 0 {
            self.bus
                .read(self.address, &mut buffer)
                .map_err(|err| TransportError::Bus(format!("{:?}", err)))?;
        }
        trace!("<- {} bytes", len);
        Ok(buffer)
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

#[cfg(test)]
mod test {
    use core::cell::Cell;

    use linescan_test_data::{SimConfig, SimulatedScanner};

    use super::{retry, BusTransport, Transport};
    use crate::error::TransportError;

    #[test]
    fn retry_stops_on_success() {
        let calls = Cell::new(0);
        let result = retry(3, || {
            calls.set(calls.get() + 1);
            if calls.get() < 2 {
                Err(TransportError::Rejected(0x10))
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result, Ok(2));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn retry_is_bounded() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry(4, || {
            calls.set(calls.get() + 1);
            Err(TransportError::Rejected(0x10))
        });
        assert_eq!(result, Err(TransportError::Rejected(0x10)));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn retry_skips_fatal_errors() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry(4, || {
            calls.set(calls.get() + 1);
            Err(TransportError::Bus("gone".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1, "Bus errors should not be retried");
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let calls = Cell::new(0);
        let _ = retry(0, || {
            calls.set(calls.get() + 1);
            Ok::<_, TransportError>(())
        });
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn bus_transport_wrong_address() {
        let sim = SimulatedScanner::new(SimConfig::default());
        let mut transport = BusTransport::new(sim, 0x7f);
        let result = transport.send(&[0x50, 0x00, 0x00]);
        assert!(matches!(result, Err(TransportError::Bus(_))));
    }

    #[test]
    fn bus_transport_status_exchange() {
        let config = SimConfig::default();
        let address = config.address;
        let sim = SimulatedScanner::new(config);
        let mut transport = BusTransport::new(sim, address);
        transport.send(&[0x50, 0x00, 0x00]).unwrap();
        let reply = transport.receive(2).unwrap();
        assert_eq!(reply[0], 0x06);
        // Fresh devices start parked.
        assert_eq!(reply[1] & 0x02, 0x02);
        assert!(transport.receive(0).unwrap().is_empty());
    }
}
