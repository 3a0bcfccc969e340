// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use core::fmt;
use core::mem;

use embedded_hal::blocking::delay::DelayMs;
use log::info;

use crate::calibration::{CalibrationRecord, CalibrationSet};
use crate::error::Error;
use crate::geometry::{resolve, ScanPlan, ScanRequest};
use crate::options::SessionOptions;
use crate::profile::{by_id, DeviceProfile};
use crate::protocol::Device;
use crate::sequencer::{CancelHandle, Chunk, Sequencer, State};
use crate::transport::Transport;

/// Identifies one scan session on a [`Scanner`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(u32);

impl SessionId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Who has the device link right now.
#[derive(Debug)]
enum Link<T, D> {
    Idle(Device<T, D>),
    Session {
        id: SessionId,
        sequencer: Sequencer<T, D>,
    },

    /// Only seen while the link is being handed between the two other states.
    Closed,
}

/// A handle to one scanner.
///
/// One session runs at a time. A session borrows the device link from the handle, and gives it
/// back when it finishes, fails, or is cancelled:
///
/// ```no_run
/// # use linescan::{ColorMode, ScanRequest, Scanner};
/// # fn scan<T: linescan::Transport, D: embedded_hal::blocking::delay::DelayMs<u32>>(
/// #     transport: T,
/// #     delay: D,
/// # ) -> Result<Vec<u8>, linescan::Error> {
/// let mut scanner = Scanner::open("ls600", transport, delay)?;
/// scanner.configure(ScanRequest::new(2550, 3300, 300, ColorMode::Color))?;
/// let session = scanner.start()?;
/// let mut image = Vec::new();
/// loop {
///     let chunk = scanner.read(session, 0x8000)?;
///     image.extend_from_slice(&chunk.bytes);
///     if chunk.is_final {
///         break;
///     }
/// }
/// # Ok(image)
/// # }
/// ```
#[derive(Debug)]
pub struct Scanner<T, D> {
    link: Link<T, D>,
    profile: &'static DeviceProfile,
    plan: Option<ScanPlan>,
    cancel: CancelHandle,
    next_session: u32,

    /// The most recent complete calibration.
    calibration: Option<CalibrationSet>,

    /// How the most recent session ended.
    last_state: State,
}

impl<T, D> Scanner<T, D>
where
    T: Transport,
    D: DelayMs<u32>,
{
    /// Open a scanner with one of the built-in profiles.
    pub fn open(device_id: &str, transport: T, delay: D) -> Result<Self, Error> {
        let profile = by_id(device_id).ok_or_else(|| Error::UnknownDevice(device_id.into()))?;
        Ok(Self::open_with_profile(profile, transport, delay))
    }

    pub fn open_with_profile(profile: &'static DeviceProfile, transport: T, delay: D) -> Self {
        info!("opening {}", profile.name);
        Self {
            link: Link::Idle(Device::new(
                transport,
                delay,
                profile,
                SessionOptions::default(),
            )),
            profile,
            plan: None,
            cancel: CancelHandle::default(),
            next_session: 0,
            calibration: None,
            last_state: State::Idle,
        }
    }

    /// Replace the session options. They take effect from the next session.
    pub fn with_options(mut self, options: SessionOptions) -> Self {
        if let Link::Idle(device) = &mut self.link {
            device.set_options(options);
        }
        self
    }

    pub fn profile(&self) -> &'static DeviceProfile {
        self.profile
    }

    /// Validate a request and keep its plan for the next session.
    pub fn configure(&mut self, request: ScanRequest) -> Result<ScanPlan, Error> {
        if matches!(self.link, Link::Session { .. }) {
            return Err(Error::Busy);
        }
        let plan = resolve(&request, self.profile)?;
        self.plan = Some(plan);
        Ok(plan)
    }

    /// Position, calibrate and start a scan of the configured area.
    pub fn start(&mut self) -> Result<SessionId, Error> {
        let device = match mem::replace(&mut self.link, Link::Closed) {
            Link::Idle(device) => device,
            Link::Session { id, sequencer } => {
                self.link = Link::Session { id, sequencer };
                return Err(Error::Busy);
            }
            Link::Closed => return Err(Error::Closed),
        };
        let plan = match self.plan {
            Some(plan) => plan,
            None => {
                self.link = Link::Idle(device);
                return Err(Error::NotConfigured);
            }
        };
        self.next_session += 1;
        let id = SessionId(self.next_session);
        self.cancel.reset();
        info!("starting session {}", id);
        let mut sequencer = Sequencer::new(device, plan, self.cancel.clone());
        let prepared = sequencer.prepare();
        self.link = Link::Session { id, sequencer };
        match prepared {
            Ok(()) => Ok(id),
            Err(err) => {
                self.retire();
                Err(err)
            }
        }
    }

    /// Read up to `max_len` bytes of the session's image.
    ///
    /// Front side bytes come first, then the back side for duplex scans. The last chunk of each
    /// side has `is_final` set. A chunk may be empty when the device has no data ready.
    pub fn read(&mut self, id: SessionId, max_len: usize) -> Result<Chunk, Error> {
        let sequencer = self.session(id)?;
        let result = sequencer.pull(max_len);
        let finished = sequencer.state().is_terminal();
        if finished {
            self.retire();
        }
        result
    }

    /// Stop the session, parking the head.
    pub fn cancel(&mut self, id: SessionId) -> Result<(), Error> {
        self.session(id)?.cancel();
        self.retire();
        Ok(())
    }

    /// Give back the transport and delay, cancelling any running session.
    pub fn close(self) -> Result<(T, D), Error> {
        let device = match self.link {
            Link::Idle(device) => device,
            Link::Session { mut sequencer, .. } => {
                sequencer.cancel();
                sequencer.into_parts().0
            }
            Link::Closed => return Err(Error::Closed),
        };
        Ok(device.into_parts())
    }

    /// The running session's state, or how the last one ended.
    pub fn state(&self) -> &State {
        match &self.link {
            Link::Session { sequencer, .. } => sequencer.state(),
            _ => &self.last_state,
        }
    }

    /// A handle that cancels the running session from elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// The calibration of the running session, or of the last session that completed one.
    pub fn calibration(&self) -> Option<&CalibrationSet> {
        match &self.link {
            Link::Session { sequencer, .. } => {
                sequencer.calibration().or(self.calibration.as_ref())
            }
            _ => self.calibration.as_ref(),
        }
    }

    pub fn calibration_record(&self) -> Option<CalibrationRecord> {
        let shading_target = self.profile.calibration.shading_target;
        self.calibration()
            .map(|calibration| calibration.record(shading_target))
    }

    /// Decode a stored record, checking it belongs to a sensor like this one.
    pub fn load_calibration_record(&self, bytes: &[u8]) -> Result<CalibrationRecord, Error> {
        Ok(CalibrationRecord::from_bytes(
            bytes,
            self.profile.sensor_pitch,
        )?)
    }

    fn session(&mut self, id: SessionId) -> Result<&mut Sequencer<T, D>, Error> {
        match &mut self.link {
            Link::Session {
                id: current,
                sequencer,
            } if *current == id => Ok(sequencer),
            _ => Err(Error::UnknownSession(id.get())),
        }
    }

    /// Take the device link back from a finished session.
    fn retire(&mut self) {
        match mem::replace(&mut self.link, Link::Closed) {
            Link::Session { id, sequencer } => {
                self.last_state = sequencer.state().clone();
                info!("session {} ended: {:?}", id, self.last_state);
                let (device, calibration) = sequencer.into_parts();
                if calibration.is_some() {
                    self.calibration = calibration;
                }
                self.link = Link::Idle(device);
            }
            other => self.link = other,
        }
    }
}

#[cfg(test)]
mod test {
    use linescan_test_data::{NoopDelay, SimConfig, SimulatedScanner};

    use super::{Scanner, SessionId};
    use crate::error::{CalibrationError, Error, RecordError};
    use crate::geometry::ScanRequest;
    use crate::options::SessionOptions;
    use crate::profile::{ColorMode, Source};
    use crate::sequencer::State;
    use crate::test::SIM_PROFILE;
    use crate::transport::BusTransport;

    type SimScanner = Scanner<BusTransport<SimulatedScanner>, NoopDelay>;

    fn sim_scanner(config: SimConfig) -> (SimulatedScanner, SimScanner) {
        let address = config.address;
        let sim = SimulatedScanner::new(config);
        let transport = BusTransport::new(sim.clone(), address);
        let scanner = Scanner::open_with_profile(&SIM_PROFILE, transport, NoopDelay::default());
        (sim, scanner)
    }

    /// Read a whole session, returning each side's bytes.
    fn read_sides(scanner: &mut SimScanner, id: SessionId, max_len: usize) -> Vec<Vec<u8>> {
        let mut sides = vec![Vec::new()];
        loop {
            let chunk = scanner.read(id, max_len).unwrap();
            sides.last_mut().unwrap().extend(chunk.bytes);
            if chunk.is_final {
                if *scanner.state() == State::Done {
                    return sides;
                }
                sides.push(Vec::new());
            }
        }
    }

    #[test]
    fn color_scan() {
        let (sim, mut scanner) = sim_scanner(SimConfig::default());
        let plan = scanner
            .configure(ScanRequest::new(16, 8, 300, ColorMode::Color))
            .unwrap();
        let id = scanner.start().unwrap();
        assert_eq!(*scanner.state(), State::Scanning);
        let sides = read_sides(&mut scanner, id, 100);
        assert_eq!(sides.len(), 1);
        assert_eq!(sides[0].len(), plan.side_bytes());
        assert_eq!(*scanner.state(), State::Done);
        assert_eq!(sim.head(), 0);
        // The session is over, so its id is gone.
        assert_eq!(scanner.read(id, 10), Err(Error::UnknownSession(id.get())));

        let record = scanner.calibration_record().unwrap();
        assert_eq!(record.pitch(), SIM_PROFILE.sensor_pitch);
        assert_eq!(record.gains, scanner.calibration().unwrap().gains);
        assert_eq!(record.shading_target, 240);
        let loaded = scanner.load_calibration_record(&record.to_bytes()).unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn duplex_sides_are_final_in_order() {
        let (_sim, mut scanner) = sim_scanner(SimConfig::default());
        let plan = scanner
            .configure(
                ScanRequest::new(16, 4, 300, ColorMode::Gray).with_source(Source::AdfDuplex),
            )
            .unwrap();
        assert_eq!(plan.sides, 2);
        let id = scanner.start().unwrap();
        let sides = read_sides(&mut scanner, id, 1000);
        assert_eq!(sides.len(), 2);
        assert_eq!(sides[0].len(), plan.side_bytes());
        assert_eq!(sides[1].len(), plan.side_bytes());
        // The back of the simulated page is darker than the front.
        let mean = |side: &[u8]| side.iter().map(|b| *b as u32).sum::<u32>() / side.len() as u32;
        assert!(mean(&sides[0]) > mean(&sides[1]) + 40);
    }

    #[test]
    fn lineart_threshold() {
        let (_sim, mut scanner) = sim_scanner(SimConfig::default());
        scanner
            .configure(ScanRequest::new(16, 4, 300, ColorMode::Lineart))
            .unwrap();
        let id = scanner.start().unwrap();
        let light = read_sides(&mut scanner, id, 1000).remove(0);
        assert_eq!(light, vec![0x00; 8]);

        scanner
            .configure(ScanRequest::new(16, 4, 300, ColorMode::Lineart).with_threshold(250))
            .unwrap();
        let id = scanner.start().unwrap();
        let dark = read_sides(&mut scanner, id, 1000).remove(0);
        assert_eq!(dark, vec![0xFF; 8]);
    }

    #[test]
    fn one_session_at_a_time() {
        let (_sim, mut scanner) = sim_scanner(SimConfig::default());
        assert_eq!(scanner.start(), Err(Error::NotConfigured));
        scanner
            .configure(ScanRequest::new(16, 4, 300, ColorMode::Gray))
            .unwrap();
        let id = scanner.start().unwrap();
        assert_eq!(scanner.start(), Err(Error::Busy));
        assert_eq!(
            scanner.configure(ScanRequest::new(16, 4, 300, ColorMode::Gray)),
            Err(Error::Busy)
        );
        assert_eq!(
            scanner.read(SessionId(id.get() + 1), 10),
            Err(Error::UnknownSession(id.get() + 1))
        );
        read_sides(&mut scanner, id, 1000);
        let next = scanner.start().unwrap();
        assert_ne!(next, id);
    }

    #[test]
    fn cancel_parks_and_frees_the_device() {
        let (sim, mut scanner) = sim_scanner(SimConfig::default());
        scanner
            .configure(ScanRequest::new(16, 4, 300, ColorMode::Gray))
            .unwrap();
        let id = scanner.start().unwrap();
        assert!(sim.head() > 0);
        scanner.cancel(id).unwrap();
        assert_eq!(*scanner.state(), State::Cancelled);
        assert_eq!(sim.head(), 0);
        assert!(!sim.scanning());
        assert_eq!(scanner.cancel(id), Err(Error::UnknownSession(id.get())));
        assert!(scanner.start().is_ok());
    }

    #[test]
    fn cancel_handle() {
        let (sim, mut scanner) = sim_scanner(SimConfig::default());
        scanner
            .configure(ScanRequest::new(16, 4, 300, ColorMode::Gray))
            .unwrap();
        let handle = scanner.cancel_handle();
        let id = scanner.start().unwrap();
        handle.cancel();
        assert_eq!(scanner.read(id, 10), Err(Error::Cancelled));
        assert_eq!(*scanner.state(), State::Cancelled);
        assert_eq!(sim.head(), 0);
        // A new session starts uncancelled.
        let id = scanner.start().unwrap();
        assert!(scanner.read(id, 10).is_ok());
    }

    #[test]
    fn nak_while_streaming_is_retried() {
        let (sim, mut scanner) = sim_scanner(SimConfig::default());
        let plan = scanner
            .configure(ScanRequest::new(16, 4, 300, ColorMode::Gray))
            .unwrap();
        let id = scanner.start().unwrap();
        sim.nak_next(2);
        let sides = read_sides(&mut scanner, id, 1000);
        assert_eq!(sides[0].len(), plan.side_bytes());
        assert_eq!(sim.naks_sent(), 2);
    }

    #[test]
    fn failed_start_returns_the_device() {
        let config = SimConfig {
            edge_steps: 100_000,
            ..SimConfig::default()
        };
        let (sim, mut scanner) = sim_scanner(config);
        scanner
            .configure(ScanRequest::new(16, 4, 300, ColorMode::Gray))
            .unwrap();
        let expected = Error::Calibration(CalibrationError::OriginNotFound);
        assert_eq!(scanner.start(), Err(expected.clone()));
        assert_eq!(*scanner.state(), State::Failed(expected));
        assert_eq!(sim.head(), 0);
        assert!(scanner.calibration_record().is_none());
        // The link is back with the handle.
        assert!(scanner.configure(ScanRequest::new(16, 4, 300, ColorMode::Gray)).is_ok());
        let (transport, _delay) = scanner.close().unwrap();
        assert_eq!(transport.address(), 0x2A);
    }

    #[test]
    fn open_by_id() {
        let sim = SimulatedScanner::new(SimConfig::default());
        let transport = BusTransport::new(sim.clone(), 0x2A);
        let scanner = Scanner::open("ls600d", transport, NoopDelay::default())
            .unwrap()
            .with_options(SessionOptions::default().with_retries(5));
        assert_eq!(scanner.profile().id, "ls600d");
        let transport = BusTransport::new(sim, 0x2A);
        assert_eq!(
            Scanner::open("nope", transport, NoopDelay::default()).err(),
            Some(Error::UnknownDevice("nope".into()))
        );
    }

    #[test]
    fn record_for_another_sensor_is_rejected() {
        let (_sim, scanner) = sim_scanner(SimConfig::default());
        let record = crate::calibration::CalibrationRecord {
            black: vec![0; 8],
            red: vec![0; 8],
            green: vec![0; 8],
            blue: vec![0; 8],
            gains: [0; 3],
            offsets: [0; 3],
            shading_target: 240,
        };
        assert_eq!(
            scanner.load_calibration_record(&record.to_bytes()),
            Err(Error::Record(RecordError::PitchMismatch {
                expected: SIM_PROFILE.sensor_pitch,
                found: 8
            }))
        );
    }

    #[test]
    fn close_cancels_a_running_session() {
        let (sim, mut scanner) = sim_scanner(SimConfig::default());
        scanner
            .configure(ScanRequest::new(16, 4, 300, ColorMode::Gray))
            .unwrap();
        scanner.start().unwrap();
        let (_transport, _delay) = scanner.close().unwrap();
        assert_eq!(sim.head(), 0);
        assert!(!sim.scanning());
    }
}
