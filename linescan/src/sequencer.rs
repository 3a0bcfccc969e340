// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! The scan session state machine.
//!
//! A session walks through positioning, calibration and geometry setup in a fixed order, then
//! streams data until every row has been delivered:
//!
//! ```text
//! Idle → OriginSeek → MarginSeek → DarkCal → GainCal → OffsetCal → ShadingCal
//!      → GeometryCommit → Scanning → Draining → Done
//! ```
//!
//! Any non-terminal state can be cancelled, and any state can fail. Both abort the scan and park
//! the head on a best-effort basis.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use embedded_hal::blocking::delay::DelayMs;
use log::{debug, info, trace, warn};

use crate::calibration::{
    dark_calibrate, gain_calibrate, offset_calibrate, scan_strip, shading_calibrate, strip_source,
    warnings, CalibrationSet, ReferenceLevels, Strip,
};
use crate::decode::{Decoder, OutputChannels, Side};
use crate::error::{CalibrationError, CalibrationStep, Error, GeometryError};
use crate::geometry::ScanPlan;
use crate::image::Image;
use crate::locate::{find_edge, find_margin};
use crate::profile::ColorMode;
use crate::protocol::{DataReply, Device};
use crate::register::Register;
use crate::transport::Transport;

/// Where a session is in its lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    OriginSeek,
    MarginSeek,
    DarkCal,
    GainCal,
    OffsetCal,
    ShadingCal,
    GeometryCommit,
    Scanning,

    /// Every raw byte has arrived, rows are still being delivered.
    Draining,

    Done,
    Cancelled,
    Failed(Error),
}

impl State {
    /// Whether the session is over, one way or another.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed(_))
    }
}

/// A shareable flag for cancelling a session from elsewhere.
///
/// The flag is checked between states and before each pull, not in the middle of an exchange.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Bytes delivered by one read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Chunk {
    pub bytes: Vec<u8>,

    /// Set on the last chunk of each side.
    pub is_final: bool,
}

/// Drives one scan session.
#[derive(Debug)]
pub struct Sequencer<T, D> {
    device: Device<T, D>,
    plan: ScanPlan,
    state: State,
    cancel: CancelHandle,

    dark_strip: Option<Image<u8>>,
    white_strip: Option<Image<u8>>,
    warnings: Vec<CalibrationError>,
    calibration: Option<CalibrationSet>,

    decoder: Decoder,
    output: OutputChannels,

    /// The side reads are delivering.
    current: Side,
}

impl<T, D> Sequencer<T, D>
where
    T: Transport,
    D: DelayMs<u32>,
{
    pub fn new(device: Device<T, D>, plan: ScanPlan, cancel: CancelHandle) -> Self {
        let decoder = Decoder::new(
            &plan,
            device.profile().duplex_group,
            device.options().block_size,
        );
        Self {
            device,
            plan,
            state: State::Idle,
            cancel,
            dark_strip: None,
            white_strip: None,
            warnings: Vec::new(),
            calibration: None,
            decoder,
            output: OutputChannels::default(),
            current: Side::Front,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn plan(&self) -> &ScanPlan {
        &self.plan
    }

    pub fn device(&self) -> &Device<T, D> {
        &self.device
    }

    pub fn calibration(&self) -> Option<&CalibrationSet> {
        self.calibration.as_ref()
    }

    /// End the session, giving back the device link and whatever calibration was completed.
    pub fn into_parts(self) -> (Device<T, D>, Option<CalibrationSet>) {
        (self.device, self.calibration)
    }

    fn transition(&mut self, next: State) {
        info!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Abort and park, logging instead of returning failures.
    fn stop_device(&mut self) {
        if let Err(err) = self.device.abort() {
            warn!("failed to abort scan: {}", err);
        }
        if let Err(err) = self.device.park() {
            warn!("failed to park head: {}", err);
        }
    }

    fn fail(&mut self, err: Error) {
        self.stop_device();
        self.output = OutputChannels::default();
        self.transition(State::Failed(err));
    }

    /// Cancel the session. Terminal sessions are left as they are.
    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.stop_device();
        self.output = OutputChannels::default();
        self.transition(State::Cancelled);
    }

    /// Run every state up to `Scanning`.
    pub fn prepare(&mut self) -> Result<(), Error> {
        while self.state != State::Scanning {
            if self.state.is_terminal() {
                return Err(self.terminal_error());
            }
            if self.cancel.is_cancelled() {
                self.cancel();
                return Err(Error::Cancelled);
            }
            match self.step() {
                Ok(next) => self.transition(next),
                Err(err) => {
                    self.fail(err.clone());
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn terminal_error(&self) -> Error {
        match &self.state {
            State::Failed(err) => err.clone(),
            State::Cancelled => Error::Cancelled,
            _ => Error::NotConfigured,
        }
    }

    /// Do the work of the current state, returning the next one.
    fn step(&mut self) -> Result<State, Error> {
        match self.state.clone() {
            State::Idle => {
                self.reset_front_end();
                Ok(State::OriginSeek)
            }
            State::OriginSeek => {
                self.seek_origin()?;
                Ok(State::MarginSeek)
            }
            State::MarginSeek => {
                self.seek_margin()?;
                Ok(State::DarkCal)
            }
            State::DarkCal => {
                let tuned = dark_calibrate(&mut self.device, &self.plan)?;
                self.warnings.extend(warnings(CalibrationStep::Dark, &tuned));
                self.dark_strip = tuned.strip;
                Ok(State::GainCal)
            }
            State::GainCal => {
                let offsets = self.device.state().offsets();
                let tuned = gain_calibrate(&mut self.device, &self.plan, offsets)?;
                self.warnings.extend(warnings(CalibrationStep::Gain, &tuned));
                self.white_strip = tuned.strip;
                Ok(State::OffsetCal)
            }
            State::OffsetCal => {
                let gains = self.device.state().gains();
                let tuned = offset_calibrate(&mut self.device, &self.plan, gains)?;
                self.warnings
                    .extend(warnings(CalibrationStep::Offset, &tuned));
                Ok(State::ShadingCal)
            }
            State::ShadingCal => {
                let gains = self.device.state().gains();
                let offsets = self.device.state().offsets();
                let shading = shading_calibrate(&mut self.device, &self.plan, gains, offsets)?;
                let references = match (&self.dark_strip, &self.white_strip) {
                    (Some(dark), Some(white)) => ReferenceLevels::from_strips(dark.view(), white.view()),
                    _ => ReferenceLevels::default(),
                };
                self.calibration = Some(CalibrationSet {
                    gains,
                    offsets,
                    shading,
                    references,
                    warnings: self.warnings.clone(),
                });
                Ok(State::GeometryCommit)
            }
            State::GeometryCommit => {
                self.commit()?;
                Ok(State::Scanning)
            }
            other => Ok(other),
        }
    }

    fn reset_front_end(&mut self) {
        let calibration = self.device.profile().calibration;
        let state = self.device.state_mut();
        state.set_gains([calibration.default_gain; 3]);
        state.set_offsets([calibration.default_offset; 3]);
    }

    /// Find the dark-to-white edge at the top of the calibration area, and stop the head there.
    fn seek_origin(&mut self) -> Result<(), Error> {
        let profile = self.device.profile();
        let strip = Strip {
            x_start: 0,
            width: profile.sensor_pitch,
            x_divider: 1,
            source: strip_source(self.plan.source),
            mode: ColorMode::Gray,
            lines: profile.layout.origin_search_lines,
            lamp: true,
            motor: true,
        };
        let y_step = profile.steps_per_line(profile.calibration_ydpi);
        for attempt in 0..2 {
            self.device.park()?;
            let image = scan_strip(&mut self.device, &strip)?;
            let view = image.view();
            let levels: Vec<f32> = (0..view.rows())
                .map(|row| view.row_mean(row).unwrap_or(0.0))
                .collect();
            match find_edge(&levels) {
                Some(edge) if edge.magnitude >= profile.calibration.edge_min => {
                    let origin = edge.line as u32 * y_step;
                    self.device.state_mut().origin = Some(origin);
                    self.device.move_to(origin)?;
                    debug!("origin edge at step {}, magnitude {:.1}", origin, edge.magnitude);
                    return Ok(());
                }
                edge => {
                    let variant = self.device.state().variant();
                    if attempt == 0 {
                        warn!(
                            "weak origin edge ({:?}) with the {:?} sensor, trying the other",
                            edge, variant
                        );
                        self.device.state_mut().set_variant(variant.other());
                    }
                }
            }
        }
        Err(CalibrationError::OriginNotFound.into())
    }

    /// Find where the frame ends on the left of the white strip.
    fn seek_margin(&mut self) -> Result<(), Error> {
        let profile = self.device.profile();
        let origin = self
            .device
            .state()
            .origin()
            .ok_or(CalibrationError::OriginNotFound)?;
        self.device.move_to(origin + profile.layout.white_strip)?;
        let strip = Strip {
            x_start: 0,
            width: profile.sensor_pitch,
            x_divider: 1,
            source: strip_source(self.plan.source),
            mode: ColorMode::Gray,
            lines: 1,
            lamp: true,
            motor: false,
        };
        let image = scan_strip(&mut self.device, &strip)?;
        let margin = if image.rows() > 0 {
            find_margin(image.view().plane(0, 0), profile.calibration.margin_threshold)
        } else {
            None
        };
        match margin {
            Some(margin) if margin <= profile.layout.margin_allowance as usize => {
                debug!("left margin at column {}", margin);
                self.device.state_mut().margin = Some(margin as u16);
                Ok(())
            }
            _ => Err(CalibrationError::MarginNotFound.into()),
        }
    }

    /// Move to the document, program the scan, and start it.
    ///
    /// The shading table is uploaded but the device must not apply it: rows are shaded on the
    /// host as they are decoded.
    fn commit(&mut self) -> Result<(), Error> {
        let profile = self.device.profile();
        let plan = self.plan;
        let template = profile
            .template(plan.ydpi, plan.mode.purpose())
            .ok_or(GeometryError::Unsupported {
                mode: plan.mode,
                ydpi: plan.ydpi,
            })?;
        let calibration = self.calibration.as_ref().ok_or(Error::NotConfigured)?;
        let shading = calibration.shading.to_bytes();
        let (gains, offsets) = (calibration.gains, calibration.offsets);
        let origin = self
            .device
            .state()
            .origin()
            .ok_or(CalibrationError::OriginNotFound)?;
        self.device
            .move_to(origin + profile.layout.document_start + plan.y_steps)?;

        let state = self.device.state_mut();
        let margin = state.margin().unwrap_or(0) as usize;
        state.set(Register::Mode, (plan.channels == 3) as u8);
        state.set(Register::Source, plan.source.into());
        state.set(Register::XDivider, plan.x_divider as u8);
        state.set(Register::YStep, plan.y_step as u8);
        state.set(Register::Oversample, plan.oversample as u8);
        state.set_x_start((margin + plan.x_native) as u16);
        state.set_width(plan.width as u16);
        state.set_lines(plan.hardware_lines as u32);
        state.set_gains(gains);
        state.set_offsets(offsets);
        state.set_lamp(true);
        state.set_motor(true);
        self.device.apply_template(template);
        self.device.flush()?;
        self.device.upload_shading(&shading)?;
        self.device.start_scan()?;
        self.device.state_mut().head += plan.hardware_lines as u32 * plan.y_step;
        info!(
            "scanning {} lines of {} bytes, {} raw bytes",
            plan.lines, plan.bytes_per_line, plan.total_bytes
        );
        Ok(())
    }

    /// Do at most one data exchange, decoding whatever arrives.
    fn exchange(&mut self) -> Result<(), Error> {
        let wanted = self.decoder.buffer().next_request();
        match self.device.request_data(wanted)? {
            DataReply::NotReady => trace!("device not ready"),
            DataReply::Data(bytes) => {
                let shading = match &self.calibration {
                    Some(calibration) => &calibration.shading,
                    None => return Err(Error::NotConfigured),
                };
                self.decoder
                    .decode_block(&bytes, shading, &mut self.output)?;
            }
        }
        if self.decoder.buffer().is_complete() {
            self.decoder.finish()?;
            self.transition(State::Draining);
        }
        Ok(())
    }

    /// Deliver up to `max_len` bytes of the current side.
    pub fn pull(&mut self, max_len: usize) -> Result<Chunk, Error> {
        match self.state {
            State::Scanning | State::Draining => (),
            State::Done => {
                return Ok(Chunk {
                    bytes: Vec::new(),
                    is_final: false,
                })
            }
            _ => return Err(self.terminal_error()),
        }
        if self.cancel.is_cancelled() {
            self.cancel();
            return Err(Error::Cancelled);
        }
        if self.state == State::Scanning && self.output.available(self.current) < max_len {
            if let Err(err) = self.exchange() {
                self.fail(err.clone());
                return Err(err);
            }
        }
        let bytes = self.output.take(self.current, max_len);
        let is_final = self.state == State::Draining && self.output.available(self.current) == 0;
        if is_final {
            if self.current == Side::Front && self.plan.sides == 2 {
                self.current = Side::Back;
            } else {
                self.transition(State::Done);
                if let Err(err) = self.device.park() {
                    warn!("failed to park head: {}", err);
                }
            }
        }
        Ok(Chunk { bytes, is_final })
    }
}
