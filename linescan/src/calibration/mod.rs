// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! Analog front end and shading calibration.
//!
//! Calibration runs in a fixed order, each step building on the registers the previous one
//! settled on:
//!
//! 1. [`dark_calibrate`]: lamp off, offsets tuned toward a near-black level.
//! 2. [`gain_calibrate`]: lamp on over the white strip, gains tuned toward a bright level.
//! 3. [`offset_calibrate`]: lamp on over the grey strip, offsets refined toward a mid level.
//! 4. [`shading_calibrate`]: a per-column correction table from the white strip.
//!
//! Steps 1 through 3 scan the whole sensor at its native resolution with the motor held, and
//! measure channel means over a fixed run of columns just past the left frame.
use core::ops::Range;

use embedded_hal::blocking::delay::DelayMs;
use log::{debug, warn};

pub mod record;
pub mod search;
pub mod shading;

pub use record::CalibrationRecord;
pub use search::{bisect, ChannelSearch, Outcome, Response, Target, Tuned};
pub use shading::{ShadingTable, MAX_CODE, UNITY};

use crate::error::{CalibrationError, CalibrationStep, Error, GeometryError};
use crate::geometry::ScanPlan;
use crate::image::{Image, ImageView};
use crate::profile::{ColorMode, Purpose, Source};
use crate::protocol::Device;
use crate::register::{DeviceState, Register};
use crate::transport::Transport;
use crate::util::{mean, to_fixed_24_8};

/// Gain searches never take more passes than this, whatever the profile allows.
const GAIN_PASS_LIMIT: usize = 20;

/// Everything calibration produced for a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CalibrationSet {
    pub gains: [u8; 3],
    pub offsets: [u8; 3],
    pub shading: ShadingTable,
    pub references: ReferenceLevels,

    /// Non-fatal problems, currently only searches that didn't converge.
    pub warnings: Vec<CalibrationError>,
}

impl CalibrationSet {
    pub fn record(&self, shading_target: u8) -> CalibrationRecord {
        CalibrationRecord {
            black: self.references.black.clone(),
            red: self.references.red.clone(),
            green: self.references.green.clone(),
            blue: self.references.blue.clone(),
            gains: self.gains,
            offsets: self.offsets,
            shading_target,
        }
    }
}

/// Per-column reference levels across the whole sensor, in 24.8 fixed point.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferenceLevels {
    pub black: Vec<u32>,
    pub red: Vec<u32>,
    pub green: Vec<u32>,
    pub blue: Vec<u32>,
}

impl ReferenceLevels {
    /// Average a lamp-off strip and a white strip down to per-column levels.
    ///
    /// The black level is shared by all channels, so it's averaged across them as well.
    pub fn from_strips(dark: ImageView<'_, u8>, white: ImageView<'_, u8>) -> Self {
        let black = (0..dark.columns())
            .map(|column| {
                let level = mean(
                    (0..dark.channels()).filter_map(|channel| dark.column_mean(column, channel)),
                );
                to_fixed_24_8(level.unwrap_or(0.0))
            })
            .collect();
        let channel_levels = |channel: usize| -> Vec<u32> {
            if channel >= white.channels() {
                return vec![0; white.columns()];
            }
            (0..white.columns())
                .map(|column| to_fixed_24_8(white.column_mean(column, channel).unwrap_or(0.0)))
                .collect()
        };
        Self {
            black,
            red: channel_levels(0),
            green: channel_levels(1),
            blue: channel_levels(2),
        }
    }
}

/// Where and how to take a calibration strip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Strip {
    /// First native column.
    pub x_start: usize,

    /// Pixels per side.
    pub width: usize,

    pub x_divider: u16,
    pub source: Source,
    pub mode: ColorMode,
    pub lines: usize,
    pub lamp: bool,
    pub motor: bool,
}

impl Strip {
    /// The whole sensor at native resolution, in colour, with the motor held.
    pub fn full_pitch(pitch: usize, source: Source, lines: usize, lamp: bool) -> Self {
        Self {
            x_start: 0,
            width: pitch,
            x_divider: 1,
            source,
            mode: ColorMode::Color,
            lines,
            lamp,
            motor: false,
        }
    }

    pub fn columns(&self) -> usize {
        self.width * self.source.sides()
    }
}

/// The sensor calibration strips are taken with.
///
/// Strips only need one side, so duplex scans calibrate on the front sensor.
pub fn strip_source(source: Source) -> Source {
    match source {
        Source::AdfDuplex => Source::AdfFront,
        other => other,
    }
}

/// Scan a strip using the calibration template.
pub fn scan_strip<T, D>(device: &mut Device<T, D>, strip: &Strip) -> Result<Image<u8>, Error>
where
    T: Transport,
    D: DelayMs<u32>,
{
    let profile = device.profile();
    let ydpi = profile.calibration_ydpi;
    let template = profile
        .template(ydpi, Purpose::Calibration)
        .ok_or(GeometryError::Unsupported {
            mode: strip.mode,
            ydpi,
        })?;
    let y_step = profile.steps_per_line(ydpi);
    let channels = strip.mode.channels();
    let state = device.state_mut();
    state.set(Register::Mode, (channels == 3) as u8);
    state.set(Register::Source, strip.source.into());
    state.set(Register::XDivider, strip.x_divider as u8);
    state.set(Register::YStep, y_step as u8);
    state.set(Register::Oversample, 0);
    state.set_x_start(strip.x_start as u16);
    state.set_width(strip.width as u16);
    state.set_lines(strip.lines as u32);
    state.set_lamp(strip.lamp);
    state.set_motor(strip.motor);
    device.apply_template(template);
    device.flush()?;
    device.start_scan()?;
    let data = device.read_all(strip.lines * strip.columns() * channels)?;
    if strip.motor {
        device.state_mut().head += strip.lines as u32 * y_step;
    }
    Ok(Image::from_vec(data, strip.columns(), channels))
}

/// The columns channel means are taken over.
fn sample_columns(state: &DeviceState, count: usize) -> Range<usize> {
    let margin = state.margin().unwrap_or(0) as usize;
    margin..margin + count
}

fn move_relative_to_origin<T, D>(device: &mut Device<T, D>, steps: u32) -> Result<(), Error>
where
    T: Transport,
    D: DelayMs<u32>,
{
    let origin = device
        .state()
        .origin()
        .ok_or(CalibrationError::OriginNotFound)?;
    device.move_to(origin + steps)?;
    Ok(())
}

/// Which register triple a search drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Knob {
    Gains,
    Offsets,
}

impl Knob {
    fn apply(self, state: &mut DeviceState, values: [u8; 3]) {
        match self {
            Self::Gains => state.set_gains(values),
            Self::Offsets => state.set_offsets(values),
        }
    }
}

/// Run three channel searches in lockstep, one strip per pass.
///
/// When `nudge` is set a channel that has converged but is pushed back out of the target window
/// by the others is stepped by one instead of being searched again.
#[allow(clippy::too_many_arguments)]
fn tune_channels<T, D>(
    device: &mut Device<T, D>,
    step: CalibrationStep,
    knob: Knob,
    strip: &Strip,
    bounds: (u8, u8),
    response: Response,
    target: Target,
    max_passes: usize,
    nudge: bool,
) -> Result<Tuned<[u8; 3]>, Error>
where
    T: Transport,
    D: DelayMs<u32>,
{
    let calibration = device.profile().calibration;
    let columns = sample_columns(device.state(), calibration.sample_columns);
    let mut searches = [ChannelSearch::new(bounds, response, target); 3];
    let mut values = searches.map(|search| search.candidate());
    let mut within = [false; 3];
    let mut passes = 0;
    let last_strip = loop {
        knob.apply(device.state_mut(), values);
        let image = scan_strip(device, strip)?;
        passes += 1;
        let mut settled = true;
        for (channel, search) in searches.iter_mut().enumerate() {
            let level = image.view().mean(channel, columns.clone()).unwrap_or(0.0);
            within[channel] = target.contains(level);
            debug!(
                "{:?} pass {}: channel {} at {} measured {:.1}",
                step, passes, channel, values[channel], level
            );
            match search.outcome() {
                Outcome::Pending => {
                    search.observe(level);
                    if !search.is_done() {
                        settled = false;
                    }
                }
                Outcome::Converged if nudge && !within[channel] => {
                    search.nudge(level);
                    settled = false;
                }
                _ => (),
            }
            values[channel] = search.value();
        }
        if settled || passes >= max_passes {
            break image;
        }
    };
    knob.apply(device.state_mut(), values);
    let unconverged: Vec<usize> = (0..3)
        .filter(|channel| searches[*channel].outcome() != Outcome::Converged || !within[*channel])
        .collect();
    for channel in unconverged.iter() {
        warn!(
            "{}",
            CalibrationError::NotConverged {
                step,
                channel: *channel,
                value: values[*channel],
            }
        );
    }
    debug!("{:?} settled on {:?} after {} passes", step, values, passes);
    Ok(Tuned {
        value: values,
        passes,
        unconverged,
        strip: Some(last_strip),
    })
}

/// Turn a search's stragglers into warnings.
pub fn warnings(step: CalibrationStep, tuned: &Tuned<[u8; 3]>) -> Vec<CalibrationError> {
    tuned
        .unconverged
        .iter()
        .map(|channel| CalibrationError::NotConverged {
            step,
            channel: *channel,
            value: tuned.value[*channel],
        })
        .collect()
}

/// Tune the offsets with the lamp off, so the black level sits just above zero.
pub fn dark_calibrate<T, D>(
    device: &mut Device<T, D>,
    plan: &ScanPlan,
) -> Result<Tuned<[u8; 3]>, Error>
where
    T: Transport,
    D: DelayMs<u32>,
{
    let profile = device.profile();
    let calibration = profile.calibration;
    let strip = Strip::full_pitch(
        profile.sensor_pitch,
        strip_source(plan.source),
        calibration.strip_lines,
        false,
    );
    tune_channels(
        device,
        CalibrationStep::Dark,
        Knob::Offsets,
        &strip,
        calibration.offset_bounds,
        calibration.offset_response,
        calibration.dark,
        calibration.max_passes,
        false,
    )
}

/// Tune the gains over the white strip.
pub fn gain_calibrate<T, D>(
    device: &mut Device<T, D>,
    plan: &ScanPlan,
    offsets: [u8; 3],
) -> Result<Tuned<[u8; 3]>, Error>
where
    T: Transport,
    D: DelayMs<u32>,
{
    let profile = device.profile();
    let calibration = profile.calibration;
    device.state_mut().set_offsets(offsets);
    move_relative_to_origin(device, profile.layout.white_strip)?;
    let strip = Strip::full_pitch(
        profile.sensor_pitch,
        strip_source(plan.source),
        calibration.strip_lines,
        true,
    );
    tune_channels(
        device,
        CalibrationStep::Gain,
        Knob::Gains,
        &strip,
        calibration.gain_bounds,
        calibration.gain_response,
        calibration.bright,
        calibration.max_passes.min(GAIN_PASS_LIMIT),
        true,
    )
}

/// Refine the offsets over the grey strip, with the gains fixed.
pub fn offset_calibrate<T, D>(
    device: &mut Device<T, D>,
    plan: &ScanPlan,
    gains: [u8; 3],
) -> Result<Tuned<[u8; 3]>, Error>
where
    T: Transport,
    D: DelayMs<u32>,
{
    let profile = device.profile();
    let calibration = profile.calibration;
    device.state_mut().set_gains(gains);
    move_relative_to_origin(device, profile.layout.grey_strip)?;
    let strip = Strip::full_pitch(
        profile.sensor_pitch,
        strip_source(plan.source),
        calibration.strip_lines,
        true,
    );
    tune_channels(
        device,
        CalibrationStep::Offset,
        Knob::Offsets,
        &strip,
        calibration.offset_bounds,
        calibration.offset_response,
        calibration.grey,
        calibration.max_passes,
        false,
    )
}

/// Build the shading table from the white strip, scanned with the plan's horizontal geometry.
pub fn shading_calibrate<T, D>(
    device: &mut Device<T, D>,
    plan: &ScanPlan,
    gains: [u8; 3],
    offsets: [u8; 3],
) -> Result<ShadingTable, Error>
where
    T: Transport,
    D: DelayMs<u32>,
{
    let profile = device.profile();
    let calibration = profile.calibration;
    let state = device.state_mut();
    state.set_gains(gains);
    state.set_offsets(offsets);
    let margin = state.margin().unwrap_or(0) as usize;
    move_relative_to_origin(device, profile.layout.white_strip)?;
    let strip = Strip {
        x_start: margin + plan.x_native,
        width: plan.width,
        x_divider: plan.x_divider,
        source: plan.source,
        mode: plan.mode,
        lines: calibration.shading_lines,
        lamp: true,
        motor: false,
    };
    let image = scan_strip(device, &strip)?;
    let table = ShadingTable::from_reference(
        image.view(),
        calibration.shading_discard,
        calibration.shading_target,
        calibration.shading_floor,
        calibration.dark.level,
    )?;
    Ok(table)
}
