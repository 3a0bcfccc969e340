// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! Shared fixtures for tests run against the simulated scanner.
use linescan_test_data::{NoopDelay, SimConfig, SimulatedScanner};

use crate::options::SessionOptions;
use crate::profile::{BedLayout, CalibrationProfile, DeviceProfile, Source, LS600};
use crate::protocol::Device;
use crate::transport::BusTransport;

pub(crate) type SimDevice = Device<BusTransport<SimulatedScanner>, NoopDelay>;

/// A small sensor matching the default simulator bed.
pub(crate) static SIM_PROFILE: DeviceProfile = DeviceProfile {
    id: "sim",
    name: "Simulated scanner",
    sensor_pitch: 96,
    sources: &[
        Source::Flatbed,
        Source::AdfFront,
        Source::AdfBack,
        Source::AdfDuplex,
    ],
    calibration: CalibrationProfile {
        sample_columns: 32,
        shading_lines: 8,
        ..LS600.calibration
    },
    layout: BedLayout {
        origin_search_lines: 48,
        white_strip: 20,
        grey_strip: 72,
        document_start: 104,
        margin_allowance: 12,
    },
    ..LS600
};

/// Where origin seek lands on the default simulator bed.
///
/// The green channel trails the head by 8 steps, and the edge sits 40 steps from home.
pub(crate) const SIM_ORIGIN: u32 = 46;

pub(crate) const SIM_MARGIN: u16 = 6;

pub(crate) fn sim_device(config: SimConfig) -> (SimulatedScanner, SimDevice) {
    let address = config.address;
    let sim = SimulatedScanner::new(config);
    let transport = BusTransport::new(sim.clone(), address);
    let device = Device::new(
        transport,
        NoopDelay::default(),
        &SIM_PROFILE,
        SessionOptions::default(),
    );
    (sim, device)
}

/// A simulated device with the origin and margin already found.
pub(crate) fn positioned_device(config: SimConfig) -> (SimulatedScanner, SimDevice) {
    let (sim, mut device) = sim_device(config);
    let state = device.state_mut();
    state.origin = Some(SIM_ORIGIN);
    state.margin = Some(SIM_MARGIN);
    (sim, device)
}
