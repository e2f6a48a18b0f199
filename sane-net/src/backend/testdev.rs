//! Driver-independent synthetic backend.
//!
//! Produces deterministic gradient frames without any hardware, so the
//! daemon can run and the protocol stack can be exercised end to end.

use tracing::debug;

use crate::backend::{Backend, Device};
use crate::proto::options::{Constraint, Range};
use crate::proto::{
    Action, Cap, DeviceInfo, Frame, Info, OptionDescriptor, OptionValue, Parameters, Status, Unit,
    ValueType, version_code,
};

const DEVICE_NAME: &str = "test:0";

const MODES: [&str; 2] = ["Gray", "Color"];
const DEPTHS: [i32; 3] = [1, 8, 16];
const RESOLUTION_RANGE: Range = Range { min: 50, max: 600, quant: 10 };

/// Backend producing a single synthetic device.
#[derive(Debug, Default)]
pub struct TestBackend;

impl TestBackend {
    pub fn new() -> Self {
        TestBackend
    }
}

impl Backend for TestBackend {
    type Device = TestDevice;

    fn version(&self) -> i32 {
        version_code(crate::proto::VERSION_MAJOR, crate::proto::VERSION_MINOR, 1)
    }

    async fn devices(&mut self, _local_only: bool) -> Result<Vec<DeviceInfo>, Status> {
        Ok(vec![DeviceInfo {
            name: DEVICE_NAME.to_owned(),
            vendor: "Noname".to_owned(),
            model: "Synthetic frame generator".to_owned(),
            kind: "virtual device".to_owned(),
        }])
    }

    async fn open(&mut self, name: &str) -> Result<TestDevice, Status> {
        if !name.is_empty() && name != DEVICE_NAME {
            return Err(Status::Inval);
        }
        debug!(device = DEVICE_NAME, "opening synthetic device");
        Ok(TestDevice::default())
    }
}

/// One opened synthetic device.
#[derive(Debug)]
pub struct TestDevice {
    mode: String,
    resolution: i32,
    depth: i32,
    scanning: bool,
    cancelled: bool,
    position: usize,
    frame_bytes: usize,
}

impl Default for TestDevice {
    fn default() -> Self {
        TestDevice {
            mode: MODES[0].to_owned(),
            resolution: 100,
            depth: 8,
            scanning: false,
            cancelled: false,
            position: 0,
            frame_bytes: 0,
        }
    }
}

impl TestDevice {
    fn current_parameters(&self) -> Parameters {
        let pixels_per_line = self.resolution;
        let lines = self.resolution / 2;
        let samples_per_line = if self.mode == "Color" {
            pixels_per_line * 3
        } else {
            pixels_per_line
        };
        let bytes_per_line = match self.depth {
            1 => (samples_per_line + 7) / 8,
            16 => samples_per_line * 2,
            _ => samples_per_line,
        };
        Parameters {
            format: if self.mode == "Color" { Frame::Rgb } else { Frame::Gray },
            last_frame: true,
            bytes_per_line,
            pixels_per_line,
            lines,
            depth: self.depth,
        }
    }
}

impl Device for TestDevice {
    async fn descriptors(&mut self) -> Result<Vec<OptionDescriptor>, Status> {
        Ok(vec![
            OptionDescriptor {
                name: None,
                title: Some("Number of options".to_owned()),
                description: Some("Read-only option that specifies how many options a specific device supports.".to_owned()),
                ty: ValueType::Int,
                unit: Unit::None,
                size: 4,
                cap: Cap::SOFT_DETECT,
                constraint: Constraint::None,
            },
            OptionDescriptor {
                name: Some("mode".to_owned()),
                title: Some("Scan mode".to_owned()),
                description: Some("Selects the scan mode".to_owned()),
                ty: ValueType::String,
                unit: Unit::None,
                size: 32,
                cap: Cap::SOFT_SELECT | Cap::SOFT_DETECT,
                constraint: Constraint::StringList(MODES.iter().map(|s| s.to_string()).collect()),
            },
            OptionDescriptor {
                name: Some("resolution".to_owned()),
                title: Some("Scan resolution".to_owned()),
                description: Some("Sets the resolution of the scanned image".to_owned()),
                ty: ValueType::Int,
                unit: Unit::Dpi,
                size: 4,
                cap: Cap::SOFT_SELECT | Cap::SOFT_DETECT,
                constraint: Constraint::Range(RESOLUTION_RANGE),
            },
            OptionDescriptor {
                name: Some("depth".to_owned()),
                title: Some("Bit depth".to_owned()),
                description: Some("Number of bits per sample".to_owned()),
                ty: ValueType::Int,
                unit: Unit::Bit,
                size: 4,
                cap: Cap::SOFT_SELECT | Cap::SOFT_DETECT,
                constraint: Constraint::WordList(DEPTHS.to_vec()),
            },
        ])
    }

    async fn control(
        &mut self,
        option: usize,
        action: Action,
        value: OptionValue,
    ) -> Result<(Info, OptionValue), Status> {
        if action != Action::Get && self.scanning {
            return Err(Status::DeviceBusy);
        }
        match (option, action) {
            (0, Action::Get) => Ok((Info::empty(), OptionValue::Words(vec![4]))),
            (1, Action::Get) => Ok((Info::empty(), OptionValue::Text(Some(self.mode.clone())))),
            (1, Action::Set) => {
                let OptionValue::Text(Some(mode)) = value else {
                    return Err(Status::Inval);
                };
                if !MODES.contains(&mode.as_str()) {
                    return Err(Status::Inval);
                }
                self.mode = mode;
                Ok((
                    Info::RELOAD_PARAMS,
                    OptionValue::Text(Some(self.mode.clone())),
                ))
            }
            (2, Action::Get) => Ok((Info::empty(), OptionValue::Words(vec![self.resolution]))),
            (2, Action::Set) => {
                let OptionValue::Words(words) = value else {
                    return Err(Status::Inval);
                };
                let requested = *words.first().ok_or(Status::Inval)?;
                let clamped = requested.clamp(RESOLUTION_RANGE.min, RESOLUTION_RANGE.max);
                let quantized =
                    (clamped - RESOLUTION_RANGE.min + RESOLUTION_RANGE.quant / 2)
                        / RESOLUTION_RANGE.quant
                        * RESOLUTION_RANGE.quant
                        + RESOLUTION_RANGE.min;
                self.resolution = quantized;
                let mut info = Info::RELOAD_PARAMS;
                if quantized != requested {
                    info |= Info::INEXACT;
                }
                Ok((info, OptionValue::Words(vec![self.resolution])))
            }
            (2, Action::SetAuto) => {
                self.resolution = 100;
                Ok((Info::RELOAD_PARAMS, OptionValue::Words(vec![self.resolution])))
            }
            (3, Action::Get) => Ok((Info::empty(), OptionValue::Words(vec![self.depth]))),
            (3, Action::Set) => {
                let OptionValue::Words(words) = value else {
                    return Err(Status::Inval);
                };
                let depth = *words.first().ok_or(Status::Inval)?;
                if !DEPTHS.contains(&depth) {
                    return Err(Status::Inval);
                }
                self.depth = depth;
                Ok((Info::RELOAD_PARAMS, OptionValue::Words(vec![self.depth])))
            }
            _ => Err(Status::Inval),
        }
    }

    async fn parameters(&mut self) -> Result<Parameters, Status> {
        Ok(self.current_parameters())
    }

    async fn start(&mut self) -> Result<(), Status> {
        if self.scanning {
            return Err(Status::DeviceBusy);
        }
        let params = self.current_parameters();
        self.frame_bytes = params.bytes_per_line as usize * params.lines as usize;
        self.position = 0;
        self.scanning = true;
        self.cancelled = false;
        debug!(bytes = self.frame_bytes, "synthetic scan started");
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status> {
        if !self.scanning {
            return Err(Status::Cancelled);
        }
        if self.cancelled {
            self.scanning = false;
            return Err(Status::Cancelled);
        }
        if self.position >= self.frame_bytes {
            self.scanning = false;
            return Err(Status::Eof);
        }
        // Let concurrent control traffic through; the generator itself
        // never blocks.
        tokio::task::yield_now().await;
        let n = buf.len().min(self.frame_bytes - self.position).min(512);
        for (i, slot) in buf[..n].iter_mut().enumerate() {
            *slot = ((self.position + i) & 0xff) as u8;
        }
        self.position += n;
        Ok(n)
    }

    async fn cancel(&mut self) {
        if self.scanning {
            self.cancelled = true;
        }
    }
}
