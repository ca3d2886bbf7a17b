//! Capture device abstraction
//!
//! A capture device runs a blocking read loop and hands every raw frame to a
//! [`SampleHandler`] synchronously, on the capture thread. The loop checks the
//! shared run flag once per iteration and returns when it is cleared.

use std::sync::atomic::AtomicBool;

use crate::config::{CaptureBackendKind, CaptureConfig};
use crate::error::{AppError, Result};

use super::format::{FrameRate, PixelFormat, Resolution};
use super::frame::{CapturedSample, FrameGeometry};
use super::{device, test_pattern};

/// Receives raw frames from a capture device's read loop
pub trait SampleHandler {
    fn on_sample(&mut self, sample: CapturedSample<'_>);
}

/// An activated capture device
pub trait CaptureDevice: Send {
    fn name(&self) -> &str;

    /// Allocate buffers and negotiate the final format. Geometry queries are
    /// only meaningful after this returns.
    fn prepare_streaming(&mut self) -> Result<()>;

    fn frame_size(&self) -> Resolution;

    fn frame_rate(&self) -> FrameRate;

    fn video_format(&self) -> PixelFormat;

    /// Bytes per row of the first plane
    fn stride(&self) -> usize;

    /// Read frames until `run` is cleared. Per-frame read failures are logged
    /// and skipped; only a failure to start streaming is returned.
    fn stream(&mut self, run: &AtomicBool, handler: &mut dyn SampleHandler) -> Result<()>;

    fn geometry(&self) -> FrameGeometry {
        FrameGeometry {
            resolution: self.frame_size(),
            format: self.video_format(),
            stride: self.stride(),
        }
    }
}

/// Device enumeration and activation
pub trait CaptureBackend {
    fn enumerate_devices(&self) -> Result<Vec<String>>;

    fn instantiate_device(&self, name: &str) -> Result<Box<dyn CaptureDevice>>;
}

/// Backend selected by configuration
pub fn backend_for(config: &CaptureConfig) -> Box<dyn CaptureBackend> {
    match config.backend {
        CaptureBackendKind::V4l2 => Box::new(device::V4l2Backend::new(config.clone())),
        CaptureBackendKind::TestPattern => {
            Box::new(test_pattern::TestPatternBackend::new(config.clone()))
        }
    }
}

/// Enumerate devices and activate the configured one, or the first found.
///
/// Both "nothing found" and "activation failed" are fatal at startup.
pub fn open_device(
    backend: &dyn CaptureBackend,
    requested: Option<&str>,
) -> Result<Box<dyn CaptureDevice>> {
    let devices = backend.enumerate_devices()?;
    for (index, name) in devices.iter().enumerate() {
        tracing::info!("Capture device {}: {}", index, name);
    }

    let name = match requested {
        Some(name) => {
            if !devices.iter().any(|d| d == name) {
                tracing::warn!("Device {:?} not in enumeration, trying it anyway", name);
            }
            name.to_string()
        }
        None => devices.first().cloned().ok_or(AppError::NoCaptureDevice)?,
    };

    tracing::info!("Activating capture device {}", name);
    let mut device = backend.instantiate_device(&name)?;
    device.prepare_streaming()?;

    let resolution = device.frame_size();
    let rate = device.frame_rate();
    if !resolution.is_valid() {
        return Err(AppError::Capture(format!(
            "device {} reports unusable frame size {}",
            name, resolution
        )));
    }
    if !rate.is_valid() {
        return Err(AppError::Capture(format!(
            "device {} reports invalid frame rate {}/{}",
            name, rate.numerator, rate.denominator
        )));
    }

    tracing::info!(
        "Capture ready: {} {} @ {} stride={}",
        resolution,
        device.video_format(),
        rate,
        device.stride()
    );
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureConfig;

    #[test]
    fn test_open_first_test_pattern_device() {
        let config = CaptureConfig {
            backend: CaptureBackendKind::TestPattern,
            ..Default::default()
        };
        let backend = backend_for(&config);
        let device = open_device(backend.as_ref(), None).unwrap();
        assert_eq!(device.frame_size(), Resolution::new(config.width, config.height));
        assert_eq!(device.geometry().format, config.format);
    }

    #[test]
    fn test_unknown_device_fails_activation() {
        let config = CaptureConfig {
            backend: CaptureBackendKind::TestPattern,
            ..Default::default()
        };
        let backend = backend_for(&config);
        assert!(open_device(backend.as_ref(), Some("no-such-device")).is_err());
    }

    #[test]
    fn test_invalid_geometry_is_fatal() {
        let config = CaptureConfig {
            backend: CaptureBackendKind::TestPattern,
            width: 641,
            ..Default::default()
        };
        let backend = backend_for(&config);
        assert!(matches!(
            open_device(backend.as_ref(), None),
            Err(AppError::Capture(_))
        ));
    }
}
