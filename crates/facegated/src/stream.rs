//! Pull-based frame streaming loop shared by both modes.

use crate::modes::StopSignal;
use facegate_hw::{CameraDevice, CameraError, Frame, SharedCamera};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::sync::MutexGuard;
use std::time::Duration;
use thiserror::Error;

/// Mode-specific work done on each frame before it is encoded.
pub trait FrameProcessor: Send {
    fn process(&mut self, frame: &mut RgbImage);
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("camera unavailable after {failures} consecutive read failures: {last}")]
    CameraUnavailable { failures: u32, last: String },
}

impl StreamError {
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::CameraUnavailable { .. } => "CAMERA_UNAVAILABLE",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub read_retry: Duration,
    pub max_read_failures: u32,
    pub jpeg_quality: u8,
}

/// Yields one JPEG per processed frame until the mode is stopped.
///
/// The stop signal is checked before each frame, never during one. A run of
/// `max_read_failures` failed reads yields a single error and ends the stream.
pub struct FrameStream<P> {
    camera: SharedCamera,
    processor: P,
    stop: StopSignal,
    settings: StreamSettings,
    finished: bool,
}

impl<P: FrameProcessor> FrameStream<P> {
    pub fn new(camera: SharedCamera, processor: P, stop: StopSignal, settings: StreamSettings) -> Self {
        Self {
            camera,
            processor,
            stop,
            settings,
            finished: false,
        }
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    fn camera(&self) -> MutexGuard<'_, Option<Box<dyn CameraDevice>>> {
        self.camera.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read one frame. `None` once the mode is stopped or the camera released.
    ///
    /// The stop check happens under the camera lock, so a read never reaches a
    /// device opened after this stream's mode ended.
    fn try_read(&self) -> Option<Result<Frame, CameraError>> {
        let mut camera = self.camera();
        if self.stop.is_stopped() {
            return None;
        }
        let Some(device) = camera.as_mut() else {
            tracing::debug!(mode = ?self.stop.mode(), "camera released under stream");
            return None;
        };
        Some(device.read_frame())
    }

    fn read(&mut self) -> Option<Result<RgbImage, StreamError>> {
        let mut failures = 0u32;
        loop {
            match self.try_read()? {
                Ok(frame) => return Some(Ok(frame.image)),
                Err(err) => {
                    failures += 1;
                    tracing::debug!(failures, error = %err, "frame read failed");
                    if failures >= self.settings.max_read_failures {
                        tracing::error!(failures, error = %err, mode = ?self.stop.mode(), "giving up on camera");
                        return Some(Err(StreamError::CameraUnavailable {
                            failures,
                            last: err.to_string(),
                        }));
                    }
                    std::thread::sleep(self.settings.read_retry);
                }
            }
        }
    }
}

impl<P: FrameProcessor> Iterator for FrameStream<P> {
    type Item = Result<Vec<u8>, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            let mut frame = match self.read() {
                None => {
                    self.finished = true;
                    tracing::info!(mode = ?self.stop.mode(), "stream stopped");
                    return None;
                }
                Some(Err(err)) => {
                    self.finished = true;
                    return Some(Err(err));
                }
                Some(Ok(frame)) => frame,
            };

            self.processor.process(&mut frame);

            let mut jpeg = Vec::new();
            let encoded = JpegEncoder::new_with_quality(&mut jpeg, self.settings.jpeg_quality)
                .encode_image(&frame);
            match encoded {
                Ok(()) => return Some(Ok(jpeg)),
                Err(err) => tracing::warn!(error = %err, "frame encode failed; skipping"),
            }
        }
    }
}

/// One part of a `multipart/x-mixed-replace; boundary=frame` body.
pub fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let mut part = Vec::with_capacity(jpeg.len() + 64);
    part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modes::{Mode, ModeController};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Replays scripted read failures, then serves blank frames.
    struct ScriptedCamera {
        script: VecDeque<Result<(), String>>,
        reads: Arc<Mutex<u32>>,
    }

    impl ScriptedCamera {
        fn blank() -> Self {
            Self {
                script: VecDeque::new(),
                reads: Arc::new(Mutex::new(0)),
            }
        }
    }

    impl CameraDevice for ScriptedCamera {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            *self.reads.lock().unwrap() += 1;
            if let Some(Err(msg)) = self.script.pop_front() {
                return Err(CameraError::CaptureFailed(msg));
            }
            Ok(Frame {
                image: RgbImage::new(64, 48),
                timestamp: std::time::Instant::now(),
                sequence: 0,
            })
        }
    }

    struct Counting(u32);

    impl FrameProcessor for Counting {
        fn process(&mut self, _frame: &mut RgbImage) {
            self.0 += 1;
        }
    }

    fn settings(max_read_failures: u32) -> StreamSettings {
        StreamSettings {
            read_retry: Duration::ZERO,
            max_read_failures,
            jpeg_quality: 80,
        }
    }

    fn shared(camera: ScriptedCamera) -> SharedCamera {
        Arc::new(Mutex::new(Some(Box::new(camera) as Box<dyn CameraDevice>)))
    }

    #[test]
    fn test_stream_yields_jpeg_until_stopped() {
        let modes = ModeController::new();
        modes.begin(Mode::Enrolling).unwrap();
        let stop = modes.attach(Mode::Enrolling).unwrap();
        let mut stream = FrameStream::new(shared(ScriptedCamera::blank()), Counting(0), stop, settings(3));

        let first = stream.next().unwrap().unwrap();
        assert_eq!(&first[..2], &[0xFF, 0xD8]);
        stream.next().unwrap().unwrap();
        assert_eq!(stream.processor.0, 2);

        modes.end(Mode::Enrolling);
        assert!(stream.next().is_none());
        assert!(stream.next().is_none());
        assert_eq!(stream.processor.0, 2);
    }

    #[test]
    fn test_transient_read_failures_are_retried() {
        let modes = ModeController::new();
        modes.begin(Mode::Identifying).unwrap();
        let stop = modes.attach(Mode::Identifying).unwrap();
        let camera = ScriptedCamera {
            script: VecDeque::from(vec![Err("EAGAIN".into()), Err("EAGAIN".into())]),
            reads: Arc::new(Mutex::new(0)),
        };
        let reads = Arc::clone(&camera.reads);
        let mut stream = FrameStream::new(shared(camera), Counting(0), stop, settings(3));

        assert!(stream.next().unwrap().is_ok());
        assert_eq!(*reads.lock().unwrap(), 3);
    }

    #[test]
    fn test_persistent_failure_ends_stream() {
        let modes = ModeController::new();
        modes.begin(Mode::Identifying).unwrap();
        let stop = modes.attach(Mode::Identifying).unwrap();
        let camera = ScriptedCamera {
            script: (0..10).map(|_| Err("unplugged".to_string())).collect(),
            reads: Arc::new(Mutex::new(0)),
        };
        let mut stream = FrameStream::new(shared(camera), Counting(0), stop, settings(3));

        let err = stream.next().unwrap().unwrap_err();
        assert_eq!(err.code(), "CAMERA_UNAVAILABLE");
        assert!(stream.next().is_none());
        assert_eq!(stream.processor.0, 0);
    }

    #[test]
    fn test_released_camera_ends_stream() {
        let modes = ModeController::new();
        modes.begin(Mode::Enrolling).unwrap();
        let stop = modes.attach(Mode::Enrolling).unwrap();
        let camera = shared(ScriptedCamera::blank());
        let mut stream = FrameStream::new(Arc::clone(&camera), Counting(0), stop, settings(3));

        stream.next().unwrap().unwrap();
        camera.lock().unwrap().take();
        assert!(stream.next().is_none());
        assert_eq!(stream.processor.0, 1);
    }

    #[test]
    fn test_multipart_part_framing() {
        let part = multipart_part(b"JPEG");
        assert_eq!(part, b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEG\r\n".to_vec());
    }
}
