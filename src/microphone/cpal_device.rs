use std::{
    fmt,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use async_trait::async_trait;
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, SampleFormat, SizedSample, Stream, StreamConfig, StreamError,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::{
    encode_recording, float_to_pcm16, CaptureError, CaptureFormat, EncodedAudio, Microphone,
    RecordingSession,
};

const WORKER_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const WORKER_ACK_TIMEOUT: Duration = Duration::from_secs(2);
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(50);

type SampleBuffer = Arc<Mutex<Vec<i16>>>;

enum WorkerCommand {
    Start(Sender<Result<(), CaptureError>>),
    Stop(oneshot::Sender<Result<(), CaptureError>>),
    Abort,
}

#[derive(Debug)]
struct DeviceRuntime {
    sample_rate_hz: u32,
    device_name: String,
}

/// Microphone backed by the default cpal host.
#[derive(Debug, Default, Clone)]
pub struct CpalMicrophone {
    preferred_device_name: Option<String>,
}

impl CpalMicrophone {
    pub fn new(preferred_device_name: Option<String>) -> Self {
        Self {
            preferred_device_name,
        }
    }
}

impl Microphone for CpalMicrophone {
    fn open(&self, format: CaptureFormat) -> Result<Box<dyn RecordingSession>, CaptureError> {
        info!(
            preferred_device = ?self.preferred_device_name,
            sample_rate_hz = format.sample_rate_hz,
            "opening microphone"
        );
        let samples: SampleBuffer = Arc::new(Mutex::new(Vec::new()));
        let worker_samples = Arc::clone(&samples);
        let preferred_device_name = self.preferred_device_name.clone();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<DeviceRuntime, CaptureError>>();
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();

        // cpal streams are not `Send`, so the stream lives on its own thread.
        thread::Builder::new()
            .name("microphone-capture".to_string())
            .spawn(move || {
                worker_main(preferred_device_name, worker_samples, ready_tx, command_rx);
            })
            .map_err(|err| {
                CaptureError::DeviceUnavailable(format!("unable to spawn capture worker: {err}"))
            })?;

        let runtime = match ready_rx.recv_timeout(WORKER_STARTUP_TIMEOUT) {
            Ok(Ok(runtime)) => runtime,
            Ok(Err(err)) => {
                error!(error = %err, "microphone worker failed to initialize");
                return Err(err);
            }
            Err(RecvTimeoutError::Timeout) => {
                let _ = command_tx.send(WorkerCommand::Abort);
                error!("microphone worker timed out while starting");
                return Err(CaptureError::DeviceUnavailable(
                    "timed out while opening microphone stream".to_string(),
                ));
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!("microphone worker disconnected during startup");
                return Err(CaptureError::DeviceUnavailable(
                    "microphone stream failed to initialize".to_string(),
                ));
            }
        };

        info!(
            device_name = %runtime.device_name,
            device_sample_rate_hz = runtime.sample_rate_hz,
            "microphone opened"
        );
        Ok(Box::new(CpalRecordingSession {
            command_tx: Some(command_tx),
            samples,
            device_sample_rate_hz: runtime.sample_rate_hz,
            device_name: runtime.device_name,
            format,
            started: false,
        }))
    }
}

pub struct CpalRecordingSession {
    command_tx: Option<Sender<WorkerCommand>>,
    samples: SampleBuffer,
    device_sample_rate_hz: u32,
    device_name: String,
    format: CaptureFormat,
    started: bool,
}

impl fmt::Debug for CpalRecordingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpalRecordingSession")
            .field("device_name", &self.device_name)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl CpalRecordingSession {
    fn take_samples(&self) -> Vec<i16> {
        self.samples
            .lock()
            .map(|mut buffer| std::mem::take(&mut *buffer))
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordingSession for CpalRecordingSession {
    fn start(&mut self) -> Result<(), CaptureError> {
        if self.started {
            return Err(CaptureError::AlreadyStarted);
        }
        let command_tx = self.command_tx.as_ref().ok_or(CaptureError::NotStarted)?;

        let (ack_tx, ack_rx) = mpsc::channel();
        command_tx
            .send(WorkerCommand::Start(ack_tx))
            .map_err(|_| CaptureError::Stream("capture worker is gone".to_string()))?;
        match ack_rx.recv_timeout(WORKER_ACK_TIMEOUT) {
            Ok(result) => result?,
            Err(_) => {
                return Err(CaptureError::Stream(
                    "capture worker did not confirm start".to_string(),
                ))
            }
        }

        self.started = true;
        info!(device_name = %self.device_name, "recording started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<EncodedAudio, CaptureError> {
        if !self.started {
            return Err(CaptureError::NotStarted);
        }
        let command_tx = self.command_tx.take().ok_or(CaptureError::NotStarted)?;
        self.started = false;

        let (ack_tx, ack_rx) = oneshot::channel();
        command_tx
            .send(WorkerCommand::Stop(ack_tx))
            .map_err(|_| CaptureError::Stream("capture worker is gone".to_string()))?;
        ack_rx
            .await
            .map_err(|_| CaptureError::Stream("capture worker exited before stopping".to_string()))??;

        let samples = self.take_samples();
        let audio = encode_recording(&samples, self.device_sample_rate_hz, self.format)?;
        info!(
            device_name = %self.device_name,
            duration_ms = audio.duration_ms,
            sample_count = audio.sample_count,
            "recording stopped"
        );
        Ok(audio)
    }

    fn abort(&mut self) {
        let Some(command_tx) = self.command_tx.take() else {
            return;
        };
        let _ = command_tx.send(WorkerCommand::Abort);
        self.started = false;
        let discarded = self.take_samples().len();
        warn!(discarded_samples = discarded, "recording aborted");
    }
}

impl Drop for CpalRecordingSession {
    fn drop(&mut self) {
        self.abort();
    }
}

fn worker_main(
    preferred_device_name: Option<String>,
    samples: SampleBuffer,
    ready_tx: Sender<Result<DeviceRuntime, CaptureError>>,
    command_rx: Receiver<WorkerCommand>,
) {
    let (stream_error_tx, stream_error_rx) = mpsc::channel::<String>();
    let (stream, runtime) = match open_stream(
        preferred_device_name.as_deref(),
        Arc::clone(&samples),
        stream_error_tx,
    ) {
        Ok(opened) => opened,
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };
    let _ = ready_tx.send(Ok(runtime));

    let mut stream_error: Option<String> = None;
    loop {
        if stream_error.is_none() {
            match stream_error_rx.try_recv() {
                Ok(message) => stream_error = Some(message),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => {}
            }
        }

        match command_rx.recv_timeout(WORKER_POLL_INTERVAL) {
            Ok(WorkerCommand::Start(ack)) => {
                let result = stream
                    .play()
                    .map_err(|err| CaptureError::Stream(format!("failed to start stream: {err}")));
                let _ = ack.send(result);
            }
            Ok(WorkerCommand::Stop(ack)) => {
                drop(stream);
                debug!("microphone stream released after stop");
                let result = match stream_error {
                    Some(message) => Err(CaptureError::Stream(message)),
                    None => Ok(()),
                };
                let _ = ack.send(result);
                return;
            }
            Ok(WorkerCommand::Abort) | Err(RecvTimeoutError::Disconnected) => {
                drop(stream);
                if let Ok(mut buffer) = samples.lock() {
                    buffer.clear();
                }
                debug!("microphone stream released after abort");
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

fn open_stream(
    preferred_device_name: Option<&str>,
    samples: SampleBuffer,
    stream_error_tx: Sender<String>,
) -> Result<(Stream, DeviceRuntime), CaptureError> {
    let host = cpal::default_host();
    let device = select_input_device(&host, preferred_device_name)?;
    let device_name = device.name().unwrap_or_else(|_| "unnamed".to_string());

    let supported_config = device.default_input_config().map_err(|err| {
        CaptureError::DeviceUnavailable(format!(
            "failed to read input config for '{device_name}': {err}"
        ))
    })?;
    let stream_config: StreamConfig = supported_config.clone().into();
    let channels = usize::from(stream_config.channels);
    let sample_rate_hz = stream_config.sample_rate.0;

    let stream = match supported_config.sample_format() {
        SampleFormat::F32 => build_stream::<f32>(
            &device,
            &stream_config,
            channels,
            samples,
            stream_error_tx,
            |sample| sample,
        ),
        SampleFormat::I16 => build_stream::<i16>(
            &device,
            &stream_config,
            channels,
            samples,
            stream_error_tx,
            |sample| sample as f32 / i16::MAX as f32,
        ),
        SampleFormat::U16 => build_stream::<u16>(
            &device,
            &stream_config,
            channels,
            samples,
            stream_error_tx,
            |sample| (sample as f32 / u16::MAX as f32) * 2.0 - 1.0,
        ),
        other => Err(CaptureError::DeviceUnavailable(format!(
            "unsupported microphone sample format: {other:?}"
        ))),
    }?;

    // Some backends start streams as soon as they are built.
    if let Err(err) = stream.pause() {
        debug!(error = %err, "unable to pause freshly built stream");
    }

    Ok((
        stream,
        DeviceRuntime {
            sample_rate_hz,
            device_name,
        },
    ))
}

fn select_input_device(
    host: &cpal::Host,
    preferred_device_name: Option<&str>,
) -> Result<Device, CaptureError> {
    if let Some(preferred) = preferred_device_name {
        let devices = host.input_devices().map_err(|err| {
            CaptureError::DeviceUnavailable(format!("failed to enumerate input devices: {err}"))
        })?;
        for device in devices {
            if device.name().is_ok_and(|name| name == preferred) {
                return Ok(device);
            }
        }
        warn!(preferred_device = preferred, "preferred microphone missing, using default");
    }

    host.default_input_device().ok_or_else(|| {
        CaptureError::DeviceUnavailable("no microphone input device is available".to_string())
    })
}

fn build_stream<T>(
    device: &Device,
    stream_config: &StreamConfig,
    channels: usize,
    samples: SampleBuffer,
    stream_error_tx: Sender<String>,
    to_f32: fn(T) -> f32,
) -> Result<Stream, CaptureError>
where
    T: SizedSample + Send + 'static,
{
    device
        .build_input_stream(
            stream_config,
            move |data: &[T], _| append_mono_frames(data, channels, to_f32, &samples),
            move |err: StreamError| {
                let message = err.to_string();
                error!(%message, "microphone stream callback error");
                let _ = stream_error_tx.send(message);
            },
            None,
        )
        .map_err(|err| CaptureError::DeviceUnavailable(format!("failed to build input stream: {err}")))
}

fn append_mono_frames<T: Copy>(
    data: &[T],
    channels: usize,
    to_f32: fn(T) -> f32,
    samples: &SampleBuffer,
) {
    if channels == 0 {
        return;
    }

    let Ok(mut buffer) = samples.lock() else {
        return;
    };
    buffer.reserve(data.len() / channels);
    for frame in data.chunks_exact(channels) {
        let mixed: f32 = frame.iter().map(|&sample| to_f32(sample)).sum();
        buffer.push(float_to_pcm16(mixed / channels as f32));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_frames_are_downmixed_to_mono() {
        let samples: SampleBuffer = Arc::new(Mutex::new(Vec::new()));

        append_mono_frames(&[1.0_f32, 0.0, -1.0, -1.0], 2, |sample| sample, &samples);

        let buffer = samples.lock().expect("buffer lock should not be poisoned");
        assert_eq!(buffer.as_slice(), &[float_to_pcm16(0.5), i16::MIN]);
    }

    #[test]
    fn zero_channel_frames_are_ignored() {
        let samples: SampleBuffer = Arc::new(Mutex::new(Vec::new()));

        append_mono_frames(&[0.5_f32, 0.5], 0, |sample| sample, &samples);

        assert!(samples
            .lock()
            .expect("buffer lock should not be poisoned")
            .is_empty());
    }

    #[test]
    fn partial_trailing_frame_is_dropped() {
        let samples: SampleBuffer = Arc::new(Mutex::new(Vec::new()));

        append_mono_frames(&[i16::MAX, i16::MAX, 5], 2, |sample| sample as f32 / i16::MAX as f32, &samples);

        let buffer = samples.lock().expect("buffer lock should not be poisoned");
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer[0], i16::MAX);
    }
}
