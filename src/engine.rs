use crate::devices::select_device;
use rodio::buffer::SamplesBuffer;
use rodio::cpal::traits::{DeviceTrait, HostTrait};
use rodio::{OutputStream, Sink};
use std::sync::mpsc::{channel, sync_channel, Sender, SyncSender};
use std::thread;
use tracing::{debug, error, info};

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("No audio output device matching '{0}'")]
    NoDevice(String),
    #[error("Audio output stream error: {0}")]
    Stream(String),
    #[error("Audio thread is not running")]
    Closed,
}

/// Sink for synthesized audio.
pub trait AudioOutput: Send + Sync {
    /// Rate playback expects samples at.
    fn sample_rate(&self) -> u32;

    /// Queues mono samples and returns immediately.
    fn play(&self, samples: Vec<f32>, sample_rate: u32) -> Result<(), EngineError>;

    /// Plays mono samples and waits until they have finished.
    fn play_blocking(&self, samples: Vec<f32>, sample_rate: u32) -> Result<(), EngineError>;
}

struct PlayJob {
    samples: Vec<f32>,
    sample_rate: u32,
    done: Option<SyncSender<()>>,
}

/// Playback on a dedicated audio thread that owns the output stream.
#[derive(Clone)]
pub struct AudioEngine {
    tx: Sender<PlayJob>,
    sample_rate: u32,
}

impl AudioEngine {
    /// Opens `device` (index or name substring; the default device when
    /// `None`) and starts the audio thread.
    pub fn new(device: Option<&str>) -> Result<Self, EngineError> {
        let (tx, rx) = channel::<PlayJob>();
        let (ready_tx, ready_rx) = sync_channel::<Result<u32, EngineError>>(1);
        let query = device.map(str::to_string);

        thread::spawn(move || {
            // Audio stream must live on this thread
            let (_stream, stream_handle, rate) = match open_output(query.as_deref()) {
                Ok(opened) => opened,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(rate));

            while let Ok(job) = rx.recv() {
                debug!(
                    "Audio Thread: playing {} samples at {} Hz",
                    job.samples.len(),
                    job.sample_rate
                );
                match Sink::try_new(&stream_handle) {
                    Ok(sink) => {
                        sink.append(SamplesBuffer::new(1, job.sample_rate, job.samples));
                        match job.done {
                            Some(done) => {
                                sink.sleep_until_end();
                                let _ = done.send(());
                            }
                            None => sink.detach(),
                        }
                    }
                    Err(e) => error!("Failed to create sink: {}", e),
                }
            }
        });

        let sample_rate = ready_rx.recv().map_err(|_| EngineError::Closed)??;
        info!("Audio output ready at {} Hz", sample_rate);
        Ok(Self { tx, sample_rate })
    }

    /// Plays at `rate` instead of the device's default rate.
    pub fn with_sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    fn submit(&self, job: PlayJob) -> Result<(), EngineError> {
        self.tx.send(job).map_err(|_| EngineError::Closed)
    }
}

fn open_output(
    query: Option<&str>,
) -> Result<(OutputStream, rodio::OutputStreamHandle, u32), EngineError> {
    let host = rodio::cpal::default_host();
    let device = match query {
        None => host
            .default_output_device()
            .ok_or_else(|| EngineError::NoDevice("default".to_string()))?,
        Some(query) => {
            let devices: Vec<_> = host
                .output_devices()
                .map_err(|e| EngineError::Stream(e.to_string()))?
                .collect();
            let names: Vec<String> = devices
                .iter()
                .map(|d| d.name().unwrap_or_default())
                .collect();
            let index = select_device(&names, query)
                .ok_or_else(|| EngineError::NoDevice(query.to_string()))?;
            devices
                .into_iter()
                .nth(index)
                .ok_or_else(|| EngineError::NoDevice(query.to_string()))?
        }
    };

    info!(
        "Using output device: {}",
        device.name().unwrap_or_else(|_| "Unknown".into())
    );
    let rate = device
        .default_output_config()
        .map_err(|e| EngineError::Stream(e.to_string()))?
        .sample_rate()
        .0;
    let (stream, handle) =
        OutputStream::try_from_device(&device).map_err(|e| EngineError::Stream(e.to_string()))?;
    Ok((stream, handle, rate))
}

impl AudioOutput for AudioEngine {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn play(&self, samples: Vec<f32>, sample_rate: u32) -> Result<(), EngineError> {
        self.submit(PlayJob {
            samples,
            sample_rate,
            done: None,
        })
    }

    fn play_blocking(&self, samples: Vec<f32>, sample_rate: u32) -> Result<(), EngineError> {
        let (done_tx, done_rx) = sync_channel(1);
        self.submit(PlayJob {
            samples,
            sample_rate,
            done: Some(done_tx),
        })?;
        done_rx.recv().map_err(|_| EngineError::Closed)
    }
}
