use crate::devices::select_device;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use vosk::{DecodingState, Model, Recognizer};

#[derive(thiserror::Error, Debug)]
pub enum EarError {
    #[error("Could not load recognition model from {0}")]
    ModelLoad(PathBuf),
    #[error("Could not create recognizer at {0} Hz")]
    Recognizer(u32),
    #[error("No input device matching '{0}'")]
    NoDevice(String),
    #[error("Input stream error: {0}")]
    Stream(String),
    #[error("Transcript channel closed")]
    Closed,
}

/// A recognizer result. Serialises as `{"partial": ...}` or `{"text": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TranscriptEvent {
    Final { text: String },
    Partial { partial: String },
}

impl TranscriptEvent {
    /// Only a non-empty `text` is a finished utterance.
    pub fn final_text(text: &str) -> Option<Self> {
        let text = text.trim();
        (!text.is_empty()).then(|| TranscriptEvent::Final {
            text: text.to_string(),
        })
    }

    pub fn from_json(json: &str) -> Option<Self> {
        match serde_json::from_str::<TranscriptEvent>(json).ok()? {
            TranscriptEvent::Final { text } => Self::final_text(&text),
            partial => Some(partial),
        }
    }
}

/// Bounded transcript queue. Partial results are dropped when the queue is
/// full; final results wait for room.
#[derive(Clone)]
pub struct TranscriptSender {
    tx: SyncSender<TranscriptEvent>,
    dropped: Arc<AtomicU64>,
}

pub fn transcript_channel(capacity: usize) -> (TranscriptSender, Receiver<TranscriptEvent>) {
    let (tx, rx) = sync_channel(capacity);
    (
        TranscriptSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

impl TranscriptSender {
    pub fn send(&self, event: TranscriptEvent) -> Result<(), EarError> {
        match event {
            TranscriptEvent::Partial { .. } => match self.tx.try_send(event) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(TrySendError::Disconnected(_)) => Err(EarError::Closed),
            },
            TranscriptEvent::Final { .. } => self.tx.send(event).map_err(|_| EarError::Closed),
        }
    }

    pub fn dropped_partials(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Averages interleaved frames down to mono 16-bit PCM.
pub fn downmix_to_i16(data: &[f32], channels: usize) -> Vec<i16> {
    let channels = channels.max(1);
    data.chunks(channels)
        .map(|frame| {
            let mean = frame.iter().sum::<f32>() / frame.len() as f32;
            (mean.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct EarConfig {
    pub model_path: PathBuf,
    pub device: Option<String>,
    pub sample_rate: Option<u32>,
    pub blocksize: Option<u32>,
    pub buffer_ms: u64,
}

/// Running capture and recognition. Dropping it stops both.
pub struct Ear {
    stop: Arc<AtomicBool>,
    overruns: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl Ear {
    /// Loads the recognition model, opens the input device and starts
    /// publishing transcripts into `events`.
    pub fn start(config: EarConfig, events: TranscriptSender) -> Result<Self, EarError> {
        let model = load_model(&config.model_path)?;
        let stop = Arc::new(AtomicBool::new(false));
        let overruns = Arc::new(AtomicU64::new(0));
        let (ready_tx, ready_rx) = sync_channel::<Result<(), EarError>>(1);

        let worker = {
            let stop = stop.clone();
            let overruns = overruns.clone();
            thread::spawn(move || {
                // The input stream must live on this thread
                if let Err(e) = run_capture(config, model, events, stop, overruns, &ready_tx) {
                    error!("Ear: {}", e);
                    let _ = ready_tx.send(Err(e));
                }
            })
        };

        ready_rx.recv().map_err(|_| EarError::Closed)??;
        Ok(Self {
            stop,
            overruns,
            worker: Some(worker),
        })
    }

    /// Samples discarded because the capture buffer was full.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Ear {
    fn drop(&mut self) {
        self.stop();
    }
}

fn load_model(path: &Path) -> Result<Model, EarError> {
    info!("Ear: Loading recognition model from {}", path.display());
    Model::new(path.to_string_lossy()).ok_or_else(|| EarError::ModelLoad(path.to_path_buf()))
}

fn open_input(query: Option<&str>) -> Result<cpal::Device, EarError> {
    let host = cpal::default_host();
    match query {
        None => host
            .default_input_device()
            .ok_or_else(|| EarError::NoDevice("default".to_string())),
        Some(query) => {
            let devices: Vec<_> = host
                .input_devices()
                .map_err(|e| EarError::Stream(e.to_string()))?
                .collect();
            let names: Vec<String> = devices
                .iter()
                .map(|d| d.name().unwrap_or_default())
                .collect();
            let index = select_device(&names, query)
                .ok_or_else(|| EarError::NoDevice(query.to_string()))?;
            devices
                .into_iter()
                .nth(index)
                .ok_or_else(|| EarError::NoDevice(query.to_string()))
        }
    }
}

fn run_capture(
    config: EarConfig,
    model: Model,
    events: TranscriptSender,
    stop: Arc<AtomicBool>,
    overruns: Arc<AtomicU64>,
    ready: &SyncSender<Result<(), EarError>>,
) -> Result<(), EarError> {
    let device = open_input(config.device.as_deref())?;
    info!(
        "Ear: Found input device: {}",
        device.name().unwrap_or("Unknown".into())
    );

    let supported = device
        .default_input_config()
        .map_err(|e| EarError::Stream(e.to_string()))?;
    let mut stream_config: cpal::StreamConfig = supported.clone().into();
    if let Some(rate) = config.sample_rate {
        stream_config.sample_rate = rate;
    }
    if let Some(frames) = config.blocksize {
        stream_config.buffer_size = cpal::BufferSize::Fixed(frames);
    }
    let sample_rate = stream_config.sample_rate;
    let channels = stream_config.channels as usize;
    debug!("Ear: Input config: {:?}", stream_config);

    let capacity = (sample_rate as u64 * config.buffer_ms / 1000).max(1) as usize;
    let (mut producer, mut consumer) = HeapRb::<i16>::new(capacity).split();

    let err_fn = move |err| {
        error!("an error occurred on input stream: {}", err);
    };
    let callback_overruns = overruns.clone();
    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &_| {
                let mono = downmix_to_i16(data, channels);
                let pushed = producer.push_slice(&mono);
                if pushed < mono.len() {
                    callback_overruns.fetch_add((mono.len() - pushed) as u64, Ordering::Relaxed);
                }
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &_| {
                let mono: Vec<i16> = if channels > 1 {
                    data.chunks(channels)
                        .map(|f| (f.iter().map(|&s| s as i32).sum::<i32>() / f.len() as i32) as i16)
                        .collect()
                } else {
                    data.to_vec()
                };
                let pushed = producer.push_slice(&mono);
                if pushed < mono.len() {
                    callback_overruns.fetch_add((mono.len() - pushed) as u64, Ordering::Relaxed);
                }
            },
            err_fn,
            None,
        ),
        other => {
            return Err(EarError::Stream(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    }
    .map_err(|e| EarError::Stream(e.to_string()))?;

    let mut recognizer =
        Recognizer::new(&model, sample_rate as f32).ok_or(EarError::Recognizer(sample_rate))?;
    stream.play().map_err(|e| EarError::Stream(e.to_string()))?;
    info!("Ear: Listening at {} Hz", sample_rate);
    let _ = ready.send(Ok(()));

    let mut chunk = vec![0i16; (sample_rate as usize / 10).max(1)];
    let mut last_partial = String::new();
    while !stop.load(Ordering::SeqCst) {
        let n = consumer.pop_slice(&mut chunk);
        if n == 0 {
            thread::sleep(Duration::from_millis(10));
            continue;
        }
        match recognizer.accept_waveform(&chunk[..n]) {
            Ok(DecodingState::Finalized) => {
                last_partial.clear();
                let text = recognizer
                    .result()
                    .single()
                    .map(|r| r.text.to_string())
                    .unwrap_or_default();
                if let Some(event) = TranscriptEvent::final_text(&text) {
                    events.send(event)?;
                }
            }
            Ok(DecodingState::Running) => {
                let partial = recognizer.partial_result().partial.to_string();
                if !partial.is_empty() && partial != last_partial {
                    last_partial = partial.clone();
                    events.send(TranscriptEvent::Partial { partial })?;
                }
            }
            Ok(DecodingState::Failed) => warn!("Ear: recognizer failed to decode a chunk"),
            Err(e) => warn!("Ear: recognizer rejected audio: {:?}", e),
        }
    }

    drop(stream);
    info!("Ear: Stopped listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_json_gating() {
        assert_eq!(
            TranscriptEvent::from_json(r#"{"text": "hello there"}"#),
            Some(TranscriptEvent::Final {
                text: "hello there".to_string()
            })
        );
        assert_eq!(TranscriptEvent::from_json(r#"{"text": ""}"#), None);
        assert_eq!(TranscriptEvent::from_json(r#"{"text": "  "}"#), None);
        assert_eq!(
            TranscriptEvent::from_json(r#"{"partial": "hel"}"#),
            Some(TranscriptEvent::Partial {
                partial: "hel".to_string()
            })
        );
        assert_eq!(TranscriptEvent::from_json("not json"), None);
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_string(&TranscriptEvent::Partial {
            partial: "hi".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"partial":"hi"}"#);
    }

    #[test]
    fn test_full_queue_drops_partials_but_keeps_finals() {
        let (tx, rx) = transcript_channel(1);
        let partial = |s: &str| TranscriptEvent::Partial {
            partial: s.to_string(),
        };
        tx.send(partial("a")).unwrap();
        tx.send(partial("ab")).unwrap();
        assert_eq!(tx.dropped_partials(), 1);

        let sender = tx.clone();
        let handle = thread::spawn(move || {
            sender
                .send(TranscriptEvent::final_text("abc").unwrap())
                .unwrap();
        });
        assert_eq!(rx.recv().unwrap(), partial("a"));
        handle.join().unwrap();
        assert_eq!(
            rx.recv().unwrap(),
            TranscriptEvent::Final {
                text: "abc".to_string()
            }
        );
    }

    #[test]
    fn test_send_on_closed_channel() {
        let (tx, rx) = transcript_channel(1);
        drop(rx);
        assert!(matches!(
            tx.send(TranscriptEvent::final_text("x").unwrap()),
            Err(EarError::Closed)
        ));
    }

    #[test]
    fn test_downmix_to_i16() {
        assert_eq!(downmix_to_i16(&[1.0, 0.0, -1.0, -1.0], 2), vec![16383, -32767]);
        assert_eq!(downmix_to_i16(&[2.0], 1), vec![i16::MAX]);
    }
}
