//! Microphone front end: recognized speech is shown as it arrives and
//! every finished utterance is spoken back.

use crate::config_loader::Settings;
use crate::ear::{transcript_channel, Ear, EarConfig, TranscriptEvent};
use crate::speaker::Speaker;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const HISTORY: usize = 20;

#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    pub input_device: Option<String>,
    /// Print transcript events as JSON lines instead of text.
    pub json: bool,
}

/// What is on screen: the utterance in progress and recent finished ones.
#[derive(Debug, Default)]
pub struct DisplayState {
    pub partial: String,
    pub history: Vec<String>,
}

impl DisplayState {
    /// Applies one event and returns the text to speak for a final one.
    pub fn apply(&mut self, event: &TranscriptEvent) -> Option<String> {
        match event {
            TranscriptEvent::Partial { partial } => {
                self.partial = partial.clone();
                None
            }
            TranscriptEvent::Final { text } => {
                self.partial.clear();
                self.history.push(text.clone());
                if self.history.len() > HISTORY {
                    self.history.remove(0);
                }
                Some(text.clone())
            }
        }
    }
}

/// Takes everything queued right now without blocking.
pub fn drain(rx: &Receiver<TranscriptEvent>) -> Result<Vec<TranscriptEvent>, TryRecvError> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Empty) => return Ok(events),
            Err(TryRecvError::Disconnected) if !events.is_empty() => return Ok(events),
            Err(e) => return Err(e),
        }
    }
}

fn render(event: &TranscriptEvent, json: bool) -> String {
    if json {
        return serde_json::to_string(event).unwrap_or_default();
    }
    let stamp = chrono::Local::now().format("%H:%M:%S");
    match event {
        TranscriptEvent::Partial { partial } => format!("[{}] ... {}", stamp, partial),
        TranscriptEvent::Final { text } => format!("[{}] >>> {}", stamp, text),
    }
}

/// Runs until Ctrl-C or until recognition stops. Without a speaker only
/// transcripts are shown.
pub async fn run(
    speaker: Option<Arc<Speaker>>,
    settings: &Settings,
    options: ListenOptions,
) -> anyhow::Result<()> {
    let (tx, rx) = transcript_channel(settings.listen_queue_capacity);
    let mut ear = Ear::start(
        EarConfig {
            model_path: settings.vosk_model_path.clone(),
            device: options.input_device.clone(),
            sample_rate: settings.sample_rate,
            blocksize: settings.blocksize,
            buffer_ms: settings.capture_buffer_ms,
        },
        tx,
    )?;

    let mut display = DisplayState::default();
    let mut tick = tokio::time::interval(Duration::from_millis(settings.display_interval_ms));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    info!("Listening... press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Stopping");
                break;
            }
            _ = tick.tick() => {
                let events = match drain(&rx) {
                    Ok(events) => events,
                    Err(_) => {
                        warn!("Recognition stopped");
                        break;
                    }
                };
                for event in events {
                    println!("{}", render(&event, options.json));
                    let Some(text) = display.apply(&event) else { continue };
                    if let Some(speaker) = &speaker {
                        let speaker = speaker.clone();
                        tokio::task::spawn_blocking(move || {
                            if let Err(e) = speaker.synthesize_and_play(&text) {
                                error!("Synthesis failed: {:#}", e);
                            }
                        });
                    }
                }
            }
        }
    }

    let overruns = ear.overruns();
    if overruns > 0 {
        warn!("{} captured samples were dropped (buffer full)", overruns);
    }
    tokio::task::spawn_blocking(move || ear.stop()).await?;
    Ok(())
}
