use crate::audio;
use crate::engine::AudioOutput;
use crate::synth::{SynthesisOptions, SynthesisResult, VoiceSynth};
use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

/// One synthesizer, one output device, and a running utterance counter.
/// Shared by every front end; calls into the synthesizer are serialised by
/// its mutex.
pub struct Speaker {
    synth: Mutex<VoiceSynth>,
    output: Arc<dyn AudioOutput>,
    model_id: String,
    options: SynthesisOptions,
    file_num: AtomicUsize,
}

impl Speaker {
    pub fn new(
        synth: VoiceSynth,
        output: Arc<dyn AudioOutput>,
        model_id: &str,
        options: SynthesisOptions,
    ) -> Self {
        Self {
            synth: Mutex::new(synth),
            output,
            model_id: model_id.to_string(),
            options,
            file_num: AtomicUsize::new(0),
        }
    }

    pub fn output(&self) -> &Arc<dyn AudioOutput> {
        &self.output
    }

    pub fn utterances(&self) -> usize {
        self.file_num.load(Ordering::SeqCst)
    }

    /// Synthesizes `text` into `testoutput{n}.wav`. The counter only
    /// advances on success.
    pub fn synthesize(&self, text: &str) -> Result<SynthesisResult> {
        let synth = self
            .synth
            .lock()
            .map_err(|_| anyhow!("synthesizer lock poisoned"))?;
        let n = self.file_num.load(Ordering::SeqCst);
        let filename = format!("testoutput{}.wav", n);
        let result = synth.synthesize(text, &filename, &self.model_id, &self.options)?;
        self.file_num.store(n + 1, Ordering::SeqCst);
        info!("Synthesized {} ({:.2}s)", result.path.display(), result.duration_secs());
        Ok(result)
    }

    /// Synthesizes into a fixed file name without touching the counter.
    pub fn synthesize_to(&self, text: &str, filename: &str) -> Result<SynthesisResult> {
        let synth = self
            .synth
            .lock()
            .map_err(|_| anyhow!("synthesizer lock poisoned"))?;
        Ok(synth.synthesize(text, filename, &self.model_id, &self.options)?)
    }

    /// Synthesizes and plays, resampling to the device rate when needed.
    pub fn synthesize_and_play(&self, text: &str) -> Result<SynthesisResult> {
        let result = self.synthesize(text)?;
        let device_rate = self.output.sample_rate();
        let samples = if result.sample_rate != device_rate {
            audio::resample(&result.wav, result.sample_rate, device_rate)
        } else {
            result.wav.clone()
        };
        self.output.play(samples, device_rate)?;
        Ok(result)
    }
}
