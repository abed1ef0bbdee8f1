#![allow(dead_code)]

use shibboleth::audio::{AudioConfig, Mel};
use shibboleth::models::{
    AcousticModel, AcousticOutput, Conditioning, LanguageManager, SpeakerManager, SynthError,
    Synthesizer, Vocoder,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const SAMPLES_PER_CHAR: usize = 10;
pub const MEL_CHANNELS: usize = 4;

/// Acoustic model stand-in. End-to-end mode returns `SAMPLES_PER_CHAR`
/// samples per character; spectrogram mode returns one frame per character.
pub struct FakeTts {
    pub audio: AudioConfig,
    pub end_to_end: bool,
    pub trim: Option<bool>,
    pub d_vectors: bool,
    pub speakers: Option<SpeakerManager>,
    pub languages: Option<LanguageManager>,
    pub calls: Arc<Mutex<Vec<(String, Conditioning)>>>,
}

impl FakeTts {
    pub fn end_to_end() -> Self {
        Self {
            audio: AudioConfig::default(),
            end_to_end: true,
            trim: None,
            d_vectors: false,
            speakers: None,
            languages: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn spectrogram() -> Self {
        Self {
            end_to_end: false,
            ..Self::end_to_end()
        }
    }

    pub fn with_speakers(mut self, names: &[&str]) -> Self {
        let ids: BTreeMap<String, i64> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.to_string(), i as i64))
            .collect();
        self.speakers = Some(SpeakerManager::from_ids(ids));
        self
    }

    pub fn with_languages(mut self, names: &[&str]) -> Self {
        let ids: BTreeMap<String, i64> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.to_string(), i as i64))
            .collect();
        self.languages = Some(LanguageManager::from_ids(ids));
        self
    }

    pub fn into_synth(self) -> Synthesizer {
        Synthesizer::new(Box::new(self))
    }
}

impl AcousticModel for FakeTts {
    fn arch(&self) -> &str {
        if self.end_to_end {
            "vits"
        } else {
            "glow_tts"
        }
    }

    fn audio(&self) -> &AudioConfig {
        &self.audio
    }

    fn do_trim_silence(&self) -> Option<bool> {
        self.trim
    }

    fn use_d_vector_file(&self) -> bool {
        self.d_vectors
    }

    fn speaker_manager(&self) -> Option<&SpeakerManager> {
        self.speakers.as_ref()
    }

    fn language_manager(&self) -> Option<&LanguageManager> {
        self.languages.as_ref()
    }

    fn infer(&self, sentence: &str, cond: &Conditioning) -> Result<AcousticOutput, SynthError> {
        self.calls
            .lock()
            .unwrap()
            .push((sentence.to_string(), cond.clone()));
        let n = sentence.chars().count();
        if self.end_to_end {
            Ok(AcousticOutput {
                waveform: Some(vec![0.5; n * SAMPLES_PER_CHAR]),
                mel: None,
            })
        } else {
            Ok(AcousticOutput {
                waveform: None,
                mel: Mel::new(n, MEL_CHANNELS, vec![0.5; n * MEL_CHANNELS]),
            })
        }
    }

    fn transfer_voice(
        &self,
        _reference: &Path,
        target: &Conditioning,
        source: &Conditioning,
    ) -> Result<AcousticOutput, SynthError> {
        self.calls
            .lock()
            .unwrap()
            .push(("<target>".to_string(), target.clone()));
        self.calls
            .lock()
            .unwrap()
            .push(("<source>".to_string(), source.clone()));
        Ok(AcousticOutput {
            waveform: Some(vec![0.25; 100]),
            mel: Mel::new(25, MEL_CHANNELS, vec![0.5; 25 * MEL_CHANNELS]),
        })
    }

    fn compute_embedding_from_clip(&self, _clip: &Path) -> Result<Vec<f32>, SynthError> {
        Ok(vec![9.0; 3])
    }
}

/// Vocoder stand-in producing `hop_length` samples per frame.
pub struct FakeVocoder {
    pub audio: AudioConfig,
}

impl FakeVocoder {
    pub fn at_rate(sample_rate: u32) -> Self {
        Self {
            audio: AudioConfig {
                sample_rate,
                ..AudioConfig::default()
            },
        }
    }
}

impl Vocoder for FakeVocoder {
    fn audio(&self) -> &AudioConfig {
        &self.audio
    }

    fn infer(&self, mel: &Mel) -> Result<Vec<f32>, SynthError> {
        Ok(vec![0.1; mel.frames * self.audio.hop_length])
    }
}
