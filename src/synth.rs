//! Synthesis orchestration: speaker/language resolution, vocoder
//! adaptation, trimming and sentence concatenation on top of a loaded
//! [`Synthesizer`].

use crate::audio::{self, Mel};
use crate::models::{
    AcousticOutput, Conditioning, ModelLoader, ModelSpecs, SynthError, Synthesizer,
};
use crate::text;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Silence inserted between consecutive sentences, in samples.
pub const DEFAULT_SENTENCE_GAP: usize = 10_000;

/// Per-call options for [`VoiceSynth::synthesize`].
#[derive(Debug, Clone, Default)]
pub struct SynthesisOptions {
    pub speaker_name: Option<String>,
    pub language_name: Option<String>,
    pub clean_text: bool,
    /// Applied in order after cleanup.
    pub rewrite_words: Vec<(String, String)>,
}

/// Everything [`VoiceSynth::render`] needs for one utterance.
#[derive(Debug, Clone, Default)]
pub struct SynthesisRequest {
    pub text: String,
    pub speaker_name: Option<String>,
    pub language_name: Option<String>,
    /// Clip to derive a speaker embedding from.
    pub speaker_wav: Option<PathBuf>,
    pub style_wav: Option<PathBuf>,
    /// Source clip for voice conversion.
    pub reference_wav: Option<PathBuf>,
    pub reference_speaker_name: Option<String>,
}

impl SynthesisRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisResult {
    pub wav: Vec<f32>,
    pub sample_rate: u32,
    pub path: PathBuf,
}

impl SynthesisResult {
    pub fn duration_secs(&self) -> f64 {
        self.wav.len() as f64 / self.sample_rate as f64
    }
}

pub struct VoiceSynth {
    audio_write_path: PathBuf,
    use_cuda: bool,
    sentence_gap: usize,
    models: BTreeMap<String, Synthesizer>,
}

impl VoiceSynth {
    /// Prepares the output directory. A path with an extension is taken to
    /// be a file and its parent is used instead; a missing directory is
    /// created.
    pub fn new(audio_write_path: &Path, use_cuda: bool) -> Result<Self, SynthError> {
        let mut dir = audio_write_path.to_path_buf();
        if dir.extension().is_some() {
            dir = dir.parent().map(Path::to_path_buf).unwrap_or_default();
            warn!(
                "Got audio scratch path as a file, using: {}",
                dir.display()
            );
        }
        if !dir.as_os_str().is_empty() && !dir.exists() {
            warn!(
                "Audio scratch path does not exist, creating: {}",
                dir.display()
            );
            std::fs::create_dir_all(&dir)?;
        }

        Ok(Self {
            audio_write_path: dir,
            use_cuda,
            sentence_gap: DEFAULT_SENTENCE_GAP,
            models: BTreeMap::new(),
        })
    }

    pub fn with_sentence_gap(mut self, samples: usize) -> Self {
        self.sentence_gap = samples;
        self
    }

    pub fn audio_write_path(&self) -> &Path {
        &self.audio_write_path
    }

    /// Loads every model in `specs` through `loader`. The first failure
    /// aborts and is returned as is.
    pub fn load_models(
        &mut self,
        specs: &ModelSpecs,
        loader: &dyn ModelLoader,
    ) -> Result<(), SynthError> {
        for (name, spec) in &specs.models {
            info!("LOADING MODEL {} at {:?}", name, spec);
            let paths = spec.resolve(&specs.root);
            let synthesizer = loader.load(&paths, self.use_cuda)?;
            self.add_model(name, synthesizer);
        }
        Ok(())
    }

    pub fn add_model(&mut self, name: &str, synthesizer: Synthesizer) {
        info!(
            "Model '{}' ready: arch={} sample_rate={}",
            name,
            synthesizer.tts.arch(),
            synthesizer.output_sample_rate()
        );
        self.models.insert(name.to_string(), synthesizer);
    }

    pub fn model(&self, name: &str) -> Option<&Synthesizer> {
        self.models.get(name)
    }

    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// Synthesizes `text` with `model_id` and writes the result to
    /// `filename` inside the output directory.
    pub fn synthesize(
        &self,
        text: &str,
        filename: &str,
        model_id: &str,
        options: &SynthesisOptions,
    ) -> Result<SynthesisResult, SynthError> {
        let synth = self
            .models
            .get(model_id)
            .ok_or_else(|| SynthError::ModelNotLoaded(model_id.to_string()))?;

        let mut text = text.to_string();
        if options.clean_text {
            text = text::cleanup_text_for_tts(&text);
        }
        if !options.rewrite_words.is_empty() {
            text = text::rewrite_words(&text, &options.rewrite_words);
        }

        info!("Synthesizing Text >{}<", text);
        let request = SynthesisRequest {
            text,
            speaker_name: options.speaker_name.clone(),
            language_name: options.language_name.clone(),
            ..SynthesisRequest::default()
        };
        let wav = self.render(synth, &request)?;

        let sample_rate = synth.output_sample_rate();
        let path = std::path::absolute(self.audio_write_path.join(filename))?;
        audio::save_wav(&wav, &path, sample_rate)?;
        debug!("Wrote file: {}", path.display());

        Ok(SynthesisResult {
            wav,
            sample_rate,
            path,
        })
    }

    /// Runs all the models for one request and returns the samples.
    pub fn render(
        &self,
        synth: &Synthesizer,
        request: &SynthesisRequest,
    ) -> Result<Vec<f32>, SynthError> {
        let start = Instant::now();

        if request.text.is_empty() && request.reference_wav.is_none() {
            return Err(SynthError::MissingInput);
        }

        let mut cond = resolve_speaker(synth, request)?;
        cond.language_id = resolve_language(synth, request.language_name.as_deref())?;
        cond.style_wav = request.style_wav.clone();

        // Compute a new d-vector from the given clip.
        if let Some(clip) = &request.speaker_wav {
            cond.d_vector = Some(synth.tts.compute_embedding_from_clip(clip)?);
        }

        let wavs = match &request.reference_wav {
            None => self.render_text(synth, &request.text, &cond)?,
            Some(reference) => convert_voice(synth, reference, request, &cond)?,
        };

        let process_time = start.elapsed().as_secs_f64();
        let audio_time = wavs.len() as f64 / synth.tts.audio().sample_rate as f64;
        info!(" > Processing time: {:.3}", process_time);
        if audio_time > 0.0 {
            info!(" > Real-time factor: {:.3}", process_time / audio_time);
        }
        Ok(wavs)
    }

    fn render_text(
        &self,
        synth: &Synthesizer,
        text: &str,
        cond: &Conditioning,
    ) -> Result<Vec<f32>, SynthError> {
        let sentences = synth.tts.split_into_sentences(text);
        info!("Text split into sentences: {:?}", sentences);

        let mut rendered = Vec::with_capacity(sentences.len());
        for sentence in &sentences {
            let output = synth.tts.infer(sentence, cond)?;
            let mut waveform = vocode(synth, output)?;

            match synth.tts.do_trim_silence() {
                Some(true) => waveform = audio::trim_silence(&waveform, synth.tts.audio()),
                Some(false) => {}
                None => debug!("Config has no do_trim_silence; leaving silence untrimmed"),
            }
            rendered.push(waveform);
        }
        Ok(concat_with_gap(&rendered, self.sentence_gap))
    }
}

/// Speaker id or embedding for the target voice.
fn resolve_speaker(
    synth: &Synthesizer,
    request: &SynthesisRequest,
) -> Result<Conditioning, SynthError> {
    let mut cond = Conditioning::default();
    let speaker_name = request.speaker_name.as_deref().filter(|s| !s.is_empty());

    if !synth.is_multi_speaker() {
        if let Some(name) = speaker_name {
            return Err(SynthError::SpeakerNotSupported(name.to_string()));
        }
        return Ok(cond);
    }

    match speaker_name {
        Some(name) => {
            let manager = synth
                .tts
                .speaker_manager()
                .ok_or_else(|| SynthError::UnknownSpeaker(name.to_string()))?;
            if synth.tts.use_d_vector_file() {
                // Average of the speaker's stored d-vectors.
                cond.d_vector = Some(
                    manager
                        .mean_embedding(name)
                        .ok_or_else(|| SynthError::UnknownSpeaker(name.to_string()))?,
                );
            } else {
                cond.speaker_id = Some(
                    manager
                        .id(name)
                        .ok_or_else(|| SynthError::UnknownSpeaker(name.to_string()))?,
                );
            }
        }
        None if request.speaker_wav.is_none() && request.reference_wav.is_none() => {
            return Err(SynthError::SpeakerRequired);
        }
        None => {}
    }
    Ok(cond)
}

fn resolve_language(
    synth: &Synthesizer,
    language_name: Option<&str>,
) -> Result<Option<i64>, SynthError> {
    let language_name = language_name.filter(|s| !s.is_empty());
    if !synth.is_multi_lingual() {
        if let Some(name) = language_name {
            debug!("Ignoring language '{}' for a single-language model", name);
        }
        return Ok(None);
    }
    let name = language_name.ok_or(SynthError::LanguageRequired)?;
    synth
        .tts
        .language_manager()
        .and_then(|m| m.id(name))
        .map(Some)
        .ok_or_else(|| SynthError::UnknownLanguage(name.to_string()))
}

/// Reference-speaker conditioning for voice conversion.
fn resolve_reference_speaker(
    synth: &Synthesizer,
    reference: &Path,
    reference_speaker_name: Option<&str>,
) -> Result<Conditioning, SynthError> {
    let mut cond = Conditioning::default();
    if !synth.is_multi_speaker() {
        return Ok(cond);
    }
    match reference_speaker_name.filter(|s| !s.is_empty()) {
        Some(name) => {
            let manager = synth
                .tts
                .speaker_manager()
                .ok_or_else(|| SynthError::UnknownSpeaker(name.to_string()))?;
            if synth.tts.use_d_vector_file() {
                let first = manager
                    .embeddings_by_name(name)
                    .and_then(|all| all.first())
                    .ok_or_else(|| SynthError::UnknownSpeaker(name.to_string()))?;
                cond.d_vector = Some(first.clone());
            } else {
                cond.speaker_id = Some(
                    manager
                        .id(name)
                        .ok_or_else(|| SynthError::UnknownSpeaker(name.to_string()))?,
                );
            }
        }
        None => cond.d_vector = Some(synth.tts.compute_embedding_from_clip(reference)?),
    }
    Ok(cond)
}

fn convert_voice(
    synth: &Synthesizer,
    reference: &Path,
    request: &SynthesisRequest,
    target: &Conditioning,
) -> Result<Vec<f32>, SynthError> {
    let source = resolve_reference_speaker(
        synth,
        reference,
        request.reference_speaker_name.as_deref(),
    )?;
    let output = synth.tts.transfer_voice(reference, target, &source)?;
    vocode(synth, output)
}

/// Turns acoustic output into samples: through the vocoder when one is
/// configured, otherwise the model's own waveform, falling back to
/// Griffin-Lim for spectrogram-only models.
fn vocode(synth: &Synthesizer, output: AcousticOutput) -> Result<Vec<f32>, SynthError> {
    let Some(vocoder) = &synth.vocoder else {
        return match output {
            AcousticOutput {
                waveform: Some(wav),
                ..
            } => Ok(wav),
            AcousticOutput { mel: Some(mel), .. } => {
                debug!("No vocoder, inverting {} frames with Griffin-Lim", mel.frames);
                Ok(audio::griffin_lim(&mel, synth.tts.audio()))
            }
            _ => Err(SynthError::NoWaveform),
        };
    };
    let mel = output.mel.ok_or(SynthError::NoSpectrogram)?;
    let vocoder_input = prepare_vocoder_input(
        mel,
        synth.tts.audio(),
        vocoder.audio(),
    );
    vocoder.infer(&vocoder_input)
}

/// Re-scales model frames for the vocoder and stretches them along time
/// when the two disagree on sample rate.
pub fn prepare_vocoder_input(
    mel: Mel,
    model_audio: &audio::AudioConfig,
    vocoder_audio: &audio::AudioConfig,
) -> Mel {
    let mel = audio::denormalize(mel, model_audio);
    let mel = audio::normalize(mel, vocoder_audio);
    let scale = vocoder_audio.sample_rate as f32 / model_audio.sample_rate as f32;
    if scale != 1.0 {
        info!("Interpolating tts model output (scale factor {:.4})", scale);
        audio::interpolate_vocoder_input(scale, &mel)
    } else {
        mel
    }
}

/// Joins waveforms with `gap` zero samples between consecutive entries.
pub fn concat_with_gap(parts: &[Vec<f32>], gap: usize) -> Vec<f32> {
    let total: usize =
        parts.iter().map(Vec::len).sum::<usize>() + gap * parts.len().saturating_sub(1);
    let mut out = Vec::with_capacity(total);
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.resize(out.len() + gap, 0.0);
        }
        out.extend_from_slice(part);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioConfig;
    use proptest::prelude::*;

    #[test]
    fn test_concat_with_gap() {
        let out = concat_with_gap(&[vec![1.0; 3], vec![2.0; 2]], 4);
        assert_eq!(out, vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 2.0, 2.0]);
        assert!(concat_with_gap(&[], 4).is_empty());
        assert_eq!(concat_with_gap(&[vec![1.0]], 4), vec![1.0]);
    }

    proptest! {
        #[test]
        fn prop_concat_length(lens in proptest::collection::vec(0usize..50, 0..8), gap in 0usize..100) {
            let parts: Vec<Vec<f32>> = lens.iter().map(|&n| vec![0.5; n]).collect();
            let out = concat_with_gap(&parts, gap);
            let expected = lens.iter().sum::<usize>() + gap * lens.len().saturating_sub(1);
            prop_assert_eq!(out.len(), expected);
        }
    }

    #[test]
    fn test_prepare_vocoder_input_same_rate_keeps_frames() {
        let cfg = AudioConfig::default();
        let mel = Mel::new(5, 2, vec![0.5; 10]).unwrap();
        let out = prepare_vocoder_input(mel.clone(), &cfg, &cfg);
        assert_eq!(out.frames, 5);
        for (a, b) in out.data.iter().zip(mel.data.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_prepare_vocoder_input_rescales_and_stretches() {
        let model = AudioConfig::default();
        let vocoder = AudioConfig {
            sample_rate: 44100,
            max_norm: 1.0,
            ..AudioConfig::default()
        };
        let mel = Mel::new(4, 1, vec![4.0; 4]).unwrap();
        let out = prepare_vocoder_input(mel, &model, &vocoder);
        assert_eq!(out.frames, 8);
        assert!(out.data.iter().all(|v| (v - 1.0).abs() < 1e-4));
    }

    #[test]
    fn test_new_uses_parent_for_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("renders").join("out.wav");
        let synth = VoiceSynth::new(&target, false).unwrap();
        assert_eq!(synth.audio_write_path(), dir.path().join("renders"));
        assert!(dir.path().join("renders").is_dir());
    }
}
