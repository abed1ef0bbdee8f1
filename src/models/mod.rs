pub mod config;
pub mod espeak;
pub mod onnx;
pub mod speakers;
pub mod tokenizer;

use crate::audio::{AudioConfig, Mel};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use speakers::{LanguageManager, SpeakerManager};

#[derive(thiserror::Error, Debug)]
pub enum SynthError {
    #[error(
        "You need to define either `text` (for synthesis) or a `reference_wav` (for voice conversion)."
    )]
    MissingInput,
    #[error(
        "Missing speakers file for selecting speaker '{0}'. Define a speakers file if this is a \
         multi-speaker model or remove the speaker name."
    )]
    SpeakerNotSupported(String),
    #[error(
        "This is a multi-speaker model. You need to define either a `speaker_name` or a \
         `speaker_wav`."
    )]
    SpeakerRequired,
    #[error("Speaker '{0}' is not known to this model")]
    UnknownSpeaker(String),
    #[error("This is a multi-lingual model. You need to define a `language_name`.")]
    LanguageRequired,
    #[error("Language '{0}' is not known to this model")]
    UnknownLanguage(String),
    #[error("Model '{0}' is not loaded")]
    ModelNotLoaded(String),
    #[error("Unknown model type '{0}'")]
    UnknownModelType(String),
    #[error("Operation not supported by this model: {0}")]
    Unsupported(String),
    #[error("Model produced neither a waveform nor a spectrogram")]
    NoWaveform,
    #[error("A vocoder is configured but the model produced no spectrogram")]
    NoSpectrogram,
    #[error("Invalid model config {path}: {message}")]
    Config { path: PathBuf, message: String },
    #[error("Model output has unexpected shape {0:?}")]
    OutputShape(Vec<usize>),
    #[error("Phonemization failed: {0}")]
    Phonemizer(String),
    #[error("ONNX runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The eight path slots describing one model on disk. Model weights and
/// config are mandatory; the rest are optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ModelSpec {
    pub model: PathBuf,
    pub config: PathBuf,
    #[serde(default)]
    pub speakers: Option<PathBuf>,
    #[serde(default)]
    pub language_ids: Option<PathBuf>,
    #[serde(default)]
    pub vocoder: Option<PathBuf>,
    #[serde(default)]
    pub vocoder_config: Option<PathBuf>,
    #[serde(default)]
    pub encoder: Option<PathBuf>,
    #[serde(default)]
    pub encoder_config: Option<PathBuf>,
}

impl ModelSpec {
    pub fn new(model: impl Into<PathBuf>, config: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            config: config.into(),
            ..Self::default()
        }
    }

    /// Joins every slot onto `root`. Absolute slots are left as they are.
    pub fn resolve(&self, root: &Path) -> ModelPaths {
        let join = |p: &Option<PathBuf>| p.as_ref().map(|p| root.join(p));
        ModelPaths {
            model: root.join(&self.model),
            config: root.join(&self.config),
            speakers: join(&self.speakers),
            language_ids: join(&self.language_ids),
            vocoder: join(&self.vocoder),
            vocoder_config: join(&self.vocoder_config),
            encoder: join(&self.encoder),
            encoder_config: join(&self.encoder_config),
        }
    }
}

/// A named set of model specs sharing one root directory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelSpecs {
    pub root: PathBuf,
    #[serde(default)]
    pub models: BTreeMap<String, ModelSpec>,
}

impl ModelSpecs {
    pub fn single(root: impl Into<PathBuf>, name: &str, spec: ModelSpec) -> Self {
        let mut models = BTreeMap::new();
        models.insert(name.to_string(), spec);
        Self {
            root: root.into(),
            models,
        }
    }

    /// Spec for an exported model of `model_type` under `dir`, using the
    /// conventional `model_file.onnx` and `config.json` names.
    pub fn for_model_type(model_type: &str, dir: &Path) -> Result<Self, SynthError> {
        match model_type {
            "vits" => Ok(Self::single(
                dir,
                model_type,
                ModelSpec::new("model_file.onnx", "config.json"),
            )),
            "capacitron" => Err(SynthError::Unsupported(
                "Capacitron support is not yet implemented".to_string(),
            )),
            other => Err(SynthError::UnknownModelType(other.to_string())),
        }
    }

    /// Finds the model and config in a voice directory. When several match,
    /// the last in name order wins.
    pub fn discover(name: &str, dir: &Path) -> Result<Self, SynthError> {
        let config_error = |message: &str| SynthError::Config {
            path: dir.to_path_buf(),
            message: message.to_string(),
        };
        if !dir.is_dir() {
            return Err(config_error("Model Path Does Not Exist"));
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        let last_with = |ext: &str| {
            files
                .iter()
                .filter(|p| p.extension().is_some_and(|e| e == ext))
                .last()
                .and_then(|p| p.file_name())
                .map(PathBuf::from)
        };

        let model = last_with("onnx").ok_or_else(|| config_error("no .onnx model found"))?;
        let config = last_with("json").ok_or_else(|| config_error("no .json config found"))?;
        Ok(Self::single(dir, name, ModelSpec::new(model, config)))
    }
}

/// [`ModelSpec`] after resolution against the model root.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPaths {
    pub model: PathBuf,
    pub config: PathBuf,
    pub speakers: Option<PathBuf>,
    pub language_ids: Option<PathBuf>,
    pub vocoder: Option<PathBuf>,
    pub vocoder_config: Option<PathBuf>,
    pub encoder: Option<PathBuf>,
    pub encoder_config: Option<PathBuf>,
}

/// Speaker and language conditioning for one inference call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conditioning {
    pub speaker_id: Option<i64>,
    pub language_id: Option<i64>,
    pub d_vector: Option<Vec<f32>>,
    pub style_wav: Option<PathBuf>,
}

/// What an acoustic model hands back for one sentence. End-to-end models
/// fill `waveform`; spectrogram models fill `mel` with normalised frames.
#[derive(Debug, Clone, Default)]
pub struct AcousticOutput {
    pub waveform: Option<Vec<f32>>,
    pub mel: Option<Mel>,
}

/// Trait that all acoustic models must implement.
pub trait AcousticModel: Send {
    /// Architecture name from the model config (e.g. "vits")
    fn arch(&self) -> &str;

    fn audio(&self) -> &AudioConfig;

    /// Top-level `do_trim_silence` from the config; `None` when absent.
    fn do_trim_silence(&self) -> Option<bool>;

    fn use_d_vector_file(&self) -> bool;

    fn speaker_manager(&self) -> Option<&SpeakerManager>;

    fn language_manager(&self) -> Option<&LanguageManager>;

    fn split_into_sentences(&self, text: &str) -> Vec<String> {
        crate::text::split_into_sentences(text)
    }

    fn infer(&self, sentence: &str, cond: &Conditioning) -> Result<AcousticOutput, SynthError>;

    /// Re-voices `reference` from the reference speaker into the target one.
    fn transfer_voice(
        &self,
        _reference: &Path,
        _target: &Conditioning,
        _source: &Conditioning,
    ) -> Result<AcousticOutput, SynthError> {
        Err(SynthError::Unsupported(format!(
            "voice conversion ({})",
            self.arch()
        )))
    }

    /// Computes a d-vector from a speaker clip.
    fn compute_embedding_from_clip(&self, _clip: &Path) -> Result<Vec<f32>, SynthError> {
        Err(SynthError::Unsupported(format!(
            "speaker encoder ({})",
            self.arch()
        )))
    }
}

/// Trait for neural vocoders turning normalised frames into samples.
pub trait Vocoder: Send {
    fn audio(&self) -> &AudioConfig;

    fn infer(&self, mel: &Mel) -> Result<Vec<f32>, SynthError>;
}

/// A loaded model: acoustic model, optional vocoder and the files it was
/// configured with.
pub struct Synthesizer {
    pub tts: Box<dyn AcousticModel>,
    pub vocoder: Option<Box<dyn Vocoder>>,
    pub speakers_file: Option<PathBuf>,
    pub languages_file: Option<PathBuf>,
    pub use_cuda: bool,
}

impl Synthesizer {
    pub fn new(tts: Box<dyn AcousticModel>) -> Self {
        Self {
            tts,
            vocoder: None,
            speakers_file: None,
            languages_file: None,
            use_cuda: false,
        }
    }

    pub fn with_vocoder(mut self, vocoder: Box<dyn Vocoder>) -> Self {
        self.vocoder = Some(vocoder);
        self
    }

    pub fn is_multi_speaker(&self) -> bool {
        self.speakers_file.is_some() || self.tts.speaker_manager().is_some()
    }

    pub fn is_multi_lingual(&self) -> bool {
        self.languages_file.is_some() || self.tts.language_manager().is_some()
    }

    /// Sample rate of the produced audio: the vocoder's when one is present.
    pub fn output_sample_rate(&self) -> u32 {
        self.vocoder
            .as_ref()
            .map(|v| v.audio().sample_rate)
            .unwrap_or_else(|| self.tts.audio().sample_rate)
    }
}

/// Builds a [`Synthesizer`] from resolved paths.
pub trait ModelLoader {
    fn load(&self, paths: &ModelPaths, use_cuda: bool) -> Result<Synthesizer, SynthError>;
}
