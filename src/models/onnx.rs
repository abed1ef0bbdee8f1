//! ONNX Runtime backed models.
//!
//! Graph contracts:
//!
//! | Graph        | Inputs                                                   | Output          |
//! |--------------|----------------------------------------------------------|-----------------|
//! | end-to-end   | `input` `[1,T]` i64, `input_lengths` `[1]`, `scales` `[3]`, opt. `sid`, `langid`, `d_vector` | waveform |
//! | spectrogram  | same token inputs                                        | `[1, T, C]` mel |
//! | vocoder      | `[1, C, T]` f32                                          | waveform        |
//! | encoder      | `[1, N]` f32 waveform                                    | `[1, D]`        |

use super::config::{AudioOnlyConfig, TtsConfig};
use super::espeak::EspeakPhonemizer;
use super::tokenizer::TtsTokenizer;
use super::{
    AcousticModel, AcousticOutput, Conditioning, LanguageManager, ModelLoader, ModelPaths,
    SpeakerManager, SynthError, Synthesizer, Vocoder,
};
use crate::audio::{self, AudioConfig, Mel};
use ndarray::{Array1, Array2, Array3};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputValue};
use ort::value::TensorRef;
use std::borrow::Cow;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

type SessionInputs<'a> = Vec<(Cow<'a, str>, SessionInputValue<'a>)>;

/// Initialize an ONNX session, registering CUDA when requested and compiled in.
fn init_session(path: &Path, use_cuda: bool) -> Result<Session, SynthError> {
    #[allow(unused_mut)]
    let mut builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    if use_cuda {
        #[cfg(feature = "cuda")]
        {
            use ort::execution_providers::CUDAExecutionProvider;
            builder = builder.with_execution_providers([CUDAExecutionProvider::default().build()])?;
        }
        #[cfg(not(feature = "cuda"))]
        tracing::warn!("CUDA requested but built without the `cuda` feature; running on CPU");
    }

    tracing::info!("Loading ONNX graph {}", path.display());
    Ok(builder.commit_from_file(path)?)
}

fn input_names(session: &Session) -> HashSet<String> {
    session
        .inputs()
        .iter()
        .map(|input| input.name().to_string())
        .collect()
}

/// Runs `session` and copies out the first output with its shape.
fn run_first_output(
    session: &Mutex<Session>,
    inputs: SessionInputs<'_>,
) -> Result<(Vec<usize>, Vec<f32>), SynthError> {
    let mut session = session
        .lock()
        .map_err(|_| SynthError::Unsupported("session lock poisoned".to_string()))?;
    let outputs = session.run(inputs)?;
    let (_, value) = outputs
        .iter()
        .next()
        .ok_or_else(|| SynthError::Ort(ort::Error::new("No output from model")))?;
    let array = value.try_extract_array::<f32>()?;
    Ok((array.shape().to_vec(), array.iter().copied().collect()))
}

/// Optional inputs an acoustic graph may be fed next to `input`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphInput {
    Lengths,
    Scales,
    Speaker,
    Language,
    DVector,
}

impl GraphInput {
    pub fn name(self) -> &'static str {
        match self {
            GraphInput::Lengths => "input_lengths",
            GraphInput::Scales => "scales",
            GraphInput::Speaker => "sid",
            GraphInput::Language => "langid",
            GraphInput::DVector => "d_vector",
        }
    }
}

/// Picks the optional inputs to bind for `cond`. Lengths and scales are fed
/// only when the graph declares them; conditioning the graph does not
/// declare is an error.
pub fn plan_inputs(
    declared: &HashSet<String>,
    cond: &Conditioning,
) -> Result<Vec<GraphInput>, SynthError> {
    let mut plan: Vec<GraphInput> = [GraphInput::Lengths, GraphInput::Scales]
        .into_iter()
        .filter(|input| declared.contains(input.name()))
        .collect();

    let wanted = [
        (GraphInput::Speaker, cond.speaker_id.is_some(), "speaker"),
        (GraphInput::Language, cond.language_id.is_some(), "language"),
        (GraphInput::DVector, cond.d_vector.is_some(), "d-vector"),
    ];
    for (input, requested, what) in wanted {
        if !requested {
            continue;
        }
        if !declared.contains(input.name()) {
            return Err(SynthError::Unsupported(format!(
                "{} conditioning: graph has no `{}` input",
                what,
                input.name()
            )));
        }
        plan.push(input);
    }
    Ok(plan)
}

/// Interprets the first output of an acoustic graph: the waveform for
/// end-to-end models, `[1, T, C]` frames otherwise.
pub fn acoustic_output(
    end_to_end: bool,
    shape: Vec<usize>,
    data: Vec<f32>,
) -> Result<AcousticOutput, SynthError> {
    if end_to_end {
        return Ok(AcousticOutput {
            waveform: Some(data),
            mel: None,
        });
    }
    let mel = match shape.as_slice() {
        [1, frames, channels] => Mel::new(*frames, *channels, data),
        _ => None,
    };
    match mel {
        Some(mel) => Ok(AcousticOutput {
            waveform: None,
            mel: Some(mel),
        }),
        None => Err(SynthError::OutputShape(shape)),
    }
}

pub struct OnnxTts {
    session: Mutex<Session>,
    inputs: HashSet<String>,
    config: TtsConfig,
    tokenizer: TtsTokenizer,
    speakers: Option<SpeakerManager>,
    languages: Option<LanguageManager>,
    encoder: Option<OnnxEncoder>,
}

impl OnnxTts {
    pub fn load(
        paths: &ModelPaths,
        use_cuda: bool,
        phonemizer: EspeakPhonemizer,
    ) -> Result<Self, SynthError> {
        let config = TtsConfig::load(&paths.config)?;
        let session = init_session(&paths.model, use_cuda)?;
        let inputs = input_names(&session);
        tracing::debug!("Model {} declares inputs {:?}", config.model, inputs);

        let speakers = paths
            .speakers
            .as_deref()
            .map(SpeakerManager::load)
            .transpose()?;
        let languages = paths
            .language_ids
            .as_deref()
            .map(LanguageManager::load)
            .transpose()?;
        let encoder = match (&paths.encoder, &paths.encoder_config) {
            (Some(model), Some(cfg)) => Some(OnnxEncoder::load(model, cfg, use_cuda)?),
            (Some(model), None) => {
                tracing::warn!(
                    "Encoder {} given without a config; speaker clips are disabled",
                    model.display()
                );
                None
            }
            _ => None,
        };

        Ok(Self {
            session: Mutex::new(session),
            inputs,
            tokenizer: TtsTokenizer::from_config(&config, phonemizer),
            config,
            speakers,
            languages,
            encoder,
        })
    }

    fn language_name(&self, id: Option<i64>) -> Option<&str> {
        self.languages.as_ref()?.name(id?)
    }
}

impl AcousticModel for OnnxTts {
    fn arch(&self) -> &str {
        &self.config.model
    }

    fn audio(&self) -> &AudioConfig {
        &self.config.audio
    }

    fn do_trim_silence(&self) -> Option<bool> {
        self.config.do_trim_silence
    }

    fn use_d_vector_file(&self) -> bool {
        self.config.uses_d_vectors()
    }

    fn speaker_manager(&self) -> Option<&SpeakerManager> {
        self.speakers.as_ref()
    }

    fn language_manager(&self) -> Option<&LanguageManager> {
        self.languages.as_ref()
    }

    fn infer(&self, sentence: &str, cond: &Conditioning) -> Result<AcousticOutput, SynthError> {
        let ids = self
            .tokenizer
            .text_to_ids(sentence, self.language_name(cond.language_id))?;
        if ids.is_empty() {
            tracing::warn!("No tokens produced for sentence: {:?}", sentence);
            return Ok(AcousticOutput {
                waveform: Some(Vec::new()),
                mel: None,
            });
        }
        if cond.style_wav.is_some() {
            tracing::warn!("Style clips are not supported by ONNX graphs; ignoring");
        }

        let len = ids.len();
        let tokens = Array2::from_shape_vec((1, len), ids)?;
        let lengths = Array1::from_vec(vec![len as i64]);
        let args = &self.config.model_args;
        let scales = Array1::from_vec(vec![
            args.inference_noise_scale,
            args.length_scale,
            args.inference_noise_scale_dp,
        ]);

        let sid = cond.speaker_id.map(|id| Array1::from_vec(vec![id]));
        let langid = cond.language_id.map(|id| Array1::from_vec(vec![id]));
        let d_vector = match &cond.d_vector {
            Some(v) => Some(Array2::from_shape_vec((1, v.len()), v.clone())?),
            None => None,
        };

        let mut inputs: SessionInputs<'_> = vec![(
            "input".into(),
            SessionInputValue::from(TensorRef::from_array_view(tokens.view())?),
        )];
        for input in plan_inputs(&self.inputs, cond)? {
            let value: SessionInputValue<'_> = match input {
                GraphInput::Lengths => TensorRef::from_array_view(lengths.view())?.into(),
                GraphInput::Scales => TensorRef::from_array_view(scales.view())?.into(),
                GraphInput::Speaker => match &sid {
                    Some(sid) => TensorRef::from_array_view(sid.view())?.into(),
                    None => continue,
                },
                GraphInput::Language => match &langid {
                    Some(langid) => TensorRef::from_array_view(langid.view())?.into(),
                    None => continue,
                },
                GraphInput::DVector => match &d_vector {
                    Some(d_vector) => TensorRef::from_array_view(d_vector.view())?.into(),
                    None => continue,
                },
            };
            inputs.push((input.name().into(), value));
        }

        let (shape, data) = run_first_output(&self.session, inputs)?;
        acoustic_output(self.config.is_end_to_end(), shape, data)
    }

    fn compute_embedding_from_clip(&self, clip: &Path) -> Result<Vec<f32>, SynthError> {
        match &self.encoder {
            Some(encoder) => encoder.embed_clip(clip),
            None => Err(SynthError::Unsupported(
                "speaker clip given but no speaker encoder is configured".to_string(),
            )),
        }
    }
}

pub struct OnnxVocoder {
    session: Mutex<Session>,
    input_name: String,
    audio: AudioConfig,
}

impl OnnxVocoder {
    pub fn load(model: &Path, config: &Path, use_cuda: bool) -> Result<Self, SynthError> {
        let audio = AudioOnlyConfig::load(config)?.audio;
        let session = init_session(model, use_cuda)?;
        let input_name = session
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .unwrap_or_else(|| "c".to_string());
        Ok(Self {
            session: Mutex::new(session),
            input_name,
            audio,
        })
    }
}

impl Vocoder for OnnxVocoder {
    fn audio(&self) -> &AudioConfig {
        &self.audio
    }

    fn infer(&self, mel: &Mel) -> Result<Vec<f32>, SynthError> {
        let input = Array3::from_shape_vec((1, mel.channels, mel.frames), mel.transposed())?;
        let inputs: SessionInputs<'_> = vec![(
            Cow::from(self.input_name.as_str()),
            SessionInputValue::from(TensorRef::from_array_view(input.view())?),
        )];
        let (_, samples) = run_first_output(&self.session, inputs)?;
        Ok(samples)
    }
}

pub struct OnnxEncoder {
    session: Mutex<Session>,
    input_name: String,
    sample_rate: u32,
}

impl OnnxEncoder {
    pub fn load(model: &Path, config: &Path, use_cuda: bool) -> Result<Self, SynthError> {
        let sample_rate = AudioOnlyConfig::load(config)?.audio.sample_rate;
        let session = init_session(model, use_cuda)?;
        let input_name = session
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .unwrap_or_else(|| "x".to_string());
        Ok(Self {
            session: Mutex::new(session),
            input_name,
            sample_rate,
        })
    }

    pub fn embed_clip(&self, clip: &Path) -> Result<Vec<f32>, SynthError> {
        let (samples, rate) = audio::load_wav(clip)?;
        let samples = audio::resample(&samples, rate, self.sample_rate);
        let len = samples.len();
        let input = Array2::from_shape_vec((1, len), samples)?;
        let inputs: SessionInputs<'_> = vec![(
            Cow::from(self.input_name.as_str()),
            SessionInputValue::from(TensorRef::from_array_view(input.view())?),
        )];
        let (_, embedding) = run_first_output(&self.session, inputs)?;
        Ok(embedding)
    }
}

/// Builds synthesizers from ONNX graphs and their JSON configs.
#[derive(Debug, Clone, Default)]
pub struct OnnxLoader {
    phonemizer: EspeakPhonemizer,
}

impl OnnxLoader {
    pub fn new(espeak_binary: &str, espeak_timeout: Duration) -> Self {
        Self {
            phonemizer: EspeakPhonemizer::new(espeak_binary, espeak_timeout),
        }
    }
}

impl ModelLoader for OnnxLoader {
    fn load(&self, paths: &ModelPaths, use_cuda: bool) -> Result<Synthesizer, SynthError> {
        let tts = OnnxTts::load(paths, use_cuda, self.phonemizer.clone())?;

        let vocoder: Option<Box<dyn Vocoder>> = match (&paths.vocoder, &paths.vocoder_config) {
            (Some(model), Some(cfg)) => Some(Box::new(OnnxVocoder::load(model, cfg, use_cuda)?)),
            (Some(model), None) => {
                return Err(SynthError::Config {
                    path: model.clone(),
                    message: "vocoder given without a vocoder config".to_string(),
                })
            }
            _ => None,
        };

        Ok(Synthesizer {
            tts: Box::new(tts),
            vocoder,
            speakers_file: paths.speakers.clone(),
            languages_file: paths.language_ids.clone(),
            use_cuda,
        })
    }
}
