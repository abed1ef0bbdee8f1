//! `config.json` as written next to a trained model.

use super::SynthError;
use crate::audio::AudioConfig;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub model: String,
    pub audio: AudioConfig,
    pub characters: Option<CharactersConfig>,
    pub use_phonemes: bool,
    pub phoneme_language: Option<String>,
    pub add_blank: bool,
    pub text_cleaner: Option<String>,
    pub enable_eos_bos_chars: bool,
    pub use_d_vector_file: bool,
    pub model_args: ModelArgs,
    /// Top-level flag; most configs only carry `audio.do_trim_silence`.
    pub do_trim_silence: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelArgs {
    pub use_d_vector_file: bool,
    pub inference_noise_scale: f32,
    pub length_scale: f32,
    pub inference_noise_scale_dp: f32,
}

impl Default for ModelArgs {
    fn default() -> Self {
        Self {
            use_d_vector_file: false,
            inference_noise_scale: 0.667,
            length_scale: 1.0,
            inference_noise_scale_dp: 0.8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CharactersConfig {
    pub characters_class: Option<String>,
    pub pad: Option<String>,
    pub eos: Option<String>,
    pub bos: Option<String>,
    pub blank: Option<String>,
    pub characters: String,
    pub punctuations: String,
    pub phonemes: Option<String>,
    pub is_unique: bool,
    pub is_sorted: bool,
}

impl Default for CharactersConfig {
    fn default() -> Self {
        Self {
            characters_class: None,
            pad: Some("<PAD>".to_string()),
            eos: Some("<EOS>".to_string()),
            bos: Some("<BOS>".to_string()),
            blank: Some("<BLNK>".to_string()),
            characters: "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz".to_string(),
            punctuations: "!'(),-.:;? ".to_string(),
            phonemes: None,
            is_unique: false,
            is_sorted: true,
        }
    }
}

impl TtsConfig {
    pub fn load(path: &Path) -> Result<Self, SynthError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content).map_err(|e| SynthError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn parse(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    pub fn uses_d_vectors(&self) -> bool {
        self.use_d_vector_file || self.model_args.use_d_vector_file
    }

    /// End-to-end architectures produce a waveform without a vocoder.
    pub fn is_end_to_end(&self) -> bool {
        matches!(self.model.to_lowercase().as_str(), "vits" | "vits2" | "xtts")
    }
}

/// Config of a vocoder or speaker encoder: only the audio section matters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AudioOnlyConfig {
    pub audio: AudioConfig,
}

impl AudioOnlyConfig {
    pub fn load(path: &Path) -> Result<Self, SynthError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| SynthError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vits_config() {
        let cfg = TtsConfig::parse(
            r#"{
                "model": "vits",
                "audio": {"sample_rate": 24000, "win_length": 1024, "hop_length": 256},
                "use_phonemes": true,
                "phoneme_language": "en-us",
                "add_blank": true,
                "text_cleaner": "phoneme_cleaners",
                "model_args": {"use_d_vector_file": true, "length_scale": 1.2},
                "characters": {
                    "characters_class": "TTS.tts.models.vits.VitsCharacters",
                    "pad": "_", "eos": "", "bos": "", "blank": null,
                    "characters": "abc", "punctuations": "!. ", "phonemes": "ɐɑ"
                }
            }"#,
        )
        .unwrap();
        assert!(cfg.is_end_to_end());
        assert!(cfg.uses_d_vectors());
        assert_eq!(cfg.audio.sample_rate, 24000);
        assert_eq!(cfg.model_args.length_scale, 1.2);
        assert_eq!(cfg.model_args.inference_noise_scale, 0.667);
        assert_eq!(cfg.do_trim_silence, None);
        let chars = cfg.characters.unwrap();
        assert_eq!(chars.blank, None);
        assert_eq!(chars.phonemes.as_deref(), Some("ɐɑ"));
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let cfg = TtsConfig::parse(r#"{"model": "glow_tts", "do_trim_silence": true}"#).unwrap();
        assert!(!cfg.is_end_to_end());
        assert_eq!(cfg.do_trim_silence, Some(true));
        assert_eq!(cfg.audio.sample_rate, 22050);
        assert!(cfg.characters.is_none());
    }

    #[test]
    fn test_load_reports_path_on_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        match TtsConfig::load(&path) {
            Err(SynthError::Config { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected config error, got {:?}", other.map(|_| ())),
        }
    }
}
