use config::{Config, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    // Synthesis
    pub output_path: PathBuf,
    pub use_cuda: bool,
    pub voice: String,
    pub voices: BTreeMap<String, PathBuf>,
    pub sentence_gap_samples: usize,
    pub clean_text: bool,
    // Phonemiser
    pub espeak_binary: String,
    pub espeak_timeout_secs: u64,
    // HTTP front end
    pub http_host: String,
    pub http_port: u16,
    pub static_dir: PathBuf,
    pub index_template: PathBuf,
    // Websocket front end
    pub wss_host: String,
    pub wss_port: u16,
    // Audio devices
    pub output_device: Option<String>,
    pub sample_rate: Option<u32>,
    pub blocksize: Option<u32>,
    // Listen front end
    pub vosk_model_path: PathBuf,
    pub listen_queue_capacity: usize,
    pub capture_buffer_ms: u64,
    pub display_interval_ms: u64,
    // Logging
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("tmp/wav"),
            use_cuda: false,
            voice: "effiamir".to_string(),
            voices: default_voices(),
            sentence_gap_samples: 10_000,
            clean_text: false,
            espeak_binary: "espeak-ng".to_string(),
            espeak_timeout_secs: 5,
            http_host: "0.0.0.0".to_string(),
            http_port: 3000,
            static_dir: PathBuf::from("static"),
            index_template: PathBuf::from("templates/index.html"),
            wss_host: "127.0.0.1".to_string(),
            wss_port: 8765,
            output_device: None,
            sample_rate: None,
            blocksize: None,
            vosk_model_path: PathBuf::from("models/vosk"),
            listen_queue_capacity: 64,
            capture_buffer_ms: 2000,
            display_interval_ms: 100,
            log_filter: "info".to_string(),
        }
    }
}

fn default_voices() -> BTreeMap<String, PathBuf> {
    [
        ("effiamir", "../outputs/checkpoints/efam48_220k/"),
        ("amir", "../outputs/checkpoints/hf54-50_amir50_300k/"),
        ("effi", "../outputs/checkpoints/effi50_160k/"),
    ]
    .into_iter()
    .map(|(name, path)| (name.to_string(), PathBuf::from(path)))
    .collect()
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder()
            // Connect to defaults
            .set_default("output_path", "tmp/wav")?
            .set_default("use_cuda", false)?
            .set_default("voice", "effiamir")?
            .set_default("sentence_gap_samples", 10_000)?
            .set_default("clean_text", false)?
            .set_default("espeak_binary", "espeak-ng")?
            .set_default("espeak_timeout_secs", 5)?
            // HTTP defaults
            .set_default("http_host", "0.0.0.0")?
            .set_default("http_port", 3000)?
            .set_default("static_dir", "static")?
            .set_default("index_template", "templates/index.html")?
            // Websocket defaults
            .set_default("wss_host", "127.0.0.1")?
            .set_default("wss_port", 8765)?
            // Listen defaults
            .set_default("vosk_model_path", "models/vosk")?
            .set_default("listen_queue_capacity", 64)?
            .set_default("capture_buffer_ms", 2000)?
            .set_default("display_interval_ms", 100)?
            .set_default("log_filter", "info")?;

        for (name, path) in default_voices() {
            builder = builder.set_default(
                format!("voices.{}", name).as_str(),
                path.to_string_lossy().to_string(),
            )?;
        }

        let mut builder = builder
            // Merge with local config file (if exists)
            .add_source(File::with_name("Shibboleth").required(false));

        if let Some(config_dir) = dirs::config_dir() {
            let user_file = config_dir.join("shibboleth").join("Shibboleth");
            builder = builder.add_source(
                File::with_name(&user_file.to_string_lossy()).required(false),
            );
        }

        // Merge with environment variables (e.g. SHIBBOLETH_HTTP_PORT)
        let builder = builder.add_source(config::Environment::with_prefix("SHIBBOLETH"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.listen_queue_capacity == 0 {
            return Err(config::ConfigError::Message(
                "listen_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.display_interval_ms == 0 {
            return Err(config::ConfigError::Message(
                "display_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.capture_buffer_ms < 100 {
            return Err(config::ConfigError::Message(format!(
                "Invalid capture_buffer_ms: {}. Must be at least 100",
                self.capture_buffer_ms
            )));
        }
        if let Some(rate) = self.sample_rate {
            if rate == 0 {
                return Err(config::ConfigError::Message(
                    "sample_rate must be positive".to_string(),
                ));
            }
        }
        if self.espeak_timeout_secs == 0 {
            return Err(config::ConfigError::Message(
                "espeak_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory of the named voice, if the voice table knows it.
    pub fn voice_path(&self, voice: &str) -> Option<&PathBuf> {
        self.voices.get(voice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_config_load() {
        let settings = Settings::new().expect("Failed to load settings");
        assert!(settings.listen_queue_capacity > 0);
        assert_eq!(settings.sentence_gap_samples, 10_000);
        assert!(settings.voice_path("effiamir").is_some());
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("SHIBBOLETH_HTTP_PORT", "4000");
        let settings = Settings::new();
        std::env::remove_var("SHIBBOLETH_HTTP_PORT");
        assert_eq!(settings.expect("Failed to load settings").http_port, 4000);
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let settings = Settings {
            listen_queue_capacity: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_sample_rate() {
        let settings = Settings {
            sample_rate: Some(0),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
        assert!(Settings::default().validate().is_ok());
    }
}
