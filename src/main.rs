//! shibboleth - speak text through a neural TTS voice from the command
//! line, over HTTP, over a websocket, or in reply to the microphone.

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use shibboleth::audio;
use shibboleth::config_loader::Settings;
use shibboleth::devices::{input_devices, output_devices, DeviceInfo};
use shibboleth::engine::{AudioEngine, AudioOutput};
use shibboleth::listen::{self, ListenOptions};
use shibboleth::models::onnx::OnnxLoader;
use shibboleth::models::ModelSpecs;
use shibboleth::speaker::Speaker;
use shibboleth::synth::{SynthesisOptions, VoiceSynth};
use shibboleth::{web, wss};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Voice synthesis demo
#[derive(Parser)]
#[command(name = "shibboleth")]
#[command(version)]
#[command(about = "Speak text through a neural TTS voice", long_about = None)]
struct Cli {
    #[command(flatten)]
    audio: AudioArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct AudioArgs {
    /// Output audio device (numeric ID or substring)
    #[arg(short = 'd', long, global = true)]
    output_device: Option<String>,
    /// Playback sampling rate
    #[arg(short = 'r', long, global = true)]
    samplerate: Option<u32>,
    /// Capture blocksize in frames
    #[arg(short, long, global = true)]
    blocksize: Option<u32>,
    /// Audio write / temp file output directory
    #[arg(long, global = true)]
    output_path: Option<PathBuf>,
    /// Run models on CUDA
    #[arg(long, global = true)]
    use_cuda: bool,
}

#[derive(Args)]
struct ModelArgs {
    /// The voice to use (a name from the configured voice table)
    #[arg(short, long)]
    voice: Option<String>,
    /// Directory holding the model (.onnx) and its config (.json)
    #[arg(long)]
    model_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesize one line of text and play it
    Say {
        /// Text to speak
        #[arg(long)]
        text: String,
        /// Model directory (model_file.onnx and config.json)
        #[arg(long)]
        model_path: PathBuf,
        /// vits | capacitron
        #[arg(long, default_value = "vits")]
        model_type: String,
        /// Audio write / output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Serve a page and a JSON endpoint that speaks posted text
    Web {
        #[command(flatten)]
        model: ModelArgs,
    },

    /// Speak every websocket text frame and echo it back
    Wss {
        #[command(flatten)]
        model: ModelArgs,
        /// Speak a test paragraph before serving
        #[arg(long)]
        test: bool,
    },

    /// Transcribe the microphone and speak what was heard
    Listen {
        #[command(flatten)]
        model: ModelArgs,
        /// No synthesis, transcripts only
        #[arg(long)]
        input_only: bool,
        /// Input audio device (numeric ID or substring)
        #[arg(long)]
        input_device: Option<String>,
        /// Print transcript events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Play a WAV file on the output device
    Play {
        /// WAV file to play
        wav: PathBuf,
    },

    /// List audio devices
    Devices {
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn apply_overrides(settings: &mut Settings, args: &AudioArgs) {
    if let Some(device) = &args.output_device {
        settings.output_device = Some(device.clone());
    }
    if let Some(rate) = args.samplerate {
        settings.sample_rate = Some(rate);
    }
    if let Some(blocksize) = args.blocksize {
        settings.blocksize = Some(blocksize);
    }
    if let Some(path) = &args.output_path {
        settings.output_path = path.clone();
    }
    if args.use_cuda {
        settings.use_cuda = true;
    }
}

fn open_output(settings: &Settings) -> Result<AudioEngine> {
    let engine = AudioEngine::new(settings.output_device.as_deref())?;
    Ok(match settings.sample_rate {
        Some(rate) => {
            info!("Set sample rate to: {}", rate);
            engine.with_sample_rate(rate)
        }
        None => engine,
    })
}

fn new_voice_synth(settings: &Settings, specs: &ModelSpecs) -> Result<VoiceSynth> {
    let loader = OnnxLoader::new(
        &settings.espeak_binary,
        Duration::from_secs(settings.espeak_timeout_secs),
    );
    let mut synth = VoiceSynth::new(&settings.output_path, settings.use_cuda)?
        .with_sentence_gap(settings.sentence_gap_samples);
    synth
        .load_models(specs, &loader)
        .context("Failed to load models")?;
    Ok(synth)
}

fn synthesis_options(settings: &Settings) -> SynthesisOptions {
    SynthesisOptions {
        clean_text: settings.clean_text,
        ..SynthesisOptions::default()
    }
}

fn build_speaker(settings: &Settings, model: &ModelArgs) -> Result<Arc<Speaker>> {
    let voice = model.voice.clone().unwrap_or_else(|| settings.voice.clone());
    let dir = match &model.model_path {
        Some(path) => path.clone(),
        None => {
            let path = settings
                .voice_path(&voice)
                .ok_or_else(|| anyhow!("Unknown voice '{}'", voice))?;
            info!(
                "No model_path specified, using voice '{}': {}",
                voice,
                path.display()
            );
            path.clone()
        }
    };

    let specs = ModelSpecs::discover(&voice, &dir)?;
    let synth = new_voice_synth(settings, &specs)?;
    let output: Arc<dyn AudioOutput> = Arc::new(open_output(settings)?);
    info!("Using Device Sample Rate: {}", output.sample_rate());

    Ok(Arc::new(Speaker::new(
        synth,
        output,
        &voice,
        synthesis_options(settings),
    )))
}

fn say(
    settings: &Settings,
    text: &str,
    model_path: PathBuf,
    model_type: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut settings = settings.clone();
    if let Some(output) = output {
        settings.output_path = output;
    }
    let specs = ModelSpecs::for_model_type(model_type, &model_path)?;
    let synth = new_voice_synth(&settings, &specs)?;

    info!("Generating: >>{}<<", text);
    let filename = format!("{}_testoutput.wav", model_type);
    let result = synth.synthesize(text, &filename, model_type, &synthesis_options(&settings))?;
    println!("{}", result.path.display());

    let engine = open_output(&settings)?;
    engine.play_blocking(result.wav, result.sample_rate)?;
    println!("...DONE...");
    Ok(())
}

fn play(settings: &Settings, wav: &Path) -> Result<()> {
    let (samples, rate) =
        audio::load_wav(wav).with_context(|| format!("Failed to read {}", wav.display()))?;
    let engine = open_output(settings)?;
    let device_rate = engine.sample_rate();
    let samples = if rate != device_rate {
        info!("Resampling from {} to {}", rate, device_rate);
        audio::resample(&samples, rate, device_rate)
    } else {
        samples
    };
    engine.play_blocking(samples, device_rate)?;
    Ok(())
}

fn print_devices(json: bool) -> Result<()> {
    let outputs = output_devices();
    let inputs = input_devices();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "output": outputs,
                "input": inputs,
            }))?
        );
        return Ok(());
    }

    let print = |title: &str, devices: &[DeviceInfo]| {
        println!("{}:", title);
        for d in devices {
            let marker = if d.is_default { '*' } else { ' ' };
            let rate = d
                .default_sample_rate
                .map(|r| format!("{} Hz", r))
                .unwrap_or_else(|| "-".to_string());
            println!("{} {:>3} {} ({})", marker, d.index, d.name, rate);
        }
    };
    print("Output devices", &outputs);
    print("Input devices", &inputs);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::new().context("Failed to load settings")?;
    apply_overrides(&mut settings, &cli.audio);
    settings.validate()?;
    init_tracing(&settings.log_filter);

    match cli.command {
        Commands::Say {
            text,
            model_path,
            model_type,
            output,
        } => {
            tokio::task::spawn_blocking(move || {
                say(&settings, &text, model_path, &model_type, output)
            })
            .await??;
        }
        Commands::Web { model } => {
            let speaker = build_speaker(&settings, &model)?;
            web::serve(speaker, &settings).await?;
        }
        Commands::Wss { model, test } => {
            let speaker = build_speaker(&settings, &model)?;
            wss::serve(speaker, &settings, test).await?;
        }
        Commands::Listen {
            model,
            input_only,
            input_device,
            json,
        } => {
            let speaker = if input_only {
                None
            } else {
                Some(build_speaker(&settings, &model)?)
            };
            listen::run(speaker, &settings, ListenOptions { input_device, json }).await?;
        }
        Commands::Play { wav } => {
            tokio::task::spawn_blocking(move || play(&settings, &wav)).await??;
        }
        Commands::Devices { json } => print_devices(json)?,
    }

    Ok(())
}
