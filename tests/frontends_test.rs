mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{FakeTts, SAMPLES_PER_CHAR};
use mockall::predicate::eq;
use shibboleth::config_loader::Settings;
use shibboleth::engine::{AudioOutput, EngineError};
use shibboleth::speaker::Speaker;
use shibboleth::synth::{SynthesisOptions, VoiceSynth};
use shibboleth::web::{self, SpeakResponse};
use shibboleth::wss;
use std::sync::Arc;
use tower::ServiceExt;

mockall::mock! {
    pub Output {}
    impl AudioOutput for Output {
        fn sample_rate(&self) -> u32;
        fn play(&self, samples: Vec<f32>, sample_rate: u32) -> Result<(), EngineError>;
        fn play_blocking(&self, samples: Vec<f32>, sample_rate: u32) -> Result<(), EngineError>;
    }
}

fn output_at(rate: u32, plays: usize) -> MockOutput {
    let mut output = MockOutput::new();
    output.expect_sample_rate().return_const(rate);
    output
        .expect_play()
        .times(plays)
        .returning(|_, _| Ok(()));
    output
}

fn speaker(dir: &tempfile::TempDir, tts: FakeTts, output: MockOutput) -> Arc<Speaker> {
    let mut synth = VoiceSynth::new(dir.path(), false).unwrap();
    synth.add_model("vits", tts.into_synth());
    Arc::new(Speaker::new(
        synth,
        Arc::new(output),
        "vits",
        SynthesisOptions::default(),
    ))
}

async fn post_text(app: axum::Router, body: &str) -> SpeakResponse {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[test]
fn test_speaker_resamples_to_device_rate() {
    let dir = tempfile::tempdir().unwrap();
    let mut output = MockOutput::new();
    output.expect_sample_rate().return_const(44100u32);
    output
        .expect_play()
        .withf(|samples, rate| *rate == 44100 && samples.len() == 2 * 6 * SAMPLES_PER_CHAR)
        .times(1)
        .returning(|_, _| Ok(()));

    let speaker = speaker(&dir, FakeTts::end_to_end(), output);
    let result = speaker.synthesize_and_play("Hello.").unwrap();
    assert_eq!(result.sample_rate, 22050);
}

#[test]
fn test_speaker_numbers_files_and_counts_only_successes() {
    let dir = tempfile::tempdir().unwrap();
    let speaker = speaker(&dir, FakeTts::end_to_end(), output_at(22050, 0));

    let first = speaker.synthesize("One.").unwrap();
    assert!(first.path.ends_with("testoutput0.wav"));
    assert!(speaker.synthesize("").is_err());
    let second = speaker.synthesize("Two.").unwrap();
    assert!(second.path.ends_with("testoutput1.wav"));
    assert_eq!(speaker.utterances(), 2);
}

#[tokio::test]
async fn test_web_post_speaks_and_echoes() {
    let dir = tempfile::tempdir().unwrap();
    let mut output = MockOutput::new();
    output.expect_sample_rate().return_const(22050u32);
    output
        .expect_play()
        .with(mockall::predicate::always(), eq(22050))
        .times(1)
        .returning(|_, _| Ok(()));
    let speaker = speaker(&dir, FakeTts::end_to_end(), output);

    let app = web::router(speaker, &Settings::default());
    let reply = post_text(app, r#"{"text": "Hello there.", "cmd": "say"}"#).await;
    assert_eq!(
        reply,
        SpeakResponse {
            response: "Success!".to_string(),
            received: "Hello there.".to_string(),
        }
    );
}

#[tokio::test]
async fn test_web_post_echoes_text_when_synthesis_fails() {
    let dir = tempfile::tempdir().unwrap();
    // No speaker is configured for a multi-speaker model, so synthesis fails.
    let tts = FakeTts::end_to_end().with_speakers(&["amir", "effi"]);
    let speaker = speaker(&dir, tts, output_at(22050, 0));

    let app = web::router(speaker, &Settings::default());
    let reply = post_text(app, r#"{"text": "  Hello  "}"#).await;
    assert!(reply.response.starts_with("Error"));
    assert!(reply.response.contains("multi-speaker"));
    assert_eq!(reply.received, "  Hello  ");
}

#[tokio::test]
async fn test_web_index_and_static_files() {
    let dir = tempfile::tempdir().unwrap();
    let static_dir = tempfile::tempdir().unwrap();
    std::fs::write(static_dir.path().join("app.js"), "console.log('hi');").unwrap();
    let settings = Settings {
        static_dir: static_dir.path().to_path_buf(),
        index_template: dir.path().join("missing.html"),
        ..Settings::default()
    };
    let speaker = speaker(&dir, FakeTts::end_to_end(), output_at(22050, 0));
    let app = web::router(speaker, &settings);

    let index = app
        .clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(index.status(), StatusCode::OK);
    let page = axum::body::to_bytes(index.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&page).contains("<h1>Shibboleth</h1>"));

    let script = app
        .clone()
        .oneshot(Request::builder().uri("/app.js").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(script.status(), StatusCode::OK);

    let missing = app
        .oneshot(Request::builder().uri("/nope.css").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_web_index_uses_template_when_present() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("index.html");
    std::fs::write(&template, "<p>custom page</p>").unwrap();
    let settings = Settings {
        index_template: template,
        ..Settings::default()
    };
    let speaker = speaker(&dir, FakeTts::end_to_end(), output_at(22050, 0));

    let response = web::router(speaker, &settings)
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let page = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&page[..], b"<p>custom page</p>");
}

#[tokio::test]
async fn test_wss_ignores_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let speaker = speaker(&dir, FakeTts::end_to_end(), output_at(22050, 0));
    assert_eq!(
        wss::handle_text(speaker.clone(), wss::HANDSHAKE.to_string()).await,
        None
    );
    assert_eq!(speaker.utterances(), 0);
}

#[tokio::test]
async fn test_wss_echoes_blank_frames_without_speaking() {
    let dir = tempfile::tempdir().unwrap();
    let speaker = speaker(&dir, FakeTts::end_to_end(), output_at(22050, 0));
    assert_eq!(
        wss::handle_text(speaker.clone(), "   ".to_string()).await,
        Some("   ".to_string())
    );
    assert_eq!(speaker.utterances(), 0);
}

#[tokio::test]
async fn test_wss_speaks_and_echoes_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let speaker = speaker(&dir, FakeTts::end_to_end(), output_at(22050, 1));
    let text = "Shibboleth, please.".to_string();
    assert_eq!(
        wss::handle_text(speaker.clone(), text.clone()).await,
        Some(text)
    );
    assert_eq!(speaker.utterances(), 1);
}

#[tokio::test]
async fn test_wss_echoes_even_when_synthesis_fails() {
    let dir = tempfile::tempdir().unwrap();
    let tts = FakeTts::end_to_end().with_speakers(&["amir"]);
    let speaker = speaker(&dir, tts, output_at(22050, 0));
    assert_eq!(
        wss::handle_text(speaker, "Hello.".to_string()).await,
        Some("Hello.".to_string())
    );
}
