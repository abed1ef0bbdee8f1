//! HTTP front end: a minimal page plus a JSON endpoint that speaks the
//! posted text on the server's output device.

use crate::config_loader::Settings;
use crate::speaker::Speaker;
use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const FALLBACK_INDEX: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Shibboleth</title></head>
<body>
<h1>Shibboleth</h1>
<form id="say">
  <input id="text" size="60" autofocus>
  <button type="submit">Say</button>
</form>
<pre id="log"></pre>
<script>
document.getElementById("say").addEventListener("submit", async (e) => {
  e.preventDefault();
  const text = document.getElementById("text").value;
  const res = await fetch("/", {
    method: "POST",
    headers: {"Content-Type": "application/json"},
    body: JSON.stringify({text: text, cmd: "say"}),
  });
  document.getElementById("log").textContent += JSON.stringify(await res.json()) + "\n";
});
</script>
</body>
</html>
"#;

#[derive(Debug, Deserialize)]
pub struct SpeakRequest {
    pub text: String,
    #[serde(default)]
    pub cmd: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SpeakResponse {
    pub response: String,
    pub received: String,
}

#[derive(Clone)]
struct AppState {
    speaker: Arc<Speaker>,
    index_template: PathBuf,
}

pub fn router(speaker: Arc<Speaker>, settings: &Settings) -> Router {
    let state = AppState {
        speaker,
        index_template: settings.index_template.clone(),
    };
    Router::new()
        .route("/", get(index).post(speak))
        .fallback_service(ServeDir::new(&settings.static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(speaker: Arc<Speaker>, settings: &Settings) -> anyhow::Result<()> {
    let addr = format!("{}:{}", settings.http_host, settings.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);
    axum::serve(listener, router(speaker, settings)).await?;
    Ok(())
}

async fn index(State(state): State<AppState>) -> Html<String> {
    match tokio::fs::read_to_string(&state.index_template).await {
        Ok(page) => Html(page),
        Err(e) => {
            warn!(
                "Index template {} unavailable ({}), serving built-in page",
                state.index_template.display(),
                e
            );
            Html(FALLBACK_INDEX.to_string())
        }
    }
}

async fn speak(
    State(state): State<AppState>,
    Json(req): Json<SpeakRequest>,
) -> Json<SpeakResponse> {
    info!("Got POST: text={:?} cmd={:?}", req.text, req.cmd);

    let speaker = state.speaker.clone();
    let text = req.text.clone();
    let outcome = tokio::task::spawn_blocking(move || speaker.synthesize_and_play(&text)).await;

    let response = match outcome {
        Ok(Ok(_)) => "Success!".to_string(),
        Ok(Err(e)) => {
            error!("Synthesis failed: {:#}", e);
            format!("Error: {:#}", e)
        }
        Err(e) => {
            error!("Synthesis task failed: {}", e);
            format!("Error: {}", e)
        }
    };

    Json(SpeakResponse {
        response,
        received: req.text,
    })
}
