//! Websocket front end. Every text frame is spoken and echoed back.

use crate::config_loader::Settings;
use crate::speaker::Speaker;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Sent by the browser client on connect; never spoken or echoed.
pub const HANDSHAKE: &str = "Handshake!";

pub const STARTUP_TEXT: &str =
    "Starting the Shibboleth, this is just a test. Please say the words as I repeat them.";

pub const TEST_TEXT: &str = "Please say the words as I repeat them. Shibboleths have been used \
     throughout history in many societies as passwords, simple ways of self-identification, \
     signaling loyalty and affinity, maintaining traditional segregation, or protecting from \
     real or perceived threats.";

pub fn router(speaker: Arc<Speaker>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .with_state(speaker)
}

/// Runs the startup synthesis (and the spoken test paragraph when `test`
/// is set), then serves websocket clients until the process ends.
pub async fn serve(speaker: Arc<Speaker>, settings: &Settings, test: bool) -> anyhow::Result<()> {
    let warmup = speaker.clone();
    let result =
        tokio::task::spawn_blocking(move || warmup.synthesize_to(STARTUP_TEXT, "testoutput.wav"))
            .await??;
    info!(
        "Finished synthesis file samplerate: {} - file saved: {}",
        result.sample_rate,
        result.path.display()
    );

    if test {
        let tester = speaker.clone();
        tokio::task::spawn_blocking(move || tester.synthesize_and_play(TEST_TEXT)).await??;
    }

    let addr = format!("{}:{}", settings.wss_host, settings.wss_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Websocket server listening on ws://{}", addr);
    axum::serve(listener, router(speaker)).await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(speaker): State<Arc<Speaker>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, speaker))
}

async fn handle_socket(socket: WebSocket, speaker: Arc<Speaker>) {
    let (mut sender, mut receiver) = socket.split();
    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.as_str().to_string(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Websocket receive error: {}", e);
                break;
            }
        };
        if let Some(reply) = handle_text(speaker.clone(), text).await {
            if sender.send(Message::Text(reply.into())).await.is_err() {
                break;
            }
        }
    }
    debug!("Websocket client disconnected");
}

/// Speaks one incoming frame and returns the echo to send back, if any.
pub async fn handle_text(speaker: Arc<Speaker>, text: String) -> Option<String> {
    info!("RCV: {}", text);
    if text == HANDSHAKE {
        return None;
    }
    if text.trim().is_empty() {
        info!("...ignoring empty text...");
        return Some(text);
    }

    let to_speak = text.clone();
    match tokio::task::spawn_blocking(move || speaker.synthesize_and_play(&to_speak)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!("Synthesis failed: {:#}", e),
        Err(e) => error!("Synthesis task failed: {}", e),
    }
    Some(text)
}
