use appforge_agent::{LogEvent, LogFollower};
use appforge_process::ProjectId;
use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tracing::Instrument;

use crate::api_error::ApiError;
use crate::state::AppState;

pub fn started_marker(id: &ProjectId) -> String {
    format!("[appforge] streaming logs for {id}\n")
}

pub fn ended_marker(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("[appforge] log stream ended (exit code {c})\n"),
        None => "[appforge] log stream ended (terminated by signal)\n".to_string(),
    }
}

pub async fn stream_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let id = ProjectId::from(id.as_str());
    // Unknown projects are refused before any upgrade happens.
    if state.manager.registry().get(&id).await.is_none() {
        return ApiError::from(appforge_agent::ProjectError::NotFound(id)).into_response();
    }
    let Some(ws) = ws else {
        return ApiError::new(
            StatusCode::UPGRADE_REQUIRED,
            "upgrade_required",
            "this endpoint only serves websocket connections",
        )
        .into_response();
    };

    let follower = match state.manager.follow_logs(&id).await {
        Ok(f) => f,
        Err(e) => return ApiError::from(e).into_response(),
    };
    ws.on_upgrade(move |socket| pump(socket, follower, id))
        .into_response()
}

async fn pump(socket: WebSocket, mut follower: LogFollower, id: ProjectId) {
    let span = tracing::info_span!("log_stream", project_id = %id);
    async move {
        let (mut sender, mut receiver) = socket.split();
        if sender
            .send(Message::Text(started_marker(&id)))
            .await
            .is_err()
        {
            return;
        }
        tracing::debug!("log stream opened");

        loop {
            tokio::select! {
                ev = follower.next() => match ev {
                    Some(LogEvent::Chunk(chunk)) => {
                        if sender.send(Message::Text(chunk)).await.is_err() {
                            break;
                        }
                    }
                    Some(LogEvent::Exited(code)) => {
                        let _ = sender.send(Message::Text(ended_marker(code))).await;
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                    None => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                },
                msg = receiver.next() => match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }

        // Dropping the follower kills the follow process.
        drop(follower);
        tracing::debug!("log stream closed");
    }
    .instrument(span)
    .await
}
