// packages/engine/src/rpc/server.rs
//! HTTP façade
//!
//! One route per service method, each a thin adapter: parse the body,
//! run the matching dispatch call on a blocking thread, wrap the
//! outcome in `GeneralResponse {ok, message}`. Unknown `target_func`
//! and agent-raised reply/observe failures map to 400, missing files
//! to 404, read failures and engine failures to 500. `download_file`
//! streams the file in 1 MiB chunks, reading the first chunk before
//! the status commits, and terminates explicitly on the first short
//! read.

use crate::rpc::messages::{
    decode_bytes_field, CreateAgentRequest, GeneralResponse, RpcMsg, StringMsg,
    UpdatePlaceholderRequest,
};
use crate::runtime::dispatch::{Dispatcher, Outcome};
use crate::utils::errors::Result as EngineResult;
use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{Stream, StreamExt};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tower_http::trace::TraceLayer;
use tracing::error;

/// Streamed chunk size of `download_file`
pub const DOWNLOAD_CHUNK_SIZE: usize = 1024 * 1024;

/// Shared front-end state of every handler
#[derive(Clone)]
pub struct ApiState {
    dispatcher: Arc<Dispatcher>,
}

/// Build the service router
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/is_alive", get(is_alive))
        .route("/stop", post(stop))
        .route("/create_agent", post(create_agent))
        .route("/delete_agent", post(delete_agent))
        .route("/delete_all_agents", post(delete_all_agents))
        .route("/clone_agent", post(clone_agent))
        .route("/get_agent_list", get(get_agent_list))
        .route("/get_server_info", get(get_server_info))
        .route("/set_model_configs", post(set_model_configs))
        .route("/get_agent_memory", post(get_agent_memory))
        .route("/call_agent_func", post(call_agent_func))
        .route("/update_placeholder", post(update_placeholder))
        .route("/download_file", post(download_file))
        .layer(TraceLayer::new_for_http())
        .with_state(ApiState { dispatcher })
}

/// Run one dispatch call on the blocking pool, turning engine failures
/// into 500 responses
async fn dispatch<T, F>(state: ApiState, call: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce(&Dispatcher) -> EngineResult<T> + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(move || call(&state.dispatcher));
    match handle.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            error!("dispatch failed: {}", err);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(GeneralResponse::fail(err.to_string())),
            )
                .into_response())
        }
        Err(join_err) => {
            error!("dispatch task panicked: {}", join_err);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(GeneralResponse::fail(join_err.to_string())),
            )
                .into_response())
        }
    }
}

fn invalid_argument(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(GeneralResponse::fail(message)),
    )
        .into_response()
}

async fn is_alive() -> Json<GeneralResponse> {
    Json(GeneralResponse::ok(""))
}

async fn stop() -> Json<GeneralResponse> {
    // Acknowledges only; shutdown happens through the process signal.
    Json(GeneralResponse::ok(""))
}

async fn create_agent(
    State(state): State<ApiState>,
    Json(request): Json<CreateAgentRequest>,
) -> Result<Json<GeneralResponse>, Response> {
    let init_args = decode_bytes_field(&request.agent_init_args).map_err(invalid_argument)?;
    let source_code = decode_bytes_field(&request.agent_source_code).map_err(invalid_argument)?;
    let result = dispatch(state, move |d| {
        d.call_create_agent(&request.agent_id, &init_args, &source_code)
    })
    .await?;
    Ok(Json(GeneralResponse {
        ok: result.is_empty(),
        message: result,
    }))
}

async fn delete_agent(
    State(state): State<ApiState>,
    Json(request): Json<StringMsg>,
) -> Result<Json<GeneralResponse>, Response> {
    let result = dispatch(state, move |d| d.call_delete_agent(&request.value)).await?;
    Ok(Json(GeneralResponse {
        ok: result.is_empty(),
        message: result,
    }))
}

async fn delete_all_agents(
    State(state): State<ApiState>,
) -> Result<Json<GeneralResponse>, Response> {
    let result = dispatch(state, |d| d.call_delete_all_agents()).await?;
    Ok(Json(GeneralResponse {
        ok: result.is_empty(),
        message: result,
    }))
}

async fn clone_agent(
    State(state): State<ApiState>,
    Json(request): Json<StringMsg>,
) -> Result<Json<GeneralResponse>, Response> {
    let outcome = dispatch(state, move |d| d.call_clone_agent(&request.value)).await?;
    Ok(Json(GeneralResponse {
        ok: outcome.ok,
        message: outcome.message,
    }))
}

async fn get_agent_list(State(state): State<ApiState>) -> Result<Json<GeneralResponse>, Response> {
    let list = dispatch(state, |d| d.call_get_agent_list()).await?;
    Ok(Json(GeneralResponse::ok(list)))
}

async fn get_server_info(State(state): State<ApiState>) -> Result<Json<GeneralResponse>, Response> {
    let info = dispatch(state, |d| d.call_server_info()).await?;
    Ok(Json(GeneralResponse::ok(info)))
}

async fn set_model_configs(
    State(state): State<ApiState>,
    Json(request): Json<StringMsg>,
) -> Result<Json<GeneralResponse>, Response> {
    let result = dispatch(state, move |d| d.call_set_model_configs(&request.value)).await?;
    Ok(Json(GeneralResponse {
        ok: result.is_empty(),
        message: result,
    }))
}

async fn get_agent_memory(
    State(state): State<ApiState>,
    Json(request): Json<StringMsg>,
) -> Result<Json<GeneralResponse>, Response> {
    let outcome = dispatch(state, move |d| d.call_get_agent_memory(&request.value)).await?;
    Ok(Json(GeneralResponse {
        ok: outcome.ok,
        message: outcome.message,
    }))
}

async fn call_agent_func(
    State(state): State<ApiState>,
    Json(request): Json<RpcMsg>,
) -> Result<Json<GeneralResponse>, Response> {
    let payload = decode_bytes_field(&request.value).map_err(invalid_argument)?;
    let target = request.target_func.clone();
    let outcome: Outcome = match target.as_str() {
        "_reply" => dispatch(state, move |d| d.call_reply(&request.agent_id, payload)).await?,
        "_observe" => dispatch(state, move |d| d.call_observe(&request.agent_id, payload)).await?,
        other => {
            return Err(invalid_argument(format!("Unsupported method {}.", other)));
        }
    };
    if !outcome.ok {
        return Err(invalid_argument(outcome.message));
    }
    Ok(Json(GeneralResponse::ok(outcome.message)))
}

async fn update_placeholder(
    State(state): State<ApiState>,
    Json(request): Json<UpdatePlaceholderRequest>,
) -> Result<Json<GeneralResponse>, Response> {
    let outcome = dispatch(state, move |d| d.call_update_placeholder(request.task_id)).await?;
    Ok(Json(GeneralResponse {
        ok: outcome.ok,
        message: outcome.message,
    }))
}

async fn download_file(Json(request): Json<StringMsg>) -> Response {
    let path = request.value;
    if !Path::new(&path).is_file() {
        return (
            StatusCode::NOT_FOUND,
            Json(GeneralResponse::fail(format!("File {} not found", path))),
        )
            .into_response();
    }
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            // The file vanished between the existence check and the open.
            return (
                StatusCode::NOT_FOUND,
                Json(GeneralResponse::fail(format!("File {} not found", path))),
            )
                .into_response();
        }
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(GeneralResponse::fail(format!(
                    "Failed to open the file: {}",
                    err
                ))),
            )
                .into_response();
        }
    };
    // The first chunk is read before any header commits, so a read
    // failure at the front of the file still surfaces as a 500 instead
    // of an aborted 200 stream.
    let body = match chunked_body(file).await {
        Ok(stream) => stream,
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(GeneralResponse::fail(format!(
                    "Error occurred while reading the file: {}",
                    err
                ))),
            )
                .into_response();
        }
    };
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/octet-stream")
        .body(Body::from_stream(body))
        .unwrap_or_else(|err| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(GeneralResponse::fail(err.to_string())),
            )
                .into_response()
        })
}

/// Read one full `DOWNLOAD_CHUNK_SIZE` piece, or whatever remains in
/// front of EOF (possibly nothing)
async fn read_full_chunk(file: &mut tokio::fs::File) -> std::io::Result<Vec<u8>> {
    let mut chunk = vec![0u8; DOWNLOAD_CHUNK_SIZE];
    let mut filled = 0usize;
    loop {
        match file.read(&mut chunk[filled..]).await {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                if filled == chunk.len() {
                    break;
                }
            }
            Err(err) => return Err(err),
        }
    }
    chunk.truncate(filled);
    Ok(chunk)
}

/// Build the download body: the first chunk is read eagerly (its error
/// aborts before the response exists), the rest stream lazily. The
/// first short (possibly empty) read ends the stream; a zero-byte
/// tail terminates instead of stalling.
async fn chunked_body(
    mut file: tokio::fs::File,
) -> std::io::Result<impl Stream<Item = std::io::Result<Vec<u8>>> + Send> {
    let first = read_full_chunk(&mut file).await?;
    let rest = (first.len() == DOWNLOAD_CHUNK_SIZE).then_some(file);
    let first_item = (!first.is_empty()).then_some(Ok(first));
    Ok(futures::stream::iter(first_item).chain(file_chunk_stream(rest)))
}

/// Lazy tail of the download stream; `None` means the eager first
/// chunk already covered the whole file
fn file_chunk_stream(
    file: Option<tokio::fs::File>,
) -> impl Stream<Item = std::io::Result<Vec<u8>>> + Send {
    futures::stream::unfold(file, |state| async move {
        let mut file = state?;
        match read_full_chunk(&mut file).await {
            Ok(chunk) if chunk.is_empty() => None,
            Ok(chunk) => {
                let rest = (chunk.len() == DOWNLOAD_CHUNK_SIZE).then_some(file);
                Some((Ok(chunk), rest))
            }
            Err(err) => Some((Err(err), None)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn collect_chunks(path: &Path) -> Vec<Vec<u8>> {
        let file = tokio::fs::File::open(path).await.unwrap();
        chunked_body(file)
            .await
            .unwrap()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_chunking_of_partial_tail() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![7u8; 3 * DOWNLOAD_CHUNK_SIZE + DOWNLOAD_CHUNK_SIZE / 2])
            .unwrap();
        let chunks = collect_chunks(tmp.path()).await;
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(
            sizes,
            vec![
                DOWNLOAD_CHUNK_SIZE,
                DOWNLOAD_CHUNK_SIZE,
                DOWNLOAD_CHUNK_SIZE,
                DOWNLOAD_CHUNK_SIZE / 2
            ]
        );
    }

    #[tokio::test]
    async fn test_chunking_of_exact_multiple() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![1u8; 2 * DOWNLOAD_CHUNK_SIZE]).unwrap();
        let chunks = collect_chunks(tmp.path()).await;
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![DOWNLOAD_CHUNK_SIZE, DOWNLOAD_CHUNK_SIZE]);
    }

    #[tokio::test]
    async fn test_chunking_of_empty_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let chunks = collect_chunks(tmp.path()).await;
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_chunk_bytes_survive_reassembly() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let payload: Vec<u8> = (0..DOWNLOAD_CHUNK_SIZE + 123).map(|i| i as u8).collect();
        tmp.write_all(&payload).unwrap();
        let reassembled: Vec<u8> = collect_chunks(tmp.path()).await.concat();
        assert_eq!(reassembled, payload);
    }

    #[tokio::test]
    async fn test_first_read_failure_surfaces_before_streaming() {
        // A directory opens fine but fails on the first read; the error
        // must come out of chunked_body, not out of the body stream.
        let dir = tempfile::tempdir().unwrap();
        let file = tokio::fs::File::open(dir.path()).await.unwrap();
        assert!(chunked_body(file).await.is_err());
    }
}
