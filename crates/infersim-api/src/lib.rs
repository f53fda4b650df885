//! OpenAI-compatible HTTP surface over the KV-cache simulation core.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use infersim_common::config::SimConfig;
use infersim_common::{Result, SimError};
use infersim_core::{KvCacheHelper, PromptAccounting};
use infersim_tokenizer::{mock::ByteTokenizer, HfTokenizer, Tokenizer};
use once_cell::sync::Lazy;
use prometheus::{Encoder, TextEncoder};
use tokio_stream::wrappers::ReceiverStream;

#[derive(Clone)]
pub struct AppState {
    config: Arc<SimConfig>,
    helper: Arc<KvCacheHelper>,
    loras: Arc<tokio::sync::RwLock<Vec<String>>>,
}

static ENCODER: Lazy<TextEncoder> = Lazy::new(TextEncoder::new);

/// Builds the router plus the helper handle the caller uses to drive the
/// event sender's lifecycle.
pub async fn build(config: SimConfig) -> Result<(Router, Arc<KvCacheHelper>)> {
    config.validate()?;
    let tokenizer = select_tokenizer(&config);
    let (helper, usage_rx) = KvCacheHelper::new(&config, tokenizer).await?;
    let helper = Arc::new(helper);

    infersim_obs::init();
    infersim_obs::spawn_usage_polling(usage_rx);
    let loras: Vec<String> = config.lora_modules.iter().map(|m| m.name.clone()).collect();
    infersim_obs::set_lora_adapters(&loras, config.max_loras);

    let state = AppState {
        config: Arc::new(config),
        helper: helper.clone(),
        loras: Arc::new(tokio::sync::RwLock::new(loras)),
    };
    let router = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/ready", get(|| async { "ok" }))
        .route("/metrics", get(metrics))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/load_lora_adapter", post(load_lora_adapter))
        .route("/v1/unload_lora_adapter", post(unload_lora_adapter))
        .with_state(state);
    Ok((router, helper))
}

fn select_tokenizer(config: &SimConfig) -> Arc<dyn Tokenizer> {
    if let Some(path) = &config.tokenizer_path {
        match HfTokenizer::from_file(path) {
            Ok(tokenizer) => {
                tracing::info!(target: "api", %path, "using huggingface tokenizer");
                return Arc::new(tokenizer);
            }
            Err(e) => {
                tracing::warn!(target: "api", "tokenizer load failed, using byte tokenizer: {}", e)
            }
        }
    }
    Arc::new(ByteTokenizer::new())
}

async fn metrics() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    ENCODER.encode(&metric_families, &mut buffer).unwrap();
    ([("content-type", ENCODER.format_type().to_string())], buffer)
}

fn openai_error(status: StatusCode, message: String, error_type: &str) -> Response {
    let body = serde_json::json!({
        "error": { "message": message, "type": error_type, "code": status.as_u16() }
    });
    (status, Json(body)).into_response()
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn resolve_model(state: &AppState, requested: &str) -> Option<String> {
    if requested == state.config.model
        || state.config.served_model_names.iter().any(|m| m == requested)
    {
        return Some(state.config.model.clone());
    }
    if state.loras.read().await.iter().any(|l| l == requested) {
        return Some(requested.to_string());
    }
    None
}

#[derive(serde::Serialize)]
struct PromptTokensDetails {
    cached_tokens: usize,
}

#[derive(serde::Serialize)]
struct Usage {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
    prompt_tokens_details: PromptTokensDetails,
}

impl Usage {
    fn new(accounting: PromptAccounting, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens: accounting.prompt_tokens,
            completion_tokens,
            total_tokens: accounting.prompt_tokens + completion_tokens,
            prompt_tokens_details: PromptTokensDetails {
                cached_tokens: accounting.cached_prompt_tokens,
            },
        }
    }
}

struct Admitted {
    request_id: String,
    accounting: PromptAccounting,
}

/// Admit a prompt into the cache, translating core errors into OpenAI-style
/// rejections. Capacity exhaustion is a 429 so load-test clients can back off.
fn admit(state: &AppState, id_prefix: &str, prompt: &str) -> core::result::Result<Admitted, Response> {
    infersim_obs::inc_requests_total();
    let request_id = format!("{}-{:016x}", id_prefix, rand::random::<u64>());
    infersim_obs::add_waiting(1);
    let started = state.helper.on_request_start(&request_id, prompt);
    infersim_obs::add_waiting(-1);
    match started {
        Ok(accounting) => Ok(Admitted { request_id, accounting }),
        Err(e @ SimError::KvCacheCapacity { .. }) => {
            tracing::debug!(target: "api", "request rejected: {}", e);
            Err(openai_error(StatusCode::TOO_MANY_REQUESTS, e.to_string(), "server_overloaded"))
        }
        Err(e) => Err(openai_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            e.to_string(),
            "internal_error",
        )),
    }
}

fn finish(state: &AppState, request_id: &str) {
    if let Err(e) = state.helper.on_request_end(request_id) {
        tracing::warn!(target: "api", request_id, "finish reported: {}", e);
    }
}

const SENTENCE_BANK: [&str; 6] = [
    "The quick brown fox jumps over the lazy dog.",
    "All work and no play makes for a dull simulation.",
    "A watched pot never boils but a mocked model always answers.",
    "The answer to the ultimate question is left as an exercise.",
    "Latency is a feature when you are pretending to think.",
    "Tokens flow downhill toward the nearest completion.",
];

/// Fake completion text: either the prompt itself or canned prose, capped at
/// `max_tokens` whitespace words.
fn generate_words(config: &SimConfig, prompt: &str, max_tokens: usize) -> Vec<String> {
    if config.mode == "echo" {
        return prompt
            .split_whitespace()
            .take(max_tokens)
            .map(str::to_string)
            .collect();
    }
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let target = rng.gen_range(1..=max_tokens.max(1));
    let mut words = Vec::with_capacity(target);
    while words.len() < target {
        let sentence = SENTENCE_BANK[rng.gen_range(0..SENTENCE_BANK.len())];
        for word in sentence.split_whitespace() {
            if words.len() == target {
                break;
            }
            words.push(word.to_string());
        }
    }
    words
}

async fn simulate_generation(config: &SimConfig, tokens: usize) {
    if config.time_to_first_token_ms > 0 {
        tokio::time::sleep(Duration::from_millis(config.time_to_first_token_ms)).await;
    }
    let trailing = tokens.saturating_sub(1) as u64;
    if config.inter_token_latency_ms > 0 && trailing > 0 {
        tokio::time::sleep(Duration::from_millis(config.inter_token_latency_ms * trailing)).await;
    }
}

fn sse_json(value: &serde_json::Value) -> Event {
    Event::default().data(value.to_string())
}

// ---------------------------------------------------------------------------
// chat completions

#[derive(serde::Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(serde::Deserialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(default)]
    stream: bool,
    max_tokens: Option<usize>,
    max_completion_tokens: Option<usize>,
}

#[derive(serde::Serialize)]
struct ChatChoiceMessage {
    role: String,
    content: String,
}

#[derive(serde::Serialize)]
struct ChatChoice {
    index: u32,
    message: ChatChoiceMessage,
    finish_reason: String,
}

#[derive(serde::Serialize)]
struct ChatResponse {
    id: String,
    object: String,
    created: u64,
    model: String,
    choices: Vec<ChatChoice>,
    usage: Usage,
}

async fn chat_completions(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Response {
    let Some(_served) = resolve_model(&state, &req.model).await else {
        return openai_error(
            StatusCode::NOT_FOUND,
            format!("model {:?} does not exist", req.model),
            "model_not_found",
        );
    };
    tracing::info!(target: "api", model = %req.model, messages = req.messages.len(), "chat request");

    let mut prompt = String::new();
    for m in &req.messages {
        if m.role == "system" || m.role == "user" {
            prompt.push_str(&m.content);
            prompt.push('\n');
        }
    }
    let admitted = match admit(&state, "chatcmpl", &prompt) {
        Ok(admitted) => admitted,
        Err(response) => return response,
    };
    let max_tokens = req
        .max_completion_tokens
        .or(req.max_tokens)
        .unwrap_or(state.config.max_model_len);
    let words = generate_words(&state.config, &prompt, max_tokens);

    if req.stream {
        return stream_chat(state, req.model, admitted, words);
    }

    infersim_obs::add_running(1);
    simulate_generation(&state.config, words.len()).await;
    infersim_obs::add_running(-1);
    finish(&state, &admitted.request_id);

    let completion_tokens = words.len();
    Json(ChatResponse {
        id: admitted.request_id,
        object: "chat.completion".into(),
        created: unix_timestamp(),
        model: req.model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatChoiceMessage { role: "assistant".into(), content: words.join(" ") },
            finish_reason: "stop".into(),
        }],
        usage: Usage::new(admitted.accounting, completion_tokens),
    })
    .into_response()
}

fn stream_chat(state: AppState, model: String, admitted: Admitted, words: Vec<String>) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<core::result::Result<Event, Infallible>>(16);
    infersim_obs::add_running(1);
    tokio::spawn(async move {
        let id = admitted.request_id.clone();
        let created = unix_timestamp();
        let chunk = |delta: serde_json::Value, finish_reason: serde_json::Value| {
            serde_json::json!({
                "id": id,
                "object": "chat.completion.chunk",
                "created": created,
                "model": model,
                "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }],
            })
        };

        if state.config.time_to_first_token_ms > 0 {
            tokio::time::sleep(Duration::from_millis(state.config.time_to_first_token_ms)).await;
        }
        let role_chunk = chunk(serde_json::json!({"role": "assistant"}), serde_json::Value::Null);
        let mut open = tx.send(Ok(sse_json(&role_chunk))).await.is_ok();
        for (i, word) in words.iter().enumerate() {
            if !open {
                break;
            }
            if i > 0 && state.config.inter_token_latency_ms > 0 {
                tokio::time::sleep(Duration::from_millis(state.config.inter_token_latency_ms))
                    .await;
            }
            let text = if i + 1 == words.len() { word.clone() } else { format!("{} ", word) };
            let delta = chunk(serde_json::json!({"content": text}), serde_json::Value::Null);
            open = tx.send(Ok(sse_json(&delta))).await.is_ok();
        }
        if open {
            let stop = chunk(serde_json::json!({}), serde_json::json!("stop"));
            let _ = tx.send(Ok(sse_json(&stop))).await;
            let _ = tx.send(Ok(Event::default().data("[DONE]"))).await;
        }
        finish(&state, &admitted.request_id);
        infersim_obs::add_running(-1);
    });
    Sse::new(ReceiverStream::new(rx)).into_response()
}

// ---------------------------------------------------------------------------
// text completions

#[derive(serde::Deserialize)]
struct CompletionRequest {
    model: String,
    prompt: String,
    #[serde(default)]
    stream: bool,
    max_tokens: Option<usize>,
}

#[derive(serde::Serialize)]
struct CompletionChoice {
    index: u32,
    text: String,
    finish_reason: String,
}

#[derive(serde::Serialize)]
struct CompletionResponse {
    id: String,
    object: String,
    created: u64,
    model: String,
    choices: Vec<CompletionChoice>,
    usage: Usage,
}

async fn completions(State(state): State<AppState>, Json(req): Json<CompletionRequest>) -> Response {
    let Some(_served) = resolve_model(&state, &req.model).await else {
        return openai_error(
            StatusCode::NOT_FOUND,
            format!("model {:?} does not exist", req.model),
            "model_not_found",
        );
    };
    tracing::info!(target: "api", model = %req.model, "completion request");

    let admitted = match admit(&state, "cmpl", &req.prompt) {
        Ok(admitted) => admitted,
        Err(response) => return response,
    };
    let max_tokens = req.max_tokens.unwrap_or(state.config.max_model_len);
    let words = generate_words(&state.config, &req.prompt, max_tokens);

    if req.stream {
        return stream_completion(state, req.model, admitted, words);
    }

    infersim_obs::add_running(1);
    simulate_generation(&state.config, words.len()).await;
    infersim_obs::add_running(-1);
    finish(&state, &admitted.request_id);

    let completion_tokens = words.len();
    Json(CompletionResponse {
        id: admitted.request_id,
        object: "text_completion".into(),
        created: unix_timestamp(),
        model: req.model,
        choices: vec![CompletionChoice {
            index: 0,
            text: words.join(" "),
            finish_reason: "stop".into(),
        }],
        usage: Usage::new(admitted.accounting, completion_tokens),
    })
    .into_response()
}

fn stream_completion(
    state: AppState,
    model: String,
    admitted: Admitted,
    words: Vec<String>,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<core::result::Result<Event, Infallible>>(16);
    infersim_obs::add_running(1);
    tokio::spawn(async move {
        let id = admitted.request_id.clone();
        let created = unix_timestamp();
        let chunk = |text: String, finish_reason: serde_json::Value| {
            serde_json::json!({
                "id": id,
                "object": "text_completion",
                "created": created,
                "model": model,
                "choices": [{ "index": 0, "text": text, "finish_reason": finish_reason }],
            })
        };

        if state.config.time_to_first_token_ms > 0 {
            tokio::time::sleep(Duration::from_millis(state.config.time_to_first_token_ms)).await;
        }
        let mut open = true;
        for (i, word) in words.iter().enumerate() {
            if i > 0 && state.config.inter_token_latency_ms > 0 {
                tokio::time::sleep(Duration::from_millis(state.config.inter_token_latency_ms))
                    .await;
            }
            let text = if i + 1 == words.len() { word.clone() } else { format!("{} ", word) };
            open = tx.send(Ok(sse_json(&chunk(text, serde_json::Value::Null)))).await.is_ok();
            if !open {
                break;
            }
        }
        if open {
            let _ = tx.send(Ok(sse_json(&chunk(String::new(), serde_json::json!("stop"))))).await;
            let _ = tx.send(Ok(Event::default().data("[DONE]"))).await;
        }
        finish(&state, &admitted.request_id);
        infersim_obs::add_running(-1);
    });
    Sse::new(ReceiverStream::new(rx)).into_response()
}

// ---------------------------------------------------------------------------
// model listing and lora management

#[derive(serde::Serialize)]
struct ModelEntry {
    id: String,
    object: String,
    created: u64,
    owned_by: String,
    root: String,
    parent: Option<String>,
}

#[derive(serde::Serialize)]
struct ModelList {
    object: String,
    data: Vec<ModelEntry>,
}

async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    let created = unix_timestamp();
    let base = &state.config.model;
    let entry = |id: &str, parent: Option<String>| ModelEntry {
        id: id.to_string(),
        object: "model".into(),
        created,
        owned_by: "vllm".into(),
        root: base.clone(),
        parent,
    };
    let mut data = vec![entry(base, None)];
    for name in state.config.served_model_names.iter() {
        data.push(entry(name, None));
    }
    for lora in state.loras.read().await.iter() {
        data.push(entry(lora, Some(base.clone())));
    }
    Json(ModelList { object: "list".into(), data })
}

#[derive(serde::Deserialize)]
struct LoadLoraRequest {
    lora_name: String,
    #[allow(dead_code)]
    #[serde(default)]
    lora_path: Option<String>,
}

#[derive(serde::Deserialize)]
struct UnloadLoraRequest {
    lora_name: String,
}

async fn load_lora_adapter(
    State(state): State<AppState>,
    Json(req): Json<LoadLoraRequest>,
) -> Response {
    let mut loras = state.loras.write().await;
    if loras.iter().any(|l| l == &req.lora_name) {
        return openai_error(
            StatusCode::BAD_REQUEST,
            format!("LoRA adapter {:?} is already loaded", req.lora_name),
            "invalid_request_error",
        );
    }
    loras.push(req.lora_name.clone());
    infersim_obs::set_lora_adapters(&loras, state.config.max_loras);
    tracing::info!(target: "api", lora = %req.lora_name, "loaded lora adapter");
    (StatusCode::OK, "ok").into_response()
}

async fn unload_lora_adapter(
    State(state): State<AppState>,
    Json(req): Json<UnloadLoraRequest>,
) -> Response {
    let mut loras = state.loras.write().await;
    let Some(pos) = loras.iter().position(|l| l == &req.lora_name) else {
        return openai_error(
            StatusCode::BAD_REQUEST,
            format!("LoRA adapter {:?} is not loaded", req.lora_name),
            "invalid_request_error",
        );
    };
    loras.remove(pos);
    infersim_obs::set_lora_adapters(&loras, state.config.max_loras);
    tracing::info!(target: "api", lora = %req.lora_name, "unloaded lora adapter");
    (StatusCode::OK, "ok").into_response()
}
