//! Per-connection session: handshake, message routing, turn orchestration,
//! barge-in and shutdown.

pub mod audio;
pub mod intent;
pub mod report;
pub mod send;
pub mod text;
pub mod wakeup;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::AudioFormat;
use crate::config::Config;
use crate::dialogue::{Dialogue, Message, ToolCall};
use crate::error::GatewayError;
use crate::manage_api::ManageApiClient;
use crate::providers::asr::{Asr, InterfaceType};
use crate::providers::intent::{Intent, IntentKind};
use crate::providers::llm::{Llm, LlmEvent};
use crate::providers::memory::Memory;
use crate::providers::vad::Vad;
use crate::providers::{self, SharedModules};
use crate::queue::TaskQueue;
use crate::server::WebSocketServer;
use crate::tools::handler::UnifiedToolHandler;
use crate::tools::{FunctionCallData, ToolResult};
use crate::tts::{ContentType, SentenceType, TtsEngine, TtsMessage};
use crate::utils::{extract_json_from_string, truncate_safe};

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);
const MEMORY_SAVE_DEADLINE: Duration = Duration::from_secs(3);

/// Outbound socket payload, serialized by the single writer task.
#[derive(Debug)]
pub enum Outbound {
    Text(String),
    Frame(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenMode {
    #[default]
    Auto,
    Manual,
}

impl ListenMode {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("manual") {
            ListenMode::Manual
        } else {
            ListenMode::Auto
        }
    }
}

/// Everything the server hands a new connection.
pub struct SessionContext {
    pub config: Arc<Config>,
    pub modules: SharedModules,
    pub server: Weak<WebSocketServer>,
    pub manage_api: Option<ManageApiClient>,
}

pub struct ConnectionHandler {
    pub session_id: String,
    pub device_id: String,
    pub client_id: String,
    pub client_ip: String,
    pub config: Arc<Config>,
    pub server: Weak<WebSocketServer>,
    pub manage_api: Option<ManageApiClient>,

    outbound: mpsc::Sender<Outbound>,
    pub cancel: CancellationToken,

    // Provider bundle.
    pub vad: Arc<dyn Vad>,
    pub asr: Arc<dyn Asr>,
    pub llm: Arc<dyn Llm>,
    pub memory: Arc<dyn Memory>,
    pub intent: Option<Arc<dyn Intent>>,
    pub intent_type: IntentKind,
    pub tts: Arc<TtsEngine>,
    pub tool_handler: Arc<UnifiedToolHandler>,

    // Session state.
    pub dialogue: Mutex<Dialogue>,
    client_abort: AtomicBool,
    client_is_speaking: AtomicBool,
    pub client_have_voice: AtomicBool,
    pub client_voice_stop: AtomicBool,
    just_woken_up: AtomicBool,
    close_after_chat: AtomicBool,
    llm_finish_task: AtomicBool,
    last_activity_ms: AtomicU64,
    pub listen_mode: StdMutex<ListenMode>,
    audio_format: StdMutex<AudioFormat>,
    sentence_id: StdMutex<Option<String>>,
    pub features: StdMutex<Option<Value>>,

    // Device-bind flow.
    pub need_bind: bool,
    pub bind_code: Option<String>,
    pub read_config_from_api: bool,
    pub max_output_size: u64,
    pub chat_history_conf: u8,

    pub report_queue: TaskQueue<report::ReportItem>,
    /// Buffered utterance frames awaiting finalization.
    pub asr_audio: Mutex<Vec<Vec<u8>>>,
    asr_frame_tx: mpsc::Sender<Vec<u8>>,
    /// Longest configured exit command, bounding the cheap exact-match scan.
    pub max_cmd_length: usize,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl ConnectionHandler {
    // ── small state accessors ──────────────────────────────────────────

    pub async fn send_json(&self, value: Value) {
        self.send_text(value.to_string()).await;
    }

    pub async fn send_text(&self, payload: String) {
        if self.outbound.send(Outbound::Text(payload)).await.is_err() {
            debug!("outbound channel closed, dropping text frame");
        }
    }

    pub async fn send_frame(&self, frame: Vec<u8>) {
        if self.outbound.send(Outbound::Frame(frame)).await.is_err() {
            debug!("outbound channel closed, dropping audio frame");
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.client_abort.load(Ordering::SeqCst)
    }

    pub fn set_abort(&self, value: bool) {
        self.client_abort.store(value, Ordering::SeqCst);
    }

    pub fn is_speaking(&self) -> bool {
        self.client_is_speaking.load(Ordering::SeqCst)
    }

    pub fn set_speaking(&self, value: bool) {
        self.client_is_speaking.store(value, Ordering::SeqCst);
    }

    pub fn clear_speak_status(&self) {
        self.set_speaking(false);
        debug!("speaking state cleared");
    }

    pub fn is_just_woken_up(&self) -> bool {
        self.just_woken_up.load(Ordering::SeqCst)
    }

    pub fn set_just_woken_up(&self, value: bool) {
        self.just_woken_up.store(value, Ordering::SeqCst);
    }

    pub fn close_after_chat(&self) -> bool {
        self.close_after_chat.load(Ordering::SeqCst)
    }

    pub fn set_close_after_chat(&self, value: bool) {
        self.close_after_chat.store(value, Ordering::SeqCst);
    }

    pub fn llm_finished(&self) -> bool {
        self.llm_finish_task.load(Ordering::SeqCst)
    }

    pub fn update_activity(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::SeqCst);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity_ms.load(Ordering::SeqCst)
    }

    pub fn audio_format(&self) -> AudioFormat {
        *self.audio_format.lock().unwrap()
    }

    pub fn set_audio_format(&self, format: AudioFormat) {
        *self.audio_format.lock().unwrap() = format;
    }

    pub fn current_sentence_id(&self) -> Option<String> {
        self.sentence_id.lock().unwrap().clone()
    }

    pub fn set_sentence_id(&self, id: Option<String>) {
        *self.sentence_id.lock().unwrap() = id;
    }

    pub fn listen_mode(&self) -> ListenMode {
        *self.listen_mode.lock().unwrap()
    }

    pub async fn change_system_prompt(&self, prompt: &str) {
        self.dialogue.lock().await.update_system_message(prompt);
    }

    pub async fn ingest_audio_frame(&self, frame: Vec<u8>) {
        if self.asr_frame_tx.send(frame).await.is_err() {
            debug!("asr intake closed, dropping frame");
        }
    }

    /// The welcome object for this session (sent on `hello`).
    pub fn welcome_message(&self, audio_params: Option<&Value>) -> Value {
        let mut welcome = if self.config.xiaozhi.is_object() {
            self.config.xiaozhi.clone()
        } else {
            serde_json::json!({ "type": "hello", "transport": "websocket" })
        };
        if let Value::Object(map) = &mut welcome {
            map.insert("session_id".into(), Value::String(self.session_id.clone()));
            if let Some(params) = audio_params {
                map.insert("audio_params".into(), params.clone());
            }
        }
        welcome
    }

    // ── barge-in / shutdown ────────────────────────────────────────────

    /// Barge-in: stop producing, drain both queues, tell the device.
    pub async fn abort(&self) {
        self.set_abort(true);
        self.tts.clear_queues().await;
        self.send_json(serde_json::json!({
            "type": "tts", "state": "stop", "session_id": self.session_id,
        }))
        .await;
        self.clear_speak_status();
        info!("turn aborted by barge-in");
    }

    /// Idempotent resource teardown. Safe to call from the watchdog, the
    /// exit command and the socket loop at once.
    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.tool_handler.cleanup();
        self.tts.clear_queues().await;
        self.report_queue.clear().await;
        info!("session {} closed", self.session_id);
    }

    /// Best-effort memory save on a detached task, then close. The save must
    /// never delay the close beyond its soft deadline.
    pub async fn save_and_close(self: &Arc<Self>) {
        let dialogue = self.dialogue.lock().await.messages().to_vec();
        if dialogue.len() > 1 {
            let memory = self.memory.clone();
            let session_id = self.session_id.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(MEMORY_SAVE_DEADLINE, memory.save_memory(&dialogue))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("memory save failed for {session_id}: {e}"),
                    Err(_) => warn!("memory save for {session_id} missed its deadline"),
                }
            });
        }
        self.close().await;
    }

    /// Acknowledge a restart request, then re-exec the current binary.
    pub async fn handle_restart(&self) {
        self.send_json(serde_json::json!({
            "type": "server",
            "status": "success",
            "message": "サーバー再起動中...",
            "content": { "action": "restart" },
        }))
        .await;
        tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            info!("restarting server process");
            let exe = std::env::current_exe().unwrap_or_else(|_| "xiaozhi-gateway".into());
            let err = exec_replace(&exe);
            error!("restart failed: {err}");
        });
    }

    // ── turn orchestration ─────────────────────────────────────────────

    /// Run one assistant turn. `depth` guards the single tool roundtrip.
    pub fn chat(
        self: Arc<Self>,
        query: String,
        depth: u8,
    ) -> futures::future::BoxFuture<'static, ()> {
        Box::pin(async move {
            info!("llm turn: {}", truncate_safe(&query, 80));
            self.llm_finish_task.store(false, Ordering::SeqCst);

            if depth == 0 {
                self.dialogue.lock().await.put(Message::user(&query));
            }

            let functions = if self.intent_type == IntentKind::FunctionCall {
                Some(self.tool_handler.get_functions())
            } else {
                None
            };

            let memory_str = match self.memory.query_memory(&query).await {
                Ok(memory) => memory,
                Err(e) => {
                    warn!("memory query failed: {e}");
                    None
                }
            };

            let sentence_id = Uuid::new_v4().simple().to_string();
            self.set_sentence_id(Some(sentence_id.clone()));

            let messages = self.dialogue.lock().await.llm_messages(memory_str.as_deref());
            let stream = match &functions {
                Some(functions) => {
                    self.llm
                        .response_with_functions(&self.session_id, messages, functions.clone())
                        .await
                }
                None => self.llm.response(&self.session_id, messages).await,
            };
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    error!("llm call failed: {e}");
                    self.tts
                        .tts_one_sentence(
                            &self,
                            ContentType::Text,
                            Some("すみません、いまサービスが混み合っています。".to_string()),
                            None,
                        )
                        .await;
                    self.llm_finish_task.store(true, Ordering::SeqCst);
                    return;
                }
            };

            let mut response_message: Vec<String> = Vec::new();
            let mut content_arguments = String::new();
            let mut tool_call_flag = false;
            let mut function_id: Option<String> = None;
            let mut function_name: Option<String> = None;
            let mut function_arguments = String::new();
            let mut text_index = 0usize;

            self.set_abort(false);
            while let Some(event) = stream.recv().await {
                if self.is_aborted() || self.cancel.is_cancelled() {
                    break;
                }
                match event {
                    LlmEvent::ToolCallDelta { id, name, arguments } => {
                        tool_call_flag = true;
                        if let Some(id) = id {
                            function_id = Some(id);
                        }
                        if let Some(name) = name {
                            function_name = Some(name);
                        }
                        function_arguments.push_str(&arguments);
                    }
                    LlmEvent::Text(content) => {
                        if functions.is_some() {
                            content_arguments.push_str(&content);
                            if !tool_call_flag
                                && content_arguments.trim_start().starts_with("<tool_call>")
                            {
                                tool_call_flag = true;
                            }
                        }
                        if !tool_call_flag {
                            response_message.push(content.clone());
                            if text_index == 0 {
                                self.tts
                                    .text_queue
                                    .push(TtsMessage {
                                        sentence_id: sentence_id.clone(),
                                        sentence_type: SentenceType::First,
                                        content_type: ContentType::Action,
                                        text: None,
                                        file: None,
                                    })
                                    .await;
                            }
                            self.tts
                                .text_queue
                                .push(TtsMessage {
                                    sentence_id: sentence_id.clone(),
                                    sentence_type: SentenceType::Middle,
                                    content_type: ContentType::Text,
                                    text: Some(content),
                                    file: None,
                                })
                                .await;
                            text_index += 1;
                        }
                    }
                }
            }

            if tool_call_flag {
                let mut has_error = false;
                if function_id.is_none() {
                    // Inline `<tool_call>{...}</tool_call>` emitted by small
                    // models: best-effort JSON repair, else speak the raw text.
                    match extract_json_from_string(&content_arguments) {
                        Some(json) => match serde_json::from_str::<Value>(json) {
                            Ok(parsed) => {
                                function_name = parsed
                                    .get("name")
                                    .and_then(Value::as_str)
                                    .map(str::to_string);
                                function_arguments = parsed
                                    .get("arguments")
                                    .map(|a| {
                                        if a.is_string() {
                                            a.as_str().unwrap_or_default().to_string()
                                        } else {
                                            a.to_string()
                                        }
                                    })
                                    .unwrap_or_else(|| "{}".to_string());
                                function_id = Some(Uuid::new_v4().simple().to_string());
                                if function_name.is_none() {
                                    has_error = true;
                                    response_message.push(json.to_string());
                                }
                            }
                            Err(_) => {
                                has_error = true;
                                response_message.push(json.to_string());
                            }
                        },
                        None => {
                            has_error = true;
                            response_message.push(content_arguments.clone());
                        }
                    }
                    if has_error {
                        error!("unparseable inline tool call: {}", truncate_safe(&content_arguments, 200));
                    }
                }
                if !has_error {
                    response_message.clear();
                    let call = FunctionCallData {
                        name: function_name.unwrap_or_default(),
                        id: function_id.unwrap_or_default(),
                        arguments: if function_arguments.is_empty() {
                            "{}".to_string()
                        } else {
                            function_arguments
                        },
                    };
                    debug!("function call {} args={}", call.name, call.arguments);
                    let result = self.tool_handler.handle_function_call(&self, &call).await;
                    self.handle_function_result(result, &call, depth).await;
                }
            }

            if !response_message.is_empty() {
                self.dialogue
                    .lock()
                    .await
                    .put(Message::assistant(response_message.concat()));
            }
            if text_index > 0 {
                self.tts
                    .text_queue
                    .push(TtsMessage {
                        sentence_id,
                        sentence_type: SentenceType::Last,
                        content_type: ContentType::Action,
                        text: None,
                        file: None,
                    })
                    .await;
            }
            self.llm_finish_task.store(true, Ordering::SeqCst);
        })
    }

    /// Apply the tool-result policy to the finished call.
    async fn handle_function_result(
        self: &Arc<Self>,
        result: ToolResult,
        call: &FunctionCallData,
        depth: u8,
    ) {
        match result {
            ToolResult::Response(text) => {
                self.speak_and_record(&text).await;
            }
            ToolResult::ReqLlm(text) => {
                if text.is_empty() {
                    return;
                }
                if depth >= 1 {
                    // One roundtrip per user turn; speak the raw result
                    // instead of recursing again.
                    warn!("tool recursion limit reached for {}", call.name);
                    self.speak_and_record(&text).await;
                    return;
                }
                {
                    let mut dialogue = self.dialogue.lock().await;
                    dialogue.put(Message::assistant_tool_call(ToolCall::function(
                        &call.id,
                        &call.name,
                        &call.arguments,
                    )));
                    dialogue.put(Message::tool_result(&call.id, &text));
                }
                self.clone().chat(text, depth + 1).await;
            }
            ToolResult::NotFound(text) | ToolResult::Error(text) => {
                self.speak_and_record(&text).await;
            }
            ToolResult::None => {}
        }
    }

    async fn speak_and_record(&self, text: &str) {
        self.tts
            .tts_one_sentence(self, ContentType::Text, Some(text.to_string()), None)
            .await;
        self.dialogue.lock().await.put(Message::assistant(text));
    }

    /// Farewell path: run the turn, then let the LAST sentence close us.
    pub async fn chat_and_close(self: &Arc<Self>, text: String) {
        self.set_close_after_chat(true);
        self.set_abort(false);
        self.clone().chat(text, 0).await;
    }

    // ── watchdog ───────────────────────────────────────────────────────

    async fn watchdog(self: Arc<Self>) {
        let timeout_ms = (self.config.close_connection_no_voice_time + 60) * 1000;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(WATCHDOG_INTERVAL) => {}
            }
            let last = self.last_activity();
            if last > 0 && now_ms().saturating_sub(last) > timeout_ms {
                info!("connection idle past hard limit, closing");
                self.close().await;
                break;
            }
        }
        debug!("watchdog stopped");
    }
}

#[cfg(unix)]
fn exec_replace(exe: &std::path::Path) -> String {
    use std::os::unix::process::CommandExt;
    let err = std::process::Command::new(exe).exec();
    err.to_string()
}

#[cfg(not(unix))]
fn exec_replace(exe: &std::path::Path) -> String {
    match std::process::Command::new(exe).spawn() {
        Ok(_) => {
            std::process::exit(0);
        }
        Err(e) => e.to_string(),
    }
}

/// Entry point called by the server for each upgraded socket.
pub async fn handle_socket(
    socket: WebSocket,
    ctx: SessionContext,
    device_id: String,
    client_id: String,
    client_ip: String,
) {
    let session_id = Uuid::new_v4().to_string();
    info!("{client_ip} connected, device {device_id}, session {session_id}");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(256);

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let result = match message {
                Outbound::Text(text) => ws_tx.send(WsMessage::Text(text.into())).await,
                Outbound::Frame(frame) => ws_tx.send(WsMessage::Binary(frame.into())).await,
            };
            if result.is_err() {
                break;
            }
        }
    });

    // Per-device private config overlay (remote-config mode).
    let mut config = (*ctx.config).clone();
    let mut need_bind = false;
    let mut bind_code = None;
    if config.read_config_from_api {
        if let Some(api) = &ctx.manage_api {
            match api.get_agent_models(&device_id, &client_id, &config.selected_module).await {
                Ok(private) => match config.overlaid(&private) {
                    Ok(merged) => config = merged,
                    Err(e) => {
                        error!("private config overlay rejected: {e}");
                        need_bind = true;
                    }
                },
                Err(GatewayError::DeviceNotFound(msg)) => {
                    info!("device {device_id} unknown to the management api: {msg}");
                    need_bind = true;
                }
                Err(GatewayError::DeviceBind { bind_code: code }) => {
                    info!("device {device_id} requires binding with code {code}");
                    need_bind = true;
                    bind_code = Some(code);
                }
                Err(e) => {
                    error!("private config fetch failed: {e}");
                    need_bind = true;
                }
            }
        }
    }
    let config = Arc::new(config);

    let max_output_size = config.device_max_output_size;
    let chat_history_conf = config.chat_history_conf;

    // Remote ASR carries per-connection transport state, so remote sessions
    // get their own instance; local ASR is shared by reference.
    let asr = if ctx.modules.asr.interface_type() == InterfaceType::Local {
        ctx.modules.asr.clone()
    } else {
        match providers::create_asr(&config) {
            Ok(asr) => asr,
            Err(e) => {
                error!("per-session asr init failed, reusing shared instance: {e}");
                ctx.modules.asr.clone()
            }
        }
    };

    let llm = ctx.modules.llm.clone();
    let silent =
        || Arc::new(crate::providers::tts::SilentTts) as Arc<dyn crate::providers::tts::TtsProvider>;
    let tts_provider = if need_bind {
        silent()
    } else {
        match providers::create_tts(&config) {
            Ok(tts) => tts,
            Err(e) => {
                error!("tts init failed, continuing silent: {e}");
                silent()
            }
        }
    };
    let tts = Arc::new(TtsEngine::new(tts_provider, config.tts_timeout));

    let memory = match providers::create_memory(
        &config,
        &device_id,
        llm.clone(),
        ctx.manage_api.clone(),
    ) {
        Ok(memory) => memory,
        Err(e) => {
            warn!("memory init failed, running without: {e}");
            Arc::new(crate::providers::memory::NoMemory) as Arc<dyn Memory>
        }
    };
    let (intent_type, intent) =
        match providers::create_intent(&config, llm.clone(), crate::tools::registered_names()) {
            Ok(pair) => pair,
            Err(e) => {
                warn!("intent init failed, running without: {e}");
                (IntentKind::NoIntent, None)
            }
        };

    let (asr_frame_tx, asr_frame_rx) = mpsc::channel::<Vec<u8>>(512);
    let max_cmd_length =
        config.exit_commands.iter().map(|c| c.chars().count()).max().unwrap_or(0);

    let conn = Arc::new(ConnectionHandler {
        session_id,
        device_id,
        client_id,
        client_ip,
        config: config.clone(),
        server: ctx.server,
        manage_api: ctx.manage_api,
        outbound: outbound_tx,
        cancel: CancellationToken::new(),
        vad: ctx.modules.vad.clone(),
        asr,
        llm,
        memory,
        intent,
        intent_type,
        tts: tts.clone(),
        tool_handler: Arc::new(UnifiedToolHandler::new()),
        dialogue: Mutex::new(Dialogue::new()),
        client_abort: AtomicBool::new(false),
        client_is_speaking: AtomicBool::new(false),
        client_have_voice: AtomicBool::new(false),
        client_voice_stop: AtomicBool::new(false),
        just_woken_up: AtomicBool::new(false),
        close_after_chat: AtomicBool::new(false),
        llm_finish_task: AtomicBool::new(true),
        last_activity_ms: AtomicU64::new(now_ms()),
        listen_mode: StdMutex::new(ListenMode::Auto),
        audio_format: StdMutex::new(AudioFormat::Opus),
        sentence_id: StdMutex::new(None),
        features: StdMutex::new(None),
        need_bind,
        bind_code,
        read_config_from_api: config.read_config_from_api,
        max_output_size,
        chat_history_conf,
        report_queue: TaskQueue::new(),
        asr_audio: Mutex::new(Vec::new()),
        asr_frame_tx,
        max_cmd_length,
    });

    if let Some(prompt) = &config.prompt {
        conn.change_system_prompt(prompt).await;
        info!("system prompt set: {}", truncate_safe(prompt, 50));
    }

    tts.open_audio_channels(conn.clone());
    tokio::spawn(conn.clone().watchdog());
    audio::spawn_asr_intake(conn.clone(), asr_frame_rx);
    report::spawn_report_worker(conn.clone());

    loop {
        tokio::select! {
            _ = conn.cancel.cancelled() => break,
            message = ws_rx.next() => {
                let Some(Ok(message)) = message else {
                    info!("client disconnected");
                    break;
                };
                match message {
                    WsMessage::Text(raw) => {
                        conn.update_activity();
                        text::handle_text_message(&conn, raw.as_str()).await;
                    }
                    WsMessage::Binary(frame) => {
                        conn.ingest_audio_frame(frame.to_vec()).await;
                    }
                    WsMessage::Close(_) => {
                        info!("close frame received");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    conn.save_and_close().await;
    writer.abort();
}
