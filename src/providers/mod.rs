//! Provider contracts and by-type-name instantiation.
//!
//! The server keeps shared instances of the local/shareable providers (VAD,
//! ASR, LLM); everything carrying per-session state (TTS transport, memory
//! bound to a device, intent wrappers) is built fresh per connection from
//! the merged configuration.

pub mod asr;
pub mod intent;
pub mod llm;
pub mod memory;
pub mod tts;
pub mod vad;
pub mod vllm;

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::manage_api::ManageApiClient;

use asr::{Asr, OpenAiAsr};
use intent::{Intent, IntentKind, LlmIntent};
use llm::{Llm, OpenAiLlm};
use memory::{LocalShortMemory, Memory, NoMemory, RemoteVectorMemory};
use tts::{OpenAiTts, SilentTts, TtsProvider};
use vad::{EnergyVad, Vad};
use vllm::{OpenAiVllm, Vllm};

/// Server-level cache of shareable providers, swapped atomically on
/// `update_config`.
#[derive(Clone)]
pub struct SharedModules {
    pub vad: Arc<dyn Vad>,
    pub asr: Arc<dyn Asr>,
    pub llm: Arc<dyn Llm>,
}

pub fn initialize_modules(config: &Config) -> Result<SharedModules> {
    let modules = SharedModules {
        vad: create_vad(config)?,
        asr: create_asr(config)?,
        llm: create_llm(config)?,
    };
    info!(
        "modules ready: VAD={:?} ASR={:?} LLM={:?}",
        config.selected("VAD"),
        config.selected("ASR"),
        config.selected("LLM")
    );
    Ok(modules)
}

fn unknown(module: &str, kind: &str) -> GatewayError {
    GatewayError::Configuration(format!("unknown {module} provider type '{kind}'"))
}

pub fn create_vad(config: &Config) -> Result<Arc<dyn Vad>> {
    let (_, settings) = config
        .selected_provider("VAD")
        .ok_or_else(|| GatewayError::Configuration("no VAD selected".into()))?;
    match config.provider_kind("VAD").as_deref() {
        Some("energy") | None => Ok(Arc::new(EnergyVad::from_settings(settings))),
        Some(kind) => Err(unknown("VAD", kind)),
    }
}

pub fn create_asr(config: &Config) -> Result<Arc<dyn Asr>> {
    let (_, settings) = config
        .selected_provider("ASR")
        .ok_or_else(|| GatewayError::Configuration("no ASR selected".into()))?;
    match config.provider_kind("ASR").as_deref() {
        Some("openai") => Ok(Arc::new(OpenAiAsr::from_settings(settings)?)),
        Some(kind) => Err(unknown("ASR", kind)),
        None => Err(GatewayError::Configuration("ASR provider has no type".into())),
    }
}

pub fn create_llm(config: &Config) -> Result<Arc<dyn Llm>> {
    let name = config
        .selected("LLM")
        .ok_or_else(|| GatewayError::Configuration("no LLM selected".into()))?
        .to_string();
    create_llm_by_name(config, &name)
}

/// Build a specific LLM entry; memory and intent may name dedicated models.
pub fn create_llm_by_name(config: &Config, name: &str) -> Result<Arc<dyn Llm>> {
    let settings = config
        .provider("LLM", name)
        .ok_or_else(|| GatewayError::Configuration(format!("LLM entry '{name}' not found")))?;
    let kind = if settings.kind.is_empty() { name } else { &settings.kind };
    match kind {
        "openai" => Ok(Arc::new(OpenAiLlm::from_settings(settings)?)),
        other => Err(unknown("LLM", other)),
    }
}

pub fn create_tts(config: &Config) -> Result<Arc<dyn TtsProvider>> {
    let Some((_, settings)) = config.selected_provider("TTS") else {
        return Ok(Arc::new(SilentTts));
    };
    match config.provider_kind("TTS").as_deref() {
        Some("openai") => Ok(Arc::new(OpenAiTts::from_settings(settings)?)),
        Some(kind) => Err(unknown("TTS", kind)),
        None => Ok(Arc::new(SilentTts)),
    }
}

/// Build the memory backend for one session. `mem_local_short` resolves a
/// dedicated summary LLM when one is named, otherwise reuses the session's.
pub fn create_memory(
    config: &Config,
    role_id: &str,
    session_llm: Arc<dyn Llm>,
    manage_api: Option<ManageApiClient>,
) -> Result<Arc<dyn Memory>> {
    let Some((name, settings)) = config.selected_provider("Memory") else {
        return Ok(Arc::new(NoMemory));
    };
    let kind = if settings.kind.is_empty() { name } else { settings.kind.as_str() };
    match kind {
        "nomem" => Ok(Arc::new(NoMemory)),
        "mem_local_short" => {
            let llm = match settings.llm.as_deref() {
                Some(llm_name) if config.provider("LLM", llm_name).is_some() => {
                    info!("memory summarizer uses dedicated LLM '{llm_name}'");
                    create_llm_by_name(config, llm_name)?
                }
                _ => session_llm,
            };
            let seed = config.summary_memory.clone();
            Ok(Arc::new(LocalShortMemory::new(llm, role_id, seed, manage_api)))
        }
        "mem_remote" => Ok(Arc::new(RemoteVectorMemory::from_settings(settings, role_id)?)),
        other => Err(unknown("Memory", other)),
    }
}

/// Resolve the intent mode and, for `intent_llm`, its detector.
pub fn create_intent(
    config: &Config,
    session_llm: Arc<dyn Llm>,
    function_names: Vec<String>,
) -> Result<(IntentKind, Option<Arc<dyn Intent>>)> {
    let Some((name, settings)) = config.selected_provider("Intent") else {
        return Ok((IntentKind::NoIntent, None));
    };
    let kind_str = if settings.kind.is_empty() { name } else { settings.kind.as_str() };
    let kind = IntentKind::parse(kind_str);
    match kind {
        IntentKind::IntentLlm => {
            let llm = match settings.llm.as_deref() {
                Some(llm_name) if config.provider("LLM", llm_name).is_some() => {
                    info!("intent detector uses dedicated LLM '{llm_name}'");
                    create_llm_by_name(config, llm_name)?
                }
                _ => session_llm,
            };
            let functions = settings.functions.clone().unwrap_or(function_names);
            Ok((kind, Some(Arc::new(LlmIntent::new(llm, functions)))))
        }
        _ => Ok((kind, None)),
    }
}

pub fn create_vllm(config: &Config) -> Result<Arc<dyn Vllm>> {
    let (_, settings) = config
        .selected_provider("VLLM")
        .ok_or_else(|| GatewayError::Configuration("no VLLM selected".into()))?;
    match config.provider_kind("VLLM").as_deref() {
        Some("openai") => Ok(Arc::new(OpenAiVllm::from_settings(settings)?)),
        Some(kind) => Err(unknown("VLLM", kind)),
        None => Err(GatewayError::Configuration("VLLM provider has no type".into())),
    }
}
