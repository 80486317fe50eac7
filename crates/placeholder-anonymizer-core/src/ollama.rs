//! Ollama LLM integration for Named Entity Recognition
//!
//! This module provides integration with Ollama for PII detection using
//! Large Language Models, with support for health checks and response parsing.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use crate::config::DetectedEntity;
use crate::detection::Detector;
use crate::prompt_loader::PromptLoader;

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub enabled: bool,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            timeout_seconds: 300,
            enabled: false,
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
    format: &'static str,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    top_p: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
    done: bool,
}

#[derive(Debug, Deserialize)]
pub struct LlmResponse {
    #[serde(default)]
    pub entities: Vec<LlmDetectedEntity>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmDetectedEntity {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub value: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.8
}

#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    config: OllamaConfig,
    prompt_loader: PromptLoader,
    prompt_template: String,
}

impl OllamaClient {
    /// Named templates are looked up in the user data directory; `None`
    /// selects the built-in prompt.
    pub fn new(config: OllamaConfig, prompt_template: Option<&String>) -> Result<Self> {
        let prompt_loader = match prompt_template {
            Some(_) => PromptLoader::from_app_dirs()?,
            None => PromptLoader::new("prompts"),
        };
        Self::with_prompt_loader(config, prompt_loader, prompt_template)
    }

    pub fn with_prompt_loader(
        config: OllamaConfig,
        prompt_loader: PromptLoader,
        prompt_template: Option<&String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        let template = prompt_loader.load_prompt(prompt_template);

        Ok(Self {
            client,
            config,
            prompt_loader,
            prompt_template: template,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    pub async fn extract_entities(&self, text: &str) -> Result<Vec<DetectedEntity>> {
        if !self.config.enabled {
            debug!("Ollama client is disabled, returning empty entities");
            return Ok(vec![]);
        }

        debug!("Sending text to Ollama for LLM detection: {} characters", text.len());

        let prompt = self.prompt_loader.format_prompt(&self.prompt_template, text);
        let response = self.call_ollama(&prompt).await?;

        self.parse_llm_response(&response, text)
    }

    async fn call_ollama(&self, prompt: &str) -> Result<String> {
        let request = OllamaRequest {
            model: self.config.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            format: "json",
            options: OllamaOptions {
                temperature: 0.0,
                top_p: 0.1,
                num_predict: 1024,
            },
        };

        debug!("Making request to Ollama: {}/api/generate", self.config.endpoint);

        let response = self.client
            .post(format!("{}/api/generate", self.config.endpoint))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("Ollama request failed with status {}: {}", status, error_text);
            return Err(anyhow::anyhow!("Ollama request failed: {} - {}", status, error_text));
        }

        let ollama_response: OllamaResponse = response.json().await?;

        if !ollama_response.done {
            warn!("Received incomplete response from Ollama");
        }

        debug!("Received response from Ollama: {} characters", ollama_response.response.len());
        Ok(ollama_response.response)
    }

    // Models report offsets unreliably, so spans come from locating each
    // reported value in the text. Every occurrence becomes its own span.
    fn parse_llm_response(&self, response: &str, original_text: &str) -> Result<Vec<DetectedEntity>> {
        let json_str = extract_json_from_response(response)?;

        debug!("Parsing JSON response: {}", json_str);

        let llm_response: LlmResponse = serde_json::from_str(&json_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse LLM JSON response: {}", e))?;

        let mut entities: Vec<DetectedEntity> = Vec::new();

        for llm_entity in llm_response.entities {
            if llm_entity.value.trim().is_empty() {
                debug!("Skipping empty {} value from LLM", llm_entity.entity_type);
                continue;
            }

            let positions = find_entity_positions(original_text, &llm_entity.value);
            if positions.is_empty() {
                warn!("Could not find a reported {} entity in the text", llm_entity.entity_type);
                debug!("Unmatched LLM value: '{}'", llm_entity.value);
                continue;
            }

            for (start, end) in positions {
                if entities.iter().any(|e| e.start == start && e.end == end) {
                    continue;
                }
                entities.push(DetectedEntity {
                    entity_type: llm_entity.entity_type.clone(),
                    original_value: llm_entity.value.clone(),
                    start,
                    end,
                    confidence: llm_entity.confidence,
                });
            }
        }

        entities.sort_by_key(|e| (e.start, e.end));
        info!("Ollama extracted {} entities", entities.len());
        Ok(entities)
    }

    pub async fn health_check(&self) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }

        debug!("Performing Ollama health check");

        let response = self.client
            .get(format!("{}/api/tags", self.config.endpoint))
            .send()
            .await?;

        let is_healthy = response.status().is_success();

        if is_healthy {
            info!("Ollama health check passed");
        } else {
            warn!("Ollama health check failed: {}", response.status());
        }

        Ok(is_healthy)
    }
}

impl Detector for OllamaClient {
    async fn detect(&self, text: &str) -> Result<Vec<DetectedEntity>> {
        self.extract_entities(text).await
    }
}

/// Pulls the first complete JSON object out of a model reply. Replies that
/// echo the template's doubled braces are retried with them collapsed.
fn extract_json_from_response(response: &str) -> Result<String> {
    let collapsed = response.replace("{{", "{").replace("}}", "}");

    for candidate in [response, collapsed.as_str()] {
        if let Some(json_str) = first_json_object(candidate) {
            return Ok(json_str.to_string());
        }
    }

    debug!("Unparseable Ollama reply: {}", response);
    Err(anyhow::anyhow!(
        "No valid JSON found in Ollama response ({} characters)",
        response.len()
    ))
}

fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let json_str = &text[start..start + i + 1];
                    return serde_json::from_str::<serde_json::Value>(json_str)
                        .ok()
                        .map(|_| json_str);
                }
            }
            _ => {}
        }
    }

    None
}

/// Occurrences of `entity_value` that are not part of a longer word.
fn find_entity_positions(text: &str, entity_value: &str) -> Vec<(usize, usize)> {
    let joins_word = |edge: Option<char>, neighbour: Option<char>| {
        matches!((edge, neighbour), (Some(a), Some(b)) if a.is_alphanumeric() && b.is_alphanumeric())
    };

    text.match_indices(entity_value)
        .map(|(start, value)| (start, start + value.len()))
        .filter(|&(start, end)| {
            !joins_word(entity_value.chars().next(), text[..start].chars().next_back())
                && !joins_word(entity_value.chars().next_back(), text[end..].chars().next())
        })
        .collect()
}
