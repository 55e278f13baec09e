//! Model endpoints: the streaming contract and two HTTP adapters.
//!
//! The driver only depends on [`ModelEndpoint`]. [`HttpModel`] speaks either
//! the Ollama chat API (NDJSON, whole tool calls) or an OpenAI-compatible chat
//! completions API (SSE, tool-call deltas) and decodes both into
//! [`Fragment`]s.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument, trace};

use crate::core::parser::Fragment;
use crate::core::types::{Message, Role};

/// One model call: full history plus the advertised tool declarations.
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub messages: &'a [Message],
    pub tools: &'a [Value],
    /// Upper bound for the whole request, already clamped to the session deadline.
    pub timeout: Duration,
}

/// Ordered fragments of one streamed response.
pub type FragmentStream = Box<dyn Iterator<Item = Result<Fragment>>>;

/// Anything that can stream a model response for a chat request.
pub trait ModelEndpoint {
    fn open_stream(&self, request: &ChatRequest<'_>) -> Result<FragmentStream>;
}

/// Wire protocol spoken by [`HttpModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Ollama,
    Openai,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Ollama => "ollama",
            Provider::Openai => "openai",
        }
    }

    fn chat_path(self) -> &'static str {
        match self {
            Provider::Ollama => "/api/chat",
            Provider::Openai => "/v1/chat/completions",
        }
    }
}

/// Blocking HTTP client for a local model server.
#[derive(Debug, Clone)]
pub struct HttpModel {
    http: reqwest::blocking::Client,
    provider: Provider,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpModel {
    pub fn new(
        provider: Provider,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            provider,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        })
    }

    fn request_body(&self, request: &ChatRequest<'_>) -> Value {
        let messages = match self.provider {
            Provider::Ollama => ollama_messages(request.messages),
            Provider::Openai => openai_messages(request.messages),
        };
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.to_vec());
        }
        body
    }
}

impl ModelEndpoint for HttpModel {
    #[instrument(skip_all, fields(provider = self.provider.as_str(), model = %self.model, messages = request.messages.len()))]
    fn open_stream(&self, request: &ChatRequest<'_>) -> Result<FragmentStream> {
        let url = format!("{}{}", self.base_url, self.provider.chat_path());
        let body = self.request_body(request);
        debug!(%url, timeout_ms = request.timeout.as_millis() as u64, "model request");

        let mut builder = self
            .http
            .post(&url)
            .timeout(request.timeout)
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .with_context(|| format!("send chat request to {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            bail!("model endpoint returned HTTP {status}: {}", text.trim());
        }

        Ok(Box::new(FragmentReader::new(
            BufReader::new(response),
            self.provider,
        )))
    }
}

/// History in Ollama's chat format; tool call arguments are objects.
pub fn ollama_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| {
            let mut wire = json!({ "role": msg.role.as_str(), "content": msg.content });
            if !msg.tool_calls.is_empty() {
                wire["tool_calls"] = msg
                    .tool_calls
                    .iter()
                    .map(|call| {
                        json!({ "function": { "name": call.name, "arguments": call.arguments } })
                    })
                    .collect();
            }
            if msg.role == Role::Tool
                && let Some(name) = &msg.name
            {
                wire["tool_name"] = json!(name);
            }
            wire
        })
        .collect()
}

/// History in OpenAI chat format; tool call arguments are JSON strings.
pub fn openai_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| {
            let mut wire = json!({ "role": msg.role.as_str(), "content": msg.content });
            if !msg.tool_calls.is_empty() {
                wire["tool_calls"] = msg
                    .tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": Value::Object(call.arguments.clone()).to_string(),
                            },
                        })
                    })
                    .collect();
            }
            if let Some(id) = &msg.tool_call_id {
                wire["tool_call_id"] = json!(id);
            }
            wire
        })
        .collect()
}

/// Decode one Ollama NDJSON line.
///
/// Ollama sends whole tool calls; `call_offset` is the number of calls seen
/// earlier in the same response so later chunks do not reuse index 0.
pub fn decode_ollama_line(line: &str, call_offset: usize) -> Result<Vec<Fragment>> {
    let value: Value =
        serde_json::from_str(line).with_context(|| format!("decode ollama chunk: {line}"))?;
    if let Some(error) = value.get("error") {
        return Err(anyhow!("model error: {}", display_value(error)));
    }

    let mut fragments = Vec::new();
    let message = &value["message"];
    if let Some(text) = message["content"].as_str()
        && !text.is_empty()
    {
        fragments.push(Fragment::Content(text.to_string()));
    }
    if let Some(calls) = message["tool_calls"].as_array() {
        for (position, call) in calls.iter().enumerate() {
            let function = &call["function"];
            let index = function["index"]
                .as_u64()
                .map_or(call_offset + position, |i| i as usize);
            fragments.push(Fragment::Call {
                index,
                id: call["id"].as_str().map(str::to_string),
                name: function["name"].as_str().unwrap_or_default().to_string(),
                arguments: raw_arguments(&function["arguments"]),
            });
        }
    }
    if value["done"].as_bool() == Some(true) {
        fragments.push(Fragment::End);
    }
    Ok(fragments)
}

/// Decode the data of one OpenAI-compatible SSE event.
pub fn decode_openai_event(data: &str) -> Result<Vec<Fragment>> {
    if data.trim() == "[DONE]" {
        return Ok(vec![Fragment::End]);
    }
    let value: Value =
        serde_json::from_str(data).with_context(|| format!("decode sse event: {data}"))?;
    if let Some(error) = value.get("error") {
        return Err(anyhow!("model error: {}", display_value(error)));
    }

    let mut fragments = Vec::new();
    let delta = &value["choices"][0]["delta"];
    if let Some(text) = delta["content"].as_str()
        && !text.is_empty()
    {
        fragments.push(Fragment::Content(text.to_string()));
    }
    if let Some(calls) = delta["tool_calls"].as_array() {
        for (position, call) in calls.iter().enumerate() {
            let function = &call["function"];
            fragments.push(Fragment::CallDelta {
                index: call["index"].as_u64().map_or(position, |i| i as usize),
                id: call["id"].as_str().map(str::to_string),
                name: function["name"].as_str().map(str::to_string),
                arguments: function["arguments"].as_str().unwrap_or_default().to_string(),
            });
        }
    }
    Ok(fragments)
}

fn raw_arguments(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| value.to_string(), str::to_string),
        other => other.to_string(),
    }
}

/// Turns a line-oriented response body into fragments.
pub struct FragmentReader<R> {
    reader: R,
    provider: Provider,
    pending: VecDeque<Fragment>,
    /// Data lines of the SSE event being assembled.
    event_data: Vec<String>,
    ollama_calls: usize,
    finished: bool,
}

impl<R: BufRead> FragmentReader<R> {
    pub fn new(reader: R, provider: Provider) -> Self {
        Self {
            reader,
            provider,
            pending: VecDeque::new(),
            event_data: Vec::new(),
            ollama_calls: 0,
            finished: false,
        }
    }

    /// Feed one line; returns decoded fragments, if any.
    fn feed(&mut self, line: &str) -> Result<Vec<Fragment>> {
        match self.provider {
            Provider::Ollama => {
                if line.trim().is_empty() {
                    return Ok(Vec::new());
                }
                let fragments = decode_ollama_line(line, self.ollama_calls)?;
                self.ollama_calls += fragments
                    .iter()
                    .filter(|f| matches!(f, Fragment::Call { .. }))
                    .count();
                Ok(fragments)
            }
            Provider::Openai => {
                if line.is_empty() {
                    return self.flush_event();
                }
                if let Some(data) = line.strip_prefix("data:") {
                    self.event_data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
                }
                // `event:`, `id:`, `retry:` and `:` comments carry nothing we use.
                Ok(Vec::new())
            }
        }
    }

    fn flush_event(&mut self) -> Result<Vec<Fragment>> {
        if self.event_data.is_empty() {
            return Ok(Vec::new());
        }
        let data = std::mem::take(&mut self.event_data).join("\n");
        decode_openai_event(&data)
    }
}

impl<R: BufRead> Iterator for FragmentReader<R> {
    type Item = Result<Fragment>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(fragment) = self.pending.pop_front() {
                return Some(Ok(fragment));
            }
            if self.finished {
                return None;
            }

            let mut line = String::new();
            let read = match self.reader.read_line(&mut line) {
                Ok(read) => read,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(anyhow!(err).context("read model stream")));
                }
            };
            let decoded = if read == 0 {
                self.finished = true;
                self.flush_event()
            } else {
                let line = line.trim_end_matches(['\r', '\n']);
                trace!(line, "stream line");
                self.feed(line)
            };
            match decoded {
                Ok(fragments) => self.pending.extend(fragments),
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
