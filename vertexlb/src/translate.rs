//! Bidirectional translation between the OpenAI chat-completion shape and
//! the Vertex generative-content shape.
//!
//! The mapping is total over syntactically valid OpenAI inputs: elements the
//! Vertex protocol cannot express are dropped with a warning, never turned
//! into hard errors. Sequence irregularities (non-alternating roles, orphaned
//! function calls) are likewise logged and left for the upstream to judge;
//! blocks are never merged or reordered.

use std::convert::Infallible;

use async_stream::stream;
use axum::response::sse::Event;
use chrono::Utc;
use futures::Stream;
use tracing::warn;
use uuid::Uuid;

use crate::errors::Result;
use crate::openai::{
    AssistantMessage, ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, ChatMessage, Choice, ChunkChoice,
    ContentPart, Delta, FunctionSpec, MessageContent, ResponseError, ToolCall, Usage, completion_id,
};
use crate::vertex::types::{
    Blob, Content, FinishReason, FunctionCall, FunctionResponse, GenerateContentRequest, GenerateContentResponse,
    GenerationConfig, Part, UsageMetadata,
};

/// Map an OpenAI chat-completion request onto a Vertex request. System
/// messages are hoisted into the text of the first subsequent user message,
/// separated by blank lines.
pub fn to_vertex_request(request: &ChatCompletionRequest) -> GenerateContentRequest {
    let mut contents: Vec<Content> = Vec::new();
    let mut pending_system: Vec<String> = Vec::new();

    for message in &request.messages {
        match message.role.as_str() {
            "system" => match content_text(message.content.as_ref()) {
                Some(text) => pending_system.push(text),
                None => warn!("Dropping system message without usable text content"),
            },
            "user" => {
                let mut parts = content_to_parts(message.content.as_ref());
                if !pending_system.is_empty() {
                    let system_text = pending_system.join("\n\n");
                    pending_system.clear();
                    match parts.first_mut() {
                        Some(Part::Text { text }) => *text = format!("{system_text}\n\n{text}"),
                        _ => parts.insert(0, Part::Text { text: system_text }),
                    }
                }
                if parts.is_empty() {
                    warn!("Dropping user message with no mappable content");
                } else {
                    contents.push(Content::new("user", parts));
                }
            }
            "assistant" | "model" => {
                let mut parts = content_to_parts(message.content.as_ref());
                parts.extend(tool_calls_to_parts(message));
                if parts.is_empty() {
                    warn!("Dropping assistant message with no mappable content");
                } else {
                    contents.push(Content::new("model", parts));
                }
            }
            "tool" | "function" => match function_response_part(message) {
                Some(part) => contents.push(Content::new("user", vec![part])),
                None => warn!("Dropping tool message with unparseable function response content"),
            },
            other => warn!(role = other, "Skipping message with unsupported role"),
        }
    }

    if !pending_system.is_empty() {
        warn!("System message had no subsequent user message to attach to; dropping");
    }

    validate_sequence(&contents);

    let generation_config = GenerationConfig {
        max_output_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
    };

    GenerateContentRequest {
        contents,
        generation_config: (!generation_config.is_empty()).then_some(generation_config),
    }
}

/// Plain text of a message: a bare string, or the concatenated text parts.
fn content_text(content: Option<&MessageContent>) -> Option<String> {
    match content? {
        MessageContent::Text(text) => Some(text.clone()),
        MessageContent::Parts(parts) => {
            let text: String = parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text, .. } => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            (!text.is_empty()).then_some(text)
        }
    }
}

fn content_to_parts(content: Option<&MessageContent>) -> Vec<Part> {
    let Some(content) = content else {
        return Vec::new();
    };

    match content {
        MessageContent::Text(text) => vec![Part::Text { text: text.clone() }],
        MessageContent::Parts(elements) => elements
            .iter()
            .filter_map(|element| match element {
                ContentPart::Text { kind, text } if kind == "text" => Some(Part::Text { text: text.clone() }),
                ContentPart::ImageUrl { kind, image_url } if kind == "image_url" => {
                    match parse_data_url(&image_url.url) {
                        Some((mime_type, data)) => Some(Part::InlineData {
                            inline_data: Blob { mime_type, data },
                        }),
                        None => {
                            warn!("Dropping image_url part that is not a base64 data URL");
                            None
                        }
                    }
                }
                other => {
                    warn!(part = ?other, "Dropping content part of unknown type");
                    None
                }
            })
            .collect(),
    }
}

/// Accepts only the `data:image/<subtype>;base64,<payload>` form; the
/// payload is handed to Vertex verbatim.
fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (mime_type, payload) = rest.split_once(";base64,")?;
    if !mime_type.starts_with("image/") || payload.is_empty() {
        return None;
    }
    Some((mime_type.to_string(), payload.to_string()))
}

fn tool_calls_to_parts(message: &ChatMessage) -> Vec<Part> {
    let Some(calls) = &message.tool_calls else {
        return Vec::new();
    };

    calls
        .iter()
        .filter_map(|call| {
            if call.kind != "function" {
                warn!(kind = %call.kind, "Dropping tool call of unsupported type");
                return None;
            }
            match serde_json::from_str(&call.function.arguments) {
                Ok(args) => Some(Part::FunctionCall {
                    function_call: FunctionCall {
                        name: call.function.name.clone(),
                        args: Some(args),
                    },
                }),
                Err(e) => {
                    warn!(name = %call.function.name, error = %e, "Dropping tool call with malformed arguments");
                    None
                }
            }
        })
        .collect()
}

/// A tool-result message carries stringified `{name, response}` JSON; parse
/// it into a functionResponse part.
fn function_response_part(message: &ChatMessage) -> Option<Part> {
    let text = content_text(message.content.as_ref())?;
    let response: FunctionResponse = serde_json::from_str(&text).ok()?;
    Some(Part::FunctionResponse {
        function_response: response,
    })
}

/// Warn on sequences the upstream is known to reject. Nothing here is fatal
/// and nothing is repaired; the call is sent as mapped.
fn validate_sequence(contents: &[Content]) {
    if let Some(first) = contents.first()
        && first.role != "user"
    {
        warn!(role = %first.role, "First content block is not a user message");
    }

    for pair in contents.windows(2) {
        if pair[0].role == pair[1].role {
            warn!(role = %pair[1].role, "Consecutive content blocks share a role; emitting separately");
        }
    }

    for (index, content) in contents.iter().enumerate() {
        if content.role == "model" && content.has_function_call() {
            match contents.get(index + 1) {
                Some(next) if next.role == "user" && next.has_function_response() => {
                    if contents.get(index + 2).is_none_or(|after| after.role != "model") {
                        warn!("functionResponse is not followed by a model message");
                    }
                }
                _ => warn!("functionCall is not followed by a functionResponse message"),
            }
        }
    }
}

/// Map a unary Vertex response onto an OpenAI completion.
pub fn to_openai_completion(response: &GenerateContentResponse, model: &str) -> ChatCompletion {
    let usage = usage_from(response.usage_metadata.as_ref());

    let Some(candidate) = response.first_candidate() else {
        let mut completion = ChatCompletion::new(
            model,
            vec![Choice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content: None,
                    tool_calls: None,
                },
                finish_reason: Some("error".to_string()),
            }],
            Usage::default(),
        );
        completion.error = Some(ResponseError {
            message: "Upstream response contained no candidates".to_string(),
            kind: "upstream_error".to_string(),
        });
        return completion;
    };

    let function_calls: Vec<&FunctionCall> = candidate
        .content
        .as_ref()
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|part| match part {
                    Part::FunctionCall { function_call } => Some(function_call),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    let message = if function_calls.is_empty() {
        let text = candidate
            .content
            .as_ref()
            .map(Content::joined_text)
            .unwrap_or_default();
        AssistantMessage {
            role: "assistant".to_string(),
            content: Some(text),
            tool_calls: None,
        }
    } else {
        let call_batch = Uuid::new_v4();
        let tool_calls = function_calls
            .iter()
            .enumerate()
            .map(|(index, call)| ToolCall {
                id: Some(format!("call_{call_batch}_{index}")),
                kind: "function".to_string(),
                function: FunctionSpec {
                    name: call.name.clone(),
                    arguments: call
                        .args
                        .as_ref()
                        .map(|args| args.to_string())
                        .unwrap_or_else(|| "{}".to_string()),
                },
            })
            .collect();
        AssistantMessage {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(tool_calls),
        }
    };

    ChatCompletion::new(
        model,
        vec![Choice {
            index: 0,
            message,
            finish_reason: candidate.finish_reason.and_then(finish_reason_str).map(String::from),
        }],
        usage,
    )
}

/// OpenAI rendering of a Vertex finish reason; `None` for the reasons that
/// carry no OpenAI equivalent.
pub fn finish_reason_str(reason: FinishReason) -> Option<&'static str> {
    match reason {
        FinishReason::Stop => Some("stop"),
        FinishReason::MaxTokens => Some("length"),
        FinishReason::Safety => Some("content_filter"),
        FinishReason::Recitation => Some("recitation"),
        FinishReason::Other | FinishReason::FinishReasonUnspecified | FinishReason::Unknown => None,
    }
}

fn usage_from(metadata: Option<&UsageMetadata>) -> Usage {
    metadata
        .map(|usage| Usage {
            prompt_tokens: usage.prompt_token_count.unwrap_or(0),
            completion_tokens: usage.candidates_token_count.unwrap_or(0),
            total_tokens: usage.total_token_count.unwrap_or(0),
        })
        .unwrap_or_default()
}

/// One frame of the translated SSE response.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    Chunk(ChatCompletionChunk),
    Done,
}

impl StreamFrame {
    pub fn to_event(&self) -> Event {
        match self {
            StreamFrame::Chunk(chunk) => Event::default()
                .json_data(chunk)
                .unwrap_or_else(|_| Event::default().data("{}")),
            StreamFrame::Done => Event::default().data("[DONE]"),
        }
    }
}

/// Translate a Vertex chunk stream into OpenAI SSE frames. The completion id
/// and creation time are fixed up front and reused on every frame; the
/// terminal frame is always `[DONE]`. Chunks are forwarded as they arrive,
/// and the only state kept is whether the finish-reason frame has been
/// emitted.
pub fn stream_frames<S>(upstream: S, model: String) -> impl Stream<Item = StreamFrame> + Send
where
    S: Stream<Item = Result<GenerateContentResponse>> + Send + 'static,
{
    let id = completion_id();
    let created = Utc::now().timestamp();

    stream! {
        futures::pin_mut!(upstream);
        let mut finish_sent = false;

        while let Some(item) = futures::StreamExt::next(&mut upstream).await {
            match item {
                Ok(chunk) => {
                    let Some(candidate) = chunk.first_candidate() else {
                        continue;
                    };

                    let text = candidate.content.as_ref().map(Content::joined_text).unwrap_or_default();
                    if !text.is_empty() {
                        yield StreamFrame::Chunk(ChatCompletionChunk {
                            id: id.clone(),
                            object: "chat.completion.chunk".to_string(),
                            created,
                            model: model.clone(),
                            choices: vec![ChunkChoice {
                                index: 0,
                                delta: Delta { content: Some(text) },
                                finish_reason: None,
                            }],
                            usage: None,
                            error: None,
                        });
                    }

                    if let Some(reason) = candidate.finish_reason {
                        if reason != FinishReason::FinishReasonUnspecified && !finish_sent {
                            finish_sent = true;
                            yield StreamFrame::Chunk(ChatCompletionChunk {
                                id: id.clone(),
                                object: "chat.completion.chunk".to_string(),
                                created,
                                model: model.clone(),
                                choices: vec![ChunkChoice {
                                    index: 0,
                                    delta: Delta::default(),
                                    finish_reason: finish_reason_str(reason).map(String::from),
                                }],
                                usage: chunk.usage_metadata.as_ref().map(|metadata| usage_from(Some(metadata))),
                                error: None,
                            });
                        }
                    }
                }
                Err(error) => {
                    yield StreamFrame::Chunk(ChatCompletionChunk {
                        id: id.clone(),
                        object: "chat.completion.chunk".to_string(),
                        created,
                        model: model.clone(),
                        choices: Vec::new(),
                        usage: None,
                        error: Some(ResponseError {
                            message: error.user_message(),
                            kind: "stream_error".to_string(),
                        }),
                    });
                    break;
                }
            }
        }

        yield StreamFrame::Done;
    }
}

/// Adapt a frame stream for `axum::response::sse::Sse`.
pub fn frames_to_events<S>(frames: S) -> impl Stream<Item = std::result::Result<Event, Infallible>> + Send
where
    S: Stream<Item = StreamFrame> + Send,
{
    futures::StreamExt::map(frames, |frame| Ok(frame.to_event()))
}
