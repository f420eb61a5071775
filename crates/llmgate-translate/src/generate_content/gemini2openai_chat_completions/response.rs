use llmgate_protocol::gemini::count_tokens::types::Part as GeminiPart;
use llmgate_protocol::gemini::generate_content::response::GenerateContentResponse;
use llmgate_protocol::gemini::generate_content::types::{Candidate, FinishReason, UsageMetadata};
use llmgate_protocol::openai::create_chat_completions::response::{
    ChatCompletionChoice, ChatCompletionObjectType, CreateChatCompletionResponse,
};
use llmgate_protocol::openai::create_chat_completions::types::{
    ChatCompletionFinishReason, ChatCompletionFunctionCall, ChatCompletionMessageToolCall,
    ChatCompletionMessageToolCallFunction, ChatCompletionResponseMessage,
    ChatCompletionResponseRole, CompletionTokensDetails, CompletionUsage, PromptTokensDetails,
};

/// Convert an upstream Gemini generate-content response into an OpenAI chat-completions response.
pub fn transform_response(
    response: GenerateContentResponse,
    requested_model: &str,
) -> CreateChatCompletionResponse {
    let id = response
        .response_id
        .clone()
        .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()));
    let model = response
        .model_version
        .clone()
        .map(|version| version.strip_prefix("models/").unwrap_or(&version).to_string())
        .unwrap_or_else(|| requested_model.to_string());

    let choices = response
        .candidates
        .iter()
        .enumerate()
        .map(|(idx, candidate)| map_candidate_to_choice(candidate, idx))
        .collect::<Vec<_>>();

    CreateChatCompletionResponse {
        id,
        object: ChatCompletionObjectType::ChatCompletion,
        created: time::OffsetDateTime::now_utc().unix_timestamp(),
        model,
        choices,
        usage: response.usage_metadata.as_ref().map(map_usage),
        service_tier: None,
        system_fingerprint: None,
    }
}

fn map_candidate_to_choice(candidate: &Candidate, idx: usize) -> ChatCompletionChoice {
    let message = map_content_to_message(candidate);
    let has_tool_calls = message.tool_calls.is_some() || message.function_call.is_some();
    let base_reason = candidate
        .finish_reason
        .map(map_finish_reason)
        .unwrap_or(ChatCompletionFinishReason::Stop);
    // A function-call part always wins over a plain STOP/length marker; a
    // safety block on the same turn still takes priority over tool_calls.
    let finish_reason = if has_tool_calls && base_reason == ChatCompletionFinishReason::Stop {
        ChatCompletionFinishReason::ToolCalls
    } else {
        base_reason
    };
    ChatCompletionChoice {
        index: candidate.index.map(|value| value as i64).unwrap_or(idx as i64),
        message,
        finish_reason,
        logprobs: None,
    }
}

fn map_content_to_message(candidate: &Candidate) -> ChatCompletionResponseMessage {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut function_call = None;

    for part in &candidate.content.parts {
        if let Some(part_text) = extract_part_text(part) {
            text.push_str(&part_text);
        }

        if let Some(call) = &part.function_call {
            let arguments = call
                .args
                .as_ref()
                .and_then(|value| serde_json::to_string(value).ok())
                .unwrap_or_else(|| "{}".to_string());
            match &call.id {
                Some(id) => tool_calls.push(ChatCompletionMessageToolCall::Function {
                    id: id.clone(),
                    function: ChatCompletionMessageToolCallFunction {
                        name: call.name.clone(),
                        arguments,
                    },
                }),
                None => {
                    function_call = Some(ChatCompletionFunctionCall {
                        name: call.name.clone(),
                        arguments,
                    });
                }
            }
        }
    }

    ChatCompletionResponseMessage {
        role: ChatCompletionResponseRole::Assistant,
        content: if text.is_empty() { None } else { Some(text) },
        refusal: None,
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        annotations: None,
        function_call,
        audio: None,
    }
}

fn extract_part_text(part: &GeminiPart) -> Option<String> {
    if let Some(text) = &part.text {
        if !text.is_empty() {
            return Some(text.clone());
        }
    }
    if let Some(result) = &part.code_execution_result {
        return serde_json::to_string(result).ok();
    }
    if let Some(code) = &part.executable_code {
        return serde_json::to_string(code).ok();
    }
    None
}

fn map_finish_reason(reason: FinishReason) -> ChatCompletionFinishReason {
    match reason {
        FinishReason::Stop => ChatCompletionFinishReason::Stop,
        FinishReason::MaxTokens => ChatCompletionFinishReason::Length,
        FinishReason::MalformedFunctionCall
        | FinishReason::UnexpectedToolCall
        | FinishReason::TooManyToolCalls => ChatCompletionFinishReason::ToolCalls,
        FinishReason::Safety
        | FinishReason::Blocklist
        | FinishReason::ProhibitedContent
        | FinishReason::Spii
        | FinishReason::ImageSafety
        | FinishReason::ImageProhibitedContent
        | FinishReason::ImageRecitation
        | FinishReason::NoImage
        | FinishReason::Recitation => ChatCompletionFinishReason::ContentFilter,
        _ => ChatCompletionFinishReason::Stop,
    }
}

fn map_usage(usage: &UsageMetadata) -> CompletionUsage {
    let prompt_tokens = usage.prompt_token_count.unwrap_or(0) as i64;
    let completion_tokens = usage.candidates_token_count.unwrap_or(0) as i64;
    let total_tokens = usage
        .total_token_count
        .map(|value| value as i64)
        .unwrap_or_else(|| prompt_tokens + completion_tokens);

    CompletionUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
        completion_tokens_details: Some(CompletionTokensDetails {
            accepted_prediction_tokens: None,
            audio_tokens: None,
            reasoning_tokens: usage.thoughts_token_count.map(|value| value as i64),
            rejected_prediction_tokens: None,
        }),
        prompt_tokens_details: Some(PromptTokensDetails {
            audio_tokens: None,
            cached_tokens: usage.cached_content_token_count.map(|value| value as i64),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response_from(value: serde_json::Value) -> GenerateContentResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn plain_text_response_maps_to_single_choice() {
        let response = response_from(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "hello there"}]},
                "finishReason": "STOP"
            }],
            "modelVersion": "models/gemini-2.5-flash",
            "responseId": "resp-1"
        }));
        let openai = transform_response(response, "gemini-2.5-flash");
        assert_eq!(openai.id, "resp-1");
        assert_eq!(openai.model, "gemini-2.5-flash");
        assert_eq!(openai.choices.len(), 1);
        let choice = &openai.choices[0];
        assert_eq!(choice.message.content.as_deref(), Some("hello there"));
        assert_eq!(choice.finish_reason, ChatCompletionFinishReason::Stop);
    }

    #[test]
    fn missing_response_id_falls_back_to_generated_chatcmpl_id() {
        let response = response_from(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "hi"}]},
                "finishReason": "STOP"
            }]
        }));
        let openai = transform_response(response, "gemini-2.5-flash");
        assert!(openai.id.starts_with("chatcmpl-"));
    }

    #[test]
    fn function_call_part_overrides_stop_finish_reason_to_tool_calls() {
        let response = response_from(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{
                        "functionCall": {"id": "call_1", "name": "get_weather", "args": {"city": "nyc"}}
                    }]
                },
                "finishReason": "STOP"
            }]
        }));
        let openai = transform_response(response, "gemini-2.5-flash");
        let choice = &openai.choices[0];
        assert_eq!(choice.finish_reason, ChatCompletionFinishReason::ToolCalls);
        let tool_calls = choice.message.tool_calls.as_ref().unwrap();
        match &tool_calls[0] {
            ChatCompletionMessageToolCall::Function { id, function } => {
                assert_eq!(id, "call_1");
                assert_eq!(function.name, "get_weather");
                assert_eq!(function.arguments, json!({"city": "nyc"}).to_string());
            }
            other => panic!("expected a function tool call, got {other:?}"),
        }
    }

    #[test]
    fn safety_finish_reason_is_not_overridden_by_tool_calls() {
        let response = response_from(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{
                        "functionCall": {"id": "call_1", "name": "get_weather", "args": {}}
                    }]
                },
                "finishReason": "SAFETY"
            }]
        }));
        let openai = transform_response(response, "gemini-2.5-flash");
        assert_eq!(
            openai.choices[0].finish_reason,
            ChatCompletionFinishReason::ContentFilter
        );
    }

    #[test]
    fn function_call_without_id_becomes_legacy_function_call() {
        let response = response_from(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{
                        "functionCall": {"name": "get_weather", "args": {"city": "nyc"}}
                    }]
                },
                "finishReason": "STOP"
            }]
        }));
        let openai = transform_response(response, "gemini-2.5-flash");
        let function_call = openai.choices[0].message.function_call.as_ref().unwrap();
        assert_eq!(function_call.name, "get_weather");
        assert!(openai.choices[0].message.tool_calls.is_none());
    }

    #[test]
    fn usage_metadata_maps_prompt_and_completion_tokens() {
        let response = response_from(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "hi"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": 10,
                "candidatesTokenCount": 5,
                "totalTokenCount": 15,
                "thoughtsTokenCount": 2,
                "cachedContentTokenCount": 3
            }
        }));
        let openai = transform_response(response, "gemini-2.5-flash");
        let usage = openai.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
        assert_eq!(usage.total_tokens, 15);
        assert_eq!(
            usage.completion_tokens_details.unwrap().reasoning_tokens,
            Some(2)
        );
        assert_eq!(usage.prompt_tokens_details.unwrap().cached_tokens, Some(3));
    }

    #[test]
    fn model_version_strips_models_prefix() {
        let response = response_from(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "hi"}]},
                "finishReason": "STOP"
            }],
            "modelVersion": "models/gemini-2.5-pro"
        }));
        let openai = transform_response(response, "gemini-2.5-flash");
        assert_eq!(openai.model, "gemini-2.5-pro");
    }

    #[test]
    fn max_tokens_finish_reason_maps_to_length() {
        let response = response_from(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "hi"}]},
                "finishReason": "MAX_TOKENS"
            }]
        }));
        let openai = transform_response(response, "gemini-2.5-flash");
        assert_eq!(openai.choices[0].finish_reason, ChatCompletionFinishReason::Length);
    }
}
