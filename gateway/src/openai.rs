//! OpenAI-compatible completion types and the translation to native
//! worker options.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use fleet_common::{FinishReason, GenerationOptions};

use crate::error::ApiError;
use crate::scheduler::CompletionInfo;

/// `prompt` accepts a string, an array of strings, or token arrays.
/// Token arrays are rejected at validation time.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PromptInput {
    Text(String),
    Batch(Vec<String>),
    Tokens(Vec<i64>),
    TokenBatches(Vec<Vec<i64>>),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum StopInput {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,
}

/// OpenAI-compatible completion request.
///
/// `n`, `best_of`, `logprobs`, and `logit_bias` are accepted for
/// compatibility and ignored; responses always carry `logprobs: null` and a
/// single choice.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt: Option<PromptInput>,
    #[serde(default)]
    pub suffix: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub stream_options: Option<StreamOptions>,
    #[serde(default)]
    pub logprobs: Option<u32>,
    #[serde(default)]
    pub echo: Option<bool>,
    #[serde(default)]
    pub stop: Option<StopInput>,
    #[serde(default)]
    pub presence_penalty: Option<f64>,
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
    #[serde(default)]
    pub best_of: Option<u32>,
    #[serde(default)]
    pub logit_bias: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub user: Option<String>,
}

/// A completion request translated to native terms.
#[derive(Debug, Clone)]
pub struct TranslatedCompletion {
    pub model: String,
    pub prompt: String,
    pub suffix: Option<String>,
    pub options: GenerationOptions,
    pub stream: bool,
    pub echo: bool,
    pub include_usage: bool,
}

/// Translate an OpenAI completion request into worker options.
///
/// Parameters at their OpenAI defaults (`temperature` 1, `top_p` 1,
/// `max_tokens` 16, zero penalties) are omitted from the options bag.
pub fn translate_completion(request: CompletionRequest) -> Result<TranslatedCompletion, ApiError> {
    let model = request
        .model
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ApiError::validation("model is required", "model"))?;

    let prompt = match request.prompt {
        Some(PromptInput::Text(text)) => text,
        Some(PromptInput::Batch(parts)) => parts.join("\n"),
        Some(PromptInput::Tokens(_)) | Some(PromptInput::TokenBatches(_)) => {
            return Err(ApiError::validation(
                "token-array prompts are not supported; pass a string or array of strings",
                "prompt",
            ));
        }
        None => {
            return Err(ApiError::validation("prompt is required", "prompt"));
        }
    };

    let mut options = GenerationOptions::new();
    if let Some(temperature) = request.temperature {
        if temperature != 1.0 {
            options.insert("temperature".to_string(), json!(temperature));
        }
    }
    if let Some(top_p) = request.top_p {
        if top_p != 1.0 {
            options.insert("top_p".to_string(), json!(top_p));
        }
    }
    if let Some(max_tokens) = request.max_tokens {
        if max_tokens != 16 {
            options.insert("num_predict".to_string(), json!(max_tokens));
        }
    }
    if let Some(seed) = request.seed {
        options.insert("seed".to_string(), json!(seed));
    }
    match request.stop {
        Some(StopInput::One(stop)) => {
            options.insert("stop".to_string(), json!([stop]));
        }
        Some(StopInput::Many(stops)) => {
            options.insert("stop".to_string(), json!(stops));
        }
        None => {}
    }
    if let Some(penalty) = request.frequency_penalty {
        if penalty != 0.0 {
            options.insert("frequency_penalty".to_string(), json!(penalty));
        }
    }
    if let Some(penalty) = request.presence_penalty {
        if penalty != 0.0 {
            options.insert("presence_penalty".to_string(), json!(penalty));
        }
    }

    Ok(TranslatedCompletion {
        model,
        prompt,
        suffix: request.suffix,
        options,
        stream: request.stream.unwrap_or(false),
        echo: request.echo.unwrap_or(false),
        include_usage: request
            .stream_options
            .map(|o| o.include_usage)
            .unwrap_or(false),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl From<CompletionInfo> for CompletionUsage {
    fn from(info: CompletionInfo) -> Self {
        Self {
            prompt_tokens: info.prompt_tokens,
            completion_tokens: info.completion_tokens,
            total_tokens: info.prompt_tokens + info.completion_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub text: String,
    pub index: u32,
    /// Always null; logprobs are accepted but not computed.
    pub logprobs: Option<Value>,
    pub finish_reason: Option<String>,
}

/// Completions object, also used as the streaming frame shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<CompletionUsage>,
}

impl CompletionResponse {
    pub fn new(
        job_id: Uuid,
        model: String,
        text: String,
        finish_reason: Option<FinishReason>,
    ) -> Self {
        Self {
            id: format!("cmpl-{}", job_id),
            object: "text_completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model,
            choices: vec![CompletionChoice {
                text,
                index: 0,
                logprobs: None,
                finish_reason: finish_reason.map(|r| r.as_str().to_string()),
            }],
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: CompletionUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> CompletionRequest {
        CompletionRequest {
            model: Some("m1".to_string()),
            prompt: Some(PromptInput::Text("Hi".to_string())),
            ..Default::default()
        }
    }

    #[test]
    fn test_translate_minimal() {
        let translated = translate_completion(base_request()).unwrap();
        assert_eq!(translated.model, "m1");
        assert_eq!(translated.prompt, "Hi");
        assert!(translated.options.is_empty());
        assert!(!translated.stream);
        assert!(!translated.echo);
        assert!(!translated.include_usage);
    }

    #[test]
    fn test_translate_defaults_omitted() {
        let request = CompletionRequest {
            temperature: Some(1.0),
            top_p: Some(1.0),
            max_tokens: Some(16),
            frequency_penalty: Some(0.0),
            presence_penalty: Some(0.0),
            ..base_request()
        };
        let translated = translate_completion(request).unwrap();
        assert!(translated.options.is_empty());
    }

    #[test]
    fn test_translate_options_mapped() {
        let request = CompletionRequest {
            temperature: Some(0.7),
            top_p: Some(0.9),
            max_tokens: Some(128),
            seed: Some(42),
            frequency_penalty: Some(0.5),
            presence_penalty: Some(-0.5),
            ..base_request()
        };
        let translated = translate_completion(request).unwrap();
        assert_eq!(translated.options["temperature"], json!(0.7));
        assert_eq!(translated.options["top_p"], json!(0.9));
        assert_eq!(translated.options["num_predict"], json!(128));
        assert_eq!(translated.options["seed"], json!(42));
        assert_eq!(translated.options["frequency_penalty"], json!(0.5));
        assert_eq!(translated.options["presence_penalty"], json!(-0.5));
        assert!(translated.options.get("max_tokens").is_none());
    }

    #[test]
    fn test_translate_stop_coerced_to_sequence() {
        let request = CompletionRequest {
            stop: Some(StopInput::One("\n".to_string())),
            ..base_request()
        };
        let translated = translate_completion(request).unwrap();
        assert_eq!(translated.options["stop"], json!(["\n"]));

        let request = CompletionRequest {
            stop: Some(StopInput::Many(vec!["a".to_string(), "b".to_string()])),
            ..base_request()
        };
        let translated = translate_completion(request).unwrap();
        assert_eq!(translated.options["stop"], json!(["a", "b"]));
    }

    #[test]
    fn test_translate_prompt_batch_joined() {
        let request = CompletionRequest {
            prompt: Some(PromptInput::Batch(vec![
                "one".to_string(),
                "two".to_string(),
            ])),
            ..base_request()
        };
        let translated = translate_completion(request).unwrap();
        assert_eq!(translated.prompt, "one\ntwo");
    }

    #[test]
    fn test_translate_rejects_token_prompts() {
        let request = CompletionRequest {
            prompt: Some(PromptInput::Tokens(vec![1, 2, 3])),
            ..base_request()
        };
        let err = translate_completion(request).unwrap_err();
        assert_eq!(err.body()["error"]["param"], "prompt");
    }

    #[test]
    fn test_translate_requires_model_and_prompt() {
        let request = CompletionRequest {
            model: None,
            ..base_request()
        };
        assert!(translate_completion(request).is_err());

        let request = CompletionRequest {
            prompt: None,
            ..base_request()
        };
        assert!(translate_completion(request).is_err());
    }

    #[test]
    fn test_translate_ignored_fields_accepted() {
        let request = CompletionRequest {
            n: Some(3),
            best_of: Some(5),
            logprobs: Some(2),
            logit_bias: Some(serde_json::Map::new()),
            ..base_request()
        };
        let translated = translate_completion(request).unwrap();
        assert!(translated.options.get("n").is_none());
        assert!(translated.options.get("best_of").is_none());
    }

    #[test]
    fn test_translate_stream_options() {
        let request = CompletionRequest {
            stream: Some(true),
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
            ..base_request()
        };
        let translated = translate_completion(request).unwrap();
        assert!(translated.stream);
        assert!(translated.include_usage);
    }

    #[test]
    fn test_prompt_input_deserialization() {
        let text: PromptInput = serde_json::from_str(r#""hello""#).unwrap();
        assert_eq!(text, PromptInput::Text("hello".to_string()));

        let batch: PromptInput = serde_json::from_str(r#"["a", "b"]"#).unwrap();
        assert_eq!(
            batch,
            PromptInput::Batch(vec!["a".to_string(), "b".to_string()])
        );

        let tokens: PromptInput = serde_json::from_str(r#"[1, 2]"#).unwrap();
        assert_eq!(tokens, PromptInput::Tokens(vec![1, 2]));

        let batches: PromptInput = serde_json::from_str(r#"[[1], [2]]"#).unwrap();
        assert_eq!(batches, PromptInput::TokenBatches(vec![vec![1], vec![2]]));
    }

    #[test]
    fn test_completion_response_shape() {
        let job_id = Uuid::new_v4();
        let response = CompletionResponse::new(
            job_id,
            "m1".to_string(),
            "Hello".to_string(),
            Some(FinishReason::Stop),
        );
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["id"], format!("cmpl-{}", job_id));
        assert_eq!(json["object"], "text_completion");
        assert_eq!(json["choices"][0]["index"], 0);
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
        // logprobs is always present and null.
        assert!(json["choices"][0].get("logprobs").is_some());
        assert!(json["choices"][0]["logprobs"].is_null());
        // usage omitted until set.
        assert!(json.get("usage").is_none());
    }

    #[test]
    fn test_completion_response_with_usage() {
        let response = CompletionResponse::new(
            Uuid::new_v4(),
            "m1".to_string(),
            "Hello".to_string(),
            Some(FinishReason::Stop),
        )
        .with_usage(CompletionUsage {
            prompt_tokens: 1,
            completion_tokens: 2,
            total_tokens: 3,
        });
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["usage"]["total_tokens"], 3);
    }
}
