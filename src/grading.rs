use crate::config::{GraderConfig, ScoreScale};
use crate::error::GradingError;
use crate::models::Criterion;
use anyhow::{Context, Result};
use async_openai::types::{
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
};
use async_openai::{Client, config::OpenAIConfig};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

const JUDGE_SYSTEM_PROMPT: &str =
    "You are a strict, impartial grader of answers produced by a documentation assistant.";

/// What the judge sees for one dataset item
#[derive(Debug, Clone, Copy)]
pub struct GradingInput<'a> {
    pub question: &'a str,
    pub prediction: &'a str,
    pub reference: &'a str,
}

/// Scores generated answers against a reference answer
#[async_trait]
pub trait Grader: Send {
    /// Score on the configured scale for one criterion
    async fn score(&mut self, criterion: Criterion, input: &GradingInput<'_>) -> Result<f64>;

    /// Binary QA verdict: does the prediction agree with the reference?
    async fn is_correct(&mut self, input: &GradingInput<'_>) -> Result<bool>;
}

/// LLM-as-judge grader over an OpenAI-compatible chat API, with rate limiting
pub struct LlmGrader {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f64,
    rate_limit_rps: f64,
    scale: ScoreScale,
    last_request: Option<Instant>,
}

impl LlmGrader {
    /// Build a grader, reading the API key from the configured environment variable
    pub fn from_config(config: &GraderConfig, scale: ScoreScale) -> Result<Self> {
        let api_key = std::env::var(&config.env_var_api_key)
            .with_context(|| format!("Environment variable {} not found", config.env_var_api_key))?;
        Ok(Self::new(api_key, config, scale))
    }

    pub fn new(api_key: String, config: &GraderConfig, scale: ScoreScale) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(&config.api_endpoint);

        Self {
            client: Client::with_config(openai_config),
            model: config.model.clone(),
            temperature: config.temperature,
            rate_limit_rps: config.rate_limit_rps,
            scale,
            last_request: None,
        }
    }

    /// Enforce rate limiting for judge requests
    async fn enforce_rate_limit(last_request: &mut Option<Instant>, rate_limit_rps: f64) {
        if rate_limit_rps <= 0.0 {
            return;
        }

        let min_interval = Duration::from_secs_f64(1.0 / rate_limit_rps);

        if let Some(last_time) = *last_request {
            let elapsed = last_time.elapsed();
            if elapsed < min_interval {
                sleep(min_interval - elapsed).await;
            }
        }

        *last_request = Some(Instant::now());
    }

    async fn ask_judge(&mut self, prompt: String) -> Result<String> {
        Self::enforce_rate_limit(&mut self.last_request, self.rate_limit_rps).await;

        let request = self.build_request(prompt)?;
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .context("Failed to get judge response")?;

        Ok(extract_content(response))
    }

    fn build_request(&self, prompt: String) -> Result<CreateChatCompletionRequest> {
        let system_message = ChatCompletionRequestSystemMessageArgs::default()
            .content(JUDGE_SYSTEM_PROMPT.to_string())
            .build()
            .context("Failed to build judge system message")?
            .into();

        let user_message = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt)
            .build()
            .context("Failed to build judge user message")?
            .into();

        CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([system_message, user_message])
            .temperature(self.temperature as f32)
            .build()
            .context("Failed to build judge completion request")
    }
}

#[async_trait]
impl Grader for LlmGrader {
    async fn score(&mut self, criterion: Criterion, input: &GradingInput<'_>) -> Result<f64> {
        let prompt = build_score_prompt(criterion, input, &self.scale);
        let reply = self.ask_judge(prompt).await?;
        debug!(criterion = criterion.name(), %reply, "judge reply");

        let rating = parse_rating(&reply)?;
        let score = self.scale.clamp(rating);
        if score != rating {
            warn!(
                criterion = criterion.name(),
                rating,
                score,
                "judge rating outside score scale, clamped"
            );
        }
        Ok(score)
    }

    async fn is_correct(&mut self, input: &GradingInput<'_>) -> Result<bool> {
        let reply = self.ask_judge(build_qa_prompt(input)).await?;
        debug!(%reply, "judge verdict");
        Ok(parse_verdict(&reply)?)
    }
}

fn extract_content(response: CreateChatCompletionResponse) -> String {
    match response.choices.first() {
        Some(choice) => match &choice.message.content {
            Some(content) => content.clone(),
            None => String::new(),
        },
        None => String::new(),
    }
}

/// Labelled scoring prompt: criterion, reference, question and answer
fn build_score_prompt(
    criterion: Criterion,
    input: &GradingInput<'_>,
    scale: &ScoreScale,
) -> String {
    format!(
        "Grade the assistant's answer on a single criterion.\n\
         Criterion ({name}): {description}\n\n\
         Use the reference answer as ground truth. Explain your reasoning in a few sentences, \
         then rate the answer from {min} to {max} using exactly this format on the last line: \
         \"Rating: [[N]]\".\n\n\
         [Reference answer]\n{reference}\n\n\
         [Question]\n{question}\n\n\
         [Assistant's answer]\n{prediction}\n",
        name = criterion.name(),
        description = criterion.description(),
        min = scale.min,
        max = scale.max,
        reference = input.reference,
        question = input.question,
        prediction = input.prediction,
    )
}

fn build_qa_prompt(input: &GradingInput<'_>) -> String {
    format!(
        "You are grading a student answer against a reference answer. Ignore differences in \
         wording and punctuation; grade only factual agreement. It is fine for the student answer \
         to contain more information than the reference as long as nothing conflicts.\n\n\
         QUESTION: {question}\n\
         REFERENCE ANSWER: {reference}\n\
         STUDENT ANSWER: {prediction}\n\n\
         Reply with exactly one line: \"GRADE: CORRECT\" or \"GRADE: INCORRECT\".",
        question = input.question,
        reference = input.reference,
        prediction = input.prediction,
    )
}

/// Reads the last `[[N]]` in the judge's reply
fn parse_rating(reply: &str) -> Result<f64, GradingError> {
    let start = reply
        .rfind("[[")
        .ok_or_else(|| GradingError::MissingRating(reply.to_string()))?;
    let rest = &reply[start + 2..];
    let end = rest
        .find("]]")
        .ok_or_else(|| GradingError::MissingRating(reply.to_string()))?;

    let raw = rest[..end].trim();
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| GradingError::InvalidRating(raw.to_string()))
}

fn parse_verdict(reply: &str) -> Result<bool, GradingError> {
    let upper = reply.to_uppercase();
    let verdict = match upper.rfind("GRADE:") {
        Some(pos) => upper[pos + "GRADE:".len()..].trim_start().to_string(),
        None => upper.trim().to_string(),
    };

    if verdict.starts_with("INCORRECT") {
        Ok(false)
    } else if verdict.starts_with("CORRECT") {
        Ok(true)
    } else {
        Err(GradingError::MissingVerdict(reply.to_string()))
    }
}
