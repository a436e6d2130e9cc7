use crate::config::AssistantConfig;
use crate::models::ConversationTurn;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// A retrieval-augmented generation chain answering with awareness of prior turns
#[async_trait]
pub trait RagChain: Send + Sync {
    async fn invoke(&self, question: &str, history: &[ConversationTurn]) -> Result<String>;
}

/// Client for a chain served with the LangServe `/invoke` protocol
pub struct LangServeChain {
    invoke_url: String,
    prompt_version: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct InvokeResponse {
    output: Value,
}

impl LangServeChain {
    pub fn new(config: &AssistantConfig) -> Self {
        Self {
            invoke_url: format!("{}/invoke", config.endpoint.trim_end_matches('/')),
            prompt_version: config.prompt_version.clone(),
            http: reqwest::Client::new(),
        }
    }

    fn build_body(&self, question: &str, history: &[ConversationTurn]) -> Value {
        let chat_history: Vec<[&str; 2]> = history
            .iter()
            .map(|turn| [turn.question.as_str(), turn.answer.as_str()])
            .collect();

        json!({
            "input": { "question": question, "chat_history": chat_history },
            "config": { "configurable": { "prompt_version": self.prompt_version } },
        })
    }
}

#[async_trait]
impl RagChain for LangServeChain {
    async fn invoke(&self, question: &str, history: &[ConversationTurn]) -> Result<String> {
        debug!(url = %self.invoke_url, turns = history.len(), "invoking chain");

        let response = self
            .http
            .post(&self.invoke_url)
            .json(&self.build_body(question, history))
            .send()
            .await
            .with_context(|| format!("Failed to reach chain at {}", self.invoke_url))?
            .error_for_status()
            .context("Chain returned an error status")?;

        let body: InvokeResponse = response
            .json()
            .await
            .context("Failed to decode chain response")?;

        extract_answer(body.output)
    }
}

/// Chains return either `{"answer": ...}` or a bare string
fn extract_answer(output: Value) -> Result<String> {
    match output {
        Value::String(answer) => Ok(answer),
        Value::Object(mut fields) => match fields.remove("answer") {
            Some(Value::String(answer)) => Ok(answer),
            Some(other) => bail!("Chain answer is not a string: {other}"),
            None => bail!("Chain output has no `answer` field"),
        },
        other => bail!("Unexpected chain output: {other}"),
    }
}

/// The turns of one user session
#[derive(Debug, Default)]
pub struct ChatSession {
    turns: Vec<ConversationTurn>,
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the chain with the session's history. The turn is recorded only if the chain answers.
    pub async fn ask(&mut self, chain: &dyn RagChain, question: &str) -> Result<&ConversationTurn> {
        let answer = chain.invoke(question, &self.turns).await?;
        self.turns.push(ConversationTurn {
            question: question.to_string(),
            answer,
        });
        Ok(&self.turns[self.turns.len() - 1])
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// Turns in display order, newest first
    pub fn newest_first(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter().rev()
    }

    pub fn reset(&mut self) {
        self.turns.clear();
    }

    /// Tear the session down, returning how many turns it held
    pub fn end(mut self) -> usize {
        let turns = self.turns.len();
        self.reset();
        turns
    }
}

/// Interactive loop: one question per line, `/history`, `/reset`, `/exit`
pub async fn run_chat<R, W>(chain: &dyn RagChain, input: R, mut output: W) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut session = ChatSession::new();
    let mut lines = input.lines();

    output
        .write_all(b"What do you want to know? (/history, /reset, /exit)\n")
        .await?;

    while let Some(line) = lines.next_line().await? {
        let question = line.trim();
        match question {
            "" => continue,
            "/exit" | "/quit" => break,
            "/reset" => {
                session.reset();
                output.write_all(b"History cleared.\n").await?;
            }
            "/history" => {
                if session.history().is_empty() {
                    output.write_all(b"No questions yet.\n").await?;
                }
                for turn in session.newest_first() {
                    output.write_all(format_turn(turn).as_bytes()).await?;
                }
            }
            _ => {
                let turn = session.ask(chain, question).await?;
                output
                    .write_all(format!("Bot: {}\n", turn.answer).as_bytes())
                    .await?;
            }
        }
        output.flush().await?;
    }

    let turns = session.end();
    info!(turns, "chat session ended");
    Ok(turns)
}

fn format_turn(turn: &ConversationTurn) -> String {
    format!("User: {}\nBot: {}\n---\n", turn.question, turn.answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use std::sync::Mutex;

    /// Echoes the question and records the history length it was given
    struct EchoChain {
        seen_history: Mutex<Vec<usize>>,
        fail_on: Option<&'static str>,
    }

    impl EchoChain {
        fn new() -> Self {
            Self {
                seen_history: Mutex::new(Vec::new()),
                fail_on: None,
            }
        }
    }

    #[async_trait]
    impl RagChain for EchoChain {
        async fn invoke(&self, question: &str, history: &[ConversationTurn]) -> Result<String> {
            self.seen_history.lock().unwrap().push(history.len());
            if self.fail_on == Some(question) {
                bail!("chain unavailable");
            }
            Ok(format!("answer to {question}"))
        }
    }

    fn assistant_config(endpoint: &str) -> AssistantConfig {
        AssistantConfig {
            endpoint: endpoint.to_string(),
            prompt_version: "v2_resumido_directo".to_string(),
            chunk_size: 1024,
            chunk_overlap: 100,
        }
    }

    #[tokio::test]
    async fn test_session_appends_turns_with_prior_history() {
        let chain = EchoChain::new();
        let mut session = ChatSession::new();

        session.ask(&chain, "first").await.unwrap();
        session.ask(&chain, "second").await.unwrap();

        assert_eq!(*chain.seen_history.lock().unwrap(), vec![0, 1]);
        assert_eq!(session.history().len(), 2);
        let newest: Vec<&str> = session.newest_first().map(|t| t.question.as_str()).collect();
        assert_eq!(newest, vec!["second", "first"]);
        assert_eq!(session.end(), 2);
    }

    #[tokio::test]
    async fn test_session_failure_propagates_without_recording() {
        let chain = EchoChain {
            fail_on: Some("boom"),
            ..EchoChain::new()
        };
        let mut session = ChatSession::new();

        session.ask(&chain, "ok").await.unwrap();
        assert!(session.ask(&chain, "boom").await.is_err());
        assert_eq!(session.history().len(), 1);
    }

    #[tokio::test]
    async fn test_run_chat_commands() {
        let chain = EchoChain::new();
        let input: &[u8] = b"alpha\n\nbeta\n/history\n/reset\n/history\ngamma\n/exit\nignored\n";
        let mut output = Vec::new();

        let turns = run_chat(&chain, input, &mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        assert_eq!(turns, 1);
        assert!(text.contains("Bot: answer to alpha\n"));
        let beta = text.find("User: beta").unwrap();
        let alpha = text.find("User: alpha").unwrap();
        assert!(beta < alpha, "history is newest first");
        assert!(text.contains("History cleared.\nNo questions yet.\n"));
        assert!(!text.contains("ignored"));
        assert_eq!(*chain.seen_history.lock().unwrap(), vec![0, 1, 0]);
    }

    #[tokio::test]
    async fn test_langserve_chain_invoke() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/rag/invoke")
            .match_body(Matcher::PartialJson(json!({
                "input": {
                    "question": "And its mass?",
                    "chat_history": [["What is Sentinel-2?", "An imaging mission."]]
                },
                "config": { "configurable": { "prompt_version": "v2_resumido_directo" } }
            })))
            .with_header("content-type", "application/json")
            .with_body(r#"{"output": {"answer": "About 1.1 tonnes."}, "metadata": {}}"#)
            .create_async()
            .await;

        let chain = LangServeChain::new(&assistant_config(&format!("{}/rag/", server.url())));
        let history = vec![ConversationTurn {
            question: "What is Sentinel-2?".to_string(),
            answer: "An imaging mission.".to_string(),
        }];
        let answer = chain.invoke("And its mass?", &history).await.unwrap();

        mock.assert_async().await;
        assert_eq!(answer, "About 1.1 tonnes.");
    }

    #[tokio::test]
    async fn test_langserve_chain_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/invoke")
            .with_status(500)
            .create_async()
            .await;

        let chain = LangServeChain::new(&assistant_config(&server.url()));
        assert!(chain.invoke("q", &[]).await.is_err());
    }

    #[test]
    fn test_extract_answer_shapes() {
        assert_eq!(extract_answer(json!("plain")).unwrap(), "plain");
        assert_eq!(extract_answer(json!({"answer": "obj"})).unwrap(), "obj");
        assert!(extract_answer(json!({"text": "x"})).is_err());
        assert!(extract_answer(json!({"answer": 3})).is_err());
        assert!(extract_answer(json!(null)).is_err());
    }
}
