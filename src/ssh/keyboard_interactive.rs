//! Keyboard-interactive challenge/response payloads
//!
//! The server may send any number of info requests, each with zero or more
//! prompts. Every prompt is answered through the shared [`PromptGate`]; a
//! cancelled prompt abandons the whole exchange.

use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use super::prompt::PromptGate;

/// Keyboard-interactive prompt from server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbiPrompt {
    /// The prompt text to display
    pub prompt: String,
    /// true = show input (echo), false = mask input (password-style)
    pub echo: bool,
}

/// One info request from the server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbiRequest {
    /// Display name from server (may be empty)
    pub name: String,
    /// Instructions from server (may be empty)
    pub instructions: String,
    pub prompts: Vec<KbiPrompt>,
}

impl KbiRequest {
    /// Text shown for the prompt at `index`
    fn message(&self, index: usize) -> String {
        let prompt = self.prompts[index].prompt.trim_end();
        let instructions = self.instructions.trim();
        if index == 0 && !instructions.is_empty() {
            format!("{}\n{}", instructions, prompt)
        } else {
            prompt.to_string()
        }
    }

    /// Collect one answer per prompt, in order
    ///
    /// `None` when the user cancels any of them.
    pub async fn answer(&self, prompt: &PromptGate) -> Option<Vec<Zeroizing<String>>> {
        let mut responses = Vec::with_capacity(self.prompts.len());
        for index in 0..self.prompts.len() {
            match prompt.secret(&self.message(index)).await {
                Some(response) => responses.push(response),
                None => {
                    debug!(
                        "Keyboard-interactive prompt {} of {} cancelled",
                        index + 1,
                        self.prompts.len()
                    );
                    return None;
                }
            }
        }
        Some(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedPrompt;
    use std::sync::Arc;

    fn request(prompts: &[&str]) -> KbiRequest {
        KbiRequest {
            name: String::new(),
            instructions: "Two-factor login".into(),
            prompts: prompts
                .iter()
                .map(|p| KbiPrompt {
                    prompt: p.to_string(),
                    echo: false,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_answers_every_prompt_in_order() {
        let scripted = Arc::new(
            ScriptedPrompt::default()
                .secret(Some("hunter2"))
                .secret(Some("123456")),
        );
        let gate = PromptGate::new(scripted.clone());

        let answers = request(&["Password: ", "Code: "]).answer(&gate).await.unwrap();
        let answers: Vec<&str> = answers.iter().map(|a| a.as_str()).collect();
        assert_eq!(answers, vec!["hunter2", "123456"]);
        assert_eq!(
            scripted.secret_messages(),
            vec!["Two-factor login\nPassword:".to_string(), "Code:".to_string()]
        );
    }

    #[tokio::test]
    async fn test_empty_request_needs_no_input() {
        let scripted = Arc::new(ScriptedPrompt::default());
        let gate = PromptGate::new(scripted.clone());
        assert_eq!(request(&[]).answer(&gate).await.map(|a| a.len()), Some(0));
        assert_eq!(scripted.secrets_asked(), 0);
    }

    #[tokio::test]
    async fn test_cancel_abandons_exchange() {
        let scripted = Arc::new(ScriptedPrompt::default().secret(Some("a")).secret(None));
        let gate = PromptGate::new(scripted);
        assert!(request(&["One", "Two", "Three"]).answer(&gate).await.is_none());
    }
}
