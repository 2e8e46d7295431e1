//! Bridges rig-core's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::OneOrMany;
use rig::completion::{AssistantContent, CompletionModel};
use rig::message::Message;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

pub struct RigAdapter<M: CompletionModel> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

/// Split our flat message list into rig's shape: a preamble built from all
/// system messages, the prior turns, and the final user prompt.
fn split_messages(messages: Vec<ChatMessage>) -> (String, Vec<Message>, Option<Message>) {
    let mut preamble = Vec::new();
    let mut turns: Vec<Message> = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => preamble.push(msg.content),
            Role::User => turns.push(Message::user(msg.content)),
            Role::Assistant => turns.push(Message::assistant(msg.content)),
        }
    }
    let prompt = turns.pop();
    (preamble.join("\n\n"), turns, prompt)
}

fn collect_text(choice: &OneOrMany<AssistantContent>) -> String {
    choice
        .iter()
        .filter_map(|c| match c {
            AssistantContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (preamble, history, prompt) = split_messages(request.messages);
        let prompt = prompt.ok_or_else(|| LlmError::RequestFailed {
            provider: self.model_name.clone(),
            reason: "request has no user message".to_string(),
        })?;

        let mut builder = self.model.completion_request(prompt).messages(history);
        if !preamble.is_empty() {
            builder = builder.preamble(preamble);
        }
        if let Some(t) = request.temperature {
            builder = builder.temperature(f64::from(t));
        }
        if let Some(max) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max));
        }

        let response = builder.send().await.map_err(|e| LlmError::RequestFailed {
            provider: self.model_name.clone(),
            reason: e.to_string(),
        })?;

        let content = collect_text(&response.choice);
        if content.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.model_name.clone(),
                reason: "response contained no text".to_string(),
            });
        }

        tracing::debug!(
            model = %self.model_name,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "LLM completion"
        );

        Ok(CompletionResponse {
            content,
            input_tokens: response.usage.input_tokens as u32,
            output_tokens: response.usage.output_tokens as u32,
            finish_reason: FinishReason::Stop,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_moves_system_to_preamble_and_last_turn_to_prompt() {
        let (preamble, history, prompt) = split_messages(vec![
            ChatMessage::system("You classify."),
            ChatMessage::user("first"),
            ChatMessage::assistant("ok"),
            ChatMessage::system("Reply in JSON."),
            ChatMessage::user("second"),
        ]);
        assert_eq!(preamble, "You classify.\n\nReply in JSON.");
        assert_eq!(history.len(), 2);
        assert_eq!(prompt, Some(Message::user("second")));
    }

    #[test]
    fn split_without_turns_has_no_prompt() {
        let (_, history, prompt) = split_messages(vec![ChatMessage::system("only system")]);
        assert!(history.is_empty());
        assert!(prompt.is_none());
    }
}
