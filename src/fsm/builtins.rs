//! Guards and actions shipped with the broker

use super::registry::{Action, Guard, HandlerError, HandlerRegistry};
use crate::context::ConversationContext;
use crate::mml::Stack;
use async_trait::async_trait;
use serde_json::json;

/// Register every built-in handler
pub fn register_builtins(registry: &mut HandlerRegistry) {
    registry
        .register_guard("always", Always)
        .register_guard("user_said_bye", LastMessageContains::new("bye"))
        .register_guard("user_said_hello", LastMessageContains::new("hello"))
        .register_action("greet", SendText("Hello! Say bye when you are done."))
        .register_action("goodbye", SendText("Goodbye!"))
        .register_action("echo", Echo)
        .register_action("answer_with_llm", AnswerWithLlm);
}

pub struct Always;

#[async_trait]
impl Guard for Always {
    async fn check(&self, _ctx: &mut ConversationContext) -> Result<bool, HandlerError> {
        Ok(true)
    }
}

/// True when the latest human turn contains `needle` as a word, ignoring case
pub struct LastMessageContains {
    needle: String,
}

impl LastMessageContains {
    pub fn new(needle: impl Into<String>) -> Self {
        Self {
            needle: needle.into().to_lowercase(),
        }
    }
}

#[async_trait]
impl Guard for LastMessageContains {
    async fn check(&self, ctx: &mut ConversationContext) -> Result<bool, HandlerError> {
        let Some(last) = ctx.last_human_mml().await? else {
            return Ok(false);
        };
        let text = last.text().to_lowercase();
        Ok(text
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| word == self.needle))
    }
}

pub struct SendText(pub &'static str);

#[async_trait]
impl Action for SendText {
    async fn run(&self, ctx: &mut ConversationContext) -> Result<(), HandlerError> {
        ctx.send_response(vec![Stack::text(self.0)]).await?;
        Ok(())
    }
}

pub struct Echo;

#[async_trait]
impl Action for Echo {
    async fn run(&self, ctx: &mut ConversationContext) -> Result<(), HandlerError> {
        if let Some(last) = ctx.last_human_mml().await? {
            ctx.send_response(last.stacks).await?;
        }
        Ok(())
    }
}

/// Stream an LLM answer to the latest human turn. Every partial result is
/// emitted as its own bot turn as soon as it is drained.
pub struct AnswerWithLlm;

#[async_trait]
impl Action for AnswerWithLlm {
    async fn run(&self, ctx: &mut ConversationContext) -> Result<(), HandlerError> {
        let model = ctx
            .settings()
            .default_model
            .clone()
            .ok_or_else(|| HandlerError::new("no default model configured"))?;
        let input = ctx
            .last_human_mml()
            .await?
            .map(|m| m.text())
            .ok_or_else(|| HandlerError::new("nothing to answer: conversation has no human turn"))?;

        let channel = ctx.send_llm_request(&model, &input).await?;
        let relayed = relay_answer(ctx, &channel, &model).await;
        ctx.close_channel(&channel);
        relayed
    }
}

/// Forward each streamed result as its own bot turn until the final one.
/// A result flagged with a worker error fails the action after whatever text
/// it carries has been sent.
async fn relay_answer(
    ctx: &mut ConversationContext,
    channel: &str,
    model: &str,
) -> Result<(), HandlerError> {
    loop {
        let batch = ctx.next_batch(channel).await?;
        for result in batch.results {
            if !result.res.is_empty() || result.error.is_none() {
                let references: Vec<&str> = result.context.iter().map(|r| r.url.as_str()).collect();
                let stack = Stack::lm_generated_text(json!({
                    "model_response": result.res,
                    "finish": result.is_final,
                    "references": references,
                    "model": model,
                    "lm_msg_id": result.lm_msg_id,
                }));
                ctx.send_response(vec![stack]).await?;
            }
            if let Some(error) = result.error {
                return Err(HandlerError::new(format!("worker failed to answer: {error}")));
            }
        }
        if !batch.more {
            return Ok(());
        }
    }
}
