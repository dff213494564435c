//! Chat prompt rendering.
//!
//! [`build_prompt`] turns conversation history into the single prompt
//! string handed to the inference backend. Each [`PromptTemplate`] follows
//! the turn delimiters its model family was trained with; unknown names
//! render with [`PromptTemplate::Generic`].
//!
//! | Name | Family |
//! |------|--------|
//! | `chatml` | Qwen, OpenHermes, many GGUF fine-tunes |
//! | `llama2` | Llama 2 chat |
//! | `llama3` | Llama 3 instruct |
//! | `mistral` | Mistral / Mixtral instruct |
//! | `gemma` | Gemma instruct |
//! | `phi3` | Phi-3 |
//! | `zephyr` | Zephyr, TinyLlama chat |
//! | `alpaca` | Alpaca-style instruction tunes |
//!
//! Retrieved context goes into the last user turn only.

use crate::models::{ChatMessage, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptTemplate {
    ChatMl,
    Llama2,
    Llama3,
    Mistral,
    Gemma,
    Phi3,
    Zephyr,
    Alpaca,
    Generic,
}

impl PromptTemplate {
    /// Resolve a template by name, case-insensitively.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "chatml" => PromptTemplate::ChatMl,
            "llama2" | "llama-2" => PromptTemplate::Llama2,
            "llama3" | "llama-3" => PromptTemplate::Llama3,
            "mistral" => PromptTemplate::Mistral,
            "gemma" => PromptTemplate::Gemma,
            "phi3" | "phi-3" => PromptTemplate::Phi3,
            "zephyr" | "tinyllama" => PromptTemplate::Zephyr,
            "alpaca" => PromptTemplate::Alpaca,
            _ => PromptTemplate::Generic,
        }
    }

    /// Render turns (user/assistant only) with an optional system prompt,
    /// ending with an open assistant turn.
    pub fn render(&self, system: Option<&str>, turns: &[Turn<'_>]) -> String {
        let mut out = String::new();
        match self {
            PromptTemplate::ChatMl => render_chatml(&mut out, system, turns),
            PromptTemplate::Llama2 => render_llama2(&mut out, system, turns),
            PromptTemplate::Llama3 => render_llama3(&mut out, system, turns),
            PromptTemplate::Mistral => render_mistral(&mut out, system, turns),
            PromptTemplate::Gemma => render_gemma(&mut out, system, turns),
            PromptTemplate::Phi3 => render_tagged(&mut out, system, turns, "<|end|>"),
            PromptTemplate::Zephyr => render_tagged(&mut out, system, turns, "</s>"),
            PromptTemplate::Alpaca => render_alpaca(&mut out, system, turns),
            PromptTemplate::Generic => render_generic(&mut out, system, turns),
        }
        out
    }
}

/// One rendered turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn<'a> {
    pub role: Role,
    pub content: std::borrow::Cow<'a, str>,
}

/// Build the full prompt for the next assistant reply.
///
/// - Only messages with `is_complete = true` are used.
/// - System-role messages are appended to `system_prompt`.
/// - `context`, when present and non-blank, is prepended to the last user
///   turn. With no user turn it is dropped.
pub fn build_prompt(
    messages: &[ChatMessage],
    system_prompt: &str,
    template: &str,
    context: Option<&str>,
) -> String {
    let mut system_parts: Vec<&str> = Vec::new();
    if !system_prompt.trim().is_empty() {
        system_parts.push(system_prompt.trim());
    }

    let mut turns: Vec<Turn<'_>> = Vec::new();
    for msg in messages.iter().filter(|m| m.is_complete) {
        match msg.role {
            Role::System => {
                if !msg.content.trim().is_empty() {
                    system_parts.push(msg.content.trim());
                }
            }
            role => turns.push(Turn {
                role,
                content: msg.content.as_str().into(),
            }),
        }
    }

    if let Some(ctx) = context.filter(|c| !c.trim().is_empty()) {
        if let Some(last_user) = turns.iter_mut().rev().find(|t| t.role == Role::User) {
            last_user.content = with_context(ctx, &last_user.content).into();
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };

    PromptTemplate::from_name(template).render(system.as_deref(), &turns)
}

fn with_context(context: &str, question: &str) -> String {
    format!(
        "Use the following context to answer the question.\n\nContext:\n{}\n\nQuestion: {}",
        context.trim(),
        question
    )
}

fn render_chatml(out: &mut String, system: Option<&str>, turns: &[Turn<'_>]) {
    if let Some(sys) = system {
        out.push_str(&format!("<|im_start|>system\n{}<|im_end|>\n", sys));
    }
    for turn in turns {
        out.push_str(&format!(
            "<|im_start|>{}\n{}<|im_end|>\n",
            turn.role.as_str(),
            turn.content
        ));
    }
    out.push_str("<|im_start|>assistant\n");
}

fn render_llama3(out: &mut String, system: Option<&str>, turns: &[Turn<'_>]) {
    out.push_str("<|begin_of_text|>");
    if let Some(sys) = system {
        out.push_str(&format!(
            "<|start_header_id|>system<|end_header_id|>\n\n{}<|eot_id|>",
            sys
        ));
    }
    for turn in turns {
        out.push_str(&format!(
            "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
            turn.role.as_str(),
            turn.content
        ));
    }
    out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
}

fn render_llama2(out: &mut String, system: Option<&str>, turns: &[Turn<'_>]) {
    let mut pending_system = system;
    for turn in turns {
        match turn.role {
            Role::User => {
                out.push_str("<s>[INST] ");
                if let Some(sys) = pending_system.take() {
                    out.push_str(&format!("<<SYS>>\n{}\n<</SYS>>\n\n", sys));
                }
                out.push_str(&format!("{} [/INST]", turn.content));
            }
            _ => out.push_str(&format!(" {} </s>", turn.content)),
        }
    }
    if let Some(sys) = pending_system {
        out.push_str(&format!("<s>[INST] <<SYS>>\n{}\n<</SYS>>\n\n [/INST]", sys));
    }
}

/// Mistral has no system role; the system text leads the first user turn,
/// or stands as its own instruction when there is none.
fn render_mistral(out: &mut String, system: Option<&str>, turns: &[Turn<'_>]) {
    out.push_str("<s>");
    let mut pending_system = system;
    for turn in turns {
        match turn.role {
            Role::User => {
                out.push_str("[INST] ");
                if let Some(sys) = pending_system.take() {
                    out.push_str(&format!("{}\n\n", sys));
                }
                out.push_str(&format!("{} [/INST]", turn.content));
            }
            _ => out.push_str(&format!("{}</s>", turn.content)),
        }
    }
    if let Some(sys) = pending_system {
        out.push_str(&format!("[INST] {} [/INST]", sys));
    }
}

fn render_gemma(out: &mut String, system: Option<&str>, turns: &[Turn<'_>]) {
    let mut pending_system = system;
    for turn in turns {
        let role = match turn.role {
            Role::User => "user",
            _ => "model",
        };
        out.push_str(&format!("<start_of_turn>{}\n", role));
        if turn.role == Role::User {
            if let Some(sys) = pending_system.take() {
                out.push_str(&format!("{}\n\n", sys));
            }
        }
        out.push_str(&format!("{}<end_of_turn>\n", turn.content));
    }
    if let Some(sys) = pending_system {
        out.push_str(&format!("<start_of_turn>user\n{}<end_of_turn>\n", sys));
    }
    out.push_str("<start_of_turn>model\n");
}

/// Phi-3 and Zephyr share `<|role|>` headers and differ in the end marker.
fn render_tagged(out: &mut String, system: Option<&str>, turns: &[Turn<'_>], end: &str) {
    if let Some(sys) = system {
        out.push_str(&format!("<|system|>\n{}{}\n", sys, end));
    }
    for turn in turns {
        out.push_str(&format!("<|{}|>\n{}{}\n", turn.role.as_str(), turn.content, end));
    }
    out.push_str("<|assistant|>\n");
}

fn render_alpaca(out: &mut String, system: Option<&str>, turns: &[Turn<'_>]) {
    if let Some(sys) = system {
        out.push_str(&format!("{}\n\n", sys));
    }
    for turn in turns {
        match turn.role {
            Role::User => out.push_str(&format!("### Instruction:\n{}\n\n", turn.content)),
            _ => out.push_str(&format!("### Response:\n{}\n\n", turn.content)),
        }
    }
    out.push_str("### Response:\n");
}

fn render_generic(out: &mut String, system: Option<&str>, turns: &[Turn<'_>]) {
    if let Some(sys) = system {
        out.push_str(&format!("System: {}\n\n", sys));
    }
    for turn in turns {
        let label = match turn.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        };
        out.push_str(&format!("{}: {}\n", label, turn.content));
    }
    out.push_str("Assistant:");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, content: &str) -> ChatMessage {
        ChatMessage::new("conv", role, content)
    }

    #[test]
    fn test_chatml_render() {
        let prompt = build_prompt(&[msg(Role::User, "Hi")], "Be brief.", "chatml", None);
        assert_eq!(
            prompt,
            "<|im_start|>system\nBe brief.<|im_end|>\n<|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_unknown_template_falls_back_to_generic() {
        let prompt = build_prompt(
            &[msg(Role::User, "Hi"), msg(Role::Assistant, "Hello"), msg(Role::User, "Bye")],
            "",
            "no-such-template",
            None,
        );
        assert_eq!(prompt, "User: Hi\nAssistant: Hello\nUser: Bye\nAssistant:");
    }

    #[test]
    fn test_incomplete_messages_skipped() {
        let mut streaming = ChatMessage::streaming("conv");
        streaming.content = "half an ans".to_string();
        let prompt = build_prompt(&[msg(Role::User, "Q"), streaming], "", "generic", None);
        assert!(!prompt.contains("half an ans"));
    }

    #[test]
    fn test_context_prepended_to_last_user_turn_only() {
        let history = [
            msg(Role::User, "first question"),
            msg(Role::Assistant, "first answer"),
            msg(Role::User, "second question"),
        ];
        let prompt = build_prompt(&history, "", "chatml", Some("RETRIEVED"));
        assert_eq!(prompt.matches("RETRIEVED").count(), 1);
        let ctx_pos = prompt.find("RETRIEVED").unwrap();
        assert!(ctx_pos > prompt.find("first answer").unwrap());
        assert!(ctx_pos < prompt.find("second question").unwrap());
        // no extra pseudo-turn
        assert_eq!(prompt.matches("<|im_start|>user").count(), 2);
    }

    #[test]
    fn test_context_dropped_without_user_turn() {
        let prompt = build_prompt(&[], "sys", "generic", Some("RETRIEVED"));
        assert!(!prompt.contains("RETRIEVED"));
    }

    #[test]
    fn test_system_messages_merged() {
        let prompt = build_prompt(
            &[msg(Role::System, "Answer in French."), msg(Role::User, "Hello")],
            "You are helpful.",
            "phi3",
            None,
        );
        assert!(prompt.starts_with("<|system|>\nYou are helpful.\n\nAnswer in French.<|end|>\n"));
        assert!(prompt.ends_with("<|assistant|>\n"));
    }

    #[test]
    fn test_llama2_system_in_first_instruction() {
        let prompt = build_prompt(
            &[msg(Role::User, "A"), msg(Role::Assistant, "B"), msg(Role::User, "C")],
            "SYS",
            "llama2",
            None,
        );
        assert_eq!(
            prompt,
            "<s>[INST] <<SYS>>\nSYS\n<</SYS>>\n\nA [/INST] B </s><s>[INST] C [/INST]"
        );
    }

    #[test]
    fn test_llama3_and_gemma_end_with_open_assistant_turn() {
        let history = [msg(Role::User, "Hi")];
        assert!(build_prompt(&history, "", "llama3", None)
            .ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
        assert!(build_prompt(&history, "", "gemma", None).ends_with("<start_of_turn>model\n"));
    }

    #[test]
    fn test_template_names_case_insensitive() {
        assert_eq!(PromptTemplate::from_name("ChatML"), PromptTemplate::ChatMl);
        assert_eq!(PromptTemplate::from_name(" Llama3 "), PromptTemplate::Llama3);
        assert_eq!(PromptTemplate::from_name(""), PromptTemplate::Generic);
    }

    #[test]
    fn test_system_prompt_kept_without_user_turn() {
        assert_eq!(
            build_prompt(&[], "SYS", "mistral", None),
            "<s>[INST] SYS [/INST]"
        );
        assert_eq!(
            build_prompt(&[], "SYS", "gemma", None),
            "<start_of_turn>user\nSYS<end_of_turn>\n<start_of_turn>model\n"
        );
        assert_eq!(
            build_prompt(&[msg(Role::User, "Hi")], "SYS", "mistral", None),
            "<s>[INST] SYS\n\nHi [/INST]"
        );
    }
}
