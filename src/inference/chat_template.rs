// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Chat template system for model-specific prompt formatting
//!
//! The chat session keeps typed turns; the template turns them into the flat
//! prompt string the loaded model was trained on.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::errors::RuntimeError;
use crate::inference::session::{ChatRole, ChatTurn};

/// Supported chat template formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatTemplate {
    /// "User: ...\nAssistant: ..."
    #[default]
    Default,
    /// "[INST] ... [/INST]"
    Llama2,
    /// "USER: ...\nASSISTANT: ..."
    Vicuna,
    /// "<|start|>user<|message|>...<|end|>"
    Harmony,
    /// "<|im_start|>user\n...<|im_end|>"
    ChatML,
}

impl FromStr for ChatTemplate {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "llama2" | "llama-2" => Ok(Self::Llama2),
            "vicuna" => Ok(Self::Vicuna),
            "harmony" | "gpt-oss" => Ok(Self::Harmony),
            "chatml" | "chat-ml" => Ok(Self::ChatML),
            other => Err(RuntimeError::InvalidConfig(format!(
                "unknown chat template: {}",
                other
            ))),
        }
    }
}

impl ChatTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Llama2 => "llama2",
            Self::Vicuna => "vicuna",
            Self::Harmony => "harmony",
            Self::ChatML => "chatml",
        }
    }

    /// Format a conversation, ending with the cue for the assistant's reply
    pub fn format_turns(&self, turns: &[ChatTurn]) -> String {
        match self {
            Self::Default => format_prefixed(turns, "System: ", "User: ", "Assistant: "),
            Self::Vicuna => format_prefixed(turns, "SYSTEM: ", "USER: ", "ASSISTANT: "),
            Self::Llama2 => format_llama2(turns),
            Self::Harmony => format_tagged(
                turns,
                |role| format!("<|start|>{}<|message|>", role),
                "<|end|>\n",
                "<|start|>assistant<|channel|>final<|message|>",
            ),
            Self::ChatML => format_tagged(
                turns,
                |role| format!("<|im_start|>{}\n", role),
                "<|im_end|>\n",
                "<|im_start|>assistant\n",
            ),
        }
    }

    /// Text markers that end an assistant turn for this format
    ///
    /// Generation stops when the model emits one of these even if it never
    /// produces an end-of-generation token.
    pub fn stop_sequences(&self) -> Vec<String> {
        let stops: &[&str] = match self {
            Self::Default => &["\nUser:"],
            Self::Vicuna => &["\nUSER:"],
            Self::Llama2 => &["[INST]"],
            Self::Harmony => &["<|end|>", "<|return|>"],
            Self::ChatML => &["<|im_end|>"],
        };
        stops.iter().map(|s| s.to_string()).collect()
    }
}

fn format_prefixed(turns: &[ChatTurn], system: &str, user: &str, assistant: &str) -> String {
    let mut prompt = String::new();

    for turn in turns {
        match turn.role {
            ChatRole::System => {
                prompt.push_str(system);
                prompt.push_str(&turn.content);
                prompt.push_str("\n\n");
            }
            ChatRole::User => {
                prompt.push_str(user);
                prompt.push_str(&turn.content);
                prompt.push('\n');
            }
            ChatRole::Assistant => {
                prompt.push_str(assistant);
                prompt.push_str(&turn.content);
                prompt.push('\n');
            }
        }
    }

    prompt.push_str(assistant);
    prompt
}

fn format_tagged(
    turns: &[ChatTurn],
    open: impl Fn(&str) -> String,
    close: &str,
    cue: &str,
) -> String {
    let mut prompt = String::new();

    for turn in turns {
        prompt.push_str(&open(turn.role.as_str()));
        prompt.push_str(&turn.content);
        prompt.push_str(close);
    }

    prompt.push_str(cue);
    prompt
}

fn format_llama2(turns: &[ChatTurn]) -> String {
    let mut prompt = String::new();
    let system_prompt = turns
        .iter()
        .find(|t| t.role == ChatRole::System)
        .map(|t| t.content.as_str())
        .unwrap_or_default();

    let mut first_user = true;
    for turn in turns {
        match turn.role {
            ChatRole::User => {
                if first_user && !system_prompt.is_empty() {
                    prompt.push_str(&format!(
                        "[INST] <<SYS>>\n{}\n<</SYS>>\n\n{} [/INST] ",
                        system_prompt, turn.content
                    ));
                } else {
                    prompt.push_str(&format!("[INST] {} [/INST] ", turn.content));
                }
                first_user = false;
            }
            ChatRole::Assistant => {
                prompt.push_str(&turn.content);
                prompt.push(' ');
            }
            ChatRole::System => {}
        }
    }

    prompt
}
