//! LLM provider shim and model-output recovery.

mod client;
mod recovery;

pub use client::{HttpLlm, LlmClient, LlmConfig, ScriptedLlm};
pub use recovery::{parse_json_or_extract, strip_markdown_fences};
