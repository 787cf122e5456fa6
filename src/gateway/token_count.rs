use tiktoken_rs::{tokenizer, CoreBPE};

use super::automodel::estimate_tokens;
use super::{ChatMessage, ContentPart, MessageContent};

fn bpe_for_model(model: &str) -> &'static CoreBPE {
    let tokenizer = tokenizer::get_tokenizer(model).unwrap_or(tokenizer::Tokenizer::Cl100kBase);
    match tokenizer {
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        tokenizer::Tokenizer::R50kBase | tokenizer::Tokenizer::Gpt2 => {
            tiktoken_rs::r50k_base_singleton()
        }
        _ => tiktoken_rs::cl100k_base_singleton(),
    }
}

fn content_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => {
            let mut out = Vec::new();
            for part in parts {
                if let ContentPart::Text { text } = part {
                    out.push(text.as_str());
                }
            }
            out.join(" ")
        }
        MessageContent::Empty => String::new(),
    }
}

/// Prompt token count for the chat format: per-message framing overhead
/// plus the BPE token count of role, content, and name.
pub fn count_chat_tokens(model: &str, messages: &[ChatMessage]) -> u64 {
    let bpe = bpe_for_model(model);
    let (tokens_per_message, tokens_per_name): (i64, i64) = if model.starts_with("gpt-3.5") {
        (4, -1)
    } else {
        (3, 1)
    };

    let mut total: i64 = 0;
    for message in messages {
        total += tokens_per_message;
        total += bpe.encode_with_special_tokens(&message.role).len() as i64;
        let content = content_text(&message.content);
        if !content.is_empty() {
            total += bpe.encode_with_special_tokens(&content).len() as i64;
        }
        if let Some(name) = message.name.as_deref() {
            total += bpe.encode_with_special_tokens(name).len() as i64;
            total += tokens_per_name;
        }
    }
    // Reply priming.
    total += 3;
    total.max(0) as u64
}

/// Token count for plain text bodies (completions, embeddings input).
pub fn count_text_tokens(model: &str, text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let bpe = bpe_for_model(model);
    bpe.encode_with_special_tokens(text).len() as u64
}

/// Cheap estimate for payloads the tokenizer cannot see (multipart audio,
/// image prompts).
pub fn fallback_estimate(text: &str) -> u64 {
    estimate_tokens(text) as u64
}
