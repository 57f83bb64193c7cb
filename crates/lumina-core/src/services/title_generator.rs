use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};

use super::provider::{ChatProvider, GenerateRequest, GenerationConfig};

/// Characters of the user's text sent to the model
pub const TITLE_SAMPLE_CHARS: usize = 300;
/// Longest title kept before hard truncation
pub const TITLE_MAX_CHARS: usize = 40;

lazy_static! {
    // Leading "Title:" style label, in either language the prompt may answer in
    static ref TITLE_LABEL_REGEX: Regex =
        Regex::new(r"(?i)^(title|t[ií]tulo)\s*:\s*").expect("TITLE_LABEL_REGEX pattern is valid");
}

/// Truncate text to max length
pub fn truncate_text(text: &str, max_len: usize) -> String {
    text.chars().take(max_len).collect()
}

/// Clean and validate a generated title. Empty means "no suggestion".
pub fn clean_title(raw_title: &str) -> String {
    let first_line = raw_title.trim().lines().next().unwrap_or_default().trim();
    let unlabeled = TITLE_LABEL_REGEX.replace(first_line, "");
    let cleaned = unlabeled
        .trim()
        .trim_matches(['"', '\'', '\u{201c}', '\u{201d}'])
        .trim()
        .trim_end_matches('.')
        .trim();

    let len = cleaned.chars().count();
    if len < 2 {
        String::new()
    } else if len > TITLE_MAX_CHARS {
        format!("{}...", truncate_text(cleaned, TITLE_MAX_CHARS))
    } else {
        cleaned.to_string()
    }
}

/// Title used until (or instead of) the generated one.
pub fn fallback_title(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() > max_chars {
        format!("{}...", truncate_text(text, max_chars))
    } else {
        text.to_string()
    }
}

/// Side-channel title suggestions. Never touches the main chat session.
#[derive(Clone)]
pub struct TitleGenerator {
    provider: Arc<dyn ChatProvider>,
    model: String,
}

impl TitleGenerator {
    pub fn new(provider: Arc<dyn ChatProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Suggest a 2 to 4 word title for `sample_text`. Returns an empty string on any failure.
    pub async fn generate(&self, sample_text: &str) -> String {
        let prompt = format!(
            "Generate a short title of 2 to 4 words summarizing this message: \"{}\". \
            Reply with ONLY the title, no quotes, no explanation.",
            truncate_text(sample_text.trim(), TITLE_SAMPLE_CHARS)
        );
        let mut request = GenerateRequest::prompt(&self.model, prompt);
        request.generation_config = Some(GenerationConfig {
            temperature: Some(0.7),
            max_output_tokens: Some(20),
        });

        match self.provider.generate(request).await {
            Ok(response) => {
                let title = clean_title(&response.text);
                debug!(raw = %response.text, cleaned = %title, "Title generated");
                title
            }
            Err(e) => {
                warn!(error = ?e, "Title generation failed");
                String::new()
            }
        }
    }
}
