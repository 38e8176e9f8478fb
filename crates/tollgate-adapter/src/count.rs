//! Prompt token estimation.
//!
//! One shared BPE instance serves every model; the per-model differences are
//! well inside the error bar of a pre-consume estimate, and the encoder is
//! expensive to build.

use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

use crate::error::{ErrorKind, RelayError};
use crate::info::TokenCountMeta;

/// Flat charge per attached image, matching how image inputs are billed at a
/// fixed tile budget.
const TOKENS_PER_IMAGE: i64 = 1105;

fn encoder() -> Result<&'static CoreBPE, RelayError> {
    static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::o200k_base().ok())
        .as_ref()
        .ok_or_else(|| {
            RelayError::new(ErrorKind::CountTokenFailed, "token encoder unavailable")
        })
}

pub fn count_text_tokens(text: &str) -> Result<i64, RelayError> {
    if text.is_empty() {
        return Ok(0);
    }
    Ok(encoder()?.encode_with_special_tokens(text).len() as i64)
}

/// Token estimate for a full request: combined message text, tool
/// declarations, and a fixed budget per image part.
pub fn count_request_tokens(meta: &TokenCountMeta) -> Result<i64, RelayError> {
    let mut total = count_text_tokens(&meta.combined_text)?;
    if !meta.tool_text.is_empty() {
        total += count_text_tokens(&meta.tool_text)?;
    }
    total += meta.image_count as i64 * TOKENS_PER_IMAGE;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero() {
        assert_eq!(count_text_tokens("").unwrap(), 0);
    }

    #[test]
    fn text_tokens_are_positive_and_monotonic() {
        let short = count_text_tokens("hello").unwrap();
        let long = count_text_tokens("hello hello hello hello hello").unwrap();
        assert!(short >= 1);
        assert!(long > short);
    }

    #[test]
    fn images_add_fixed_budget() {
        let meta = TokenCountMeta {
            combined_text: "hi".into(),
            image_count: 2,
            tool_text: String::new(),
        };
        let with_images = count_request_tokens(&meta).unwrap();
        let text_only = count_text_tokens("hi").unwrap();
        assert_eq!(with_images, text_only + 2 * TOKENS_PER_IMAGE);
    }
}
