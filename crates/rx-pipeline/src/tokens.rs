//! Prompt size estimates for translation batches.
//!
//! Counts use the o200k_base encoding. The encoder is built once per process
//! and shared.

use rx_core::{Error, Result};
use tiktoken_rs::o200k_base_singleton;

/// Tokens in `text`.
pub fn count_tokens_blocking(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    o200k_base_singleton().lock().encode_with_special_tokens(text).len()
}

/// Tokens in `text`, counted on the blocking pool.
pub async fn count_tokens(text: String) -> Result<usize> {
    tokio::task::spawn_blocking(move || count_tokens_blocking(&text))
        .await
        .map_err(|e| Error::processing("tokens", format!("token counting failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_text_has_no_tokens() {
        assert_eq!(count_tokens(String::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn counts_grow_with_the_text() {
        let short = count_tokens("Hello world".into()).await.unwrap();
        assert!(short > 0);
        let long = count_tokens("lorem ipsum ".repeat(2_000)).await.unwrap();
        assert!(long > 1_000);
    }

    #[test]
    fn handles_mixed_scripts() {
        assert!(count_tokens_blocking("こんにちは 🌍 مرحبا") > 0);
    }
}
