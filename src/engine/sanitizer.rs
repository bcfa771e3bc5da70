//! # engine::sanitizer
//!
//! Rejects rule text that contains blocked tokens before anything tries to
//! parse it.
//!
//! This is a block-list, not a sandbox.  The expression evaluator only
//! understands arithmetic, comparisons and column names, so the list exists to
//! turn obviously hostile input into a clear error early.
//!
//! Identifier-like tokens are matched on word boundaries (case-insensitive):
//! `os` is blocked, `close` is not.  `__` is blocked anywhere in the text.

use thiserror::Error;

const BLOCKED_SUBSTRINGS: &[&str] = &["__"];

const BLOCKED_WORDS: &[&str] = &[
    "import",
    "eval",
    "exec",
    "lambda",
    "def",
    "os",
    "sys",
    "subprocess",
    "shutil",
    "glob",
    "globals",
    "locals",
    "getattr",
    "setattr",
    "builtins",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("forbidden token '{token}' found in rule")]
pub struct SanitizeError {
    pub token: String,
}

/// Checks `text` against the block-list.
pub fn check(text: &str) -> Result<(), SanitizeError> {
    let lowered = text.to_lowercase();

    if let Some(hit) = BLOCKED_SUBSTRINGS.iter().find(|s| lowered.contains(*s)) {
        return Err(SanitizeError {
            token: hit.to_string(),
        });
    }

    let blocked = lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .find(|w| BLOCKED_WORDS.contains(w));

    match blocked {
        Some(word) => Err(SanitizeError {
            token: word.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_comparisons() {
        assert!(check("close > 1000").is_ok());
        assert!(check("(close > open) and volume >= 10").is_ok());
        assert!(check("").is_ok());
    }

    #[test]
    fn blocks_dunder_anywhere() {
        let err = check("__import__('os')").unwrap_err();
        assert_eq!(err.token, "__");
        assert!(check("close.__class__").is_err());
    }

    #[test]
    fn blocks_words_case_insensitively() {
        assert_eq!(check("EVAL(close)").unwrap_err().token, "eval");
        assert_eq!(check("os.system('x')").unwrap_err().token, "os");
        assert_eq!(check("1 if sys else 0").unwrap_err().token, "sys");
    }

    #[test]
    fn words_match_on_boundaries_only() {
        assert!(check("close > cost").is_ok());
        assert!(check("systolic > 1").is_ok());
        assert!(check("default_value > 1").is_ok());
    }

    #[test]
    fn unicode_text_is_checked_word_by_word() {
        assert!(check("종가 > 1").is_ok());
        assert_eq!(check("종가 > 1 or Import").unwrap_err().token, "import");
    }
}
