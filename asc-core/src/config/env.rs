//! `.env` secret loading
//!
//! Secrets are read into a map and handed to the reconciliation engine. The
//! process environment is never modified.

use crate::error::{AscError, Result};
use std::collections::BTreeMap;
use std::path::Path;

/// Parse a `.env` file into an ordered map.
///
/// Accepts the usual dotenv syntax: comments, `export` prefixes, single and
/// double quotes, escapes inside double quotes.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read and
/// [`AscError::Configuration`] for the first malformed line.
pub fn load_env_file(path: impl AsRef<Path>) -> Result<BTreeMap<String, String>> {
    let iter = dotenvy::from_path_iter(path.as_ref()).map_err(env_error)?;
    iter.map(|item| item.map_err(env_error)).collect()
}

/// Parse `.env` content.
pub fn parse_env(content: &str) -> Result<BTreeMap<String, String>> {
    dotenvy::from_read_iter(content.as_bytes())
        .map(|item| item.map_err(env_error))
        .collect()
}

fn env_error(err: dotenvy::Error) -> AscError {
    match err {
        dotenvy::Error::Io(e) => AscError::Io(e),
        other => AscError::Configuration(format!("invalid .env file: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_env() {
        let vars = parse_env(
            "# secrets\n\nCLAUDE_API_KEY=sk-123\nOPENAI_API_KEY=\"quoted value\"\nexport GOOGLE_API_KEY='single'\nEMPTY=\n",
        )
        .unwrap();

        assert_eq!(vars.len(), 4);
        assert_eq!(vars["CLAUDE_API_KEY"], "sk-123");
        assert_eq!(vars["OPENAI_API_KEY"], "quoted value");
        assert_eq!(vars["GOOGLE_API_KEY"], "single");
        assert_eq!(vars["EMPTY"], "");
    }

    #[test]
    fn test_inline_comment_and_escapes() {
        let vars = parse_env("A=secret # rotate monthly\nB=\"line\\nnext\"\n").unwrap();
        assert_eq!(vars["A"], "secret");
        assert_eq!(vars["B"], "line\nnext");
    }

    #[test]
    fn test_malformed_line() {
        let err = parse_env("A=1\nnot a pair\n").unwrap_err();
        assert!(matches!(err, AscError::Configuration(_)));
    }

    #[test]
    fn test_load_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "ASC_ENV_FILE_TEST_TOKEN=abc\n").unwrap();

        let vars = load_env_file(&path).unwrap();
        assert_eq!(vars["ASC_ENV_FILE_TEST_TOKEN"], "abc");
        assert!(std::env::var("ASC_ENV_FILE_TEST_TOKEN").is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = load_env_file("/nonexistent/.env").unwrap_err();
        assert!(matches!(err, AscError::Io(_)));
    }
}
