//! Supported languages and the run request payload.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Language a run is submitted in.
///
/// The backend is the sole authority on whether a language is actually
/// executable; the client only forwards the wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    #[default]
    JavaScript,
    Java,
    Cpp,
    Rust,
    Php,
    Html,
}

impl Language {
    /// Every language, in menu order.
    pub const ALL: [Self; 7] = [
        Self::Python,
        Self::JavaScript,
        Self::Java,
        Self::Cpp,
        Self::Rust,
        Self::Php,
        Self::Html,
    ];

    /// Name used on the wire.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::Java => "java",
            Self::Cpp => "cpp",
            Self::Rust => "rust",
            Self::Php => "php",
            Self::Html => "html",
        }
    }

    /// Human readable name.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Python => "Python",
            Self::JavaScript => "JavaScript",
            Self::Java => "Java",
            Self::Cpp => "C++",
            Self::Rust => "Rust",
            Self::Php => "PHP",
            Self::Html => "HTML",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Unknown language name.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown language: {0}")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|lang| lang.code().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownLanguage(s.to_string()))
    }
}

/// Code submitted for a single run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunRequest {
    /// Language the code is written in.
    pub language: Language,
    /// Source code.
    pub code: String,
    /// Text fed to the program's stdin.
    #[serde(default)]
    pub input: String,
}

impl RunRequest {
    /// Create a request with empty stdin.
    #[must_use]
    pub fn new(language: Language, code: impl Into<String>) -> Self {
        Self {
            language,
            code: code.into(),
            input: String::new(),
        }
    }

    /// Set the stdin text.
    #[must_use]
    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = input.into();
        self
    }

    /// Whether the code is empty or whitespace only.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.code.trim().is_empty()
    }
}
