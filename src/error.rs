use thiserror::Error;

/// Everything that can go wrong while parsing, resolving, building or deducing.
///
/// Finding no derivation for an utterance is not an error: it is an empty
/// [`Deduction`](crate::deduce::Deduction).
#[derive(Debug, Error)]
pub enum Error {
  #[error("{line}:{column}: syntax error: {reason}")]
  Syntax {
    line: usize,
    column: usize,
    reason: String,
  },

  #[error("rule <{rule}> references undefined rule <{reference}>")]
  UnresolvedReference { rule: String, reference: String },

  #[error("no public rule named <{0}>")]
  RuleNotFound(String),

  #[error("rule <{rule}> cannot be used: reference <{reference}> is unbound")]
  UnboundRule { rule: String, reference: String },

  #[error("rule <{rule}> cannot be used: {reason}")]
  BrokenRule { rule: String, reason: String },

  #[error("language weight must be finite and positive, got {0}")]
  InvalidLanguageWeight(f32),

  #[error("malformed tag list: {0}")]
  TagList(#[from] serde_json::Error),

  #[error("failed to render derivation: {0}")]
  Render(serde_json::Error),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
  pub fn is_syntax(&self) -> bool {
    matches!(self, Self::Syntax { .. })
  }
}
