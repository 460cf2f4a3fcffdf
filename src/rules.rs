use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::grammar::GrammarId;

/// Index of a rule inside its grammar's rule arena
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub u32);

/// Where a resolved rule reference points: a rule in some grammar of the parent chain
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RuleTarget {
  pub grammar: GrammarId,
  pub rule: RuleId,
}

/// A semantic tag, written `{label}` or `{label:value}` in a grammar
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
  pub label: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub value: Option<String>,
}

impl Tag {
  pub fn new(label: impl Into<String>, value: Option<&str>) -> Self {
    Self {
      label: label.into(),
      value: value.map(str::to_string),
    }
  }

  /// Splits tag text at the first ':' into label and value
  pub fn from_text(text: &str) -> Self {
    match text.split_once(':') {
      Some((label, value)) => Self::new(label.trim(), Some(value.trim())),
      None => Self::new(text.trim(), None),
    }
  }
}

impl fmt::Display for Tag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.value {
      Some(v) => write!(f, "{}:{}", self.label, v),
      None => write!(f, "{}", self.label),
    }
  }
}

/// A reference to another rule, by the name it was written with
#[derive(Debug, Clone, PartialEq)]
pub struct RuleRef {
  /// `rule` or `grammar.rule`
  pub name: String,
  /// Filled in by the resolver
  pub target: Option<RuleTarget>,
}

impl RuleRef {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      target: None,
    }
  }

  /// Splits a qualified name into (grammar, rule)
  pub fn qualified(&self) -> Option<(&str, &str)> {
    self.name.rsplit_once('.')
  }

  pub fn rule_name(&self) -> &str {
    self.qualified().map_or(self.name.as_str(), |(_, r)| r)
  }
}

/// One branch of an alternation
#[derive(Debug, Clone, PartialEq)]
pub struct Alternative {
  pub expansion: Expansion,
  /// Weight as written in the source, `/w/`
  pub weight: Option<f32>,
  /// Normalized probability, recomputed from `weight` by `update_weight`
  pub prob: f32,
}

impl Alternative {
  pub fn new(expansion: Expansion, weight: Option<f32>) -> Self {
    Self {
      expansion,
      weight,
      prob: 1.0,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expansion {
  Literal(String),
  RuleRef(RuleRef),
  /// The empty sequence matches the empty string (`<NULL>`)
  Sequence(Vec<Expansion>),
  /// The empty alternation matches nothing (`<VOID>`)
  Alternation(Vec<Alternative>),
  Repeat {
    expansion: Box<Expansion>,
    min: u32,
    /// None is unbounded
    max: Option<u32>,
  },
  Optional(Box<Expansion>),
  Tagged(Box<Expansion>, Vec<Tag>),
}

impl Expansion {
  pub fn null() -> Self {
    Self::Sequence(Vec::new())
  }

  pub fn void() -> Self {
    Self::Alternation(Vec::new())
  }

  pub fn kleene(e: Expansion) -> Self {
    Self::Repeat {
      expansion: Box::new(e),
      min: 0,
      max: None,
    }
  }

  pub fn plus(e: Expansion) -> Self {
    Self::Repeat {
      expansion: Box::new(e),
      min: 1,
      max: None,
    }
  }

  /// Visits every rule reference in the tree
  pub fn for_each_ref<'a>(&'a self, f: &mut impl FnMut(&'a RuleRef)) {
    match self {
      Self::Literal(_) => {}
      Self::RuleRef(r) => f(r),
      Self::Sequence(items) => items.iter().for_each(|e| e.for_each_ref(f)),
      Self::Alternation(alts) => alts.iter().for_each(|a| a.expansion.for_each_ref(f)),
      Self::Repeat { expansion, .. } | Self::Optional(expansion) | Self::Tagged(expansion, _) => {
        expansion.for_each_ref(f)
      }
    }
  }

  pub fn for_each_ref_mut(&mut self, f: &mut impl FnMut(&mut RuleRef)) {
    match self {
      Self::Literal(_) => {}
      Self::RuleRef(r) => f(r),
      Self::Sequence(items) => items.iter_mut().for_each(|e| e.for_each_ref_mut(f)),
      Self::Alternation(alts) => alts
        .iter_mut()
        .for_each(|a| a.expansion.for_each_ref_mut(f)),
      Self::Repeat { expansion, .. } | Self::Optional(expansion) | Self::Tagged(expansion, _) => {
        expansion.for_each_ref_mut(f)
      }
    }
  }

  pub fn for_each_alternation_mut(&mut self, f: &mut impl FnMut(&mut Vec<Alternative>)) {
    match self {
      Self::Literal(_) | Self::RuleRef(_) => {}
      Self::Sequence(items) => items
        .iter_mut()
        .for_each(|e| e.for_each_alternation_mut(f)),
      Self::Alternation(alts) => {
        for alt in alts.iter_mut() {
          alt.expansion.for_each_alternation_mut(f);
        }
        f(alts);
      }
      Self::Repeat { expansion, .. } | Self::Optional(expansion) | Self::Tagged(expansion, _) => {
        expansion.for_each_alternation_mut(f)
      }
    }
  }
}

impl fmt::Display for Expansion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Literal(w) if w.contains(char::is_whitespace) => write!(f, "\"{}\"", w),
      Self::Literal(w) => write!(f, "{}", w),
      Self::RuleRef(r) => write!(f, "<{}>", r.name),
      Self::Sequence(items) if items.is_empty() => write!(f, "<NULL>"),
      Self::Sequence(items) => {
        write!(f, "(")?;
        for (idx, e) in items.iter().enumerate() {
          if idx > 0 {
            write!(f, " ")?;
          }
          write!(f, "{}", e)?;
        }
        write!(f, ")")
      }
      Self::Alternation(alts) if alts.is_empty() => write!(f, "<VOID>"),
      Self::Alternation(alts) => {
        write!(f, "(")?;
        for (idx, alt) in alts.iter().enumerate() {
          if idx > 0 {
            write!(f, " | ")?;
          }
          if let Some(w) = alt.weight {
            write!(f, "/{}/ ", w)?;
          }
          write!(f, "{}", alt.expansion)?;
        }
        write!(f, ")")
      }
      Self::Repeat {
        expansion,
        min: 0,
        max: None,
      } => write!(f, "{}*", expansion),
      Self::Repeat {
        expansion,
        min: 1,
        max: None,
      } => write!(f, "{}+", expansion),
      Self::Repeat {
        expansion,
        min,
        max,
      } => match max {
        Some(max) => write!(f, "{}<{}-{}>", expansion, min, max),
        None => write!(f, "{}<{}->", expansion, min),
      },
      Self::Optional(e) => write!(f, "[{}]", e),
      Self::Tagged(e, tags) => {
        write!(f, "{}", e)?;
        for t in tags {
          write!(f, " {{{}}}", t)?;
        }
        Ok(())
      }
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
  pub name: String,
  pub public: bool,
  pub expansion: Expansion,
  /// References the resolver could not bind
  pub unresolved: Vec<String>,
  /// Why the rule's body didn't parse. Only set by lenient parsing, which keeps
  /// the rule with an empty body.
  pub syntax_error: Option<String>,
  /// Set by the resolver when the rule is on a reference cycle
  pub recursive: bool,
}

impl Rule {
  pub fn new(name: impl Into<String>, public: bool, expansion: Expansion) -> Self {
    Self {
      name: name.into(),
      public,
      expansion,
      unresolved: Vec::new(),
      syntax_error: None,
      recursive: false,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn is_public(&self) -> bool {
    self.public
  }

  /// A broken rule can't be built or deduced against
  pub fn is_broken(&self) -> bool {
    self.syntax_error.is_some() || !self.unresolved.is_empty()
  }

  /// Fails with the reason the rule is broken, if it is
  pub fn check_usable(&self) -> Result<()> {
    if let Some(reason) = &self.syntax_error {
      return Err(Error::BrokenRule {
        rule: self.name.clone(),
        reason: reason.clone(),
      });
    }
    match self.unresolved.first() {
      Some(reference) => Err(Error::UnboundRule {
        rule: self.name.clone(),
        reference: reference.clone(),
      }),
      None => Ok(()),
    }
  }
}

impl fmt::Display for Rule {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.public {
      write!(f, "public ")?;
    }
    write!(f, "<{}> = {};", self.name, self.expansion)
  }
}
