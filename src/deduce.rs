use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use serde::ser::Error as _;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::grammar::Grammar;
use crate::rules::{Expansion, RuleTarget, Tag};
use crate::tags::TagAssignment;

/// How grammar words are compared against utterance tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchPolicy {
  pub case_sensitive: bool,
  /// Reject tokens missing from the grammar's vocabulary. Ignored while the
  /// vocabulary is empty.
  pub check_vocabulary: bool,
}

impl Default for MatchPolicy {
  fn default() -> Self {
    Self {
      case_sensitive: false,
      check_vocabulary: true,
    }
  }
}

/// One complete match of an utterance against a rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Derivation {
  /// Consumed tokens, `[start, end)`
  pub span: (usize, usize),
  pub tags: BTreeSet<Tag>,
  /// Sum of the log probabilities of the alternation branches taken
  pub score: f32,
}

/// The derivations found for an utterance, with a forward-only cursor over them
#[derive(Debug)]
pub struct Deduction {
  derivations: Vec<Derivation>,
  cursor: usize,
  buffer: Vec<u8>,
}

impl Deduction {
  fn new(derivations: Vec<Derivation>) -> Self {
    Self {
      derivations,
      cursor: 0,
      buffer: Vec::new(),
    }
  }

  /// Renders the next derivation as JSON and advances the cursor.
  ///
  /// The returned text lives in a buffer owned by this `Deduction` and is
  /// overwritten by the following call. Once every derivation has been
  /// returned, this keeps returning None. A rendering failure still advances
  /// the cursor.
  pub fn next_json(&mut self) -> Option<Result<&str>> {
    let derivation = self.derivations.get(self.cursor)?;
    self.cursor += 1;

    self.buffer.clear();
    Some(render(&mut self.buffer, derivation))
  }

  /// All derivations in discovery order, regardless of the cursor
  pub fn derivations(&self) -> &[Derivation] {
    &self.derivations
  }

  pub fn len(&self) -> usize {
    self.derivations.len()
  }

  pub fn is_empty(&self) -> bool {
    self.derivations.is_empty()
  }
}

fn render<'b>(buffer: &'b mut Vec<u8>, derivation: &Derivation) -> Result<&'b str> {
  serde_json::to_writer(&mut *buffer, derivation).map_err(Error::Render)?;
  std::str::from_utf8(buffer).map_err(|e| Error::Render(serde_json::Error::custom(e)))
}

/// Finds every derivation of `tokens` against a public rule, with the default match policy
pub fn deduce(
  grammar: &Grammar,
  rule: &str,
  tokens: &[&str],
  external: &[TagAssignment],
) -> Result<Deduction> {
  deduce_with(grammar, rule, tokens, external, &MatchPolicy::default())
}

/// Finds every derivation of `tokens` against a public rule.
///
/// Derivations come out in the order a leftmost backtracking search finds
/// them: alternation branches in declared order, repetition counts from most
/// to fewest. A derivation's tags are the tags on the path it took plus the
/// external assignments lying inside its span. Derivations with the same span
/// and tags as an earlier one are dropped. No derivation is not an error.
pub fn deduce_with(
  grammar: &Grammar,
  rule: &str,
  tokens: &[&str],
  external: &[TagAssignment],
  policy: &MatchPolicy,
) -> Result<Deduction> {
  let (id, top) = grammar.public_rule(rule)?;
  let target = RuleTarget {
    grammar: grammar.id(),
    rule: id,
  };
  check_bound(grammar, target)?;

  let mut matcher = Matcher {
    grammar,
    tokens,
    policy,
    active: HashSet::new(),
  };
  matcher.active.insert((target, 0));
  let partials = matcher.extend(&top.expansion, Partial::default());

  let span = (0, tokens.len());
  let assigned = external
    .iter()
    .filter(|a| a.within(span))
    .map(|a| a.tag.clone())
    .collect::<BTreeSet<_>>();

  let mut seen = HashSet::new();
  let mut derivations = Vec::new();
  for partial in partials.into_iter().filter(|p| p.end == tokens.len()) {
    let mut tags = partial.tags;
    tags.extend(assigned.iter().cloned());
    if seen.insert((span, tags.clone())) {
      derivations.push(Derivation {
        span,
        tags,
        score: partial.score,
      });
    }
  }

  debug!(
    rule,
    tokens = tokens.len(),
    derivations = derivations.len(),
    "deduced"
  );
  Ok(Deduction::new(derivations))
}

impl Grammar {
  /// Tokenizes `utterance` on whitespace and deduces it against a public rule
  pub fn deduce_str(
    &self,
    rule: &str,
    utterance: &str,
    tags: &[TagAssignment],
  ) -> Result<Deduction> {
    let tokens = utterance.split_whitespace().collect::<Vec<_>>();
    deduce(self, rule, &tokens, tags)
  }
}

/// Fails with the first broken rule reachable from `target`
fn check_bound(grammar: &Grammar, target: RuleTarget) -> Result<()> {
  let mut seen = HashSet::new();
  let mut queue = vec![target];
  while let Some(t) = queue.pop() {
    if !seen.insert(t) {
      continue;
    }
    let Some(rule) = grammar.target_rule(t) else {
      continue;
    };
    rule.check_usable()?;
    rule.expansion.for_each_ref(&mut |r| {
      if let Some(t) = r.target {
        queue.push(t);
      }
    });
  }
  Ok(())
}

/// A match in progress: where it stands in the utterance and what it collected
#[derive(Debug, Clone, Default)]
struct Partial {
  end: usize,
  tags: BTreeSet<Tag>,
  score: f32,
}

/// Drops partials that stand at the same place with the same tags as an
/// earlier one. Whatever follows a dropped partial repeats what follows the
/// kept one, later in discovery order.
fn dedup(partials: Vec<Partial>) -> Vec<Partial> {
  let mut seen = HashSet::new();
  partials
    .into_iter()
    .filter(|p| seen.insert((p.end, p.tags.clone())))
    .collect()
}

struct Matcher<'g, 't> {
  grammar: &'g Grammar,
  tokens: &'t [&'t str],
  policy: &'t MatchPolicy,
  /// Rule references being matched, and the position each started at
  active: HashSet<(RuleTarget, usize)>,
}

impl<'g> Matcher<'g, '_> {
  fn word_matches(&self, word: &str, token: &str) -> bool {
    let equal = if self.policy.case_sensitive {
      word == token
    } else {
      word.to_lowercase() == token.to_lowercase()
    };
    let vocab = self.grammar.vocab();
    equal
      && (!self.policy.check_vocabulary
        || vocab.is_empty()
        || vocab.contains(&token.to_lowercase()))
  }

  /// Every way `expansion` can continue `from`, in discovery order
  fn extend(&mut self, expansion: &'g Expansion, from: Partial) -> Vec<Partial> {
    match expansion {
      Expansion::Literal(word) => {
        let words = word.split_whitespace().collect::<Vec<_>>();
        let end = from.end + words.len();
        if end > self.tokens.len() {
          return Vec::new();
        }
        let matched = words
          .iter()
          .zip(&self.tokens[from.end..end])
          .all(|(w, t)| self.word_matches(w, t));
        if matched {
          vec![Partial { end, ..from }]
        } else {
          Vec::new()
        }
      }
      Expansion::RuleRef(r) => {
        let Some(target) = r.target else {
          return Vec::new();
        };
        let key = (target, from.end);
        if self.active.contains(&key) {
          trace!(reference = %r.name, pos = from.end, "recursion cut");
          return Vec::new();
        }
        let grammar = self.grammar;
        let Some(rule) = grammar.target_rule(target) else {
          return Vec::new();
        };

        self.active.insert(key);
        let out = self.extend(&rule.expansion, from);
        self.active.remove(&key);
        out
      }
      Expansion::Sequence(items) => {
        let mut partials = vec![from];
        for item in items {
          partials = dedup(
            partials
              .into_iter()
              .flat_map(|p| self.extend(item, p))
              .collect(),
          );
          if partials.is_empty() {
            break;
          }
        }
        partials
      }
      Expansion::Alternation(alts) => {
        let mut out = Vec::new();
        for alt in alts.iter().filter(|a| a.prob > 0.0) {
          let mut p = from.clone();
          p.score += alt.prob.ln();
          out.extend(self.extend(&alt.expansion, p));
        }
        dedup(out)
      }
      Expansion::Repeat {
        expansion,
        min,
        max,
      } => self.repeat(expansion, *min, *max, from),
      Expansion::Optional(expansion) => self.repeat(expansion, 0, Some(1), from),
      Expansion::Tagged(expansion, tags) => {
        let mut p = from;
        p.tags.extend(tags.iter().cloned());
        self.extend(expansion, p)
      }
    }
  }

  /// Matches `min..=max` iterations, most iterations first. An iteration
  /// that consumes nothing only counts towards `min`, so unbounded
  /// repetitions stop once the input runs out.
  fn repeat(
    &mut self,
    expansion: &'g Expansion,
    min: u32,
    max: Option<u32>,
    from: Partial,
  ) -> Vec<Partial> {
    let mut levels = vec![vec![from]];
    loop {
      let count = levels.len() as u32 - 1;
      if max.is_some_and(|max| count >= max) {
        break;
      }
      let required = count < min;
      let mut next = Vec::new();
      for p in levels[levels.len() - 1].clone() {
        let start = p.end;
        next.extend(
          self
            .extend(expansion, p)
            .into_iter()
            .filter(|q| required || q.end > start),
        );
      }
      if next.is_empty() {
        break;
      }
      levels.push(dedup(next));
    }

    dedup(
      levels
        .into_iter()
        .enumerate()
        .rev()
        .filter(|(count, _)| *count as u32 >= min)
        .flat_map(|(_, partials)| partials)
        .collect(),
    )
  }
}
