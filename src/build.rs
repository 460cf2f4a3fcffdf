use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use tracing::{debug, warn};

use crate::closure::close;
use crate::error::{Error, Result};
use crate::fsg::{Fsg, StateId};
use crate::grammar::Grammar;
use crate::rules::{Expansion, Rule, RuleRef, RuleTarget, Tag};

#[derive(Debug, Clone, PartialEq)]
pub struct BuildOptions {
  /// Scales every log probability in the automaton
  pub language_weight: f32,
}

impl Default for BuildOptions {
  fn default() -> Self {
    Self {
      language_weight: 1.0,
    }
  }
}

/// Builds the epsilon-free automaton for a public rule
pub fn build_fsg(grammar: &Grammar, rule: &str, opts: &BuildOptions) -> Result<Fsg> {
  let raw = build_fsg_raw(grammar, rule, opts)?;
  Ok(close(&raw))
}

/// Builds the automaton for a public rule as constructed, epsilons and all
pub fn build_fsg_raw(grammar: &Grammar, rule: &str, opts: &BuildOptions) -> Result<Fsg> {
  let lw = opts.language_weight;
  if !(lw.is_finite() && lw > 0.0) {
    return Err(Error::InvalidLanguageWeight(lw));
  }
  let (id, top) = grammar.public_rule(rule)?;
  let name = match grammar.name() {
    Some(g) => format!("{}.{}", g, rule),
    None => rule.to_string(),
  };

  let mut builder = Builder {
    grammar,
    fsg: Fsg::new(name, opts.language_weight),
    frames: Vec::new(),
  };
  let target = RuleTarget {
    grammar: grammar.id(),
    rule: id,
  };
  let (start, end) = builder.expand_rule(target, top, &BTreeSet::new(), 0)?;

  let mut fsg = builder.fsg;
  fsg.start = start;
  fsg.finals.insert(end);
  debug!(
    fsg = %fsg.name,
    states = fsg.n_states,
    transitions = fsg.transitions.len(),
    "built raw fsg"
  );
  Ok(fsg)
}

/// Writes the raw automaton for a rule in FSG text form
pub fn write_fsg<W: io::Write>(grammar: &Grammar, rule: &str, out: &mut W) -> Result<()> {
  let fsg = build_fsg_raw(grammar, rule, &BuildOptions::default())?;
  fsg.write_to(out)?;
  Ok(())
}

/// Reads a grammar file and builds the automaton of its first public rule
pub fn read_fsg_file(path: impl AsRef<Path>, opts: &BuildOptions) -> Result<Fsg> {
  let grammar = Grammar::read_from_file(path, None)?;
  let rule = grammar
    .first_public_rule()
    .ok_or_else(|| Error::RuleNotFound("*".to_string()))?;
  build_fsg(&grammar, rule.name(), opts)
}

impl Grammar {
  /// Builds a rule's automaton with default options, closed unless `raw`
  pub fn build_fsg(&self, rule: &str, raw: bool) -> Result<Fsg> {
    let opts = BuildOptions::default();
    if raw {
      build_fsg_raw(self, rule, &opts)
    } else {
      build_fsg(self, rule, &opts)
    }
  }
}

/// A rule instance being expanded
struct Frame<'g> {
  target: RuleTarget,
  name: &'g str,
  entry: StateId,
  exit: StateId,
}

struct Builder<'g> {
  grammar: &'g Grammar,
  fsg: Fsg,
  /// Rules currently open, outermost first
  frames: Vec<Frame<'g>>,
}

/// Fragments are (start, end) state pairs.
///
/// `tail_floor` is the index of the outermost open frame the current position is
/// in tail position for: nothing but epsilons separates the fragment's end from
/// that frame's exit. A recursive reference to a frame at or above it can be an
/// exact back-edge.
impl<'g> Builder<'g> {
  fn new_state(&mut self) -> StateId {
    self.fsg.add_state()
  }

  /// The error for a reference that can't be followed, blamed on the innermost open rule
  fn unbound(&self, r: &RuleRef) -> Error {
    Error::UnboundRule {
      rule: self
        .frames
        .last()
        .map_or_else(String::new, |f| f.name.to_string()),
      reference: r.name.clone(),
    }
  }

  fn epsilon(&mut self, from: StateId, to: StateId, logp: f32, tags: &BTreeSet<Tag>) {
    self.fsg.add_transition(from, to, None, logp, tags);
  }

  fn expand_rule(
    &mut self,
    target: RuleTarget,
    rule: &'g Rule,
    tags: &BTreeSet<Tag>,
    tail_floor: usize,
  ) -> Result<(StateId, StateId)> {
    rule.check_usable()?;

    let entry = self.new_state();
    let exit = self.new_state();
    self.frames.push(Frame {
      target,
      name: &rule.name,
      entry,
      exit,
    });
    let (start, end) = self.expand(&rule.expansion, tags, tail_floor)?;
    self.frames.pop();

    self.epsilon(entry, start, 0.0, tags);
    self.epsilon(end, exit, 0.0, tags);
    Ok((entry, exit))
  }

  fn expand(
    &mut self,
    expansion: &'g Expansion,
    tags: &BTreeSet<Tag>,
    tail_floor: usize,
  ) -> Result<(StateId, StateId)> {
    let non_tail = self.frames.len();

    match expansion {
      Expansion::Literal(word) => {
        let start = self.new_state();
        let end = self.new_state();
        self.fsg.add_transition(start, end, Some(word), 0.0, tags);
        Ok((start, end))
      }
      Expansion::RuleRef(r) => self.expand_ref(r, tags, tail_floor),
      Expansion::Sequence(items) if items.is_empty() => {
        let start = self.new_state();
        let end = self.new_state();
        self.epsilon(start, end, 0.0, tags);
        Ok((start, end))
      }
      Expansion::Sequence(items) => {
        let last = items.len() - 1;
        let first_floor = if last == 0 { tail_floor } else { non_tail };
        let (first, mut end) = self.expand(&items[0], tags, first_floor)?;
        for (idx, item) in items.iter().enumerate().skip(1) {
          let floor = if idx == last { tail_floor } else { non_tail };
          let (s, e) = self.expand(item, tags, floor)?;
          self.epsilon(end, s, 0.0, tags);
          end = e;
        }
        Ok((first, end))
      }
      Expansion::Alternation(alts) => {
        let start = self.new_state();
        let end = self.new_state();
        let lw = self.fsg.language_weight;
        for alt in alts.iter().filter(|a| a.prob > 0.0) {
          let (s, e) = self.expand(&alt.expansion, tags, tail_floor)?;
          self.epsilon(start, s, alt.prob.ln() * lw, tags);
          self.epsilon(e, end, 0.0, tags);
        }
        Ok((start, end))
      }
      Expansion::Optional(inner) => self.repeat(inner, 0, Some(1), tags, tail_floor),
      Expansion::Repeat {
        expansion,
        min,
        max,
      } => self.repeat(expansion, *min, *max, tags, tail_floor),
      Expansion::Tagged(inner, extra) => {
        let mut tags = tags.clone();
        tags.extend(extra.iter().cloned());
        self.expand(inner, &tags, tail_floor)
      }
    }
  }

  fn repeat(
    &mut self,
    inner: &'g Expansion,
    min: u32,
    max: Option<u32>,
    tags: &BTreeSet<Tag>,
    tail_floor: usize,
  ) -> Result<(StateId, StateId)> {
    let non_tail = self.frames.len();
    let start = self.new_state();
    let end = self.new_state();

    match max {
      Some(max) => {
        // unroll: `min` required copies, then optional copies that may each be skipped
        let max = max.max(min);
        let mut prev = start;
        for idx in 0..max {
          let floor = if idx + 1 == max { tail_floor } else { non_tail };
          let (s, e) = self.expand(inner, tags, floor)?;
          self.epsilon(prev, s, 0.0, tags);
          if idx >= min {
            self.epsilon(prev, end, 0.0, tags);
          }
          prev = e;
        }
        self.epsilon(prev, end, 0.0, tags);
      }
      None => {
        // unroll the required copies, looping on the last one
        let copies = min.max(1);
        let mut prev = start;
        for idx in 0..copies {
          let (s, e) = self.expand(inner, tags, non_tail)?;
          self.epsilon(prev, s, 0.0, tags);
          if idx + 1 == copies {
            self.epsilon(e, s, 0.0, tags);
          }
          prev = e;
        }
        self.epsilon(prev, end, 0.0, tags);
        if min == 0 {
          self.epsilon(start, end, 0.0, tags);
        }
      }
    }

    Ok((start, end))
  }

  fn expand_ref(
    &mut self,
    r: &'g RuleRef,
    tags: &BTreeSet<Tag>,
    tail_floor: usize,
  ) -> Result<(StateId, StateId)> {
    let target = r.target.ok_or_else(|| self.unbound(r))?;

    if let Some(depth) = self.frames.iter().position(|f| f.target == target) {
      // already open: loop back to the open instance instead of inlining again
      let (entry, exit) = (self.frames[depth].entry, self.frames[depth].exit);
      let start = self.new_state();
      let end = self.new_state();
      self.epsilon(start, entry, 0.0, tags);
      if depth < tail_floor {
        warn!(
          rule = self.frames[depth].name,
          "non-tail recursion, the automaton over-approximates the grammar"
        );
        self.epsilon(exit, end, 0.0, tags);
      }
      return Ok((start, end));
    }

    let grammar = self.grammar;
    let rule = grammar.target_rule(target).ok_or_else(|| self.unbound(r))?;
    self.expand_rule(target, rule, tags, tail_floor)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::rules::Alternative;

  fn grammar(src: &str) -> Grammar {
    src.parse().unwrap()
  }

  fn accepts(fsg: &Fsg, input: &str) -> bool {
    fsg.accepts(&input.split_whitespace().collect::<Vec<_>>())
  }

  #[test]
  fn test_literal_and_sequence() {
    let g = grammar("public <a> = hello world;");
    let raw = g.build_fsg("a", true).unwrap();
    assert!(raw.has_epsilons());
    assert!(accepts(&raw, "hello world"));
    assert!(!accepts(&raw, "hello"));
    assert!(!accepts(&raw, "world hello"));
    assert_eq!(raw.finals.len(), 1);
  }

  #[test]
  fn test_alternation_weights() {
    let g = grammar("public <a> = /3/ x | /1/ y | z;");
    let raw = g.build_fsg("a", true).unwrap();
    assert!((raw.score(&["x"]).unwrap() - 0.75f32.ln()).abs() < 1e-5);
    assert!((raw.score(&["y"]).unwrap() - 0.25f32.ln()).abs() < 1e-5);
    // zero probability branches aren't built
    assert!(!raw.accepts(&["z"]));

    let scaled = build_fsg_raw(&g, "a", &BuildOptions { language_weight: 2.0 }).unwrap();
    assert!((scaled.score(&["x"]).unwrap() - 2.0 * 0.75f32.ln()).abs() < 1e-5);
  }

  #[test]
  fn test_repetition() {
    let g = grammar("public <a> = x* y+ [z];");
    let raw = g.build_fsg("a", true).unwrap();
    for ok in ["y", "x y", "x x y y y", "y z", "x y y z"] {
      assert!(accepts(&raw, ok), "{}", ok);
    }
    for bad in ["", "x", "z", "y z z", "x z"] {
      assert!(!accepts(&raw, bad), "{}", bad);
    }
  }

  #[test]
  fn test_bounded_repetition() {
    let mut g = Grammar::new(None);
    g.add_rule(Rule::new(
      "a",
      true,
      Expansion::Repeat {
        expansion: Box::new(Expansion::Literal("x".into())),
        min: 2,
        max: Some(3),
      },
    ))
    .unwrap();
    assert!(g.resolve().is_empty());

    for raw in [true, false] {
      let fsg = g.build_fsg("a", raw).unwrap();
      assert!(!accepts(&fsg, "x"));
      assert!(accepts(&fsg, "x x"));
      assert!(accepts(&fsg, "x x x"));
      assert!(!accepts(&fsg, "x x x x"));
    }
  }

  #[test]
  fn test_null_and_void() {
    let g = grammar("public <a> = x <NULL> y; public <b> = x | <VOID>;");
    assert!(accepts(&g.build_fsg("a", true).unwrap(), "x y"));
    let b = g.build_fsg("b", false).unwrap();
    assert!(accepts(&b, "x"));
    assert_eq!(b.transitions.len(), 1);
  }

  #[test]
  fn test_rule_references_are_instantiated_per_site() {
    // sharing <n> between both sites would accept "x one w"
    let g = grammar("public <a> = x <n> y | z <n> w; <n> = one | two;");
    let raw = g.build_fsg("a", true).unwrap();
    assert!(accepts(&raw, "x one y"));
    assert!(accepts(&raw, "z two w"));
    assert!(!accepts(&raw, "x one w"));
  }

  #[test]
  fn test_right_recursion_is_exact() {
    let g = grammar(
      r#"
      public <list> = <item> | <item> and <list>;
      <item> = apples | pears;
    "#,
    );
    for raw in [true, false] {
      let fsg = g.build_fsg("list", raw).unwrap();
      assert!(accepts(&fsg, "apples"));
      assert!(accepts(&fsg, "apples and pears and apples"));
      assert!(!accepts(&fsg, "apples and"));
      assert!(!accepts(&fsg, "and pears"));
    }
  }

  #[test]
  fn test_mutual_recursion_terminates() {
    let g = grammar("public <even> = x <odd> | <NULL>; <odd> = x <even>;");
    let fsg = g.build_fsg("even", false).unwrap();
    assert!(!fsg.has_epsilons());
    assert!(accepts(&fsg, ""));
    assert!(accepts(&fsg, "x x"));
    assert!(accepts(&fsg, "x x x x"));
    assert!(!accepts(&fsg, "x"));
    assert!(!accepts(&fsg, "x x x"));
  }

  #[test]
  fn test_center_recursion_is_approximated() {
    let g = grammar("public <s> = a <s> b | c;");
    let fsg = g.build_fsg("s", false).unwrap();
    assert!(accepts(&fsg, "c"));
    assert!(accepts(&fsg, "a c b"));
    assert!(accepts(&fsg, "a a c b b"));
    assert!(!accepts(&fsg, "a b"));
  }

  #[test]
  fn test_tags_annotate_transitions() {
    let g = grammar("public <command> = call {action:call} <name>; <name> = john | mary;");
    let fsg = g.build_fsg("command", false).unwrap();
    let call = fsg
      .transitions
      .iter()
      .find(|t| t.word.as_deref() == Some("call"))
      .unwrap();
    assert!(call.tags.contains(&Tag::new("action", Some("call"))));
    let john = fsg
      .transitions
      .iter()
      .find(|t| t.word.as_deref() == Some("john"))
      .unwrap();
    assert!(john.tags.is_empty());
  }

  #[test]
  fn test_build_errors() {
    let g = grammar("public <a> = x <missing>; <private> = y; public <b> = <a> | z;");
    assert!(matches!(g.build_fsg("nope", false), Err(Error::RuleNotFound(n)) if n == "nope"));
    assert!(matches!(g.build_fsg("private", false), Err(Error::RuleNotFound(_))));
    assert!(matches!(
      g.build_fsg("a", true),
      Err(Error::UnboundRule { rule, reference }) if rule == "a" && reference == "missing"
    ));
    assert!(matches!(
      g.build_fsg("b", false),
      Err(Error::UnboundRule { rule, reference }) if rule == "a" && reference == "missing"
    ));
  }

  #[test]
  fn test_language_weight_must_be_positive() {
    let g = grammar("public <a> = x | y;");
    for lw in [0.0, -1.0, f32::NAN, f32::INFINITY] {
      let opts = BuildOptions {
        language_weight: lw,
      };
      assert!(matches!(
        build_fsg_raw(&g, "a", &opts),
        Err(Error::InvalidLanguageWeight(_))
      ));
      assert!(matches!(
        build_fsg(&g, "a", &opts),
        Err(Error::InvalidLanguageWeight(_))
      ));
    }

    let fsg = build_fsg(
      &g,
      "a",
      &BuildOptions {
        language_weight: 2.0,
      },
    )
    .unwrap();
    for t in &fsg.transitions {
      assert!((t.logp - 2.0 * 0.5f32.ln()).abs() < 1e-4);
    }
  }

  #[test]
  fn test_cross_grammar_build() {
    let parent = std::sync::Arc::new(grammar("grammar names; public <name> = john | mary;"));
    let g = Grammar::parse_str("public <call> = call <names.name>;", Some(parent)).unwrap();
    let fsg = g.build_fsg("call", false).unwrap();
    assert!(accepts(&fsg, "call mary"));
  }

  #[test]
  fn test_write_fsg() {
    let g = grammar("grammar demo; public <a> = x | y;");
    let mut out = Vec::new();
    write_fsg(&g, "a", &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("FSG_BEGIN demo.a\n"));
    assert!(text.contains("TRANSITION"));
    assert!(text.contains(" x\n"));
    assert!(text.trim_end().ends_with("FSG_END"));
  }

  #[test]
  fn test_read_fsg_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("g.gram");
    std::fs::write(&path, "<hidden> = z; public <first> = x y; public <second> = q;").unwrap();
    let fsg = read_fsg_file(&path, &BuildOptions::default()).unwrap();
    assert!(fsg.accepts(&["x", "y"]));
    assert!(!fsg.accepts(&["q"]));
  }

  #[test]
  fn test_single_weighted_branch_alternation() {
    let mut g = Grammar::new(None);
    g.add_rule(Rule::new(
      "a",
      true,
      Expansion::Alternation(vec![Alternative::new(Expansion::Literal("x".into()), Some(2.0))]),
    ))
    .unwrap();
    g.resolve();
    g.update_weight();
    let fsg = g.build_fsg("a", true).unwrap();
    assert!((fsg.score(&["x"]).unwrap()).abs() < 1e-6);
  }
}
