use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

use crate::error::{Error, Result};
use crate::rules::{Rule, RuleId, RuleTarget};

/// Process-unique identity of a grammar, used by resolved rule references
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct GrammarId(u32);

impl GrammarId {
  fn fresh() -> Self {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    Self(NEXT.fetch_add(1, Ordering::Relaxed))
  }
}

#[derive(Debug)]
pub struct Grammar {
  id: GrammarId,
  pub(crate) name: Option<String>,
  pub(crate) imports: Vec<String>,
  pub(crate) rules: Vec<Rule>,
  pub(crate) by_name: HashMap<String, RuleId>,
  parent: Option<Arc<Grammar>>,
  vocab: HashSet<String>,
}

impl Grammar {
  /// An empty grammar, optionally chained to a parent for cross-grammar references
  pub fn new(parent: Option<Arc<Grammar>>) -> Self {
    Self {
      id: GrammarId::fresh(),
      name: None,
      imports: Vec::new(),
      rules: Vec::new(),
      by_name: HashMap::new(),
      parent,
      vocab: HashSet::new(),
    }
  }

  pub fn id(&self) -> GrammarId {
    self.id
  }

  /// The name from the `grammar name;` header, if there was one
  pub fn name(&self) -> Option<&str> {
    self.name.as_deref()
  }

  pub fn imports(&self) -> &[String] {
    &self.imports
  }

  pub fn parent(&self) -> Option<&Arc<Grammar>> {
    self.parent.as_ref()
  }

  /// Adds a rule, failing (returning it back) if the name is taken
  pub(crate) fn add_rule(&mut self, rule: Rule) -> std::result::Result<RuleId, Rule> {
    if self.by_name.contains_key(&rule.name) {
      return Err(rule);
    }
    let id = RuleId(self.rules.len() as u32);
    self.by_name.insert(rule.name.clone(), id);
    self.rules.push(rule);
    Ok(id)
  }

  pub fn len(&self) -> usize {
    self.rules.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }

  pub fn rule(&self, id: RuleId) -> &Rule {
    &self.rules[id.0 as usize]
  }

  pub(crate) fn rule_mut(&mut self, id: RuleId) -> &mut Rule {
    &mut self.rules[id.0 as usize]
  }

  pub fn rule_id(&self, name: &str) -> Option<RuleId> {
    self.by_name.get(name).copied()
  }

  /// Get a rule by its local name
  pub fn get_rule(&self, name: &str) -> Option<&Rule> {
    self.rule_id(name).map(|id| self.rule(id))
  }

  /// Get a public, local rule by name, the only kind that can be built or deduced against
  pub fn public_rule(&self, name: &str) -> Result<(RuleId, &Rule)> {
    match self.rule_id(name) {
      Some(id) if self.rule(id).public => Ok((id, self.rule(id))),
      _ => Err(Error::RuleNotFound(name.to_string())),
    }
  }

  /// The first public rule in source order
  pub fn first_public_rule(&self) -> Option<&Rule> {
    self.rules.iter().find(|r| r.public)
  }

  /// Walks this grammar and its parents, nearest first
  pub fn chain(&self) -> impl Iterator<Item = &Grammar> {
    std::iter::successors(Some(self), |g| g.parent.as_deref())
  }

  /// Finds the grammar a resolved reference points into
  pub fn grammar_for(&self, id: GrammarId) -> Option<&Grammar> {
    self.chain().find(|g| g.id == id)
  }

  /// Dereferences a resolved reference anywhere in the parent chain
  pub fn target_rule(&self, target: RuleTarget) -> Option<&Rule> {
    self
      .grammar_for(target.grammar)
      .and_then(|g| g.rules.get(target.rule.0 as usize))
  }

  pub fn rule_iter(&self) -> RuleIter<'_> {
    RuleIter {
      rules: &self.rules,
      pos: None,
    }
  }

  pub fn vocab(&self) -> &HashSet<String> {
    &self.vocab
  }

  pub fn add_word(&mut self, word: &str) {
    self.vocab.insert(word.to_lowercase());
  }

  /// Loads the known words of this grammar from `<resource_dir>/<source>.dict`.
  ///
  /// Each non-comment line contributes its first field; alternate pronunciation
  /// markers (`word(2)`) are stripped. Returns the number of new words.
  pub fn load_vocab(&mut self, resource_dir: impl AsRef<Path>, source: &str) -> Result<usize> {
    let path = resource_dir.as_ref().join(format!("{}.dict", source));
    let text = fs::read_to_string(&path)?;

    let before = self.vocab.len();
    for line in text.lines() {
      let line = line.trim();
      if line.is_empty() || line.starts_with('#') || line.starts_with(";;") {
        continue;
      }
      if let Some(word) = line.split_whitespace().next() {
        let word = match word.find('(') {
          Some(idx) if idx > 0 && word.ends_with(')') => &word[..idx],
          _ => word,
        };
        self.add_word(word);
      }
    }

    let added = self.vocab.len() - before;
    debug!(path = %path.display(), added, "loaded vocabulary");
    Ok(added)
  }

  /// Reads and parses a grammar file
  pub fn read_from_file(path: impl AsRef<Path>, parent: Option<Arc<Grammar>>) -> Result<Self> {
    let src = fs::read_to_string(path.as_ref())?;
    Self::parse_str(&src, parent)
  }
}

/// A clone is a separate grammar with its own id. References that pointed
/// into the original are rebound to the clone's copies of those rules;
/// references into parent grammars are shared.
impl Clone for Grammar {
  fn clone(&self) -> Self {
    let old = self.id;
    let id = GrammarId::fresh();
    let mut rules = self.rules.clone();
    for rule in &mut rules {
      rule.expansion.for_each_ref_mut(&mut |r| {
        if let Some(t) = r.target.as_mut() {
          if t.grammar == old {
            t.grammar = id;
          }
        }
      });
    }

    Self {
      id,
      name: self.name.clone(),
      imports: self.imports.clone(),
      rules,
      by_name: self.by_name.clone(),
      parent: self.parent.clone(),
      vocab: self.vocab.clone(),
    }
  }
}

impl FromStr for Grammar {
  type Err = Error;

  /// Parses a standalone grammar, with no parent
  fn from_str(s: &str) -> Result<Self> {
    Self::parse_str(s, None)
  }
}

impl fmt::Display for Grammar {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "#JSGF V1.0;")?;
    if let Some(name) = &self.name {
      writeln!(f, "grammar {};", name)?;
    }
    for import in self.imports.iter() {
      writeln!(f, "import <{}>;", import)?;
    }
    for rule in self.rules.iter() {
      writeln!(f, "{}", rule)?;
    }
    Ok(())
  }
}

/// Cursor over a grammar's rules.
///
/// Works as a plain `Iterator`, and also keeps the last rule it advanced to
/// available through `current`.
pub struct RuleIter<'g> {
  rules: &'g [Rule],
  pos: Option<usize>,
}

impl<'g> RuleIter<'g> {
  /// The rule the iterator last advanced to, None before the first advance or past the end
  pub fn current(&self) -> Option<&'g Rule> {
    self.pos.and_then(|p| self.rules.get(p))
  }
}

impl<'g> Iterator for RuleIter<'g> {
  type Item = &'g Rule;

  fn next(&mut self) -> Option<Self::Item> {
    let next = self.pos.map_or(0, |p| p + 1).min(self.rules.len());
    self.pos = Some(next);
    self.current()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::rules::Expansion;

  #[test]
  fn test_duplicate_rules_are_rejected() {
    let mut g = Grammar::new(None);
    assert!(g.add_rule(Rule::new("a", true, Expansion::null())).is_ok());
    assert!(g.add_rule(Rule::new("a", false, Expansion::void())).is_err());
    assert_eq!(g.len(), 1);
    assert!(g.get_rule("a").unwrap().public);
  }

  #[test]
  fn test_rule_iter_advances_and_stays_done() {
    let g: Grammar = "public <a> = x; <b> = y;".parse().unwrap();
    let mut iter = g.rule_iter();
    assert!(iter.current().is_none());
    assert_eq!(iter.next().map(Rule::name), Some("a"));
    assert_eq!(iter.current().map(Rule::name), Some("a"));
    assert_eq!(iter.next().map(Rule::name), Some("b"));
    assert!(iter.next().is_none());
    assert!(iter.next().is_none());
    assert!(iter.current().is_none());
  }

  #[test]
  fn test_clone_gets_its_own_identity() {
    let g: Grammar = "public <a> = x <b>; <b> = y | z;".parse().unwrap();
    let copy = g.clone();
    assert_ne!(copy.id(), g.id());

    let mut targets = Vec::new();
    copy.get_rule("a").unwrap().expansion.for_each_ref(&mut |r| targets.push(r.target));
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].map(|t| t.grammar), Some(copy.id()));

    assert!(copy.build_fsg("a", false).is_ok());
    assert_eq!(copy.deduce_str("a", "x z", &[]).unwrap().len(), 1);
  }

  #[test]
  fn test_clone_keeps_parent_references() {
    let parent = Arc::new("grammar names; public <name> = john;".parse::<Grammar>().unwrap());
    let g = Grammar::parse_str("public <call> = call <names.name>;", Some(parent.clone())).unwrap();
    let copy = g.clone();

    let mut targets = Vec::new();
    copy.get_rule("call").unwrap().expansion.for_each_ref(&mut |r| targets.push(r.target));
    assert_eq!(targets[0].map(|t| t.grammar), Some(parent.id()));
    assert_eq!(copy.deduce_str("call", "call john", &[]).unwrap().len(), 1);
  }

  #[test]
  fn test_public_rule_lookup() {
    let g: Grammar = "public <a> = x; <b> = y;".parse().unwrap();
    assert!(g.public_rule("a").is_ok());
    assert!(matches!(g.public_rule("b"), Err(Error::RuleNotFound(n)) if n == "b"));
    assert!(matches!(g.public_rule("c"), Err(Error::RuleNotFound(_))));
    assert_eq!(g.first_public_rule().map(Rule::name), Some("a"));
  }

  #[test]
  fn test_load_vocab_from_dict() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
      dir.path().join("words.dict"),
      "# comment\nCALL K AO L\njohn JH AA N\njohn(2) JH AO N\n\nmary M EH R IY\n",
    )
    .unwrap();

    let mut g = Grammar::new(None);
    assert_eq!(g.load_vocab(dir.path(), "words").unwrap(), 3);
    assert!(g.vocab().contains("call"));
    assert!(g.vocab().contains("john"));
    assert!(!g.vocab().contains("john(2)"));

    assert!(matches!(g.load_vocab(dir.path(), "missing"), Err(Error::Io(_))));
  }

  #[test]
  fn test_read_from_file_parses() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("g.gram");
    fs::write(&path, "#JSGF V1.0;\ngrammar g;\npublic <a> = hello world;\n").unwrap();
    let g = Grammar::read_from_file(&path, None).unwrap();
    assert_eq!(g.name(), Some("g"));
    assert_eq!(g.len(), 1);
  }
}
