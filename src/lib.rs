//! Compiles JSGF grammars into weighted finite-state automata, and matches
//! tokenized utterances against grammar rules to pull out their semantic tags.

#[macro_use]
extern crate lazy_static;

pub mod build;
pub mod closure;
pub mod deduce;
pub mod error;
pub mod fsg;
pub mod grammar;
pub mod parse_grammar;
pub mod resolve;
pub mod rules;
pub mod tags;

pub use crate::build::{BuildOptions, build_fsg, build_fsg_raw, read_fsg_file, write_fsg};
pub use crate::closure::close;
pub use crate::deduce::{Deduction, Derivation, MatchPolicy, deduce, deduce_with};
pub use crate::error::{Error, Result};
pub use crate::fsg::{Fsg, StateId, Transition};
pub use crate::grammar::{Grammar, GrammarId, RuleIter};
pub use crate::rules::{Alternative, Expansion, Rule, RuleId, RuleRef, RuleTarget, Tag};
pub use crate::tags::{TagAssignment, parse_tag_list};

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  macro_rules! example_file {
    ($filename:expr) => {
      ($filename, include_str!(concat!("../grammars/", $filename)))
    };
  }

  #[test]
  fn test_smoke_grammars() {
    let grammars = [
      example_file!("commands.gram"),
      example_file!("list.gram"),
      example_file!("numbers.gram"),
    ];

    for (filename, src) in grammars {
      let g = src
        .parse::<Grammar>()
        .unwrap_or_else(|e| panic!("failed to parse {filename}: {e}"));
      for rule in g.rule_iter().filter(|r| r.is_public()) {
        let fsg = g
          .build_fsg(rule.name(), false)
          .unwrap_or_else(|e| panic!("failed to build {filename} <{}>: {e}", rule.name()));
        assert!(!fsg.has_epsilons());
        assert!(!fsg.finals.is_empty(), "{filename} <{}> accepts nothing", rule.name());
      }
    }
  }

  #[test]
  fn test_commands_end_to_end() {
    let (_, src) = example_file!("commands.gram");
    let g: Grammar = src.parse().unwrap();
    assert_eq!(g.name(), Some("commands"));

    let fsg = g.build_fsg("command", false).unwrap();
    for utterance in ["please call the boss now", "dial one two three", "could you hang up"] {
      let tokens = utterance.split_whitespace().collect::<Vec<_>>();
      assert!(fsg.accepts(&tokens), "{}", utterance);
      assert_eq!(g.deduce_str("command", utterance, &[]).unwrap().len(), 1);
    }

    let d = g.deduce_str("command", "please call the boss now", &[]).unwrap();
    let tags = d.derivations()[0]
      .tags
      .iter()
      .map(Tag::to_string)
      .collect::<Vec<_>>();
    assert_eq!(tags, vec!["action:call", "who:boss"]);
  }

  #[test]
  fn test_list_with_numbers_parent() {
    let (_, numbers) = example_file!("numbers.gram");
    let numbers = Arc::new(numbers.parse::<Grammar>().unwrap());
    let g = Grammar::parse_str(
      "grammar quantities; public <q> = <numbers.number> <fruit>; <fruit> = apples | pears;",
      Some(numbers),
    )
    .unwrap();

    let fsg = g.build_fsg("q", false).unwrap();
    assert!(fsg.accepts(&["three", "hundred", "and", "twelve", "apples"]));
    assert!(!fsg.accepts(&["hundred", "apples"]));

    let d = g.deduce_str("q", "forty two pears", &[]).unwrap();
    assert_eq!(d.len(), 1);
  }

  #[test]
  fn test_shopping_list_tags() {
    let (_, src) = example_file!("list.gram");
    let g: Grammar = src.parse().unwrap();
    let d = g.deduce_str("order", "i want two apples and some pears", &[]).unwrap();
    assert_eq!(d.len(), 1);
    let tags = d.derivations()[0]
      .tags
      .iter()
      .map(Tag::to_string)
      .collect::<Vec<_>>();
    assert_eq!(tags, vec!["fruit:apple", "fruit:pear", "order"]);

    let fsg = g.build_fsg("rlist", false).unwrap();
    assert!(!fsg.accepts(&["apples", "and", "a", "banana"]));
    assert!(fsg.accepts(&["apples", "and", "a", "bananas"]));
  }
}
