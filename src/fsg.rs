use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io;

use crate::rules::Tag;

pub type StateId = u32;

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
  pub from: StateId,
  pub to: StateId,
  /// None is an epsilon (null) transition
  pub word: Option<String>,
  /// Log probability, already scaled by the automaton's language weight
  pub logp: f32,
  /// Tags active on any path through this transition
  pub tags: BTreeSet<Tag>,
}

impl Transition {
  pub fn is_epsilon(&self) -> bool {
    self.word.is_none()
  }
}

/// A weighted finite-state grammar
#[derive(Debug, Clone, PartialEq)]
pub struct Fsg {
  pub name: String,
  pub n_states: u32,
  pub start: StateId,
  pub finals: BTreeSet<StateId>,
  pub transitions: Vec<Transition>,
  pub language_weight: f32,
}

impl Fsg {
  pub fn new(name: impl Into<String>, language_weight: f32) -> Self {
    Self {
      name: name.into(),
      n_states: 0,
      start: 0,
      finals: BTreeSet::new(),
      transitions: Vec::new(),
      language_weight,
    }
  }

  pub fn add_state(&mut self) -> StateId {
    let s = self.n_states;
    self.n_states += 1;
    s
  }

  pub fn add_transition(
    &mut self,
    from: StateId,
    to: StateId,
    word: Option<&str>,
    logp: f32,
    tags: &BTreeSet<Tag>,
  ) {
    self.transitions.push(Transition {
      from,
      to,
      word: word.map(str::to_string),
      logp,
      tags: tags.clone(),
    });
  }

  pub fn is_final(&self, s: StateId) -> bool {
    self.finals.contains(&s)
  }

  pub fn has_epsilons(&self) -> bool {
    self.transitions.iter().any(Transition::is_epsilon)
  }

  /// Outgoing transitions per state
  pub fn arcs(&self) -> Vec<Vec<&Transition>> {
    let mut arcs = vec![Vec::new(); self.n_states as usize];
    for t in self.transitions.iter() {
      arcs[t.from as usize].push(t);
    }
    arcs
  }

  /// The distinct words on the automaton's transitions, sorted
  pub fn words(&self) -> BTreeSet<&str> {
    self
      .transitions
      .iter()
      .filter_map(|t| t.word.as_deref())
      .collect()
  }

  /// Scores `input` against the automaton, treating epsilon transitions as
  /// consuming nothing.
  ///
  /// Returns the log weight of the best accepting path, or None if the input
  /// isn't accepted. Epsilon cycles are fine: log weights are never positive,
  /// so going around a cycle never improves a path.
  pub fn score(&self, input: &[&str]) -> Option<f32> {
    let arcs = self.arcs();
    let mut frontier: HashMap<StateId, f32> = HashMap::new();
    frontier.insert(self.start, 0.0);
    self.relax_epsilons(&arcs, &mut frontier);

    for word in input {
      let mut next: HashMap<StateId, f32> = HashMap::new();
      for (&s, &w) in frontier.iter() {
        for t in arcs[s as usize].iter() {
          if t.word.as_deref() == Some(*word) {
            let score = w + t.logp;
            let best = next.entry(t.to).or_insert(f32::NEG_INFINITY);
            if score > *best {
              *best = score;
            }
          }
        }
      }
      if next.is_empty() {
        return None;
      }
      self.relax_epsilons(&arcs, &mut next);
      frontier = next;
    }

    frontier
      .iter()
      .filter(|(s, _)| self.is_final(**s))
      .map(|(_, w)| *w)
      .reduce(f32::max)
  }

  pub fn accepts(&self, input: &[&str]) -> bool {
    self.score(input).is_some()
  }

  fn relax_epsilons(&self, arcs: &[Vec<&Transition>], frontier: &mut HashMap<StateId, f32>) {
    let mut work = frontier.keys().copied().collect::<Vec<_>>();
    while let Some(s) = work.pop() {
      let w = frontier[&s];
      for t in arcs[s as usize].iter().filter(|t| t.is_epsilon()) {
        let score = w + t.logp;
        let best = frontier.entry(t.to).or_insert(f32::NEG_INFINITY);
        if score > *best {
          *best = score;
          work.push(t.to);
        }
      }
    }
  }

  /// Writes the automaton in Sphinx FSG text format, in transition order
  pub fn write_to<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
    write!(out, "{}", self)
  }
}

impl fmt::Display for Fsg {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "FSG_BEGIN {}", self.name)?;
    writeln!(f, "NUM_STATES {}", self.n_states)?;
    writeln!(f, "START_STATE {}", self.start)?;
    for s in self.finals.iter() {
      writeln!(f, "FINAL_STATE {}", s)?;
    }
    for t in self.transitions.iter() {
      let prob = (t.logp / self.language_weight).exp();
      write!(f, "TRANSITION {} {} {:.6}", t.from, t.to, prob)?;
      if let Some(word) = &t.word {
        write!(f, " {}", word)?;
      }
      writeln!(f)?;
    }
    writeln!(f, "FSG_END")
  }
}
