//! Epsilon closure.
//!
//! Rewrites an automaton so that no transition is an epsilon, then removes
//! states that can't take part in an accepting path:
//!
//! 1. **Closure**: for every state, find the best epsilon path to every state
//!    reachable through epsilons alone (best-first, so epsilon cycles settle).
//! 2. **Bypass**: every word transition leaving a state in the closure becomes
//!    a direct transition from the state itself, carrying the path's weight and tags.
//! 3. **Prune**: drop states unreachable from the start or unable to reach a
//!    final state, and renumber the rest in order.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use tracing::{debug, warn};

use crate::fsg::{Fsg, StateId, Transition};
use crate::rules::Tag;

/// Returns an equivalent automaton with no epsilon transitions
pub fn close(raw: &Fsg) -> Fsg {
  let arcs = raw.arcs();

  let mut closed = Fsg::new(raw.name.clone(), raw.language_weight);
  closed.n_states = raw.n_states;
  closed.start = raw.start;

  let mut index: HashMap<(StateId, StateId, &str), usize> = HashMap::new();
  for s in 0..raw.n_states {
    for (via, reach) in epsilon_closure(&arcs, s) {
      if raw.is_final(via) {
        closed.finals.insert(s);
      }

      for t in arcs[via as usize].iter() {
        let Some(word) = t.word.as_deref() else {
          continue;
        };
        let logp = reach.logp + t.logp;
        let key = (s, t.to, word);
        if let Some(&i) = index.get(&key) {
          if closed.transitions[i].logp >= logp {
            continue;
          }
        }

        let mut tags = reach.tags.clone();
        tags.extend(t.tags.iter().cloned());
        let transition = Transition {
          from: s,
          to: t.to,
          word: Some(word.to_string()),
          logp,
          tags,
        };
        match index.get(&key) {
          Some(&i) => closed.transitions[i] = transition,
          None => {
            index.insert(key, closed.transitions.len());
            closed.transitions.push(transition);
          }
        }
      }
    }
  }

  let closed = prune(closed);
  debug!(
    fsg = %closed.name,
    states = closed.n_states,
    transitions = closed.transitions.len(),
    finals = closed.finals.len(),
    "closed fsg"
  );
  closed
}

/// Best epsilon path to a state
#[derive(Debug, Clone)]
struct Reach {
  logp: f32,
  tags: BTreeSet<Tag>,
}

/// Heap entry for the best-first search. Higher log weight pops first,
/// ties go to the lower state so the output order is deterministic.
struct Candidate {
  state: StateId,
  reach: Reach,
}

impl PartialEq for Candidate {
  fn eq(&self, other: &Self) -> bool {
    self.cmp(other) == Ordering::Equal
  }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Candidate {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .reach
      .logp
      .total_cmp(&other.reach.logp)
      .then_with(|| other.state.cmp(&self.state))
  }
}

/// All states reachable from `from` through epsilons only, `from` included,
/// each with its best path. Settled in order of decreasing path weight.
///
/// Log weights are never positive, so a settled state can't be improved later
/// and every state is settled at most once, cycles or not.
fn epsilon_closure(arcs: &[Vec<&Transition>], from: StateId) -> Vec<(StateId, Reach)> {
  let mut settled: Vec<(StateId, Reach)> = Vec::new();
  let mut seen: HashSet<StateId> = HashSet::new();
  let mut heap = BinaryHeap::new();
  heap.push(Candidate {
    state: from,
    reach: Reach {
      logp: 0.0,
      tags: BTreeSet::new(),
    },
  });

  while let Some(Candidate { state, reach }) = heap.pop() {
    if !seen.insert(state) {
      continue;
    }
    for t in arcs[state as usize].iter().filter(|t| t.is_epsilon()) {
      if seen.contains(&t.to) {
        continue;
      }
      let mut tags = reach.tags.clone();
      tags.extend(t.tags.iter().cloned());
      heap.push(Candidate {
        state: t.to,
        reach: Reach {
          logp: reach.logp + t.logp,
          tags,
        },
      });
    }
    settled.push((state, reach));
  }

  settled
}

/// States reachable from `roots` following `edges`
fn reachable(roots: impl IntoIterator<Item = StateId>, edges: &[Vec<StateId>]) -> HashSet<StateId> {
  let mut seen = HashSet::new();
  let mut queue: Vec<StateId> = roots.into_iter().collect();
  while let Some(s) = queue.pop() {
    if !seen.insert(s) {
      continue;
    }
    queue.extend(edges[s as usize].iter().copied());
  }
  seen
}

/// Removes unreachable and dead states, renumbering survivors contiguously
fn prune(fsg: Fsg) -> Fsg {
  let n = fsg.n_states as usize;
  let mut forward = vec![Vec::new(); n];
  let mut backward = vec![Vec::new(); n];
  for t in fsg.transitions.iter() {
    forward[t.from as usize].push(t.to);
    backward[t.to as usize].push(t.from);
  }

  let live_from_start = reachable([fsg.start], &forward);
  let live_to_final = reachable(fsg.finals.iter().copied(), &backward);
  if !live_to_final.contains(&fsg.start) {
    warn!(fsg = %fsg.name, "automaton accepts nothing");
  }

  let mut renumber: HashMap<StateId, StateId> = HashMap::new();
  for s in 0..fsg.n_states {
    let keep = s == fsg.start || (live_from_start.contains(&s) && live_to_final.contains(&s));
    if keep {
      renumber.insert(s, renumber.len() as StateId);
    }
  }

  let mut pruned = Fsg::new(fsg.name, fsg.language_weight);
  pruned.n_states = renumber.len() as u32;
  pruned.start = renumber[&fsg.start];
  pruned.finals = fsg
    .finals
    .iter()
    .filter_map(|s| renumber.get(s).copied())
    .collect();
  pruned.transitions = fsg
    .transitions
    .into_iter()
    .filter_map(|t| {
      let from = *renumber.get(&t.from)?;
      let to = *renumber.get(&t.to)?;
      Some(Transition { from, to, ..t })
    })
    .collect();
  pruned
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::grammar::Grammar;

  fn fsg_with(n: u32, start: StateId, finals: &[StateId], arcs: &[(StateId, StateId, Option<&str>, f32)]) -> Fsg {
    let none = BTreeSet::new();
    let mut fsg = Fsg::new("test", 1.0);
    for _ in 0..n {
      fsg.add_state();
    }
    fsg.start = start;
    fsg.finals.extend(finals.iter().copied());
    for &(from, to, word, logp) in arcs {
      fsg.add_transition(from, to, word, logp, &none);
    }
    fsg
  }

  fn assert_same_language(raw: &Fsg, closed: &Fsg, inputs: &[&str]) {
    for input in inputs {
      let tokens = input.split_whitespace().collect::<Vec<_>>();
      match (raw.score(&tokens), closed.score(&tokens)) {
        (Some(a), Some(b)) => assert!((a - b).abs() < 1e-4, "{:?}: {} vs {}", input, a, b),
        (None, None) => {}
        (a, b) => panic!("{:?}: raw {:?}, closed {:?}", input, a, b),
      }
    }
  }

  #[test]
  fn test_closure_preserves_language_and_weights() {
    let g: Grammar = r#"
      public <cmd> = [please] (/2/ call <name> | /1/ dial <number>+) [now];
      <name> = john | mary | (the boss);
      <number> = one | two | three;
    "#
    .parse()
    .unwrap();

    let raw = g.build_fsg("cmd", true).unwrap();
    let closed = g.build_fsg("cmd", false).unwrap();
    assert!(raw.has_epsilons());
    assert!(!closed.has_epsilons());
    assert!(closed.n_states < raw.n_states);

    assert_same_language(
      &raw,
      &closed,
      &[
        "call john",
        "please call the boss now",
        "dial one two three",
        "please dial three now",
        "call",
        "dial",
        "please",
        "call john mary",
        "now call john",
        "",
      ],
    );
  }

  #[test]
  fn test_closure_terminates_on_recursive_rules() {
    let g: Grammar = r#"
      public <list> = <item> (and <item>)*;
      public <rlist> = <item> | <item> and <rlist>;
      <item> = apples | pears;
    "#
    .parse()
    .unwrap();

    for rule in ["list", "rlist"] {
      let raw = g.build_fsg(rule, true).unwrap();
      let closed = g.build_fsg(rule, false).unwrap();
      assert!(!closed.has_epsilons());
      assert!(closed.n_states <= raw.n_states);
      assert_same_language(
        &raw,
        &closed,
        &["apples", "apples and pears", "pears and pears and apples", "and", "apples and"],
      );
    }
  }

  #[test]
  fn test_epsilon_cycle() {
    // 0 -eps-> 1 -eps-> 0, 1 -a-> 2
    let raw = fsg_with(
      3,
      0,
      &[2],
      &[(0, 1, None, 0.0), (1, 0, None, 0.0), (1, 2, Some("a"), 0.0)],
    );
    let closed = close(&raw);
    assert!(!closed.has_epsilons());
    assert!(closed.accepts(&["a"]));
    assert!(!closed.accepts(&[]));
  }

  #[test]
  fn test_best_epsilon_path_wins() {
    // two epsilon routes from 0 to 2, then a word
    let raw = fsg_with(
      4,
      0,
      &[3],
      &[
        (0, 2, None, -3.0),
        (0, 1, None, -0.5),
        (1, 2, None, -0.5),
        (2, 3, Some("a"), -0.25),
      ],
    );
    let closed = close(&raw);
    let a = closed
      .transitions
      .iter()
      .find(|t| t.from == closed.start)
      .unwrap();
    assert!((a.logp - -1.25).abs() < 1e-6);
    assert_eq!(
      closed
        .transitions
        .iter()
        .filter(|t| t.from == closed.start)
        .count(),
      1
    );
  }

  #[test]
  fn test_prunes_and_renumbers() {
    // 3 is unreachable, 4 is dead
    let raw = fsg_with(
      5,
      0,
      &[2],
      &[
        (0, 1, Some("a"), 0.0),
        (1, 2, Some("b"), 0.0),
        (3, 2, Some("c"), 0.0),
        (1, 4, Some("d"), 0.0),
      ],
    );
    let closed = close(&raw);
    assert_eq!(closed.n_states, 3);
    assert_eq!(closed.start, 0);
    assert_eq!(closed.finals.iter().copied().collect::<Vec<_>>(), vec![2]);
    assert_eq!(closed.transitions.len(), 2);
    assert!(closed.accepts(&["a", "b"]));
    assert!(closed.transitions.iter().all(|t| t.to < 3 && t.from < 3));
  }

  #[test]
  fn test_empty_language_keeps_start() {
    let raw = fsg_with(3, 0, &[2], &[(0, 1, Some("a"), 0.0)]);
    let closed = close(&raw);
    assert_eq!(closed.n_states, 1);
    assert!(closed.finals.is_empty());
    assert!(closed.transitions.is_empty());
  }

  #[test]
  fn test_start_becomes_final_through_epsilons() {
    let raw = fsg_with(3, 0, &[2], &[(0, 1, None, 0.0), (1, 2, None, 0.0), (0, 2, Some("a"), 0.0)]);
    let closed = close(&raw);
    assert!(closed.is_final(closed.start));
    assert!(closed.accepts(&[]));
    assert!(closed.accepts(&["a"]));
  }

  #[test]
  fn test_tags_follow_epsilon_paths() {
    let g: Grammar = "public <a> = (<NULL> {greeting}) hello;".parse().unwrap();
    let closed = g.build_fsg("a", false).unwrap();
    let hello = closed
      .transitions
      .iter()
      .find(|t| t.word.as_deref() == Some("hello"))
      .unwrap();
    assert!(hello.tags.contains(&Tag::new("greeting", None)));
  }
}
