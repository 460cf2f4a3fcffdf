use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::Error;
use crate::grammar::Grammar;
use crate::rules::{Alternative, RuleId, RuleTarget};

impl Grammar {
  /// Binds every rule reference to its target rule and marks recursive rules.
  ///
  /// Names are looked up in this grammar first and then along the parent chain;
  /// `grammar.rule` only matches a grammar with that name. A rule with a
  /// reference that can't be bound is marked broken and reported, but the rest
  /// of the grammar stays usable. Safe to call again: everything is recomputed.
  pub fn resolve(&mut self) -> Vec<Error> {
    let mut errors = Vec::new();

    for idx in 0..self.rules.len() {
      let mut names = Vec::new();
      self.rules[idx].expansion.for_each_ref(&mut |r| {
        if !names.contains(&r.name) {
          names.push(r.name.clone());
        }
      });

      let bindings = names
        .into_iter()
        .map(|name| {
          let target = self.lookup(&name);
          (name, target)
        })
        .collect::<HashMap<_, _>>();

      let rule = self.rule_mut(RuleId(idx as u32));
      rule.unresolved.clear();
      let mut unresolved = Vec::new();
      rule.expansion.for_each_ref_mut(&mut |r| {
        r.target = bindings.get(&r.name).copied().flatten();
        if r.target.is_none() && !unresolved.contains(&r.name) {
          unresolved.push(r.name.clone());
        }
      });

      for reference in unresolved.iter() {
        warn!(rule = %rule.name, reference = %reference, "unresolved rule reference");
        errors.push(Error::UnresolvedReference {
          rule: rule.name.clone(),
          reference: reference.clone(),
        });
      }
      rule.unresolved = unresolved;
    }

    self.mark_recursive();
    errors
  }

  /// Finds the rule a reference name denotes, searching nearest grammar first
  fn lookup(&self, name: &str) -> Option<RuleTarget> {
    let (grammar_name, rule_name) = match name.rsplit_once('.') {
      Some((g, r)) => (Some(g), r),
      None => (None, name),
    };

    self
      .chain()
      .filter(|g| match grammar_name {
        None => true,
        Some(wanted) => g.name().is_some_and(|n| grammar_name_matches(n, wanted)),
      })
      .find_map(|g| {
        g.rule_id(rule_name).map(|rule| RuleTarget {
          grammar: g.id(),
          rule,
        })
      })
  }

  /// Marks every rule on a local reference cycle as recursive (Tarjan's SCC)
  fn mark_recursive(&mut self) {
    let n = self.rules.len();
    let own = self.id();
    let edges = self
      .rules
      .iter()
      .map(|rule| {
        let mut out = Vec::new();
        rule.expansion.for_each_ref(&mut |r| {
          if let Some(t) = r.target.filter(|t| t.grammar == own) {
            out.push(t.rule.0 as usize);
          }
        });
        out
      })
      .collect::<Vec<_>>();

    let mut tarjan = Tarjan {
      edges: &edges,
      index: vec![None; n],
      lowlink: vec![0; n],
      on_stack: vec![false; n],
      stack: Vec::new(),
      next_index: 0,
      recursive: vec![false; n],
    };
    for v in 0..n {
      if tarjan.index[v].is_none() {
        tarjan.visit(v);
      }
    }

    let recursive = tarjan.recursive;
    for (rule, rec) in self.rules.iter_mut().zip(recursive) {
      rule.recursive = rec;
    }
    debug!(
      recursive = self.rules.iter().filter(|r| r.recursive).count(),
      "marked recursive rules"
    );
  }

  /// Normalizes the branch weights of every alternation into probabilities.
  ///
  /// Without any explicit weight, branches are equally likely. Otherwise the
  /// explicit weights are scaled to sum to 1, and unweighted branches get
  /// probability 0. If every explicit weight is 0, branches are equally likely.
  /// Probabilities are derived from the weights as written, so calling this
  /// again gives the same result.
  pub fn update_weight(&mut self) {
    for rule in self.rules.iter_mut() {
      rule.expansion.for_each_alternation_mut(&mut normalize);
    }
  }
}

/// `com.acme.numbers` answers to `numbers` and vice versa
fn grammar_name_matches(have: &str, wanted: &str) -> bool {
  have == wanted || have.rsplit('.').next() == wanted.rsplit('.').next()
}

fn normalize(alts: &mut Vec<Alternative>) {
  if alts.is_empty() {
    return;
  }
  let total: f32 = alts.iter().filter_map(|a| a.weight).sum();
  if alts.iter().all(|a| a.weight.is_none()) || total <= 0.0 {
    let uniform = 1.0 / alts.len() as f32;
    alts.iter_mut().for_each(|a| a.prob = uniform);
  } else {
    alts
      .iter_mut()
      .for_each(|a| a.prob = a.weight.unwrap_or(0.0) / total);
  }
}

struct Tarjan<'a> {
  edges: &'a [Vec<usize>],
  index: Vec<Option<usize>>,
  lowlink: Vec<usize>,
  on_stack: Vec<bool>,
  stack: Vec<usize>,
  next_index: usize,
  recursive: Vec<bool>,
}

impl Tarjan<'_> {
  fn visit(&mut self, v: usize) {
    self.index[v] = Some(self.next_index);
    self.lowlink[v] = self.next_index;
    self.next_index += 1;
    self.stack.push(v);
    self.on_stack[v] = true;

    let edges = self.edges;
    for &w in edges[v].iter() {
      match self.index[w] {
        None => {
          self.visit(w);
          self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
        }
        Some(w_index) if self.on_stack[w] => {
          self.lowlink[v] = self.lowlink[v].min(w_index);
        }
        Some(_) => {}
      }
    }

    if Some(self.lowlink[v]) == self.index[v] {
      let mut component = Vec::new();
      while let Some(w) = self.stack.pop() {
        self.on_stack[w] = false;
        component.push(w);
        if w == v {
          break;
        }
      }
      let cyclic = component.len() > 1 || self.edges[v].contains(&v);
      if cyclic {
        for w in component {
          self.recursive[w] = true;
        }
      }
    }
  }
}
