//! Simple recursive-descent parsing of JSGF grammar text
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::grammar::Grammar;
use crate::rules::{Alternative, Expansion, Rule, RuleRef, Tag};

impl Grammar {
  /// Parses grammar text, failing on the first syntax error.
  ///
  /// The parsed grammar is resolved against itself and `parent`, and its
  /// weights are normalized. Unresolved references don't fail the parse; they
  /// mark the referencing rules broken (see [`Grammar::resolve`]).
  pub fn parse_str(src: &str, parent: Option<Arc<Grammar>>) -> Result<Self> {
    let mut grammar = Self::new(parent);
    let errors = parse_into(&mut grammar, src);
    if let Some(err) = errors.into_iter().next() {
      return Err(err);
    }
    grammar.resolve();
    grammar.update_weight();
    Ok(grammar)
  }

  /// Parses grammar text, carrying on past rules that don't parse.
  ///
  /// A rule whose body fails to parse is kept with an empty body and its
  /// syntax error, so it reports as broken and references to it still bind.
  /// Returns the grammar along with all syntax and resolution errors. A
  /// header error stops parsing altogether.
  pub fn parse_str_lenient(src: &str, parent: Option<Arc<Grammar>>) -> (Self, Vec<Error>) {
    let mut grammar = Self::new(parent);
    let mut errors = parse_into(&mut grammar, src);
    errors.extend(grammar.resolve());
    grammar.update_weight();
    (grammar, errors)
  }
}

/// A parse failure, positioned by how much input was left when it happened
#[derive(Debug)]
struct Fail {
  remaining: usize,
  reason: String,
}

impl Fail {
  fn at(s: &str, reason: impl Into<String>) -> Self {
    Self {
      remaining: s.len(),
      reason: reason.into(),
    }
  }

  /// Turns the failure into a line/column syntax error against the full source
  fn locate(self, src: &str) -> Error {
    let offset = src.len().saturating_sub(self.remaining);
    let before = &src[..offset];
    let line = before.matches('\n').count() + 1;
    let column = match before.rfind('\n') {
      Some(nl) => before[nl + 1..].chars().count() + 1,
      None => before.chars().count() + 1,
    };
    Error::Syntax {
      line,
      column,
      reason: self.reason,
    }
  }
}

type Infallible<'a, T> = (T, &'a str);
type ParseResult<'a, T> = std::result::Result<(T, &'a str), Fail>;

/// helper macro for initializing a regex with lazy_static!
macro_rules! regex_static {
  ($name:ident, $pattern:expr) => {
    lazy_static! {
      static ref $name: Regex = Regex::new($pattern).unwrap();
    }
  };
}

/// Try to consume a regex, returning None if it doesn't match
fn optional_re<'a>(re: &'static Regex, s: &'a str) -> Infallible<'a, Option<&'a str>> {
  match re.find(s) {
    Some(m) if m.start() == 0 => {
      let (_, rest) = s.split_at(m.end());
      (Some(m.as_str()), rest)
    }
    _ => (None, s),
  }
}

/// Try to consume a regex, failing if it doesn't match
fn needed_re<'a>(re: &'static Regex, s: &'a str, what: &str) -> ParseResult<'a, &'a str> {
  if let (Some(c), rest) = optional_re(re, s) {
    Ok((c, rest))
  } else {
    Err(Fail::at(s, format!("expected {}, found {}", what, describe(s))))
  }
}

/// Try to consume a char, returning None if it doesn't match
fn optional_char(c: char, s: &str) -> Infallible<'_, Option<char>> {
  match s.strip_prefix(c) {
    Some(rest) => (Some(c), rest),
    None => (None, s),
  }
}

/// Try to consume a char, failing if it doesn't match
fn needed_char(c: char, s: &str) -> ParseResult<'_, char> {
  if let (Some(c), rest) = optional_char(c, s) {
    Ok((c, rest))
  } else {
    Err(Fail::at(s, format!("expected '{}', found {}", c, describe(s))))
  }
}

/// Names the next token for error messages
fn describe(s: &str) -> String {
  match s.chars().next() {
    None => "end of input".to_string(),
    Some(c) => format!("'{}'", c),
  }
}

/// Skips whitespace, `//` line comments and `/* */` block comments
fn skip_whitespace(s: &str) -> &str {
  regex_static!(WHITESPACE_OR_COMMENT, r"\A(?:\s+|//[^\n]*|/\*(?s:.*?)\*/)*");
  optional_re(&WHITESPACE_OR_COMMENT, s).1
}

/// Consumes a keyword, which must not run on into a longer word
fn keyword<'a>(re: &'static Regex, s: &'a str) -> Infallible<'a, bool> {
  let (kw, rest) = optional_re(re, s);
  (kw.is_some(), rest)
}

/// `#JSGF V1.0 [encoding [locale]];`, `grammar name;`, `import <name>;`*
fn parse_header(s: &str) -> ParseResult<'_, (Option<String>, Vec<String>)> {
  regex_static!(SELF_IDENT, r"\A#JSGF[^;]*;");
  regex_static!(GRAMMAR_KW, r"\Agrammar\b");
  regex_static!(IMPORT_KW, r"\Aimport\b");
  regex_static!(GRAMMAR_NAME, r"\A[A-Za-z0-9_\-\.$]+");

  let mut s = skip_whitespace(s);
  if s.starts_with("#JSGF") {
    s = needed_re(&SELF_IDENT, s, "';' ending the #JSGF header")?.1;
  }

  s = skip_whitespace(s);
  let (has_name, rest) = keyword(&GRAMMAR_KW, s);
  let mut name = None;
  if has_name {
    let rest = skip_whitespace(rest);
    let (n, rest) = needed_re(&GRAMMAR_NAME, rest, "grammar name")?;
    let rest = skip_whitespace(rest);
    s = needed_char(';', rest)?.1;
    name = Some(n.to_string());
  }

  let mut imports = Vec::new();
  loop {
    s = skip_whitespace(s);
    let (is_import, rest) = keyword(&IMPORT_KW, s);
    if !is_import {
      break;
    }
    let rest = skip_whitespace(rest);
    let (import, rest) = parse_bracketed_name(rest)?;
    let rest = skip_whitespace(rest);
    s = needed_char(';', rest)?.1;
    imports.push(import.to_string());
  }

  Ok(((name, imports), s))
}

/// `<name>`, returning the name without brackets
fn parse_bracketed_name(s: &str) -> ParseResult<'_, &str> {
  regex_static!(RULE_NAME, r"\A[^<>\s;]+");
  let (_, s) = needed_char('<', s)?;
  let (name, s) = needed_re(&RULE_NAME, s, "rule name")?;
  let (_, s) = needed_char('>', s)?;
  Ok((name, s))
}

/// `[public] <name> =`
fn parse_rule_head(s: &str) -> ParseResult<'_, (bool, &str)> {
  regex_static!(PUBLIC_KW, r"\Apublic\b");
  let (public, s) = keyword(&PUBLIC_KW, s);
  let s = skip_whitespace(s);
  let (name, s) = parse_bracketed_name(s)?;
  if name == "NULL" || name == "VOID" {
    return Err(Fail::at(s, format!("<{}> is reserved and can't be redefined", name)));
  }
  let s = skip_whitespace(s);
  let (_, s) = needed_char('=', s)?;
  Ok(((public, name), s))
}

/// Alternatives separated by `|`, each optionally prefixed by a `/weight/`
fn parse_alternation(s: &str) -> ParseResult<'_, Expansion> {
  let mut alts = Vec::new();
  let mut rem = s;
  loop {
    rem = skip_whitespace(rem);
    let (weight, s) = parse_weight(rem)?;
    let (expansion, s) = parse_sequence(s)?;
    alts.push(Alternative::new(expansion, weight));
    rem = skip_whitespace(s);
    match optional_char('|', rem) {
      (Some(_), s) => rem = s,
      (None, _) => break,
    }
  }

  if alts.len() == 1 && alts[0].weight.is_none() {
    let only = alts.remove(0);
    Ok((only.expansion, rem))
  } else {
    Ok((Expansion::Alternation(alts), rem))
  }
}

/// An optional `/number/` weight
fn parse_weight(s: &str) -> ParseResult<'_, Option<f32>> {
  regex_static!(WEIGHT, r"\A/\s*[0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?\s*/");
  if !s.starts_with('/') {
    return Ok((None, s));
  }
  let (w, rest) = needed_re(&WEIGHT, s, "a /weight/")?;
  let value = w
    .trim_matches('/')
    .trim()
    .parse::<f32>()
    .map_err(|e| Fail::at(s, format!("bad weight {}: {}", w, e)))?;
  Ok((Some(value), rest))
}

/// Juxtaposed units, up to the end of the enclosing alternative
fn parse_sequence(s: &str) -> ParseResult<'_, Expansion> {
  let mut items = Vec::new();
  let mut rem = s;
  loop {
    rem = skip_whitespace(rem);
    match rem.chars().next() {
      None | Some(';') | Some('|') | Some(')') | Some(']') => break,
      _ => {}
    }
    let (unit, s) = parse_postfixed(rem)?;
    items.push(unit);
    rem = s;
  }

  match items.len() {
    0 => Err(Fail::at(rem, format!("empty expansion before {}", describe(rem)))),
    1 => Ok((items.remove(0), rem)),
    _ => Ok((Expansion::Sequence(items), rem)),
  }
}

/// An atom followed by any run of `*`, `+`, `?` and `{tag}`, applied left to right
fn parse_postfixed(s: &str) -> ParseResult<'_, Expansion> {
  let (mut unit, mut rem) = parse_atom(s)?;
  loop {
    let s = skip_whitespace(rem);
    match s.chars().next() {
      Some('*') => {
        unit = Expansion::kleene(unit);
        rem = &s[1..];
      }
      Some('+') => {
        unit = Expansion::plus(unit);
        rem = &s[1..];
      }
      Some('?') => {
        unit = Expansion::Optional(Box::new(unit));
        rem = &s[1..];
      }
      Some('{') => {
        let (tag, s) = parse_tag(s)?;
        unit = match unit {
          Expansion::Tagged(inner, mut tags) => {
            tags.push(tag);
            Expansion::Tagged(inner, tags)
          }
          other => Expansion::Tagged(Box::new(other), vec![tag]),
        };
        rem = s;
      }
      _ => return Ok((unit, rem)),
    }
  }
}

fn parse_atom(s: &str) -> ParseResult<'_, Expansion> {
  regex_static!(WORD, r#"\A[^\s;=|*+?()\[\]{}<>/"]+"#);

  match s.chars().next() {
    Some('(') => {
      let (inner, rest) = parse_alternation(&s[1..])?;
      let rest = skip_whitespace(rest);
      match optional_char(')', rest) {
        (Some(_), rest) => Ok((inner, rest)),
        (None, _) => Err(Fail::at(rest, format!("unbalanced '(': expected ')', found {}", describe(rest)))),
      }
    }
    Some('[') => {
      let (inner, rest) = parse_alternation(&s[1..])?;
      let rest = skip_whitespace(rest);
      match optional_char(']', rest) {
        (Some(_), rest) => Ok((Expansion::Optional(Box::new(inner)), rest)),
        (None, _) => Err(Fail::at(rest, format!("unbalanced '[': expected ']', found {}", describe(rest)))),
      }
    }
    Some('<') => {
      let (name, rest) = parse_bracketed_name(s)?;
      let expansion = match name {
        "NULL" => Expansion::null(),
        "VOID" => Expansion::void(),
        _ => Expansion::RuleRef(RuleRef::new(name)),
      };
      Ok((expansion, rest))
    }
    Some('"') => parse_quoted(s),
    Some('{') => Err(Fail::at(s, "tag without an expansion to attach to")),
    Some('/') if s.starts_with("/*") => Err(Fail::at(s, "unterminated comment")),
    Some('/') => Err(Fail::at(s, "a weight may only start an alternative")),
    _ => {
      let (word, rest) = needed_re(&WORD, s, "a token")?;
      Ok((Expansion::Literal(word.to_string()), rest))
    }
  }
}

/// Reads up to an unescaped `close`, starting just past the opening delimiter
fn delimited(s: &str, close: char) -> Option<(String, &str)> {
  let mut out = String::new();
  let mut chars = s.char_indices();
  while let Some((idx, c)) = chars.next() {
    if c == '\\' {
      if let Some((_, escaped)) = chars.next() {
        out.push(escaped);
      }
    } else if c == close {
      return Some((out, &s[idx + c.len_utf8()..]));
    } else {
      out.push(c);
    }
  }
  None
}

/// `"quoted token"`, which may hold whitespace
fn parse_quoted(s: &str) -> ParseResult<'_, Expansion> {
  let (_, body) = needed_char('"', s)?;
  match delimited(body, '"') {
    None => Err(Fail::at(s, "unterminated string")),
    Some((text, _)) if text.trim().is_empty() => Err(Fail::at(s, "empty quoted token")),
    Some((text, rest)) => Ok((Expansion::Literal(text), rest)),
  }
}

/// `{label}` or `{label:value}`
fn parse_tag(s: &str) -> ParseResult<'_, Tag> {
  let (_, body) = needed_char('{', s)?;
  match delimited(body, '}') {
    None => Err(Fail::at(s, "unterminated tag")),
    Some((text, _)) if text.trim().is_empty() => Err(Fail::at(s, "empty tag")),
    Some((text, rest)) => Ok((Tag::from_text(&text), rest)),
  }
}

/// A whole rule definition, through its terminating `;`
fn parse_rule_body(s: &str) -> ParseResult<'_, Expansion> {
  let (expansion, s) = parse_alternation(s)?;
  let s = skip_whitespace(s);
  match s.chars().next() {
    Some(';') => Ok((expansion, &s[1..])),
    Some(')') => Err(Fail::at(s, "unbalanced ')'")),
    Some(']') => Err(Fail::at(s, "unbalanced ']'")),
    _ => Err(Fail::at(s, format!("expected ';', found {}", describe(s)))),
  }
}

/// Skips past the next `;`, or to the end of input
fn recover(s: &str) -> &str {
  match s.find(';') {
    Some(idx) => &s[idx + 1..],
    None => "",
  }
}

/// Parses `src` into `grammar`, returning every syntax error found
fn parse_into(grammar: &mut Grammar, src: &str) -> Vec<Error> {
  let mut errors = Vec::new();

  let mut rem = match parse_header(src) {
    Ok(((name, imports), rest)) => {
      grammar.name = name;
      grammar.imports = imports;
      rest
    }
    Err(fail) => return vec![fail.locate(src)],
  };

  loop {
    rem = skip_whitespace(rem);
    if rem.is_empty() {
      break;
    }

    let rule_start = rem;
    let ((public, name), body) = match parse_rule_head(rem) {
      Ok(head) => head,
      Err(fail) => {
        errors.push(fail.locate(src));
        rem = recover(rem);
        continue;
      }
    };

    match parse_rule_body(body) {
      Ok((expansion, rest)) => {
        if grammar.add_rule(Rule::new(name, public, expansion)).is_err() {
          errors.push(Fail::at(rule_start, format!("duplicate rule <{}>", name)).locate(src));
        }
        rem = rest;
      }
      Err(fail) => {
        // keep the rule so references to it still bind, but mark why it can't be used
        let err = fail.locate(src);
        let broken = Rule {
          syntax_error: Some(err.to_string()),
          ..Rule::new(name, public, Expansion::void())
        };
        if grammar.add_rule(broken).is_err() {
          errors.push(Fail::at(rule_start, format!("duplicate rule <{}>", name)).locate(src));
        }
        errors.push(err);
        rem = recover(body);
      }
    }
  }

  debug!(
    grammar = grammar.name().unwrap_or("<anonymous>"),
    rules = grammar.len(),
    errors = errors.len(),
    "parsed grammar"
  );
  errors
}
