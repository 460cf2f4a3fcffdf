use serde::Deserialize;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::rules::Tag;

/// A tag supplied from outside the grammar, optionally limited to a token span
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TagAssignment {
  #[serde(flatten)]
  pub tag: Tag,
  /// Half-open token range `[start, end)`, None for the whole utterance
  #[serde(default)]
  pub span: Option<(usize, usize)>,
}

impl TagAssignment {
  pub fn new(tag: Tag, span: Option<(usize, usize)>) -> Self {
    Self { tag, span }
  }

  /// Whether this assignment lies inside `span`
  pub fn within(&self, span: (usize, usize)) -> bool {
    match self.span {
      None => true,
      Some((start, end)) => start <= end && span.0 <= start && end <= span.1,
    }
  }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TagList {
  List(Vec<TagAssignment>),
  Map(BTreeMap<String, Option<String>>),
}

/// Parses a tag list from JSON.
///
/// Accepts either an array of `{"label": .., "value": .., "span": [start, end]}`
/// objects (`value` and `span` optional), or a plain object mapping labels to
/// values (or null), which applies every tag to the whole utterance.
pub fn parse_tag_list(json: &str) -> Result<Vec<TagAssignment>> {
  let list = match serde_json::from_str::<TagList>(json)? {
    TagList::List(list) => list,
    TagList::Map(map) => map
      .into_iter()
      .map(|(label, value)| TagAssignment::new(Tag::new(label, value.as_deref()), None))
      .collect(),
  };
  Ok(list)
}
