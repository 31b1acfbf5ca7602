use std::fmt;

use regex::Regex;

/// Selects job or trigger groups by name.
///
/// Used by the group-scoped queries and by group pause/resume. `Equals` is special for
/// pausing: it names one group directly, so the group is marked paused even when no
/// trigger currently lives in it.
#[derive(Clone)]
pub enum GroupMatcher {
  Equals(String),
  StartsWith(String),
  EndsWith(String),
  Contains(String),
  Anything,
  Regex(Regex),
}

impl GroupMatcher {
  pub fn equals(group: impl Into<String>) -> Self {
    GroupMatcher::Equals(group.into())
  }

  pub fn starts_with(prefix: impl Into<String>) -> Self {
    GroupMatcher::StartsWith(prefix.into())
  }

  pub fn ends_with(suffix: impl Into<String>) -> Self {
    GroupMatcher::EndsWith(suffix.into())
  }

  pub fn contains(fragment: impl Into<String>) -> Self {
    GroupMatcher::Contains(fragment.into())
  }

  pub fn anything() -> Self {
    GroupMatcher::Anything
  }

  /// Compiles `pattern` into a regex matcher.
  pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
    Regex::new(pattern).map(GroupMatcher::Regex)
  }

  pub fn is_match(&self, group: &str) -> bool {
    match self {
      GroupMatcher::Equals(value) => group == value,
      GroupMatcher::StartsWith(prefix) => group.starts_with(prefix.as_str()),
      GroupMatcher::EndsWith(suffix) => group.ends_with(suffix.as_str()),
      GroupMatcher::Contains(fragment) => group.contains(fragment.as_str()),
      GroupMatcher::Anything => true,
      GroupMatcher::Regex(re) => re.is_match(group),
    }
  }

  /// The single group named by an `Equals` matcher.
  pub(crate) fn exact_group(&self) -> Option<&str> {
    match self {
      GroupMatcher::Equals(value) => Some(value),
      _ => None,
    }
  }
}

impl fmt::Debug for GroupMatcher {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      GroupMatcher::Equals(v) => write!(f, "GroupMatcher::Equals({:?})", v),
      GroupMatcher::StartsWith(v) => write!(f, "GroupMatcher::StartsWith({:?})", v),
      GroupMatcher::EndsWith(v) => write!(f, "GroupMatcher::EndsWith({:?})", v),
      GroupMatcher::Contains(v) => write!(f, "GroupMatcher::Contains({:?})", v),
      GroupMatcher::Anything => f.write_str("GroupMatcher::Anything"),
      GroupMatcher::Regex(re) => write!(f, "GroupMatcher::Regex({:?})", re.as_str()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn matches_by_operator() {
    assert!(GroupMatcher::equals("g1").is_match("g1"));
    assert!(!GroupMatcher::equals("g1").is_match("g10"));
    assert!(GroupMatcher::starts_with("rep").is_match("reports"));
    assert!(GroupMatcher::ends_with("orts").is_match("reports"));
    assert!(GroupMatcher::contains("po").is_match("reports"));
    assert!(GroupMatcher::anything().is_match(""));
  }

  #[test]
  fn regex_matcher() {
    let m = GroupMatcher::regex("^batch-[0-9]+$").unwrap();
    assert!(m.is_match("batch-42"));
    assert!(!m.is_match("batch-x"));
    assert!(GroupMatcher::regex("(").is_err());
    assert_eq!(format!("{:?}", m), "GroupMatcher::Regex(\"^batch-[0-9]+$\")");
  }

  #[test]
  fn exact_group_only_for_equals() {
    assert_eq!(GroupMatcher::equals("g").exact_group(), Some("g"));
    assert_eq!(GroupMatcher::starts_with("g").exact_group(), None);
  }
}
