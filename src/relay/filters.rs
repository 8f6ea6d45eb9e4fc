use std::sync::Arc;
use rustc_hash::FxHashSet;

use crate::messaging::message::{CommandKind, Message};
use crate::relay::MessageFilter;


/// a filter deciding on a message's destination URI
pub fn make_dest_filter(predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> MessageFilter {
    Arc::new(move |message: &Message| predicate(message.dest_uri()))
}

/// What a destination URI must start with: either a literal prefix, or a pattern matched
///  against the URI's beginning
#[derive(Clone)]
pub enum DestPrefix {
    Literal(String),
    Pattern(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}
impl DestPrefix {
    pub fn pattern(matcher: impl Fn(&str) -> bool + Send + Sync + 'static) -> DestPrefix {
        DestPrefix::Pattern(Arc::new(matcher))
    }

    /// a prefix of path segments where `*` stands for any single segment, e.g. `veh.*/sm`
    pub fn segments(pattern: &str) -> DestPrefix {
        let segments = pattern.split('/').map(|s| s.to_string()).collect::<Vec<_>>();
        DestPrefix::pattern(move |dest_uri| {
            let mut actual = dest_uri.split('/');
            segments.iter().all(|expected| match actual.next() {
                Some(segment) => expected == "*" || segment_matches(expected, segment),
                None => false,
            })
        })
    }

    pub fn matches(&self, dest_uri: &str) -> bool {
        match self {
            DestPrefix::Literal(prefix) => dest_uri.starts_with(prefix.as_str()),
            DestPrefix::Pattern(matcher) => matcher(dest_uri),
        }
    }
}
impl From<&str> for DestPrefix {
    fn from(value: &str) -> Self {
        DestPrefix::Literal(value.to_string())
    }
}
impl From<String> for DestPrefix {
    fn from(value: String) -> Self {
        DestPrefix::Literal(value)
    }
}

/// `*` at the end of a segment matches any rest, e.g. `veh.*` matches `veh.17`
fn segment_matches(expected: &str, segment: &str) -> bool {
    match expected.strip_suffix('*') {
        Some(stem) => segment.starts_with(stem),
        None => expected == segment,
    }
}

pub fn make_dest_prefix_filter(prefix: impl Into<DestPrefix>) -> MessageFilter {
    let prefix = prefix.into();
    make_dest_filter(move |dest_uri| prefix.matches(dest_uri))
}

/// lets everything pass except the given kinds of commands
pub fn make_command_filter(rejected: &[CommandKind]) -> MessageFilter {
    let rejected = rejected.iter().copied().collect::<FxHashSet<_>>();
    Arc::new(move |message: &Message| !rejected.contains(&message.kind()))
}
