use std::collections::BTreeMap;

use crate::messaging::message::Message;


/// Substitutes parts of URIs. Replacements are applied one after the other, each replacing all
///  occurrences of its pattern.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UriReplacer {
    replacements: Vec<(String, String)>,
}

impl UriReplacer {
    pub fn new(replacements: Vec<(String, String)>) -> UriReplacer {
        UriReplacer {
            replacements: replacements.into_iter()
                .filter(|(pattern, _)| !pattern.is_empty())
                .collect(),
        }
    }

    /// replaces variable names by their values, for messages arriving on a relay
    pub fn expanding(vars: &BTreeMap<String, String>) -> UriReplacer {
        UriReplacer::new(vars.iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// replaces variable values by their names, for messages leaving through a relay
    pub fn collapsing(vars: &BTreeMap<String, String>) -> UriReplacer {
        UriReplacer::new(vars.iter()
            .map(|(k, v)| (v.clone(), k.clone()))
            .collect())
    }

    pub fn is_empty(&self) -> bool {
        self.replacements.is_empty()
    }

    pub fn apply(&self, uri: &str) -> String {
        self.replacements.iter()
            .fold(uri.to_string(), |uri, (pattern, replacement)| uri.replace(pattern.as_str(), replacement))
    }

    pub fn rewrite(&self, message: &Message) -> Message {
        if self.is_empty() {
            return message.clone();
        }
        message.map_uris(|uri| self.apply(uri))
    }
}

/// Both ends of a link see the same merged table. On conflicting names, the peer's value wins.
pub fn merge_vars(own: &BTreeMap<String, String>, peer: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut result = own.clone();
    result.extend(peer.iter().map(|(k, v)| (k.clone(), v.clone())));
    result
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::messaging::message::{Command, SinkEndData};
    use crate::pull::End;
    use super::*;

    fn vars(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[rstest]
    #[case::no_vars(&[], "veh.1/sm", "veh.1/sm")]
    #[case::single(&[("{v}", "veh.1")], "{v}/sm", "veh.1/sm")]
    #[case::all_occurrences(&[("{v}", "veh.1")], "{v}/{v}", "veh.1/veh.1")]
    #[case::two_vars(&[("{sm}", "sm.2"), ("{v}", "veh.1")], "{v}{sm}", "veh.1sm.2")]
    #[case::no_match(&[("{v}", "veh.1")], "other", "other")]
    fn test_expanding(#[case] entries: &[(&str, &str)], #[case] uri: &str, #[case] expected: &str) {
        assert_eq!(UriReplacer::expanding(&vars(entries)).apply(uri), expected);
    }

    #[test]
    fn test_collapsing() {
        let replacer = UriReplacer::collapsing(&vars(&[("{v}", "veh.LW0001"), ("{sm}", "/sm")]));
        assert_eq!(replacer.apply("veh.LW0001/sm"), "{v}{sm}");
    }

    #[test]
    fn test_rewrite_keeps_id() {
        let msg = Message::new(Command::SinkEnd(SinkEndData {
            source_uri: "{a}".to_string(),
            dest_uri: "{b}".to_string(),
            port_id: "p".to_string(),
            end: End::Done,
        }));
        let rewritten = UriReplacer::expanding(&vars(&[("{a}", "A"), ("{b}", "B")])).rewrite(&msg);
        assert_eq!(rewritten.id, msg.id);
        assert_eq!(rewritten.source_uri(), "A");
        assert_eq!(rewritten.dest_uri(), "B");
    }

    #[test]
    fn test_empty_pattern_ignored() {
        let replacer = UriReplacer::collapsing(&vars(&[("{x}", "")]));
        assert!(replacer.is_empty());
        assert_eq!(replacer.apply("abc"), "abc");
    }

    #[test]
    fn test_merge_vars() {
        let merged = merge_vars(&vars(&[("a", "1"), ("b", "2")]), &vars(&[("b", "3"), ("c", "4")]));
        assert_eq!(merged, vars(&[("a", "1"), ("b", "3"), ("c", "4")]));
    }
}
