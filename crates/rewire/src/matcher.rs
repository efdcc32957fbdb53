//! Port pattern matching.
//!
//! Pure functions from a [`GraphSnapshot`] and a rule set to the connect and
//! disconnect actions that would bring the graph in line with the rules.
//! Nothing here talks to the server.

use regex::Regex;
use rewireconf::ConnectionConfig;
use thiserror::Error;
use tracing::debug;

use crate::server::GraphSnapshot;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid {side} pattern \"{pattern}\": {source}")]
    Pattern {
        side: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A routing rule with both patterns compiled. Patterns must match the
/// whole port name.
#[derive(Debug, Clone)]
pub struct ConnectionRule {
    config: ConnectionConfig,
    output: Regex,
    input: Regex,
}

impl PartialEq for ConnectionRule {
    fn eq(&self, other: &Self) -> bool {
        self.config == other.config
    }
}

fn anchored(side: &'static str, pattern: &str) -> Result<Regex, RuleError> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|source| RuleError::Pattern {
        side,
        pattern: pattern.to_string(),
        source,
    })
}

impl ConnectionRule {
    pub fn compile(config: ConnectionConfig) -> Result<Self, RuleError> {
        Ok(Self {
            output: anchored("out", &config.output)?,
            input: anchored("in", &config.input)?,
            config,
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn matches_output(&self, port: &str) -> bool {
        self.output.is_match(port)
    }

    pub fn matches_input(&self, port: &str) -> bool {
        self.input.is_match(port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortAction {
    Connect { output: String, input: String },
    Disconnect { output: String, input: String },
}

/// Connections the rules ask for that are not there yet.
pub fn connect_actions(snapshot: &GraphSnapshot, rules: &[ConnectionRule]) -> Vec<PortAction> {
    let mut actions = Vec::new();
    for input in snapshot.inputs() {
        for rule in rules.iter().filter(|r| r.matches_input(&input.name)) {
            for output in snapshot.outputs().filter(|o| rule.matches_output(&o.name)) {
                if snapshot.is_connected(&output.name, &input.name) {
                    continue;
                }
                let action = PortAction::Connect {
                    output: output.name.clone(),
                    input: input.name.clone(),
                };
                if !actions.contains(&action) {
                    actions.push(action);
                }
            }
        }
    }
    actions
}

/// Existing connections that should go.
///
/// A rule matching both ends protects a connection no matter where it sits
/// in the list. Without such a rule, a connection goes if some rule matches
/// one end and has the disconnect flag for that end set, or if a removed
/// rule matches both ends.
pub fn disconnect_actions(
    snapshot: &GraphSnapshot,
    rules: &[ConnectionRule],
    removed: &[ConnectionRule],
) -> Vec<PortAction> {
    let mut actions = Vec::new();
    for (output, input) in snapshot.connections() {
        debug!("\"{}\" is connected to \"{}\"", output, input);

        let mut matched = false;
        let mut eligible = false;
        for rule in rules {
            let out_match = rule.matches_output(&output);
            let in_match = rule.matches_input(&input);
            if out_match && in_match {
                matched = true;
                break;
            }
            if (out_match && rule.config.out_disconnect) || (in_match && rule.config.in_disconnect) {
                eligible = true;
            }
        }
        if matched {
            continue;
        }

        if !eligible {
            eligible = removed
                .iter()
                .any(|rule| rule.matches_output(&output) && rule.matches_input(&input));
        }

        if eligible {
            actions.push(PortAction::Disconnect { output, input });
        }
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{PortDirection, PortInfo};
    use pretty_assertions::assert_eq;

    fn port(name: &str, direction: PortDirection, connections: &[&str]) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            direction,
            connections: connections.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn rule(output: &str, input: &str, out_disconnect: bool, in_disconnect: bool) -> ConnectionRule {
        ConnectionRule::compile(ConnectionConfig {
            output: output.to_string(),
            input: input.to_string(),
            out_disconnect,
            in_disconnect,
        })
        .unwrap()
    }

    fn disconnect(output: &str, input: &str) -> PortAction {
        PortAction::Disconnect {
            output: output.to_string(),
            input: input.to_string(),
        }
    }

    /// `a:out` feeds `b:in`, `c:out` is idle.
    fn patched() -> GraphSnapshot {
        GraphSnapshot::new(vec![
            port("a:out", PortDirection::Output, &["b:in"]),
            port("b:in", PortDirection::Input, &["a:out"]),
            port("c:out", PortDirection::Output, &[]),
        ])
    }

    #[test]
    fn test_patterns_are_anchored() {
        let exact = rule("system:capture_1", "delay:in", false, false);
        assert!(exact.matches_output("system:capture_1"));
        assert!(!exact.matches_output("system:capture_10"));
        assert!(!exact.matches_input("xdelay:in"));

        let alternation = rule("a|b", "x", false, false);
        assert!(alternation.matches_output("b"));
        assert!(!alternation.matches_output("ab"));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = ConnectionRule::compile(ConnectionConfig::new("(", "x")).unwrap_err();
        assert!(err.to_string().contains("out pattern"));
    }

    #[test]
    fn test_connect_scenario() {
        let snapshot = GraphSnapshot::new(vec![
            port("system:capture_1", PortDirection::Output, &[]),
            port("system:capture_2", PortDirection::Output, &[]),
            port("delay:in_l", PortDirection::Input, &[]),
            port("delay:in_r", PortDirection::Input, &[]),
        ]);
        let rules = [rule("^system:capture_1$", "^delay:in_l$", false, false)];
        assert_eq!(
            connect_actions(&snapshot, &rules),
            vec![PortAction::Connect {
                output: "system:capture_1".to_string(),
                input: "delay:in_l".to_string(),
            }]
        );
    }

    #[test]
    fn test_connect_skips_existing() {
        let rules = [rule("a:out", "b:in", false, false)];
        assert!(connect_actions(&patched(), &rules).is_empty());
    }

    #[test]
    fn test_full_match_wins_in_any_order() {
        let broad = rule("x:.*", "b:in", false, true);
        let exact = rule("a:out", "b:in", false, false);
        let snapshot = patched();

        assert!(disconnect_actions(&snapshot, &[broad.clone(), exact.clone()], &[]).is_empty());
        assert!(disconnect_actions(&snapshot, &[exact, broad], &[]).is_empty());
    }

    #[test]
    fn test_partial_match_with_flag_disconnects() {
        let rules = [rule("c:out", "b:in", false, true)];
        assert_eq!(
            disconnect_actions(&patched(), &rules, &[]),
            vec![disconnect("a:out", "b:in")]
        );
    }

    #[test]
    fn test_partial_match_needs_flag_on_matching_side() {
        // Input side matches but only the output flag is set
        let rules = [rule("c:out", "b:in", true, false)];
        assert!(disconnect_actions(&patched(), &rules, &[]).is_empty());
    }

    #[test]
    fn test_removed_rule_disconnects_full_match() {
        let removed = [rule("a:out", "b:in", false, false)];
        assert_eq!(
            disconnect_actions(&patched(), &[], &removed),
            vec![disconnect("a:out", "b:in")]
        );

        let kept = [rule("a:.*", "b:.*", false, false)];
        assert!(disconnect_actions(&patched(), &kept, &removed).is_empty());
    }
}
