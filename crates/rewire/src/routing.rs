//! Routing state shared by the control thread and the status server.
//!
//! Holds the current rule set, the rules removed by the last replacement
//! and the published port list. Replacing the rules wakes the scheduler
//! through the routing pump.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rewireconf::ConnectionConfig;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::matcher::ConnectionRule;
use crate::message::{Message, MessagePump, MessageSource};
use crate::server::PortInfo;

/// Longest time a port list request may wait for a change.
pub const MAX_PORT_WAIT: Duration = Duration::from_secs(60);

#[derive(Default)]
struct RuleSet {
    rules: Vec<ConnectionRule>,
    removed: Vec<ConnectionRule>,
}

#[derive(Default)]
struct PortList {
    index: u64,
    ports: Vec<PortInfo>,
}

pub struct RoutingState {
    rules: Mutex<RuleSet>,
    ports: Mutex<PortList>,
    /// Carries the port index to long-poll waiters
    port_index: watch::Sender<u64>,
    stopped: AtomicBool,
    pump: MessagePump,
}

impl Default for RoutingState {
    fn default() -> Self {
        Self::new()
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RoutingState {
    pub fn new() -> Self {
        let (port_index, _) = watch::channel(0);
        Self {
            rules: Mutex::new(RuleSet::default()),
            ports: Mutex::new(PortList::default()),
            port_index,
            stopped: AtomicBool::new(false),
            pump: MessagePump::new("port connector"),
        }
    }

    /// Swap in a new rule set. Entries whose patterns do not compile are
    /// logged and skipped. Old rules missing from the new set are kept as
    /// removed until the next disconnect pass. Returns the number of rules
    /// now in effect.
    pub fn replace_rules(&self, configs: Vec<ConnectionConfig>) -> usize {
        let mut rules: Vec<ConnectionRule> = Vec::with_capacity(configs.len());
        for config in configs {
            match ConnectionRule::compile(config) {
                Ok(rule) if !rules.contains(&rule) => rules.push(rule),
                Ok(rule) => debug!("skipping duplicate connection {:?}", rule.config()),
                Err(e) => error!("skipping connection: {}", e),
            }
        }

        let count = rules.len();
        {
            let mut set = locked(&self.rules);
            let old = std::mem::replace(&mut set.rules, rules);
            for rule in old {
                if !set.rules.contains(&rule) && !set.removed.contains(&rule) {
                    debug!(
                        "removed connection out:\"{}\" in:\"{}\"",
                        rule.config().output,
                        rule.config().input
                    );
                    set.removed.push(rule);
                }
            }
            let RuleSet { rules, removed } = &mut *set;
            removed.retain(|rule| !rules.contains(rule));
        }
        info!("loaded {} connections", count);

        if self.pump.send(Message::ConnectionsUpdated).is_err() {
            error!("port connector: cannot signal updated connections");
        }
        count
    }

    /// Current and removed rules.
    pub fn rules(&self) -> (Vec<ConnectionRule>, Vec<ConnectionRule>) {
        let set = locked(&self.rules);
        (set.rules.clone(), set.removed.clone())
    }

    /// Forget the removed rules a disconnect pass has applied. Rules removed
    /// while the pass ran stay for the next one.
    pub fn clear_removed(&self, applied: &[ConnectionRule]) {
        locked(&self.rules)
            .removed
            .retain(|rule| !applied.contains(rule));
    }

    pub fn connections(&self) -> Vec<ConnectionConfig> {
        locked(&self.rules)
            .rules
            .iter()
            .map(|r| r.config().clone())
            .collect()
    }

    pub fn connections_json(&self) -> Value {
        json!({ "connections": self.connections() })
    }

    /// Publish a fresh port list. The index moves only on a real change.
    pub fn publish_ports(&self, mut ports: Vec<PortInfo>) -> bool {
        ports.sort_by(|a, b| a.name.cmp(&b.name));
        let index = {
            let mut list = locked(&self.ports);
            if list.ports == ports {
                return false;
            }
            list.ports = ports;
            list.index += 1;
            list.index
        };
        debug!("port list changed, index {}", index);
        self.port_index.send_replace(index);
        true
    }

    /// The server went away, so did its ports.
    pub fn clear_ports(&self) {
        self.publish_ports(Vec::new());
    }

    pub fn port_index(&self) -> u64 {
        locked(&self.ports).index
    }

    pub fn ports_json(&self) -> Value {
        let list = locked(&self.ports);
        json!({ "index": list.index, "ports": list.ports })
    }

    /// Wait until the port index differs from `index`, the timeout passes or
    /// the state is stopped. Returns `{index}` if nothing changed, the full
    /// list otherwise.
    pub async fn wait_for_ports(&self, index: u64, timeout: Duration) -> Value {
        let mut changes = self.port_index.subscribe();
        let wait = async {
            loop {
                let current = *changes.borrow_and_update();
                if current != index || self.stopped.load(Ordering::Acquire) {
                    return;
                }
                if changes.changed().await.is_err() {
                    return;
                }
            }
        };
        let _ = tokio::time::timeout(timeout.min(MAX_PORT_WAIT), wait).await;

        let current = self.port_index();
        if current == index {
            json!({ "index": current })
        } else {
            self.ports_json()
        }
    }

    /// Release every waiter.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.port_index.send_modify(|_| {});
    }
}

impl MessageSource for RoutingState {
    fn pump(&self) -> &MessagePump {
        &self.pump
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::PortDirection;
    use std::sync::Arc;

    fn port(name: &str) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            direction: PortDirection::Output,
            connections: Vec::new(),
        }
    }

    #[test]
    fn test_replace_tracks_removed_rules() {
        let state = RoutingState::new();
        state.replace_rules(vec![
            ConnectionConfig::new("a:.*", "b:.*"),
            ConnectionConfig::new("c:.*", "d:.*"),
        ]);
        assert_eq!(state.get_message(), Some(Message::ConnectionsUpdated));
        state.confirm_message(Message::ConnectionsUpdated);

        state.replace_rules(vec![ConnectionConfig::new("c:.*", "d:.*")]);
        let (rules, removed) = state.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].config().output, "a:.*");

        state.clear_removed(&removed);
        assert!(state.rules().1.is_empty());
    }

    #[test]
    fn test_clear_keeps_rules_removed_after_snapshot() {
        let state = RoutingState::new();
        state.replace_rules(vec![
            ConnectionConfig::new("a:.*", "b:.*"),
            ConnectionConfig::new("c:.*", "d:.*"),
        ]);
        state.replace_rules(vec![ConnectionConfig::new("c:.*", "d:.*")]);
        let (_, applied) = state.rules();

        // Replaced again while a pass works from the old snapshot
        state.replace_rules(vec![]);
        state.clear_removed(&applied);

        let (_, removed) = state.rules();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].config().output, "c:.*");
    }

    #[test]
    fn test_invalid_rules_skipped() {
        let state = RoutingState::new();
        let count = state.replace_rules(vec![
            ConnectionConfig::new("(", "x"),
            ConnectionConfig::new("a", "b"),
            ConnectionConfig::new("a", "b"),
        ]);
        assert_eq!(count, 1);
        assert_eq!(state.connections_json()["connections"][0]["out"], "a");
    }

    #[test]
    fn test_port_index_moves_on_change_only() {
        let state = RoutingState::new();
        assert!(state.publish_ports(vec![port("b"), port("a")]));
        assert_eq!(state.port_index(), 1);
        assert!(!state.publish_ports(vec![port("a"), port("b")]));
        assert_eq!(state.port_index(), 1);
        assert_eq!(state.ports_json()["ports"][0]["name"], "a");

        state.clear_ports();
        assert_eq!(state.port_index(), 2);
        state.clear_ports();
        assert_eq!(state.port_index(), 2);
    }

    #[tokio::test]
    async fn test_wait_returns_early_on_change() {
        let state = Arc::new(RoutingState::new());
        let publisher = Arc::clone(&state);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish_ports(vec![port("a")]);
        });

        let reply = state.wait_for_ports(0, Duration::from_secs(5)).await;
        assert_eq!(reply["index"], 1);
        assert_eq!(reply["ports"][0]["name"], "a");
    }

    #[tokio::test]
    async fn test_wait_times_out_unchanged() {
        let state = RoutingState::new();
        let reply = state.wait_for_ports(0, Duration::from_millis(10)).await;
        assert_eq!(reply, json!({ "index": 0 }));
    }

    #[tokio::test]
    async fn test_stop_releases_waiters() {
        let state = Arc::new(RoutingState::new());
        let stopper = Arc::clone(&state);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.stop();
        });
        let reply = state.wait_for_ports(0, Duration::from_secs(30)).await;
        assert_eq!(reply, json!({ "index": 0 }));
    }
}
