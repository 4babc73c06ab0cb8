//! Component registry: authoritative in-memory index with a multi-subscriber
//! change stream (`spec.md` §4.2).

use crate::types::{ComponentInfo, RegistryChange, RegistryChangeKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

struct Subscriber {
    tx: mpsc::Sender<RegistryChange>,
    consecutive_drops: AtomicU32,
}

struct Inner {
    index: RwLock<HashMap<String, ComponentInfo>>,
    subscribers: RwLock<Vec<Subscriber>>,
    max_drops: u32,
    subscriber_capacity: usize,
}

/// Authoritative in-memory index of components, keyed by component name.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn new(max_subscriber_drops: u32, subscriber_channel_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                index: RwLock::new(HashMap::new()),
                subscribers: RwLock::new(Vec::new()),
                max_drops: max_subscriber_drops,
                subscriber_capacity: subscriber_channel_capacity,
            }),
        }
    }

    /// Atomically replace (or insert) the entry for `info.name`, emitting a
    /// change event to all subscribers.
    pub fn register(&self, info: ComponentInfo) {
        let kind = {
            let mut index = self.inner.index.write().expect("registry index poisoned");
            let kind = if index.contains_key(&info.name) {
                RegistryChangeKind::Updated
            } else {
                RegistryChangeKind::Added
            };
            index.insert(info.name.clone(), info.clone());
            kind
        };
        self.publish(RegistryChange {
            kind,
            name: info.name,
            package: info.package,
        });
    }

    /// Remove the entry named `name`, emitting a change event if it existed.
    pub fn remove(&self, name: &str) {
        let removed = {
            let mut index = self.inner.index.write().expect("registry index poisoned");
            index.remove(name)
        };
        if let Some(info) = removed {
            self.publish(RegistryChange {
                kind: RegistryChangeKind::Removed,
                name: info.name,
                package: info.package,
            });
        }
    }

    pub fn get(&self, name: &str) -> Option<ComponentInfo> {
        self.inner
            .index
            .read()
            .expect("registry index poisoned")
            .get(name)
            .cloned()
    }

    /// A defensive copy of the entire index — callers may not mutate the
    /// live registry through it.
    pub fn get_all(&self) -> Vec<ComponentInfo> {
        self.inner
            .index
            .read()
            .expect("registry index poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.inner.index.read().expect("registry index poisoned").len()
    }

    /// A fresh bounded channel of registry changes. Slow subscribers are
    /// disconnected after `K` consecutive dropped messages.
    pub fn watch(&self) -> mpsc::Receiver<RegistryChange> {
        let (tx, rx) = mpsc::channel(self.inner.subscriber_capacity);
        self.inner.subscribers.write().expect("subscribers poisoned").push(Subscriber {
            tx,
            consecutive_drops: AtomicU32::new(0),
        });
        rx
    }

    fn publish(&self, change: RegistryChange) {
        // Copy the subscriber list under a read lock, then release before
        // sending, so a slow subscriber never blocks new registrations.
        let snapshot: Vec<usize> = {
            let subs = self.inner.subscribers.read().expect("subscribers poisoned");
            (0..subs.len()).collect()
        };

        let mut dead = Vec::new();
        for idx in snapshot {
            let subs = self.inner.subscribers.read().expect("subscribers poisoned");
            let Some(sub) = subs.get(idx) else { continue };
            match sub.tx.try_send(change.clone()) {
                Ok(()) => {
                    sub.consecutive_drops.store(0, Ordering::Relaxed);
                }
                Err(_) => {
                    let drops = sub.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                    if drops >= self.inner.max_drops {
                        dead.push(idx);
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut subs = self.inner.subscribers.write().expect("subscribers poisoned");
            for idx in dead.into_iter().rev() {
                if idx < subs.len() {
                    debug!(index = idx, "disconnecting slow registry subscriber");
                    subs.remove(idx);
                }
            }
        }
    }

    /// DFS over the `references` edges of every registered component,
    /// returning every cycle found, sorted by the lexicographically smallest
    /// member name. Detection is on-demand — cycles are never prevented at
    /// registration time (`spec.md` §9).
    pub fn detect_circular_dependencies(&self) -> Vec<Vec<String>> {
        let index = self.inner.index.read().expect("registry index poisoned");
        let mut names: Vec<&String> = index.keys().collect();
        names.sort();

        let mut cycles = Vec::new();
        let mut visited: HashMap<&str, VisitState> = HashMap::new();

        for &name in &names {
            if visited.contains_key(name.as_str()) {
                continue;
            }
            dfs(name, &index, &mut visited, &mut Vec::new(), &mut cycles);
        }

        for cycle in &mut cycles {
            if let Some(min_pos) = cycle
                .iter()
                .enumerate()
                .min_by_key(|(_, n)| n.as_str())
                .map(|(i, _)| i)
            {
                cycle.rotate_left(min_pos);
            }
        }
        cycles.sort();
        cycles.dedup();
        cycles
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    InProgress,
    Done,
}

fn dfs<'a>(
    name: &'a str,
    index: &'a HashMap<String, ComponentInfo>,
    visited: &mut HashMap<&'a str, VisitState>,
    stack: &mut Vec<&'a str>,
    cycles: &mut Vec<Vec<String>>,
) {
    visited.insert(name, VisitState::InProgress);
    stack.push(name);

    if let Some(info) = index.get(name) {
        let mut refs: Vec<&str> = info.references.iter().map(String::as_str).collect();
        refs.sort();
        for reference in refs {
            let Some(ref_name) = index.get_key_value(reference).map(|(k, _)| k.as_str()) else {
                continue;
            };
            match visited.get(ref_name) {
                Some(VisitState::InProgress) => {
                    if let Some(start) = stack.iter().position(|&n| n == ref_name) {
                        let cycle = stack[start..].iter().map(|s| s.to_string()).collect();
                        cycles.push(cycle);
                    }
                }
                Some(VisitState::Done) => {}
                None => dfs(ref_name, index, visited, stack, cycles),
            }
        }
    }

    stack.pop();
    visited.insert(name, VisitState::Done);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use std::path::PathBuf;
    use std::time::SystemTime;

    fn info(name: &str, refs: &[&str]) -> ComponentInfo {
        ComponentInfo {
            name: name.to_string(),
            package: "pkg".to_string(),
            file_path: PathBuf::from(format!("{name}.tmpl")),
            parameters: vec![],
            references: refs.iter().map(|s| s.to_string()).collect(),
            last_modified: SystemTime::now(),
            content_hash: "hash".to_string(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn register_then_remove_is_not_found() {
        let registry = Registry::new(32, 64);
        registry.register(info("Button", &[]));
        assert_eq!(registry.count(), 1);
        registry.remove("Button");
        assert!(registry.get("Button").is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn count_matches_get_all_length() {
        let registry = Registry::new(32, 64);
        registry.register(info("A", &[]));
        registry.register(info("B", &[]));
        assert_eq!(registry.count(), registry.get_all().len());
    }

    #[test]
    fn detects_simple_cycle() {
        let registry = Registry::new(32, 64);
        registry.register(info("A", &["B"]));
        registry.register(info("B", &["A"]));
        let cycles = registry.detect_circular_dependencies();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0], vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn no_cycle_in_acyclic_graph() {
        let registry = Registry::new(32, 64);
        registry.register(info("A", &["B"]));
        registry.register(info("B", &[]));
        assert!(registry.detect_circular_dependencies().is_empty());
    }

    #[tokio::test]
    async fn slow_subscriber_is_disconnected_after_max_drops() {
        let registry = Registry::new(2, 1);
        let mut rx = registry.watch();
        registry.register(info("A", &[])); // fills the 1-capacity channel
        registry.register(info("B", &[])); // drop 1
        registry.register(info("C", &[])); // drop 2 -> disconnect
        registry.register(info("D", &[])); // no longer delivered

        let first = rx.recv().await.unwrap();
        assert_eq!(first.name, "A");
        // Channel closes once the registry drops the subscriber.
        assert!(rx.recv().await.is_none());
    }
}
