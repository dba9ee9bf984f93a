//! Distributed spanning-tree maintenance for optimized flooding.
//!
//! Every flood root gets its own tree. For a root R each node tracks its
//! distance to R, the parent (next hop toward R), and the children that
//! registered themselves through explicit child announcements. Peers
//! exchange query/reply/update tuples carrying their distance per root;
//! distances converge by distance-vector relaxation with a hop-count
//! metric. A publication flooding along root R's tree is forwarded only to
//! the parent and children, minus where it came from.

use spindle_codec::{DualMessage, DualMsgType};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Hop-count ceiling; anything at or past it counts as unreachable.
pub const MAX_DISTANCE: i64 = 32;

/// Wire encoding of "unreachable".
pub const DISTANCE_INFINITY: i64 = -1;

/// Route state toward one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SptInfo {
    /// Hop count to the root; `None` when unreachable.
    pub cost: Option<i64>,
    pub parent: Option<String>,
    pub children: BTreeSet<String>,
}

/// Messages to push to peers after a topology or distance change.
#[derive(Debug, Default)]
pub struct DualOutput {
    /// Per-peer batches of query/reply/update tuples.
    pub messages: BTreeMap<String, Vec<DualMessage>>,
    /// (parent, root, set) child registrations to announce.
    pub child_changes: Vec<(String, String, bool)>,
}

impl DualOutput {
    fn push(&mut self, peer: &str, msg: DualMessage) {
        self.messages.entry(peer.to_string()).or_default().push(msg);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.child_changes.is_empty()
    }
}

#[derive(Debug, Default)]
struct RootState {
    distance: Option<i64>,
    parent: Option<String>,
    /// Peers that registered as our children for this root.
    children: BTreeSet<String>,
    /// Last distance reported by each peer.
    peer_distances: HashMap<String, Option<i64>>,
}

/// Per-area spanning-tree state.
#[derive(Debug)]
pub struct DualState {
    node_name: String,
    /// Whether this node offers itself as a flood root.
    is_root: bool,
    peers: BTreeSet<String>,
    roots: BTreeMap<String, RootState>,
}

fn wire_distance(distance: Option<i64>) -> i64 {
    distance.unwrap_or(DISTANCE_INFINITY)
}

fn from_wire(distance: i64) -> Option<i64> {
    if (0..MAX_DISTANCE).contains(&distance) {
        Some(distance)
    } else {
        None
    }
}

impl DualState {
    pub fn new(node_name: impl Into<String>, is_root: bool) -> Self {
        let node_name = node_name.into();
        let mut state = Self {
            node_name: node_name.clone(),
            is_root,
            peers: BTreeSet::new(),
            roots: BTreeMap::new(),
        };
        if is_root {
            state.roots.entry(node_name).or_default();
        }
        state
    }

    /// The root current publications should flood along: the smallest known
    /// reachable root id.
    pub fn current_root(&self) -> Option<String> {
        self.roots
            .iter()
            .filter(|(root, st)| self.my_distance(root, st).is_some())
            .map(|(root, _)| root.clone())
            .next()
    }

    fn my_distance(&self, root: &str, st: &RootState) -> Option<i64> {
        if *root == self.node_name {
            return Some(0);
        }
        st.distance
    }

    /// A peer capable of optimized flooding came up.
    pub fn peer_up(&mut self, peer: &str) -> DualOutput {
        self.peers.insert(peer.to_string());
        let mut out = DualOutput::default();

        // Tell the new peer everything we know.
        let roots: Vec<String> = self.roots.keys().cloned().collect();
        for root in roots {
            let distance = {
                let st = &self.roots[&root];
                wire_distance(self.my_distance(&root, st))
            };
            out.push(
                peer,
                DualMessage {
                    root_id: root.clone(),
                    mtype: DualMsgType::Update,
                    distance,
                },
            );
        }
        // And ask for everything it knows; the empty root is the wildcard,
        // which also covers roots we have never heard of.
        out.push(
            peer,
            DualMessage {
                root_id: String::new(),
                mtype: DualMsgType::Query,
                distance: DISTANCE_INFINITY,
            },
        );
        out
    }

    /// A peer went away: drop its reports and re-route every tree that used
    /// it.
    pub fn peer_down(&mut self, peer: &str) -> DualOutput {
        self.peers.remove(peer);
        let mut out = DualOutput::default();
        let roots: Vec<String> = self.roots.keys().cloned().collect();
        for root in roots {
            {
                let st = self.roots.get_mut(&root).expect("root present");
                st.peer_distances.remove(peer);
                st.children.remove(peer);
            }
            self.recompute(&root, &mut out);
        }
        out
    }

    /// Apply a batch of tuples from `sender`.
    pub fn process(&mut self, sender: &str, messages: &[DualMessage]) -> DualOutput {
        let mut out = DualOutput::default();
        if !self.peers.contains(sender) {
            tracing::debug!("dual message from unknown peer ({})", sender);
            return out;
        }

        for msg in messages {
            match msg.mtype {
                DualMsgType::Query if msg.root_id.is_empty() => {
                    // Wildcard: report every root we know.
                    let roots: Vec<String> = self.roots.keys().cloned().collect();
                    for root in roots {
                        let distance = {
                            let st = &self.roots[&root];
                            wire_distance(self.my_distance(&root, st))
                        };
                        out.push(
                            sender,
                            DualMessage {
                                root_id: root,
                                mtype: DualMsgType::Reply,
                                distance,
                            },
                        );
                    }
                }
                DualMsgType::Query => {
                    self.roots.entry(msg.root_id.clone()).or_default();
                    let st = &self.roots[&msg.root_id];
                    let distance = wire_distance(self.my_distance(&msg.root_id, st));
                    out.push(
                        sender,
                        DualMessage {
                            root_id: msg.root_id.clone(),
                            mtype: DualMsgType::Reply,
                            distance,
                        },
                    );
                }
                DualMsgType::Reply | DualMsgType::Update => {
                    if msg.root_id.is_empty() {
                        continue;
                    }
                    let st = self.roots.entry(msg.root_id.clone()).or_default();
                    st.peer_distances
                        .insert(sender.to_string(), from_wire(msg.distance));
                    self.recompute(&msg.root_id, &mut out);
                }
            }
        }
        out
    }

    /// Explicit child registration from a peer that picked us as its parent
    /// toward `root`.
    pub fn set_child(&mut self, root: &str, child: &str, set: bool) {
        let st = self.roots.entry(root.to_string()).or_default();
        if set {
            st.children.insert(child.to_string());
        } else {
            st.children.remove(child);
        }
    }

    /// Recompute distance and parent toward `root`; queue updates on change.
    fn recompute(&mut self, root: &str, out: &mut DualOutput) {
        if root == self.node_name {
            return;
        }
        let st = self.roots.get_mut(root).expect("root present");

        // Best (distance, peer) over reachable reports, lexicographic peer
        // tiebreak for determinism across the fabric.
        let best = st
            .peer_distances
            .iter()
            .filter_map(|(peer, d)| d.map(|d| (d + 1, peer.clone())))
            .filter(|(d, _)| *d < MAX_DISTANCE)
            .min();

        let (new_distance, new_parent) = match best {
            Some((d, peer)) => (Some(d), Some(peer)),
            None => (None, None),
        };

        let distance_changed = st.distance != new_distance;
        let parent_changed = st.parent != new_parent;
        let old_parent = st.parent.clone();
        st.distance = new_distance;
        st.parent = new_parent.clone();

        if parent_changed {
            if let Some(old) = old_parent {
                out.child_changes.push((old, root.to_string(), false));
            }
            if let Some(new) = new_parent {
                out.child_changes.push((new, root.to_string(), true));
            }
        }

        if distance_changed {
            let distance = wire_distance(new_distance);
            for peer in &self.peers {
                out.push(
                    peer,
                    DualMessage {
                        root_id: root.to_string(),
                        mtype: DualMsgType::Update,
                        distance,
                    },
                );
            }
        }
    }

    /// The peers a publication flooding along `root`'s tree goes to:
    /// parent plus children, minus where it arrived from. `None` means the
    /// tree is unusable and the caller should fall back to a full flood.
    pub fn flood_peers(&self, root: &str, arrival: Option<&str>) -> Option<BTreeSet<String>> {
        let st = self.roots.get(root)?;
        if root != self.node_name && st.distance.is_none() {
            return None;
        }
        let mut targets = st.children.clone();
        if let Some(parent) = &st.parent {
            targets.insert(parent.clone());
        }
        if let Some(arrival) = arrival {
            targets.remove(arrival);
        }
        Some(targets)
    }

    /// Snapshot of every tree, for the operator query.
    pub fn spt_infos(&self) -> BTreeMap<String, SptInfo> {
        self.roots
            .iter()
            .map(|(root, st)| {
                (
                    root.clone(),
                    SptInfo {
                        cost: self.my_distance(root, st),
                        parent: st.parent.clone(),
                        children: st.children.clone(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(root: &str, distance: i64) -> DualMessage {
        DualMessage {
            root_id: root.to_string(),
            mtype: DualMsgType::Update,
            distance,
        }
    }

    #[test]
    fn test_root_advertises_distance_zero() {
        let mut dual = DualState::new("root", true);
        let out = dual.peer_up("b");
        let msgs = &out.messages["b"];
        assert!(msgs
            .iter()
            .any(|m| m.root_id == "root" && m.mtype == DualMsgType::Update && m.distance == 0));
        assert_eq!(dual.current_root(), Some("root".to_string()));
    }

    #[test]
    fn test_distance_relaxation_and_parent() {
        let mut dual = DualState::new("c", false);
        dual.peer_up("a");
        dual.peer_up("b");

        // a is adjacent to the root, b is two hops out.
        dual.process("a", &[update("root", 0)]);
        let out = dual.process("b", &[update("root", 1)]);

        let info = &dual.spt_infos()["root"];
        assert_eq!(info.cost, Some(1));
        assert_eq!(info.parent.as_deref(), Some("a"));
        // b's worse report must not have changed anything.
        assert!(out.messages.is_empty());
    }

    #[test]
    fn test_parent_change_emits_child_registration() {
        let mut dual = DualState::new("c", false);
        dual.peer_up("a");
        dual.peer_up("b");

        let out = dual.process("a", &[update("root", 2)]);
        assert!(out
            .child_changes
            .contains(&("a".to_string(), "root".to_string(), true)));

        // b turns out to be closer: re-parent to b.
        let out = dual.process("b", &[update("root", 0)]);
        assert!(out
            .child_changes
            .contains(&("a".to_string(), "root".to_string(), false)));
        assert!(out
            .child_changes
            .contains(&("b".to_string(), "root".to_string(), true)));
        assert_eq!(dual.spt_infos()["root"].parent.as_deref(), Some("b"));
    }

    #[test]
    fn test_query_gets_reply() {
        let mut dual = DualState::new("me", true);
        dual.peer_up("b");
        let out = dual.process(
            "b",
            &[DualMessage {
                root_id: "me".to_string(),
                mtype: DualMsgType::Query,
                distance: DISTANCE_INFINITY,
            }],
        );
        let reply = &out.messages["b"][0];
        assert_eq!(reply.mtype, DualMsgType::Reply);
        assert_eq!(reply.distance, 0);
    }

    #[test]
    fn test_peer_down_reroutes() {
        let mut dual = DualState::new("c", false);
        dual.peer_up("a");
        dual.peer_up("b");
        dual.process("a", &[update("root", 0)]);
        dual.process("b", &[update("root", 1)]);
        assert_eq!(dual.spt_infos()["root"].parent.as_deref(), Some("a"));

        let out = dual.peer_down("a");
        let info = &dual.spt_infos()["root"];
        assert_eq!(info.parent.as_deref(), Some("b"));
        assert_eq!(info.cost, Some(2));
        assert!(out
            .child_changes
            .contains(&("b".to_string(), "root".to_string(), true)));

        dual.peer_down("b");
        assert_eq!(dual.spt_infos()["root"].cost, None);
        assert_eq!(dual.current_root(), None);
    }

    #[test]
    fn test_flood_peers_parent_and_children_minus_arrival() {
        let mut dual = DualState::new("mid", false);
        dual.peer_up("up");
        dual.peer_up("down1");
        dual.peer_up("down2");
        dual.process("up", &[update("root", 0)]);
        dual.set_child("root", "down1", true);
        dual.set_child("root", "down2", true);

        let targets = dual.flood_peers("root", Some("up")).unwrap();
        let expected: BTreeSet<String> = ["down1".to_string(), "down2".to_string()].into();
        assert_eq!(targets, expected);

        let targets = dual.flood_peers("root", None).unwrap();
        assert!(targets.contains("up"));
        assert_eq!(targets.len(), 3);

        // Unknown root: caller falls back to full flood.
        assert!(dual.flood_peers("nowhere", None).is_none());
    }

    #[test]
    fn test_lexicographic_tiebreak() {
        let mut dual = DualState::new("x", false);
        dual.peer_up("bb");
        dual.peer_up("aa");
        dual.process("bb", &[update("root", 1)]);
        dual.process("aa", &[update("root", 1)]);
        assert_eq!(dual.spt_infos()["root"].parent.as_deref(), Some("aa"));
    }
}
