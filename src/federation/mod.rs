//! Consistent-hash ring used to decide, for a given key (a pairing code),
//! which servers in the fleet are primarily responsible for it. Ring
//! placement has no secrecy requirement, so positions are derived with a
//! plain SHA-256 truncated to 128 bits rather than a keyed MAC.

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Alive,
    Suspect,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RingNode {
    pub server_id: String,
    pub endpoint: String,
    pub status: NodeStatus,
}

struct VirtualNode {
    position: u128,
    server_id: String,
}

#[derive(Default)]
struct Inner {
    nodes: Vec<RingNode>,
    virtual_nodes: Vec<VirtualNode>,
}

pub struct HashRing {
    local_server_id: String,
    virtual_nodes_per_server: usize,
    inner: RwLock<Inner>,
}

pub struct RedirectTarget {
    pub server_id: String,
    pub endpoint: String,
    pub hashes: Vec<String>,
}

fn hash_to_position(key: &str) -> u128 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    u128::from_be_bytes(bytes)
}

impl HashRing {
    pub fn new(local_server_id: String, virtual_nodes_per_server: usize) -> Self {
        Self {
            local_server_id,
            virtual_nodes_per_server,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn add_node(&self, server_id: &str, endpoint: &str) {
        let mut inner = self.inner.write();
        inner.nodes.retain(|n| n.server_id != server_id);
        inner.nodes.push(RingNode {
            server_id: server_id.to_string(),
            endpoint: endpoint.to_string(),
            status: NodeStatus::Alive,
        });
        self.rebuild(&mut inner);
    }

    pub fn remove_node(&self, server_id: &str) {
        let mut inner = self.inner.write();
        inner.nodes.retain(|n| n.server_id != server_id);
        self.rebuild(&mut inner);
    }

    pub fn update_node_status(&self, server_id: &str, status: NodeStatus) {
        let mut inner = self.inner.write();
        if let Some(node) = inner.nodes.iter_mut().find(|n| n.server_id == server_id) {
            node.status = status;
        }
    }

    fn rebuild(&self, inner: &mut Inner) {
        let mut virtual_nodes = Vec::with_capacity(inner.nodes.len() * self.virtual_nodes_per_server);
        for node in &inner.nodes {
            for i in 0..self.virtual_nodes_per_server {
                let token = format!("{}#{}", node.server_id, i);
                virtual_nodes.push(VirtualNode {
                    position: hash_to_position(&token),
                    server_id: node.server_id.clone(),
                });
            }
        }
        virtual_nodes.sort_by_key(|v| v.position);
        inner.virtual_nodes = virtual_nodes;
    }

    /// Walks clockwise from `key`'s ring position, collecting distinct
    /// alive server ids until `count` are gathered or the ring is exhausted.
    pub fn responsible_nodes(&self, key: &str, count: usize) -> Vec<String> {
        let inner = self.inner.read();
        if inner.virtual_nodes.is_empty() {
            return Vec::new();
        }

        let position = hash_to_position(key);
        let start = inner
            .virtual_nodes
            .partition_point(|v| v.position < position);

        let alive: ahash::HashSet<&str> = inner
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Alive)
            .map(|n| n.server_id.as_str())
            .collect();

        let mut result = Vec::with_capacity(count);
        for i in 0..inner.virtual_nodes.len() {
            let idx = (start + i) % inner.virtual_nodes.len();
            let server_id = &inner.virtual_nodes[idx].server_id;
            if alive.contains(server_id.as_str()) && !result.contains(server_id) {
                result.push(server_id.clone());
            }
            if result.len() == count {
                break;
            }
        }
        result
    }

    pub fn should_handle_locally(&self, key: &str, replication_factor: usize) -> bool {
        self.responsible_nodes(key, replication_factor)
            .iter()
            .any(|id| id == &self.local_server_id)
    }

    /// For keys whose primary (first alive node) is not this server,
    /// returns one `RedirectTarget` per distinct other server, with that
    /// server's keys merged together.
    pub fn redirect_targets(&self, keys: &[String]) -> Vec<RedirectTarget> {
        let inner = self.inner.read();
        let mut targets: Vec<RedirectTarget> = Vec::new();

        for key in keys {
            let primary = self.responsible_nodes(key, 1);
            let Some(primary_id) = primary.first() else {
                continue;
            };
            if primary_id == &self.local_server_id {
                continue;
            }

            let endpoint = inner
                .nodes
                .iter()
                .find(|n| &n.server_id == primary_id)
                .map(|n| n.endpoint.clone())
                .unwrap_or_default();

            if let Some(target) = targets.iter_mut().find(|t| &t.server_id == primary_id) {
                target.hashes.push(key.clone());
            } else {
                targets.push(RedirectTarget {
                    server_id: primary_id.clone(),
                    endpoint,
                    hashes: vec![key.clone()],
                });
            }
        }

        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_node_ring_has_no_redirects() {
        let ring = HashRing::new("local".to_string(), 32);
        ring.add_node("local", "127.0.0.1:8080");
        assert!(ring.redirect_targets(&["ABCDEF".to_string()]).is_empty());
    }

    #[test]
    fn three_alive_nodes_all_appear_in_responsible_set() {
        let ring = HashRing::new("a".to_string(), 32);
        ring.add_node("a", "a:8080");
        ring.add_node("b", "b:8080");
        ring.add_node("c", "c:8080");
        let responsible = ring.responsible_nodes("ABCDEF", 3);
        assert_eq!(responsible.len(), 3);
    }

    #[test]
    fn deterministic_across_instances_with_same_membership() {
        let ring1 = HashRing::new("a".to_string(), 16);
        let ring2 = HashRing::new("b".to_string(), 16);
        for ring in [&ring1, &ring2] {
            ring.add_node("a", "a:8080");
            ring.add_node("b", "b:8080");
        }
        assert_eq!(
            ring1.responsible_nodes("SOMEKEY", 2),
            ring2.responsible_nodes("SOMEKEY", 2)
        );
    }
}
