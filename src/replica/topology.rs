use crate::replica::MemberId;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Resolves member identities to network addresses. Owned by the embedding application, which
/// may update addresses at any time; callers resolve again on every use.
pub trait TopologyService: Send + Sync {
    fn resolve(&self, member_id: &MemberId) -> Option<SocketAddr>;

    fn members(&self) -> Vec<MemberId>;
}

/// Fixed member-to-address table built from configuration.
#[derive(Debug, Clone)]
pub struct StaticTopology {
    addresses: HashMap<MemberId, SocketAddr>,
}

impl StaticTopology {
    pub fn new<I>(members: I) -> Self
    where
        I: IntoIterator<Item = (MemberId, SocketAddr)>,
    {
        StaticTopology {
            addresses: members.into_iter().collect(),
        }
    }
}

impl TopologyService for StaticTopology {
    fn resolve(&self, member_id: &MemberId) -> Option<SocketAddr> {
        self.addresses.get(member_id).copied()
    }

    fn members(&self) -> Vec<MemberId> {
        let mut members: Vec<MemberId> = self.addresses.keys().cloned().collect();
        members.sort();
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_topology_resolves_known_members_only() {
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let topology = StaticTopology::new(vec![(MemberId::new("b"), addr), (MemberId::new("a"), addr)]);

        assert_eq!(topology.resolve(&MemberId::new("a")), Some(addr));
        assert_eq!(topology.resolve(&MemberId::new("z")), None);
        assert_eq!(topology.members(), vec![MemberId::new("a"), MemberId::new("b")]);
    }
}
