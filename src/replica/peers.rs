use std::collections::HashSet;
use std::fmt;

/// Stable identity of a cluster member. Resolved to an address through the topology service.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct MemberId(String);

impl MemberId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        MemberId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ClusterTracker is the fixed, voting membership of the cluster as seen by this member.
pub(crate) struct ClusterTracker {
    my_member_id: MemberId,
    peers: HashSet<MemberId>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ClusterTrackerError {
    #[error("Member {0:?} is not part of the cluster")]
    MeNotInCluster(MemberId),
    #[error("Member {0:?} is listed more than once")]
    DuplicateMember(MemberId),
}

impl ClusterTracker {
    pub(crate) fn create_valid(
        my_member_id: MemberId,
        cluster_members: Vec<MemberId>,
    ) -> Result<Self, ClusterTrackerError> {
        let mut peers = HashSet::with_capacity(cluster_members.len());
        let mut found_me = false;
        for member in cluster_members {
            if member == my_member_id {
                if found_me {
                    return Err(ClusterTrackerError::DuplicateMember(member));
                }
                found_me = true;
                continue;
            }
            if peers.contains(&member) {
                return Err(ClusterTrackerError::DuplicateMember(member));
            }
            peers.insert(member);
        }

        if !found_me {
            return Err(ClusterTrackerError::MeNotInCluster(my_member_id));
        }

        Ok(ClusterTracker { my_member_id, peers })
    }

    pub(crate) fn my_member_id(&self) -> &MemberId {
        &self.my_member_id
    }

    pub(crate) fn contains_member(&self, member_id: &MemberId) -> bool {
        member_id == &self.my_member_id || self.peers.contains(member_id)
    }

    pub(crate) fn peer_ids(&self) -> HashSet<MemberId> {
        self.peers.clone()
    }

    pub(crate) fn num_voting_replicas(&self) -> usize {
        self.peers.len() + 1
    }

    /// Smallest number of members that form a strict majority, self included.
    pub(crate) fn majority(&self) -> usize {
        (self.num_voting_replicas() / 2) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<MemberId> {
        names.iter().map(|n| MemberId::new(*n)).collect()
    }

    #[test]
    fn cluster_membership_rules() {
        let tracker = ClusterTracker::create_valid(MemberId::new("a"), ids(&["a", "b", "c", "d"])).unwrap();
        assert_eq!(tracker.num_voting_replicas(), 4);
        assert_eq!(tracker.majority(), 3);
        assert!(tracker.contains_member(&MemberId::new("a")));
        assert!(tracker.contains_member(&MemberId::new("d")));
        assert!(!tracker.contains_member(&MemberId::new("z")));
        assert!(!tracker.peer_ids().contains(&MemberId::new("a")));

        assert!(matches!(
            ClusterTracker::create_valid(MemberId::new("z"), ids(&["a", "b"])),
            Err(ClusterTrackerError::MeNotInCluster(_))
        ));
        assert!(matches!(
            ClusterTracker::create_valid(MemberId::new("a"), ids(&["a", "b", "b"])),
            Err(ClusterTrackerError::DuplicateMember(_))
        ));
    }
}
