//! Deterministic multi-replica tests. Messages sit in a shared outbox until the test delivers
//! them, so every interleaving below is chosen explicitly. Timer events go to queues nobody
//! drains; elections and heartbeats are triggered by hand.

use crate::actor::{ActorClient, Event};
use crate::commitlog::{InMemoryLog, Index, LogError};
use crate::replica::{
    create_replica, AppendEntriesError, AppendEntriesReplyFromPeer, AppendEntriesReplyFromPeerError, ClusterTracker,
    CommitStream, EnqueueForReplicationError, EnqueueForReplicationInput, EnqueueForReplicationOutput, EntryPayload,
    LeaderTimerTick, MemberId, RaftMessage, RaftTransport, Replica, ReplicaConfig, RequestVoteError,
    RequestVoteInput, RequestVoteReplyFromPeer, RequestVoteResult, RetentionPolicy, StaticTopology, Term,
    VolatileLocalState, WriteAheadLogEntry,
};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Envelope {
    from: MemberId,
    to: MemberId,
    message: RaftMessage,
}

type Outbox = Arc<Mutex<VecDeque<Envelope>>>;

struct RecordingTransport {
    from: MemberId,
    outbox: Outbox,
}

impl RaftTransport for RecordingTransport {
    fn send(&self, to: &MemberId, message: RaftMessage) {
        self.outbox.lock().push_back(Envelope {
            from: self.from.clone(),
            to: to.clone(),
            message,
        });
    }
}

struct TestNode {
    replica: Replica<InMemoryLog<WriteAheadLogEntry>>,
    commit_stream: CommitStream,
    _actor_client: ActorClient,
    _events: mpsc::Receiver<Event>,
}

struct TestCluster {
    nodes: BTreeMap<MemberId, TestNode>,
    outbox: Outbox,
    partitioned: HashSet<MemberId>,
}

fn id(name: &str) -> MemberId {
    MemberId::new(name)
}

fn data(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

impl TestCluster {
    fn new(names: &[&str]) -> Self {
        Self::with_timeouts(names, Duration::from_secs(10), Duration::from_secs(20))
    }

    fn with_timeouts(names: &[&str], heartbeat: Duration, follower_min_timeout: Duration) -> Self {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let members: Vec<MemberId> = names.iter().map(|n| id(n)).collect();
        let topology = Arc::new(StaticTopology::new(members.iter().enumerate().map(|(i, m)| {
            let addr: SocketAddr = format!("127.0.0.1:{}", 7000 + i).parse().unwrap();
            (m.clone(), addr)
        })));
        let outbox: Outbox = Arc::new(Mutex::new(VecDeque::new()));

        let mut nodes = BTreeMap::new();
        for me in &members {
            let (actor_client, events) = ActorClient::new(1000);
            let config = ReplicaConfig {
                cluster_tracker: ClusterTracker::create_valid(me.clone(), members.clone()).unwrap(),
                topology: topology.clone(),
                local_state: Box::new(VolatileLocalState::new(me.clone())),
                leader_heartbeat_duration: heartbeat,
                follower_min_timeout,
                follower_max_timeout: follower_min_timeout * 2,
                max_append_entries_batch: 64,
                retention: RetentionPolicy {
                    min_retained_entries: 1000,
                    max_retained_entries: 10_000,
                },
            };
            let transport = Box::new(RecordingTransport {
                from: me.clone(),
                outbox: outbox.clone(),
            });
            let (replica, commit_stream, _) = create_replica(
                logger.new(slog::o!("MemberId" => me.to_string())),
                config,
                InMemoryLog::create().unwrap(),
                transport,
                actor_client.weak(),
            )
            .unwrap();

            nodes.insert(
                me.clone(),
                TestNode {
                    replica,
                    commit_stream,
                    _actor_client: actor_client,
                    _events: events,
                },
            );
        }

        TestCluster {
            nodes,
            outbox,
            partitioned: HashSet::new(),
        }
    }

    fn node(&mut self, member: &str) -> &mut Replica<InMemoryLog<WriteAheadLogEntry>> {
        &mut self.nodes.get_mut(&id(member)).unwrap().replica
    }

    fn partition(&mut self, member: &str) {
        self.partitioned.insert(id(member));
    }

    fn heal(&mut self, member: &str) {
        self.partitioned.remove(&id(member));
    }

    fn crash(&mut self, member: &str) {
        self.nodes.remove(&id(member));
    }

    fn can_reach(&self, from: &MemberId, to: &MemberId) -> bool {
        self.nodes.contains_key(to) && !self.partitioned.contains(from) && !self.partitioned.contains(to)
    }

    fn elect(&mut self, member: &str) {
        self.node(member).handle_follower_timeout();
        self.deliver_all();
        assert!(self.node(member).is_leader(), "{} failed to win its election", member);
    }

    fn enqueue(&mut self, member: &str, payload: &str) -> Result<EnqueueForReplicationOutput, EnqueueForReplicationError> {
        let result = self
            .node(member)
            .handle_enqueue_for_replication(EnqueueForReplicationInput { data: data(payload) });
        self.deliver_all();
        result
    }

    fn heartbeat(&mut self, leader: &str, peer: &str) {
        let term = self.node(leader).current_term();
        self.node(leader).handle_leader_timer(LeaderTimerTick {
            peer_id: id(peer),
            term,
        });
        self.deliver_all();
    }

    fn deliver_all(&mut self) {
        for _ in 0..10_000 {
            let envelope = match self.outbox.lock().pop_front() {
                Some(envelope) => envelope,
                None => return,
            };
            self.deliver(envelope);
        }
        panic!("Cluster never went quiet");
    }

    fn deliver(&mut self, envelope: Envelope) {
        let Envelope { from, to, message } = envelope;
        if !self.nodes.contains_key(&from) {
            // Sent by a crashed member.
            return;
        }
        let reachable = self.can_reach(&from, &to);

        match message {
            RaftMessage::RequestVote(input) => {
                let term = input.candidate_term;
                let result = if reachable {
                    match self.nodes.get_mut(&to).unwrap().replica.server_handle_request_vote(input) {
                        Ok(output) if output.vote_granted => RequestVoteResult::VoteGranted,
                        Ok(_) => RequestVoteResult::VoteNotGranted,
                        Err(RequestVoteError::RequestTermOutOfDate(info)) => RequestVoteResult::StaleTerm {
                            new_term: info.current_term,
                        },
                        Err(_) => RequestVoteResult::RetryableFailure,
                    }
                } else {
                    RequestVoteResult::RetryableFailure
                };
                let reply = RequestVoteReplyFromPeer {
                    peer_id: to,
                    term,
                    result,
                };
                self.nodes
                    .get_mut(&from)
                    .unwrap()
                    .replica
                    .handle_request_vote_reply_from_peer(reply);
            }
            RaftMessage::AppendEntries { input, descriptor } => {
                let result = if reachable {
                    match self.nodes.get_mut(&to).unwrap().replica.server_handle_append_entries(input) {
                        Ok(_) => Ok(()),
                        Err(AppendEntriesError::ClientTermOutOfDate(info)) => {
                            Err(AppendEntriesReplyFromPeerError::StaleTerm {
                                new_term: info.current_term,
                            })
                        }
                        Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index }) => {
                            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry { last_log_index })
                        }
                        Err(e) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(e.to_string())),
                    }
                } else {
                    Err(AppendEntriesReplyFromPeerError::RetryableFailure("partitioned".into()))
                };
                let reply = AppendEntriesReplyFromPeer { descriptor, result };
                self.nodes
                    .get_mut(&from)
                    .unwrap()
                    .replica
                    .handle_append_entries_reply_from_peer(reply);
            }
        }
    }

    fn log_of(&mut self, member: &str) -> Vec<WriteAheadLogEntry> {
        self.node(member).log_entries()
    }

    /// Drains everything published on the member's commit stream so far and keeps the commands.
    fn committed_commands(&mut self, member: &str) -> Vec<Bytes> {
        let stream = &mut self.nodes.get_mut(&id(member)).unwrap().commit_stream;
        let mut commands = Vec::new();
        while let Some(entry) = stream.try_recv() {
            if let EntryPayload::Command(data) = entry.payload {
                commands.push(data);
            }
        }
        commands
    }
}

fn commands(items: &[&str]) -> Vec<Bytes> {
    items.iter().map(|s| data(s)).collect()
}

#[tokio::test]
async fn partitioned_follower_catches_up_after_healing() {
    // -- setup --
    let mut cluster = TestCluster::new(&["a", "b", "c"]);
    cluster.elect("a");
    cluster.enqueue("a", "e1").unwrap();
    cluster.enqueue("a", "e2").unwrap();

    // -- execute --
    cluster.partition("c");
    cluster.enqueue("a", "e3").unwrap();
    cluster.enqueue("a", "e4").unwrap();
    cluster.enqueue("a", "e5").unwrap();

    // Barrier at 1, e1..e5 at 2..6. Majority is a+b.
    assert_eq!(cluster.node("a").commit_index(), Some(Index::new(6)));
    assert_eq!(cluster.log_of("c").len(), 3);

    cluster.heal("c");
    cluster.heartbeat("a", "c");

    // -- verify --
    let leader_log = cluster.log_of("a");
    assert_eq!(leader_log.len(), 6);
    assert_eq!(cluster.log_of("b"), leader_log);
    assert_eq!(cluster.log_of("c"), leader_log);
    assert_eq!(cluster.node("c").commit_index(), Some(Index::new(6)));
    assert_eq!(cluster.committed_commands("c"), commands(&["e1", "e2", "e3", "e4", "e5"]));
    assert_eq!(cluster.committed_commands("a"), commands(&["e1", "e2", "e3", "e4", "e5"]));
}

#[tokio::test]
async fn uncommitted_entry_from_crashed_leader_is_overwritten() {
    // -- setup --
    let mut cluster = TestCluster::new(&["a", "b", "c", "d", "e"]);
    cluster.elect("a");
    for payload in &["e1", "e2", "e3", "e4", "e5"] {
        cluster.enqueue("a", payload).unwrap();
    }

    // e6 only reaches b, which is not a majority of five.
    cluster.partition("c");
    cluster.partition("d");
    cluster.partition("e");
    let e6 = cluster.enqueue("a", "e6").unwrap();
    assert_eq!(e6.enqueued_index, Index::new(7));
    assert_eq!(cluster.node("a").commit_index(), Some(Index::new(6)));
    assert_eq!(cluster.node("b").commit_index(), Some(Index::new(6)));
    assert_eq!(cluster.log_of("b").len(), 7);

    // -- execute --
    cluster.crash("a");
    cluster.heal("c");
    cluster.heal("d");
    cluster.heal("e");
    cluster.partition("b");
    cluster.elect("c");
    cluster.heal("b");
    cluster.heartbeat("c", "b");

    // -- verify --
    let new_term = cluster.node("c").current_term();
    let b_log = cluster.log_of("b");
    assert_eq!(b_log.len(), 7);
    assert_eq!(b_log[6], WriteAheadLogEntry::barrier(new_term));
    assert_eq!(cluster.log_of("b"), cluster.log_of("c"));
    assert_eq!(cluster.node("b").commit_index(), Some(Index::new(7)));
    assert_eq!(cluster.committed_commands("b"), commands(&["e1", "e2", "e3", "e4", "e5"]));
}

#[tokio::test]
async fn first_candidate_in_a_term_gets_the_vote() {
    // -- setup --
    let mut cluster = TestCluster::new(&["a", "b", "c"]);
    let term = Term::new(5);

    // -- execute --
    let first = cluster
        .node("a")
        .server_handle_request_vote(RequestVoteInput {
            candidate_term: term,
            candidate_id: id("b"),
            candidate_last_log_entry: None,
        })
        .unwrap();
    let second = cluster
        .node("a")
        .server_handle_request_vote(RequestVoteInput {
            candidate_term: term,
            candidate_id: id("c"),
            candidate_last_log_entry: Some((Term::new(4), Index::new(10))),
        })
        .unwrap();
    let retry = cluster
        .node("a")
        .server_handle_request_vote(RequestVoteInput {
            candidate_term: term,
            candidate_id: id("b"),
            candidate_last_log_entry: None,
        })
        .unwrap();

    // -- verify --
    assert!(first.vote_granted);
    assert!(!second.vote_granted);
    assert!(retry.vote_granted);
    assert_eq!(cluster.node("a").current_term(), term);
}

#[tokio::test]
async fn vote_refused_to_candidate_with_older_log() {
    // -- setup --
    let mut cluster = TestCluster::new(&["a", "b", "c"]);
    cluster.elect("a");
    cluster.enqueue("a", "e1").unwrap();

    // -- execute --
    let result = cluster.node("b").server_handle_request_vote(RequestVoteInput {
        candidate_term: Term::new(9),
        candidate_id: id("c"),
        candidate_last_log_entry: Some((Term::new(1), Index::new(1))),
    });

    // -- verify --
    assert!(!result.unwrap().vote_granted);
    assert_eq!(cluster.node("b").current_term(), Term::new(9));
    assert!(!cluster.node("b").is_leader());
}

#[tokio::test]
async fn followers_redirect_writes_to_leader() {
    // -- setup --
    let mut cluster = TestCluster::new(&["a", "b", "c"]);

    // -- execute & verify --
    assert!(matches!(
        cluster.enqueue("b", "x"),
        Err(EnqueueForReplicationError::NoLeader)
    ));

    cluster.elect("a");
    match cluster.enqueue("b", "x") {
        Err(EnqueueForReplicationError::LeaderRedirect { leader_id, leader_addr }) => {
            assert_eq!(leader_id, id("a"));
            assert_eq!(leader_addr, Some("127.0.0.1:7000".parse().unwrap()));
        }
        other => panic!("Unexpected result {:?}", other),
    }
}

#[tokio::test]
async fn stale_leader_steps_down_on_newer_term() {
    // -- setup --
    let mut cluster = TestCluster::new(&["a", "b", "c"]);
    cluster.elect("a");
    cluster.partition("a");

    // -- execute --
    cluster.elect("b");
    cluster.heal("a");
    cluster.heartbeat("b", "a");

    // -- verify --
    assert!(!cluster.node("a").is_leader());
    assert_eq!(cluster.node("a").current_term(), cluster.node("b").current_term());
    assert_eq!(cluster.log_of("a"), cluster.log_of("b"));
}

#[tokio::test]
async fn single_member_cluster_commits_alone() {
    // -- setup --
    let mut cluster = TestCluster::new(&["solo"]);

    // -- execute --
    cluster.elect("solo");
    let out = cluster.enqueue("solo", "only").unwrap();

    // -- verify --
    assert_eq!(out.enqueued_index, Index::new(2));
    assert_eq!(cluster.node("solo").commit_index(), Some(Index::new(2)));
    assert_eq!(cluster.committed_commands("solo"), commands(&["only"]));
}

#[tokio::test]
async fn faulted_member_refuses_work_until_leader_repairs_it() {
    // -- setup --
    let mut cluster = TestCluster::new(&["a", "b", "c"]);
    cluster.elect("a");
    cluster.enqueue("a", "e1").unwrap();

    // -- execute --
    cluster
        .node("b")
        .fault_for_test(LogError::Corrupted("bad checksum".to_string()));

    // -- verify --
    assert!(cluster.node("b").is_faulted());
    let term_before = cluster.node("b").current_term();
    cluster.node("b").handle_follower_timeout();
    assert_eq!(cluster.node("b").current_term(), term_before);
    assert!(matches!(
        cluster.enqueue("b", "x"),
        Err(EnqueueForReplicationError::IntegrityFault(_))
    ));

    cluster.heartbeat("a", "b");
    assert!(!cluster.node("b").is_faulted());
}

#[tokio::test]
async fn faulted_leader_steps_down() {
    // -- setup --
    let mut cluster = TestCluster::new(&["a", "b", "c"]);
    cluster.elect("a");

    // -- execute --
    cluster
        .node("a")
        .fault_for_test(LogError::NonContiguous {
            expected: Index::new(3),
            actual: Index::new(5),
        });

    // -- verify --
    assert!(!cluster.node("a").is_leader());
    assert!(matches!(
        cluster.enqueue("a", "x"),
        Err(EnqueueForReplicationError::IntegrityFault(_))
    ));
}

#[tokio::test]
async fn leader_rejects_writes_without_recent_quorum() {
    // -- setup --
    let mut cluster = TestCluster::with_timeouts(&["a", "b", "c"], Duration::from_millis(10), Duration::from_millis(50));
    cluster.elect("a");
    cluster.enqueue("a", "e1").unwrap();

    // -- execute --
    cluster.partition("b");
    cluster.partition("c");
    tokio::time::sleep(Duration::from_millis(120)).await;

    // -- verify --
    assert!(matches!(
        cluster.enqueue("a", "e2"),
        Err(EnqueueForReplicationError::QuorumUnavailable)
    ));
    assert!(cluster.node("a").is_leader());

    cluster.heal("b");
    cluster.heartbeat("a", "b");
    cluster.enqueue("a", "e2").unwrap();
    assert_eq!(cluster.committed_commands("a"), commands(&["e1", "e2"]));
}

#[tokio::test]
async fn randomized_partitions_preserve_safety() {
    let names = ["a", "b", "c", "d", "e"];
    let mut cluster = TestCluster::new(&names);
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut leaders_by_term: HashMap<Term, MemberId> = HashMap::new();
    let mut committed: HashMap<&str, Vec<Bytes>> = HashMap::new();

    for round in 0..200 {
        let member = names[rng.gen_range(0..names.len())];
        match rng.gen_range(0..10) {
            0 => cluster.partition(member),
            1 | 2 => cluster.heal(member),
            3 => {
                cluster.node(member).handle_follower_timeout();
                cluster.deliver_all();
            }
            _ => {
                let _ = cluster.enqueue(member, &format!("cmd-{}", round));
            }
        }

        // Election safety: at most one leader per term.
        for name in &names {
            if cluster.node(name).is_leader() {
                let term = cluster.node(name).current_term();
                let leader = leaders_by_term.entry(term).or_insert_with(|| id(name));
                assert_eq!(*leader, id(name), "Two leaders in term {:?}", term);
            }
        }

        for name in &names {
            let new_commands = cluster.committed_commands(name);
            committed.entry(*name).or_default().extend(new_commands);
        }
    }

    // Log matching: same index and term means identical prefixes.
    let logs: Vec<Vec<WriteAheadLogEntry>> = names.iter().map(|n| cluster.log_of(n)).collect();
    for left in &logs {
        for right in &logs {
            for i in (0..left.len().min(right.len())).rev() {
                if left[i].term == right[i].term {
                    assert_eq!(left[..=i], right[..=i]);
                    break;
                }
            }
        }
    }

    // State machine safety: every member applied a prefix of the same sequence.
    let longest = committed.values().max_by_key(|c| c.len()).unwrap().clone();
    for applied in committed.values() {
        assert_eq!(applied[..], longest[..applied.len()]);
    }
}
