//! Runs a 3 member cluster in one process and registers a few graph tokens through it. Every
//! member applies the same commands and ends up with the same token ids.
//!
//! ```text
//! cargo run --example token_registry
//! ```

use graph_raft::{
    BatchingApplier, CommitPipeline, CommitPipelineHandle, EnqueueEntryError, EnqueueEntryInput, GlobalSession,
    InMemoryTransactionStore, PipelineConfig, RaftClientConfig, RaftElectionState, RaftMemberInfo, RaftOptions,
    RaftReplicatedLog, ReplicatedCommand, ReplicatedStateMachines, ReplicatedTokenStateMachine, SessionIdAllocator,
    ShutdownPolicy, TokenType,
};
use parking_lot::RwLock;
use slog::Drain;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;

const NUM_MEMBERS: usize = 3;
const PORT_BASE: u16 = 7100;

struct Member {
    member_id: String,
    replicated_log: RaftReplicatedLog,
    election_state: graph_raft::RaftEventListener,
    tokens: Arc<RwLock<ReplicatedTokenStateMachine>>,
    pipeline: CommitPipelineHandle,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let root_logger = create_root_logger_for_stdout();
    let cluster_members: Vec<RaftMemberInfo> = (0..NUM_MEMBERS)
        .map(|i| RaftMemberInfo {
            member_id: format!("member-{}", i + 1),
            address: SocketAddr::from(([127, 0, 0, 1], PORT_BASE + i as u16)),
        })
        .collect();

    let mut members = Vec::with_capacity(NUM_MEMBERS);
    for info in &cluster_members {
        let logger = root_logger.new(slog::o!("MemberId" => info.member_id.clone()));
        let client = graph_raft::try_create_raft_client(RaftClientConfig {
            my_member_id: info.member_id.clone(),
            cluster_id: "token-registry-demo".to_string(),
            cluster_members: cluster_members.clone(),
            log_directory: None,
            info_logger: logger.clone(),
            options: RaftOptions::default(),
            topology: None,
        })
        .await?;

        let machines = ReplicatedStateMachines::new(logger.clone(), InMemoryTransactionStore::new())?;
        let tokens = machines.tokens();
        let mut applier = BatchingApplier::new(logger.clone(), PipelineConfig::default());
        applier.bind(Box::new(machines))?;
        applier.start()?;
        let pipeline = CommitPipeline::new(logger, client.commit_stream, applier, Arc::new(client.local_catch_up)).spawn();

        members.push(Member {
            member_id: info.member_id.clone(),
            replicated_log: client.replicated_log,
            election_state: client.event_listener,
            tokens,
            pipeline,
        });
    }

    let session = SessionIdAllocator::new(GlobalSession::random(1));
    let mut last_index = 0;
    for (token_type, name) in &[
        (TokenType::Label, "Person"),
        (TokenType::Label, "City"),
        (TokenType::RelationshipType, "LIVES_IN"),
        (TokenType::PropertyKey, "name"),
        (TokenType::Label, "Person"),
    ] {
        let command = ReplicatedCommand::TokenRequest {
            operation: session.next_operation(),
            token_type: *token_type,
            name: name.to_string(),
        };
        last_index = submit(&members, command).await?;
    }

    for member in members.iter_mut() {
        member.pipeline.wait_for_applied(last_index).await?;
        let tokens = member.tokens.read();
        println!(
            "{} ({:?}): labels={:?} relationship types={:?} property keys={:?}",
            member.member_id,
            member.election_state.current_election_state(),
            tokens.tokens(TokenType::Label),
            tokens.tokens(TokenType::RelationshipType),
            tokens.tokens(TokenType::PropertyKey),
        );
    }

    for member in members {
        member.pipeline.stop(ShutdownPolicy::FlushPending).await?;
    }

    Ok(())
}

/// Sends `command` to whichever member currently leads, following redirects and waiting out
/// elections.
async fn submit(members: &[Member], command: ReplicatedCommand) -> Result<u64, Box<dyn Error>> {
    let data = command.encode();
    let mut target = members
        .iter()
        .position(|member| member.election_state.current_election_state() == RaftElectionState::Leader)
        .unwrap_or(0);

    for _ in 0..50 {
        let input = EnqueueEntryInput { data: data.clone() };
        match members[target].replicated_log.enqueue_entry(input).await {
            Ok(output) => return Ok(output.entry_id.index()),
            Err(EnqueueEntryError::LeaderRedirect(leader)) => {
                if let Some(position) = members.iter().position(|member| member.member_id == leader.member_id) {
                    target = position;
                }
            }
            Err(EnqueueEntryError::NoLeader) | Err(EnqueueEntryError::QuorumUnavailable) => {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err("No leader accepted the command".into())
}

fn create_root_logger_for_stdout() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, slog::Level::Info).fuse();

    slog::Logger::root(drain, slog::o!())
}
