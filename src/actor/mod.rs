use crate::commitlog;
use crate::replica;
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer,
    EnqueueForReplicationError, EnqueueForReplicationInput, EnqueueForReplicationOutput, LeaderTimerTick,
    RequestVoteError, RequestVoteInput, RequestVoteOutput, RequestVoteReplyFromPeer, WriteAheadLogEntry,
};
use std::error::Error;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};

// Disk interaction is synchronous inside the event loop. Committed entries leave through the
// commit stream, so applying them never blocks this actor.
#[derive(Debug)]
pub(crate) enum Event {
    // Leader: Append and sync locally, then replicate eagerly.
    // Candidate: Reject request.
    // Follower: Redirect.
    EnqueueForReplication(
        EnqueueForReplicationInput,
        Callback<EnqueueForReplicationOutput, EnqueueForReplicationError>,
    ),

    // Leader: Grant vote if applicable (includes write to disk). Transition to follower.
    // Candidate: Grant vote if applicable (includes write to disk). Transition to follower.
    // Follower: Grant vote if applicable (includes write to disk).
    RequestVote(RequestVoteInput, Callback<RequestVoteOutput, RequestVoteError>),

    // Leader: discard
    // Candidate: Update local state. Transition to leader if quorum vote.
    // Follower: discard
    RequestVoteReplyFromPeer(RequestVoteReplyFromPeer),

    // Leader: Transition to follower if applicable. Clean up log. Respond to request.
    // Candidate: Transition to follower if applicable. Clean up log. Respond to request.
    // Follower: Write to disk then respond. Reset timeout.
    AppendEntries(AppendEntriesInput, Callback<AppendEntriesOutput, AppendEntriesError>),

    // Leader: Update peer progress. If committed, publish to the commit stream.
    // Candidate: discard
    // Follower: discard
    AppendEntriesReplyFromPeer(AppendEntriesReplyFromPeer),

    // Leader: Send AppendEntries to the peer in the tick, with any entries it's missing.
    // Candidate: discard
    // Follower: discard
    LeaderTimer(LeaderTimerTick),

    // Leader: discard
    // Candidate: Trigger new election.
    // Follower: Transition to candidate. Trigger new election.
    FollowerTimeout,
}

#[derive(Debug)]
pub(crate) struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Callback<O, E> {
    pub fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

/// Returned by one-way notifications when the replica event loop is gone.
#[derive(Debug, thiserror::Error)]
#[error("Replica event loop has exited")]
pub(crate) struct ActorExited;

#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

/// Handle held by everything the replica itself owns (timers, transport). It doesn't keep the
/// event loop alive, so dropping the last `ActorClient` shuts the replica down.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ActorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn enqueue_for_replication(
        &self,
        input: EnqueueForReplicationInput,
    ) -> Result<EnqueueForReplicationOutput, EnqueueForReplicationError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::EnqueueForReplication(input, Callback(tx)))
            .await
            .map_err(|_| EnqueueForReplicationError::ActorExited)?;

        rx.await.map_err(|_| EnqueueForReplicationError::ActorExited)?
    }

    pub(crate) async fn request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, RequestVoteError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::RequestVote(input, Callback(tx)))
            .await
            .map_err(|_| RequestVoteError::ActorExited)?;

        rx.await.map_err(|_| RequestVoteError::ActorExited)?
    }

    pub(crate) async fn append_entries(
        &self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::AppendEntries(input, Callback(tx)))
            .await
            .map_err(|_| AppendEntriesError::ActorExited)?;

        rx.await.map_err(|_| AppendEntriesError::ActorExited)?
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        self.sender.send(event).await.map_err(|_| ActorExited)
    }
}

impl WeakActorClient {
    fn upgrade(&self) -> Result<ActorClient, ActorExited> {
        match self.sender.upgrade() {
            Some(sender) => Ok(ActorClient { sender }),
            None => Err(ActorExited),
        }
    }

    pub(crate) async fn request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, RequestVoteError> {
        match self.upgrade() {
            Ok(client) => client.request_vote(input).await,
            Err(_) => Err(RequestVoteError::ActorExited),
        }
    }

    pub(crate) async fn append_entries(
        &self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        match self.upgrade() {
            Ok(client) => client.append_entries(input).await,
            Err(_) => Err(AppendEntriesError::ActorExited),
        }
    }

    pub(crate) async fn notify_request_vote_reply_from_peer(
        &self,
        reply: RequestVoteReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.upgrade()?.send(Event::RequestVoteReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_append_entries_reply_from_peer(
        &self,
        reply: AppendEntriesReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.upgrade()?.send(Event::AppendEntriesReplyFromPeer(reply)).await
    }

    pub(crate) async fn leader_timer(&self, tick: LeaderTimerTick) -> Result<(), ActorExited> {
        self.upgrade()?.send(Event::LeaderTimer(tick)).await
    }

    pub(crate) async fn follower_timeout(&self) -> Result<(), ActorExited> {
        self.upgrade()?.send(Event::FollowerTimeout).await
    }
}

/// ReplicaActor is replica logic in actor model.
pub(crate) struct ReplicaActor<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: replica::Replica<L>,
}

impl<L> ReplicaActor<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: replica::Replica<L>) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        slog::info!(self.logger, "Replica event loop started.");
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);
        }
        slog::info!(self.logger, "Replica event loop exiting. All clients dropped.");
    }

    // This must NOT be async. Any long running work must be spawned on another actor
    // and/or come as a callback to this actor.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::EnqueueForReplication(input, callback) => {
                let result = self.replica.handle_enqueue_for_replication(input);
                callback.send(result);
            }
            Event::RequestVote(input, callback) => {
                let result = self.replica.server_handle_request_vote(input);
                callback.send(result);
            }
            Event::RequestVoteReplyFromPeer(reply) => {
                self.replica.handle_request_vote_reply_from_peer(reply);
            }
            Event::AppendEntries(input, callback) => {
                let result = self.replica.server_handle_append_entries(input);
                callback.send(result);
            }
            Event::AppendEntriesReplyFromPeer(reply) => {
                self.replica.handle_append_entries_reply_from_peer(reply);
            }
            Event::LeaderTimer(tick) => {
                self.replica.handle_leader_timer(tick);
            }
            Event::FollowerTimeout => {
                self.replica.handle_follower_timeout();
            }
        }
    }
}
