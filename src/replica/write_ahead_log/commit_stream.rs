use crate::commitlog::Index;
use crate::replica::{EntryPayload, Term};
use tokio::sync::mpsc;

/// Entry as handed to the application once the cluster has committed it.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct CommittedEntry {
    pub(crate) term: Term,
    pub(crate) index: Index,
    pub(crate) payload: EntryPayload,
}

pub(super) fn new() -> (CommitStreamPublisher, CommitStream) {
    let (sender, receiver) = mpsc::unbounded_channel();

    (
        CommitStreamPublisher {
            sender,
            last_published: None,
        },
        CommitStream { receiver },
    )
}

/// Write half, owned by the write-ahead log. Publishes strictly in index order.
pub(super) struct CommitStreamPublisher {
    sender: mpsc::UnboundedSender<CommittedEntry>,
    last_published: Option<Index>,
}

impl CommitStreamPublisher {
    pub(super) fn notify_commit(&mut self, logger: &slog::Logger, term: Term, index: Index, payload: EntryPayload) {
        if let Some(last) = self.last_published {
            if index != last.plus(1) {
                panic!(
                    "Commit stream must be contiguous. Last published {:?}, now publishing {:?}",
                    last, index
                );
            }
        }
        self.last_published = Some(index);

        if self.sender.send(CommittedEntry { term, index, payload }).is_err() {
            slog::debug!(logger, "Commit stream receiver is gone. Dropping {:?}.", index);
        }
    }
}

/// Read half, handed to the application through `RaftCommitStream`.
pub(crate) struct CommitStream {
    receiver: mpsc::UnboundedReceiver<CommittedEntry>,
}

impl CommitStream {
    pub(crate) async fn recv(&mut self) -> Option<CommittedEntry> {
        self.receiver.recv().await
    }

    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<CommittedEntry> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn entries_arrive_in_publish_order() {
        // -- setup --
        let (mut publisher, mut stream) = new();

        // -- execute --
        for i in 3..=5 {
            publisher.notify_commit(
                &logger(),
                Term::new(1),
                Index::new(i),
                EntryPayload::Command(Bytes::from(format!("e{}", i))),
            );
        }

        // -- verify --
        let indexes: Vec<u64> = std::iter::from_fn(|| stream.try_recv())
            .map(|entry| entry.index.as_u64())
            .collect();
        assert_eq!(indexes, vec![3, 4, 5]);
    }

    #[test]
    fn publishing_without_a_receiver_is_harmless() {
        let (mut publisher, stream) = new();
        drop(stream);

        publisher.notify_commit(&logger(), Term::new(1), Index::new(1), EntryPayload::LeaderBarrier);
    }

    #[test]
    #[should_panic(expected = "Commit stream must be contiguous")]
    fn skipping_an_index_is_a_bug() {
        let (mut publisher, _stream) = new();

        publisher.notify_commit(&logger(), Term::new(1), Index::new(1), EntryPayload::LeaderBarrier);
        publisher.notify_commit(&logger(), Term::new(1), Index::new(3), EntryPayload::LeaderBarrier);
    }
}
