use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Pairs the handle that keeps the raft RPC server alive with the signal the server awaits.
/// The server shuts down once the handle is dropped.
pub(crate) fn shutdown_signal() -> (RpcServerShutdownHandle, RpcServerShutdownSignal) {
    let (tx, rx) = oneshot::channel();

    (RpcServerShutdownHandle { _tx: tx }, RpcServerShutdownSignal { rx })
}

pub(crate) struct RpcServerShutdownHandle {
    _tx: oneshot::Sender<()>,
}

pub(crate) struct RpcServerShutdownSignal {
    rx: oneshot::Receiver<()>,
}

impl Future for RpcServerShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Nothing is ever sent. Completion means the handle was dropped.
        Pin::new(&mut self.rx).poll(cx).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    #[tokio::test]
    async fn signal_fires_only_once_handle_is_dropped() {
        // -- setup --
        let (handle, mut signal) = shutdown_signal();

        // -- execute --
        let before_drop = tokio::time::timeout(Duration::from_millis(20), &mut signal).await;
        drop(handle);
        let after_drop = tokio::time::timeout(Duration::from_secs(1), &mut signal).await;

        // -- verify --
        assert!(before_drop.is_err());
        assert!(after_drop.is_ok());
    }
}
