//! Inbound half of the consensus wire protocol.

mod server;
mod shutdown;

pub(crate) use server::RpcServer;
pub(crate) use server::SharedLogReader;
pub(crate) use shutdown::shutdown_signal;
pub(crate) use shutdown::RpcServerShutdownHandle;
pub(crate) use shutdown::RpcServerShutdownSignal;
