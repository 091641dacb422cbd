//! LND implementation of the node client traits, over LND's gRPC API.

pub mod interceptor;
pub mod rpc;

pub use rpc::{LndConnector, LndSession, LndSigner};
