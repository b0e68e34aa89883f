//! habitd-api - JSON-RPC 2.0 surface for habitd
//!
//! Self-contained protocol types plus the method-dispatch service that
//! maps RPC calls onto core operations. Transport is left to the caller
//! (the daemon serves line-delimited JSON over TCP).

pub mod protocol;
pub mod service;

pub use protocol::{ErrorObject, Request, RequestId, Response, RpcError};
pub use service::ApiService;
