pub mod error;
pub mod jsonrpc;

pub use error::{CoinrpcError, HttpStatusError, RemoteErrorKind, Result};
pub use jsonrpc::{RpcErrorObject, RpcRequest, RpcResponse};
