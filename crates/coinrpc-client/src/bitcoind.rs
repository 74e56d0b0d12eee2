//! Typed helpers for the bitcoind method set.
//!
//! [`BitcoindClient`] is a thin layer over [`RpcClient`]: it fixes method
//! names and parameter shapes and maps the "not found" error codes of the
//! lookup methods to `None`. Everything except [`BitcoindClient::get_chain_info`]
//! goes through the batching scheduler.

use std::time::Duration;

use coinrpc_common::protocol::error::{CoinrpcError, Result};
use coinrpc_common::protocol::jsonrpc::{RPC_INVALID_ADDRESS_OR_KEY, RPC_INVALID_PARAMETER};
use coinrpc_common::transport::{HttpTransport, Transport};
use futures::future::try_join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::client::RpcClient;
use crate::config::ClientConfig;

/// Combined view returned by [`BitcoindClient::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub blockchain_info: Value,
    pub mempool_info: Value,
    pub mining_info: Value,
    pub network_info: Value,
}

/// Known transaction ids that [`BitcoindClient::get_block_with_transactions_excluding`]
/// treats specially.
///
/// Some forks report transactions that cannot be fetched (the genesis
/// coinbase on bitcoinsv) or that carry a stale `blockhash`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockTxExclusions {
    /// Dropped from the block before fetching
    pub skip: Vec<String>,
    /// Fetched, but never reported as a block hash mismatch
    pub ignore_mismatch: Vec<String>,
}

impl BlockTxExclusions {
    /// Exclusions for bitcoinsv; `mainnet` adds the two mismatching mainnet txids.
    pub fn bitcoinsv(mainnet: bool) -> Self {
        let mut exclusions = Self {
            skip: vec![BSV_GENESIS_COINBASE.to_string()],
            ignore_mismatch: Vec::new(),
        };
        if mainnet {
            exclusions.ignore_mismatch = BSV_MAINNET_MISMATCHES.iter().map(|id| id.to_string()).collect();
        }
        exclusions
    }
}

const BSV_GENESIS_COINBASE: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";
const BSV_MAINNET_MISMATCHES: [&str; 2] = [
    "d5d27987d2a3dfc724e359870c6644b40e497bdc0589a033220fe15429d88599",
    "e3bf3d07d4b0375638d5f1db5255fe07ba2c4cb067cd81b84ee974b6585fb468",
];

pub struct BitcoindClient<T: Transport = HttpTransport> {
    rpc: RpcClient<T>,
}

impl<T: Transport> Clone for BitcoindClient<T> {
    fn clone(&self) -> Self {
        Self {
            rpc: self.rpc.clone(),
        }
    }
}

impl BitcoindClient<HttpTransport> {
    pub async fn new(endpoint: &str) -> Result<Self> {
        Ok(Self::from_rpc(RpcClient::new(endpoint).await?))
    }

    pub async fn with_config(endpoint: &str, config: ClientConfig) -> Result<Self> {
        Ok(Self::from_rpc(RpcClient::with_config(endpoint, config).await?))
    }
}

impl<T: Transport> BitcoindClient<T> {
    pub fn from_rpc(rpc: RpcClient<T>) -> Self {
        Self { rpc }
    }

    pub fn rpc(&self) -> &RpcClient<T> {
        &self.rpc
    }

    /// Direct `getblockchaininfo` used as a connectivity check.
    pub async fn get_chain_info(&self, timeout: Option<Duration>) -> Result<Value> {
        self.rpc.ping(timeout).await
    }

    pub async fn get_blockchain_info(&self) -> Result<Value> {
        self.rpc.call("getblockchaininfo", vec![]).await
    }

    pub async fn get_network_info(&self) -> Result<Value> {
        self.rpc.call("getnetworkinfo", vec![]).await
    }

    /// Hash of the block at `height`, or `None` past the chain tip.
    pub async fn get_block_hash(&self, height: u64) -> Result<Option<String>> {
        match self.rpc.call_as("getblockhash", vec![json!(height)]).await {
            Ok(hash) => Ok(Some(hash)),
            Err(e) if e.remote_code() == Some(RPC_INVALID_PARAMETER) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Block with transaction ids.
    pub async fn get_block(&self, hash: &str) -> Result<Value> {
        self.rpc.call("getblock", vec![json!(hash), json!(true)]).await
    }

    /// Block with fully decoded transactions.
    pub async fn get_block_verbose(&self, hash: &str) -> Result<Value> {
        self.rpc.call("getblock", vec![json!(hash), json!(2)]).await
    }

    /// Block whose `tx` ids are replaced by the transactions themselves.
    ///
    /// The transactions are fetched concurrently. Fails if any of them is
    /// unknown to the node or reports a different `blockhash`.
    pub async fn get_block_with_transactions(&self, hash: &str) -> Result<Value> {
        self.get_block_with_transactions_excluding(hash, &BlockTxExclusions::default())
            .await
    }

    /// [`Self::get_block_with_transactions`] with per-chain exceptions.
    pub async fn get_block_with_transactions_excluding(
        &self,
        hash: &str,
        exclusions: &BlockTxExclusions,
    ) -> Result<Value> {
        let mut block = self.get_block(hash).await?;

        let txids: Vec<String> = match block.get("tx") {
            Some(Value::Array(ids)) => ids
                .iter()
                .map(|id| {
                    id.as_str()
                        .map(str::to_owned)
                        .ok_or_else(|| CoinrpcError::Protocol(format!("non-string txid in block {}", hash)))
                })
                .filter(|id| !matches!(id, Ok(id) if exclusions.skip.contains(id)))
                .collect::<Result<_>>()?,
            _ => {
                return Err(CoinrpcError::Protocol(format!(
                    "block {} has no transaction list",
                    hash
                )))
            }
        };

        debug!(block = hash, tx_count = txids.len(), "fetching block transactions");

        let txs = try_join_all(txids.iter().map(|txid| self.get_block_transaction(txid, hash))).await?;

        let mismatched: Vec<&str> = txs
            .iter()
            .zip(&txids)
            .filter(|(tx, _)| tx.get("blockhash").and_then(Value::as_str) != Some(hash))
            .map(|(_, txid)| txid.as_str())
            .filter(|txid| !exclusions.ignore_mismatch.iter().any(|id| id == txid))
            .collect();
        if !mismatched.is_empty() {
            return Err(CoinrpcError::BlockMismatch(format!(
                "block hash mismatch between txs: {} and for block {}",
                mismatched.join(","),
                hash
            )));
        }

        block["tx"] = Value::Array(txs);
        Ok(block)
    }

    async fn get_block_transaction(&self, txid: &str, block: &str) -> Result<Value> {
        self.get_transaction(txid).await?.ok_or_else(|| {
            CoinrpcError::BlockMismatch(format!("tx {} for block {} not found", txid, block))
        })
    }

    /// Decoded transaction, or `None` if the node does not know it.
    pub async fn get_transaction(&self, txid: &str) -> Result<Option<Value>> {
        match self.rpc.call("getrawtransaction", vec![json!(txid), json!(1)]).await {
            Ok(tx) => Ok(Some(tx)),
            Err(e) if e.remote_code() == Some(RPC_INVALID_ADDRESS_OR_KEY) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn send_raw_transaction(&self, hex: &str) -> Result<Value> {
        self.rpc
            .call("sendrawtransaction", vec![json!(hex), json!(true)])
            .await
    }

    pub async fn get_status(&self) -> Result<NodeStatus> {
        let (blockchain_info, mempool_info, mining_info, network_info) = tokio::try_join!(
            self.rpc.submit("getblockchaininfo", vec![]),
            self.rpc.submit("getmempoolinfo", vec![]),
            self.rpc.submit("getmininginfo", vec![]),
            self.rpc.submit("getnetworkinfo", vec![]),
        )?;

        Ok(NodeStatus {
            blockchain_info,
            mempool_info,
            mining_info,
            network_info,
        })
    }

    /// Verbose mempool listing.
    pub async fn get_mempool(&self) -> Result<Value> {
        self.rpc.call("getrawmempool", vec![json!(true)]).await
    }

    pub async fn generate(&self, blocks: u64) -> Result<Value> {
        self.rpc.call("generate", vec![json!(blocks)]).await
    }
}
