//! JSON-RPC clients for Bitcoin-family and Ethereum-family nodes
//!
//! Thin reqwest wrappers over the handful of methods the driver needs.
//! Transient failures surface as `Error::Rpc` and are retried by the
//! calling loop; a broadcast answered with "already in block chain" counts
//! as success.

use async_trait::async_trait;
use covault_core::chain::{BlockInfo, ChainRpc};
use covault_core::{Chain, Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Minimal JSON-RPC 2.0 client
#[derive(Clone)]
pub struct JsonRpcClient {
    url: String,
    client: reqwest::Client,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Rpc(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Rpc(format!("{method}: {e}")))?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Rpc(format!("{method}: {e}")))?;
        if let Some(error) = body.get("error") {
            if !error.is_null() {
                return Err(Error::Rpc(format!("{method}: {error}")));
            }
        }
        let result = body
            .get("result")
            .ok_or_else(|| Error::Rpc(format!("{method}: missing result")))?;
        serde_json::from_value(result.clone()).map_err(|e| Error::Rpc(format!("{method}: {e}")))
    }
}

/// One transaction output as the scanner sees it
#[derive(Debug, Clone, Deserialize)]
pub struct BitcoinTxOut {
    pub value: f64,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: BitcoinScriptPubKey,
    pub n: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BitcoinScriptPubKey {
    #[serde(default)]
    pub address: Option<String>,
    pub hex: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BitcoinTx {
    pub txid: String,
    pub vout: Vec<BitcoinTxOut>,
    #[serde(default)]
    pub confirmations: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BitcoinBlock {
    pub hash: String,
    pub height: u64,
    pub confirmations: i64,
    #[serde(default)]
    pub tx: Vec<BitcoinTx>,
}

#[derive(Debug, Clone, Deserialize)]
struct SmartFee {
    #[serde(default)]
    feerate: Option<f64>,
}

/// Bitcoin-family node client
#[derive(Clone)]
pub struct BitcoinRpc {
    client: JsonRpcClient,
}

impl BitcoinRpc {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: JsonRpcClient::new(url)?,
        })
    }

    pub async fn get_block_count(&self) -> Result<u64> {
        self.client.request("getblockcount", serde_json::json!([])).await
    }

    pub async fn get_block_hash(&self, height: u64) -> Result<String> {
        self.client
            .request("getblockhash", serde_json::json!([height]))
            .await
    }

    /// Block with full transactions (verbosity 2)
    pub async fn get_block(&self, hash: &str) -> Result<BitcoinBlock> {
        self.client
            .request("getblock", serde_json::json!([hash, 2]))
            .await
    }

    pub async fn get_transaction(&self, txid: &str) -> Result<Option<BitcoinTx>> {
        match self
            .client
            .request("getrawtransaction", serde_json::json!([txid, true]))
            .await
        {
            Ok(tx) => Ok(Some(tx)),
            Err(Error::Rpc(reason)) if reason.contains("No such mempool or blockchain") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Broadcast; "already in block chain" is success. Any other txid than
    /// the computed one is a malformed broadcast.
    pub async fn send_raw_transaction(&self, raw_hex: &str, expected_txid: &str) -> Result<()> {
        let sent: std::result::Result<String, Error> = self
            .client
            .request("sendrawtransaction", serde_json::json!([raw_hex]))
            .await;
        match sent {
            Ok(txid) if txid == expected_txid => Ok(()),
            Ok(txid) => Err(Error::MalformedBroadcast {
                sent: expected_txid.to_string(),
                got: txid,
            }),
            Err(Error::Rpc(reason)) if reason.contains("already in block chain") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Fee estimate in sat/vB, floored at the relay minimum
    pub async fn estimate_fee_rate(&self) -> Result<u64> {
        let fee: SmartFee = self
            .client
            .request("estimatesmartfee", serde_json::json!([1]))
            .await?;
        let btc_per_kvb = fee.feerate.unwrap_or(0.0);
        let sat_per_vb = (btc_per_kvb * 100_000_000.0 / 1_000.0).ceil() as u64;
        Ok(sat_per_vb.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EthereumBlock {
    pub hash: String,
    pub number: String,
}

/// Ethereum-family node client
#[derive(Clone)]
pub struct EthereumRpc {
    client: JsonRpcClient,
}

impl EthereumRpc {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: JsonRpcClient::new(url)?,
        })
    }

    pub async fn block_number(&self) -> Result<u64> {
        let hex: String = self
            .client
            .request("eth_blockNumber", serde_json::json!([]))
            .await?;
        parse_quantity(&hex)
    }

    pub async fn get_block_by_hash(&self, hash: &str) -> Result<Option<EthereumBlock>> {
        let block: Option<EthereumBlock> = self
            .client
            .request("eth_getBlockByHash", serde_json::json!([hash, false]))
            .await?;
        Ok(block)
    }

    pub async fn get_block_hash(&self, height: u64) -> Result<Option<String>> {
        let block: Option<EthereumBlock> = self
            .client
            .request(
                "eth_getBlockByNumber",
                serde_json::json!([format!("0x{height:x}"), false]),
            )
            .await?;
        Ok(block.map(|b| b.hash))
    }

    pub async fn gas_price(&self) -> Result<u64> {
        let hex: String = self
            .client
            .request("eth_gasPrice", serde_json::json!([]))
            .await?;
        parse_quantity(&hex)
    }
}

fn parse_quantity(hex: &str) -> Result<u64> {
    let trimmed = hex.trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16).map_err(|e| Error::Rpc(format!("quantity {hex}: {e}")))
}

/// Per-chain RPC endpoints, also serving keeper network-info verification
pub struct ObserverRpc {
    bitcoin: HashMap<Chain, BitcoinRpc>,
    ethereum: HashMap<Chain, EthereumRpc>,
}

impl ObserverRpc {
    pub fn new(endpoints: &[(Chain, String)]) -> Result<Self> {
        let mut bitcoin = HashMap::new();
        let mut ethereum = HashMap::new();
        for (chain, url) in endpoints {
            if chain.is_bitcoin_family() {
                bitcoin.insert(*chain, BitcoinRpc::new(url.clone())?);
            } else {
                ethereum.insert(*chain, EthereumRpc::new(url.clone())?);
            }
        }
        Ok(Self { bitcoin, ethereum })
    }

    pub fn bitcoin(&self, chain: Chain) -> Result<&BitcoinRpc> {
        self.bitcoin
            .get(&chain)
            .ok_or_else(|| Error::UnsupportedChain(chain as u8))
    }

    pub fn ethereum(&self, chain: Chain) -> Result<&EthereumRpc> {
        self.ethereum
            .get(&chain)
            .ok_or_else(|| Error::UnsupportedChain(chain as u8))
    }
}

#[async_trait]
impl ChainRpc for ObserverRpc {
    async fn get_block(&self, chain: Chain, hash: &str) -> Result<Option<BlockInfo>> {
        if chain.is_bitcoin_family() {
            match self.bitcoin(chain)?.get_block(hash).await {
                Ok(block) => Ok(Some(BlockInfo {
                    height: block.height,
                    confirmations: block.confirmations,
                })),
                Err(Error::Rpc(reason)) if reason.contains("Block not found") => Ok(None),
                Err(e) => Err(e),
            }
        } else {
            let block = self.ethereum(chain)?.get_block_by_hash(hash).await?;
            match block {
                None => Ok(None),
                Some(block) => Ok(Some(BlockInfo {
                    height: parse_quantity(&block.number)?,
                    confirmations: 1,
                })),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x10").unwrap(), 16);
        assert_eq!(parse_quantity("ff").unwrap(), 255);
        assert!(parse_quantity("0xzz").is_err());
    }

    #[test]
    fn test_observer_rpc_routing() {
        let rpc = ObserverRpc::new(&[
            (Chain::Bitcoin, "http://localhost:8332".to_string()),
            (Chain::Ethereum, "http://localhost:8545".to_string()),
        ])
        .unwrap();
        assert!(rpc.bitcoin(Chain::Bitcoin).is_ok());
        assert!(rpc.bitcoin(Chain::Litecoin).is_err());
        assert!(rpc.ethereum(Chain::Ethereum).is_ok());
        assert!(rpc.ethereum(Chain::Polygon).is_err());
    }
}
