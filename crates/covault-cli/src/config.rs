//! TOML configuration for both node roles

use anyhow::{bail, Context, Result};
use covault_core::Chain;
use covault_keeper::KeeperConf;
use covault_observer::ObserverConf;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Deserialize)]
pub struct Configuration {
    pub store_dir: PathBuf,
    pub keeper: KeeperSection,
    pub observer: ObserverSection,
    pub chains: Vec<ChainSection>,
}

#[derive(Debug, Deserialize)]
pub struct KeeperSection {
    pub app_id: String,
    pub asset_id: String,
    pub observer_asset_id: String,
    pub observer_user_id: String,
    pub signer_members: Vec<String>,
    pub signer_threshold: u8,
    /// 32-byte hex X25519 identity
    pub private_key: String,
    pub observer_public_key: String,
    pub signer_public_key: String,
}

#[derive(Debug, Deserialize)]
pub struct ObserverSection {
    pub private_key: String,
    pub keeper_public_key: String,
    pub keeper_members: Vec<String>,
    pub keeper_threshold: u8,
    pub price_asset_id: String,
    pub price_amount: String,
    pub transaction_minimum: String,
    pub scan_genesis: u64,
    pub api_listen: String,
}

#[derive(Debug, Deserialize)]
pub struct ChainSection {
    /// Stable chain byte, see the protocol chain table
    pub chain: u8,
    pub rpc: String,
}

fn parse_key(hex_key: &str, name: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_key).with_context(|| format!("{name} must be hex"))?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("{name} must be 32 bytes"))?;
    Ok(key)
}

impl Configuration {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let conf: Configuration = toml::from_str(&raw)?;
        if conf.chains.is_empty() {
            bail!("at least one chain endpoint is required");
        }
        Ok(conf)
    }

    pub fn keeper_store_path(&self) -> PathBuf {
        self.store_dir.join("keeper.sqlite3")
    }

    pub fn observer_store_path(&self) -> PathBuf {
        self.store_dir.join("observer.sqlite3")
    }

    pub fn chain_endpoints(&self) -> Result<Vec<(Chain, String)>> {
        self.chains
            .iter()
            .map(|section| {
                let chain = Chain::from_byte(section.chain)
                    .map_err(|e| anyhow::anyhow!("chain {}: {e}", section.chain))?;
                Ok((chain, section.rpc.clone()))
            })
            .collect()
    }

    pub fn keeper_conf(&self) -> Result<KeeperConf> {
        Ok(KeeperConf {
            app_id: self.keeper.app_id.clone(),
            keeper_asset_id: self.keeper.asset_id.clone(),
            observer_asset_id: self.keeper.observer_asset_id.clone(),
            observer_user_id: self.keeper.observer_user_id.clone(),
            signer_members: self.keeper.signer_members.clone(),
            signer_threshold: self.keeper.signer_threshold,
            node_private_key: parse_key(&self.keeper.private_key, "keeper.private_key")?,
            observer_public_key: parse_key(
                &self.keeper.observer_public_key,
                "keeper.observer_public_key",
            )?,
            signer_public_key: parse_key(
                &self.keeper.signer_public_key,
                "keeper.signer_public_key",
            )?,
        })
    }

    pub fn observer_conf(&self) -> Result<ObserverConf> {
        let chains = self
            .chain_endpoints()?
            .into_iter()
            .map(|(chain, _)| chain)
            .collect();
        Ok(ObserverConf {
            private_key: parse_key(&self.observer.private_key, "observer.private_key")?,
            keeper_public_key: parse_key(
                &self.observer.keeper_public_key,
                "observer.keeper_public_key",
            )?,
            keeper_members: self.observer.keeper_members.clone(),
            keeper_threshold: self.observer.keeper_threshold,
            observer_asset_id: self.keeper.observer_asset_id.clone(),
            price_asset_id: self.observer.price_asset_id.clone(),
            price_amount: Decimal::from_str(&self.observer.price_amount)
                .context("observer.price_amount")?,
            transaction_minimum: Decimal::from_str(&self.observer.transaction_minimum)
                .context("observer.transaction_minimum")?,
            chains,
            scan_genesis: self.observer.scan_genesis,
        })
    }

    pub fn api_listen_addr(&self) -> Result<SocketAddr> {
        self.observer
            .api_listen
            .parse()
            .context("observer.api_listen")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
store_dir = "/var/lib/covault"

[keeper]
app_id = "2e78d04a-e61a-442d-a014-dec19bd61cfe"
asset_id = "c94ac88f-4671-3976-b60a-09064f1811e8"
observer_asset_id = "31d2ea9c-95eb-3355-b65b-ba096853bc18"
observer_user_id = "e459de8b-4edd-44ff-a119-b1d707f8521a"
signer_members = ["fcb87491-4fa0-4c2f-b387-262b63cbc112"]
signer_threshold = 1
private_key = "52250bb9b9edc5d54466182778a6470a5ee34033c215c92dd250b9c2ce543556"
observer_public_key = "35fe01cbdc659810854615319b51899b78966c513f0515ee9d77ef6016090221"
signer_public_key = "0619f13c84e1d2bfd6f20ca75a03bee058a95024338c583e1aa8761348dbb249"

[observer]
private_key = "c663c88aab70d1539b22f475cb8febc714dc61b9a43b472dc1ef970786cf31f9"
keeper_public_key = "52250bb9b9edc5d54466182778a6470a5ee34033c215c92dd250b9c2ce543556"
keeper_members = ["2e78d04a-e61a-442d-a014-dec19bd61cfe"]
keeper_threshold = 1
price_asset_id = "31d2ea9c-95eb-3355-b65b-ba096853bc18"
price_amount = "3.0123"
transaction_minimum = "0.0001"
scan_genesis = 790000
api_listen = "127.0.0.1:7080"

[[chains]]
chain = 1
rpc = "http://127.0.0.1:8332"

[[chains]]
chain = 6
rpc = "http://127.0.0.1:8545"
"#;

    #[test]
    fn test_parse_example() {
        let conf: Configuration = toml::from_str(EXAMPLE).unwrap();
        let keeper = conf.keeper_conf().unwrap();
        assert_eq!(keeper.signer_threshold, 1);
        let observer = conf.observer_conf().unwrap();
        assert_eq!(observer.price_amount.to_string(), "3.0123");
        assert_eq!(observer.chains, vec![Chain::Bitcoin, Chain::Polygon]);
        assert_eq!(
            conf.chain_endpoints().unwrap()[0].0,
            Chain::Bitcoin
        );
        assert_eq!(conf.api_listen_addr().unwrap().port(), 7080);
    }
}
