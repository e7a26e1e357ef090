use anyhow::{Context, Result};
use camino::Utf8Path as Path;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::chain::Chain;

pub type ProductKey = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub product_id: i64,
    pub product_key: ProductKey,
    pub chain: Chain,
    /// Share to underlying rate
    pub price_feed_id_1: i64,
    /// Underlying price
    pub price_feed_id_2: i64,
    /// Products no longer shown on the dashboard
    #[serde(default)]
    pub eol: bool,
    pub product_data: ProductData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProductData {
    #[serde(rename = "beefy:vault")]
    StandardVault { vault: VaultInfo },
    #[serde(rename = "beefy:gov-vault")]
    GovVault { vault: VaultInfo },
    #[serde(rename = "beefy:boost")]
    Boost { boost: BoostInfo },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultInfo {
    pub id: String,
    pub contract_address: Address,
    pub token_decimals: u32,
    pub want_decimals: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoostInfo {
    pub id: String,
    pub contract_address: Address,
    pub staked_token_address: Address,
    pub staked_token_decimals: u32,
    pub vault_want_decimals: u32,
}

/// What is needed to read a share-to-underlying rate on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareRateParams {
    pub vault_address: Address,
    pub vault_decimals: u32,
    pub underlying_decimals: u32,
}

impl Product {
    /// The contract emitting the share token transfers.
    pub fn contract_address(&self) -> Address {
        match &self.product_data {
            ProductData::StandardVault { vault } | ProductData::GovVault { vault } => {
                vault.contract_address
            }
            ProductData::Boost { boost } => boost.contract_address,
        }
    }

    pub fn token_decimals(&self) -> u32 {
        match &self.product_data {
            ProductData::StandardVault { vault } | ProductData::GovVault { vault } => {
                vault.token_decimals
            }
            ProductData::Boost { boost } => boost.staked_token_decimals,
        }
    }

    /// Gov vaults don't have a share rate, boosts use the rate of the vault they stake.
    pub fn share_rate_params(&self) -> Option<ShareRateParams> {
        match &self.product_data {
            ProductData::StandardVault { vault } => Some(ShareRateParams {
                vault_address: vault.contract_address,
                vault_decimals: vault.token_decimals,
                underlying_decimals: vault.want_decimals,
            }),
            ProductData::Boost { boost } => Some(ShareRateParams {
                vault_address: boost.staked_token_address,
                vault_decimals: boost.staked_token_decimals,
                underlying_decimals: boost.vault_want_decimals,
            }),
            ProductData::GovVault { .. } => None,
        }
    }

    pub fn investment_import_key(&self) -> String {
        format!("product:investment:{}", self.product_id)
    }

    /// Share rate snapshots are tracked per price feed, products sharing one reuse its state.
    pub fn share_rate_import_key(&self) -> String {
        format!("price:feed:{}", self.price_feed_id_1)
    }
}

pub fn load_catalog(path: &Path) -> Result<Vec<Product>> {
    let file =
        std::fs::File::open(path).with_context(|| format!("Couldn't open catalog '{path}'"))?;
    let products: Vec<Product> = serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("Invalid product catalog '{path}'"))?;
    Ok(products)
}

/// Downloads the catalog from `url` into `path` unless a local copy already exists.
pub async fn fetch_catalog_if_missing(path: &Path, url: &str) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    info!(%url, %path, "Downloading product catalog");
    let products: Vec<Product> = reqwest::get(url)
        .await?
        .error_for_status()?
        .json()
        .await
        .with_context(|| format!("Invalid product catalog at '{url}'"))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, serde_json::to_vec_pretty(&products)?).await?;
    info!("Saved {} products", products.len());
    Ok(())
}
