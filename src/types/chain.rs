use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Arbitrum,
    Aurora,
    Avax,
    Bsc,
    Celo,
    Cronos,
    Emerald,
    Fantom,
    Fuse,
    Harmony,
    Heco,
    Metis,
    Moonbeam,
    Moonriver,
    Optimism,
    Polygon,
    Syscoin,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Arbitrum => "arbitrum",
            Chain::Aurora => "aurora",
            Chain::Avax => "avax",
            Chain::Bsc => "bsc",
            Chain::Celo => "celo",
            Chain::Cronos => "cronos",
            Chain::Emerald => "emerald",
            Chain::Fantom => "fantom",
            Chain::Fuse => "fuse",
            Chain::Harmony => "harmony",
            Chain::Heco => "heco",
            Chain::Metis => "metis",
            Chain::Moonbeam => "moonbeam",
            Chain::Moonriver => "moonriver",
            Chain::Optimism => "optimism",
            Chain::Polygon => "polygon",
            Chain::Syscoin => "syscoin",
        }
    }

    /// Largest block span a public RPC accepts for `eth_getLogs`.
    pub fn max_get_logs_block_span(&self) -> u64 {
        match self {
            // requested too many blocks, maximum is set to 2048
            Chain::Avax => 2048,
            // GetLogs query must be smaller than size 1024
            Chain::Harmony => 1024,
            _ => 3000,
        }
    }

    pub fn ms_per_block_estimate(&self) -> u64 {
        match self {
            Chain::Arbitrum => 2200,
            Chain::Aurora => 1000,
            Chain::Avax => 3400,
            Chain::Bsc => 3630,
            Chain::Celo => 4000,
            Chain::Cronos => 5840,
            Chain::Emerald => 10000,
            Chain::Fantom => 1900,
            Chain::Fuse => 5000,
            Chain::Harmony => 3000,
            Chain::Heco => 3000,
            Chain::Metis => 6000,
            Chain::Moonbeam => 3000,
            Chain::Moonriver => 13000,
            Chain::Optimism => 1500,
            Chain::Polygon => 2170,
            Chain::Syscoin => 100000,
        }
    }

    /// Estimated number of blocks produced during `period`.
    pub fn blocks_in(&self, period: Duration) -> u64 {
        period.as_millis() as u64 / self.ms_per_block_estimate()
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
