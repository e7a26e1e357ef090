#[macro_use]
pub mod util;

pub mod cli;
pub mod http_server;
pub mod import_state;
pub mod metrics;
pub mod optimizer;
pub mod pipeline;
pub mod ranges;
pub mod rpc;
pub mod storage;
pub mod types;
