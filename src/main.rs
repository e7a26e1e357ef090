// Vault importer, an investment history importer for yield vaults.
// Copyright (C) 2024 The vault-importer contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::borrow::Cow;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::FutureExt;
use prometheus_client::metrics::info::Info;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use vault_importer::cli::Args;
use vault_importer::http_server::{Server as HttpServer, Status};
use vault_importer::import_state::storage::SqliteImportStateStore;
use vault_importer::metrics;
use vault_importer::pipeline::{
    runner::Runner, share_rate::SnapshotRunner, Pipeline, Sources, TracingErrorSink,
};
use vault_importer::rpc::RpcClient;
use vault_importer::run_all;
use vault_importer::storage::sqlite::SqliteRecordSink;
use vault_importer::types::product::{fetch_catalog_if_missing, load_catalog};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn setup_tracing(args: &Args) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::builder().parse_lossy(
        std::env::var(tracing_subscriber::EnvFilter::DEFAULT_ENV).unwrap_or("info".to_string()),
    );
    let fmt = tracing_subscriber::fmt::layer()
        .compact()
        .with_span_events(if args.log_span_durations {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        })
        .with_filter(env_filter);
    tracing_subscriber::registry()
        .with(fmt)
        .with(sentry::integrations::tracing::layer())
        .try_init()?;
    Ok(())
}

fn setup_sentry(args: &Args) -> Option<sentry::ClientInitGuard> {
    args.sentry_dsn.as_ref().map(|dsn| {
        sentry::init((
            dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                environment: Some(args.chain.as_str().into()),
                traces_sample_rate: args.sentry_traces_sample_rate,
                ..Default::default()
            },
        ))
    })
}

fn create_cancellation_token() -> Result<CancellationToken> {
    use tokio::signal::unix::{signal, SignalKind};

    let token = CancellationToken::new();
    let copy = token.clone();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select!(
            _ = sigint.recv() => {
                copy.cancel();
            },
            _ = sigterm.recv() => {
                copy.cancel();
            },
        );
    });
    Ok(token)
}

async fn run(args: Args) -> anyhow::Result<()> {
    setup_tracing(&args)?;
    let _sentry_guard = setup_sentry(&args);

    if let Some(url) = &args.products_url {
        fetch_catalog_if_missing(&args.products, url).await?;
    }
    let products = load_catalog(&args.products)?
        .into_iter()
        .filter(|product| product.chain == args.chain)
        .collect::<Vec<_>>();
    tracing::info!(chain = %args.chain, "Loaded {} products", products.len());

    tokio::fs::create_dir_all(&args.data_dir)
        .await
        .with_context(|| format!("Couldn't create data dir '{}'", args.data_dir))?;
    let states = SqliteImportStateStore::new(args.data_dir.join("import_state.db").as_str())
        .await
        .context("Couldn't open import state database")?;
    let states = Arc::new(states);
    let records = SqliteRecordSink::new(args.data_dir.join("records.db").as_str())
        .await
        .context("Couldn't open records database")?;
    let records = Arc::new(records);

    let client = Arc::new(RpcClient::new(&args.rpc_url, args.rpc_limiter())?);
    let sources = Sources::from_client(client);
    let cancellation_token = create_cancellation_token()?;
    let (status, runner_fut) = match args.pipeline {
        Pipeline::Investments => {
            let runner = Arc::new(Runner::new(
                args.runner_config(),
                sources,
                states,
                records,
                Arc::new(TracingErrorSink),
            ));
            let cancellation_token = cancellation_token.child_token();
            let fut = {
                let runner = runner.clone();
                async move { runner.run(products, cancellation_token).await }.boxed_local()
            };
            (runner as Arc<dyn Status>, fut)
        }
        Pipeline::ShareRates => {
            let runner = Arc::new(SnapshotRunner::new(
                args.snapshot_config(),
                sources,
                states.clone(),
                states,
                records,
                Arc::new(TracingErrorSink),
            ));
            let cancellation_token = cancellation_token.child_token();
            let fut = {
                let runner = runner.clone();
                async move { runner.run(products, cancellation_token).await }.boxed_local()
            };
            (runner as Arc<dyn Status>, fut)
        }
    };

    let info = Info::new(vec![(
        "version".to_owned(),
        env!("CARGO_PKG_VERSION").to_owned(),
    )]);
    let mut metrics_registry = prometheus_client::registry::Registry::with_labels(
        [(Cow::Borrowed("chain"), Cow::Borrowed(args.chain.as_str()))].into_iter(),
    );
    metrics::register_metrics(&mut metrics_registry, info);

    let (_, server_result) = run_all!(
        cancellation_token,
        runner_fut,
        tokio::spawn(
            HttpServer::new(status, args.chain, metrics_registry)
                .run(args.prometheus_port, cancellation_token.child_token())
        ),
    );
    server_result??;

    tracing::info!("Shutting down");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(args))
}
