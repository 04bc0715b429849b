mod candle_store;
mod command;
mod config;
mod csv_io;
mod error;
mod gate_rest;
mod gate_ws;
mod indicators;
mod journal;
mod logging;
mod pair_store;
mod server;
mod subscription;
mod tables;
mod tui;
mod workers;

use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tokio::task;
use tracing::{error, info};

use crate::candle_store::CandleStore;
use crate::command::{Command, TradingCommand};
use crate::config::{Cli, DEFAULT_PAIRS, DashboardParams, IndicatorParams, Mode, ServeParams};
use crate::gate_rest::RestClient;
use crate::gate_ws::GateWsClient;
use crate::indicators::IndicatorRunner;
use crate::journal::{ERROR_LOG_FILE, ErrorJournal, ORDER_LOG_FILE, OrderJournal};
use crate::pair_store::PairStore;
use crate::server::{AppState, CandleWriter};
use crate::subscription::{PairChannel, SubscriptionManager};
use crate::tui::{DashboardLinks, TuiApp};
use crate::workers::{BalancePoller, OrderExecutor, PairController};

const BUS_CAPACITY: usize = 1024;
const JOURNAL_ENTRIES: usize = 512;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // API_KEY and API_SECRET may come from a local .env file.
    dotenv::dotenv().ok();
    match Cli::parse().into_mode() {
        Mode::Dashboard(params) => run_dashboard(params).await,
        Mode::Serve(params) => run_server(params).await,
        Mode::Indicators(params) => run_indicators(params).await,
    }
}

/// Stored pairs plus the ones named on the command line, written back so the
/// store stays the single list both modes share.
async fn initial_pairs(store: &Arc<PairStore>, cli_pairs: &[String]) -> anyhow::Result<Vec<String>> {
    let store = Arc::clone(store);
    let cli_pairs = cli_pairs.to_vec();
    task::spawn_blocking(move || {
        let mut pairs = store.load()?;
        let mut requested: Vec<String> = cli_pairs
            .iter()
            .filter_map(|raw| config::normalize_pair(raw))
            .collect();
        if pairs.is_empty() && requested.is_empty() {
            requested = DEFAULT_PAIRS.iter().map(|p| p.to_string()).collect();
        }
        for pair in requested {
            if store.insert(&pair)? {
                pairs.push(pair);
            }
        }
        Ok::<_, anyhow::Error>(pairs)
    })
    .await
    .context("pair store task panicked")?
}

fn spawn_exit_on_ctrl_c(exit_tx: broadcast::Sender<()>) {
    task::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = exit_tx.send(());
        }
    });
}

async fn run_dashboard(param: DashboardParams) -> anyhow::Result<()> {
    logging::init_file(&param.log_file)?;
    let credentials = param.credentials()?;
    let store = Arc::new(PairStore::open(&param.pairs_db)?);
    let pairs = initial_pairs(&store, &param.pairs).await?;
    info!(pairs = ?pairs, "starting dashboard");

    let (tx, mut rx) = broadcast::channel::<Command>(BUS_CAPACITY);
    let (exit_tx, _) = broadcast::channel::<()>(1);
    let rest = RestClient::new(Some(&credentials))?;

    let (control_tx, control_rx) = mpsc::channel(32);
    let manager = SubscriptionManager::new(vec![PairChannel::Tickers], &pairs);
    let ws = GateWsClient::new(tx.clone(), param.reconnect.policy())?
        .with_balance_updates(rest.signer().cloned());
    let ws_exit = exit_tx.subscribe();
    let ws_tx = tx.clone();
    task::spawn(async move {
        if let Err(err) = ws.run(manager, control_rx, ws_exit).await {
            let _ = ws_tx.send(Command::Error(format!("gate.io websocket error: {err:#}")));
        }
    });

    let poller = BalancePoller::new(
        rest.clone(),
        tx.clone(),
        param.balance_interval(),
        param.with_margin,
    );
    let poller_exit = exit_tx.subscribe();
    let poller_tx = tx.clone();
    task::spawn(async move {
        if let Err(err) = poller.run(poller_exit).await {
            let _ = poller_tx.send(Command::Error(format!("balance poller error: {err:#}")));
        }
    });

    let order_log = OrderJournal::new(ORDER_LOG_FILE, JOURNAL_ENTRIES);
    let (order_tx, order_rx) = mpsc::channel::<TradingCommand>(32);
    let executor = OrderExecutor::new(rest.clone(), tx.clone(), order_log.clone());
    let executor_exit = exit_tx.subscribe();
    let executor_tx = tx.clone();
    task::spawn(async move {
        if let Err(err) = executor.run(order_rx, executor_exit).await {
            let _ = executor_tx.send(Command::Error(format!("order executor error: {err:#}")));
        }
    });

    let links = DashboardLinks {
        pairs: PairController::new(rest, Arc::clone(&store), control_tx, tx.clone()),
        orders: order_tx,
        bus: tx.clone(),
        order_log,
        error_log: ErrorJournal::new(ERROR_LOG_FILE, JOURNAL_ENTRIES),
        export_path: param.export_path.clone(),
    };
    let mut app = TuiApp::new(links, &pairs, param.min_balance);
    app.preload_order_log();
    let mut app_exit = exit_tx.subscribe();
    let app_result = tokio::select! {
        result = app.run(&mut rx, &mut app_exit) => result,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };
    let _ = exit_tx.send(());
    app.dispose();
    info!("dashboard closed");
    app_result.map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

async fn run_server(param: ServeParams) -> anyhow::Result<()> {
    logging::init_stderr()?;
    let store = Arc::new(PairStore::open(&param.pairs_db)?);
    let candles = Arc::new(CandleStore::open(&param.candles_db)?);
    let pairs = initial_pairs(&store, &param.pairs).await?;

    let (tx, _) = broadcast::channel::<Command>(BUS_CAPACITY);
    let (exit_tx, _) = broadcast::channel::<()>(1);

    let writer = CandleWriter::new(Arc::clone(&candles), tx.subscribe(), param.persist_partial);
    let (control_tx, control_rx) = mpsc::channel(32);
    let manager = SubscriptionManager::new(param.channels(), &pairs);
    let ws = GateWsClient::new(tx.clone(), param.reconnect.policy())?;
    let ws_exit = exit_tx.subscribe();
    task::spawn(async move {
        if let Err(err) = ws.run(manager, control_rx, ws_exit).await {
            error!("gate.io websocket stopped: {err:#}");
        }
    });

    let writer_exit = exit_tx.subscribe();
    let writer_task = task::spawn(async move {
        if let Err(err) = writer.run(writer_exit).await {
            error!("candle writer stopped: {err:#}");
        }
    });

    let state = AppState {
        pairs: PairController::new(RestClient::new(None)?, store, control_tx, tx.clone()),
        candles,
        default_timeframe: param.interval.clone(),
    };
    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(param.listen)
        .await
        .with_context(|| format!("binding {}", param.listen))?;
    info!("listening on {}, recording {} pairs", param.listen, pairs.len());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("http server failed")?;

    info!("shutting down");
    let _ = exit_tx.send(());
    let _ = writer_task.await;
    Ok(())
}

async fn run_indicators(param: IndicatorParams) -> anyhow::Result<()> {
    logging::init_stderr()?;
    let (exit_tx, exit_rx) = broadcast::channel::<()>(1);
    spawn_exit_on_ctrl_c(exit_tx);
    IndicatorRunner::new(param)?.run(exit_rx).await
}
