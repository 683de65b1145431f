use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt};

use aleph_dispatch::core::{Position, PositionSide, Signal, Symbol, Timeframe};
use aleph_dispatch::message::{BacktestFinished, PositionStateRequest};
use aleph_dispatch::{
    ActorRuntime, Config, EventDispatcher, ManagedActor, Payload, PositionActor, PositionState,
    SystemState, TradingSystem,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load_default();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},aleph_dispatch=debug", config.app.log_level)));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    tracing::info!("Aleph dispatch starting...");

    let dispatcher = EventDispatcher::new(&config);
    let system = TradingSystem::new(dispatcher.clone());

    let symbol = Symbol::new("BTCUSDT");
    let timeframe = Timeframe::H1;
    let position_actor = Arc::new(ActorRuntime::new(
        PositionActor::new(symbol.clone(), timeframe, dispatcher.clone()),
        dispatcher.clone(),
    ));

    let runner = {
        let system = system.clone();
        tokio::spawn(async move { system.run().await })
    };

    system.deploy(position_actor.clone() as Arc<dyn ManagedActor>)?;
    while system.state() != SystemState::Trading {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // One long position through its whole lifecycle
    let signal = Signal::new(
        symbol.clone(),
        timeframe,
        PositionSide::Long,
        Decimal::from(64_000),
        Decimal::new(25, 2),
    )
    .with_strategy("demo");
    let confirmed = Position::from_signal(signal.clone()).open(signal.entry_price, signal.size);

    let script = [
        Payload::GoLongSignalReceived(signal),
        Payload::BrokerPositionOpened(confirmed.clone()),
        Payload::BacktestEnded(BacktestFinished {
            symbol: symbol.clone(),
            timeframe,
            exit_price: Decimal::from(65_200),
        }),
        Payload::BrokerPositionClosed(confirmed.close(Decimal::from(65_200))),
    ];

    for payload in script {
        dispatcher.publish(payload).await?;
        dispatcher.wait().await;

        let state: PositionState = position_actor
            .ask(Payload::GetPositionState(PositionStateRequest {
                symbol: symbol.clone(),
                timeframe,
                side: PositionSide::Long,
            }))
            .await?;
        tracing::info!("{} {} LONG -> {:?}", symbol, timeframe, state);
    }

    let states: Vec<_> = position_actor
        .actor()
        .machine()
        .snapshot()
        .into_iter()
        .map(|(key, state)| (key.to_string(), state))
        .collect();
    println!("{}", serde_json::to_string_pretty(&states)?);

    let dead_letters = dispatcher.dead_letters();
    tracing::info!("Dead letters: {}", dead_letters.len());
    for letter in &dead_letters {
        tracing::warn!("{} failed at {}: {}", letter.message, letter.failed_at, letter.error);
    }

    system.stop()?;
    runner.await??;
    dispatcher.shutdown().await;

    tracing::info!("Aleph dispatch stopped");
    Ok(())
}
