mod common;

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tempfile::TempDir;

use polycopy::engine::{Engine, LeaderStatus};
use polycopy::models::Side;
use polycopy::state::{ControlAction, ControlCommand, ControlFile, StatePaths};

use common::{
    market, position, settings, trader, venue_trade, MockVenue, WALLET_A, WALLET_B,
};

const MARKET: &str = "0xcond";
const TOKEN: &str = "tok-1";

fn dec(n: i64) -> Decimal {
    Decimal::from(n)
}

/// Engine + mock wired for one leader with a $10k fully-deployed portfolio.
async fn engine_with_leader(state_dir: &TempDir) -> (Engine, Arc<MockVenue>) {
    let venue = Arc::new(MockVenue::new());
    venue.set_market(market(MARKET));
    venue.push_positions(WALLET_A, vec![position("other-token", 10_000, 10_000)]);

    let settings = settings(
        state_dir.path().to_str().unwrap(),
        vec![trader("alice", WALLET_A, 2000, true)],
    );
    let mut engine = Engine::new(settings, venue.clone());
    engine.sync_portfolios().await;

    // First tick baselines the monitor cursor; nothing is mirrored.
    engine.tick().await.unwrap();
    assert_eq!(venue.order_count(), 0);

    (engine, venue)
}

#[tokio::test]
async fn proportional_buy_places_scaled_mirror() {
    let dir = TempDir::new().unwrap();
    let (mut engine, venue) = engine_with_leader(&dir).await;

    // Leader buys 100 shares at $0.50: $50 notional, 0.5% of their $10k
    // portfolio. Mirror = 0.5% of $2000 = $10 -> 20 shares.
    let ts = Utc::now().timestamp() + 1;
    venue.push_trade(
        WALLET_A,
        venue_trade(MARKET, TOKEN, Side::Buy, 100, 50, ts, "0xbuy1"),
    );

    engine.tick().await.unwrap();

    let orders = venue.placed_orders.lock().unwrap().clone();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].side, Side::Buy);
    assert_eq!(orders[0].size, dec(20));
    assert_eq!(orders[0].price, Decimal::new(50, 2));

    let ledger = engine.ledger();
    assert_eq!(ledger.exposure_of(WALLET_A).await, dec(10));
    assert_eq!(ledger.global_exposure().await, dec(10));
    let pos = ledger.position_of(MARKET, TOKEN).await.unwrap();
    assert_eq!(pos.size, dec(20));
}

#[tokio::test]
async fn replayed_fill_is_mirrored_once() {
    let dir = TempDir::new().unwrap();
    let (mut engine, venue) = engine_with_leader(&dir).await;

    let ts = Utc::now().timestamp() + 1;
    venue.push_trade(
        WALLET_A,
        venue_trade(MARKET, TOKEN, Side::Buy, 100, 50, ts, "0xbuy1"),
    );

    engine.tick().await.unwrap();
    // The overlap window re-fetches the same trade on later ticks.
    engine.tick().await.unwrap();
    engine.tick().await.unwrap();

    assert_eq!(venue.order_count(), 1);
    assert_eq!(engine.ledger().exposure_of(WALLET_A).await, dec(10));
}

#[tokio::test]
async fn concurrent_leaders_cannot_jointly_breach_global_cap() {
    let dir = TempDir::new().unwrap();
    let venue = Arc::new(MockVenue::new());
    venue.set_market(market(MARKET));
    // Each leader's whole portfolio is one $1000 position.
    venue.push_positions(WALLET_A, vec![position("pa", 1000, 1000)]);
    venue.push_positions(WALLET_B, vec![position("pb", 1000, 1000)]);

    let mut settings = settings(
        dir.path().to_str().unwrap(),
        vec![
            trader("alice", WALLET_A, 3000, true),
            trader("bob", WALLET_B, 3000, true),
        ],
    );
    settings.risk_management.global.max_single_bet = dec(3000);
    settings.risk_management.per_trader.max_position_pct = Decimal::ONE;

    let mut engine = Engine::new(settings, venue.clone());
    engine.sync_portfolios().await;
    engine.tick().await.unwrap();

    // Both leaders go all-in simultaneously; each mirror sizes to $3000, but
    // the global cap is $5000, so exactly one is admitted.
    let ts = Utc::now().timestamp() + 1;
    venue.push_trade(
        WALLET_A,
        venue_trade(MARKET, "tok-a", Side::Buy, 2000, 50, ts, "0xa1"),
    );
    venue.push_trade(
        WALLET_B,
        venue_trade(MARKET, "tok-b", Side::Buy, 2000, 50, ts, "0xb1"),
    );

    engine.tick().await.unwrap();

    assert_eq!(venue.order_count(), 1);
    assert_eq!(engine.ledger().global_exposure().await, dec(3000));

    let exposure_a = engine.ledger().exposure_of(WALLET_A).await;
    let exposure_b = engine.ledger().exposure_of(WALLET_B).await;
    // Either leader may win the race, but only one is admitted.
    assert!(
        (exposure_a == dec(3000) && exposure_b == Decimal::ZERO)
            || (exposure_a == Decimal::ZERO && exposure_b == dec(3000))
    );
}

#[tokio::test]
async fn paused_leader_advances_cursor_without_mirroring() {
    let dir = TempDir::new().unwrap();
    let (mut engine, venue) = engine_with_leader(&dir).await;
    let paths = StatePaths::new(dir.path().to_str().unwrap());

    ControlFile::append(
        &paths.control(),
        ControlCommand {
            action: ControlAction::Pause,
            trader_name: Some("alice".into()),
            issued_at: Utc::now(),
        },
    )
    .unwrap();
    engine.apply_control_commands();
    assert_eq!(engine.leader_status(WALLET_A), Some(LeaderStatus::Paused));

    let ts = Utc::now().timestamp() + 1;
    venue.push_trade(
        WALLET_A,
        venue_trade(MARKET, TOKEN, Side::Buy, 100, 50, ts, "0xbuy1"),
    );
    engine.tick().await.unwrap();

    assert_eq!(venue.order_count(), 0);
    assert_eq!(engine.ledger().exposure_of(WALLET_A).await, Decimal::ZERO);

    // After resume, the fill observed while paused is not replayed.
    ControlFile::append(
        &paths.control(),
        ControlCommand {
            action: ControlAction::Resume,
            trader_name: Some("alice".into()),
            issued_at: Utc::now(),
        },
    )
    .unwrap();
    engine.apply_control_commands();
    assert_eq!(engine.leader_status(WALLET_A), Some(LeaderStatus::Enabled));

    engine.tick().await.unwrap();
    assert_eq!(venue.order_count(), 0);

    // A fill made after the resume is mirrored normally.
    venue.push_trade(
        WALLET_A,
        venue_trade(MARKET, TOKEN, Side::Buy, 100, 50, ts + 2, "0xbuy2"),
    );
    engine.tick().await.unwrap();
    assert_eq!(venue.order_count(), 1);
}

#[tokio::test]
async fn leader_sell_reduces_mirror_proportionally() {
    let dir = TempDir::new().unwrap();
    let venue = Arc::new(MockVenue::new());
    venue.set_market(market(MARKET));
    venue.set_midpoint(TOKEN, Decimal::new(50, 2));
    // First sync: leader holds 100 shares of TOKEN in a $10k portfolio.
    venue.push_positions(
        WALLET_A,
        vec![position(TOKEN, 100, 50), position("other-token", 10_000, 9950)],
    );

    let settings = settings(
        dir.path().to_str().unwrap(),
        vec![trader("alice", WALLET_A, 2000, true)],
    );
    let mut engine = Engine::new(settings, venue.clone());
    engine.sync_portfolios().await;
    engine.tick().await.unwrap(); // baseline

    // Leader buys 100 more shares: mirrored as in the proportional case.
    let buy_ts = Utc::now().timestamp() + 1;
    venue.push_trade(
        WALLET_A,
        venue_trade(MARKET, TOKEN, Side::Buy, 100, 50, buy_ts, "0xbuy1"),
    );
    engine.tick().await.unwrap();
    assert_eq!(venue.order_count(), 1);
    let mirror_before = engine.ledger().position_of(MARKET, TOKEN).await.unwrap();
    assert_eq!(mirror_before.size, dec(20));

    // Leader sells half their holding. The post-sell snapshot (50 of 100
    // shares) lands before the SELL is sized.
    let sell_ts = Utc::now().timestamp() + 1;
    venue.push_trade(
        WALLET_A,
        venue_trade(MARKET, TOKEN, Side::Sell, 50, 50, sell_ts, "0xsell1"),
    );
    venue.push_positions(
        WALLET_A,
        vec![position(TOKEN, 50, 25), position("other-token", 10_000, 9975)],
    );

    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    engine.sync_portfolios().await;
    engine.tick().await.unwrap();

    let orders = venue.placed_orders.lock().unwrap().clone();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[1].side, Side::Sell);
    assert_eq!(orders[1].size, dec(10));

    let pos = engine.ledger().position_of(MARKET, TOKEN).await.unwrap();
    assert_eq!(pos.size, dec(10));
    assert_eq!(engine.ledger().exposure_of(WALLET_A).await, dec(5));
}

#[tokio::test]
async fn transient_order_failure_is_retried() {
    let dir = TempDir::new().unwrap();
    let (mut engine, venue) = engine_with_leader(&dir).await;

    venue.fail_next_order(polycopy::errors::VenueError::Transient("503".into()));

    let ts = Utc::now().timestamp() + 1;
    venue.push_trade(
        WALLET_A,
        venue_trade(MARKET, TOKEN, Side::Buy, 100, 50, ts, "0xbuy1"),
    );
    engine.tick().await.unwrap();

    // The retry after the transient failure succeeds.
    assert_eq!(venue.order_count(), 1);
    assert_eq!(engine.ledger().exposure_of(WALLET_A).await, dec(10));
}

#[tokio::test]
async fn rejected_fill_leaves_ledger_unchanged_and_is_final() {
    let dir = TempDir::new().unwrap();
    let venue = Arc::new(MockVenue::new());
    venue.set_market(market(MARKET));
    // Empty portfolio: every BUY is rejected as unknown/too small.
    venue.push_positions(WALLET_A, vec![]);

    let settings = settings(
        dir.path().to_str().unwrap(),
        vec![trader("alice", WALLET_A, 2000, true)],
    );
    let mut engine = Engine::new(settings, venue.clone());
    engine.sync_portfolios().await;
    engine.tick().await.unwrap();

    let ts = Utc::now().timestamp() + 1;
    venue.push_trade(
        WALLET_A,
        venue_trade(MARKET, TOKEN, Side::Buy, 100, 50, ts, "0xbuy1"),
    );
    engine.tick().await.unwrap();

    assert_eq!(venue.order_count(), 0);
    assert_eq!(engine.ledger().global_exposure().await, Decimal::ZERO);
    // The verdict is final: the fill id is in the processed set.
    assert!(engine.ledger().is_processed(&format!("tx:0xbuy1:{TOKEN}:BUY")).await);
}

#[tokio::test]
async fn state_files_survive_restart() {
    let dir = TempDir::new().unwrap();
    let (mut engine, venue) = engine_with_leader(&dir).await;

    let ts = Utc::now().timestamp() + 1;
    venue.push_trade(
        WALLET_A,
        venue_trade(MARKET, TOKEN, Side::Buy, 100, 50, ts, "0xbuy1"),
    );
    engine.tick().await.unwrap();
    engine.persist_state().await;

    // A fresh engine over the same state directory restores exposure.
    let settings2 = settings(
        dir.path().to_str().unwrap(),
        vec![trader("alice", WALLET_A, 2000, true)],
    );
    let venue2 = Arc::new(MockVenue::new());
    venue2.set_market(market(MARKET));
    venue2.push_positions(WALLET_A, vec![position("other-token", 10_000, 10_000)]);
    let engine2 = Engine::new(settings2, venue2);

    let paths = StatePaths::new(dir.path().to_str().unwrap());
    let snapshot: polycopy::execution::LedgerSnapshot =
        polycopy::state::read_json(&paths.ledger()).unwrap();
    engine2.ledger().restore(snapshot).await;

    assert_eq!(engine2.ledger().exposure_of(WALLET_A).await, dec(10));
    assert_eq!(
        engine2.ledger().position_of(MARKET, TOKEN).await.unwrap().size,
        dec(20)
    );
}
