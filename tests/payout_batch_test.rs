//! 结算批处理集成测试
//!
//! ```bash
//! TEST_DATABASE_URL=postgres://... cargo test --test payout_batch_test -- --ignored --test-threads=1
//! ```

mod common;

use common::{seed_merchant, test_app, TestApp};
use dotgate::{
    domain::{IntentStatus, PayoutStatus},
    repository::PayoutRepository,
    service::{chain_client::EscrowEvent, intent_engine::CreateIntentParams},
};
use rust_decimal::Decimal;
use uuid::Uuid;

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

/// 走完一整条成功链路，让意图挂入商户的待结算聚合
async fn succeed_intent(app: &TestApp, merchant_id: Uuid, payment_id: i64) -> Uuid {
    let intent = app
        .state
        .engine
        .create(
            merchant_id,
            CreateIntentParams {
                fiat_amount: 10_000,
                fiat_currency: "usd".to_string(),
                crypto_currency: "dot".to_string(),
                release_method: None,
                metadata: None,
            },
        )
        .await
        .unwrap();

    for event in [
        EscrowEvent::PaymentCreated {
            payment_id,
            merchant: "0x2222222222222222222222222222222222222222".to_string(),
            amount: 20_000_000_000_000_000_000,
            fee_bps: 250,
        },
        EscrowEvent::Deposited {
            payment_id,
            from: "0x3333333333333333333333333333333333333333".to_string(),
            amount: 20_000_000_000_000_000_000,
        },
    ] {
        let observed = if matches!(event, EscrowEvent::PaymentCreated { .. }) {
            app.chain
                .emit_with_tx(event, intent.escrow_creation_tx.as_deref().unwrap())
        } else {
            app.chain.emit(event)
        };
        app.state.engine.on_chain_event(&observed).await.unwrap();
    }

    let released = app.chain.emit(EscrowEvent::PaymentReleased {
        payment_id,
        to: "0x2222222222222222222222222222222222222222".to_string(),
        amount: 19_500_000_000_000_000_000,
        fee: 500_000_000_000_000_000,
    });
    app.state.engine.on_chain_event(&released).await.unwrap();

    let current = app
        .state
        .intents
        .find_by_id(intent.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, IntentStatus::Succeeded);
    intent.id
}

#[tokio::test]
#[ignore]
async fn released_intents_accumulate_into_single_payout() {
    let app = test_app().await;
    let (merchant_id, _) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;

    let a = succeed_intent(&app, merchant_id, 101).await;
    let b = succeed_intent(&app, merchant_id, 102).await;

    let payouts = PayoutRepository::new(app.pool.clone())
        .find_pending_for_merchant(merchant_id)
        .await
        .unwrap();
    assert_eq!(payouts.len(), 1);
    let payout = &payouts[0];
    assert_eq!(payout.intent_ids.len(), 2);
    assert!(payout.intent_ids.contains(&a) && payout.intent_ids.contains(&b));
    // 两笔 20 DOT @ 250bps
    assert_eq!(payout.gross, dec("40"));
    assert_eq!(payout.fee, dec("1"));
    assert_eq!(payout.net, dec("39"));
}

#[tokio::test]
#[ignore]
async fn batch_transfers_net_and_marks_sent() {
    let app = test_app().await;
    let (merchant_id, _) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;
    succeed_intent(&app, merchant_id, 111).await;

    let settled = app.state.payout_service.run_batch().await.unwrap();
    assert_eq!(settled, 1);

    // 净额 19.5 DOT 以原生单位转给商户钱包
    let transfers = app.chain.transfer_calls();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].1, 19_500_000_000_000_000_000);

    let payouts: Vec<(String, Option<String>)> = sqlx::query_as(
        "SELECT status, tx_hash FROM payouts WHERE merchant_id = $1",
    )
    .bind(merchant_id)
    .fetch_all(&app.pool)
    .await
    .unwrap();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].0, PayoutStatus::Sent.as_str());
    assert!(payouts[0].1.is_some());

    // 商户结算时间戳被推进，下一轮批处理不再重复转账
    let again = app.state.payout_service.run_batch().await.unwrap();
    assert_eq!(again, 0);
    assert_eq!(app.chain.transfer_calls().len(), 1);
}

#[tokio::test]
#[ignore]
async fn payout_below_threshold_is_held_back() {
    let app = test_app().await;
    let (merchant_id, _) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;
    sqlx::query("UPDATE merchants SET min_payout_amount = 100 WHERE id = $1")
        .bind(merchant_id)
        .execute(&app.pool)
        .await
        .unwrap();

    succeed_intent(&app, merchant_id, 121).await;

    let settled = app.state.payout_service.run_batch().await.unwrap();
    assert_eq!(settled, 0);
    assert!(app.chain.transfer_calls().is_empty());

    let payouts = PayoutRepository::new(app.pool.clone())
        .find_pending_for_merchant(merchant_id)
        .await
        .unwrap();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].status, PayoutStatus::Pending);
}

#[tokio::test]
#[ignore]
async fn manual_schedule_is_excluded_from_batches() {
    let app = test_app().await;
    let (merchant_id, _) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;
    sqlx::query("UPDATE merchants SET payout_schedule = 'manual' WHERE id = $1")
        .bind(merchant_id)
        .execute(&app.pool)
        .await
        .unwrap();

    succeed_intent(&app, merchant_id, 131).await;

    let settled = app.state.payout_service.run_batch().await.unwrap();
    assert_eq!(settled, 0);
    assert!(app.chain.transfer_calls().is_empty());
}
