//! 支付意图生命周期集成测试
//!
//! 内存链 + 真实 Postgres。ingest_cursor 是全局单行，必须串行运行：
//! ```bash
//! TEST_DATABASE_URL=postgres://... cargo test --test intent_lifecycle_test -- --ignored --test-threads=1
//! ```

mod common;

use chrono::Utc;
use common::{seed_merchant, test_app, TestApp, WebhookSink};
use dotgate::{
    domain::{IntentStatus, WebhookDeliveryStatus, WebhookEventType},
    repository::{PayoutRepository, WebhookRepository},
    service::{
        chain_client::{ChainClient as _, EscrowEvent},
        intent_engine::{CreateIntentParams, EngineError},
    },
};
use rust_decimal::Decimal;
use uuid::Uuid;

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn create_params(amount: i64) -> CreateIntentParams {
    CreateIntentParams {
        fiat_amount: amount,
        fiat_currency: "usd".to_string(),
        crypto_currency: "dot".to_string(),
        release_method: None,
        metadata: None,
    }
}

/// 把意图推进到 PROCESSING（创建 + PaymentCreated + Deposited 直达引擎）
async fn to_processing(
    app: &TestApp,
    merchant_id: Uuid,
    payment_id: i64,
) -> dotgate::domain::PaymentIntent {
    let intent = app
        .state
        .engine
        .create(merchant_id, create_params(10_000))
        .await
        .unwrap();

    let created = app.chain.emit_with_tx(
        EscrowEvent::PaymentCreated {
            payment_id,
            merchant: "0x2222222222222222222222222222222222222222".to_string(),
            amount: 20_000_000_000_000_000_000,
            fee_bps: 250,
        },
        intent.escrow_creation_tx.as_deref().unwrap(),
    );
    app.state.engine.on_chain_event(&created).await.unwrap();

    let deposited = app.chain.emit(EscrowEvent::Deposited {
        payment_id,
        from: "0x3333333333333333333333333333333333333333".to_string(),
        amount: 20_000_000_000_000_000_000,
    });
    app.state.engine.on_chain_event(&deposited).await.unwrap();

    let refreshed = app
        .state
        .intents
        .find_by_id(intent.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.status, IntentStatus::Processing);
    refreshed
}

#[tokio::test]
#[ignore]
async fn create_quotes_and_submits_escrow_creation() {
    let app = test_app().await;
    let (merchant_id, _) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;

    // 100.00 USD @ 5.00 USD/DOT
    let intent = app
        .state
        .engine
        .create(merchant_id, create_params(10_000))
        .await
        .unwrap();

    assert_eq!(intent.status, IntentStatus::RequiresPayment);
    assert_eq!(intent.crypto_amount, dec("20"));
    assert_eq!(
        intent.api_view()["crypto_amount"],
        "20.000000000000000000"
    );
    assert_eq!(intent.quote_rate, dec("5.00"));
    assert_eq!(intent.deposit_address, common::TEST_ESCROW);
    assert!(intent.escrow_creation_tx.is_some());
    assert!(intent.escrow_payment_id.is_none());
    assert!(intent.expires_at > intent.created_at);

    // 链上调用携带原生单位金额与商户费率
    let calls = app.chain.create_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, 20_000_000_000_000_000_000);
    assert_eq!(calls[0].2, 250);
}

#[tokio::test]
#[ignore]
async fn happy_path_manual_release_via_ingestor() {
    let app = test_app().await;
    let sink = WebhookSink::spawn(200).await;
    let (merchant_id, _) = seed_merchant(&app.pool, &sink.url, 250).await;
    common::reset_cursor(&app).await;

    let intent = app
        .state
        .engine
        .create(merchant_id, create_params(10_000))
        .await
        .unwrap();

    // PaymentCreated -> 回填 escrow_payment_id，状态不变
    app.chain.emit_with_tx(
        EscrowEvent::PaymentCreated {
            payment_id: 1,
            merchant: "0x2222222222222222222222222222222222222222".to_string(),
            amount: 20_000_000_000_000_000_000,
            fee_bps: 250,
        },
        intent.escrow_creation_tx.as_deref().unwrap(),
    );
    app.state.ingestor.tick().await.unwrap();

    let current = app
        .state
        .intents
        .find_by_id(intent.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.escrow_payment_id, Some(1));
    assert_eq!(current.status, IntentStatus::RequiresPayment);

    // Deposited -> PROCESSING + payment.processing
    app.chain.emit(EscrowEvent::Deposited {
        payment_id: 1,
        from: "0x3333333333333333333333333333333333333333".to_string(),
        amount: 20_000_000_000_000_000_000,
    });
    app.state.ingestor.tick().await.unwrap();

    let current = app
        .state
        .intents
        .find_by_id(intent.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, IntentStatus::Processing);

    // 手动确认 -> 只提交 release，不提前置成功
    let confirmed = app
        .state
        .engine
        .confirm(merchant_id, intent.id)
        .await
        .unwrap();
    assert_eq!(confirmed.status, IntentStatus::Processing);
    assert_eq!(app.chain.release_calls(), vec![1]);
    assert!(confirmed.release_tx.is_some());

    // PaymentReleased -> SUCCEEDED + payment.succeeded + 结算挂账
    app.chain.emit(EscrowEvent::PaymentReleased {
        payment_id: 1,
        to: "0x2222222222222222222222222222222222222222".to_string(),
        amount: 19_500_000_000_000_000_000,
        fee: 500_000_000_000_000_000,
    });
    app.state.ingestor.tick().await.unwrap();

    let current = app
        .state
        .intents
        .find_by_id(intent.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, IntentStatus::Succeeded);
    assert!(current.payout_id.is_some());

    let payout = PayoutRepository::new(app.pool.clone())
        .find_by_id(current.payout_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payout.gross, dec("20"));
    assert_eq!(payout.fee, dec("0.5"));
    assert_eq!(payout.net, dec("19.5"));
    assert!(payout.intent_ids.contains(&intent.id));

    // 每次终态转换恰好一条对应的 webhook 事件
    let events = WebhookRepository::new(app.pool.clone())
        .find_for_intent(intent.id)
        .await
        .unwrap();
    let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            WebhookEventType::PaymentProcessing,
            WebhookEventType::PaymentSucceeded
        ]
    );
}

#[tokio::test]
#[ignore]
async fn expiration_without_deposit_cancels_on_chain() {
    let app = test_app().await;
    let (merchant_id, _) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;

    let intent = app
        .state
        .engine
        .create(merchant_id, create_params(10_000))
        .await
        .unwrap();

    let created = app.chain.emit_with_tx(
        EscrowEvent::PaymentCreated {
            payment_id: 7,
            merchant: "0x2222222222222222222222222222222222222222".to_string(),
            amount: 20_000_000_000_000_000_000,
            fee_bps: 250,
        },
        intent.escrow_creation_tx.as_deref().unwrap(),
    );
    app.state.engine.on_chain_event(&created).await.unwrap();

    // 过保持窗口，链上未入金
    sqlx::query("UPDATE payment_intents SET expires_at = now() - interval '1 minute' WHERE id = $1")
        .bind(intent.id)
        .execute(&app.pool)
        .await
        .unwrap();

    app.state.engine.expire(intent.id).await.unwrap();
    assert_eq!(app.chain.cancel_calls(), vec![7]);

    // 仍等合约事件终结
    let current = app
        .state
        .intents
        .find_by_id(intent.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, IntentStatus::RequiresPayment);

    let canceled = app.chain.emit(EscrowEvent::PaymentCanceled { payment_id: 7 });
    app.state.engine.on_chain_event(&canceled).await.unwrap();

    let current = app
        .state
        .intents
        .find_by_id(intent.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, IntentStatus::Canceled);

    let events = WebhookRepository::new(app.pool.clone())
        .find_for_intent(intent.id)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, WebhookEventType::PaymentCanceled);
}

#[tokio::test]
#[ignore]
async fn expiration_without_escrow_is_terminal_locally() {
    let app = test_app().await;
    let (merchant_id, _) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;

    let intent = app
        .state
        .engine
        .create(merchant_id, create_params(10_000))
        .await
        .unwrap();

    // PaymentCreated 一直没被观测到（交易丢失）
    sqlx::query("UPDATE payment_intents SET expires_at = now() - interval '1 minute' WHERE id = $1")
        .bind(intent.id)
        .execute(&app.pool)
        .await
        .unwrap();

    app.state.engine.expire(intent.id).await.unwrap();

    let current = app
        .state
        .intents
        .find_by_id(intent.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, IntentStatus::Expired);
    assert!(app.chain.cancel_calls().is_empty());
}

#[tokio::test]
#[ignore]
async fn late_deposit_defers_expiration_to_auto_release() {
    let app = test_app().await;
    let (merchant_id, _) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;

    let intent = app
        .state
        .engine
        .create(merchant_id, create_params(10_000))
        .await
        .unwrap();
    let created = app.chain.emit_with_tx(
        EscrowEvent::PaymentCreated {
            payment_id: 9,
            merchant: "0x2222222222222222222222222222222222222222".to_string(),
            amount: 20_000_000_000_000_000_000,
            fee_bps: 250,
        },
        intent.escrow_creation_tx.as_deref().unwrap(),
    );
    app.state.engine.on_chain_event(&created).await.unwrap();

    // 合约报告已入金，但 Deposited 事件还没到
    app.chain.set_deposited(9, 20_000_000_000_000_000_000);
    sqlx::query("UPDATE payment_intents SET expires_at = now() - interval '1 minute' WHERE id = $1")
        .bind(intent.id)
        .execute(&app.pool)
        .await
        .unwrap();

    app.state.engine.expire(intent.id).await.unwrap();

    // 不取消、不推进：留给入金事件与自动释放
    assert!(app.chain.cancel_calls().is_empty());
    let current = app
        .state
        .intents
        .find_by_id(intent.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, IntentStatus::RequiresPayment);
}

#[tokio::test]
#[ignore]
async fn auto_release_after_hold_window() {
    let app = test_app().await;
    let (merchant_id, _) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;

    let intent = app
        .state
        .engine
        .create(
            merchant_id,
            CreateIntentParams {
                release_method: Some("auto".to_string()),
                ..create_params(10_000)
            },
        )
        .await
        .unwrap();

    let created = app.chain.emit_with_tx(
        EscrowEvent::PaymentCreated {
            payment_id: 11,
            merchant: "0x2222222222222222222222222222222222222222".to_string(),
            amount: 20_000_000_000_000_000_000,
            fee_bps: 250,
        },
        intent.escrow_creation_tx.as_deref().unwrap(),
    );
    app.state.engine.on_chain_event(&created).await.unwrap();
    let deposited = app.chain.emit(EscrowEvent::Deposited {
        payment_id: 11,
        from: "0x3333333333333333333333333333333333333333".to_string(),
        amount: 20_000_000_000_000_000_000,
    });
    app.state.engine.on_chain_event(&deposited).await.unwrap();

    // 已过 expires_at + hold_window
    sqlx::query(
        "UPDATE payment_intents SET expires_at = now() - interval '10 minutes' WHERE id = $1",
    )
    .bind(intent.id)
    .execute(&app.pool)
    .await
    .unwrap();

    app.state.engine.auto_release(intent.id).await.unwrap();
    assert_eq!(app.chain.release_calls(), vec![11]);

    let released = app.chain.emit(EscrowEvent::PaymentReleased {
        payment_id: 11,
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
}

#[tokio::test]
#[ignore]
async fn refund_flow() {
    let app = test_app().await;
    let (merchant_id, _) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;
    let intent = to_processing(&app, merchant_id, 21).await;

    let refunded = app
        .state
        .engine
        .refund(merchant_id, intent.id)
        .await
        .unwrap();
    assert_eq!(refunded.status, IntentStatus::Processing);
    assert_eq!(app.chain.refund_calls(), vec![21]);

    let event = app.chain.emit(EscrowEvent::PaymentRefunded {
        payment_id: 21,
        to: "0x3333333333333333333333333333333333333333".to_string(),
        amount: 20_000_000_000_000_000_000,
    });
    app.state.engine.on_chain_event(&event).await.unwrap();

    let current = app
        .state
        .intents
        .find_by_id(intent.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, IntentStatus::Refunded);

    let events = WebhookRepository::new(app.pool.clone())
        .find_for_intent(intent.id)
        .await
        .unwrap();
    assert_eq!(
        events.last().unwrap().event_type,
        WebhookEventType::PaymentRefunded
    );
}

#[tokio::test]
#[ignore]
async fn redelivered_event_is_idempotent() {
    let app = test_app().await;
    let (merchant_id, _) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;
    common::reset_cursor(&app).await;

    let intent = app
        .state
        .engine
        .create(merchant_id, create_params(10_000))
        .await
        .unwrap();

    app.chain.emit_with_tx(
        EscrowEvent::PaymentCreated {
            payment_id: 31,
            merchant: "0x2222222222222222222222222222222222222222".to_string(),
            amount: 20_000_000_000_000_000_000,
            fee_bps: 250,
        },
        intent.escrow_creation_tx.as_deref().unwrap(),
    );
    app.chain.emit(EscrowEvent::Deposited {
        payment_id: 31,
        from: "0x3333333333333333333333333333333333333333".to_string(),
        amount: 20_000_000_000_000_000_000,
    });
    let release_block = app
        .chain
        .emit(EscrowEvent::PaymentReleased {
            payment_id: 31,
            to: "0x2222222222222222222222222222222222222222".to_string(),
            amount: 19_500_000_000_000_000_000,
            fee: 500_000_000_000_000_000,
        })
        .block_number;
    app.state.ingestor.tick().await.unwrap();

    let current = app
        .state
        .intents
        .find_by_id(intent.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, IntentStatus::Succeeded);
    let events_before = WebhookRepository::new(app.pool.clone())
        .find_for_intent(intent.id)
        .await
        .unwrap();

    // 游标回退到释放事件之前：同一 (block_hash, log_index) 被再次投递
    let repo = dotgate::repository::ChainEventRepository::new(app.pool.clone());
    let rewind = release_block - 1;
    let hash = app.chain.block_hash(rewind).await.unwrap().unwrap();
    repo.set_cursor(rewind as i64, &hash).await.unwrap();
    app.state.ingestor.tick().await.unwrap();

    // 状态与 webhook 队列都不变
    let current = app
        .state
        .intents
        .find_by_id(intent.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, IntentStatus::Succeeded);
    let events_after = WebhookRepository::new(app.pool.clone())
        .find_for_intent(intent.id)
        .await
        .unwrap();
    assert_eq!(events_before.len(), events_after.len());
}

#[tokio::test]
#[ignore]
async fn stale_price_rejects_creation() {
    let app = test_app().await;
    let (merchant_id, _) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;

    // 报价 6 分钟前；刷新端点不可达
    app.state
        .price
        .seed_quote(
            dotgate::domain::CryptoCurrency::Dot,
            dotgate::domain::FiatCurrency::Usd,
            dec("5.00"),
            Utc::now() - chrono::Duration::minutes(6),
        )
        .await;

    let err = app
        .state
        .engine
        .create(merchant_id, create_params(10_000))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PriceUnavailable(_)));

    let app_err: dotgate::AppError = err.into();
    assert_eq!(app_err.code.as_str(), "PRICE_UNAVAILABLE");
    assert_eq!(app_err.code.status().as_u16(), 503);
}

#[tokio::test]
#[ignore]
async fn concurrent_confirms_submit_single_release() {
    let app = test_app().await;
    let (merchant_id, _) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;
    let intent = to_processing(&app, merchant_id, 41).await;

    let engine_a = app.state.engine.clone();
    let engine_b = app.state.engine.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { engine_a.confirm(merchant_id, intent.id).await }),
        tokio::spawn(async move { engine_b.confirm(merchant_id, intent.id).await }),
    );
    let results = [a.unwrap(), b.unwrap()];

    // 恰好一笔链上 release
    assert_eq!(app.chain.release_calls(), vec![41]);
    let ok_count = results.iter().filter(|r| r.is_ok()).count();
    let conflict = results
        .iter()
        .filter(|r| matches!(r, Err(EngineError::InvalidState { .. })))
        .count();
    assert_eq!(ok_count, 1);
    assert_eq!(conflict, 1);
}

#[tokio::test]
#[ignore]
async fn state_machine_rejects_invalid_operations() {
    let app = test_app().await;
    let (merchant_id, _) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;

    // requires_payment 下 confirm/refund 非法
    let intent = app
        .state
        .engine
        .create(merchant_id, create_params(10_000))
        .await
        .unwrap();
    assert!(matches!(
        app.state.engine.confirm(merchant_id, intent.id).await,
        Err(EngineError::InvalidState { .. })
    ));
    assert!(matches!(
        app.state.engine.refund(merchant_id, intent.id).await,
        Err(EngineError::InvalidState { .. })
    ));

    // 已入金后 cancel 非法
    let processing = to_processing(&app, merchant_id, 51).await;
    assert!(matches!(
        app.state.engine.cancel(merchant_id, processing.id).await,
        Err(EngineError::InvalidState { .. })
    ));

    // 跨商户不可见
    let (other_merchant, _) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 0).await;
    assert!(matches!(
        app.state.engine.confirm(other_merchant, processing.id).await,
        Err(EngineError::IntentNotFound)
    ));
}

#[tokio::test]
#[ignore]
async fn cancel_before_escrow_creation_is_local() {
    let app = test_app().await;
    let (merchant_id, _) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;

    let intent = app
        .state
        .engine
        .create(merchant_id, create_params(10_000))
        .await
        .unwrap();

    let canceled = app
        .state
        .engine
        .cancel(merchant_id, intent.id)
        .await
        .unwrap();
    assert_eq!(canceled.status, IntentStatus::Canceled);
    assert!(app.chain.cancel_calls().is_empty());

    let events = WebhookRepository::new(app.pool.clone())
        .find_for_intent(intent.id)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, WebhookEventType::PaymentCanceled);
}

#[tokio::test]
#[ignore]
async fn permanent_revert_fails_intent() {
    let app = test_app().await;
    let (merchant_id, _) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;
    let intent = to_processing(&app, merchant_id, 61).await;

    app.chain.set_revert_submissions(true);
    let confirmed = app
        .state
        .engine
        .confirm(merchant_id, intent.id)
        .await
        .unwrap();
    assert_eq!(confirmed.status, IntentStatus::Failed);
    assert!(confirmed.failure_reason.is_some());

    let events = WebhookRepository::new(app.pool.clone())
        .find_for_intent(intent.id)
        .await
        .unwrap();
    assert_eq!(
        events.last().unwrap().event_type,
        WebhookEventType::PaymentFailed
    );
}

#[tokio::test]
#[ignore]
async fn transient_chain_failure_does_not_advance_state() {
    let app = test_app().await;
    let (merchant_id, _) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;
    let intent = to_processing(&app, merchant_id, 71).await;

    app.chain.set_fail_submissions(true);
    let err = app
        .state
        .engine
        .confirm(merchant_id, intent.id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ChainUnavailable(_)));

    let current = app
        .state
        .intents
        .find_by_id(intent.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, IntentStatus::Processing);
    assert!(current.release_tx.is_none());

    // 链恢复后重试成功
    app.chain.set_fail_submissions(false);
    let confirmed = app
        .state
        .engine
        .confirm(merchant_id, intent.id)
        .await
        .unwrap();
    assert!(confirmed.release_tx.is_some());
}

#[tokio::test]
#[ignore]
async fn webhook_delivery_signs_payload() {
    let app = test_app().await;
    let sink = WebhookSink::spawn(200).await;
    let (merchant_id, _) = seed_merchant(&app.pool, &sink.url, 250).await;
    let intent = to_processing(&app, merchant_id, 81).await;

    let delivered = app.state.webhooks.sweep().await.unwrap();
    assert_eq!(delivered, 1);

    let received = sink.received();
    assert_eq!(received.len(), 1);
    let hook = &received[0];
    assert_eq!(hook.body["type"], "payment.processing");
    assert_eq!(hook.body["data"]["id"], intent.id.to_string());
    assert!(!hook.request_id.is_empty());

    // X-Signature = hex(hmac_sha256(secret, raw_body))
    let expected =
        dotgate::service::webhook_dispatcher::sign_payload("whsec_test_secret", &hook.raw_body)
            .unwrap();
    assert_eq!(hook.signature, expected);

    let events = WebhookRepository::new(app.pool.clone())
        .find_for_intent(intent.id)
        .await
        .unwrap();
    assert_eq!(events[0].status, WebhookDeliveryStatus::Delivered);
    assert_eq!(events[0].last_response_code, Some(200));
    assert!(events[0].delivered_at.is_some());
}

#[tokio::test]
#[ignore]
async fn webhook_failure_schedules_backoff() {
    let app = test_app().await;
    let sink = WebhookSink::spawn(500).await;
    let (merchant_id, _) = seed_merchant(&app.pool, &sink.url, 250).await;
    let intent = to_processing(&app, merchant_id, 91).await;

    app.state.webhooks.sweep().await.unwrap();

    let events = WebhookRepository::new(app.pool.clone())
        .find_for_intent(intent.id)
        .await
        .unwrap();
    assert_eq!(events[0].status, WebhookDeliveryStatus::Retrying);
    assert_eq!(events[0].attempts, 1);
    assert_eq!(events[0].last_response_code, Some(500));
    assert!(events[0].next_attempt_at > Utc::now());

    // 退避未到期：再次清扫不会重复投递
    app.state.webhooks.sweep().await.unwrap();
    assert_eq!(sink.received().len(), 1);
}
