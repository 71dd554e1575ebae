//! End-to-end projection tests: event sequences applied against in-memory
//! SQLite through the real handlers, checked through the query service.

mod common;

use std::sync::Arc;

use num_bigint::BigUint;
use sqlx::Row;

use common::{
    addr, ask_order, big, bid_order, change_request, deal, event, event_at, name_certificate,
    new_dwh, wait_until, MockGateway,
};
use market_dwh::chain::EventData;
use market_dwh::types::requests::DealConditionsRequest;
use market_dwh::types::{
    Address, ChangeRequestStatus, DealStatus, OrderStatus, OrderType, ATTRIBUTE_NAME,
};
use market_dwh::utils::error::{is_constraint_violation, DwhError};

async fn apply(dwh: &market_dwh::Dwh, data: EventData) {
    dwh.process_event(&event(data)).await.expect("event applies");
}

fn order_placed(id: u64) -> EventData {
    EventData::OrderPlaced { id: big(id) }
}

/// Projects an ask/bid pair and the deal that matched them.
async fn project_deal(gateway: &MockGateway, dwh: &market_dwh::Dwh) {
    let supplier = addr(0xa1);
    let consumer = addr(0xb1);
    let ask = ask_order(10, supplier, 100);
    let bid = bid_order(11, consumer, 100);
    gateway.put_order(ask.clone());
    gateway.put_order(bid.clone());
    gateway.put_deal(deal(1, &ask, &bid));

    apply(dwh, order_placed(10)).await;
    apply(dwh, order_placed(11)).await;
    apply(dwh, EventData::DealOpened { id: big(1) }).await;
}

#[tokio::test]
async fn deal_opened_projects_snapshot_and_condition() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;
    project_deal(&gateway, &dwh).await;

    let projected = dwh.get_deal_details(&big(1)).await.unwrap();
    assert_eq!(projected.deal.id, big(1));
    assert_eq!(projected.deal.status, DealStatus::Accepted);
    assert_eq!(projected.deal.benchmarks.len(), common::NUM_BENCHMARKS);
    assert!(!projected.active_change_request);

    // The initial condition segment mirrors the deal terms and stays open.
    let conditions = dwh
        .get_deal_conditions(&DealConditionsRequest {
            deal_id: big(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(conditions.conditions.len(), 1);
    assert_eq!(conditions.conditions[0].end_time, 0);
    assert_eq!(conditions.conditions[0].price, big(100));
}

#[tokio::test]
async fn deal_opened_before_orders_fails_without_partial_state() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;

    let ask = ask_order(10, addr(0xa1), 100);
    let bid = bid_order(11, addr(0xb1), 100);
    gateway.put_deal(deal(1, &ask, &bid));
    gateway.put_order(ask);
    gateway.put_order(bid);

    // Orders are not projected yet, so the handler must fail...
    let err = dwh
        .process_event(&event(EventData::DealOpened { id: big(1) }))
        .await
        .unwrap_err();
    assert!(matches!(err, DwhError::NotFound(_)));
    assert!(!is_constraint_violation(&err), "must take the retry path");
    assert!(dwh.get_deal_details(&big(1)).await.is_err());

    // ...and succeed cleanly once the sibling events have landed.
    apply(&dwh, order_placed(10)).await;
    apply(&dwh, order_placed(11)).await;
    apply(&dwh, EventData::DealOpened { id: big(1) }).await;
    assert!(dwh.get_deal_details(&big(1)).await.is_ok());
}

#[tokio::test]
async fn closed_deal_is_purged_with_both_orders() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;
    project_deal(&gateway, &dwh).await;

    // The chain now reports the deal as closed.
    let mut closed = gateway.deals.lock().unwrap().get("1").cloned().unwrap();
    closed.status = DealStatus::Closed;
    gateway.put_deal(closed);

    apply(&dwh, EventData::DealUpdated { id: big(1) }).await;

    assert!(matches!(
        dwh.get_deal_details(&big(1)).await,
        Err(DwhError::NotFound(_))
    ));
    assert!(dwh.get_order_details(&big(10)).await.is_err());
    assert!(dwh.get_order_details(&big(11)).await.is_err());
}

#[tokio::test]
async fn deal_updated_refreshes_mutable_columns() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;
    project_deal(&gateway, &dwh).await;

    let mut updated = gateway.deals.lock().unwrap().get("1").cloned().unwrap();
    updated.total_payout = big(500);
    updated.last_bill_ts = 2_000;
    gateway.put_deal(updated);

    apply(&dwh, EventData::DealUpdated { id: big(1) }).await;

    let projected = dwh.get_deal_details(&big(1)).await.unwrap();
    assert_eq!(projected.deal.total_payout, big(500));
    assert_eq!(projected.deal.last_bill_ts, 2_000);
}

#[tokio::test]
async fn profile_counters_track_active_orders() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;

    let author = addr(0xaa);
    gateway.put_order(ask_order(20, author, 50));
    gateway.put_order(bid_order(21, author, 60));

    apply(&dwh, order_placed(20)).await;
    apply(&dwh, order_placed(21)).await;

    let profile = dwh.get_profile_info(author).await.unwrap();
    assert_eq!(profile.active_asks, 1);
    assert_eq!(profile.active_bids, 1);

    // Cancelling the ask (no deal attached) removes the row and decrements.
    let mut cancelled = gateway.orders.lock().unwrap().get("20").cloned().unwrap();
    cancelled.status = OrderStatus::Inactive;
    gateway.put_order(cancelled);
    apply(&dwh, EventData::OrderUpdated { id: big(20) }).await;

    assert!(dwh.get_order_details(&big(20)).await.is_err());
    let profile = dwh.get_profile_info(author).await.unwrap();
    assert_eq!(profile.active_asks, 0);
    assert_eq!(profile.active_bids, 1);
}

#[tokio::test]
async fn inactive_unmatched_order_only_touches_profile() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;

    let author = addr(0xab);
    let mut order = ask_order(30, author, 50);
    order.status = OrderStatus::Inactive;
    gateway.put_order(order);

    apply(&dwh, order_placed(30)).await;

    assert!(dwh.get_order_details(&big(30)).await.is_err());
    assert!(dwh.get_profile_info(author).await.is_ok());
}

#[tokio::test]
async fn order_redelivery_rolls_back_counter_update() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;

    let author = addr(0xac);
    gateway.put_order(ask_order(40, author, 50));
    apply(&dwh, order_placed(40)).await;

    // Redelivery hits the primary key; the counter increment inside the same
    // transaction must roll back with it.
    let err = dwh
        .process_event(&event(order_placed(40)))
        .await
        .unwrap_err();
    assert!(is_constraint_violation(&err));

    let profile = dwh.get_profile_info(author).await.unwrap();
    assert_eq!(profile.active_asks, 1);
}

#[tokio::test]
async fn newest_created_change_request_supersedes() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;
    project_deal(&gateway, &dwh).await;

    gateway.put_change_request(change_request(
        100,
        1,
        OrderType::Ask,
        ChangeRequestStatus::Created,
    ));
    gateway.put_change_request(change_request(
        101,
        1,
        OrderType::Ask,
        ChangeRequestStatus::Created,
    ));

    apply(&dwh, EventData::DealChangeRequestSent { id: big(100) }).await;
    apply(&dwh, EventData::DealChangeRequestSent { id: big(101) }).await;

    let requests = dwh.get_deal_change_requests(&big(1)).await.unwrap();
    assert_eq!(requests.requests.len(), 1);
    assert_eq!(requests.requests[0].id, big(101));
    assert_eq!(requests.requests[0].status, ChangeRequestStatus::Created);
}

#[tokio::test]
async fn accepted_change_request_rolls_deal_conditions() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;
    project_deal(&gateway, &dwh).await;

    gateway.put_change_request(change_request(
        100,
        1,
        OrderType::Ask,
        ChangeRequestStatus::Created,
    ));
    apply(&dwh, EventData::DealChangeRequestSent { id: big(100) }).await;

    gateway.put_change_request(change_request(
        100,
        1,
        OrderType::Ask,
        ChangeRequestStatus::Accepted,
    ));
    dwh.process_event(&event_at(
        2,
        5_000,
        EventData::DealChangeRequestUpdated { id: big(100) },
    ))
    .await
    .unwrap();

    // Old segment closed at the event timestamp, new segment open with the
    // accepted terms, request gone.
    let conditions = dwh
        .get_deal_conditions(&DealConditionsRequest {
            deal_id: big(1),
            ..Default::default()
        })
        .await
        .unwrap()
        .conditions;
    assert_eq!(conditions.len(), 2);
    assert_eq!(conditions[0].end_time, 0);
    assert_eq!(conditions[0].start_time, 5_000);
    assert_eq!(conditions[0].price, big(77));
    assert_eq!(conditions[0].duration, 7_200);
    assert_eq!(conditions[1].end_time, 5_000);

    let requests = dwh.get_deal_change_requests(&big(1)).await.unwrap();
    assert!(requests.requests.is_empty());
}

#[tokio::test]
async fn rejected_change_request_keeps_row_with_status() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;
    project_deal(&gateway, &dwh).await;

    gateway.put_change_request(change_request(
        100,
        1,
        OrderType::Bid,
        ChangeRequestStatus::Created,
    ));
    apply(&dwh, EventData::DealChangeRequestSent { id: big(100) }).await;

    gateway.put_change_request(change_request(
        100,
        1,
        OrderType::Bid,
        ChangeRequestStatus::Rejected,
    ));
    apply(&dwh, EventData::DealChangeRequestUpdated { id: big(100) }).await;

    let requests = dwh.get_deal_change_requests(&big(1)).await.unwrap();
    assert_eq!(requests.requests.len(), 1);
    assert_eq!(requests.requests[0].status, ChangeRequestStatus::Rejected);
}

#[tokio::test]
async fn billing_accrues_into_condition_deal_and_payments() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;
    project_deal(&gateway, &dwh).await;

    for ts in [1_000u64, 1_001, 1_002] {
        dwh.process_event(&event_at(
            2,
            ts,
            EventData::Billed {
                deal_id: big(1),
                paid_amount: big(10),
            },
        ))
        .await
        .unwrap();
    }

    let projected = dwh.get_deal_details(&big(1)).await.unwrap();
    assert_eq!(projected.deal.total_payout, big(30));

    let conditions = dwh
        .get_deal_conditions(&DealConditionsRequest {
            deal_id: big(1),
            ..Default::default()
        })
        .await
        .unwrap()
        .conditions;
    assert_eq!(conditions[0].total_payout, big(30));

    let payments = sqlx::query("SELECT count(*) FROM DealPayments WHERE DealID = '1'")
        .fetch_one(dwh.storage().pool())
        .await
        .unwrap();
    assert_eq!(payments.try_get::<i64, _>(0).unwrap(), 3);
}

#[tokio::test]
async fn redelivered_billed_event_changes_nothing() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;
    project_deal(&gateway, &dwh).await;

    let billed = event_at(
        2,
        1_000,
        EventData::Billed {
            deal_id: big(1),
            paid_amount: big(10),
        },
    );
    dwh.process_event(&billed).await.unwrap();

    let err = dwh.process_event(&billed).await.unwrap_err();
    assert!(is_constraint_violation(&err), "duplicate must be droppable");

    let projected = dwh.get_deal_details(&big(1)).await.unwrap();
    assert_eq!(projected.deal.total_payout, big(10));
}

#[tokio::test]
async fn certificate_cascades_into_profile_and_orders() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;

    let author = addr(0xad);
    let validator = addr(0xee);
    gateway.put_order(ask_order(50, author, 50));
    apply(&dwh, order_placed(50)).await;

    let before = dwh.get_order_details(&big(50)).await.unwrap();
    assert_eq!(before.creator_name, "");
    assert_eq!(before.creator_identity_level, 0);

    gateway.put_certificate(7, name_certificate(author, validator, "Alice"));
    apply(&dwh, EventData::CertificateCreated { id: big(7) }).await;

    let profile = dwh.get_profile_info(author).await.unwrap();
    assert_eq!(profile.name, "Alice");
    assert_eq!(
        profile.identity_level,
        market_dwh::types::attribute_identity_level(ATTRIBUTE_NAME)
    );
    let cached: Vec<market_dwh::types::Certificate> =
        serde_json::from_str(&profile.certificates).unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].value, b"Alice");

    let after = dwh.get_order_details(&big(50)).await.unwrap();
    assert_eq!(after.creator_name, "Alice");
    assert_eq!(
        after.creator_identity_level,
        market_dwh::types::attribute_identity_level(ATTRIBUTE_NAME)
    );
    assert_eq!(after.creator_certificates, profile.certificates);
}

#[tokio::test]
async fn certificate_refreshes_deal_certificate_blobs() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;
    project_deal(&gateway, &dwh).await;

    let supplier = addr(0xa1);
    gateway.put_certificate(8, name_certificate(supplier, addr(0xee), "Supplier Co"));
    apply(&dwh, EventData::CertificateCreated { id: big(8) }).await;

    let projected = dwh.get_deal_details(&big(1)).await.unwrap();
    let cached: Vec<market_dwh::types::Certificate> =
        serde_json::from_str(&projected.supplier_certificates).unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].value, b"Supplier Co");
    assert_eq!(projected.consumer_certificates, "[]");
}

#[tokio::test]
async fn workers_lifecycle() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;

    let master = addr(0x01);
    let slave = addr(0x02);

    apply(
        &dwh,
        EventData::WorkerAnnounced {
            master_id: master,
            slave_id: slave,
        },
    )
    .await;

    let workers = dwh.get_workers(&Default::default()).await.unwrap();
    assert_eq!(workers.workers.len(), 1);
    assert!(!workers.workers[0].confirmed);

    apply(
        &dwh,
        EventData::WorkerConfirmed {
            master_id: master,
            slave_id: slave,
        },
    )
    .await;
    let workers = dwh.get_workers(&Default::default()).await.unwrap();
    assert!(workers.workers[0].confirmed);

    apply(
        &dwh,
        EventData::WorkerRemoved {
            master_id: master,
            slave_id: slave,
        },
    )
    .await;
    let workers = dwh.get_workers(&Default::default()).await.unwrap();
    assert!(workers.workers.is_empty());
}

#[tokio::test]
async fn validator_soft_delete_keeps_row_at_level_zero() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;

    let id = addr(0x33);
    gateway.put_validator(market_dwh::types::Validator { id, level: 3 });
    apply(&dwh, EventData::ValidatorCreated { id }).await;

    let validators = dwh.get_validators(&Default::default()).await.unwrap();
    assert_eq!(validators.validators.len(), 1);
    assert_eq!(validators.validators[0].level, 3);

    gateway.put_validator(market_dwh::types::Validator { id, level: 0 });
    apply(&dwh, EventData::ValidatorDeleted { id }).await;

    let validators = dwh.get_validators(&Default::default()).await.unwrap();
    assert_eq!(validators.validators.len(), 1);
    assert_eq!(validators.validators[0].level, 0);
}

#[tokio::test]
async fn worker_pool_retries_out_of_order_deal() {
    let gateway = Arc::new(MockGateway::new());

    let ask = ask_order(10, addr(0xa1), 100);
    let bid = bid_order(11, addr(0xb1), 100);
    gateway.put_order(ask.clone());
    gateway.put_order(bid.clone());
    gateway.put_deal(deal(1, &ask, &bid));

    // DealOpened arrives ahead of the orders it references; the retry delay
    // gives the sibling events time to land.
    gateway.push_event_batch(vec![
        event_at(5, 1_000, EventData::DealOpened { id: big(1) }),
        event_at(5, 1_000, order_placed(10)),
        event_at(5, 1_000, order_placed(11)),
    ]);

    let dwh = new_dwh(gateway.clone()).await;
    let server = tokio::spawn(dwh.clone().serve());

    {
        let dwh = dwh.clone();
        wait_until(move || {
            let dwh = dwh.clone();
            async move { dwh.get_deal_details(&big(1)).await.is_ok() }
        })
        .await;
    }

    // The cursor advanced to the events' block.
    let cursor = sqlx::query("SELECT LastKnownBlock FROM LastKnownBlock")
        .fetch_one(dwh.storage().pool())
        .await
        .unwrap();
    assert_eq!(cursor.try_get::<i64, _>(0).unwrap(), 5);

    dwh.stop().await;
    let _ = server.await;
}

#[tokio::test]
async fn error_events_are_ignored() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;

    apply(
        &dwh,
        EventData::Error {
            err: "bad topic".to_string(),
            topic: "0xdead".to_string(),
        },
    )
    .await;
}

#[tokio::test]
async fn blacklist_add_and_remove() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;

    let adder: Address = addr(0x10);
    let addee: Address = addr(0x11);

    apply(
        &dwh,
        EventData::AddedToBlacklist {
            adder_id: adder,
            addee_id: addee,
        },
    )
    .await;

    let reply = dwh
        .get_blacklist(&market_dwh::types::requests::BlacklistRequest {
            owner_id: Some(adder),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(reply.addresses, vec![addee]);

    apply(
        &dwh,
        EventData::RemovedFromBlacklist {
            remover_id: adder,
            removee_id: addee,
        },
    )
    .await;

    let reply = dwh
        .get_blacklist(&market_dwh::types::requests::BlacklistRequest {
            owner_id: Some(adder),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(reply.addresses.is_empty());
}

#[tokio::test]
async fn replay_in_two_halves_with_restart_matches_single_run() {
    let path = std::env::temp_dir().join(format!("market-dwh-replay-{}.db", std::process::id()));
    std::fs::remove_file(&path).ok();
    let endpoint = format!("sqlite://{}?mode=rwc", path.display());

    let gateway = Arc::new(MockGateway::new());
    let supplier = addr(0xa1);
    let consumer = addr(0xb1);
    let ask = ask_order(10, supplier, 100);
    let bid = bid_order(11, consumer, 100);
    gateway.put_order(ask.clone());
    gateway.put_order(bid.clone());
    gateway.put_deal(deal(1, &ask, &bid));

    // First half of the log, then a full restart.
    {
        let dwh = common::new_dwh_with_endpoint(gateway.clone(), &endpoint).await;
        apply(&dwh, order_placed(10)).await;
        apply(&dwh, order_placed(11)).await;
        dwh.stop().await;
    }

    // Second half on a fresh instance over the same store; the poller also
    // redelivers an already-applied event, which must surface as a droppable
    // constraint violation.
    let dwh = common::new_dwh_with_endpoint(gateway.clone(), &endpoint).await;
    let err = dwh
        .process_event(&event(order_placed(10)))
        .await
        .unwrap_err();
    assert!(is_constraint_violation(&err));

    apply(&dwh, EventData::DealOpened { id: big(1) }).await;
    dwh.process_event(&event_at(
        2,
        1_500,
        EventData::Billed {
            deal_id: big(1),
            paid_amount: big(25),
        },
    ))
    .await
    .unwrap();

    // Final state matches what a single uninterrupted run produces.
    let projected = dwh.get_deal_details(&big(1)).await.unwrap();
    assert_eq!(projected.deal.total_payout, big(25));
    let supplier_profile = dwh.get_profile_info(supplier).await.unwrap();
    assert_eq!(supplier_profile.active_asks, 1);

    dwh.stop().await;
    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn padded_prices_preserve_numeric_order_in_sql() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;

    gateway.put_order(ask_order(60, addr(0x60), 99));
    gateway.put_order(ask_order(61, addr(0x61), 100));
    apply(&dwh, order_placed(60)).await;
    apply(&dwh, order_placed(61)).await;

    // A lexicographic >= on the padded column must behave numerically: only
    // the price-100 order clears the bar.
    let reply = dwh
        .get_orders(&market_dwh::types::requests::OrdersRequest {
            price: Some(market_dwh::types::requests::MaxMinBig {
                min: Some(BigUint::from(100u64)),
                max: None,
            }),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(reply.orders.len(), 1);
    assert_eq!(reply.orders[0].order.id, big(61));
}
