//! Query-service tests: filter semantics, matching-orders compatibility,
//! blacklist sub-queries and pagination, over a projection populated through
//! the real event handlers.

mod common;

use std::sync::Arc;

use common::{addr, ask_order, big, bid_order, event, name_certificate, new_dwh, MockGateway};
use market_dwh::chain::EventData;
use market_dwh::types::requests::{
    BlacklistOption, BlacklistQuery, CmpFilter, DealsRequest, MatchingOrdersRequest, MaxMinBig,
    OrdersRequest, ProfileRole, ProfilesRequest, SortingOption, SortingOrder, ValidatorsRequest,
    WorkersRequest,
};
use market_dwh::types::{Address, CmpOp, Order, OrderType, Validator};
use market_dwh::Dwh;

async fn apply(dwh: &Dwh, data: EventData) {
    dwh.process_event(&event(data)).await.expect("event applies");
}

async fn place(gateway: &MockGateway, dwh: &Dwh, order: Order) {
    let id = order.id.clone();
    gateway.put_order(order);
    apply(dwh, EventData::OrderPlaced { id }).await;
}

async fn certify(gateway: &MockGateway, dwh: &Dwh, cert_id: u64, owner: Address, name: &str) {
    gateway.put_certificate(cert_id, name_certificate(owner, addr(0xee), name));
    apply(dwh, EventData::CertificateCreated { id: big(cert_id) }).await;
}

#[tokio::test]
async fn matching_orders_returns_compatible_asks_best_price_first() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;

    let seeker = addr(0x51);
    certify(&gateway, &dwh, 1, seeker, "Buyer").await;

    // Candidate pool: authors 0x61.. with varying compatibility.
    let certified = [addr(0x61), addr(0x62), addr(0x63), addr(0x64), addr(0x65)];
    for (i, author) in certified.iter().enumerate() {
        certify(&gateway, &dwh, 10 + i as u64, *author, "Seller").await;
    }

    let mut matching_cheap = ask_order(301, certified[0], 70);
    matching_cheap.duration = 1_200;
    matching_cheap.netflags = 0b111;
    matching_cheap.identity_level = 1;
    place(&gateway, &dwh, matching_cheap).await;

    let mut matching_at_limit = ask_order(302, certified[1], 90);
    matching_at_limit.duration = 1_000;
    matching_at_limit.netflags = 0b011;
    place(&gateway, &dwh, matching_at_limit).await;

    let mut too_expensive = ask_order(303, certified[2], 110);
    too_expensive.netflags = 0b011;
    place(&gateway, &dwh, too_expensive).await;

    let mut too_short = ask_order(304, certified[2], 95);
    too_short.duration = 500;
    too_short.netflags = 0b011;
    place(&gateway, &dwh, too_short).await;

    let mut wrong_netflags = ask_order(305, certified[3], 85);
    wrong_netflags.netflags = 0b001;
    place(&gateway, &dwh, wrong_netflags).await;

    // Author without certificates: creator identity 0 < the bid's bar.
    let mut anonymous_author = ask_order(306, addr(0x71), 95);
    anonymous_author.netflags = 0b011;
    place(&gateway, &dwh, anonymous_author).await;

    // Requires more identity than the seeker's issuer has.
    let mut too_demanding = ask_order(307, certified[3], 80);
    too_demanding.netflags = 0b011;
    too_demanding.identity_level = 2;
    place(&gateway, &dwh, too_demanding).await;

    // Reserved for someone else vs reserved for the seeker.
    let mut reserved_other = ask_order(308, certified[4], 75);
    reserved_other.netflags = 0b011;
    reserved_other.counterparty_id = addr(0x99);
    place(&gateway, &dwh, reserved_other).await;

    let mut reserved_for_seeker = ask_order(309, certified[4], 72);
    reserved_for_seeker.netflags = 0b011;
    reserved_for_seeker.counterparty_id = seeker;
    place(&gateway, &dwh, reserved_for_seeker).await;

    let mut bid = bid_order(200, seeker, 100);
    bid.duration = 1_000;
    bid.netflags = 0b011;
    bid.identity_level = 1;
    place(&gateway, &dwh, bid).await;

    let reply = dwh
        .get_matching_orders(&MatchingOrdersRequest {
            id: big(200),
            ..Default::default()
        })
        .await
        .unwrap();

    let matched: Vec<String> = reply
        .orders
        .iter()
        .map(|o| o.order.id.to_string())
        .collect();
    assert_eq!(
        matched,
        vec!["301", "309", "302"],
        "compatible asks only, price ascending"
    );
    assert!(reply
        .orders
        .iter()
        .all(|o| o.order.order_type == OrderType::Ask));
}

#[tokio::test]
async fn matching_orders_for_ask_sorts_best_bid_first() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;

    let seller = addr(0x52);
    certify(&gateway, &dwh, 1, seller, "Seller").await;
    let buyer = addr(0x53);
    certify(&gateway, &dwh, 2, buyer, "Buyer").await;

    // Bids must pay at least the ask price and run at most its duration.
    let mut low_bid = bid_order(401, buyer, 40);
    low_bid.duration = 1_000;
    place(&gateway, &dwh, low_bid).await;
    let mut good_bid = bid_order(402, buyer, 60);
    good_bid.duration = 1_000;
    place(&gateway, &dwh, good_bid).await;
    let mut better_bid = bid_order(403, buyer, 80);
    better_bid.duration = 1_000;
    place(&gateway, &dwh, better_bid).await;

    let mut ask = ask_order(400, seller, 50);
    ask.duration = 2_000;
    place(&gateway, &dwh, ask).await;

    let reply = dwh
        .get_matching_orders(&MatchingOrdersRequest {
            id: big(400),
            ..Default::default()
        })
        .await
        .unwrap();
    let matched: Vec<String> = reply
        .orders
        .iter()
        .map(|o| o.order.id.to_string())
        .collect();
    assert_eq!(matched, vec!["403", "402"], "highest paying bid first");
}

#[tokio::test]
async fn orders_filter_by_price_range_and_sort() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;

    for (id, price) in [(500u64, 30u64), (501, 50), (502, 70)] {
        place(&gateway, &dwh, ask_order(id, addr(id as u8), price)).await;
    }

    let reply = dwh
        .get_orders(&OrdersRequest {
            price: Some(MaxMinBig {
                min: Some(big(40)),
                max: Some(big(80)),
            }),
            sortings: vec![SortingOption::new("Price", SortingOrder::Desc)],
            with_count: true,
            ..Default::default()
        })
        .await
        .unwrap();

    let prices: Vec<String> = reply
        .orders
        .iter()
        .map(|o| o.order.price.to_string())
        .collect();
    assert_eq!(prices, vec!["70", "50"]);
    assert_eq!(reply.count, Some(2));
}

#[tokio::test]
async fn orders_pagination_with_count() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;

    for (id, price) in [(510u64, 10u64), (511, 20), (512, 30)] {
        place(&gateway, &dwh, ask_order(id, addr(id as u8), price)).await;
    }

    let reply = dwh
        .get_orders(&OrdersRequest {
            sortings: vec![SortingOption::new("Price", SortingOrder::Asc)],
            offset: 1,
            limit: 2,
            with_count: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(reply.orders.len(), 2);
    assert_eq!(reply.orders[0].order.price.to_string(), "20");
    assert_eq!(reply.count, Some(3), "count ignores pagination");
}

#[tokio::test]
async fn deals_filter_by_supplier_and_status() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;

    let supplier = addr(0xa1);
    let consumer = addr(0xb1);
    let ask = ask_order(10, supplier, 100);
    let bid = bid_order(11, consumer, 100);
    gateway.put_order(ask.clone());
    gateway.put_order(bid.clone());
    gateway.put_deal(common::deal(1, &ask, &bid));
    apply(&dwh, EventData::OrderPlaced { id: big(10) }).await;
    apply(&dwh, EventData::OrderPlaced { id: big(11) }).await;
    apply(&dwh, EventData::DealOpened { id: big(1) }).await;

    let reply = dwh
        .get_deals(&DealsRequest {
            supplier_id: Some(supplier),
            status: market_dwh::types::DealStatus::Accepted,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(reply.deals.len(), 1);

    let reply = dwh
        .get_deals(&DealsRequest {
            supplier_id: Some(addr(0xff)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(reply.deals.is_empty());
}

#[tokio::test]
async fn profiles_filter_by_role_and_blacklist_modes() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;

    let supplier = addr(0x21);
    let consumer = addr(0x22);
    place(&gateway, &dwh, ask_order(600, supplier, 10)).await;
    place(&gateway, &dwh, bid_order(601, consumer, 10)).await;

    let suppliers = dwh
        .get_profiles(&ProfilesRequest {
            role: ProfileRole::Supplier,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(suppliers.profiles.len(), 1);
    assert_eq!(suppliers.profiles[0].user_id, supplier);

    // The owner blacklists the supplier.
    let owner = addr(0x2f);
    apply(
        &dwh,
        EventData::AddedToBlacklist {
            adder_id: owner,
            addee_id: supplier,
        },
    )
    .await;

    let without = dwh
        .get_profiles(&ProfilesRequest {
            blacklist_query: Some(BlacklistQuery {
                owner_id: owner,
                option: BlacklistOption::WithoutMatching,
            }),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(without.profiles.iter().all(|p| p.user_id != supplier));
    assert!(without.profiles.iter().any(|p| p.user_id == consumer));

    let only = dwh
        .get_profiles(&ProfilesRequest {
            blacklist_query: Some(BlacklistQuery {
                owner_id: owner,
                option: BlacklistOption::OnlyMatching,
            }),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(only.profiles.len(), 1);
    assert_eq!(only.profiles[0].user_id, supplier);

    let marked = dwh
        .get_profiles(&ProfilesRequest {
            blacklist_query: Some(BlacklistQuery {
                owner_id: owner,
                option: BlacklistOption::IncludeAndMark,
            }),
            ..Default::default()
        })
        .await
        .unwrap();
    let flagged: Vec<_> = marked
        .profiles
        .iter()
        .filter(|p| p.is_blacklisted)
        .collect();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].user_id, supplier);
}

#[tokio::test]
async fn validators_filter_by_level_operator() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;

    for (byte, level) in [(0x41u8, 1u64), (0x42, 2), (0x43, 3)] {
        let id = addr(byte);
        gateway.put_validator(Validator { id, level });
        apply(&dwh, EventData::ValidatorCreated { id }).await;
    }

    let reply = dwh
        .get_validators(&ValidatorsRequest {
            validator_level: Some(CmpFilter {
                operator: CmpOp::Gte,
                value: 2,
            }),
            sortings: vec![SortingOption::new("Level", SortingOrder::Asc)],
            ..Default::default()
        })
        .await
        .unwrap();
    let levels: Vec<u64> = reply.validators.iter().map(|v| v.level).collect();
    assert_eq!(levels, vec![2, 3]);
}

#[tokio::test]
async fn workers_filter_by_master() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;

    let master_a = addr(0x01);
    let master_b = addr(0x02);
    for (master, slave) in [(master_a, addr(0x11)), (master_a, addr(0x12)), (master_b, addr(0x13))] {
        apply(
            &dwh,
            EventData::WorkerAnnounced {
                master_id: master,
                slave_id: slave,
            },
        )
        .await;
    }

    let reply = dwh
        .get_workers(&WorkersRequest {
            master_id: Some(master_a),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(reply.workers.len(), 2);
    assert!(reply.workers.iter().all(|w| w.master_id == master_a));
}

#[tokio::test]
async fn detail_getters_report_not_found() {
    let gateway = Arc::new(MockGateway::new());
    let dwh = new_dwh(gateway.clone()).await;

    assert!(matches!(
        dwh.get_deal_details(&big(9_999)).await,
        Err(market_dwh::DwhError::NotFound(_))
    ));
    assert!(matches!(
        dwh.get_order_details(&big(9_999)).await,
        Err(market_dwh::DwhError::NotFound(_))
    ));
    assert!(matches!(
        dwh.get_profile_info(addr(0xfe)).await,
        Err(market_dwh::DwhError::NotFound(_))
    ));
}
