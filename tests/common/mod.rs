//! Shared test harness: an in-memory chain gateway plus builders for
//! chain-shaped entities.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use num_bigint::BigUint;
use tokio::sync::mpsc;

use market_dwh::chain::{BlockchainGateway, Event, EventData};
use market_dwh::types::{
    Address, Certificate, ChangeRequestStatus, Deal, DealChangeRequest, DealStatus, Order,
    OrderStatus, OrderType, Validator,
};
use market_dwh::utils::error::{DwhError, Result};
use market_dwh::{Dwh, DwhConfigBuilder};

pub const NUM_BENCHMARKS: usize = 4;

/// In-memory stand-in for the chain: canonical entity state plus scripted
/// event batches handed out per `get_events` subscription.
#[derive(Default)]
pub struct MockGateway {
    pub deals: Mutex<HashMap<String, Deal>>,
    pub orders: Mutex<HashMap<String, Order>>,
    pub change_requests: Mutex<HashMap<String, DealChangeRequest>>,
    pub validators: Mutex<HashMap<Address, Validator>>,
    pub certificates: Mutex<HashMap<String, Certificate>>,
    event_batches: Mutex<Vec<Vec<Event>>>,
    // Senders kept alive so idle subscriptions stay open until shutdown.
    parked_senders: Mutex<Vec<mpsc::Sender<Event>>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_deal(&self, deal: Deal) {
        self.deals.lock().unwrap().insert(deal.id.to_string(), deal);
    }

    pub fn put_order(&self, order: Order) {
        self.orders
            .lock()
            .unwrap()
            .insert(order.id.to_string(), order);
    }

    pub fn put_change_request(&self, request: DealChangeRequest) {
        self.change_requests
            .lock()
            .unwrap()
            .insert(request.id.to_string(), request);
    }

    pub fn put_validator(&self, validator: Validator) {
        self.validators
            .lock()
            .unwrap()
            .insert(validator.id, validator);
    }

    pub fn put_certificate(&self, id: u64, certificate: Certificate) {
        self.certificates
            .lock()
            .unwrap()
            .insert(BigUint::from(id).to_string(), certificate);
    }

    /// Queues one batch of events for the next `get_events` subscription.
    pub fn push_event_batch(&self, events: Vec<Event>) {
        self.event_batches.lock().unwrap().push(events);
    }
}

#[async_trait]
impl BlockchainGateway for MockGateway {
    async fn num_benchmarks(&self) -> Result<u64> {
        Ok(NUM_BENCHMARKS as u64)
    }

    async fn deal_info(&self, id: &BigUint) -> Result<Deal> {
        self.deals
            .lock()
            .unwrap()
            .get(&id.to_string())
            .cloned()
            .ok_or_else(|| DwhError::Chain(format!("no deal {id}")))
    }

    async fn order_info(&self, id: &BigUint) -> Result<Order> {
        self.orders
            .lock()
            .unwrap()
            .get(&id.to_string())
            .cloned()
            .ok_or_else(|| DwhError::Chain(format!("no order {id}")))
    }

    async fn change_request_info(&self, id: &BigUint) -> Result<DealChangeRequest> {
        self.change_requests
            .lock()
            .unwrap()
            .get(&id.to_string())
            .cloned()
            .ok_or_else(|| DwhError::Chain(format!("no change request {id}")))
    }

    async fn validator(&self, id: Address) -> Result<Validator> {
        self.validators
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| DwhError::Chain(format!("no validator {id}")))
    }

    async fn certificate(&self, id: &BigUint) -> Result<Certificate> {
        self.certificates
            .lock()
            .unwrap()
            .get(&id.to_string())
            .cloned()
            .ok_or_else(|| DwhError::Chain(format!("no certificate {id}")))
    }

    async fn get_events(&self, _from_block: u64) -> Result<mpsc::Receiver<Event>> {
        let batch = {
            let mut batches = self.event_batches.lock().unwrap();
            if batches.is_empty() {
                None
            } else {
                Some(batches.remove(0))
            }
        };
        match batch {
            Some(events) => {
                let (tx, rx) = mpsc::channel(events.len().max(1));
                for event in events {
                    tx.try_send(event)
                        .map_err(|e| DwhError::Chain(format!("mock channel overflow: {e}")))?;
                }
                // Dropping the sender closes the stream after the batch.
                Ok(rx)
            }
            None => {
                let (tx, rx) = mpsc::channel(1);
                self.parked_senders.lock().unwrap().push(tx);
                Ok(rx)
            }
        }
    }
}

/// A warehouse over in-memory SQLite wired to the given gateway. The pool is
/// capped at one connection so every handle sees the same in-memory
/// database.
pub async fn new_dwh(gateway: Arc<MockGateway>) -> Arc<Dwh> {
    new_dwh_with_endpoint(gateway, "sqlite::memory:").await
}

pub async fn new_dwh_with_endpoint(gateway: Arc<MockGateway>, endpoint: &str) -> Arc<Dwh> {
    let config = DwhConfigBuilder::new()
        .with_storage("sqlite3", endpoint)
        .with_max_connections(1)
        .with_num_workers(2)
        .with_event_retry_ms(100)
        .with_blockchain("mock://chain")
        .build()
        .expect("config must build");

    Arc::new(
        Dwh::new(config, Some(gateway))
            .await
            .expect("warehouse must initialise"),
    )
}

pub fn addr(last_byte: u8) -> Address {
    let mut bytes = [0u8; 20];
    bytes[19] = last_byte;
    Address::new(bytes)
}

pub fn big(v: u64) -> BigUint {
    BigUint::from(v)
}

pub fn event(data: EventData) -> Event {
    Event {
        block_number: 1,
        ts: 1_000,
        data,
    }
}

pub fn event_at(block_number: u64, ts: u64, data: EventData) -> Event {
    Event {
        block_number,
        ts,
        data,
    }
}

/// An active ask order with sane defaults.
pub fn ask_order(id: u64, author: Address, price: u64) -> Order {
    Order {
        id: big(id),
        deal_id: BigUint::default(),
        order_type: OrderType::Ask,
        status: OrderStatus::Active,
        author_id: author,
        counterparty_id: Address::ZERO,
        duration: 3_600,
        price: big(price),
        netflags: 0,
        identity_level: 0,
        blacklist: String::new(),
        tag: Vec::new(),
        frozen_sum: BigUint::default(),
        benchmarks: vec![10; NUM_BENCHMARKS],
    }
}

pub fn bid_order(id: u64, author: Address, price: u64) -> Order {
    Order {
        order_type: OrderType::Bid,
        ..ask_order(id, author, price)
    }
}

/// An accepted deal referencing the given orders.
pub fn deal(id: u64, ask: &Order, bid: &Order) -> Deal {
    Deal {
        id: big(id),
        supplier_id: ask.author_id,
        consumer_id: bid.author_id,
        master_id: ask.author_id,
        ask_id: ask.id.clone(),
        bid_id: bid.id.clone(),
        duration: ask.duration,
        price: ask.price.clone(),
        start_time: 900,
        end_time: 0,
        status: DealStatus::Accepted,
        blocked_balance: BigUint::default(),
        total_payout: BigUint::default(),
        last_bill_ts: 0,
        benchmarks: vec![10; NUM_BENCHMARKS],
    }
}

pub fn change_request(
    id: u64,
    deal_id: u64,
    request_type: OrderType,
    status: ChangeRequestStatus,
) -> DealChangeRequest {
    DealChangeRequest {
        id: big(id),
        created_ts: 0,
        request_type,
        duration: 7_200,
        price: big(77),
        status,
        deal_id: big(deal_id),
    }
}

pub fn name_certificate(owner: Address, validator: Address, name: &str) -> Certificate {
    Certificate {
        owner_id: owner,
        attribute: market_dwh::types::ATTRIBUTE_NAME,
        identity_level: 0,
        value: name.as_bytes().to_vec(),
        validator_id: validator,
    }
}

/// Polls `check` until it returns true or the timeout expires.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("condition not reached within timeout");
}
