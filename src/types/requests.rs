//! Query-layer request and reply types.
//!
//! These are the structured requests the external RPC surface hands to the
//! query service. Absent optional fields mean "no filter"; numeric zero
//! means the same for plain fields, matching the wire conventions of the
//! contract events.

use std::collections::BTreeMap;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use super::{
    Address, CmpOp, DealCondition, DealChangeRequest, DealStatus, DwhDeal, DwhOrder, OrderType,
    Profile, Validator, Worker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SortingOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortingOption {
    pub field: String,
    pub order: SortingOrder,
}

impl SortingOption {
    pub fn new(field: impl Into<String>, order: SortingOrder) -> Self {
        Self {
            field: field.into(),
            order,
        }
    }
}

/// Inclusive numeric range; a zero bound is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MaxMinU64 {
    pub min: u64,
    pub max: u64,
}

/// Inclusive big-integer range; `None` bounds are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MaxMinBig {
    pub min: Option<BigUint>,
    pub max: Option<BigUint>,
}

/// Inclusive timestamp range in seconds; zero bounds are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MaxMinTimestamp {
    pub min: i64,
    pub max: i64,
}

/// A value compared under an explicit operator (netflags, validator level).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CmpFilter {
    pub operator: CmpOp,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DealsRequest {
    pub status: DealStatus,
    pub supplier_id: Option<Address>,
    pub consumer_id: Option<Address>,
    pub master_id: Option<Address>,
    pub ask_id: Option<BigUint>,
    pub bid_id: Option<BigUint>,
    pub duration: Option<MaxMinU64>,
    pub price: Option<MaxMinBig>,
    pub netflags: Option<CmpFilter>,
    pub ask_identity_level: u64,
    pub bid_identity_level: u64,
    /// Benchmark ranges keyed by benchmark index. A BTreeMap keeps the
    /// emitted SQL deterministic.
    pub benchmarks: BTreeMap<u64, MaxMinU64>,
    pub sortings: Vec<SortingOption>,
    pub offset: u64,
    pub limit: u64,
    pub with_count: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DealsReply {
    pub deals: Vec<DwhDeal>,
    pub count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DealConditionsRequest {
    pub deal_id: BigUint,
    pub sortings: Vec<SortingOption>,
    pub offset: u64,
    pub limit: u64,
    pub with_count: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DealConditionsReply {
    pub conditions: Vec<DealCondition>,
    pub count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OrdersRequest {
    pub deal_id: Option<BigUint>,
    pub order_type: OrderType,
    pub author_id: Option<Address>,
    pub counterparty_id: Option<Address>,
    pub duration: Option<MaxMinU64>,
    pub price: Option<MaxMinBig>,
    pub netflags: Option<CmpFilter>,
    pub creator_identity_level: u64,
    pub created_ts: Option<MaxMinTimestamp>,
    pub benchmarks: BTreeMap<u64, MaxMinU64>,
    pub sortings: Vec<SortingOption>,
    pub offset: u64,
    pub limit: u64,
    pub with_count: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OrdersReply {
    pub orders: Vec<DwhOrder>,
    pub count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MatchingOrdersRequest {
    pub id: BigUint,
    pub offset: u64,
    pub limit: u64,
    pub with_count: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProfileRole {
    #[default]
    Any,
    Supplier,
    Consumer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlacklistOption {
    /// Exclude profiles blacklisted by the owner.
    WithoutMatching,
    /// Return only profiles blacklisted by the owner.
    OnlyMatching,
    /// Return everything but flag blacklisted profiles.
    IncludeAndMark,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistQuery {
    pub owner_id: Address,
    pub option: BlacklistOption,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProfilesRequest {
    pub role: ProfileRole,
    pub identity_level: u64,
    pub country: String,
    /// Matched with SQL `LIKE`; callers supply their own wildcards.
    pub name: String,
    pub blacklist_query: Option<BlacklistQuery>,
    pub sortings: Vec<SortingOption>,
    pub offset: u64,
    pub limit: u64,
    pub with_count: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProfilesReply {
    pub profiles: Vec<Profile>,
    pub count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlacklistRequest {
    pub owner_id: Option<Address>,
    pub offset: u64,
    pub limit: u64,
    pub with_count: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlacklistReply {
    pub owner_id: Option<Address>,
    pub addresses: Vec<Address>,
    pub count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ValidatorsRequest {
    pub validator_level: Option<CmpFilter>,
    pub sortings: Vec<SortingOption>,
    pub offset: u64,
    pub limit: u64,
    pub with_count: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ValidatorsReply {
    pub validators: Vec<Validator>,
    pub count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WorkersRequest {
    pub master_id: Option<Address>,
    pub offset: u64,
    pub limit: u64,
    pub with_count: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WorkersReply {
    pub workers: Vec<Worker>,
    pub count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DealChangeRequestsReply {
    pub requests: Vec<DealChangeRequest>,
}
