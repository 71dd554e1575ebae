//! Domain entities for the marketplace projection.
//!
//! These types mirror the canonical on-chain state (deals, orders, profiles,
//! certificates, validators, workers) plus the denormalised columns the
//! warehouse maintains on top of them. Entities are created exclusively by
//! the event handlers; the query layer only reads them back.

use std::fmt;
use std::str::FromStr;

use num_bigint::BigUint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::utils::error::{DwhError, Result};

pub mod requests;

/// Upper bound on the number of benchmark columns a market may declare.
pub const NUM_MAX_BENCHMARKS: usize = 64;

/// Per-value benchmark bound; values are persisted in signed 64-bit columns.
pub const MAX_BENCHMARK_VALUE: u64 = i64::MAX as u64;

/// Width of zero-padded decimal big-integer columns. Padding makes
/// lexicographic order equal numeric order, which is what lets the query
/// compiler use plain `>=`/`<=` on price columns. 80 digits cover the full
/// 256-bit token range.
pub const PADDED_WIDTH: usize = 80;

/// Certificate attribute codes that patch profile columns.
pub const ATTRIBUTE_NAME: u64 = 1102;
pub const ATTRIBUTE_COUNTRY: u64 = 1103;

/// Renders a big integer as a zero-padded decimal string of [`PADDED_WIDTH`]
/// digits.
pub fn to_padded_string(value: &BigUint) -> String {
    format!("{value:0>width$}", width = PADDED_WIDTH)
}

/// Parses a (possibly padded) decimal string back into a big integer.
pub fn big_from_str(s: &str) -> Result<BigUint> {
    BigUint::from_str(s.trim_start_matches('0')).or_else(|_| {
        // An all-zero padded string trims to "", which is zero.
        if s.chars().all(|c| c == '0') && !s.is_empty() {
            Ok(BigUint::default())
        } else {
            Err(DwhError::Decoding(format!("invalid big integer `{s}`")))
        }
    })
}

/// Identity level encoded into a certificate attribute code.
pub fn attribute_identity_level(attribute: u64) -> u64 {
    (attribute / 100) % 10
}

/// A 20-byte account address, hex-encoded with a `0x` prefix in storage and
/// display. Comparison and storage always use the lowercase form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    #[must_use]
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase `0x`-prefixed hex form; the canonical storage encoding.
    #[must_use]
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = DwhError;

    fn from_str(s: &str) -> Result<Self> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped)
            .map_err(|e| DwhError::Decoding(format!("invalid address `{s}`: {e}")))?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| DwhError::Decoding(format!("invalid address length in `{s}`")))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Deal lifecycle state as reported by the Market contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DealStatus {
    #[default]
    Unknown = 0,
    Accepted = 1,
    Closed = 2,
}

impl DealStatus {
    #[must_use]
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::Accepted,
            2 => Self::Closed,
            _ => Self::Unknown,
        }
    }
}

/// Side of the book an order sits on. `Any` only appears in query requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OrderType {
    #[default]
    Any = 0,
    Bid = 1,
    Ask = 2,
}

impl OrderType {
    #[must_use]
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::Bid,
            2 => Self::Ask,
            _ => Self::Any,
        }
    }

    /// The matching side of the book.
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Bid => Self::Ask,
            Self::Ask => Self::Bid,
            Self::Any => Self::Any,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OrderStatus {
    #[default]
    Unknown = 0,
    Inactive = 1,
    Active = 2,
}

impl OrderStatus {
    #[must_use]
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::Inactive,
            2 => Self::Active,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ChangeRequestStatus {
    #[default]
    Unknown = 0,
    Created = 1,
    Accepted = 2,
    Rejected = 3,
    Cancelled = 4,
}

impl ChangeRequestStatus {
    #[must_use]
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::Created,
            2 => Self::Accepted,
            3 => Self::Rejected,
            4 => Self::Cancelled,
            _ => Self::Unknown,
        }
    }
}

/// Comparison operator used by netflags and validator-level filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CmpOp {
    #[default]
    Eq,
    Gte,
    Lte,
}

/// Canonical deal state fetched from the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    pub id: BigUint,
    pub supplier_id: Address,
    pub consumer_id: Address,
    pub master_id: Address,
    pub ask_id: BigUint,
    pub bid_id: BigUint,
    pub duration: u64,
    pub price: BigUint,
    pub start_time: i64,
    pub end_time: i64,
    pub status: DealStatus,
    pub blocked_balance: BigUint,
    pub total_payout: BigUint,
    pub last_bill_ts: i64,
    pub benchmarks: Vec<u64>,
}

/// A deal row as the warehouse stores it: the canonical deal plus cached
/// order attributes and issuer certificate blobs, so list queries need no
/// joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DwhDeal {
    pub deal: Deal,
    pub netflags: u64,
    pub ask_identity_level: u64,
    pub bid_identity_level: u64,
    pub supplier_certificates: String,
    pub consumer_certificates: String,
    pub active_change_request: bool,
}

/// Canonical order state fetched from the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: BigUint,
    /// Zero while the order is unmatched.
    pub deal_id: BigUint,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub author_id: Address,
    /// Zero address means "anyone may match".
    pub counterparty_id: Address,
    pub duration: u64,
    pub price: BigUint,
    pub netflags: u64,
    pub identity_level: u64,
    pub blacklist: String,
    pub tag: Vec<u8>,
    pub frozen_sum: BigUint,
    pub benchmarks: Vec<u64>,
}

/// An order row with the denormalised issuer-profile snapshot taken at
/// insert time and refreshed on certificate events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DwhOrder {
    pub order: Order,
    pub created_ts: i64,
    pub creator_identity_level: u64,
    pub creator_name: String,
    pub creator_country: String,
    pub creator_certificates: String,
}

/// One segment of a deal's economic-terms history. A new segment opens when
/// a change request is accepted; `end_time == 0` marks the open segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealCondition {
    pub id: u64,
    pub supplier_id: Address,
    pub consumer_id: Address,
    pub master_id: Address,
    pub duration: u64,
    pub price: BigUint,
    pub start_time: i64,
    pub end_time: i64,
    pub total_payout: BigUint,
    pub deal_id: BigUint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealChangeRequest {
    pub id: BigUint,
    pub created_ts: i64,
    pub request_type: OrderType,
    pub duration: u64,
    pub price: BigUint,
    pub status: ChangeRequestStatus,
    pub deal_id: BigUint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Profile {
    pub user_id: Address,
    pub identity_level: u64,
    pub name: String,
    pub country: String,
    pub is_corporation: bool,
    pub is_professional: bool,
    /// JSON array of the user's certificates, cached for snapshotting.
    pub certificates: String,
    pub active_asks: u64,
    pub active_bids: u64,
    /// Only populated by `get_profiles` in `IncludeAndMark` mode.
    pub is_blacklisted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub owner_id: Address,
    pub attribute: u64,
    pub identity_level: u64,
    pub value: Vec<u8>,
    pub validator_id: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub id: Address,
    /// Zero level means the validator has been deactivated.
    pub level: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub master_id: Address,
    pub slave_id: Address,
    pub confirmed: bool,
}
