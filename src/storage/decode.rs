//! Row decoders: `AnyRow` back into domain entities.
//!
//! Columns are read by physical index in table order, matching the schema in
//! the parent module. Big integers come back from their padded decimal
//! encoding, addresses from hex, opaque byte payloads from hex TEXT, and
//! booleans from 0/1 integers.

use num_bigint::BigUint;
use sqlx::any::AnyRow;
use sqlx::Row;

use crate::types::{
    big_from_str, Address, Certificate, ChangeRequestStatus, Deal, DealChangeRequest,
    DealCondition, DealStatus, DwhDeal, DwhOrder, Order, OrderStatus, OrderType, Profile,
    Validator, Worker,
};
use crate::utils::error::{DwhError, Result};

fn get_i64(row: &AnyRow, idx: usize) -> Result<i64> {
    Ok(row.try_get::<i64, _>(idx)?)
}

fn get_u64(row: &AnyRow, idx: usize) -> Result<u64> {
    Ok(get_i64(row, idx)? as u64)
}

fn get_bool(row: &AnyRow, idx: usize) -> Result<bool> {
    Ok(get_i64(row, idx)? != 0)
}

fn get_string(row: &AnyRow, idx: usize) -> Result<String> {
    Ok(row.try_get::<String, _>(idx)?)
}

fn get_big(row: &AnyRow, idx: usize) -> Result<BigUint> {
    big_from_str(&get_string(row, idx)?)
}

fn get_address(row: &AnyRow, idx: usize) -> Result<Address> {
    get_string(row, idx)?.parse()
}

fn get_bytes(row: &AnyRow, idx: usize) -> Result<Vec<u8>> {
    let encoded = get_string(row, idx)?;
    hex::decode(&encoded).map_err(|e| DwhError::Decoding(format!("invalid hex payload: {e}")))
}

fn get_benchmarks(row: &AnyRow, start: usize, num_benchmarks: usize) -> Result<Vec<u64>> {
    (start..start + num_benchmarks)
        .map(|idx| get_u64(row, idx))
        .collect()
}

pub fn decode_deal(row: &AnyRow, num_benchmarks: usize) -> Result<DwhDeal> {
    Ok(DwhDeal {
        deal: Deal {
            id: get_big(row, 0)?,
            supplier_id: get_address(row, 1)?,
            consumer_id: get_address(row, 2)?,
            master_id: get_address(row, 3)?,
            ask_id: get_big(row, 4)?,
            bid_id: get_big(row, 5)?,
            duration: get_u64(row, 6)?,
            price: get_big(row, 7)?,
            start_time: get_i64(row, 8)?,
            end_time: get_i64(row, 9)?,
            status: DealStatus::from_i64(get_i64(row, 10)?),
            blocked_balance: get_big(row, 11)?,
            total_payout: get_big(row, 12)?,
            last_bill_ts: get_i64(row, 13)?,
            benchmarks: get_benchmarks(row, 20, num_benchmarks)?,
        },
        netflags: get_u64(row, 14)?,
        ask_identity_level: get_u64(row, 15)?,
        bid_identity_level: get_u64(row, 16)?,
        supplier_certificates: get_string(row, 17)?,
        consumer_certificates: get_string(row, 18)?,
        active_change_request: get_bool(row, 19)?,
    })
}

pub fn decode_order(row: &AnyRow, num_benchmarks: usize) -> Result<DwhOrder> {
    Ok(DwhOrder {
        order: Order {
            id: get_big(row, 0)?,
            deal_id: get_big(row, 2)?,
            order_type: OrderType::from_i64(get_i64(row, 3)?),
            status: OrderStatus::from_i64(get_i64(row, 4)?),
            author_id: get_address(row, 5)?,
            counterparty_id: get_address(row, 6)?,
            duration: get_u64(row, 7)?,
            price: get_big(row, 8)?,
            netflags: get_u64(row, 9)?,
            identity_level: get_u64(row, 10)?,
            blacklist: get_string(row, 11)?,
            tag: get_bytes(row, 12)?,
            frozen_sum: get_big(row, 13)?,
            benchmarks: get_benchmarks(row, 18, num_benchmarks)?,
        },
        created_ts: get_i64(row, 1)?,
        creator_identity_level: get_u64(row, 14)?,
        creator_name: get_string(row, 15)?,
        creator_country: get_string(row, 16)?,
        creator_certificates: get_string(row, 17)?,
    })
}

pub fn decode_deal_condition(row: &AnyRow) -> Result<DealCondition> {
    Ok(DealCondition {
        id: get_u64(row, 0)?,
        supplier_id: get_address(row, 1)?,
        consumer_id: get_address(row, 2)?,
        master_id: get_address(row, 3)?,
        duration: get_u64(row, 4)?,
        price: get_big(row, 5)?,
        start_time: get_i64(row, 6)?,
        end_time: get_i64(row, 7)?,
        total_payout: get_big(row, 8)?,
        deal_id: get_big(row, 9)?,
    })
}

pub fn decode_change_request(row: &AnyRow) -> Result<DealChangeRequest> {
    Ok(DealChangeRequest {
        id: get_big(row, 0)?,
        created_ts: get_i64(row, 1)?,
        request_type: OrderType::from_i64(get_i64(row, 2)?),
        duration: get_u64(row, 3)?,
        price: get_big(row, 4)?,
        status: ChangeRequestStatus::from_i64(get_i64(row, 5)?),
        deal_id: get_big(row, 6)?,
    })
}

pub fn decode_profile(row: &AnyRow) -> Result<Profile> {
    // Index 0 is the synthetic auto-increment id.
    Ok(Profile {
        user_id: get_address(row, 1)?,
        identity_level: get_u64(row, 2)?,
        name: get_string(row, 3)?,
        country: get_string(row, 4)?,
        is_corporation: get_bool(row, 5)?,
        is_professional: get_bool(row, 6)?,
        certificates: get_string(row, 7)?,
        active_asks: get_u64(row, 8)?,
        active_bids: get_u64(row, 9)?,
        is_blacklisted: false,
    })
}

pub fn decode_certificate(row: &AnyRow) -> Result<Certificate> {
    Ok(Certificate {
        owner_id: get_address(row, 0)?,
        attribute: get_u64(row, 1)?,
        identity_level: get_u64(row, 2)?,
        value: get_bytes(row, 3)?,
        validator_id: get_address(row, 4)?,
    })
}

pub fn decode_validator(row: &AnyRow) -> Result<Validator> {
    Ok(Validator {
        id: get_address(row, 0)?,
        level: get_u64(row, 1)?,
    })
}

pub fn decode_worker(row: &AnyRow) -> Result<Worker> {
    Ok(Worker {
        master_id: get_address(row, 0)?,
        slave_id: get_address(row, 1)?,
        confirmed: get_bool(row, 2)?,
    })
}

/// Blacklist rows are plain (adder, addee) pairs.
pub fn decode_blacklist_entry(row: &AnyRow) -> Result<(Address, Address)> {
    Ok((get_address(row, 0)?, get_address(row, 1)?))
}
