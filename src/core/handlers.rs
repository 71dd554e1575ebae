//! The projection engine: one handler per event variant.
//!
//! Every handler follows the same contract: fetch the canonical entity state
//! from the chain first (outside the ingestion lock), then apply a single
//! atomic projection update under the write lock. Multi-statement updates
//! run inside one transaction; dropping the transaction on an early `?`
//! rolls everything back.

use num_bigint::BigUint;

use crate::storage::query::SqlValue;
use crate::types::{
    attribute_identity_level, Address, Certificate, ChangeRequestStatus, DealCondition, DealStatus,
    DwhDeal, DwhOrder, OrderStatus, OrderType, Profile, ATTRIBUTE_COUNTRY, ATTRIBUTE_NAME,
};
use crate::utils::error::{DwhError, Result};

use super::indexer::Dwh;

impl Dwh {
    pub(crate) async fn on_deal_opened(&self, deal_id: &BigUint) -> Result<()> {
        let deal = self.chain()?.deal_info(deal_id).await?;

        let _guard = self.lock.write().await;
        self.check_benchmarks(&deal.benchmarks)?;

        let mut tx = self.storage.pool().begin().await?;

        // The referenced orders must already be projected; their snapshot
        // feeds the deal's cached columns. A missing order sends the event
        // into the retry path until its OrderPlaced sibling has landed.
        let ask = self
            .storage
            .fetch_order(&mut tx, &deal.ask_id)
            .await?
            .ok_or_else(|| DwhError::NotFound(format!("ask order {}", deal.ask_id)))?;
        let bid = self
            .storage
            .fetch_order(&mut tx, &deal.bid_id)
            .await?
            .ok_or_else(|| DwhError::NotFound(format!("bid order {}", deal.bid_id)))?;

        let change_requests = self
            .storage
            .fetch_change_requests_by_deal(&mut tx, &deal.id)
            .await?;

        let row = DwhDeal {
            netflags: ask.order.netflags,
            ask_identity_level: ask.order.identity_level,
            bid_identity_level: bid.order.identity_level,
            supplier_certificates: ask.creator_certificates.clone(),
            consumer_certificates: bid.creator_certificates.clone(),
            active_change_request: !change_requests.is_empty(),
            deal,
        };
        self.storage.insert_deal(&mut tx, &row).await?;

        let condition = DealCondition {
            id: 0,
            supplier_id: row.deal.supplier_id,
            consumer_id: row.deal.consumer_id,
            master_id: row.deal.master_id,
            duration: row.deal.duration,
            price: row.deal.price.clone(),
            start_time: row.deal.start_time,
            end_time: 0,
            total_payout: row.deal.total_payout.clone(),
            deal_id: row.deal.id.clone(),
        };
        self.storage.insert_deal_condition(&mut tx, &condition).await?;

        tx.commit().await?;
        Ok(())
    }

    pub(crate) async fn on_deal_updated(&self, deal_id: &BigUint) -> Result<()> {
        let deal = self.chain()?.deal_info(deal_id).await?;

        let _guard = self.lock.write().await;

        // A closed deal is purged together with both of its orders.
        if deal.status == DealStatus::Closed {
            let mut tx = self.storage.pool().begin().await?;
            self.storage.delete_deal(&mut tx, &deal.id).await?;
            self.storage.delete_order(&mut tx, &deal.ask_id).await?;
            self.storage.delete_order(&mut tx, &deal.bid_id).await?;
            tx.commit().await?;
            return Ok(());
        }

        let mut conn = self.storage.pool().acquire().await?;
        self.storage.update_deal(&mut conn, &deal).await
    }

    pub(crate) async fn on_order_placed(&self, event_ts: u64, order_id: &BigUint) -> Result<()> {
        let order = self.chain()?.order_info(order_id).await?;

        let _guard = self.lock.write().await;
        let mut tx = self.storage.pool().begin().await?;

        let profile = match self.storage.fetch_profile(&mut tx, order.author_id).await? {
            None => {
                let (asks, bids) = if order.order_type == OrderType::Ask {
                    (1, 0)
                } else {
                    (0, 1)
                };
                let profile = Profile {
                    user_id: order.author_id,
                    certificates: empty_certificates_blob(),
                    active_asks: asks,
                    active_bids: bids,
                    ..Profile::default()
                };
                self.storage.insert_profile(&mut tx, &profile).await?;
                profile
            }
            Some(profile) => {
                self.update_profile_stats(&mut tx, order.order_type, &profile, 1)
                    .await?;
                profile
            }
        };

        // An inactive unmatched order never makes it into the book; only the
        // profile bookkeeping is kept.
        if order.status == OrderStatus::Inactive && order.deal_id == BigUint::default() {
            tx.commit().await?;
            tracing::info!(order_id = %order.id, "skipping inactive order");
            return Ok(());
        }

        self.check_benchmarks(&order.benchmarks)?;

        let row = DwhOrder {
            created_ts: event_ts as i64,
            creator_identity_level: profile.identity_level,
            creator_name: profile.name.clone(),
            creator_country: profile.country.clone(),
            creator_certificates: profile.certificates.clone(),
            order,
        };
        self.storage.insert_order(&mut tx, &row).await?;

        tx.commit().await?;
        Ok(())
    }

    pub(crate) async fn on_order_updated(&self, order_id: &BigUint) -> Result<()> {
        let order = self.chain()?.order_info(order_id).await?;

        let _guard = self.lock.write().await;
        let mut tx = self.storage.pool().begin().await?;

        // An updated order without a deal was cancelled; one with a deal
        // only changes status (the matched copy lives on in the deal).
        if order.deal_id == BigUint::default() {
            self.storage.delete_order(&mut tx, &order.id).await?;
        } else {
            self.storage
                .update_order_status(&mut tx, &order.id, order.status)
                .await?;
        }

        let profile = self
            .storage
            .fetch_profile(&mut tx, order.author_id)
            .await?
            .ok_or_else(|| DwhError::NotFound(format!("profile {}", order.author_id)))?;
        self.update_profile_stats(&mut tx, order.order_type, &profile, -1)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub(crate) async fn on_deal_change_request_sent(
        &self,
        event_ts: u64,
        change_request_id: &BigUint,
    ) -> Result<()> {
        let mut change_request = self.chain()?.change_request_info(change_request_id).await?;

        if change_request.status != ChangeRequestStatus::Created {
            tracing::info!(
                status = ?change_request.status,
                "ignoring change request event with non-created status"
            );
            return Ok(());
        }

        let _guard = self.lock.write().await;
        let mut tx = self.storage.pool().begin().await?;

        // At most one CREATED request per (deal, type): a newer one
        // supersedes anything still pending.
        let expired = self
            .storage
            .fetch_matching_change_requests(
                &mut tx,
                &change_request.deal_id,
                change_request.request_type,
                ChangeRequestStatus::Created,
            )
            .await?;
        for old in &expired {
            self.storage.delete_change_request(&mut tx, &old.id).await?;
            tracing::warn!(id = %old.id, "deleted expired deal change request");
        }

        change_request.created_ts = event_ts as i64;
        self.storage
            .insert_change_request(&mut tx, &change_request)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub(crate) async fn on_deal_change_request_updated(
        &self,
        event_ts: u64,
        change_request_id: &BigUint,
    ) -> Result<()> {
        let change_request = self.chain()?.change_request_info(change_request_id).await?;

        let _guard = self.lock.write().await;

        match change_request.status {
            ChangeRequestStatus::Rejected => {
                let mut conn = self.storage.pool().acquire().await?;
                self.storage
                    .update_change_request_status(
                        &mut conn,
                        &change_request.id,
                        ChangeRequestStatus::Rejected,
                    )
                    .await?;
            }
            ChangeRequestStatus::Accepted => {
                let mut tx = self.storage.pool().begin().await?;

                let deal = self
                    .storage
                    .fetch_deal(&mut tx, &change_request.deal_id)
                    .await?
                    .ok_or_else(|| {
                        DwhError::NotFound(format!("deal {}", change_request.deal_id))
                    })?;

                // Close the running condition segment and open a new one
                // with the accepted terms.
                let current = self
                    .storage
                    .fetch_latest_deal_condition(&mut tx, &change_request.deal_id)
                    .await?
                    .ok_or_else(|| {
                        DwhError::NotFound(format!(
                            "deal conditions for deal {}",
                            change_request.deal_id
                        ))
                    })?;
                self.storage
                    .update_condition_end_time(&mut tx, current.id, event_ts as i64)
                    .await?;

                let next = DealCondition {
                    id: 0,
                    supplier_id: deal.deal.supplier_id,
                    consumer_id: deal.deal.consumer_id,
                    master_id: deal.deal.master_id,
                    duration: change_request.duration,
                    price: change_request.price.clone(),
                    start_time: event_ts as i64,
                    end_time: 0,
                    total_payout: BigUint::default(),
                    deal_id: deal.deal.id.clone(),
                };
                self.storage.insert_deal_condition(&mut tx, &next).await?;
                self.storage
                    .delete_change_request(&mut tx, &change_request.id)
                    .await?;

                tx.commit().await?;
            }
            _ => {
                let mut conn = self.storage.pool().acquire().await?;
                self.storage
                    .delete_change_request(&mut conn, &change_request.id)
                    .await?;
            }
        }

        Ok(())
    }

    pub(crate) async fn on_billed(
        &self,
        event_ts: u64,
        deal_id: &BigUint,
        paid_amount: &BigUint,
    ) -> Result<()> {
        let _guard = self.lock.write().await;
        let mut tx = self.storage.pool().begin().await?;

        let condition = self
            .storage
            .fetch_latest_deal_condition(&mut tx, deal_id)
            .await?
            .ok_or_else(|| DwhError::NotFound(format!("deal conditions for deal {deal_id}")))?;
        let condition_payout = &condition.total_payout + paid_amount;
        self.storage
            .update_condition_payout(&mut tx, condition.id, &condition_payout)
            .await?;

        let deal = self
            .storage
            .fetch_deal(&mut tx, deal_id)
            .await?
            .ok_or_else(|| DwhError::NotFound(format!("deal {deal_id}")))?;
        let deal_payout = &deal.deal.total_payout + paid_amount;
        self.storage
            .update_deal_payout(&mut tx, deal_id, &deal_payout)
            .await?;

        // The payment row doubles as the idempotency key: replaying the same
        // Billed event violates its uniqueness constraint and rolls the
        // whole accrual back.
        self.storage
            .insert_deal_payment(&mut tx, event_ts as i64, paid_amount, deal_id)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub(crate) async fn on_worker_announced(
        &self,
        master_id: Address,
        slave_id: Address,
    ) -> Result<()> {
        let _guard = self.lock.write().await;
        let mut conn = self.storage.pool().acquire().await?;
        self.storage
            .insert_worker(&mut conn, master_id, slave_id, false)
            .await
    }

    pub(crate) async fn on_worker_confirmed(
        &self,
        master_id: Address,
        slave_id: Address,
    ) -> Result<()> {
        let _guard = self.lock.write().await;
        let mut conn = self.storage.pool().acquire().await?;
        self.storage
            .update_worker_confirmed(&mut conn, master_id, slave_id, true)
            .await
    }

    pub(crate) async fn on_worker_removed(
        &self,
        master_id: Address,
        slave_id: Address,
    ) -> Result<()> {
        let _guard = self.lock.write().await;
        let mut conn = self.storage.pool().acquire().await?;
        self.storage
            .delete_worker(&mut conn, master_id, slave_id)
            .await
    }

    pub(crate) async fn on_added_to_blacklist(
        &self,
        adder_id: Address,
        addee_id: Address,
    ) -> Result<()> {
        let _guard = self.lock.write().await;
        let mut conn = self.storage.pool().acquire().await?;
        self.storage
            .insert_blacklist_entry(&mut conn, adder_id, addee_id)
            .await
    }

    pub(crate) async fn on_removed_from_blacklist(
        &self,
        remover_id: Address,
        removee_id: Address,
    ) -> Result<()> {
        let _guard = self.lock.write().await;
        let mut conn = self.storage.pool().acquire().await?;
        self.storage
            .delete_blacklist_entry(&mut conn, remover_id, removee_id)
            .await
    }

    pub(crate) async fn on_validator_created(&self, validator_id: Address) -> Result<()> {
        let validator = self.chain()?.validator(validator_id).await?;

        let _guard = self.lock.write().await;
        let mut conn = self.storage.pool().acquire().await?;
        self.storage.insert_validator(&mut conn, &validator).await
    }

    pub(crate) async fn on_validator_deleted(&self, validator_id: Address) -> Result<()> {
        // Deletion is soft: the registry reports the validator with level 0.
        let validator = self.chain()?.validator(validator_id).await?;

        let _guard = self.lock.write().await;
        let mut conn = self.storage.pool().acquire().await?;
        self.storage.update_validator(&mut conn, &validator).await
    }

    pub(crate) async fn on_certificate_created(&self, certificate_id: &BigUint) -> Result<()> {
        let fetched = self.chain()?.certificate(certificate_id).await?;
        let certificate = Certificate {
            identity_level: attribute_identity_level(fetched.attribute),
            ..fetched
        };

        let _guard = self.lock.write().await;
        let mut tx = self.storage.pool().begin().await?;

        self.storage.insert_certificate(&mut tx, &certificate).await?;

        if self
            .storage
            .fetch_profile(&mut tx, certificate.owner_id)
            .await?
            .is_none()
        {
            let profile = Profile {
                user_id: certificate.owner_id,
                certificates: empty_certificates_blob(),
                ..Profile::default()
            };
            self.storage.insert_profile(&mut tx, &profile).await?;
        }

        // Name and Country certificates patch their profile column directly.
        match certificate.attribute {
            ATTRIBUTE_NAME => {
                self.storage
                    .update_profile_field(
                        &mut tx,
                        certificate.owner_id,
                        "Name",
                        SqlValue::Text(String::from_utf8_lossy(&certificate.value).into_owned()),
                    )
                    .await?;
            }
            ATTRIBUTE_COUNTRY => {
                self.storage
                    .update_profile_field(
                        &mut tx,
                        certificate.owner_id,
                        "Country",
                        SqlValue::Text(String::from_utf8_lossy(&certificate.value).into_owned()),
                    )
                    .await?;
            }
            _ => {}
        }

        // Recompute the cached certificates blob and the derived identity
        // level from everything the user now holds.
        let certificates = self
            .storage
            .fetch_certificates(&mut tx, certificate.owner_id)
            .await?;
        let max_identity_level = certificates
            .iter()
            .map(|c| c.identity_level)
            .max()
            .unwrap_or(0);
        let blob = serde_json::to_string(&certificates)
            .map_err(|e| DwhError::Internal(format!("failed to serialise certificates: {e}")))?;

        self.storage
            .update_profile_field(
                &mut tx,
                certificate.owner_id,
                "Certificates",
                SqlValue::Text(blob),
            )
            .await?;
        self.storage
            .update_profile_field(
                &mut tx,
                certificate.owner_id,
                "IdentityLevel",
                SqlValue::Int(max_identity_level as i64),
            )
            .await?;

        // Fan the refreshed snapshot out into every row that denormalises
        // this user's profile.
        let profile = self
            .storage
            .fetch_profile(&mut tx, certificate.owner_id)
            .await?
            .ok_or_else(|| DwhError::NotFound(format!("profile {}", certificate.owner_id)))?;
        self.storage.update_orders_creator(&mut tx, &profile).await?;
        self.storage
            .update_deals_supplier_certificates(&mut tx, profile.user_id, &profile.certificates)
            .await?;
        self.storage
            .update_deals_consumer_certificates(&mut tx, profile.user_id, &profile.certificates)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Adjusts the author's active-order counter, refusing to go negative.
    async fn update_profile_stats(
        &self,
        conn: &mut sqlx::AnyConnection,
        order_type: OrderType,
        profile: &Profile,
        delta: i64,
    ) -> Result<()> {
        let (field, current) = if order_type == OrderType::Ask {
            ("ActiveAsks", profile.active_asks)
        } else {
            ("ActiveBids", profile.active_bids)
        };

        let updated = current as i64 + delta;
        if updated < 0 {
            return Err(DwhError::Internal(format!(
                "active order counter for {} would become negative",
                profile.user_id
            )));
        }

        self.storage
            .update_profile_field(conn, profile.user_id, field, SqlValue::Int(updated))
            .await
    }
}

fn empty_certificates_blob() -> String {
    "[]".to_string()
}
