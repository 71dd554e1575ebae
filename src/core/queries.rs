//! The read-only query service over the projection.
//!
//! Each public method takes the shared side of the ingestion lock, compiles
//! the request through the filter DSL, executes it, and decodes the rows
//! back into domain entities. Compilation failures cannot arise from
//! validated requests, so execution errors surface as-is and the RPC layer
//! maps them to `Internal`; missing rows on detail getters surface as
//! `NotFound`.

use num_bigint::BigUint;

use crate::storage::query::{
    benchmark_column, Connective, CustomFilter, Filter, FilterOp, QueryOpts,
};
use crate::storage::{column_sets, decode};
use crate::types::requests::{
    BlacklistOption, BlacklistReply, BlacklistRequest, DealChangeRequestsReply,
    DealConditionsReply, DealConditionsRequest, DealsReply, DealsRequest, MatchingOrdersRequest,
    MaxMinU64, OrdersReply, OrdersRequest, ProfileRole, ProfilesReply, ProfilesRequest,
    SortingOption, SortingOrder, ValidatorsReply, ValidatorsRequest, WorkersReply, WorkersRequest,
};
use crate::types::{
    to_padded_string, Address, CmpOp, DealStatus, DwhDeal, DwhOrder, OrderStatus, OrderType,
    Profile,
};
use crate::utils::error::{DwhError, Result};

use super::indexer::Dwh;

fn cmp_filter_op(op: CmpOp) -> FilterOp {
    match op {
        CmpOp::Eq => FilterOp::Eq,
        CmpOp::Gte => FilterOp::Gte,
        CmpOp::Lte => FilterOp::Lte,
    }
}

/// Appends min/max range predicates for every requested benchmark.
fn push_benchmark_filters(
    filters: &mut Vec<Filter>,
    benchmarks: &std::collections::BTreeMap<u64, MaxMinU64>,
) {
    for (bench_id, range) in benchmarks {
        if range.max > 0 {
            filters.push(Filter::new(
                benchmark_column(*bench_id),
                FilterOp::Lte,
                range.max,
                Connective::And,
            ));
        }
        if range.min > 0 {
            filters.push(Filter::new(
                benchmark_column(*bench_id),
                FilterOp::Gte,
                range.min,
                Connective::And,
            ));
        }
    }
}

impl Dwh {
    pub async fn get_deals(&self, request: &DealsRequest) -> Result<DealsReply> {
        let _guard = self.lock.read().await;
        self.deals_inner(request).await
    }

    async fn deals_inner(&self, request: &DealsRequest) -> Result<DealsReply> {
        let mut filters = Vec::new();
        if request.status != DealStatus::Unknown {
            filters.push(Filter::new(
                "Status",
                FilterOp::Eq,
                request.status as i64,
                Connective::And,
            ));
        }
        if let Some(supplier_id) = request.supplier_id.filter(|a| !a.is_zero()) {
            filters.push(Filter::new(
                "SupplierID",
                FilterOp::Eq,
                supplier_id.to_hex(),
                Connective::And,
            ));
        }
        if let Some(consumer_id) = request.consumer_id.filter(|a| !a.is_zero()) {
            filters.push(Filter::new(
                "ConsumerID",
                FilterOp::Eq,
                consumer_id.to_hex(),
                Connective::And,
            ));
        }
        if let Some(master_id) = request.master_id.filter(|a| !a.is_zero()) {
            filters.push(Filter::new(
                "MasterID",
                FilterOp::Eq,
                master_id.to_hex(),
                Connective::And,
            ));
        }
        if let Some(ask_id) = &request.ask_id {
            filters.push(Filter::new(
                "AskID",
                FilterOp::Eq,
                ask_id.to_string(),
                Connective::And,
            ));
        }
        if let Some(bid_id) = &request.bid_id {
            filters.push(Filter::new(
                "BidID",
                FilterOp::Eq,
                bid_id.to_string(),
                Connective::And,
            ));
        }
        if let Some(duration) = &request.duration {
            if duration.max > 0 {
                filters.push(Filter::new(
                    "Duration",
                    FilterOp::Lte,
                    duration.max,
                    Connective::And,
                ));
            }
            filters.push(Filter::new(
                "Duration",
                FilterOp::Gte,
                duration.min,
                Connective::And,
            ));
        }
        if let Some(price) = &request.price {
            if let Some(max) = &price.max {
                filters.push(Filter::new(
                    "Price",
                    FilterOp::Lte,
                    to_padded_string(max),
                    Connective::And,
                ));
            }
            if let Some(min) = &price.min {
                filters.push(Filter::new(
                    "Price",
                    FilterOp::Gte,
                    to_padded_string(min),
                    Connective::And,
                ));
            }
        }
        if let Some(netflags) = &request.netflags {
            if netflags.value > 0 {
                filters.push(Filter::netflags(netflags.operator, netflags.value));
            }
        }
        if request.ask_identity_level > 0 {
            filters.push(Filter::new(
                "AskIdentityLevel",
                FilterOp::Gte,
                request.ask_identity_level,
                Connective::And,
            ));
        }
        if request.bid_identity_level > 0 {
            filters.push(Filter::new(
                "BidIdentityLevel",
                FilterOp::Gte,
                request.bid_identity_level,
                Connective::And,
            ));
        }
        push_benchmark_filters(&mut filters, &request.benchmarks);

        let opts = QueryOpts {
            filters,
            sortings: self
                .storage
                .whitelist_sortings(&request.sortings, column_sets::DEALS),
            offset: request.offset,
            limit: request.limit,
            with_count: request.with_count,
            ..QueryOpts::new("Deals")
        };

        let mut conn = self.storage.pool().acquire().await?;
        let (rows, count) = self.storage.run_query(&mut conn, &opts).await?;
        let deals = rows
            .iter()
            .map(|row| decode::decode_deal(row, self.num_benchmarks()))
            .collect::<Result<Vec<_>>>()?;

        Ok(DealsReply { deals, count })
    }

    pub async fn get_deal_details(&self, deal_id: &BigUint) -> Result<DwhDeal> {
        let _guard = self.lock.read().await;
        let mut conn = self.storage.pool().acquire().await?;
        self.storage
            .fetch_deal(&mut conn, deal_id)
            .await?
            .ok_or_else(|| DwhError::NotFound(format!("deal {deal_id}")))
    }

    pub async fn get_deal_conditions(
        &self,
        request: &DealConditionsRequest,
    ) -> Result<DealConditionsReply> {
        let _guard = self.lock.read().await;
        self.deal_conditions_inner(request).await
    }

    async fn deal_conditions_inner(
        &self,
        request: &DealConditionsRequest,
    ) -> Result<DealConditionsReply> {
        // Newest condition first unless the caller asked otherwise.
        let sortings = if request.sortings.is_empty() {
            vec![SortingOption::new("Id", SortingOrder::Desc)]
        } else {
            self.storage
                .whitelist_sortings(&request.sortings, column_sets::DEAL_CONDITIONS)
        };

        let opts = QueryOpts {
            filters: vec![Filter::new(
                "DealID",
                FilterOp::Eq,
                request.deal_id.to_string(),
                Connective::And,
            )],
            sortings,
            offset: request.offset,
            limit: request.limit,
            with_count: request.with_count,
            ..QueryOpts::new("DealConditions")
        };

        let mut conn = self.storage.pool().acquire().await?;
        let (rows, count) = self.storage.run_query(&mut conn, &opts).await?;
        let conditions = rows
            .iter()
            .map(decode::decode_deal_condition)
            .collect::<Result<Vec<_>>>()?;

        Ok(DealConditionsReply { conditions, count })
    }

    pub async fn get_orders(&self, request: &OrdersRequest) -> Result<OrdersReply> {
        let _guard = self.lock.read().await;
        self.orders_inner(request).await
    }

    async fn orders_inner(&self, request: &OrdersRequest) -> Result<OrdersReply> {
        let mut filters = vec![Filter::new(
            "Status",
            FilterOp::Eq,
            OrderStatus::Active as i64,
            Connective::And,
        )];
        if let Some(deal_id) = &request.deal_id {
            filters.push(Filter::new(
                "DealID",
                FilterOp::Eq,
                deal_id.to_string(),
                Connective::And,
            ));
        }
        if request.order_type != OrderType::Any {
            filters.push(Filter::new(
                "Type",
                FilterOp::Eq,
                request.order_type as i64,
                Connective::And,
            ));
        }
        if let Some(author_id) = request.author_id.filter(|a| !a.is_zero()) {
            filters.push(Filter::new(
                "AuthorID",
                FilterOp::Eq,
                author_id.to_hex(),
                Connective::And,
            ));
        }
        if let Some(counterparty_id) = request.counterparty_id.filter(|a| !a.is_zero()) {
            filters.push(Filter::new(
                "CounterpartyID",
                FilterOp::Eq,
                counterparty_id.to_hex(),
                Connective::And,
            ));
        }
        if let Some(duration) = &request.duration {
            if duration.max > 0 {
                filters.push(Filter::new(
                    "Duration",
                    FilterOp::Lte,
                    duration.max,
                    Connective::And,
                ));
            }
            filters.push(Filter::new(
                "Duration",
                FilterOp::Gte,
                duration.min,
                Connective::And,
            ));
        }
        if let Some(price) = &request.price {
            if let Some(max) = &price.max {
                filters.push(Filter::new(
                    "Price",
                    FilterOp::Lte,
                    to_padded_string(max),
                    Connective::And,
                ));
            }
            if let Some(min) = &price.min {
                filters.push(Filter::new(
                    "Price",
                    FilterOp::Gte,
                    to_padded_string(min),
                    Connective::And,
                ));
            }
        }
        if let Some(netflags) = &request.netflags {
            if netflags.value > 0 {
                filters.push(Filter::netflags(netflags.operator, netflags.value));
            }
        }
        if request.creator_identity_level > 0 {
            filters.push(Filter::new(
                "CreatorIdentityLevel",
                FilterOp::Gte,
                request.creator_identity_level,
                Connective::And,
            ));
        }
        if let Some(created_ts) = &request.created_ts {
            if created_ts.max > 0 {
                filters.push(Filter::new(
                    "CreatedTS",
                    FilterOp::Lte,
                    created_ts.max,
                    Connective::And,
                ));
            }
            if created_ts.min > 0 {
                filters.push(Filter::new(
                    "CreatedTS",
                    FilterOp::Gte,
                    created_ts.min,
                    Connective::And,
                ));
            }
        }
        push_benchmark_filters(&mut filters, &request.benchmarks);

        let opts = QueryOpts {
            filters,
            sortings: self
                .storage
                .whitelist_sortings(&request.sortings, column_sets::ORDERS),
            offset: request.offset,
            limit: request.limit,
            with_count: request.with_count,
            ..QueryOpts::new("Orders")
        };

        let mut conn = self.storage.pool().acquire().await?;
        let (rows, count) = self.storage.run_query(&mut conn, &opts).await?;
        let orders = rows
            .iter()
            .map(|row| decode::decode_order(row, self.num_benchmarks()))
            .collect::<Result<Vec<_>>>()?;

        Ok(OrdersReply { orders, count })
    }

    pub async fn get_order_details(&self, order_id: &BigUint) -> Result<DwhOrder> {
        let _guard = self.lock.read().await;
        let mut conn = self.storage.pool().acquire().await?;
        self.storage
            .fetch_order(&mut conn, order_id)
            .await?
            .ok_or_else(|| DwhError::NotFound(format!("order {order_id}")))
    }

    /// Finds active orders on the opposite side of the book that the given
    /// order could match: compatible price and duration, acceptable
    /// counterparty on both ends, bitwise-compatible netflags, sufficient
    /// identity on both ends, and compatible benchmarks — best price first.
    pub async fn get_matching_orders(&self, request: &MatchingOrdersRequest) -> Result<OrdersReply> {
        let _guard = self.lock.read().await;

        let order = {
            let mut conn = self.storage.pool().acquire().await?;
            self.storage
                .fetch_order(&mut conn, &request.id)
                .await?
                .ok_or_else(|| DwhError::NotFound(format!("order {}", request.id)))?
        };

        let (opposite_type, price_op, duration_op, bench_op, netflags_op, sorting_order) =
            if order.order.order_type == OrderType::Bid {
                // A bid wants the cheapest sufficient ask.
                (
                    OrderType::Ask,
                    FilterOp::Lte,
                    FilterOp::Gte,
                    FilterOp::Gte,
                    CmpOp::Gte,
                    SortingOrder::Asc,
                )
            } else {
                (
                    OrderType::Bid,
                    FilterOp::Gte,
                    FilterOp::Lte,
                    FilterOp::Lte,
                    CmpOp::Lte,
                    SortingOrder::Desc,
                )
            };

        let mut filters = vec![
            Filter::new(
                "Type",
                FilterOp::Eq,
                opposite_type as i64,
                Connective::And,
            ),
            Filter::new(
                "Status",
                FilterOp::Eq,
                OrderStatus::Active as i64,
                Connective::And,
            ),
            Filter::new(
                "Price",
                price_op,
                to_padded_string(&order.order.price),
                Connective::And,
            ),
        ];
        if order.order.duration > 0 {
            filters.push(Filter::new(
                "Duration",
                duration_op,
                order.order.duration,
                Connective::And,
            ));
        } else {
            filters.push(Filter::new(
                "Duration",
                FilterOp::Eq,
                0u64,
                Connective::And,
            ));
        }
        if !order.order.counterparty_id.is_zero() {
            filters.push(Filter::new(
                "AuthorID",
                FilterOp::Eq,
                order.order.counterparty_id.to_hex(),
                Connective::And,
            ));
        }
        // The candidate must either be open to anyone or name this author.
        let mut open_counterparty = Filter::new(
            "CounterpartyID",
            FilterOp::Eq,
            Address::ZERO.to_hex(),
            Connective::Or,
        );
        open_counterparty.open_bracket = true;
        filters.push(open_counterparty);
        let mut named_counterparty = Filter::new(
            "CounterpartyID",
            FilterOp::Eq,
            order.order.author_id.to_hex(),
            Connective::And,
        );
        named_counterparty.close_bracket = true;
        filters.push(named_counterparty);

        filters.push(Filter::netflags(netflags_op, order.order.netflags));

        // The candidate's issuer must satisfy this order's identity
        // requirement, and this order's issuer must satisfy the candidate's.
        filters.push(Filter::new(
            "CreatorIdentityLevel",
            FilterOp::Gte,
            order.order.identity_level,
            Connective::And,
        ));
        filters.push(Filter::new(
            "IdentityLevel",
            FilterOp::Lte,
            order.creator_identity_level,
            Connective::And,
        ));

        for (bench_id, value) in order.order.benchmarks.iter().enumerate() {
            filters.push(Filter::new(
                benchmark_column(bench_id as u64),
                bench_op,
                *value,
                Connective::And,
            ));
        }

        let opts = QueryOpts {
            filters,
            sortings: vec![SortingOption::new("Price", sorting_order)],
            offset: request.offset,
            limit: request.limit,
            with_count: request.with_count,
            ..QueryOpts::new("Orders")
        };

        let mut conn = self.storage.pool().acquire().await?;
        let (rows, count) = self.storage.run_query(&mut conn, &opts).await?;
        let orders = rows
            .iter()
            .map(|row| decode::decode_order(row, self.num_benchmarks()))
            .collect::<Result<Vec<_>>>()?;

        Ok(OrdersReply { orders, count })
    }

    pub async fn get_profiles(&self, request: &ProfilesRequest) -> Result<ProfilesReply> {
        let _guard = self.lock.read().await;
        self.profiles_inner(request).await
    }

    async fn profiles_inner(&self, request: &ProfilesRequest) -> Result<ProfilesReply> {
        let mut filters = Vec::new();
        match request.role {
            ProfileRole::Supplier => filters.push(Filter::new(
                "ActiveAsks",
                FilterOp::Gte,
                1u64,
                Connective::And,
            )),
            ProfileRole::Consumer => filters.push(Filter::new(
                "ActiveBids",
                FilterOp::Gte,
                1u64,
                Connective::And,
            )),
            ProfileRole::Any => {}
        }
        filters.push(Filter::new(
            "IdentityLevel",
            FilterOp::Gte,
            request.identity_level,
            Connective::And,
        ));
        if !request.country.is_empty() {
            filters.push(Filter::new(
                "Country",
                FilterOp::Eq,
                request.country.as_str(),
                Connective::And,
            ));
        }
        if !request.name.is_empty() {
            filters.push(Filter::new(
                "Name",
                FilterOp::Like,
                request.name.as_str(),
                Connective::And,
            ));
        }

        let mut opts = QueryOpts {
            filters,
            sortings: self
                .storage
                .whitelist_sortings(&request.sortings, column_sets::PROFILES),
            offset: request.offset,
            limit: request.limit,
            with_count: request.with_count,
            ..QueryOpts::new("Profiles")
        };

        if let Some(blacklist_query) = &request.blacklist_query {
            let owner = blacklist_query.owner_id.to_hex();
            match blacklist_query.option {
                BlacklistOption::WithoutMatching => {
                    opts.select_as = Some("AS p");
                    opts.custom_filter = Some(CustomFilter {
                        clause: self.storage.profile_not_in_blacklist_clause(),
                        values: vec![owner.into()],
                    });
                }
                BlacklistOption::OnlyMatching => {
                    opts.select_as = Some("AS p");
                    opts.custom_filter = Some(CustomFilter {
                        clause: self.storage.profile_in_blacklist_clause(),
                        values: vec![owner.into()],
                    });
                }
                BlacklistOption::IncludeAndMark => {}
            }
        }

        let mut profiles = {
            let mut conn = self.storage.pool().acquire().await?;
            let (rows, count) = self.storage.run_query(&mut conn, &opts).await?;
            let profiles = rows
                .iter()
                .map(decode::decode_profile)
                .collect::<Result<Vec<Profile>>>()?;
            ProfilesReply { profiles, count }
        };

        if let Some(blacklist_query) = &request.blacklist_query {
            if blacklist_query.option == BlacklistOption::IncludeAndMark {
                let blacklist = self
                    .blacklist_inner(&BlacklistRequest {
                        owner_id: Some(blacklist_query.owner_id),
                        ..BlacklistRequest::default()
                    })
                    .await?;
                for profile in &mut profiles.profiles {
                    if blacklist.addresses.contains(&profile.user_id) {
                        profile.is_blacklisted = true;
                    }
                }
            }
        }

        Ok(profiles)
    }

    pub async fn get_profile_info(&self, user_id: Address) -> Result<Profile> {
        let _guard = self.lock.read().await;
        let mut conn = self.storage.pool().acquire().await?;
        self.storage
            .fetch_profile(&mut conn, user_id)
            .await?
            .ok_or_else(|| DwhError::NotFound(format!("profile {user_id}")))
    }

    pub async fn get_blacklist(&self, request: &BlacklistRequest) -> Result<BlacklistReply> {
        let _guard = self.lock.read().await;
        self.blacklist_inner(request).await
    }

    async fn blacklist_inner(&self, request: &BlacklistRequest) -> Result<BlacklistReply> {
        let mut filters = Vec::new();
        if let Some(owner_id) = request.owner_id.filter(|a| !a.is_zero()) {
            filters.push(Filter::new(
                "AdderID",
                FilterOp::Eq,
                owner_id.to_hex(),
                Connective::And,
            ));
        }

        let opts = QueryOpts {
            filters,
            offset: request.offset,
            limit: request.limit,
            with_count: request.with_count,
            ..QueryOpts::new("Blacklists")
        };

        let mut conn = self.storage.pool().acquire().await?;
        let (rows, count) = self.storage.run_query(&mut conn, &opts).await?;
        let addresses = rows
            .iter()
            .map(|row| decode::decode_blacklist_entry(row).map(|(_, addee)| addee))
            .collect::<Result<Vec<_>>>()?;

        Ok(BlacklistReply {
            owner_id: request.owner_id,
            addresses,
            count,
        })
    }

    pub async fn get_validators(&self, request: &ValidatorsRequest) -> Result<ValidatorsReply> {
        let _guard = self.lock.read().await;

        let mut filters = Vec::new();
        if let Some(level) = &request.validator_level {
            filters.push(Filter::new(
                "Level",
                cmp_filter_op(level.operator),
                level.value,
                Connective::And,
            ));
        }

        let opts = QueryOpts {
            filters,
            sortings: self
                .storage
                .whitelist_sortings(&request.sortings, column_sets::VALIDATORS),
            offset: request.offset,
            limit: request.limit,
            with_count: request.with_count,
            ..QueryOpts::new("Validators")
        };

        let mut conn = self.storage.pool().acquire().await?;
        let (rows, count) = self.storage.run_query(&mut conn, &opts).await?;
        let validators = rows
            .iter()
            .map(decode::decode_validator)
            .collect::<Result<Vec<_>>>()?;

        Ok(ValidatorsReply { validators, count })
    }

    pub async fn get_deal_change_requests(
        &self,
        deal_id: &BigUint,
    ) -> Result<DealChangeRequestsReply> {
        let _guard = self.lock.read().await;
        let mut conn = self.storage.pool().acquire().await?;
        let requests = self
            .storage
            .fetch_change_requests_by_deal(&mut conn, deal_id)
            .await?;
        Ok(DealChangeRequestsReply { requests })
    }

    pub async fn get_workers(&self, request: &WorkersRequest) -> Result<WorkersReply> {
        let _guard = self.lock.read().await;

        let mut filters = Vec::new();
        if let Some(master_id) = request.master_id.filter(|a| !a.is_zero()) {
            filters.push(Filter::new(
                "MasterID",
                FilterOp::Eq,
                master_id.to_hex(),
                Connective::And,
            ));
        }

        let opts = QueryOpts {
            filters,
            offset: request.offset,
            limit: request.limit,
            with_count: request.with_count,
            ..QueryOpts::new("Workers")
        };

        let mut conn = self.storage.pool().acquire().await?;
        let (rows, count) = self.storage.run_query(&mut conn, &opts).await?;
        let workers = rows
            .iter()
            .map(decode::decode_worker)
            .collect::<Result<Vec<_>>>()?;

        Ok(WorkersReply { workers, count })
    }
}
