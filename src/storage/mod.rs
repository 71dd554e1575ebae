//! Storage backend adapter.
//!
//! An abstraction over the two supported relational backends (SQLite and
//! PostgreSQL) built on a `sqlx` Any pool: named SQL commands, transactions,
//! parameterised queries, and backend-specific schema bootstrap. The driver
//! is selected by the `storage.driver` configuration key; everything above
//! this module is backend-agnostic.
//!
//! All row-level helpers take `&mut AnyConnection`, so the same code path
//! serves plain pool connections and open transactions.

use sqlx::any::{install_default_drivers, AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, AnyPool, Row};

use crate::types::requests::SortingOption;
use crate::types::{
    to_padded_string, Address, Certificate, DealChangeRequest, DealCondition, DwhDeal, DwhOrder,
    OrderStatus, Profile, Validator,
};
use crate::utils::error::{DwhError, Result};

pub mod decode;
pub mod query;

use num_bigint::BigUint;
use query::{ColumnSet, QueryOpts, SqlValue};

/// SQL flavour differences between the registered backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Resolves a `storage.driver` configuration key.
    pub fn from_driver(key: &str) -> Result<Self> {
        match key {
            "sqlite3" => Ok(Self::Sqlite),
            "postgres" => Ok(Self::Postgres),
            other => Err(DwhError::Config(format!(
                "unsupported storage driver `{other}`"
            ))),
        }
    }

    /// Bind-parameter placeholder for the 1-based position `idx`.
    #[must_use]
    pub fn placeholder(self, idx: usize) -> String {
        match self {
            Self::Sqlite => "?".to_string(),
            Self::Postgres => format!("${idx}"),
        }
    }

    fn auto_pk(self) -> &'static str {
        match self {
            Self::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
            Self::Postgres => "BIGSERIAL PRIMARY KEY",
        }
    }

    fn placeholders(self, count: usize) -> String {
        (1..=count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Static (non-benchmark) column lists, in physical table order. The row
/// decoders rely on this order, so it changes only together with them.
pub const DEAL_COLUMNS: &[&str] = &[
    "Id",
    "SupplierID",
    "ConsumerID",
    "MasterID",
    "AskID",
    "BidID",
    "Duration",
    "Price",
    "StartTime",
    "EndTime",
    "Status",
    "BlockedBalance",
    "TotalPayout",
    "LastBillTS",
    "Netflags",
    "AskIdentityLevel",
    "BidIdentityLevel",
    "SupplierCertificates",
    "ConsumerCertificates",
    "ActiveChangeRequest",
];

pub const ORDER_COLUMNS: &[&str] = &[
    "Id",
    "CreatedTS",
    "DealID",
    "Type",
    "Status",
    "AuthorID",
    "CounterpartyID",
    "Duration",
    "Price",
    "Netflags",
    "IdentityLevel",
    "Blacklist",
    "Tag",
    "FrozenSum",
    "CreatorIdentityLevel",
    "CreatorName",
    "CreatorCountry",
    "CreatorCertificates",
];

/// Sortable-column whitelists per table.
pub mod column_sets {
    use super::query::ColumnSet;

    pub const DEALS: ColumnSet = ColumnSet::new(super::DEAL_COLUMNS, true);
    pub const ORDERS: ColumnSet = ColumnSet::new(super::ORDER_COLUMNS, true);
    pub const DEAL_CONDITIONS: ColumnSet = ColumnSet::new(
        &[
            "Id",
            "SupplierID",
            "ConsumerID",
            "MasterID",
            "Duration",
            "Price",
            "StartTime",
            "EndTime",
            "TotalPayout",
            "DealID",
        ],
        false,
    );
    pub const PROFILES: ColumnSet = ColumnSet::new(
        &[
            "Id",
            "UserID",
            "IdentityLevel",
            "Name",
            "Country",
            "IsCorporation",
            "IsProfessional",
            "Certificates",
            "ActiveAsks",
            "ActiveBids",
        ],
        false,
    );
    pub const VALIDATORS: ColumnSet = ColumnSet::new(&["Id", "Level"], false);
    pub const WORKERS: ColumnSet = ColumnSet::new(&["MasterID", "SlaveID", "Confirmed"], false);
    pub const BLACKLISTS: ColumnSet = ColumnSet::new(&["AdderID", "AddeeID"], false);
}

/// Profile columns the certificate and order handlers may patch
/// individually.
const PROFILE_PATCH_FIELDS: &[&str] = &[
    "Name",
    "Country",
    "Certificates",
    "IdentityLevel",
    "ActiveAsks",
    "ActiveBids",
];

/// The named SQL command set, rendered once per backend at startup (the
/// benchmark column list and placeholder syntax are baked in here).
struct Commands {
    insert_deal: String,
    update_deal: String,
    update_deal_payout: String,
    delete_deal: String,
    select_deal_by_id: String,
    update_deals_supplier_certs: String,
    update_deals_consumer_certs: String,
    insert_order: String,
    update_order_status: String,
    delete_order: String,
    select_order_by_id: String,
    update_orders_creator: String,
    insert_deal_condition: String,
    update_condition_end_time: String,
    update_condition_payout: String,
    insert_deal_payment: String,
    insert_change_request: String,
    update_change_request_status: String,
    delete_change_request: String,
    select_change_requests_by_deal: String,
    select_latest_condition: String,
    select_matching_change_requests: String,
    insert_profile: String,
    select_profile_by_user: String,
    insert_certificate: String,
    select_certificates_by_owner: String,
    insert_validator: String,
    update_validator: String,
    insert_worker: String,
    update_worker: String,
    delete_worker: String,
    insert_blacklist_entry: String,
    delete_blacklist_entry: String,
    select_last_block: String,
    insert_last_block: String,
    update_last_block: String,
    profile_in_blacklist: String,
    profile_not_in_blacklist: String,
}

impl Commands {
    fn new(dialect: Dialect, num_benchmarks: usize) -> Self {
        let bench_cols: Vec<String> = (0..num_benchmarks)
            .map(|i| query::benchmark_column(i as u64))
            .collect();

        let deal_cols = DEAL_COLUMNS
            .iter()
            .map(|c| (*c).to_string())
            .chain(bench_cols.iter().cloned())
            .collect::<Vec<_>>()
            .join(", ");
        let order_cols = ORDER_COLUMNS
            .iter()
            .map(|c| (*c).to_string())
            .chain(bench_cols.iter().cloned())
            .collect::<Vec<_>>()
            .join(", ");

        let d = dialect;
        Self {
            insert_deal: format!(
                "INSERT INTO Deals ({deal_cols}) VALUES ({})",
                d.placeholders(DEAL_COLUMNS.len() + num_benchmarks)
            ),
            update_deal: format!(
                "UPDATE Deals SET Duration = {}, Price = {}, StartTime = {}, EndTime = {}, \
                 Status = {}, BlockedBalance = {}, TotalPayout = {}, LastBillTS = {} WHERE Id = {}",
                d.placeholder(1),
                d.placeholder(2),
                d.placeholder(3),
                d.placeholder(4),
                d.placeholder(5),
                d.placeholder(6),
                d.placeholder(7),
                d.placeholder(8),
                d.placeholder(9)
            ),
            update_deal_payout: format!(
                "UPDATE Deals SET TotalPayout = {} WHERE Id = {}",
                d.placeholder(1),
                d.placeholder(2)
            ),
            delete_deal: format!("DELETE FROM Deals WHERE Id = {}", d.placeholder(1)),
            select_deal_by_id: format!("SELECT * FROM Deals WHERE Id = {}", d.placeholder(1)),
            update_deals_supplier_certs: format!(
                "UPDATE Deals SET SupplierCertificates = {} WHERE SupplierID = {}",
                d.placeholder(1),
                d.placeholder(2)
            ),
            update_deals_consumer_certs: format!(
                "UPDATE Deals SET ConsumerCertificates = {} WHERE ConsumerID = {}",
                d.placeholder(1),
                d.placeholder(2)
            ),
            insert_order: format!(
                "INSERT INTO Orders ({order_cols}) VALUES ({})",
                d.placeholders(ORDER_COLUMNS.len() + num_benchmarks)
            ),
            update_order_status: format!(
                "UPDATE Orders SET Status = {} WHERE Id = {}",
                d.placeholder(1),
                d.placeholder(2)
            ),
            delete_order: format!("DELETE FROM Orders WHERE Id = {}", d.placeholder(1)),
            select_order_by_id: format!("SELECT * FROM Orders WHERE Id = {}", d.placeholder(1)),
            update_orders_creator: format!(
                "UPDATE Orders SET CreatorIdentityLevel = {}, CreatorName = {}, \
                 CreatorCountry = {}, CreatorCertificates = {} WHERE AuthorID = {}",
                d.placeholder(1),
                d.placeholder(2),
                d.placeholder(3),
                d.placeholder(4),
                d.placeholder(5)
            ),
            insert_deal_condition: format!(
                "INSERT INTO DealConditions (SupplierID, ConsumerID, MasterID, Duration, Price, \
                 StartTime, EndTime, TotalPayout, DealID) VALUES ({})",
                d.placeholders(9)
            ),
            update_condition_end_time: format!(
                "UPDATE DealConditions SET EndTime = {} WHERE Id = {}",
                d.placeholder(1),
                d.placeholder(2)
            ),
            update_condition_payout: format!(
                "UPDATE DealConditions SET TotalPayout = {} WHERE Id = {}",
                d.placeholder(1),
                d.placeholder(2)
            ),
            insert_deal_payment: format!(
                "INSERT INTO DealPayments (BillTS, PaidAmount, DealID) VALUES ({})",
                d.placeholders(3)
            ),
            insert_change_request: format!(
                "INSERT INTO DealChangeRequests (Id, CreatedTS, RequestType, Duration, Price, \
                 Status, DealID) VALUES ({})",
                d.placeholders(7)
            ),
            update_change_request_status: format!(
                "UPDATE DealChangeRequests SET Status = {} WHERE Id = {}",
                d.placeholder(1),
                d.placeholder(2)
            ),
            delete_change_request: format!(
                "DELETE FROM DealChangeRequests WHERE Id = {}",
                d.placeholder(1)
            ),
            select_change_requests_by_deal: format!(
                "SELECT * FROM DealChangeRequests WHERE DealID = {} ORDER BY CreatedTS DESC",
                d.placeholder(1)
            ),
            select_latest_condition: format!(
                "SELECT * FROM DealConditions WHERE DealID = {} ORDER BY Id DESC LIMIT 1",
                d.placeholder(1)
            ),
            select_matching_change_requests: format!(
                "SELECT * FROM DealChangeRequests WHERE DealID = {} AND RequestType = {} \
                 AND Status = {}",
                d.placeholder(1),
                d.placeholder(2),
                d.placeholder(3)
            ),
            insert_profile: format!(
                "INSERT INTO Profiles (UserID, IdentityLevel, Name, Country, IsCorporation, \
                 IsProfessional, Certificates, ActiveAsks, ActiveBids) VALUES ({})",
                d.placeholders(9)
            ),
            select_profile_by_user: format!(
                "SELECT * FROM Profiles WHERE UserID = {}",
                d.placeholder(1)
            ),
            insert_certificate: format!(
                "INSERT INTO Certificates (OwnerID, Attribute, IdentityLevel, Value, ValidatorID) \
                 VALUES ({})",
                d.placeholders(5)
            ),
            select_certificates_by_owner: format!(
                "SELECT * FROM Certificates WHERE OwnerID = {}",
                d.placeholder(1)
            ),
            insert_validator: format!(
                "INSERT INTO Validators (Id, Level) VALUES ({})",
                d.placeholders(2)
            ),
            update_validator: format!(
                "UPDATE Validators SET Level = {} WHERE Id = {}",
                d.placeholder(1),
                d.placeholder(2)
            ),
            insert_worker: format!(
                "INSERT INTO Workers (MasterID, SlaveID, Confirmed) VALUES ({})",
                d.placeholders(3)
            ),
            update_worker: format!(
                "UPDATE Workers SET Confirmed = {} WHERE MasterID = {} AND SlaveID = {}",
                d.placeholder(1),
                d.placeholder(2),
                d.placeholder(3)
            ),
            delete_worker: format!(
                "DELETE FROM Workers WHERE MasterID = {} AND SlaveID = {}",
                d.placeholder(1),
                d.placeholder(2)
            ),
            insert_blacklist_entry: format!(
                "INSERT INTO Blacklists (AdderID, AddeeID) VALUES ({})",
                d.placeholders(2)
            ),
            delete_blacklist_entry: format!(
                "DELETE FROM Blacklists WHERE AdderID = {} AND AddeeID = {}",
                d.placeholder(1),
                d.placeholder(2)
            ),
            select_last_block: "SELECT LastKnownBlock FROM LastKnownBlock".to_string(),
            insert_last_block: format!(
                "INSERT INTO LastKnownBlock (LastKnownBlock) VALUES ({})",
                d.placeholder(1)
            ),
            update_last_block: format!(
                "UPDATE LastKnownBlock SET LastKnownBlock = {}",
                d.placeholder(1)
            ),
            // Rendered into larger statements by the query compiler, which
            // substitutes the `{}` markers with correctly-numbered
            // placeholders.
            profile_in_blacklist:
                "EXISTS (SELECT 1 FROM Blacklists WHERE AdderID = {} AND AddeeID = p.UserID)"
                    .to_string(),
            profile_not_in_blacklist:
                "NOT EXISTS (SELECT 1 FROM Blacklists WHERE AdderID = {} AND AddeeID = p.UserID)"
                    .to_string(),
        }
    }
}

/// Binds a compiled parameter list onto a query in order.
fn bind_values<'q>(
    mut q: Query<'q, Any, AnyArguments<'q>>,
    params: &'q [SqlValue],
) -> Query<'q, Any, AnyArguments<'q>> {
    for param in params {
        q = match param {
            SqlValue::Int(v) => q.bind(*v),
            SqlValue::Text(s) => q.bind(s.as_str()),
        };
    }
    q
}

/// Connection pool plus the rendered command set for one backend.
pub struct Storage {
    pool: AnyPool,
    dialect: Dialect,
    num_benchmarks: usize,
    cmd: Commands,
}

impl Storage {
    /// Connects to the configured backend and renders the command set.
    ///
    /// # Errors
    ///
    /// Returns `DwhError::Config` for an unknown driver key and
    /// `DwhError::Database` when the pool cannot be established.
    pub async fn connect(
        driver: &str,
        endpoint: &str,
        max_connections: u32,
        num_benchmarks: usize,
    ) -> Result<Self> {
        let dialect = Dialect::from_driver(driver)?;
        install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(endpoint)
            .await?;

        Ok(Self {
            pool,
            dialect,
            num_benchmarks,
            cmd: Commands::new(dialect, num_benchmarks),
        })
    }

    #[must_use]
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    #[must_use]
    pub fn num_benchmarks(&self) -> usize {
        self.num_benchmarks
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Creates the projection schema if it does not exist yet.
    pub async fn initialize(&self) -> Result<()> {
        for statement in schema_statements(self.dialect, self.num_benchmarks) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ── generic queries ─────────────────────────────────────────────────────

    /// Executes a compiled filter query, returning the rows and, when
    /// requested, the total count over the same filter expression.
    pub async fn run_query(
        &self,
        conn: &mut AnyConnection,
        opts: &QueryOpts,
    ) -> Result<(Vec<AnyRow>, Option<u64>)> {
        let compiled = query::compile(self.dialect, opts);

        let rows = bind_values(sqlx::query(&compiled.select), &compiled.params)
            .fetch_all(&mut *conn)
            .await?;

        let count = match &compiled.count {
            Some(count_sql) => {
                let row = bind_values(sqlx::query(count_sql), &compiled.params)
                    .fetch_one(&mut *conn)
                    .await?;
                Some(row.try_get::<i64, _>(0)? as u64)
            }
            None => None,
        };

        Ok((rows, count))
    }

    /// Drops sort options whose field is not admitted for `set`.
    #[must_use]
    pub fn whitelist_sortings(&self, sortings: &[SortingOption], set: ColumnSet) -> Vec<SortingOption> {
        query::filter_sortings(sortings, set, self.num_benchmarks)
    }

    /// Template clause matching profiles blacklisted by the bound owner.
    #[must_use]
    pub fn profile_in_blacklist_clause(&self) -> String {
        self.cmd.profile_in_blacklist.clone()
    }

    /// Template clause excluding profiles blacklisted by the bound owner.
    #[must_use]
    pub fn profile_not_in_blacklist_clause(&self) -> String {
        self.cmd.profile_not_in_blacklist.clone()
    }

    // ── deals ───────────────────────────────────────────────────────────────

    pub async fn insert_deal(&self, conn: &mut AnyConnection, deal: &DwhDeal) -> Result<()> {
        if deal.deal.benchmarks.len() != self.num_benchmarks {
            return Err(DwhError::BenchmarkMismatch(format!(
                "expected {} benchmarks, got {}",
                self.num_benchmarks,
                deal.deal.benchmarks.len()
            )));
        }

        let d = &deal.deal;
        let mut params: Vec<SqlValue> = vec![
            d.id.to_string().into(),
            d.supplier_id.to_hex().into(),
            d.consumer_id.to_hex().into(),
            d.master_id.to_hex().into(),
            d.ask_id.to_string().into(),
            d.bid_id.to_string().into(),
            d.duration.into(),
            to_padded_string(&d.price).into(),
            d.start_time.into(),
            d.end_time.into(),
            (d.status as i64).into(),
            to_padded_string(&d.blocked_balance).into(),
            to_padded_string(&d.total_payout).into(),
            d.last_bill_ts.into(),
            deal.netflags.into(),
            deal.ask_identity_level.into(),
            deal.bid_identity_level.into(),
            deal.supplier_certificates.clone().into(),
            deal.consumer_certificates.clone().into(),
            i64::from(deal.active_change_request).into(),
        ];
        params.extend(d.benchmarks.iter().map(|b| SqlValue::from(*b)));

        bind_values(sqlx::query(&self.cmd.insert_deal), &params)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn update_deal(
        &self,
        conn: &mut AnyConnection,
        deal: &crate::types::Deal,
    ) -> Result<()> {
        let params: Vec<SqlValue> = vec![
            deal.duration.into(),
            to_padded_string(&deal.price).into(),
            deal.start_time.into(),
            deal.end_time.into(),
            (deal.status as i64).into(),
            to_padded_string(&deal.blocked_balance).into(),
            to_padded_string(&deal.total_payout).into(),
            deal.last_bill_ts.into(),
            deal.id.to_string().into(),
        ];
        bind_values(sqlx::query(&self.cmd.update_deal), &params)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn update_deal_payout(
        &self,
        conn: &mut AnyConnection,
        deal_id: &BigUint,
        total_payout: &BigUint,
    ) -> Result<()> {
        sqlx::query(&self.cmd.update_deal_payout)
            .bind(to_padded_string(total_payout))
            .bind(deal_id.to_string())
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn delete_deal(&self, conn: &mut AnyConnection, deal_id: &BigUint) -> Result<()> {
        sqlx::query(&self.cmd.delete_deal)
            .bind(deal_id.to_string())
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn fetch_deal(
        &self,
        conn: &mut AnyConnection,
        deal_id: &BigUint,
    ) -> Result<Option<DwhDeal>> {
        let row = sqlx::query(&self.cmd.select_deal_by_id)
            .bind(deal_id.to_string())
            .fetch_optional(conn)
            .await?;
        row.map(|r| decode::decode_deal(&r, self.num_benchmarks))
            .transpose()
    }

    pub async fn update_deals_supplier_certificates(
        &self,
        conn: &mut AnyConnection,
        supplier_id: Address,
        certificates: &str,
    ) -> Result<()> {
        sqlx::query(&self.cmd.update_deals_supplier_certs)
            .bind(certificates)
            .bind(supplier_id.to_hex())
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn update_deals_consumer_certificates(
        &self,
        conn: &mut AnyConnection,
        consumer_id: Address,
        certificates: &str,
    ) -> Result<()> {
        sqlx::query(&self.cmd.update_deals_consumer_certs)
            .bind(certificates)
            .bind(consumer_id.to_hex())
            .execute(conn)
            .await?;
        Ok(())
    }

    // ── orders ──────────────────────────────────────────────────────────────

    pub async fn insert_order(&self, conn: &mut AnyConnection, order: &DwhOrder) -> Result<()> {
        if order.order.benchmarks.len() != self.num_benchmarks {
            return Err(DwhError::BenchmarkMismatch(format!(
                "expected {} benchmarks, got {}",
                self.num_benchmarks,
                order.order.benchmarks.len()
            )));
        }

        let o = &order.order;
        let mut params: Vec<SqlValue> = vec![
            o.id.to_string().into(),
            order.created_ts.into(),
            o.deal_id.to_string().into(),
            (o.order_type as i64).into(),
            (o.status as i64).into(),
            o.author_id.to_hex().into(),
            o.counterparty_id.to_hex().into(),
            o.duration.into(),
            to_padded_string(&o.price).into(),
            o.netflags.into(),
            o.identity_level.into(),
            o.blacklist.clone().into(),
            hex::encode(&o.tag).into(),
            to_padded_string(&o.frozen_sum).into(),
            order.creator_identity_level.into(),
            order.creator_name.clone().into(),
            order.creator_country.clone().into(),
            order.creator_certificates.clone().into(),
        ];
        params.extend(o.benchmarks.iter().map(|b| SqlValue::from(*b)));

        bind_values(sqlx::query(&self.cmd.insert_order), &params)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn update_order_status(
        &self,
        conn: &mut AnyConnection,
        order_id: &BigUint,
        status: OrderStatus,
    ) -> Result<()> {
        sqlx::query(&self.cmd.update_order_status)
            .bind(status as i64)
            .bind(order_id.to_string())
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn delete_order(&self, conn: &mut AnyConnection, order_id: &BigUint) -> Result<()> {
        sqlx::query(&self.cmd.delete_order)
            .bind(order_id.to_string())
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn fetch_order(
        &self,
        conn: &mut AnyConnection,
        order_id: &BigUint,
    ) -> Result<Option<DwhOrder>> {
        let row = sqlx::query(&self.cmd.select_order_by_id)
            .bind(order_id.to_string())
            .fetch_optional(conn)
            .await?;
        row.map(|r| decode::decode_order(&r, self.num_benchmarks))
            .transpose()
    }

    /// Refreshes the denormalised creator snapshot on every order the user
    /// has authored.
    pub async fn update_orders_creator(
        &self,
        conn: &mut AnyConnection,
        profile: &Profile,
    ) -> Result<()> {
        sqlx::query(&self.cmd.update_orders_creator)
            .bind(profile.identity_level as i64)
            .bind(profile.name.as_str())
            .bind(profile.country.as_str())
            .bind(profile.certificates.as_str())
            .bind(profile.user_id.to_hex())
            .execute(conn)
            .await?;
        Ok(())
    }

    // ── deal conditions & payments ──────────────────────────────────────────

    /// Inserts a condition segment; the synthetic `id` field is ignored.
    pub async fn insert_deal_condition(
        &self,
        conn: &mut AnyConnection,
        condition: &DealCondition,
    ) -> Result<()> {
        let params: Vec<SqlValue> = vec![
            condition.supplier_id.to_hex().into(),
            condition.consumer_id.to_hex().into(),
            condition.master_id.to_hex().into(),
            condition.duration.into(),
            to_padded_string(&condition.price).into(),
            condition.start_time.into(),
            condition.end_time.into(),
            to_padded_string(&condition.total_payout).into(),
            condition.deal_id.to_string().into(),
        ];
        bind_values(sqlx::query(&self.cmd.insert_deal_condition), &params)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn update_condition_end_time(
        &self,
        conn: &mut AnyConnection,
        condition_id: u64,
        end_time: i64,
    ) -> Result<()> {
        sqlx::query(&self.cmd.update_condition_end_time)
            .bind(end_time)
            .bind(condition_id as i64)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn update_condition_payout(
        &self,
        conn: &mut AnyConnection,
        condition_id: u64,
        total_payout: &BigUint,
    ) -> Result<()> {
        sqlx::query(&self.cmd.update_condition_payout)
            .bind(to_padded_string(total_payout))
            .bind(condition_id as i64)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// The open (most recently inserted) condition segment for a deal.
    pub async fn fetch_latest_deal_condition(
        &self,
        conn: &mut AnyConnection,
        deal_id: &BigUint,
    ) -> Result<Option<DealCondition>> {
        let row = sqlx::query(&self.cmd.select_latest_condition)
            .bind(deal_id.to_string())
            .fetch_optional(conn)
            .await?;
        row.map(|r| decode::decode_deal_condition(&r)).transpose()
    }

    pub async fn insert_deal_payment(
        &self,
        conn: &mut AnyConnection,
        bill_ts: i64,
        paid_amount: &BigUint,
        deal_id: &BigUint,
    ) -> Result<()> {
        sqlx::query(&self.cmd.insert_deal_payment)
            .bind(bill_ts)
            .bind(to_padded_string(paid_amount))
            .bind(deal_id.to_string())
            .execute(conn)
            .await?;
        Ok(())
    }

    // ── change requests ─────────────────────────────────────────────────────

    pub async fn insert_change_request(
        &self,
        conn: &mut AnyConnection,
        request: &DealChangeRequest,
    ) -> Result<()> {
        let params: Vec<SqlValue> = vec![
            request.id.to_string().into(),
            request.created_ts.into(),
            (request.request_type as i64).into(),
            request.duration.into(),
            to_padded_string(&request.price).into(),
            (request.status as i64).into(),
            request.deal_id.to_string().into(),
        ];
        bind_values(sqlx::query(&self.cmd.insert_change_request), &params)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn update_change_request_status(
        &self,
        conn: &mut AnyConnection,
        request_id: &BigUint,
        status: crate::types::ChangeRequestStatus,
    ) -> Result<()> {
        sqlx::query(&self.cmd.update_change_request_status)
            .bind(status as i64)
            .bind(request_id.to_string())
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn delete_change_request(
        &self,
        conn: &mut AnyConnection,
        request_id: &BigUint,
    ) -> Result<()> {
        sqlx::query(&self.cmd.delete_change_request)
            .bind(request_id.to_string())
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn fetch_change_requests_by_deal(
        &self,
        conn: &mut AnyConnection,
        deal_id: &BigUint,
    ) -> Result<Vec<DealChangeRequest>> {
        let rows = sqlx::query(&self.cmd.select_change_requests_by_deal)
            .bind(deal_id.to_string())
            .fetch_all(conn)
            .await?;
        rows.iter().map(decode::decode_change_request).collect()
    }

    /// Change requests for `(deal, type)` in the given status; used to find
    /// CREATED requests a newer one supersedes.
    pub async fn fetch_matching_change_requests(
        &self,
        conn: &mut AnyConnection,
        deal_id: &BigUint,
        request_type: crate::types::OrderType,
        status: crate::types::ChangeRequestStatus,
    ) -> Result<Vec<DealChangeRequest>> {
        let rows = sqlx::query(&self.cmd.select_matching_change_requests)
            .bind(deal_id.to_string())
            .bind(request_type as i64)
            .bind(status as i64)
            .fetch_all(conn)
            .await?;
        rows.iter().map(decode::decode_change_request).collect()
    }

    // ── profiles & certificates ─────────────────────────────────────────────

    pub async fn insert_profile(&self, conn: &mut AnyConnection, profile: &Profile) -> Result<()> {
        let params: Vec<SqlValue> = vec![
            profile.user_id.to_hex().into(),
            profile.identity_level.into(),
            profile.name.clone().into(),
            profile.country.clone().into(),
            i64::from(profile.is_corporation).into(),
            i64::from(profile.is_professional).into(),
            profile.certificates.clone().into(),
            profile.active_asks.into(),
            profile.active_bids.into(),
        ];
        bind_values(sqlx::query(&self.cmd.insert_profile), &params)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn fetch_profile(
        &self,
        conn: &mut AnyConnection,
        user_id: Address,
    ) -> Result<Option<Profile>> {
        let row = sqlx::query(&self.cmd.select_profile_by_user)
            .bind(user_id.to_hex())
            .fetch_optional(conn)
            .await?;
        row.map(|r| decode::decode_profile(&r)).transpose()
    }

    /// Patches a single profile column. `field` must be one of the known
    /// patchable columns; anything else is a programming error surfaced as
    /// `Internal`.
    pub async fn update_profile_field(
        &self,
        conn: &mut AnyConnection,
        user_id: Address,
        field: &str,
        value: SqlValue,
    ) -> Result<()> {
        if !PROFILE_PATCH_FIELDS.contains(&field) {
            return Err(DwhError::Internal(format!(
                "refusing to patch unknown profile column `{field}`"
            )));
        }
        let sql = format!(
            "UPDATE Profiles SET {field} = {} WHERE UserID = {}",
            self.dialect.placeholder(1),
            self.dialect.placeholder(2)
        );
        let params = [value, SqlValue::Text(user_id.to_hex())];
        bind_values(sqlx::query(&sql), &params)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn insert_certificate(
        &self,
        conn: &mut AnyConnection,
        certificate: &Certificate,
    ) -> Result<()> {
        let params: Vec<SqlValue> = vec![
            certificate.owner_id.to_hex().into(),
            certificate.attribute.into(),
            certificate.identity_level.into(),
            hex::encode(&certificate.value).into(),
            certificate.validator_id.to_hex().into(),
        ];
        bind_values(sqlx::query(&self.cmd.insert_certificate), &params)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn fetch_certificates(
        &self,
        conn: &mut AnyConnection,
        owner_id: Address,
    ) -> Result<Vec<Certificate>> {
        let rows = sqlx::query(&self.cmd.select_certificates_by_owner)
            .bind(owner_id.to_hex())
            .fetch_all(conn)
            .await?;
        rows.iter().map(decode::decode_certificate).collect()
    }

    // ── validators, workers, blacklists ─────────────────────────────────────

    pub async fn insert_validator(
        &self,
        conn: &mut AnyConnection,
        validator: &Validator,
    ) -> Result<()> {
        sqlx::query(&self.cmd.insert_validator)
            .bind(validator.id.to_hex())
            .bind(validator.level as i64)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn update_validator(
        &self,
        conn: &mut AnyConnection,
        validator: &Validator,
    ) -> Result<()> {
        sqlx::query(&self.cmd.update_validator)
            .bind(validator.level as i64)
            .bind(validator.id.to_hex())
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn insert_worker(
        &self,
        conn: &mut AnyConnection,
        master_id: Address,
        slave_id: Address,
        confirmed: bool,
    ) -> Result<()> {
        sqlx::query(&self.cmd.insert_worker)
            .bind(master_id.to_hex())
            .bind(slave_id.to_hex())
            .bind(i64::from(confirmed))
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn update_worker_confirmed(
        &self,
        conn: &mut AnyConnection,
        master_id: Address,
        slave_id: Address,
        confirmed: bool,
    ) -> Result<()> {
        sqlx::query(&self.cmd.update_worker)
            .bind(i64::from(confirmed))
            .bind(master_id.to_hex())
            .bind(slave_id.to_hex())
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn delete_worker(
        &self,
        conn: &mut AnyConnection,
        master_id: Address,
        slave_id: Address,
    ) -> Result<()> {
        sqlx::query(&self.cmd.delete_worker)
            .bind(master_id.to_hex())
            .bind(slave_id.to_hex())
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn insert_blacklist_entry(
        &self,
        conn: &mut AnyConnection,
        adder_id: Address,
        addee_id: Address,
    ) -> Result<()> {
        sqlx::query(&self.cmd.insert_blacklist_entry)
            .bind(adder_id.to_hex())
            .bind(addee_id.to_hex())
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn delete_blacklist_entry(
        &self,
        conn: &mut AnyConnection,
        remover_id: Address,
        removee_id: Address,
    ) -> Result<()> {
        sqlx::query(&self.cmd.delete_blacklist_entry)
            .bind(remover_id.to_hex())
            .bind(removee_id.to_hex())
            .execute(conn)
            .await?;
        Ok(())
    }

    // ── ingestion cursor ────────────────────────────────────────────────────

    pub async fn last_known_block(&self, conn: &mut AnyConnection) -> Result<Option<u64>> {
        let row = sqlx::query(&self.cmd.select_last_block)
            .fetch_optional(conn)
            .await?;
        Ok(row
            .map(|r| r.try_get::<i64, _>(0))
            .transpose()?
            .map(|v| v as u64))
    }

    pub async fn insert_last_known_block(
        &self,
        conn: &mut AnyConnection,
        block_number: u64,
    ) -> Result<()> {
        sqlx::query(&self.cmd.insert_last_block)
            .bind(block_number as i64)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn update_last_known_block(
        &self,
        conn: &mut AnyConnection,
        block_number: u64,
    ) -> Result<()> {
        sqlx::query(&self.cmd.update_last_block)
            .bind(block_number as i64)
            .execute(conn)
            .await?;
        Ok(())
    }
}

fn schema_statements(dialect: Dialect, num_benchmarks: usize) -> Vec<String> {
    let bench_defs: String = (0..num_benchmarks)
        .map(|i| format!(", {} BIGINT NOT NULL", query::benchmark_column(i as u64)))
        .collect();

    vec![
        "CREATE TABLE IF NOT EXISTS LastKnownBlock (
            LastKnownBlock BIGINT NOT NULL
        )"
        .to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS Deals (
                Id TEXT PRIMARY KEY,
                SupplierID TEXT NOT NULL,
                ConsumerID TEXT NOT NULL,
                MasterID TEXT NOT NULL,
                AskID TEXT NOT NULL,
                BidID TEXT NOT NULL,
                Duration BIGINT NOT NULL,
                Price TEXT NOT NULL,
                StartTime BIGINT NOT NULL,
                EndTime BIGINT NOT NULL,
                Status BIGINT NOT NULL,
                BlockedBalance TEXT NOT NULL,
                TotalPayout TEXT NOT NULL,
                LastBillTS BIGINT NOT NULL,
                Netflags BIGINT NOT NULL,
                AskIdentityLevel BIGINT NOT NULL,
                BidIdentityLevel BIGINT NOT NULL,
                SupplierCertificates TEXT NOT NULL,
                ConsumerCertificates TEXT NOT NULL,
                ActiveChangeRequest BIGINT NOT NULL{bench_defs}
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS Orders (
                Id TEXT PRIMARY KEY,
                CreatedTS BIGINT NOT NULL,
                DealID TEXT NOT NULL,
                Type BIGINT NOT NULL,
                Status BIGINT NOT NULL,
                AuthorID TEXT NOT NULL,
                CounterpartyID TEXT NOT NULL,
                Duration BIGINT NOT NULL,
                Price TEXT NOT NULL,
                Netflags BIGINT NOT NULL,
                IdentityLevel BIGINT NOT NULL,
                Blacklist TEXT NOT NULL,
                Tag TEXT NOT NULL,
                FrozenSum TEXT NOT NULL,
                CreatorIdentityLevel BIGINT NOT NULL,
                CreatorName TEXT NOT NULL,
                CreatorCountry TEXT NOT NULL,
                CreatorCertificates TEXT NOT NULL{bench_defs}
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS DealConditions (
                Id {},
                SupplierID TEXT NOT NULL,
                ConsumerID TEXT NOT NULL,
                MasterID TEXT NOT NULL,
                Duration BIGINT NOT NULL,
                Price TEXT NOT NULL,
                StartTime BIGINT NOT NULL,
                EndTime BIGINT NOT NULL,
                TotalPayout TEXT NOT NULL,
                DealID TEXT NOT NULL
            )",
            dialect.auto_pk()
        ),
        "CREATE TABLE IF NOT EXISTS DealChangeRequests (
            Id TEXT PRIMARY KEY,
            CreatedTS BIGINT NOT NULL,
            RequestType BIGINT NOT NULL,
            Duration BIGINT NOT NULL,
            Price TEXT NOT NULL,
            Status BIGINT NOT NULL,
            DealID TEXT NOT NULL
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS DealPayments (
            BillTS BIGINT NOT NULL,
            PaidAmount TEXT NOT NULL,
            DealID TEXT NOT NULL,
            UNIQUE (BillTS, PaidAmount, DealID)
        )"
        .to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS Profiles (
                Id {},
                UserID TEXT NOT NULL UNIQUE,
                IdentityLevel BIGINT NOT NULL,
                Name TEXT NOT NULL,
                Country TEXT NOT NULL,
                IsCorporation BIGINT NOT NULL,
                IsProfessional BIGINT NOT NULL,
                Certificates TEXT NOT NULL,
                ActiveAsks BIGINT NOT NULL,
                ActiveBids BIGINT NOT NULL
            )",
            dialect.auto_pk()
        ),
        "CREATE TABLE IF NOT EXISTS Certificates (
            OwnerID TEXT NOT NULL,
            Attribute BIGINT NOT NULL,
            IdentityLevel BIGINT NOT NULL,
            Value TEXT NOT NULL,
            ValidatorID TEXT NOT NULL,
            UNIQUE (OwnerID, Attribute, ValidatorID)
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS Validators (
            Id TEXT PRIMARY KEY,
            Level BIGINT NOT NULL
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS Workers (
            MasterID TEXT NOT NULL,
            SlaveID TEXT NOT NULL,
            Confirmed BIGINT NOT NULL,
            UNIQUE (MasterID, SlaveID)
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS Blacklists (
            AdderID TEXT NOT NULL,
            AddeeID TEXT NOT NULL,
            UNIQUE (AdderID, AddeeID)
        )"
        .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_deals_supplier ON Deals (SupplierID)".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_deals_consumer ON Deals (ConsumerID)".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_orders_author ON Orders (AuthorID)".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_orders_status ON Orders (Status, Type)".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_conditions_deal ON DealConditions (DealID)".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_change_requests_deal ON DealChangeRequests (DealID)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_certificates_owner ON Certificates (OwnerID)".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_blacklists_adder ON Blacklists (AdderID)".to_string(),
    ]
}
