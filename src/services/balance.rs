use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use utoipa::ToSchema;

use crate::{
    entities::inventory_transaction::{
        self, Entity as InventoryTransactionEntity, Inspection, ProductType, TxnAction,
        NOTE_TAG_POOL_RETURN,
    },
    errors::ServiceError,
};

/// Serial token used by legacy rows whose physical unit was never identified.
/// Such rows are invisible to picking.
const PLACEHOLDER_SERIAL: &str = "N/A";

/// One distinct serial with sellable stock on hand, ordered for FIFO-by-expiry
/// picking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct StockCandidate {
    pub serial_no: String,
    pub exp_date: NaiveDate,
    pub batch_no: Option<String>,
    pub on_hand: i32,
}

/// One logical unit chosen by the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PickedProduct {
    pub serial_no: String,
    pub spec_no: String,
    pub exp_date: NaiveDate,
    pub batch_no: Option<String>,
    pub qty: i32,
}

#[derive(Debug, Default)]
struct SerialAccum {
    on_hand: i32,
    exp_date: Option<NaiveDate>,
    batch_no: Option<String>,
}

/// Signed quantity contribution of a ledger row to sellable stock.
///
/// `USED_CASE` is terminal: the unit already left the shelf through its
/// checkout row, so it must not double-subtract. Rejected returns and
/// mid-trip pool returns are audit rows; the stock they describe is accounted
/// for elsewhere (the demo move, resp. the soft-deleted checkout).
fn signed_contribution(row: &inventory_transaction::Model) -> i32 {
    match row.action() {
        Some(TxnAction::ReceiveStock) => row.qty,
        Some(TxnAction::ReturnCase) => {
            if row.inspection() == Some(Inspection::Reject)
                || row.has_system_tag(NOTE_TAG_POOL_RETURN)
            {
                0
            } else {
                row.qty
            }
        }
        Some(TxnAction::ShipStock)
        | Some(TxnAction::CheckoutCase)
        | Some(TxnAction::CheckoutTrip) => -row.qty,
        Some(TxnAction::UsedCase) | Some(TxnAction::MoveDemo) | None => 0,
    }
}

fn is_countable(row: &inventory_transaction::Model) -> bool {
    row.deleted_at.is_none() && row.action() != Some(TxnAction::MoveDemo)
}

/// Folds ledger rows for one spec into per-serial candidates as of
/// `reference_date`.
///
/// Pure function over the fetched rows: soft-deleted and demo-pool rows are
/// skipped, receipts accumulate quantity and track the earliest recorded
/// expiration per serial, checkouts subtract. Serials with a placeholder
/// token, non-positive stock, no recorded expiration, or an expiration before
/// the reference date are dropped. The result is sorted ascending by
/// expiration; ties carry no defined order.
pub fn resolve_candidates(
    rows: &[inventory_transaction::Model],
    reference_date: NaiveDate,
) -> Vec<StockCandidate> {
    let mut per_serial: BTreeMap<String, SerialAccum> = BTreeMap::new();

    for row in rows {
        if !is_countable(row) {
            continue;
        }
        let serial = match row.serial_no.as_deref() {
            Some(s) if !s.is_empty() && s != PLACEHOLDER_SERIAL => s.to_string(),
            _ => continue,
        };

        let accum = per_serial.entry(serial).or_default();
        accum.on_hand += signed_contribution(row);

        let is_receipt = matches!(
            row.action(),
            Some(TxnAction::ReceiveStock) | Some(TxnAction::ReturnCase)
        );
        if is_receipt {
            if let Some(exp) = row.exp_date {
                accum.exp_date = Some(match accum.exp_date {
                    Some(existing) => existing.min(exp),
                    None => exp,
                });
            }
            if accum.batch_no.is_none() {
                accum.batch_no = row.batch_no.clone();
            }
        }
    }

    let mut candidates: Vec<StockCandidate> = per_serial
        .into_iter()
        .filter_map(|(serial_no, accum)| {
            let exp_date = accum.exp_date?;
            if accum.on_hand <= 0 || exp_date < reference_date {
                return None;
            }
            Some(StockCandidate {
                serial_no,
                exp_date,
                batch_no: accum.batch_no,
                on_hand: accum.on_hand,
            })
        })
        .collect();

    candidates.sort_by_key(|c| c.exp_date);
    candidates
}

/// Greedy FIFO-by-expiry pick over resolved candidates.
///
/// Never fails on shortage: when candidates run out the partial list is
/// returned and the caller decides whether an under-fill is acceptable.
pub fn pick_from_candidates(
    candidates: &[StockCandidate],
    spec_no: &str,
    qty: i32,
) -> Vec<PickedProduct> {
    let mut remaining = qty;
    let mut picked = Vec::new();

    for candidate in candidates {
        if remaining <= 0 {
            break;
        }
        let take = remaining.min(candidate.on_hand);
        for _ in 0..take {
            picked.push(PickedProduct {
                serial_no: candidate.serial_no.clone(),
                spec_no: spec_no.to_string(),
                exp_date: candidate.exp_date,
                batch_no: candidate.batch_no.clone(),
                qty: 1,
            });
        }
        remaining -= take;
    }

    picked
}

/// Fetches the non-deleted ledger rows for a spec, demo pool excluded, in
/// insertion order. Generic over the connection so allocation inside an open
/// transaction sees its own uncommitted writes.
pub async fn ledger_rows_on<C: ConnectionTrait>(
    conn: &C,
    spec_no: &str,
    product_type: ProductType,
) -> Result<Vec<inventory_transaction::Model>, ServiceError> {
    InventoryTransactionEntity::find()
        .filter(inventory_transaction::Column::SpecNo.eq(spec_no))
        .filter(inventory_transaction::Column::ProductType.eq(product_type.as_str()))
        .filter(inventory_transaction::Column::DeletedAt.is_null())
        .filter(inventory_transaction::Column::Action.ne(TxnAction::MoveDemo.as_str()))
        .order_by_asc(inventory_transaction::Column::CreatedAt)
        .order_by_asc(inventory_transaction::Column::Id)
        .all(conn)
        .await
        .map_err(ServiceError::db_error)
}

/// Resolves FIFO-ordered candidates against an arbitrary connection.
pub async fn stock_candidates_on<C: ConnectionTrait>(
    conn: &C,
    spec_no: &str,
    product_type: ProductType,
    reference_date: NaiveDate,
) -> Result<Vec<StockCandidate>, ServiceError> {
    let rows = ledger_rows_on(conn, spec_no, product_type).await?;
    Ok(resolve_candidates(&rows, reference_date))
}

/// Greedy pick against an arbitrary connection.
pub async fn pick_products_on<C: ConnectionTrait>(
    conn: &C,
    spec_no: &str,
    product_type: ProductType,
    reference_date: NaiveDate,
    qty: i32,
) -> Result<Vec<PickedProduct>, ServiceError> {
    let candidates = stock_candidates_on(conn, spec_no, product_type, reference_date).await?;
    Ok(pick_from_candidates(&candidates, spec_no, qty))
}

/// Raw on-hand quantity for one serial, ignoring expiration, against an
/// arbitrary connection.
pub async fn serial_balance_on<C: ConnectionTrait>(
    conn: &C,
    spec_no: &str,
    product_type: ProductType,
    serial_no: &str,
) -> Result<i32, ServiceError> {
    let rows = ledger_rows_on(conn, spec_no, product_type).await?;
    Ok(rows
        .iter()
        .filter(|r| is_countable(r) && r.serial_no.as_deref() == Some(serial_no))
        .map(signed_contribution)
        .sum())
}

/// Read-side service deriving on-hand stock from the transaction ledger.
#[derive(Clone)]
pub struct BalanceService {
    db: Arc<DatabaseConnection>,
}

impl BalanceService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Returns the FIFO-ordered candidates eligible for clinical use as of
    /// the reference date.
    #[instrument(skip(self))]
    pub async fn stock_candidates(
        &self,
        spec_no: &str,
        product_type: ProductType,
        reference_date: NaiveDate,
    ) -> Result<Vec<StockCandidate>, ServiceError> {
        stock_candidates_on(&*self.db, spec_no, product_type, reference_date).await
    }

    /// Greedily allocates `qty` units oldest-expiration-first. Returns a
    /// short list when stock is insufficient; callers surface that to the
    /// user where a full fill is required.
    #[instrument(skip(self))]
    pub async fn pick_products(
        &self,
        spec_no: &str,
        product_type: ProductType,
        reference_date: NaiveDate,
        qty: i32,
    ) -> Result<Vec<PickedProduct>, ServiceError> {
        if qty <= 0 {
            return Err(ServiceError::ValidationError(
                "quantity must be positive".to_string(),
            ));
        }
        pick_products_on(&*self.db, spec_no, product_type, reference_date, qty).await
    }

    /// Returns every eligible unit, uncapped, so a caller can substitute a
    /// specific serial instead of accepting the greedy pick.
    #[instrument(skip(self))]
    pub async fn available_products(
        &self,
        spec_no: &str,
        product_type: ProductType,
        reference_date: NaiveDate,
    ) -> Result<Vec<PickedProduct>, ServiceError> {
        let candidates = self
            .stock_candidates(spec_no, product_type, reference_date)
            .await?;
        let total: i32 = candidates.iter().map(|c| c.on_hand).sum();
        Ok(pick_from_candidates(&candidates, spec_no, total))
    }

    /// Raw on-hand quantity for one serial, ignoring expiration. Used to
    /// validate direct stock movements such as ship-outs.
    #[instrument(skip(self))]
    pub async fn serial_balance(
        &self,
        spec_no: &str,
        product_type: ProductType,
        serial_no: &str,
    ) -> Result<i32, ServiceError> {
        serial_balance_on(&*self.db, spec_no, product_type, serial_no).await
    }
}
