// ===============================
// src/classify.rs
// ===============================
//
// Maps raw broker operation records onto the fixed set of accounting kinds
// the ledger understands. Anything the ledger has no use for becomes
// `Ignored`; an unknown type is logged once per record and never aborts the
// rebuild.

use tracing::warn;

use crate::broker::RawOperation;
use crate::domain::{Currency, Operation, OperationKind};

pub const STATUS_DONE: &str = "Done";
pub const INSTRUMENT_TYPE_CURRENCY: &str = "Currency";

/// Pure mapping from the broker's operation type string.
pub fn kind_of(operation_type: &str) -> OperationKind {
    match operation_type {
        "Buy" | "BuyCard" => OperationKind::Buy,
        "Sell" => OperationKind::Sell,
        "Dividend" => OperationKind::Dividend,
        "Tax" => OperationKind::Tax,
        "TaxBack" => OperationKind::TaxRefund,
        "TaxDividend" => OperationKind::TaxOnDividend,
        "BrokerCommission" | "PayIn" | "PayOut" => OperationKind::Ignored,
        _ => OperationKind::Ignored,
    }
}

fn is_known(operation_type: &str) -> bool {
    matches!(
        operation_type,
        "Buy" | "BuyCard" | "Sell" | "Dividend" | "Tax" | "TaxBack" | "TaxDividend"
            | "BrokerCommission" | "PayIn" | "PayOut"
    )
}

/// Classifies one raw record. Returns `None` for records the ledger must not
/// see: unfinished or currency-class operations, pay-in/pay-out/commission
/// records, unknown types and records with an unparseable currency.
pub fn classify(raw: &RawOperation) -> Option<Operation> {
    if raw.status != STATUS_DONE || raw.instrument_type == INSTRUMENT_TYPE_CURRENCY {
        return None;
    }
    if !is_known(&raw.operation_type) {
        warn!(figi = %raw.figi, operation_type = %raw.operation_type, "unknown operation type, skipping");
        return None;
    }
    let kind = kind_of(&raw.operation_type);
    if kind == OperationKind::Ignored {
        return None;
    }
    let Some(currency) = Currency::parse(&raw.currency) else {
        warn!(figi = %raw.figi, currency = %raw.currency, "unknown operation currency, skipping");
        return None;
    };
    Some(Operation {
        at: raw.date,
        kind,
        figi: raw.figi.clone(),
        currency,
        payment: raw.payment,
        commission: raw.commission,
        trades: raw.trades.clone(),
    })
}
