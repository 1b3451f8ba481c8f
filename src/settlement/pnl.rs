//! American-odds PnL in units staked

use crate::models::SettlementResult;

/// A usable American price: finite with |price| >= 100.
fn is_valid_price(price: f64) -> bool {
    price.is_finite() && price.abs() >= 100.0
}

/// Profit for a one-unit stake.
///
/// PUSH is 0 and LOSS is -1 regardless of price. A WIN needs a valid price;
/// without one the PnL is unknown (`None`) while the result still stands.
pub fn pnl_units(result: SettlementResult, price: Option<f64>) -> Option<f64> {
    match result {
        SettlementResult::Push => Some(0.0),
        SettlementResult::Loss => Some(-1.0),
        SettlementResult::Win => match price {
            Some(p) if is_valid_price(p) && p > 0.0 => Some(p / 100.0),
            Some(p) if is_valid_price(p) => Some(100.0 / p.abs()),
            _ => None,
        },
    }
}
