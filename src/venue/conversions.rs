// Contract/notional conversions and tick-size rounding.
// Tick sizes arrive as decimal strings; Decimal arithmetic keeps the tick's
// own scale in the rendered price (tick "0.50" yields "50000.50").

use anyhow::{anyhow, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use super::types::Product;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundDirection {
    /// Floor to the tick grid; used for buy limit prices.
    Down,
    /// Ceil to the tick grid; used for sell limit prices.
    Up,
    /// Half-away-from-zero; default for bracket and reference prices.
    Nearest,
}

/// Parses the string contract value from a product.
pub fn parse_contract_value(product: &Product) -> Result<f64> {
    if product.contract_value.is_empty() {
        return Err(anyhow!("contract value is empty for {}", product.symbol));
    }
    product
        .contract_value
        .parse()
        .map_err(|e| anyhow!("failed to parse contract value '{}': {e}", product.contract_value))
}

/// Converts a notional amount to a whole number of contracts.
/// Linear futures: contracts = notional / (price * contract_value), floored
/// to avoid over-exposure.
pub fn notional_to_contracts(notional: f64, price: f64, product: &Product) -> Result<i64> {
    if price <= 0.0 {
        return Err(anyhow!("price must be positive"));
    }
    let cv = parse_contract_value(product)?;
    if cv <= 0.0 {
        return Err(anyhow!("contract value must be positive"));
    }
    Ok((notional / (price * cv)).floor() as i64)
}

/// Converts a contract count back to notional. Round-trips with
/// `notional_to_contracts` by multiplication.
pub fn contracts_to_notional(contracts: i64, price: f64, product: &Product) -> Result<f64> {
    if price <= 0.0 {
        return Err(anyhow!("price must be positive"));
    }
    let cv = parse_contract_value(product)?;
    Ok(contracts as f64 * price * cv)
}

/// Rounds a price onto the tick grid and renders it with the tick's scale.
/// An unparseable or non-positive tick falls back to two decimals.
pub fn round_to_tick(price: f64, tick_size: &str, direction: RoundDirection) -> String {
    let tick = match tick_size.parse::<Decimal>() {
        Ok(t) if t > Decimal::ZERO => t,
        _ => return format!("{price:.2}"),
    };
    let price_dec = match Decimal::from_f64(price) {
        Some(p) => p,
        None => return format!("{price:.2}"),
    };

    let steps = price_dec / tick;
    let steps = match direction {
        RoundDirection::Down => steps.floor(),
        RoundDirection::Up => steps.ceil(),
        RoundDirection::Nearest => {
            steps.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        }
    };

    let mut rounded = steps * tick;
    rounded.rescale(tick.scale());
    rounded.to_string()
}

/// Nearest-tick rounding; the common case for bracket prices.
pub fn round_to_tick_nearest(price: f64, tick_size: &str) -> String {
    round_to_tick(price, tick_size, RoundDirection::Nearest)
}

/// Maps an order side to the rounding direction that avoids crossing the
/// intended price: floor for buys, ceil for sells.
pub fn direction_for_side(side: &str) -> RoundDirection {
    if side == "buy" {
        RoundDirection::Down
    } else {
        RoundDirection::Up
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::types::mock_product;

    #[test]
    fn round_nearest() {
        assert_eq!(
            round_to_tick(50000.123, "0.1", RoundDirection::Nearest),
            "50000.1"
        );
        assert_eq!(
            round_to_tick(50000.123, "0.5", RoundDirection::Nearest),
            "50000.0"
        );
        // Tick scale carries into the rendered price.
        assert_eq!(
            round_to_tick(50000.5, "0.50", RoundDirection::Nearest),
            "50000.50"
        );
    }

    #[test]
    fn round_directional() {
        assert_eq!(round_to_tick(1.23456, "0.01", RoundDirection::Down), "1.23");
        assert_eq!(round_to_tick(50001.0, "0.5", RoundDirection::Up), "50001.0");
        assert_eq!(
            round_to_tick(50000.123, "0.5", RoundDirection::Up),
            "50000.5"
        );
    }

    #[test]
    fn round_with_invalid_tick_falls_back() {
        assert_eq!(round_to_tick(50000.123, "", RoundDirection::Nearest), "50000.12");
        assert_eq!(round_to_tick(50000.123, "0", RoundDirection::Down), "50000.12");
    }

    #[test]
    fn notional_to_contracts_floors() {
        let mut product = mock_product("BTCUSD");
        product.contract_value = "0.1".into();
        assert_eq!(notional_to_contracts(1000.0, 100.0, &product).unwrap(), 100);
        assert_eq!(notional_to_contracts(999.0, 100.0, &product).unwrap(), 99);
    }

    #[test]
    fn contracts_round_trip_by_multiplication() {
        let mut product = mock_product("BTCUSD");
        product.contract_value = "0.001".into();
        let notional = contracts_to_notional(10, 50_000.0, &product).unwrap();
        assert!((notional - 500.0).abs() < 1e-9);
        assert_eq!(
            notional_to_contracts(notional, 50_000.0, &product).unwrap(),
            10
        );
    }

    #[test]
    fn conversion_rejects_bad_inputs() {
        let product = mock_product("BTCUSD");
        assert!(notional_to_contracts(1000.0, 0.0, &product).is_err());
        let mut empty = product.clone();
        empty.contract_value = String::new();
        assert!(notional_to_contracts(1000.0, 100.0, &empty).is_err());
    }
}
