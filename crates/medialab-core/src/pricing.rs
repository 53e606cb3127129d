//! Price table
//!
//! Built once from [`PricingConfig`]. Prices are configured in major units and
//! held in minor units; the reservation snapshots whatever this table returns.

use crate::config::PricingConfig;
use crate::error::AppError;
use crate::models::OperationKind;
use crate::AppResult;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use std::str::FromStr;

/// Minor units per major unit
pub const MINOR_UNITS: i64 = 100;

#[derive(Debug, Clone)]
pub struct PriceTable {
    base: HashMap<OperationKind, i64>,
    overrides: HashMap<(String, OperationKind), i64>,
}

impl PriceTable {
    pub fn from_config(config: &PricingConfig) -> AppResult<Self> {
        let mut base = HashMap::new();
        for (kind, price) in &config.kinds {
            let kind = OperationKind::from_str(kind)
                .map_err(|_| AppError::Config(format!("unknown operation kind in pricing: {}", kind)))?;
            base.insert(kind, to_minor(*price)?);
        }

        let mut overrides = HashMap::new();
        for rule in &config.models {
            let price = to_minor(rule.price)?;
            for kind in &rule.kinds {
                let kind = OperationKind::from_str(kind).map_err(|_| {
                    AppError::Config(format!(
                        "unknown operation kind in pricing for model {}: {}",
                        rule.model, kind
                    ))
                })?;
                overrides.insert((rule.model.to_lowercase(), kind), price);
            }
        }

        Ok(Self { base, overrides })
    }

    /// Build a table directly from minor-unit prices
    pub fn from_minor(prices: impl IntoIterator<Item = (OperationKind, i64)>) -> Self {
        Self {
            base: prices.into_iter().collect(),
            overrides: HashMap::new(),
        }
    }

    /// Base price for `kind`, with a model override when one matches
    pub fn base_price(&self, kind: OperationKind, model: Option<&str>) -> AppResult<i64> {
        if let Some(model) = model {
            if let Some(price) = self.overrides.get(&(model.to_lowercase(), kind)) {
                return Ok(*price);
            }
        }

        self.base
            .get(&kind)
            .copied()
            .ok_or_else(|| AppError::UnknownOperationKind(kind.to_string()))
    }
}

fn to_minor(major: Decimal) -> AppResult<i64> {
    if major.is_sign_negative() {
        return Err(AppError::Config(format!("negative price: {}", major)));
    }
    (major * Decimal::from(MINOR_UNITS))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| AppError::Config(format!("price out of range: {}", major)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelPriceRule;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_table() {
        let table = PriceTable::from_config(&PricingConfig::default()).unwrap();
        assert_eq!(table.base_price(OperationKind::Generate, None).unwrap(), 900);
        assert_eq!(table.base_price(OperationKind::AddText, None).unwrap(), 100);
        assert_eq!(
            table
                .base_price(OperationKind::Generate, Some("Seedream"))
                .unwrap(),
            750
        );
        assert_eq!(
            table
                .base_price(OperationKind::Merge, Some("nano-banana-pro"))
                .unwrap(),
            2600
        );
        // no override for upscale
        assert_eq!(
            table
                .base_price(OperationKind::Upscale, Some("seedream"))
                .unwrap(),
            900
        );
    }

    #[test]
    fn test_missing_kind_is_unknown() {
        let table = PriceTable::from_minor([(OperationKind::Generate, 50)]);
        assert!(matches!(
            table.base_price(OperationKind::FaceSwap, None),
            Err(AppError::UnknownOperationKind(_))
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PricingConfig::default();
        config.kinds.insert("paint".to_string(), dec!(1));
        assert!(PriceTable::from_config(&config).is_err());

        let mut config = PricingConfig::default();
        config.models.push(ModelPriceRule {
            model: "x".to_string(),
            kinds: vec!["generate".to_string()],
            price: dec!(-1),
        });
        assert!(matches!(
            PriceTable::from_config(&config),
            Err(AppError::Config(_))
        ));
    }
}
