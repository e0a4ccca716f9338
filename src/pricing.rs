// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Price resolution for charging sessions.
//!
//! An announcement prices energy either at a single fixed rate or on a
//! graduated schedule where the whole quantity is billed at the rate of the
//! band it falls into:
//!
//! ```text
//!   kwh ≤ 30  ──► 0.35 €/kWh
//!   kwh ≤ 60  ──► 0.30 €/kWh
//!   beyond    ──► 0.25 €/kWh   (open tier, limit = null)
//! ```
//!
//! A minimum-KWh floor raises the billed quantity before the rate is picked.
//! Calculation is exact [`Decimal`] arithmetic; rounding to cents happens only
//! when amounts are formatted (see [`format_amount`]).
//!
//! # Example
//!
//! ```
//! use kwh_market::pricing::{PricingConfig, PricingTier};
//! use rust_decimal_macros::dec;
//!
//! let pricing = PricingConfig::graduated(vec![
//!     PricingTier::up_to(dec!(30), dec!(0.35)),
//!     PricingTier::open(dec!(0.25)),
//! ]);
//! let quote = pricing.quote(dec!(45)).unwrap();
//! assert_eq!(quote.total_amount, dec!(11.25));
//! ```

use crate::MarketError;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Decimal places used when presenting currency amounts.
pub const CURRENCY_PRECISION: u32 = 2;

/// Rounds a currency amount for presentation.
pub fn format_amount(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(CURRENCY_PRECISION, RoundingStrategy::MidpointAwayFromZero)
}

/// One band of a graduated schedule.
///
/// `limit: None` is the open "and beyond" band and must come last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingTier {
    pub limit: Option<Decimal>,
    pub price: Decimal,
}

impl PricingTier {
    pub fn up_to(limit: Decimal, price: Decimal) -> Self {
        Self {
            limit: Some(limit),
            price,
        }
    }

    pub fn open(price: Decimal) -> Self {
        Self { limit: None, price }
    }

    fn covers(&self, kwh: Decimal) -> bool {
        self.limit.is_none_or(|limit| kwh <= limit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "pricing_type", rename_all = "snake_case")]
pub enum PricingScheme {
    Fixed { base_price: Decimal },
    Graduated { tiers: Vec<PricingTier> },
}

/// Pricing section of an announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(flatten)]
    pub scheme: PricingScheme,
    #[serde(default)]
    pub minimum_kwh: Option<Decimal>,
}

/// Result of pricing a session; frozen onto the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    /// Quantity the buyer reported.
    pub actual_kwh: Decimal,
    /// Quantity billed, after the minimum floor.
    pub billed_kwh: Decimal,
    pub price_per_kwh: Decimal,
    pub total_amount: Decimal,
    /// Band used for graduated pricing, `None` for fixed pricing.
    pub applied_tier: Option<PricingTier>,
}

impl PricingConfig {
    pub fn fixed(base_price: Decimal) -> Self {
        Self {
            scheme: PricingScheme::Fixed { base_price },
            minimum_kwh: None,
        }
    }

    pub fn graduated(tiers: Vec<PricingTier>) -> Self {
        Self {
            scheme: PricingScheme::Graduated { tiers },
            minimum_kwh: None,
        }
    }

    pub fn with_minimum_kwh(mut self, minimum_kwh: Decimal) -> Self {
        self.minimum_kwh = Some(minimum_kwh);
        self
    }

    /// Checks the schedule a seller submitted.
    ///
    /// # Errors
    ///
    /// [`MarketError::Validation`] for non-positive prices or minimum, an empty
    /// tier list, limits that do not strictly increase, or an open tier that
    /// is not the last one.
    pub fn validate(&self) -> Result<(), MarketError> {
        if let Some(minimum) = self.minimum_kwh {
            if minimum <= Decimal::ZERO {
                return Err(MarketError::validation("minimum kwh must be positive"));
            }
        }

        match &self.scheme {
            PricingScheme::Fixed { base_price } => {
                if *base_price <= Decimal::ZERO {
                    return Err(MarketError::validation("base price must be positive"));
                }
            }
            PricingScheme::Graduated { tiers } => {
                if tiers.is_empty() {
                    return Err(MarketError::validation("graduated pricing needs at least one tier"));
                }
                let mut previous: Option<Decimal> = None;
                for (index, tier) in tiers.iter().enumerate() {
                    if tier.price <= Decimal::ZERO {
                        return Err(MarketError::validation("tier price must be positive"));
                    }
                    match tier.limit {
                        None if index + 1 != tiers.len() => {
                            return Err(MarketError::validation("open tier must be the last tier"));
                        }
                        None => {}
                        Some(limit) => {
                            if limit <= Decimal::ZERO || previous.is_some_and(|p| limit <= p) {
                                return Err(MarketError::validation(
                                    "tier limits must be positive and strictly increasing",
                                ));
                            }
                            previous = Some(limit);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Quantity billed for a reading: the reading or the minimum, whichever is larger.
    pub fn effective_kwh(&self, kwh: Decimal) -> Decimal {
        self.minimum_kwh.map_or(kwh, |minimum| kwh.max(minimum))
    }

    /// Resolves price and total for a declared reading.
    ///
    /// The first tier whose limit is open or at least the billed quantity
    /// applies. A schedule without an open tier bills larger quantities at
    /// the last tier's price.
    ///
    /// # Errors
    ///
    /// [`MarketError::Validation`] when `kwh` is not positive, the schedule
    /// has no tiers, or the total does not fit in a [`Decimal`].
    pub fn quote(&self, kwh: Decimal) -> Result<PriceQuote, MarketError> {
        if kwh <= Decimal::ZERO {
            return Err(MarketError::validation("kwh must be positive"));
        }

        let billed_kwh = self.effective_kwh(kwh);
        let (price_per_kwh, applied_tier) = match &self.scheme {
            PricingScheme::Fixed { base_price } => (*base_price, None),
            PricingScheme::Graduated { tiers } => {
                let tier = tiers
                    .iter()
                    .find(|tier| tier.covers(billed_kwh))
                    .or_else(|| tiers.last())
                    .ok_or_else(|| MarketError::validation("graduated pricing has no tiers"))?;
                (tier.price, Some(*tier))
            }
        };

        let total_amount = billed_kwh
            .checked_mul(price_per_kwh)
            .ok_or_else(|| MarketError::validation("amount out of range"))?;

        Ok(PriceQuote {
            actual_kwh: kwh,
            billed_kwh,
            price_per_kwh,
            total_amount,
            applied_tier,
        })
    }
}
