use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A tracked wallet and how aggressively we mirror it. Loaded once from
/// configuration; immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTarget {
    pub address: String,
    pub label: Option<String>,
    /// Fraction of the whale's trade size we mirror (e.g. 0.1).
    pub mirror_ratio: Decimal,
    /// Optional per-wallet cap on committed budget, in quote currency.
    pub budget_cap: Option<Decimal>,
}

impl WalletTarget {
    /// Parse a single `address:ratio[:cap]` config entry.
    pub fn parse(entry: &str) -> anyhow::Result<Self> {
        let mut parts = entry.trim().split(':');

        let address = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("wallet target missing address: {entry:?}"))?
            .to_string();

        let ratio_raw = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("wallet target missing mirror ratio: {entry:?}"))?;
        let mirror_ratio = Decimal::from_str(ratio_raw)
            .map_err(|e| anyhow::anyhow!("invalid mirror ratio {ratio_raw:?}: {e}"))?;
        if mirror_ratio <= Decimal::ZERO {
            anyhow::bail!("mirror ratio must be positive: {entry:?}");
        }

        let budget_cap = match parts.next() {
            Some(raw) => Some(
                Decimal::from_str(raw)
                    .map_err(|e| anyhow::anyhow!("invalid budget cap {raw:?}: {e}"))?,
            ),
            None => None,
        };

        Ok(Self {
            address,
            label: None,
            mirror_ratio,
            budget_cap,
        })
    }

    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.address)
    }
}
