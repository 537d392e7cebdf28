//! The consensus value.
//!
//! On the wire a value is the XDR encoding of a `StellarValue`: the hash of
//! the proposed transaction set, the proposed close time, and a list of
//! ledger upgrades. The herder always carries the base fee it proposes as a
//! single `LedgerUpgrade::BaseFee` entry, and [`LedgerValue`] is the
//! structured form of that triple.

use std::fmt;

use lumen_common::Hash256;
use serde::{Deserialize, Serialize};
use stellar_xdr::curr::{
    LedgerUpgrade, Limits, ReadXdr, StellarValue, StellarValueExt, TimePoint, UpgradeType, Value,
    WriteXdr,
};

use crate::error::HerderError;
use crate::Result;

/// Structured consensus value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerValue {
    /// Content hash of the proposed transaction set.
    pub tx_set_hash: Hash256,
    /// Proposed close time, seconds since the Unix epoch.
    pub close_time: u64,
    /// Proposed base fee per operation.
    pub base_fee: u32,
}

impl LedgerValue {
    pub fn new(tx_set_hash: Hash256, close_time: u64, base_fee: u32) -> Self {
        Self {
            tx_set_hash,
            close_time,
            base_fee,
        }
    }

    /// Build the XDR `StellarValue`.
    pub fn to_stellar_value(&self) -> Result<StellarValue> {
        let upgrade = LedgerUpgrade::BaseFee(self.base_fee).to_xdr(Limits::none())?;
        let upgrades = vec![UpgradeType::try_from(upgrade)?];
        Ok(StellarValue {
            tx_set_hash: self.tx_set_hash.into(),
            close_time: TimePoint(self.close_time),
            upgrades: upgrades.try_into()?,
            ext: StellarValueExt::Basic,
        })
    }

    /// Read the structured form out of a `StellarValue`.
    ///
    /// The value must carry exactly one base fee upgrade.
    pub fn from_stellar_value(value: &StellarValue) -> Result<Self> {
        let mut base_fee = None;
        for upgrade in value.upgrades.iter() {
            match LedgerUpgrade::from_xdr(upgrade.0.as_slice(), Limits::none())? {
                LedgerUpgrade::BaseFee(fee) if base_fee.is_none() => base_fee = Some(fee),
                LedgerUpgrade::BaseFee(_) => {
                    return Err(HerderError::MalformedValue(
                        "more than one base fee upgrade".to_string(),
                    ))
                }
                other => {
                    return Err(HerderError::MalformedValue(format!(
                        "unsupported upgrade {:?}",
                        other.discriminant()
                    )))
                }
            }
        }
        let base_fee = base_fee
            .ok_or_else(|| HerderError::MalformedValue("missing base fee".to_string()))?;
        Ok(Self {
            tx_set_hash: Hash256::from(&value.tx_set_hash),
            close_time: value.close_time.0,
            base_fee,
        })
    }

    /// Encode as an opaque consensus [`Value`].
    pub fn to_value(&self) -> Result<Value> {
        let bytes = self.to_stellar_value()?.to_xdr(Limits::none())?;
        Ok(Value::try_from(bytes)?)
    }

    /// Decode an opaque consensus [`Value`].
    pub fn from_value(value: &Value) -> Result<Self> {
        let stellar_value = StellarValue::from_xdr(value.as_slice(), Limits::none())?;
        Self::from_stellar_value(&stellar_value)
    }
}

impl fmt::Display for LedgerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[txset={} close={} fee={}]",
            self.tx_set_hash.short(),
            self.close_time,
            self.base_fee
        )
    }
}
