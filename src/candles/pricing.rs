//! Price arithmetic for candles
//!
//! Index candles track a whole-history cumulative weighted average: fee and
//! usage sums are carried across bucket boundaries indefinitely and the price
//! of every tick is `sum_fee_paid / sum_used` (integer division). Amounts are
//! parsed straight from decimal strings into 256-bit integers, never through
//! floating point.
//!
//! Trade candles use plain decimal prices.

use ethers::types::U256;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::error::CandleError;
use crate::types::Candle;

/// Parse a non-negative decimal string, truncating any fractional part
pub fn parse_amount(field: &'static str, value: &str) -> Result<U256, CandleError> {
    let invalid = || CandleError::InvalidAmount {
        field,
        value: value.to_string(),
    };

    let trimmed = value.trim();
    let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let (integer, fraction) = match unsigned.split_once('.') {
        Some((integer, fraction)) => (integer, Some(fraction)),
        None => (unsigned, None),
    };

    let digits_only = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !digits_only(integer) || !fraction.map(digits_only).unwrap_or(true) {
        return Err(invalid());
    }
    if integer.is_empty() {
        // ".5" truncates to zero; "" and "." carry no digits at all
        return match fraction {
            Some(f) if !f.is_empty() => Ok(U256::zero()),
            _ => Err(invalid()),
        };
    }

    // only digits remain, so the sole failure left is a value wider than 256 bits
    U256::from_dec_str(integer).map_err(|_| CandleError::AmountOverflow { field })
}

/// Running fee/usage sums of an index candle series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CumulativeSums {
    pub fee_paid: U256,
    pub used: U256,
}

impl CumulativeSums {
    /// Sums stored on a candle; `None` starts from zero
    pub fn from_candle(candle: Option<&Candle>) -> Result<Self, CandleError> {
        match candle {
            Some(c) => Ok(Self {
                fee_paid: parse_amount("sumFeePaid", &c.sum_fee_paid)?,
                used: parse_amount("sumUsed", &c.sum_used)?,
            }),
            None => Ok(Self::default()),
        }
    }

    /// Add one observation's already-parsed amounts
    pub fn add(&self, fee_paid: U256, used: U256) -> Result<Self, CandleError> {
        Ok(Self {
            fee_paid: self
                .fee_paid
                .checked_add(fee_paid)
                .ok_or(CandleError::AmountOverflow { field: "sumFeePaid" })?,
            used: self
                .used
                .checked_add(used)
                .ok_or(CandleError::AmountOverflow { field: "sumUsed" })?,
        })
    }

    /// `sum_fee_paid / sum_used`, or zero when nothing was used
    pub fn average(&self) -> U256 {
        if self.used.is_zero() {
            U256::zero()
        } else {
            self.fee_paid / self.used
        }
    }
}

/// Parse a trade price
pub fn parse_price(value: &str) -> Result<Decimal, CandleError> {
    let price = Decimal::from_str(value.trim()).map_err(|_| CandleError::InvalidAmount {
        field: "price",
        value: value.to_string(),
    })?;
    if price.is_sign_negative() {
        return Err(CandleError::InvalidAmount {
            field: "price",
            value: value.to_string(),
        });
    }
    Ok(price.normalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_integers_and_truncates_fractions() {
        assert_eq!(parse_amount("used", "100").unwrap(), U256::from(100u64));
        assert_eq!(parse_amount("used", "100.99").unwrap(), U256::from(100u64));
        assert_eq!(parse_amount("used", " 7 ").unwrap(), U256::from(7u64));
        assert_eq!(parse_amount("used", ".5").unwrap(), U256::zero());
        assert_eq!(parse_amount("used", "0").unwrap(), U256::zero());
    }

    #[test]
    fn keeps_precision_beyond_f64() {
        // 2^53 + 1 is not representable as f64
        let value = parse_amount("feePaid", "9007199254740993").unwrap();
        assert_eq!(value.to_string(), "9007199254740993");

        let wei = parse_amount("feePaid", "123456789012345678901234567890").unwrap();
        assert_eq!(wei.to_string(), "123456789012345678901234567890");
    }

    #[test]
    fn rejects_malformed_amounts() {
        for bad in ["", ".", "-5", "abc", "1e18", "12a", "1.2.3", "0x10"] {
            let err = parse_amount("used", bad).unwrap_err();
            assert_eq!(err.kind(), "parse", "input {bad:?}");
            assert!(matches!(err, CandleError::InvalidAmount { .. }));
        }
    }

    #[test]
    fn overflow_is_reported_distinctly() {
        let huge = "9".repeat(100);
        assert!(matches!(
            parse_amount("used", &huge),
            Err(CandleError::AmountOverflow { field: "used" })
        ));

        let max = CumulativeSums {
            fee_paid: U256::MAX,
            used: U256::zero(),
        };
        assert!(matches!(
            max.add(U256::one(), U256::one()),
            Err(CandleError::AmountOverflow { field: "sumFeePaid" })
        ));
    }

    #[test]
    fn average_is_integer_division_of_cumulative_sums() {
        let sums = CumulativeSums::default()
            .add(U256::from(10u64), U256::from(100u64))
            .unwrap();
        assert_eq!(sums.average(), U256::zero());

        let sums = sums.add(U256::from(200u64), U256::from(100u64)).unwrap();
        assert_eq!(sums.fee_paid, U256::from(210u64));
        assert_eq!(sums.used, U256::from(200u64));
        assert_eq!(sums.average(), U256::one());

        assert_eq!(CumulativeSums::default().average(), U256::zero());
    }

    #[test]
    fn trade_prices_are_normalized_decimals() {
        assert_eq!(parse_price("1.500").unwrap(), dec!(1.5));
        assert_eq!(parse_price("0.42").unwrap().to_string(), "0.42");
        assert!(parse_price("-1").is_err());
        assert!(parse_price("nan").is_err());
    }
}
