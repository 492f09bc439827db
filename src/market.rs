//! Constant-product market math.
//!
//! Pure arithmetic for computing the trade that moves an x*y=k pool onto a
//! target price, plus the standard execution-amount formulas used to bound
//! and verify those trades. Everything here is exact Uint256 integer math,
//! division truncates toward zero, no value ever passes through a float.

use crate::error::BrokerError;
use clarity::Uint256;
use num_traits::Bounded;

/// A proportional fee taken from the input amount of every swap, expressed
/// as the retained fraction numerator/denominator of the input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapFee {
    pub numerator: u32,
    pub denominator: u32,
}

impl SwapFee {
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// A usable fee retains a nonzero fraction of the input and never more
    /// than all of it
    pub fn is_valid(&self) -> bool {
        self.numerator != 0 && self.denominator != 0 && self.numerator <= self.denominator
    }
}

/// The 0.3% fee applied by Uniswap V2 pairs, 997/1000 of the input remains
pub const UNISWAP_V2_FEE: SwapFee = SwapFee::new(997, 1000);

/// A feeless pool, useful for tests and fee-exempt AMM deployments
pub const NO_FEE: SwapFee = SwapFee::new(1, 1);

/// The outcome of a trade-size computation: which token to sell into the
/// pool and how much of it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketTrade {
    /// true sells token A into the pool for token B, false the reverse
    pub a_to_b: bool,
    /// gross input amount, zero when the pool already sits on target
    pub amount_in: Uint256,
}

impl MarketTrade {
    pub fn is_noop(&self) -> bool {
        self.amount_in.is_zero()
    }
}

// Uint256 arithmetic asserts on overflow, so rule it out up front
fn checked_mul(a: Uint256, b: Uint256, ctx: &str) -> Result<Uint256, BrokerError> {
    if a.is_zero() || b.is_zero() {
        return Ok(0u8.into());
    }
    if a > Uint256::max_value() / b {
        return Err(BrokerError::Overflow(ctx.to_string()));
    }
    Ok(a * b)
}

fn ensure_reserves(reserve_in: Uint256, reserve_out: Uint256) -> Result<(), BrokerError> {
    if reserve_in.is_zero() || reserve_out.is_zero() {
        return Err(BrokerError::InvalidInput(
            "Pool reserves must be positive".to_string(),
        ));
    }
    Ok(())
}

fn ensure_fee(fee: SwapFee) -> Result<(), BrokerError> {
    if !fee.is_valid() {
        return Err(BrokerError::InvalidInput(format!(
            "Unusable swap fee {}/{}",
            fee.numerator, fee.denominator
        )));
    }
    Ok(())
}

/// Floor of the true square root of `x`, by babylonian iteration.
///
/// The iteration starts above the root and decreases monotonically, so the
/// first non-decreasing step is exactly the floor.
pub fn integer_sqrt(x: Uint256) -> Uint256 {
    if x.is_zero() {
        return x;
    }
    let two: Uint256 = 2u8.into();
    let one: Uint256 = 1u8.into();
    let mut z = x;
    let mut y = x / two + one;
    while y < z {
        z = y;
        y = (x / y + y) / two;
    }
    z
}

/// Computes the trade required to move a constant-product pool onto a
/// target price.
///
/// The target ("true") price is the price of token A denominated in token
/// B, as the ratio `true_price_numerator / true_price_denominator`. The
/// pool's current implied price of A is `reserve_b / reserve_a`; selling A
/// lowers it, selling B raises it, and the direction flag picks whichever
/// side moves the pool toward the target.
///
/// The returned amount is the gross input: the fee-retained portion of it
/// moves the reserve ratio onto the target, so after execution the spot
/// price matches the target up to integer truncation plus a drift
/// proportional to fee * (trade size / pool size). Zero amount means the
/// pool already sits on the target.
///
/// Fails with `InvalidInput` before any other work if a reserve or price
/// component is zero or the fee is degenerate.
pub fn compute_trade_to_move_market(
    true_price_numerator: Uint256,   // price of token A in units of token B
    true_price_denominator: Uint256, // denominator of the above
    reserve_a: Uint256,              // pool reserve of token A
    reserve_b: Uint256,              // pool reserve of token B
    fee: SwapFee,                    // the pool's input fee
) -> Result<MarketTrade, BrokerError> {
    ensure_reserves(reserve_a, reserve_b)?;
    ensure_fee(fee)?;
    if true_price_numerator.is_zero() || true_price_denominator.is_zero() {
        return Err(BrokerError::InvalidInput(
            "Target price must be positive".to_string(),
        ));
    }

    // cross-multiplied price comparison, exact
    let current_side = checked_mul(reserve_b, true_price_denominator, "price comparison")?;
    let target_side = checked_mul(reserve_a, true_price_numerator, "price comparison")?;

    if current_side == target_side {
        // already on target, nothing to trade
        return Ok(MarketTrade {
            a_to_b: false,
            amount_in: 0u8.into(),
        });
    }

    // pool overprices A exactly when reserve_b/reserve_a exceeds the target
    let a_to_b = current_side > target_side;

    let invariant = checked_mul(reserve_a, reserve_b, "pool invariant")?;

    // the post-trade input-side reserve squared is k scaled by the target,
    // oriented for whichever token is being sold in
    let (scale_num, scale_den, reserve_in) = if a_to_b {
        (true_price_denominator, true_price_numerator, reserve_a)
    } else {
        (true_price_numerator, true_price_denominator, reserve_b)
    };
    let scaled = checked_mul(invariant, scale_num, "scaled invariant")? / scale_den;
    let target_reserve_in = integer_sqrt(scaled);

    if target_reserve_in <= reserve_in {
        // the gap is below integer resolution
        return Ok(MarketTrade {
            a_to_b,
            amount_in: 0u8.into(),
        });
    }

    // gross up the reserve deficit for the fee skimmed off the input
    let deficit = target_reserve_in - reserve_in;
    let amount_in =
        checked_mul(deficit, fee.denominator.into(), "fee gross-up")? / fee.numerator.into();

    Ok(MarketTrade { a_to_b, amount_in })
}

/// Standard constant-product execution: the output obtained for
/// `amount_in` against reserves (reserve_in, reserve_out), floor rounded
/// in the pool's favor
pub fn get_amount_out(
    amount_in: Uint256,
    reserve_in: Uint256,
    reserve_out: Uint256,
    fee: SwapFee,
) -> Result<Uint256, BrokerError> {
    ensure_reserves(reserve_in, reserve_out)?;
    ensure_fee(fee)?;
    if amount_in.is_zero() {
        return Err(BrokerError::InvalidInput(
            "Swap input amount must be positive".to_string(),
        ));
    }

    let amount_with_fee = checked_mul(amount_in, fee.numerator.into(), "amount_in fee")?;
    let numerator = checked_mul(amount_with_fee, reserve_out, "amount_out numerator")?;
    let denominator =
        checked_mul(reserve_in, fee.denominator.into(), "amount_out denominator")? + amount_with_fee;
    Ok(numerator / denominator)
}

/// The minimal gross input that delivers at least `amount_out`, the
/// inverse of `get_amount_out` rounded up against the caller
pub fn get_amount_in(
    amount_out: Uint256,
    reserve_in: Uint256,
    reserve_out: Uint256,
    fee: SwapFee,
) -> Result<Uint256, BrokerError> {
    ensure_reserves(reserve_in, reserve_out)?;
    ensure_fee(fee)?;
    if amount_out.is_zero() {
        return Err(BrokerError::InvalidInput(
            "Swap output amount must be positive".to_string(),
        ));
    }
    if amount_out >= reserve_out {
        return Err(BrokerError::InvalidInput(
            "Requested output exceeds pool reserves".to_string(),
        ));
    }

    let numerator = checked_mul(
        checked_mul(reserve_in, amount_out, "amount_in numerator")?,
        fee.denominator.into(),
        "amount_in numerator",
    )?;
    let denominator = checked_mul(
        reserve_out - amount_out,
        fee.numerator.into(),
        "amount_in denominator",
    )?;
    Ok(numerator / denominator + 1u8.into())
}

/// The pool's implied price of token A denominated in token B as a float,
/// for display and tolerance checks only. Trade sizing never uses this.
pub fn spot_price_a_in_b(reserve_a: Uint256, reserve_b: Uint256) -> f64 {
    let a: f64 = reserve_a.to_string().parse().unwrap();
    let b: f64 = reserve_b.to_string().parse().unwrap();
    b / a
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uint(v: u128) -> Uint256 {
        v.into()
    }

    /// Applies a swap to a reserve pair the way the pool would, returning
    /// the post-trade (reserve_in, reserve_out)
    fn execute_swap(
        reserve_in: Uint256,
        reserve_out: Uint256,
        amount_in: Uint256,
        fee: SwapFee,
    ) -> (Uint256, Uint256) {
        let out = get_amount_out(amount_in, reserve_in, reserve_out, fee).unwrap();
        (reserve_in + amount_in, reserve_out - out)
    }

    #[test]
    fn sqrt_small_values() {
        assert_eq!(integer_sqrt(uint(0)), uint(0));
        assert_eq!(integer_sqrt(uint(1)), uint(1));
        assert_eq!(integer_sqrt(uint(3)), uint(1));
        assert_eq!(integer_sqrt(uint(4)), uint(2));
        assert_eq!(integer_sqrt(uint(15)), uint(3));
        assert_eq!(integer_sqrt(uint(16)), uint(4));
        assert_eq!(integer_sqrt(uint(17)), uint(4));
    }

    #[test]
    fn sqrt_large_values() {
        assert_eq!(
            integer_sqrt(uint(1_000_000_000_000_000_000)),
            uint(1_000_000_000)
        );
        // floor just below a perfect square
        assert_eq!(
            integer_sqrt(uint(1_000_000_000_000_000_000 - 1)),
            uint(999_999_999)
        );
        // 2^192 is a perfect square well beyond u128 range
        let x: Uint256 = Uint256::from(1u8) << 192u8.into();
        let expected: Uint256 = Uint256::from(1u8) << 96u8.into();
        assert_eq!(integer_sqrt(x), expected);
    }

    #[test]
    fn amount_out_literal() {
        // 100,000 of B into a (10^7 B, 10^10 A) pool at 0.3% fee
        let out = get_amount_out(
            uint(100_000),
            uint(10_000_000),
            uint(10_000_000_000),
            UNISWAP_V2_FEE,
        )
        .unwrap();
        assert_eq!(out, uint(98_715_803));
    }

    #[test]
    fn amount_in_is_minimal_inverse() {
        let reserve_in = uint(10_000_000);
        let reserve_out = uint(10_000_000_000);
        let want_out = uint(98_715_803);
        let dx = get_amount_in(want_out, reserve_in, reserve_out, UNISWAP_V2_FEE).unwrap();
        assert_eq!(dx, uint(100_000));
        // dx delivers, dx - 1 does not
        let got = get_amount_out(dx, reserve_in, reserve_out, UNISWAP_V2_FEE).unwrap();
        assert!(got >= want_out);
        let short = get_amount_out(dx - 1u8.into(), reserve_in, reserve_out, UNISWAP_V2_FEE)
            .unwrap();
        assert!(short < want_out);
    }

    #[test]
    fn zero_trade_when_on_target() {
        // pool price of A in B is exactly 1/500
        let trade = compute_trade_to_move_market(
            uint(1),
            uint(500),
            uint(5000),
            uint(10),
            UNISWAP_V2_FEE,
        )
        .unwrap();
        assert!(trade.is_noop());
    }

    #[test]
    fn zero_trade_when_gap_below_resolution() {
        // one part in 10^12 away from target, rounds to nothing
        let trade = compute_trade_to_move_market(
            uint(1),
            uint(1),
            uint(1_000_000_000_000),
            uint(1_000_000_000_001),
            UNISWAP_V2_FEE,
        )
        .unwrap();
        assert!(trade.is_noop());
    }

    #[test]
    fn direction_flips_across_current_price() {
        let reserve_a = uint(1_000_000_000);
        let reserve_b = uint(1_000_000_000);
        // target above current price of A: A must appreciate, sell B
        let up = compute_trade_to_move_market(
            uint(2),
            uint(1),
            reserve_a,
            reserve_b,
            UNISWAP_V2_FEE,
        )
        .unwrap();
        assert!(!up.a_to_b);
        assert!(!up.is_noop());
        // target below current price of A: A must cheapen, sell A
        let down = compute_trade_to_move_market(
            uint(1),
            uint(2),
            reserve_a,
            reserve_b,
            UNISWAP_V2_FEE,
        )
        .unwrap();
        assert!(down.a_to_b);
        assert!(!down.is_noop());
        // symmetric pool, symmetric targets, symmetric trade sizes
        assert_eq!(up.amount_in, down.amount_in);
    }

    #[test]
    fn computation_is_idempotent() {
        let first = compute_trade_to_move_market(
            uint(3),
            uint(7),
            uint(123_456_789_000),
            uint(987_654_321_000),
            UNISWAP_V2_FEE,
        )
        .unwrap();
        let second = compute_trade_to_move_market(
            uint(3),
            uint(7),
            uint(123_456_789_000),
            uint(987_654_321_000),
            UNISWAP_V2_FEE,
        )
        .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_inputs_rejected() {
        let good = uint(1_000_000);
        let cases = [
            (uint(1), uint(1), uint(0), good),
            (uint(1), uint(1), good, uint(0)),
            (uint(0), uint(1), good, good),
            (uint(1), uint(0), good, good),
        ];
        for (num, den, ra, rb) in cases {
            let err = compute_trade_to_move_market(num, den, ra, rb, UNISWAP_V2_FEE).unwrap_err();
            assert!(matches!(err, BrokerError::InvalidInput(_)), "{err}");
        }
        // a fee keeping more than 100% of the input is nonsense
        let err = compute_trade_to_move_market(uint(1), uint(1), good, good, SwapFee::new(1001, 1000))
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidInput(_)));
        let err = get_amount_out(uint(0), good, good, UNISWAP_V2_FEE).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidInput(_)));
        let err = get_amount_in(good, good, good, UNISWAP_V2_FEE).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidInput(_)));
    }

    /// The worked example: a (1000 A, 1 B) pool scaled by 10,000,000.
    /// Dumping 100,000 B moves the displayed A-per-B spot price from
    /// 1000.0000 to 980.3252, and the computed counter-trade restores it
    /// to 1000 within rounding tolerance.
    #[test]
    fn restores_moved_market_to_true_price() {
        let reserve_a = uint(10_000_000_000);
        let reserve_b = uint(10_000_000);
        let a_per_b = spot_price_a_in_b(reserve_b, reserve_a);
        assert_eq!(format!("{a_per_b:.4}"), "1000.0000");

        // someone dumps 100,000 B into the pool
        let (reserve_b, reserve_a) =
            execute_swap(reserve_b, reserve_a, uint(100_000), UNISWAP_V2_FEE);
        assert_eq!(reserve_b, uint(10_100_000));
        assert_eq!(reserve_a, uint(9_901_284_197));
        let a_per_b = spot_price_a_in_b(reserve_b, reserve_a);
        assert_eq!(format!("{a_per_b:.4}"), "980.3252");

        // the true price of A is still 1/1000 B, compute the arb back
        let trade = compute_trade_to_move_market(
            uint(1),
            uint(1000),
            reserve_a,
            reserve_b,
            UNISWAP_V2_FEE,
        )
        .unwrap();
        // A is overpriced after the dump, so A gets sold
        assert!(trade.a_to_b);
        let (reserve_a, reserve_b) =
            execute_swap(reserve_a, reserve_b, trade.amount_in, UNISWAP_V2_FEE);

        let restored = spot_price_a_in_b(reserve_b, reserve_a);
        assert!(
            ((restored - 1000.0) / 1000.0).abs() < 1e-4,
            "restored price {restored}"
        );
        assert_eq!(format!("{restored:.0}"), "1000");
    }

    /// Moderate moves in both directions land within the 0.1% tolerance
    /// after executing the computed trade, and never shrink the invariant
    #[test]
    fn executed_trades_land_on_target() {
        let cases: [(u128, u128, u128, u128); 5] = [
            (1_000_000_000_000, 1_000_000_000_000, 21, 20),
            (1_000_000_000_000, 1_000_000_000_000, 20, 21),
            (800_000_000_000, 1_200_000_000_000, 2, 1),
            (770_000_000_000, 1_900_000_000_000, 2, 1),
            (250_000_000_000, 250_000_000_000, 4, 5),
        ];
        for (ra, rb, num, den) in cases {
            let (reserve_a, reserve_b) = (uint(ra), uint(rb));
            let target = num as f64 / den as f64;
            let trade = compute_trade_to_move_market(
                uint(num),
                uint(den),
                reserve_a,
                reserve_b,
                UNISWAP_V2_FEE,
            )
            .unwrap();
            assert!(!trade.is_noop());

            let invariant_before = reserve_a * reserve_b;
            let (new_a, new_b) = if trade.a_to_b {
                execute_swap(reserve_a, reserve_b, trade.amount_in, UNISWAP_V2_FEE)
            } else {
                let (b, a) = execute_swap(reserve_b, reserve_a, trade.amount_in, UNISWAP_V2_FEE);
                (a, b)
            };

            let landed = spot_price_a_in_b(new_a, new_b);
            assert!(
                ((landed - target) / target).abs() < 1e-3,
                "target {target} landed {landed} from ({ra}, {rb})"
            );
            // the fee stays in the pool so the invariant never decreases
            assert!(new_a * new_b >= invariant_before);
        }
    }

    #[test]
    fn feeless_pool_lands_exactly_up_to_truncation() {
        let reserve_a = uint(4_000_000_000_000);
        let reserve_b = uint(1_000_000_000_000);
        // move the price of A up from 0.25 to 1, which sells B
        let trade =
            compute_trade_to_move_market(uint(1), uint(1), reserve_a, reserve_b, NO_FEE).unwrap();
        assert!(!trade.a_to_b);
        assert_eq!(trade.amount_in, uint(1_000_000_000_000));
        let (new_b, new_a) = execute_swap(reserve_b, reserve_a, trade.amount_in, NO_FEE);
        let landed = spot_price_a_in_b(new_a, new_b);
        assert!((landed - 1.0).abs() < 1e-9, "landed {landed}");
    }
}
