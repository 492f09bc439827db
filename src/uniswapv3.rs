//! Uniswap V3 interactions: concentrated-liquidity price checking, swap
//! execution with sqrt-price limits, the price-targeting swap, and pool
//! creation / liquidity provisioning through the NFT position manager.
//!
//! V3 pools quote price as a Q64.96 fixed point square root of the
//! token1/token0 ratio. Moving a pool to a target price does not require
//! computing the input across tick ranges here: the target is encoded as
//! the swap's sqrtPriceLimitX96 and the pool's own execution engine walks
//! however many liquidity segments lie in between, stopping exactly on the
//! limit.

use crate::client::Web3;
use crate::error::BrokerError;
use crate::market::integer_sqrt;
use crate::types::{SendTxOption, TransactionRequest};
use crate::uniswapv2::{is_token0, options_contains_glm, DEFAULT_GAS_LIMIT_MULT};
use clarity::utils::display_uint256_as_address;
use clarity::{
    abi::{encode_call, AbiToken},
    constants::{tt160m1, tt24m1},
    Address, PrivateKey, Uint256,
};
use num_traits::Bounded;
use std::time::Duration;
use tokio::time::timeout as future_timeout;

/// Minimum valid tick value for Uniswap V3 pools
pub const MIN_TICK: i32 = -887272;
/// Maximum valid tick value for Uniswap V3 pools
pub const MAX_TICK: i32 = 887272;

/// Default swap deadline when the caller provides none
const DEFAULT_DEADLINE_SECONDS: u64 = 10 * 60;

lazy_static! {
    /// Uniswap V3's Factory interface for locating and interacting with pools
    pub static ref UNISWAP_V3_FACTORY_ADDRESS: Address =
        Address::parse_and_validate("0x1F98431c8aD98523631AE4a59f267346ea31F984").unwrap();
    /// Uniswap V3's Router interface for swapping tokens, from prod Ethereum
    pub static ref UNISWAP_V3_ROUTER_ADDRESS: Address =
        Address::parse_and_validate("0xE592427A0AEce92De3Edee1F18E0157C05861564").unwrap();
    /// Uniswap V3's Quoter interface for checking current swap prices, from prod Ethereum
    pub static ref UNISWAP_V3_QUOTER_ADDRESS: Address =
        Address::parse_and_validate("0xb27308f9F90D607463bb33eA1BeBb41C27CE5AB6").unwrap();
    /// Uniswap V3's NFT position manager, the entry point for creating
    /// pools and providing liquidity, from prod Ethereum
    pub static ref UNISWAP_V3_POSITION_MANAGER_ADDRESS: Address =
        Address::parse_and_validate("0xC36442b4a4522E871399CD717aBDD847Ab11FE88").unwrap();

    // The suggested Uniswap v3 pool fee levels in order:
    // 0.3% (most pairs), 0.05% (for stable pairs), 0.01% (very stable pairs), 1% (exotic pairs)
    pub static ref UNISWAP_STANDARD_POOL_FEES: [Uint256; 4] =
        [3000u16.into(), 500u16.into(), 100u16.into(), 10000u16.into()];
}

// Checks that the input fee value is within the limits of uint24
fn bad_fee(fee: &Uint256) -> bool {
    *fee > tt24m1()
}

// Checks that the input sqrt_price_limit value is within the limits of uint160
fn bad_sqrt_price_limit(sqrt_price_limit: &Uint256) -> bool {
    *sqrt_price_limit > tt160m1()
}

/// The tick spacing permissionless V3 pools use for each standard fee tier
pub fn tick_spacing_for_fee(fee: u32) -> Option<i32> {
    match fee {
        100 => Some(1),
        500 => Some(10),
        3000 => Some(60),
        10000 => Some(200),
        _ => None,
    }
}

/// Computes the sqrt price of a pool given token1's liquidity and token0's
/// liquidity, encoded as a Q64.96 (a 160 bit number v equal to v/2^96, see
/// https://en.wikipedia.org/wiki/Q_(number_format)).
///
/// The computation stays in integers end to end:
///     sqrtPriceX96 = sqrt((amount1 << 192) / amount0)
///                  = sqrt(amount1 / amount0) * 2^96
///
/// To convert a spot price to a sqrt price, use the price's numerator as
/// amount_1 and its denominator as amount_0.
pub fn uniswap_v3_sqrt_price_from_amounts(amount_1: Uint256, amount_0: Uint256) -> Uint256 {
    let numerator: Uint256 = amount_1 << 192u8.into(); // amount1 * 2^192
    let denominator: Uint256 = amount_0;
    let ratio_x192 = numerator / denominator;
    integer_sqrt(ratio_x192)
}

/// Encodes a float spot price as a Q64.96 sqrt price, used for slippage
/// limits. Prefer `uniswap_v3_sqrt_price_from_amounts` where the price is
/// known as a ratio of integers, it carries no float error.
pub fn uniswap_v3_sqrt_price_from_price(spot_price: f64) -> Uint256 {
    // scale by the squared fractional precision before the root so the
    // result is already shifted by 2^96
    let sqrt_price = (spot_price * 2f64.powi(192)).sqrt();

    sqrt_price.floor().to_string().parse::<Uint256>().unwrap()
}

/// Decodes the Q64.96-encoded sqrt price from Uniswap into an intuitive
/// price of token0 denominated in token1
pub fn decode_uniswap_v3_sqrt_price(sqrt_price: Uint256) -> f64 {
    let tt96 = 2f64.powi(96);
    let sqrt_price = sqrt_price.to_string().parse::<f64>().unwrap();
    (sqrt_price / tt96).powi(2)
}

/// Scales the input sqrt_price to allow `scale_percentage` of slippage on
/// a swap in the given direction.
///
/// For a swap with token0 in and token1 out, zero_for_one must be true.
/// Selling token0 grows the token0 side so the token1/token0 ratio and its
/// sqrt price fall, the limit sits below the current price; the opposite
/// direction raises it.
pub fn scale_v3_uniswap_sqrt_price(
    sqrt_price: Uint256,   // The initial sqrt price to work with, a Q64.96
    scale_percentage: f64, // The fraction to scale by, e.g. 0.005f64 to allow 0.5% slippage
    zero_for_one: bool,    // The direction of the swap
) -> Uint256 {
    let spot_price = decode_uniswap_v3_sqrt_price(sqrt_price);

    let scale_factor = if zero_for_one {
        1f64 - scale_percentage
    } else {
        1f64 + scale_percentage
    };
    let scaled_price = spot_price * scale_factor;

    uniswap_v3_sqrt_price_from_price(scaled_price)
}

/// The tick whose price floor-covers the given spot price of token0 in
/// token1, price = 1.0001^tick
pub fn tick_from_price(price: f64) -> Result<i32, BrokerError> {
    if !(price.is_finite() && price > 0f64) {
        return Err(BrokerError::InvalidInput(format!(
            "Cannot take a tick for price {price}"
        )));
    }
    Ok((price.ln() / 1.0001f64.ln()).floor() as i32)
}

/// The spot price of token0 in token1 at a given tick
pub fn price_from_tick(tick: i32) -> f64 {
    1.0001f64.powi(tick)
}

/// Rounds a tick to the nearest multiple of the pool's tick spacing,
/// pulled inward at the extremes so the result is always mintable
pub fn nearest_usable_tick(tick: i32, tick_spacing: i32) -> i32 {
    let spacing = f64::from(tick_spacing);
    let rounded = (f64::from(tick) / spacing).round() as i32 * tick_spacing;
    if rounded < MIN_TICK {
        rounded + tick_spacing
    } else if rounded > MAX_TICK {
        rounded - tick_spacing
    } else {
        rounded
    }
}

/// Orients a true price quoted for (token A, token B) into the pool's
/// token1/token0 form and encodes it as a sqrt price. V3 pools sort their
/// tokens, so the caller's A is not necessarily token0.
pub fn v3_target_sqrt_price(
    token_a_is_token0: bool,
    true_price_numerator: Uint256,
    true_price_denominator: Uint256,
) -> Uint256 {
    if token_a_is_token0 {
        // price of token0 in token1 is exactly the quoted price of A in B
        uniswap_v3_sqrt_price_from_amounts(true_price_numerator, true_price_denominator)
    } else {
        // A is token1, the pool quotes B in A, invert the ratio
        uniswap_v3_sqrt_price_from_amounts(true_price_denominator, true_price_numerator)
    }
}

/// Direction and price limit for a V3 swap-to-price, computed from the
/// pool's current sqrt price. None when the pool already sits on target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V3SwapToPricePlan {
    /// true sells token0 into the pool, false sells token1
    pub zero_for_one: bool,
    /// the encoded target, submitted as the swap's sqrtPriceLimitX96
    pub sqrt_price_limit_x96: Uint256,
}

pub fn plan_uniswap_v3_swap_to_price(
    current_sqrt_price: Uint256,
    target_sqrt_price: Uint256,
) -> Option<V3SwapToPricePlan> {
    if current_sqrt_price == target_sqrt_price {
        return None;
    }
    // selling token0 pushes the token1/token0 price down toward a lower target
    Some(V3SwapToPricePlan {
        zero_for_one: target_sqrt_price < current_sqrt_price,
        sqrt_price_limit_x96: target_sqrt_price,
    })
}

/// Argument block for the position manager's mint call, already in pool
/// (token0, token1) order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V3MintParams {
    pub token0: Address,
    pub token1: Address,
    pub fee: u32,
    pub tick_lower: i32,
    pub tick_upper: i32,
    pub amount0_desired: Uint256,
    pub amount1_desired: Uint256,
    pub amount0_min: Uint256,
    pub amount1_min: Uint256,
    pub recipient: Address,
    pub deadline: Uint256,
}

/// A signed tick as the two's complement word ABI expects for int24
fn tick_word(tick: i32) -> Uint256 {
    if tick >= 0 {
        Uint256::from(tick as u32)
    } else {
        Uint256::max_value() - Uint256::from(tick.unsigned_abs()) + 1u8.into()
    }
}

/// ABI payload for the position manager's mint((...)) call. The parameter
/// struct contains no dynamic fields so it encodes as eleven words in
/// place. int24 ticks are sign-extended to a full word.
pub fn encode_mint_call(params: &V3MintParams) -> Result<Vec<u8>, BrokerError> {
    let tokens: Vec<AbiToken> = vec![
        params.token0.into(),
        params.token1.into(),
        AbiToken::Uint(params.fee.into()),
        AbiToken::Uint(tick_word(params.tick_lower)),
        AbiToken::Uint(tick_word(params.tick_upper)),
        params.amount0_desired.into(),
        params.amount1_desired.into(),
        params.amount0_min.into(),
        params.amount1_min.into(),
        params.recipient.into(),
        params.deadline.into(),
    ];
    let tokens = [AbiToken::Struct(tokens)];
    Ok(encode_call(
        "mint((address,address,uint24,int24,int24,uint256,uint256,uint256,uint256,address,uint256))",
        &tokens,
    )?)
}

impl Web3 {
    /// Looks up the V3 pool for a token pair and fee tier via the factory,
    /// erroring if the pool has not been created
    pub async fn get_uniswap_v3_pool_address(
        &self,
        caller_address: Address, // an arbitrary ethereum address with some amount of Ether
        token_a: Address,
        token_b: Address,
        fee_uint24: Option<Uint256>, // fee tier, 0.3% if None
        uniswap_factory: Option<Address>, // default is the prod Ethereum factory
    ) -> Result<Address, BrokerError> {
        let factory = uniswap_factory.unwrap_or(*UNISWAP_V3_FACTORY_ADDRESS);
        let fee = fee_uint24.unwrap_or_else(|| 3000u16.into());
        if bad_fee(&fee) {
            return Err(BrokerError::BadInput(
                "Bad fee input to getPool - value too large for uint24".to_string(),
            ));
        }

        let payload = encode_call(
            "getPool(address,address,uint24)",
            &[token_a.into(), token_b.into(), AbiToken::Uint(fee)],
        )?;
        let pool_result = self
            .simulate_transaction(
                TransactionRequest::quick_tx(caller_address, factory, payload),
                vec![],
            )
            .await?;
        let result_len = pool_result.len();
        if result_len < 20 {
            return Err(BrokerError::BadResponse(
                "Invalid getPool result".to_string(),
            ));
        }
        let pool = Address::from_slice(&pool_result[result_len - 20..result_len])?;
        if pool == Address::default() {
            return Err(BrokerError::ContractCallError(format!(
                "No V3 pool exists for {token_a} / {token_b} at fee {fee}"
            )));
        }
        Ok(pool)
    }

    /// Returns either token0 or token1 from a Uniswap v3 pool, depending on input
    pub async fn get_uniswap_v3_pool_token(
        &self,
        caller_address: Address,
        pool_addr: Address,
        get_token_0: bool, // true for token0 and false for token1
    ) -> Result<Address, BrokerError> {
        let token_name = if get_token_0 { "token0" } else { "token1" };
        let payload = encode_call(&format!("{token_name}()"), &[])?;
        let token_result = self
            .simulate_transaction(
                TransactionRequest::quick_tx(caller_address, pool_addr, payload),
                vec![],
            )
            .await?;
        trace!("token_result: {:X?}", token_result);
        let result_len = token_result.len();
        if result_len < 20 {
            return Err(BrokerError::BadResponse("Invalid token result".to_string()));
        }
        let token_bytes: &[u8] = &token_result[result_len - 20..result_len];

        let token = Address::from_slice(token_bytes)?;
        Ok(token)
    }

    /// Returns a pool's ordered (token0, token1) tuple
    pub async fn get_uniswap_v3_pool_tokens(
        &self,
        caller_address: Address,
        pool_addr: Address,
    ) -> Result<(Address, Address), BrokerError> {
        let token0 = self
            .get_uniswap_v3_pool_token(caller_address, pool_addr, true)
            .await?;
        let token1 = self
            .get_uniswap_v3_pool_token(caller_address, pool_addr, false)
            .await?;
        Ok((token0, token1))
    }

    /// Fetches the "slot0" data from a Uniswap pool, which contains the
    /// binary encoded sqrtPriceX96, current tick, oracle cardinality
    /// values, the protocol fee, and the unlocked flag
    pub async fn get_uniswap_v3_pool_slot0(
        &self,
        caller_address: Address,
        pool_addr: Address,
    ) -> Result<Vec<u8>, BrokerError> {
        let payload = encode_call("slot0()", &[])?;
        let slot0_result = self
            .simulate_transaction(
                TransactionRequest::quick_tx(caller_address, pool_addr, payload),
                vec![],
            )
            .await?;
        trace!("slot0_result: {:X?}", slot0_result);

        Ok(slot0_result)
    }

    /// Fetches the current sqrtPriceX96 value from the given pool,
    /// the first value of pool.slot0()
    ///
    /// Note that this value will differ slightly from the swap price due to the pool fee
    pub async fn get_uniswap_v3_sqrt_price(
        &self,
        caller_address: Address,
        pool_address: Address,
    ) -> Result<Uint256, BrokerError> {
        let slot0_result = self
            .get_uniswap_v3_pool_slot0(caller_address, pool_address)
            .await?;
        if slot0_result.len() < 32 {
            return Err(BrokerError::BadResponse("Zero slot0 response".to_string()));
        }

        // we only want the first value: sqrtPriceX96, a uint160 which occupies
        // 20 bytes at the right of a 32 byte word
        let sqrt_price = Uint256::from_be_bytes(&slot0_result[32 - 20..32]);

        trace!("parsed sqrt_price {:X?}", sqrt_price);
        Ok(sqrt_price)
    }

    /// The pool's current spot price of token0 denominated in token1 as a
    /// float, for display and tolerance checks
    pub async fn get_uniswap_v3_spot_price(
        &self,
        caller_address: Address,
        pool_address: Address,
    ) -> Result<f64, BrokerError> {
        let sqrt_price = self
            .get_uniswap_v3_sqrt_price(caller_address, pool_address)
            .await?;
        Ok(decode_uniswap_v3_sqrt_price(sqrt_price))
    }

    /// Simulates a V3 swap through the Quoter to price `amount` of
    /// `token_in` in `token_out`. This method does not swap any funds
    pub async fn get_uniswap_v3_price(
        &self,
        caller_address: Address, // An arbitrary ethereum address with some amount of ether
        token_in: Address,       // The token held
        token_out: Address,      // The desired token
        fee_uint24: Option<Uint256>, // Actually a uint24 on the callee side
        amount: Uint256,         // The amount of tokens offered up
        sqrt_price_limit_x96_uint160: Option<Uint256>, // Actually a uint160 on the callee side
        uniswap_quoter: Option<Address>, // The default v3 quoter will be used if none is provided
    ) -> Result<Uint256, BrokerError> {
        let quoter = uniswap_quoter.unwrap_or(*UNISWAP_V3_QUOTER_ADDRESS);

        let fee_uint24 = fee_uint24.unwrap_or_else(|| 3000u16.into());
        if bad_fee(&fee_uint24) {
            return Err(BrokerError::BadInput(
                "Bad fee input to swap price - value too large for uint24".to_string(),
            ));
        }

        let sqrt_price_limit_x96 = sqrt_price_limit_x96_uint160.unwrap_or_default();
        if bad_sqrt_price_limit(&sqrt_price_limit_x96) {
            return Err(BrokerError::BadInput(
                "Bad sqrt_price_limit_x96 input to swap price - value too large for uint160"
                    .to_string(),
            ));
        }

        let tokens: [AbiToken; 5] = [
            AbiToken::Address(token_in),
            AbiToken::Address(token_out),
            AbiToken::Uint(fee_uint24),
            AbiToken::Uint(amount),
            AbiToken::Uint(sqrt_price_limit_x96),
        ];

        debug!("tokens is  {:?}", tokens);
        let payload = encode_call(
            "quoteExactInputSingle(address,address,uint24,uint256,uint160)",
            &tokens,
        )?;
        let result = self
            .simulate_transaction(
                TransactionRequest::quick_tx(caller_address, quoter, payload),
                vec![],
            )
            .await?;
        trace!("result is {:?}", result);

        let amount_out = Uint256::from_be_bytes(match result.get(0..32) {
            Some(val) => val,
            None => {
                return Err(BrokerError::ContractCallError(
                    "Bad response from swap price".to_string(),
                ))
            }
        });
        Ok(amount_out)
    }

    /// A highly-flexible swap method for Uniswap v3, exchanging `amount` of
    /// `token_in` for `token_out` by calling exactInputSingle on the router.
    /// Approves the router first when the allowance is short. A failed
    /// on-chain call reverts, nothing is retried.
    #[allow(clippy::too_many_arguments)]
    pub async fn swap_uniswap_v3(
        &self,
        eth_private_key: PrivateKey,     // The address swapping tokens
        token_in: Address,               // The token held
        token_out: Address,              // The desired token
        fee_uint24: Option<Uint256>,     // Actually a uint24 on the callee side
        amount: Uint256,                 // The amount of tokens offered up
        deadline: Option<Uint256>,       // A deadline by which the swap must happen
        amount_out_min: Option<Uint256>, // The minimum output tokens to receive in a swap
        sqrt_price_limit_x96_uint160: Option<Uint256>, // Actually a uint160 on the callee side
        recipient: Option<Address>,      // Output destination, the caller if None
        uniswap_router: Option<Address>, // The default v3 router will be used if None is provided
        options: Option<Vec<SendTxOption>>, // Options for send_transaction
        wait_timeout: Option<Duration>,
    ) -> Result<Uint256, BrokerError> {
        let fee_uint24 = fee_uint24.unwrap_or_else(|| 3000u16.into());
        if bad_fee(&fee_uint24) {
            return Err(BrokerError::BadInput(
                "Bad fee input to swap_uniswap_v3 - value too large for uint24".to_string(),
            ));
        }

        let sqrt_price_limit_x96 = sqrt_price_limit_x96_uint160.unwrap_or_default();
        if bad_sqrt_price_limit(&sqrt_price_limit_x96) {
            return Err(BrokerError::BadInput(
                "Bad sqrt_price_limit_x96 input to swap_uniswap_v3 - value too large for uint160"
                    .to_string(),
            ));
        }

        let eth_address = eth_private_key.to_address();
        let router = uniswap_router.unwrap_or(*UNISWAP_V3_ROUTER_ADDRESS);
        let recipient = recipient.unwrap_or(eth_address);
        let amount_out_min = amount_out_min.unwrap_or_else(|| 0u8.into());
        let deadline = match deadline {
            // Default to latest block + 10 minutes
            None => {
                self.eth_get_latest_block().await?.timestamp + DEFAULT_DEADLINE_SECONDS.into()
            }
            Some(val) => val,
        };

        //struct ExactInputSingleParams { // The uniswap exactInputSingle argument
        //    address tokenIn;
        //    address tokenOut;
        //    uint24 fee;
        //    address recipient;
        //    uint256 deadline;
        //    uint256 amountIn;
        //    uint256 amountOutMinimum;
        //    uint160 sqrtPriceLimitX96;
        //}
        let tokens: Vec<AbiToken> = vec![
            token_in.into(),
            token_out.into(),
            fee_uint24.into(),
            recipient.into(),
            deadline.into(),
            amount.into(),
            amount_out_min.into(),
            sqrt_price_limit_x96.into(),
        ];
        let tokens = [AbiToken::Struct(tokens)];
        let payload = encode_call(
            "exactInputSingle((address,address,uint24,address,uint256,uint256,uint256,uint160))",
            &tokens,
        )?;

        // default gas limit multiplier
        let mut options = options.unwrap_or_default();
        if !options_contains_glm(&options) {
            options.push(SendTxOption::GasLimitMultiplier(DEFAULT_GAS_LIMIT_MULT));
        }

        let allowance = self
            .get_erc20_allowance(token_in, eth_address, router)
            .await?;
        if allowance < amount {
            debug!("token_in being approved");
            // the nonce we will be using, if there's no timeout we must hack the nonce
            // of the following swap to queue properly
            let nonce = self.eth_get_transaction_count(eth_address).await?;
            let _token_in_approval = self
                .erc20_approve(
                    token_in,
                    amount,
                    eth_private_key,
                    router,
                    wait_timeout,
                    options.clone(),
                )
                .await?;
            if wait_timeout.is_none() {
                options.push(SendTxOption::Nonce(nonce + 1u8.into()));
            }
        }

        trace!("payload is  {:?}", payload);
        let tx = self
            .prepare_transaction(router, payload, 0u32.into(), eth_private_key, options)
            .await?;
        let txid = self.send_prepared_transaction(tx).await?;
        debug!(
            "txid for uniswap v3 swap is {}",
            display_uint256_as_address(txid)
        );
        if let Some(timeout) = wait_timeout {
            future_timeout(timeout, self.wait_for_transaction(txid, timeout, None)).await??;
        }

        Ok(txid)
    }

    /// Moves a V3 pool's spot price onto a target. The target price of
    /// `token_a` denominated in `token_b` is re-oriented to the pool's
    /// token order, encoded as the swap's sqrtPriceLimitX96, and a single
    /// capped exactInputSingle is submitted: the pool walks whatever tick
    /// ranges lie between the current and target price and stops exactly
    /// on the limit. Unspent input stays with the caller.
    ///
    /// Spending is bounded per token, a zero bound spends up to the
    /// caller's full balance of the input token. Returns Ok(None) without
    /// touching the chain when the pool already sits on the target.
    #[allow(clippy::too_many_arguments)]
    pub async fn swap_uniswap_v3_to_price(
        &self,
        eth_private_key: PrivateKey,        // the trading account
        token_a: Address,                   // one side of the pair
        token_b: Address,                   // the other side of the pair
        fee_uint24: Option<Uint256>,        // pool fee tier, 0.3% if None
        true_price_numerator: Uint256,      // price of A in B, numerator
        true_price_denominator: Uint256,    // price of A in B, denominator
        max_spend_a: Uint256,               // spend bound for token A, zero for balance-bounded
        max_spend_b: Uint256,               // spend bound for token B, zero for balance-bounded
        recipient: Option<Address>,         // output destination, the caller if None
        deadline: Option<Uint256>,          // unix deadline, latest block + 10 minutes if None
        uniswap_factory: Option<Address>,   // default is the prod Ethereum factory
        uniswap_router: Option<Address>,    // default is the prod Ethereum router
        options: Option<Vec<SendTxOption>>, // options for send_transaction
        wait_timeout: Option<Duration>,
    ) -> Result<Option<Uint256>, BrokerError> {
        if true_price_numerator.is_zero() || true_price_denominator.is_zero() {
            return Err(BrokerError::InvalidInput(
                "Target price must be positive".to_string(),
            ));
        }
        let own_address = eth_private_key.to_address();

        let pool = self
            .get_uniswap_v3_pool_address(own_address, token_a, token_b, fee_uint24, uniswap_factory)
            .await?;
        let token0 = self
            .get_uniswap_v3_pool_token(own_address, pool, true)
            .await?;
        let token_a_is_token0 = token0 == token_a;

        let current = self.get_uniswap_v3_sqrt_price(own_address, pool).await?;
        let target =
            v3_target_sqrt_price(token_a_is_token0, true_price_numerator, true_price_denominator);

        let plan = match plan_uniswap_v3_swap_to_price(current, target) {
            Some(plan) => plan,
            None => {
                debug!("pool already sits on the target sqrt price, no trade");
                return Ok(None);
            }
        };

        // resolve which of the caller's tokens gets sold and its bound
        let selling_a = plan.zero_for_one == token_a_is_token0;
        let (token_in, token_out, bound) = if selling_a {
            (token_a, token_b, max_spend_a)
        } else {
            (token_b, token_a, max_spend_b)
        };
        let amount_in = if bound.is_zero() {
            self.get_erc20_balance(token_in, own_address).await?
        } else {
            bound
        };
        if amount_in.is_zero() {
            return Err(BrokerError::InvalidInput(
                "Nothing to spend, the input token bound and balance are both zero".to_string(),
            ));
        }

        let txid = self
            .swap_uniswap_v3(
                eth_private_key,
                token_in,
                token_out,
                fee_uint24,
                amount_in,
                deadline,
                // the price limit is the protection here, any output up to
                // the limit is acceptable
                Some(0u8.into()),
                Some(plan.sqrt_price_limit_x96),
                recipient,
                uniswap_router,
                options,
                wait_timeout,
            )
            .await?;
        Ok(Some(txid))
    }

    /// Creates and initializes a V3 pool for the pair at the given fee
    /// tier through the position manager, a no-op on chain if the pool
    /// already exists. The starting price of `token_a` in `token_b` is
    /// passed as a rational pair and re-oriented to the pool's token order.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_uniswap_v3_pool(
        &self,
        eth_private_key: PrivateKey,          // the deploying account
        token_a: Address,                     // one side of the pair
        token_b: Address,                     // the other side of the pair
        fee_uint24: Uint256,                  // pool fee tier
        initial_price_numerator: Uint256,     // starting price of A in B, numerator
        initial_price_denominator: Uint256,   // starting price of A in B, denominator
        position_manager: Option<Address>,    // default is the prod Ethereum manager
        options: Option<Vec<SendTxOption>>,   // options for send_transaction
        wait_timeout: Option<Duration>,
    ) -> Result<Uint256, BrokerError> {
        if bad_fee(&fee_uint24) {
            return Err(BrokerError::BadInput(
                "Bad fee input to create pool - value too large for uint24".to_string(),
            ));
        }
        if initial_price_numerator.is_zero() || initial_price_denominator.is_zero() {
            return Err(BrokerError::InvalidInput(
                "Initial price must be positive".to_string(),
            ));
        }
        let manager = position_manager.unwrap_or(*UNISWAP_V3_POSITION_MANAGER_ADDRESS);

        // the manager requires the pair pre-sorted
        let token_a_is_token0 = is_token0(token_a, token_b);
        let (token0, token1) = if token_a_is_token0 {
            (token_a, token_b)
        } else {
            (token_b, token_a)
        };
        let sqrt_price_x96 = v3_target_sqrt_price(
            token_a_is_token0,
            initial_price_numerator,
            initial_price_denominator,
        );

        let tokens: [AbiToken; 4] = [
            token0.into(),
            token1.into(),
            AbiToken::Uint(fee_uint24),
            AbiToken::Uint(sqrt_price_x96),
        ];
        let payload = encode_call(
            "createAndInitializePoolIfNecessary(address,address,uint24,uint160)",
            &tokens,
        )?;

        let mut options = options.unwrap_or_default();
        if !options_contains_glm(&options) {
            options.push(SendTxOption::GasLimitMultiplier(DEFAULT_GAS_LIMIT_MULT));
        }

        let tx = self
            .prepare_transaction(manager, payload, 0u32.into(), eth_private_key, options)
            .await?;
        let txid = self.send_prepared_transaction(tx).await?;
        debug!(
            "txid for pool creation is {}",
            display_uint256_as_address(txid)
        );
        if let Some(timeout) = wait_timeout {
            future_timeout(timeout, self.wait_for_transaction(txid, timeout, None)).await??;
        }

        Ok(txid)
    }

    /// Provides liquidity to a V3 pool across a tick range by minting a
    /// position NFT. Token amounts are given in the caller's (A, B) order
    /// and re-oriented to the pool's sorting; both tokens are approved to
    /// the position manager as needed. Tick bounds must be multiples of
    /// the fee tier's spacing, see `nearest_usable_tick`.
    #[allow(clippy::too_many_arguments)]
    pub async fn mint_uniswap_v3_position(
        &self,
        eth_private_key: PrivateKey,        // the liquidity provider
        token_a: Address,                   // one side of the pair
        token_b: Address,                   // the other side of the pair
        fee_uint24: u32,                    // pool fee tier
        tick_lower: i32,                    // bottom of the provided range
        tick_upper: i32,                    // top of the provided range
        amount_a_desired: Uint256,          // token A to provide
        amount_b_desired: Uint256,          // token B to provide
        amount_a_min: Uint256,              // revert if less A ends up used
        amount_b_min: Uint256,              // revert if less B ends up used
        recipient: Option<Address>,         // position owner, the caller if None
        deadline: Option<Uint256>,          // unix deadline, latest block + 10 minutes if None
        position_manager: Option<Address>,  // default is the prod Ethereum manager
        options: Option<Vec<SendTxOption>>, // options for send_transaction
        wait_timeout: Option<Duration>,
    ) -> Result<Uint256, BrokerError> {
        if tick_lower >= tick_upper || tick_lower < MIN_TICK || tick_upper > MAX_TICK {
            return Err(BrokerError::InvalidInput(format!(
                "Unusable tick range [{tick_lower}, {tick_upper}]"
            )));
        }
        let own_address = eth_private_key.to_address();
        let manager = position_manager.unwrap_or(*UNISWAP_V3_POSITION_MANAGER_ADDRESS);
        let recipient = recipient.unwrap_or(own_address);
        let deadline = match deadline {
            None => {
                self.eth_get_latest_block().await?.timestamp + DEFAULT_DEADLINE_SECONDS.into()
            }
            Some(val) => val,
        };

        let token_a_is_token0 = is_token0(token_a, token_b);
        let (token0, token1, amount0_desired, amount1_desired, amount0_min, amount1_min) =
            if token_a_is_token0 {
                (
                    token_a,
                    token_b,
                    amount_a_desired,
                    amount_b_desired,
                    amount_a_min,
                    amount_b_min,
                )
            } else {
                (
                    token_b,
                    token_a,
                    amount_b_desired,
                    amount_a_desired,
                    amount_b_min,
                    amount_a_min,
                )
            };

        let params = V3MintParams {
            token0,
            token1,
            fee: fee_uint24,
            tick_lower,
            tick_upper,
            amount0_desired,
            amount1_desired,
            amount0_min,
            amount1_min,
            recipient,
            deadline,
        };
        let payload = encode_mint_call(&params)?;

        let mut options = options.unwrap_or_default();
        if !options_contains_glm(&options) {
            options.push(SendTxOption::GasLimitMultiplier(DEFAULT_GAS_LIMIT_MULT));
        }

        // approve both sides to the manager, queueing nonces by hand when
        // the caller is not waiting between transactions
        let mut nonce = self.eth_get_transaction_count(own_address).await?;
        for (token, amount) in [(token0, amount0_desired), (token1, amount1_desired)] {
            if amount.is_zero() {
                continue;
            }
            let allowance = self
                .get_erc20_allowance(token, own_address, manager)
                .await?;
            if allowance < amount {
                debug!("approving {token} to the position manager");
                let mut approve_options = options.clone();
                if wait_timeout.is_none() {
                    approve_options.push(SendTxOption::Nonce(nonce));
                }
                let _approval = self
                    .erc20_approve(
                        token,
                        amount,
                        eth_private_key,
                        manager,
                        wait_timeout,
                        approve_options,
                    )
                    .await?;
                nonce = nonce + 1u8.into();
            }
        }
        if wait_timeout.is_none() {
            options.push(SendTxOption::Nonce(nonce));
        }

        let tx = self
            .prepare_transaction(manager, payload, 0u32.into(), eth_private_key, options)
            .await?;
        let txid = self.send_prepared_transaction(tx).await?;
        debug!(
            "txid for position mint is {}",
            display_uint256_as_address(txid)
        );
        if let Some(timeout) = wait_timeout {
            future_timeout(timeout, self.wait_for_transaction(txid, timeout, None)).await??;
        }

        Ok(txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::Inv;

    fn addr(fill: u8) -> Address {
        Address::from_slice(&[fill; 20]).unwrap()
    }

    #[test]
    fn unit_price_encodes_as_q96_exactly() {
        let one_to_one = uniswap_v3_sqrt_price_from_amounts(1u8.into(), 1u8.into());
        let expected: Uint256 = Uint256::from(1u8) << 96u8.into();
        assert_eq!(one_to_one, expected);
    }

    #[test]
    fn sqrt_price_round_trips() {
        let thirteen = uniswap_v3_sqrt_price_from_amounts(13u8.into(), 1u8.into());
        let decoded = decode_uniswap_v3_sqrt_price(thirteen);
        assert!((decoded - 13.0).abs() < 1e-9, "decoded {decoded}");

        let inverse = uniswap_v3_sqrt_price_from_amounts(1u8.into(), 13u8.into());
        let decoded_inverse = decode_uniswap_v3_sqrt_price(inverse);
        assert!((decoded_inverse - (13.0f64).inv()).abs() < 1e-12);

        // a tiny price, the way stable-vs-18-decimal pairs look
        let small = uniswap_v3_sqrt_price_from_amounts(1u8.into(), 1000u32.into());
        let decoded_small = decode_uniswap_v3_sqrt_price(small);
        assert!((decoded_small - 0.001).abs() < 1e-12);
    }

    #[test]
    fn float_encoder_tracks_integer_encoder() {
        // the float path shortens to 17 significant digits, so it agrees
        // with the exact integer path to better than a part per billion
        for (num, den) in [(1u32, 1u32), (4, 1), (13, 1), (1, 1000)] {
            let exact = uniswap_v3_sqrt_price_from_amounts(num.into(), den.into());
            let float_encoded = uniswap_v3_sqrt_price_from_price(f64::from(num) / f64::from(den));
            let diff = if float_encoded > exact {
                float_encoded - exact
            } else {
                exact - float_encoded
            };
            assert!(
                diff <= exact / 1_000_000_000u32.into(),
                "{num}/{den}: exact {exact} float {float_encoded}"
            );
        }
    }

    #[test]
    fn slippage_scaling_moves_with_direction() {
        let sqrt_price = uniswap_v3_sqrt_price_from_amounts(10u8.into(), 1u8.into());
        let selling_token0 = scale_v3_uniswap_sqrt_price(sqrt_price, 0.005, true);
        let selling_token1 = scale_v3_uniswap_sqrt_price(sqrt_price, 0.005, false);
        assert!(selling_token0 < sqrt_price);
        assert!(selling_token1 > sqrt_price);
        let low = decode_uniswap_v3_sqrt_price(selling_token0);
        let high = decode_uniswap_v3_sqrt_price(selling_token1);
        assert!((low - 9.95).abs() < 1e-6, "low {low}");
        assert!((high - 10.05).abs() < 1e-6, "high {high}");
    }

    #[test]
    fn tick_math_literals() {
        assert_eq!(price_from_tick(0), 1.0);
        assert_eq!(tick_from_price(1.0).unwrap(), 0);
        // the tick bounds of a 8..15 price band
        assert_eq!(tick_from_price(8.0).unwrap(), 20795);
        assert_eq!(tick_from_price(10.0).unwrap(), 23027);
        assert_eq!(tick_from_price(13.0).unwrap(), 25650);
        assert_eq!(tick_from_price(15.0).unwrap(), 27081);
        assert!(tick_from_price(0.0).is_err());
        assert!(tick_from_price(-3.0).is_err());
    }

    #[test]
    fn tick_price_round_trip() {
        for price in [0.001, 0.5, 1.0, 8.0, 13.0, 2000.0] {
            let tick = tick_from_price(price).unwrap();
            let floor = price_from_tick(tick);
            let ceil = price_from_tick(tick + 1);
            assert!(
                floor <= price && price < ceil * 1.0000001,
                "price {price} tick {tick} floor {floor} ceil {ceil}"
            );
        }
    }

    #[test]
    fn usable_ticks_snap_to_spacing() {
        assert_eq!(tick_spacing_for_fee(3000), Some(60));
        assert_eq!(tick_spacing_for_fee(123), None);
        assert_eq!(nearest_usable_tick(20795, 60), 20820);
        assert_eq!(nearest_usable_tick(-20795, 60), -20820);
        assert_eq!(nearest_usable_tick(0, 60), 0);
        // extremes pull inward so the result stays mintable
        assert_eq!(nearest_usable_tick(MIN_TICK, 60), -887220);
        assert_eq!(nearest_usable_tick(MAX_TICK, 60), 887220);
    }

    #[test]
    fn target_orientation_follows_token_sorting() {
        let num: Uint256 = 13u8.into();
        let den: Uint256 = 1u8.into();
        assert_eq!(
            v3_target_sqrt_price(true, num, den),
            uniswap_v3_sqrt_price_from_amounts(num, den)
        );
        assert_eq!(
            v3_target_sqrt_price(false, num, den),
            uniswap_v3_sqrt_price_from_amounts(den, num)
        );
    }

    /// A pool at price 10 targeted to price 13 must buy token0 (sell
    /// token1), and the reverse move sells token0
    #[test]
    fn plan_picks_the_side_that_moves_toward_target() {
        let current = uniswap_v3_sqrt_price_from_amounts(10u8.into(), 1u8.into());
        let target = uniswap_v3_sqrt_price_from_amounts(13u8.into(), 1u8.into());

        let up = plan_uniswap_v3_swap_to_price(current, target).unwrap();
        assert!(!up.zero_for_one);
        assert_eq!(up.sqrt_price_limit_x96, target);

        let down = plan_uniswap_v3_swap_to_price(target, current).unwrap();
        assert!(down.zero_for_one);
        assert_eq!(down.sqrt_price_limit_x96, current);

        assert!(plan_uniswap_v3_swap_to_price(current, current).is_none());
    }

    #[test]
    fn tick_words_are_twos_complement() {
        assert_eq!(tick_word(0), 0u8.into());
        assert_eq!(tick_word(887272), 887272u32.into());
        assert_eq!(tick_word(-1), Uint256::max_value());
        let minus_sixty = tick_word(-60);
        assert_eq!(Uint256::max_value() - minus_sixty, 59u8.into());
    }

    #[test]
    fn mint_call_encoding() {
        let params = V3MintParams {
            token0: addr(0x01),
            token1: addr(0x02),
            fee: 3000,
            tick_lower: -60,
            tick_upper: 27060,
            amount0_desired: 1_000_000u64.into(),
            amount1_desired: 2_000_000u64.into(),
            amount0_min: 0u8.into(),
            amount1_min: 0u8.into(),
            recipient: addr(0xcc),
            deadline: 1_700_000_000u64.into(),
        };
        let payload = encode_mint_call(&params).unwrap();
        // selector plus eleven static words, the tuple encodes in place
        assert_eq!(payload.len(), 4 + 11 * 32);
        let words: Vec<&[u8]> = payload[4..].chunks(32).collect();
        assert_eq!(&words[0][12..], addr(0x01).as_bytes());
        assert_eq!(&words[1][12..], addr(0x02).as_bytes());
        assert_eq!(Uint256::from_be_bytes(words[2]), 3000u16.into());
        // a negative int24 is sign-extended across its whole word
        assert!(words[3].iter().take(31).all(|b| *b == 0xff));
        assert_eq!(words[3][31], 0xc4);
        assert_eq!(Uint256::from_be_bytes(words[4]), 27060u32.into());
        assert_eq!(Uint256::from_be_bytes(words[5]), 1_000_000u64.into());
        assert_eq!(Uint256::from_be_bytes(words[6]), 2_000_000u64.into());
        assert_eq!(&words[9][12..], addr(0xcc).as_bytes());
        assert_eq!(Uint256::from_be_bytes(words[10]), 1_700_000_000u64.into());
    }
}
