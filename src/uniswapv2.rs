//! Uniswap V2 interactions: pair and reserve queries, swap execution, and
//! the price-targeting broker operation.
//!
//! The broker operation reads the pool's reserves, computes the exact trade
//! that moves the constant-product price onto a caller-supplied target
//! (see [`crate::market`]), caps it by the caller's spend bounds, and
//! executes it through the V2 router in a single transaction.

use crate::client::Web3;
use crate::error::BrokerError;
use crate::market::{
    compute_trade_to_move_market, get_amount_out, spot_price_a_in_b, SwapFee, UNISWAP_V2_FEE,
};
use crate::types::{SendTxOption, TransactionRequest};
use clarity::utils::display_uint256_as_address;
use clarity::{
    abi::{encode_call, AbiToken},
    Address, PrivateKey, Uint256,
};
use std::time::Duration;
use tokio::time::timeout as future_timeout;

/// Default padding multiplied onto estimated gas limits, swap gas usage
/// varies between identical-looking invocations
pub const DEFAULT_GAS_LIMIT_MULT: f32 = 1.2;

/// Default swap deadline when the caller provides none, ten minutes past
/// the latest block
const DEFAULT_DEADLINE_SECONDS: u64 = 10 * 60;

lazy_static! {
    /// Uniswap V2's Factory, from prod Ethereum
    pub static ref UNISWAP_V2_FACTORY_ADDRESS: Address =
        Address::parse_and_validate("0x5C69bEe701ef814a2B6a3EDD4B1652CB9cc5aA6f").unwrap();
    /// Uniswap V2's Router02 interface for swapping tokens, from prod Ethereum
    pub static ref UNISWAP_V2_ROUTER_ADDRESS: Address =
        Address::parse_and_validate("0x7a250d5630B4cF539739dF2C5dAcb4c659F2488D").unwrap();
}

/// Helper function that tells us whether the options parameter has a
/// GasLimitMultiplier set or not
pub(crate) fn options_contains_glm(options: &[SendTxOption]) -> bool {
    for option in options {
        match option {
            SendTxOption::GasLimitMultiplier(_) => return true,
            _ => continue,
        }
    }

    false
}

/// Uniswap sorts the tokens of a pair by address, returns true when
/// `token_a` is the pair's token0
pub fn is_token0(token_a: Address, token_b: Address) -> bool {
    token_a.as_bytes() < token_b.as_bytes()
}

/// A computed, capped swap-to-price ready for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V2SwapToPricePlan {
    /// true sells token A into the pool, false sells token B
    pub a_to_b: bool,
    /// gross input after applying the caller's spend bound
    pub amount_in: Uint256,
    /// the output the pool would produce for `amount_in` at current reserves
    pub expected_out: Uint256,
    /// true when the spend bound truncated the computed trade, in which
    /// case the pool lands short of the target
    pub capped: bool,
}

/// The pure planning half of the swap-to-price operation: computes the
/// trade against known reserves and applies the per-token spend bounds.
/// A zero bound means unbounded spending of that token. Returns None when
/// the pool already sits on the target price.
pub fn plan_uniswap_v2_swap_to_price(
    reserve_a: Uint256,
    reserve_b: Uint256,
    true_price_numerator: Uint256,
    true_price_denominator: Uint256,
    max_spend_a: Uint256,
    max_spend_b: Uint256,
    fee: SwapFee,
) -> Result<Option<V2SwapToPricePlan>, BrokerError> {
    let trade = compute_trade_to_move_market(
        true_price_numerator,
        true_price_denominator,
        reserve_a,
        reserve_b,
        fee,
    )?;
    if trade.is_noop() {
        return Ok(None);
    }

    let bound = if trade.a_to_b { max_spend_a } else { max_spend_b };
    let (amount_in, capped) = if !bound.is_zero() && trade.amount_in > bound {
        (bound, true)
    } else {
        (trade.amount_in, false)
    };

    let (reserve_in, reserve_out) = if trade.a_to_b {
        (reserve_a, reserve_b)
    } else {
        (reserve_b, reserve_a)
    };
    let expected_out = get_amount_out(amount_in, reserve_in, reserve_out, fee)?;

    Ok(Some(V2SwapToPricePlan {
        a_to_b: trade.a_to_b,
        amount_in,
        expected_out,
        capped,
    }))
}

/// The argument block of an on-chain broker contract's swapToPrice entry
/// point. With `trading_as_eoa` the broker pulls the input token from the
/// caller (who must have approved it), otherwise it spends its own
/// pre-funded balance. Either way the output is forwarded to `recipient`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerSwapToPrice {
    pub trading_as_eoa: bool,
    pub router: Address,
    pub factory: Address,
    /// the traded pair, (token A, token B)
    pub tokens: [Address; 2],
    /// price of token A in units of token B as a rational pair
    pub true_price: [Uint256; 2],
    /// per-token spend bounds, zero for unbounded
    pub max_spend: [Uint256; 2],
    pub recipient: Address,
    /// unix timestamp after which the swap is rejected
    pub deadline: Uint256,
}

/// ABI payload for a broker contract swapToPrice call. Fixed-size arrays
/// are static types so their elements encode in place.
pub fn encode_swap_to_price_call(params: &BrokerSwapToPrice) -> Result<Vec<u8>, BrokerError> {
    let tokens: [AbiToken; 11] = [
        AbiToken::Bool(params.trading_as_eoa),
        params.router.into(),
        params.factory.into(),
        params.tokens[0].into(),
        params.tokens[1].into(),
        params.true_price[0].into(),
        params.true_price[1].into(),
        params.max_spend[0].into(),
        params.max_spend[1].into(),
        params.recipient.into(),
        params.deadline.into(),
    ];
    Ok(encode_call(
        "swapToPrice(bool,address,address,address[2],uint256[2],uint256[2],address,uint256)",
        &tokens,
    )?)
}

impl Web3 {
    /// Looks up the V2 pair contract for two tokens via the factory,
    /// erroring if no pair has been created
    pub async fn get_uniswap_v2_pair(
        &self,
        caller_address: Address, // an arbitrary ethereum address with some amount of Ether
        token_a: Address,
        token_b: Address,
        uniswap_factory: Option<Address>, // default is the prod Ethereum factory
    ) -> Result<Address, BrokerError> {
        let factory = uniswap_factory.unwrap_or(*UNISWAP_V2_FACTORY_ADDRESS);
        let payload = encode_call(
            "getPair(address,address)",
            &[token_a.into(), token_b.into()],
        )?;
        let pair_result = self
            .simulate_transaction(
                TransactionRequest::quick_tx(caller_address, factory, payload),
                vec![],
            )
            .await?;
        let result_len = pair_result.len();
        if result_len < 20 {
            return Err(BrokerError::BadResponse(
                "Invalid getPair result".to_string(),
            ));
        }
        let pair = Address::from_slice(&pair_result[result_len - 20..result_len])?;
        if pair == Address::default() {
            return Err(BrokerError::ContractCallError(format!(
                "No V2 pair exists for {token_a} / {token_b}"
            )));
        }
        Ok(pair)
    }

    /// Fetches a pair's raw reserves in token0-major order
    pub async fn get_uniswap_v2_reserves(
        &self,
        caller_address: Address, // an arbitrary ethereum address with some amount of Ether
        pair: Address,           // the pair contract to query
    ) -> Result<(Uint256, Uint256), BrokerError> {
        let payload = encode_call("getReserves()", &[])?;
        let reserves = self
            .simulate_transaction(
                TransactionRequest::quick_tx(caller_address, pair, payload),
                vec![],
            )
            .await?;
        trace!("getReserves response is {:02X?}", reserves);
        // uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast
        if reserves.len() < 64 {
            return Err(BrokerError::BadResponse(format!(
                "Unexpected getReserves response length {}",
                reserves.len()
            )));
        }
        let reserve0 = Uint256::from_be_bytes(&reserves[0..32]);
        let reserve1 = Uint256::from_be_bytes(&reserves[32..64]);
        Ok((reserve0, reserve1))
    }

    /// Fetches reserves re-ordered to the caller's (token_a, token_b)
    /// argument order, regardless of how Uniswap sorted the pair
    pub async fn get_uniswap_v2_reserves_for(
        &self,
        caller_address: Address,
        token_a: Address,
        token_b: Address,
        uniswap_factory: Option<Address>,
    ) -> Result<(Uint256, Uint256), BrokerError> {
        let pair = self
            .get_uniswap_v2_pair(caller_address, token_a, token_b, uniswap_factory)
            .await?;
        let (reserve0, reserve1) = self.get_uniswap_v2_reserves(caller_address, pair).await?;
        if is_token0(token_a, token_b) {
            Ok((reserve0, reserve1))
        } else {
            Ok((reserve1, reserve0))
        }
    }

    /// The pool's current implied price of `token_a` denominated in
    /// `token_b`, as a float for display and tolerance checks
    pub async fn get_uniswap_v2_spot_price(
        &self,
        caller_address: Address,
        token_a: Address,
        token_b: Address,
        uniswap_factory: Option<Address>,
    ) -> Result<f64, BrokerError> {
        let (reserve_a, reserve_b) = self
            .get_uniswap_v2_reserves_for(caller_address, token_a, token_b, uniswap_factory)
            .await?;
        Ok(spot_price_a_in_b(reserve_a, reserve_b))
    }

    /// Queries the Uniswap V2 Router02 to get the amount of `token_out`
    /// obtainable for `amount` of `token_in`. This method will not swap
    /// any funds
    pub async fn get_uniswap_v2_amounts_out(
        &self,
        caller_address: Address, // an arbitrary ethereum address with some amount of Ether
        token_in: Address,       // the held token
        token_out: Address,      // the desired token
        amount: Uint256,         // the amount of token_in to swap
        uniswap_router: Option<Address>, // default is the prod Ethereum Router02
    ) -> Result<Uint256, BrokerError> {
        let router = uniswap_router.unwrap_or(*UNISWAP_V2_ROUTER_ADDRESS);

        let tokens: [AbiToken; 2] = [AbiToken::Uint(amount), vec![token_in, token_out].into()];

        debug!("tokens is  {:?}", tokens);
        let payload = encode_call("getAmountsOut(uint256,address[])", &tokens)?;
        let amounts_bytes = self
            .simulate_transaction(
                TransactionRequest::quick_tx(caller_address, router, payload),
                vec![],
            )
            .await?;
        trace!("getAmountsOut response is {:02X?}", amounts_bytes);

        if amounts_bytes.len() % 32 != 0 || amounts_bytes.len() <= 64 {
            return Err(BrokerError::BadResponse(format!(
                "Unexpected response byte length: {}",
                amounts_bytes.len()
            )));
        }
        // Throw away the first two values (type code and response length), then
        // parse a Uint256 from each 32 byte chunk
        let amounts = amounts_bytes[64..]
            .chunks(32)
            .map(Uint256::from_be_bytes)
            .collect::<Vec<Uint256>>();
        debug!("Got amounts from response: {:?}", amounts);
        if amounts.len() != 2 {
            return Err(BrokerError::BadResponse(format!(
                "Unexpected swap path, should only have 2 amounts: {amounts:?}"
            )));
        }
        // The remaining amounts are [amount_in, amount_out]
        Ok(*amounts.last().unwrap())
    }

    /// Swaps `amount` of `token_in` for `token_out` through the V2 router
    /// by calling swapExactTokensForTokens, approving the router first if
    /// needed. With `amount_out_min` of None the swap carries no slippage
    /// protection. A failed on-chain call reverts, nothing is retried.
    #[allow(clippy::too_many_arguments)]
    pub async fn swap_uniswap_v2(
        &self,
        eth_private_key: PrivateKey,     // the holder of token_in
        token_in: Address,               // the held token
        token_out: Address,              // the desired token
        amount: Uint256,                 // the amount of token_in to sell
        amount_out_min: Option<Uint256>, // minimum output or the swap reverts
        recipient: Option<Address>,      // output destination, the caller if None
        deadline: Option<Uint256>,       // unix deadline, latest block + 10 minutes if None
        uniswap_router: Option<Address>, // default is the prod Ethereum Router02
        options: Option<Vec<SendTxOption>>, // options for send_transaction
        wait_timeout: Option<Duration>,
    ) -> Result<Uint256, BrokerError> {
        let own_address = eth_private_key.to_address();
        let router = uniswap_router.unwrap_or(*UNISWAP_V2_ROUTER_ADDRESS);
        let recipient = recipient.unwrap_or(own_address);
        let amount_out_min = amount_out_min.unwrap_or_else(|| 0u8.into());
        let deadline = match deadline {
            None => {
                self.eth_get_latest_block().await?.timestamp + DEFAULT_DEADLINE_SECONDS.into()
            }
            Some(val) => val,
        };

        let mut options = options.unwrap_or_default();
        if !options_contains_glm(&options) {
            options.push(SendTxOption::GasLimitMultiplier(DEFAULT_GAS_LIMIT_MULT));
        }

        let allowance = self
            .get_erc20_allowance(token_in, own_address, router)
            .await?;
        if allowance < amount {
            debug!("token_in being approved for v2 swap");
            // the nonce we will be using, without a wait we must set the
            // following swap's nonce by hand so the two queue properly
            let nonce = self.eth_get_transaction_count(own_address).await?;
            let _approval = self
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

        let tokens: [AbiToken; 5] = [
            AbiToken::Uint(amount),
            AbiToken::Uint(amount_out_min),
            vec![token_in, token_out].into(),
            recipient.into(),
            AbiToken::Uint(deadline),
        ];
        let payload = encode_call(
            "swapExactTokensForTokens(uint256,uint256,address[],address,uint256)",
            &tokens,
        )?;
        trace!("payload is {:02X?}", payload);

        let tx = self
            .prepare_transaction(router, payload, 0u32.into(), eth_private_key, options)
            .await?;
        let txid = self.send_prepared_transaction(tx).await?;
        debug!(
            "txid for uniswap v2 swap is {}",
            display_uint256_as_address(txid)
        );
        if let Some(timeout) = wait_timeout {
            future_timeout(timeout, self.wait_for_transaction(txid, timeout, None)).await??;
        }

        Ok(txid)
    }

    /// Moves a V2 pool's spot price onto a target by computing the exact
    /// trade from current reserves and executing it, trading as the
    /// caller's own account. The target is the price of `token_a`
    /// denominated in `token_b` as a rational pair, spending is bounded
    /// per token (zero bound means unbounded), and any output goes to
    /// `recipient`. Returns Ok(None) without touching the chain when the
    /// pool already sits on the target.
    ///
    /// The realized price lands within a fee-and-truncation bounded
    /// tolerance of the target, see [`crate::market`].
    #[allow(clippy::too_many_arguments)]
    pub async fn swap_uniswap_v2_to_price(
        &self,
        eth_private_key: PrivateKey,        // the trading account
        token_a: Address,                   // one side of the pair
        token_b: Address,                   // the other side of the pair
        true_price_numerator: Uint256,      // price of A in B, numerator
        true_price_denominator: Uint256,    // price of A in B, denominator
        max_spend_a: Uint256,               // spend bound for token A, zero for unbounded
        max_spend_b: Uint256,               // spend bound for token B, zero for unbounded
        recipient: Option<Address>,         // output destination, the caller if None
        deadline: Option<Uint256>,          // unix deadline, latest block + 10 minutes if None
        max_slippage: Option<f64>,          // tolerated movement against the plan, 0.5% if None
        uniswap_factory: Option<Address>,   // default is the prod Ethereum factory
        uniswap_router: Option<Address>,    // default is the prod Ethereum Router02
        options: Option<Vec<SendTxOption>>, // options for send_transaction
        wait_timeout: Option<Duration>,
    ) -> Result<Option<Uint256>, BrokerError> {
        let own_address = eth_private_key.to_address();
        let (reserve_a, reserve_b) = self
            .get_uniswap_v2_reserves_for(own_address, token_a, token_b, uniswap_factory)
            .await?;

        let plan = plan_uniswap_v2_swap_to_price(
            reserve_a,
            reserve_b,
            true_price_numerator,
            true_price_denominator,
            max_spend_a,
            max_spend_b,
            UNISWAP_V2_FEE,
        )?;
        let plan = match plan {
            Some(plan) => plan,
            None => {
                debug!("pool already sits on the target price, no trade");
                return Ok(None);
            }
        };
        if plan.capped {
            warn!(
                "swap to price capped by spend bound, pool will land short of target (amount {})",
                plan.amount_in
            );
        }

        // guard against the pool moving between the reserve query and our
        // swap entering a block
        let max_slippage = max_slippage.unwrap_or(0.005f64);
        let expected: f64 = plan.expected_out.to_string().parse().unwrap();
        let amount_out_min = (expected * (1f64 - max_slippage))
            .floor()
            .to_string()
            .parse::<Uint256>()
            .unwrap();

        let (token_in, token_out) = if plan.a_to_b {
            (token_a, token_b)
        } else {
            (token_b, token_a)
        };

        let txid = self
            .swap_uniswap_v2(
                eth_private_key,
                token_in,
                token_out,
                plan.amount_in,
                Some(amount_out_min),
                recipient,
                deadline,
                uniswap_router,
                options,
                wait_timeout,
            )
            .await?;
        Ok(Some(txid))
    }

    /// Submits a swapToPrice call on a deployed broker contract, which
    /// reads reserves and computes the trade on chain in the same
    /// transaction that executes it. `trading_as_eoa` pulls funds from the
    /// caller (requires prior approval to the broker), otherwise the
    /// broker spends its own balance
    pub async fn swap_to_price_via_broker(
        &self,
        eth_private_key: PrivateKey, // the invoking account
        broker: Address,             // the deployed broker contract
        params: BrokerSwapToPrice,   // the full swapToPrice argument block
        options: Option<Vec<SendTxOption>>,
        wait_timeout: Option<Duration>,
    ) -> Result<Uint256, BrokerError> {
        let payload = encode_swap_to_price_call(&params)?;

        let mut options = options.unwrap_or_default();
        if !options_contains_glm(&options) {
            options.push(SendTxOption::GasLimitMultiplier(DEFAULT_GAS_LIMIT_MULT));
        }

        let tx = self
            .prepare_transaction(broker, payload, 0u32.into(), eth_private_key, options)
            .await?;
        let txid = self.send_prepared_transaction(tx).await?;
        debug!(
            "txid for broker swapToPrice is {}",
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
    use crate::market::UNISWAP_V2_FEE;

    fn addr(fill: u8) -> Address {
        Address::from_slice(&[fill; 20]).unwrap()
    }

    #[test]
    fn token_ordering_matches_pair_sorting() {
        let low = addr(0x11);
        let high = addr(0x22);
        assert!(is_token0(low, high));
        assert!(!is_token0(high, low));
    }

    #[test]
    fn plan_applies_spend_bound() {
        let reserve_a: Uint256 = 10_000_000_000u128.into();
        let reserve_b: Uint256 = 10_000_000u128.into();
        // push A's price down, an unbounded plan sells a lot of A
        let unbounded = plan_uniswap_v2_swap_to_price(
            reserve_a,
            reserve_b,
            1u8.into(),
            2000u32.into(),
            0u8.into(),
            0u8.into(),
            UNISWAP_V2_FEE,
        )
        .unwrap()
        .unwrap();
        assert!(unbounded.a_to_b);
        assert!(!unbounded.capped);

        let bound: Uint256 = 1_000_000u64.into();
        assert!(unbounded.amount_in > bound);
        let capped = plan_uniswap_v2_swap_to_price(
            reserve_a,
            reserve_b,
            1u8.into(),
            2000u32.into(),
            bound,
            0u8.into(),
            UNISWAP_V2_FEE,
        )
        .unwrap()
        .unwrap();
        assert!(capped.capped);
        assert_eq!(capped.amount_in, bound);
        assert!(capped.expected_out < unbounded.expected_out);
    }

    #[test]
    fn plan_bound_on_other_token_does_not_cap() {
        let reserve_a: Uint256 = 10_000_000_000u128.into();
        let reserve_b: Uint256 = 10_000_000u128.into();
        // selling A, so a tiny bound on B changes nothing
        let plan = plan_uniswap_v2_swap_to_price(
            reserve_a,
            reserve_b,
            1u8.into(),
            2000u32.into(),
            0u8.into(),
            1u8.into(),
            UNISWAP_V2_FEE,
        )
        .unwrap()
        .unwrap();
        assert!(plan.a_to_b);
        assert!(!plan.capped);
    }

    #[test]
    fn plan_is_none_on_target() {
        let plan = plan_uniswap_v2_swap_to_price(
            5000u32.into(),
            10u8.into(),
            1u8.into(),
            500u32.into(),
            0u8.into(),
            0u8.into(),
            UNISWAP_V2_FEE,
        )
        .unwrap();
        assert!(plan.is_none());
    }

    #[test]
    fn swap_to_price_call_encoding() {
        let params = BrokerSwapToPrice {
            trading_as_eoa: true,
            router: addr(0xaa),
            factory: addr(0xbb),
            tokens: [addr(0x01), addr(0x02)],
            true_price: [1u8.into(), 1000u32.into()],
            max_spend: [0u8.into(), 5u8.into()],
            recipient: addr(0xcc),
            deadline: 1_700_000_000u64.into(),
        };
        let payload = encode_swap_to_price_call(&params).unwrap();
        // selector plus eleven static words
        assert_eq!(payload.len(), 4 + 11 * 32);
        let words: Vec<&[u8]> = payload[4..].chunks(32).collect();
        // bool true
        assert_eq!(words[0][31], 1);
        // addresses are right-aligned in their words
        assert_eq!(&words[1][12..], addr(0xaa).as_bytes());
        assert_eq!(&words[2][12..], addr(0xbb).as_bytes());
        assert_eq!(&words[3][12..], addr(0x01).as_bytes());
        assert_eq!(&words[4][12..], addr(0x02).as_bytes());
        // the true price pair encodes in place
        assert_eq!(Uint256::from_be_bytes(words[5]), 1u8.into());
        assert_eq!(Uint256::from_be_bytes(words[6]), 1000u32.into());
        // spend bounds and tail fields
        assert_eq!(Uint256::from_be_bytes(words[7]), 0u8.into());
        assert_eq!(Uint256::from_be_bytes(words[8]), 5u8.into());
        assert_eq!(&words[9][12..], addr(0xcc).as_bytes());
        assert_eq!(Uint256::from_be_bytes(words[10]), 1_700_000_000u64.into());
    }
}
