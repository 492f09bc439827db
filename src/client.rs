//! Byte-order safe and lightweight Web3 client.
//!
//! A trimmed-down JSONRPC client carrying exactly the operations the broker
//! needs: read-only contract simulation, EIP1559 transaction assembly and
//! submission, and receipt polling that surfaces reverts as errors.

use crate::error::BrokerError;
use crate::jsonrpc::HttpClient;
use crate::types::{
    ConciseBlock, SendTxOption, SyncingStatus, TransactionReceipt, TransactionRequest,
};
use clarity::utils::bytes_to_hex_str;
use clarity::{Address, PrivateKey, Transaction, Uint256};
use futures::future::join4;
use num_traits::ToPrimitive;
use std::cmp::min;
use std::time::{Duration, Instant};
use tokio::time::sleep;

const ETHEREUM_INTRINSIC_GAS: u32 = 21000;

/// The Web3 client which accepts requests and handles communication with
/// the chain over HTTP (JSONRPC)
#[derive(Clone)]
pub struct Web3 {
    url: String,
    jsonrpc_client: HttpClient,
    timeout: Duration,
}

pub struct SimulatedGas {
    pub limit: Uint256,
    pub price: Uint256,
}

impl Web3 {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            jsonrpc_client: HttpClient::new(url),
            timeout,
            url: url.to_string(),
        }
    }

    pub fn get_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn get_url(&self) -> String {
        self.url.clone()
    }

    /// Returns the EIP155 chain ID used for transaction signing
    pub async fn eth_chainid(&self) -> Result<u64, BrokerError> {
        let ret: Uint256 = self
            .jsonrpc_client
            .request_method("eth_chainId", Vec::<String>::new(), self.timeout)
            .await?;
        ret.to_u64()
            .ok_or_else(|| BrokerError::BadResponse(format!("chain id {ret} out of u64 range")))
    }

    /// Returns a bool indicating whether our eth node is currently syncing or not
    pub async fn eth_syncing(&self) -> Result<bool, BrokerError> {
        let res: SyncingStatus = self
            .jsonrpc_client
            .request_method("eth_syncing", Vec::<String>::new(), self.timeout)
            .await?;
        match res {
            SyncingStatus::Syncing { .. } => Ok(true),
            SyncingStatus::NotSyncing(..) => Ok(false),
        }
    }

    pub async fn eth_get_balance(&self, address: Address) -> Result<Uint256, BrokerError> {
        match self.eth_syncing().await? {
            false => {
                self.jsonrpc_client
                    .request_method(
                        "eth_getBalance",
                        vec![address.to_string(), "latest".to_string()],
                        self.timeout,
                    )
                    .await
            }
            true => Err(BrokerError::SyncingNode(
                "Cannot perform eth_getBalance".to_string(),
            )),
        }
    }

    pub async fn eth_get_transaction_count(&self, address: Address) -> Result<Uint256, BrokerError> {
        match self.eth_syncing().await? {
            false => {
                self.jsonrpc_client
                    .request_method(
                        "eth_getTransactionCount",
                        vec![address.to_string(), "latest".to_string()],
                        self.timeout,
                    )
                    .await
            }
            true => Err(BrokerError::SyncingNode(
                "Cannot perform eth_getTransactionCount".to_string(),
            )),
        }
    }

    /// Get the node's gas price, raised to the current base fee if the
    /// median lags behind it
    pub async fn eth_gas_price(&self) -> Result<Uint256, BrokerError> {
        match self.eth_syncing().await? {
            false => {
                let median_gas = self
                    .jsonrpc_client
                    .request_method("eth_gasPrice", Vec::<String>::new(), self.timeout)
                    .await?;
                if let Some(gas) = self.get_base_fee_per_gas().await? {
                    if median_gas < gas {
                        Ok(gas)
                    } else {
                        Ok(median_gas)
                    }
                } else {
                    Ok(median_gas)
                }
            }
            _ => Err(BrokerError::SyncingNode(
                "Cannot perform eth_gas_price".to_string(),
            )),
        }
    }

    pub async fn eth_block_number(&self) -> Result<Uint256, BrokerError> {
        match self.eth_syncing().await? {
            false => {
                self.jsonrpc_client
                    .request_method("eth_blockNumber", Vec::<String>::new(), self.timeout)
                    .await
            }
            true => Err(BrokerError::SyncingNode(
                "Cannot perform eth_block_number".to_string(),
            )),
        }
    }

    /// Gets the latest (non finalized) block header fields the broker reads
    pub async fn eth_get_latest_block(&self) -> Result<ConciseBlock, BrokerError> {
        match self.eth_syncing().await? {
            false => {
                self.jsonrpc_client
                    .request_method("eth_getBlockByNumber", ("latest", false), self.timeout)
                    .await
            }
            _ => Err(BrokerError::SyncingNode(
                "Cannot perform eth_get_latest_block".to_string(),
            )),
        }
    }

    /// Returns `None` if a pre-London fork network is in use and
    /// `Some(base_fee_per_gas)` if a post London network is in use
    pub async fn get_base_fee_per_gas(&self) -> Result<Option<Uint256>, BrokerError> {
        match self.eth_get_latest_block().await {
            Ok(eth_block) => Ok(eth_block.base_fee_per_gas),
            Err(e) => Err(e),
        }
    }

    pub async fn eth_get_transaction_receipt(
        &self,
        hash: Uint256,
    ) -> Result<Option<TransactionReceipt>, BrokerError> {
        if let Ok(true) = self.eth_syncing().await {
            warn!("Eth node is currently syncing, eth_get_transaction_receipt may not work if the transaction is not synced");
        }

        self.jsonrpc_client
            .request_method(
                "eth_getTransactionReceipt",
                vec![format!("{hash:#066x}")],
                self.timeout,
            )
            .await
    }

    pub async fn eth_estimate_gas(
        &self,
        mut transaction: TransactionRequest,
    ) -> Result<Uint256, BrokerError> {
        if let Ok(true) = self.eth_syncing().await {
            warn!("Eth node is still syncing, request may not work if block is not synced");
        }
        let nonce = self
            .eth_get_transaction_count(transaction.get_from())
            .await?;
        let balance = self.eth_get_balance(transaction.get_from()).await?;

        let gas = self.simulated_gas_price_and_limit(balance).await?;

        transaction.set_nonce(nonce);
        transaction.set_gas_limit(gas.limit);
        transaction.set_gas_price(gas.price);

        self.jsonrpc_client
            .request_method("eth_estimateGas", vec![transaction], self.timeout)
            .await
    }

    pub async fn eth_call(&self, transaction: TransactionRequest) -> Result<Vec<u8>, BrokerError> {
        match self.eth_syncing().await? {
            false => {
                let data: crate::types::Data = self
                    .jsonrpc_client
                    .request_method("eth_call", (transaction, "latest"), self.timeout)
                    .await?;
                Ok(data.0)
            }
            true => Err(BrokerError::SyncingNode(
                "Cannot perform eth_call".to_string(),
            )),
        }
    }

    pub async fn eth_send_raw_transaction(&self, data: Vec<u8>) -> Result<Uint256, BrokerError> {
        self.jsonrpc_client
            .request_method(
                "eth_sendRawTransaction",
                vec![format!("0x{}", bytes_to_hex_str(&data))],
                self.timeout,
            )
            .await
    }

    /// Gas values usable for any simulated call: the maximum the caller's
    /// balance can actually pay for, capped where test nodes start erroring
    pub async fn simulated_gas_price_and_limit(
        &self,
        balance: Uint256,
    ) -> Result<SimulatedGas, BrokerError> {
        const GAS_LIMIT: u128 = 12450000;
        let gas_price = self.eth_gas_price().await?;
        let limit = min(GAS_LIMIT.into(), balance / gas_price);
        Ok(SimulatedGas {
            limit,
            price: gas_price,
        })
    }

    /// Simulates an Ethereum contract call by making a fake transaction and
    /// sending it to a special endpoint, executed exactly as if it were an
    /// actual transaction. Used for every read-only contract query in this
    /// crate. Note the calling address must hold ETH for gas even though
    /// nothing is spent.
    pub async fn simulate_transaction(
        &self,
        mut transaction: TransactionRequest,
        options: Vec<SendTxOption>,
    ) -> Result<Vec<u8>, BrokerError> {
        let own_address = transaction.get_from();
        let our_balance = self.eth_get_balance(own_address).await?;
        if our_balance.is_zero() || our_balance < ETHEREUM_INTRINSIC_GAS.into() {
            // We only know that the balance is insufficient, we don't know how much gas is needed
            return Err(BrokerError::InsufficientGas {
                balance: our_balance,
                base_gas: ETHEREUM_INTRINSIC_GAS.into(),
                gas_required: ETHEREUM_INTRINSIC_GAS.into(),
            });
        }

        let nonce = self.eth_get_transaction_count(own_address).await?;
        let gas = self.simulated_gas_price_and_limit(our_balance).await?;

        transaction.set_nonce(nonce);
        transaction.set_gas_limit(gas.limit);
        transaction.set_gas_price(gas.price);

        for option in options {
            match option {
                SendTxOption::GasMaxFee(gp) => transaction.set_gas_price(gp),
                SendTxOption::GasPriorityFee(gp) => transaction.set_priority_fee(gp),
                SendTxOption::GasLimit(gl) => transaction.set_gas_limit(gl),
                SendTxOption::Nonce(n) => transaction.set_nonce(n),
                // multipliers are meaningless here, the simulation already
                // uses the maximum gas the balance allows
                SendTxOption::GasLimitMultiplier(_) | SendTxOption::GasMaxFeeMultiplier(_) => {}
            }
        }

        self.eth_call(transaction).await
    }

    /// Generates but does not send an EIP1559 transaction which changes
    /// blockchain state. `options` takes a vector of `SendTxOption` for
    /// configuration, this call abstracts away gas, nonce and chain id.
    /// The result can be immediately published using
    /// `self.send_prepared_transaction(transaction).await`
    pub async fn prepare_transaction(
        &self,
        to_address: Address,
        data: Vec<u8>,
        value: Uint256,
        secret: PrivateKey,
        options: Vec<SendTxOption>,
    ) -> Result<Transaction, BrokerError> {
        self.assemble_transaction(Some(to_address), data, value, secret, options)
            .await
    }

    async fn assemble_transaction(
        &self,
        to_address: Option<Address>,
        data: Vec<u8>,
        value: Uint256,
        secret: PrivateKey,
        options: Vec<SendTxOption>,
    ) -> Result<Transaction, BrokerError> {
        let mut max_priority_fee_per_gas = 1u8.into();
        let mut gas_limit_multiplier = 1f32;
        let mut gas_limit = None;
        let own_address = secret.to_address();

        let our_balance = self.eth_get_balance(own_address);
        let nonce = self.eth_get_transaction_count(own_address);
        let max_fee_per_gas = self.get_base_fee_per_gas();
        let chain_id = self.eth_chainid();

        // request in parallel
        let (our_balance, nonce, base_fee_per_gas, chain_id) =
            join4(our_balance, nonce, max_fee_per_gas, chain_id).await;

        let (our_balance, mut nonce, base_fee_per_gas, chain_id) =
            (our_balance?, nonce?, base_fee_per_gas?, chain_id?);

        // check if we can send an EIP1559 tx on this chain
        let base_fee_per_gas = match base_fee_per_gas {
            Some(bf) => bf,
            None => return Err(BrokerError::PreLondon),
        };

        // max_fee_per_gas is base gas multiplied by 2, this is a maximum, the actual
        // price we pay is determined by the block the transaction enters. If we put
        // the price exactly at the base fee the tx fails if the price rises at all
        // in the next block, so some base level multiplier makes sense as a default
        let mut max_fee_per_gas = base_fee_per_gas * 2u8.into();

        if our_balance.is_zero() || our_balance < ETHEREUM_INTRINSIC_GAS.into() {
            // We only know that the balance is insufficient, we don't know how much gas is needed
            return Err(BrokerError::InsufficientGas {
                balance: our_balance,
                base_gas: ETHEREUM_INTRINSIC_GAS.into(),
                gas_required: ETHEREUM_INTRINSIC_GAS.into(),
            });
        }

        for option in options {
            match option {
                SendTxOption::GasMaxFee(gp) => max_fee_per_gas = gp,
                SendTxOption::GasPriorityFee(gp) => max_priority_fee_per_gas = gp,
                SendTxOption::GasLimitMultiplier(glm) => gas_limit_multiplier = glm,
                SendTxOption::GasLimit(gl) => gas_limit = Some(gl),
                SendTxOption::Nonce(n) => nonce = n,
                SendTxOption::GasMaxFeeMultiplier(gm) => {
                    let f32_gas = base_fee_per_gas.to_u128();
                    max_fee_per_gas = if let Some(v) = f32_gas {
                        // convert to f32, multiply, then convert back, this
                        // will be lossy, set an exact price if you need one
                        ((v as f32 * gm) as u128).into()
                    } else {
                        // gas price is insanely high, best effort rounding
                        base_fee_per_gas * (gm.round() as u128).into()
                    };
                }
            }
        }

        let mut gas_limit = if let Some(gl) = gas_limit {
            gl
        } else {
            // a creation estimate must omit `to` entirely, the zero address
            // would be a plain call
            let request = TransactionRequest {
                chain_id: Some(chain_id.into()),
                from: own_address,
                to: to_address,
                gas: None,
                max_priority_fee_per_gas: Some(max_priority_fee_per_gas.into()),
                max_fee_per_gas: Some(max_fee_per_gas.into()),
                value: Some(value.into()),
                data: Some(data.clone().into()),
                nonce: Some(nonce.into()),
            };
            self.eth_estimate_gas(request).await?
        };

        // multiply limit by gasLimitMultiplier
        let gas_limit_128 = gas_limit.to_u128();
        if let Some(v) = gas_limit_128 {
            gas_limit = ((v as f32 * gas_limit_multiplier) as u128).into()
        } else {
            gas_limit *= (gas_limit_multiplier.round() as u128).into()
        }

        // this is an edge case where we are about to send a transaction that can't
        // possibly be valid, we simply don't have the funds to pay the full gas
        // amount we are promising, so compute the highest gas price we can pay or
        // error if we can't meet the base fee
        if max_fee_per_gas * gas_limit > our_balance {
            if base_fee_per_gas * gas_limit > our_balance {
                return Err(BrokerError::InsufficientGas {
                    balance: our_balance,
                    base_gas: base_fee_per_gas,
                    gas_required: gas_limit,
                });
            }
            max_fee_per_gas = our_balance / gas_limit;
        }

        let transaction = Transaction::Eip1559 {
            chain_id: chain_id.into(),
            nonce,
            max_priority_fee_per_gas,
            max_fee_per_gas,
            gas_limit,
            // the zero address marks contract creation
            to: to_address.unwrap_or_default(),
            value,
            data,
            signature: None,
            access_list: Vec::new(),
        };

        if !transaction.is_valid() {
            return Err(BrokerError::BadInput("About to send invalid tx".to_string()));
        }

        // signed transaction is now ready to publish
        Ok(transaction.sign(&secret, None))
    }

    /// Publishes a prepared transaction and returns the txhash on success.
    /// To wait for the transaction to actually execute on chain, use
    /// `web3.wait_for_transaction()`
    pub async fn send_prepared_transaction(
        &self,
        transaction: Transaction,
    ) -> Result<Uint256, BrokerError> {
        self.eth_send_raw_transaction(transaction.to_bytes()).await
    }

    /// Prepares and publishes a state-changing transaction in one step
    pub async fn send_transaction(
        &self,
        to_address: Address,
        data: Vec<u8>,
        value: Uint256,
        secret: PrivateKey,
        options: Vec<SendTxOption>,
    ) -> Result<Uint256, BrokerError> {
        let tx = self
            .prepare_transaction(to_address, data, value, secret, options)
            .await?;
        self.send_prepared_transaction(tx).await
    }

    /// Publishes a contract creation transaction carrying `bytecode` (the
    /// contract init code with any constructor arguments already appended).
    /// The deployed address appears on the receipt once the transaction is
    /// mined, see `wait_for_transaction()`
    pub async fn deploy_contract(
        &self,
        bytecode: Vec<u8>,
        value: Uint256,
        secret: PrivateKey,
        options: Vec<SendTxOption>,
    ) -> Result<Uint256, BrokerError> {
        if bytecode.is_empty() {
            return Err(BrokerError::BadInput(
                "Contract deployment with empty bytecode".to_string(),
            ));
        }
        let tx = self
            .assemble_transaction(None, bytecode, value, secret, options)
            .await?;
        self.send_prepared_transaction(tx).await
    }

    /// Waits for a transaction with the given hash to be included in a
    /// block, for at most `timeout`, optionally waiting a further number of
    /// blocks for reorg safety. A receipt carrying failure status is
    /// surfaced as `TransactionReverted` with no retry, matching the
    /// all-or-nothing semantics of the underlying call.
    pub async fn wait_for_transaction(
        &self,
        tx_hash: Uint256,
        timeout: Duration,
        blocks_to_wait: Option<Uint256>,
    ) -> Result<TransactionReceipt, BrokerError> {
        let start = Instant::now();
        loop {
            sleep(Duration::from_secs(1)).await;
            match self.eth_get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    if let Some(tx_block) = receipt.block_number {
                        if receipt.is_reverted() {
                            return Err(BrokerError::TransactionReverted(format!(
                                "{tx_hash:#066x}"
                            )));
                        }
                        match blocks_to_wait {
                            None => return Ok(receipt),
                            Some(blocks_to_wait) => {
                                let current_block = self.eth_block_number().await?;
                                // check for underflow, which is possible on testnets
                                if current_block > blocks_to_wait
                                    && current_block - blocks_to_wait >= tx_block
                                {
                                    return Ok(receipt);
                                }
                            }
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => return Err(e),
            }

            if Instant::now() - start > timeout {
                return Err(BrokerError::TransactionTimeout);
            }
        }
    }
}
