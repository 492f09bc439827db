//! Utility functions for interacting with ERC20 tokens, covering the
//! balance checks and router approvals the swap brokers depend on
use crate::client::Web3;
use crate::error::BrokerError;
use crate::types::{SendTxOption, TransactionRequest};
use clarity::{abi::encode_call, Address, PrivateKey, Uint256};
use num_traits::Bounded;
use std::time::Duration;
use tokio::time::timeout as future_timeout;

pub static ERC20_GAS_LIMIT: u128 = 100_000;

impl Web3 {
    /// Queries the `target_address`'s current balance of `erc20`
    pub async fn get_erc20_balance(
        &self,
        erc20: Address,
        target_address: Address,
    ) -> Result<Uint256, BrokerError> {
        let payload = encode_call("balanceOf(address)", &[target_address.into()])?;
        let balance = self
            .simulate_transaction(
                TransactionRequest::quick_tx(target_address, erc20, payload),
                vec![],
            )
            .await?;

        Ok(Uint256::from_be_bytes(match balance.get(0..32) {
            Some(val) => val,
            None => {
                return Err(BrokerError::ContractCallError(
                    "Bad response from ERC20 balance".to_string(),
                ))
            }
        }))
    }

    /// Queries how much of `owner`'s `erc20` balance `spender` may move
    pub async fn get_erc20_allowance(
        &self,
        erc20: Address,
        owner: Address,
        spender: Address,
    ) -> Result<Uint256, BrokerError> {
        let payload = encode_call(
            "allowance(address,address)",
            &[owner.into(), spender.into()],
        )?;
        let allowance = self
            .simulate_transaction(TransactionRequest::quick_tx(owner, erc20, payload), vec![])
            .await?;

        Ok(Uint256::from_be_bytes(match allowance.get(0..32) {
            Some(val) => val,
            None => {
                return Err(BrokerError::ContractCallError(
                    "erc20 allowance(address,address) failed".to_string(),
                ))
            }
        }))
    }

    /// Checks if any given contract is approved to spend money from any given erc20 contract
    /// using any given address. What exactly this does can be hard to grok, essentially when
    /// you want contract A to be able to spend your erc20 contract funds you need to call 'approve'
    /// on the ERC20 contract with your own address and A's address so that in the future when you call
    /// contract A it can manipulate your ERC20 balances. This function checks if that has already been done.
    pub async fn check_erc20_approved(
        &self,
        erc20: Address,
        own_address: Address,
        target_contract: Address,
    ) -> Result<bool, BrokerError> {
        let allowance = self
            .get_erc20_allowance(erc20, own_address, target_contract)
            .await?;
        // Check if the allowance remaining is greater than half of a Uint256- it's as good
        // a test as any.
        Ok(allowance > (Uint256::max_value() / 2u32.into()))
    }

    /// Approves `spender` to move `amount` of the caller's `erc20` funds,
    /// optionally waiting until the approval enters the chain. Pass
    /// `Uint256::max_value()` for a standing approval.
    pub async fn erc20_approve(
        &self,
        erc20: Address,
        amount: Uint256,
        eth_private_key: PrivateKey,
        spender: Address,
        wait_timeout: Option<Duration>,
        options: Vec<SendTxOption>,
    ) -> Result<Uint256, BrokerError> {
        let payload = encode_call("approve(address,uint256)", &[spender.into(), amount.into()])?;

        let txid = self
            .send_transaction(erc20, payload, 0u32.into(), eth_private_key, options)
            .await?;

        // wait for the transaction to enter the chain if the user has requested it
        if let Some(timeout) = wait_timeout {
            future_timeout(timeout, self.wait_for_transaction(txid, timeout, None)).await??;
        }

        Ok(txid)
    }

    /// Send an erc20 token to the target address, optionally wait until it
    /// enters the blockchain
    pub async fn erc20_send(
        &self,
        amount: Uint256,
        recipient: Address,
        erc20: Address,
        sender_private_key: PrivateKey,
        wait_timeout: Option<Duration>,
        options: Vec<SendTxOption>,
    ) -> Result<Uint256, BrokerError> {
        // if the user sets a gas limit we should honor it, if they don't we
        // should add the default
        let mut has_gas_limit = false;
        let mut options = options;
        for option in options.iter() {
            if let SendTxOption::GasLimit(_) = option {
                has_gas_limit = true;
                break;
            }
        }
        if !has_gas_limit {
            options.push(SendTxOption::GasLimit(ERC20_GAS_LIMIT.into()));
        }

        let tx_hash = self
            .send_transaction(
                erc20,
                encode_call(
                    "transfer(address,uint256)",
                    &[recipient.into(), amount.into()],
                )?,
                0u32.into(),
                sender_private_key,
                options,
            )
            .await?;

        if let Some(timeout) = wait_timeout {
            future_timeout(timeout, self.wait_for_transaction(tx_hash, timeout, None)).await??;
        }

        Ok(tx_hash)
    }
}
