use clarity::utils::{bytes_to_hex_str, hex_str_to_bytes};
use clarity::{Address, Uint256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::ops::Deref;

/// Serializes a slice of data as the "UNFORMATTED DATA" format required
/// by the Ethereum JSONRPC API.
///
/// See more https://ethereum.org/en/developers/docs/apis/json-rpc/#hex-encoding
pub fn data_serialize<S>(x: &[u8], s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(&format!("0x{}", bytes_to_hex_str(x)))
}

/// Deserializes a slice of data from the "UNFORMATTED DATA" format required
/// by the Ethereum JSONRPC API.
pub fn data_deserialize<'de, D>(d: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(d)?;
    hex_str_to_bytes(&s).map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq, Hash)]
pub struct Data(
    #[serde(
        serialize_with = "data_serialize",
        deserialize_with = "data_deserialize"
    )]
    pub Vec<u8>,
);

impl Deref for Data {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        &self.0
    }
}

impl From<Vec<u8>> for Data {
    fn from(v: Vec<u8>) -> Self {
        Data(v)
    }
}

/// A quantity serialized as minimal-length hex ("0x1" not "0x01"), the
/// encoding Ethereum nodes require for numeric transaction fields
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct UnpaddedHex(pub Uint256);

impl Serialize for UnpaddedHex {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:#x}", *self.0))
    }
}

impl From<Uint256> for UnpaddedHex {
    fn from(v: Uint256) -> Self {
        UnpaddedHex(v)
    }
}

impl From<u64> for UnpaddedHex {
    fn from(v: u64) -> Self {
        UnpaddedHex(v.into())
    }
}

/// An EIP1559 call/transaction description for eth_call and
/// eth_estimateGas. The broker only ever submits EIP1559 transactions so
/// the legacy forms are not modeled. A `to` of None describes contract
/// creation.
#[derive(Serialize, Clone, Eq, PartialEq, Debug)]
pub struct TransactionRequest {
    #[serde(rename = "chainId", skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<UnpaddedHex>,
    pub from: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas: Option<UnpaddedHex>,
    #[serde(
        rename = "maxPriorityFeePerGas",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_priority_fee_per_gas: Option<UnpaddedHex>,
    #[serde(rename = "maxFeePerGas", skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<UnpaddedHex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<UnpaddedHex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Data>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<UnpaddedHex>,
}

impl TransactionRequest {
    pub fn get_from(&self) -> Address {
        self.from
    }
    pub fn set_nonce(&mut self, new_nonce: Uint256) {
        self.nonce = Some(new_nonce.into());
    }
    pub fn set_gas_limit(&mut self, gas_limit: Uint256) {
        self.gas = Some(gas_limit.into());
    }
    /// For simulations EIP1559 gas is simply set as high as the balance
    /// allows, the node does not run a fee market against eth_call
    pub fn set_gas_price(&mut self, new_gas_price: Uint256) {
        self.max_fee_per_gas = Some(new_gas_price.into());
    }
    pub fn set_priority_fee(&mut self, fee: Uint256) {
        self.max_priority_fee_per_gas = Some(fee.into());
    }

    /// Creates a request with mostly blank parameters, useful for quick
    /// read-only simulations
    pub fn quick_tx(from: Address, to: Address, payload: Vec<u8>) -> TransactionRequest {
        TransactionRequest {
            chain_id: None,
            from,
            to: Some(to),
            gas: None,
            max_priority_fee_per_gas: None,
            max_fee_per_gas: None,
            value: None,
            data: Some(payload.into()),
            nonce: None,
        }
    }

}

/// The subset of an Ethereum block header the broker reads: block number
/// for confirmation tracking, timestamp for default swap deadlines, and
/// the base fee for EIP1559 pricing
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConciseBlock {
    pub number: Uint256,
    pub timestamp: Uint256,
    /// this field will not exist on pre-london chains
    #[serde(rename = "baseFeePerGas")]
    pub base_fee_per_gas: Option<Uint256>,
    pub hash: Uint256,
    #[serde(rename = "gasLimit")]
    pub gas_limit: Uint256,
    #[serde(rename = "gasUsed")]
    pub gas_used: Uint256,
}

/// As received by getTransactionReceipt
///
/// See more: https://ethereum.org/en/developers/docs/apis/json-rpc/#eth_gettransactionreceipt
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
    /// hash of the transaction
    #[serde(rename = "transactionHash")]
    pub transaction_hash: Data,
    /// block number where this transaction was in, null when its pending
    #[serde(rename = "blockNumber")]
    pub block_number: Option<Uint256>,
    /// amount of gas used by this transaction alone
    #[serde(rename = "gasUsed")]
    pub gas_used: Uint256,
    /// The contract address created, if the transaction was a contract creation, otherwise null
    #[serde(rename = "contractAddress")]
    pub contract_address: Option<Address>,
    /// either 1 (success) or 0 (failure) - returned only post Byzantium
    pub status: Option<Uint256>,
}

impl TransactionReceipt {
    /// True once the receipt carries an explicit failure status
    pub fn is_reverted(&self) -> bool {
        matches!(&self.status, Some(status) if *status == 0u8.into())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum SyncingStatus {
    Syncing {
        #[serde(rename = "startingBlock")]
        starting_block: Uint256,
        #[serde(rename = "currentBlock")]
        current_block: Uint256,
        #[serde(rename = "highestBlock")]
        highest_block: Uint256,
    },
    NotSyncing(bool),
}

/// Options for transaction preparation, applied over sensible defaults
#[derive(Debug, Clone, PartialEq)]
pub enum SendTxOption {
    GasMaxFee(Uint256),
    GasMaxFeeMultiplier(f32),
    GasPriorityFee(Uint256),
    GasLimitMultiplier(f32),
    GasLimit(Uint256),
    Nonce(Uint256),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quick_tx_serializes_sparse() {
        let from: Address = "0x1111111111111111111111111111111111111111"
            .parse()
            .unwrap();
        let to: Address = "0x2222222222222222222222222222222222222222"
            .parse()
            .unwrap();
        let req = TransactionRequest::quick_tx(from, to, vec![0xde, 0xad]);
        let json = serde_json::to_value(&req).unwrap();
        let obj = json.as_object().unwrap();
        // unset optionals must be absent, not null, or nodes reject the call
        assert!(!obj.contains_key("gas"));
        assert!(!obj.contains_key("nonce"));
        assert_eq!(obj["data"], "0xdead");
    }

    #[test]
    fn unpadded_hex_is_minimal() {
        let v: UnpaddedHex = Uint256::from(1u8).into();
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"0x1\"");
        let v: UnpaddedHex = Uint256::from(0x10u8).into();
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"0x10\"");
    }

    #[test]
    fn receipt_status_parses_and_flags_reverts() {
        let json = r#"{
            "transactionHash": "0x9e936b617c45261deafc4af557ce0969d0cbaba00e79357729208f6e56027f81",
            "blockNumber": "0x10",
            "gasUsed": "0x5208",
            "contractAddress": null,
            "status": "0x0"
        }"#;
        let receipt: TransactionReceipt = serde_json::from_str(json).unwrap();
        assert!(receipt.is_reverted());
        assert_eq!(receipt.block_number, Some(0x10u8.into()));

        let json = json.replace("\"0x0\"", "\"0x1\"");
        let receipt: TransactionReceipt = serde_json::from_str(&json).unwrap();
        assert!(!receipt.is_reverted());
    }

    #[test]
    fn syncing_status_both_forms() {
        let not_syncing: SyncingStatus = serde_json::from_str("false").unwrap();
        assert_eq!(not_syncing, SyncingStatus::NotSyncing(false));
        let syncing: SyncingStatus = serde_json::from_str(
            r#"{"startingBlock": "0x0", "currentBlock": "0x1", "highestBlock": "0x2"}"#,
        )
        .unwrap();
        assert!(matches!(syncing, SyncingStatus::Syncing { .. }));
    }
}
