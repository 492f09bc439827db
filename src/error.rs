use awc::error::SendRequestError as ActixError;
use clarity::Error as ClarityError;
use clarity::Uint256;
use std::error::Error;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result;
use std::num::ParseIntError;
use std::time::Duration;
use tokio::time::error::Elapsed;

#[derive(Debug)]
pub enum BrokerError {
    /// Non-positive reserves, target price, or fee handed to the trade
    /// math, rejected before anything touches the chain
    InvalidInput(String),
    /// An intermediate product exceeded 256 bits
    Overflow(String),
    /// The transaction entered a block but executed with status 0
    TransactionReverted(String),
    BadResponse(String),
    BadInput(String),
    FailedToSend(ActixError),
    JsonRpcError {
        code: i64,
        message: String,
        data: String,
    },
    InsufficientGas {
        balance: Uint256,
        base_gas: Uint256,
        gas_required: Uint256,
    },
    ClarityError(ClarityError),
    ContractCallError(String),
    TransactionTimeout,
    NoBlockProduced {
        time: Duration,
    },
    SyncingNode(String),
    PreLondon,
}

impl From<ParseIntError> for BrokerError {
    fn from(error: ParseIntError) -> Self {
        BrokerError::BadResponse(format!("{error}"))
    }
}

impl From<ClarityError> for BrokerError {
    fn from(error: ClarityError) -> Self {
        BrokerError::ClarityError(error)
    }
}

impl From<Elapsed> for BrokerError {
    fn from(_error: Elapsed) -> Self {
        BrokerError::TransactionTimeout
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(error: serde_json::Error) -> Self {
        BrokerError::BadResponse(format!("{error}"))
    }
}

impl Display for BrokerError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        match self {
            BrokerError::InvalidInput(val) => write!(f, "Invalid broker input {val}"),
            BrokerError::Overflow(val) => write!(f, "Arithmetic overflow {val}"),
            BrokerError::TransactionReverted(val) => {
                write!(f, "Transaction reverted on chain {val}")
            }
            BrokerError::BadResponse(val) => write!(f, "Broker bad response {val}"),
            BrokerError::BadInput(val) => write!(f, "Broker bad input {val}"),
            BrokerError::FailedToSend(val) => write!(f, "Broker failed to send {val}"),
            BrokerError::ClarityError(val) => write!(f, "ClarityError {val}"),
            BrokerError::TransactionTimeout => write!(f, "Transaction did not enter chain in time"),
            BrokerError::NoBlockProduced { time } => {
                write!(
                    f,
                    "No Ethereum block was produced for {} seconds",
                    time.as_secs()
                )
            }
            BrokerError::InsufficientGas {
                balance,
                base_gas,
                gas_required,
            } => {
                write!(f, "Block has base_fee_per_gas {} and transaction requires {} gas. Your balance of {} < {}. Transaction impossible",
            base_gas, gas_required, balance, *base_gas * *gas_required)
            }
            BrokerError::ContractCallError(val) => {
                write!(f, "Error performing Ethereum contract call {val}")
            }
            BrokerError::JsonRpcError {
                code,
                message,
                data,
            } => write!(
                f,
                "Broker response error code {code} message {message} data {data:?}"
            ),
            BrokerError::SyncingNode(val) => {
                write!(f, "Broker node is syncing {val}")
            }
            BrokerError::PreLondon => {
                write!(f, "Broker sends EIP1559 transactions but the connected chain does not support them!")
            }
        }
    }
}

impl Error for BrokerError {}
