#![warn(clippy::all)]
#![allow(clippy::pedantic)]

//! Uniswap V2/V3 broker library.
//!
//! Computes the exact trade required to move a constant-product pool to a
//! target price and executes it through the Uniswap routers, along with the
//! surrounding wiring a deployment needs: ERC-20 approvals, pool creation,
//! concentrated-liquidity provisioning, and a deployment registry.

#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

pub mod client;
mod erc20;
pub mod error;
pub mod jsonrpc;
pub mod market;
pub mod registry;
pub mod types;
pub mod uniswapv2;
pub mod uniswapv3;
