//! Funding-key wallet.
//!
//! Signs EIP-1559 transactions locally and returns their 2718 encoding,
//! ready for `eth_sendRawTransaction` or a bundle.

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::rpc::types::eth::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use anyhow::Result;
use secrecy::{ExposeSecret, SecretString};
use std::str::FromStr;

use crate::types::{EffectiveFee, SniperError};

/// Everything needed to sign one state-changing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub to: Address,
    pub input: Bytes,
    pub value: U256,
    pub nonce: u64,
    pub gas_limit: u64,
    pub fee: EffectiveFee,
}

/// A signed, encoded transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedAction {
    pub raw: Bytes,
    pub hash: B256,
    pub nonce: u64,
}

pub struct Wallet {
    signer: PrivateKeySigner,
    wallet: EthereumWallet,
    chain_id: u64,
}

impl Wallet {
    pub fn from_secret(key: &SecretString, chain_id: u64) -> Result<Self, SniperError> {
        let raw = key.expose_secret().trim();
        let signer = PrivateKeySigner::from_str(raw.strip_prefix("0x").unwrap_or(raw))
            .map_err(|e| SniperError::Signing(format!("invalid private key: {e}")))?;
        Ok(Self::from_signer(signer, chain_id))
    }

    /// A throwaway key; used for tests and dry runs.
    pub fn random(chain_id: u64) -> Self {
        Self::from_signer(PrivateKeySigner::random(), chain_id)
    }

    fn from_signer(signer: PrivateKeySigner, chain_id: u64) -> Self {
        let wallet = EthereumWallet::from(signer.clone());
        Self {
            signer,
            wallet,
            chain_id,
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub async fn sign(&self, action: &ActionRequest) -> Result<SignedAction, SniperError> {
        let mut tx = TransactionRequest::default()
            .with_to(action.to)
            .with_input(action.input.clone())
            .with_value(action.value)
            .with_chain_id(self.chain_id)
            .with_nonce(action.nonce)
            .with_gas_limit(action.gas_limit)
            .with_max_priority_fee_per_gas(action.fee.max_priority_fee_per_gas)
            .with_max_fee_per_gas(action.fee.max_fee_per_gas);
        tx.from = Some(self.address());

        let envelope = tx
            .build(&self.wallet)
            .await
            .map_err(|e| SniperError::Signing(e.to_string()))?;
        let raw = envelope.encoded_2718();
        let hash = keccak256(&raw);

        Ok(SignedAction {
            raw: raw.into(),
            hash,
            nonce: action.nonce,
        })
    }
}
