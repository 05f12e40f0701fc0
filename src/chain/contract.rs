//! ABI surface of the Prometheans mint contract and its safe-mint wrapper.
//!
//! Only the calls and the event the sniper touches are declared.

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent};
use anyhow::Result;
use std::sync::Arc;

use super::{CallRequest, ChainClient, RawLog};
use crate::types::{ActionEvent, SniperError, Tick};

sol! {
    interface IPrometheans {
        function currentEmber() external view returns (uint256);
        function mint() external payable;
        event Minted(address indexed minter, uint256 indexed tokenId, uint256 blockNumber, uint256 ember);
    }

    interface IPrometheansSafeMint {
        function mint(uint256 desiredEmber) external payable;
        function mintTo(uint256 desiredEmber, address to) external payable;
    }
}

/// Calldata for `mint()`.
pub fn mint_calldata() -> Bytes {
    IPrometheans::mintCall {}.abi_encode().into()
}

/// Calldata for the safe-mint wrapper's `mintTo`, which reverts unless the
/// ember at execution time equals `desired_ember`.
pub fn mint_to_calldata(desired_ember: u64, to: Address) -> Bytes {
    IPrometheansSafeMint::mintToCall {
        desiredEmber: U256::from(desired_ember),
        to,
    }
    .abi_encode()
    .into()
}

/// Whether `input` is a call to the mint contract's `mint()`.
pub fn is_mint_call(input: &[u8]) -> bool {
    input.len() >= 4 && input[..4] == IPrometheans::mintCall::SELECTOR
}

/// First topic of every `Minted` log.
pub fn minted_topic() -> B256 {
    IPrometheans::Minted::SIGNATURE_HASH
}

/// Decode a `Minted` log.
///
/// Indexed and non-indexed parameters are read as one ordered word list
/// (`topics[1..]` followed by the data words), so the decoder does not
/// depend on which leading parameters the deployed contract indexes.
pub fn decode_minted(log: &RawLog) -> Result<ActionEvent, SniperError> {
    if log.topics.first() != Some(&minted_topic()) {
        return Err(SniperError::Decode("not a Minted log".into()));
    }
    let mut words: Vec<B256> = log.topics[1..].to_vec();
    words.extend(log.data.chunks(32).filter(|c| c.len() == 32).map(B256::from_slice));
    if words.len() != 4 {
        return Err(SniperError::Decode(format!(
            "Minted log has {} words, expected 4",
            words.len()
        )));
    }

    let tx_hash = log
        .tx_hash
        .ok_or_else(|| SniperError::Decode("Minted log without transaction hash".into()))?;

    Ok(ActionEvent {
        minter: Address::from_word(words[0]),
        token_id: U256::from_be_bytes(words[1].0),
        tick: word_to_u64(words[2], "blockNumber")?,
        condition: word_to_u64(words[3], "ember")?,
        tx_hash,
    })
}

/// Encode an event the way the contract emits it (minter and token id
/// indexed). Used by in-memory chains.
pub fn encode_minted(contract: Address, event: &ActionEvent, block: Tick) -> RawLog {
    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(&U256::from(event.tick).to_be_bytes::<32>());
    data.extend_from_slice(&U256::from(event.condition).to_be_bytes::<32>());
    RawLog {
        address: contract,
        topics: vec![
            minted_topic(),
            event.minter.into_word(),
            B256::from(event.token_id.to_be_bytes::<32>()),
        ],
        data: data.into(),
        block_number: Some(block),
        tx_hash: Some(event.tx_hash),
    }
}

fn word_to_u64(word: B256, field: &str) -> Result<u64, SniperError> {
    let value = U256::from_be_bytes(word.0);
    if value > U256::from(u64::MAX) {
        return Err(SniperError::Decode(format!("{field} out of range: {value}")));
    }
    Ok(value.to::<u64>())
}

/// Read-side handle on the mint contract.
#[derive(Clone)]
pub struct EmberContract {
    chain: Arc<dyn ChainClient>,
    address: Address,
}

impl EmberContract {
    pub fn new(chain: Arc<dyn ChainClient>, address: Address) -> Self {
        Self { chain, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// `currentEmber()` as of `tick`.
    pub async fn current_ember(&self, tick: Tick) -> Result<u64> {
        let request = CallRequest::new(self.address, IPrometheans::currentEmberCall {}.abi_encode());
        let out = self.chain.call(&request, Some(tick)).await?;
        if out.len() < 32 {
            return Err(SniperError::Decode(format!(
                "currentEmber returned {} bytes",
                out.len()
            ))
            .into());
        }
        Ok(word_to_u64(B256::from_slice(&out[..32]), "currentEmber")?)
    }

    /// The request used for the one-off gas estimate of `mint()`.
    pub fn mint_request(&self, from: Address) -> CallRequest {
        CallRequest::new(self.address, mint_calldata()).from(from)
    }
}

/// Which function an `eth_call` payload targets. In-memory chains use this
/// to answer reads.
pub fn is_current_ember_call(input: &[u8]) -> bool {
    input.len() >= 4 && input[..4] == IPrometheans::currentEmberCall::SELECTOR
}
