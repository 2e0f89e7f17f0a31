//! Calldata encoding and signed transaction submission

use super::nonce::NonceManager;
use super::ChainProvider;
use crate::collaborators::ContractCall;
use crate::error::{OrchestratorError, OrchestratorResult};

use ethers::abi::{self, Token};
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use sha3::{Digest, Keccak256};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// First four bytes of the keccak hash of a function signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = Keccak256::digest(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn uuid_word(id: &Uuid) -> Token {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(id.as_bytes());
    Token::FixedBytes(word.to_vec())
}

fn hex_bytes(field: &str, raw: &str) -> OrchestratorResult<Vec<u8>> {
    hex::decode(raw.trim_start_matches("0x"))
        .map_err(|e| OrchestratorError::InvalidArgument(format!("{} is not hex: {}", field, e)))
}

fn hex_word(field: &str, raw: &str) -> OrchestratorResult<Token> {
    let bytes = hex_bytes(field, raw)?;
    if bytes.len() != 32 {
        return Err(OrchestratorError::InvalidArgument(format!(
            "{} must be 32 bytes, got {}",
            field,
            bytes.len()
        )));
    }
    Ok(Token::FixedBytes(bytes))
}

fn address(field: &str, raw: &str) -> OrchestratorResult<Address> {
    raw.parse::<Address>()
        .map_err(|e| OrchestratorError::InvalidArgument(format!("{} is not an address: {}", field, e)))
}

fn with_selector(signature: &str, tokens: &[Token]) -> Bytes {
    let mut data = selector(signature).to_vec();
    data.extend(abi::encode(tokens));
    Bytes::from(data)
}

/// A call resolved to its destination, value and calldata
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedCall {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

/// Resolve a contract call against the chain's configured contracts
pub fn encode_call(provider: &ChainProvider, call: &ContractCall) -> OrchestratorResult<EncodedCall> {
    match call {
        ContractCall::SubmitCommitment {
            checkbook_id,
            commitment,
            proof,
        } => Ok(EncodedCall {
            to: address("settlement contract", provider.settlement_address())?,
            value: U256::zero(),
            data: with_selector(
                "submitCommitment(bytes32,bytes32,bytes)",
                &[
                    uuid_word(checkbook_id),
                    hex_word("commitment", commitment)?,
                    Token::Bytes(hex_bytes("proof", proof)?),
                ],
            ),
        }),
        ContractCall::ExecuteWithdraw {
            request_id,
            proof,
            public_values,
        } => Ok(EncodedCall {
            to: address("settlement contract", provider.settlement_address())?,
            value: U256::zero(),
            data: with_selector(
                "executeWithdraw(bytes32,bytes,bytes)",
                &[
                    uuid_word(request_id),
                    Token::Bytes(hex_bytes("proof", proof)?),
                    Token::Bytes(hex_bytes("public values", public_values)?),
                ],
            ),
        }),
        ContractCall::FallbackTransfer {
            request_id,
            beneficiary,
            token,
            amount,
        } => Ok(EncodedCall {
            to: address("treasury contract", provider.treasury_address())?,
            value: U256::zero(),
            data: with_selector(
                "fallbackTransfer(bytes32,address,address,uint256)",
                &[
                    uuid_word(request_id),
                    Token::Address(address("beneficiary", beneficiary)?),
                    Token::Address(address("token", token)?),
                    Token::Uint(*amount),
                ],
            ),
        }),
        ContractCall::ExecuteHook {
            request_id,
            beneficiary,
            calldata,
        } => Ok(EncodedCall {
            to: address("treasury contract", provider.treasury_address())?,
            value: U256::zero(),
            data: with_selector(
                "executeHook(bytes32,address,bytes)",
                &[
                    uuid_word(request_id),
                    Token::Address(address("beneficiary", beneficiary)?),
                    Token::Bytes(calldata.encode()),
                ],
            ),
        }),
        ContractCall::ExecuteProposal {
            multisig,
            target,
            value,
            call_data,
            ..
        } => Ok(EncodedCall {
            to: address("multisig", multisig)?,
            value: U256::zero(),
            data: with_selector(
                "execTransaction(address,uint256,bytes)",
                &[
                    Token::Address(address("target contract", target)?),
                    Token::Uint(*value),
                    Token::Bytes(hex_bytes("call data", call_data)?),
                ],
            ),
        }),
    }
}

/// Signs with the orchestrator account and broadcasts
pub struct TransactionSubmitter {
    wallet: LocalWallet,
    nonce_manager: NonceManager,
}

impl TransactionSubmitter {
    pub fn new(wallet: LocalWallet) -> Self {
        let nonce_manager = NonceManager::new(wallet.address());
        info!("Transaction submitter initialized with wallet: {:?}", wallet.address());
        Self {
            wallet,
            nonce_manager,
        }
    }

    /// Load the signing key from `RELAYER_PRIVATE_KEY`
    pub fn from_env() -> OrchestratorResult<Self> {
        let key = std::env::var("RELAYER_PRIVATE_KEY").map_err(|_| {
            OrchestratorError::Config("RELAYER_PRIVATE_KEY is not set".to_string())
        })?;
        let wallet = key
            .parse::<LocalWallet>()
            .map_err(|e| OrchestratorError::Config(format!("Invalid private key: {}", e)))?;
        Ok(Self::new(wallet))
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Build, sign and broadcast a call. Returns the transaction hash.
    pub async fn submit(&self, provider: &ChainProvider, call: &ContractCall) -> OrchestratorResult<H256> {
        let chain_id = provider.chain_id();
        let encoded = encode_call(provider, call)?;
        let nonce = self.nonce_manager.next_nonce(provider).await?;

        match self.sign_and_send(provider, &encoded, nonce).await {
            Ok(tx_hash) => {
                info!(
                    "Submitted {} on chain {}: {:?} (nonce {})",
                    call.name(),
                    chain_id,
                    tx_hash,
                    nonce
                );
                Ok(tx_hash)
            }
            Err(e) => {
                let message = e.to_string();
                if message.contains("nonce too low") || message.contains("already known") {
                    warn!("Nonce conflict on chain {}, resyncing", chain_id);
                    self.nonce_manager.resync(chain_id).await;
                } else {
                    self.nonce_manager.release(chain_id, nonce).await;
                }
                Err(e)
            }
        }
    }

    async fn sign_and_send(
        &self,
        provider: &ChainProvider,
        encoded: &EncodedCall,
        nonce: u64,
    ) -> OrchestratorResult<H256> {
        let chain_id = provider.chain_id();
        let request = TransactionRequest::new()
            .from(self.wallet.address())
            .to(encoded.to)
            .value(encoded.value)
            .data(encoded.data.clone())
            .nonce(nonce)
            .chain_id(chain_id);
        let mut tx = TypedTransaction::Legacy(request);

        let gas_limit = provider.estimate_gas(&tx).await?;
        // 20% headroom over the estimate
        tx.set_gas(gas_limit * 12 / 10);
        tx.set_gas_price(provider.get_gas_price().await?);

        let wallet = self.wallet.clone().with_chain_id(chain_id);
        let signature = wallet.sign_transaction(&tx).await.map_err(|e| OrchestratorError::Chain {
            chain_id,
            message: format!("signing failed: {}", e),
        })?;
        let raw = tx.rlp_signed(&signature);

        match timeout(SEND_TIMEOUT, provider.send_raw_transaction(raw)).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::Chain {
                chain_id,
                message: "transaction send timed out".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matches_known_erc20_transfer() {
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn uuid_is_right_aligned_in_word() {
        let id = Uuid::new_v4();
        match uuid_word(&id) {
            Token::FixedBytes(bytes) => {
                assert_eq!(bytes.len(), 32);
                assert!(bytes[..16].iter().all(|b| *b == 0));
                assert_eq!(&bytes[16..], id.as_bytes());
            }
            other => panic!("unexpected token {:?}", other),
        }
    }

    #[test]
    fn commitment_must_be_a_word() {
        assert!(hex_word("commitment", "0x1234").is_err());
        assert!(hex_word("commitment", &format!("0x{}", "ab".repeat(32))).is_ok());
    }
}
