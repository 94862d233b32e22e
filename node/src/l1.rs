use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    hash::Hash,
    instruction::Instruction,
    packet::PACKET_DATA_SIZE,
    pubkey::Pubkey,
    signature::{Keypair, Signature},
    signer::Signer,
    transaction::Transaction,
};
use std::sync::Arc;

use crate::error::{NodeError, NodeResult};

// Discriminator prefixed to batch payloads posted to an inbox program.
const SUBMIT_BATCH_DISCRIMINATOR: [u8; 8] = [27, 234, 100, 224, 134, 31, 168, 142];

// Signature, header, payer and program keys, blockhash, one instruction and its discriminator.
const BATCH_TRANSACTION_OVERHEAD: usize = 178;

/// Largest batch payload that still fits a single L1 transaction packet.
pub const MAX_BATCH_PAYLOAD: usize = PACKET_DATA_SIZE - BATCH_TRANSACTION_OVERHEAD;

/// Read/submit surface of the settlement chain shared by every stage of the node.
#[async_trait]
pub trait L1Client: Send + Sync {
    /// Identifier of the connected chain.
    async fn chain_id(&self) -> Result<String>;

    async fn balance(&self, account: &Pubkey) -> Result<u64>;

    async fn latest_slot(&self) -> Result<u64>;

    /// Post a batch payload to `program`, signed and paid for by `signer`.
    async fn submit_batch(&self, program: &Pubkey, payload: Vec<u8>, signer: &Keypair)
        -> Result<Signature>;

    /// Upper bound on the payload accepted by `submit_batch`.
    fn max_batch_payload(&self) -> usize {
        MAX_BATCH_PAYLOAD
    }
}

/// Opens L1 clients; swapped out in tests to count connection attempts.
#[async_trait]
pub trait L1Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn L1Client>>;
}

pub struct SolanaL1Client {
    client: RpcClient,
}

impl SolanaL1Client {
    pub fn new(rpc_url: String) -> Self {
        let client = RpcClient::new_with_commitment(rpc_url, CommitmentConfig::confirmed());
        Self { client }
    }
}

#[async_trait]
impl L1Client for SolanaL1Client {
    async fn chain_id(&self) -> Result<String> {
        let genesis = self.client.get_genesis_hash().await?;
        Ok(genesis.to_string())
    }

    async fn balance(&self, account: &Pubkey) -> Result<u64> {
        Ok(self.client.get_balance(account).await?)
    }

    async fn latest_slot(&self) -> Result<u64> {
        Ok(self.client.get_slot().await?)
    }

    async fn submit_batch(
        &self,
        program: &Pubkey,
        payload: Vec<u8>,
        signer: &Keypair,
    ) -> Result<Signature> {
        if payload.len() > MAX_BATCH_PAYLOAD {
            return Err(anyhow!(
                "batch payload of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_BATCH_PAYLOAD
            ));
        }
        let recent_blockhash = self.client.get_latest_blockhash().await?;
        let transaction = batch_transaction(program, &payload, signer, recent_blockhash);
        let signature = self
            .client
            .send_and_confirm_transaction(&transaction)
            .await?;
        debug!("Batch transaction confirmed: {}", signature);
        Ok(signature)
    }
}

fn batch_transaction(
    program: &Pubkey,
    payload: &[u8],
    signer: &Keypair,
    recent_blockhash: Hash,
) -> Transaction {
    let mut data = SUBMIT_BATCH_DISCRIMINATOR.to_vec();
    data.extend_from_slice(payload);
    let instruction = Instruction {
        program_id: *program,
        accounts: vec![],
        data,
    };
    Transaction::new_signed_with_payer(
        &[instruction],
        Some(&signer.pubkey()),
        &[signer],
        recent_blockhash,
    )
}

pub struct SolanaConnector;

#[async_trait]
impl L1Connector for SolanaConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn L1Client>> {
        Ok(Arc::new(SolanaL1Client::new(url.to_owned())))
    }
}

/// Open the L1 connection and query the chain identifier exactly once.
pub async fn connect_l1(
    connector: &dyn L1Connector,
    url: &str,
) -> NodeResult<(Arc<dyn L1Client>, String)> {
    let client = connector
        .connect(url)
        .await
        .context("error creating L1 RPC client")
        .map_err(NodeError::Connection)?;
    let chain_id = client
        .chain_id()
        .await
        .context("error getting chain ID")
        .map_err(NodeError::Connection)?;
    info!("Connected to L1 chain {} at {}", chain_id, url);
    Ok((client, chain_id))
}
