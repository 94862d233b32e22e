use anyhow::{anyhow, Result};
use log::debug;
use solana_sdk::{signature::Signature, transaction::Transaction};

pub struct TransactionValidator;

impl TransactionValidator {
    /// Reject transactions the batcher must never see.
    pub fn validate_transaction(transaction: &Transaction) -> Result<()> {
        // 1. check format of txn
        Self::validate_transaction_format(transaction)?;

        // 2. check txn signature
        Self::validate_signatures(transaction)?;

        debug!("Transaction validation completed successfully");
        Ok(())
    }

    fn validate_signatures(transaction: &Transaction) -> Result<()> {
        if transaction.signatures.is_empty() {
            return Err(anyhow!("Transaction has no signatures"));
        }

        for (i, signature) in transaction.signatures.iter().enumerate() {
            if signature == &Signature::default() {
                return Err(anyhow!("Signature {} is default/empty", i));
            }
        }
        transaction.verify()?;
        Ok(())
    }

    fn validate_transaction_format(transaction: &Transaction) -> Result<()> {
        let message = &transaction.message;

        if message.account_keys.is_empty() {
            return Err(anyhow!("Transaction has no account keys"));
        }

        if message.instructions.is_empty() {
            return Err(anyhow!("Transaction has no instructions"));
        }

        if transaction.signatures.len() != message.header.num_required_signatures as usize {
            return Err(anyhow!(
                "Signature count mismatch: expected {}, got {}",
                message.header.num_required_signatures,
                transaction.signatures.len()
            ));
        }
        Ok(())
    }
}
