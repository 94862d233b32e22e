use anyhow::anyhow;
use log::info;
use share::DEFAULT_WALLET_FILE_NAME;
use solana_sdk::{
    pubkey::Pubkey,
    signature::{read_keypair_file, Keypair},
    signer::Signer,
};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::config::WalletArgs;
use crate::error::{NodeError, NodeResult};

/// Signs feed payloads broadcast by the sequencer.
pub type DataSigner = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Batch-submitting identity.
#[derive(Clone)]
pub struct Identity {
    pubkey: Pubkey,
    keypair: Arc<Keypair>,
}

impl Identity {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            pubkey: keypair.pubkey(),
            keypair: Arc::new(keypair),
        }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.pubkey
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn data_signer(&self) -> DataSigner {
        let keypair = self.keypair.clone();
        Arc::new(move |data: &[u8]| keypair.sign_message(data).as_ref().to_vec())
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.pubkey == other.pubkey
    }
}

impl Eq for Identity {}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity").field("pubkey", &self.pubkey).finish()
    }
}

/// Load the signing identity from the configured keypair file.
pub fn load_identity(validator_folder: &Path, args: &WalletArgs) -> NodeResult<Identity> {
    let path = args
        .keypair
        .clone()
        .unwrap_or_else(|| validator_folder.join(DEFAULT_WALLET_FILE_NAME));
    let keypair = read_keypair_file(&path).map_err(|e| {
        NodeError::Wallet(anyhow!(
            "error reading keypair {}: {}",
            path.display(),
            e
        ))
    })?;
    let identity = Identity::new(keypair);
    info!("Loaded batch submitter identity {}", identity.pubkey());
    Ok(identity)
}
