pub mod feed;
pub mod health;
pub mod transaction;
pub mod utils;

// Fixed names inside the validator data folder.
pub static CONTRACT_FILE_NAME: &str = "l2os.bin";
pub static CHECKPOINT_DB_NAME: &str = "checkpoint_db";
pub static DEFAULT_WALLET_FILE_NAME: &str = "wallet.json";

// Public RPC ports (primary, secondary).
pub static RPC_PRIMARY_PORT: &str = "8547";
pub static RPC_SECONDARY_PORT: &str = "8548";
pub static DEFAULT_RPC_HOST: &str = "0.0.0.0";

pub static PROFILING_ADDR: &str = "127.0.0.1:8081";

pub static DEFAULT_FEED_OUTPUT_ADDR: &str = "0.0.0.0";
pub static DEFAULT_FEED_OUTPUT_PORT: &str = "9642";
