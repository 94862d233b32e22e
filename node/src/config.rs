use clap::{Args, Parser};
use share::{
    CHECKPOINT_DB_NAME, CONTRACT_FILE_NAME, DEFAULT_FEED_OUTPUT_ADDR, DEFAULT_FEED_OUTPUT_PORT,
};
use solana_sdk::pubkey::Pubkey;
use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::error::{NodeError, NodeResult};

pub const WALLET_ARGS: &str = "[--wallet.keypair=<keypair file>]";
pub const ROLLUP_ARGS: &str = "<validator_folder> <l1_url> <rollup_address>";

#[derive(Parser, Debug, Clone)]
#[command(name = "rollup-node", about = "Rollup node: batcher, feed relay and public RPC", version)]
pub struct Cli {
    /// Enable pending state tracking.
    #[arg(long, env = "ROLLUP_NODE_PENDING")]
    pub pending: bool,

    /// Act as sequencer.
    #[arg(long, env = "ROLLUP_NODE_SEQUENCER")]
    pub sequencer: bool,

    /// Wait to catch up to the chain before opening the RPC.
    #[arg(long, env = "ROLLUP_NODE_WAIT_TO_CATCH_UP")]
    pub wait_to_catch_up: bool,

    /// Delay before sequencing delayed messages.
    #[arg(long, default_value_t = 12, env = "ROLLUP_NODE_DELAYED_MESSAGES_TARGET_DELAY")]
    pub delayed_messages_target_delay: u64,

    /// Disable checking the health of the primary.
    #[arg(long)]
    pub disable_primary_check: bool,

    /// Disable checking the health of the L1 node.
    #[arg(long)]
    pub disable_l1_check: bool,

    /// Enable prometheus endpoint.
    #[arg(long, env = "ROLLUP_NODE_METRICS")]
    pub metrics: bool,

    /// Address to bind the healthcheck RPC to.
    #[arg(long, default_value = "", env = "ROLLUP_NODE_HEALTHCHECK_RPC")]
    pub healthcheck_rpc: String,

    /// Maximum batch accumulation time, in seconds.
    #[arg(long, alias = "maxBatchTime", default_value_t = 10, value_name = "SECONDS")]
    pub max_batch_time: u64,

    /// Address of the inbox program.
    #[arg(long, env = "ROLLUP_NODE_INBOX")]
    pub inbox: Option<String>,

    /// URL of another node to send transactions through.
    #[arg(long, env = "ROLLUP_NODE_FORWARD_URL")]
    pub forward_url: Option<String>,

    /// URL of sequencer feed source.
    #[arg(long, env = "ROLLUP_NODE_SEQUENCER_URL")]
    pub sequencer_url: Option<String>,

    /// Address to bind the relay feed output to.
    #[arg(long = "feedoutput.addr", default_value = DEFAULT_FEED_OUTPUT_ADDR)]
    pub feed_output_addr: String,

    /// Port to bind the relay feed output to.
    #[arg(long = "feedoutput.port", default_value = DEFAULT_FEED_OUTPUT_PORT)]
    pub feed_output_port: String,

    /// Number of seconds for ping interval.
    #[arg(long = "feedoutput.ping", default_value_t = 5, value_name = "SECONDS")]
    pub feed_output_ping: u64,

    /// Number of seconds for timeout.
    #[arg(long = "feedoutput.timeout", default_value_t = 15, value_name = "SECONDS")]
    pub feed_output_timeout: u64,

    /// Enable profiling server.
    #[arg(long)]
    pub pprof: bool,

    #[command(flatten)]
    pub wallet: WalletArgs,

    #[command(flatten)]
    pub log: LogArgs,

    /// <validator_folder> <l1_url> <rollup_address>
    #[arg(num_args = 0.., value_name = "ARGS")]
    pub positional: Vec<String>,
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct WalletArgs {
    /// Keypair file used to sign batches; defaults to <validator_folder>/wallet.json.
    #[arg(long = "wallet.keypair", env = "ROLLUP_NODE_WALLET_KEYPAIR")]
    pub keypair: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct LogArgs {
    /// Default log filter, RUST_LOG takes precedence.
    #[arg(long = "log.level", default_value = "info")]
    pub level: String,
}

impl Default for LogArgs {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

/// Health check switches forwarded to the health reporter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSettings {
    pub metrics: bool,
    pub disable_primary_check: bool,
    pub disable_l1_check: bool,
    pub rpc_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedOutputSettings {
    pub addr: String,
    pub port: String,
    pub ping_interval: Duration,
    pub timeout: Duration,
}

/// Resolved, immutable node configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub sequencer: bool,
    pub keep_pending_state: bool,
    pub wait_to_catch_up: bool,
    pub delayed_messages_target_delay: u64,
    pub max_batch_time: Duration,
    pub inbox_address: Option<Pubkey>,
    pub forward_url: Option<String>,
    pub sequencer_url: Option<String>,
    pub feed_output: FeedOutputSettings,
    pub health: HealthSettings,
    pub enable_pprof: bool,
    pub validator_folder: PathBuf,
    pub l1_url: String,
    pub rollup_address: Pubkey,
    pub contract_file: PathBuf,
    pub checkpoint_db: PathBuf,
    pub wallet: WalletArgs,
    pub log: LogArgs,
}

impl NodeConfig {
    /// Validate parsed flags and derive paths. Performs no I/O.
    pub fn resolve(cli: Cli) -> NodeResult<Self> {
        let forward_url = cli.forward_url.filter(|url| !url.is_empty());
        let sequencer_url = cli.sequencer_url.filter(|url| !url.is_empty());
        let inbox = cli.inbox.filter(|addr| !addr.is_empty());

        if cli.positional.len() != 3 || (!cli.sequencer && sequencer_url.is_none()) {
            print_usage();
            return Err(NodeError::Configuration("invalid arguments".to_owned()));
        }
        if !cli.sequencer && forward_url.is_none() && inbox.is_none() {
            print_usage();
            return Err(NodeError::Configuration(
                "must submit inbox address via --inbox if not running in forwarder or sequencer mode"
                    .to_owned(),
            ));
        }

        let inbox_address = inbox.as_deref().map(|s| parse_address("inbox", s)).transpose()?;
        let validator_folder = PathBuf::from(&cli.positional[0]);
        let l1_url = cli.positional[1].clone();
        let rollup_address = parse_address("rollup", &cli.positional[2])?;

        Ok(Self {
            sequencer: cli.sequencer,
            keep_pending_state: cli.pending,
            wait_to_catch_up: cli.wait_to_catch_up,
            delayed_messages_target_delay: cli.delayed_messages_target_delay,
            max_batch_time: Duration::from_secs(cli.max_batch_time),
            inbox_address,
            forward_url,
            sequencer_url,
            feed_output: FeedOutputSettings {
                addr: cli.feed_output_addr,
                port: cli.feed_output_port,
                ping_interval: Duration::from_secs(cli.feed_output_ping),
                timeout: Duration::from_secs(cli.feed_output_timeout),
            },
            health: HealthSettings {
                metrics: cli.metrics,
                disable_primary_check: cli.disable_primary_check,
                disable_l1_check: cli.disable_l1_check,
                rpc_addr: cli.healthcheck_rpc,
            },
            enable_pprof: cli.pprof,
            contract_file: validator_folder.join(CONTRACT_FILE_NAME),
            checkpoint_db: validator_folder.join(CHECKPOINT_DB_NAME),
            validator_folder,
            l1_url,
            rollup_address,
            wallet: cli.wallet,
            log: cli.log,
        })
    }

    /// Whether this node subscribes to an upstream sequencer feed.
    pub fn subscribes_to_feed(&self) -> bool {
        !self.sequencer && self.sequencer_url.is_some()
    }
}

/// Parse command line arguments (including the program name) into a configuration.
pub fn parse_args<I, T>(args: I) -> NodeResult<NodeConfig>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = Cli::try_parse_from(args).map_err(|e| {
        println!("{}", e);
        NodeError::Configuration("error parsing arguments".to_owned())
    })?;
    NodeConfig::resolve(cli)
}

fn parse_address(name: &str, value: &str) -> NodeResult<Pubkey> {
    Pubkey::from_str(value)
        .map_err(|e| NodeError::Configuration(format!("invalid {} address {:?}: {}", name, value, e)))
}

fn print_usage() {
    println!(
        "usage      sequencer: rollup-node --sequencer [optional arguments] {} {}",
        WALLET_ARGS, ROLLUP_ARGS
    );
    println!(
        "   or   primary node: rollup-node --sequencer-url=<feed url> --inbox=<inbox address> [optional arguments] {} {}",
        WALLET_ARGS, ROLLUP_ARGS
    );
    println!(
        "   or secondary node: rollup-node --sequencer-url=<feed url> --forward-url=<node url> [optional arguments] {} {}",
        WALLET_ARGS, ROLLUP_ARGS
    );
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const ROLLUP: &str = "9RrUP9zNimDPVeoP47zJAAMnWahf7geUuWgcv3XMCzGq";
    pub(crate) const INBOX: &str = "C5bPpisqFtj8oCUd6MFi648pZhpXXVLm1qmvtj21iS3Y";

    pub(crate) fn args(extra: &[&str]) -> Vec<String> {
        let mut v = vec!["rollup-node".to_owned()];
        v.extend(extra.iter().map(|s| s.to_string()));
        v.extend(
            ["/tmp/validator", "http://127.0.0.1:8899", ROLLUP]
                .iter()
                .map(|s| s.to_string()),
        );
        v
    }

    #[test]
    fn sequencer_defaults() {
        let config = parse_args(args(&["--sequencer"])).unwrap();
        assert!(config.sequencer);
        assert_eq!(config.delayed_messages_target_delay, 12);
        assert_eq!(config.max_batch_time, Duration::from_secs(10));
        assert_eq!(config.feed_output.addr, "0.0.0.0");
        assert_eq!(config.feed_output.port, "9642");
        assert_eq!(config.feed_output.ping_interval, Duration::from_secs(5));
        assert_eq!(config.feed_output.timeout, Duration::from_secs(15));
        assert_eq!(config.contract_file, PathBuf::from("/tmp/validator/l2os.bin"));
        assert_eq!(config.checkpoint_db, PathBuf::from("/tmp/validator/checkpoint_db"));
        assert_eq!(config.rollup_address.to_string(), ROLLUP);
        assert!(!config.subscribes_to_feed());
    }

    #[test]
    fn requires_exactly_three_positional_args() {
        let err = parse_args(["rollup-node", "--sequencer", "/tmp/validator"]).unwrap_err();
        assert!(matches!(err, NodeError::Configuration(_)));

        let mut too_many = args(&["--sequencer"]);
        too_many.push("extra".to_owned());
        assert!(matches!(
            parse_args(too_many).unwrap_err(),
            NodeError::Configuration(_)
        ));
    }

    #[test]
    fn non_sequencer_needs_feed_url() {
        let err = parse_args(args(&["--inbox", INBOX])).unwrap_err();
        assert!(matches!(err, NodeError::Configuration(_)));
    }

    #[test]
    fn non_sequencer_without_feed_or_inbox_is_rejected() {
        let err = parse_args(args(&[])).unwrap_err();
        assert!(matches!(err, NodeError::Configuration(_)));
    }

    #[test]
    fn primary_node_needs_inbox_unless_forwarding() {
        let err = parse_args(args(&["--sequencer-url", "ws://seq:9642"])).unwrap_err();
        assert!(matches!(err, NodeError::Configuration(_)));

        let config = parse_args(args(&[
            "--sequencer-url",
            "ws://seq:9642",
            "--inbox",
            INBOX,
            "--pending",
        ]))
        .unwrap();
        assert_eq!(config.inbox_address.unwrap().to_string(), INBOX);
        assert!(config.keep_pending_state);
        assert!(config.subscribes_to_feed());

        let config = parse_args(args(&[
            "--sequencer-url",
            "ws://seq:9642",
            "--forward-url",
            "http://x",
        ]))
        .unwrap();
        assert_eq!(config.forward_url.as_deref(), Some("http://x"));
    }

    #[test]
    fn bad_addresses_are_configuration_errors() {
        let err = parse_args([
            "rollup-node",
            "--sequencer",
            "/tmp/validator",
            "http://127.0.0.1:8899",
            "not-base58!",
        ])
        .unwrap_err();
        assert!(matches!(err, NodeError::Configuration(_)));

        let err = parse_args(args(&["--sequencer-url", "ws://s", "--inbox", "0xdead"])).unwrap_err();
        assert!(matches!(err, NodeError::Configuration(_)));
    }

    #[test]
    fn legacy_batch_time_flag_and_feed_output() {
        let config = parse_args(args(&[
            "--sequencer",
            "--maxBatchTime",
            "3",
            "--feedoutput.port",
            "9700",
            "--feedoutput.ping",
            "1",
        ]))
        .unwrap();
        assert_eq!(config.max_batch_time, Duration::from_secs(3));
        assert_eq!(config.feed_output.port, "9700");
        assert_eq!(config.feed_output.ping_interval, Duration::from_secs(1));
    }
}
