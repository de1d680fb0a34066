use std::path::PathBuf;

/// Runtime configuration. Defaults are usable as-is; every knob can be
/// overridden through `TRAWLER_*` environment variables.
#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: PathBuf,

    // Crawler
    pub dht_port: u16,
    pub bootstrap_hosts: Vec<String>,
    pub max_queries_per_second: u32,
    pub max_seen_nodes: usize,
    pub min_nodes_for_warm_start: usize,
    pub node_save_period_secs: u64,
    pub max_nodes_to_save: usize,
    pub recv_buffer_bytes: usize,
    pub rebootstrap_backoff_secs: u64,

    // Pipeline; 0 means unbounded.
    pub max_pipeline_depth: usize,

    // Fetcher
    pub max_concurrent_fetches: usize,
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,

    // Swarm
    pub tcp_listen_port: u16,
    pub lookup_deadline_secs: u64,
    pub lookup_inflight: usize,
    pub lookup_max_queries: usize,
    pub lookup_recv_timeout_ms: u64,
    pub max_peers_per_session: usize,
    pub metadata_peers_inflight: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),

            dht_port: 6881,
            bootstrap_hosts: vec![
                "router.bittorrent.com:6881".to_string(),
                "dht.transmissionbt.com:6881".to_string(),
                "router.utorrent.com:6881".to_string(),
            ],
            max_queries_per_second: 200,
            max_seen_nodes: 100_000,
            min_nodes_for_warm_start: 50,
            node_save_period_secs: 60,
            max_nodes_to_save: 500,
            recv_buffer_bytes: 1024 * 1024,
            rebootstrap_backoff_secs: 5,

            max_pipeline_depth: 0,

            max_concurrent_fetches: 50,
            timeout_secs: 15,
            poll_interval_ms: 500,

            tcp_listen_port: 55555,
            lookup_deadline_secs: 8,
            lookup_inflight: 8,
            lookup_max_queries: 64,
            lookup_recv_timeout_ms: 250,
            max_peers_per_session: 40,
            metadata_peers_inflight: 6,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // If a .env file exists, load it. If not, keep going.
        // Precedence: process env > .env > code defaults.
        let _ = dotenvy::dotenv();
        Ok(Self::from_env(Self::default()))
    }

    fn from_env(defaults: Self) -> Self {
        Self {
            data_dir: env_pathbuf("TRAWLER_DATA_DIR", defaults.data_dir),

            dht_port: env_u16("TRAWLER_DHT_PORT", defaults.dht_port),
            bootstrap_hosts: env_csv_strings("TRAWLER_BOOTSTRAP", defaults.bootstrap_hosts),
            max_queries_per_second: env_u32("TRAWLER_MAX_QPS", defaults.max_queries_per_second)
                .max(1),
            max_seen_nodes: env_usize("TRAWLER_MAX_SEEN_NODES", defaults.max_seen_nodes),
            min_nodes_for_warm_start: env_usize(
                "TRAWLER_MIN_NODES_FOR_WARM_START",
                defaults.min_nodes_for_warm_start,
            ),
            node_save_period_secs: env_u64(
                "TRAWLER_NODE_SAVE_PERIOD_SECS",
                defaults.node_save_period_secs,
            ),
            max_nodes_to_save: env_usize("TRAWLER_MAX_NODES_TO_SAVE", defaults.max_nodes_to_save),
            recv_buffer_bytes: env_usize("TRAWLER_RECV_BUFFER_BYTES", defaults.recv_buffer_bytes),
            rebootstrap_backoff_secs: env_u64(
                "TRAWLER_REBOOTSTRAP_BACKOFF_SECS",
                defaults.rebootstrap_backoff_secs,
            ),

            max_pipeline_depth: env_usize(
                "TRAWLER_MAX_PIPELINE_DEPTH",
                defaults.max_pipeline_depth,
            ),

            max_concurrent_fetches: env_usize(
                "TRAWLER_MAX_CONCURRENT_FETCHES",
                defaults.max_concurrent_fetches,
            )
            .max(1),
            timeout_secs: env_u64("TRAWLER_TIMEOUT_SECS", defaults.timeout_secs).max(1),
            poll_interval_ms: env_u64("TRAWLER_POLL_INTERVAL_MS", defaults.poll_interval_ms)
                .max(1),

            tcp_listen_port: env_u16("TRAWLER_TCP_LISTEN_PORT", defaults.tcp_listen_port),
            lookup_deadline_secs: env_u64(
                "TRAWLER_LOOKUP_DEADLINE_SECS",
                defaults.lookup_deadline_secs,
            ),
            lookup_inflight: env_usize("TRAWLER_LOOKUP_INFLIGHT", defaults.lookup_inflight).max(1),
            lookup_max_queries: env_usize(
                "TRAWLER_LOOKUP_MAX_QUERIES",
                defaults.lookup_max_queries,
            ),
            lookup_recv_timeout_ms: env_u64(
                "TRAWLER_LOOKUP_RECV_TIMEOUT_MS",
                defaults.lookup_recv_timeout_ms,
            )
            .max(10),
            max_peers_per_session: env_usize(
                "TRAWLER_MAX_PEERS_PER_SESSION",
                defaults.max_peers_per_session,
            )
            .max(1),
            metadata_peers_inflight: env_usize(
                "TRAWLER_METADATA_PEERS_INFLIGHT",
                defaults.metadata_peers_inflight,
            )
            .max(1),
        }
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_pathbuf(name: &str, default: PathBuf) -> PathBuf {
    env_opt_string(name).map(PathBuf::from).unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env_opt_string(name)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env_opt_string(name)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u16(name: &str, default: u16) -> u16 {
    env_opt_string(name)
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env_opt_string(name)
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_csv_strings(name: &str, default: Vec<String>) -> Vec<String> {
    if let Some(s) = env_opt_string(name) {
        let v: Vec<String> = s
            .split(',')
            .map(|x| x.trim().to_string())
            .filter(|x| !x.is_empty())
            .collect();
        if !v.is_empty() {
            return v;
        }
    }
    default
}
