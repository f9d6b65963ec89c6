//! Protocol constants for the sync core.

/// Current p2p protocol version advertised in the handshake.
pub const PROTOCOL_VERSION: u32 = 5;

/// Oldest protocol version we still talk to.
pub const MIN_PROTOCOL_VERSION: u32 = 5;

/// Maximum number of transaction IDs in a single `InvTransactions` announcement.
pub const MAX_INV_PER_TX_INV_MSG: usize = 50_000;

/// Maximum number of transaction IDs in a single `RequestTransactions` message.
pub const MAX_REQUESTED_TRANSACTIONS: usize = MAX_INV_PER_TX_INV_MSG;

/// Maximum number of block hashes in a single `RequestRelayBlocks` message.
pub const MAX_REQUESTED_BLOCKS: usize = 128;

/// Maximum number of blocks served for one `RequestIbdBlocks`.
pub const MAX_IBD_BLOCKS_PER_REQUEST: usize = 10_000;

/// Maximum number of blocks kept in the orphan pool.
pub const MAX_ORPHANS: usize = 600;

/// Orphans with more missing roots than this trigger IBD instead of
/// root-by-root requests.
pub const MAX_ORPHAN_ROOTS_TO_REQUEST: usize = 64;

/// The node is DAG-time-current while its virtual selected parent is
/// younger than this (milliseconds).
pub const DAG_TIME_STALENESS_MS: i64 = 60_000;

/// Minimum interval between transaction-ID propagation flushes (milliseconds).
pub const TX_PROPAGATION_INTERVAL_MS: u64 = 500;

/// Minimum interval between full mempool rebroadcasts (seconds).
pub const TX_REBROADCAST_INTERVAL_SECS: u64 = 30;

/// Default capacity of a flow's incoming route.
pub const DEFAULT_ROUTE_CAPACITY: usize = 200;

/// Capacity of the route carrying IBD blocks.
pub const IBD_ROUTE_CAPACITY: usize = MAX_IBD_BLOCKS_PER_REQUEST + 1;

/// Default capacity of a connection's outgoing queue.
pub const DEFAULT_OUTGOING_CAPACITY: usize = 1_000;

/// Network type: Mainnet, Testnet, or Simnet.
///
/// Peers on different networks refuse each other during the handshake.
///
/// # Examples
///
/// ```
/// use dagflow_core::constants::NetworkType;
/// let net = NetworkType::default();
/// assert_eq!(net, NetworkType::Mainnet);
/// assert_eq!(net.name(), "dagflow-mainnet");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NetworkType {
    /// Production network.
    #[default]
    Mainnet,
    /// Public test network.
    Testnet,
    /// Local simulation network with short intervals.
    Simnet,
}

impl NetworkType {
    /// Network name exchanged in the version handshake.
    ///
    /// # Examples
    ///
    /// ```
    /// use dagflow_core::constants::NetworkType;
    /// assert_eq!(NetworkType::Testnet.name(), "dagflow-testnet");
    /// assert_eq!(NetworkType::Simnet.name(), "dagflow-simnet");
    /// ```
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mainnet => "dagflow-mainnet",
            Self::Testnet => "dagflow-testnet",
            Self::Simnet => "dagflow-simnet",
        }
    }
}
