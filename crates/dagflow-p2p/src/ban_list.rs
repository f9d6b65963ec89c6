//! In-memory address ban list.
//!
//! Records the IPs of peers that committed ban-worthy protocol violations.
//! A ban lasts until [`BanList::unban`] is called; the dispatcher consults
//! the list before running any flow on a new connection.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;
use tracing::{debug, warn};

use crate::connection::AddressBook;

/// Per-address ban record.
#[derive(Debug, Clone)]
pub struct BanRecord {
    /// When the address was first banned.
    pub banned_at: Instant,
    /// How many times it was banned while already banned.
    pub repeat_offences: u64,
}

/// Thread-safe [`AddressBook`] keeping bans in memory.
pub struct BanList {
    bans: RwLock<HashMap<IpAddr, BanRecord>>,
}

impl BanList {
    pub fn new() -> Self {
        Self {
            bans: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the banned addresses, sorted.
    pub fn banned_addresses(&self) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = self.bans.read().keys().copied().collect();
        ips.sort();
        ips
    }

    /// Returns a snapshot of the ban record for `ip`, or `None` if not banned.
    pub fn record(&self, ip: IpAddr) -> Option<BanRecord> {
        self.bans.read().get(&ip).cloned()
    }

    pub fn len(&self) -> usize {
        self.bans.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bans.read().is_empty()
    }
}

impl Default for BanList {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressBook for BanList {
    fn ban(&self, ip: IpAddr) {
        let mut bans = self.bans.write();
        match bans.get_mut(&ip) {
            Some(record) => {
                record.repeat_offences = record.repeat_offences.saturating_add(1);
                debug!(%ip, repeats = record.repeat_offences, "ban_list: address banned again");
            }
            None => {
                bans.insert(
                    ip,
                    BanRecord {
                        banned_at: Instant::now(),
                        repeat_offences: 0,
                    },
                );
                warn!(%ip, "ban_list: address banned");
            }
        }
    }

    fn unban(&self, ip: IpAddr) {
        if self.bans.write().remove(&ip).is_some() {
            debug!(%ip, "ban_list: address unbanned");
        }
    }

    fn is_banned(&self, ip: IpAddr) -> bool {
        self.bans.read().contains_key(&ip)
    }
}
