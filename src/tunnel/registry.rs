//! Process-wide tunnel list
//!
//! Every tunnel registers itself on construction and is removed exactly
//! once when it closes, so shutdown can close every live tunnel without
//! any other bookkeeping. Entries are weak: the registry never keeps a
//! tunnel alive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Weak};

use dashmap::DashMap;
use tracing::debug;

use super::Tunnel;

static ACTIVE_TUNNELS: LazyLock<DashMap<u64, Weak<Tunnel>>> = LazyLock::new(DashMap::new);
static NEXT_TUNNEL_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_tunnel_id() -> u64 {
    NEXT_TUNNEL_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn register(tunnel: &Arc<Tunnel>) {
    ACTIVE_TUNNELS.insert(tunnel.id(), Arc::downgrade(tunnel));
}

pub(crate) fn unregister(id: u64) {
    ACTIVE_TUNNELS.remove(&id);
}

/// Number of live tunnels
#[must_use]
pub fn active_tunnel_count() -> usize {
    ACTIVE_TUNNELS
        .iter()
        .filter(|entry| entry.value().strong_count() > 0)
        .count()
}

/// Close every live tunnel
///
/// Used at process shutdown. Closing a tunnel removes it from the list,
/// so the set of targets is snapshotted first.
pub fn close_all_tunnels() {
    let tunnels: Vec<Arc<Tunnel>> = ACTIVE_TUNNELS
        .iter()
        .filter_map(|entry| entry.value().upgrade())
        .collect();
    debug!("Closing {} active tunnels", tunnels.len());
    for tunnel in tunnels {
        tunnel.close();
    }
}
