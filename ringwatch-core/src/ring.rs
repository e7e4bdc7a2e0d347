use crate::identity::SiloAddress;
use crate::table::MembershipTableSnapshot;

/// Returns up to `count` monitored silos that follow `local` on the hash ring.
///
/// Every silo picking its successors this way means each monitored silo is
/// probed by its `count` predecessors without an all-to-all mesh.
#[must_use]
pub fn successors(
    snapshot: &MembershipTableSnapshot,
    local: &SiloAddress,
    count: usize,
) -> Vec<SiloAddress> {
    let mut ring: Vec<(u64, SiloAddress)> = snapshot
        .monitored_silos()
        .into_iter()
        .filter(|silo| silo != local)
        .map(|silo| (silo.ring_hash(), silo))
        .collect();
    if ring.is_empty() || count == 0 {
        return Vec::new();
    }
    ring.sort_unstable();

    let local_key = (local.ring_hash(), *local);
    let start = ring.partition_point(|key| key < &local_key);
    ring.iter()
        .cycle()
        .skip(start)
        .take(count.min(ring.len()))
        .map(|(_, silo)| *silo)
        .collect()
}
