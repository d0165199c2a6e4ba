//! CPU pool names
//!
//! Pool names do not map one-to-one onto QoS levels: dedicated containers
//! with or without NUMA binding both land in the `dedicated` pool.

pub const POOL_NAME_SHARE: &str = "share";
pub const POOL_NAME_RECLAIM: &str = "reclaim";
pub const POOL_NAME_DEDICATED: &str = "dedicated";
pub const POOL_NAME_RESERVE: &str = "reserve";

/// Not a real pool: the union of all non-reclaimed pools, used to place
/// containers that should have been isolated but currently are not.
pub const POOL_NAME_FALLBACK: &str = "fallback";

/// Owner pool name of a record that belongs to no pool
pub const EMPTY_OWNER_POOL_NAME: &str = "";

/// Pools generated statically by the CPU plugin; ignored when reading
/// advisor list and watch responses.
pub const STATIC_POOLS: &[&str] = &[POOL_NAME_RESERVE];

/// Pools guaranteed to exist in state even with no containers assigned
pub const RESIDENT_POOLS: &[&str] = &[POOL_NAME_RECLAIM, POOL_NAME_RESERVE];

pub fn is_static_pool(pool_name: &str) -> bool {
    STATIC_POOLS.contains(&pool_name)
}

pub fn is_resident_pool(pool_name: &str) -> bool {
    RESIDENT_POOLS.contains(&pool_name)
}
