//! RPC port allocation.
//!
//! A pure function of (used-set, range): pick uniformly at random for up
//! to 100 attempts, then sweep sequentially. Random-first keeps freshly
//! restarted orchestrators from piling onto the bottom of the range.

use std::collections::HashSet;
use std::ops::RangeInclusive;

use rand::Rng;

use redlab_domain::NoPortsAvailable;

const RANDOM_ATTEMPTS: u32 = 100;

pub fn allocate_port(
    used: &HashSet<u16>,
    range: RangeInclusive<u16>,
) -> Result<u16, NoPortsAvailable> {
    if range.is_empty() {
        return Err(NoPortsAvailable);
    }

    let mut rng = rand::thread_rng();
    for _ in 0..RANDOM_ATTEMPTS {
        let candidate = rng.gen_range(range.clone());
        if !used.contains(&candidate) {
            return Ok(candidate);
        }
    }

    range
        .clone()
        .find(|port| !used.contains(port))
        .ok_or(NoPortsAvailable)
}
