use std::sync::OnceLock;

use rand::RngCore;

/// A value that is (with overwhelming probability) unique to this process,
/// used as the process-identifying component of [`crate::Tid`] and
/// [`crate::Timestamp`].
///
/// Concatenating a host address with a process id is the traditional way
/// to build one of these, but there's no reliable, dependency-free way to
/// enumerate a host's routable IP from inside a container, so we substitute
/// a randomly generated 64-bit value seeded once per process; the
/// uniqueness guarantee (used only to break ties between concurrently
/// running processes) is unaffected.
pub fn process_unique_id() -> u64 {
    static ID: OnceLock<u64> = OnceLock::new();
    *ID.get_or_init(|| rand::rng().next_u64())
}
