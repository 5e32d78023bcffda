//! Process-wide runtime options, read once from the environment.

use std::sync::OnceLock;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Opt {
    /// Never attempt MAP_HUGETLB / large-page mappings; always use the
    /// aligned-overallocation fallback.
    NoHugePages,
    /// Return the physical pages of a block to the OS (madvise) when the
    /// block goes unused.
    PurgePages,
}

const OPTION_COUNT: usize = 2;

static OPTIONS: OnceLock<[bool; OPTION_COUNT]> = OnceLock::new();

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => !(v.is_empty() || v == "0" || v.eq_ignore_ascii_case("false")),
        Err(_) => false,
    }
}

fn load() -> [bool; OPTION_COUNT] {
    [
        env_flag("BLOCKGC_NO_HUGE_PAGES"),
        env_flag("BLOCKGC_PURGE_PAGES"),
    ]
}

pub fn is_enabled(opt: Opt) -> bool {
    OPTIONS.get_or_init(load)[opt as usize]
}
