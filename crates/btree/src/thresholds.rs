/// The size thresholds that drive the split engine (§4.H `DtSplit`). The
/// original reads these from a build-time `options.h` not present in the
/// retrieved source; `server` constructs this via `cmd_util::env_config`
/// and these are the fallback defaults (documented as an implementation
/// choice in DESIGN.md, per spec.md §9's open question).
#[derive(Clone, Copy, Debug)]
pub struct SplitThresholds {
    /// A node at or below this many cells (and at or below
    /// `split_size_bytes`) is left alone by a size-driven split.
    pub split_size: usize,
    pub split_size_bytes: usize,
    /// A node below this many cells is left alone even by a cell-driven
    /// (load) split.
    pub split_minsize: usize,
    /// Bounds parent-lookup and split-cascade walks.
    pub max_levels: usize,
}

impl Default for SplitThresholds {
    fn default() -> Self {
        SplitThresholds {
            split_size: 20,
            split_size_bytes: 8192,
            split_minsize: 2,
            max_levels: 32,
        }
    }
}
