/// Sizing and placement knobs for a segmented log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// Upper bound on a segment's store file. The segment reports itself
    /// full once the store reaches this size.
    pub max_store_bytes: u64,
    /// Upper bound on a segment's index file. Must be a multiple of the
    /// entry width to be fully usable; the index pre-grows to exactly this
    /// size before mapping.
    pub max_index_bytes: u64,
    /// Offset the first segment starts at when the directory is empty.
    pub initial_offset: u64,
}

impl LogConfig {
    /// Zero-valued bounds fall back to small defaults so a zeroed config is
    /// always usable.
    pub(crate) fn with_defaults(mut self) -> Self {
        if self.max_store_bytes == 0 {
            self.max_store_bytes = 1024;
        }
        if self.max_index_bytes == 0 {
            self.max_index_bytes = 1024;
        }
        self
    }
}
