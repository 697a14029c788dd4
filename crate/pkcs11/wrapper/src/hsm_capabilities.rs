/// Streaming limits of a token, used by the chunked helpers of [`crate::Session`].
#[derive(Debug, Clone)]
pub struct HsmCapabilities {
    /// Maximum input handed to a single update call (in bytes)
    pub max_stream_chunk: usize,
    /// Output room reserved on top of each chunk for block carry-over and padding (in bytes)
    pub output_slack: usize,
}

impl Default for HsmCapabilities {
    fn default() -> Self {
        Self {
            max_stream_chunk: 4096,
            output_slack: 32,
        }
    }
}

pub trait HsmProvider: Send + Sync + 'static {
    fn capabilities() -> HsmCapabilities;
}

/// Provider for tokens without known streaming limits.
pub struct DefaultCapabilityProvider;

impl HsmProvider for DefaultCapabilityProvider {
    fn capabilities() -> HsmCapabilities {
        HsmCapabilities::default()
    }
}
