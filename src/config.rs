//! Runtime tuning knobs for [`crate::pipeline`], grounded on `LibISDB::TSEngine`'s
//! constructor defaults (`TS/TSPacketQueue.hpp`, `Base/StreamSourceFilter.cpp`) — the
//! same "queue depth, pool sizing, packet shaping" surface the source exposes as
//! constructor/setter arguments, collected here into one struct per spec section 5.

/// Tuning knobs for one [`crate::pipeline::Pipeline`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Maximum number of consecutive TS packets handed to the filter graph per queue pop,
    /// bounding per-iteration latency (`LibISDB::TSEngine::SetPacketStoreSize`'s default).
    pub max_sequence_packet_count: usize,
    /// Whether null packets (PID `0x1FFF`) are forwarded to the filter graph instead of
    /// being dropped by the framer.
    pub output_null_packets: bool,
    /// Whether packets that failed format/continuity checks are still forwarded (tagged
    /// via their `ParseResult`) instead of being dropped.
    pub output_error_packets: bool,
    /// Whether [`crate::oneseg::OneSegPatGenerator`] is wired into the pipeline.
    pub generate_1seg_pat: bool,
    /// Capacity of the bounded work queue between the input thread and the streaming
    /// thread.
    pub queue_size: usize,
    /// Percentage (`0..=100`) of `queue_size` pre-allocated at pipeline start, trading
    /// startup allocation cost for fewer reallocations under burst load.
    pub initial_pool_percentage: u8,
    /// Milliseconds the input side blocks waiting for queue space before applying
    /// backpressure (`0` means "drop the oldest half immediately", matching
    /// [`crate::pipeline`]'s default backpressure policy).
    pub input_wait_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_sequence_packet_count: 64,
            output_null_packets: false,
            output_error_packets: false,
            generate_1seg_pat: true,
            queue_size: 4096,
            initial_pool_percentage: 0,
            input_wait_ms: 0,
        }
    }
}

impl RuntimeConfig {
    /// [`RuntimeConfig::default`] under another name, for call sites that read more
    /// naturally as `RuntimeConfig::new()`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of packets to pre-allocate the queue for at pipeline start.
    pub fn initial_pool_len(&self) -> usize {
        self.queue_size * self.initial_pool_percentage as usize / 100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_sequence_packet_count, 64);
        assert!(!config.output_null_packets);
        assert!(!config.output_error_packets);
        assert!(config.generate_1seg_pat);
        assert_eq!(config.queue_size, 4096);
        assert_eq!(config.input_wait_ms, 0);
    }

    #[test]
    fn initial_pool_len_scales_with_percentage() {
        let mut config = RuntimeConfig::default();
        config.initial_pool_percentage = 50;
        assert_eq!(config.initial_pool_len(), 2048);
    }
}
