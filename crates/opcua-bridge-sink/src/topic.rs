//! Topic settings and key partitioning.

/// Settings of the topic every message is published to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    /// Topic name
    pub name: String,
    /// Number of partitions, at least 1
    pub partitions: u32,
    /// Replication factor requested when the topic is created
    pub replication_factor: u16,
}

impl TopicConfig {
    /// Create topic settings. A partition count of 0 is raised to 1.
    #[must_use]
    pub fn new(name: impl Into<String>, partitions: u32, replication_factor: u16) -> Self {
        Self {
            name: name.into(),
            partitions: partitions.max(1),
            replication_factor: replication_factor.max(1),
        }
    }

    /// Partition for a record key.
    ///
    /// Equal keys always land on the same partition.
    #[must_use]
    pub fn partition_for(&self, key: &str) -> u32 {
        let partitions = u64::from(self.partitions.max(1));
        // partitions fits in u32, so the remainder does too
        u32::try_from(fnv1a(key.as_bytes()) % partitions).unwrap_or(0)
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self::new("opcua-events", 1, 1)
    }
}

/// 64-bit FNV-1a.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;

    bytes.iter().fold(OFFSET, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}
