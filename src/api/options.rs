use std::convert::TryFrom;
use tokio::time::Duration;

/// Tuning knobs for a raft member. Anything left as `None` gets a default.
#[derive(Clone, Default, Debug)]
pub struct RaftOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub follower_min_timeout: Option<Duration>,
    pub follower_max_timeout: Option<Duration>,
    pub leader_append_entries_timeout: Option<Duration>,
    /// Most entries a single AppendEntries call carries.
    pub max_append_entries_batch: Option<u64>,
    /// The active log segment is rotated once it reaches this size.
    pub max_segment_bytes: Option<u64>,
    /// The active log segment is rotated once it holds this many entries.
    pub max_segment_entries: Option<u64>,
    /// Committed entries always kept around for lagging followers.
    pub min_retained_entries: Option<u64>,
    /// A follower further behind than this no longer holds back pruning.
    pub max_retained_entries: Option<u64>,
}

#[derive(Clone, Debug)]
pub(super) struct RaftOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub leader_append_entries_timeout: Duration,
    pub max_append_entries_batch: u64,
    pub max_segment_bytes: u64,
    pub max_segment_entries: u64,
    pub min_retained_entries: u64,
    pub max_retained_entries: u64,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration >= self.follower_min_timeout {
            return Err("Follower minimum timeout must be greater than leader's heartbeat");
        }
        if self.follower_min_timeout >= self.follower_max_timeout {
            return Err("Follower minimum timeout must be less than maximum timeout");
        }
        if self.leader_append_entries_timeout >= self.follower_min_timeout {
            return Err("Leader's AppendEntries RPC timeout must be less than the follower's heartbeat timeout");
        }
        if self.max_append_entries_batch == 0 {
            return Err("AppendEntries batch size must be non-0");
        }
        if self.max_segment_bytes == 0 || self.max_segment_entries == 0 {
            return Err("Segment rotation thresholds must be non-0");
        }
        if self.min_retained_entries > self.max_retained_entries {
            return Err("Minimum retained entries must not exceed maximum retained entries");
        }

        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let values = RaftOptionsValidated {
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100)),
            follower_min_timeout: options.follower_min_timeout.unwrap_or(Duration::from_millis(500)),
            follower_max_timeout: options.follower_max_timeout.unwrap_or(Duration::from_millis(1500)),
            leader_append_entries_timeout: options
                .leader_append_entries_timeout
                .unwrap_or(Duration::from_millis(300)),
            max_append_entries_batch: options.max_append_entries_batch.unwrap_or(64),
            max_segment_bytes: options.max_segment_bytes.unwrap_or(64 * 1024 * 1024),
            max_segment_entries: options.max_segment_entries.unwrap_or(100_000),
            min_retained_entries: options.min_retained_entries.unwrap_or(1_000),
            max_retained_entries: options.max_retained_entries.unwrap_or(1_000_000),
        };

        values.validate()?;
        Ok(values)
    }
}
