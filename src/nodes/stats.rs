use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub cores: u32,
    /// System wide load, 0.0..=1.0.
    pub system_load: f64,
    pub lavalink_load: f64,
}

/// Frames sent to voice over the last minute; absent when no player is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

/// Estadísticas publicadas por un nodo (`op: stats`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub players: u32,
    pub playing_players: u32,
    /// Uptime in milliseconds.
    pub uptime: u64,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    #[serde(default)]
    pub frame_stats: Option<FrameStats>,
}

impl NodeStats {
    /// Load score of a connected node, lower is better.
    ///
    /// Sessions count one point each and CPU load grows exponentially.
    /// Missing frames are added on top, nulled ones twice.
    pub fn penalty(&self) -> i64 {
        let cpu = (1.05f64.powf(100.0 * self.cpu.system_load) * 10.0 - 10.0).round() as i64;
        let (deficit, nulled) = self
            .frame_stats
            .map(|frames| (frames.deficit, frames.nulled))
            .unwrap_or((0, 0));

        i64::from(self.players) + cpu + deficit + nulled * 2
    }
}
