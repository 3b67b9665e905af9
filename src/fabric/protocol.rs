//! Wire protocol between coordinator and node agents
//!
//! One persistent WebSocket per node carries JSON frames. Upward frames are
//! heartbeats, command results, and container health events; downward frames
//! are commands, each tagged with a correlation id the agent echoes back.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One container as reported in a heartbeat
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerReport {
    pub name: String,
    pub memory_mb: u64,
}

/// Frames sent by the node agent to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    /// Periodic container inventory with memory usage
    Heartbeat { containers: Vec<ContainerReport> },
    /// Response to a command, correlated by `id`
    CommandResult {
        id: String,
        command: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Container lifecycle event (crash, restart, OOM)
    HealthEvent {
        container: String,
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

/// Environment map handed to containers; ordered for stable serialization
pub type EnvMap = BTreeMap<String, String>;

/// Commands the coordinator sends down to a node agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum NodeCommand {
    #[serde(rename = "bot.start")]
    BotStart {
        name: String,
        image: String,
        env: EnvMap,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        restart: Option<bool>,
    },
    #[serde(rename = "bot.stop")]
    BotStop { name: String },
    #[serde(rename = "bot.restart")]
    BotRestart { name: String },
    #[serde(rename = "bot.remove")]
    BotRemove { name: String },
    /// Recreate the container with new environment
    #[serde(rename = "bot.update")]
    BotUpdate { name: String, env: EnvMap },
    #[serde(rename = "bot.export")]
    BotExport { name: String },
    /// Import an exported archive and start the container
    #[serde(rename = "bot.import")]
    BotImport {
        name: String,
        image: String,
        env: EnvMap,
    },
    #[serde(rename = "bot.logs")]
    BotLogs {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tail: Option<u32>,
    },
    #[serde(rename = "bot.inspect")]
    BotInspect { name: String },
    #[serde(rename = "backup.upload")]
    BackupUpload { filename: String },
    #[serde(rename = "backup.download")]
    BackupDownload { filename: String },
    #[serde(rename = "backup.run-nightly")]
    BackupRunNightly,
    #[serde(rename = "backup.run-hot")]
    BackupRunHot,
}

impl NodeCommand {
    /// Wire name, echoed back in the matching result frame
    pub fn name(&self) -> &'static str {
        match self {
            Self::BotStart { .. } => "bot.start",
            Self::BotStop { .. } => "bot.stop",
            Self::BotRestart { .. } => "bot.restart",
            Self::BotRemove { .. } => "bot.remove",
            Self::BotUpdate { .. } => "bot.update",
            Self::BotExport { .. } => "bot.export",
            Self::BotImport { .. } => "bot.import",
            Self::BotLogs { .. } => "bot.logs",
            Self::BotInspect { .. } => "bot.inspect",
            Self::BackupUpload { .. } => "backup.upload",
            Self::BackupDownload { .. } => "backup.download",
            Self::BackupRunNightly => "backup.run-nightly",
            Self::BackupRunHot => "backup.run-hot",
        }
    }
}

/// Downward frame: a command plus its correlation id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFrame {
    pub id: String,
    #[serde(flatten)]
    pub command: NodeCommand,
}
