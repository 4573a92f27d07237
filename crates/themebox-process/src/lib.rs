use std::fmt;

/// Sandbox identifier as stored in the `sandboxes` table.
///
/// Ids double as directory names under the data root, so only a conservative
/// character set is accepted (see [`SandboxId::parse`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct SandboxId(pub String);

impl SandboxId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, IdError> {
        normalize_id(raw).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        normalize_id(raw).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdError {
    Empty,
    Invalid,
}

impl fmt::Display for IdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdError::Empty => f.write_str("id must be non-empty"),
            IdError::Invalid => f.write_str("id may only contain [A-Za-z0-9._-]"),
        }
    }
}

impl std::error::Error for IdError {}

fn normalize_id(raw: &str) -> Result<String, IdError> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(IdError::Empty);
    }
    // Keep ids safe for filesystem paths.
    if id == "." || id == ".." {
        return Err(IdError::Invalid);
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(IdError::Invalid);
    }
    Ok(id.to_string())
}

/// The (app, proxy) port slot held by one sandbox. Both ports always come
/// from the same pool offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct PortPair {
    pub app_port: u16,
    pub proxy_port: u16,
}

/// Persisted sandbox status. `Ready`, `Error` and `Deleted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Created,
    ThemePulled,
    ThemePushed,
    DevServerStarting,
    Ready,
    Error,
    Deleted,
}

impl SandboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxStatus::Created => "created",
            SandboxStatus::ThemePulled => "theme_pulled",
            SandboxStatus::ThemePushed => "theme_pushed",
            SandboxStatus::DevServerStarting => "dev_server_starting",
            SandboxStatus::Ready => "ready",
            SandboxStatus::Error => "error",
            SandboxStatus::Deleted => "deleted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "created" => SandboxStatus::Created,
            "theme_pulled" => SandboxStatus::ThemePulled,
            "theme_pushed" => SandboxStatus::ThemePushed,
            "dev_server_starting" => SandboxStatus::DevServerStarting,
            "ready" => SandboxStatus::Ready,
            "error" => SandboxStatus::Error,
            "deleted" => SandboxStatus::Deleted,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SandboxStatus::Ready | SandboxStatus::Error | SandboxStatus::Deleted
        )
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-flight stage of a lifecycle operation. Not persisted; used for logging
/// and error attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    Allocating,
    Syncing,
    Starting,
    Probing,
    Tunneling,
    Ready,
    Error,
    Deleting,
    Deleted,
}

impl LifecycleStage {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleStage::Allocating => "allocating",
            LifecycleStage::Syncing => "syncing",
            LifecycleStage::Starting => "starting",
            LifecycleStage::Probing => "probing",
            LifecycleStage::Tunneling => "tunneling",
            LifecycleStage::Ready => "ready",
            LifecycleStage::Error => "error",
            LifecycleStage::Deleting => "deleting",
            LifecycleStage::Deleted => "deleted",
        }
    }
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
