use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::error::{CoreError, Result};

pub const POINTER_FILE: &str = "plan.json";

/// Per-workspace pointer to the latest proposal, used to continue a
/// conversation from where the previous session left off.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionPointer {
    pub proposal_id: String,
}

impl SessionPointer {
    pub fn new(proposal_id: impl Into<String>) -> Self {
        Self {
            proposal_id: proposal_id.into(),
        }
    }

    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(POINTER_FILE)
    }

    /// Read the pointer from `dir`. A missing file means "no parent".
    pub async fn read(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path_in(dir);
        if !path.exists() {
            debug!(path = %path.display(), "No session pointer, starting fresh");
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;
        let pointer = serde_json::from_str(&content).map_err(|e| {
            CoreError::Pointer(format!("failed to parse {}: {}", path.display(), e))
        })?;
        Ok(Some(pointer))
    }

    pub async fn write(&self, dir: &Path) -> Result<()> {
        if !dir.exists() {
            fs::create_dir_all(dir).await?;
        }

        let path = Self::path_in(dir);
        let content = serde_json::to_string(self)
            .map_err(|e| CoreError::Pointer(e.to_string()))?;
        fs::write(&path, content).await?;
        debug!(path = %path.display(), proposal_id = %self.proposal_id, "Session pointer saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_missing_pointer() {
        let temp_dir = TempDir::new().unwrap();
        assert!(SessionPointer::read(temp_dir.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_and_read_pointer() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join(".drafter");

        SessionPointer::new("p-42").write(&dir).await.unwrap();

        let raw = std::fs::read_to_string(dir.join(POINTER_FILE)).unwrap();
        assert_eq!(raw, r#"{"proposalId":"p-42"}"#);

        let loaded = SessionPointer::read(&dir).await.unwrap().unwrap();
        assert_eq!(loaded.proposal_id, "p-42");
    }

    #[tokio::test]
    async fn test_read_corrupt_pointer() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(POINTER_FILE), "{").unwrap();
        let err = SessionPointer::read(temp_dir.path()).await.unwrap_err();
        assert!(matches!(err, CoreError::Pointer(_)));
    }
}
