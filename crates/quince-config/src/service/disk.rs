//! Disk mirror of the config cache
//!
//! Layout under the base directory:
//! - `config-data/<group>/<dataId>`
//! - `config-data-tenant/<tenant>/<group>/<dataId>`
//! - `config-data-gray/<group>/<dataId>/<grayName>` (and `config-data-gray-tenant/<tenant>/...`)

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use quince_common::is_valid;

const BASE_DIR: &str = "config-data";
const TENANT_BASE_DIR: &str = "config-data-tenant";
const GRAY_DIR: &str = "config-data-gray";
const TENANT_GRAY_DIR: &str = "config-data-gray-tenant";

/// Whether a name can be used as one path component of the mirror
pub fn is_valid_part(value: &str) -> bool {
    !value.is_empty() && value != "." && value != ".." && is_valid(value)
}

/// Whether a config identity maps onto the disk layout. The tenant may be empty.
pub fn is_valid_identity(data_id: &str, group: &str, tenant: &str) -> bool {
    is_valid_part(data_id) && is_valid_part(group) && (tenant.is_empty() || is_valid_part(tenant))
}

#[async_trait]
pub trait ConfigDiskService: Send + Sync {
    async fn save_to_disk(
        &self,
        data_id: &str,
        group: &str,
        tenant: &str,
        content: &str,
    ) -> anyhow::Result<()>;

    async fn save_gray_to_disk(
        &self,
        data_id: &str,
        group: &str,
        tenant: &str,
        gray_name: &str,
        content: &str,
    ) -> anyhow::Result<()>;

    /// Removing a file that does not exist is not an error
    async fn remove_config_info(&self, data_id: &str, group: &str, tenant: &str) -> anyhow::Result<()>;

    async fn remove_gray(
        &self,
        data_id: &str,
        group: &str,
        tenant: &str,
        gray_name: &str,
    ) -> anyhow::Result<()>;

    async fn read_config_info(
        &self,
        data_id: &str,
        group: &str,
        tenant: &str,
    ) -> anyhow::Result<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct LocalDiskService {
    base_dir: PathBuf,
}

impl LocalDiskService {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn check_part(name: &str, value: &str) -> anyhow::Result<()> {
        if !is_valid_part(value) {
            anyhow::bail!("invalid {} '{}'", name, value);
        }
        Ok(())
    }

    fn config_path(&self, data_id: &str, group: &str, tenant: &str) -> anyhow::Result<PathBuf> {
        Self::check_part("dataId", data_id)?;
        Self::check_part("group", group)?;
        let path = if tenant.is_empty() {
            self.base_dir.join(BASE_DIR)
        } else {
            Self::check_part("tenant", tenant)?;
            self.base_dir.join(TENANT_BASE_DIR).join(tenant)
        };
        Ok(path.join(group).join(data_id))
    }

    fn gray_path(
        &self,
        data_id: &str,
        group: &str,
        tenant: &str,
        gray_name: &str,
    ) -> anyhow::Result<PathBuf> {
        Self::check_part("dataId", data_id)?;
        Self::check_part("group", group)?;
        Self::check_part("grayName", gray_name)?;
        let path = if tenant.is_empty() {
            self.base_dir.join(GRAY_DIR)
        } else {
            Self::check_part("tenant", tenant)?;
            self.base_dir.join(TENANT_GRAY_DIR).join(tenant)
        };
        Ok(path.join(group).join(data_id).join(gray_name))
    }

    /// Write through a temporary file so readers never see a partial file.
    async fn write(path: &Path, content: &str) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn remove(path: &Path) -> anyhow::Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ConfigDiskService for LocalDiskService {
    async fn save_to_disk(
        &self,
        data_id: &str,
        group: &str,
        tenant: &str,
        content: &str,
    ) -> anyhow::Result<()> {
        Self::write(&self.config_path(data_id, group, tenant)?, content).await
    }

    async fn save_gray_to_disk(
        &self,
        data_id: &str,
        group: &str,
        tenant: &str,
        gray_name: &str,
        content: &str,
    ) -> anyhow::Result<()> {
        Self::write(&self.gray_path(data_id, group, tenant, gray_name)?, content).await
    }

    async fn remove_config_info(&self, data_id: &str, group: &str, tenant: &str) -> anyhow::Result<()> {
        Self::remove(&self.config_path(data_id, group, tenant)?).await
    }

    async fn remove_gray(
        &self,
        data_id: &str,
        group: &str,
        tenant: &str,
        gray_name: &str,
    ) -> anyhow::Result<()> {
        Self::remove(&self.gray_path(data_id, group, tenant, gray_name)?).await
    }

    async fn read_config_info(
        &self,
        data_id: &str,
        group: &str,
        tenant: &str,
    ) -> anyhow::Result<Option<String>> {
        match tokio::fs::read_to_string(self.config_path(data_id, group, tenant)?).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let disk = LocalDiskService::new(dir.path());

        disk.save_to_disk("app.yaml", "DEFAULT_GROUP", "", "a: 1").await.unwrap();
        assert!(dir.path().join("config-data/DEFAULT_GROUP/app.yaml").exists());
        assert_eq!(
            disk.read_config_info("app.yaml", "DEFAULT_GROUP", "").await.unwrap().as_deref(),
            Some("a: 1")
        );

        disk.remove_config_info("app.yaml", "DEFAULT_GROUP", "").await.unwrap();
        assert!(disk.read_config_info("app.yaml", "DEFAULT_GROUP", "").await.unwrap().is_none());
        // second removal is a no-op
        disk.remove_config_info("app.yaml", "DEFAULT_GROUP", "").await.unwrap();
    }

    #[tokio::test]
    async fn test_tenant_and_gray_layout() {
        let dir = tempfile::tempdir().unwrap();
        let disk = LocalDiskService::new(dir.path());

        disk.save_to_disk("app.yaml", "G", "dev", "x").await.unwrap();
        disk.save_gray_to_disk("app.yaml", "G", "", "beta", "y").await.unwrap();
        assert!(dir.path().join("config-data-tenant/dev/G/app.yaml").exists());
        assert!(dir.path().join("config-data-gray/G/app.yaml/beta").exists());

        disk.remove_gray("app.yaml", "G", "", "beta").await.unwrap();
        assert!(!dir.path().join("config-data-gray/G/app.yaml/beta").exists());
    }

    #[tokio::test]
    async fn test_rejects_path_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let disk = LocalDiskService::new(dir.path());

        assert!(disk.save_to_disk("..", "G", "", "x").await.is_err());
        assert!(disk.save_to_disk("a/b", "G", "", "x").await.is_err());
        assert!(disk.save_to_disk("a", "", "", "x").await.is_err());
        assert!(disk.save_gray_to_disk("a", "G", "", "../beta", "x").await.is_err());
    }
}
