//! Init command implementation

use crate::config::Config;
use crate::error::{Error, Result};
use crate::meta::{FileDb, JobDb};
use std::path::PathBuf;
use tracing::info;

/// Write a default config and create both databases with reference data
pub async fn cmd_init(base_dir: Option<PathBuf>, force: bool) -> Result<Config> {
    let mut config = Config::default();
    config.init_paths(base_dir);

    if config.paths.config_file.exists() && !force {
        return Err(Error::Config(format!(
            "precis is already initialized at {}. Use --force to overwrite the config.",
            config.paths.base_dir.display()
        )));
    }

    std::fs::create_dir_all(&config.paths.base_dir)?;
    config.validate()?;
    config.save()?;
    info!("Created config at {:?}", config.paths.config_file);

    JobDb::open(&config).await?;
    info!("Jobs database ready at {:?}", config.paths.jobs_db);
    FileDb::open(&config).await?;
    info!("Files database ready at {:?}", config.paths.files_db);

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_creates_everything() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("precis");

        let config = cmd_init(Some(base.clone()), false).await.unwrap();
        assert!(config.is_initialized());
        assert_eq!(config.paths.jobs_db, base.join("jobs.db"));

        let jobs = JobDb::connect(&config).await.unwrap();
        assert!(!jobs.list_languages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_init_refuses_to_overwrite() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().to_path_buf();

        cmd_init(Some(base.clone()), false).await.unwrap();
        assert!(matches!(
            cmd_init(Some(base.clone()), false).await,
            Err(Error::Config(_))
        ));
        assert!(cmd_init(Some(base), true).await.is_ok());
    }
}
