use async_trait::async_trait;
use log::{error, info};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::utils::error::CalibrationError;

#[async_trait]
pub trait DataSender: Send + Sync {
    async fn send(&self, data: &str) -> Result<(), CalibrationError>;
    fn sender_type(&self) -> &str;
    fn destination(&self) -> &str;
}

pub struct ConsoleSender;

#[async_trait]
impl DataSender for ConsoleSender {
    async fn send(&self, data: &str) -> Result<(), CalibrationError> {
        println!("{}", data);
        Ok(())
    }

    fn sender_type(&self) -> &str {
        "console"
    }

    fn destination(&self) -> &str {
        "stdout"
    }
}

pub struct FileSender {
    path: PathBuf,
    display: String,
    append: bool,
}

impl FileSender {
    pub fn new<P: AsRef<Path>>(path: P, append: bool) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            display: path.as_ref().to_string_lossy().to_string(),
            append,
        }
    }

    fn output_error(&self, action: &str, e: std::io::Error) -> CalibrationError {
        error!("❌ Failed to {} {}: {}", action, self.display, e);
        CalibrationError::Output(format!("cannot {} {}: {}", action, self.display, e))
    }
}

#[async_trait]
impl DataSender for FileSender {
    async fn send(&self, data: &str) -> Result<(), CalibrationError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.output_error("create directory for", e))?;
        }

        if self.append {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| self.output_error("open", e))?;
            file.write_all(format!("{}\n", data).as_bytes())
                .await
                .map_err(|e| self.output_error("write", e))?;
            file.flush().await.map_err(|e| self.output_error("write", e))?;
        } else {
            fs::write(&self.path, format!("{}\n", data))
                .await
                .map_err(|e| self.output_error("write", e))?;
        }

        info!("✅ {} bytes written to {}", data.len(), self.display);
        Ok(())
    }

    fn sender_type(&self) -> &str {
        "file"
    }

    fn destination(&self) -> &str {
        &self.display
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_sender_overwrites_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("session.csv");

        FileSender::new(&path, false).send("header").await.unwrap();
        FileSender::new(&path, true).send("row").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "header\nrow\n");

        FileSender::new(&path, false).send("fresh").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "fresh\n");
    }
}
