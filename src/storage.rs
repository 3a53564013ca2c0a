//! On-disk state: per-device settings keyed by the sanitized identity
//! string, the saved login token, and the stored list of static devices.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::RawIdentity;

const DEVICES_DIR: &str = "devices";
const AUTH_FILE: &str = "auth.json";
const STATIC_FILE: &str = "static_printers.json";

/// Settings remembered for one device.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DeviceSettings {
    /// Alias of the selected device-type profile. Doubles as the offline
    /// device-type cache.
    pub profile_alias: Option<String>,
    /// Name set by the remote service.
    pub name: Option<String>,
    /// Whether the camera is enabled for this device.
    pub camera_enabled: bool,
}

/// Saved login.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AuthRecord {
    /// User token returned by the last successful login.
    pub user_token: Option<String>,
    /// Login name the token belongs to.
    pub login: Option<String>,
}

/// Handle to the state directory.
#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Storage rooted at `root`. Directories are created on first write.
    pub fn new(root: &Path) -> Self {
        Self { root: root.to_owned() }
    }

    fn device_path(&self, id_string: &str) -> PathBuf {
        self.root.join(DEVICES_DIR).join(format!("{}.json", id_string))
    }

    /// Settings for a device; empty if none were saved or the file was
    /// corrupt.
    pub async fn load_device(&self, id_string: &str) -> DeviceSettings {
        load_or_discard(&self.device_path(id_string)).await
    }

    /// Save settings for a device.
    pub async fn save_device(&self, id_string: &str, settings: &DeviceSettings) -> Result<()> {
        save(&self.device_path(id_string), settings).await
    }

    /// Update settings for a device in place.
    pub async fn update_device(
        &self,
        id_string: &str,
        f: impl FnOnce(&mut DeviceSettings),
    ) -> Result<DeviceSettings> {
        let mut settings = self.load_device(id_string).await;
        f(&mut settings);
        self.save_device(id_string, &settings).await?;
        Ok(settings)
    }

    /// The saved login.
    pub async fn load_auth(&self) -> AuthRecord {
        load_or_discard(&self.root.join(AUTH_FILE)).await
    }

    /// Save the login.
    pub async fn save_auth(&self, record: &AuthRecord) -> Result<()> {
        save(&self.root.join(AUTH_FILE), record).await
    }

    /// Forget the saved login.
    pub async fn clear_auth(&self) -> Result<()> {
        remove_if_exists(&self.root.join(AUTH_FILE)).await
    }

    /// Devices the operator added by hand.
    pub async fn load_static_printers(&self) -> Vec<RawIdentity> {
        load_or_discard(&self.root.join(STATIC_FILE)).await
    }

    /// Replace the stored static device list.
    pub async fn save_static_printers(&self, printers: &[RawIdentity]) -> Result<()> {
        save(&self.root.join(STATIC_FILE), &printers).await
    }
}

async fn load_or_discard<T: DeserializeOwned + Default>(path: &Path) -> T {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            tracing::warn!(path = format!("{:?}", path), error = format!("{:?}", e), "can not read file");
            return T::default();
        }
    };

    match serde_json::from_str(&contents) {
        Ok(value) => value,
        Err(e) => {
            tracing::error!(
                path = format!("{:?}", path),
                error = format!("{:?}", e),
                "removing invalid settings file"
            );
            if let Err(e) = remove_if_exists(path).await {
                tracing::warn!(error = format!("{:?}", e), "can not remove invalid settings file");
            }
            T::default()
        }
    }
}

async fn save<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {:?}", parent))?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("writing {:?}", tmp))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("replacing {:?}", path))?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use testresult::TestResult;

    use super::*;

    #[tokio::test]
    async fn test_device_settings_round_trip() -> TestResult {
        let dir = tempfile::tempdir()?;
        let storage = Storage::new(dir.path());
        assert_eq!(storage.load_device("A_B_C").await, DeviceSettings::default());

        storage.update_device("A_B_C", |s| s.profile_alias = Some("mk3".to_owned())).await?;
        assert_eq!(storage.load_device("A_B_C").await.profile_alias.as_deref(), Some("mk3"));
        assert_eq!(storage.load_device("A_B_D").await, DeviceSettings::default());
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_file_is_removed() -> TestResult {
        let dir = tempfile::tempdir()?;
        let storage = Storage::new(dir.path());
        std::fs::create_dir_all(dir.path().join(DEVICES_DIR))?;
        let path = dir.path().join(DEVICES_DIR).join("X.json");
        std::fs::write(&path, "{not json")?;

        assert_eq!(storage.load_device("X").await, DeviceSettings::default());
        assert!(!path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_auth_store() -> TestResult {
        let dir = tempfile::tempdir()?;
        let storage = Storage::new(dir.path());
        let record = AuthRecord {
            user_token: Some("t".to_owned()),
            login: Some("me".to_owned()),
        };
        storage.save_auth(&record).await?;
        assert_eq!(storage.load_auth().await, record);
        storage.clear_auth().await?;
        storage.clear_auth().await?;
        assert_eq!(storage.load_auth().await, AuthRecord::default());
        Ok(())
    }
}
