//! Blueprint identity and on-disk layout.

use crate::error::EnvError;
use std::fmt;
use std::path::{Path, PathBuf};

/// Marker written once every dependency group installed successfully.
pub const INSTALLED_MARKER: &str = ".installed";
/// File whose presence proves the blueprint archive was fully extracted.
pub const TOSCA_META_FILE: &str = "TOSCA-Metadata/TOSCA.meta";
/// Reserved package name meaning "install from the blueprint manifest".
pub const REQUIREMENTS_TXT: &str = "requirements.txt";

/// `(name, version, uuid)` key of one deployed blueprint instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlueprintId {
    pub name: String,
    pub version: String,
    pub uuid: String,
}

impl BlueprintId {
    pub fn new(name: impl Into<String>, version: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            uuid: uuid.into(),
        }
    }

    /// Reject parts that would not map to exactly one directory level.
    pub fn validate(&self) -> Result<(), EnvError> {
        let parts = [
            ("blueprintName", &self.name),
            ("blueprintVersion", &self.version),
            ("blueprintUUID", &self.uuid),
        ];
        for (field, value) in parts {
            let invalid = matches!(value.as_str(), "" | "." | "..") || value.contains(['/', '\\', '\0']);
            if invalid {
                return Err(EnvError::InvalidIdentifier {
                    field,
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }

    /// Path of this instance relative to the deploy root.
    pub fn relative_path(&self) -> PathBuf {
        Path::new(&self.name).join(&self.version).join(&self.uuid)
    }
}

impl fmt::Display for BlueprintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.name, self.version, self.uuid)
    }
}

/// Resolved filesystem paths for one blueprint instance.
#[derive(Debug, Clone)]
pub struct BlueprintLayout {
    id: BlueprintId,
    root: PathBuf,
}

impl BlueprintLayout {
    pub fn new(deploy_dir: &Path, id: BlueprintId) -> Self {
        let root = deploy_dir.join(id.relative_path());
        Self { id, root }
    }

    pub fn id(&self) -> &BlueprintId {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn installed_marker(&self) -> PathBuf {
        self.root.join(INSTALLED_MARKER)
    }

    pub fn tosca_meta(&self) -> PathBuf {
        self.root.join(TOSCA_META_FILE)
    }

    pub fn requirements_file(&self) -> PathBuf {
        self.root.join("Environments").join(REQUIREMENTS_TXT)
    }

    pub fn ansible_roles_dir(&self) -> PathBuf {
        self.root.join("Scripts").join("ansible").join("roles")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn python(&self) -> PathBuf {
        self.bin_dir().join("python")
    }

    pub fn pip(&self) -> PathBuf {
        self.bin_dir().join("pip")
    }

    /// The environment's `site-packages` directory, if the runtime exists.
    pub async fn site_packages(&self) -> Option<PathBuf> {
        let mut entries = tokio::fs::read_dir(self.root.join("lib")).await.ok()?;
        let mut candidates = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if !entry.file_name().to_string_lossy().starts_with("python") {
                continue;
            }
            let site = entry.path().join("site-packages");
            if tokio::fs::metadata(&site).await.is_ok_and(|meta| meta.is_dir()) {
                candidates.push(site);
            }
        }
        candidates.sort();
        candidates.pop()
    }

    /// Variables that activate the environment for a child process.
    ///
    /// `PATH` gets the environment's `bin/` first and is de-duplicated so
    /// repeated activation never grows it.
    pub fn activation_env(&self, host_path: Option<&str>) -> Vec<(String, String)> {
        let bin = self.bin_dir().to_string_lossy().into_owned();
        let mut entries: Vec<&str> = vec![bin.as_str()];
        for entry in host_path.unwrap_or_default().split(':') {
            if !entry.is_empty() && !entries.contains(&entry) {
                entries.push(entry);
            }
        }
        let path = entries.join(":");

        vec![
            ("VIRTUAL_ENV".to_string(), self.root.to_string_lossy().into_owned()),
            ("PATH".to_string(), path),
        ]
    }

    /// Check that the blueprint archive is present and complete.
    ///
    /// A missing directory or TOSCA meta file means the upstream processor
    /// must upload the archive again. Identifiers that would leave the deploy
    /// root fail without asking for a re-upload.
    pub fn validate_artifact(&self) -> Result<(), EnvError> {
        self.id.validate()?;
        if !self.root.is_dir() {
            return Err(EnvError::ArtifactMissing {
                reason: format!(
                    "CBA directory {} not found on cmd-exec. CBA will be uploaded by BP proc.",
                    self.id
                ),
            });
        }
        if !self.tosca_meta().is_file() {
            return Err(EnvError::ArtifactMissing {
                reason: format!(
                    "CBA directory {} exists on cmd-exec, but TOSCA meta file is not found. CBA will be uploaded by BP proc.",
                    self.id
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn layout(deploy: &Path) -> BlueprintLayout {
        BlueprintLayout::new(deploy, BlueprintId::new("vFW", "1.0.0", "b3f1"))
    }

    #[test]
    fn test_paths_follow_name_version_uuid() {
        let layout = layout(Path::new("/deploy"));
        assert_eq!(layout.root(), Path::new("/deploy/vFW/1.0.0/b3f1"));
        assert_eq!(
            layout.requirements_file(),
            PathBuf::from("/deploy/vFW/1.0.0/b3f1/Environments/requirements.txt")
        );
        assert_eq!(
            layout.installed_marker(),
            PathBuf::from("/deploy/vFW/1.0.0/b3f1/.installed")
        );
        assert_eq!(layout.id().to_string(), "vFW/1.0.0/b3f1");
    }

    #[test]
    fn test_validate_artifact() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());

        let err = layout.validate_artifact().unwrap_err();
        assert!(err.reupload_required());
        assert!(err.to_string().contains("not found on cmd-exec"));

        std::fs::create_dir_all(layout.root()).unwrap();
        let err = layout.validate_artifact().unwrap_err();
        assert!(err.to_string().contains("TOSCA meta file"));

        std::fs::create_dir_all(layout.root().join("TOSCA-Metadata")).unwrap();
        std::fs::write(layout.tosca_meta(), "TOSCA-Meta-File-Version: 1.0.0\n").unwrap();
        assert!(layout.validate_artifact().is_ok());
    }

    #[test]
    fn test_activation_env_prepends_bin_once() {
        let layout = layout(Path::new("/deploy"));
        let env = layout.activation_env(Some("/usr/bin:/deploy/vFW/1.0.0/b3f1/bin:/bin:/usr/bin"));

        assert_eq!(env[0], ("VIRTUAL_ENV".to_string(), "/deploy/vFW/1.0.0/b3f1".to_string()));
        assert_eq!(
            env[1],
            ("PATH".to_string(), "/deploy/vFW/1.0.0/b3f1/bin:/usr/bin:/bin".to_string())
        );
    }

    #[tokio::test]
    async fn test_site_packages_discovery() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        assert!(layout.site_packages().await.is_none());

        let site = layout.root().join("lib/python3.11/site-packages");
        std::fs::create_dir_all(&site).unwrap();
        std::fs::write(layout.root().join("lib/python-notes.txt"), "").unwrap();
        assert_eq!(layout.site_packages().await, Some(site));
    }

    #[test]
    fn test_identifiers_must_stay_inside_deploy_root() {
        let dir = tempdir().unwrap();
        let deploy = dir.path().join("deploy");
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(outside.join("TOSCA-Metadata")).unwrap();
        std::fs::write(outside.join(TOSCA_META_FILE), "TOSCA-Meta-File-Version: 1.0.0\n").unwrap();

        let escaping = BlueprintLayout::new(&deploy, BlueprintId::new("..", "outside", "."));
        let err = escaping.validate_artifact().unwrap_err();
        assert!(matches!(err, EnvError::InvalidIdentifier { field: "blueprintName", .. }));
        assert!(!err.reupload_required());

        for id in [
            BlueprintId::new("vFW", "1.0.0", ""),
            BlueprintId::new("vFW", "..", "b3f1"),
            BlueprintId::new("vFW", "1.0.0", "a/b"),
            BlueprintId::new("v\0FW", "1.0.0", "b3f1"),
        ] {
            assert!(
                matches!(id.validate(), Err(EnvError::InvalidIdentifier { .. })),
                "{id:?} accepted"
            );
        }
        assert!(BlueprintId::new("vFW", "1.0.0", "b3f1").validate().is_ok());
    }
}
