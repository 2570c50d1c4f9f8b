//! Per-blueprint Python environments.
//!
//! An environment is ready exactly when its `.installed` marker exists. The
//! marker is assembled in a sibling `.installed.partial` file while packages
//! install and renamed into place only after the last one succeeds, so a
//! failed or interrupted install never looks ready.
//!
//! Only `ensure_environment`, which knows the declared dependency groups,
//! writes the marker. `ensure_runtime` gives a command something to run in
//! without claiming the environment is ready.
//!
//! Callers must serialize both per blueprint; see
//! [`crate::locks::IdentityLocks`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use crate::blueprint::{BlueprintLayout, REQUIREMENTS_TXT};
use crate::error::EnvError;
use crate::executor::{ProcessLauncher, ProcessSpec};
use crate::rpc::{PackageType, Packages};

/// Package name reported for the first-party helper install.
pub const UTILITY_PACKAGE: &str = "UTILITY";

/// Which host variable feeds `https_proxy` for each installer.
///
/// ansible-galaxy reads `https_proxy` but must be given the plain HTTP proxy.
pub const PROXY_SOURCES: &[(PackageType, &str)] = &[
    (PackageType::Pip, "https_proxy"),
    (PackageType::AnsibleGalaxy, "http_proxy"),
];

/// `https_proxy` override for `kind`, resolved through [`PROXY_SOURCES`].
pub fn proxy_env(kind: PackageType, lookup: impl Fn(&str) -> Option<String>) -> Option<(String, String)> {
    PROXY_SOURCES
        .iter()
        .find(|(installer, _)| *installer == kind)
        .and_then(|(_, source)| lookup(source))
        .map(|value| ("https_proxy".to_string(), value))
}

/// Whether the environment had to be built by this call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Installed,
    AlreadyInstalled,
}

/// One unit of the install sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStep {
    Utility,
    Requirements,
    Pip(String),
    Galaxy(String),
}

impl InstallStep {
    fn from_declared(kind: PackageType, name: &str) -> Self {
        match kind {
            PackageType::Pip if name == REQUIREMENTS_TXT => InstallStep::Requirements,
            PackageType::Pip => InstallStep::Pip(name.to_string()),
            PackageType::AnsibleGalaxy => InstallStep::Galaxy(name.to_string()),
        }
    }

    pub fn package(&self) -> &str {
        match self {
            InstallStep::Utility => UTILITY_PACKAGE,
            InstallStep::Requirements => REQUIREMENTS_TXT,
            InstallStep::Pip(name) | InstallStep::Galaxy(name) => name.as_str(),
        }
    }
}

/// Creates environments and installs their declared dependencies.
#[derive(Clone)]
pub struct EnvironmentManager {
    python_bin: String,
    utility_package_dir: PathBuf,
    launcher: Arc<dyn ProcessLauncher>,
}

impl EnvironmentManager {
    /// A relative `utility_package_dir` is resolved against the current
    /// directory here, since installers run inside the blueprint root.
    pub fn new(
        python_bin: impl Into<String>,
        utility_package_dir: impl Into<PathBuf>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        let utility_package_dir = utility_package_dir.into();
        let utility_package_dir = std::path::absolute(&utility_package_dir).unwrap_or(utility_package_dir);
        Self {
            python_bin: python_bin.into(),
            utility_package_dir,
            launcher,
        }
    }

    pub async fn is_ready(&self, layout: &BlueprintLayout) -> bool {
        fs::metadata(layout.installed_marker())
            .await
            .is_ok_and(|meta| meta.is_file())
    }

    /// Make sure a command can run: create the runtime and copy the helper
    /// package if they are missing. The marker is left alone, so a later
    /// `ensure_environment` still installs the declared packages.
    pub async fn ensure_runtime(
        &self,
        layout: &BlueprintLayout,
        log: &mut Vec<String>,
    ) -> Result<Readiness, EnvError> {
        if self.is_ready(layout).await {
            return Ok(Readiness::AlreadyInstalled);
        }

        self.create_runtime(layout).await?;
        if !self.utility_present(layout).await {
            self.install(layout, &InstallStep::Utility, log).await?;
        }
        Ok(Readiness::Installed)
    }

    async fn utility_present(&self, layout: &BlueprintLayout) -> bool {
        let Some(site_packages) = layout.site_packages().await else {
            return false;
        };
        let Some(name) = self.utility_package_dir.file_name() else {
            return false;
        };
        fs::try_exists(site_packages.join(name)).await.unwrap_or(false)
    }

    /// Make the environment ready, installing `packages` if needed.
    ///
    /// Installer output is appended to `log` whether or not the call
    /// succeeds. When already ready, the marker contents are replayed into
    /// `log` and nothing is spawned.
    pub async fn ensure_environment(
        &self,
        layout: &BlueprintLayout,
        packages: &[Packages],
        log: &mut Vec<String>,
    ) -> Result<Readiness, EnvError> {
        let marker = layout.installed_marker();
        if self.is_ready(layout).await {
            let contents = fs::read_to_string(&marker)
                .await
                .map_err(|source| EnvError::Marker {
                    path: marker.clone(),
                    source,
                })?;
            info!(blueprint = %layout.id(), "Environment already installed");
            log.push(contents);
            return Ok(Readiness::AlreadyInstalled);
        }

        self.create_runtime(layout).await?;

        let partial = partial_marker(&marker);
        let result = self.install_all(layout, packages, &partial, log).await;
        match result {
            Ok(()) => {
                fs::rename(&partial, &marker)
                    .await
                    .map_err(|source| EnvError::Marker {
                        path: marker.clone(),
                        source,
                    })?;
                info!(blueprint = %layout.id(), "Environment installed");
                Ok(Readiness::Installed)
            }
            Err(err) => {
                let _ = fs::remove_file(&partial).await;
                let _ = fs::remove_file(&marker).await;
                error!(blueprint = %layout.id(), error = %err, "Environment install failed");
                Err(err)
            }
        }
    }

    /// Materialize the virtual environment under the blueprint root.
    async fn create_runtime(&self, layout: &BlueprintLayout) -> Result<(), EnvError> {
        let root = layout.root();
        let creation_error = |message: String| EnvError::EnvCreation {
            path: root.to_path_buf(),
            message,
        };

        // create_dir_all tolerates a concurrent creator.
        fs::create_dir_all(root)
            .await
            .map_err(|e| creation_error(e.to_string()))?;

        if fs::try_exists(layout.python()).await.unwrap_or(false) {
            return Ok(());
        }

        info!(blueprint = %layout.id(), "Creating Python virtual environment");
        let spec = ProcessSpec::new(self.python_bin.clone())
            .arg("-m")
            .arg("venv")
            .arg("--system-site-packages")
            .arg(root.to_string_lossy());
        let output = self
            .launcher
            .output(&spec)
            .await
            .map_err(|e| creation_error(e.to_string()))?;
        if !output.success() {
            return Err(creation_error(output.stderr.trim().to_string()));
        }
        Ok(())
    }

    async fn install_all(
        &self,
        layout: &BlueprintLayout,
        packages: &[Packages],
        partial: &Path,
        log: &mut Vec<String>,
    ) -> Result<(), EnvError> {
        let marker_error = |source: std::io::Error| EnvError::Marker {
            path: partial.to_path_buf(),
            source,
        };
        let mut marker = fs::File::create(partial).await.map_err(marker_error)?;

        self.install(layout, &InstallStep::Utility, log).await?;

        for (index, kind) in [PackageType::Pip, PackageType::AnsibleGalaxy].into_iter().enumerate() {
            if index > 0 {
                marker.write_all(b"\r\n").await.map_err(marker_error)?;
                log.push("\n".to_string());
            }
            for group in packages.iter().filter(|group| group.kind == kind) {
                let header = format!("Installed {} packages:\r\n", group.kind.name());
                marker.write_all(header.as_bytes()).await.map_err(marker_error)?;

                for name in &group.package {
                    marker
                        .write_all(format!("   {name}\r\n").as_bytes())
                        .await
                        .map_err(marker_error)?;
                    self.install(layout, &InstallStep::from_declared(kind, name), log)
                        .await?;
                }
            }
        }

        marker.flush().await.map_err(marker_error)?;
        marker.sync_all().await.map_err(marker_error)?;
        Ok(())
    }

    /// Run a single install step once.
    async fn install(
        &self,
        layout: &BlueprintLayout,
        step: &InstallStep,
        log: &mut Vec<String>,
    ) -> Result<(), EnvError> {
        info!(blueprint = %layout.id(), package = step.package(), "Installing package");

        let spec = self.install_spec(layout, step).await?;
        let failure = |stderr: String| EnvError::PackageInstall {
            package: step.package().to_string(),
            stderr,
        };

        let output = self
            .launcher
            .output(&spec)
            .await
            .map_err(|e| failure(e.to_string()))?;
        if output.success() {
            log.push(output.stdout);
            log.push("\n".to_string());
            info!(package = step.package(), "Package install succeeded");
            Ok(())
        } else {
            log.push(output.stderr.clone());
            error!(package = step.package(), "Package install failed");
            Err(failure(output.stderr.trim().to_string()))
        }
    }

    /// Build the installer invocation for `step`.
    ///
    /// The helper copy runs from the executor's own directory; everything
    /// else runs inside the blueprint root.
    pub async fn install_spec(&self, layout: &BlueprintLayout, step: &InstallStep) -> Result<ProcessSpec, EnvError> {
        let host_path = std::env::var("PATH").ok();
        let activation = layout.activation_env(host_path.as_deref());
        let host = |key: &str| std::env::var(key).ok();

        let spec = match step {
            InstallStep::Utility => {
                let site_packages = layout.site_packages().await.ok_or_else(|| EnvError::PackageInstall {
                    package: UTILITY_PACKAGE.to_string(),
                    stderr: format!("no site-packages directory under {}", layout.root().display()),
                })?;
                return Ok(ProcessSpec::new("cp")
                    .arg("-r")
                    .arg(self.utility_package_dir.to_string_lossy())
                    .arg(format!("{}/", site_packages.display()))
                    .envs(activation));
            }
            InstallStep::Requirements => ProcessSpec::new(layout.pip().to_string_lossy())
                .arg("install")
                .arg("-r")
                .arg(layout.requirements_file().to_string_lossy())
                .envs(proxy_env(PackageType::Pip, host)),
            InstallStep::Pip(name) => ProcessSpec::new(layout.pip().to_string_lossy())
                .arg("install")
                .arg(name.as_str())
                .envs(proxy_env(PackageType::Pip, host)),
            InstallStep::Galaxy(name) => ProcessSpec::new("ansible-galaxy")
                .arg("install")
                .arg(name.as_str())
                .arg("-p")
                .arg(layout.ansible_roles_dir().to_string_lossy())
                .envs(proxy_env(PackageType::AnsibleGalaxy, host)),
        };

        let mut spec = spec.envs(activation);
        spec.cwd = Some(layout.root().to_path_buf());
        Ok(spec)
    }
}

fn partial_marker(marker: &Path) -> PathBuf {
    let mut name = marker.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}
