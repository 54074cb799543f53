//! Project manager
//!
//! Workspace layout:
//!
//! ```text
//! <root>/manifest.json
//! <root>/projects/<id>/   git checkout of each project
//! <root>/pyenvs/<id>/     virtualenv of each project
//! ```

use super::manifest::{Manifest, ProjectEntry};
use crate::error::{ProjectError, ProjectResult};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::net::UdpSocket;
use tokio::process::Command;
use tracing::{info, warn};

const TARGET_EXTENSIONS: [&str; 3] = ["py", "c", "cpp"];

/// Line of `git branch` output marking the checked-out branch
fn parse_current_branch(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("* "))
        .map(|b| b.trim().to_string())
}

/// Short branch names from `git branch -a`, deduplicated and sorted
/// case-insensitively
fn parse_branches(output: &str) -> Vec<String> {
    let unique: BTreeSet<&str> = output
        .lines()
        .map(|line| {
            if let Some(current) = line.strip_prefix("* ") {
                current.trim()
            } else if let Some(pos) = line.rfind('/') {
                line[pos + 1..].trim()
            } else {
                line.trim()
            }
        })
        .filter(|b| !b.is_empty())
        .collect();

    let mut branches: Vec<String> = unique.into_iter().map(str::to_string).collect();
    branches.sort_by_key(|b| b.to_lowercase());
    branches
}

fn stdout_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// Manages installed projects and their selection
pub struct ProjectManager {
    root: PathBuf,
    default_name: String,
}

impl ProjectManager {
    pub fn new(root: impl Into<PathBuf>, default_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            default_name: default_name.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    fn manifest(&self) -> ProjectResult<Manifest> {
        Manifest::load(&self.manifest_path())
    }

    fn save(&self, manifest: &Manifest) -> ProjectResult<()> {
        manifest.save(&self.manifest_path())
    }

    fn project_dir(&self, id: &str) -> PathBuf {
        self.root.join("projects").join(id)
    }

    fn env_dir(&self, id: &str) -> PathBuf {
        self.root.join("pyenvs").join(id)
    }

    fn selected_id(&self) -> ProjectResult<String> {
        self.manifest()?
            .selected_project
            .ok_or(ProjectError::NoProjects)
    }

    /// Advertised robot name
    pub fn name(&self) -> String {
        self.manifest()
            .ok()
            .and_then(|m| m.name)
            .unwrap_or_else(|| self.default_name.clone())
    }

    /// LAN address of the outbound interface
    pub async fn local_ip(&self) -> ProjectResult<String> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect("8.8.8.8:80").await?;
        Ok(socket.local_addr()?.ip().to_string())
    }

    pub fn list_projects(&self) -> ProjectResult<String> {
        let manifest = self.manifest()?;
        let ids: Vec<&str> = manifest.projects.iter().map(|p| p.id.as_str()).collect();
        Ok(ids.join(","))
    }

    pub fn selected_project(&self) -> ProjectResult<String> {
        self.selected_id()
    }

    /// Select an installed project
    pub fn switch_project(&self, id: &str) -> ProjectResult<()> {
        let mut manifest = self.manifest()?;
        if manifest.project(id).is_none() {
            return Err(ProjectError::ProjectNotFound);
        }
        manifest.selected_project = Some(id.to_string());
        self.save(&manifest)?;
        info!("[PROJECT] Switched to {}", id);
        Ok(())
    }

    /// Directory of the selected project
    pub fn project_directory(&self) -> ProjectResult<PathBuf> {
        Ok(self.project_dir(&self.selected_id()?))
    }

    pub fn target(&self) -> ProjectResult<String> {
        let manifest = self.manifest()?;
        manifest
            .selected()
            .map(|p| p.target.clone())
            .ok_or(ProjectError::ProjectNotFound)
    }

    pub fn change_target(&self, target: &str) -> ProjectResult<()> {
        let mut manifest = self.manifest()?;
        let project = manifest
            .selected_mut()
            .ok_or(ProjectError::ProjectNotFound)?;
        project.target = target.to_string();
        self.save(&manifest)
    }

    /// Runnable files of the selected project as `./relative/path`
    pub fn targets(&self) -> ProjectResult<Vec<String>> {
        let dir = self.project_directory()?;
        let mut found = Vec::new();
        collect_targets(&dir, &dir, &mut found)?;
        found.sort();
        Ok(found)
    }

    /// Environment and script for the selected project's target
    pub fn target_paths(&self) -> ProjectResult<(PathBuf, PathBuf)> {
        let manifest = self.manifest()?;
        let id = manifest
            .selected_project
            .clone()
            .ok_or(ProjectError::NoProjects)?;
        let target = manifest
            .project(&id)
            .map(|p| p.target.clone())
            .filter(|t| !t.is_empty())
            .ok_or(ProjectError::NoTarget)?;

        let script = self.project_dir(&id).join(&target);
        match script.extension().and_then(|e| e.to_str()) {
            Some("py") => Ok((self.env_dir(&id), script)),
            other => Err(ProjectError::Unsupported(
                other.unwrap_or(target.as_str()).to_string(),
            )),
        }
    }

    async fn git(&self, args: &[&str]) -> ProjectResult<String> {
        let dir = self.project_directory()?;
        let output = Command::new("git")
            .args(args)
            .current_dir(&dir)
            .output()
            .await?;
        if !output.status.success() {
            return Err(ProjectError::Command(stderr_text(&output)));
        }
        Ok(stdout_text(&output))
    }

    pub async fn current_branch(&self) -> ProjectResult<String> {
        let output = self.git(&["branch"]).await?;
        parse_current_branch(&output)
            .ok_or_else(|| ProjectError::Command("Unexpected error occurred".into()))
    }

    pub async fn branches(&self) -> ProjectResult<Vec<String>> {
        Ok(parse_branches(&self.git(&["branch", "-a"]).await?))
    }

    pub async fn commit_hash(&self) -> ProjectResult<String> {
        let output = self.git(&["rev-parse", "HEAD"]).await?;
        Ok(output.trim().chars().take(7).collect())
    }

    /// Check out a branch, reinstall requirements, and re-pick the target if
    /// it no longer exists
    pub async fn switch_branch(&self, branch: &str) -> ProjectResult<()> {
        self.git(&["checkout", branch]).await?;

        let id = self.selected_id()?;
        self.install_requirements(&id).await;

        let target = self.target()?;
        if target.is_empty() || !self.project_dir(&id).join(&target).exists() {
            if let Some(first) = self.targets()?.into_iter().next() {
                info!("[PROJECT] Target {} vanished, using {}", target, first);
                self.change_target(&first)?;
            }
        }
        Ok(())
    }

    pub async fn pull_changes(&self) -> ProjectResult<()> {
        let pulled = self.git(&["pull"]).await;
        self.install_requirements(&self.selected_id()?).await;
        pulled.map(|_| ())
    }

    /// Clone, set up and select a new project
    pub async fn install_project(&self, id: &str, url: &str, token: Option<&str>) -> ProjectResult<()> {
        let mut manifest = self.manifest()?;
        if manifest.project(id).is_some() {
            return Err(ProjectError::AlreadyInstalled);
        }

        if let Some(token) = token {
            write_deploy_key(token)?;
        }

        let checkout = self.project_dir(id);
        let output = Command::new("git")
            .arg("clone")
            .arg("--progress")
            .arg(url)
            .arg(&checkout)
            .current_dir(&self.root)
            .output()
            .await?;
        // git reports progress on stderr, so only the checkout tells success
        if !checkout.is_dir() {
            warn!("[PROJECT] Clone of {} failed: {}", url, stderr_text(&output));
            return Err(ProjectError::CloneFailed);
        }

        let venv = Command::new("python3")
            .arg("-m")
            .arg("venv")
            .arg(self.env_dir(id))
            .current_dir(&self.root)
            .output()
            .await;
        if let Err(e) = venv {
            warn!("[PROJECT] Failed to create environment for {}: {}", id, e);
        }
        self.install_requirements(id).await;

        let previous = manifest.selected_project.clone();
        manifest.projects.push(ProjectEntry {
            id: id.to_string(),
            target: String::new(),
        });
        manifest.selected_project = Some(id.to_string());
        self.save(&manifest)?;

        match self.targets().map(|t| t.into_iter().next()) {
            Ok(Some(first)) => {
                self.change_target(&first)?;
                info!("[PROJECT] Installed {} with target {}", id, first);
                Ok(())
            }
            _ => {
                manifest.projects.retain(|p| p.id != id);
                manifest.selected_project = previous;
                self.save(&manifest)?;
                if let Err(e) = std::fs::remove_dir_all(&checkout) {
                    warn!("[PROJECT] Failed to remove {}: {}", checkout.display(), e);
                }
                Err(ProjectError::NoTargets)
            }
        }
    }

    /// Install the first `requirements.txt` found in the project, if any
    async fn install_requirements(&self, id: &str) {
        let Some(requirements) = find_file(&self.project_dir(id), "requirements.txt") else {
            info!("[PROJECT] No requirements for {}", id);
            return;
        };

        let pip = self.env_dir(id).join("bin").join("pip");
        info!("[PROJECT] Installing {}", requirements.display());
        match Command::new(&pip)
            .arg("install")
            .arg("-r")
            .arg(&requirements)
            .output()
            .await
        {
            Ok(output) if !output.status.success() => {
                warn!("[PROJECT] pip install failed: {}", stderr_text(&output));
            }
            Ok(_) => {}
            Err(e) => warn!("[PROJECT] Failed to run {}: {}", pip.display(), e),
        }
    }

    /// Run a shell command in the selected project's directory.
    ///
    /// Any output on stderr counts as failure.
    pub async fn run_shell(&self, command: &str) -> ProjectResult<String> {
        let dir = self.project_directory()?;
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&dir)
            .output()
            .await?;

        let stderr = stderr_text(&output);
        if !stderr.is_empty() {
            return Err(ProjectError::Command(stderr));
        }
        Ok(stdout_text(&output))
    }
}

fn write_deploy_key(token: &str) -> ProjectResult<()> {
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
    let ssh = home.join(".ssh");
    std::fs::create_dir_all(&ssh)?;
    let key = ssh.join("github_deploy_key");
    std::fs::write(&key, token)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

fn collect_targets(base: &Path, dir: &Path, found: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            if !is_hidden(&path) {
                collect_targets(base, &path, found)?;
            }
            continue;
        }

        let runnable = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| TARGET_EXTENSIONS.contains(&e));
        if runnable {
            if let Ok(relative) = path.strip_prefix(base) {
                found.push(format!("./{}", relative.display()));
            }
        }
    }
    Ok(())
}

fn find_file(dir: &Path, name: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut subdirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if path.file_name().is_some_and(|n| n == name) {
            return Some(path);
        }
    }
    subdirs.iter().find_map(|d| find_file(d, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace() -> (TempDir, ProjectManager) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("projects/demo/src")).unwrap();
        std::fs::create_dir_all(root.join("projects/demo/.git")).unwrap();
        std::fs::create_dir_all(root.join("projects/other")).unwrap();
        std::fs::write(root.join("projects/demo/main.py"), "print('hi')\n").unwrap();
        std::fs::write(root.join("projects/demo/src/driver.c"), "").unwrap();
        std::fs::write(root.join("projects/demo/README.md"), "").unwrap();
        std::fs::write(root.join("projects/demo/.git/hook.py"), "").unwrap();
        std::fs::write(
            root.join("manifest.json"),
            r#"{"name": "rover", "selected_project": "demo",
                "projects": [{"id": "demo", "target": "./main.py"}, {"id": "other", "target": ""}]}"#,
        )
        .unwrap();

        let manager = ProjectManager::new(root, "robot");
        (dir, manager)
    }

    #[test]
    fn test_parse_git_branches() {
        let output = "  develop\n* main\n  remotes/origin/HEAD -> origin/main\n  remotes/origin/Feature\n  remotes/origin/main\n";
        assert_eq!(parse_current_branch(output).as_deref(), Some("main"));
        assert_eq!(parse_branches(output), vec!["develop", "Feature", "main"]);
        assert_eq!(parse_current_branch("  develop\n"), None);
    }

    #[test]
    fn test_parse_branches_drops_non_adjacent_duplicates() {
        let output = "  b\n  B\n  remotes/origin/b\n* a\n  remotes/upstream/B\n";
        assert_eq!(parse_branches(output), vec!["a", "B", "b"]);
    }

    #[test]
    fn test_list_and_switch_projects() {
        let (_dir, manager) = workspace();
        assert_eq!(manager.list_projects().unwrap(), "demo,other");
        assert_eq!(manager.selected_project().unwrap(), "demo");
        assert_eq!(manager.name(), "rover");

        manager.switch_project("other").unwrap();
        assert_eq!(manager.selected_project().unwrap(), "other");
        assert!(manager.project_directory().unwrap().ends_with("projects/other"));
        assert!(matches!(
            manager.switch_project("missing"),
            Err(ProjectError::ProjectNotFound)
        ));
    }

    #[test]
    fn test_empty_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProjectManager::new(dir.path(), "robot");

        assert_eq!(manager.name(), "robot");
        assert_eq!(manager.list_projects().unwrap(), "");
        assert!(matches!(manager.selected_project(), Err(ProjectError::NoProjects)));
        assert!(matches!(manager.target_paths(), Err(ProjectError::NoProjects)));
    }

    #[test]
    fn test_targets_skip_hidden_directories() {
        let (_dir, manager) = workspace();
        assert_eq!(manager.targets().unwrap(), vec!["./main.py", "./src/driver.c"]);
    }

    #[test]
    fn test_target_paths() {
        let (dir, manager) = workspace();
        let (env, script) = manager.target_paths().unwrap();
        assert_eq!(env, dir.path().join("pyenvs/demo"));
        assert!(script.ends_with("main.py"));

        manager.change_target("./src/driver.c").unwrap();
        assert_eq!(manager.target().unwrap(), "./src/driver.c");
        assert_eq!(
            manager.target_paths().unwrap_err().to_string(),
            "c files are not yet supported"
        );

        manager.switch_project("other").unwrap();
        assert!(matches!(manager.target_paths(), Err(ProjectError::NoTarget)));
    }

    #[test]
    fn test_find_requirements() {
        let (dir, _manager) = workspace();
        let nested = dir.path().join("projects/demo/src/requirements.txt");
        std::fs::write(&nested, "numpy\n").unwrap();

        assert_eq!(find_file(&dir.path().join("projects/demo"), "requirements.txt"), Some(nested));
        assert_eq!(find_file(&dir.path().join("projects/other"), "requirements.txt"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_shell_in_project_directory() {
        let (_dir, manager) = workspace();

        let listing = manager.run_shell("ls").await.unwrap();
        assert!(listing.contains("main.py"));

        let err = manager.run_shell("echo broken >&2").await.unwrap_err();
        assert_eq!(err.to_string(), "broken\n");
    }

    #[tokio::test]
    async fn test_install_rejects_existing_project() {
        let (_dir, manager) = workspace();
        assert!(matches!(
            manager.install_project("demo", "https://example.com/demo.git", None).await,
            Err(ProjectError::AlreadyInstalled)
        ));
    }
}
