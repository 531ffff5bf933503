//! Pipeline configurations and the step registry, read from a release
//! repository checkout.
//!
//! ```text
//! <release-repo>/ci-operator/config/<org>/<repo>/<org>-<repo>-<branch>.yaml
//! <release-repo>/ci-operator/step-registry/**/<name>-{ref,chain,workflow,observer}.yaml
//! ```
//!
//! The checkout is updated in place by git-sync; [`FileConfigAgent::watch`]
//! reloads on file-system changes and bumps the generation so the controller
//! recomputes its desired set.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use ci_mirror_core::error::{MirrorError, Result};
use ci_mirror_core::pipeline::{
    LiteralTestStep, MultiStageTestConfiguration, Observer, ReleaseBuildConfiguration, TestStep,
};
use ci_mirror_runtime::{ConfigProvider, RegistryIndex, StepRegistry};

const CONFIG_DIR: &str = "ci-operator/config";
const REGISTRY_DIR: &str = "ci-operator/step-registry";

/// Quiet period before a burst of file-system events triggers a reload.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Deserialize)]
struct RefDocument {
    #[serde(rename = "ref")]
    reference: LiteralTestStep,
}

#[derive(Deserialize)]
struct ChainDocument {
    chain: NamedSteps<Vec<TestStep>>,
}

#[derive(Deserialize)]
struct WorkflowDocument {
    workflow: NamedSteps<MultiStageTestConfiguration>,
}

#[derive(Deserialize)]
struct NamedSteps<T> {
    #[serde(rename = "as")]
    name: String,
    steps: T,
}

#[derive(Deserialize)]
struct ObserverDocument {
    observer: Observer,
}

#[derive(Default)]
struct Loaded {
    configs: Vec<ReleaseBuildConfiguration>,
    registry: RegistryIndex,
}

/// Configuration provider and step registry backed by a release repository.
pub struct FileConfigAgent {
    root: PathBuf,
    loaded: RwLock<Loaded>,
    generation: watch::Sender<u64>,
}

impl FileConfigAgent {
    /// Load everything under `root`. Fails when the configuration directory
    /// cannot be read at all; individual malformed files are skipped.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let loaded = load_repository(&root)?;
        let (generation, _) = watch::channel(0);
        Ok(Self {
            root,
            loaded: RwLock::new(loaded),
            generation,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Re-read the repository and publish a new generation. On failure the
    /// previous contents stay in effect.
    pub fn reload(&self) -> Result<()> {
        let loaded = load_repository(&self.root)?;
        tracing::info!(
            configs = loaded.configs.len(),
            registry_entries = loaded.registry.len(),
            "Reloaded release repository"
        );
        *self.loaded.write() = loaded;
        self.generation.send_modify(|g| *g += 1);
        Ok(())
    }

    /// Reload whenever files under the repository change, until `shutdown`.
    pub fn watch(self: &Arc<Self>, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let (tx, mut rx) = mpsc::channel::<()>(16);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    let _ = tx.try_send(());
                }
            }
        })
        .map_err(|e| MirrorError::ConfigError(format!("failed to create file watcher: {}", e)))?;
        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| {
                MirrorError::ConfigError(format!(
                    "failed to watch {}: {}",
                    self.root.display(),
                    e
                ))
            })?;
        tracing::info!(path = %self.root.display(), "Watching release repository for changes");

        let agent = Arc::clone(self);
        Ok(tokio::spawn(async move {
            // Dropping the watcher stops the notifications.
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                    }
                }

                tokio::time::sleep(RELOAD_DEBOUNCE).await;
                while rx.try_recv().is_ok() {}

                let reloading = Arc::clone(&agent);
                match tokio::task::spawn_blocking(move || reloading.reload()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(error = %e, "Failed to reload release repository"),
                    Err(e) => tracing::error!(error = %e, "Release repository reload panicked"),
                }
            }
        }))
    }
}

impl ConfigProvider for FileConfigAgent {
    fn configs(&self) -> Result<Vec<ReleaseBuildConfiguration>> {
        Ok(self.loaded.read().configs.clone())
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

impl StepRegistry for FileConfigAgent {
    fn reference(&self, name: &str) -> Option<LiteralTestStep> {
        self.loaded.read().registry.reference(name)
    }

    fn chain(&self, name: &str) -> Option<Vec<TestStep>> {
        self.loaded.read().registry.chain(name)
    }

    fn workflow(&self, name: &str) -> Option<MultiStageTestConfiguration> {
        self.loaded.read().registry.workflow(name)
    }

    fn observer(&self, name: &str) -> Option<Observer> {
        self.loaded.read().registry.observer(name)
    }
}

fn load_repository(root: &Path) -> Result<Loaded> {
    let config_dir = root.join(CONFIG_DIR);
    if !config_dir.is_dir() {
        return Err(MirrorError::ConfigError(format!(
            "configuration directory {} does not exist",
            config_dir.display()
        )));
    }

    let configs = load_configs(&config_dir);
    let registry_dir = root.join(REGISTRY_DIR);
    let registry = if registry_dir.is_dir() {
        load_registry(&registry_dir)
    } else {
        tracing::warn!(path = %registry_dir.display(), "No step registry found");
        RegistryIndex::default()
    };

    Ok(Loaded { configs, registry })
}

fn yaml_files(dir: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
}

fn load_configs(config_dir: &Path) -> Vec<ReleaseBuildConfiguration> {
    let mut configs = Vec::new();
    for path in yaml_files(config_dir) {
        let parsed = std::fs::read_to_string(&path)
            .map_err(MirrorError::from)
            .and_then(|data| ReleaseBuildConfiguration::from_yaml(&data));
        match parsed {
            Ok(mut config) => {
                fill_metadata(&mut config, config_dir, &path);
                configs.push(config);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping malformed configuration")
            }
        }
    }
    configs.sort_by_key(|config| config.metadata.to_string());
    configs
}

/// Derive org, repo and branch from `<org>/<repo>/<org>-<repo>-<branch>.yaml`
/// when the document does not carry generated metadata.
fn fill_metadata(config: &mut ReleaseBuildConfiguration, config_dir: &Path, path: &Path) {
    if !config.metadata.org.is_empty() {
        return;
    }
    let Ok(relative) = path.strip_prefix(config_dir) else {
        return;
    };
    let parts: Vec<&str> = relative
        .iter()
        .filter_map(|part| part.to_str())
        .collect();
    let [org, repo, file] = parts.as_slice() else {
        return;
    };
    let stem = file
        .trim_end_matches(".yaml")
        .trim_end_matches(".yml");
    let prefix = format!("{}-{}-", org, repo);

    config.metadata.org = org.to_string();
    config.metadata.repo = repo.to_string();
    if let Some(rest) = stem.strip_prefix(&prefix) {
        match rest.split_once("__") {
            Some((branch, variant)) => {
                config.metadata.branch = branch.to_string();
                config.metadata.variant = variant.to_string();
            }
            None => config.metadata.branch = rest.to_string(),
        }
    }
}

fn load_registry(registry_dir: &Path) -> RegistryIndex {
    let mut index = RegistryIndex::default();
    for path in yaml_files(registry_dir) {
        let Some(file) = path.file_name().and_then(|f| f.to_str()) else {
            continue;
        };
        let stem = file.trim_end_matches(".yaml").trim_end_matches(".yml");
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable registry file");
                continue;
            }
        };

        let added = if stem.ends_with("-ref") {
            serde_yaml::from_str::<RefDocument>(&data).map(|doc| {
                index
                    .references
                    .insert(doc.reference.as_name.clone(), doc.reference);
            })
        } else if stem.ends_with("-chain") {
            serde_yaml::from_str::<ChainDocument>(&data).map(|doc| {
                index.chains.insert(doc.chain.name, doc.chain.steps);
            })
        } else if stem.ends_with("-workflow") {
            serde_yaml::from_str::<WorkflowDocument>(&data).map(|doc| {
                index.workflows.insert(doc.workflow.name, doc.workflow.steps);
            })
        } else if stem.ends_with("-observer") {
            serde_yaml::from_str::<ObserverDocument>(&data).map(|doc| {
                index
                    .observers
                    .insert(doc.observer.name.clone(), doc.observer);
            })
        } else {
            // Metadata and other companion files.
            Ok(())
        };

        if let Err(e) = added {
            tracing::warn!(path = %path.display(), error = %e, "Skipping malformed registry file");
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
base_images:
  base:
    namespace: ocp
    name: "4.15"
    tag: base
tests:
- as: e2e
  steps:
    workflow: ipi
"#;

    const REF: &str = r#"
ref:
  as: install
  from_image:
    namespace: ci
    name: installer
    tag: latest
  commands: install-commands.sh
"#;

    const CHAIN: &str = r#"
chain:
  as: setup
  steps:
  - ref: install
"#;

    const WORKFLOW: &str = r#"
workflow:
  as: ipi
  steps:
    pre:
    - chain: setup
    observers:
      enable:
      - watcher
"#;

    const OBSERVER: &str = r#"
observer:
  name: watcher
  from_image:
    namespace: ci
    name: observer
    tag: v1
"#;

    fn write(root: &Path, relative: &str, data: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    fn repository() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(
            root,
            "ci-operator/config/openshift/ci-tools/openshift-ci-tools-master.yaml",
            CONFIG,
        );
        write(root, "ci-operator/step-registry/install/install-ref.yaml", REF);
        write(
            root,
            "ci-operator/step-registry/install/install-commands.sh",
            "#!/bin/bash",
        );
        write(root, "ci-operator/step-registry/setup/setup-chain.yaml", CHAIN);
        write(root, "ci-operator/step-registry/ipi/ipi-workflow.yaml", WORKFLOW);
        write(
            root,
            "ci-operator/step-registry/watcher/watcher-observer.yaml",
            OBSERVER,
        );
        write(
            root,
            "ci-operator/step-registry/ipi/ipi-workflow.metadata.json",
            "{}",
        );
        dir
    }

    #[test]
    fn test_load_configs_and_registry() {
        let dir = repository();
        let agent = FileConfigAgent::load(dir.path()).unwrap();

        let configs = agent.configs().unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].metadata.to_string(), "openshift/ci-tools@master");

        assert!(agent.reference("install").is_some());
        assert_eq!(agent.chain("setup").unwrap().len(), 1);
        assert!(agent.workflow("ipi").is_some());
        assert!(agent.observer("watcher").is_some());
        assert!(agent.reference("missing").is_none());
    }

    #[test]
    fn test_variant_metadata_from_path() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "ci-operator/config/org/repo/org-repo-release-4.15__okd.yaml",
            "{}",
        );
        let agent = FileConfigAgent::load(dir.path()).unwrap();
        let configs = agent.configs().unwrap();
        assert_eq!(configs[0].metadata.branch, "release-4.15");
        assert_eq!(configs[0].metadata.variant, "okd");
    }

    #[test]
    fn test_malformed_files_are_skipped() {
        let dir = repository();
        write(
            dir.path(),
            "ci-operator/config/org/repo/org-repo-main.yaml",
            "tests: [not, a, test",
        );
        write(
            dir.path(),
            "ci-operator/step-registry/bad/bad-ref.yaml",
            "ref: 12",
        );
        let agent = FileConfigAgent::load(dir.path()).unwrap();
        assert_eq!(agent.configs().unwrap().len(), 1);
        assert!(agent.reference("install").is_some());
    }

    #[test]
    fn test_missing_config_dir_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(FileConfigAgent::load(dir.path()).is_err());
    }

    #[test]
    fn test_reload_bumps_generation() {
        let dir = repository();
        let agent = FileConfigAgent::load(dir.path()).unwrap();
        let rx = agent.subscribe();
        assert_eq!(agent.generation(), 0);

        write(
            dir.path(),
            "ci-operator/config/org/other/org-other-main.yaml",
            "{}",
        );
        agent.reload().unwrap();
        assert_eq!(*rx.borrow(), 1);
        assert_eq!(agent.configs().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_watch_reloads_on_change() {
        let dir = repository();
        let agent = Arc::new(FileConfigAgent::load(dir.path()).unwrap());
        let mut rx = agent.subscribe();
        let shutdown = CancellationToken::new();
        let handle = agent.watch(shutdown.clone()).unwrap();

        write(
            dir.path(),
            "ci-operator/config/org/other/org-other-main.yaml",
            "{}",
        );
        tokio::time::timeout(Duration::from_secs(10), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(agent.configs().unwrap().len(), 2);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_resolves_through_runtime() {
        let dir = repository();
        let agent = FileConfigAgent::load(dir.path()).unwrap();
        let config = &agent.configs().unwrap()[0];
        let (resolved, error) = ci_mirror_runtime::resolve_config(config, &agent);
        assert!(error.is_none(), "{error:?}");

        let resolution = ci_mirror_runtime::resolve_references(&resolved);
        assert!(resolution.is_complete());
        assert!(resolution.references.contains_key("ocp/4.15:base"));
        assert!(resolution.references.contains_key("ci/installer:latest"));
        assert!(resolution.references.contains_key("ci/observer:v1"));
    }
}
