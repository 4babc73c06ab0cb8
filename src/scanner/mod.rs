//! Scanner: parses component source files into `ComponentInfo` and upserts
//! them into the `Registry` (`spec.md` §4.3).

mod parser;

use crate::config::ScannerConfig;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::types::ComponentInfo;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

const IGNORED_DIR_NAMES: &[&str] = &[".git", ".hg", ".svn", "node_modules", "target", "vendor"];

/// Result of scanning a single file: components that were registered, plus
/// any parse errors that prevented a component from being registered.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub registered: Vec<String>,
    pub errors: Vec<Error>,
}

pub struct Scanner {
    registry: Registry,
    project_root: PathBuf,
    config: ScannerConfig,
    /// name -> file path it was first registered from, to support
    /// `DuplicateComponent` detection across files.
    owners: std::sync::RwLock<HashMap<String, PathBuf>>,
}

impl Scanner {
    pub fn new(registry: Registry, project_root: impl Into<PathBuf>, config: ScannerConfig) -> Self {
        Self {
            registry,
            project_root: project_root.into(),
            config,
            owners: std::sync::RwLock::new(HashMap::new()),
        }
    }

    fn is_ignored(&self, path: &Path) -> bool {
        path.components().any(|c| {
            let s = c.as_os_str().to_string_lossy();
            IGNORED_DIR_NAMES.contains(&s.as_ref())
        })
    }

    fn ignored_by_glob(&self, path: &Path) -> bool {
        self.config.extra_ignore_globs.iter().any(|glob| {
            path.to_string_lossy().contains(glob.trim_matches('*'))
        })
    }

    /// Parse one file and upsert its components into the registry. Every
    /// input path is resolved (symlinks followed) and must lie beneath the
    /// project root, else `PathEscape` is raised and the file is ignored.
    pub async fn scan_file(&self, path: impl AsRef<Path>) -> Result<ScanReport> {
        let path = path.as_ref();
        let resolved = crate::paths::resolve_under_root(path, &self.project_root)?;

        let contents = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(Error::Io)?;
        let metadata = tokio::fs::metadata(&resolved).await.map_err(Error::Io)?;
        let last_modified = metadata.modified().unwrap_or(std::time::SystemTime::now());
        let content_hash = blake3::hash(contents.as_bytes()).to_hex().to_string();

        let outcome = parser::parse(&resolved, &contents);
        let package = outcome.package.clone().unwrap_or_default();

        let mut report = ScanReport { errors: outcome.errors, ..Default::default() };

        for component in outcome.components {
            let mut component_meta = HashMap::new();

            let existing_owner = {
                let owners = self.owners.read().expect("owners poisoned");
                owners.get(&component.name).cloned()
            };
            if let Some(owner_path) = existing_owner
                && owner_path != resolved
            {
                report.errors.push(Error::DuplicateComponent {
                    name: component.name.clone(),
                    existing_path: owner_path,
                });
                continue;
            }

            if component.parameters.is_empty() && !component.references.is_empty() {
                component_meta.insert("note".to_string(), "no declared parameters".to_string());
            }

            let info = ComponentInfo {
                name: component.name.clone(),
                package: package.clone(),
                file_path: resolved.clone(),
                parameters: component.parameters,
                references: component.references,
                last_modified,
                content_hash: content_hash.clone(),
                metadata: component_meta,
            };

            self.owners
                .write()
                .expect("owners poisoned")
                .entry(component.name.clone())
                .or_insert_with(|| resolved.clone());
            self.registry.register(info);
            report.registered.push(component.name);
        }

        Ok(report)
    }

    /// Remove every component previously recorded against `path` (called by
    /// the watcher adapter on file deletion).
    pub fn forget_file(&self, path: &Path) {
        let names: Vec<String> = self
            .registry
            .get_all()
            .into_iter()
            .filter(|c| c.file_path == path)
            .map(|c| c.name)
            .collect();
        for name in &names {
            self.registry.remove(name);
            self.owners.write().expect("owners poisoned").remove(name);
        }
    }

    /// Walk `root` (honoring ignore rules) and scan every matching file,
    /// with parallelism bounded by `min(numCPU, 8)`.
    pub async fn scan_directory(&self, root: impl AsRef<Path>) -> Result<Vec<ScanReport>> {
        let root = root.as_ref();
        let mut paths = Vec::new();

        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if self.is_ignored(path) || self.ignored_by_glob(path) {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("tmpl") {
                continue;
            }
            paths.push(path.to_path_buf());
        }

        let max_parallelism = self.config.max_parallelism.max(1);
        let reports = stream::iter(paths)
            .map(|path| async move {
                match self.scan_file(&path).await {
                    Ok(report) => Some(report),
                    Err(Error::PathEscape(p)) => {
                        warn!(path = %p.display(), "ignoring file outside project root");
                        None
                    }
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "failed to scan file");
                        None
                    }
                }
            })
            // Bounds actual concurrent file I/O at min(numCPU, 8), not just
            // the ordering in which futures are created.
            .buffer_unordered(max_parallelism)
            .filter_map(futures_util::future::ready)
            .collect::<Vec<_>>()
            .await;

        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    fn registry() -> Registry {
        Registry::new(32, 64)
    }

    #[tokio::test]
    async fn scans_single_file_and_registers_component() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("button.tmpl");
        tokio::fs::write(&file_path, "package widgets\n\ncomponent Button(label string) {}\n")
            .await
            .unwrap();

        let scanner = Scanner::new(registry(), dir.path(), ScannerConfig::default());
        let report = scanner.scan_file(&file_path).await.unwrap();
        assert_eq!(report.registered, vec!["Button".to_string()]);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn parse_error_is_reported_and_not_registered() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("button.tmpl");
        tokio::fs::write(&file_path, "package widgets\n\ncomponent Button(label string\n")
            .await
            .unwrap();

        let registry = registry();
        let scanner = Scanner::new(registry.clone(), dir.path(), ScannerConfig::default());
        let report = scanner.scan_file(&file_path).await.unwrap();
        assert!(report.registered.is_empty());
        assert_eq!(report.errors.len(), 1);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn duplicate_component_across_files_keeps_first() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.tmpl");
        let second = dir.path().join("b.tmpl");
        tokio::fs::write(&first, "package widgets\ncomponent Shared(a string) {}\n")
            .await
            .unwrap();
        tokio::fs::write(&second, "package widgets\ncomponent Shared(b int) {}\n")
            .await
            .unwrap();

        let registry = registry();
        let scanner = Scanner::new(registry.clone(), dir.path(), ScannerConfig::default());
        scanner.scan_file(&first).await.unwrap();
        let second_report = scanner.scan_file(&second).await.unwrap();

        assert!(matches!(second_report.errors[0], Error::DuplicateComponent { .. }));
        let kept = registry.get("Shared").unwrap();
        assert_eq!(kept.file_path, std::fs::canonicalize(&first).unwrap());
    }

    #[tokio::test]
    async fn path_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let outside_file = outside.path().join("evil.tmpl");
        tokio::fs::write(&outside_file, "package x\n").await.unwrap();

        let scanner = Scanner::new(registry(), dir.path(), ScannerConfig::default());
        let err = scanner.scan_file(&outside_file).await;
        assert!(matches!(err, Err(Error::PathEscape(_))));
    }
}
