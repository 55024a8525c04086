//! Project directory resolution: which directories to push to a slave and
//! which project owns a given source file.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// Role of a synchronized directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirKind {
    Source,
    Object,
}

/// One directory declared by a project. A trailing `/**` makes it recursive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSpec {
    pub path: PathBuf,
    pub kind: DirKind,
    pub recursive: bool,
}

impl DirSpec {
    /// Parse a source directory as written in a project, e.g. `src` or `src/**`.
    pub fn source(spec: &str) -> Self {
        match spec.strip_suffix("/**").or_else(|| spec.strip_suffix("**")) {
            Some(base) => Self {
                path: PathBuf::from(if base.is_empty() { "." } else { base }),
                kind: DirKind::Source,
                recursive: true,
            },
            None => Self {
                path: PathBuf::from(spec),
                kind: DirKind::Source,
                recursive: false,
            },
        }
    }

    pub fn object(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: DirKind::Object,
            recursive: false,
        }
    }

    fn contains_dir(&self, dir: &Path) -> bool {
        if self.recursive {
            dir.starts_with(&self.path)
        } else {
            dir == self.path
        }
    }
}

/// A directory to push to a slave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEntry {
    pub path: PathBuf,
    pub kind: DirKind,
}

/// Lazy walk over the directories of a project.
///
/// Recursive specs are expanded one directory at a time while iterating, in
/// sorted order. [`SyncDirs::restart`] yields a fresh walk over the same specs.
#[derive(Debug, Clone)]
pub struct SyncDirs {
    specs: Arc<[DirSpec]>,
    next: usize,
    stack: Vec<(PathBuf, DirKind)>,
}

impl SyncDirs {
    pub fn new(specs: impl Into<Arc<[DirSpec]>>) -> Self {
        Self {
            specs: specs.into(),
            next: 0,
            stack: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::<DirSpec>::new())
    }

    /// Start over from the first spec.
    pub fn restart(&self) -> Self {
        Self::new(Arc::clone(&self.specs))
    }
}

impl Iterator for SyncDirs {
    type Item = SyncEntry;

    fn next(&mut self) -> Option<SyncEntry> {
        if let Some((dir, kind)) = self.stack.pop() {
            let mut children: Vec<PathBuf> = std::fs::read_dir(&dir)
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
                        .map(|e| e.path())
                        .collect()
                })
                .unwrap_or_default();
            children.sort();
            self.stack
                .extend(children.into_iter().rev().map(|child| (child, kind)));
            return Some(SyncEntry { path: dir, kind });
        }

        let spec = self.specs.get(self.next)?;
        self.next += 1;
        if spec.recursive {
            self.stack.push((spec.path.clone(), spec.kind));
            return self.next();
        }
        Some(SyncEntry {
            path: spec.path.clone(),
            kind: spec.kind,
        })
    }
}

/// Read-only view of the project tree used when registering slaves.
pub trait ProjectPaths: Send + Sync {
    /// Directories to push to a slave for `project` and the projects it imports.
    fn sync_dirs(&self, project: &str) -> SyncDirs;

    /// Project owning `source`, if any.
    fn project_of(&self, source: &Path) -> Option<String>;
}

/// Source file to owning project, with explicit invalidation.
#[derive(Debug, Default)]
pub struct PathCache {
    entries: HashMap<PathBuf, Option<String>>,
}

impl PathCache {
    pub fn get(&self, source: &Path) -> Option<&Option<String>> {
        self.entries.get(source)
    }

    pub fn insert(&mut self, source: PathBuf, project: Option<String>) {
        self.entries.insert(source, project);
    }

    pub fn invalidate(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Directories declared by one project.
#[derive(Debug, Clone)]
pub struct ProjectDirs {
    pub name: String,
    pub source_dirs: Vec<DirSpec>,
    pub object_dir: Option<PathBuf>,
    pub imports: Vec<String>,
}

impl ProjectDirs {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_dirs: Vec::new(),
            object_dir: None,
            imports: Vec::new(),
        }
    }

    pub fn with_source_dir(mut self, spec: &str) -> Self {
        self.source_dirs.push(DirSpec::source(spec));
        self
    }

    pub fn with_object_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.object_dir = Some(dir.into());
        self
    }

    pub fn with_import(mut self, project: impl Into<String>) -> Self {
        self.imports.push(project.into());
        self
    }
}

/// In-memory project tree owned by one build session.
#[derive(Debug, Default)]
pub struct ProjectTree {
    projects: Vec<ProjectDirs>,
    cache: Mutex<PathCache>,
}

impl ProjectTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(mut self, project: ProjectDirs) -> Self {
        self.add(project);
        self
    }

    /// Add or replace a project. Drops cached lookups.
    pub fn add(&mut self, project: ProjectDirs) {
        self.projects.retain(|p| p.name != project.name);
        self.projects.push(project);
        self.invalidate();
    }

    /// Forget every cached source lookup.
    pub fn invalidate(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .invalidate();
    }

    pub fn cached_lookups(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn find(&self, name: &str) -> Option<&ProjectDirs> {
        self.projects.iter().find(|p| p.name == name)
    }

    /// `name` followed by its imports, depth first, each once.
    fn closure(&self, name: &str) -> Vec<&ProjectDirs> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut pending = vec![name.to_string()];
        while let Some(next) = pending.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(project) = self.find(&next) {
                pending.extend(project.imports.iter().rev().cloned());
                out.push(project);
            }
        }
        out
    }
}

impl ProjectPaths for ProjectTree {
    fn sync_dirs(&self, project: &str) -> SyncDirs {
        let specs: Vec<DirSpec> = self
            .closure(project)
            .into_iter()
            .flat_map(|p| {
                p.source_dirs
                    .iter()
                    .cloned()
                    .chain(p.object_dir.iter().cloned().map(DirSpec::object))
            })
            .collect();
        SyncDirs::new(specs)
    }

    fn project_of(&self, source: &Path) -> Option<String> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(hit) = cache.get(source) {
            return hit.clone();
        }
        let dir = source.parent().unwrap_or(Path::new(""));
        let owner = self
            .projects
            .iter()
            .find(|p| p.source_dirs.iter().any(|d| d.contains_dir(dir)))
            .map(|p| p.name.clone());
        cache.insert(source.to_path_buf(), owner.clone());
        owner
    }
}
