//! Solution/project discovery: turn a `.sln` or `.csproj` manifest into a
//! project list and a document set.
//!
//! The loader is deliberately shallow: solution files are scanned for
//! project entries, SDK-style projects contribute every `.cs` beneath their
//! directory. Build-output and dot directories are skipped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::socket_path::canonicalize_workspace_path;

pub const SOURCE_EXTENSIONS: &[&str] = &["cs"];
pub const MANIFEST_EXTENSIONS: &[&str] = &["csproj", "sln", "slnx"];

const SKIPPED_DIRS: &[&str] = &["bin", "obj", "packages", "node_modules"];

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("workspace path does not exist: {0}")]
    NotFound(PathBuf),
    #[error("no solution or project manifest in {0}")]
    NoManifest(PathBuf),
    #[error("ambiguous workspace: {0} contains {1} candidate manifests")]
    Ambiguous(PathBuf, usize),
    #[error("unsupported manifest {0}: expected .sln or .csproj")]
    UnsupportedManifest(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ProjectHandle {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DocumentHandle {
    pub path: PathBuf,
    pub text: Arc<str>,
}

/// A loaded (but not yet analyzed) workspace layout.
#[derive(Debug)]
pub struct WorkspaceLayout {
    pub root: PathBuf,
    pub manifest: PathBuf,
    pub projects: Vec<ProjectHandle>,
    pub documents: BTreeMap<PathBuf, DocumentHandle>,
}

/// Resolve a user-supplied workspace argument to a manifest path. A
/// directory resolves to the single `.sln` it contains, falling back to a
/// single `.csproj`; more than one candidate is an error.
pub fn resolve_manifest(workspace: &Path) -> Result<PathBuf, WorkspaceError> {
    if !workspace.exists() {
        return Err(WorkspaceError::NotFound(workspace.to_path_buf()));
    }
    if workspace.is_file() {
        return match extension_of(workspace) {
            Some(ext) if MANIFEST_EXTENSIONS.contains(&ext.as_str()) => {
                Ok(canonicalize_workspace_path(workspace))
            }
            _ => Err(WorkspaceError::UnsupportedManifest(workspace.to_path_buf())),
        };
    }

    let mut solutions = Vec::new();
    let mut projects = Vec::new();
    let entries = std::fs::read_dir(workspace).map_err(|source| WorkspaceError::Io {
        path: workspace.to_path_buf(),
        source,
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        match extension_of(&path).as_deref() {
            Some("sln") | Some("slnx") => solutions.push(path),
            Some("csproj") => projects.push(path),
            _ => {}
        }
    }

    let candidates = if solutions.is_empty() { projects } else { solutions };
    match candidates.len() {
        0 => Err(WorkspaceError::NoManifest(workspace.to_path_buf())),
        1 => Ok(canonicalize_workspace_path(&candidates[0])),
        n => Err(WorkspaceError::Ambiguous(workspace.to_path_buf(), n)),
    }
}

/// Load the project list and document set for a manifest.
pub fn load_layout(manifest: &Path) -> Result<WorkspaceLayout, WorkspaceError> {
    let manifest = canonicalize_workspace_path(manifest);
    let root = manifest
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| WorkspaceError::NotFound(manifest.clone()))?;

    let projects = match extension_of(&manifest).as_deref() {
        Some("sln") | Some("slnx") => solution_projects(&manifest)?,
        Some("csproj") => vec![project_handle(&manifest)],
        _ => return Err(WorkspaceError::UnsupportedManifest(manifest)),
    };

    let mut documents = BTreeMap::new();
    for project in &projects {
        let Some(project_dir) = project.path.parent() else {
            continue;
        };
        collect_sources(project_dir, &root, &mut documents);
    }
    debug!(
        projects = projects.len(),
        documents = documents.len(),
        "workspace layout loaded"
    );

    Ok(WorkspaceLayout {
        root,
        manifest,
        projects,
        documents,
    })
}

/// Parse `Project("{...}") = "Name", "rel\path.csproj", "{...}"` entries.
fn solution_projects(solution: &Path) -> Result<Vec<ProjectHandle>, WorkspaceError> {
    let text = std::fs::read_to_string(solution).map_err(|source| WorkspaceError::Io {
        path: solution.to_path_buf(),
        source,
    })?;
    let base = solution.parent().unwrap_or_else(|| Path::new("."));

    let mut projects = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if !line.starts_with("Project(") {
            continue;
        }
        let mut quoted = line.split('"').skip(1).step_by(2);
        let _type_guid = quoted.next();
        let Some(name) = quoted.next() else { continue };
        let Some(rel_path) = quoted.next() else { continue };

        let rel_path = rel_path.replace('\\', "/");
        if !rel_path.ends_with(".csproj") {
            // Solution folders and non-C# projects are not loadable here.
            continue;
        }
        let path = canonicalize_workspace_path(&base.join(rel_path));
        if !path.is_file() {
            warn!(project = %path.display(), "solution references missing project");
            continue;
        }
        projects.push(ProjectHandle {
            name: name.to_string(),
            path,
        });
    }
    Ok(projects)
}

fn project_handle(csproj: &Path) -> ProjectHandle {
    let name = csproj
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());
    ProjectHandle {
        name,
        path: csproj.to_path_buf(),
    }
}

fn collect_sources(dir: &Path, root: &Path, documents: &mut BTreeMap<PathBuf, DocumentHandle>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if path.is_dir() {
            if name.starts_with('.') || SKIPPED_DIRS.contains(&name.to_lowercase().as_str()) {
                continue;
            }
            collect_sources(&path, root, documents);
        } else if extension_of(&path).as_deref() == Some("cs") {
            let canonical = canonicalize_workspace_path(&path);
            match std::fs::read_to_string(&canonical) {
                Ok(text) => {
                    documents.insert(
                        canonical.clone(),
                        DocumentHandle {
                            path: canonical,
                            text: Arc::from(text.as_str()),
                        },
                    );
                }
                Err(e) => warn!(file = %canonical.display(), error = %e, "skipping unreadable source"),
            }
        }
    }
}

/// Nearest manifest at or above `start`, for clients invoked inside a
/// workspace tree.
pub fn find_workspace_upwards(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start.to_path_buf());
    while let Some(current) = dir {
        if let Ok(manifest) = resolve_manifest(&current) {
            return Some(manifest);
        }
        dir = current.parent().map(Path::to_path_buf);
    }
    None
}

/// Canonical form of a document path for map lookups. Relative paths are
/// resolved against the workspace root.
pub fn canonical_document_path(root: &Path, file: &str) -> PathBuf {
    let raw = PathBuf::from(file);
    let absolute = if raw.is_absolute() { raw } else { root.join(raw) };
    canonicalize_workspace_path(&absolute)
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, text: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, text).unwrap();
    }

    #[test]
    fn directory_resolves_to_single_solution() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("App.sln"), "");
        write(&dir.path().join("App.csproj"), "<Project />");

        let manifest = resolve_manifest(dir.path()).unwrap();
        assert!(manifest.to_string_lossy().ends_with(".sln"));
    }

    #[test]
    fn ambiguous_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("A.csproj"), "<Project />");
        write(&dir.path().join("B.csproj"), "<Project />");

        assert!(matches!(
            resolve_manifest(dir.path()),
            Err(WorkspaceError::Ambiguous(_, 2))
        ));
    }

    #[test]
    fn project_layout_collects_sources_and_skips_build_output() {
        let dir = tempfile::tempdir().unwrap();
        let csproj = dir.path().join("App.csproj");
        write(&csproj, "<Project Sdk=\"Microsoft.NET.Sdk\" />");
        write(&dir.path().join("Program.cs"), "class Program { }");
        write(&dir.path().join("Lib").join("Util.cs"), "class Util { }");
        write(&dir.path().join("obj").join("Gen.cs"), "class Gen { }");
        write(&dir.path().join("bin").join("Out.cs"), "class Out { }");

        let layout = load_layout(&csproj).unwrap();
        assert_eq!(layout.projects.len(), 1);
        assert_eq!(layout.projects[0].name, "App");
        assert_eq!(layout.documents.len(), 2);
        assert!(layout
            .documents
            .keys()
            .all(|p| p.starts_with(&layout.root)));
    }

    #[test]
    fn solution_layout_follows_project_entries() {
        let dir = tempfile::tempdir().unwrap();
        let sln = dir.path().join("All.sln");
        write(
            &sln,
            "Microsoft Visual Studio Solution File, Format Version 12.00\n\
             Project(\"{FAE04EC0-301F-11D3-BF4B-00C04F79EFBC}\") = \"Core\", \"Core\\Core.csproj\", \"{11111111-1111-1111-1111-111111111111}\"\nEndProject\n\
             Project(\"{2150E333-8FDC-42A3-9474-1A3956D46DE8}\") = \"Solution Items\", \"Solution Items\", \"{22222222-2222-2222-2222-222222222222}\"\nEndProject\n",
        );
        write(&dir.path().join("Core").join("Core.csproj"), "<Project />");
        write(&dir.path().join("Core").join("A.cs"), "class A { }");

        let layout = load_layout(&sln).unwrap();
        assert_eq!(layout.projects.len(), 1);
        assert_eq!(layout.projects[0].name, "Core");
        assert_eq!(layout.documents.len(), 1);
    }

    #[test]
    fn upward_search_finds_enclosing_workspace() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("App.csproj"), "<Project />");
        let nested = dir.path().join("src").join("deep");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_workspace_upwards(&nested).unwrap();
        assert!(found.to_string_lossy().ends_with("App.csproj"));
    }

    #[test]
    fn relative_document_paths_resolve_against_root() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("T.cs"), "class T { }");
        let root = canonicalize_workspace_path(dir.path());

        let resolved = canonical_document_path(&root, "T.cs");
        assert_eq!(resolved, root.join("T.cs"));

        let absolute = canonical_document_path(&root, &root.join("T.cs").to_string_lossy());
        assert_eq!(absolute, resolved);
    }
}
