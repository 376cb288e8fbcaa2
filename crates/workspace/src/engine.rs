use std::path::Path;

/// Game engine a project is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Unity,
    Godot,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EngineKind::Unity => "Unity",
            EngineKind::Godot => "Godot",
        })
    }
}

/// Detects the engine from marker files in the project root.
///
/// Unity projects carry `ProjectSettings/ProjectVersion.txt`, Godot projects
/// a `project.godot`. Returns `None` for anything else.
pub fn detect_engine(project_path: &Path) -> Option<EngineKind> {
    if project_path
        .join("ProjectSettings")
        .join("ProjectVersion.txt")
        .is_file()
    {
        Some(EngineKind::Unity)
    } else if project_path.join("project.godot").is_file() {
        Some(EngineKind::Godot)
    } else {
        None
    }
}
