//! Repo facts from package manifests, and a validator that checks a diff
//! against the workspace it claims to touch.
//!
//! Facts look like `lang:rust`, `dep:serde@1.0` or `framework:axum@0.8`.
//! Versions are part of the fact, so a dependency bump changes the project
//! signature and with it the documentation cache partition.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use toolflow_core::ServiceError;

use crate::collaborators::{AppliedDiff, RepoFactDetector, ValidationReport, Validator};
use crate::local::{io_error, resolve};

const KNOWN_FRAMEWORKS: [(&str, &str); 22] = [
    ("axum", "axum"),
    ("actix-web", "actix-web"),
    ("rocket", "rocket"),
    ("warp", "warp"),
    ("tokio", "tokio"),
    ("leptos", "leptos"),
    ("tauri", "tauri"),
    ("bevy", "bevy"),
    ("react", "react"),
    ("vue", "vue"),
    ("svelte", "svelte"),
    ("next", "next"),
    ("express", "express"),
    ("@angular/core", "angular"),
    ("@nestjs/core", "nestjs"),
    ("django", "django"),
    ("flask", "flask"),
    ("fastapi", "fastapi"),
    ("pydantic", "pydantic"),
    ("github.com/gin-gonic/gin", "gin"),
    ("github.com/labstack/echo/v4", "echo"),
    ("github.com/gofiber/fiber/v2", "fiber"),
];

const MANIFESTS: [&str; 5] = ["Cargo.toml", "package.json", "pyproject.toml", "requirements.txt", "go.mod"];

fn framework_name(dependency: &str) -> Option<&'static str> {
    KNOWN_FRAMEWORKS
        .iter()
        .find(|(dep, _)| dep.eq_ignore_ascii_case(dependency))
        .map(|(_, name)| *name)
}

fn push_dependency(facts: &mut BTreeSet<String>, name: &str, version: Option<&str>) {
    let versioned = |prefix: &str, name: &str| match version.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => format!("{}:{}@{}", prefix, name, v.trim_start_matches(['^', '~', '='])),
        None => format!("{}:{}", prefix, name),
    };
    facts.insert(versioned("dep", name));
    if let Some(framework) = framework_name(name) {
        facts.insert(versioned("framework", framework));
    }
}

/// Reads a manifest, treating a missing file as "nothing to report".
async fn read_optional(path: &Path) -> Result<Option<String>, ServiceError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(path, e)),
    }
}

// ============================================================================
// CARGO
// ============================================================================

#[derive(Debug, Clone)]
pub struct CargoDetector {
    root: PathBuf,
}

impl CargoDetector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

pub fn cargo_facts(manifest: &str) -> Result<BTreeSet<String>, ServiceError> {
    let doc: toml::Table = manifest
        .parse()
        .map_err(|e: toml::de::Error| ServiceError::Rejected(format!("Cargo.toml: {}", e)))?;
    let mut facts = BTreeSet::from(["lang:rust".to_string()]);

    let workspace_deps = doc
        .get("workspace")
        .and_then(|w| w.get("dependencies"))
        .and_then(|d| d.as_table());
    let tables = ["dependencies", "dev-dependencies", "build-dependencies"]
        .iter()
        .filter_map(|t| doc.get(*t).and_then(|d| d.as_table()))
        .chain(workspace_deps);

    for table in tables {
        for (name, spec) in table {
            let version = match spec {
                toml::Value::String(v) => Some(v.as_str()),
                toml::Value::Table(t) => t.get("version").and_then(|v| v.as_str()),
                _ => None,
            };
            push_dependency(&mut facts, name, version);
        }
    }
    if doc.get("workspace").is_some() {
        facts.insert("layout:cargo-workspace".to_string());
    }
    Ok(facts)
}

#[async_trait]
impl RepoFactDetector for CargoDetector {
    async fn detect(&self) -> Result<BTreeSet<String>, ServiceError> {
        match read_optional(&self.root.join("Cargo.toml")).await? {
            Some(text) => cargo_facts(&text),
            None => Ok(BTreeSet::new()),
        }
    }
}

// ============================================================================
// NODE
// ============================================================================

#[derive(Debug, Clone)]
pub struct PackageJsonDetector {
    root: PathBuf,
}

impl PackageJsonDetector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

pub fn package_json_facts(manifest: &str) -> Result<BTreeSet<String>, ServiceError> {
    let doc: serde_json::Value = serde_json::from_str(manifest)
        .map_err(|e| ServiceError::Rejected(format!("package.json: {}", e)))?;
    let mut facts = BTreeSet::new();

    let mut typescript = false;
    for section in ["dependencies", "devDependencies", "peerDependencies"] {
        let Some(deps) = doc.get(section).and_then(|d| d.as_object()) else {
            continue;
        };
        for (name, version) in deps {
            typescript |= name == "typescript";
            push_dependency(&mut facts, name, version.as_str());
        }
    }
    facts.insert(if typescript { "lang:typescript" } else { "lang:javascript" }.to_string());
    Ok(facts)
}

#[async_trait]
impl RepoFactDetector for PackageJsonDetector {
    async fn detect(&self) -> Result<BTreeSet<String>, ServiceError> {
        match read_optional(&self.root.join("package.json")).await? {
            Some(text) => package_json_facts(&text),
            None => Ok(BTreeSet::new()),
        }
    }
}

// ============================================================================
// PYTHON
// ============================================================================

#[derive(Debug, Clone)]
pub struct PythonDetector {
    root: PathBuf,
}

impl PythonDetector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// Splits a requirement like `fastapi>=0.110` into name and version.
fn parse_requirement(line: &str) -> Option<(String, Option<String>)> {
    let line = line.split('#').next()?.split(';').next()?.trim();
    if line.is_empty() || line.starts_with('-') {
        return None;
    }
    let line = match (line.find('['), line.find(']')) {
        (Some(open), Some(close)) if open < close => format!("{}{}", &line[..open], &line[close + 1..]),
        _ => line.to_string(),
    };
    let split = line.find(|c: char| "<>=~! ".contains(c)).unwrap_or(line.len());
    let name = line[..split].trim().to_lowercase();
    let version = line[split..]
        .trim_start_matches(|c: char| "<>=~! ".contains(c))
        .split(',')
        .next()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    (!name.is_empty()).then_some((name, version))
}

pub fn python_facts(pyproject: Option<&str>, requirements: Option<&str>) -> Result<BTreeSet<String>, ServiceError> {
    let mut facts = BTreeSet::new();
    let mut requirements_lines: Vec<String> = Vec::new();

    if let Some(text) = pyproject {
        let doc: toml::Table = text
            .parse()
            .map_err(|e: toml::de::Error| ServiceError::Rejected(format!("pyproject.toml: {}", e)))?;
        if let Some(deps) = doc
            .get("project")
            .and_then(|p| p.get("dependencies"))
            .and_then(|d| d.as_array())
        {
            requirements_lines.extend(deps.iter().filter_map(|d| d.as_str()).map(str::to_string));
        }
        facts.insert("lang:python".to_string());
    }
    if let Some(text) = requirements {
        requirements_lines.extend(text.lines().map(str::to_string));
        facts.insert("lang:python".to_string());
    }

    for line in &requirements_lines {
        if let Some((name, version)) = parse_requirement(line) {
            push_dependency(&mut facts, &name, version.as_deref());
        }
    }
    Ok(facts)
}

#[async_trait]
impl RepoFactDetector for PythonDetector {
    async fn detect(&self) -> Result<BTreeSet<String>, ServiceError> {
        let pyproject = read_optional(&self.root.join("pyproject.toml")).await?;
        let requirements = read_optional(&self.root.join("requirements.txt")).await?;
        python_facts(pyproject.as_deref(), requirements.as_deref())
    }
}

// ============================================================================
// GO
// ============================================================================

#[derive(Debug, Clone)]
pub struct GoModDetector {
    root: PathBuf,
}

impl GoModDetector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

pub fn go_mod_facts(go_mod: &str) -> BTreeSet<String> {
    let mut facts = BTreeSet::from(["lang:go".to_string()]);
    let mut in_block = false;
    for line in go_mod.lines().map(str::trim) {
        let spec = if in_block {
            if line == ")" {
                in_block = false;
                continue;
            }
            line
        } else if line == "require (" {
            in_block = true;
            continue;
        } else if let Some(rest) = line.strip_prefix("require ") {
            rest
        } else {
            continue;
        };
        let mut parts = spec.split_whitespace();
        if let (Some(module), version) = (parts.next(), parts.next()) {
            if !module.starts_with("//") {
                push_dependency(&mut facts, module, version);
            }
        }
    }
    facts
}

#[async_trait]
impl RepoFactDetector for GoModDetector {
    async fn detect(&self) -> Result<BTreeSet<String>, ServiceError> {
        Ok(read_optional(&self.root.join("go.mod"))
            .await?
            .map(|text| go_mod_facts(&text))
            .unwrap_or_default())
    }
}

/// One detector per supported ecosystem, all rooted at `root`.
pub fn manifest_detectors(root: &Path) -> Vec<Arc<dyn RepoFactDetector>> {
    vec![
        Arc::new(CargoDetector::new(root)),
        Arc::new(PackageJsonDetector::new(root)),
        Arc::new(PythonDetector::new(root)),
        Arc::new(GoModDetector::new(root)),
    ]
}

// ============================================================================
// VALIDATOR
// ============================================================================

/// Passes a diff when the workspace has a known manifest and every file the
/// diff touches lies inside the workspace.
#[derive(Debug, Clone)]
pub struct ManifestValidator {
    root: PathBuf,
}

impl ManifestValidator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Validator for ManifestValidator {
    async fn check(&self, diff: &AppliedDiff) -> Result<ValidationReport, ServiceError> {
        let mut details = Vec::new();

        let mut has_manifest = false;
        for manifest in MANIFESTS {
            let path = self.root.join(manifest);
            if tokio::fs::try_exists(&path).await.map_err(|e| io_error(&path, e))? {
                has_manifest = true;
                details.push(format!("manifest: {}", manifest));
            }
        }
        if !has_manifest {
            details.push("no package manifest found in workspace".to_string());
        }

        let mut outside = 0;
        for file in &diff.files {
            if resolve(&self.root, &file.path).is_err() {
                outside += 1;
                details.push(format!("outside workspace: {}", file.path));
            }
        }

        Ok(ValidationReport {
            passed: has_manifest && outside == 0,
            details,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cargo_facts() {
        let manifest = r#"
            [package]
            name = "demo"

            [dependencies]
            axum = "0.8"
            serde = { version = "1.0", features = ["derive"] }
            local = { path = "../local" }
        "#;
        let facts = cargo_facts(manifest).unwrap();
        assert!(facts.contains("lang:rust"));
        assert!(facts.contains("framework:axum@0.8"));
        assert!(facts.contains("dep:serde@1.0"));
        assert!(facts.contains("dep:local"));
        assert!(!facts.contains("layout:cargo-workspace"));
    }

    #[test]
    fn test_package_json_facts() {
        let facts = package_json_facts(
            r#"{"dependencies": {"react": "^18.2.0"}, "devDependencies": {"typescript": "5.4.0"}}"#,
        )
        .unwrap();
        assert!(facts.contains("lang:typescript"));
        assert!(facts.contains("framework:react@18.2.0"));
    }

    #[test]
    fn test_python_requirements() {
        let facts = python_facts(None, Some("fastapi>=0.110\nuvicorn[standard]==0.29 # server\n-r dev.txt\n")).unwrap();
        assert!(facts.contains("lang:python"));
        assert!(facts.contains("framework:fastapi@0.110"));
        assert!(facts.contains("dep:uvicorn@0.29"));
    }

    #[test]
    fn test_go_mod_facts() {
        let facts = go_mod_facts(
            "module example.com/app\n\ngo 1.22\n\nrequire (\n\tgithub.com/gin-gonic/gin v1.9.1\n)\nrequire golang.org/x/net v0.20.0\n",
        );
        assert!(facts.contains("lang:go"));
        assert!(facts.contains("framework:gin@v1.9.1"));
        assert!(facts.contains("dep:golang.org/x/net@v0.20.0"));
    }

    #[test]
    fn test_malformed_manifest_rejected() {
        assert!(matches!(cargo_facts("[package"), Err(ServiceError::Rejected(_))));
    }
}
