//! Collaborators backed by a local workspace directory.
//!
//! All paths handed to these types are relative to the workspace root.
//! Anything that escapes the root is refused.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use toolflow_core::ServiceError;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::collaborators::{
    AppliedDiff, DirectiveProvider, Editor, FileDiff, FileReader, LessonPattern, LessonStore, SearchHit,
    SemanticSearch,
};
use crate::plan::Plan;

const SKIPPED_DIRS: [&str; 6] = ["node_modules", "target", "dist", "build", "__pycache__", "venv"];

const TEXT_EXTENSIONS: [&str; 16] = [
    "rs", "ts", "tsx", "js", "jsx", "py", "go", "md", "toml", "json", "yaml", "yml", "java", "rb", "c", "h",
];

pub(crate) fn io_error(path: &Path, err: std::io::Error) -> ServiceError {
    let msg = format!("{}: {}", path.display(), err);
    match err.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::InvalidData => ServiceError::Rejected(msg),
        ErrorKind::TimedOut => ServiceError::Timeout(msg),
        _ => ServiceError::Unavailable(msg),
    }
}

/// Runs filesystem work off the async workers.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServiceError::Unavailable(format!("worker failed: {}", e)))?
}

/// `root.join(relative)`, refusing absolute paths and `..` components.
pub(crate) fn resolve(root: &Path, relative: &str) -> Result<PathBuf, ServiceError> {
    let rel = Path::new(relative);
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if relative.is_empty() || escapes {
        return Err(ServiceError::Rejected(format!("path outside workspace: {}", relative)));
    }
    Ok(root.join(rel))
}

fn relative_to(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn is_walkable(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    !(entry.file_type().is_dir() && (name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref())))
}

fn is_text_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| TEXT_EXTENSIONS.contains(&e))
        .unwrap_or(false)
}

/// Decodes a byte prefix lossily, dropping a char the prefix cut in half.
fn decode_prefix(mut bytes: Vec<u8>) -> String {
    if let Err(err) = std::str::from_utf8(&bytes) {
        if err.error_len().is_none() {
            bytes.truncate(err.valid_up_to());
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

// ============================================================================
// DIRECTIVES
// ============================================================================

/// Reads bullet-point directives from every `AGENTS.md` under the root,
/// shallowest first.
#[derive(Debug, Clone)]
pub struct FsDirectiveProvider {
    root: PathBuf,
    max_depth: usize,
}

impl FsDirectiveProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_depth: 3,
        }
    }
}

/// List items of a markdown document, markers stripped.
pub fn parse_directives(markdown: &str) -> Vec<String> {
    markdown
        .lines()
        .map(str::trim)
        .filter_map(|line| {
            let item = line
                .strip_prefix("- ")
                .or_else(|| line.strip_prefix("* "))
                .or_else(|| {
                    let (num, rest) = line.split_once(". ")?;
                    num.chars().all(|c| c.is_ascii_digit()).then_some(rest)
                })?;
            let item = item.trim();
            (!item.is_empty()).then(|| item.to_string())
        })
        .collect()
}

#[async_trait]
impl DirectiveProvider for FsDirectiveProvider {
    async fn read(&self) -> Result<Vec<String>, ServiceError> {
        let root = self.root.clone();
        let max_depth = self.max_depth;
        let files = blocking(move || {
            let mut found: Vec<(usize, PathBuf)> = WalkDir::new(&root)
                .max_depth(max_depth)
                .follow_links(false)
                .into_iter()
                .filter_entry(is_walkable)
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file() && e.file_name() == "AGENTS.md")
                .map(|e| (e.depth(), e.into_path()))
                .collect();
            found.sort();
            Ok(found)
        })
        .await?;

        let mut directives = Vec::new();
        for (_, path) in files {
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| io_error(&path, e))?;
            directives.extend(parse_directives(&text));
        }
        debug!(count = directives.len(), "directives read");
        Ok(directives)
    }
}

// ============================================================================
// FILE READER
// ============================================================================

#[derive(Debug, Clone)]
pub struct FsFileReader {
    root: PathBuf,
    max_bytes: usize,
}

impl FsFileReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_bytes: 16 * 1024,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

#[async_trait]
impl FileReader for FsFileReader {
    async fn read(&self, path: &str) -> Result<String, ServiceError> {
        let full = resolve(&self.root, path)?;
        let file = tokio::fs::File::open(&full)
            .await
            .map_err(|e| io_error(&full, e))?;
        let mut bytes = Vec::with_capacity(self.max_bytes.min(64 * 1024));
        file.take(self.max_bytes as u64)
            .read_to_end(&mut bytes)
            .await
            .map_err(|e| io_error(&full, e))?;
        Ok(decode_prefix(bytes))
    }
}

// ============================================================================
// KEYWORD SEARCH
// ============================================================================

/// Term-overlap search over the workspace's text files. Stands in for a
/// vector index: a line scores by the share of query terms it contains, and
/// each file contributes its best line.
#[derive(Debug, Clone)]
pub struct KeywordSearch {
    root: PathBuf,
    max_file_bytes: u64,
}

impl KeywordSearch {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_file_bytes: 256 * 1024,
        }
    }
}

/// Lowercase alphanumeric terms of three or more characters.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.chars().count() >= 3)
        .map(str::to_lowercase)
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

fn best_line(text: &str, terms: &[String]) -> Option<(u32, f32, String)> {
    let mut best: Option<(u32, f32, String)> = None;
    for (idx, line) in text.lines().enumerate() {
        let lower = line.to_lowercase();
        let matched = terms.iter().filter(|t| lower.contains(t.as_str())).count();
        if matched == 0 {
            continue;
        }
        let score = matched as f32 / terms.len() as f32;
        if best.as_ref().map(|(_, s, _)| score > *s).unwrap_or(true) {
            best = Some((idx as u32 + 1, score, line.trim().chars().take(160).collect()));
        }
    }
    best
}

#[async_trait]
impl SemanticSearch for KeywordSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ServiceError> {
        let terms = query_terms(query);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let root = self.root.clone();
        let max_bytes = self.max_file_bytes;

        blocking(move || {
            let mut hits = Vec::new();
            for entry in WalkDir::new(&root)
                .follow_links(false)
                .into_iter()
                .filter_entry(is_walkable)
                .filter_map(Result::ok)
            {
                let path = entry.path();
                if !entry.file_type().is_file() || !is_text_file(path) {
                    continue;
                }
                if entry.metadata().map(|m| m.len() > max_bytes).unwrap_or(true) {
                    continue;
                }
                let Ok(text) = std::fs::read_to_string(path) else {
                    continue;
                };
                if let Some((line, score, preview)) = best_line(&text, &terms) {
                    hits.push(SearchHit {
                        path: relative_to(&root, path),
                        line,
                        score,
                        preview,
                    });
                }
            }
            hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
            hits.truncate(limit);
            Ok(hits)
        })
        .await
    }
}

// ============================================================================
// DRY-RUN EDITOR
// ============================================================================

/// Reports the diff a plan would produce without writing anything. Each
/// step becomes one hunk; `modify` steps need an existing file.
#[derive(Debug, Clone)]
pub struct DryRunEditor {
    root: PathBuf,
}

impl DryRunEditor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Editor for DryRunEditor {
    async fn apply(&self, plan: &Plan) -> Result<AppliedDiff, ServiceError> {
        let mut per_file: HashMap<&str, FileDiff> = HashMap::new();
        let mut order = Vec::new();

        for step in &plan.steps {
            let full = resolve(&self.root, &step.path)?;
            let exists = tokio::fs::try_exists(&full).await.map_err(|e| io_error(&full, e))?;
            if step.action != "create" && !exists {
                return Err(ServiceError::Rejected(format!("cannot {} missing file {}", step.action, step.path)));
            }
            let diff = per_file.entry(step.path.as_str()).or_insert_with(|| {
                order.push(step.path.as_str());
                FileDiff {
                    path: step.path.clone(),
                    ..FileDiff::default()
                }
            });
            diff.hunks += 1;
            diff.lines_changed += 1;
        }

        let files: Vec<FileDiff> = order.into_iter().filter_map(|p| per_file.remove(p)).collect();
        Ok(AppliedDiff {
            summary: format!("dry run: {} ({} files)", plan.goal, files.len()),
            files,
        })
    }
}

// ============================================================================
// LESSON STORE
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LessonRecord<'a> {
    id: String,
    recorded_at: chrono::DateTime<Utc>,
    #[serde(flatten)]
    pattern: &'a LessonPattern,
}

/// Appends one JSON object per lesson to a file.
#[derive(Debug)]
pub struct JsonlLessonStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlLessonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LessonStore for JsonlLessonStore {
    async fn record(&self, pattern: &LessonPattern) -> Result<String, ServiceError> {
        let record = LessonRecord {
            id: uuid::Uuid::new_v4().to_string(),
            recorded_at: Utc::now(),
            pattern,
        };
        let mut line = serde_json::to_string(&record).map_err(|e| ServiceError::Rejected(e.to_string()))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| io_error(dir, e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| io_error(&self.path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| io_error(&self.path, e))?;
        file.flush().await.map_err(|e| io_error(&self.path, e))?;
        Ok(record.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directives() {
        let md = "# Rules\n\n- Run cargo test\n* Keep diffs small\n1. Ask first\nplain text\n-   \n";
        assert_eq!(
            parse_directives(md),
            vec!["Run cargo test".to_string(), "Keep diffs small".to_string(), "Ask first".to_string()]
        );
    }

    #[test]
    fn test_resolve_refuses_escapes() {
        let root = Path::new("/ws");
        assert_eq!(resolve(root, "src/lib.rs").unwrap(), PathBuf::from("/ws/src/lib.rs"));
        assert!(resolve(root, "../etc/passwd").is_err());
        assert!(resolve(root, "/etc/passwd").is_err());
        assert!(resolve(root, "").is_err());
    }

    #[test]
    fn test_query_terms() {
        assert_eq!(query_terms("Fix the divide-by-zero in divide"), vec!["fix", "the", "divide", "zero"]);
    }

    #[test]
    fn test_decode_prefix_drops_split_char() {
        assert_eq!(decode_prefix("héllo".as_bytes()[..2].to_vec()), "h");
        assert_eq!(decode_prefix(b"abc".to_vec()), "abc");
        assert_eq!(decode_prefix(vec![b'a', 0xff, b'b']), "a\u{fffd}b");
    }

    #[tokio::test]
    async fn test_reader_caps_bytes_and_tolerates_binary() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(10_000)).unwrap();
        std::fs::write(dir.path().join("blob.bin"), [0x66u8, 0x6f, 0xff, 0xfe, 0x6f]).unwrap();

        let reader = FsFileReader::new(dir.path()).with_max_bytes(100);
        assert_eq!(reader.read("big.txt").await.unwrap().len(), 100);
        assert_eq!(reader.read("blob.bin").await.unwrap(), "fo\u{fffd}\u{fffd}o");
    }

    #[test]
    fn test_best_line_scores_term_share() {
        let text = "fn add() {}\nfn divide(a: i32, b: i32) -> i32 { a / b } // zero\n";
        let (line, score, _) = best_line(text, &query_terms("divide zero")).unwrap();
        assert_eq!(line, 2);
        assert_eq!(score, 1.0);
    }
}
