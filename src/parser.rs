/// File path validation and text extraction.
///
/// Paths are the store's primary key and also flow into its filter
/// expressions, so validation rejects anything that could escape the
/// configured root directory or carry filter-language metacharacters.
/// Snippet sources use the synthetic `memory://<label>` form instead of a
/// real path.
use std::path::{Component, Path, PathBuf};

use crate::error::RagError;

/// Scheme prefix for free-form snippet sources.
pub const MEMORY_SCHEME: &str = "memory://";

/// Characters that the store's filter language could interpret.
const FORBIDDEN_CHARS: &[char] = &['\'', '"', '\\', '`', ';'];

/// Extract the label from a `memory://<label>` path.
#[must_use]
pub fn memory_label(path: &str) -> Option<&str> {
    path.strip_prefix(MEMORY_SCHEME)
}

/// Whether a label is well-formed: non-empty, `[A-Za-z0-9_.-]+`.
#[must_use]
pub fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

pub struct Parser {
    root_dir: PathBuf,
    max_file_size: u64,
}

impl Parser {
    #[must_use]
    pub fn new(root_dir: PathBuf, max_file_size: u64) -> Self {
        Self {
            root_dir,
            max_file_size,
        }
    }

    /// Validate a source path: either a well-formed `memory://` label or an
    /// absolute file path confined to the root directory, free of filter
    /// metacharacters and control characters.
    pub fn validate(&self, path: &str) -> Result<(), RagError> {
        if let Some(label) = memory_label(path) {
            if !is_valid_label(label) {
                return Err(RagError::validation(format!(
                    "invalid memory label {label:?}: expected [A-Za-z0-9_.-]+"
                )));
            }
            return Ok(());
        }

        if let Some(c) = path.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
            return Err(RagError::validation(format!(
                "file path contains forbidden character {c:?}"
            )));
        }
        if path.chars().any(char::is_control) {
            return Err(RagError::validation(
                "file path contains a control character",
            ));
        }

        let p = Path::new(path);
        if !p.is_absolute() {
            return Err(RagError::validation(format!(
                "file path must be absolute: {path}"
            )));
        }

        let normalized = normalize(p);
        if !normalized.starts_with(&self.root_dir) {
            return Err(RagError::validation(format!(
                "file path escapes the allowed root directory: {path}"
            )));
        }

        Ok(())
    }

    /// Read a file and extract its text, returning an optional language
    /// hint derived from the extension.
    pub fn parse(&self, path: &str) -> Result<(String, Option<String>), RagError> {
        let p = Path::new(path);

        let meta = std::fs::metadata(p)
            .map_err(|e| RagError::Parse(format!("cannot read {path}: {e}")))?;
        if meta.len() > self.max_file_size {
            return Err(RagError::Parse(format!(
                "file exceeds the size limit ({} > {} bytes): {path}",
                meta.len(),
                self.max_file_size
            )));
        }

        let ext = p
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();

        if !is_supported_extension(&ext) {
            return Err(RagError::Parse(format!(
                "unsupported file type .{ext}: {path}"
            )));
        }

        let text = std::fs::read_to_string(p)
            .map_err(|e| RagError::Parse(format!("cannot read {path}: {e}")))?;

        Ok((text, language_hint(&ext).map(str::to_string)))
    }
}

fn is_supported_extension(ext: &str) -> bool {
    matches!(
        ext,
        "md" | "markdown"
            | "txt"
            | "text"
            | "rs"
            | "go"
            | "py"
            | "js"
            | "jsx"
            | "ts"
            | "tsx"
            | "java"
            | "kt"
            | "c"
            | "h"
            | "cpp"
            | "hpp"
            | "rb"
            | "sh"
            | "sql"
            | "json"
            | "yaml"
            | "yml"
            | "toml"
            | "html"
            | "css"
    )
}

fn language_hint(ext: &str) -> Option<&'static str> {
    let lang = match ext {
        "rs" => "rust",
        "go" => "go",
        "py" => "python",
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "java" => "java",
        "kt" => "kotlin",
        "c" | "h" => "c",
        "cpp" | "hpp" => "cpp",
        "rb" => "ruby",
        "sh" => "shell",
        "sql" => "sql",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "html" => "html",
        "css" => "css",
        "md" | "markdown" => "markdown",
        _ => return None,
    };
    Some(lang)
}

/// Lexical path normalization: resolves `.` and `..` without touching the
/// filesystem, so paths to not-yet-existing files still validate.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> Parser {
        Parser::new(PathBuf::from("/srv/docs"), 1024)
    }

    #[test]
    fn test_validate_path_in_root() {
        assert!(parser().validate("/srv/docs/guide.md").is_ok());
        assert!(parser().validate("/srv/docs/nested/notes.txt").is_ok());
    }

    #[test]
    fn test_validate_rejects_escape() {
        let p = parser();
        assert!(p.validate("/srv/docs/../secrets.md").is_err());
        assert!(p.validate("/etc/passwd").is_err());
    }

    #[test]
    fn test_validate_rejects_relative() {
        assert!(parser().validate("docs/guide.md").is_err());
    }

    #[test]
    fn test_validate_rejects_metacharacters() {
        let p = parser();
        for bad in [
            "/srv/docs/a'b.md",
            "/srv/docs/a\"b.md",
            "/srv/docs/a\\b.md",
            "/srv/docs/a`b.md",
            "/srv/docs/a;b.md",
            "/srv/docs/a\nb.md",
        ] {
            assert!(p.validate(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_validate_memory_labels() {
        let p = parser();
        assert!(p.validate("memory://doc1").is_ok());
        assert!(p.validate("memory://a_b-c.d").is_ok());
        assert!(p.validate("memory://").is_err());
        assert!(p.validate("memory://bad label").is_err());
        assert!(p.validate("memory://bad/label").is_err());
    }

    #[test]
    fn test_memory_label_extraction() {
        assert_eq!(memory_label("memory://doc1"), Some("doc1"));
        assert_eq!(memory_label("/srv/docs/a.md"), None);
    }

    #[test]
    fn test_parse_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("big.md");
        std::fs::write(&file, "x".repeat(2048)).unwrap();

        let p = Parser::new(dir.path().to_path_buf(), 1024);
        let err = p.parse(file.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("size limit"));
    }

    #[test]
    fn test_parse_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.pdf");
        std::fs::write(&file, "%PDF-").unwrap();

        let p = Parser::new(dir.path().to_path_buf(), 1024);
        let err = p.parse(file.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("unsupported file type"));
    }

    #[test]
    fn test_parse_language_hint() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.rs");
        std::fs::write(&file, "fn main() {}").unwrap();

        let p = Parser::new(dir.path().to_path_buf(), 1024);
        let (text, lang) = p.parse(file.to_str().unwrap()).unwrap();
        assert_eq!(text, "fn main() {}");
        assert_eq!(lang.as_deref(), Some("rust"));
    }

    #[test]
    fn test_parse_markdown_no_language() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.md");
        std::fs::write(&file, "# Notes").unwrap();

        let p = Parser::new(dir.path().to_path_buf(), 1024);
        let (_, lang) = p.parse(file.to_str().unwrap()).unwrap();
        assert_eq!(lang.as_deref(), Some("markdown"));
    }
}
