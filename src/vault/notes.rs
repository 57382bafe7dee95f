//! Note access for the vault.
//!
//! All paths handed to the model and stored in the index are vault-relative,
//! forward-slash separated, and always end in `.md`. Writes go through
//! [`write_atomic`] so a crash mid-write never leaves a half-written note.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use std::time::UNIX_EPOCH;

use regex::Regex;
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};

use super::errors::VaultError;

/// Maximum length of a derived note description.
const DESCRIPTION_MAX_CHARS: usize = 100;

// ─── Vault ──────────────────────────────────────────────────────────────────

/// Handle to a vault root directory.
#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
}

impl Vault {
    /// Open a vault rooted at `root`. The directory must exist.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, VaultError> {
        let root = root.as_ref();
        let canonical = root.canonicalize().map_err(|e| VaultError::io(root.display(), e))?;
        if !canonical.is_dir() {
            return Err(VaultError::InvalidArgument {
                reason: format!("vault root is not a directory: {}", root.display()),
            });
        }
        Ok(Self { root: canonical })
    }

    /// Absolute, canonical vault root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a user/model supplied path to `(relative, absolute)`.
    ///
    /// Rejects anything that would land outside the root, including symlinks
    /// that point elsewhere. A path that does not exist yet is checked through
    /// its deepest existing ancestor.
    pub fn resolve(&self, path: &str) -> Result<(String, PathBuf), VaultError> {
        let rel = normalize_note_path(path)?;
        let abs = self.root.join(&rel);
        self.confine(&abs, &rel, path)?;
        Ok((rel, abs))
    }

    fn confine(&self, abs: &Path, rel: &str, original: &str) -> Result<(), VaultError> {
        let Some(existing) = abs.ancestors().find(|a| a.exists()) else {
            return Err(VaultError::PathEscape { path: original.to_string() });
        };
        let canonical = existing.canonicalize().map_err(|e| VaultError::io(rel, e))?;
        if !canonical.starts_with(&self.root) {
            return Err(VaultError::PathEscape { path: original.to_string() });
        }
        Ok(())
    }

    /// Resolve a folder path (no `.md` suffix). Empty or `/` is the root.
    pub fn resolve_folder(&self, path: &str) -> Result<(String, PathBuf), VaultError> {
        let trimmed = path.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Ok((String::new(), self.root.clone()));
        }
        check_components(trimmed, path)?;
        let abs = self.root.join(trimmed);
        self.confine(&abs, trimmed, path)?;
        Ok((trimmed.to_string(), abs))
    }

    pub fn exists(&self, path: &str) -> Result<bool, VaultError> {
        let (_, abs) = self.resolve(path)?;
        Ok(abs.is_file())
    }

    /// Read a note's full content.
    pub fn read(&self, path: &str) -> Result<String, VaultError> {
        let (rel, abs) = self.resolve(path)?;
        if !abs.is_file() {
            return Err(VaultError::NotFound { path: rel });
        }
        std::fs::read_to_string(&abs).map_err(|e| VaultError::io(&rel, e))
    }

    /// Replace a note's content atomically, creating parent folders as needed.
    pub fn write(&self, path: &str, content: &str) -> Result<String, VaultError> {
        let (rel, abs) = self.resolve(path)?;
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent).map_err(|e| VaultError::io(&rel, e))?;
        }
        write_atomic(&abs, content).map_err(|e| VaultError::io(&rel, e))?;
        Ok(rel)
    }

    /// Delete a note.
    pub fn delete(&self, path: &str) -> Result<String, VaultError> {
        let (rel, abs) = self.resolve(path)?;
        if !abs.is_file() {
            return Err(VaultError::NotFound { path: rel });
        }
        std::fs::remove_file(&abs).map_err(|e| VaultError::io(&rel, e))?;
        Ok(rel)
    }

    /// Convert an absolute path under the root back to a relative one.
    pub fn relative(&self, abs: &Path) -> Option<String> {
        let rel = abs.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    /// Directory that holds knap's own state inside the vault.
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(".knap")
    }
}

// ─── Paths ──────────────────────────────────────────────────────────────────

/// Normalize a note path: trims, drops a leading `/`, appends `.md`, and
/// rejects traversal.
pub fn normalize_note_path(path: &str) -> Result<String, VaultError> {
    let trimmed = path.trim().trim_start_matches('/').replace('\\', "/");
    if trimmed.is_empty() {
        return Err(VaultError::InvalidArgument {
            reason: "path must not be empty".to_string(),
        });
    }
    check_components(&trimmed, path)?;

    if trimmed.to_lowercase().ends_with(".md") {
        Ok(trimmed)
    } else {
        Ok(format!("{trimmed}.md"))
    }
}

fn check_components(rel: &str, original: &str) -> Result<(), VaultError> {
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(VaultError::PathEscape {
                    path: original.to_string(),
                })
            }
        }
    }
    Ok(())
}

/// True if any component of a relative path starts with `.`.
pub fn is_hidden(rel: &str) -> bool {
    rel.split('/').any(|part| part.starts_with('.'))
}

/// Folder portion of a relative note path. The root is `/`.
pub fn folder_of(rel: &str) -> String {
    match rel.rsplit_once('/') {
        Some((folder, _)) => folder.to_string(),
        None => "/".to_string(),
    }
}

/// File stem of a relative note path.
pub fn stem_of(rel: &str) -> &str {
    let name = rel.rsplit('/').next().unwrap_or(rel);
    name.strip_suffix(".md").unwrap_or(name)
}

// ─── Atomic writes ──────────────────────────────────────────────────────────

/// Write `content` to a uniquely named sibling temp file, then rename it over
/// `path`. The temp file is removed if anything fails before the rename.
pub fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".knap-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Modification time of a file in nanoseconds since the Unix epoch.
pub fn modified_nanos(path: &Path) -> std::io::Result<i64> {
    let modified = std::fs::metadata(path)?.modified()?;
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    Ok(i64::try_from(nanos).unwrap_or(i64::MAX))
}

/// Hex SHA-256 of a note's content.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ─── Front-matter ───────────────────────────────────────────────────────────

/// Split content into the raw YAML front-matter (if any) and the body.
pub fn split_frontmatter(content: &str) -> (Option<&str>, &str) {
    let rest = if let Some(r) = content.strip_prefix("---\n") {
        r
    } else if let Some(r) = content.strip_prefix("---\r\n") {
        r
    } else {
        return (None, content);
    };

    if let Some(body) = rest.strip_prefix("---\n") {
        return (Some(""), body);
    }

    let closing = rest
        .find("\n---\n")
        .map(|i| (i, i + 5))
        .or_else(|| rest.find("\n---\r\n").map(|i| (i, i + 6)))
        .or_else(|| rest.ends_with("\n---").then(|| (rest.len() - 4, rest.len())));

    match closing {
        Some((yaml_end, body_start)) => (Some(&rest[..yaml_end]), &rest[body_start..]),
        None => (None, content),
    }
}

/// Parse front-matter into a mapping. Notes without front-matter yield an
/// empty mapping; malformed YAML is an error.
pub fn parse_frontmatter(rel: &str, content: &str) -> Result<(Mapping, String), VaultError> {
    let (yaml, body) = split_frontmatter(content);
    let mapping = match yaml {
        None => Mapping::new(),
        Some(y) if y.trim().is_empty() => Mapping::new(),
        Some(y) => match serde_yaml::from_str::<Value>(y) {
            Ok(Value::Mapping(m)) => m,
            Ok(Value::Null) => Mapping::new(),
            Ok(_) => {
                return Err(VaultError::Frontmatter {
                    path: rel.to_string(),
                    reason: "front-matter is not a key/value mapping".to_string(),
                })
            }
            Err(e) => {
                return Err(VaultError::Frontmatter {
                    path: rel.to_string(),
                    reason: e.to_string(),
                })
            }
        },
    };
    Ok((mapping, body.to_string()))
}

/// Lenient variant for scanning: malformed front-matter is ignored.
pub fn frontmatter_lenient(content: &str) -> (Mapping, &str) {
    let (yaml, body) = split_frontmatter(content);
    let mapping = yaml
        .and_then(|y| serde_yaml::from_str::<Value>(y).ok())
        .and_then(|v| match v {
            Value::Mapping(m) => Some(m),
            _ => None,
        })
        .unwrap_or_default();
    (mapping, body)
}

/// Reassemble a note from front-matter and body. An empty mapping drops the block.
pub fn render_with_frontmatter(fm: &Mapping, body: &str) -> Result<String, VaultError> {
    if fm.is_empty() {
        return Ok(body.to_string());
    }
    let yaml = serde_yaml::to_string(fm).map_err(|e| VaultError::InvalidArgument {
        reason: format!("front-matter could not be serialized: {e}"),
    })?;
    Ok(format!("---\n{}\n---\n{}", yaml.trim_end_matches('\n'), body))
}

/// Body without its front-matter block.
pub fn strip_frontmatter(content: &str) -> &str {
    split_frontmatter(content).1
}

// ─── Derived metadata ───────────────────────────────────────────────────────

fn inline_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|\s)#([A-Za-z][A-Za-z0-9_/-]*)").expect("valid inline tag regex")
    })
}

fn wikilink_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[\[([^\]|#]+)(?:#[^\]|]*)?(?:\|[^\]]*)?\]\]").expect("valid wikilink regex")
    })
}

fn yaml_str<'a>(fm: &'a Mapping, key: &str) -> Option<&'a Value> {
    fm.get(Value::String(key.to_string()))
}

/// Title: front-matter `title`, else the first `# ` heading, else the file stem.
pub fn extract_title(fm: &Mapping, body: &str, rel: &str) -> String {
    if let Some(Value::String(title)) = yaml_str(fm, "title") {
        if !title.trim().is_empty() {
            return title.trim().to_string();
        }
    }
    body.lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| stem_of(rel).to_string())
}

/// First plain prose line of the body, capped in length.
pub fn extract_description(body: &str) -> Option<String> {
    let mut in_fence = false;
    for line in body.lines() {
        let line = line.trim();
        if line.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence || line.is_empty() || line.starts_with('#') || line.starts_with("---") {
            continue;
        }
        let mut chars = line.chars();
        let mut desc: String = chars.by_ref().take(DESCRIPTION_MAX_CHARS).collect();
        if chars.next().is_some() {
            desc.push_str("...");
        }
        return Some(desc);
    }
    None
}

/// Tags from front-matter (`tags` list or string) plus inline `#tag` tokens
/// outside code fences. Returned without the leading `#`.
pub fn extract_tags(fm: &Mapping, body: &str) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();

    match yaml_str(fm, "tags") {
        Some(Value::Sequence(seq)) => {
            for v in seq {
                if let Value::String(s) = v {
                    push_tag(&mut tags, s);
                }
            }
        }
        Some(Value::String(s)) => {
            for t in s.split(|c: char| c == ',' || c.is_whitespace()) {
                push_tag(&mut tags, t);
            }
        }
        _ => {}
    }

    let mut in_fence = false;
    for line in body.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        for cap in inline_tag_re().captures_iter(line) {
            push_tag(&mut tags, &cap[1]);
        }
    }
    tags
}

fn push_tag(tags: &mut BTreeSet<String>, raw: &str) {
    let t = raw.trim().trim_start_matches('#');
    if !t.is_empty() {
        tags.insert(t.to_string());
    }
}

/// Lower-cased link targets (`[[Target|alias]]` → `target`).
pub fn extract_links(body: &str) -> BTreeSet<String> {
    wikilink_re()
        .captures_iter(body)
        .map(|cap| link_key(&cap[1]))
        .filter(|k| !k.is_empty())
        .collect()
}

/// Key used to match a wiki-link against a note: lower-cased stem.
pub fn link_key(target: &str) -> String {
    stem_of(target.trim()).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Vault) {
        let dir = TempDir::new().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        (dir, vault)
    }

    #[test]
    fn test_normalize_appends_extension_and_strips_slash() {
        assert_eq!(normalize_note_path("/Projects/Idea").unwrap(), "Projects/Idea.md");
        assert_eq!(normalize_note_path("Old.md").unwrap(), "Old.md");
    }

    #[test]
    fn test_normalize_rejects_traversal() {
        assert!(matches!(
            normalize_note_path("../outside"),
            Err(VaultError::PathEscape { .. })
        ));
        assert!(matches!(
            normalize_note_path("a/../../b"),
            Err(VaultError::PathEscape { .. })
        ));
        assert!(normalize_note_path("   ").is_err());
    }

    #[test]
    fn test_write_read_delete() {
        let (_dir, vault) = setup();
        let rel = vault.write("Inbox/Note", "hello").unwrap();
        assert_eq!(rel, "Inbox/Note.md");
        assert_eq!(vault.read("Inbox/Note.md").unwrap(), "hello");

        vault.write("Inbox/Note", "replaced").unwrap();
        assert_eq!(vault.read("Inbox/Note").unwrap(), "replaced");

        vault.delete("Inbox/Note").unwrap();
        assert!(matches!(vault.read("Inbox/Note"), Err(VaultError::NotFound { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_new_note_under_symlinked_folder_cannot_escape() {
        let (_dir, vault) = setup();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), vault.root().join("link")).unwrap();

        assert!(matches!(
            vault.write("link/pwned", "x"),
            Err(VaultError::PathEscape { .. })
        ));
        assert!(matches!(
            vault.write("link/deeper/pwned", "x"),
            Err(VaultError::PathEscape { .. })
        ));
        assert!(matches!(
            vault.resolve_folder("link/new"),
            Err(VaultError::PathEscape { .. })
        ));
        assert_eq!(std::fs::read_dir(outside.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_concurrent_writes_to_one_note() {
        let (dir, vault) = setup();
        let path = vault.root().join("shared.md");
        let writers: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || write_atomic(&path, &format!("writer {i}")))
            })
            .collect();
        for w in writers {
            w.join().unwrap().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("writer "));
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["shared.md".to_string()]);
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let (dir, vault) = setup();
        vault.write("a", "x").unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.md".to_string()]);
    }

    #[test]
    fn test_frontmatter_split_and_render() {
        let content = "---\ntitle: Hello\ntags: [a, b]\n---\n# Body\n";
        let (fm, body) = parse_frontmatter("n.md", content).unwrap();
        assert_eq!(body, "# Body\n");
        assert_eq!(fm.len(), 2);

        let rendered = render_with_frontmatter(&fm, &body).unwrap();
        assert!(rendered.starts_with("---\ntitle: Hello\n"));
        assert!(rendered.ends_with("---\n# Body\n"));

        let (fm, body) = parse_frontmatter("n.md", "no front matter").unwrap();
        assert!(fm.is_empty());
        assert_eq!(body, "no front matter");
    }

    #[test]
    fn test_malformed_frontmatter_is_error() {
        let content = "---\n: : bad\n  - [\n---\nbody";
        assert!(matches!(
            parse_frontmatter("n.md", content),
            Err(VaultError::Frontmatter { .. })
        ));
        let (fm, _) = frontmatter_lenient(content);
        assert!(fm.is_empty());
    }

    #[test]
    fn test_title_fallbacks() {
        let (fm, body) = frontmatter_lenient("---\ntitle: From FM\n---\n# Heading\n");
        assert_eq!(extract_title(&fm, body, "x/File.md"), "From FM");

        let (fm, body) = frontmatter_lenient("intro\n# Heading\n");
        assert_eq!(extract_title(&fm, body, "x/File.md"), "Heading");

        let (fm, body) = frontmatter_lenient("no heading");
        assert_eq!(extract_title(&fm, body, "x/File.md"), "File");
    }

    #[test]
    fn test_description_skips_headings_and_truncates() {
        assert_eq!(
            extract_description("# Title\n\nFirst line.\nSecond").as_deref(),
            Some("First line.")
        );
        let long = "x".repeat(150);
        let desc = extract_description(&long).unwrap();
        assert_eq!(desc.len(), DESCRIPTION_MAX_CHARS + 3);
        assert!(extract_description("# only heading").is_none());
    }

    #[test]
    fn test_extract_tags() {
        let content = "---\ntags: [project, \"#work\"]\n---\nSome #idea and #idea again.\nnot#tag, #9bad\n```\n#incode\n```\n";
        let (fm, body) = frontmatter_lenient(content);
        let tags: Vec<String> = extract_tags(&fm, body).into_iter().collect();
        assert_eq!(tags, vec!["idea", "project", "work"]);

        let (fm, body) = frontmatter_lenient("---\ntags: alpha, beta\n---\n");
        assert_eq!(extract_tags(&fm, body).len(), 2);
    }

    #[test]
    fn test_extract_links() {
        let links = extract_links("See [[Projects/Alpha|the alpha]] and [[beta#Section]] and [[Gamma.md]].");
        let links: Vec<String> = links.into_iter().collect();
        assert_eq!(links, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_folder_and_stem() {
        assert_eq!(folder_of("a/b/c.md"), "a/b");
        assert_eq!(folder_of("c.md"), "/");
        assert_eq!(stem_of("a/b/c.md"), "c");
        assert!(is_hidden(".knap/index.json"));
        assert!(is_hidden("a/.obsidian/x.md"));
        assert!(!is_hidden("a/b.md"));
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("").len(), 64);
    }
}
