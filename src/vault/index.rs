//! Vault index — cached structural summary of the vault.
//!
//! A [`VaultIndexSnapshot`] is immutable once built. [`VaultIndex`] holds the
//! current snapshot behind an `Arc` and replaces it wholesale on refresh, so
//! readers always see either the old or the new snapshot. No lock is held
//! while the filesystem is being scanned.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::errors::VaultError;
use super::notes::{self, Vault};
use crate::agent_core::tokens::truncate_utf8;

/// Root folder key.
pub const ROOT_FOLDER: &str = "/";

/// Folders listed in the rendered summary.
const SUMMARY_MAX_FOLDERS: usize = 15;
/// Tags listed in the rendered summary.
const SUMMARY_MAX_TAGS: usize = 15;
/// Recently modified notes shown first.
const SUMMARY_MAX_RECENT: usize = 15;
/// Hub notes shown after the recent ones.
const SUMMARY_MAX_HUBS: usize = 10;
/// Backlinks required for a note to count as a hub.
const HUB_MIN_BACKLINKS: usize = 3;
/// Window for "recently modified".
const RECENT_DAYS: i64 = 7;

// ─── Snapshot ───────────────────────────────────────────────────────────────

/// Indexed projection of a single note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteEntry {
    pub title: String,
    /// Short text summary (first prose line), may be empty.
    pub summary: String,
    pub tags: BTreeSet<String>,
    /// Lower-cased link targets found in the body.
    pub links: BTreeSet<String>,
    /// Modification time, nanoseconds since the Unix epoch.
    pub modified: i64,
    pub size: u64,
}

/// Immutable view of the vault at one point in time.
///
/// Every path in `folders` and `tags` is a key of `notes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultIndexSnapshot {
    pub built_at: DateTime<Utc>,
    /// Folder path → notes directly inside it. Ancestor folders are present
    /// even when they hold no notes themselves.
    pub folders: BTreeMap<String, BTreeSet<String>>,
    /// Tag → notes carrying it.
    pub tags: BTreeMap<String, BTreeSet<String>>,
    /// Note path → summary entry.
    pub notes: BTreeMap<String, NoteEntry>,
}

impl VaultIndexSnapshot {
    fn from_notes(notes: BTreeMap<String, NoteEntry>, built_at: DateTime<Utc>) -> Self {
        let mut folders: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut tags: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        folders.insert(ROOT_FOLDER.to_string(), BTreeSet::new());

        for (path, entry) in &notes {
            let folder = notes::folder_of(path);
            // Register ancestors so the folder tree has no gaps.
            if folder != ROOT_FOLDER {
                let mut prefix = String::new();
                for part in folder.split('/') {
                    if !prefix.is_empty() {
                        prefix.push('/');
                    }
                    prefix.push_str(part);
                    folders.entry(prefix.clone()).or_default();
                }
            }
            folders.entry(folder).or_default().insert(path.clone());

            for tag in &entry.tags {
                tags.entry(tag.clone()).or_default().insert(path.clone());
            }
        }

        Self {
            built_at,
            folders,
            tags,
            notes,
        }
    }

    /// Equal in content, ignoring when the snapshot was built.
    pub fn same_content(&self, other: &Self) -> bool {
        self.folders == other.folders && self.tags == other.tags && self.notes == other.notes
    }

    pub fn note_count(&self) -> usize {
        self.notes.len()
    }

    /// Snapshot age relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.built_at
    }

    /// Number of notes linking to each link key.
    pub fn backlink_counts(&self) -> HashMap<String, usize> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for entry in self.notes.values() {
            for link in &entry.links {
                *counts.entry(link.clone()).or_default() += 1;
            }
        }
        counts
    }

    /// Notes that link to `path`, sorted.
    pub fn backlinks_to(&self, path: &str) -> Vec<String> {
        let key = notes::link_key(path);
        let full_key = path.trim_end_matches(".md").to_lowercase();
        self.notes
            .iter()
            .filter(|(p, e)| {
                p.as_str() != path && (e.links.contains(&key) || e.links.contains(&full_key))
            })
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Notes carrying `tag` (leading `#` ignored, case-insensitive).
    pub fn notes_with_tag(&self, tag: &str) -> Vec<String> {
        let wanted = tag.trim().trim_start_matches('#').to_lowercase();
        let mut found: BTreeSet<String> = BTreeSet::new();
        for (t, paths) in &self.tags {
            if t.to_lowercase() == wanted {
                found.extend(paths.iter().cloned());
            }
        }
        found.into_iter().collect()
    }
}

// ─── Build / refresh ────────────────────────────────────────────────────────

struct ScannedNote {
    rel: String,
    abs: PathBuf,
    modified: i64,
    size: u64,
}

/// Full scan of the vault. The snapshot is stamped with `now`, taken before
/// the scan starts.
pub fn build(vault: &Vault, now: DateTime<Utc>) -> Result<VaultIndexSnapshot, VaultError> {
    let scanned = scan(vault)?;
    let mut notes = BTreeMap::new();
    for note in scanned {
        if let Some(entry) = summarize_note(&note) {
            notes.insert(note.rel, entry);
        }
    }
    let snapshot = VaultIndexSnapshot::from_notes(notes, now);
    tracing::info!(notes = snapshot.note_count(), "vault index built");
    Ok(snapshot)
}

/// Incremental refresh against `existing`.
///
/// Notes whose modification time or size is unchanged keep their entry; new
/// or changed notes are re-summarized; vanished notes are dropped.
pub fn refresh(
    vault: &Vault,
    existing: &VaultIndexSnapshot,
    now: DateTime<Utc>,
) -> Result<VaultIndexSnapshot, VaultError> {
    let scanned = scan(vault)?;
    let mut notes = BTreeMap::new();
    let mut reused = 0usize;
    let mut resummarized = 0usize;

    for note in scanned {
        match existing.notes.get(&note.rel) {
            Some(prev) if prev.modified == note.modified && prev.size == note.size => {
                reused += 1;
                notes.insert(note.rel, prev.clone());
            }
            _ => {
                if let Some(entry) = summarize_note(&note) {
                    resummarized += 1;
                    notes.insert(note.rel, entry);
                }
            }
        }
    }

    let removed = existing
        .notes
        .keys()
        .filter(|k| !notes.contains_key(*k))
        .count();
    let snapshot = VaultIndexSnapshot::from_notes(notes, now);
    tracing::info!(
        notes = snapshot.note_count(),
        reused,
        resummarized,
        removed,
        "vault index refreshed"
    );
    Ok(snapshot)
}

/// Every visible note with its modification time, unordered.
pub fn list_notes(vault: &Vault) -> Result<Vec<(String, i64)>, VaultError> {
    Ok(scan(vault)?.into_iter().map(|n| (n.rel, n.modified)).collect())
}

fn scan(vault: &Vault) -> Result<Vec<ScannedNote>, VaultError> {
    let root = vault.root();
    std::fs::read_dir(root).map_err(|e| VaultError::IndexBuild {
        root: root.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut out = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable vault entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let is_md = entry
            .path()
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("md"))
            .unwrap_or(false);
        if !is_md {
            continue;
        }
        let Some(rel) = vault.relative(entry.path()) else {
            continue;
        };
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %rel, error = %e, "skipping note without metadata");
                continue;
            }
        };
        let modified = notes::modified_nanos(entry.path()).unwrap_or(0);
        out.push(ScannedNote {
            rel,
            abs: entry.path().to_path_buf(),
            modified,
            size: meta.len(),
        });
    }
    Ok(out)
}

fn summarize_note(note: &ScannedNote) -> Option<NoteEntry> {
    let bytes = match std::fs::read(&note.abs) {
        Ok(b) => b,
        Err(e) => {
            // Deleted between scan and read.
            tracing::debug!(path = %note.rel, error = %e, "note vanished during scan");
            return None;
        }
    };
    let content = String::from_utf8_lossy(&bytes);
    let (fm, body) = notes::frontmatter_lenient(&content);

    Some(NoteEntry {
        title: notes::extract_title(&fm, body, &note.rel),
        summary: notes::extract_description(body).unwrap_or_default(),
        tags: notes::extract_tags(&fm, body),
        links: notes::extract_links(body),
        modified: note.modified,
        size: note.size,
    })
}

// ─── Summary rendering ──────────────────────────────────────────────────────

/// Bounds for [`render_summary`].
#[derive(Debug, Clone, Copy)]
pub struct SummaryLimits {
    pub max_chars: usize,
    pub max_key_notes: usize,
}

impl Default for SummaryLimits {
    fn default() -> Self {
        Self {
            max_chars: 6_000,
            max_key_notes: 30,
        }
    }
}

/// Render a bounded digest of the snapshot for the model context.
///
/// Deterministic for a given snapshot and `now`. When over budget, key-note
/// lines are dropped from the end (lowest priority first) before a hard cut.
pub fn render_summary(
    snapshot: &VaultIndexSnapshot,
    limits: SummaryLimits,
    now: DateTime<Utc>,
) -> String {
    let mut head: Vec<String> = vec![
        "## Your Vault".to_string(),
        String::new(),
        format!("**{} notes** indexed", snapshot.note_count()),
        String::new(),
        "**Structure:**".to_string(),
    ];

    for (folder, paths) in snapshot.folders.iter().take(SUMMARY_MAX_FOLDERS) {
        if folder == ROOT_FOLDER {
            head.push(format!("- Root/ ({} notes)", paths.len()));
        } else {
            let depth = folder.matches('/').count() + 1;
            let name = folder.rsplit('/').next().unwrap_or(folder);
            head.push(format!("{}- {}/ ({} notes)", "  ".repeat(depth), name, paths.len()));
        }
    }
    if snapshot.folders.len() > SUMMARY_MAX_FOLDERS {
        head.push(format!(
            "  ... and {} more folders",
            snapshot.folders.len() - SUMMARY_MAX_FOLDERS
        ));
    }
    head.push(String::new());

    if !snapshot.tags.is_empty() {
        let mut tags: Vec<(&String, usize)> =
            snapshot.tags.iter().map(|(t, p)| (t, p.len())).collect();
        tags.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        let tag_str = tags
            .iter()
            .take(SUMMARY_MAX_TAGS)
            .map(|(t, n)| format!("#{t} ({n})"))
            .collect::<Vec<_>>()
            .join(", ");
        head.push(format!("**Top Tags:** {tag_str}"));
        head.push(String::new());
    }

    let selected = select_key_notes(snapshot, limits.max_key_notes, now);
    let mut key_lines: Vec<String> = selected
        .iter()
        .map(|(path, entry)| {
            if entry.summary.is_empty() {
                format!("- {}: {}", path, entry.title)
            } else {
                format!("- {}: {} - \"{}\"", path, entry.title, entry.summary)
            }
        })
        .collect();

    let total = snapshot.note_count();
    let head_text = head.join("\n");
    loop {
        let text = assemble(&head_text, &key_lines, total);
        if text.len() <= limits.max_chars {
            return text;
        }
        if key_lines.pop().is_none() {
            return truncate_utf8(&text, limits.max_chars).to_string();
        }
    }
}

fn assemble(head: &str, key_lines: &[String], total: usize) -> String {
    let mut text = head.to_string();
    if !key_lines.is_empty() {
        text.push_str("\n**Key Notes:**\n");
        text.push_str(&key_lines.join("\n"));
    }
    if total > key_lines.len() {
        text.push_str(&format!("\n\n*... and {} more notes*", total - key_lines.len()));
    }
    text
}

/// Recent notes first, then hubs, then alphabetical by title.
fn select_key_notes<'a>(
    snapshot: &'a VaultIndexSnapshot,
    max: usize,
    now: DateTime<Utc>,
) -> Vec<(&'a String, &'a NoteEntry)> {
    let week_ago = (now - Duration::days(RECENT_DAYS))
        .timestamp_nanos_opt()
        .unwrap_or(i64::MIN);
    let backlinks = snapshot.backlink_counts();
    let backlinks_of = |path: &str| {
        backlinks
            .get(&notes::link_key(path))
            .copied()
            .unwrap_or(0)
    };

    let mut recent = Vec::new();
    let mut hubs = Vec::new();
    let mut other = Vec::new();
    for (path, entry) in &snapshot.notes {
        if entry.modified >= week_ago {
            recent.push((path, entry));
        } else if backlinks_of(path) >= HUB_MIN_BACKLINKS {
            hubs.push((path, entry));
        } else {
            other.push((path, entry));
        }
    }
    recent.sort_by(|a, b| b.1.modified.cmp(&a.1.modified).then_with(|| a.0.cmp(b.0)));
    hubs.sort_by(|a, b| {
        backlinks_of(b.0)
            .cmp(&backlinks_of(a.0))
            .then_with(|| a.0.cmp(b.0))
    });
    other.sort_by(|a, b| {
        a.1.title
            .to_lowercase()
            .cmp(&b.1.title.to_lowercase())
            .then_with(|| a.0.cmp(b.0))
    });

    let mut result: Vec<(&String, &NoteEntry)> = Vec::new();
    result.extend(recent.into_iter().take(SUMMARY_MAX_RECENT.min(max)));
    let remaining = max.saturating_sub(result.len());
    result.extend(hubs.into_iter().take(SUMMARY_MAX_HUBS.min(remaining)));
    let remaining = max.saturating_sub(result.len());
    result.extend(other.into_iter().take(remaining));
    result
}

// ─── Process-wide cache ─────────────────────────────────────────────────────

/// Holds the current snapshot for one vault and decides when to refresh it.
pub struct VaultIndex {
    vault: Vault,
    freshness: Duration,
    persist_path: Option<PathBuf>,
    current: RwLock<Option<Arc<VaultIndexSnapshot>>>,
}

impl VaultIndex {
    /// Create a cache, seeding it from a persisted snapshot when one exists.
    pub fn new(vault: Vault, freshness: Duration, persist_path: Option<PathBuf>) -> Self {
        let seeded = persist_path.as_deref().and_then(load_snapshot).map(Arc::new);
        Self {
            vault,
            freshness,
            persist_path,
            current: RwLock::new(seeded),
        }
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    /// The current snapshot, if one has been built or loaded.
    pub fn current(&self) -> Option<Arc<VaultIndexSnapshot>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Return a snapshot no older than the freshness window.
    ///
    /// Builds on first use; refreshes incrementally when stale. On failure the
    /// previous snapshot stays in place and the error is returned.
    pub fn ensure_fresh(&self, now: DateTime<Utc>) -> Result<Arc<VaultIndexSnapshot>, VaultError> {
        match self.current() {
            None => Ok(self.install(build(&self.vault, now)?)),
            Some(snap) if snap.age(now) > self.freshness => {
                tracing::debug!(age_secs = snap.age(now).num_seconds(), "vault index stale");
                let next = refresh(&self.vault, &snap, now)?;
                Ok(self.install(next))
            }
            Some(snap) => Ok(snap),
        }
    }

    /// Refresh incrementally now, regardless of age.
    pub fn refresh_now(&self) -> Result<Arc<VaultIndexSnapshot>, VaultError> {
        let now = Utc::now();
        match self.current() {
            Some(snap) => {
                let next = refresh(&self.vault, &snap, now)?;
                Ok(self.install(next))
            }
            None => self.rebuild(),
        }
    }

    /// Discard the current snapshot and scan from scratch.
    pub fn rebuild(&self) -> Result<Arc<VaultIndexSnapshot>, VaultError> {
        let next = build(&self.vault, Utc::now())?;
        Ok(self.install(next))
    }

    /// Swap in `next` unless a newer snapshot landed meanwhile.
    fn install(&self, next: VaultIndexSnapshot) -> Arc<VaultIndexSnapshot> {
        let next = Arc::new(next);
        let installed = {
            let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
            match guard.as_ref() {
                Some(existing) if existing.built_at > next.built_at => existing.clone(),
                _ => {
                    *guard = Some(next.clone());
                    next
                }
            }
        };

        if let Some(path) = &self.persist_path {
            if let Err(e) = save_snapshot(path, &installed) {
                tracing::warn!(path = %path.display(), error = %e, "failed to persist vault index");
            }
        }
        installed
    }
}

// ─── Persistence ────────────────────────────────────────────────────────────

fn load_snapshot(path: &Path) -> Option<VaultIndexSnapshot> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<VaultIndexSnapshot>(&content) {
        Ok(snap) => {
            tracing::info!(
                notes = snap.note_count(),
                path = %path.display(),
                "loaded persisted vault index"
            );
            Some(snap)
        }
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "ignoring unreadable vault index");
            None
        }
    }
}

fn save_snapshot(path: &Path, snapshot: &VaultIndexSnapshot) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string(snapshot).map_err(std::io::Error::other)?;
    notes::write_atomic(path, &json)
}
