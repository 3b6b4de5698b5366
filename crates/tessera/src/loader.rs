use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock, RwLock},
    time::{Duration, SystemTime},
};

use ahash::AHashMap;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::{
    cache::{CacheStats, TtlCache},
    error::LoadError,
};

/// Source text plus provenance for a loaded template.
#[derive(Debug, Clone)]
pub struct TemplateMetadata {
    pub name: String,
    pub content: String,
    pub mod_time: Option<SystemTime>,
    /// Lowercase hex SHA-256 of the content.
    pub checksum: String,
}

impl TemplateMetadata {
    #[must_use]
    pub fn new(name: impl Into<String>, content: String, mod_time: Option<SystemTime>) -> Self {
        let checksum = checksum(&content);
        Self {
            name: name.into(),
            content,
            mod_time,
            checksum,
        }
    }
}

fn checksum(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Canonicalizes a template name: leading slashes are stripped, path
/// separators normalized to `/`, `.` segments dropped, and any `..` segment
/// rejected outright.
pub fn resolve_name(name: &str) -> Result<String, LoadError> {
    let normalized = name.replace('\\', "/");
    let mut segments = Vec::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(LoadError::path_traversal(name)),
            other => segments.push(other),
        }
    }
    Ok(segments.join("/"))
}

/// Deduplicated set of template names referenced by `extends`, `include`,
/// `import` and `from` tags in raw source. Purely informational, for
/// discovery and tooling; it never drives parsing.
#[must_use]
pub fn extract_dependencies(source: &str) -> Vec<String> {
    static PATTERNS: LazyLock<[Regex; 4]> = LazyLock::new(|| {
        let tag = |keyword: &str| {
            Regex::new(&format!(r#"\{{%-?\s*{keyword}\s+["']([^"']+)["']"#)).expect("static dependency pattern")
        };
        [tag("extends"), tag("include"), tag("import"), tag("from")]
    });
    let mut names = Vec::new();
    for pattern in PATTERNS.iter() {
        for captures in pattern.captures_iter(source) {
            let name = captures[1].to_owned();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

/// Simple `*`/`?` glob matching for template discovery.
fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(a), Some(b)) if a == b => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

/// Template lookup backend.
///
/// The base tier covers source access; canonicalization, metadata,
/// discovery, and cache statistics have default implementations derived from
/// it. AST production stays with the environment, which owns the parsing
/// options a loader cannot know about.
pub trait Loader: Send + Sync {
    fn get_source(&self, name: &str) -> Result<String, LoadError>;

    /// Whether the loader can serve this template without touching its
    /// backing store.
    fn is_cached(&self, name: &str) -> bool;

    fn list_templates(&self) -> Vec<String>;

    fn resolve_template_name(&self, name: &str) -> Result<String, LoadError> {
        resolve_name(name)
    }

    fn get_source_with_metadata(&self, name: &str) -> Result<TemplateMetadata, LoadError> {
        let resolved = self.resolve_template_name(name)?;
        let content = self.get_source(&resolved)?;
        Ok(TemplateMetadata::new(resolved, content, None))
    }

    fn search_templates(&self, pattern: &str) -> Vec<String> {
        self.list_templates()
            .into_iter()
            .filter(|name| glob_match(pattern, name))
            .collect()
    }

    fn get_templates_by_extension(&self, extension: &str) -> Vec<String> {
        let suffix = format!(".{}", extension.trim_start_matches('.'));
        self.list_templates()
            .into_iter()
            .filter(|name| name.ends_with(&suffix))
            .collect()
    }

    fn get_templates_in_directory(&self, directory: &str) -> Vec<String> {
        let prefix = if directory.is_empty() {
            String::new()
        } else {
            format!("{}/", directory.trim_end_matches('/'))
        };
        self.list_templates()
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .collect()
    }

    fn get_template_info(&self, name: &str) -> Result<TemplateMetadata, LoadError> {
        self.get_source_with_metadata(name)
    }

    fn clear_cache(&self) {}

    fn get_cache_stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

/// Filesystem loader: ordered search paths, a configurable extension list,
/// an opt-in symlink policy, and a TTL source cache (five minutes by
/// default).
#[derive(Debug)]
pub struct FileSystemLoader {
    search_paths: Vec<PathBuf>,
    extensions: Vec<String>,
    follow_symlinks: bool,
    source_cache: TtlCache<String>,
}

impl FileSystemLoader {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

    #[must_use]
    pub fn new(search_path: impl Into<PathBuf>) -> Self {
        Self::with_search_paths(vec![search_path.into()])
    }

    #[must_use]
    pub fn with_search_paths(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            extensions: vec!["html".to_owned(), "jinja".to_owned(), "j2".to_owned(), "txt".to_owned()],
            follow_symlinks: false,
            source_cache: TtlCache::new(Some(Self::DEFAULT_TTL)),
        }
    }

    #[must_use]
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    #[must_use]
    pub fn with_follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.source_cache = TtlCache::new(ttl);
        self
    }

    /// Candidate relative paths for a resolved name: the name itself, and
    /// the name with each configured extension when it has none.
    fn candidates(&self, resolved: &str) -> Vec<String> {
        let mut candidates = vec![resolved.to_owned()];
        if !resolved.rsplit('/').next().is_some_and(|last| last.contains('.')) {
            for extension in &self.extensions {
                candidates.push(format!("{resolved}.{extension}"));
            }
        }
        candidates
    }

    fn read_candidate(&self, path: &Path) -> Result<Option<String>, io::Error> {
        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        if metadata.is_symlink() && !self.follow_symlinks {
            tracing::debug!(path = %path.display(), "skipping symlinked template");
            return Ok(None);
        }
        if metadata.is_dir() || (metadata.is_symlink() && !fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)) {
            return Ok(None);
        }
        fs::read_to_string(path).map(Some)
    }

    fn locate(&self, resolved: &str) -> Result<(PathBuf, String), LoadError> {
        for base in &self.search_paths {
            for candidate in self.candidates(resolved) {
                let path = base.join(&candidate);
                match self.read_candidate(&path) {
                    Ok(Some(content)) => return Ok((path, content)),
                    Ok(None) => {}
                    Err(err) => return Err(LoadError::read(resolved, &err)),
                }
            }
        }
        Err(LoadError::not_found(resolved))
    }

    fn collect_templates(&self, base: &Path, dir: &Path, out: &mut Vec<String>) {
        let Ok(entries) = fs::read_dir(dir) else { return };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(metadata) = fs::symlink_metadata(&path) else {
                continue;
            };
            if metadata.is_symlink() && !self.follow_symlinks {
                continue;
            }
            if path.is_dir() {
                self.collect_templates(base, &path, out);
            } else if let Some(extension) = path.extension().and_then(|e| e.to_str())
                && self.extensions.iter().any(|known| known == extension)
                && let Ok(relative) = path.strip_prefix(base)
            {
                out.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }
}

impl Loader for FileSystemLoader {
    fn get_source(&self, name: &str) -> Result<String, LoadError> {
        let resolved = resolve_name(name)?;
        if let Some(content) = self.source_cache.get(&resolved) {
            return Ok(content);
        }
        let (path, content) = self.locate(&resolved)?;
        tracing::debug!(template = %resolved, path = %path.display(), "loaded template source");
        self.source_cache.insert(resolved, content.clone());
        Ok(content)
    }

    fn is_cached(&self, name: &str) -> bool {
        resolve_name(name).is_ok_and(|resolved| self.source_cache.contains(&resolved))
    }

    fn list_templates(&self) -> Vec<String> {
        let mut names = Vec::new();
        for base in &self.search_paths {
            self.collect_templates(base, base, &mut names);
        }
        names.sort();
        names.dedup();
        names
    }

    fn get_source_with_metadata(&self, name: &str) -> Result<TemplateMetadata, LoadError> {
        let resolved = resolve_name(name)?;
        let (path, content) = self.locate(&resolved)?;
        let mod_time = fs::metadata(&path).ok().and_then(|m| m.modified().ok());
        Ok(TemplateMetadata::new(resolved, content, mod_time))
    }

    fn clear_cache(&self) {
        self.source_cache.clear();
    }

    fn get_cache_stats(&self) -> CacheStats {
        self.source_cache.stats()
    }
}

/// Read-only bundle of templates compiled into the binary.
#[derive(Debug, Default)]
pub struct EmbeddedLoader {
    templates: AHashMap<String, &'static str>,
}

impl EmbeddedLoader {
    #[must_use]
    pub fn new(entries: &[(&str, &'static str)]) -> Self {
        let templates = entries
            .iter()
            .filter_map(|(name, content)| Some((resolve_name(name).ok()?, *content)))
            .collect();
        Self { templates }
    }
}

impl Loader for EmbeddedLoader {
    fn get_source(&self, name: &str) -> Result<String, LoadError> {
        let resolved = resolve_name(name)?;
        self.templates
            .get(&resolved)
            .map(|content| (*content).to_owned())
            .ok_or_else(|| LoadError::not_found(resolved))
    }

    fn is_cached(&self, name: &str) -> bool {
        resolve_name(name).is_ok_and(|resolved| self.templates.contains_key(&resolved))
    }

    fn list_templates(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Mutable in-memory loader, mostly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    templates: RwLock<AHashMap<String, String>>,
}

impl MemoryLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_template(&self, name: &str, source: impl Into<String>) -> Result<(), LoadError> {
        let resolved = resolve_name(name)?;
        self.templates
            .write()
            .expect("template map lock poisoned")
            .insert(resolved, source.into());
        Ok(())
    }

    pub fn remove_template(&self, name: &str) {
        if let Ok(resolved) = resolve_name(name) {
            self.templates
                .write()
                .expect("template map lock poisoned")
                .remove(&resolved);
        }
    }
}

impl Loader for MemoryLoader {
    fn get_source(&self, name: &str) -> Result<String, LoadError> {
        let resolved = resolve_name(name)?;
        self.templates
            .read()
            .expect("template map lock poisoned")
            .get(&resolved)
            .cloned()
            .ok_or_else(|| LoadError::not_found(resolved))
    }

    fn is_cached(&self, name: &str) -> bool {
        resolve_name(name).is_ok_and(|resolved| {
            self.templates
                .read()
                .expect("template map lock poisoned")
                .contains_key(&resolved)
        })
    }

    fn list_templates(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .templates
            .read()
            .expect("template map lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// First-match-wins composition of loaders.
#[derive(Default)]
pub struct ChainLoader {
    loaders: Vec<Arc<dyn Loader>>,
}

impl ChainLoader {
    #[must_use]
    pub fn new(loaders: Vec<Arc<dyn Loader>>) -> Self {
        Self { loaders }
    }

    pub fn push(&mut self, loader: Arc<dyn Loader>) {
        self.loaders.push(loader);
    }
}

impl Loader for ChainLoader {
    fn get_source(&self, name: &str) -> Result<String, LoadError> {
        let mut last_err = LoadError::not_found(name);
        for loader in &self.loaders {
            match loader.get_source(name) {
                Ok(content) => return Ok(content),
                Err(err) if err.is_not_found() => last_err = err,
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    fn is_cached(&self, name: &str) -> bool {
        self.loaders.iter().any(|loader| loader.is_cached(name))
    }

    fn list_templates(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .loaders
            .iter()
            .flat_map(|loader| loader.list_templates())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn get_source_with_metadata(&self, name: &str) -> Result<TemplateMetadata, LoadError> {
        let mut last_err = LoadError::not_found(name);
        for loader in &self.loaders {
            match loader.get_source_with_metadata(name) {
                Ok(metadata) => return Ok(metadata),
                Err(err) if err.is_not_found() => last_err = err,
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    fn clear_cache(&self) {
        for loader in &self.loaders {
            loader.clear_cache();
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn name_resolution() {
        assert_eq!(resolve_name("/a/b.html").unwrap(), "a/b.html");
        assert_eq!(resolve_name("a\\b.html").unwrap(), "a/b.html");
        assert_eq!(resolve_name("./a/./b.html").unwrap(), "a/b.html");
        assert!(resolve_name("../secret").is_err());
        assert!(resolve_name("a/../b").is_err());
    }

    #[test]
    fn dependency_extraction() {
        let source = r#"
            {% extends "base.html" %}
            {%- include 'partials/head.html' %}
            {% import "macros.html" as m %}
            {% from "forms.html" import field %}
            {% include "base.html" %}
        "#;
        assert_eq!(
            extract_dependencies(source),
            vec!["base.html", "partials/head.html", "macros.html", "forms.html"]
        );
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("*.html", "index.html"));
        assert!(glob_match("users/*.html", "users/list.html"));
        assert!(glob_match("?.txt", "a.txt"));
        assert!(!glob_match("*.html", "index.txt"));
    }

    #[test]
    fn memory_loader_roundtrip() {
        let loader = MemoryLoader::new();
        loader.add_template("a.html", "hello").unwrap();
        assert_eq!(loader.get_source("/a.html").unwrap(), "hello");
        assert!(loader.is_cached("a.html"));
        assert!(loader.get_source("missing.html").unwrap_err().is_not_found());
        assert_eq!(loader.list_templates(), vec!["a.html"]);
    }

    #[test]
    fn embedded_loader_is_read_only_and_always_cached() {
        let loader = EmbeddedLoader::new(&[("x.html", "X"), ("sub/y.html", "Y")]);
        assert!(loader.is_cached("x.html"));
        assert_eq!(loader.get_source("sub/y.html").unwrap(), "Y");
        assert_eq!(loader.list_templates(), vec!["sub/y.html", "x.html"]);
    }

    #[test]
    fn chain_loader_first_match_wins() {
        let first = MemoryLoader::new();
        first.add_template("a.html", "from-first").unwrap();
        let second = MemoryLoader::new();
        second.add_template("a.html", "from-second").unwrap();
        second.add_template("b.html", "only-second").unwrap();
        let chain = ChainLoader::new(vec![Arc::new(first), Arc::new(second)]);
        assert_eq!(chain.get_source("a.html").unwrap(), "from-first");
        assert_eq!(chain.get_source("b.html").unwrap(), "only-second");
        assert_eq!(chain.list_templates(), vec!["a.html", "b.html"]);
    }

    #[test]
    fn metadata_checksum_is_stable() {
        let loader = MemoryLoader::new();
        loader.add_template("a.html", "hello").unwrap();
        let meta = loader.get_source_with_metadata("a.html").unwrap();
        assert_eq!(meta.name, "a.html");
        assert_eq!(
            meta.checksum,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn filesystem_loader_with_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.html"), "A").unwrap();
        std::fs::write(dir.path().join("sub/b.html"), "B").unwrap();
        std::fs::write(dir.path().join("notes.md"), "ignored").unwrap();

        let loader = FileSystemLoader::new(dir.path());
        assert_eq!(loader.get_source("a.html").unwrap(), "A");
        assert_eq!(loader.get_source("sub/b.html").unwrap(), "B");
        assert!(loader.get_source("missing.html").unwrap_err().is_not_found());
        // second read is served from the TTL cache
        assert!(loader.is_cached("a.html"));
        assert_eq!(loader.get_source("a.html").unwrap(), "A");
        assert_eq!(loader.get_cache_stats().hits, 1);
        assert_eq!(loader.list_templates(), vec!["a.html", "sub/b.html"]);
        assert_eq!(loader.search_templates("sub/*"), vec!["sub/b.html"]);
        assert_eq!(loader.get_templates_by_extension("html").len(), 2);
        assert_eq!(loader.get_templates_in_directory("sub"), vec!["sub/b.html"]);

        loader.clear_cache();
        assert!(!loader.is_cached("a.html"));
    }

    #[test]
    fn extensionless_lookup_appends_known_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page.html"), "P").unwrap();
        let loader = FileSystemLoader::new(dir.path());
        assert_eq!(loader.get_source("page").unwrap(), "P");
    }
}
