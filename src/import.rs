//! Filesystem import: the write path that creates nodes and indexes them.
//!
//! Walks a directory, mirrors its sub-directories as folder nodes and turns
//! every included file into a document node (`.eml` files become mail
//! nodes). The importing principal gets full permissions and its roles get
//! read access. Re-importing the same tree updates nodes in place and skips
//! files whose content hash is unchanged.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use dms_search_core::collaborators::{NodeRepository, ProgressSink};
use dms_search_core::models::{
    ContentSource, IndexableNode, NodeKind, Permission, Principal, ALL_PERMISSIONS,
};

use crate::extract::{guess_mime, MIME_EMAIL};
use crate::services::Services;
use crate::sqlite_nodes::content_hash;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub folders: u64,
    pub documents: u64,
    pub mails: u64,
    pub unchanged: u64,
    pub failed: u64,
}

struct Importer<'a> {
    services: &'a Services,
    principal: &'a Principal,
    folders: HashMap<PathBuf, String>,
    stats: ImportStats,
}

pub async fn run_import(
    services: &Services,
    root: &Path,
    parent: Option<&str>,
    principal: &Principal,
    progress: &dyn ProgressSink,
) -> Result<ImportStats> {
    if services.flags.is_read_only() {
        bail!("Repository is read-only; import refused");
    }
    if !root.is_dir() {
        bail!("Import root is not a directory: {}", root.display());
    }
    if let Some(parent) = parent {
        if services.nodes.get(parent).await?.is_none() {
            bail!("Parent folder not found: {}", parent);
        }
    }

    let files = scan(services, root)?;
    let total = files.len() as u64;
    progress.started(total);

    let root_name = root
        .canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| "import".to_string());

    let mut importer = Importer {
        services,
        principal,
        folders: HashMap::new(),
        stats: ImportStats::default(),
    };
    let root_uuid = importer.folder(parent, &root_name).await?;
    importer.folders.insert(PathBuf::new(), root_uuid);

    for (i, (path, relative)) in files.iter().enumerate() {
        let dir = relative.parent().map(Path::to_path_buf).unwrap_or_default();
        let folder = importer.ensure_folders(&dir).await?;
        if let Err(e) = importer.file(&folder, path).await {
            warn!(path = %path.display(), error = %e, "import failed");
            importer.stats.failed += 1;
        }
        progress.advanced(i as u64 + 1, total);
    }

    let stats = importer.stats;
    progress.finished(total, stats.failed);
    info!(
        root = %root.display(),
        folders = stats.folders,
        documents = stats.documents,
        mails = stats.mails,
        unchanged = stats.unchanged,
        failed = stats.failed,
        "import finished"
    );
    Ok(stats)
}

/// Included files under `root` with their relative paths, sorted.
fn scan(services: &Services, root: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    let cfg = &services.config.import;
    let include_set = build_globset(&cfg.include_globs)?;

    let mut excludes = vec!["**/.git/**".to_string(), "**/.*".to_string()];
    excludes.extend(cfg.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(cfg.follow_symlinks)
        .sort_by_file_name()
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path).to_path_buf();
        let rel_str = relative.to_string_lossy();
        if exclude_set.is_match(rel_str.as_ref()) || !include_set.is_match(rel_str.as_ref()) {
            debug!(path = %rel_str, "skipped");
            continue;
        }
        files.push((path.to_path_buf(), relative));
    }
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

fn modified(path: &Path) -> DateTime<Utc> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

/// Header fields and body of an RFC 822 message.
struct ParsedMail {
    subject: Option<String>,
    from: Option<String>,
    to: Vec<String>,
    body: String,
}

fn parse_mail(raw: &str) -> ParsedMail {
    let (head, body) = match raw.find("\r\n\r\n") {
        Some(i) => (&raw[..i], &raw[i + 4..]),
        None => match raw.find("\n\n") {
            Some(i) => (&raw[..i], &raw[i + 2..]),
            None => (raw, ""),
        },
    };

    let mut mail = ParsedMail {
        subject: None,
        from: None,
        to: Vec::new(),
        body: body.to_string(),
    };
    for line in head.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "subject" => mail.subject = Some(value.to_string()),
            "from" => mail.from = Some(value.to_string()),
            "to" | "cc" => mail.to.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string),
            ),
            _ => {}
        }
    }
    mail
}

impl Importer<'_> {
    fn grant(&self, node: &mut IndexableNode) {
        node.user_permissions
            .insert(self.principal.user.clone(), ALL_PERMISSIONS);
        for role in &self.principal.roles {
            node.role_permissions
                .insert(role.clone(), Permission::Read.bit());
        }
    }

    /// Existing uuid of `name` under `parent`, or a fresh one.
    async fn uuid_for(&self, parent: Option<&str>, name: &str) -> Result<(String, bool)> {
        Ok(match self.services.nodes.child_named(parent, name).await? {
            Some(uuid) => (uuid, true),
            None => (uuid::Uuid::new_v4().to_string(), false),
        })
    }

    async fn folder(&mut self, parent: Option<&str>, name: &str) -> Result<String> {
        let (uuid, existed) = self.uuid_for(parent, name).await?;
        if !existed {
            let mut node = IndexableNode::new(uuid.clone(), NodeKind::Folder, name);
            node.parent = parent.map(str::to_string);
            node.author = Some(self.principal.user.clone());
            self.grant(&mut node);
            self.services.nodes.save(&node).await?;
            self.services.maintainer.index_one(&node).await?;
            self.stats.folders += 1;
        }
        Ok(uuid)
    }

    /// Folder uuid for a relative directory, creating missing ancestors.
    async fn ensure_folders(&mut self, dir: &Path) -> Result<String> {
        if let Some(uuid) = self.folders.get(dir) {
            return Ok(uuid.clone());
        }
        let mut current = PathBuf::new();
        let mut parent_uuid = self.folders.get(&current).cloned().unwrap_or_default();
        for component in dir.components() {
            current.push(component);
            parent_uuid = match self.folders.get(&current) {
                Some(uuid) => uuid.clone(),
                None => {
                    let name = component.as_os_str().to_string_lossy().to_string();
                    let uuid = self.folder(Some(&parent_uuid), &name).await?;
                    self.folders.insert(current.clone(), uuid.clone());
                    uuid
                }
            };
        }
        Ok(parent_uuid)
    }

    async fn file(&mut self, folder: &str, path: &Path) -> Result<()> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mime = guess_mime(path);
        let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

        let (kind, content, mail) = if mime == MIME_EMAIL {
            let parsed = parse_mail(&String::from_utf8_lossy(&data));
            let body = ContentSource::Text(parsed.body.clone());
            (NodeKind::Mail, body, Some(parsed))
        } else if mime.starts_with("text/") {
            match String::from_utf8(data) {
                Ok(text) => (NodeKind::Document, ContentSource::Text(text), None),
                Err(e) => (
                    NodeKind::Document,
                    ContentSource::Binary {
                        data: e.into_bytes(),
                        mime_type: mime.to_string(),
                    },
                    None,
                ),
            }
        } else {
            (
                NodeKind::Document,
                ContentSource::Binary {
                    data,
                    mime_type: mime.to_string(),
                },
                None,
            )
        };

        let (uuid, existed) = self.uuid_for(Some(folder), &name).await?;
        let hash = content_hash(&content);
        if existed && self.services.nodes.stored_hash(&uuid).await?.as_deref() == Some(hash.as_str()) {
            self.stats.unchanged += 1;
            return Ok(());
        }

        let mut node = IndexableNode::new(uuid, kind, name);
        node.parent = Some(folder.to_string());
        node.author = Some(self.principal.user.clone());
        node.last_modified = modified(path);
        node.mime_type = Some(mime.to_string());
        if let Some(mail) = mail {
            node.subject = mail.subject;
            node.from = mail.from;
            node.to = mail.to.into_iter().collect();
        } else {
            node.title = path.file_stem().map(|s| s.to_string_lossy().to_string());
        }
        node.content = Some(content);
        self.grant(&mut node);

        self.services.nodes.save(&node).await?;
        self.services.maintainer.update_one(&node).await?;
        match kind {
            NodeKind::Mail => self.stats.mails += 1,
            _ => self.stats.documents += 1,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mail_headers_and_body() {
        let mail = parse_mail(
            "From: alice@example.com\nTo: bob@example.com, carol@example.com\nSubject: Budget\n\nNumbers are up.\n",
        );
        assert_eq!(mail.subject.as_deref(), Some("Budget"));
        assert_eq!(mail.from.as_deref(), Some("alice@example.com"));
        assert_eq!(mail.to, ["bob@example.com", "carol@example.com"]);
        assert_eq!(mail.body, "Numbers are up.\n");
    }

    #[test]
    fn mail_without_body() {
        let mail = parse_mail("Subject: empty");
        assert_eq!(mail.subject.as_deref(), Some("empty"));
        assert!(mail.body.is_empty());
    }

    #[test]
    fn globset_rejects_bad_patterns() {
        assert!(build_globset(&["**/*.md".to_string()]).is_ok());
        assert!(build_globset(&["a{".to_string()]).is_err());
    }
}
