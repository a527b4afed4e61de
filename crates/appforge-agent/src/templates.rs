use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;

/// Optional per-template launch overrides, read from the workspace at start.
pub const MANIFEST_FILE: &str = "appforge.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateManifest {
    pub image: Option<String>,
    pub command: Option<String>,
    pub container_port: Option<u16>,
}

/// Template ids are directory names; keep them to a safe charset so they can
/// never escape the template root.
pub fn is_valid_template_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[derive(Debug, Clone)]
pub struct TemplateStore {
    root: PathBuf,
}

impl TemplateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for `template_id`, if it names an existing template.
    pub async fn resolve(&self, template_id: &str) -> Option<PathBuf> {
        if !is_valid_template_id(template_id) {
            return None;
        }
        let dir = self.root.join(template_id);
        match tokio::fs::metadata(&dir).await {
            Ok(m) if m.is_dir() => Some(dir),
            _ => None,
        }
    }

    pub async fn list(&self) -> Vec<String> {
        let mut out = Vec::new();
        let Ok(mut rd) = tokio::fs::read_dir(&self.root).await else {
            return out;
        };
        while let Ok(Some(entry)) = rd.next_entry().await {
            let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_dir && is_valid_template_id(&name) {
                out.push(name);
            }
        }
        out.sort();
        out
    }

    /// Copy the template tree into `dest`. A partial copy is removed on failure.
    pub async fn materialize(&self, template_dir: &Path, dest: &Path) -> anyhow::Result<()> {
        let src = template_dir.to_path_buf();
        let dst = dest.to_path_buf();
        let result = tokio::task::spawn_blocking(move || copy_dir_recursive(&src, &dst))
            .await
            .map_err(|e| anyhow::anyhow!("copy task failed: {e}"))
            .and_then(|r| r);

        if result.is_err()
            && let Err(e) = tokio::fs::remove_dir_all(dest).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %dest.display(), error = %e, "failed to remove partial workspace");
        }
        result
    }
}

pub async fn read_manifest(workspace: &Path) -> anyhow::Result<TemplateManifest> {
    let path = workspace.join(MANIFEST_FILE);
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(TemplateManifest::default());
        }
        Err(e) => return Err(anyhow::anyhow!("read {}: {e}", path.display())),
    };
    let manifest: TemplateManifest =
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parse {MANIFEST_FILE}: {e}"))?;
    if manifest.container_port == Some(0) {
        anyhow::bail!("container_port must be non-zero");
    }
    Ok(manifest)
}

/// Recursive copy. Symlinks are resolved and their targets copied, so a
/// workspace never points back into the template root.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    let entries = fs::read_dir(src).with_context(|| format!("read {}", src.display()))?;
    for entry in entries {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());

        let mut kind = entry.file_type()?;
        if kind.is_symlink() {
            kind = fs::metadata(&from)
                .with_context(|| format!("dangling symlink {}", from.display()))?
                .file_type();
        }

        if kind.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else if kind.is_file() {
            fs::copy(&from, &to).with_context(|| format!("copy {}", from.display()))?;
        } else {
            anyhow::bail!("unsupported file type at {}", from.display());
        }
    }
    Ok(())
}
