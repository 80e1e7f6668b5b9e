use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Owns the on-disk layout under the configured workspace root: one
/// directory per lab, holding per-node config extracts and any scratch
/// state a provider needs across the lifetime of a deploy.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn lab_dir(&self, lab_id: &str) -> PathBuf {
        self.root.join(sanitize(lab_id))
    }

    pub fn node_config_dir(&self, lab_id: &str, node_name: &str) -> PathBuf {
        self.lab_dir(lab_id).join("configs").join(sanitize(node_name))
    }

    pub async fn ensure_lab_dir(&self, lab_id: &str) -> Result<PathBuf> {
        let dir = self.lab_dir(lab_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating lab workspace dir {}", dir.display()))?;
        Ok(dir)
    }

    pub async fn write_node_config(&self, lab_id: &str, node_name: &str, path: &str, content: &[u8]) -> Result<()> {
        let dir = self.node_config_dir(lab_id, node_name);
        fs::create_dir_all(&dir).await?;
        let target = dir.join(sanitize(path));
        fs::write(&target, content)
            .await
            .with_context(|| format!("writing config to {}", target.display()))?;
        Ok(())
    }

    fn manifest_path(&self, lab_id: &str) -> PathBuf {
        self.lab_dir(lab_id).join("manifest.json")
    }

    /// Records the node names deployed for a lab, independent of any
    /// provider-specific bookkeeping, so `destroy`/`reconcile` can find a
    /// lab's nodes even for providers (like VM) that don't register
    /// anything in the OVS endpoint table.
    pub async fn write_manifest(&self, lab_id: &str, node_names: &[String]) -> Result<()> {
        let path = self.manifest_path(lab_id);
        let content = serde_json::to_vec_pretty(node_names)?;
        fs::write(&path, content)
            .await
            .with_context(|| format!("writing manifest to {}", path.display()))?;
        Ok(())
    }

    pub async fn read_manifest(&self, lab_id: &str) -> Result<Vec<String>> {
        let path = self.manifest_path(lab_id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn links_path(&self, lab_id: &str) -> PathBuf {
        self.lab_dir(lab_id).join("links.json")
    }

    /// Persists the set of hot-connected links for a lab, keyed by link
    /// id, so `GET /labs/{lab}/links` can list them without re-deriving
    /// topology from raw OVS port tags.
    pub async fn write_links(&self, lab_id: &str, links: &std::collections::HashMap<String, agent_types::LinkInfo>) -> Result<()> {
        let path = self.links_path(lab_id);
        let content = serde_json::to_vec_pretty(links)?;
        fs::write(&path, content)
            .await
            .with_context(|| format!("writing links to {}", path.display()))?;
        Ok(())
    }

    pub async fn read_links(&self, lab_id: &str) -> Result<std::collections::HashMap<String, agent_types::LinkInfo>> {
        let path = self.links_path(lab_id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(std::collections::HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn overlay_links_path(&self, lab_id: &str) -> PathBuf {
        self.lab_dir(lab_id).join("overlay_links.json")
    }

    /// Tracks the cross-host link ids attached through the overlay for a
    /// lab, so `/overlay/cleanup` can tear all of them down without the
    /// caller having to enumerate its own link ids.
    pub async fn add_overlay_link(&self, lab_id: &str, link_id: &str) -> Result<()> {
        let mut links = self.read_overlay_links(lab_id).await?;
        if !links.iter().any(|l| l == link_id) {
            links.push(link_id.to_string());
        }
        let path = self.overlay_links_path(lab_id);
        fs::create_dir_all(self.lab_dir(lab_id)).await?;
        fs::write(&path, serde_json::to_vec_pretty(&links)?).await?;
        Ok(())
    }

    pub async fn remove_overlay_link(&self, lab_id: &str, link_id: &str) -> Result<()> {
        let mut links = self.read_overlay_links(lab_id).await?;
        links.retain(|l| l != link_id);
        let path = self.overlay_links_path(lab_id);
        fs::write(&path, serde_json::to_vec_pretty(&links)?).await?;
        Ok(())
    }

    pub async fn read_overlay_links(&self, lab_id: &str) -> Result<Vec<String>> {
        let path = self.overlay_links_path(lab_id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn kinds_path(&self, lab_id: &str) -> PathBuf {
        self.lab_dir(lab_id).join("kinds.json")
    }

    /// Records each node's vendor kind alongside the manifest so a later
    /// config-extraction call knows which extract command to run without
    /// needing the original deploy topology still in hand.
    pub async fn write_node_kinds(&self, lab_id: &str, kinds: &std::collections::HashMap<String, String>) -> Result<()> {
        let path = self.kinds_path(lab_id);
        let content = serde_json::to_vec_pretty(kinds)?;
        fs::write(&path, content)
            .await
            .with_context(|| format!("writing node kinds to {}", path.display()))?;
        Ok(())
    }

    pub async fn read_node_kinds(&self, lab_id: &str) -> Result<std::collections::HashMap<String, String>> {
        let path = self.kinds_path(lab_id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(std::collections::HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove_lab_dir(&self, lab_id: &str) -> Result<()> {
        let dir = self.lab_dir(lab_id);
        if fs::try_exists(&dir).await.unwrap_or(false) {
            fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("removing lab workspace dir {}", dir.display()))?;
        }
        Ok(())
    }

    /// Lists the lab ids currently tracked on disk, used by the reconciler
    /// to cross-check against the controller's view of live labs.
    pub async fn known_labs(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    out.push(name.to_string());
                }
            }
        }
        Ok(out)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_and_remove_lab_dir_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = WorkspaceManager::new(tmp.path());
        let dir = ws.ensure_lab_dir("lab-1").await.unwrap();
        assert!(fs::try_exists(&dir).await.unwrap());
        ws.remove_lab_dir("lab-1").await.unwrap();
        assert!(!fs::try_exists(&dir).await.unwrap());
    }

    #[tokio::test]
    async fn write_node_config_creates_parent_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = WorkspaceManager::new(tmp.path());
        ws.write_node_config("lab-1", "router1", "startup-config.cfg", b"hostname r1\n")
            .await
            .unwrap();
        let path = ws.node_config_dir("lab-1", "router1").join("startup-config.cfg");
        let content = fs::read(&path).await.unwrap();
        assert_eq!(content, b"hostname r1\n");
    }

    #[test]
    fn sanitize_strips_path_separators() {
        assert_eq!(sanitize("../../etc/passwd"), ".._.._etc_passwd");
    }
}
