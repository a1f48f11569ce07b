use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Sibling object asserting the main artifact is complete. Written after the
/// artifact, never before; readers treat unmarked artifacts as absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoneMarker {
    pub task_id: Uuid,
    pub output_uri: String,
    pub checksum: String,
    pub record_count: i64,
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WrittenArtifact {
    pub uri: String,
    pub byte_size: u64,
    pub record_count: i64,
    pub checksum: String,
}

/// Write-once artifact storage rooted at a local directory, laid out as
/// `jobs/<job_id>/{outputs,aggregation,batches,checkpoints,logs}/...`.
#[derive(Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.root.join("jobs").join(job_id.to_string())
    }

    pub fn output_path(&self, job_id: Uuid, task_id: Uuid, ext: &str) -> PathBuf {
        self.job_dir(job_id)
            .join("outputs")
            .join(format!("{task_id}.{ext}"))
    }

    pub fn aggregation_level_path(&self, job_id: Uuid, level: u32, k: usize, ext: &str) -> PathBuf {
        self.job_dir(job_id)
            .join("aggregation")
            .join(level.to_string())
            .join(format!("{k}.{ext}"))
    }

    pub fn final_path(&self, job_id: Uuid, ext: &str) -> PathBuf {
        self.job_dir(job_id)
            .join("aggregation")
            .join(format!("final.{ext}"))
    }

    pub fn batch_input_path(&self, job_id: Uuid, seq: i32) -> PathBuf {
        self.job_dir(job_id)
            .join("batches")
            .join(format!("{seq}.input"))
    }

    pub fn checkpoint_path(&self, job_id: Uuid, batch_id: Uuid) -> PathBuf {
        self.job_dir(job_id)
            .join("checkpoints")
            .join(format!("{batch_id}.json"))
    }

    fn log_path(&self, job_id: Uuid, task_id: Uuid) -> PathBuf {
        self.job_dir(job_id)
            .join("logs")
            .join(format!("{task_id}.log"))
    }

    /// `<dir>/<stem>.<ext>` -> `<dir>/<stem>.done`
    pub fn done_path(output: &Path) -> PathBuf {
        let stem = output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        output.with_file_name(format!("{stem}.done"))
    }

    pub fn checksum(content: &[u8]) -> String {
        let digest = Sha256::digest(content);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn count_records(content: &[u8]) -> i64 {
        if content.is_empty() {
            return 0;
        }
        let newlines = content.iter().filter(|&&b| b == b'\n').count() as i64;
        if content.ends_with(b"\n") {
            newlines
        } else {
            newlines + 1
        }
    }

    /// Write an artifact, then its `.done` marker. The marker write is last
    /// so a crash in between leaves an invisible artifact, never a lying
    /// marker.
    pub async fn write_marked(
        &self,
        path: &Path,
        task_id: Uuid,
        content: &[u8],
    ) -> anyhow::Result<WrittenArtifact> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("write {}", path.display()))?;

        let checksum = Self::checksum(content);
        let record_count = Self::count_records(content);
        let uri = path.to_string_lossy().into_owned();
        let marker = DoneMarker {
            task_id,
            output_uri: uri.clone(),
            checksum: checksum.clone(),
            record_count,
            written_at: Utc::now(),
        };
        let marker_json = serde_json::to_vec(&marker)?;
        tokio::fs::write(Self::done_path(path), marker_json)
            .await
            .with_context(|| format!("write done marker for {}", path.display()))?;

        Ok(WrittenArtifact {
            uri,
            byte_size: content.len() as u64,
            record_count,
            checksum,
        })
    }

    pub async fn write_task_output(
        &self,
        job_id: Uuid,
        task_id: Uuid,
        ext: &str,
        content: &[u8],
    ) -> anyhow::Result<WrittenArtifact> {
        let path = self.output_path(job_id, task_id, ext);
        self.write_marked(&path, task_id, content).await
    }

    /// The done marker for an output, or None when it is missing or corrupt
    /// (either way the artifact is invisible).
    pub async fn load_done(&self, output_uri: &str) -> Option<DoneMarker> {
        let done = Self::done_path(Path::new(output_uri));
        let bytes = tokio::fs::read(&done).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Full validation: marker present, artifact present, checksum matches.
    pub async fn verify(&self, output_uri: &str) -> anyhow::Result<DoneMarker> {
        let marker = self
            .load_done(output_uri)
            .await
            .with_context(|| format!("missing done marker for {output_uri}"))?;
        let content = tokio::fs::read(output_uri)
            .await
            .with_context(|| format!("read {output_uri}"))?;
        let checksum = Self::checksum(&content);
        anyhow::ensure!(
            checksum == marker.checksum,
            "checksum mismatch for {output_uri}: {} != {}",
            checksum,
            marker.checksum
        );
        Ok(marker)
    }

    pub async fn read(&self, uri: &str) -> anyhow::Result<Vec<u8>> {
        tokio::fs::read(uri)
            .await
            .with_context(|| format!("read {uri}"))
    }

    pub async fn read_lines(&self, uri: &str) -> anyhow::Result<Vec<String>> {
        let content = self.read(uri).await?;
        let text = String::from_utf8(content).with_context(|| format!("utf8 {uri}"))?;
        Ok(text.lines().map(|l| l.to_string()).collect())
    }

    /// Write one batch's input slice; used by the row-chunked and key-hash
    /// partitioners. Plain file, no marker: batch inputs are read-only after
    /// creation, not outputs.
    pub async fn write_batch_input(
        &self,
        job_id: Uuid,
        seq: i32,
        lines: &[String],
    ) -> anyhow::Result<String> {
        let path = self.batch_input_path(job_id, seq);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        tokio::fs::write(&path, content.as_bytes())
            .await
            .with_context(|| format!("write {}", path.display()))?;
        Ok(path.to_string_lossy().into_owned())
    }

    // ----------------------------
    // Task logs
    // ----------------------------

    pub async fn append_log(&self, job_id: Uuid, task_id: Uuid, line: &str) -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt;

        let path = self.log_path(job_id, task_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(format!("{} {line}\n", Utc::now().to_rfc3339()).as_bytes())
            .await?;
        Ok(())
    }

    pub async fn read_log(&self, job_id: Uuid, task_id: Uuid) -> anyhow::Result<String> {
        let path = self.log_path(job_id, task_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_logged_tasks(&self, job_id: Uuid) -> anyhow::Result<Vec<Uuid>> {
        let dir = self.job_dir(job_id).join("logs");
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(".log") {
                if let Ok(task_id) = stem.parse::<Uuid>() {
                    out.push(task_id);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}
