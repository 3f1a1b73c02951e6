//! Completion output parsing and staged artifact application.
//!
//! Workers receive a JSON artifact list (or findings list, for review) and
//! must apply files atomically: every artifact is staged next to its target
//! first, and only when all stages succeed are they renamed into place.
//! A failed stage rolls everything back so a half-written task never
//! reaches the workspace.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use cf_core::store::NewFinding;
use cf_core::types::{GateKind, Severity};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("completion output is not a valid artifact list: {0}")]
    Parse(String),
    #[error("artifact path escapes the workspace: {0}")]
    PathEscape(String),
    #[error("failed to write artifact {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParsedFinding {
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub recommendation: Option<String>,
}

impl ParsedFinding {
    pub fn into_new_finding(self, gate: GateKind) -> NewFinding {
        NewFinding {
            gate,
            severity: self.severity,
            file: self.file,
            line: self.line,
            message: self.message,
            recommendation: self.recommendation,
        }
    }
}

/// The `NEEDS_HUMAN:` marker, when present, wins over any other parse.
pub fn needs_human_reason(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        line.trim()
            .strip_prefix("NEEDS_HUMAN:")
            .map(|reason| reason.trim().to_string())
    })
}

/// Strip an optional markdown fence and return the JSON body.
pub(crate) fn json_body(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop the info string ("json") up to the first newline
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse a coding worker's reply into an artifact list.
pub fn parse_artifacts(text: &str) -> Result<Vec<ArtifactFile>, ArtifactError> {
    serde_json::from_str::<Vec<ArtifactFile>>(json_body(text))
        .map_err(|e| ArtifactError::Parse(e.to_string()))
}

/// Parse a review worker's reply into findings.
pub fn parse_findings(text: &str) -> Result<Vec<ParsedFinding>, ArtifactError> {
    serde_json::from_str::<Vec<ParsedFinding>>(json_body(text))
        .map_err(|e| ArtifactError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

const STAGE_SUFFIX: &str = ".cf-stage";

/// Reject absolute paths and any traversal outside the workspace root.
fn sanitize(workspace: &Path, raw: &str) -> Result<PathBuf, ArtifactError> {
    let rel = Path::new(raw);
    if rel.is_absolute() {
        return Err(ArtifactError::PathEscape(raw.into()));
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(ArtifactError::PathEscape(raw.into())),
        }
    }
    Ok(workspace.join(rel))
}

/// Stage every artifact, then flush them all into place. On any failure the
/// staged files are removed and nothing in the workspace changes.
pub async fn apply_artifacts(
    workspace: &Path,
    files: &[ArtifactFile],
) -> Result<Vec<String>, ArtifactError> {
    let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(files.len());

    let result = async {
        for file in files {
            let target = sanitize(workspace, &file.path)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    ArtifactError::Write {
                        path: file.path.clone(),
                        source: e,
                    }
                })?;
            }
            let stage = target.with_extension(match target.extension() {
                Some(ext) => format!("{}{}", ext.to_string_lossy(), STAGE_SUFFIX),
                None => STAGE_SUFFIX.trim_start_matches('.').to_string(),
            });
            tokio::fs::write(&stage, &file.content)
                .await
                .map_err(|e| ArtifactError::Write {
                    path: file.path.clone(),
                    source: e,
                })?;
            staged.push((stage, target));
        }

        // All stages landed; flush with renames.
        for (stage, target) in &staged {
            tokio::fs::rename(stage, target)
                .await
                .map_err(|e| ArtifactError::Write {
                    path: target.to_string_lossy().to_string(),
                    source: e,
                })?;
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        for (stage, _) in &staged {
            let _ = tokio::fs::remove_file(stage).await;
        }
        return Err(e);
    }

    Ok(files.iter().map(|f| f.path.clone()).collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
