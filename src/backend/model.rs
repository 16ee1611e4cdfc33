/// Model runner seam for the predict server.
///
/// The model itself is external: `CommandModelRunner` spawns a configured
/// detector command (yolov5 `detect.py` style) that writes the annotated
/// image to `<project>/<name>/<file>` and YOLO label rows to
/// `<project>/<name>/labels/<stem>.txt`.
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::errors::{DetectBotError, DetectBotResult};

/// Artifacts a finished run left behind; either may be missing.
#[derive(Debug, Clone, Default)]
pub struct ModelOutput {
    pub annotated_image: Option<PathBuf>,
    pub label_file: Option<PathBuf>,
}

#[async_trait]
pub trait ModelRunner: Send + Sync {
    async fn run(&self, source: &Path, project: &Path, name: &str) -> DetectBotResult<ModelOutput>;
}

/// One `class_idx cx cy w h [conf]` row of a YOLO label file.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelRow {
    pub class_index: usize,
    pub cx: f64,
    pub cy: f64,
    pub width: f64,
    pub height: f64,
}

pub fn parse_label_rows(content: &str) -> Vec<LabelRow> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(line_no, line)| {
            let row = parse_label_row(line);
            if row.is_none() {
                tracing::warn!(line = line_no + 1, content = %line, "unparseable label row");
            }
            row
        })
        .collect()
}

fn parse_label_row(line: &str) -> Option<LabelRow> {
    let mut fields = line.split_whitespace();
    let class_index = fields.next()?.parse::<usize>().ok()?;
    let mut coord = || fields.next().and_then(|f| f.parse::<f64>().ok());
    Some(LabelRow {
        class_index,
        cx: coord()?,
        cy: coord()?,
        width: coord()?,
        height: coord()?,
    })
}

/// Looks for the artifacts a yolov5-style run writes for `source`.
pub async fn collect_output(source: &Path, run_dir: &Path) -> ModelOutput {
    let mut output = ModelOutput::default();
    if let Some(file_name) = source.file_name() {
        let annotated = run_dir.join(file_name);
        if tokio::fs::try_exists(&annotated).await.unwrap_or(false) {
            output.annotated_image = Some(annotated);
        }
    }
    if let Some(stem) = source.file_stem() {
        let labels = run_dir
            .join("labels")
            .join(format!("{}.txt", stem.to_string_lossy()));
        if tokio::fs::try_exists(&labels).await.unwrap_or(false) {
            output.label_file = Some(labels);
        }
    }
    output
}

pub struct CommandModelRunner {
    program: String,
    /// `{source}`, `{project}` and `{name}` are substituted per run.
    args: Vec<String>,
}

impl CommandModelRunner {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    fn expand_args(&self, source: &Path, project: &Path, name: &str) -> Vec<String> {
        let source = source.to_string_lossy();
        let project = project.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{source}", &source)
                    .replace("{project}", &project)
                    .replace("{name}", name)
            })
            .collect()
    }
}

#[async_trait]
impl ModelRunner for CommandModelRunner {
    async fn run(&self, source: &Path, project: &Path, name: &str) -> DetectBotResult<ModelOutput> {
        let args = self.expand_args(source, project, name);
        tracing::info!(program = %self.program, ?args, "running detector");

        let output = tokio::process::Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DetectBotError::Model(format!("failed to spawn '{}': {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
            return Err(DetectBotError::Model(format!(
                "detector exited with {}: {tail}",
                output.status
            )));
        }

        Ok(collect_output(source, &project.join(name)).await)
    }
}
