//! Command-backed stage executors.
//!
//! These wrap the external tools that actually move bytes: a `yt-dlp`-style
//! fetcher for the acquisition stage and an `ffmpeg`-style processor for the
//! transform stage. Both honour their cancel flag between (and during)
//! process invocations and never leave partial output behind.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::{remove_artifact, ArtifactRef, ProgressSender, StageError, StageExecutor};
use crate::core::task::ProcessingMode;
use crate::core::types::TaskId;
use crate::pipeline::cancel::CancelFlag;
use crate::pipeline::plan::{transform_plan, TransformStep};

/// Run an external command to completion, killing it if `cancel` fires.
async fn run_command(
    program: &str,
    args: &[String],
    cancel: &CancelFlag,
) -> Result<(), StageError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| StageError::Launch {
            command: program.to_string(),
            source,
        })?;

    // Drain stderr concurrently so a chatty tool cannot fill the pipe.
    let mut stderr_pipe = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(StageError::Cancelled);
        }
    };

    if status.success() {
        Ok(())
    } else {
        let stderr = stderr_task.await.unwrap_or_default();
        Err(StageError::CommandFailed {
            command: program.to_string(),
            code: status.code().unwrap_or(-1),
            stderr: stderr.trim().to_string(),
        })
    }
}

/// Acquisition stage backed by an external fetcher (yt-dlp compatible).
pub struct CommandDownloader {
    program: String,
    work_dir: PathBuf,
    max_height: u32,
}

impl CommandDownloader {
    /// Create a downloader writing into `work_dir`.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: "yt-dlp".to_string(),
            work_dir: work_dir.into(),
            max_height: 720,
        }
    }

    /// Override the fetcher binary.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Cap the downloaded resolution.
    pub fn with_max_height(mut self, max_height: u32) -> Self {
        self.max_height = max_height;
        self
    }
}

#[async_trait]
impl StageExecutor for CommandDownloader {
    async fn run(
        &self,
        source_ref: &str,
        _mode: ProcessingMode,
        progress: ProgressSender,
        cancel: &CancelFlag,
    ) -> Result<ArtifactRef, StageError> {
        if source_ref.trim().is_empty() {
            return Err(StageError::BadSource("empty source reference".to_string()));
        }

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let output = self.work_dir.join(format!("{}.mp4", TaskId::new()));

        let args = vec![
            "--quiet".to_string(),
            "--no-playlist".to_string(),
            "-f".to_string(),
            format!("best[height<={}][ext=mp4]/best[height<={}]", self.max_height, self.max_height),
            // Annotation track for the transform stage, when one exists.
            "--write-auto-subs".to_string(),
            "--convert-subs".to_string(),
            "srt".to_string(),
            "-o".to_string(),
            output.to_string_lossy().into_owned(),
            source_ref.to_string(),
        ];

        let _ = progress.send(10);
        match run_command(&self.program, &args, cancel).await {
            Ok(()) => {
                let _ = progress.send(100);
                Ok(ArtifactRef::new(output))
            }
            Err(err) => {
                // Never leave a partial download behind.
                let _ = remove_artifact(&output).await;
                let _ = remove_artifact(&output.with_extension("srt")).await;
                Err(err)
            }
        }
    }
}

/// Transform stage backed by an external encoder (ffmpeg compatible),
/// driven by the declarative plan for the task's mode.
pub struct CommandTransformer {
    program: String,
    artifact_dir: PathBuf,
}

impl CommandTransformer {
    /// Create a transformer producing artifacts in `artifact_dir`.
    pub fn new(artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: "ffmpeg".to_string(),
            artifact_dir: artifact_dir.into(),
        }
    }

    /// Override the encoder binary.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn step_args(
        &self,
        step: TransformStep,
        input: &Path,
        annotations: Option<&Path>,
        output: &Path,
    ) -> Vec<String> {
        let mut args = vec!["-y".to_string(), "-i".to_string(), path_arg(input)];
        match step {
            TransformStep::Remux => {
                args.extend(["-c".to_string(), "copy".to_string()]);
            }
            TransformStep::EmbedAnnotations => match annotations {
                Some(track) => {
                    args.extend(["-vf".to_string(), format!("subtitles={}", path_arg(track))]);
                }
                // No annotation track: pass the media through unchanged.
                None => args.extend(["-c".to_string(), "copy".to_string()]),
            },
            TransformStep::AdjustSpeed { factor } => {
                args.extend([
                    "-filter_complex".to_string(),
                    format!(
                        "[0:v]setpts={:.4}*PTS[v];[0:a]atempo={:.4}[a]",
                        1.0 / factor,
                        factor
                    ),
                    "-map".to_string(),
                    "[v]".to_string(),
                    "-map".to_string(),
                    "[a]".to_string(),
                ]);
            }
            // Handled separately in `apply_repeat`.
            TransformStep::RepeatWithAnnotations => {}
        }
        args.push(path_arg(output));
        args
    }

    async fn apply_step(
        &self,
        step: TransformStep,
        input: &Path,
        annotations: Option<&Path>,
        output: &Path,
        cancel: &CancelFlag,
    ) -> Result<(), StageError> {
        if let TransformStep::RepeatWithAnnotations = step {
            return self.apply_repeat(input, annotations, output, cancel).await;
        }
        let args = self.step_args(step, input, annotations, output);
        run_command(&self.program, &args, cancel).await
    }

    /// First pass plain, second pass annotated, concatenated.
    async fn apply_repeat(
        &self,
        input: &Path,
        annotations: Option<&Path>,
        output: &Path,
        cancel: &CancelFlag,
    ) -> Result<(), StageError> {
        let part1 = output.with_extension("part1.mp4");
        let part2 = output.with_extension("part2.mp4");
        let list = output.with_extension("concat.txt");

        let result = async {
            let args = self.step_args(TransformStep::Remux, input, None, &part1);
            run_command(&self.program, &args, cancel).await?;

            let args = self.step_args(TransformStep::EmbedAnnotations, input, annotations, &part2);
            run_command(&self.program, &args, cancel).await?;

            let manifest = format!("file '{}'\nfile '{}'\n", part1.display(), part2.display());
            tokio::fs::write(&list, manifest).await?;

            let concat = vec![
                "-y".to_string(),
                "-f".to_string(),
                "concat".to_string(),
                "-safe".to_string(),
                "0".to_string(),
                "-i".to_string(),
                path_arg(&list),
                "-c".to_string(),
                "copy".to_string(),
                path_arg(output),
            ];
            run_command(&self.program, &concat, cancel).await
        }
        .await;

        let _ = remove_artifact(&part1).await;
        let _ = remove_artifact(&part2).await;
        let _ = remove_artifact(&list).await;
        result
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl StageExecutor for CommandTransformer {
    async fn run(
        &self,
        source_ref: &str,
        mode: ProcessingMode,
        progress: ProgressSender,
        cancel: &CancelFlag,
    ) -> Result<ArtifactRef, StageError> {
        let input = PathBuf::from(source_ref);
        if !input.exists() {
            return Err(StageError::BadSource(format!(
                "input media missing: {}",
                input.display()
            )));
        }

        tokio::fs::create_dir_all(&self.artifact_dir).await?;
        let sidecar = input.with_extension("srt");
        let annotations = sidecar.exists().then_some(sidecar.as_path());

        let plan = transform_plan(mode);
        let final_output = self.artifact_dir.join(format!("{}.mp4", TaskId::new()));

        let mut current = input.clone();
        let mut intermediates: Vec<PathBuf> = Vec::new();
        let total = plan.len();

        for (index, step) in plan.into_iter().enumerate() {
            if cancel.is_cancelled() {
                cleanup(&intermediates).await;
                return Err(StageError::Cancelled);
            }

            let is_last = index + 1 == total;
            let output = if is_last {
                final_output.clone()
            } else {
                final_output.with_extension(format!("step{}.mp4", index))
            };

            let result = self
                .apply_step(step, &current, annotations, &output, cancel)
                .await;
            if let Err(err) = result {
                cleanup(&intermediates).await;
                let _ = remove_artifact(&output).await;
                return Err(err);
            }

            tracing::debug!(step = step.name(), output = %output.display(), "transform step finished");
            if current != input {
                intermediates.push(current.clone());
            }
            current = output;
            let _ = progress.send(((index + 1) * 100 / total) as u8);
        }

        cleanup(&intermediates).await;
        Ok(ArtifactRef::new(final_output))
    }
}

async fn cleanup(paths: &[PathBuf]) {
    for path in paths {
        let _ = remove_artifact(path).await;
    }
}
