//! Declarative transform plans.
//!
//! Each processing mode maps to an ordered sequence of transform steps. The
//! transform stage walks the plan; nothing else branches on the mode.

use crate::core::task::ProcessingMode;

/// One step of the transform stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransformStep {
    /// Copy the source into the output container unchanged.
    Remux,
    /// Burn the sidecar annotation track into the video. Falls back to a
    /// plain copy when no annotation track exists.
    EmbedAnnotations,
    /// Slow playback to the given factor (e.g. 0.75).
    AdjustSpeed { factor: f64 },
    /// Emit the media twice: first pass plain, second pass annotated.
    RepeatWithAnnotations,
}

impl TransformStep {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            TransformStep::Remux => "remux",
            TransformStep::EmbedAnnotations => "embed-annotations",
            TransformStep::AdjustSpeed { .. } => "adjust-speed",
            TransformStep::RepeatWithAnnotations => "repeat-with-annotations",
        }
    }
}

/// The transform sub-sequence for a processing mode.
pub fn transform_plan(mode: ProcessingMode) -> Vec<TransformStep> {
    match mode {
        ProcessingMode::Plain => vec![TransformStep::Remux],
        ProcessingMode::Annotated => vec![TransformStep::EmbedAnnotations],
        ProcessingMode::Repeated => vec![TransformStep::RepeatWithAnnotations],
        ProcessingMode::ReducedSpeed => vec![
            TransformStep::AdjustSpeed { factor: 0.75 },
            TransformStep::EmbedAnnotations,
        ],
    }
}
