//! Stage execution collaborators and the default child-process runner.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::artifacts::{PREDICTIONS_FILE, RESULTS_FILE};
use crate::error::ExecutionError;
use crate::graph::{Stage, TaskKey};
use crate::registry::ComponentRef;

/// Outputs of a model or ensemble consumed as stage input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamArtifact {
    pub component: String,
    pub artifact_dir: PathBuf,
    pub metrics: BTreeMap<String, f64>,
    pub predictions: serde_json::Value,
}

/// Everything a stage needs to run.
#[derive(Debug, Clone)]
pub struct StageInputs {
    pub key: TaskKey,
    pub stage: Stage,
    pub pipeline_root: PathBuf,
    pub interpreter: ComponentRef,
    pub component: ComponentRef,
    pub dataset_dir: PathBuf,
    /// Scratch directory that receives `results.json` and `predictions.json`.
    pub output_dir: PathBuf,
    /// Where the stage keeps trained state.
    pub state_dir: PathBuf,
    /// Trained state from this component's train stage, for test stages.
    pub trained_state_dir: Option<PathBuf>,
    /// Model outputs an ensemble consumes, in registry order.
    pub upstream: Vec<UpstreamArtifact>,
}

/// Metrics and predictions produced by one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub metrics: BTreeMap<String, f64>,
    pub predictions: serde_json::Value,
}

/// Trains and evaluates components.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn train(&self, inputs: &StageInputs) -> Result<StageOutput, ExecutionError>;

    async fn evaluate(&self, inputs: &StageInputs) -> Result<StageOutput, ExecutionError>;
}

/// Inputs for rendering one visualizer over a task's outputs.
#[derive(Debug, Clone)]
pub struct VisualContext {
    pub key: TaskKey,
    pub pipeline_root: PathBuf,
    pub visualizer: ComponentRef,
    pub dataset_dir: PathBuf,
    pub artifact_dir: PathBuf,
    /// Directory the visualizer writes into.
    pub output_dir: PathBuf,
}

/// Renders visual artifacts from a task's predictions.
#[async_trait]
pub trait Visualizer: Send + Sync {
    /// Returns the directory holding the rendered artifacts.
    async fn render(&self, ctx: &VisualContext) -> Result<PathBuf, ExecutionError>;
}

/// Runs each component's manifest command as a child process.
///
/// The child gets the pipeline root as working directory and its inputs as
/// `MLOPS_*` environment variables. It is killed if the run is dropped,
/// which is how cancellation and timeouts reach it.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner;

impl CommandRunner {
    pub fn new() -> Self {
        Self
    }

    async fn run_command(
        &self,
        component: &ComponentRef,
        cwd: &Path,
        envs: Vec<(&'static str, String)>,
    ) -> Result<(), ExecutionError> {
        let Some((program, args)) = component.command.split_first() else {
            return Err(ExecutionError::NoCommand(component.name.clone()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &envs {
            cmd.env(key, value);
        }

        tracing::debug!(
            component = %component.name,
            command = %component.command.join(" "),
            "Spawning stage command"
        );

        let output = cmd.output().await.map_err(|source| ExecutionError::Spawn {
            command: component.command.join(" "),
            source,
        })?;

        if !output.status.success() {
            return Err(ExecutionError::NonZeroExit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    async fn run_stage(&self, inputs: &StageInputs) -> Result<StageOutput, ExecutionError> {
        tokio::fs::create_dir_all(&inputs.output_dir).await?;
        tokio::fs::create_dir_all(&inputs.state_dir).await?;

        let upstream: BTreeMap<&str, &Path> = inputs
            .upstream
            .iter()
            .map(|u| (u.component.as_str(), u.artifact_dir.as_path()))
            .collect();

        let mut envs = vec![
            ("MLOPS_STAGE", inputs.stage.to_string()),
            ("MLOPS_PIPELINE", inputs.key.pipeline.clone()),
            ("MLOPS_INTERPRETER", inputs.interpreter.name.clone()),
            ("MLOPS_DATASET_DIR", path_string(&inputs.dataset_dir)),
            ("MLOPS_COMPONENT", inputs.component.name.clone()),
            ("MLOPS_OUTPUT_DIR", path_string(&inputs.output_dir)),
            ("MLOPS_STATE_DIR", path_string(&inputs.state_dir)),
            (
                "MLOPS_UPSTREAM",
                serde_json::to_string(&upstream).unwrap_or_else(|_| "{}".to_string()),
            ),
        ];
        if !inputs.interpreter.command.is_empty() {
            envs.push((
                "MLOPS_INTERPRETER_COMMAND",
                serde_json::to_string(&inputs.interpreter.command)
                    .unwrap_or_else(|_| "[]".to_string()),
            ));
        }
        if let Some(trained) = &inputs.trained_state_dir {
            envs.push(("MLOPS_TRAINED_STATE_DIR", path_string(trained)));
        }

        self.run_command(&inputs.component, &inputs.pipeline_root, envs)
            .await?;
        read_stage_output(&inputs.output_dir).await
    }
}

#[async_trait]
impl StageRunner for CommandRunner {
    async fn train(&self, inputs: &StageInputs) -> Result<StageOutput, ExecutionError> {
        self.run_stage(inputs).await
    }

    async fn evaluate(&self, inputs: &StageInputs) -> Result<StageOutput, ExecutionError> {
        self.run_stage(inputs).await
    }
}

#[async_trait]
impl Visualizer for CommandRunner {
    async fn render(&self, ctx: &VisualContext) -> Result<PathBuf, ExecutionError> {
        tokio::fs::create_dir_all(&ctx.output_dir).await?;
        let envs = vec![
            ("MLOPS_STAGE", ctx.key.stage.to_string()),
            ("MLOPS_PIPELINE", ctx.key.pipeline.clone()),
            ("MLOPS_INTERPRETER", ctx.key.interpreter.clone()),
            ("MLOPS_DATASET_DIR", path_string(&ctx.dataset_dir)),
            ("MLOPS_COMPONENT", ctx.key.component.clone()),
            ("MLOPS_VISUALIZER", ctx.visualizer.name.clone()),
            ("MLOPS_ARTIFACT_DIR", path_string(&ctx.artifact_dir)),
            ("MLOPS_OUTPUT_DIR", path_string(&ctx.output_dir)),
        ];
        self.run_command(&ctx.visualizer, &ctx.pipeline_root, envs)
            .await?;
        Ok(ctx.output_dir.clone())
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Reads `results.json` and `predictions.json` written by a stage.
pub async fn read_stage_output(dir: &Path) -> Result<StageOutput, ExecutionError> {
    let results_path = dir.join(RESULTS_FILE);
    let predictions_path = dir.join(PREDICTIONS_FILE);

    let metrics = read_output_file(&results_path).await?;
    let predictions = read_output_file(&predictions_path).await?;
    Ok(StageOutput {
        metrics,
        predictions,
    })
}

async fn read_output_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ExecutionError> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ExecutionError::MissingOutput(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&data).map_err(|e| ExecutionError::MalformedOutput {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ComponentKind;

    fn component(kind: ComponentKind, name: &str, command: &[&str]) -> ComponentRef {
        ComponentRef {
            pipeline: "obj_det".to_string(),
            kind,
            name: name.to_string(),
            sources: vec![PathBuf::from(format!("{}.py", name))],
            command: command.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn inputs(root: &Path, command: &[&str]) -> StageInputs {
        StageInputs {
            key: TaskKey::new("obj_det", "voc", "2012", "yolo", Stage::Train),
            stage: Stage::Train,
            pipeline_root: root.to_path_buf(),
            interpreter: component(ComponentKind::Interpreter, "voc", &[]),
            component: component(ComponentKind::Model, "yolo", command),
            dataset_dir: root.join("data"),
            output_dir: root.join("out"),
            state_dir: root.join("state"),
            trained_state_dir: None,
            upstream: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_missing_command() {
        let dir = tempfile::tempdir().unwrap();
        let err = CommandRunner::new()
            .train(&inputs(dir.path(), &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::NoCommand(name) if name == "yolo"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_outputs_are_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"echo "{\"mAP\": 0.5, \"stage_$MLOPS_STAGE\": 1}" > "$MLOPS_OUTPUT_DIR/results.json"; echo '["box"]' > "$MLOPS_OUTPUT_DIR/predictions.json""#;
        let output = CommandRunner::new()
            .train(&inputs(dir.path(), &["sh", "-c", script]))
            .await
            .unwrap();

        assert_eq!(output.metrics.get("mAP"), Some(&0.5));
        assert_eq!(output.metrics.get("stage_train"), Some(&1.0));
        assert_eq!(output.predictions, serde_json::json!(["box"]));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_keeps_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let err = CommandRunner::new()
            .evaluate(&inputs(dir.path(), &["sh", "-c", "echo 'Traceback: boom' >&2; exit 3"]))
            .await
            .unwrap_err();
        match err {
            ExecutionError::NonZeroExit { code, stderr } => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("Traceback: boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_results_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CommandRunner::new()
            .train(&inputs(dir.path(), &["sh", "-c", "true"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::MissingOutput(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_visualizer_renders_into_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = VisualContext {
            key: TaskKey::new("obj_det", "voc", "2012", "yolo", Stage::Test),
            pipeline_root: dir.path().to_path_buf(),
            visualizer: component(
                ComponentKind::Visualizer,
                "boxes",
                &["sh", "-c", "echo plot > \"$MLOPS_OUTPUT_DIR/boxes.txt\""],
            ),
            dataset_dir: dir.path().join("data"),
            artifact_dir: dir.path().join("artifact"),
            output_dir: dir.path().join("viz"),
        };

        let rendered = CommandRunner::new().render(&ctx).await.unwrap();
        assert_eq!(rendered, dir.path().join("viz"));
        assert!(rendered.join("boxes.txt").exists());
    }
}
