use std::path::Path;
use std::process::Command;

use log::{info, warn};
use serde::Deserialize;

use super::{Detection, Detector, DetectorError, ExportError, Exporter, ModelHandle, TrainConfig};
use crate::annotation::BBox;
use crate::dataset::DatasetDescriptor;

/// Detector adapter that shells out to user-supplied train/infer commands.
///
/// Placeholders in the command line are substituted before execution:
/// `{dataset}` (descriptor file), `{model}` (model directory) and `{image}`
/// (image path). Inference commands print detections to stdout as a JSON
/// array of `{class_name, bbox, score}` elements.
pub struct CommandDetector {
    train: Option<Vec<String>>,
    infer: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    class_name: String,
    bbox: [f32; 4],
    score: f32,
}

impl CommandDetector {
    pub fn new(train_cmd: Option<&str>, infer_cmd: Option<&str>) -> Self {
        Self { train: train_cmd.map(split_argv), infer: infer_cmd.map(split_argv) }
    }
}

impl Detector for CommandDetector {
    fn train(
        &self,
        _dataset: &DatasetDescriptor,
        config: &TrainConfig,
    ) -> Result<ModelHandle, DetectorError> {
        let argv = self.train.as_ref().ok_or(DetectorError::NotConfigured("train command"))?;
        std::fs::create_dir_all(&config.output_dir)
            .map_err(|e| DetectorError::Train(e.to_string()))?;

        let argv = render(
            argv,
            &[
                ("dataset", &config.dataset_file.to_string_lossy()),
                ("model", &config.output_dir.to_string_lossy()),
            ],
        );
        let Some((program, args)) = argv.split_first() else {
            return Err(DetectorError::Train("empty train command".to_string()));
        };
        info!("training: {}", argv.join(" "));
        let status = Command::new(program)
            .args(args)
            .status()
            .map_err(|e| DetectorError::Train(e.to_string()))?;
        if !status.success() {
            return Err(DetectorError::Train(format!("trainer exited with {status}")));
        }
        Ok(ModelHandle { path: config.output_dir.clone() })
    }

    fn infer(&self, model: &ModelHandle, image: &Path) -> Result<Vec<Detection>, DetectorError> {
        let argv = self.infer.as_ref().ok_or(DetectorError::NotConfigured("infer command"))?;
        let argv = render(
            argv,
            &[("model", &model.path.to_string_lossy()), ("image", &image.to_string_lossy())],
        );
        let Some((program, args)) = argv.split_first() else {
            return Err(DetectorError::Infer("empty infer command".to_string()));
        };
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| DetectorError::Infer(e.to_string()))?;
        if !output.status.success() {
            return Err(DetectorError::Infer(format!("detector exited with {}", output.status)));
        }

        let wire: Vec<WireDetection> = serde_json::from_slice(&output.stdout)
            .map_err(|e| DetectorError::Infer(format!("malformed detector output: {e}")))?;
        let mut detections = Vec::with_capacity(wire.len());
        for w in wire {
            match BBox::try_from(w.bbox) {
                Ok(bbox) => {
                    detections.push(Detection { class_name: w.class_name, bbox, score: w.score })
                }
                Err(e) => warn!("skipping detection on {}: {e}", image.display()),
            }
        }
        Ok(detections)
    }
}

/// Export adapter shelling out to a conversion command; `{model}` and
/// `{output}` are substituted.
pub struct CommandExporter {
    cmd: Option<Vec<String>>,
}

impl CommandExporter {
    pub fn new(export_cmd: Option<&str>) -> Self {
        Self { cmd: export_cmd.map(split_argv) }
    }
}

impl Exporter for CommandExporter {
    fn export(&self, model: &ModelHandle, dest: &Path) -> Result<std::path::PathBuf, ExportError> {
        let argv = self.cmd.as_ref().ok_or(ExportError::NotConfigured)?;
        std::fs::create_dir_all(dest).map_err(|e| ExportError::Failed(e.to_string()))?;

        let argv = render(
            argv,
            &[("model", &model.path.to_string_lossy()), ("output", &dest.to_string_lossy())],
        );
        let Some((program, args)) = argv.split_first() else {
            return Err(ExportError::Failed("empty export command".to_string()));
        };
        info!("exporting: {}", argv.join(" "));
        let status = Command::new(program)
            .args(args)
            .status()
            .map_err(|e| ExportError::Failed(e.to_string()))?;
        if !status.success() {
            return Err(ExportError::Failed(format!("exporter exited with {status}")));
        }
        Ok(dest.to_path_buf())
    }
}

fn split_argv(cmd: &str) -> Vec<String> {
    cmd.split_whitespace().map(str::to_string).collect()
}

fn render(argv: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    argv.iter()
        .map(|arg| {
            let mut arg = arg.clone();
            for (name, value) in vars {
                arg = arg.replace(&format!("{{{name}}}"), value);
            }
            arg
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_substituted() {
        let argv = split_argv("train.sh --data {dataset} --out {model}");
        let rendered = render(&argv, &[("dataset", "/d/ds.json"), ("model", "/d/model")]);
        assert_eq!(rendered, ["train.sh", "--data", "/d/ds.json", "--out", "/d/model"]);
    }

    #[test]
    fn unconfigured_commands_error() {
        let detector = CommandDetector::new(None, None);
        let model = ModelHandle { path: "/tmp/model".into() };
        assert!(matches!(
            detector.infer(&model, Path::new("/tmp/x.jpg")),
            Err(DetectorError::NotConfigured(_))
        ));
    }
}
