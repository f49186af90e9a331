//! facegate-models: model manifest and integrity verification.
//!
//! Every ONNX file the pipeline loads is listed here. Files with a published
//! SHA-256 digest are checked before any session is created; files without
//! one are only required to exist.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Role a model plays in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Detector,
    Recognizer,
    AntiSpoof,
    FaceMesh,
}

/// Model file descriptor.
pub struct ModelFile {
    pub name: &'static str,
    pub role: ModelRole,
    /// Crop scale around the detected face box (anti-spoof ensemble members only).
    pub crop_scale: Option<f32>,
    pub sha256: Option<&'static str>,
}

pub const DETECTOR_MODEL: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL: &str = "w600k_r50.onnx";
pub const ANTISPOOF_V2_MODEL: &str = "2.7_80x80_MiniFASNetV2.onnx";
pub const ANTISPOOF_V1SE_MODEL: &str = "4_0_0_80x80_MiniFASNetV1SE.onnx";
pub const FACE_MESH_MODEL: &str = "face_mesh.onnx";

// buffalo_l digests taken from the HuggingFace Git LFS pointer files.
pub const MODELS: &[ModelFile] = &[
    ModelFile {
        name: DETECTOR_MODEL,
        role: ModelRole::Detector,
        crop_scale: None,
        sha256: Some("5838f7fe053675b1c7a08b633df49e7af5495cee0493c7dcf6697200b85b5b91"),
    },
    ModelFile {
        name: RECOGNIZER_MODEL,
        role: ModelRole::Recognizer,
        crop_scale: None,
        sha256: Some("4c06341c33c2ca1f86781dab0e829f88ad5b64be9fba56e56bc9ebdefc619e43"),
    },
    ModelFile {
        name: ANTISPOOF_V2_MODEL,
        role: ModelRole::AntiSpoof,
        crop_scale: Some(2.7),
        sha256: None,
    },
    ModelFile {
        name: ANTISPOOF_V1SE_MODEL,
        role: ModelRole::AntiSpoof,
        crop_scale: Some(4.0),
        sha256: None,
    },
    ModelFile {
        name: FACE_MESH_MODEL,
        role: ModelRole::FaceMesh,
        crop_scale: None,
        sha256: None,
    },
];

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path})")]
    MissingModel { name: &'static str, path: PathBuf },

    #[error("failed to open model file: {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read model file: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}"
    )]
    ChecksumMismatch {
        name: &'static str,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

/// Default model directory: `$XDG_DATA_HOME/facegate/models`.
pub fn default_model_dir() -> PathBuf {
    let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.local/share")
    });
    PathBuf::from(data_home).join("facegate/models")
}

/// Models of one role, in manifest order.
pub fn models_with_role(role: ModelRole) -> impl Iterator<Item = &'static ModelFile> {
    MODELS.iter().filter(move |m| m.role == role)
}

/// Compute SHA-256 hex digest of a file.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let mut file = fs::File::open(path).map_err(|source| ModelIntegrityError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|source| ModelIntegrityError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Check that a model file exists and, when a digest is known, that it matches.
pub fn verify_model_file(model: &ModelFile, path: &Path) -> Result<(), ModelIntegrityError> {
    if !path.exists() {
        return Err(ModelIntegrityError::MissingModel {
            name: model.name,
            path: path.to_path_buf(),
        });
    }

    let Some(expected) = model.sha256 else {
        tracing::debug!(model = model.name, "no published checksum; presence check only");
        return Ok(());
    };

    let digest = sha256_file_hex(path)?;
    if digest != expected {
        return Err(ModelIntegrityError::ChecksumMismatch {
            name: model.name,
            path: path.to_path_buf(),
            expected: expected.to_string(),
            got: digest,
        });
    }

    Ok(())
}

/// Verify every manifest entry under `model_dir`.
pub fn verify_models_dir(model_dir: &Path) -> Result<(), ModelIntegrityError> {
    for model in MODELS {
        verify_model_file(model, &model_dir.join(model.name))?;
    }
    tracing::info!(dir = %model_dir.display(), count = MODELS.len(), "model files verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sha256: Option<&'static str>) -> ModelFile {
        ModelFile {
            name: "model.onnx",
            role: ModelRole::Detector,
            crop_scale: None,
            sha256,
        }
    }

    #[test]
    fn verify_rejects_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = verify_model_file(&entry(Some("00")), &dir.path().join("nope.onnx")).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::MissingModel { .. }));
    }

    #[test]
    fn verify_rejects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        fs::write(&path, b"hello").unwrap();

        let err = verify_model_file(&entry(Some("00")), &path).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::ChecksumMismatch { .. }));
    }

    #[test]
    fn verify_accepts_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        fs::write(&path, b"hello").unwrap();

        // sha256("hello")
        let model = entry(Some(
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
        ));
        verify_model_file(&model, &path).unwrap();
    }

    #[test]
    fn verify_without_digest_only_checks_presence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        fs::write(&path, b"anything").unwrap();
        verify_model_file(&entry(None), &path).unwrap();
    }

    #[test]
    fn verify_models_dir_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = verify_models_dir(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            ModelIntegrityError::MissingModel { name: DETECTOR_MODEL, .. }
        ));
    }

    #[test]
    fn antispoof_ensemble_has_crop_scales() {
        let scales: Vec<f32> = models_with_role(ModelRole::AntiSpoof)
            .filter_map(|m| m.crop_scale)
            .collect();
        assert_eq!(scales, vec![2.7, 4.0]);
    }
}
