//! Resource detection for uploaded images.
//!
//! Generation tools embed a `hashes` object (resource name -> file hash) in
//! the image metadata. Hashes that match a known model file resolve to that
//! file's model version; anything else is kept as a free-text name.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::models::{Id, ImageGenerationProcess, ResourceRef};
use crate::repo::{ImageRepo, RepoResult};

/// Model file categories whose hashes identify a resource.
pub const DETECTABLE_FILE_TYPES: [&str; 3] = ["Model", "Pruned Model", "Negative"];

/// Known file hash paired with the model version that owns the file.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ModelFileHash {
    pub hash: String,
    pub model_version_id: Id,
}

/// Reads `meta.hashes`, skipping entries whose value is not a string.
pub fn extract_hashes(meta: Option<&Value>) -> BTreeMap<String, String> {
    meta.and_then(|m| m.get("hashes"))
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(name, hash)| hash.as_str().map(|h| (name.clone(), h.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// `known` is keyed by lowercase hash.
pub fn resolve_resources(
    hashes: &BTreeMap<String, String>,
    known: &HashMap<String, Id>,
    explicit_model_version: Option<Id>,
) -> Vec<ResourceRef> {
    let detected = hashes.iter().map(|(name, hash)| match known.get(&hash.to_lowercase()) {
        Some(version) => ResourceRef::ModelVersion(*version),
        None => ResourceRef::Named(name.clone()),
    });
    let mut out: Vec<ResourceRef> = Vec::new();
    for r in explicit_model_version.map(ResourceRef::ModelVersion).into_iter().chain(detected) {
        if !out.contains(&r) {
            out.push(r);
        }
    }
    out
}

pub async fn detect_image_resources<R: ImageRepo + ?Sized>(
    repo: &R,
    meta: Option<&Value>,
    explicit_model_version: Option<Id>,
) -> RepoResult<Vec<ResourceRef>> {
    let hashes = extract_hashes(meta);
    let known = if hashes.is_empty() {
        HashMap::new()
    } else {
        let wanted: Vec<String> = hashes.values().map(|h| h.to_lowercase()).collect();
        repo.find_model_file_hashes(&wanted)
            .await?
            .into_iter()
            .map(|m| (m.hash.to_lowercase(), m.model_version_id))
            .collect()
    };
    let resources = resolve_resources(&hashes, &known, explicit_model_version);
    tracing::debug!(hashes = hashes.len(), resolved = known.len(), resources = resources.len(), "detected image resources");
    Ok(resources)
}

/// Classifies how an image was produced from its generation parameters.
pub fn generation_process(meta: Option<&Value>) -> Option<ImageGenerationProcess> {
    let meta = meta?.as_object()?;
    let has = |key: &str| meta.get(key).map(|v| !v.is_null()).unwrap_or(false);
    let denoised = has("Denoising strength") || has("Denoise strength");
    let hires = has("First pass strength") || has("Hires upscale") || has("Hires upscaler");
    let process = if has("Mask blur") {
        ImageGenerationProcess::Inpainting
    } else if denoised && !hires {
        ImageGenerationProcess::Img2img
    } else if denoised && hires {
        ImageGenerationProcess::Txt2imgHiRes
    } else {
        ImageGenerationProcess::Txt2img
    };
    Some(process)
}
