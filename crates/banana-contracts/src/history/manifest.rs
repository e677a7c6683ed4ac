use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{EntryId, GenerationResult, HistoryStore};
use crate::image::{Image, ImageHandle, Mask};
use crate::request::{build, GenerationMode};
use crate::resolution::ResolutionTier;

pub const SESSION_FILE: &str = "session.json";
pub const IMAGES_DIR: &str = "images";
pub const SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version_id: String,
    pub parent_version_id: Option<String>,
    pub mode: GenerationMode,
    pub prompt: String,
    pub prompt_diff: Option<Vec<String>>,
    pub target_resolution: ResolutionTier,
    pub target: [u32; 2],
    pub created_at: DateTime<Utc>,
    pub image: String,
    pub base_image: String,
    pub mask: Option<String>,
    pub reference_image: Option<String>,
}

/// The session working file: `session.json` plus one PNG per distinct image
/// under `images/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub schema_version: u64,
    pub session_id: String,
    pub saved_at: String,
    pub current_version_id: Option<String>,
    pub versions: Vec<VersionRecord>,
}

impl SessionManifest {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(SESSION_FILE)
    }

    pub fn exists_in(dir: &Path) -> bool {
        Self::path_in(dir).is_file()
    }

    /// Writes the whole store into `dir`. Images already on disk (same
    /// content handle) are not rewritten.
    pub fn save(store: &HistoryStore, dir: &Path) -> Result<Self> {
        let images_dir = dir.join(IMAGES_DIR);
        std::fs::create_dir_all(&images_dir)
            .with_context(|| format!("failed to create {}", images_dir.display()))?;

        let mut versions = Vec::with_capacity(store.len());
        for entry in store.iter() {
            let request = entry.result().request();
            let image = write_image(&images_dir, entry.image())?;
            let base_image = write_image(&images_dir, request.base_image())?;
            let mask = request
                .mask()
                .map(|mask| write_mask(&images_dir, mask))
                .transpose()?;
            let reference_image = request
                .reference_image()
                .map(|reference| write_image(&images_dir, reference))
                .transpose()?;
            let (width, height) = request.target();
            versions.push(VersionRecord {
                version_id: entry.id().version_label(),
                parent_version_id: entry.parent().map(EntryId::version_label),
                mode: request.mode(),
                prompt: request.prompt().to_string(),
                prompt_diff: entry.prompt_diff().map(<[String]>::to_vec),
                target_resolution: request.target_resolution(),
                target: [width, height],
                created_at: entry.result().created_at(),
                image,
                base_image,
                mask,
                reference_image,
            });
        }

        let manifest = Self {
            schema_version: SCHEMA_VERSION,
            session_id: store.store_id().to_string(),
            saved_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            current_version_id: store.current_id().map(EntryId::version_label),
            versions,
        };
        write_json(&Self::path_in(dir), &manifest)?;
        Ok(manifest)
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let path = Self::path_in(dir);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        let manifest: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid session file {}", path.display()))?;
        if manifest.schema_version != SCHEMA_VERSION {
            bail!(
                "unsupported session schema {} in {}",
                manifest.schema_version,
                path.display()
            );
        }
        Ok(manifest)
    }

    /// Rebuilds a store from `dir`. Every request is re-validated, so a
    /// hand-edited file cannot smuggle in an invalid request.
    pub fn load(dir: &Path) -> Result<(Self, HistoryStore)> {
        let manifest = Self::read(dir)?;
        let images_dir = dir.join(IMAGES_DIR);
        let store_id = Uuid::parse_str(&manifest.session_id).with_context(|| {
            format!(
                "invalid session id '{}' in {}",
                manifest.session_id,
                Self::path_in(dir).display()
            )
        })?;
        let mut store = HistoryStore::with_id(store_id);
        let mut ids: HashMap<&str, EntryId> = HashMap::new();

        for record in &manifest.versions {
            let base_image = Image::load(images_dir.join(&record.base_image))?;
            let image = Image::load(images_dir.join(&record.image))?;
            let mask = match record.mask.as_deref() {
                Some(file) => Some(Mask::from_gray(
                    Image::load(images_dir.join(file))?.as_dynamic().to_luma8(),
                )),
                None => None,
            };
            let reference_image = match record.reference_image.as_deref() {
                Some(file) => Some(Image::load(images_dir.join(file))?),
                None => None,
            };
            let request = build(
                record.mode,
                Some(base_image),
                mask,
                reference_image,
                &record.prompt,
                record.target_resolution,
            )
            .with_context(|| format!("version {} has an invalid request", record.version_id))?;

            let parent = match record.parent_version_id.as_deref() {
                Some(parent_id) => match ids.get(parent_id) {
                    Some(id) => Some(*id),
                    None => bail!(
                        "version {} refers to unknown parent {parent_id}",
                        record.version_id
                    ),
                },
                None => None,
            };
            let result = GenerationResult::with_created_at(image, request, record.created_at);
            let id = store.append(result, parent)?;
            ids.insert(record.version_id.as_str(), id);
        }

        if let Some(current) = manifest.current_version_id.as_deref() {
            if let Some(id) = ids.get(current) {
                store.restore(*id)?;
            }
        }
        Ok((manifest, store))
    }
}

fn write_image(dir: &Path, image: &Image) -> Result<String> {
    write_png_once(dir, image.handle(), "img", || image.encode_png())
}

fn write_mask(dir: &Path, mask: &Mask) -> Result<String> {
    write_png_once(dir, mask.handle(), "mask", || mask.encode_png())
}

fn write_png_once(
    dir: &Path,
    handle: &ImageHandle,
    prefix: &str,
    encode: impl FnOnce() -> Result<Vec<u8>>,
) -> Result<String> {
    let file_name = format!("{prefix}-{handle}.png");
    let path = dir.join(&file_name);
    if !path.exists() {
        std::fs::write(&path, encode()?)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(file_name)
}

fn write_json(path: &Path, payload: &SessionManifest) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
