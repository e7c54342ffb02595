//! Reference image gallery.
//!
//! One grayscale crop per identity, stored as `<name>.png` in a directory. The
//! directory is the source of truth; [`Gallery`] is the in-memory snapshot a
//! tracking session works against.

use crate::types::BoundingBox;
use image::{GrayImage, ImageFormat};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

const STORED_EXTENSION: &str = "png";
const LOADABLE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("no face captured: bounding box has no area inside the frame")]
    EmptyCapture,
    #[error("invalid identity name {0:?}")]
    InvalidName(String),
    #[error("failed to create gallery directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write reference image {path}: {source}")]
    StoreWrite {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Snapshot of identity name → reference image, iterated in name order.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: BTreeMap<String, GrayImage>,
}

impl Gallery {
    pub fn from_entries<N: Into<String>>(entries: impl IntoIterator<Item = (N, GrayImage)>) -> Self {
        Self {
            entries: entries.into_iter().map(|(n, img)| (n.into(), img)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&GrayImage> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &GrayImage)> {
        self.entries.iter().map(|(n, img)| (n.as_str(), img))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Directory-backed store of reference images.
#[derive(Debug, Clone)]
pub struct FaceGallery {
    dir: PathBuf,
}

impl FaceGallery {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Crop `image` to `bbox` and store it as the reference for `name`,
    /// replacing any previous reference.
    pub fn register(&self, name: &str, image: &GrayImage, bbox: &BoundingBox) -> Result<PathBuf, GalleryError> {
        let name = validate_name(name)?;
        let crop = bbox.crop(image).ok_or(GalleryError::EmptyCapture)?;

        std::fs::create_dir_all(&self.dir).map_err(|source| GalleryError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.dir.join(format!("{name}.{STORED_EXTENSION}"));
        crop.save_with_format(&path, ImageFormat::Png)
            .map_err(|source| GalleryError::StoreWrite {
                path: path.clone(),
                source,
            })?;

        // A stale file in another format would shadow or duplicate this entry on load.
        for ext in LOADABLE_EXTENSIONS.iter().filter(|e| **e != STORED_EXTENSION) {
            let stale = self.dir.join(format!("{name}.{ext}"));
            match std::fs::remove_file(&stale) {
                Ok(()) => tracing::debug!(path = %stale.display(), "removed superseded reference"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %stale.display(), error = %e, "could not remove superseded reference"),
            }
        }

        tracing::info!(
            name,
            path = %path.display(),
            width = crop.width(),
            height = crop.height(),
            "reference image stored"
        );
        Ok(path)
    }

    /// Read every decodable reference image in the directory.
    ///
    /// A missing directory is an empty gallery. Files that fail to decode are
    /// logged and left out.
    pub fn load(&self) -> Gallery {
        let mut gallery = Gallery::default();
        for (name, path) in self.reference_files() {
            match image::open(&path) {
                Ok(img) => {
                    if gallery.entries.insert(name.clone(), img.into_luma8()).is_some() {
                        tracing::warn!(name, path = %path.display(), "duplicate reference, keeping the later file");
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping undecodable reference image");
                }
            }
        }

        tracing::debug!(dir = %self.dir.display(), count = gallery.len(), "gallery loaded");
        gallery
    }

    /// Number of identities with a reference file, without decoding any image.
    pub fn count(&self) -> usize {
        self.reference_files()
            .into_iter()
            .map(|(name, _)| name)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// `(name, path)` for every file with a loadable extension, sorted by path.
    fn reference_files(&self) -> Vec<(String, PathBuf)> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(dir = %self.dir.display(), error = %e, "cannot read gallery directory");
                }
                return Vec::new();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && has_loadable_extension(path))
            .collect();
        paths.sort();

        paths
            .into_iter()
            .filter_map(|path| {
                let name = path.file_stem()?.to_str()?.to_string();
                Some((name, path))
            })
            .collect()
    }
}

fn has_loadable_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| LOADABLE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Names become file stems, so they must be usable as one.
pub fn validate_name(name: &str) -> Result<&str, GalleryError> {
    let trimmed = name.trim();
    let invalid = trimmed.is_empty()
        || trimmed.starts_with('.')
        || trimmed.contains(['/', '\\', '\0']);
    if invalid {
        return Err(GalleryError::InvalidName(name.to_string()));
    }
    Ok(trimmed)
}
