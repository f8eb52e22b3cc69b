//! Reference images for the template locator.
//!
//! On disk the store is a directory of workflow phases, each holding image
//! files named after template ids:
//!
//! ```text
//! templates/
//!   import/
//!     import_button.png
//!     import_button.1.png
//!   export/
//!     import_button.png
//! ```
//!
//! Every file whose stem (up to the first `.`) matches an id is a variant of
//! that template. Variants keep phase order, then `<id>` before `<id>.1`, `<id>.2`, ...
//!
//! Readers get immutable snapshots; appends clone the index, insert, and swap
//! it in under a writer lock, so lookups never observe a half-built template.

use crate::descriptor::BoundingBox;
use crate::errors::TemplateStoreError;
use crate::screenshot::Screenshot;
use image::GrayImage;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];
/// Suffixes probed when a template fails to match.
pub const ALTERNATE_SUFFIXES: &[&str] = &["_alt", "_alt2", "_old"];

#[derive(Debug)]
pub struct TemplateVariant {
    pub file_name: String,
    pub phase: String,
    pub source: PathBuf,
    image: GrayImage,
}

impl TemplateVariant {
    pub fn new(
        file_name: impl Into<String>,
        phase: impl Into<String>,
        source: PathBuf,
        image: GrayImage,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            phase: phase.into(),
            source,
            image,
        }
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }
}

/// A named template and its variants in match order. Never mutated in place.
#[derive(Debug, Clone)]
pub struct Template {
    id: String,
    variants: Vec<Arc<TemplateVariant>>,
}

impl Template {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn variants(&self) -> &[Arc<TemplateVariant>] {
        &self.variants
    }

    fn with_variant(&self, variant: Arc<TemplateVariant>) -> Self {
        let mut variants = self.variants.clone();
        variants.push(variant);
        Self {
            id: self.id.clone(),
            variants,
        }
    }
}

type TemplateIndex = HashMap<String, Arc<Template>>;

#[derive(Debug, Default)]
pub struct TemplateStore {
    root: Option<PathBuf>,
    index: RwLock<Arc<TemplateIndex>>,
    writer: Mutex<()>,
}

impl TemplateStore {
    /// An empty store with no backing directory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    #[instrument(skip(root), fields(root = %root.as_ref().display()))]
    pub fn load(root: impl AsRef<Path>) -> Result<Self, TemplateStoreError> {
        let root = root.as_ref().to_path_buf();
        let index = read_index(&root)?;
        info!(
            templates = index.len(),
            variants = index.values().map(|t| t.variants.len()).sum::<usize>(),
            "Loaded template store"
        );
        Ok(Self {
            root: Some(root),
            index: RwLock::new(Arc::new(index)),
            writer: Mutex::new(()),
        })
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Current immutable view of the index.
    pub fn snapshot(&self) -> Arc<TemplateIndex> {
        self.index
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Template>> {
        self.snapshot().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.snapshot().contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.snapshot().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Alternate template ids (`<id>_alt`, ...) that actually exist in the store.
    pub fn alternates_for(&self, id: &str) -> Vec<String> {
        let index = self.snapshot();
        ALTERNATE_SUFFIXES
            .iter()
            .map(|suffix| format!("{id}{suffix}"))
            .filter(|alt| index.contains_key(alt))
            .collect()
    }

    /// Appends a variant and returns the replacement template.
    pub fn append_variant(&self, id: &str, variant: TemplateVariant) -> Arc<Template> {
        let _guard = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.append_locked(id, Arc::new(variant))
    }

    fn append_locked(&self, id: &str, variant: Arc<TemplateVariant>) -> Arc<Template> {
        let mut next: TemplateIndex = (*self.snapshot()).clone();
        let template = match next.get(id) {
            Some(existing) => Arc::new(existing.with_variant(variant)),
            None => Arc::new(Template {
                id: id.to_string(),
                variants: vec![variant],
            }),
        };
        next.insert(id.to_string(), template.clone());
        *self
            .index
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(next);
        debug!(id, variants = template.variants.len(), "Appended template variant");
        template
    }

    /// Crops `region` out of `screenshot`, saves it under `<root>/<phase>/`, and appends it.
    #[instrument(skip(self, screenshot))]
    pub fn capture_variant(
        &self,
        id: &str,
        phase: &str,
        screenshot: &Screenshot,
        region: BoundingBox,
    ) -> Result<Arc<TemplateVariant>, TemplateStoreError> {
        validate_name(id)?;
        validate_name(phase)?;
        let root = self
            .root
            .as_ref()
            .ok_or(TemplateStoreError::NoBackingDirectory)?;
        if screenshot.clamp_region(region) != Some(region) {
            return Err(TemplateStoreError::RegionOutOfBounds(region.to_string()));
        }
        let (crop, _) = screenshot
            .gray_region(Some(region))
            .ok_or_else(|| TemplateStoreError::RegionOutOfBounds(region.to_string()))?;

        let _guard = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let phase_dir = root.join(phase);
        fs::create_dir_all(&phase_dir).map_err(|source| TemplateStoreError::Io {
            path: phase_dir.clone(),
            source,
        })?;
        let path = next_free_path(&phase_dir, id);
        crop.save_with_format(&path, image::ImageFormat::Png)
            .map_err(|source| TemplateStoreError::Image {
                path: path.clone(),
                source,
            })?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let variant = Arc::new(TemplateVariant::new(file_name, phase, path.clone(), crop));
        self.append_locked(id, variant.clone());
        info!(id, phase, path = %path.display(), "Captured template variant");
        Ok(variant)
    }

    /// Re-reads the backing directory and swaps the whole index.
    pub fn reload(&self) -> Result<(), TemplateStoreError> {
        let root = self
            .root
            .as_ref()
            .ok_or(TemplateStoreError::NoBackingDirectory)?;
        let _guard = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let index = read_index(root)?;
        *self
            .index
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(index);
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), TemplateStoreError> {
    let valid = !name.is_empty()
        && !name.contains('.')
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(TemplateStoreError::InvalidId(name.to_string()))
    }
}

fn next_free_path(dir: &Path, id: &str) -> PathBuf {
    let first = dir.join(format!("{id}.png"));
    if !first.exists() {
        return first;
    }
    (1u32..)
        .map(|n| dir.join(format!("{id}.{n}.png")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

/// Template id of a file: its name up to the first `.`.
fn template_id_of(path: &Path) -> Option<String> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    if !IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        return None;
    }
    let name = path.file_name()?.to_str()?;
    let id = name.split('.').next()?;
    (!id.is_empty()).then(|| id.to_string())
}

/// `<id>.png` ranks first, then `<id>.<n>.png` by `n`, then anything else.
fn variant_rank(path: &Path) -> u32 {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let parts: Vec<&str> = name.split('.').collect();
    match parts.as_slice() {
        [_, _] => 0,
        [_, n, _] => n.parse::<u32>().map_or(u32::MAX, |n| n.saturating_add(1)),
        _ => u32::MAX,
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, TemplateStoreError> {
    let entries = fs::read_dir(dir).map_err(|source| TemplateStoreError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();
    Ok(paths)
}

fn read_index(root: &Path) -> Result<TemplateIndex, TemplateStoreError> {
    let mut grouped: Vec<(String, Vec<Arc<TemplateVariant>>)> = Vec::new();
    for phase_dir in sorted_entries(root)?.into_iter().filter(|p| p.is_dir()) {
        let phase = phase_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut files: Vec<(String, u32, PathBuf)> = sorted_entries(&phase_dir)?
            .into_iter()
            .filter_map(|path| {
                let id = template_id_of(&path)?;
                Some((id, variant_rank(&path), path))
            })
            .collect();
        files.sort();
        for (id, _, path) in files {
            let image = match image::open(&path) {
                Ok(img) => img.to_luma8(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable template image");
                    continue;
                }
            };
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let variant = Arc::new(TemplateVariant::new(file_name, &phase, path.clone(), image));
            match grouped.iter_mut().find(|(existing, _)| *existing == id) {
                Some((_, variants)) => variants.push(variant),
                None => grouped.push((id, vec![variant])),
            }
        }
    }
    Ok(grouped
        .into_iter()
        .map(|(id, variants)| (id.clone(), Arc::new(Template { id, variants })))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgba, RgbaImage};

    fn write_gray(path: &Path, shade: u8) {
        GrayImage::from_pixel(4, 4, Luma([shade])).save(path).unwrap();
    }

    #[test]
    fn groups_variants_by_base_name_in_phase_then_file_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a_import")).unwrap();
        fs::create_dir_all(dir.path().join("b_export")).unwrap();
        write_gray(&dir.path().join("a_import/import_button.png"), 10);
        write_gray(&dir.path().join("a_import/import_button.1.png"), 20);
        write_gray(&dir.path().join("b_export/import_button.png"), 30);
        write_gray(&dir.path().join("b_export/export_button.png"), 40);
        fs::write(dir.path().join("a_import/notes.txt"), "ignored").unwrap();

        let store = TemplateStore::load(dir.path()).unwrap();
        assert_eq!(store.ids(), vec!["export_button", "import_button"]);
        let template = store.get("import_button").unwrap();
        let order: Vec<(&str, &str)> = template
            .variants()
            .iter()
            .map(|v| (v.phase.as_str(), v.file_name.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a_import", "import_button.png"),
                ("a_import", "import_button.1.png"),
                ("b_export", "import_button.png"),
            ]
        );
    }

    #[test]
    fn append_replaces_template_without_touching_old_snapshots() {
        let store = TemplateStore::in_memory();
        let before = store.snapshot();
        let variant = TemplateVariant::new("ok.png", "main", PathBuf::from("ok.png"), GrayImage::new(2, 2));
        store.append_variant("ok", variant);
        assert!(before.get("ok").is_none());
        let second = TemplateVariant::new("ok.1.png", "main", PathBuf::from("ok.1.png"), GrayImage::new(2, 2));
        let held = store.get("ok").unwrap();
        store.append_variant("ok", second);
        assert_eq!(held.variants().len(), 1);
        assert_eq!(store.get("ok").unwrap().variants().len(), 2);
    }

    #[test]
    fn capture_variant_persists_with_next_free_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::load(dir.path()).unwrap();
        let screen = Screenshot::new(RgbaImage::from_pixel(50, 40, Rgba([200, 10, 10, 255])));
        let region = BoundingBox::new(5, 5, 10, 8);

        let first = store.capture_variant("save", "main", &screen, region).unwrap();
        let second = store.capture_variant("save", "main", &screen, region).unwrap();
        assert_eq!(first.file_name, "save.png");
        assert_eq!(second.file_name, "save.1.png");
        assert_eq!(first.image().dimensions(), (10, 8));
        assert!(dir.path().join("main/save.1.png").exists());

        let reloaded = TemplateStore::load(dir.path()).unwrap();
        assert_eq!(reloaded.get("save").unwrap().variants().len(), 2);
    }

    #[test]
    fn capture_rejects_bad_region_and_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::load(dir.path()).unwrap();
        let screen = Screenshot::new(RgbaImage::new(20, 20));
        assert!(matches!(
            store.capture_variant("x", "main", &screen, BoundingBox::new(15, 15, 10, 10)),
            Err(TemplateStoreError::RegionOutOfBounds(_))
        ));
        assert!(matches!(
            store.capture_variant("../evil", "main", &screen, BoundingBox::new(0, 0, 5, 5)),
            Err(TemplateStoreError::InvalidId(_))
        ));
        assert!(matches!(
            TemplateStore::in_memory().capture_variant("x", "main", &screen, BoundingBox::new(0, 0, 5, 5)),
            Err(TemplateStoreError::NoBackingDirectory)
        ));
    }

    #[test]
    fn alternates_only_lists_existing_ids() {
        let store = TemplateStore::in_memory();
        for id in ["import", "import_alt", "import_old"] {
            store.append_variant(
                id,
                TemplateVariant::new(id, "p", PathBuf::from(id), GrayImage::new(1, 1)),
            );
        }
        assert_eq!(store.alternates_for("import"), vec!["import_alt", "import_old"]);
        assert!(store.alternates_for("export").is_empty());
    }
}
