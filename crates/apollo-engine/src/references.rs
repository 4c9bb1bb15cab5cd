use std::sync::Arc;

use apollo_contracts::stores::BlobStore;

use crate::model::ContentPart;
use crate::prompt::REFERENCE_FRAMING;

pub const MAX_REFERENCE_IMAGES: usize = 5;
pub const MAX_REFERENCE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub path: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Result of a best-effort load. `skipped` carries `(path, reason)` for
/// every input that could not be used.
#[derive(Debug, Clone, Default)]
pub struct LoadedReferences {
    pub images: Vec<ReferenceImage>,
    pub skipped: Vec<(String, String)>,
}

impl LoadedReferences {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Framing text followed by one inline part per image, or nothing.
    pub fn to_parts(&self) -> Vec<ContentPart> {
        if self.images.is_empty() {
            return Vec::new();
        }
        let mut parts = Vec::with_capacity(self.images.len() + 1);
        parts.push(ContentPart::text(REFERENCE_FRAMING));
        parts.extend(
            self.images
                .iter()
                .map(|image| ContentPart::image(image.mime_type.clone(), image.bytes.clone())),
        );
        parts
    }
}

pub struct ReferenceImageLoader {
    blobs: Arc<dyn BlobStore>,
}

impl ReferenceImageLoader {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Considers at most `max_count` paths; missing or unreadable blobs are
    /// dropped rather than failing the load.
    pub fn load(&self, paths: &[String], max_count: usize) -> LoadedReferences {
        let mut loaded = LoadedReferences::default();
        for path in paths.iter().take(max_count) {
            match self.blobs.exists(path) {
                Ok(true) => {}
                Ok(false) => {
                    loaded.skipped.push((path.clone(), "not found".to_string()));
                    continue;
                }
                Err(err) => {
                    loaded.skipped.push((path.clone(), format!("{err:#}")));
                    continue;
                }
            }
            match self.blobs.get(path) {
                Ok(bytes) => loaded.images.push(ReferenceImage {
                    path: path.clone(),
                    mime_type: mime_for_path(path).to_string(),
                    bytes,
                }),
                Err(err) => loaded.skipped.push((path.clone(), format!("{err:#}"))),
            }
        }
        loaded
    }
}

/// Extension-based mime type; anything unrecognised is treated as PNG.
pub fn mime_for_path(path: &str) -> &'static str {
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => "image/png",
    }
}

/// Keeps `[A-Za-z0-9._-]`, replaces everything else with `_`, and requires
/// a png/jpg/jpeg/webp extension.
pub fn sanitize_reference_filename(raw: &str) -> Option<String> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    let cleaned: String = base
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    let (stem, ext) = cleaned.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    let ext = ext.to_ascii_lowercase();
    if !matches!(ext.as_str(), "png" | "jpg" | "jpeg" | "webp") {
        return None;
    }
    Some(format!("{stem}.{ext}"))
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use apollo_contracts::stores::MemoryBlobStore;

    use super::*;

    #[test]
    fn drops_missing_paths_and_honours_max_count() -> Result<()> {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.put("refs/a.jpg", b"a", "image/jpeg")?;
        blobs.put("refs/b.webp", b"b", "image/webp")?;
        blobs.put("refs/c", b"c", "application/octet-stream")?;
        let loader = ReferenceImageLoader::new(blobs);

        let paths = vec![
            "refs/a.jpg".to_string(),
            "refs/missing.png".to_string(),
            "refs/b.webp".to_string(),
            "refs/c".to_string(),
        ];
        let loaded = loader.load(&paths, 3);
        assert_eq!(loaded.images.len(), 2);
        assert_eq!(loaded.images[0].mime_type, "image/jpeg");
        assert_eq!(loaded.images[1].mime_type, "image/webp");
        assert_eq!(loaded.skipped.len(), 1);
        assert_eq!(loaded.skipped[0].0, "refs/missing.png");

        let all = loader.load(&paths, 10);
        assert_eq!(all.images.len(), 3);
        assert_eq!(all.images[2].mime_type, "image/png");
        Ok(())
    }

    #[test]
    fn parts_start_with_framing_only_when_images_loaded() {
        assert!(LoadedReferences::default().to_parts().is_empty());
        let loaded = LoadedReferences {
            images: vec![ReferenceImage {
                path: "p.png".to_string(),
                bytes: vec![1],
                mime_type: "image/png".to_string(),
            }],
            skipped: Vec::new(),
        };
        let parts = loaded.to_parts();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], ContentPart::text(REFERENCE_FRAMING));
        assert!(parts[1].is_image());
    }

    #[test]
    fn filenames_are_sanitised() {
        assert_eq!(
            sanitize_reference_filename("my face (1).PNG").as_deref(),
            Some("my_face__1_.png")
        );
        assert_eq!(
            sanitize_reference_filename("../../etc/me.jpeg").as_deref(),
            Some("me.jpeg")
        );
        assert_eq!(sanitize_reference_filename("notes.txt"), None);
        assert_eq!(sanitize_reference_filename(".png"), None);
        assert_eq!(sanitize_reference_filename("noext"), None);
    }
}
