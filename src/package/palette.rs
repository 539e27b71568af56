use std::path::Path;

use super::model::{Palette, Rgba, PALETTE_SIZE};
use crate::error::PackageError;

/// Reads the first 256 pixels (row-major) of a palette PNG.
pub fn read_palette(path: &Path) -> Result<Palette, PackageError> {
    if !path.is_file() {
        return Err(PackageError::MissingPalette(path.to_path_buf()));
    }

    let image = image::open(path)
        .map_err(|e| PackageError::Palette {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
        .to_rgba8();

    let mut colors = [Rgba::default(); PALETTE_SIZE];
    let mut count = 0;
    for (slot, pixel) in colors.iter_mut().zip(image.pixels()) {
        let [r, g, b, a] = pixel.0;
        *slot = Rgba { r, g, b, a };
        count += 1;
    }

    if count < PALETTE_SIZE {
        return Err(PackageError::Palette {
            path: path.to_path_buf(),
            reason: format!("expected {PALETTE_SIZE} colors, found {count}"),
        });
    }
    Ok(Palette::new(colors))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_a_256_by_1_strip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("palette1.png");
        image::RgbaImage::from_fn(256, 1, |x, _| image::Rgba([x as u8, 0, 0, 255 - x as u8]))
            .save(&path)
            .unwrap();

        let palette = read_palette(&path).unwrap();
        assert_eq!(palette.color(1), Rgba { r: 0, g: 0, b: 0, a: 255 });
        assert_eq!(palette.color(11), Rgba { r: 10, g: 0, b: 0, a: 245 });
    }

    #[test]
    fn rejects_short_palettes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("palette1.png");
        image::RgbaImage::new(16, 1).save(&path).unwrap();

        assert!(matches!(
            read_palette(&path),
            Err(PackageError::Palette { .. })
        ));
    }

    #[test]
    fn missing_palette_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_palette(&dir.path().join("palette9.png")),
            Err(PackageError::MissingPalette(_))
        ));
    }
}
