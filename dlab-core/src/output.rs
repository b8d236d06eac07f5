use std::{
    fs,
    io::{self, BufRead, Cursor, Write},
    path::{Path, PathBuf},
};

use base64::{prelude::BASE64_STANDARD, Engine};
use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};

use crate::{LabError, Result};

/// Pixels between tiles of a contact sheet.
const SHEET_GAP: u32 = 8;

/// Write `image` to `output_dir/filename`, creating the directory if needed.
/// An existing file with the same name is overwritten.
pub fn save_image(image: &DynamicImage, output_dir: &Path, filename: &str) -> Result<PathBuf> {
    fs::create_dir_all(output_dir).inspect_err(|e| {
        tracing::error!(dir = %output_dir.display(), error = %e, "cannot create output directory")
    })?;
    let path = output_dir.join(filename);
    image.save(&path).map_err(|source| {
        tracing::error!(path = %path.display(), error = %source, "failed to save image");
        LabError::SaveImage {
            path: path.clone(),
            source,
        }
    })?;
    tracing::info!(path = %path.display(), "image saved");
    Ok(path)
}

fn image_to_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|e| LabError::Display(e.to_string()))?;
    Ok(bytes)
}

/// Show `image` inline in the terminal and block until Enter is pressed.
pub fn display_image(image: &DynamicImage, title: &str) -> Result<()> {
    let stdout = io::stdout();
    let stdin = io::stdin();
    display_image_to(image, title, &mut stdout.lock(), &mut stdin.lock())
}

/// Render with the iTerm2 inline image protocol, which WezTerm, Konsole and
/// recent kitty builds understand as well. Other terminals just show the title.
pub fn display_image_to<W: Write, R: BufRead>(
    image: &DynamicImage,
    title: &str,
    out: &mut W,
    input: &mut R,
) -> Result<()> {
    let png = image_to_png(image)?;
    let (width, height) = image.dimensions();
    writeln!(out, "{title} ({width}x{height})")?;
    write!(
        out,
        "\x1b]1337;File=name={};size={};inline=1;preserveAspectRatio=1:{}\x07",
        BASE64_STANDARD.encode(title),
        png.len(),
        BASE64_STANDARD.encode(&png)
    )?;
    writeln!(out)?;
    write!(out, "press Enter to continue")?;
    out.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(())
}

/// Tile images left to right on a white canvas. `None` when there is nothing to tile.
pub fn contact_sheet(images: &[DynamicImage]) -> Option<DynamicImage> {
    if images.is_empty() {
        return None;
    }
    let width = images.iter().map(|img| img.width()).sum::<u32>()
        + SHEET_GAP * (images.len() as u32 - 1);
    let height = images.iter().map(|img| img.height()).max().unwrap_or(0);

    let mut canvas = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
    let mut x = 0i64;
    for img in images {
        image::imageops::overlay(&mut canvas, &img.to_rgb8(), x, 0);
        x += (img.width() + SHEET_GAP) as i64;
    }
    Some(DynamicImage::ImageRgb8(canvas))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([value, 0, 0])))
    }

    #[test]
    fn save_creates_directory_and_overwrites() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let output_dir = dir.path().join("nested").join("outputs");

        let first = save_image(&solid(8, 8, 10), &output_dir, "same.png")?;
        assert!(first.exists());
        let second = save_image(&solid(8, 8, 200), &output_dir, "same.png")?;
        assert_eq!(first, second);
        assert!(second.exists());

        let reloaded = image::open(&second).unwrap().to_rgb8();
        assert_eq!(reloaded.get_pixel(0, 0).0, [200, 0, 0]);
        Ok(())
    }

    #[test]
    fn save_reports_unknown_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let err = save_image(&solid(8, 8, 1), dir.path(), "image.notaformat").unwrap_err();
        assert!(matches!(err, LabError::SaveImage { .. }));
    }

    #[test]
    fn display_writes_inline_image_and_waits() -> Result<()> {
        let mut out = Vec::new();
        let mut input = io::Cursor::new(b"\n".to_vec());
        display_image_to(&solid(4, 4, 0), "Lab 1", &mut out, &mut input)?;
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Lab 1 (4x4)"));
        assert!(text.contains("\x1b]1337;File="));
        assert!(text.contains("press Enter"));
        // the newline was consumed
        assert_eq!(input.position(), 1);
        Ok(())
    }

    #[test]
    fn contact_sheet_tiles_left_to_right() {
        assert!(contact_sheet(&[]).is_none());
        let sheet = contact_sheet(&[solid(10, 6, 1), solid(10, 8, 2)]).unwrap();
        assert_eq!(sheet.dimensions(), (10 + SHEET_GAP + 10, 8));
        let sheet = sheet.to_rgb8();
        assert_eq!(sheet.get_pixel(0, 0).0, [1, 0, 0]);
        assert_eq!(sheet.get_pixel(10 + SHEET_GAP, 7).0, [2, 0, 0]);
        // shorter tile leaves the background visible
        assert_eq!(sheet.get_pixel(0, 7).0, [255, 255, 255]);
    }
}
