//! Minimal deterministic PDF writer.
//!
//! One A4 page per image, drawn fit-to-width from the top edge. Pixels
//! are embedded losslessly as FlateDecode RGB image XObjects. The
//! creation date is a fixed constant so exporting the same pages twice
//! produces byte-identical files.

use std::io::Write;
use std::path::Path;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::RgbImage;

use crate::error::PipelineError;

/// A4 portrait media box in PostScript points.
pub const A4_WIDTH_PT: f32 = 595.28;
pub const A4_HEIGHT_PT: f32 = 841.89;

/// Fixed creation timestamp embedded in every export.
const CREATION_DATE: &str = "D:20240101000000Z";

/// Render a PDF document with one page per image.
pub fn render_pdf(pages: &[&RgbImage]) -> Vec<u8> {
    let mut doc = Document::new();

    // Object 1: catalog, object 2: page tree. Each page consumes three
    // objects (page, image, contents); the info dictionary goes last.
    let page_object_ids: Vec<u32> = (0..pages.len() as u32).map(|i| 3 + i * 3).collect();
    let info_object_id = 3 + pages.len() as u32 * 3;

    doc.object(1, "<< /Type /Catalog /Pages 2 0 R >>".into());
    let kids = page_object_ids
        .iter()
        .map(|id| format!("{id} 0 R"))
        .collect::<Vec<_>>()
        .join(" ");
    doc.object(
        2,
        format!("<< /Type /Pages /Kids [{kids}] /Count {} >>", pages.len()),
    );

    for (index, page) in pages.iter().enumerate() {
        let page_id = page_object_ids[index];
        let image_id = page_id + 1;
        let contents_id = page_id + 2;
        let (w, h) = page.dimensions();

        doc.object(
            page_id,
            format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {A4_WIDTH_PT} {A4_HEIGHT_PT}] \
                 /Resources << /XObject << /Im{index} {image_id} 0 R >> >> \
                 /Contents {contents_id} 0 R >>"
            ),
        );

        let pixels = compress(page.as_raw());
        doc.stream(
            image_id,
            format!(
                "<< /Type /XObject /Subtype /Image /Width {w} /Height {h} \
                 /ColorSpace /DeviceRGB /BitsPerComponent 8 /Filter /FlateDecode \
                 /Length {} >>",
                pixels.len()
            ),
            &pixels,
        );

        // Fit to width, anchored to the top edge of the page.
        let scale = A4_WIDTH_PT / w as f32;
        let draw_h = h as f32 * scale;
        let y = (A4_HEIGHT_PT - draw_h).max(0.0);
        let ops = format!("q {A4_WIDTH_PT:.2} 0 0 {draw_h:.2} 0 {y:.2} cm /Im{index} Do Q");
        doc.stream(
            contents_id,
            format!("<< /Length {} >>", ops.len()),
            ops.as_bytes(),
        );
    }

    doc.object(
        info_object_id,
        format!("<< /Producer (drumsheet) /CreationDate ({CREATION_DATE}) >>"),
    );

    doc.finish(info_object_id)
}

/// Render and write to disk.
pub fn write_pdf(pages: &[&RgbImage], path: &Path) -> Result<(), PipelineError> {
    std::fs::write(path, render_pdf(pages))
        .map_err(|e| PipelineError::ExportFailed(format!("failed to write PDF: {e}")))
}

fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("in-memory zlib write");
    encoder.finish().expect("in-memory zlib finish")
}

/// Byte-level document builder tracking object offsets for the xref
/// table.
struct Document {
    bytes: Vec<u8>,
    /// (object id, byte offset) pairs in write order.
    offsets: Vec<(u32, usize)>,
}

impl Document {
    fn new() -> Self {
        Self {
            bytes: b"%PDF-1.4\n".to_vec(),
            offsets: Vec::new(),
        }
    }

    fn object(&mut self, id: u32, body: String) {
        self.offsets.push((id, self.bytes.len()));
        self.bytes
            .extend_from_slice(format!("{id} 0 obj\n{body}\nendobj\n").as_bytes());
    }

    fn stream(&mut self, id: u32, dict: String, data: &[u8]) {
        self.offsets.push((id, self.bytes.len()));
        self.bytes
            .extend_from_slice(format!("{id} 0 obj\n{dict}\nstream\n").as_bytes());
        self.bytes.extend_from_slice(data);
        self.bytes.extend_from_slice(b"\nendstream\nendobj\n");
    }

    fn finish(mut self, info_id: u32) -> Vec<u8> {
        let mut offsets = self.offsets.clone();
        offsets.sort_by_key(|(id, _)| *id);

        let xref_offset = self.bytes.len();
        let count = offsets.len() + 1;
        self.bytes
            .extend_from_slice(format!("xref\n0 {count}\n").as_bytes());
        self.bytes.extend_from_slice(b"0000000000 65535 f \n");
        for (_, offset) in &offsets {
            self.bytes
                .extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
        }
        self.bytes.extend_from_slice(
            format!(
                "trailer\n<< /Size {count} /Root 1 0 R /Info {info_id} 0 R >>\n\
                 startxref\n{xref_offset}\n%%EOF\n"
            )
            .as_bytes(),
        );
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn sample_page(seed: u8) -> RgbImage {
        RgbImage::from_fn(40, 56, |x, y| {
            Rgb([seed.wrapping_add((x + y) as u8), 200, 100])
        })
    }

    #[test]
    fn document_structure_is_well_formed() {
        let a = sample_page(0);
        let b = sample_page(90);
        let bytes = render_pdf(&[&a, &b]);
        let text = String::from_utf8_lossy(&bytes);

        assert!(text.starts_with("%PDF-1.4"));
        assert!(text.contains("/Count 2"));
        assert!(text.contains("/Filter /FlateDecode"));
        assert!(text.contains("startxref"));
        assert!(text.ends_with("%%EOF\n"));
    }

    #[test]
    fn repeated_renders_are_byte_identical() {
        let page = sample_page(7);
        assert_eq!(render_pdf(&[&page]), render_pdf(&[&page]));
    }

    #[test]
    fn pages_are_a4_fit_to_width() {
        let page = sample_page(0);
        let bytes = render_pdf(&[&page]);
        let text = String::from_utf8_lossy(&bytes);
        // 40x56 px page: height drawn at 595.28 * 56/40 = 833.39 pt,
        // anchored 8.5 pt below the top of the 841.89 pt media box.
        assert!(text.contains("q 595.28 0 0 833.39 0 8.50 cm /Im0 Do Q"));
    }

    #[test]
    fn write_pdf_emits_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.pdf");
        let page = sample_page(1);
        write_pdf(&[&page], &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"%PDF-1.4"));
    }
}
