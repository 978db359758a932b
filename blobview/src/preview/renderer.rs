// ABOUTME: Turns decoded images into terminal output for the detected protocol
// ABOUTME: Kitty and iTerm2 inline graphics, sixel, ANSI half-blocks, text fallback

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use crossterm::style::{Color, ResetColor, SetBackgroundColor, SetForegroundColor};
use crossterm::Command;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use std::fmt::Write as _;
use std::path::Path;

use crate::constants::{
    CELL_PIXEL_HEIGHT, CELL_PIXEL_WIDTH, CHAR_ASPECT_RATIO, DEFAULT_MAX_HEIGHT, DEFAULT_MAX_WIDTH,
    DEFAULT_TEXT_COLS, DEFAULT_TEXT_ROWS, KITTY_CHUNK_SIZE, MAX_IMAGE_HEIGHT, MAX_IMAGE_WIDTH,
};
use crate::error::PreviewError;
use crate::preview::detection::{GraphicsProtocol, TerminalCapabilities};
use crate::preview::types::{ImageFormat, ImageSize};

/// Output of a render: the terminal payload plus the geometry it was
/// produced for.
#[derive(Debug, Clone)]
pub struct Rendered {
    /// Escape sequences or half-block text, ready to write to the terminal.
    pub data: String,
    /// Terminal cell footprint of the payload.
    pub cols: u16,
    pub rows: u16,
    pub original_size: ImageSize,
    pub display_size: ImageSize,
    pub format: ImageFormat,
    /// Which encoding produced the payload, for diagnostics.
    pub protocol: &'static str,
}

/// Stateless-per-render image encoder. Geometry settings (display budget,
/// cell metrics, text mode) are adjustable between renders; a render never
/// mutates the renderer.
pub struct TerminalRenderer {
    capabilities: TerminalCapabilities,
    max_width: u32,
    max_height: u32,
    cell_width: u32,
    cell_height: u32,
    text_mode: bool,
}

impl TerminalRenderer {
    pub fn new(capabilities: TerminalCapabilities, text_mode: bool) -> Self {
        Self {
            capabilities,
            max_width: DEFAULT_MAX_WIDTH,
            max_height: DEFAULT_MAX_HEIGHT,
            cell_width: CELL_PIXEL_WIDTH,
            cell_height: CELL_PIXEL_HEIGHT,
            text_mode,
        }
    }

    pub fn capabilities(&self) -> &TerminalCapabilities {
        &self.capabilities
    }

    /// Pixel budget previews are scaled into. Values are clamped to the
    /// protocol ceiling.
    pub fn set_display_size(&mut self, width: u32, height: u32) {
        self.max_width = width.clamp(1, MAX_IMAGE_WIDTH);
        self.max_height = height.clamp(1, MAX_IMAGE_HEIGHT);
    }

    /// Cell metrics in pixels, for terminals with unusual font geometry.
    pub fn set_cell_size(&mut self, width: u32, height: u32) {
        self.cell_width = width.max(1);
        self.cell_height = height.max(1);
    }

    pub fn set_text_mode(&mut self, text_mode: bool) {
        self.text_mode = text_mode;
    }

    /// Whether the next render will emit an inline graphics protocol.
    /// False in text mode even when the terminal itself could display
    /// images.
    pub fn supports_graphics(&self) -> bool {
        self.active_protocol().is_some()
    }

    /// Renders the image at `path` into the configured pixel budget.
    pub fn render_file(&self, path: &Path, key: &str) -> Result<Rendered, PreviewError> {
        let (img, format, original) = self.load(path)?;
        let display = fit_within(original, self.max_width, self.max_height);
        let cols = div_ceil(display.width, self.cell_width).min(u16::MAX as u32) as u16;
        let rows = div_ceil(display.height, self.cell_height).min(u16::MAX as u32) as u16;
        self.encode(&img, path, key, format, original, display, cols, rows)
    }

    /// Renders into an explicit cell rectangle at an absolute terminal
    /// position. Kitty payloads get a cursor move to the start cell;
    /// the other protocols draw wherever the cursor already is.
    pub fn render_at_cells(
        &self,
        path: &Path,
        key: &str,
        cols: u16,
        rows: u16,
        start_col: u16,
        start_row: u16,
    ) -> Result<Rendered, PreviewError> {
        let (img, format, original) = self.load(path)?;
        let budget_w = cols as u32 * self.cell_width;
        let budget_h = rows as u32 * self.cell_height;
        let display = fit_within(original, budget_w.max(1), budget_h.max(1));
        let fit_cols = div_ceil(display.width, self.cell_width).min(cols as u32) as u16;
        let fit_rows = div_ceil(display.height, self.cell_height).min(rows as u32) as u16;
        let mut rendered =
            self.encode(&img, path, key, format, original, display, fit_cols, fit_rows)?;
        if self.active_protocol() == Some(GraphicsProtocol::Kitty) {
            rendered.data = format!(
                "\x1b[{};{}H{}",
                start_row.max(1),
                start_col.max(1),
                rendered.data
            );
        }
        Ok(rendered)
    }

    /// Sequence that removes a previously emitted image, when the protocol
    /// supports explicit deletion. Half-blocks and iTerm2 images scroll
    /// away with the text that contains them.
    pub fn clear_sequence(&self) -> Option<String> {
        match self.active_protocol() {
            Some(GraphicsProtocol::Kitty) => Some("\x1b_Ga=d\x1b\\".to_string()),
            _ => None,
        }
    }

    fn active_protocol(&self) -> Option<GraphicsProtocol> {
        if self.text_mode {
            return None;
        }
        self.capabilities.preferred_protocol()
    }

    fn load(&self, path: &Path) -> Result<(DynamicImage, ImageFormat, ImageSize), PreviewError> {
        if !path.exists() {
            return Err(PreviewError::FileNotFound(path.to_path_buf()));
        }

        let format = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(ImageFormat::from_extension)
            .or_else(|| sniff_format(path))
            .ok_or_else(|| PreviewError::Format {
                format: "unknown".to_string(),
                path: path.display().to_string(),
                reason: "unrecognized image format".to_string(),
            })?;

        let img = image::open(path).map_err(|e| PreviewError::Format {
            format: format.name().to_string(),
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let (w, h) = img.dimensions();
        Ok((img, format, ImageSize::new(w, h)))
    }

    #[allow(clippy::too_many_arguments)]
    fn encode(
        &self,
        img: &DynamicImage,
        path: &Path,
        key: &str,
        format: ImageFormat,
        original: ImageSize,
        display: ImageSize,
        cols: u16,
        rows: u16,
    ) -> Result<Rendered, PreviewError> {
        let cols = cols.max(1);
        let rows = rows.max(1);

        let (data, protocol, cols, rows) = match self.active_protocol() {
            Some(GraphicsProtocol::Kitty) => (
                self.encode_kitty(img, format, path, original, display, cols, rows)?,
                "kitty",
                cols,
                rows,
            ),
            Some(GraphicsProtocol::Iterm2) => (
                self.encode_iterm2(path, key, cols, rows)?,
                "iterm2",
                cols,
                rows,
            ),
            Some(GraphicsProtocol::Sixel) => {
                (encode_sixel(img, display), "sixel", cols, rows)
            }
            None if supports_color(&self.capabilities.terminal_name) => {
                let (data, cols, rows) =
                    encode_half_blocks(img, original, cols as u32, rows as u32)
                        .map_err(|_| self.render_error("half-block formatting failed"))?;
                (data, "halfblock", cols, rows)
            }
            None => {
                let text = text_placeholder(key, original, format, img_byte_len(path));
                (text, "text", DEFAULT_TEXT_COLS, DEFAULT_TEXT_ROWS)
            }
        };

        Ok(Rendered {
            data,
            cols,
            rows,
            original_size: original,
            display_size: display,
            format,
            protocol,
        })
    }

    /// Kitty graphics protocol: transmit-and-display in base64 chunks.
    /// Oversized images are downscaled to the display size before the
    /// transfer; f=100 expects PNG bytes, so anything that is not already
    /// a PNG at the right size is re-encoded.
    #[allow(clippy::too_many_arguments)]
    fn encode_kitty(
        &self,
        img: &DynamicImage,
        format: ImageFormat,
        path: &Path,
        original: ImageSize,
        display: ImageSize,
        cols: u16,
        rows: u16,
    ) -> Result<String, PreviewError> {
        let png_bytes = if display == original {
            if format == ImageFormat::Png {
                std::fs::read(path).map_err(|e| PreviewError::cache("read", path, e))?
            } else {
                encode_png(img)
                    .map_err(|e| self.render_error(&format!("png re-encode failed: {e}")))?
            }
        } else {
            let scaled = img.resize_exact(display.width, display.height, FilterType::Nearest);
            encode_png(&scaled)
                .map_err(|e| self.render_error(&format!("png re-encode failed: {e}")))?
        };

        let encoded = STANDARD.encode(&png_bytes);
        let chunks: Vec<&[u8]> = encoded.as_bytes().chunks(KITTY_CHUNK_SIZE).collect();

        let mut out = String::with_capacity(encoded.len() + chunks.len() * 16);
        for (i, chunk) in chunks.iter().enumerate() {
            // Base64 output is always ASCII.
            let chunk = std::str::from_utf8(chunk)
                .map_err(|e| self.render_error(&format!("chunk encoding failed: {e}")))?;
            let more = if i + 1 == chunks.len() { 0 } else { 1 };
            if i == 0 {
                let _ = write!(out, "\x1b_Ga=T,f=100,c={cols},r={rows},m={more};{chunk}\x1b\\");
            } else {
                let _ = write!(out, "\x1b_Gm={more};{chunk}\x1b\\");
            }
        }
        Ok(out)
    }

    /// iTerm2 OSC 1337 inline file. The original bytes go over the wire
    /// untouched; iTerm2 decodes every format we accept.
    fn encode_iterm2(
        &self,
        path: &Path,
        key: &str,
        cols: u16,
        rows: u16,
    ) -> Result<String, PreviewError> {
        let bytes = std::fs::read(path).map_err(|e| PreviewError::cache("read", path, e))?;
        let name = Path::new(key)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image");

        Ok(format!(
            "\x1b]1337;File=name={};size={};width={};height={};inline=1:{}\x07",
            STANDARD.encode(name.as_bytes()),
            bytes.len(),
            cols,
            rows,
            STANDARD.encode(&bytes),
        ))
    }

    fn render_error(&self, message: &str) -> PreviewError {
        let protocol = self
            .active_protocol()
            .map(|p| p.name())
            .unwrap_or(if self.text_mode { "halfblock" } else { "text" });
        PreviewError::Render {
            terminal: self.capabilities.terminal_name.clone(),
            protocol: protocol.to_string(),
            message: message.to_string(),
        }
    }
}

/// Truecolor half-block fallback. Each output row covers two pixel
/// rows: the upper one as ▀ foreground, the lower as background.
fn encode_half_blocks(
    img: &DynamicImage,
    original: ImageSize,
    max_cols: u32,
    max_rows: u32,
) -> Result<(String, u16, u16), std::fmt::Error> {
    let (cols, rows) = fit_half_block_grid(original, max_cols, max_rows);

    let sampled = img
        .resize_exact(cols as u32, rows as u32 * 2, FilterType::Nearest)
        .to_rgba8();

    let mut out = String::with_capacity(cols as usize * rows as usize * 24);
    for row in 0..rows as u32 {
        for col in 0..cols as u32 {
            let top = sampled.get_pixel(col, row * 2).0;
            let bottom = sampled.get_pixel(col, row * 2 + 1).0;
            SetForegroundColor(opaque(top)).write_ansi(&mut out)?;
            SetBackgroundColor(opaque(bottom)).write_ansi(&mut out)?;
            out.push('▀');
        }
        ResetColor.write_ansi(&mut out)?;
        out.push('\n');
    }
    Ok((out, cols, rows))
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

fn img_byte_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn supports_color(terminal_name: &str) -> bool {
    terminal_name != "dumb" && terminal_name != "forced-none"
}

fn opaque(px: [u8; 4]) -> Color {
    // Alpha is blended onto black; terminals have no transparency.
    let a = px[3] as u16;
    Color::Rgb {
        r: (px[0] as u16 * a / 255) as u8,
        g: (px[1] as u16 * a / 255) as u8,
        b: (px[2] as u16 * a / 255) as u8,
    }
}

fn div_ceil(value: u32, divisor: u32) -> u32 {
    value.div_ceil(divisor.max(1)).max(1)
}

/// Scale to fit within `max_w` x `max_h` preserving aspect ratio. Never
/// upscales, never exceeds the protocol ceiling, never collapses to zero.
pub fn fit_within(original: ImageSize, max_w: u32, max_h: u32) -> ImageSize {
    let max_w = max_w.min(MAX_IMAGE_WIDTH) as f64;
    let max_h = max_h.min(MAX_IMAGE_HEIGHT) as f64;
    let (w, h) = (original.width as f64, original.height as f64);

    let scale = (max_w / w).min(max_h / h).min(1.0);
    ImageSize::new(
        ((w * scale).round() as u32).max(1),
        ((h * scale).round() as u32).max(1),
    )
}

/// Fit an image into a cell grid for half-block output. A cell is twice
/// as tall as wide, and each cell holds two vertical samples, so the
/// effective pixel grid is `cols` x `rows * 2` with square pixels.
fn fit_half_block_grid(original: ImageSize, max_cols: u32, max_rows: u32) -> (u16, u16) {
    let grid_w = max_cols.max(1) as f64;
    let grid_h = (max_rows.max(1) as f64) * CHAR_ASPECT_RATIO;
    let (w, h) = (original.width as f64, original.height as f64);

    let scale = (grid_w / w).min(grid_h / h).min(1.0);
    let cols = ((w * scale).round() as u32).clamp(1, max_cols.max(1)) as u16;
    let rows =
        (((h * scale) / CHAR_ASPECT_RATIO).round() as u32).clamp(1, max_rows.max(1)) as u16;
    (cols, rows)
}

fn sniff_format(path: &Path) -> Option<ImageFormat> {
    let header = std::fs::read(path).ok()?;
    if header.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        Some(ImageFormat::Png)
    } else if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(ImageFormat::Jpeg)
    } else if header.starts_with(b"GIF87a") || header.starts_with(b"GIF89a") {
        Some(ImageFormat::Gif)
    } else if header.len() >= 12 && header.starts_with(b"RIFF") && &header[8..12] == b"WEBP" {
        Some(ImageFormat::WebP)
    } else if header.starts_with(b"BM") {
        Some(ImageFormat::Bmp)
    } else if header.starts_with(&[0x49, 0x49, 0x2A, 0x00])
        || header.starts_with(&[0x4D, 0x4D, 0x00, 0x2A])
    {
        Some(ImageFormat::Tiff)
    } else {
        None
    }
}

/// Sixel with a fixed 216-color cube (6 levels per channel), emitted in
/// 6-row bands with run-length encoding.
fn encode_sixel(img: &DynamicImage, display: ImageSize) -> String {
    let sampled = img
        .resize_exact(display.width, display.height, FilterType::Nearest)
        .to_rgba8();
    let (w, h) = (display.width as usize, display.height as usize);

    // Color index per pixel, and which palette entries are actually used.
    let mut indexed = vec![0u8; w * h];
    let mut used = [false; 216];
    for (i, px) in sampled.pixels().enumerate() {
        let idx = cube_index(px.0);
        indexed[i] = idx;
        used[idx as usize] = true;
    }

    let mut out = String::with_capacity(w * h / 4 + 256);
    let _ = write!(out, "\x1bPq\"1;1;{};{}", w, h);

    // Palette registers take channel values as percentages.
    for (idx, _) in used.iter().enumerate().filter(|(_, u)| **u) {
        let (r, g, b) = cube_rgb(idx as u8);
        let _ = write!(out, "#{idx};2;{r};{g};{b}");
    }

    let bands = h.div_ceil(6);
    for band in 0..bands {
        let y0 = band * 6;
        for (idx, _) in used.iter().enumerate().filter(|(_, u)| **u) {
            if !band_uses_color(&indexed, w, h, y0, idx as u8) {
                continue;
            }
            let _ = write!(out, "#{idx}");
            emit_band_run(&mut out, &indexed, w, h, y0, idx as u8);
            out.push('$');
        }
        out.push('-');
    }

    out.push_str("\x1b\\");
    out
}

fn band_uses_color(indexed: &[u8], w: usize, h: usize, y0: usize, color: u8) -> bool {
    (y0..(y0 + 6).min(h)).any(|y| indexed[y * w..(y + 1) * w].contains(&color))
}

fn emit_band_run(out: &mut String, indexed: &[u8], w: usize, h: usize, y0: usize, color: u8) {
    let mut run_char = 0u8;
    let mut run_len = 0usize;

    for x in 0..w {
        let mut bits = 0u8;
        for dy in 0..6 {
            let y = y0 + dy;
            if y < h && indexed[y * w + x] == color {
                bits |= 1 << dy;
            }
        }
        let ch = 63 + bits;
        if ch == run_char {
            run_len += 1;
        } else {
            flush_run(out, run_char, run_len);
            run_char = ch;
            run_len = 1;
        }
    }
    flush_run(out, run_char, run_len);
}

fn flush_run(out: &mut String, ch: u8, len: usize) {
    if len == 0 {
        return;
    }
    if len > 3 {
        let _ = write!(out, "!{len}");
        out.push(ch as char);
    } else {
        for _ in 0..len {
            out.push(ch as char);
        }
    }
}

/// Nearest entry in the 6x6x6 color cube.
fn cube_index(px: [u8; 4]) -> u8 {
    let level = |v: u8| ((v as u16 * 5 + 127) / 255) as u8;
    level(px[0]) * 36 + level(px[1]) * 6 + level(px[2])
}

/// Cube entry as percentages (0-100) for sixel register definitions.
fn cube_rgb(idx: u8) -> (u8, u8, u8) {
    let r = idx / 36;
    let g = (idx / 6) % 6;
    let b = idx % 6;
    (r * 20, g * 20, b * 20)
}

/// Plain-text stand-in for terminals with no graphics or color at all.
fn text_placeholder(key: &str, size: ImageSize, format: ImageFormat, bytes: u64) -> String {
    let name = Path::new(key)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(key);
    format!(
        "[image] {name}\n  {size} {} ({})\n",
        format.name(),
        human_bytes(bytes)
    )
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use tempfile::TempDir;

    fn caps(kitty: bool, iterm2: bool, sixel: bool, name: &str) -> TerminalCapabilities {
        TerminalCapabilities {
            supports_kitty: kitty,
            supports_iterm2: iterm2,
            supports_sixel: sixel,
            terminal_name: name.to_string(),
        }
    }

    fn write_png(dir: &TempDir, name: &str, width: u32, height: u32) -> std::path::PathBuf {
        let img = RgbaImage::from_pixel(width, height, Rgba([200, 40, 40, 255]));
        let path = dir.path().join(name);
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_fit_within_downscales_preserving_aspect() {
        let fitted = fit_within(ImageSize::new(4000, 2000), 960, 768);
        assert_eq!(fitted, ImageSize::new(960, 480));

        let fitted = fit_within(ImageSize::new(2000, 4000), 960, 768);
        assert_eq!(fitted, ImageSize::new(384, 768));
    }

    #[test]
    fn test_fit_within_never_upscales() {
        let small = ImageSize::new(100, 100);
        assert_eq!(fit_within(small, 960, 768), small);
        // The protocol ceiling leaves small images untouched too.
        assert_eq!(fit_within(small, MAX_IMAGE_WIDTH, MAX_IMAGE_HEIGHT), small);
    }

    #[test]
    fn test_fit_within_never_collapses_to_zero() {
        let sliver = fit_within(ImageSize::new(10000, 1), 100, 100);
        assert_eq!(sliver.height, 1);
        assert!(sliver.width >= 1);
    }

    #[test]
    fn test_half_block_grid_accounts_for_cell_aspect() {
        // A square image in a wide grid: height in cells is half the
        // width because each cell is twice as tall as wide.
        let (cols, rows) = fit_half_block_grid(ImageSize::new(500, 500), 80, 100);
        assert_eq!(cols, 80);
        assert_eq!(rows, 40);
    }

    #[test]
    fn test_kitty_output_chunked_and_sized() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "big.png", 600, 400);
        let renderer = TerminalRenderer::new(caps(true, false, false, "kitty"), false);

        let rendered = renderer.render_file(&path, "photos/big.png").unwrap();
        assert_eq!(rendered.protocol, "kitty");
        assert!(rendered.data.starts_with("\x1b_Ga=T,f=100"));
        assert!(rendered.data.contains(&format!("c={}", rendered.cols)));
        assert!(rendered.data.contains(&format!("r={}", rendered.rows)));
        assert!(rendered.data.contains("m=0"));
        assert!(rendered.data.ends_with("\x1b\\"));
        assert_eq!(rendered.original_size, ImageSize::new(600, 400));
    }

    #[test]
    fn test_kitty_chunks_stay_within_limit() {
        let dir = TempDir::new().unwrap();
        // Noise compresses badly, so the PNG payload needs many chunks.
        let mut img = RgbaImage::new(256, 256);
        for (x, y, px) in img.enumerate_pixels_mut() {
            *px = Rgba([
                (x * 7 % 256) as u8,
                (y * 13 % 256) as u8,
                ((x + y) * 31 % 256) as u8,
                255,
            ]);
        }
        let path = dir.path().join("noise.png");
        img.save(&path).unwrap();

        let renderer = TerminalRenderer::new(caps(true, false, false, "kitty"), false);
        let rendered = renderer.render_file(&path, "noise.png").unwrap();

        for part in rendered.data.split("\x1b\\").filter(|p| !p.is_empty()) {
            let payload = part.rsplit(';').next().unwrap_or("");
            assert!(payload.len() <= KITTY_CHUNK_SIZE, "oversized chunk");
        }
        assert!(rendered.data.matches("\x1b_G").count() > 1);
    }

    #[test]
    fn test_iterm2_output_names_file_and_cells() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "pic.png", 64, 64);
        let renderer = TerminalRenderer::new(caps(false, true, false, "iTerm.app"), false);

        let rendered = renderer.render_file(&path, "photos/pic.png").unwrap();
        assert_eq!(rendered.protocol, "iterm2");
        assert!(rendered.data.starts_with("\x1b]1337;File=name="));
        assert!(rendered
            .data
            .contains(&STANDARD.encode("pic.png".as_bytes())));
        assert!(rendered.data.contains("inline=1"));
        assert!(rendered.data.ends_with('\x07'));
    }

    #[test]
    fn test_sixel_output_structure() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "pic.png", 24, 13);
        let renderer = TerminalRenderer::new(caps(false, false, true, "mlterm"), false);

        let rendered = renderer.render_file(&path, "pic.png").unwrap();
        assert_eq!(rendered.protocol, "sixel");
        assert!(rendered.data.starts_with("\x1bPq"));
        assert!(rendered.data.ends_with("\x1b\\"));
        // One register definition for the single solid color.
        assert!(rendered.data.contains(";2;"));
        // 13 rows need 3 six-row bands.
        assert_eq!(rendered.data.matches('-').count(), 3);
    }

    #[test]
    fn test_half_block_fallback_dimensions() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "pic.png", 400, 400);
        let renderer = TerminalRenderer::new(caps(false, false, false, "xterm-256color"), false);

        let rendered = renderer.render_file(&path, "pic.png").unwrap();
        assert_eq!(rendered.protocol, "halfblock");
        assert_eq!(rendered.data.lines().count(), rendered.rows as usize);
        assert!(rendered.data.contains('▀'));
        assert!(rendered.data.contains("\x1b[38;2;"));
    }

    #[test]
    fn test_half_blocks_fit_requested_cells() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "pic.png", 400, 400);
        let renderer = TerminalRenderer::new(caps(false, false, false, "xterm-256color"), false);

        let rendered = renderer.render_at_cells(&path, "pic.png", 20, 8, 1, 1).unwrap();
        assert_eq!(rendered.protocol, "halfblock");
        assert!(rendered.cols <= 20);
        assert!(rendered.rows <= 8);
        assert_eq!(rendered.data.lines().count(), rendered.rows as usize);
    }

    #[test]
    fn test_text_mode_forces_half_blocks_over_kitty() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "pic.png", 64, 64);
        let renderer = TerminalRenderer::new(caps(true, true, true, "kitty"), true);

        let rendered = renderer.render_file(&path, "pic.png").unwrap();
        assert_eq!(rendered.protocol, "halfblock");
        assert!(renderer.clear_sequence().is_none());
    }

    #[test]
    fn test_dumb_terminal_gets_text_placeholder() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "pic.png", 64, 64);
        let renderer = TerminalRenderer::new(caps(false, false, false, "dumb"), false);

        let rendered = renderer.render_file(&path, "photos/pic.png").unwrap();
        assert_eq!(rendered.protocol, "text");
        assert!(rendered.data.contains("pic.png"));
        assert!(rendered.data.contains("64x64"));
        assert!(!rendered.data.contains('\x1b'));
    }

    #[test]
    fn test_render_at_cells_respects_budget() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "pic.png", 1600, 800);
        let renderer = TerminalRenderer::new(caps(true, false, false, "kitty"), false);

        let rendered = renderer.render_at_cells(&path, "pic.png", 40, 10, 1, 1).unwrap();
        assert!(rendered.cols <= 40);
        assert!(rendered.rows <= 10);
        assert!(rendered.display_size.width <= 40 * CELL_PIXEL_WIDTH);
        assert!(rendered.display_size.height <= 10 * CELL_PIXEL_HEIGHT);
    }

    #[test]
    fn test_positioned_render_moves_cursor_for_kitty() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "pic.png", 200, 100);
        let renderer = TerminalRenderer::new(caps(true, false, false, "kitty"), false);

        let rendered = renderer.render_at_cells(&path, "pic.png", 40, 10, 5, 3).unwrap();
        assert!(rendered.data.starts_with("\x1b[3;5H\x1b_Ga=T"));
    }

    #[test]
    fn test_positioned_render_leaves_half_blocks_unpositioned() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "pic.png", 200, 100);
        let renderer = TerminalRenderer::new(caps(false, false, false, "xterm-256color"), false);

        let rendered = renderer.render_at_cells(&path, "pic.png", 20, 8, 5, 3).unwrap();
        assert_eq!(rendered.protocol, "halfblock");
        assert!(!rendered.data.contains("\x1b[3;5H"));
    }

    #[test]
    fn test_kitty_payload_downscaled_to_display_size() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "big.png", 600, 400);
        let renderer = TerminalRenderer::new(caps(true, false, false, "kitty"), false);

        let rendered = renderer.render_at_cells(&path, "big.png", 30, 10, 1, 1).unwrap();
        assert!(rendered.display_size.width < 600);

        // Reassemble the base64 chunks and decode what actually went over
        // the wire.
        let b64: String = rendered
            .data
            .split("\x1b\\")
            .filter(|p| !p.is_empty())
            .map(|p| p.rsplit(';').next().unwrap_or(""))
            .collect();
        let shipped = image::load_from_memory(&STANDARD.decode(b64).unwrap()).unwrap();
        assert_eq!(
            shipped.dimensions(),
            (rendered.display_size.width, rendered.display_size.height)
        );
    }

    fn write_split_png(dir: &TempDir) -> std::path::PathBuf {
        let mut img = RgbaImage::new(100, 100);
        for (x, _, px) in img.enumerate_pixels_mut() {
            *px = if x < 50 {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([0, 0, 255, 255])
            };
        }
        let path = dir.path().join("split.png");
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_half_block_downscale_keeps_source_colors() {
        let dir = TempDir::new().unwrap();
        let path = write_split_png(&dir);
        let renderer = TerminalRenderer::new(caps(false, false, false, "xterm-256color"), false);

        let rendered = renderer.render_at_cells(&path, "split.png", 20, 10, 1, 1).unwrap();
        for seg in rendered.data.split("\x1b[38;2;").skip(1) {
            let color = seg.split('m').next().unwrap_or("");
            assert!(
                color == "255;0;0" || color == "0;0;255",
                "resampling blended a new color: {color}"
            );
        }
    }

    #[test]
    fn test_sixel_downscale_keeps_source_palette() {
        let dir = TempDir::new().unwrap();
        let path = write_split_png(&dir);
        let renderer = TerminalRenderer::new(caps(false, false, true, "mlterm"), false);

        let rendered = renderer.render_at_cells(&path, "split.png", 6, 4, 1, 1).unwrap();
        assert_eq!(rendered.protocol, "sixel");
        // Two source colors stay two palette registers after downscaling.
        assert_eq!(rendered.data.matches(";2;").count(), 2);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let renderer = TerminalRenderer::new(caps(true, false, false, "kitty"), false);
        let err = renderer
            .render_file(Path::new("/nonexistent/pic.png"), "pic.png")
            .unwrap_err();
        assert!(matches!(err, PreviewError::FileNotFound(_)));
    }

    #[test]
    fn test_undecodable_file_is_format_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fake.png");
        std::fs::write(&path, b"definitely not a png").unwrap();
        let renderer = TerminalRenderer::new(caps(true, false, false, "kitty"), false);

        let err = renderer.render_file(&path, "fake.png").unwrap_err();
        assert!(matches!(err, PreviewError::Format { .. }));
    }

    #[test]
    fn test_kitty_clear_sequence() {
        let renderer = TerminalRenderer::new(caps(true, false, false, "kitty"), false);
        assert_eq!(renderer.clear_sequence().unwrap(), "\x1b_Ga=d\x1b\\");

        let renderer = TerminalRenderer::new(caps(false, true, false, "iTerm.app"), false);
        assert!(renderer.clear_sequence().is_none());
    }

    #[test]
    fn test_cube_quantization_roundtrip() {
        assert_eq!(cube_index([0, 0, 0, 255]), 0);
        assert_eq!(cube_index([255, 255, 255, 255]), 215);
        assert_eq!(cube_rgb(215), (100, 100, 100));
        assert_eq!(cube_rgb(0), (0, 0, 0));
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.0 KB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
