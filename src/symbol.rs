//! Symbol codec: small payloads to and from scannable 2D module grids.
//!
//! The grid codec lays out a square of `M` modules (21 ≤ M ≤ 512), each
//! `MODULE_PX` pixels wide. Row 0 is an alternating timing pattern that
//! starts dark, so a decoder can recover `M` from any nearest-neighbour
//! rescaling of the image. Rows `1..M` carry the framed payload bits,
//! row-major, most significant bit first:
//!
//! ```text
//! tag (0xF5) | ec level | u32 BE length | blake3[..4] | payload
//! ```

use std::io::{Read, Write};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use image::{Rgb, RgbImage};

use crate::config::{SymbolSettings, luma, parse_color};
use crate::error::{ArchiveError, Result};

const SYMBOL_TAG: u8 = 0xF5;
const HEADER_BYTES: usize = 10;
const MODULE_PX: u32 = 4;
pub const MIN_MODULES: u32 = 21;
pub const MAX_MODULES: u32 = 512;
/// gzip header and trailer.
const GZIP_FRAMING_BYTES: usize = 18;
/// Per-block overhead of a stored deflate block, and the smallest block
/// payload the compressor flushes at.
const DEFLATE_STORED_BLOCK: (usize, usize) = (5, 16_384);

/// Converts payload bytes to and from symbol images.
///
/// When `settings.gzip` is set the payload is gzip-compressed and
/// base64-encoded before it is laid out, and the reverse is applied after
/// decoding.
pub trait SymbolCodec: Send + Sync {
    fn encode(&self, payload: &[u8], settings: &SymbolSettings) -> Result<RgbImage>;

    /// Fails with [`ArchiveError::InvalidCode`] when the image does not hold
    /// a readable symbol.
    fn decode(&self, image: &RgbImage, settings: &SymbolSettings) -> Result<Vec<u8>>;
}

fn invalid(reason: impl Into<std::borrow::Cow<'static, str>>) -> ArchiveError {
    ArchiveError::InvalidCode {
        reason: reason.into(),
    }
}

/// Apply the gzip + base64 wrapping when requested.
pub fn pack_payload(payload: &[u8], gzip: bool) -> Result<Vec<u8>> {
    if !gzip {
        return Ok(payload.to_vec());
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    let compressed = encoder.finish()?;
    Ok(BASE64.encode(compressed).into_bytes())
}

/// Reverse of [`pack_payload`].
pub fn unpack_payload(data: &[u8], gzip: bool) -> Result<Vec<u8>> {
    if !gzip {
        return Ok(data.to_vec());
    }
    let compressed = BASE64
        .decode(data)
        .map_err(|err| invalid(format!("payload is not base64: {err}")))?;
    let mut payload = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut payload)
        .map_err(|err| invalid(format!("payload is not gzip: {err}")))?;
    Ok(payload)
}

fn checksum(data: &[u8]) -> [u8; 4] {
    let digest = blake3::hash(data);
    let mut head = [0u8; 4];
    head.copy_from_slice(&digest.as_bytes()[..4]);
    head
}

/// Upper bound on the packed size of a `raw`-byte payload.
///
/// With gzip this is the stored-block expansion of deflate followed by
/// base64, which no input can exceed.
#[must_use]
pub fn packed_len_bound(raw: usize, gzip: bool) -> usize {
    if !gzip {
        return raw;
    }
    let (block_overhead, block_len) = DEFLATE_STORED_BLOCK;
    // One extra block covers a trailing partial block and the final marker.
    let blocks = raw / block_len + 2;
    let compressed = raw + blocks * block_overhead + GZIP_FRAMING_BYTES;
    compressed.div_ceil(3) * 4
}

/// Smallest module count whose data rows hold `bytes` bytes.
fn modules_for(bytes: usize) -> Option<u32> {
    let bits = bytes * 8;
    (MIN_MODULES..=MAX_MODULES).find(|&m| ((m - 1) * m) as usize >= bits)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GridSymbolCodec;

impl GridSymbolCodec {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Largest packed payload one symbol can carry.
    #[must_use]
    pub fn capacity_bytes() -> usize {
        Self::capacity_for_side(MAX_MODULES)
    }

    /// Largest packed payload that still decodes after the symbol is
    /// rescaled to a `side` pixel square. Every module needs at least one
    /// pixel, so `side` caps the module count.
    #[must_use]
    pub fn capacity_for_side(side: u32) -> usize {
        let modules = side.min(MAX_MODULES);
        if modules < MIN_MODULES {
            return 0;
        }
        (((modules - 1) * modules / 8) as usize).saturating_sub(HEADER_BYTES)
    }
}

impl SymbolCodec for GridSymbolCodec {
    fn encode(&self, payload: &[u8], settings: &SymbolSettings) -> Result<RgbImage> {
        let data = pack_payload(payload, settings.gzip)?;
        let length = u32::try_from(data.len())
            .map_err(|_| ArchiveError::codec("payload length does not fit in u32"))?;

        let mut framed = Vec::with_capacity(HEADER_BYTES + data.len());
        framed.push(SYMBOL_TAG);
        framed.push(settings.error_correction.as_byte());
        framed.extend_from_slice(&length.to_be_bytes());
        framed.extend_from_slice(&checksum(&data));
        framed.extend_from_slice(&data);

        let modules = modules_for(framed.len()).ok_or_else(|| {
            ArchiveError::codec(format!(
                "payload of {} bytes exceeds symbol capacity of {} bytes",
                data.len(),
                Self::capacity_bytes()
            ))
        })?;

        let fill = Rgb(parse_color(&settings.fill_color)?);
        let back = Rgb(parse_color(&settings.back_color)?);
        let side = modules * MODULE_PX;
        let image = RgbImage::from_fn(side, side, |x, y| {
            let (col, row) = (x / MODULE_PX, y / MODULE_PX);
            let dark = if row == 0 {
                col % 2 == 0
            } else {
                let bit = ((row - 1) * modules + col) as usize;
                framed
                    .get(bit / 8)
                    .is_some_and(|byte| *byte & (0x80u8 >> (bit % 8)) != 0)
            };
            if dark { fill } else { back }
        });
        Ok(image)
    }

    fn decode(&self, image: &RgbImage, settings: &SymbolSettings) -> Result<Vec<u8>> {
        let fill = luma(parse_color(&settings.fill_color)?);
        let back = luma(parse_color(&settings.back_color)?);
        let is_dark = |x: u32, y: u32| {
            let value = luma(image.get_pixel(x, y).0);
            value.abs_diff(fill) < value.abs_diff(back)
        };

        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(invalid("empty image"));
        }
        if !is_dark(0, 0) {
            return Err(invalid("missing timing pattern"));
        }
        let mut modules = 1u32;
        let mut previous = true;
        for x in 1..width {
            let current = is_dark(x, 0);
            if current != previous {
                modules += 1;
                previous = current;
            }
        }
        if !(MIN_MODULES..=MAX_MODULES).contains(&modules) || modules > width || modules > height
        {
            return Err(invalid(format!("timing pattern reports {modules} modules")));
        }

        let sample = |row: u32, col: u32| {
            let x = ((f64::from(col) + 0.5) * f64::from(width) / f64::from(modules)) as u32;
            let y = ((f64::from(row) + 0.5) * f64::from(height) / f64::from(modules)) as u32;
            is_dark(x.min(width - 1), y.min(height - 1))
        };
        let capacity = ((modules - 1) * modules / 8) as usize;
        let read_byte = |index: usize| -> u8 {
            (0..8).fold(0u8, |byte, offset| {
                let bit = (index * 8 + offset) as u32;
                let (row, col) = (bit / modules + 1, bit % modules);
                (byte << 1) | u8::from(sample(row, col))
            })
        };

        let header: Vec<u8> = (0..HEADER_BYTES).map(read_byte).collect();
        if header[0] != SYMBOL_TAG {
            return Err(invalid("bad symbol tag"));
        }
        if header[1] > 3 {
            return Err(invalid("bad error-correction level"));
        }
        let length = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
        if HEADER_BYTES + length > capacity {
            return Err(invalid(format!(
                "declared length {length} exceeds symbol capacity"
            )));
        }
        let data: Vec<u8> = (HEADER_BYTES..HEADER_BYTES + length).map(read_byte).collect();
        if checksum(&data) != header[6..10] {
            return Err(invalid("checksum mismatch"));
        }
        unpack_payload(&data, settings.gzip)
    }
}
