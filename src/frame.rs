//! Frame codec seam and the packet-stream media container.
//!
//! A media file is a flat sequence of packets, each a `u32` little-endian
//! length followed by that many body bytes. The first packet is the stream
//! header; every later packet carries one compressed group of consecutive
//! raw frames.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use image::imageops::{FilterType, resize};
use image::{DynamicImage, GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

use crate::config::{CodecParams, PacketCompression, PixelFormat};
use crate::constants::{FRAMES_PER_PACKET, MAX_PACKET_BYTES, MEDIA_MAGIC, MEDIA_VERSION};
use crate::error::{ArchiveError, Result};

const ZSTD_LEVEL: i32 = 3;

fn media_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_fixed_int_encoding()
        .with_little_endian()
}

fn media_decode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_fixed_int_encoding()
        .with_little_endian()
        .with_limit::<MAX_PACKET_BYTES>()
}

/// One frame read back from a media file.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub index: u64,
    pub image: RgbImage,
}

pub type FrameStream = Box<dyn Iterator<Item = Result<DecodedFrame>> + Send>;

/// Streaming encoder for one media file. Each call returns the complete
/// packets (length prefix included) it produced; concatenating every
/// returned packet, flush included, yields the media file.
pub trait FrameEncoder: Send {
    fn encode(&mut self, frame: &DynamicImage) -> Result<Vec<Vec<u8>>>;

    fn flush(&mut self) -> Result<Vec<Vec<u8>>>;
}

pub trait FrameCodec: Send + Sync {
    fn encoder(&self, params: &CodecParams) -> Result<Box<dyn FrameEncoder>>;

    /// Lazily yields frames in stored order. Each call reopens the file, so
    /// the sequence can be restarted.
    fn frames(&self, path: &Path) -> Result<FrameStream>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub fps: u32,
    pub group_size: u32,
    pub compression: PacketCompression,
}

#[derive(Serialize, Deserialize)]
struct FrameGroup {
    first_frame: u64,
    frames: Vec<Vec<u8>>,
}

/// Resize (nearest) to the frame geometry of `params` and convert to its
/// pixel format.
#[must_use]
pub fn fit_frame(image: RgbImage, params: &CodecParams) -> DynamicImage {
    let (width, height) = (params.frame_width, params.frame_height);
    let rgb = if image.dimensions() == (width, height) {
        image
    } else {
        resize(&image, width, height, FilterType::Nearest)
    };
    match params.pixel_format {
        PixelFormat::Rgb24 => DynamicImage::ImageRgb8(rgb),
        PixelFormat::Gray8 => DynamicImage::ImageLuma8(DynamicImage::ImageRgb8(rgb).to_luma8()),
    }
}

fn to_raw_pixels(image: &DynamicImage, params: &CodecParams) -> Vec<u8> {
    let fitted = match (image, params.pixel_format) {
        (DynamicImage::ImageRgb8(rgb), PixelFormat::Rgb24)
            if rgb.dimensions() == (params.frame_width, params.frame_height) =>
        {
            return rgb.as_raw().clone();
        }
        (DynamicImage::ImageLuma8(gray), PixelFormat::Gray8)
            if gray.dimensions() == (params.frame_width, params.frame_height) =>
        {
            return gray.as_raw().clone();
        }
        _ => fit_frame(image.to_rgb8(), params),
    };
    match params.pixel_format {
        PixelFormat::Rgb24 => fitted.to_rgb8().into_raw(),
        PixelFormat::Gray8 => fitted.to_luma8().into_raw(),
    }
}

fn from_raw_pixels(raw: Vec<u8>, header: &MediaHeader) -> Result<RgbImage> {
    let (width, height) = (header.width, header.height);
    let image = match header.pixel_format {
        PixelFormat::Rgb24 => RgbImage::from_raw(width, height, raw),
        PixelFormat::Gray8 => GrayImage::from_raw(width, height, raw)
            .map(|gray| DynamicImage::ImageLuma8(gray).to_rgb8()),
    };
    image.ok_or_else(|| ArchiveError::codec("frame size does not match stream header"))
}

fn compress(body: &[u8], compression: PacketCompression) -> Result<Vec<u8>> {
    match compression {
        PacketCompression::Zstd => Ok(zstd::encode_all(body, ZSTD_LEVEL)?),
        PacketCompression::Lz4 => Ok(lz4_flex::compress_prepend_size(body)),
        PacketCompression::Stored => Ok(body.to_vec()),
    }
}

fn decompress(body: &[u8], compression: PacketCompression) -> Result<Vec<u8>> {
    match compression {
        PacketCompression::Zstd => zstd::decode_all(body)
            .map_err(|err| ArchiveError::codec(format!("zstd packet: {err}"))),
        PacketCompression::Lz4 => lz4_flex::decompress_size_prepended(body)
            .map_err(|err| ArchiveError::codec(format!("lz4 packet: {err}"))),
        PacketCompression::Stored => Ok(body.to_vec()),
    }
}

fn framed(body: &[u8]) -> Result<Vec<u8>> {
    if body.len() > MAX_PACKET_BYTES {
        return Err(ArchiveError::codec(format!(
            "packet of {} bytes exceeds limit",
            body.len()
        )));
    }
    let mut packet = Vec::with_capacity(4 + body.len());
    packet.extend_from_slice(&(body.len() as u32).to_le_bytes());
    packet.extend_from_slice(body);
    Ok(packet)
}

/// Packet-stream container with per-group zstd, lz4 or stored compression.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketStreamCodec;

impl PacketStreamCodec {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Read only the stream header of a media file.
    pub fn read_header(path: &Path) -> Result<MediaHeader> {
        PacketReader::open(path).map(|reader| reader.header)
    }
}

impl FrameCodec for PacketStreamCodec {
    fn encoder(&self, params: &CodecParams) -> Result<Box<dyn FrameEncoder>> {
        if params.frame_width == 0 || params.frame_height == 0 || params.fps == 0 {
            return Err(ArchiveError::codec(format!(
                "invalid frame geometry {}x{} @ {} fps",
                params.frame_width, params.frame_height, params.fps
            )));
        }
        Ok(Box::new(PacketEncoder {
            params: params.clone(),
            header_written: false,
            next_frame: 0,
            group: Vec::with_capacity(FRAMES_PER_PACKET),
        }))
    }

    fn frames(&self, path: &Path) -> Result<FrameStream> {
        Ok(Box::new(PacketReader::open(path)?))
    }
}

struct PacketEncoder {
    params: CodecParams,
    header_written: bool,
    next_frame: u64,
    group: Vec<Vec<u8>>,
}

impl PacketEncoder {
    fn header_packet(&mut self, packets: &mut Vec<Vec<u8>>) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        let header = MediaHeader {
            magic: MEDIA_MAGIC,
            version: MEDIA_VERSION,
            codec: self.params.codec.clone(),
            width: self.params.frame_width,
            height: self.params.frame_height,
            pixel_format: self.params.pixel_format,
            fps: self.params.fps,
            group_size: FRAMES_PER_PACKET as u32,
            compression: self.params.compression,
        };
        let body = bincode::serde::encode_to_vec(&header, media_config())?;
        packets.push(framed(&body)?);
        self.header_written = true;
        Ok(())
    }

    fn group_packet(&mut self) -> Result<Vec<u8>> {
        let frames = std::mem::take(&mut self.group);
        let group = FrameGroup {
            first_frame: self.next_frame - frames.len() as u64,
            frames,
        };
        let body = bincode::serde::encode_to_vec(&group, media_config())?;
        framed(&compress(&body, self.params.compression)?)
    }
}

impl FrameEncoder for PacketEncoder {
    fn encode(&mut self, frame: &DynamicImage) -> Result<Vec<Vec<u8>>> {
        let mut packets = Vec::new();
        self.header_packet(&mut packets)?;
        self.group.push(to_raw_pixels(frame, &self.params));
        self.next_frame += 1;
        if self.group.len() == FRAMES_PER_PACKET {
            packets.push(self.group_packet()?);
        }
        Ok(packets)
    }

    fn flush(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut packets = Vec::new();
        self.header_packet(&mut packets)?;
        if !self.group.is_empty() {
            packets.push(self.group_packet()?);
        }
        Ok(packets)
    }
}

struct PacketReader {
    path: PathBuf,
    reader: BufReader<File>,
    header: MediaHeader,
    pending: std::vec::IntoIter<DecodedFrame>,
    next_frame: u64,
    done: bool,
}

impl PacketReader {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| ArchiveError::io_at(err, path))?;
        let mut reader = BufReader::new(file);
        let body = read_packet(&mut reader)?
            .ok_or_else(|| ArchiveError::codec("media file is empty"))?;
        let (header, _): (MediaHeader, usize) =
            bincode::serde::decode_from_slice(&body, media_decode_config())?;
        if header.magic != MEDIA_MAGIC {
            return Err(ArchiveError::codec("not a framevault media file"));
        }
        if header.version != MEDIA_VERSION {
            return Err(ArchiveError::codec(format!(
                "unsupported media version {}",
                header.version
            )));
        }
        tracing::debug!(
            path = %path.display(),
            codec = %header.codec,
            width = header.width,
            height = header.height,
            "opened media stream"
        );
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            header,
            pending: Vec::new().into_iter(),
            next_frame: 0,
            done: false,
        })
    }

    fn next_group(&mut self) -> Result<Option<Vec<DecodedFrame>>> {
        let Some(body) = read_packet(&mut self.reader)? else {
            return Ok(None);
        };
        let raw = decompress(&body, self.header.compression)?;
        let (group, _): (FrameGroup, usize) =
            bincode::serde::decode_from_slice(&raw, media_decode_config())?;
        if group.first_frame != self.next_frame {
            return Err(ArchiveError::codec(format!(
                "{}: expected frame {}, packet starts at {}",
                self.path.display(),
                self.next_frame,
                group.first_frame
            )));
        }
        let mut frames = Vec::with_capacity(group.frames.len());
        for raw in group.frames {
            frames.push(DecodedFrame {
                index: self.next_frame,
                image: from_raw_pixels(raw, &self.header)?,
            });
            self.next_frame += 1;
        }
        Ok(Some(frames))
    }
}

impl Iterator for PacketReader {
    type Item = Result<DecodedFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(frame) = self.pending.next() {
                return Some(Ok(frame));
            }
            if self.done {
                return None;
            }
            match self.next_group() {
                Ok(Some(frames)) => self.pending = frames.into_iter(),
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Next packet body, or `None` at a clean end of stream.
fn read_packet<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_PACKET_BYTES {
        return Err(ArchiveError::codec(format!(
            "packet length {len} exceeds limit"
        )));
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .map_err(|_| ArchiveError::codec("truncated media packet"))?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CODEC_PROFILES, codec_profile};
    use image::Rgb;
    use tempfile::TempDir;

    fn params(name: &str) -> CodecParams {
        let mut params = CodecParams::from(codec_profile(name).unwrap());
        params.frame_width = 16;
        params.frame_height = 16;
        params
    }

    fn solid(shade: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb([shade, shade, shade])))
    }

    fn write_media(dir: &TempDir, params: &CodecParams, count: u8) -> PathBuf {
        let codec = PacketStreamCodec::new();
        let mut encoder = codec.encoder(params).unwrap();
        let mut bytes = Vec::new();
        for shade in 0..count {
            for packet in encoder.encode(&solid(shade * 10)).unwrap() {
                bytes.extend(packet);
            }
        }
        for packet in encoder.flush().unwrap() {
            bytes.extend(packet);
        }
        let path = dir.path().join(format!("{}.fvm", params.codec));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn every_profile_roundtrips_frames_in_order() {
        let dir = TempDir::new().unwrap();
        for profile in CODEC_PROFILES {
            let params = params(profile.name);
            let path = write_media(&dir, &params, 11);

            let frames: Vec<DecodedFrame> = PacketStreamCodec::new()
                .frames(&path)
                .unwrap()
                .collect::<Result<_>>()
                .unwrap();
            assert_eq!(frames.len(), 11, "codec {}", profile.name);
            for (i, frame) in frames.iter().enumerate() {
                assert_eq!(frame.index, i as u64);
                assert_eq!(frame.image.dimensions(), (16, 16));
                assert_eq!(frame.image.get_pixel(3, 3).0[0], i as u8 * 10);
            }
        }
    }

    #[test]
    fn fit_frame_resizes_and_converts() {
        let params = params("raw");
        let fitted = fit_frame(RgbImage::from_pixel(40, 40, Rgb([200, 200, 200])), &params);
        let gray = fitted.as_luma8().unwrap();
        assert_eq!(gray.dimensions(), (16, 16));
        assert_eq!(gray.get_pixel(0, 0).0, [200]);
    }

    #[test]
    fn stream_is_restartable() {
        let dir = TempDir::new().unwrap();
        let path = write_media(&dir, &params("lz4"), 3);
        let codec = PacketStreamCodec::new();
        assert_eq!(codec.frames(&path).unwrap().count(), 3);
        assert_eq!(codec.frames(&path).unwrap().count(), 3);
    }

    #[test]
    fn header_only_stream_has_no_frames() {
        let dir = TempDir::new().unwrap();
        let path = write_media(&dir, &params("zstd"), 0);
        let header = PacketStreamCodec::read_header(&path).unwrap();
        assert_eq!(header.fps, 30);
        assert_eq!(PacketStreamCodec::new().frames(&path).unwrap().count(), 0);
    }

    #[test]
    fn truncated_stream_reports_error() {
        let dir = TempDir::new().unwrap();
        let path = write_media(&dir, &params("raw"), 4);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

        let results: Vec<_> = PacketStreamCodec::new().frames(&path).unwrap().collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn garbage_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.fvm");
        std::fs::write(&path, b"\x04\x00\x00\x00junk").unwrap();
        assert!(PacketStreamCodec::new().frames(&path).is_err());
    }
}
