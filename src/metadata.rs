// src/metadata.rs
//
// Reads and writes the caption stored in a JPEG's EXIF UserComment field.

use crate::error::StoreError;
use crate::storage::FormatClass;
use exif::experimental::Writer;
use exif::{Exif, Field, In, Reader, Tag, Value};
use std::fs::{self, File};
use std::io::{BufReader, Cursor, Write};
use std::path::Path;
use tempfile::NamedTempFile;

const UNICODE_PREFIX: &[u8; 8] = b"UNICODE\0";
const EXIF_HEADER: &[u8; 6] = b"Exif\0\0";

const MARKER_SOI: u8 = 0xD8;
const MARKER_EOI: u8 = 0xD9;
const MARKER_SOS: u8 = 0xDA;
const MARKER_APP0: u8 = 0xE0;
const MARKER_APP1: u8 = 0xE1;

/// Whether `path` already carries a non-empty UserComment.
///
/// Unreadable or tag-less files count as not described.
pub fn has_description(path: &Path) -> bool {
    if !FormatClass::of(path).is_tag_capable() {
        return false;
    }
    match read_user_comment(path) {
        Ok(Some(raw)) => !raw.is_empty(),
        Ok(None) => false,
        Err(e) => {
            log::debug!("Could not read EXIF from {:?}: {}", path, e);
            false
        }
    }
}

/// Stores `description` in the file's UserComment field.
///
/// Returns `Ok(false)` without touching the file when the format cannot
/// carry the tag. Other EXIF fields are kept, including the thumbnail IFD
/// and its embedded JPEG.
pub fn write_description(path: &Path, description: &str) -> Result<bool, StoreError> {
    if !FormatClass::of(path).is_tag_capable() {
        log::trace!("{:?} cannot carry an EXIF description.", path);
        return Ok(false);
    }

    let data = fs::read(path)?;
    let jpeg = Jpeg::parse(&data)?;

    let existing = jpeg.exif_payload().and_then(|tiff| {
        Reader::new()
            .read_raw(tiff.to_vec())
            .map_err(|e| log::warn!("Replacing unreadable EXIF block in {:?}: {}", path, e))
            .ok()
    });

    let comment = Field {
        tag: Tag::UserComment,
        ifd_num: In::PRIMARY,
        value: Value::Undefined(encode_user_comment(description), 0),
    };
    let mut writer = Writer::new();
    if let Some(exif) = &existing {
        for field in exif.fields().filter(|f| is_carried_over(f)) {
            writer.push_field(field);
        }
        if let Some(thumbnail) = thumbnail_jpeg(exif) {
            writer.set_jpeg(thumbnail, In::THUMBNAIL);
        }
    }
    writer.push_field(&comment);

    let mut tiff = Cursor::new(Vec::new());
    writer.write(&mut tiff, false)?;

    let output = jpeg.with_exif(&tiff.into_inner())?;
    replace_file(path, &output)?;
    log::debug!("Wrote EXIF description to {:?}", path);
    Ok(true)
}

fn read_user_comment(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    let file = File::open(path)?;
    let exif = Reader::new().read_from_container(&mut BufReader::new(file))?;
    Ok(exif
        .get_field(Tag::UserComment, In::PRIMARY)
        .map(|field| match &field.value {
            Value::Undefined(raw, _) => raw.clone(),
            Value::Ascii(parts) => parts.concat(),
            _ => Vec::new(),
        }))
}

fn is_carried_over(field: &Field) -> bool {
    if matches!(field.value, Value::Unknown(..)) {
        return false;
    }
    match field.ifd_num {
        In::PRIMARY => field.tag != Tag::UserComment,
        // The thumbnail location is re-synthesised by the writer.
        In::THUMBNAIL => !matches!(
            field.tag,
            Tag::JPEGInterchangeFormat | Tag::JPEGInterchangeFormatLength
        ),
        _ => false,
    }
}

/// The embedded thumbnail JPEG, sliced out of the TIFF buffer at the
/// offset the thumbnail IFD points to.
fn thumbnail_jpeg(exif: &Exif) -> Option<&[u8]> {
    let offset = exif
        .get_field(Tag::JPEGInterchangeFormat, In::THUMBNAIL)?
        .value
        .get_uint(0)?;
    let len = exif
        .get_field(Tag::JPEGInterchangeFormatLength, In::THUMBNAIL)?
        .value
        .get_uint(0)?;
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    let thumbnail = exif.buf().get(start..end);
    if thumbnail.is_none() {
        log::warn!("Dropping thumbnail with out-of-bounds offset {}", offset);
    }
    thumbnail
}

fn encode_user_comment(text: &str) -> Vec<u8> {
    let mut raw = UNICODE_PREFIX.to_vec();
    raw.extend(text.encode_utf16().flat_map(u16::to_be_bytes));
    raw
}

/// Writes `contents` to a sibling temp file and renames it over `path`,
/// keeping the original permissions.
fn replace_file(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let permissions = fs::metadata(path)?.permissions();

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    fs::set_permissions(tmp.path(), permissions)?;
    tmp.persist(path)?;
    Ok(())
}

/// A JPEG split into its header segments and the entropy-coded remainder.
struct Jpeg<'a> {
    segments: Vec<Segment<'a>>,
    tail: &'a [u8],
}

struct Segment<'a> {
    marker: u8,
    raw: &'a [u8],
    payload: &'a [u8],
}

impl Segment<'_> {
    fn is_exif(&self) -> bool {
        self.marker == MARKER_APP1 && self.payload.starts_with(EXIF_HEADER)
    }
}

impl<'a> Jpeg<'a> {
    fn parse(data: &'a [u8]) -> Result<Self, StoreError> {
        if data.len() < 4 || data[0] != 0xFF || data[1] != MARKER_SOI {
            return Err(StoreError::MalformedJpeg("missing start-of-image marker"));
        }

        let mut segments = Vec::new();
        let mut pos = 2;
        loop {
            if pos >= data.len() {
                return Err(StoreError::MalformedJpeg("no image data"));
            }
            if data[pos] != 0xFF {
                return Err(StoreError::MalformedJpeg("expected segment marker"));
            }
            let mut m = pos + 1;
            while m < data.len() && data[m] == 0xFF {
                m += 1;
            }
            let Some(&marker) = data.get(m) else {
                return Err(StoreError::MalformedJpeg("truncated marker"));
            };

            if marker == MARKER_SOS || marker == MARKER_EOI {
                return Ok(Jpeg {
                    segments,
                    tail: &data[pos..],
                });
            }
            // Standalone markers carry no length field.
            if (0xD0..=0xD7).contains(&marker) || marker == 0x01 {
                segments.push(Segment {
                    marker,
                    raw: &data[pos..=m],
                    payload: &[],
                });
                pos = m + 1;
                continue;
            }

            if m + 2 >= data.len() {
                return Err(StoreError::MalformedJpeg("truncated segment length"));
            }
            let len = usize::from(u16::from_be_bytes([data[m + 1], data[m + 2]]));
            let end = m + 1 + len;
            if len < 2 || end > data.len() {
                return Err(StoreError::MalformedJpeg("segment length out of bounds"));
            }
            segments.push(Segment {
                marker,
                raw: &data[pos..end],
                payload: &data[m + 3..end],
            });
            pos = end;
        }
    }

    /// The TIFF structure of the first Exif APP1 segment.
    fn exif_payload(&self) -> Option<&'a [u8]> {
        self.segments
            .iter()
            .find(|s| s.is_exif())
            .map(|s| &s.payload[EXIF_HEADER.len()..])
    }

    /// Re-assembles the file with every Exif segment replaced by one holding
    /// `tiff`, placed after a leading APP0 segment if there is one.
    fn with_exif(&self, tiff: &[u8]) -> Result<Vec<u8>, StoreError> {
        let seg_len = 2 + EXIF_HEADER.len() + tiff.len();
        let seg_len = u16::try_from(seg_len).map_err(|_| StoreError::ExifTooLarge(seg_len))?;

        let kept: Vec<&Segment> = self.segments.iter().filter(|s| !s.is_exif()).collect();
        let insert_at = match kept.first() {
            Some(first) if first.marker == MARKER_APP0 => 1,
            _ => 0,
        };

        let mut out = Vec::with_capacity(
            4 + usize::from(seg_len)
                + kept.iter().map(|s| s.raw.len()).sum::<usize>()
                + self.tail.len(),
        );
        out.extend_from_slice(&[0xFF, MARKER_SOI]);
        for (i, segment) in kept.iter().enumerate() {
            if i == insert_at {
                push_exif_segment(&mut out, seg_len, tiff);
            }
            out.extend_from_slice(segment.raw);
        }
        if insert_at >= kept.len() {
            push_exif_segment(&mut out, seg_len, tiff);
        }
        out.extend_from_slice(self.tail);
        Ok(out)
    }
}

fn push_exif_segment(out: &mut Vec<u8>, seg_len: u16, tiff: &[u8]) {
    out.extend_from_slice(&[0xFF, MARKER_APP1]);
    out.extend_from_slice(&seg_len.to_be_bytes());
    out.extend_from_slice(EXIF_HEADER);
    out.extend_from_slice(tiff);
}
