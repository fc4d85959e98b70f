use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// EBML element id the patch targets inside the WebM header.
pub const HEX_MARKER: [u8; 4] = [0x44, 0x89, 0x88, 0x40];

const REPLACEMENT: [u8; 2] = [0x00, 0x00];

#[derive(Debug, Error)]
pub enum PatchError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("replacement would exceed file bounds")]
    BoundsExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchReport {
    pub marker_found: bool,
    /// Byte offset of the marker's first occurrence, when found.
    pub offset: Option<usize>,
}

/// Overwrite the two bytes immediately following the first marker
/// occurrence with zeroes and write the buffer to `output`. When the marker
/// is absent the output is still written as a byte-for-byte copy.
pub fn patch_file(input: &Path, output: &Path) -> Result<PatchReport, PatchError> {
    let mut data = fs::read(input)?;
    let report = patch_bytes(&mut data)?;
    write_via_rename(output, &data)?;
    Ok(report)
}

fn patch_bytes(data: &mut [u8]) -> Result<PatchReport, PatchError> {
    let Some(pos) = data
        .windows(HEX_MARKER.len())
        .position(|window| window == HEX_MARKER)
    else {
        return Ok(PatchReport {
            marker_found: false,
            offset: None,
        });
    };
    let start = pos + HEX_MARKER.len();
    let end = start + REPLACEMENT.len();
    if end > data.len() {
        return Err(PatchError::BoundsExceeded);
    }
    data[start..end].copy_from_slice(&REPLACEMENT);
    Ok(PatchReport {
        marker_found: true,
        offset: Some(pos),
    })
}

/// Stage next to the destination, then rename over it, so readers never see
/// a half-written output.
fn write_via_rename(output: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = tmp_sibling(output);
    fs::write(&tmp, data)?;
    if let Err(err) = fs::rename(&tmp, output) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}

fn tmp_sibling(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    output.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(bytes: &[u8]) -> (Vec<u8>, PatchReport) {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.webm");
        let output = dir.path().join("in_hexedited.webm");
        fs::write(&input, bytes).unwrap();
        let report = patch_file(&input, &output).unwrap();
        (fs::read(&output).unwrap(), report)
    }

    #[test]
    fn zeroes_the_two_bytes_after_the_marker() {
        let mut bytes = vec![0xAAu8; 42];
        bytes.extend_from_slice(&HEX_MARKER);
        bytes.extend_from_slice(&[0x12, 0x34, 0x56, 0x78]);

        let (patched, report) = roundtrip(&bytes);
        assert!(report.marker_found);
        assert_eq!(report.offset, Some(42));
        assert_eq!(&patched[42..46], &HEX_MARKER);
        assert_eq!(&patched[46..48], &[0x00, 0x00]);
        // Everything else is untouched.
        assert_eq!(&patched[..42], &bytes[..42]);
        assert_eq!(&patched[48..], &bytes[48..]);
    }

    #[test]
    fn missing_marker_produces_an_identical_copy() {
        let bytes: Vec<u8> = (0u8..200).collect();
        let (patched, report) = roundtrip(&bytes);
        assert!(!report.marker_found);
        assert_eq!(report.offset, None);
        assert_eq!(patched, bytes);
    }

    #[test]
    fn only_the_first_occurrence_is_patched() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&HEX_MARKER);
        bytes.extend_from_slice(&[0xFF, 0xFF]);
        bytes.extend_from_slice(&HEX_MARKER);
        bytes.extend_from_slice(&[0xEE, 0xEE]);

        let (patched, report) = roundtrip(&bytes);
        assert_eq!(report.offset, Some(0));
        assert_eq!(&patched[4..6], &[0x00, 0x00]);
        assert_eq!(&patched[10..12], &[0xEE, 0xEE]);
    }

    #[test]
    fn marker_at_the_tail_without_room_is_out_of_bounds() {
        let mut bytes = vec![0x00u8; 8];
        bytes.extend_from_slice(&HEX_MARKER);
        bytes.push(0x55); // room for only one replacement byte

        let mut data = bytes.clone();
        assert!(matches!(
            patch_bytes(&mut data),
            Err(PatchError::BoundsExceeded)
        ));

        // With exactly two bytes after the marker the patch fits.
        bytes.push(0x66);
        let mut data = bytes.clone();
        let report = patch_bytes(&mut data).unwrap();
        assert_eq!(report.offset, Some(8));
        assert_eq!(&data[12..14], &[0x00, 0x00]);
    }
}
