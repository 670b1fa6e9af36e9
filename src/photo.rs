//! Header sniffing for embedded contact photos.
//!
//! Only the container headers are read; pixel data is never decoded.

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Guesses the MIME type from magic bytes.
pub fn sniff_mime(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(&PNG_SIGNATURE) {
        Some("image/png")
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if data.starts_with(&[0xFF, 0xD8]) {
        Some("image/jpeg")
    } else {
        None
    }
}

/// Reads `(width, height)` from a PNG, GIF or JPEG header.
pub fn sniff_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    match sniff_mime(data)? {
        "image/png" => png_dimensions(data),
        "image/gif" => gif_dimensions(data),
        "image/jpeg" => jpeg_dimensions(data),
        _ => None,
    }
}

fn be_u16(data: &[u8], at: usize) -> Option<u16> {
    let bytes = data.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn png_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    // signature(8) + chunk length(4) + "IHDR"(4) + width(4) + height(4)
    if data.get(12..16)? != b"IHDR" {
        return None;
    }
    let w = data.get(16..20)?;
    let h = data.get(20..24)?;
    Some((
        u32::from_be_bytes([w[0], w[1], w[2], w[3]]),
        u32::from_be_bytes([h[0], h[1], h[2], h[3]]),
    ))
}

fn gif_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    let w = data.get(6..8)?;
    let h = data.get(8..10)?;
    Some((
        u32::from(u16::from_le_bytes([w[0], w[1]])),
        u32::from(u16::from_le_bytes([h[0], h[1]])),
    ))
}

fn jpeg_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    let mut pos = 2;
    while pos + 4 <= data.len() {
        if data[pos] != 0xFF {
            return None;
        }
        let marker = data[pos + 1];
        // fill bytes
        if marker == 0xFF {
            pos += 1;
            continue;
        }
        // standalone markers carry no length
        if (0xD0..=0xD9).contains(&marker) || marker == 0x01 {
            pos += 2;
            continue;
        }
        let length = usize::from(be_u16(data, pos + 2)?);
        let is_sof = (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            // length(2) precision(1) height(2) width(2)
            let height = be_u16(data, pos + 5)?;
            let width = be_u16(data, pos + 7)?;
            return Some((u32::from(width), u32::from(height)));
        }
        pos += 2 + length;
    }
    None
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Minimal PNG header (no pixel data) for the given size.
    pub fn png(width: u32, height: u32) -> Vec<u8> {
        let mut data = super::PNG_SIGNATURE.to_vec();
        data.extend_from_slice(&13u32.to_be_bytes());
        data.extend_from_slice(b"IHDR");
        data.extend_from_slice(&width.to_be_bytes());
        data.extend_from_slice(&height.to_be_bytes());
        data.extend_from_slice(&[8, 6, 0, 0, 0]);
        data
    }
}
