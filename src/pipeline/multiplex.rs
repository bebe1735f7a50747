//! `multipart/x-mixed-replace` framing for encoded frames.

/// Part delimiter, without the leading dashes.
pub const BOUNDARY: &str = "frame";
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
pub const PART_CONTENT_TYPE: &str = "image/jpeg";

/// `--frame\r\nContent-Type: image/jpeg\r\n\r\n<bytes>\r\n`
pub fn frame_chunk(jpeg: &[u8]) -> Vec<u8> {
    let header = format!("--{}\r\nContent-Type: {}\r\n\r\n", BOUNDARY, PART_CONTENT_TYPE);
    let mut chunk = Vec::with_capacity(header.len() + jpeg.len() + 2);
    chunk.extend_from_slice(header.as_bytes());
    chunk.extend_from_slice(jpeg);
    chunk.extend_from_slice(b"\r\n");
    chunk
}

/// Split one chunk back into its body. Returns `None` for anything not
/// produced by `frame_chunk`.
pub fn chunk_body(chunk: &[u8]) -> Option<&[u8]> {
    let header = format!("--{}\r\nContent-Type: {}\r\n\r\n", BOUNDARY, PART_CONTENT_TYPE);
    chunk
        .strip_prefix(header.as_bytes())
        .and_then(|rest| rest.strip_suffix(b"\r\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_layout() {
        let chunk = frame_chunk(&[0xFF, 0xD8, 0x01]);
        let mut expected = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        expected.extend_from_slice(&[0xFF, 0xD8, 0x01]);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(chunk, expected);
        assert_eq!(chunk_body(&chunk), Some(&[0xFF, 0xD8, 0x01][..]));
    }

    #[test]
    fn foreign_bytes_are_not_a_chunk() {
        assert_eq!(chunk_body(b"hello"), None);
    }

    #[test]
    fn content_type_names_the_boundary() {
        assert!(MULTIPART_CONTENT_TYPE.ends_with(&format!("boundary={}", BOUNDARY)));
    }
}
