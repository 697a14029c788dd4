use std::fmt;

const PREVIEW_BYTES: usize = 8;

/// Truncated hex rendering of a byte buffer, used wherever key material,
/// IVs or nonces could otherwise end up in logs.
pub(crate) struct BytesPreview<'a>(pub(crate) &'a [u8]);

impl fmt::Display for BytesPreview<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = self.0.get(..PREVIEW_BYTES).unwrap_or(self.0);
        write!(f, "{}", hex::encode(shown))?;
        if self.0.len() > PREVIEW_BYTES {
            write!(f, "..")?;
        }
        write!(f, " ({} bytes)", self.0.len())
    }
}

impl fmt::Debug for BytesPreview<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Blank-padded fixed-width PKCS#11 strings (labels, manufacturer ids, ...).
pub(crate) fn padded_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim_end().to_owned()
}
