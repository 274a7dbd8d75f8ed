//! The hasher façade: a streaming accumulator that folds labeled segments
//! into an opaque 32-byte digest. Labels and contents are length-prefixed
//! so that two distinct input sequences cannot collide by concatenation.

use crate::prelude::*;
use ring::digest;
use std::fs::File;
use std::io::Read;

/// Mixed into the first segment of every digest. Bump this whenever the
/// fold layout or any wrapper's relevant-argument policy changes: old cache
/// entries must stop matching.
pub const FORMAT_TAG: &str = "cachet-fingerprint-v1";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr,
)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", data_encoding::BASE64URL_NOPAD.encode(&self.0))
    }
}

impl TryFrom<&str> for Fingerprint {
    type Error = eyre::Report;

    fn try_from(s: &str) -> Result<Fingerprint> {
        let raw = data_encoding::BASE64URL_NOPAD.decode(s.as_bytes())?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| eyre!("fingerprint must be 32 bytes, got {}", raw.len()))?;
        Ok(Fingerprint(bytes))
    }
}

try_from_str_boilerplate!(Fingerprint);

pub struct FingerprintHasher {
    ctx: digest::Context,
}

impl FingerprintHasher {
    pub fn new() -> FingerprintHasher {
        let mut hasher = FingerprintHasher {
            ctx: digest::Context::new(&digest::SHA256),
        };
        hasher.segment("format", FORMAT_TAG.as_bytes());
        hasher
    }

    pub fn segment(&mut self, label: &str, data: &[u8]) {
        self.ctx.update(&(label.len() as u64).to_le_bytes());
        self.ctx.update(label.as_bytes());
        self.ctx.update(&(data.len() as u64).to_le_bytes());
        self.ctx.update(data);
    }

    pub fn finish(self) -> Fingerprint {
        let digest = self.ctx.finish();
        // unwrap rationale: SHA256 output is always 32 bytes
        Fingerprint(digest.as_ref().try_into().unwrap())
    }
}

/// Content hash of an in-memory blob (preprocessed sources).
pub fn bytes_digest(data: &[u8]) -> [u8; 32] {
    // unwrap rationale: SHA256 output is always 32 bytes
    digest::digest(&digest::SHA256, data)
        .as_ref()
        .try_into()
        .unwrap()
}

/// Content hash of a file, streamed so large inputs don't get slurped.
pub fn file_digest(path: &Path) -> Result<[u8; 32], WrapperError> {
    let mut file = File::open(path).map_err(|e| WrapperError::io("open", path, e))?;
    let mut ctx = digest::Context::new(&digest::SHA256);
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| WrapperError::io("read", path, e))?;
        if n == 0 {
            break;
        }
        ctx.update(&buf[..n]);
    }
    // unwrap rationale: SHA256 output is always 32 bytes
    Ok(ctx.finish().as_ref().try_into().unwrap())
}

#[cfg(test)]
mod test {
    use super::*;

    fn fold(segments: &[(&str, &[u8])]) -> Fingerprint {
        let mut hasher = FingerprintHasher::new();
        for (label, data) in segments {
            hasher.segment(label, data);
        }
        hasher.finish()
    }

    #[test]
    fn test_deterministic() {
        let segments: &[(&str, &[u8])] = &[("arg", b"-c"), ("input", b"abc")];
        assert_eq!(fold(segments), fold(segments));
    }

    #[test]
    fn test_no_concatenation_aliasing() {
        // shifting bytes between adjacent segments must change the digest
        assert_ne!(
            fold(&[("arg", b"ab"), ("arg", b"c")]),
            fold(&[("arg", b"a"), ("arg", b"bc")]),
        );
        // ...and so must shifting bytes between a label and its content
        assert_ne!(fold(&[("argx", b"y")]), fold(&[("arg", b"xy")]));
        // ...and segment count
        assert_ne!(fold(&[("arg", b"")]), fold(&[("arg", b""), ("arg", b"")]));
    }

    #[test]
    fn test_display_round_trip() {
        let fp = fold(&[("arg", b"-c")]);
        let displayed = fp.to_string();
        assert_eq!(displayed.len(), 43);
        assert_eq!(displayed.parse::<Fingerprint>().unwrap(), fp);
        assert!("not!base64".parse::<Fingerprint>().is_err());
        assert!("c2hvcnQ".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_file_digest_tracks_content() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("input.c");
        std::fs::write(&path, b"int main() { return 0; }")?;
        let before = file_digest(&path)?;
        assert_eq!(before, file_digest(&path)?);
        std::fs::write(&path, b"int main() { return 1; }")?;
        assert_ne!(before, file_digest(&path)?);
        assert!(matches!(
            file_digest(&tmp.path().join("missing.c")),
            Err(WrapperError::Io { .. })
        ));
        Ok(())
    }
}
