use crate::dedupfs_lib::errors::Result;
use crate::dedupfs_lib::{BAK_KEY_PREFIX, DATA_KEY_PREFIX, SEQNO_KEY_PREFIX};
use chrono::Utc;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use lazy_static::lazy_static;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::PathBuf;

lazy_static! {
    /// Default directory for metadata and block caches, `~/.s3ql`.
    pub static ref DEFAULT_CACHEDIR: PathBuf = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".s3ql");
}

pub fn init_logs() {
    env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .try_init()
        .ok();
}

/// Current time as REAL seconds since the epoch.
pub fn now_ts() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6
}

pub fn sha256_bytes(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

pub fn data_key(obj_id: i64) -> String {
    format!("{}{}", DATA_KEY_PREFIX, obj_id)
}

pub fn seq_no_key(seq_no: u64) -> String {
    format!("{}{}", SEQNO_KEY_PREFIX, seq_no)
}

pub fn bak_key(generation: u32) -> String {
    format!("{}{}", BAK_KEY_PREFIX, generation)
}

/// Map a storage URL to a path-safe cache file stem.
pub fn escape_storage_url(url: &str) -> String {
    url.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_round_trip() -> Result<()> {
        let data = b"hello hello hello hello".repeat(100);
        let packed = compress(&data)?;
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed)?, data);
        Ok(())
    }

    #[test]
    fn hash_is_sha256() {
        // sha256("") well-known value
        assert_eq!(
            hex::encode(sha256_bytes(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn key_builders() {
        assert_eq!(data_key(42), "s3ql_data_42");
        assert_eq!(seq_no_key(7), "s3ql_seq_no_7");
        assert_eq!(bak_key(0), "s3ql_metadata_bak_0");
    }

    #[test]
    fn url_escaping() {
        assert_eq!(escape_storage_url("local:///var/store"), "local____var_store");
    }
}
