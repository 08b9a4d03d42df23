//! Reading built wheels: digests and the metadata.json document.

use std::io::{Cursor, Read};

use md5::{Digest, Md5};
use thiserror::Error;

use wheelsmith_types::WheelMetadata;

#[derive(Debug, Error)]
pub enum WheelError {
    #[error("the produced wheel is not a valid zip archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("malformed metadata.json in wheel: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub(crate) fn md5_hex(contents: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(contents);
    format!("{:x}", hasher.finalize())
}

/// Pull `<dist>.dist-info/metadata.json` out of a wheel, if present.
pub(crate) fn extract_wheel_metadata(contents: &[u8]) -> Result<Option<WheelMetadata>, WheelError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(contents))?;
    let member = archive
        .file_names()
        .find(|name| {
            let mut parts = name.split('/');
            matches!(
                (parts.next(), parts.next(), parts.next()),
                (Some(dir), Some("metadata.json"), None) if dir.ends_with(".dist-info")
            )
        })
        .map(ToString::to_string);
    let Some(member) = member else {
        return Ok(None);
    };
    let mut raw = String::new();
    archive.by_name(&member)?.read_to_string(&mut raw)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

#[cfg(test)]
pub(crate) fn fake_wheel(dist_info: &str, metadata: &serde_json::Value) -> Vec<u8> {
    use std::io::Write;

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    writer
        .start_file(format!("{dist_info}.dist-info/metadata.json"), options)
        .unwrap();
    writer.write_all(metadata.to_string().as_bytes()).unwrap();
    writer.start_file(format!("{dist_info}.dist-info/RECORD"), options).unwrap();
    writer.write_all(b"").unwrap();
    writer.finish().unwrap().into_inner()
}
