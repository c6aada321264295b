//! Reading delimited text files from munger and jurisdiction directories.

use std::path::Path;

use encoding_rs::{Encoding, UTF_8};
use serde::de::DeserializeOwned;
use tokio::fs;

use crate::error::{LoadError, LoadResult};

/// Encoding for a label such as `utf-8` or `iso-8859-1`.
pub fn encoding_for_label(label: &str) -> Option<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
}

/// Read a whole file and decode it; malformed sequences become U+FFFD.
pub async fn read_decoded(path: &Path, encoding: &'static Encoding) -> LoadResult<String> {
    let bytes = fs::read(path)
        .await
        .map_err(|e| LoadError::io(path.display().to_string(), e))?;
    let (text, _, had_errors) = encoding.decode(&bytes);
    if had_errors {
        tracing::warn!(path = %path.display(), encoding = encoding.name(), "replaced undecodable bytes");
    }
    Ok(text.into_owned())
}

pub async fn read_utf8(path: &Path) -> LoadResult<String> {
    read_decoded(path, UTF_8).await
}

fn reader(content: &str, delimiter: u8, has_headers: bool) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(has_headers)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes())
}

/// Header names plus raw records of a delimited file with one header line.
pub fn read_records(
    content: &str,
    delimiter: u8,
    path: &str,
) -> LoadResult<(Vec<String>, Vec<Vec<String>>)> {
    let mut rdr = reader(content, delimiter, true);
    let headers = rdr
        .headers()
        .map_err(|e| LoadError::csv(path, e))?
        .iter()
        .map(str::to_string)
        .collect();
    let mut records = Vec::new();
    for record in rdr.records() {
        let record = record.map_err(|e| LoadError::csv(path, e))?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        records.push(record.iter().map(str::to_string).collect());
    }
    Ok((headers, records))
}

/// All lines of a delimited file, header lines included.
pub fn read_all_lines(content: &str, delimiter: u8, path: &str) -> LoadResult<Vec<Vec<String>>> {
    let mut rdr = reader(content, delimiter, false);
    rdr.records()
        .map(|r| {
            r.map(|rec| rec.iter().map(str::to_string).collect())
                .map_err(|e| LoadError::csv(path, e))
        })
        .collect()
}

/// Deserialize every row of a tab-separated file with a header line.
pub fn read_tsv_as<T: DeserializeOwned>(content: &str, path: &str) -> LoadResult<Vec<T>> {
    reader(content, b'\t', true)
        .deserialize()
        .map(|r| r.map_err(|e| LoadError::csv(path, e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_resolve() {
        assert_eq!(encoding_for_label("utf-8").unwrap().name(), "UTF-8");
        // WHATWG maps latin-1 labels onto windows-1252
        assert_eq!(
            encoding_for_label("iso-8859-1").unwrap().name(),
            "windows-1252"
        );
        assert!(encoding_for_label("klingon").is_none());
    }

    #[test]
    fn test_read_records_skips_blank_lines() {
        let (h, r) = read_records("a\tb\n1\t2\n\t\n3\t4\n", b'\t', "t").unwrap();
        assert_eq!(h, vec!["a", "b"]);
        assert_eq!(r.len(), 2);
    }
}
