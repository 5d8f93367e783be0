use std::path::Path;

use log::debug;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use super::fetcher::FetchError;

/// Expectations for one downloaded file.
#[derive(Debug, Clone, Copy, Default)]
pub struct Expectation<'a> {
    pub min_size: u64,
    pub exact_size: Option<u64>,
    pub sha256: Option<&'a str>,
}

/// Check size bounds, then the digest when one is known.
///
/// `label` names the artifact in error messages (the final file name,
/// since `path` is usually the `.partial` sibling).
pub async fn validate_file(
    path: &Path,
    label: &str,
    expect: Expectation<'_>,
) -> Result<(), FetchError> {
    let actual = tokio::fs::metadata(path).await?.len();

    if actual < expect.min_size {
        return Err(FetchError::TooSmall {
            file: label.to_string(),
            actual,
            minimum: expect.min_size,
        });
    }
    if let Some(expected) = expect.exact_size {
        if actual != expected {
            return Err(FetchError::SizeMismatch {
                file: label.to_string(),
                expected,
                actual,
            });
        }
    }
    if let Some(expected) = expect.sha256 {
        verify_checksum(path, label, expected).await?;
    }

    debug!("Validated {} ({} bytes)", label, actual);
    Ok(())
}

/// Verify SHA-256 checksum of a downloaded file.
pub async fn verify_checksum(
    file_path: &Path,
    label: &str,
    expected_hash: &str,
) -> Result<(), FetchError> {
    let computed_hash = sha256_file(file_path).await?;

    if !computed_hash.eq_ignore_ascii_case(expected_hash) {
        return Err(FetchError::ChecksumMismatch {
            file: label.to_string(),
            expected: expected_hash.to_string(),
            actual: computed_hash,
        });
    }

    Ok(())
}

/// Streaming hash; the file is never held in memory.
pub async fn sha256_file(file_path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(file_path).await?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024]; // 1MB buffer

    loop {
        let bytes_read = file.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("hello world")
    const HELLO_SHA: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[tokio::test]
    async fn validation_cases() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("file.partial");
        tokio::fs::write(&path, b"hello world").await.expect("write");
        let upper_sha = HELLO_SHA.to_ascii_uppercase();

        let test_cases = vec![
            ("no expectations", Expectation::default(), true),
            (
                "above minimum",
                Expectation {
                    min_size: 11,
                    ..Default::default()
                },
                true,
            ),
            (
                "below minimum",
                Expectation {
                    min_size: 12,
                    ..Default::default()
                },
                false,
            ),
            (
                "exact size mismatch",
                Expectation {
                    exact_size: Some(10),
                    ..Default::default()
                },
                false,
            ),
            (
                "matching digest, uppercase",
                Expectation {
                    sha256: Some(&upper_sha),
                    ..Default::default()
                },
                true,
            ),
            (
                "wrong digest",
                Expectation {
                    exact_size: Some(11),
                    sha256: Some("00"),
                    ..Default::default()
                },
                false,
            ),
        ];

        for (description, expect, should_pass) in test_cases {
            let result = validate_file(&path, "file", expect).await;
            assert_eq!(result.is_ok(), should_pass, "{}: {:?}", description, result);
        }
    }

    #[tokio::test]
    async fn checksum_mismatch_reports_both_digests() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vocab.txt");
        tokio::fs::write(&path, b"hello world").await.expect("write");

        match verify_checksum(&path, "vocab.txt", "deadbeef").await {
            Err(FetchError::ChecksumMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, "deadbeef");
                assert_eq!(actual, HELLO_SHA);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
