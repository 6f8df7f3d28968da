//! Firmware images and version checking
//!
//! This module provides types for:
//! - Firmware images (raw bytes, signed flag and target sub-system)
//! - Product lines that ship a bundled firmware image
//! - Dotted numeric version comparison (`5.13.0.50`)
//! - Deciding whether an available release is an upgrade

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to read firmware file")]
    Empty(PathBuf),
    #[error("Invalid firmware version: {0}")]
    InvalidVersion(String),
    #[error("Unknown product line: {0}")]
    UnknownProductLine(String),
}

/// Product family a bundled firmware image is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductLine {
    D400,
}

impl FromStr for ProductLine {
    type Err = FirmwareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "D400" => Ok(ProductLine::D400),
            other => Err(FirmwareError::UnknownProductLine(other.to_string())),
        }
    }
}

/// Sub-system a firmware image is written to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareTarget {
    /// Primary device firmware
    Main,
    /// Safety co-processor firmware
    SafetyMcu,
}

impl std::fmt::Display for FirmwareTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FirmwareTarget::Main => write!(f, "main"),
            FirmwareTarget::SafetyMcu => write!(f, "safety-mcu"),
        }
    }
}

/// An opaque firmware image ready to be flashed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    signed: bool,
    target: FirmwareTarget,
}

impl FirmwareImage {
    pub fn new(data: Vec<u8>, signed: bool, target: FirmwareTarget) -> Self {
        Self {
            data,
            signed,
            target,
        }
    }

    /// Load an image from disk; an empty file is rejected
    pub fn from_file(
        path: &Path,
        signed: bool,
        target: FirmwareTarget,
    ) -> Result<Self, FirmwareError> {
        let data = std::fs::read(path)?;
        if data.is_empty() {
            return Err(FirmwareError::Empty(path.to_path_buf()));
        }
        Ok(Self::new(data, signed, target))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the device verifies this image, requiring the recovery-mode path
    pub fn is_signed(&self) -> bool {
        self.signed
    }

    pub fn target(&self) -> FirmwareTarget {
        self.target
    }

    /// SHA256 of the image as a hex string
    pub fn sha256_hex(&self) -> String {
        sha256_hex(&self.data)
    }
}

/// Compute SHA256 hash of data and return as hex string
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Dotted numeric firmware version; missing trailing parts compare as zero
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion(Vec<u32>);

impl FromStr for FirmwareVersion {
    type Err = FirmwareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        if trimmed.is_empty() {
            return Err(FirmwareError::InvalidVersion(s.to_string()));
        }

        trimmed
            .split('.')
            .map(|part| part.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
            .map_err(|_| FirmwareError::InvalidVersion(s.to_string()))
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FirmwareVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// True when both versions are known and `current` is older than `available`
pub fn is_upgradeable(current: &str, available: &str) -> bool {
    if current.is_empty() || available.is_empty() {
        return false;
    }
    match (
        current.parse::<FirmwareVersion>(),
        available.parse::<FirmwareVersion>(),
    ) {
        (Ok(current), Ok(available)) => current < available,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_version_ordering() {
        let a: FirmwareVersion = "5.13.0.50".parse().unwrap();
        let b: FirmwareVersion = "5.15.1.0".parse().unwrap();
        assert!(a < b);
        assert_eq!(b.to_string(), "5.15.1.0");
    }

    #[test]
    fn test_version_trailing_zeros_are_equal() {
        let a: FirmwareVersion = "5.13".parse().unwrap();
        let b: FirmwareVersion = "v5.13.0.0".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_version_rejects_garbage() {
        assert!("5.x.1".parse::<FirmwareVersion>().is_err());
        assert!("".parse::<FirmwareVersion>().is_err());
    }

    #[test]
    fn test_is_upgradeable() {
        assert!(is_upgradeable("5.13.0.50", "5.16.0.1"));
        assert!(!is_upgradeable("5.16.0.1", "5.16.0.1"));
        assert!(!is_upgradeable("5.17.0.0", "5.16.0.1"));
        assert!(!is_upgradeable("", "5.16.0.1"));
        assert!(!is_upgradeable("5.13.0.50", ""));
        assert!(!is_upgradeable("not-a-version", "5.16.0.1"));
    }

    #[test]
    fn test_product_line_parsing() {
        assert_eq!("D400".parse::<ProductLine>().unwrap(), ProductLine::D400);
        let err = "L500".parse::<ProductLine>().unwrap_err();
        assert_eq!(err.to_string(), "Unknown product line: L500");
    }

    #[test]
    fn test_image_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("fw.bin");
        std::fs::write(&path, [1u8, 2, 3, 4]).unwrap();

        let image = FirmwareImage::from_file(&path, true, FirmwareTarget::Main).unwrap();
        assert_eq!(image.bytes(), &[1, 2, 3, 4]);
        assert!(image.is_signed());
        assert_eq!(image.target(), FirmwareTarget::Main);
    }

    #[test]
    fn test_empty_image_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("empty.bin");
        std::fs::write(&path, []).unwrap();

        let err = FirmwareImage::from_file(&path, false, FirmwareTarget::Main).unwrap_err();
        assert_eq!(err.to_string(), "Failed to read firmware file");
    }

    #[test]
    fn test_sha256() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
