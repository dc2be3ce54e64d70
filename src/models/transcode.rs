//! Transcode jobs: one run of the external segmenter against one file.

use serde::Serialize;
use std::path::{Path, PathBuf};

/// Name of the playlist the segmenter writes into the output directory.
pub const MANIFEST_FILE_NAME: &str = "index.m3u8";

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Serialize, Clone, Debug)]
pub struct TranscodeJob {
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub status: TranscodeStatus,
}

/// Stream directory for an assembled file: next to it, named after it with
/// the extension stripped. An input without extension gets an `_hls` suffix
/// so the two never collide.
pub fn output_dir_for(input_path: &Path) -> PathBuf {
    if input_path.extension().is_some() {
        input_path.with_extension("")
    } else {
        let mut name = input_path.as_os_str().to_owned();
        name.push("_hls");
        PathBuf::from(name)
    }
}

impl TranscodeJob {
    pub fn for_input(input_path: &Path) -> Self {
        Self {
            input_path: input_path.to_path_buf(),
            output_dir: output_dir_for(input_path),
            status: TranscodeStatus::Pending,
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(MANIFEST_FILE_NAME)
    }
}
