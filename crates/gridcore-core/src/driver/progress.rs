//! Managed-host progress file.
//!
//! Fleet hosts read `./<wu_dir>/wuinfo_01.dat` to display work-unit
//! progress. The layout is fixed and little-endian:
//!
//! ```text
//! u32  unit_type = 101
//! char name[80]
//! u32  frames_total = steps_per_frame
//! u32  frames_done  = current_step % steps_per_frame
//! u32  frame_steps  = 1
//! char reserved[416]
//! ```

use std::fs;
use std::io;
use std::path::Path;

/// Work-unit type tag expected by fleet hosts.
const UNIT_TYPE: u32 = 101;

/// Display name embedded in the progress record.
const UNIT_NAME: &str = "gridcore";

/// Progress file name within the work-unit directory.
const PROGRESS_FILE: &str = "wuinfo_01.dat";

/// Serializes one progress record.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn encode_progress(steps_per_frame: u64, current_step: u64) -> Vec<u8> {
    let mut record = Vec::with_capacity(512);
    record.extend_from_slice(&UNIT_TYPE.to_le_bytes());
    let mut name = [0u8; 80];
    let bytes = UNIT_NAME.as_bytes();
    name[..bytes.len()].copy_from_slice(bytes);
    record.extend_from_slice(&name);
    record.extend_from_slice(&(steps_per_frame as u32).to_le_bytes());
    record.extend_from_slice(&((current_step % steps_per_frame) as u32).to_le_bytes());
    record.extend_from_slice(&1u32.to_le_bytes());
    record.extend_from_slice(&[0u8; 416]);
    record
}

/// Writes the progress record into the work-unit directory.
pub(crate) fn write_progress_file(
    wu_dir: &Path,
    steps_per_frame: u64,
    current_step: u64,
) -> io::Result<()> {
    fs::write(
        wu_dir.join(PROGRESS_FILE),
        encode_progress(steps_per_frame, current_step),
    )
}
