//! OpenCV video writer producing the processed batch artifact.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use opencv::{
    core::{Mat, Mat_AUTO_STEP, CV_8UC3},
    prelude::*,
    videoio::{VideoWriter, VideoWriterTrait},
};

use crate::Frame;

/// Owns the output container handle; released on drop or via [`finish`].
///
/// [`finish`]: VideoArtifactWriter::finish
pub struct VideoArtifactWriter {
    writer: Option<VideoWriter>,
    path: PathBuf,
    size: (i32, i32),
}

impl VideoArtifactWriter {
    pub fn create(path: &Path, size: (i32, i32), fps: f64) -> Result<Self> {
        let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v').map_err(|err| anyhow!(err))?;
        let writer = VideoWriter::new(
            &path.to_string_lossy(),
            fourcc,
            fps,
            opencv::core::Size {
                width: size.0,
                height: size.1,
            },
            true,
        )
        .with_context(|| format!("failed to open video writer at {}", path.display()))?;
        if !writer.is_opened().unwrap_or(false) {
            anyhow::bail!("video writer rejected {}", path.display());
        }
        Ok(Self {
            writer: Some(writer),
            path: path.to_path_buf(),
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one BGR8 frame. The caller resizes to the writer size first.
    pub fn write_bgr(&mut self, frame: &Frame) -> Result<()> {
        if (frame.width, frame.height) != self.size {
            anyhow::bail!(
                "frame {}x{} does not match writer {}x{}",
                frame.width,
                frame.height,
                self.size.0,
                self.size.1
            );
        }
        let expected = Frame::expected_len(frame.width, frame.height);
        if frame.data.len() != expected {
            anyhow::bail!("malformed frame buffer ({} bytes)", frame.data.len());
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("writer already finished"))?;
        // SAFETY: the Mat borrows `frame.data` only for the duration of the
        // write call below; the buffer outlives it.
        let mat = unsafe {
            Mat::new_rows_cols_with_data_unsafe(
                frame.height,
                frame.width,
                CV_8UC3,
                frame.data.as_ptr() as *mut std::ffi::c_void,
                Mat_AUTO_STEP,
            )
        }
        .map_err(|err| anyhow!(err))?;
        writer.write(&mat).map_err(|err| anyhow!(err))?;
        Ok(())
    }

    /// Flush and release the container handle.
    pub fn finish(mut self) -> Result<PathBuf> {
        if let Some(mut writer) = self.writer.take() {
            writer.release().map_err(|err| anyhow!(err))?;
        }
        Ok(self.path.clone())
    }
}

impl Drop for VideoArtifactWriter {
    fn drop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.release();
        }
    }
}
