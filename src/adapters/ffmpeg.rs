//! Media processor over ffmpeg/ffprobe subprocesses.
//!
//! The core hands this adapter a declarative plan; every codec decision is
//! made here. Thread usage is capped to respect the host envelope.

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};

use super::run_command;
use crate::artifact::{CutawayManifest, EncodingPlan, SegmentPlan};
use crate::caps::{MediaInfo, MediaProcessor, SegmentFile};
use crate::error::CapError;
use crate::framing::{StyleTransition, TransitionEffect, TransitionKind};

/// ffmpeg/ffprobe subprocess adapter.
pub struct FfmpegProcessor {
    ffmpeg: String,
    ffprobe: String,
    /// Encoder thread cap.
    threads: u32,
}

impl FfmpegProcessor {
    #[must_use]
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>, threads: u32) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            threads: threads.max(1),
        }
    }

    /// Filter chain for one planned segment: crop, then scale to target.
    fn segment_filter(plan: &EncodingPlan, segment: &SegmentPlan) -> String {
        let crop = &segment.crop;
        let mut filters = vec![
            format!("crop={}:{}:{}:{}", crop.width, crop.height, crop.x, crop.y),
            format!("scale={}:{}", plan.target_width, plan.target_height),
        ];
        filters.extend(segment.filters.iter().cloned());
        filters.join(",")
    }

    async fn encode_segment(
        &self,
        plan: &EncodingPlan,
        segment: &SegmentPlan,
        source: &Utf8Path,
        out: &Utf8Path,
    ) -> Result<(), CapError> {
        let args = vec![
            "-y".to_string(),
            "-ss".to_string(),
            format!("{:.3}", segment.start),
            "-to".to_string(),
            format!("{:.3}", segment.end),
            "-i".to_string(),
            source.to_string(),
            "-vf".to_string(),
            Self::segment_filter(plan, segment),
            "-c:v".to_string(),
            plan.encode.codec.clone(),
            "-crf".to_string(),
            plan.encode.crf.to_string(),
            "-preset".to_string(),
            plan.encode.preset.clone(),
            "-b:a".to_string(),
            plan.encode.audio_bitrate.clone(),
            "-threads".to_string(),
            self.threads.to_string(),
            out.to_string(),
        ];
        let output = run_command("media", &self.ffmpeg, &args, None).await?;
        if !output.success() {
            return Err(CapError::transient(
                "media",
                format!(
                    "segment {} encode exited {}: {}",
                    segment.index,
                    output.status_code,
                    output.stderr_tail()
                ),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaProcessor for FfmpegProcessor {
    async fn probe(&self, path: &Utf8Path) -> Result<MediaInfo, CapError> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-select_streams".to_string(),
            "v:0".to_string(),
            "-show_entries".to_string(),
            "stream=width,height".to_string(),
            "-show_entries".to_string(),
            "format=duration,size".to_string(),
            "-of".to_string(),
            "json".to_string(),
            path.to_string(),
        ];
        let output = run_command("media", &self.ffprobe, &args, None).await?;
        if !output.success() {
            return Err(CapError::transient(
                "media",
                format!("ffprobe exited {}: {}", output.status_code, output.stderr_tail()),
            ));
        }
        let value: serde_json::Value = serde_json::from_str(&output.stdout)
            .map_err(|e| CapError::parse("media", format!("ffprobe output: {e}")))?;
        let stream = value
            .get("streams")
            .and_then(|s| s.get(0))
            .ok_or_else(|| CapError::parse("media", "ffprobe reported no video stream"))?;
        let format = value
            .get("format")
            .ok_or_else(|| CapError::parse("media", "ffprobe reported no format"))?;

        Ok(MediaInfo {
            width: stream.get("width").and_then(serde_json::Value::as_u64).unwrap_or(0) as u32,
            height: stream.get("height").and_then(serde_json::Value::as_u64).unwrap_or(0) as u32,
            duration_seconds: format
                .get("duration")
                .and_then(|d| d.as_str())
                .and_then(|d| d.parse().ok())
                .unwrap_or(0.0),
            size_bytes: format
                .get("size")
                .and_then(|s| s.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        })
    }

    async fn execute_plan(
        &self,
        plan: &EncodingPlan,
        source: &Utf8Path,
        out_dir: &Utf8Path,
    ) -> Result<Vec<SegmentFile>, CapError> {
        let mut segments = Vec::with_capacity(plan.segments.len());
        let mut failed: Vec<(u32, String)> = Vec::new();

        for segment in &plan.segments {
            let out = out_dir.join(format!("segment-{:03}.mp4", segment.index));
            match self.encode_segment(plan, segment, source, &out).await {
                Ok(()) => segments.push(SegmentFile {
                    index: segment.index,
                    path: out,
                    duration_seconds: (segment.end - segment.start).max(0.0),
                }),
                Err(e) => failed.push((segment.index, e.reason)),
            }
        }

        if !failed.is_empty() {
            return Err(CapError::transient(
                "media",
                format!("{} of {} segments failed: {failed:?}", failed.len(), plan.segments.len()),
            ));
        }
        Ok(segments)
    }

    async fn assemble(
        &self,
        segments: &[SegmentFile],
        transitions: &[StyleTransition],
        out: &Utf8Path,
    ) -> Result<MediaInfo, CapError> {
        if segments.is_empty() {
            return Err(CapError::parse("media", "nothing to assemble"));
        }
        // Concat list in index order; boundary effects decide re-encode.
        let mut ordered: Vec<&SegmentFile> = segments.iter().collect();
        ordered.sort_by_key(|s| s.index);
        let list_path = out.with_extension("concat.txt");
        let list = ordered
            .iter()
            .map(|s| format!("file '{}'\n", s.path))
            .collect::<String>();
        tokio::fs::write(list_path.as_std_path(), list)
            .await
            .map_err(|e| CapError::transient("media", format!("concat list write: {e}")))?;

        let needs_reencode = transitions
            .iter()
            .any(|t| t.effect != TransitionEffect::Cut || t.kind == TransitionKind::NarrativeBoundary);
        let mut args = vec![
            "-y".to_string(),
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            list_path.to_string(),
        ];
        if needs_reencode {
            args.extend([
                "-c:v".to_string(),
                "libx264".to_string(),
                "-threads".to_string(),
                self.threads.to_string(),
            ]);
        } else {
            args.extend(["-c".to_string(), "copy".to_string()]);
        }
        args.push(out.to_string());

        let output = run_command("media", &self.ffmpeg, &args, None).await?;
        if !output.success() {
            return Err(CapError::transient(
                "media",
                format!("assembly exited {}: {}", output.status_code, output.stderr_tail()),
            ));
        }
        self.probe(out).await
    }

    async fn overlay(
        &self,
        media: &Utf8Path,
        manifest: &CutawayManifest,
        out: &Utf8Path,
    ) -> Result<MediaInfo, CapError> {
        if manifest.clips.is_empty() {
            tokio::fs::copy(media.as_std_path(), out.as_std_path())
                .await
                .map_err(|e| CapError::transient("media", format!("copy failed: {e}")))?;
            return self.probe(out).await;
        }

        // One overlay at a time; each pass re-encodes onto the previous.
        let mut current: Utf8PathBuf = media.to_owned();
        for (i, clip) in manifest.clips.iter().enumerate() {
            let next = if i + 1 == manifest.clips.len() {
                out.to_owned()
            } else {
                out.with_extension(format!("pass{i}.mp4"))
            };
            let filter = format!(
                "[0:v][1:v]overlay=0:0:enable='between(t,{:.3},{:.3})'",
                clip.at_seconds,
                clip.at_seconds + clip.duration_seconds
            );
            let args = vec![
                "-y".to_string(),
                "-i".to_string(),
                current.to_string(),
                "-i".to_string(),
                clip.path.clone(),
                "-filter_complex".to_string(),
                filter,
                "-threads".to_string(),
                self.threads.to_string(),
                next.to_string(),
            ];
            let output = run_command("media", &self.ffmpeg, &args, None).await?;
            if !output.success() {
                return Err(CapError::transient(
                    "media",
                    format!(
                        "overlay pass {i} exited {}: {}",
                        output.status_code,
                        output.stderr_tail()
                    ),
                ));
            }
            current = next;
        }
        self.probe(out).await
    }

    async fn rescale(
        &self,
        path: &Utf8Path,
        width: u32,
        height: u32,
        out: &Utf8Path,
    ) -> Result<MediaInfo, CapError> {
        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            path.to_string(),
            "-vf".to_string(),
            format!("scale={width}:{height}"),
            "-threads".to_string(),
            self.threads.to_string(),
            out.to_string(),
        ];
        let output = run_command("media", &self.ffmpeg, &args, None).await?;
        if !output.success() {
            return Err(CapError::transient(
                "media",
                format!("rescale exited {}: {}", output.status_code, output.stderr_tail()),
            ));
        }
        self.probe(out).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{CropRect, EncodeParams};
    use crate::framing::FramingState;

    #[test]
    fn segment_filter_chains_crop_scale_then_extras() {
        let plan = EncodingPlan {
            target_width: 1080,
            target_height: 1920,
            encode: EncodeParams::default(),
            segments: vec![],
            style_transitions: vec![],
        };
        let segment = SegmentPlan {
            index: 0,
            start: 0.0,
            end: 5.0,
            crop: CropRect { x: 420, y: 0, width: 1080, height: 1080 },
            style: FramingState::Solo,
            filters: vec!["eq=saturation=1.1".to_string()],
        };
        assert_eq!(
            FfmpegProcessor::segment_filter(&plan, &segment),
            "crop=1080:1080:420:0,scale=1080:1920,eq=saturation=1.1"
        );
    }
}
