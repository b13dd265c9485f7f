// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::File;
use std::path::Path;

use symphonia::core::codecs::CODEC_TYPE_NULL;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

use crate::error::DownloadError;

/// Determines the real playing time of a local media file
pub trait DurationProbe: Send + Sync {
    /// Duration in whole seconds. Blocking; run it off the async executor.
    fn probe(&self, path: &Path) -> Result<u32, DownloadError>;
}

/// [`DurationProbe`] backed by symphonia's format readers
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaProbe;

impl DurationProbe for SymphoniaProbe {
    fn probe(&self, path: &Path) -> Result<u32, DownloadError> {
        let failed = |reason: String| DownloadError::ProbeFailed {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::open(path).map_err(|e| failed(e.to_string()))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| failed(e.to_string()))?;
        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| failed("no audio track".to_string()))?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        if let (Some(frames), Some(rate)) = (params.n_frames, params.sample_rate)
            && rate > 0
        {
            return Ok((frames as f64 / rate as f64).round() as u32);
        }

        // Container does not declare a length (e.g. VBR mp3 without a Xing
        // header): add up packet durations instead
        let time_base = params
            .time_base
            .ok_or_else(|| failed("unknown time base".to_string()))?;
        let mut total_ts: u64 = 0;
        loop {
            match format.next_packet() {
                Ok(packet) if packet.track_id() == track_id => total_ts += packet.dur,
                Ok(_) => {}
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => return Err(failed(e.to_string())),
            }
        }

        let time = time_base.calc_time(total_ts);
        debug!(path = %path.display(), seconds = time.seconds, "probed duration from packets");
        Ok((time.seconds as f64 + time.frac).round() as u32)
    }
}
