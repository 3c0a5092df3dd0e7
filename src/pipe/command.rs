//! Command-line contract for the external mux process.
//!
//! A [`MuxRequest`] names the remote inputs; [`MuxCommand::from_request`]
//! turns it into an explicit argument vector that selects streams, codecs and
//! a fragmented MP4 container written to stdout.

use serde::Deserialize;
use url::Url;

use crate::error::{RelayError, Result};

/// Body of a mux-path request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MuxRequest {
    #[serde(rename = "videoURL")]
    pub video_url: Option<String>,
    #[serde(rename = "audioURL")]
    pub audio_url: Option<String>,
    pub url: Option<String>,
    pub filename: String,
    #[serde(rename = "thumbnailURL")]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub video_only: bool,
}

/// Which inputs end up in the output container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxLayout {
    /// Separate video and audio inputs, audio transcoded to AAC.
    Combined,
    /// One input copied as-is.
    Single,
    VideoOnly,
    AudioOnly,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Inputs reach the mux process verbatim, so only remote http(s) URLs pass.
/// Plain paths, `file:` and protocol prefixes such as `concat:` are refused.
fn check_input(field: &str, value: &str) -> Result<()> {
    let parsed = Url::parse(value)
        .map_err(|e| RelayError::InvalidRequest(format!("{field} is not a valid url: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(RelayError::InvalidRequest(format!(
            "{field} must be an http or https url, got {scheme}:"
        ))),
    }
}

impl MuxRequest {
    pub fn validate(&self) -> Result<()> {
        if self.filename.trim().is_empty() {
            return Err(RelayError::InvalidRequest("filename must not be empty".into()));
        }
        if self.layout().is_none() {
            return Err(RelayError::InvalidRequest(
                "one of videoURL, url or audioURL is required".into(),
            ));
        }
        let inputs = [
            ("videoURL", &self.video_url),
            ("audioURL", &self.audio_url),
            ("url", &self.url),
            ("thumbnailURL", &self.thumbnail_url),
        ];
        for (field, value) in inputs {
            if let Some(value) = non_empty(value) {
                check_input(field, value)?;
            }
        }
        Ok(())
    }

    pub fn layout(&self) -> Option<MuxLayout> {
        let video = non_empty(&self.video_url).or(non_empty(&self.url));
        let audio = non_empty(&self.audio_url);
        match (video, audio) {
            (Some(_), _) if self.video_only => Some(MuxLayout::VideoOnly),
            (Some(_), Some(_)) => Some(MuxLayout::Combined),
            (Some(_), _) => Some(MuxLayout::Single),
            (None, Some(_)) => Some(MuxLayout::AudioOnly),
            (None, None) => None,
        }
    }

    /// Primary input: explicit video URL first, then the generic one.
    fn primary_input(&self) -> Option<&str> {
        non_empty(&self.video_url).or(non_empty(&self.url))
    }

    /// Content type of the produced container.
    pub fn content_type(&self) -> &'static str {
        match self.layout() {
            Some(MuxLayout::AudioOnly) => "audio/mp4",
            _ => "video/mp4",
        }
    }

    /// Download name with the container extension the output really has.
    pub fn output_filename(&self) -> String {
        let ext = match self.layout() {
            Some(MuxLayout::AudioOnly) => ".m4a",
            _ => ".mp4",
        };
        let name = self.filename.trim();
        if name.to_ascii_lowercase().ends_with(ext) {
            name.to_string()
        } else {
            format!("{name}{ext}")
        }
    }
}

fn strings<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// A program plus its fully expanded arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl MuxCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Build the mux invocation for `request`, writing fragmented MP4 to stdout.
    pub fn from_request(program: &str, request: &MuxRequest) -> Result<Self> {
        request.validate()?;
        let layout = request
            .layout()
            .ok_or_else(|| RelayError::InvalidRequest("no input given".into()))?;

        let primary = request.primary_input().unwrap_or_default();
        let audio = non_empty(&request.audio_url).unwrap_or_default();
        let (mut inputs, mut selection, video_streams): (Vec<&str>, Vec<String>, usize) =
            match layout {
                MuxLayout::Combined => (
                    vec![primary, audio],
                    strings(["-map", "0:v:0", "-map", "1:a:0", "-c:v", "copy", "-c:a", "aac"]),
                    1,
                ),
                MuxLayout::Single => (
                    vec![primary],
                    strings(["-map", "0:v:0?", "-map", "0:a:0?", "-c", "copy"]),
                    1,
                ),
                MuxLayout::VideoOnly => (
                    vec![primary],
                    strings(["-map", "0:v:0", "-c:v", "copy", "-an"]),
                    1,
                ),
                MuxLayout::AudioOnly => (
                    vec![audio],
                    strings(["-map", "0:a:0", "-c:a", "aac"]),
                    0,
                ),
            };

        if let Some(thumb) = non_empty(&request.thumbnail_url) {
            let index = inputs.len();
            inputs.push(thumb);
            selection.extend([
                "-map".to_string(),
                format!("{index}:v:0"),
                format!("-c:v:{video_streams}"),
                "mjpeg".to_string(),
                format!("-disposition:v:{video_streams}"),
                "attached_pic".to_string(),
            ]);
        }

        let mut cmd = Self::new(program);
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin"]);
        for input in inputs {
            cmd.arg("-i").arg(input);
        }
        cmd.args(selection);
        cmd.args([
            "-f",
            "mp4",
            "-movflags",
            "frag_keyframe+empty_moov+default_base_moof",
            "pipe:1",
        ]);
        Ok(cmd)
    }
}
