use crate::error::UploadError;

/// The FFmpeg command line that repackages a raw H.264 stream read from stdin
/// into FLV and publishes it to an RTMP endpoint.
///
/// With default settings the argument list is
/// `-loglevel error -f h264 -i pipe:0 -c:v copy -an -f flv <url>`.
///
/// # Example
///
/// ```rust,ignore
/// let args = RtmpOutput::new("rtmp://localhost/live/stream1")
///     .set_format_opt("flvflags", "no_duration_filesize")
///     .to_args()?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpOutput {
    url: String,
    log_level: String,
    input_format: String,
    video_codec: String,
    audio: bool,
    format: String,
    format_opts: Vec<(String, String)>,
    extra_args: Vec<String>,
}

impl RtmpOutput {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            log_level: "error".to_string(),
            input_format: "h264".to_string(),
            video_codec: "copy".to_string(),
            audio: false,
            format: "flv".to_string(),
            format_opts: Vec::new(),
            extra_args: Vec::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// FFmpeg `-loglevel`. Everything FFmpeg prints ends up in the pipeline's
    /// line callback.
    pub fn set_log_level(mut self, log_level: impl Into<String>) -> Self {
        self.log_level = log_level.into();
        self
    }

    /// Demuxer for the bytes written to stdin.
    pub fn set_input_format(mut self, input_format: impl Into<String>) -> Self {
        self.input_format = input_format.into();
        self
    }

    pub fn set_video_codec(mut self, video_codec: impl Into<String>) -> Self {
        self.video_codec = video_codec.into();
        self
    }

    /// Keeps audio streams instead of passing `-an`.
    pub fn set_audio(mut self, audio: bool) -> Self {
        self.audio = audio;
        self
    }

    pub fn set_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    /// Muxer option, passed as `-<key> <value>` right before the URL.
    pub fn set_format_opt(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.format_opts.push((key.into(), value.into()));
        self
    }

    /// Raw output arguments, inserted after the codec settings.
    pub fn add_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn to_args(&self) -> Result<Vec<String>, UploadError> {
        if self.url.trim().is_empty() {
            return Err(UploadError::EmptyUrl);
        }

        let mut args = vec![
            "-loglevel".to_string(),
            self.log_level.clone(),
            "-f".to_string(),
            self.input_format.clone(),
            "-i".to_string(),
            "pipe:0".to_string(),
            "-c:v".to_string(),
            self.video_codec.clone(),
        ];
        if !self.audio {
            args.push("-an".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push("-f".to_string());
        args.push(self.format.clone());
        for (key, value) in &self.format_opts {
            args.push(format!("-{key}"));
            args.push(value.clone());
        }
        args.push(self.url.clone());
        Ok(args)
    }
}
