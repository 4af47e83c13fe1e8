//! Uploads a raw H.264 file to an RTMP server at a live pace.
//!
//! ```text
//! cargo run --example file_upload -- /usr/bin/ffmpeg video.h264 rtmp://localhost/live/stream1
//! ```

use pipe_uploader::UploadBuilder;
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [ffmpeg, input, url] = args.as_slice() else {
        eprintln!("usage: file_upload <ffmpeg> <input.h264> <rtmp-url>");
        return ExitCode::from(2);
    };

    let handle = match UploadBuilder::new()
        .ffmpeg(ffmpeg)
        .url(url.as_str())
        .input_file(input)
        .start()
    {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to start upload: {e}");
            return ExitCode::FAILURE;
        }
    };

    match handle.wait() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Upload failed: {e}");
            ExitCode::FAILURE
        }
    }
}
