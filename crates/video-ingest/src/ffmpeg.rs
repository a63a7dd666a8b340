//! FFmpeg subprocess backend.
//!
//! Every source kind is decoded by an `ffmpeg` child process writing raw BGR24
//! frames to stdout at a fixed geometry. No native libraries are linked, which
//! keeps this backend available on every build.

use std::{
    fmt::Write,
    io::{ErrorKind, Read, Write as IoWrite},
    process::{Child, ChildStdout, Command, Stdio},
    time::Instant,
};

use anyhow::anyhow;
use chrono::Utc;
use tracing::debug;

use crate::{
    CaptureDevice, DeviceOpener, parse_device_index,
    types::{CaptureError, Frame, FrameFormat, SourceKind},
};

/// Opens sources by spawning `ffmpeg` with a rawvideo pipe.
#[derive(Clone, Debug)]
pub struct FfmpegOpener {
    target_size: (i32, i32),
    hwaccel: bool,
    program: String,
}

impl FfmpegOpener {
    pub fn new(target_size: (i32, i32)) -> Self {
        Self {
            target_size,
            hwaccel: false,
            program: "ffmpeg".to_string(),
        }
    }

    /// Decode H.264 through CUDA/NVDEC where the source allows it.
    pub fn with_hwaccel(mut self, enabled: bool) -> Self {
        self.hwaccel = enabled;
        self
    }

    /// Override the ffmpeg executable (defaults to `ffmpeg` on `PATH`).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn build_command(&self, uri: &str) -> Result<(Command, Option<String>), CaptureError> {
        let scale_arg = format!("scale={}:{}", self.target_size.0, self.target_size.1);
        let mut cmd = Command::new(&self.program);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");
        let mut stdin_payload = None;

        match SourceKind::from_uri(uri) {
            SourceKind::Device => {
                let v4l_path = if let Some(index) = parse_device_index(uri) {
                    Some(format!("/dev/video{index}"))
                } else if uri.starts_with("/dev/video") {
                    Some(uri.to_string())
                } else {
                    None
                };
                match v4l_path {
                    Some(path) => {
                        if self.hwaccel {
                            add_hwaccel(&mut cmd);
                            cmd.arg("-f")
                                .arg("video4linux2")
                                .arg("-input_format")
                                .arg("h264");
                        } else {
                            cmd.arg("-f").arg("video4linux2");
                        }
                        cmd.arg("-i").arg(path);
                    }
                    None => {
                        if self.hwaccel {
                            add_hwaccel(&mut cmd);
                        }
                        cmd.arg("-i").arg(uri);
                    }
                }
            }
            SourceKind::Rtsp => {
                cmd.arg("-rtsp_transport")
                    .arg("tcp")
                    .arg("-fflags")
                    .arg("nobuffer")
                    .arg("-flags")
                    .arg("low_delay")
                    .arg("-max_delay")
                    .arg("0");
                if self.hwaccel {
                    add_hwaccel(&mut cmd);
                }
                cmd.arg("-i").arg(uri);
            }
            SourceKind::Udp => {
                cmd.arg("-protocol_whitelist")
                    .arg("file,udp,rtp,fd,pipe")
                    .arg("-fflags")
                    .arg("+genpts+discardcorrupt")
                    .arg("-flags")
                    .arg("low_delay");
                if self.hwaccel {
                    add_hwaccel(&mut cmd);
                }
                cmd.arg("-f").arg("sdp").arg("-i").arg("-");
                stdin_payload = Some(build_udp_sdp(uri)?);
            }
        }

        cmd.arg("-an")
            .arg("-vf")
            .arg(&scale_arg)
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-");

        Ok((cmd, stdin_payload))
    }
}

impl DeviceOpener for FfmpegOpener {
    fn open(&self, source: &str) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let (mut cmd, stdin_payload) = self.build_command(source)?;
        if stdin_payload.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|err| {
            debug!("failed to spawn {} for {source}: {err}", self.program);
            CaptureError::Open {
                uri: source.to_string(),
            }
        })?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")));
            }
        };

        if let Some(payload) = stdin_payload {
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(err) = stdin.write_all(payload.as_bytes()) {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(CaptureError::Io(err));
                }
            }
        }

        Ok(Box::new(FfmpegDevice {
            reader: RawVideoReader::new(stdout, source, self.target_size),
            child: Some(child),
        }))
    }
}

fn add_hwaccel(cmd: &mut Command) {
    cmd.arg("-hwaccel")
        .arg("cuda")
        .arg("-hwaccel_output_format")
        .arg("cuda")
        .arg("-c:v")
        .arg("h264_cuvid");
}

/// A running ffmpeg decoder.
pub struct FfmpegDevice {
    reader: RawVideoReader<ChildStdout>,
    child: Option<Child>,
}

impl CaptureDevice for FfmpegDevice {
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.child.is_none() {
            return Ok(None);
        }
        self.reader.next_frame()
    }

    fn release(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for FfmpegDevice {
    fn drop(&mut self) {
        self.release();
    }
}

/// Slices a rawvideo byte stream into fixed-size BGR frames.
pub(crate) struct RawVideoReader<R> {
    inner: R,
    uri: String,
    target_size: (i32, i32),
    buffer: Vec<u8>,
}

impl<R: Read> RawVideoReader<R> {
    pub(crate) fn new(inner: R, uri: &str, target_size: (i32, i32)) -> Self {
        let frame_bytes = (target_size.0.max(0) as usize) * (target_size.1.max(0) as usize) * 3;
        Self {
            inner,
            uri: uri.to_string(),
            target_size,
            buffer: vec![0u8; frame_bytes],
        }
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let mut filled = 0;
        while filled < self.buffer.len() {
            match self.inner.read(&mut self.buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(CaptureError::Io(err)),
            }
        }

        if filled == 0 {
            return Ok(None);
        }
        if filled < self.buffer.len() {
            return Err(CaptureError::ShortFrame {
                uri: self.uri.clone(),
                got: filled,
                expected: self.buffer.len(),
            });
        }

        Ok(Some(Frame {
            data: self.buffer.clone(),
            width: self.target_size.0,
            height: self.target_size.1,
            timestamp_ms: Utc::now().timestamp_millis(),
            captured_at: Instant::now(),
            format: FrameFormat::Bgr8,
        }))
    }
}

fn build_udp_sdp(uri: &str) -> Result<String, CaptureError> {
    let without_scheme = uri.strip_prefix("udp://").unwrap_or(uri);
    let mut parts = without_scheme.splitn(2, '?');
    let endpoint = parts.next().unwrap_or("");
    let query = parts.next();
    let mut host = "0.0.0.0";
    let mut port_str = endpoint;
    let mut sprop: Option<String> = None;
    let mut payload: Option<String> = None;

    if endpoint.is_empty() {
        return Err(CaptureError::Other(anyhow!(
            "udp source must include host:port, e.g. udp://127.0.0.1:5000"
        )));
    }

    if let Some((h, p)) = endpoint.rsplit_once(':') {
        if !h.is_empty() {
            host = h;
        }
        port_str = p;
    }

    let port: u16 = port_str
        .parse()
        .map_err(|_| CaptureError::Other(anyhow!("invalid UDP port in source URI")))?;

    if let Some(query) = query {
        for pair in query.split('&') {
            let mut kv = pair.splitn(2, '=');
            let key = kv.next().unwrap_or("");
            let value = kv.next().unwrap_or("");
            match key {
                "sprop" | "sprop-parameter-sets" => sprop = Some(value.to_string()),
                "payload" | "pt" => payload = Some(value.to_string()),
                _ => {}
            }
        }
    }

    let payload = payload.unwrap_or_else(|| "96".to_string());

    let mut sdp = String::new();
    writeln!(&mut sdp, "v=0").ok();
    writeln!(&mut sdp, "o=- 0 0 IN IP4 {host}").ok();
    writeln!(&mut sdp, "s=vision-udp").ok();
    writeln!(&mut sdp, "c=IN IP4 {host}").ok();
    writeln!(&mut sdp, "t=0 0").ok();
    writeln!(&mut sdp, "m=video {port} RTP/AVP {payload}").ok();
    writeln!(&mut sdp, "a=rtpmap:{payload} H264/90000").ok();
    match sprop {
        Some(sprop) => writeln!(
            &mut sdp,
            "a=fmtp:{payload} packetization-mode=1; sprop-parameter-sets={sprop}"
        )
        .ok(),
        None => writeln!(&mut sdp, "a=fmtp:{payload} packetization-mode=1").ok(),
    };

    Ok(sdp)
}
