//! UDP link to the ground station.
//!
//! Outbound: each [`TelemetryFrame`] becomes four MAVLink named-value
//! messages (`vis_x<N>`, `vis_y<N>`, `vis_lat<N>`, `vis_det<N>`) sharing one
//! millisecond timestamp. Inbound: status text messages are drained without
//! blocking and folded into a single [`CommandSignal`].
//!
//! Both sockets are opened on first use and dropped after a transport error,
//! so the next call retries. Sockets are non-blocking, which keeps the
//! guarding locks from ever being held across a wait.

use std::{
    io::ErrorKind,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::vision::{
    config::LinkOptions,
    mavlink::{InboundMessage, MavlinkEncoder, parse_datagram},
    targeting::TelemetryFrame,
};

const MAX_DATAGRAM: usize = 2048;

/// Action requested by the ground station.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CommandSignal {
    /// Start map generation. Never displaced once seen.
    Generate,
    /// Capture pictures. Displaced only by `Generate`.
    Picture,
    Other(String),
}

impl CommandSignal {
    pub(crate) fn parse(text: &str) -> Option<Self> {
        let token = text.trim().to_ascii_lowercase();
        match token.as_str() {
            "" => None,
            "generate" => Some(Self::Generate),
            "picture" => Some(Self::Picture),
            _ => Some(Self::Other(token)),
        }
    }

    /// Fold `next` into the token retained so far.
    pub(crate) fn most_relevant(current: Option<Self>, next: Self) -> Self {
        match (current, next) {
            (Some(Self::Generate), _) | (_, Self::Generate) => Self::Generate,
            (Some(Self::Picture), _) => Self::Picture,
            (_, next) => next,
        }
    }

    pub(crate) fn as_str(&self) -> &str {
        match self {
            Self::Generate => "generate",
            Self::Picture => "picture",
            Self::Other(token) => token,
        }
    }
}

struct Outbound {
    socket: Option<UdpSocket>,
    encoder: MavlinkEncoder,
    failing: bool,
}

struct Inbound {
    socket: Option<UdpSocket>,
    failing: bool,
}

pub(crate) struct TelemetryLink {
    target: String,
    listen_port: Option<u16>,
    outbound: Mutex<Outbound>,
    inbound: Mutex<Inbound>,
    closed: AtomicBool,
}

impl TelemetryLink {
    pub(crate) fn new(options: &LinkOptions) -> Self {
        Self {
            target: options.target.clone(),
            listen_port: options.listen_port,
            outbound: Mutex::new(Outbound {
                socket: None,
                encoder: MavlinkEncoder::new(options.system_id, options.component_id),
                failing: false,
            }),
            inbound: Mutex::new(Inbound {
                socket: None,
                failing: false,
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Send one record per tracked class. Transport errors are logged and
    /// counted; the frame is dropped and the socket reopened on the next call.
    pub(crate) fn send(&self, stream: &str, frames: &[TelemetryFrame]) {
        if self.closed.load(Ordering::Relaxed) || frames.is_empty() {
            return;
        }
        let time_boot_ms = epoch_ms_u32();
        let mut outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);

        if outbound.socket.is_none() {
            match connect_outbound(&self.target) {
                Ok(socket) => {
                    info!(destination = %self.target, "MAVLink telemetry link opened");
                    outbound.socket = Some(socket);
                }
                Err(err) => {
                    if !outbound.failing {
                        warn!(destination = %self.target, "Failed to open MAVLink link: {err:#}");
                    }
                    outbound.failing = true;
                    metrics::counter!("vision_telemetry_failures_total", "direction" => "outbound")
                        .increment(1);
                    return;
                }
            }
        }

        let Outbound {
            socket, encoder, ..
        } = &mut *outbound;
        let mut datagrams = Vec::with_capacity(frames.len() * 4);
        for frame in frames {
            let class = frame.class_id;
            datagrams.push(encoder.named_value_float(
                time_boot_ms,
                &format!("vis_x{class}"),
                frame.x_offset_deg,
            ));
            datagrams.push(encoder.named_value_float(
                time_boot_ms,
                &format!("vis_y{class}"),
                frame.y_offset_deg,
            ));
            datagrams.push(encoder.named_value_float(
                time_boot_ms,
                &format!("vis_lat{class}"),
                frame.latency_s,
            ));
            datagrams.push(encoder.named_value_int(
                time_boot_ms,
                &format!("vis_det{class}"),
                i32::from(frame.detected),
            ));
        }

        let result = match socket.as_ref() {
            Some(socket) => datagrams
                .iter()
                .try_for_each(|datagram| socket.send(datagram).map(|_| ())),
            None => Ok(()),
        };
        match result {
            Ok(()) => {
                if outbound.failing {
                    info!(destination = %self.target, "MAVLink telemetry link recovered");
                }
                outbound.failing = false;
                metrics::counter!("vision_telemetry_messages_total").increment(datagrams.len() as u64);
                debug!(stream, messages = datagrams.len(), "telemetry sent");
            }
            Err(err) => {
                if !outbound.failing {
                    warn!(destination = %self.target, stream, "Dropping telemetry frame: {err}");
                }
                outbound.failing = true;
                outbound.socket = None;
                metrics::counter!("vision_telemetry_failures_total", "direction" => "outbound")
                    .increment(1);
            }
        }
    }

    /// Drain pending inbound datagrams and return the most relevant command
    /// received since the previous poll.
    pub(crate) fn poll_command(&self) -> Option<CommandSignal> {
        if self.closed.load(Ordering::Relaxed) {
            return None;
        }
        let port = self.listen_port?;
        let mut inbound = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
        if inbound.socket.is_none() {
            match bind_inbound(port) {
                Ok(socket) => {
                    inbound.failing = false;
                    inbound.socket = Some(socket);
                }
                Err(err) => {
                    if !inbound.failing {
                        warn!(port, "Failed to listen for ground-station commands: {err:#}");
                    }
                    inbound.failing = true;
                    metrics::counter!("vision_telemetry_failures_total", "direction" => "inbound")
                        .increment(1);
                    return None;
                }
            }
        }

        let mut relevant: Option<CommandSignal> = None;
        let mut buf = [0u8; MAX_DATAGRAM];
        let mut reset = false;
        if let Some(socket) = inbound.socket.as_ref() {
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((len, peer)) => {
                        for message in parse_datagram(&buf[..len]) {
                            if let InboundMessage::StatusText { text, .. } = message {
                                debug!(%peer, text = %text, "status text received");
                                if let Some(signal) = CommandSignal::parse(&text) {
                                    relevant = Some(CommandSignal::most_relevant(relevant, signal));
                                }
                            }
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    // ICMP port unreachable from an earlier reply surfaces here on some platforms.
                    Err(err) if err.kind() == ErrorKind::ConnectionReset => continue,
                    Err(err) => {
                        warn!(port, "Inbound MAVLink socket failed: {err}");
                        reset = true;
                        break;
                    }
                }
            }
        }
        if reset {
            inbound.socket = None;
        }
        relevant
    }

    /// Local address of the inbound socket, binding it if needed.
    pub(crate) fn inbound_addr(&self) -> Option<SocketAddr> {
        let port = self.listen_port?;
        let mut inbound = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
        if inbound.socket.is_none() {
            inbound.socket = bind_inbound(port).ok();
        }
        inbound.socket.as_ref().and_then(|socket| socket.local_addr().ok())
    }

    /// Stop sending and listening. Later calls are no-ops.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .socket = None;
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .socket = None;
    }
}

/// Wall-clock milliseconds truncated to 32 bits.
fn epoch_ms_u32() -> u32 {
    (chrono::Utc::now().timestamp_millis() as u64 & 0xFFFF_FFFF) as u32
}

fn connect_outbound(target: &str) -> Result<UdpSocket> {
    let addr = target
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {target}"))?
        .next()
        .ok_or_else(|| anyhow!("{target} did not resolve to an address"))?;
    let local: SocketAddr = if addr.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(local).context("failed to bind telemetry socket")?;
    socket
        .connect(addr)
        .with_context(|| format!("failed to connect telemetry socket to {addr}"))?;
    socket
        .set_nonblocking(true)
        .context("failed to make telemetry socket non-blocking")?;
    Ok(socket)
}

fn bind_inbound(port: u16) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(("0.0.0.0", port))
        .with_context(|| format!("failed to bind UDP port {port}"))?;
    socket
        .set_nonblocking(true)
        .context("failed to make command socket non-blocking")?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::vision::mavlink::{MSG_NAMED_VALUE_FLOAT, MSG_NAMED_VALUE_INT, parse_frame};

    fn fold(tokens: &[&str]) -> Option<CommandSignal> {
        tokens
            .iter()
            .filter_map(|token| CommandSignal::parse(token))
            .fold(None, |acc, next| Some(CommandSignal::most_relevant(acc, next)))
    }

    #[test]
    fn generate_is_sticky_and_picture_only_yields_to_generate() {
        assert_eq!(
            fold(&["hello", "picture", "other", "generate", "picture"]),
            Some(CommandSignal::Generate)
        );
        assert_eq!(fold(&["picture", "other"]), Some(CommandSignal::Picture));
        assert_eq!(
            fold(&["hello", "other"]),
            Some(CommandSignal::Other("other".into()))
        );
        assert_eq!(fold(&[]), None);
    }

    #[test]
    fn tokens_are_trimmed_and_lowercased() {
        assert_eq!(CommandSignal::parse("  GENERATE \n"), Some(CommandSignal::Generate));
        assert_eq!(CommandSignal::parse("   "), None);
    }

    fn options(target: String, listen_port: Option<u16>) -> LinkOptions {
        LinkOptions {
            target,
            listen_port,
            system_id: 255,
            component_id: 0,
        }
    }

    #[test]
    fn each_frame_becomes_four_named_values_with_one_timestamp() {
        let station = UdpSocket::bind("127.0.0.1:0").unwrap();
        station.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let link = TelemetryLink::new(&options(station.local_addr().unwrap().to_string(), None));

        let detected = TelemetryFrame {
            class_id: 0,
            x_offset_deg: 12.5,
            y_offset_deg: -3.0,
            latency_s: 0.08,
            detected: true,
        };
        link.send("cam0", &[detected, TelemetryFrame::not_detected(1)]);

        let mut buf = [0u8; 512];
        let mut received = Vec::new();
        for _ in 0..8 {
            let len = station.recv(&mut buf).unwrap();
            received.push(buf[..len].to_vec());
        }

        let stamps: Vec<[u8; 4]> = received
            .iter()
            .map(|frame| [frame[6], frame[7], frame[8], frame[9]])
            .collect();
        assert!(stamps.windows(2).all(|pair| pair[0] == pair[1]));

        let names: Vec<String> = received
            .iter()
            .map(|frame| match parse_frame(frame).unwrap().0 {
                InboundMessage::NamedValueFloat { name, .. } => {
                    assert_eq!(u32::from(frame[5]), MSG_NAMED_VALUE_FLOAT);
                    name
                }
                InboundMessage::NamedValueInt { name, value } => {
                    assert_eq!(u32::from(frame[5]), MSG_NAMED_VALUE_INT);
                    assert_eq!(value, i32::from(name == "vis_det0"));
                    name
                }
                other => panic!("unexpected message {other:?}"),
            })
            .collect();
        assert_eq!(
            names,
            vec![
                "vis_x0", "vis_y0", "vis_lat0", "vis_det0", "vis_x1", "vis_y1", "vis_lat1",
                "vis_det1"
            ]
        );
    }

    #[test]
    fn inbound_status_text_is_folded_per_poll() {
        let link = TelemetryLink::new(&options("127.0.0.1:9".into(), Some(0)));
        let addr = link.inbound_addr().unwrap();
        let station = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut encoder = MavlinkEncoder::new(1, 1);
        let target = SocketAddr::from(([127, 0, 0, 1], addr.port()));
        for text in ["hello", "picture", "other"] {
            station.send_to(&encoder.statustext(6, text), target).unwrap();
        }
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(link.poll_command(), Some(CommandSignal::Picture));
        assert_eq!(link.poll_command(), None);

        for text in ["generate", "picture"] {
            station.send_to(&encoder.statustext(6, text), target).unwrap();
        }
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(link.poll_command(), Some(CommandSignal::Generate));
    }

    #[test]
    fn unresolvable_target_never_panics_and_closed_link_is_inert() {
        let link = TelemetryLink::new(&options("definitely-not-a-host.invalid:1".into(), None));
        link.send("cam0", &[TelemetryFrame::not_detected(0)]);
        link.send("cam0", &[TelemetryFrame::not_detected(0)]);
        link.close();
        link.send("cam0", &[TelemetryFrame::not_detected(0)]);
        assert_eq!(link.poll_command(), None);
    }
}
