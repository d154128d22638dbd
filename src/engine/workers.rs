//! Worker loops
//!
//! Four long-lived roles plus housekeeping, one tokio task each. Every
//! loop observes the shutdown broadcast, drains its input, and exits;
//! locks guard plain data and are never held across an await.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::codec::frame::{EncodedFrame, FrameClass, RawFrame};
use crate::codec::governor::{EncodeOutcome, EncoderGovernor, GovernorConfig};
use crate::codec::ComplexityPreset;
use crate::engine::{AudioPayload, Shared};
use crate::telemetry::{EngineCounters, StatsSnapshot};
use crate::transport::fec::FecEncoder;
use crate::transport::packet::{
    ControlTrailer, ControlType, Packet, PacketHeader, PacketKind, Trailer,
};
use crate::transport::packetizer::Packetizer;

/// Encoder → packetizer channel depth; its saturation is the governor's
/// backpressure signal
pub(crate) const ENCODED_CHANNEL_DEPTH: usize = 4;

/// Idle poll period for the pacer when the queue is empty
const PACER_IDLE_POLL: Duration = Duration::from_millis(20);

/// Encoder worker: owns the governor, codec state and reference plane
pub(crate) async fn encoder_worker(
    shared: Arc<Shared>,
    mut frame_rx: mpsc::Receiver<RawFrame>,
    encoded_tx: mpsc::Sender<EncodedFrame>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!("encoder worker started");
    let cfg = &shared.config;
    let mut governor = EncoderGovernor::new(
        cfg.codec.variant,
        ComplexityPreset::new(cfg.codec.complexity),
        cfg.codec.gop_size,
        cfg.codec.width,
        cfg.codec.height,
        GovernorConfig {
            max_encoding_time_ms: cfg.encoder.max_encoding_time_ms,
            target_frame_period_ms: cfg.encoder.target_frame_period_ms,
            initial_qp: cfg.encoder.initial_qp,
        },
    );

    let mut window_bits: u64 = 0;
    let mut window_start = Instant::now();

    loop {
        let frame = tokio::select! {
            _ = shutdown.recv() => break,
            frame = frame_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let now = Instant::now();
        governor.set_channel_saturated(encoded_tx.capacity() == 0, now);

        match governor.encode_at(&frame, now) {
            Ok(EncodeOutcome::Emitted(encoded)) => {
                EngineCounters::bump(&shared.counters.frames_encoded);
                window_bits += encoded.data.len() as u64 * 8;
                if encoded_tx.send(encoded).await.is_err() {
                    break;
                }
            }
            Ok(EncodeOutcome::Dropped(reason)) => {
                EngineCounters::bump(&shared.counters.frames_dropped);
                debug!(?reason, frame_id = frame.frame_id, "governor dropped frame");
            }
            Err(err) => {
                // Caller-side frame problems are recoverable at the
                // protocol level: log, count, continue
                warn!(%err, frame_id = frame.frame_id, "frame rejected by codec");
                EngineCounters::bump(&shared.counters.frames_dropped);
            }
        }

        let elapsed = now.duration_since(window_start);
        if elapsed >= Duration::from_secs(1) {
            let output_bps = (window_bits as f64 / elapsed.as_secs_f64()) as u64;
            shared.output_bitrate.store(output_bps, Ordering::Relaxed);
            governor.adjust_for_bitrate(output_bps, shared.target_bitrate.load(Ordering::Relaxed));
            window_bits = 0;
            window_start = now;
        }
        shared
            .current_qp
            .store(u64::from(governor.current_qp()), Ordering::Relaxed);
    }

    while frame_rx.try_recv().is_ok() {}
    info!("encoder worker stopped");
}

/// Packetizer/FEC worker: fragments frames and builds recovery groups
pub(crate) async fn packetizer_worker(
    shared: Arc<Shared>,
    mut encoded_rx: mpsc::Receiver<EncodedFrame>,
    mut audio_rx: mpsc::Receiver<AudioPayload>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!("packetizer worker started");
    let packetizer = Packetizer::new(shared.session_id, shared.config.network.mtu);
    let mut fec = FecEncoder::new();
    let mut audio_open = true;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            encoded = encoded_rx.recv() => {
                let Some(encoded) = encoded else { break };
                handle_encoded_frame(&shared, &packetizer, &mut fec, encoded);
            }
            audio = audio_rx.recv(), if audio_open => {
                match audio {
                    Some(audio) => {
                        let packet = packetizer.packetize_audio(
                            audio.payload,
                            audio.capture_ts_us,
                            audio.sample_count,
                            audio.channels,
                            audio.format,
                        );
                        shared.send_queue.lock().push(packet);
                        shared.queue_notify.notify_one();
                    }
                    None => audio_open = false,
                }
            }
        }
    }

    while encoded_rx.try_recv().is_ok() {}
    info!("packetizer worker stopped");
}

fn handle_encoded_frame(
    shared: &Shared,
    packetizer: &Packetizer,
    fec: &mut FecEncoder,
    encoded: EncodedFrame,
) {
    let packets = packetizer.packetize(&encoded);
    if packets.is_empty() {
        return;
    }

    let recovery = if shared.config.transport.enable_fec && packets.len() > 1 {
        let loss_rate = shared.congestion.lock().loss_rate();
        fec.protect(&packets, loss_rate)
    } else {
        Vec::new()
    };
    EngineCounters::add(&shared.counters.fec_packets_sent, recovery.len() as u64);

    {
        let mut queue = shared.send_queue.lock();
        for packet in packets {
            queue.push(packet);
        }
        for packet in recovery {
            queue.push(packet);
        }
    }
    shared.queue_notify.notify_one();
    trace!(frame_id = encoded.frame_id, "frame queued for egress");
}

/// Network worker: paced egress, sequence assignment, retransmissions
pub(crate) async fn network_worker(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!("network worker started");
    loop {
        if shared.config.transport.enable_retransmission {
            scan_retransmissions(&shared);
        }

        let packet = shared.send_queue.lock().pop();
        let Some(mut packet) = packet else {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = shared.queue_notify.notified() => continue,
                _ = tokio::time::sleep(PACER_IDLE_POLL) => continue,
            }
        };

        // Retransmissions keep their original sequence number
        if packet.header.kind != PacketKind::Retransmit {
            packet.header.seq = shared.next_seq.fetch_add(1, Ordering::Relaxed);
        }
        let wire = packet.encode();

        // Transient send failures back off exponentially and retry
        let mut backoff = Duration::from_millis(1);
        loop {
            match socket.send(&wire).await {
                Ok(_) => break,
                Err(err) if is_transient(&err) => {
                    EngineCounters::bump(&shared.counters.transient_send_errors);
                    tokio::select! {
                        _ = shutdown.recv() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(Duration::from_millis(100));
                }
                Err(err) => {
                    warn!(%err, seq = packet.header.seq, "send failed, packet lost");
                    break;
                }
            }
        }

        let now = Instant::now();
        shared.arq.lock().on_sent(&packet, now);
        shared.congestion.lock().on_packet_sent(wire.len());
        EngineCounters::bump(&shared.counters.packets_sent);
        EngineCounters::add(&shared.counters.bytes_sent, wire.len() as u64);
        shared
            .registry
            .record_sent(shared.session_id, wire.len(), packet.header.seq, now);

        let pace = Duration::from_micros(shared.pacing_interval_us.load(Ordering::Relaxed));
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tokio::time::sleep(pace) => {}
        }
    }
    info!("network worker stopped");
}

/// Queue timed-out pending packets for retransmission, policy permitting
fn scan_retransmissions(shared: &Shared) {
    let rto = shared.congestion.lock().rto();
    let now = Instant::now();
    let candidates = shared.arq.lock().timed_out(now, rto);
    if candidates.is_empty() {
        return;
    }

    let stream_now_us = shared.latest_capture_ts_us.load(Ordering::Relaxed);
    let mut queued = false;
    for candidate in candidates {
        let age = Duration::from_micros(stream_now_us.saturating_sub(candidate.capture_ts_us));
        let allowed = shared.congestion.lock().retransmit_allowed(candidate.class, age);
        if !allowed {
            shared.arq.lock().abandon(candidate.seq);
            continue;
        }
        if let Some(packet) = shared.arq.lock().take_for_retransmit(candidate.seq, now) {
            shared.congestion.lock().on_loss_event(packet.wire_len());
            EngineCounters::bump(&shared.counters.retransmissions);
            shared.send_queue.lock().push(packet);
            queued = true;
        }
    }
    if queued {
        shared.queue_notify.notify_one();
    }
}

/// Feedback worker: ACK/NACK ingress, congestion updates, rate publishing
pub(crate) async fn feedback_worker(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!("feedback worker started");
    let mut buf = vec![0u8; 2048];
    let mut retarget = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = retarget.tick() => {
                let (update, srtt_ms, rttvar_ms, loss, bandwidth) = {
                    let mut congestion = shared.congestion.lock();
                    let update = congestion.maybe_retarget(Instant::now());
                    (
                        update,
                        congestion.srtt().map(|d| d.as_secs_f64() * 1000.0).unwrap_or(0.0),
                        congestion.rttvar().as_secs_f64() * 1000.0,
                        congestion.loss_rate(),
                        congestion.bottleneck_bandwidth().unwrap_or(0),
                    )
                };
                if let Some(update) = update {
                    shared.target_bitrate.store(update.target_bitrate, Ordering::Relaxed);
                    shared
                        .pacing_interval_us
                        .store(update.pacing_interval_us, Ordering::Relaxed);
                    shared.send_queue.lock().set_byte_budget(shared.queue_budget_bytes());
                    shared.registry.update_estimates(
                        shared.session_id,
                        srtt_ms,
                        rttvar_ms,
                        loss,
                        bandwidth,
                    );
                }
            }
            result = socket.recv(&mut buf) => match result {
                Ok(n) => handle_incoming(&shared, &buf[..n]),
                Err(err) => {
                    trace!(%err, "socket receive error");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
    info!("feedback worker stopped");
}

fn handle_incoming(shared: &Shared, data: &[u8]) {
    let now = Instant::now();
    let packet = match Packet::decode(data) {
        Ok(packet) => packet,
        Err(err) => {
            trace!(%err, "discarding malformed datagram");
            EngineCounters::bump(&shared.counters.receive_errors);
            return;
        }
    };
    EngineCounters::bump(&shared.counters.packets_received);
    shared.registry.record_received(shared.session_id, data.len(), now);

    let Trailer::Control(control) = packet.trailer else {
        // The sender side only consumes control traffic
        return;
    };

    match control.control_type {
        ControlType::Ack => {
            let outcome = shared.arq.lock().on_ack(control.datum, now);
            let mut congestion = shared.congestion.lock();
            for (bytes, rtt) in &outcome.acked {
                congestion.on_ack(*bytes, now);
                if !rtt.is_zero() {
                    congestion.on_rtt_sample(*rtt, now);
                }
            }
        }
        ControlType::Nack => handle_nack(shared, control.datum, now),
        ControlType::Keepalive => {
            shared.registry.touch(shared.session_id, now);
        }
        ControlType::Close => {
            if shared.registry.close(shared.session_id).is_some() {
                shared.status("session closed by peer");
            }
        }
        ControlType::Handshake => {
            enqueue_control(shared, ControlType::HandshakeAck, 0);
        }
        ControlType::HandshakeAck => {
            shared.registry.touch(shared.session_id, now);
        }
        ControlType::BitrateHint => {
            debug!(hint_bps = control.datum, "peer bitrate hint received");
        }
    }
}

fn handle_nack(shared: &Shared, seq: u32, now: Instant) {
    if !shared.config.transport.enable_retransmission {
        return;
    }
    let Some(candidate) = shared.arq.lock().on_nack(seq) else {
        return;
    };
    let stream_now_us = shared.latest_capture_ts_us.load(Ordering::Relaxed);
    let age = Duration::from_micros(stream_now_us.saturating_sub(candidate.capture_ts_us));
    if !shared.congestion.lock().retransmit_allowed(candidate.class, age) {
        shared.arq.lock().abandon(seq);
        return;
    }
    if let Some(packet) = shared.arq.lock().take_for_retransmit(seq, now) {
        shared.congestion.lock().on_loss_event(packet.wire_len());
        EngineCounters::bump(&shared.counters.retransmissions);
        shared.send_queue.lock().push(packet);
        shared.queue_notify.notify_one();
    }
}

/// Housekeeping: statistics ticks and idle-session sweeps
pub(crate) async fn housekeeping_worker(shared: Arc<Shared>, mut shutdown: broadcast::Receiver<()>) {
    info!("housekeeping worker started");
    let idle = Duration::from_secs(shared.config.transport.session_idle_timeout_secs.max(1));
    let sweep_period = (idle / 2)
        .min(Duration::from_secs(5))
        .max(Duration::from_millis(200));

    let mut stats_tick = tokio::time::interval(Duration::from_secs(1));
    let mut sweep_tick = tokio::time::interval(sweep_period);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = stats_tick.tick() => {
                if let Some(cb) = &shared.callbacks.on_statistics {
                    cb(&assemble_snapshot(&shared));
                }
            }
            _ = sweep_tick.tick() => {
                for session in shared.registry.sweep_idle(Instant::now()) {
                    shared.status(&format!(
                        "session {:08x} closed (idle)",
                        session.session_id
                    ));
                }
            }
        }
    }
    info!("housekeeping worker stopped");
}

/// Fold counters and controller state into one statistics snapshot
pub(crate) fn assemble_snapshot(shared: &Shared) -> StatsSnapshot {
    let mut snapshot = shared.counters.snapshot();
    {
        let congestion = shared.congestion.lock();
        snapshot.srtt_ms = congestion
            .srtt()
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        snapshot.loss_rate = congestion.loss_rate();
    }
    snapshot.target_bitrate = shared.target_bitrate.load(Ordering::Relaxed);
    snapshot.output_bitrate = shared.output_bitrate.load(Ordering::Relaxed);
    {
        let queue = shared.send_queue.lock();
        snapshot.queue_depth = queue.len();
        snapshot.queue_overflow_dropped = queue.overflow_dropped();
    }
    snapshot.retransmissions = shared.arq.lock().retransmissions();
    snapshot.sessions = shared.registry.len();
    snapshot.current_qp = shared.current_qp.load(Ordering::Relaxed) as u8;
    snapshot
}

fn control_packet(shared: &Shared, control_type: ControlType, datum: u32) -> Packet {
    Packet {
        header: PacketHeader {
            session_id: shared.session_id,
            seq: 0,
            capture_ts_us: shared.latest_capture_ts_us.load(Ordering::Relaxed),
            kind: PacketKind::Control,
            // Control traffic carries no picture; the audio class marks it
            // as non-video on the wire
            frame_class: FrameClass::Audio,
            flags: 0,
            payload_len: 0,
        },
        trailer: Trailer::Control(ControlTrailer { control_type, datum }),
        payload: Bytes::new(),
    }
}

fn enqueue_control(shared: &Shared, control_type: ControlType, datum: u32) {
    let packet = control_packet(shared, control_type, datum);
    shared.send_queue.lock().push(packet);
    shared.queue_notify.notify_one();
}

/// Queue the session-open handshake
pub(crate) fn enqueue_handshake(shared: &Shared) {
    enqueue_control(shared, ControlType::Handshake, shared.session_id);
}

/// Queue the orderly close notification
pub(crate) fn enqueue_close(shared: &Shared) {
    enqueue_control(shared, ControlType::Close, shared.session_id);
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::ConnectionRefused
    )
}
