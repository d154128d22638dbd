//! Engine orchestration
//!
//! An [`Engine`] owns everything for one outbound stream: the governed
//! encoder, the packetizer/FEC stage, the paced sender, the feedback
//! loop, and the session registry. No global state: dropping the engine
//! releases sockets, workers and buffers.
//!
//! # Worker topology
//!
//! ```text
//! submit() ─frame channel─> encoder worker ─encoded channel─> packetizer/FEC
//!                                                                  │
//!                                              send queue (priority, bounded)
//!                                                                  │
//!                                               network worker (pacer + ARQ)
//!                                                                  │ UDP
//!                        feedback worker <── ACK / NACK / control ──┘
//! ```
//!
//! The feedback worker publishes `target_bitrate` and `pacing_interval`
//! as atomics; the encoder governor and the pacer read them without
//! locking. A broadcast shutdown token reaches every `select!` loop.

mod workers;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::info;

use crate::codec::frame::RawFrame;
use crate::config::{Config, ConfigError};
use crate::telemetry::{EngineCounters, StatsSnapshot};
use crate::transport::congestion::{CongestionConfig, CongestionController};
use crate::transport::send_queue::{ArqTracker, SendQueue};
use crate::transport::session::SessionRegistry;

/// Engine-level errors surfaced through `Result` and the error callback
#[derive(Debug, Error)]
pub enum EngineError {
    /// Fatal configuration problem; the engine never started
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Socket setup failed
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The destination could not be resolved
    #[error("cannot resolve remote address {0}")]
    UnresolvableRemote(String),

    /// The engine is shutting down; the submitted item was not accepted
    #[error("engine is shutting down")]
    ShuttingDown,
}

/// User callbacks, all optional
///
/// Status and statistics are informational; the error callback fires
/// exactly once per fatal error.
#[derive(Clone, Default)]
pub struct EngineCallbacks {
    /// Human-readable lifecycle events ("session created", ...)
    pub on_status: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    /// Fatal errors
    pub on_error: Option<Arc<dyn Fn(&EngineError) + Send + Sync>>,
    /// Periodic statistics, once per second
    pub on_statistics: Option<Arc<dyn Fn(&StatsSnapshot) + Send + Sync>>,
}

impl std::fmt::Debug for EngineCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineCallbacks")
            .field("on_status", &self.on_status.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_statistics", &self.on_statistics.is_some())
            .finish()
    }
}

/// Pre-encoded audio handed through the transport untouched
#[derive(Debug, Clone)]
pub struct AudioPayload {
    /// Encoded audio bytes (collaborator-defined codec)
    pub payload: Bytes,
    /// Capture timestamp, microseconds
    pub capture_ts_us: u64,
    /// Samples per channel
    pub sample_count: u32,
    /// Channel count
    pub channels: u8,
    /// Collaborator-defined format tag
    pub format: u8,
}

/// State shared across workers
pub(crate) struct Shared {
    pub config: Config,
    pub counters: EngineCounters,
    pub congestion: Mutex<CongestionController>,
    pub send_queue: Mutex<SendQueue>,
    pub queue_notify: Notify,
    pub arq: Mutex<ArqTracker>,
    pub registry: SessionRegistry,
    pub session_id: u32,
    /// Next wire sequence number, owned by the pacer
    pub next_seq: AtomicU32,
    /// Published by the feedback worker, read by governor and pacer
    pub target_bitrate: AtomicU64,
    /// Published by the feedback worker, read by the pacer
    pub pacing_interval_us: AtomicU64,
    /// Encoder output rate over the last second, bits per second
    pub output_bitrate: AtomicU64,
    /// QP the governor will start the next frame from
    pub current_qp: AtomicU64,
    /// Newest capture timestamp seen; the stream clock for staleness
    pub latest_capture_ts_us: AtomicU64,
    pub callbacks: EngineCallbacks,
}

impl Shared {
    pub fn status(&self, message: &str) {
        info!("{message}");
        if let Some(cb) = &self.callbacks.on_status {
            cb(message);
        }
    }

    /// Bytes the send queue may hold at the current target bitrate
    pub fn queue_budget_bytes(&self) -> usize {
        let bitrate = self.target_bitrate.load(Ordering::Relaxed);
        let bytes_per_ms = bitrate / 8 / 1000;
        (bytes_per_ms * self.config.transport.max_queue_latency_ms).max(4096) as usize
    }
}

/// A running streaming engine
///
/// Construct with [`Engine::new`] inside a tokio runtime; feed frames
/// with [`Engine::submit`]; stop with [`Engine::shutdown`].
pub struct Engine {
    shared: Arc<Shared>,
    frame_tx: mpsc::Sender<RawFrame>,
    audio_tx: mpsc::Sender<AudioPayload>,
    shutdown_tx: broadcast::Sender<()>,
    workers: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Validate the configuration, open the socket and start the workers
    ///
    /// A fatal configuration or socket problem fires the error callback
    /// once and returns the error; nothing is left running.
    pub async fn new(config: Config, callbacks: EngineCallbacks) -> Result<Engine, EngineError> {
        if let Err(err) = config.validate() {
            let err = EngineError::from(err);
            if let Some(cb) = &callbacks.on_error {
                cb(&err);
            }
            return Err(err);
        }

        let remote = format!("{}:{}", config.network.remote_host, config.network.remote_port);
        let resolved = match tokio::net::lookup_host(&remote).await {
            Ok(mut addrs) => addrs.next(),
            Err(_) => None,
        };
        let Some(remote_addr) = resolved else {
            let err = EngineError::UnresolvableRemote(remote);
            if let Some(cb) = &callbacks.on_error {
                cb(&err);
            }
            return Err(err);
        };

        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(err) => {
                let err = EngineError::from(err);
                if let Some(cb) = &callbacks.on_error {
                    cb(&err);
                }
                return Err(err);
            }
        };
        socket.connect(remote_addr).await.map_err(|err| {
            let err = EngineError::from(err);
            if let Some(cb) = &callbacks.on_error {
                cb(&err);
            }
            err
        })?;
        let socket = Arc::new(socket);

        let registry = SessionRegistry::new(Duration::from_secs(
            config.transport.session_idle_timeout_secs,
        ));
        let session = registry.create(remote_addr, Instant::now());
        let session_id = session.session_id;

        let congestion = CongestionController::new(CongestionConfig {
            initial_bitrate: config.bitrate.initial_bitrate,
            min_bitrate: config.bitrate.min_bitrate,
            max_bitrate: config.bitrate.max_bitrate,
            max_latency_ms: config.transport.max_latency_ms,
        });
        let initial_bitrate = congestion.target_bitrate();
        let initial_pacing = congestion.pacing_interval_us();

        let shared = Arc::new(Shared {
            counters: EngineCounters::default(),
            congestion: Mutex::new(congestion),
            send_queue: Mutex::new(SendQueue::new(4096)),
            queue_notify: Notify::new(),
            arq: Mutex::new(ArqTracker::new()),
            registry,
            session_id,
            next_seq: AtomicU32::new(0),
            target_bitrate: AtomicU64::new(initial_bitrate),
            pacing_interval_us: AtomicU64::new(initial_pacing),
            output_bitrate: AtomicU64::new(0),
            current_qp: AtomicU64::new(u64::from(config.encoder.initial_qp)),
            latest_capture_ts_us: AtomicU64::new(0),
            callbacks,
            config,
        });
        shared
            .send_queue
            .lock()
            .set_byte_budget(shared.queue_budget_bytes());

        let (frame_tx, frame_rx) = mpsc::channel(4);
        let (encoded_tx, encoded_rx) = mpsc::channel(workers::ENCODED_CHANNEL_DEPTH);
        let (audio_tx, audio_rx) = mpsc::channel(8);
        let (shutdown_tx, _) = broadcast::channel(1);

        let workers = vec![
            tokio::spawn(workers::encoder_worker(
                Arc::clone(&shared),
                frame_rx,
                encoded_tx,
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(workers::packetizer_worker(
                Arc::clone(&shared),
                encoded_rx,
                audio_rx,
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(workers::network_worker(
                Arc::clone(&shared),
                Arc::clone(&socket),
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(workers::feedback_worker(
                Arc::clone(&shared),
                Arc::clone(&socket),
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(workers::housekeeping_worker(
                Arc::clone(&shared),
                shutdown_tx.subscribe(),
            )),
        ];

        workers::enqueue_handshake(&shared);
        shared.status(&format!("session {session_id:08x} created toward {remote_addr}"));
        if shared.config.codec.hardware_acceleration {
            // Hint only: no hardware path exists in the software loop
            shared.status("hardware acceleration requested; software codec active");
        }

        Ok(Engine {
            shared,
            frame_tx,
            audio_tx,
            shutdown_tx,
            workers,
        })
    }

    /// Submit one raw frame for encoding and transmission
    ///
    /// Applies backpressure: awaits when the encoder is behind.
    pub async fn submit(&self, frame: RawFrame) -> Result<(), EngineError> {
        self.shared
            .latest_capture_ts_us
            .fetch_max(frame.capture_ts_us, Ordering::Relaxed);
        self.frame_tx
            .send(frame)
            .await
            .map_err(|_| EngineError::ShuttingDown)
    }

    /// Submit pre-encoded audio for passthrough transmission
    pub async fn submit_audio(&self, audio: AudioPayload) -> Result<(), EngineError> {
        self.shared
            .latest_capture_ts_us
            .fetch_max(audio.capture_ts_us, Ordering::Relaxed);
        self.audio_tx
            .send(audio)
            .await
            .map_err(|_| EngineError::ShuttingDown)
    }

    /// Current statistics, on demand (the callback fires independently)
    pub fn statistics(&self) -> StatsSnapshot {
        workers::assemble_snapshot(&self.shared)
    }

    /// Stop all workers, close the session, release resources
    pub async fn shutdown(self) {
        workers::enqueue_close(&self.shared);
        // Give the pacer one pacing interval to flush the close packet
        tokio::time::sleep(Duration::from_millis(5)).await;

        let _ = self.shutdown_tx.send(());
        self.shared.queue_notify.notify_waiters();
        for worker in self.workers {
            let _ = worker.await;
        }
        self.shared.registry.close(self.shared.session_id);
        self.shared.status("engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn tiny_config(remote_port: u16) -> Config {
        let mut config = Config::default();
        config.network.remote_host = "127.0.0.1".into();
        config.network.remote_port = remote_port;
        config.codec.width = 64;
        config.codec.height = 64;
        config.codec.complexity = 6;
        config.encoder.max_encoding_time_ms = 1000;
        config.encoder.target_frame_period_ms = 1000;
        config
    }

    fn gray_frame(id: u64) -> RawFrame {
        RawFrame::luma_only(64, 64, Bytes::from(vec![128u8; 64 * 64]), id * 33_333 + 1, id)
    }

    #[tokio::test]
    async fn test_invalid_config_fires_one_error_callback() {
        let mut config = tiny_config(40000);
        config.bitrate.min_bitrate = 10;
        config.bitrate.max_bitrate = 5;
        config.bitrate.initial_bitrate = 7;

        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        let callbacks = EngineCallbacks {
            on_error: Some(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..EngineCallbacks::default()
        };

        let result = Engine::new(config, callbacks).await;
        assert!(matches!(result, Err(EngineError::Config(_))));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_frames_reach_the_wire_in_seq_order() {
        use crate::transport::packet::{Packet, PacketKind};

        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let engine = Engine::new(tiny_config(port), EngineCallbacks::default())
            .await
            .unwrap();
        for i in 0..3 {
            engine.submit(gray_frame(i)).await.unwrap();
        }

        let mut buf = [0u8; 2048];
        let mut seqs = Vec::new();
        let mut video_packets = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while video_packets < 3 {
            let n = tokio::select! {
                r = receiver.recv_from(&mut buf) => r.unwrap().0,
                _ = tokio::time::sleep_until(deadline) => panic!("timed out waiting for packets"),
            };
            let packet = Packet::decode(&buf[..n]).expect("valid wire packet");
            seqs.push(packet.header.seq);
            if packet.header.kind == PacketKind::Video {
                video_packets += 1;
            }
        }

        // Sequence numbers are strictly increasing from zero
        for (i, &seq) in seqs.iter().enumerate() {
            assert_eq!(seq, i as u32);
        }
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_idle_session_emits_status() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let mut config = tiny_config(port);
        config.transport.session_idle_timeout_secs = 1;

        let messages: Arc<parking_lot::Mutex<Vec<String>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&messages);
        let callbacks = EngineCallbacks {
            on_status: Some(Arc::new(move |msg: &str| {
                sink.lock().push(msg.to_string());
            })),
            ..EngineCallbacks::default()
        };

        let engine = Engine::new(config, callbacks).await.unwrap();
        // Send nothing; the session must expire idle
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(
            messages.lock().iter().any(|m| m.contains("idle")),
            "expected an idle-close status, got {:?}",
            messages.lock()
        );
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_statistics_reflect_traffic() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let engine = Engine::new(tiny_config(port), EngineCallbacks::default())
            .await
            .unwrap();
        for i in 0..2 {
            engine.submit(gray_frame(i)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(800)).await;

        let stats = engine.statistics();
        assert!(stats.frames_encoded >= 1, "stats: {stats:?}");
        assert!(stats.packets_sent >= 1);
        assert!(stats.bytes_sent > 0);
        assert_eq!(stats.sessions, 1);
        engine.shutdown().await;
    }
}
