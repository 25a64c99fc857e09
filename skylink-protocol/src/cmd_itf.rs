//! Command interface
//!
//! One per connected device. Owns three transmit queues (no-ack, with-ack,
//! high-priority with-ack), a receive dedup window, per-queue ack bookkeeping
//! and a link-quality estimator.
//!
//! ## Queues
//!
//! Each queue is a small state machine driven by its own task: entries are
//! sent strictly FIFO, pacing applies between two sends from the same queue,
//! and ack-bearing queues are stop-and-wait: the head entry must be acked,
//! retried to exhaustion or canceled before the next entry goes out. No
//! ordering is guaranteed between queues.
//!
//! ## Statuses
//!
//! Every send hands back a status channel. Intermediate events (`Packed`,
//! `Sent`) carry `done == false`; exactly one terminal event (`AckReceived`,
//! `Timeout`, `Canceled` or `Aborted`) is delivered with `done == true` for
//! commands on ack-bearing queues.

use crate::command::{BufferType, CmdSendStatus, Command, PackRecvStatus, PackSendStatus};
use crate::frame::{seq_after, seq_next, DataType, Frame};
use crate::logger::{CmdDir, CommandLogger};
use crate::transport::{Transport, TransportEvent};
use crate::{Result, SdkError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Transmit queue id of the fire-and-forget queue
pub const QUEUE_ID_NO_ACK: u8 = 10;
/// Transmit queue id of the acknowledged queue
pub const QUEUE_ID_WITH_ACK: u8 = 11;
/// Transmit queue id of the high-priority acknowledged queue
pub const QUEUE_ID_HIGH_PRIO: u8 = 12;

/// Ack queue-id offset on the net backend
pub const ACK_QUEUE_OFFSET_NET: u8 = 10;
/// Ack queue-id offset on the BLE backend
pub const ACK_QUEUE_OFFSET_BLE: u8 = 8;

/// Configuration of one transmit queue
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Queue id carried in every frame header
    pub id: u8,

    /// Minimum delay between two sends from this queue
    pub max_tx_rate: Duration,
    /// How long to wait for an ack before retrying
    pub ack_timeout: Duration,
    /// Retry budget after the initial send; ignored on no-ack queues
    pub max_retry: i32,
    /// Replace the oldest pending entry instead of queueing behind it
    pub overwrite: bool,
}

/// Configuration of a command interface
#[derive(Debug, Clone, Copy)]
pub struct CmdItfConfig {
    /// Fire-and-forget queue
    pub no_ack: QueueConfig,

    /// Acknowledged queue with a bounded retry budget
    pub with_ack: QueueConfig,

    /// Acknowledged queue retried until canceled
    pub high_prio: QueueConfig,

    /// Offset between a data queue id and its paired ack queue id
    pub ack_queue_offset: u8,
}

impl CmdItfConfig {
    /// Defaults for devices reached over the local network
    pub fn net() -> Self {
        Self {
            no_ack: QueueConfig {
                id: QUEUE_ID_NO_ACK,
                max_tx_rate: Duration::ZERO,
                ack_timeout: Duration::ZERO,
                max_retry: 0,
                overwrite: true,
            },
            with_ack: QueueConfig {
                id: QUEUE_ID_WITH_ACK,
                max_tx_rate: Duration::ZERO,
                ack_timeout: Duration::from_millis(150),
                max_retry: 5,
                overwrite: false,
            },
            high_prio: QueueConfig {
                id: QUEUE_ID_HIGH_PRIO,
                max_tx_rate: Duration::ZERO,
                ack_timeout: Duration::from_millis(150),
                max_retry: i32::MAX,
                overwrite: false,
            },
            ack_queue_offset: ACK_QUEUE_OFFSET_NET,
        }
    }

    /// Defaults for devices reached over BLE; only the queue tuning differs
    pub fn ble() -> Self {
        let mut cfg = Self::net();
        cfg.with_ack.max_tx_rate = Duration::from_millis(50);
        cfg.with_ack.ack_timeout = Duration::from_millis(750);
        cfg.ack_queue_offset = ACK_QUEUE_OFFSET_BLE;
        cfg
    }

    fn queue_for(&self, buffer_type: BufferType) -> QueueConfig {
        match buffer_type {
            BufferType::NoAck => self.no_ack,
            BufferType::WithAck | BufferType::StreamAck => self.with_ack,
            BufferType::HighPrio => self.high_prio,
        }
    }
}

/// One status transition of a sent command
#[derive(Debug, Clone, Copy)]
pub struct CmdStatusEvent {
    pub status: CmdSendStatus,
    /// Set on the last event the command will ever report
    pub done: bool,
    /// Sequence number the command was sent with, once assigned
    pub seq: Option<u8>,
    /// Timeout-triggered resends performed so far
    pub retries_consumed: u32,
}

/// Link quality estimate over the last one-second window, in percent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkQuality {
    /// Acked sends / send attempts
    pub tx_quality: u32,
    /// In-sequence frames / frames received
    pub rx_quality: u32,
    /// Non-duplicate frames / frames received
    pub rx_useful: u32,
}

/// Event emitted by the command interface
#[derive(Debug, Clone)]
pub enum CmdItfEvent {
    /// A command arrived from the device
    Received(Command),
    /// Periodic link-quality estimate (roughly 1 Hz)
    LinkQuality(LinkQuality),
    /// The transport link is gone
    LinkDown,
}

struct PendingCmd {
    cmd: Command,
    status_tx: mpsc::UnboundedSender<CmdStatusEvent>,
}

struct QueueState {
    pending: VecDeque<PendingCmd>,
    next_seq: u8,
    last_send: Option<Instant>,
    /// Terminates the in-flight entry early with the given status
    in_flight_cancel: Option<oneshot::Sender<CmdSendStatus>>,
}

struct TxQueue {
    cfg: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Default)]
struct QualityCounters {
    tx_attempts: u64,
    tx_acked: u64,
    rx_total: u64,
    rx_in_seq: u64,
    rx_useful: u64,
}

struct AckWaiter {
    seq: u8,
    tx: oneshot::Sender<()>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: CmdItfConfig,
    logger: Option<Arc<CommandLogger>>,
    queues: HashMap<u8, Arc<TxQueue>>,
    /// In-flight ack waiters keyed by transmit queue id
    ack_waiters: Mutex<HashMap<u8, AckWaiter>>,
    /// Last seen sequence per receive queue
    rx_last_seen: Mutex<HashMap<u8, u8>>,
    /// Next sequence per ack queue, doubling as the sent-ack counter
    ack_tx_seq: Mutex<HashMap<u8, u8>>,
    counters: Mutex<QualityCounters>,
    event_tx: mpsc::UnboundedSender<CmdItfEvent>,
    stopped: AtomicBool,
    shutdown: Notify,
}

/// Command interface over one device transport
pub struct CommandInterface {
    inner: Arc<Inner>,
}

impl CommandInterface {
    /// Create the interface over an established transport
    ///
    /// `transport_events` is the receive side handed out by the transport
    /// constructor. The returned receiver yields received commands,
    /// link-quality estimates and link-down notification.
    pub fn new(
        transport: Arc<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        config: CmdItfConfig,
        logger: Option<Arc<CommandLogger>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CmdItfEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut queues = HashMap::new();
        for cfg in [config.no_ack, config.with_ack, config.high_prio] {
            queues.insert(
                cfg.id,
                Arc::new(TxQueue {
                    cfg,
                    state: Mutex::new(QueueState {
                        pending: VecDeque::new(),
                        next_seq: 0,
                        last_send: None,
                        in_flight_cancel: None,
                    }),
                    notify: Notify::new(),
                }),
            );
        }

        let inner = Arc::new(Inner {
            transport,
            config,
            logger,
            queues,
            ack_waiters: Mutex::new(HashMap::new()),
            rx_last_seen: Mutex::new(HashMap::new()),
            ack_tx_seq: Mutex::new(HashMap::new()),
            counters: Mutex::new(QualityCounters::default()),
            event_tx,
            stopped: AtomicBool::new(false),
            shutdown: Notify::new(),
        });

        for queue in inner.queues.values() {
            tokio::spawn(Inner::queue_loop(inner.clone(), queue.clone()));
        }
        tokio::spawn(Inner::rx_loop(inner.clone(), transport_events));
        tokio::spawn(Inner::quality_loop(inner.clone()));

        let itf = Arc::new(Self { inner });
        (itf, event_rx)
    }

    /// Enqueue a command for transmission
    ///
    /// The queue is selected from the command's buffer type. Returns the
    /// command's status channel.
    pub async fn send(
        &self,
        cmd: Command,
    ) -> Result<mpsc::UnboundedReceiver<CmdStatusEvent>> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(SdkError::not_permitted("command interface is stopped"));
        }
        let queue_cfg = self.inner.config.queue_for(cmd.buffer_type);
        let queue = self
            .inner
            .queues
            .get(&queue_cfg.id)
            .expect("queue exists for every buffer type");

        if let Some(logger) = &self.inner.logger {
            logger.log_cmd(CmdDir::Tx, &cmd).ok();
        }

        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let mut state = queue.state.lock().await;
        if queue.cfg.overwrite && !state.pending.is_empty() {
            // Latest wins for periodic piloting commands.
            if let Some(old) = state.pending.pop_front() {
                let _ = old.status_tx.send(CmdStatusEvent {
                    status: CmdSendStatus::Canceled,
                    done: true,
                    seq: None,
                    retries_consumed: 0,
                });
            }
        }
        state.pending.push_back(PendingCmd { cmd, status_tx });
        drop(state);
        queue.notify.notify_one();
        Ok(status_rx)
    }

    /// Cancel every pending and in-flight command
    ///
    /// Each affected command reports `Canceled` exactly once; ack timers are
    /// disarmed before the status events fire.
    pub async fn cancel_all(&self) {
        self.inner.drain_queues(CmdSendStatus::Canceled).await;
    }

    /// Tear the interface down; pending commands report `Aborted`
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.drain_queues(CmdSendStatus::Aborted).await;
        self.inner.shutdown.notify_waiters();
        self.inner.transport.stop().await;
    }
}

impl Inner {
    async fn drain_queues(&self, status: CmdSendStatus) {
        for queue in self.queues.values() {
            let mut state = queue.state.lock().await;
            // Disarm the in-flight timer before any callback runs.
            if let Some(cancel) = state.in_flight_cancel.take() {
                let _ = cancel.send(status);
            }
            while let Some(entry) = state.pending.pop_front() {
                let _ = entry.status_tx.send(CmdStatusEvent {
                    status,
                    done: true,
                    seq: None,
                    retries_consumed: 0,
                });
            }
        }
    }

    async fn queue_loop(inner: Arc<Inner>, queue: Arc<TxQueue>) {
        loop {
            if inner.stopped.load(Ordering::SeqCst) {
                return;
            }

            // Wait for an entry to exist.
            {
                let state = queue.state.lock().await;
                if state.pending.is_empty() {
                    drop(state);
                    tokio::select! {
                        _ = queue.notify.notified() => {}
                        _ = inner.shutdown.notified() => return,
                    }
                    continue;
                }
            }

            // Pacing runs with the entry still pending, so a later enqueue
            // on an overwrite queue can still replace it.
            let wait = {
                let state = queue.state.lock().await;
                match state.last_send {
                    Some(last) => queue.cfg.max_tx_rate.saturating_sub(last.elapsed()),
                    None => Duration::ZERO,
                }
            };
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }

            let (entry, seq) = {
                let mut state = queue.state.lock().await;
                match state.pending.pop_front() {
                    Some(entry) => {
                        let seq = state.next_seq;
                        state.next_seq = seq_next(seq);
                        (entry, seq)
                    }
                    // Drained while pacing.
                    None => continue,
                }
            };

            inner.run_entry(&queue, entry, seq).await;
            queue.state.lock().await.last_send = Some(Instant::now());
        }
    }

    async fn run_entry(&self, queue: &TxQueue, entry: PendingCmd, seq: u8) {
        let needs_ack = entry.cmd.buffer_type.needs_ack();
        let data_type = if needs_ack {
            DataType::DataWithAck
        } else {
            DataType::Data
        };
        let frame = Frame::new(data_type, queue.cfg.id, seq, entry.cmd.to_bytes());
        let frame_len = frame.to_bytes().len();

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        queue.state.lock().await.in_flight_cancel = Some(cancel_tx);

        let mut retries_consumed: u32 = 0;
        let mut attempt: i64 = 0;
        let max_retry = if needs_ack { queue.cfg.max_retry as i64 } else { 0 };

        let terminal = loop {
            // Arm the ack waiter before the frame leaves, so an immediate
            // ack cannot be lost.
            let ack_rx = if needs_ack {
                let (tx, rx) = oneshot::channel();
                self.ack_waiters
                    .lock()
                    .await
                    .insert(queue.cfg.id, AckWaiter { seq, tx });
                Some(rx)
            } else {
                None
            };

            self.counters.lock().await.tx_attempts += 1;
            if let Err(e) = self.transport.send_frame(&frame).await {
                debug!("queue {}: send failed: {}", queue.cfg.id, e);
            }
            if let Some(logger) = &self.logger {
                logger
                    .log_pack_send_status(
                        seq as u32,
                        entry.cmd.buffer_type,
                        frame_len,
                        PackSendStatus::Sent,
                        1,
                    )
                    .ok();
                logger
                    .log_cmd_send_status(
                        &entry.cmd,
                        entry.cmd.buffer_type,
                        CmdSendStatus::Packed,
                        seq as u16,
                    )
                    .ok();
            }
            if attempt == 0 {
                let _ = entry.status_tx.send(CmdStatusEvent {
                    status: CmdSendStatus::Packed,
                    done: false,
                    seq: Some(seq),
                    retries_consumed,
                });
                let _ = entry.status_tx.send(CmdStatusEvent {
                    status: CmdSendStatus::Sent,
                    done: !needs_ack,
                    seq: Some(seq),
                    retries_consumed,
                });
            }

            let Some(ack_rx) = ack_rx else {
                // Fire-and-forget: terminal was the Sent event above.
                break None;
            };

            tokio::select! {
                ack = ack_rx => {
                    if ack.is_ok() {
                        self.counters.lock().await.tx_acked += 1;
                        break Some(CmdSendStatus::AckReceived);
                    }
                    // Waiter dropped without firing: treat as one timeout.
                    if attempt >= max_retry {
                        break Some(CmdSendStatus::Timeout);
                    }
                }
                status = &mut cancel_rx => {
                    self.ack_waiters.lock().await.remove(&queue.cfg.id);
                    break Some(status.unwrap_or(CmdSendStatus::Canceled));
                }
                _ = tokio::time::sleep(queue.cfg.ack_timeout) => {
                    self.ack_waiters.lock().await.remove(&queue.cfg.id);
                    if attempt >= max_retry {
                        break Some(CmdSendStatus::Timeout);
                    }
                    retries_consumed += 1;
                }
            }
            attempt += 1;
        };

        queue.state.lock().await.in_flight_cancel = None;

        if let Some(status) = terminal {
            if let Some(logger) = &self.logger {
                logger
                    .log_cmd_send_status(
                        &entry.cmd,
                        entry.cmd.buffer_type,
                        status,
                        seq as u16,
                    )
                    .ok();
                let pack_status = match status {
                    CmdSendStatus::AckReceived => PackSendStatus::AckReceived,
                    CmdSendStatus::Timeout => PackSendStatus::Timeout,
                    _ => PackSendStatus::Canceled,
                };
                logger
                    .log_pack_send_status(
                        seq as u32,
                        entry.cmd.buffer_type,
                        frame_len,
                        pack_status,
                        retries_consumed,
                    )
                    .ok();
            }
            let _ = entry.status_tx.send(CmdStatusEvent {
                status,
                done: true,
                seq: Some(seq),
                retries_consumed,
            });
        }
    }

    async fn rx_loop(
        inner: Arc<Inner>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            let event = tokio::select! {
                event = transport_events.recv() => event,
                _ = inner.shutdown.notified() => return,
            };
            match event {
                Some(TransportEvent::Frame(frame)) => inner.handle_frame(frame).await,
                Some(TransportEvent::LinkDown) | None => {
                    let _ = inner.event_tx.send(CmdItfEvent::LinkDown);
                    return;
                }
            }
        }
    }

    async fn handle_frame(&self, frame: Frame) {
        if frame.data_type == DataType::Ack {
            self.handle_ack(frame).await;
            return;
        }

        let frame_len = frame.to_bytes().len();
        let needs_ack = frame.data_type == DataType::DataWithAck;
        let buffer_type = if needs_ack {
            BufferType::WithAck
        } else {
            BufferType::NoAck
        };

        {
            let mut counters = self.counters.lock().await;
            counters.rx_total += 1;
        }

        // Send the ack first so the peer can retire its entry even when the
        // frame turns out to be a duplicate.
        if needs_ack {
            let ack_queue = frame.queue_id.wrapping_add(self.config.ack_queue_offset);
            let ack_seq = {
                let mut seqs = self.ack_tx_seq.lock().await;
                let entry = seqs.entry(ack_queue).or_insert(0);
                let seq = *entry;
                *entry = seq_next(seq);
                seq
            };
            let ack = Frame::ack(ack_queue, ack_seq, frame.seq);
            if let Err(e) = self.transport.send_frame(&ack).await {
                debug!("failed to ack seq {} on queue {}: {}", frame.seq, ack_queue, e);
            } else if let Some(logger) = &self.logger {
                logger
                    .log_pack_recv_status(
                        frame.seq as u32,
                        buffer_type,
                        frame_len,
                        PackRecvStatus::AckSent,
                    )
                    .ok();
            }
        }

        // Only the frame exactly one ahead of the last seen sequence is
        // dispatched; duplicates and out-of-order frames (behind or ahead)
        // are dropped. Ahead frames still count as non-duplicate traffic.
        let (accept, useful) = {
            let mut last_seen = self.rx_last_seen.lock().await;
            match last_seen.get(&frame.queue_id).copied() {
                None => {
                    last_seen.insert(frame.queue_id, frame.seq);
                    (true, true)
                }
                Some(last) => {
                    if frame.seq == seq_next(last) {
                        last_seen.insert(frame.queue_id, frame.seq);
                        (true, true)
                    } else {
                        (false, seq_after(frame.seq, last))
                    }
                }
            }
        };

        {
            let mut counters = self.counters.lock().await;
            if accept {
                counters.rx_in_seq += 1;
            }
            if useful {
                counters.rx_useful += 1;
            }
        }

        if let Some(logger) = &self.logger {
            let status = if accept {
                PackRecvStatus::Processed
            } else {
                PackRecvStatus::Ignored
            };
            logger
                .log_pack_recv_status(frame.seq as u32, buffer_type, frame_len, status)
                .ok();
        }

        if !accept {
            debug!(
                "queue {}: dropped out-of-order frame seq {}",
                frame.queue_id, frame.seq
            );
            return;
        }

        match Command::from_bytes(&frame.payload, buffer_type) {
            Ok(cmd) => {
                if let Some(logger) = &self.logger {
                    logger.log_cmd(CmdDir::Rx, &cmd).ok();
                }
                let _ = self.event_tx.send(CmdItfEvent::Received(cmd));
            }
            Err(e) => warn!("queue {}: bad command payload: {}", frame.queue_id, e),
        }
    }

    async fn handle_ack(&self, frame: Frame) {
        let Ok(acked_seq) = frame.acked_seq() else {
            warn!("malformed ack frame on queue {}", frame.queue_id);
            return;
        };
        let tx_queue = frame.queue_id.wrapping_sub(self.config.ack_queue_offset);
        let mut waiters = self.ack_waiters.lock().await;
        match waiters.get(&tx_queue) {
            Some(waiter) if waiter.seq == acked_seq => {
                if let Some(waiter) = waiters.remove(&tx_queue) {
                    let _ = waiter.tx.send(());
                }
            }
            _ => debug!(
                "unmatched ack seq {} for queue {}",
                acked_seq, tx_queue
            ),
        }
    }

    async fn quality_loop(inner: Arc<Inner>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.tick().await; // immediate first tick carries no data
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = inner.shutdown.notified() => return,
            }
            let quality = {
                let mut counters = inner.counters.lock().await;
                let quality = LinkQuality {
                    tx_quality: percent(counters.tx_acked, counters.tx_attempts),
                    rx_quality: percent(counters.rx_in_seq, counters.rx_total),
                    rx_useful: percent(counters.rx_useful, counters.rx_total),
                };
                *counters = QualityCounters::default();
                quality
            };
            if inner.event_tx.send(CmdItfEvent::LinkQuality(quality)).is_err() {
                break;
            }
        }
    }
}

fn percent(num: u64, div: u64) -> u32 {
    if div == 0 {
        100
    } else {
        ((num * 100) / div) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportType;
    use async_trait::async_trait;
    use bytes::Bytes;

    /// Transport stub: records sent frames, acks or drops per policy
    struct StubTransport {
        sent: Mutex<Vec<Frame>>,
        ack_policy: AckPolicy,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
        ack_offset: u8,
    }

    #[derive(Clone, Copy, PartialEq)]
    enum AckPolicy {
        AckAll,
        DropAll,
    }

    impl StubTransport {
        fn new(
            ack_policy: AckPolicy,
        ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    sent: Mutex::new(Vec::new()),
                    ack_policy,
                    event_tx,
                    ack_offset: ACK_QUEUE_OFFSET_NET,
                }),
                event_rx,
            )
        }

        async fn sent_frames(&self) -> Vec<Frame> {
            self.sent.lock().await.clone()
        }

        fn inject(&self, frame: Frame) {
            let _ = self.event_tx.send(TransportEvent::Frame(frame));
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        fn transport_type(&self) -> TransportType {
            TransportType::Net
        }

        async fn send_frame(&self, frame: &Frame) -> Result<()> {
            self.sent.lock().await.push(frame.clone());
            if frame.data_type == DataType::DataWithAck
                && self.ack_policy == AckPolicy::AckAll
            {
                let ack = Frame::ack(
                    frame.queue_id.wrapping_add(self.ack_offset),
                    0,
                    frame.seq,
                );
                let _ = self.event_tx.send(TransportEvent::Frame(ack));
            }
            Ok(())
        }

        async fn stop(&self) {}
    }

    fn test_cmd(buffer_type: BufferType) -> Command {
        Command::new(0, 2, 0, Bytes::new(), buffer_type)
    }

    async fn wait_terminal(
        rx: &mut mpsc::UnboundedReceiver<CmdStatusEvent>,
    ) -> CmdStatusEvent {
        loop {
            let event = rx.recv().await.expect("status channel closed early");
            if event.done {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_with_ack_send_and_ack() {
        let (transport, events) = StubTransport::new(AckPolicy::AckAll);
        let (itf, _itf_rx) = CommandInterface::new(
            transport.clone(),
            events,
            CmdItfConfig::net(),
            None,
        );

        let mut status = itf.send(test_cmd(BufferType::WithAck)).await.unwrap();
        let terminal = wait_terminal(&mut status).await;
        assert_eq!(terminal.status, CmdSendStatus::AckReceived);
        assert_eq!(terminal.retries_consumed, 0);
        assert_eq!(terminal.seq, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_to_timeout() {
        let (transport, events) = StubTransport::new(AckPolicy::DropAll);
        let (itf, _itf_rx) = CommandInterface::new(
            transport.clone(),
            events,
            CmdItfConfig::net(),
            None,
        );

        let mut status = itf.send(test_cmd(BufferType::WithAck)).await.unwrap();
        let terminal = wait_terminal(&mut status).await;
        assert_eq!(terminal.status, CmdSendStatus::Timeout);
        assert_eq!(terminal.retries_consumed, 5);
        // Initial send plus five retries.
        assert_eq!(transport.sent_frames().await.len(), 6);
    }

    #[tokio::test]
    async fn test_overwrite_queue_cancels_oldest() {
        let (transport, events) = StubTransport::new(AckPolicy::AckAll);
        // Pace the no-ack queue so the first command is still pending when
        // the second arrives.
        let mut config = CmdItfConfig::net();
        config.no_ack.max_tx_rate = Duration::from_millis(200);
        let (itf, _itf_rx) = CommandInterface::new(transport.clone(), events, config, None);

        // Prime the pacing clock.
        let mut first = itf.send(test_cmd(BufferType::NoAck)).await.unwrap();
        wait_terminal(&mut first).await;

        let mut second = itf.send(test_cmd(BufferType::NoAck)).await.unwrap();
        let mut third = itf.send(test_cmd(BufferType::NoAck)).await.unwrap();

        let canceled = wait_terminal(&mut second).await;
        assert_eq!(canceled.status, CmdSendStatus::Canceled);
        let sent = wait_terminal(&mut third).await;
        assert_eq!(sent.status, CmdSendStatus::Sent);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let (transport, events) = StubTransport::new(AckPolicy::DropAll);
        let (itf, _itf_rx) = CommandInterface::new(
            transport.clone(),
            events,
            CmdItfConfig::net(),
            None,
        );

        let mut status = itf.send(test_cmd(BufferType::HighPrio)).await.unwrap();
        // Let the queue task pick the entry up.
        tokio::time::sleep(Duration::from_millis(20)).await;
        itf.cancel_all().await;
        let terminal = wait_terminal(&mut status).await;
        assert_eq!(terminal.status, CmdSendStatus::Canceled);
    }

    #[tokio::test]
    async fn test_stop_aborts_pending() {
        let (transport, events) = StubTransport::new(AckPolicy::DropAll);
        let (itf, _itf_rx) = CommandInterface::new(
            transport.clone(),
            events,
            CmdItfConfig::net(),
            None,
        );

        let mut status = itf.send(test_cmd(BufferType::WithAck)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        itf.stop().await;
        let terminal = wait_terminal(&mut status).await;
        assert_eq!(terminal.status, CmdSendStatus::Aborted);
        assert!(itf.send(test_cmd(BufferType::WithAck)).await.is_err());
    }

    #[tokio::test]
    async fn test_receive_acks_and_dedups() {
        let (transport, events) = StubTransport::new(AckPolicy::AckAll);
        let (_itf, mut itf_rx) = CommandInterface::new(
            transport.clone(),
            events,
            CmdItfConfig::net(),
            None,
        );

        let payload = test_cmd(BufferType::WithAck).to_bytes();
        let rx_queue = 127u8;
        transport.inject(Frame::new(DataType::DataWithAck, rx_queue, 0, payload.clone()));
        transport.inject(Frame::new(DataType::DataWithAck, rx_queue, 0, payload.clone()));
        transport.inject(Frame::new(DataType::DataWithAck, rx_queue, 1, payload.clone()));

        let mut received = 0;
        for _ in 0..2 {
            match itf_rx.recv().await.unwrap() {
                CmdItfEvent::Received(_) => received += 1,
                CmdItfEvent::LinkQuality(_) => continue,
                CmdItfEvent::LinkDown => panic!("unexpected link down"),
            }
        }
        assert_eq!(received, 2);

        // Both frames (duplicate included) were acked on the offset queue.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let acks: Vec<_> = transport
            .sent_frames()
            .await
            .into_iter()
            .filter(|f| f.data_type == DataType::Ack)
            .collect();
        assert_eq!(acks.len(), 3);
        assert_eq!(acks[0].queue_id, rx_queue.wrapping_add(ACK_QUEUE_OFFSET_NET));
    }

    #[tokio::test]
    async fn test_skip_ahead_frame_is_dropped() {
        let (transport, events) = StubTransport::new(AckPolicy::AckAll);
        let (_itf, mut itf_rx) = CommandInterface::new(
            transport.clone(),
            events,
            CmdItfConfig::net(),
            None,
        );

        let payload = test_cmd(BufferType::NoAck).to_bytes();
        transport.inject(Frame::new(DataType::Data, 126, 5, payload.clone()));
        // Seq 7 skips ahead of the expected 6: out of order, not dispatched.
        transport.inject(Frame::new(DataType::Data, 126, 7, payload.clone()));
        transport.inject(Frame::new(DataType::Data, 126, 6, payload.clone()));

        let mut received = 0;
        for _ in 0..2 {
            if let CmdItfEvent::Received(_) = itf_rx.recv().await.unwrap() {
                received += 1;
            }
        }
        assert_eq!(received, 2);
        // Nothing else arrives: the skipped frame stayed dropped.
        let extra =
            tokio::time::timeout(Duration::from_millis(50), itf_rx.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_seq_wraparound_in_sequence() {
        let (transport, events) = StubTransport::new(AckPolicy::AckAll);
        let (_itf, mut itf_rx) = CommandInterface::new(
            transport.clone(),
            events,
            CmdItfConfig::net(),
            None,
        );

        let payload = test_cmd(BufferType::NoAck).to_bytes();
        transport.inject(Frame::new(DataType::Data, 126, 255, payload.clone()));
        transport.inject(Frame::new(DataType::Data, 126, 0, payload.clone()));

        let mut received = 0;
        for _ in 0..2 {
            if let CmdItfEvent::Received(_) = itf_rx.recv().await.unwrap() {
                received += 1;
            }
        }
        assert_eq!(received, 2);
    }
}
