//! Per-flow TCP state machine.
//!
//! The stack terminates guest TCP itself: every connection is accepted
//! locally, its client byte stream is reassembled in order, and the response
//! bytes handed to [`TcpConn::send`] are segmented, retransmitted and paced
//! against the guest's advertised window. The machine is sans-I/O; it
//! consumes parsed segments plus a millisecond clock and emits
//! [`SegmentOut`]s and [`StreamEvent`]s.

use std::collections::BTreeMap;

use sandnet_packet::tcp::TcpFlags;

pub type Millis = u64;

/// Fixed advertised receive window. Never scaled.
pub const RECV_WINDOW: u16 = u16::MAX;
/// Segment payload ceiling for guest-bound data.
pub const MSS: usize = 1460;
/// Initial retransmission timeout; doubled per retry.
pub const INITIAL_RTO_MS: u64 = 1000;
/// Retransmissions before the connection is abandoned with a RST.
pub const MAX_RETRIES: u8 = 5;
/// Delayed-ACK holdoff.
pub const DELAYED_ACK_MS: u64 = 40;
/// TIME_WAIT duration (2 x MSL).
pub const TIME_WAIT_MS: u64 = 30_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
    Closed,
}

/// A segment to serialize toward the guest. Addressing comes from the flow
/// key; the machine only decides sequence/flag content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentOut {
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub mss: Option<u16>,
    pub payload: Vec<u8>,
}

/// In-order byte-stream events surfaced to the owner of the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// Contiguous client bytes, exactly once, in order.
    Data(Vec<u8>),
    /// The guest half-closed (FIN consumed).
    Eof,
    /// The connection died (RST either way, retry exhaustion, or the final
    /// close transition). No further events follow.
    Closed,
}

fn seq_lt(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

pub struct TcpConn {
    state: TcpState,

    // Receive side (guest -> us).
    rcv_nxt: u32,
    ooo: BTreeMap<u32, Vec<u8>>,
    ooo_bytes: usize,
    rx_unacked: usize,
    ack_deadline: Option<Millis>,

    // Send side (us -> guest).
    our_isn: u32,
    snd_una: u32,
    snd_wnd: u16,
    /// Bytes from `snd_una` on: the unacked prefix (`tx_sent`) plus not yet
    /// transmitted tail.
    tx_buf: Vec<u8>,
    tx_sent: usize,
    fin_pending: bool,
    fin_sent: bool,
    fin_acked: bool,

    guest_isn: u32,
    syn_acked: bool,

    rto_ms: u64,
    rto_deadline: Option<Millis>,
    retries: u8,
    time_wait_deadline: Option<Millis>,
}

impl TcpConn {
    /// Create the connection for a guest SYN; the caller emits the returned
    /// SYN-ACK.
    pub fn accept(guest_isn: u32, our_isn: u32, now: Millis) -> (Self, SegmentOut) {
        let mut conn = Self {
            state: TcpState::SynReceived,
            rcv_nxt: guest_isn.wrapping_add(1),
            ooo: BTreeMap::new(),
            ooo_bytes: 0,
            rx_unacked: 0,
            ack_deadline: None,
            our_isn,
            snd_una: our_isn.wrapping_add(1),
            snd_wnd: 0,
            tx_buf: Vec::new(),
            tx_sent: 0,
            fin_pending: false,
            fin_sent: false,
            fin_acked: false,
            guest_isn,
            syn_acked: false,
            rto_ms: INITIAL_RTO_MS,
            rto_deadline: None,
            retries: 0,
            time_wait_deadline: None,
        };
        conn.rto_deadline = Some(now + conn.rto_ms);
        let syn_ack = conn.syn_ack_segment();
        (conn, syn_ack)
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == TcpState::Closed
    }

    /// Sequence number of the next new byte we would transmit.
    fn snd_nxt(&self) -> u32 {
        let fin = u32::from(self.fin_sent);
        self.snd_una.wrapping_add(self.tx_sent as u32).wrapping_add(fin)
    }

    fn syn_ack_segment(&self) -> SegmentOut {
        SegmentOut {
            seq: self.our_isn,
            ack: self.rcv_nxt,
            flags: TcpFlags::SYN | TcpFlags::ACK,
            window: RECV_WINDOW,
            mss: Some(MSS as u16),
            payload: Vec::new(),
        }
    }

    fn ack_segment(&self) -> SegmentOut {
        SegmentOut {
            seq: self.snd_nxt(),
            ack: self.rcv_nxt,
            flags: TcpFlags::ACK,
            window: RECV_WINDOW,
            mss: None,
            payload: Vec::new(),
        }
    }

    fn rst_segment(&self) -> SegmentOut {
        SegmentOut {
            seq: self.snd_nxt(),
            ack: self.rcv_nxt,
            flags: TcpFlags::RST | TcpFlags::ACK,
            window: 0,
            mss: None,
            payload: Vec::new(),
        }
    }

    /// Abort locally: emit a RST and drop all state.
    pub fn reset(&mut self) -> Option<SegmentOut> {
        if self.state == TcpState::Closed {
            return None;
        }
        let rst = self.rst_segment();
        self.enter_closed();
        Some(rst)
    }

    fn enter_closed(&mut self) {
        self.state = TcpState::Closed;
        self.rto_deadline = None;
        self.ack_deadline = None;
        self.time_wait_deadline = None;
        self.tx_buf.clear();
        self.tx_sent = 0;
        self.ooo.clear();
        self.ooo_bytes = 0;
    }

    fn enter_time_wait(&mut self, now: Millis) {
        self.state = TcpState::TimeWait;
        self.rto_deadline = None;
        self.time_wait_deadline = Some(now + TIME_WAIT_MS);
    }

    /// Handle one parsed guest segment.
    pub fn on_segment(
        &mut self,
        seq: u32,
        ack: u32,
        flags: u8,
        window: u16,
        payload: &[u8],
        now: Millis,
    ) -> (Vec<SegmentOut>, Vec<StreamEvent>) {
        let mut out = Vec::new();
        let mut events = Vec::new();

        if self.state == TcpState::Closed {
            return (out, events);
        }

        if flags & TcpFlags::RST != 0 {
            // Only honor a RST that is in-window-ish; exact validation is
            // moot for a single trusted guest.
            self.enter_closed();
            events.push(StreamEvent::Closed);
            return (out, events);
        }

        // A SYN after the handshake is fatal. A retransmitted handshake SYN
        // gets the same SYN-ACK again.
        if flags & TcpFlags::SYN != 0 {
            if self.state == TcpState::SynReceived && seq == self.guest_isn {
                out.push(self.syn_ack_segment());
                return (out, events);
            }
            out.extend(self.reset());
            events.push(StreamEvent::Closed);
            return (out, events);
        }

        if flags & TcpFlags::ACK != 0 {
            self.process_ack(ack, window, now, &mut out, &mut events);
            if self.state == TcpState::Closed {
                return (out, events);
            }
        }

        if self.state == TcpState::TimeWait {
            // Straggler (usually a retransmitted FIN): re-ACK it.
            out.push(self.ack_segment());
            return (out, events);
        }

        if !payload.is_empty() {
            self.process_payload(seq, payload, now, &mut out, &mut events);
        }

        if flags & TcpFlags::FIN != 0 {
            self.process_fin(seq.wrapping_add(payload.len() as u32), now, &mut out, &mut events);
        }

        (out, events)
    }

    fn process_ack(
        &mut self,
        ack: u32,
        window: u16,
        now: Millis,
        out: &mut Vec<SegmentOut>,
        events: &mut Vec<StreamEvent>,
    ) {
        self.snd_wnd = window;

        if self.state == TcpState::SynReceived {
            if ack == self.snd_una {
                self.syn_acked = true;
                self.state = TcpState::Established;
                self.rto_deadline = None;
                self.rto_ms = INITIAL_RTO_MS;
                self.retries = 0;
            }
            // Anything else in SYN_RECEIVED is a stray ACK; ignore it.
            return;
        }

        // Ignore ACKs for data we never sent, and stale duplicates.
        if !seq_le(ack, self.snd_nxt()) {
            return;
        }

        if seq_lt(self.snd_una, ack) {
            let acked_total = ack.wrapping_sub(self.snd_una) as usize;
            let acked_data = acked_total.min(self.tx_sent);
            self.tx_buf.drain(..acked_data);
            self.tx_sent -= acked_data;
            self.snd_una = self.snd_una.wrapping_add(acked_data as u32);

            if self.fin_sent && acked_total > acked_data {
                self.fin_acked = true;
                self.snd_una = self.snd_una.wrapping_add(1);
            }

            // Forward progress resets the retransmission clock.
            self.rto_ms = INITIAL_RTO_MS;
            self.retries = 0;
            self.rto_deadline = if self.tx_sent > 0 || (self.fin_sent && !self.fin_acked) {
                Some(now + self.rto_ms)
            } else {
                None
            };
        }

        if self.fin_acked {
            match self.state {
                TcpState::FinWait1 => self.state = TcpState::FinWait2,
                TcpState::Closing => {
                    self.enter_time_wait(now);
                }
                TcpState::LastAck => {
                    self.enter_closed();
                    events.push(StreamEvent::Closed);
                    return;
                }
                _ => {}
            }
        }

        // A window update may unblock queued data or a deferred FIN.
        self.push_pending(now, out);
    }

    fn process_payload(
        &mut self,
        seq: u32,
        payload: &[u8],
        now: Millis,
        out: &mut Vec<SegmentOut>,
        events: &mut Vec<StreamEvent>,
    ) {
        let end = seq.wrapping_add(payload.len() as u32);

        if seq_le(end, self.rcv_nxt) {
            // Entire segment is old: re-ACK so the guest stops retransmitting.
            out.push(self.ack_segment());
            return;
        }

        if seq_lt(self.rcv_nxt, seq) {
            // Out of order: hold within the window, dup-ACK what we have.
            let offset = seq.wrapping_sub(self.rcv_nxt) as usize;
            if offset + payload.len() <= usize::from(RECV_WINDOW)
                && self.ooo_bytes + payload.len() <= usize::from(RECV_WINDOW)
                && !self.ooo.contains_key(&seq)
            {
                self.ooo_bytes += payload.len();
                self.ooo.insert(seq, payload.to_vec());
            }
            out.push(self.ack_segment());
            return;
        }

        // In order, possibly overlapping the already-delivered prefix.
        let skip = self.rcv_nxt.wrapping_sub(seq) as usize;
        let mut delivered = payload[skip..].to_vec();
        self.rcv_nxt = self.rcv_nxt.wrapping_add(delivered.len() as u32);
        self.drain_ooo(&mut delivered);

        let n = delivered.len();
        if self.accepts_data() {
            events.push(StreamEvent::Data(delivered));
        }
        self.schedule_ack(n, now, out);
    }

    /// Guest data is meaningful until the guest half-closes.
    fn accepts_data(&self) -> bool {
        matches!(
            self.state,
            TcpState::SynReceived
                | TcpState::Established
                | TcpState::FinWait1
                | TcpState::FinWait2
        )
    }

    fn drain_ooo(&mut self, delivered: &mut Vec<u8>) {
        while let Some((&seq, _)) = self.ooo.first_key_value() {
            if seq_lt(self.rcv_nxt, seq) {
                break;
            }
            let (seq, data) = self.ooo.pop_first().expect("first entry exists");
            self.ooo_bytes -= data.len();
            let end = seq.wrapping_add(data.len() as u32);
            if seq_lt(self.rcv_nxt, end) {
                let skip = self.rcv_nxt.wrapping_sub(seq) as usize;
                delivered.extend_from_slice(&data[skip..]);
                self.rcv_nxt = end;
            }
        }
    }

    fn schedule_ack(&mut self, delivered: usize, now: Millis, out: &mut Vec<SegmentOut>) {
        self.rx_unacked += delivered;
        if self.rx_unacked >= MSS {
            self.rx_unacked = 0;
            self.ack_deadline = None;
            out.push(self.ack_segment());
        } else if self.ack_deadline.is_none() {
            self.ack_deadline = Some(now + DELAYED_ACK_MS);
        }
    }

    fn process_fin(
        &mut self,
        fin_seq: u32,
        now: Millis,
        out: &mut Vec<SegmentOut>,
        events: &mut Vec<StreamEvent>,
    ) {
        if fin_seq != self.rcv_nxt {
            // FIN beyond a gap: the missing data will be retransmitted first.
            out.push(self.ack_segment());
            return;
        }

        self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        self.rx_unacked = 0;
        self.ack_deadline = None;
        out.push(self.ack_segment());
        events.push(StreamEvent::Eof);

        match self.state {
            TcpState::SynReceived | TcpState::Established => {
                self.state = TcpState::CloseWait;
            }
            TcpState::FinWait1 => {
                if self.fin_acked {
                    self.enter_time_wait(now);
                } else {
                    self.state = TcpState::Closing;
                }
            }
            TcpState::FinWait2 => {
                self.enter_time_wait(now);
            }
            _ => {}
        }

        // If our side was already asked to close, the FIN can go out now.
        self.push_pending(now, out);
    }

    /// Queue response bytes toward the guest.
    pub fn send(&mut self, data: &[u8], now: Millis) -> Vec<SegmentOut> {
        let mut out = Vec::new();
        if !matches!(
            self.state,
            TcpState::Established | TcpState::CloseWait
        ) || self.fin_pending
            || self.fin_sent
        {
            return out;
        }
        self.tx_buf.extend_from_slice(data);
        self.push_pending(now, &mut out);
        out
    }

    /// Half-close our side once everything queued has been sent.
    pub fn shutdown(&mut self, now: Millis) -> Vec<SegmentOut> {
        let mut out = Vec::new();
        if self.fin_pending || self.fin_sent || self.state == TcpState::Closed {
            return out;
        }
        if !matches!(self.state, TcpState::Established | TcpState::CloseWait) {
            return out;
        }
        self.fin_pending = true;
        self.push_pending(now, &mut out);
        out
    }

    /// Emit whatever the guest window currently allows: data first, then a
    /// deferred FIN.
    fn push_pending(&mut self, now: Millis, out: &mut Vec<SegmentOut>) {
        if !self.syn_acked || self.state == TcpState::Closed {
            return;
        }

        let window = usize::from(self.snd_wnd);
        while self.tx_sent < self.tx_buf.len() {
            let available = window.saturating_sub(self.tx_sent);
            if available == 0 {
                // Window closed with data pending: keep the clock running so
                // the retransmit path probes.
                if self.rto_deadline.is_none() {
                    self.rto_deadline = Some(now + self.rto_ms);
                }
                return;
            }
            let len = (self.tx_buf.len() - self.tx_sent).min(MSS).min(available);
            let seq = self.snd_una.wrapping_add(self.tx_sent as u32);
            let payload = self.tx_buf[self.tx_sent..self.tx_sent + len].to_vec();
            self.tx_sent += len;
            let last = self.tx_sent == self.tx_buf.len();
            out.push(SegmentOut {
                seq,
                ack: self.rcv_nxt,
                flags: if last {
                    TcpFlags::ACK | TcpFlags::PSH
                } else {
                    TcpFlags::ACK
                },
                window: RECV_WINDOW,
                mss: None,
                payload,
            });
            // Data segments carry the current ACK.
            self.rx_unacked = 0;
            self.ack_deadline = None;
            if self.rto_deadline.is_none() {
                self.rto_deadline = Some(now + self.rto_ms);
            }
        }

        if self.fin_pending && !self.fin_sent && self.tx_sent == self.tx_buf.len() {
            self.fin_sent = true;
            out.push(SegmentOut {
                seq: self.snd_una.wrapping_add(self.tx_sent as u32),
                ack: self.rcv_nxt,
                flags: TcpFlags::FIN | TcpFlags::ACK,
                window: RECV_WINDOW,
                mss: None,
                payload: Vec::new(),
            });
            match self.state {
                TcpState::Established => self.state = TcpState::FinWait1,
                TcpState::CloseWait => self.state = TcpState::LastAck,
                _ => {}
            }
            if self.rto_deadline.is_none() {
                self.rto_deadline = Some(now + self.rto_ms);
            }
        }
    }

    /// Fire any expired timer. Returns segments plus stream events (retry
    /// exhaustion surfaces as `Closed`).
    pub fn on_timer(&mut self, now: Millis) -> (Vec<SegmentOut>, Vec<StreamEvent>) {
        let mut out = Vec::new();
        let mut events = Vec::new();

        if let Some(deadline) = self.time_wait_deadline {
            if now >= deadline {
                self.enter_closed();
                events.push(StreamEvent::Closed);
                return (out, events);
            }
        }

        if let Some(deadline) = self.ack_deadline {
            if now >= deadline {
                self.ack_deadline = None;
                self.rx_unacked = 0;
                out.push(self.ack_segment());
            }
        }

        if let Some(deadline) = self.rto_deadline {
            if now >= deadline {
                self.retries += 1;
                if self.retries > MAX_RETRIES {
                    out.extend(self.reset());
                    events.push(StreamEvent::Closed);
                    return (out, events);
                }
                self.rto_ms *= 2;
                self.rto_deadline = Some(now + self.rto_ms);
                out.extend(self.retransmit_segment());
            }
        }

        (out, events)
    }

    fn retransmit_segment(&mut self) -> Option<SegmentOut> {
        match self.state {
            TcpState::Closed | TcpState::TimeWait => None,
            TcpState::SynReceived => Some(self.syn_ack_segment()),
            _ => {
                if self.tx_sent > 0 {
                    let len = self.tx_sent.min(MSS);
                    Some(SegmentOut {
                        seq: self.snd_una,
                        ack: self.rcv_nxt,
                        flags: TcpFlags::ACK | TcpFlags::PSH,
                        window: RECV_WINDOW,
                        mss: None,
                        payload: self.tx_buf[..len].to_vec(),
                    })
                } else if self.fin_sent && !self.fin_acked {
                    Some(SegmentOut {
                        seq: self.snd_una,
                        ack: self.rcv_nxt,
                        flags: TcpFlags::FIN | TcpFlags::ACK,
                        window: RECV_WINDOW,
                        mss: None,
                        payload: Vec::new(),
                    })
                } else if !self.tx_buf.is_empty() && self.snd_wnd == 0 {
                    // Zero-window probe: one byte past the edge.
                    self.tx_sent = 1;
                    Some(SegmentOut {
                        seq: self.snd_una,
                        ack: self.rcv_nxt,
                        flags: TcpFlags::ACK | TcpFlags::PSH,
                        window: RECV_WINDOW,
                        mss: None,
                        payload: self.tx_buf[..1].to_vec(),
                    })
                } else {
                    None
                }
            }
        }
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Millis> {
        [self.ack_deadline, self.rto_deadline, self.time_wait_deadline]
            .into_iter()
            .flatten()
            .min()
    }
}
