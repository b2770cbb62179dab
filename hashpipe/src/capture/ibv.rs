//! Zero-copy IBV (RDMA verbs) packet capture.
//!
//! Registers every data block of the output ring as a single memory region,
//! posts one receive work request per slot (sub-divided into 64-byte-aligned
//! "chunks", one SGE per chunk), and builds layered flow rules (Ethernet,
//! +IPv4, +UDP/TCP) to steer matching traffic to the queue pair.
//!
//! The actual verbs calls (`ibv_post_recv`, `ibv_poll_cq`, `ibv_create_flow`,
//! ...) are, in real `libibverbs`, static-inline wrappers that dispatch
//! through a provider-specific `ops` table reached via `ibv_context` rather
//! than exported `.so` symbols (confirmed against
//! `examples/other_examples/c4e7a82b_IcicleF-rrddmma__src-bindings-common.rs.rs`,
//! which has to replicate that `ops` table to call them at all). Hand-rolling
//! raw `extern "C"` bindings to those inline wrappers is not meaningfully
//! different from depending on an unverified vendored crate, which the
//! no-fabricated-dependencies rule rules out. This module therefore puts the
//! hardware boundary behind the `VerbsDevice` trait (setup, WR posting, CQ
//! polling, flow (de)programming) — the same pattern `registry`'s dynamic
//! `.so` loading is replaced with a static registry for (spec.md §9: "Tests
//! must not depend on the loading mechanism"). A production build supplies a
//! `VerbsDevice` backed by a real `libibverbs`-linked shim; the module itself
//! implements every other part of spec.md §4.G: interface resolution, chunk
//! table derivation, slot/WR bookkeeping, flow-rule construction and
//! multicast membership management, the 2-live-block run loop, and periodic
//! status-buffer updates.

use std::net::UdpSocket;
use std::os::unix::io::AsRawFd;

use log::{error, info};

use crate::error::{HpError, Result};
use crate::status::StatusBuffer;

pub const PKT_CHUNK_ALIGNMENT: usize = 64;
pub const MAX_PKT_CHUNKS: usize = 8;
pub const MAX_FLOWS: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct PktChunk {
    pub size: usize,
    pub aligned_size: usize,
    pub offset: usize,
}

/// Packet/slot/block sizing info derived from the `IBVPKTSZ` status key: a
/// comma-separated list of chunk byte sizes.
#[derive(Debug, Clone, Default)]
pub struct PktbufInfo {
    pub chunks: Vec<PktChunk>,
    pub pkt_size: usize,
    pub slot_size: usize,
}

impl PktbufInfo {
    /// Parses `IBVPKTSZ`, e.g. `"14,20,8192"` for MAC+IP, UDP header,
    /// payload. Malformed input is a Parameter error from init, which
    /// prevents the pipeline from starting.
    pub fn parse(ibvpktsz: &str) -> Result<Self> {
        let mut chunks = Vec::new();
        let mut pkt_size = 0usize;
        let mut slot_size = 0usize;
        for part in ibvpktsz.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let size: usize = part
                .parse()
                .map_err(|_| HpError::parameter(format!("bad chunk size in IBVPKTSZ: {part:?}")))?;
            if chunks.len() >= MAX_PKT_CHUNKS {
                return Err(HpError::parameter(format!(
                    "IBVPKTSZ has more than {MAX_PKT_CHUNKS} chunks"
                )));
            }
            let aligned = size.div_ceil(PKT_CHUNK_ALIGNMENT) * PKT_CHUNK_ALIGNMENT;
            chunks.push(PktChunk {
                size,
                aligned_size: aligned,
                offset: slot_size,
            });
            pkt_size += size;
            slot_size += aligned;
        }
        if chunks.is_empty() {
            return Err(HpError::parameter("IBVPKTSZ has no chunks"));
        }
        Ok(PktbufInfo {
            chunks,
            pkt_size,
            slot_size,
        })
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Maps an unaligned byte offset within a packet to the corresponding
    /// (aligned) offset within a slot, accounting for inter-chunk padding.
    pub fn slot_offset(&self, pkt_offset: usize) -> Option<usize> {
        let mut remaining = pkt_offset;
        for chunk in &self.chunks {
            if remaining < chunk.size {
                return Some(chunk.offset + remaining);
            }
            remaining -= chunk.size;
        }
        None
    }

    pub fn slots_per_block(&self, block_data_size: usize) -> usize {
        if self.slot_size == 0 {
            0
        } else {
            block_data_size / self.slot_size
        }
    }
}

/// Ethernet/IPv4/UDP-TCP flow specification used to build a layered flow
/// rule. A zero-valued field is treated as a wildcard at that layer; all
/// fields zero deletes whatever flow occupied this index (spec.md §4.G).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowSpec {
    pub dst_mac: Option<[u8; 6]>,
    pub src_mac: Option<[u8; 6]>,
    pub ether_type: u16,
    pub vlan_tag: u16,
    pub src_ip: Option<[u8; 4]>,
    pub dst_ip: Option<[u8; 4]>,
    pub src_port: u16,
    pub dst_port: u16,
    pub is_udp: bool,
    pub is_tcp: bool,
}

impl FlowSpec {
    /// True if `dst_ip` falls in the multicast range 224.0.0.0/4.
    pub fn is_multicast(&self) -> bool {
        matches!(self.dst_ip, Some(ip) if (ip[0] & 0xf0) == 0xe0)
    }

    /// RFC 1112 multicast MAC substitution: 01:00:5e + low 23 bits of the
    /// multicast IP address.
    pub fn multicast_mac(&self) -> Option<[u8; 6]> {
        let ip = self.dst_ip?;
        if !self.is_multicast() {
            return None;
        }
        Some([0x01, 0x00, 0x5e, ip[1] & 0x7f, ip[2], ip[3]])
    }

    /// `dst_mac` after multicast substitution, if any.
    pub fn effective_dst_mac(&self) -> Option<[u8; 6]> {
        self.multicast_mac().or(self.dst_mac)
    }

    /// True if every matchable field is zero/unset: deletes the flow at
    /// this index without installing a replacement.
    pub fn is_empty(&self) -> bool {
        self.dst_mac.is_none()
            && self.src_mac.is_none()
            && self.ether_type == 0
            && self.vlan_tag == 0
            && self.src_ip.is_none()
            && self.dst_ip.is_none()
            && self.src_port == 0
            && self.dst_port == 0
    }

    /// The layer at which this flow matches: ETH-only, +IPv4, or +TCP/UDP,
    /// per spec.md §4.G's layered rule construction.
    pub fn layer(&self) -> FlowLayer {
        if self.is_udp || self.is_tcp {
            FlowLayer::TcpUdp
        } else if self.src_ip.is_some() || self.dst_ip.is_some() {
            FlowLayer::Ipv4
        } else {
            FlowLayer::Eth
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowLayer {
    Eth,
    Ipv4,
    TcpUdp,
}

/// Opaque handle to a programmed NIC flow rule, returned by
/// `VerbsDevice::create_flow`. Threaded back into `destroy_flow` at
/// replacement/teardown time; never interpreted by this module.
pub struct FlowHandle(pub u64);

/// Hardware boundary: everything that actually touches the NIC/QP. A real
/// deployment backs this with a `libibverbs`-linked shim; tests back it with
/// an in-memory fake so the setup sequence, slot bookkeeping, and flow
/// lifecycle above it can be exercised without hardware.
pub trait VerbsDevice {
    /// Posts (or re-posts) work request `wr_id`, pointed at slot `slot` of
    /// `block`, with one SGE per chunk in `pktbuf`.
    fn post_recv(&mut self, wr_id: u64, block: u64, slot: u32, pktbuf: &PktbufInfo) -> Result<()>;
    /// Polls for a batch of completed receive work requests, returning
    /// `(wr_id, success)` pairs.
    fn poll_completions(&mut self, timeout_ms: i32) -> Vec<(u64, bool)>;
    /// Installs (or, if `spec.is_empty()`, removes) the flow rule at `idx`.
    fn create_flow(&mut self, idx: usize, spec: &FlowSpec) -> Result<FlowHandle>;
    fn destroy_flow(&mut self, idx: usize, handle: FlowHandle) -> Result<()>;
}

/// Resolves a network interface name to its hardware (MAC) address by
/// reading `/sys/class/net/<ifname>/address`, matching spec.md §4.G step 1's
/// interface-to-device resolution (the original further derives a
/// link-local IPv6 interface ID from this MAC to locate the matching
/// ibverbs device; that device lookup itself lives behind
/// `VerbsDevice::new`/setup in a production shim since it is pure ibverbs
/// enumeration with no testable logic of its own).
pub fn resolve_interface_mac(ifname: &str) -> Result<[u8; 6]> {
    if ifname.is_empty() || ifname.contains('/') {
        return Err(HpError::parameter(format!("invalid interface name: {ifname}")));
    }
    let path = format!("/sys/class/net/{ifname}/address");
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| HpError::parameter(format!("reading {path}: {e}")))?;
    parse_mac(contents.trim())
}

/// Parses a colon-separated MAC address string, e.g. `"aa:bb:cc:dd:ee:ff"`.
fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        let part = parts
            .next()
            .ok_or_else(|| HpError::parameter(format!("malformed MAC address: {s:?}")))?;
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| HpError::parameter(format!("malformed MAC address: {s:?}")))?;
    }
    if parts.next().is_some() {
        return Err(HpError::parameter(format!("malformed MAC address: {s:?}")));
    }
    Ok(mac)
}

/// Derives the EUI-64 interface ID from a MAC address the way a link-local
/// IPv6 address would (insert `ff:fe` in the middle, flip the universal/
/// local bit), used by the original to match a MAC to an ibverbs device.
pub fn mac_to_eui64(mac: [u8; 6]) -> u64 {
    let id = [
        mac[0] ^ 0x02,
        mac[1],
        mac[2],
        0xff,
        0xfe,
        mac[3],
        mac[4],
        mac[5],
    ];
    u64::from_be_bytes(id)
}

/// Opens (and, on first use of a multicast `dst_ip`, subscribes to) the IGMP
/// membership socket used purely to ask the kernel to join/leave multicast
/// groups on the interface's behalf, per spec.md §4.G step 8.
pub struct McastSubscriber {
    sock: UdpSocket,
}

impl McastSubscriber {
    pub fn open() -> Result<Self> {
        let sock = UdpSocket::bind("0.0.0.0:0").map_err(HpError::from)?;
        Ok(McastSubscriber { sock })
    }

    pub fn join(&self, group: [u8; 4]) -> Result<()> {
        self.set_membership(group, libc::IP_ADD_MEMBERSHIP)
    }

    pub fn leave(&self, group: [u8; 4]) -> Result<()> {
        self.set_membership(group, libc::IP_DROP_MEMBERSHIP)
    }

    fn set_membership(&self, group: [u8; 4], opt: libc::c_int) -> Result<()> {
        let mreq = libc::ip_mreq {
            imr_multiaddr: libc::in_addr {
                s_addr: u32::from_be_bytes(group).to_be(),
            },
            imr_interface: libc::in_addr { s_addr: 0 },
        };
        let rv = unsafe {
            libc::setsockopt(
                self.sock.as_raw_fd(),
                libc::IPPROTO_IP,
                opt,
                &mreq as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::ip_mreq>() as libc::socklen_t,
            )
        };
        if rv != 0 {
            return Err(HpError::fatal(format!(
                "multicast membership change failed: {}",
                crate::error::last_os_error()
            )));
        }
        Ok(())
    }
}

/// Owns the set of programmed flow rules and their multicast memberships,
/// replaying spec.md §4.G's flow() contract: destroy any rule already at
/// `idx` (dropping its multicast membership first), then either install the
/// new layered rule or, if `spec` is empty, leave the slot deleted.
pub struct FlowTable {
    mcast: McastSubscriber,
    slots: Vec<Option<(FlowHandle, Option<[u8; 4]>)>>,
}

impl FlowTable {
    pub fn new(max_flows: usize) -> Result<Self> {
        let mut slots = Vec::with_capacity(max_flows);
        slots.resize_with(max_flows, || None);
        Ok(FlowTable {
            mcast: McastSubscriber::open()?,
            slots,
        })
    }

    pub fn set(&mut self, dev: &mut dyn VerbsDevice, idx: usize, spec: FlowSpec) -> Result<()> {
        if idx >= self.slots.len() {
            return Err(HpError::parameter(format!(
                "flow index {idx} out of range [0, {})",
                self.slots.len()
            )));
        }
        if let Some((handle, mcast_ip)) = self.slots[idx].take() {
            dev.destroy_flow(idx, handle)?;
            if let Some(ip) = mcast_ip {
                self.mcast.leave(ip)?;
            }
        }
        if spec.is_empty() {
            return Ok(());
        }
        let mcast_ip = if spec.is_multicast() {
            let ip = spec.dst_ip.unwrap();
            self.mcast.join(ip)?;
            Some(ip)
        } else {
            None
        };
        let handle = dev.create_flow(idx, &spec)?;
        self.slots[idx] = Some((handle, mcast_ip));
        Ok(())
    }

    pub fn teardown(&mut self, dev: &mut dyn VerbsDevice) -> Result<()> {
        for idx in 0..self.slots.len() {
            if let Some((handle, mcast_ip)) = self.slots[idx].take() {
                dev.destroy_flow(idx, handle)?;
                if let Some(ip) = mcast_ip {
                    self.mcast.leave(ip)?;
                }
            }
        }
        Ok(())
    }
}

/// Drives the 2-live-block capture loop: holds blocks `cur` and `cur+1`
/// open for writes, advancing `cur` and publishing FILLED only once
/// `next_block > cur + 1` (i.e. block `cur+1` has itself become free).
pub struct CaptureLoop {
    pub cur: u64,
    pub next_block: u64,
    pub n_block: u64,
}

pub enum CaptureEvent {
    /// Advance `cur` and publish block `cur` as FILLED.
    Advance(u64),
    /// A work completion failed; this is a Protocol-class error.
    CompletionFailed(u64),
    /// Nothing to do this iteration.
    Idle,
}

impl CaptureLoop {
    pub fn new(n_block: u64) -> Self {
        CaptureLoop {
            cur: 0,
            next_block: 0,
            n_block,
        }
    }

    /// Records that `wr_id` packets have now landed in the block
    /// identified by `wr_id % n_block`, then decides whether `cur` may
    /// advance.
    pub fn on_completion(&mut self, wr_id: u64, success: bool) -> CaptureEvent {
        if !success {
            return CaptureEvent::CompletionFailed(wr_id);
        }
        self.next_block = self.next_block.max(wr_id % self.n_block + 1);
        if self.next_block > self.cur + 1 {
            let advanced = self.cur;
            self.cur += 1;
            CaptureEvent::Advance(advanced)
        } else {
            CaptureEvent::Idle
        }
    }

    /// Runs one pass over `source`, calling `on_fill(block_id)` for every
    /// block that becomes ready to publish and `on_error(wr_id)` for every
    /// failed completion (the caller is expected to call
    /// `registry::clear_run_threads()` from `on_error`).
    pub fn step(
        &mut self,
        source: &mut dyn CompletionSource,
        mut on_fill: impl FnMut(u64),
        mut on_error: impl FnMut(u64),
    ) {
        if let Some((wr_id, success)) = source.poll() {
            match self.on_completion(wr_id, success) {
                CaptureEvent::Advance(block) => on_fill(block),
                CaptureEvent::CompletionFailed(wr_id) => on_error(wr_id),
                CaptureEvent::Idle => {}
            }
        }
    }
}

/// Abstraction over the completion-queue poll so the capture run loop can
/// be exercised in tests without real NIC hardware.
pub trait CompletionSource {
    /// Returns the work-request id and whether its completion succeeded,
    /// or `None` if nothing completed within the poll interval.
    fn poll(&mut self) -> Option<(u64, bool)>;
}

/// Adapts a `VerbsDevice`'s batch-oriented `poll_completions` to the
/// one-at-a-time `CompletionSource` the loop logic consumes, buffering the
/// rest of the batch for subsequent calls (spec.md §4.G run loop step 4:
/// completions are drained and re-posted in one batch per CQ poll).
pub struct DeviceCompletionSource<'a> {
    dev: &'a mut dyn VerbsDevice,
    pending: std::collections::VecDeque<(u64, bool)>,
    poll_timeout_ms: i32,
}

impl<'a> DeviceCompletionSource<'a> {
    pub fn new(dev: &'a mut dyn VerbsDevice, poll_timeout_ms: i32) -> Self {
        DeviceCompletionSource {
            dev,
            pending: std::collections::VecDeque::new(),
            poll_timeout_ms,
        }
    }
}

impl CompletionSource for DeviceCompletionSource<'_> {
    fn poll(&mut self) -> Option<(u64, bool)> {
        if self.pending.is_empty() {
            self.pending
                .extend(self.dev.poll_completions(self.poll_timeout_ms));
        }
        self.pending.pop_front()
    }
}

/// Milliseconds between periodic status-buffer counter updates (spec.md
/// §4.G run loop step 5).
pub const STATUS_UPDATE_PERIOD_MS: u64 = 200;
/// Milliseconds the completion-channel poll blocks for per iteration
/// (spec.md §4.G run loop step 1).
pub const CQ_POLL_TIMEOUT_MS: i32 = 50;

/// Drives steps 1-5 of spec.md §4.G's run loop against `dev` until
/// `should_stop` returns true or a completion fails: polls the completion
/// source, advances `cur` and re-posts a fresh receive WR per slot of the
/// block two behind `cur` (the block furthest from being written to next,
/// safe to recycle), and updates `IBVBUFST` on `status` roughly every
/// `STATUS_UPDATE_PERIOD_MS`.
pub fn run_capture_loop(
    dev: &mut dyn VerbsDevice,
    pktbuf: &PktbufInfo,
    n_block: u64,
    slots_per_block: u32,
    status: &mut StatusBuffer,
    mut should_stop: impl FnMut() -> bool,
) -> Result<()> {
    let mut cloop = CaptureLoop::new(n_block);
    let mut packets_seen: u64 = 0;
    let mut last_status_update = std::time::Instant::now();

    while !should_stop() {
        let mut filled_block = None;
        let mut failed = false;
        {
            let mut source = DeviceCompletionSource::new(dev, CQ_POLL_TIMEOUT_MS);
            cloop.step(
                &mut source,
                |block| {
                    packets_seen += slots_per_block as u64;
                    filled_block = Some(block);
                },
                |wr_id| {
                    error!("IBV work completion failed for wr_id {wr_id}");
                    failed = true;
                },
            );
        }
        if failed {
            return Err(HpError::protocol("IBV capture: non-success work completion"));
        }
        if let Some(block) = filled_block {
            let recycle_block = block % n_block;
            for slot in 0..slots_per_block {
                let wr_id = recycle_block * slots_per_block as u64 + slot as u64;
                dev.post_recv(wr_id, recycle_block, slot, pktbuf)?;
            }
        }

        if last_status_update.elapsed().as_millis() as u64 >= STATUS_UPDATE_PERIOD_MS {
            let fullness = format!("{}/{}", cloop.cur.min(n_block - 1), n_block);
            let _ = status.put_str("IBVBUFST", &fullness);
            last_status_update = std::time::Instant::now();
        }
    }
    info!("IBV capture stopping, {packets_seen} packets seen");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mac_accepts_colon_separated_hex() {
        assert_eq!(parse_mac("aa:bb:cc:dd:ee:ff").unwrap(), [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    }

    #[test]
    fn parse_mac_rejects_wrong_field_count() {
        assert!(parse_mac("aa:bb:cc").is_err());
        assert!(parse_mac("aa:bb:cc:dd:ee:ff:00").is_err());
    }

    #[test]
    fn eui64_flips_universal_local_bit_and_splits_mac() {
        let id = mac_to_eui64([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let bytes = id.to_be_bytes();
        assert_eq!(bytes, [0x02, 0x11, 0x22, 0xff, 0xfe, 0x33, 0x44, 0x55]);
    }

    #[test]
    fn pktbuf_info_parses_comma_separated_sizes() {
        let info = PktbufInfo::parse("14,20,8192").unwrap();
        assert_eq!(info.num_chunks(), 3);
        assert_eq!(info.pkt_size, 14 + 20 + 8192);
        // 14 -> 64, 20 -> 64, 8192 -> 8192 (already aligned)
        assert_eq!(info.slot_size, 64 + 64 + 8192);
    }

    #[test]
    fn malformed_ibvpktsz_is_a_parameter_error() {
        assert!(PktbufInfo::parse("14,oops,8192").is_err());
    }

    #[test]
    fn slot_offset_accounts_for_chunk_padding() {
        let info = PktbufInfo::parse("14,20,1500").unwrap();
        // offset 34 (start of payload, after 14+20 unaligned bytes) should
        // land at the third chunk's aligned offset (64 + 64 = 128).
        assert_eq!(info.slot_offset(34), Some(128));
    }

    /// Scenario S5: IBVPKTSZ=42,96,1024 -> offsets (0, 64, 192), slot_size 1216.
    #[test]
    fn s5_ibvpktsz_chunk_table() {
        let info = PktbufInfo::parse("42,96,1024").unwrap();
        let offsets: Vec<usize> = info.chunks.iter().map(|c| c.offset).collect();
        let sizes: Vec<usize> = info.chunks.iter().map(|c| c.size).collect();
        assert_eq!(sizes, vec![42, 96, 1024]);
        assert_eq!(offsets, vec![0, 64, 192]);
        assert_eq!(info.slot_size, 1216);
    }

    #[test]
    fn multicast_detection_and_mac_substitution() {
        let spec = FlowSpec {
            dst_ip: Some([239, 1, 2, 3]),
            ..Default::default()
        };
        assert!(spec.is_multicast());
        assert_eq!(spec.multicast_mac(), Some([0x01, 0x00, 0x5e, 1, 2, 3]));
    }

    #[test]
    fn unicast_has_no_multicast_mac() {
        let spec = FlowSpec {
            dst_ip: Some([10, 0, 0, 1]),
            ..Default::default()
        };
        assert!(!spec.is_multicast());
        assert_eq!(spec.multicast_mac(), None);
        assert_eq!(spec.effective_dst_mac(), None);
    }

    #[test]
    fn flow_layer_escalates_with_fields_present() {
        assert_eq!(FlowSpec::default().layer(), FlowLayer::Eth);
        let ip_only = FlowSpec {
            dst_ip: Some([10, 0, 0, 1]),
            ..Default::default()
        };
        assert_eq!(ip_only.layer(), FlowLayer::Ipv4);
        let udp = FlowSpec {
            dst_ip: Some([10, 0, 0, 1]),
            is_udp: true,
            ..Default::default()
        };
        assert_eq!(udp.layer(), FlowLayer::TcpUdp);
    }

    #[test]
    fn all_zero_spec_is_empty() {
        assert!(FlowSpec::default().is_empty());
        let not_empty = FlowSpec {
            dst_port: 1, ..Default::default()
        };
        assert!(!not_empty.is_empty());
    }

    struct FakeSource {
        events: std::collections::VecDeque<(u64, bool)>,
    }
    impl CompletionSource for FakeSource {
        fn poll(&mut self) -> Option<(u64, bool)> {
            self.events.pop_front()
        }
    }

    #[test]
    fn capture_loop_advances_only_after_next_plus_one_free() {
        let mut loop_ = CaptureLoop::new(4);
        let mut source = FakeSource {
            events: vec![(0, true), (1, true)].into(),
        };
        let mut filled = Vec::new();
        loop_.step(&mut source, |b| filled.push(b), |_| panic!("no errors expected"));
        assert!(filled.is_empty(), "cur should not advance after only block 0 completes");
        loop_.step(&mut source, |b| filled.push(b), |_| panic!("no errors expected"));
        assert_eq!(filled, vec![0]);
    }

    #[test]
    fn capture_loop_reports_completion_failures() {
        let mut loop_ = CaptureLoop::new(4);
        let mut source = FakeSource {
            events: vec![(7, false)].into(),
        };
        let mut errors = Vec::new();
        loop_.step(&mut source, |_| panic!("no fill expected"), |id| errors.push(id));
        assert_eq!(errors, vec![7]);
    }

    /// In-memory fake satisfying `VerbsDevice` so the flow table's
    /// destroy-before-create-and-drop-membership contract (spec.md §4.G
    /// flow rules) and the run loop's re-post behavior can be exercised
    /// without hardware.
    #[derive(Default)]
    struct FakeDevice {
        next_handle: u64,
        created: Vec<(usize, FlowSpec)>,
        destroyed: Vec<usize>,
        completions: std::collections::VecDeque<(u64, bool)>,
        posted: Vec<(u64, u64, u32)>,
    }

    impl VerbsDevice for FakeDevice {
        fn post_recv(&mut self, wr_id: u64, block: u64, slot: u32, _pktbuf: &PktbufInfo) -> Result<()> {
            self.posted.push((wr_id, block, slot));
            Ok(())
        }
        fn poll_completions(&mut self, _timeout_ms: i32) -> Vec<(u64, bool)> {
            self.completions.drain(..).collect()
        }
        fn create_flow(&mut self, idx: usize, spec: &FlowSpec) -> Result<FlowHandle> {
            self.created.push((idx, *spec));
            self.next_handle += 1;
            Ok(FlowHandle(self.next_handle))
        }
        fn destroy_flow(&mut self, idx: usize, _handle: FlowHandle) -> Result<()> {
            self.destroyed.push(idx);
            Ok(())
        }
    }

    #[test]
    fn flow_table_destroys_prior_rule_before_installing_new_one() {
        let mut dev = FakeDevice::default();
        let mut table = FlowTable::new(2).unwrap();
        let spec_a = FlowSpec {
            dst_ip: Some([10, 0, 0, 1]),
            dst_port: 60000,
            is_udp: true,
            ..Default::default()
        };
        table.set(&mut dev, 0, spec_a).unwrap();
        assert_eq!(dev.created.len(), 1);
        assert!(dev.destroyed.is_empty());

        let spec_b = FlowSpec {
            dst_ip: Some([10, 0, 0, 2]),
            dst_port: 60001,
            is_udp: true,
            ..Default::default()
        };
        table.set(&mut dev, 0, spec_b).unwrap();
        assert_eq!(dev.created.len(), 2);
        assert_eq!(dev.destroyed, vec![0]);
    }

    #[test]
    fn flow_table_deletion_with_all_zero_spec_leaves_slot_empty() {
        let mut dev = FakeDevice::default();
        let mut table = FlowTable::new(2).unwrap();
        let spec = FlowSpec {
            dst_ip: Some([10, 0, 0, 1]),
            dst_port: 1,
            is_udp: true,
            ..Default::default()
        };
        table.set(&mut dev, 1, spec).unwrap();
        table.set(&mut dev, 1, FlowSpec::default()).unwrap();
        assert_eq!(dev.created.len(), 1);
        assert_eq!(dev.destroyed, vec![1]);
    }

    #[test]
    fn flow_index_out_of_range_is_a_parameter_error() {
        let mut dev = FakeDevice::default();
        let mut table = FlowTable::new(2).unwrap();
        assert!(table.set(&mut dev, 5, FlowSpec::default()).is_err());
    }

    #[test]
    fn run_loop_reposts_every_slot_of_a_recycled_block() {
        let mut dev = FakeDevice::default();
        dev.completions.push_back((0, true));
        dev.completions.push_back((1, true));

        let pktbuf = PktbufInfo::parse("14,20,1500").unwrap();
        let instance_id = (std::process::id() as i32).wrapping_add(101) & 0x3f;
        let mut status = StatusBuffer::attach(instance_id).expect("attach status");

        let mut iterations = 0;
        run_capture_loop(&mut dev, &pktbuf, 4, 2, &mut status, || {
            iterations += 1;
            iterations > 2
        })
        .expect("run_capture_loop");

        // Block 0 becomes recyclable once block 1's completion lands; both
        // of its two slots get a fresh receive WR posted.
        assert_eq!(dev.posted, vec![(0, 0, 0), (1, 0, 1)]);
    }

    #[test]
    fn run_loop_surfaces_completion_failure_as_protocol_error() {
        let mut dev = FakeDevice::default();
        dev.completions.push_back((0, false));

        let pktbuf = PktbufInfo::parse("14,20,1500").unwrap();
        let instance_id = (std::process::id() as i32).wrapping_add(102) & 0x3f;
        let mut status = StatusBuffer::attach(instance_id).expect("attach status");

        let err = run_capture_loop(&mut dev, &pktbuf, 4, 2, &mut status, || false).unwrap_err();
        assert!(matches!(err, HpError::Protocol(_)));
    }
}
