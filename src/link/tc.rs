//! Queueing discipline parameters for link impairment.
//!
//! Delay, jitter and loss are applied with a root `netem` qdisc (handle
//! `1:`). Rate limiting chains a `tbf` qdisc below it (`parent 1:1`,
//! handle `10:`), so a rate limit always requires the netem parent.

/// Packet limit of the netem queue.
pub const NETEM_LIMIT: u32 = 1000;

/// Smallest TBF burst: one full Ethernet frame plus headroom.
pub const TBF_MIN_BURST: u64 = 1540;

/// Delay/jitter/loss impairment.
#[derive(Debug, Clone, PartialEq)]
pub struct NetemParams {
    pub delay_ms: u32,
    pub jitter_ms: u32,
    pub loss_percent: f64,
}

impl NetemParams {
    /// True when the parameters actually impair traffic.
    pub fn is_active(&self) -> bool {
        self.delay_ms > 0 || self.loss_percent > 0.0
    }

    /// `tc` arguments after `qdisc add|change`.
    pub fn args(&self, ifname: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "dev".into(),
            ifname.into(),
            "root".into(),
            "handle".into(),
            "1:".into(),
            "netem".into(),
            "delay".into(),
            format!("{}ms", self.delay_ms),
        ];
        if self.jitter_ms > 0 {
            args.push(format!("{}ms", self.jitter_ms));
        }
        args.extend([
            "loss".into(),
            format!("{}%", self.loss_percent),
            "limit".into(),
            NETEM_LIMIT.to_string(),
        ]);
        args
    }
}

/// Token bucket rate limit.
#[derive(Debug, Clone, PartialEq)]
pub struct TbfParams {
    pub rate_kbps: u32,
    pub burst_bytes: u64,
    pub limit_bytes: u64,
}

impl TbfParams {
    /// Size the bucket for a link of `rate_kbps` with `delay_ms` latency.
    ///
    /// The queue holds `buffer` bandwidth-delay products; a larger factor
    /// absorbs more burstiness at the cost of worst-case latency. A zero
    /// factor means 1.0.
    pub fn new(rate_kbps: u32, delay_ms: u32, buffer: f64) -> Self {
        let factor = if buffer > 0.0 { buffer } else { 1.0 };
        let burst_bytes = (u64::from(rate_kbps) * 4).max(TBF_MIN_BURST);
        // kbit/s * ms = bits
        let bdp_bytes = factor * f64::from(rate_kbps) * f64::from(delay_ms) / 8.0;
        let limit_bytes = (bdp_bytes as u64).max(burst_bytes);

        Self {
            rate_kbps,
            burst_bytes,
            limit_bytes,
        }
    }

    /// `tc` arguments after `qdisc add|change`.
    pub fn args(&self, ifname: &str) -> Vec<String> {
        vec![
            "dev".into(),
            ifname.into(),
            "parent".into(),
            "1:1".into(),
            "handle".into(),
            "10:".into(),
            "tbf".into(),
            "rate".into(),
            format!("{}kbit", self.rate_kbps),
            "burst".into(),
            self.burst_bytes.to_string(),
            "limit".into(),
            self.limit_bytes.to_string(),
        ]
    }
}
