//! Connection events and the capture line parser.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{WatchError, WatchResult};

/// Matches the address/flags portion of a `tcpdump -n` TCP line.
static TCPDUMP_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"IP (\d{1,3}(?:\.\d{1,3}){3})\.(\d+) > \d{1,3}(?:\.\d{1,3}){3}\.(\d+): Flags \[([^\]]+)\]",
    )
    .unwrap_or_else(|_| unreachable!())
});

/// TCP control flags of an observed segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TcpFlags(u8);

impl TcpFlags {
    /// FIN.
    pub const FIN: Self = Self(0x01);
    /// SYN.
    pub const SYN: Self = Self(0x02);
    /// RST.
    pub const RST: Self = Self(0x04);
    /// PSH.
    pub const PSH: Self = Self(0x08);
    /// ACK.
    pub const ACK: Self = Self(0x10);
    /// URG.
    pub const URG: Self = Self(0x20);
    /// ECE.
    pub const ECE: Self = Self(0x40);
    /// CWR.
    pub const CWR: Self = Self(0x80);

    /// No flags set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Union of two flag sets.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// A handshake-initiating segment: SYN without ACK, FIN or RST.
    ///
    /// ECN negotiation bits are tolerated so ECN-capable clients (`[SEW]`)
    /// still count as new attempts.
    #[must_use]
    pub const fn is_syn_only(self) -> bool {
        self.contains(Self::SYN)
            && !self.contains(Self::ACK)
            && !self.contains(Self::FIN)
            && !self.contains(Self::RST)
    }

    /// A segment that resolves a pending handshake: SYN-ACK or a bare ACK.
    #[must_use]
    pub const fn is_handshake_response(self) -> bool {
        (self.contains(Self::SYN) && self.contains(Self::ACK)) || self.0 == Self::ACK.0
    }
}

impl FromStr for TcpFlags {
    type Err = WatchError;

    /// Parse tcpdump's flag notation (`S`, `S.`, `P.`, `FEW`, `none`...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "none" {
            return Ok(Self::empty());
        }
        if s.is_empty() {
            return Err(WatchError::malformed("empty flag field"));
        }
        let mut flags = Self::empty();
        for c in s.chars() {
            let flag = match c {
                'F' => Self::FIN,
                'S' => Self::SYN,
                'R' => Self::RST,
                'P' => Self::PSH,
                '.' => Self::ACK,
                'U' => Self::URG,
                'E' => Self::ECE,
                'W' => Self::CWR,
                other => {
                    return Err(WatchError::malformed(format!("unknown TCP flag '{other}'")));
                }
            };
            flags = flags.with(flag);
        }
        Ok(flags)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "none");
        }
        for (flag, c) in [
            (Self::FIN, 'F'),
            (Self::SYN, 'S'),
            (Self::RST, 'R'),
            (Self::PSH, 'P'),
            (Self::URG, 'U'),
            (Self::ECE, 'E'),
            (Self::CWR, 'W'),
            (Self::ACK, '.'),
        ] {
            if self.contains(flag) {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

/// Key of a tracked handshake: source address and destination port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey {
    /// Source address.
    pub ip: IpAddr,
    /// Destination port on this host.
    pub dst_port: u16,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.ip, self.dst_port)
    }
}

/// One observed TCP segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    /// Source address.
    pub ip: IpAddr,
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// TCP flags.
    pub flags: TcpFlags,
    /// When the segment was observed.
    pub timestamp: DateTime<Utc>,
}

impl ConnectionEvent {
    /// Create an event.
    #[must_use]
    pub fn new(ip: IpAddr, src_port: u16, dst_port: u16, flags: TcpFlags, timestamp: DateTime<Utc>) -> Self {
        Self {
            ip,
            src_port,
            dst_port,
            flags,
            timestamp,
        }
    }

    /// Convenience constructor for a pure SYN observed now.
    #[must_use]
    pub fn syn(ip: IpAddr, src_port: u16, dst_port: u16) -> Self {
        Self::new(ip, src_port, dst_port, TcpFlags::SYN, Utc::now())
    }

    /// Convenience constructor for a bare ACK observed now.
    #[must_use]
    pub fn ack(ip: IpAddr, src_port: u16, dst_port: u16) -> Self {
        Self::new(ip, src_port, dst_port, TcpFlags::ACK, Utc::now())
    }

    /// Tracking key of this event.
    #[must_use]
    pub const fn key(&self) -> ConnectionKey {
        ConnectionKey {
            ip: self.ip,
            dst_port: self.dst_port,
        }
    }
}

/// Parse one line of `tcpdump -lni IFACE tcp` output.
///
/// The timestamp is supplied by the caller (capture time), since tcpdump's
/// own timestamp carries no date.
///
/// # Errors
///
/// Returns `WatchError::MalformedEvent` for lines that are not IPv4 TCP
/// segments or carry out-of-range fields.
pub fn parse_tcpdump_line(line: &str, observed_at: DateTime<Utc>) -> WatchResult<ConnectionEvent> {
    let caps = TCPDUMP_LINE
        .captures(line)
        .ok_or_else(|| WatchError::malformed("not a TCP segment line"))?;

    let field = |i: usize| caps.get(i).map_or("", |m| m.as_str());

    let ip: IpAddr = field(1)
        .parse()
        .map_err(|e| WatchError::malformed(format!("bad source address: {e}")))?;
    let src_port: u16 = field(2)
        .parse()
        .map_err(|e| WatchError::malformed(format!("bad source port: {e}")))?;
    let dst_port: u16 = field(3)
        .parse()
        .map_err(|e| WatchError::malformed(format!("bad destination port: {e}")))?;
    let flags: TcpFlags = field(4).parse()?;

    Ok(ConnectionEvent::new(ip, src_port, dst_port, flags, observed_at))
}
