//! Kernel TCP counters from `/proc/net/netstat`.
//!
//! The file holds paired header/value lines per protocol extension;
//! we pull retransmit, out-of-order and drop counters from the
//! `TcpExt:` section. On platforms without procfs the snapshot is all
//! zeros.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TcpCounters {
    pub retransmits: u64,
    pub out_of_order: u64,
    pub listen_drops: u64,
}

/// Reads the current counters; zeros when the file is unavailable.
pub fn read() -> TcpCounters {
    match std::fs::read_to_string("/proc/net/netstat") {
        Ok(text) => parse(&text),
        Err(_) => TcpCounters::default(),
    }
}

fn parse(text: &str) -> TcpCounters {
    let mut counters = TcpCounters::default();
    let mut lines = text.lines();

    while let Some(header) = lines.next() {
        if !header.starts_with("TcpExt:") {
            continue;
        }
        let Some(values) = lines.next() else { break };

        let names: Vec<&str> = header.split_whitespace().skip(1).collect();
        let nums: Vec<&str> = values.split_whitespace().skip(1).collect();

        for (name, num) in names.iter().zip(nums.iter()) {
            let Ok(v) = num.parse::<u64>() else { continue };
            match *name {
                "TCPLostRetransmit" | "TCPFastRetrans" | "TCPSlowStartRetrans" => {
                    counters.retransmits += v;
                }
                "TCPOFOQueue" => counters.out_of_order += v,
                "ListenDrops" => counters.listen_drops += v,
                _ => {}
            }
        }
        break;
    }

    counters
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
TcpExt: SyncookiesSent ListenDrops TCPLostRetransmit TCPFastRetrans TCPSlowStartRetrans TCPOFOQueue
TcpExt: 0 7 12 30 8 99
IpExt: InNoRoutes InTruncatedPkts
IpExt: 0 0
";

    #[test]
    fn test_parse_sample() {
        let c = parse(SAMPLE);
        assert_eq!(c.retransmits, 50);
        assert_eq!(c.out_of_order, 99);
        assert_eq!(c.listen_drops, 7);
    }

    #[test]
    fn test_parse_missing_section() {
        let c = parse("IpExt: InNoRoutes\nIpExt: 0\n");
        assert_eq!(c, TcpCounters::default());
    }

    #[test]
    fn test_parse_ragged_value_line() {
        // Fewer values than headers must not panic.
        let c = parse("TcpExt: ListenDrops TCPOFOQueue\nTcpExt: 3\n");
        assert_eq!(c.listen_drops, 3);
        assert_eq!(c.out_of_order, 0);
    }

    #[test]
    fn test_read_does_not_panic() {
        // Whatever the platform, this must return something.
        let _ = read();
    }
}
