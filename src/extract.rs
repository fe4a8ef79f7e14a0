//! Client address extraction from access logs.

use regex::Regex;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Dotted quad anchored at the start of a line, as written by
/// Apache/nginx combined log formats.
const ADDRESS_PATTERN: &str = r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}";

fn address_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(ADDRESS_PATTERN).expect("address pattern is valid"))
}

/// Extract the client address from a single log line.
///
/// Lines that do not start with a dotted quad, or whose octets are out of
/// range, yield `None`. Octets with leading zeros are read as decimal, so
/// `010.0.0.1` and `10.0.0.1` are the same address.
pub fn parse_line(line: &str) -> Option<IpAddr> {
    let found = address_pattern().find(line)?;
    let mut octets = [0u8; 4];
    for (octet, digits) in octets.iter_mut().zip(found.as_str().split('.')) {
        *octet = digits.parse().ok()?;
    }
    Some(IpAddr::V4(Ipv4Addr::from(octets)))
}

/// Read every log and return the distinct client addresses found.
///
/// Files that cannot be opened are reported and skipped; the addresses from
/// the remaining files are still returned.
pub fn read_logs<P: AsRef<Path>>(paths: &[P]) -> HashSet<IpAddr> {
    let mut addresses = HashSet::new();

    for path in paths {
        let path = path.as_ref();
        match read_log(path, &mut addresses) {
            Ok(lines) => {
                debug!(log = %path.display(), lines, "Scanned log");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(log = %path.display(), "Log file does not exist, skipping");
            }
            Err(e) => {
                warn!(log = %path.display(), error = %e, "Failed to read log file, skipping");
            }
        }
    }

    addresses
}

fn read_log(path: &Path, addresses: &mut HashSet<IpAddr>) -> std::io::Result<usize> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = Vec::new();
    let mut lines = 0;

    // Access logs may carry arbitrary bytes from request lines.
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        lines += 1;
        if let Some(ip) = parse_line(&String::from_utf8_lossy(&buf)) {
            addresses.insert(ip);
        }
    }

    Ok(lines)
}
