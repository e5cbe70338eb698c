use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Replacement value for redacted header entries.
pub const REDACTED: &str = "[REDACTED]";

/// Seconds since the Unix epoch as a float. All wire timestamps use this.
pub fn current_timestamp() -> f64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs_f64())
		.unwrap_or(0.0)
}

/// Return a copy of `headers` with every key in `sensitive` (matched
/// case-insensitively; the set must hold lowercase names) replaced by
/// `[REDACTED]`.
pub fn redact_headers(
	headers: &HashMap<String, String>,
	sensitive: &HashSet<String>,
) -> HashMap<String, String> {
	headers
		.iter()
		.map(|(k, v)| {
			if sensitive.contains(&k.to_lowercase()) {
				(k.clone(), REDACTED.to_string())
			} else {
				(k.clone(), v.clone())
			}
		})
		.collect()
}

/// Truncate `value` to at most `max_bytes` bytes, appending `...` when
/// anything was cut. Truncation never splits a UTF-8 character.
pub fn clamp_str(value: &str, max_bytes: usize) -> String {
	if value.len() <= max_bytes {
		return value.to_string();
	}
	let mut end = max_bytes;
	while end > 0 && !value.is_char_boundary(end) {
		end -= 1;
	}
	format!("{}...", &value[..end])
}

/// Mask the host-identifying tail of an IP address: the last octet for
/// IPv4, the last 80 bits for IPv6. With `enabled == false`, or when the
/// input does not parse as an address, the input is returned unchanged.
pub fn anonymize_ip(ip: &str, enabled: bool) -> String {
	if !enabled {
		return ip.to_string();
	}
	match ip.parse::<IpAddr>() {
		Ok(IpAddr::V4(v4)) => {
			let o = v4.octets();
			format!("{}.{}.{}.0", o[0], o[1], o[2])
		}
		Ok(IpAddr::V6(v6)) => {
			let s = v6.segments();
			// Keep the /48 routing prefix, zero the remaining 80 bits.
			std::net::Ipv6Addr::new(s[0], s[1], s[2], 0, 0, 0, 0, 0).to_string()
		}
		Err(_) => ip.to_string(),
	}
}
