//! Pure helpers for building the candidate list probed by endpoint discovery.

pub const DEFAULT_SERVICE_PORT: u32 = 8188;
pub const DEFAULT_PORT_OFFSETS: u32 = 4;
pub const DEFAULT_COMMON_PORTS: &[u32] = &[8080, 3000];

/// Health paths probed on every candidate, in order.
pub const PROBE_PATHS: &[&str] = &["/system_stats", "/queue", "/"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePlan {
    pub default_port: u32,
    /// How many ports after the primary hint to try (primary+1..=primary+offsets).
    pub offsets: u32,
    pub common_ports: Vec<u32>,
}

impl Default for CandidatePlan {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_SERVICE_PORT,
            offsets: DEFAULT_PORT_OFFSETS,
            common_ports: DEFAULT_COMMON_PORTS.to_vec(),
        }
    }
}

/// Normalize marketplace address metadata into a bare host usable in a URL.
///
/// Accepts `1.2.3.4`, `1.2.3.4/32`, `http://host:8188/`, `host:22`, raw IPv6.
/// Returns `None` for empty or malformed input.
pub fn clean_host(raw: &str) -> Option<String> {
    let mut s = raw.trim();
    for scheme in ["http://", "https://"] {
        if let Some(rest) = s.strip_prefix(scheme) {
            s = rest;
        }
    }
    // CIDR suffix or path.
    let s = s.split('/').next().unwrap_or("").trim();
    if s.is_empty() {
        return None;
    }

    let host = if let Some(inner) = s.strip_prefix('[') {
        let end = inner.find(']')?;
        let addr = &inner[..end];
        if addr.is_empty() {
            return None;
        }
        format!("[{}]", addr)
    } else {
        match s.matches(':').count() {
            0 => s.to_string(),
            1 => s.split(':').next().unwrap_or("").to_string(),
            _ => format!("[{}]", s),
        }
    };

    let valid = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == ':');
    if !valid || host.is_empty() || host == "[]" {
        return None;
    }
    Some(host)
}

/// Ordered, de-duplicated candidate ports. Arithmetic stays in `u32` so the
/// list is reproducible even when offsets run past 65535.
pub fn candidate_ports(hints: &[u32], plan: &CandidatePlan) -> Vec<u32> {
    let mut out: Vec<u32> = Vec::new();
    let mut push = |p: u32| {
        if p > 0 && !out.contains(&p) {
            out.push(p);
        }
    };

    if let Some(primary) = hints.first().copied() {
        push(primary);
        for p in hints.iter().skip(1) {
            push(*p);
        }
        push(plan.default_port);
        for k in 1..=plan.offsets {
            push(primary.saturating_add(k));
        }
    } else {
        push(plan.default_port);
    }
    for p in &plan.common_ports {
        push(*p);
    }
    out
}

pub fn candidate_urls(host: &str, hints: &[u32], plan: &CandidatePlan) -> Vec<String> {
    candidate_ports(hints, plan)
        .into_iter()
        .map(|p| format!("http://{}:{}", host, p))
        .collect()
}

/// Parse a comma separated port list (env override), falling back to `default`.
pub fn parse_port_list(raw: Option<&str>, default: &[u32]) -> Vec<u32> {
    let parsed: Vec<u32> = raw
        .unwrap_or("")
        .split(',')
        .filter_map(|s| s.trim().parse::<u32>().ok())
        .filter(|p| *p > 0)
        .collect();
    if parsed.is_empty() {
        default.to_vec()
    } else {
        parsed
    }
}
