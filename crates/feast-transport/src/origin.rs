//! Browser `Origin` checks for the WebSocket upgrade.
//!
//! Origins compare as `scheme://host[:port]` with scheme and host
//! lowercased. Anything after the authority is ignored.

/// Which browser origins may open a socket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OriginPolicy {
    /// Pages served from `localhost`, `127.0.0.1` or `[::1]` over http(s).
    #[default]
    LocalhostOnly,
    /// Exactly these origins, already normalized. May be empty.
    AllowList(Vec<String>),
}

impl OriginPolicy {
    /// Builds a policy from configured origins.
    ///
    /// Blank entries are skipped; with nothing else configured the policy
    /// is [`OriginPolicy::LocalhostOnly`]. `*` and malformed entries are
    /// refused but still count as configuration, so `*` alone admits no
    /// browser origin at all.
    pub fn new<I>(origins: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut configured = false;
        let mut allowed = Vec::new();
        for raw in origins {
            let raw = raw.as_ref().trim();
            if raw.is_empty() {
                continue;
            }
            configured = true;
            if raw == "*" {
                tracing::warn!("wildcard origin is not supported, ignoring it");
                continue;
            }
            match normalize(raw) {
                Some(origin) => allowed.push(origin),
                None => tracing::warn!(origin = raw, "ignoring malformed origin"),
            }
        }
        if configured {
            Self::AllowList(allowed)
        } else {
            Self::LocalhostOnly
        }
    }

    /// Parses a comma-separated list, as found in `ALLOWED_WS_ORIGINS`.
    pub fn from_list(raw: &str) -> Self {
        Self::new(raw.split(','))
    }

    /// Whether a request carrying `Origin: origin` may upgrade.
    pub fn allows(&self, origin: &str) -> bool {
        let Some(origin) = normalize(origin.trim()) else {
            return false;
        };
        match self {
            Self::LocalhostOnly => is_local(&origin),
            Self::AllowList(allowed) => allowed.iter().any(|a| *a == origin),
        }
    }
}

/// `scheme://authority`, lowercased, or `None` if either part is missing.
fn normalize(raw: &str) -> Option<String> {
    let (scheme, rest) = raw.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if scheme.is_empty() || authority.is_empty() {
        return None;
    }
    Some(format!(
        "{}://{}",
        scheme.to_ascii_lowercase(),
        authority.to_ascii_lowercase()
    ))
}

fn is_local(origin: &str) -> bool {
    let Some((scheme, authority)) = origin.split_once("://") else {
        return false;
    };
    if scheme != "http" && scheme != "https" {
        return false;
    }
    let host = if authority.starts_with('[') {
        authority.split_inclusive(']').next().unwrap_or(authority)
    } else {
        authority.split(':').next().unwrap_or(authority)
    };
    matches!(host, "localhost" | "127.0.0.1" | "[::1]")
}
