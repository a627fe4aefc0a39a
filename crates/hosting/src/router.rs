//! Tool-name and resource-URI routing across attached connectors.
//!
//! A hosting context can aggregate several connectors. Exposed tool names
//! are prefixed with the connector kind (`gitlab_list_projects`); routing
//! strips the prefix back off. Matching is longest-prefix so `gitlab_`
//! wins over `git_` for `gitlab_list_projects`. Resources route by URI
//! scheme against the connector kind.

/// Routing view of one attached connector.
#[derive(Debug, Clone, Copy)]
pub struct TargetMeta<'a> {
    pub kind: &'a str,
    pub enabled: bool,
    pub external: bool,
}

/// Resolve an exposed tool name to `(target index, connector-local name)`.
///
/// Longest matching `{kind}_` prefix among enabled targets wins. When the
/// context has exactly one enabled target, an unprefixed name passes
/// through unchanged. A name carrying a disabled connector's prefix never
/// falls through to the pass-through.
#[must_use]
pub fn resolve_tool(targets: &[TargetMeta<'_>], exposed: &str) -> Option<(usize, String)> {
    let mut best: Option<(usize, usize)> = None;
    let mut matched_disabled = false;
    for (idx, target) in targets.iter().enumerate() {
        let prefix_len = target.kind.len() + 1;
        let matches = exposed.len() > prefix_len
            && exposed.starts_with(target.kind)
            && exposed.as_bytes()[target.kind.len()] == b'_';
        if !matches {
            continue;
        }
        if !target.enabled {
            matched_disabled = true;
            continue;
        }
        if best.is_none_or(|(_, len)| prefix_len > len) {
            best = Some((idx, prefix_len));
        }
    }
    if let Some((idx, prefix_len)) = best {
        return Some((idx, exposed[prefix_len..].to_string()));
    }
    if matched_disabled {
        return None;
    }

    let mut enabled = targets.iter().enumerate().filter(|(_, t)| t.enabled);
    match (enabled.next(), enabled.next()) {
        (Some((idx, _)), None) => Some((idx, exposed.to_string())),
        _ => None,
    }
}

/// Resolve a resource URI to a target index.
///
/// The URI scheme is matched against connector kinds first. A URI whose
/// scheme matches nothing still routes when the context has a single
/// attached connector and it is external, since external servers own
/// arbitrary schemes. A non-URI string routes only when a single enabled
/// target exists.
#[must_use]
pub fn resolve_resource(targets: &[TargetMeta<'_>], uri: &str) -> Option<usize> {
    let scheme = uri.split_once("://").map(|(s, _)| s);

    if let Some(scheme) = scheme {
        if let Some(idx) = targets
            .iter()
            .position(|t| t.enabled && t.kind.eq_ignore_ascii_case(scheme))
        {
            return Some(idx);
        }
        return match targets {
            [only] if only.enabled && only.external => Some(0),
            _ => None,
        };
    }

    let mut enabled = targets.iter().enumerate().filter(|(_, t)| t.enabled);
    match (enabled.next(), enabled.next()) {
        (Some((idx, _)), None) => Some(idx),
        _ => None,
    }
}
