//! Parsers for the CLI filter expressions: AS-path patterns, community
//! strings, and attribute names.

use std::sync::OnceLock;

use ahash::AHashMap;

use crate::bgp;
use crate::error::BuildError;
use crate::netaddr::{Community, WideAs, AS_ANY};

use super::{MatchMode, PathTerm};

/// Parse one `-p`/`-P` expression into match terms.
///
/// Grammar: `['^'] term (term)* ['$']` where a term is a decimal AS
/// number, `?` (any AS), or `*` (splits the expression into independent
/// substring matches). `^` anchors the first term group to the start of
/// the path, `$` the last to its end; both on a single group demand an
/// exact match.
pub fn parse_path_expr(expr: &str) -> Result<Vec<PathTerm>, BuildError> {
    let mut tokens: Vec<&str> = expr.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(BuildError::EmptyExpr);
    }

    let mut anchored_start = false;
    if let Some(first) = tokens.first_mut() {
        if let Some(stripped) = first.strip_prefix('^') {
            anchored_start = true;
            *first = stripped;
        }
    }
    let mut anchored_end = false;
    if let Some(last) = tokens.last_mut() {
        if let Some(stripped) = last.strip_suffix('$') {
            anchored_end = true;
            *last = stripped;
        }
    }

    // Split on '*' into groups of atoms.
    let mut groups: Vec<Vec<WideAs>> = vec![Vec::new()];
    for token in tokens {
        if token.is_empty() {
            continue; // a bare '^' or '$'
        }
        let group = groups.len() - 1;
        match token {
            "*" => groups.push(Vec::new()),
            "?" => groups[group].push(AS_ANY),
            _ => {
                let asn: u32 = token
                    .parse()
                    .map_err(|_| BuildError::BadAtom(token.to_string()))?;
                groups[group].push(i64::from(asn));
            }
        }
    }

    let last_idx = groups.len() - 1;
    let mut terms = Vec::new();
    for (i, atoms) in groups.into_iter().enumerate() {
        if atoms.is_empty() {
            // "^ * 1" and friends: an empty group matches trivially
            continue;
        }
        let starts = anchored_start && i == 0;
        let ends = anchored_end && i == last_idx;
        let mode = match (starts, ends) {
            (true, true) => MatchMode::Exact,
            (true, false) => MatchMode::Starts,
            (false, true) => MatchMode::Ends,
            (false, false) => MatchMode::Substring,
        };
        terms.push(PathTerm { atoms, mode });
    }

    if terms.is_empty() {
        return Err(BuildError::EmptyExpr);
    }
    Ok(terms)
}

/// Parse one community token: `ASN:VAL`, a bare 32-bit decimal, or a
/// well-known name.
pub fn parse_community(token: &str) -> Result<Community, BuildError> {
    match token.to_ascii_lowercase().replace('_', "-").as_str() {
        "no-export" => return Ok(0xffff_ff01),
        "no-advertise" => return Ok(0xffff_ff02),
        "no-export-subconfed" => return Ok(0xffff_ff03),
        _ => {}
    }
    if let Some((hi, lo)) = token.split_once(':') {
        let asn: u16 = hi
            .parse()
            .map_err(|_| BuildError::BadCommunity(token.to_string()))?;
        let val: u16 = lo
            .parse()
            .map_err(|_| BuildError::BadCommunity(token.to_string()))?;
        return Ok((u32::from(asn) << 16) | u32::from(val));
    }
    token
        .parse::<u32>()
        .map_err(|_| BuildError::BadCommunity(token.to_string()))
}

/// Parse a whitespace-separated community string, deduplicating repeated
/// communities.
pub fn parse_community_set(expr: &str) -> Result<Vec<Community>, BuildError> {
    let mut out: Vec<Community> = Vec::new();
    for token in expr.split_whitespace() {
        let comm = parse_community(token)?;
        if !out.contains(&comm) {
            out.push(comm);
        }
    }
    if out.is_empty() {
        return Err(BuildError::BadCommunity(expr.to_string()));
    }
    Ok(out)
}

fn attr_names() -> &'static AHashMap<&'static str, u8> {
    static NAMES: OnceLock<AHashMap<&'static str, u8>> = OnceLock::new();
    NAMES.get_or_init(|| {
        AHashMap::from_iter([
            ("origin", bgp::ATTR_ORIGIN),
            ("as-path", bgp::ATTR_AS_PATH),
            ("next-hop", bgp::ATTR_NEXT_HOP),
            ("multi-exit-disc", bgp::ATTR_MULTI_EXIT_DISC),
            ("med", bgp::ATTR_MULTI_EXIT_DISC),
            ("local-pref", bgp::ATTR_LOCAL_PREF),
            ("atomic-aggregate", bgp::ATTR_ATOMIC_AGGREGATE),
            ("aggregator", bgp::ATTR_AGGREGATOR),
            ("community", bgp::ATTR_COMMUNITY),
            ("originator-id", bgp::ATTR_ORIGINATOR_ID),
            ("cluster-list", bgp::ATTR_CLUSTER_LIST),
            ("mp-reach-nlri", bgp::ATTR_MP_REACH_NLRI),
            ("mp-unreach-nlri", bgp::ATTR_MP_UNREACH_NLRI),
            ("extended-communities", bgp::ATTR_EXTENDED_COMMUNITIES),
            ("as4-path", bgp::ATTR_AS4_PATH),
            ("as4-aggregator", bgp::ATTR_AS4_AGGREGATOR),
            ("large-community", bgp::ATTR_LARGE_COMMUNITY),
        ])
    })
}

/// Parse an attribute selector: a name (case-insensitive, `_` and `-`
/// interchangeable) or a decimal code in 0..=255.
pub fn parse_attr_code(token: &str) -> Result<u8, BuildError> {
    if let Ok(code) = token.parse::<u8>() {
        return Ok(code);
    }
    let key = token.to_ascii_lowercase().replace('_', "-");
    attr_names()
        .get(key.as_str())
        .copied()
        .ok_or_else(|| BuildError::BadAttribute(token.to_string()))
}
