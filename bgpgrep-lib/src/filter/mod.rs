//! The filter builder: translates parsed CLI options into one bytecode
//! program.
//!
//! The program is a sequence of guard stages. Each stage evaluates one
//! option family and rejects the record early via `CFAIL` when it does
//! not hold; a record that survives every guard reaches the terminal
//! `LOAD true` and is accepted. Alternatives within a stage use the
//! OR-block idiom: `BLK; t1; CPASS; ...; tN; ENDBLK; NOT; CFAIL`.

pub mod expr;

use crate::error::BuildError;
use crate::netaddr::{Afi, NetAddr, WideAs};
use crate::trie::PrefixTrie;
use crate::vm::op::{access, op};
use crate::vm::{Cell, Vm, FN_FIND_LOOPS, FN_PEER_ADDR_LIST, FN_PEER_AS_LIST, K_PEER_ADDR, K_PEER_AS};

/// How one AS-path term matches against the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Substring,
    Starts,
    Ends,
    Exact,
}

/// One term of a parsed `-p`/`-P` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct PathTerm {
    pub atoms: Vec<WideAs>,
    pub mode: MatchMode,
}

/// A whole `-p`/`-P` expression: an AND chain of terms, possibly
/// negated.
#[derive(Debug, Clone, PartialEq)]
pub struct PathPattern {
    pub terms: Vec<PathTerm>,
    pub negate: bool,
}

/// One `-m`/`-M` community set.
#[derive(Debug, Clone, PartialEq)]
pub struct CommunityTerm {
    pub comms: Vec<u32>,
    pub negate: bool,
}

/// Which relational test the prefix filter applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixMode {
    Exact,
    Subnet,
    Supernet,
    Related,
}

/// AS-loop handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    /// Keep only records with a loop (`-l`).
    Keep,
    /// Discard records with a loop (`-L`).
    Discard,
}

/// Everything the CLI collected, ready for compilation.
#[derive(Debug, Default)]
pub struct FilterOpts {
    pub peer_as: Vec<u32>,
    pub peer_addrs: Vec<NetAddr>,
    pub attrs: Vec<u8>,
    pub communities: Vec<CommunityTerm>,
    pub paths: Vec<PathPattern>,
    pub prefixes: Vec<NetAddr>,
    pub prefix_mode: Option<PrefixMode>,
    pub loops: Option<LoopMode>,
}

/// Build the filter VM for one invocation.
pub fn compile(opts: &FilterOpts) -> Result<Vm, BuildError> {
    let mut vm = Vm::new();

    // 1. peer-AS membership
    if !opts.peer_as.is_empty() {
        vm.set_peer_as_filter(opts.peer_as.iter().map(|&a| i64::from(a)).collect());
        vm.emit_arg(op::CALL, FN_PEER_AS_LIST);
        vm.emit_arg(op::ASCONTAINS, K_PEER_AS);
        vm.emit(op::NOT);
        vm.emit(op::CFAIL);
    }

    // 2. peer-address membership
    if !opts.peer_addrs.is_empty() {
        vm.set_peer_addr_filter(opts.peer_addrs.clone());
        vm.emit_arg(op::CALL, FN_PEER_ADDR_LIST);
        vm.emit_arg(op::ADDRCONTAINS, K_PEER_ADDR);
        vm.emit(op::NOT);
        vm.emit(op::CFAIL);
    }

    // 3. attributes of interest
    if !opts.attrs.is_empty() {
        emit_or_stage(&mut vm, opts.attrs.len(), |vm, i| {
            vm.emit_arg(op::HASATTR, u32::from(opts.attrs[i]));
            Ok(())
        })?;
    }

    // 4. community sets
    if !opts.communities.is_empty() {
        let mut consts = Vec::with_capacity(opts.communities.len());
        for term in &opts.communities {
            let cells: Vec<Cell> = term.comms.iter().map(|&c| Cell::Comm(c)).collect();
            let arr = vm.alloc_array(&cells)?;
            let k = vm.add_const(arr).ok_or(BuildError::ConstExhausted)?;
            consts.push(k);
        }
        emit_or_stage(&mut vm, opts.communities.len(), |vm, i| {
            vm.emit_arg(op::LOADK, consts[i]);
            vm.emit(op::UNPACK);
            vm.emit(op::COMMEXACT);
            if opts.communities[i].negate {
                vm.emit(op::NOT);
            }
            Ok(())
        })?;
    }

    // 5. AS-path expressions
    if !opts.paths.is_empty() {
        emit_or_stage(&mut vm, opts.paths.len(), |vm, i| {
            emit_path_pattern(vm, &opts.paths[i])
        })?;
    }

    // 6. prefix filter
    if let Some(mode) = opts.prefix_mode {
        let mut trie4 = PrefixTrie::new(Afi::Ipv4);
        let mut trie6 = PrefixTrie::new(Afi::Ipv6);
        for prefix in &opts.prefixes {
            let trie = match prefix.afi() {
                Afi::Ipv4 => &mut trie4,
                Afi::Ipv6 => &mut trie6,
            };
            trie.insert(prefix).map_err(|_| BuildError::Vm(crate::error::VmError::TrieMismatch))?;
        }
        let t4 = vm.install_trie(trie4);
        let t6 = vm.install_trie(trie6);

        let opcode = match mode {
            PrefixMode::Exact => op::EXACT,
            PrefixMode::Subnet => op::SUBNET,
            PrefixMode::Supernet => op::SUPERNET,
            PrefixMode::Related => op::RELATED,
        };
        vm.emit_arg(op::SETTRIE, t4);
        vm.emit_arg(op::SETTRIE6, t6);
        vm.emit(op::BLK);
        vm.emit_arg(
            opcode,
            u32::from(access::SETTLE | access::ALL | access::NLRI),
        );
        vm.emit(op::CPASS);
        vm.emit_arg(
            opcode,
            u32::from(access::SETTLE | access::ALL | access::WITHDRAWN),
        );
        vm.emit(op::ENDBLK);
        vm.emit(op::NOT);
        vm.emit(op::CFAIL);
    }

    // 7. AS-loop flag
    if let Some(mode) = opts.loops {
        vm.emit_arg(op::CALL, FN_FIND_LOOPS);
        if mode == LoopMode::Keep {
            vm.emit(op::NOT);
        }
        vm.emit(op::CFAIL);
    }

    // 8. default verdict
    vm.emit_arg(op::LOAD, 1);

    Ok(vm)
}

/// Emit one guard stage: an OR over `count` term emissions, followed by
/// `NOT; CFAIL` so that "none matched" rejects the record.
fn emit_or_stage<F>(vm: &mut Vm, count: usize, mut emit_term: F) -> Result<(), BuildError>
where
    F: FnMut(&mut Vm, usize) -> Result<(), BuildError>,
{
    if count == 1 {
        emit_term(vm, 0)?;
    } else {
        vm.emit(op::BLK);
        for i in 0..count {
            emit_term(vm, i)?;
            if i + 1 < count {
                vm.emit(op::CPASS);
            }
        }
        vm.emit(op::ENDBLK);
    }
    vm.emit(op::NOT);
    vm.emit(op::CFAIL);
    Ok(())
}

/// Emit one `-p`/`-P` expression. Multi-term chains get their own block
/// so an intermediate failure abandons only this chain; the first term
/// rewinds the path iterator, later terms continue the same traversal.
fn emit_path_pattern(vm: &mut Vm, pattern: &PathPattern) -> Result<(), BuildError> {
    let chained = pattern.terms.len() > 1;
    if chained {
        vm.emit(op::BLK);
    }
    for (i, term) in pattern.terms.iter().enumerate() {
        for &atom in &term.atoms {
            if (0..=i64::from(crate::vm::op::ARG_MASK)).contains(&atom) {
                vm.emit_arg(op::LOAD, atom as u32);
            } else {
                let k = vm
                    .add_const(Cell::As(atom))
                    .ok_or(BuildError::ConstExhausted)?;
                vm.emit_arg(op::LOADK, k);
            }
        }
        let acc = if i == 0 {
            access::REAL_AS_PATH | access::SETTLE
        } else {
            access::REAL_AS_PATH
        };
        let opcode = match term.mode {
            MatchMode::Substring => op::ASPMATCH,
            MatchMode::Starts => op::ASPSTARTS,
            MatchMode::Ends => op::ASPENDS,
            MatchMode::Exact => op::ASPEXACT,
        };
        vm.emit_arg(opcode, u32::from(acc));
        if i + 1 < pattern.terms.len() {
            vm.emit(op::NOT);
            vm.emit(op::CFAIL);
        }
    }
    if chained {
        vm.emit(op::ENDBLK);
    }
    if pattern.negate {
        vm.emit(op::NOT);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::{BgpMessage, UpdateBuilder};

    fn pfx(s: &str) -> NetAddr {
        s.parse().unwrap()
    }

    fn update_with_path(path: &[u32]) -> BgpMessage {
        UpdateBuilder::new()
            .origin(0)
            .as_path(path)
            .announce(pfx("10.1.0.0/16"))
            .build()
            .unwrap()
    }

    fn run_path_filter(expr: &str, negate: bool, path: &[u32]) -> bool {
        let opts = FilterOpts {
            paths: vec![PathPattern {
                terms: expr::parse_path_expr(expr).unwrap(),
                negate,
            }],
            ..Default::default()
        };
        let mut vm = compile(&opts).unwrap();
        vm.set_peer(65000, NetAddr::host("192.0.2.1".parse().unwrap()));
        vm.execute(&update_with_path(path)).unwrap()
    }

    #[test]
    fn test_anchored_start() {
        assert!(run_path_filter("^1 2", false, &[1, 2, 3, 4]));
        assert!(!run_path_filter("^2 3", false, &[1, 2, 3, 4]));
    }

    #[test]
    fn test_anchored_end_and_exact() {
        assert!(run_path_filter("3 4$", false, &[1, 2, 3, 4]));
        assert!(!run_path_filter("2 3$", false, &[1, 2, 3, 4]));
        assert!(run_path_filter("^1 2 3 4$", false, &[1, 2, 3, 4]));
        assert!(!run_path_filter("^1 2 3$", false, &[1, 2, 3, 4]));
    }

    #[test]
    fn test_substring_and_wildcard() {
        assert!(run_path_filter("2 3", false, &[1, 2, 3, 4]));
        assert!(run_path_filter("1 ? 3", false, &[1, 2, 3, 4]));
        assert!(!run_path_filter("1 ? 4", false, &[1, 2, 3, 4]));
    }

    #[test]
    fn test_star_chains_scan_left_to_right() {
        assert!(run_path_filter("1 * 4", false, &[1, 2, 3, 4]));
        // terms must appear in order along the path
        assert!(!run_path_filter("4 * 1", false, &[1, 2, 3, 4]));
        assert!(run_path_filter("^1 * 4$", false, &[1, 2, 3, 4]));
    }

    #[test]
    fn test_negated_expression() {
        assert!(!run_path_filter("^1 2", true, &[1, 2, 3]));
        assert!(run_path_filter("^2 3", true, &[1, 2, 3]));
    }

    #[test]
    fn test_multiple_expressions_or_together() {
        let opts = FilterOpts {
            paths: vec![
                PathPattern {
                    terms: expr::parse_path_expr("^9 9").unwrap(),
                    negate: false,
                },
                PathPattern {
                    terms: expr::parse_path_expr("3 4$").unwrap(),
                    negate: false,
                },
            ],
            ..Default::default()
        };
        let mut vm = compile(&opts).unwrap();
        assert!(vm.execute(&update_with_path(&[1, 2, 3, 4])).unwrap());
        assert!(!vm.execute(&update_with_path(&[5, 6, 7])).unwrap());
    }

    fn update_with_communities(comms: &[u32]) -> BgpMessage {
        UpdateBuilder::new()
            .origin(0)
            .as_path(&[65000])
            .communities(comms)
            .announce(pfx("10.0.0.0/8"))
            .build()
            .unwrap()
    }

    fn comm(s: &str) -> u32 {
        expr::parse_community(s).unwrap()
    }

    #[test]
    fn test_community_filter() {
        let msg = update_with_communities(&[comm("100:1"), comm("200:2"), comm("300:3")]);

        let accept = |spec: &str, negate: bool| {
            let opts = FilterOpts {
                communities: vec![CommunityTerm {
                    comms: expr::parse_community_set(spec).unwrap(),
                    negate,
                }],
                ..Default::default()
            };
            compile(&opts).unwrap().execute(&msg).unwrap()
        };

        assert!(accept("100:1 300:3", false));
        assert!(!accept("100:1 100:2", false));
        assert!(accept("100:2", true));
        assert!(!accept("100:1", true));
    }

    #[test]
    fn test_community_multiset_needs_duplicates_in_message() {
        // dedup happens at parse time; a raw duplicated term would demand
        // two copies in the message and fail
        let msg = update_with_communities(&[comm("100:1")]);
        let opts = FilterOpts {
            communities: vec![CommunityTerm {
                comms: vec![comm("100:1"), comm("100:1")],
                negate: false,
            }],
            ..Default::default()
        };
        assert!(!compile(&opts).unwrap().execute(&msg).unwrap());
    }

    fn prefix_filter_verdict(mode: PrefixMode, msg: &BgpMessage) -> bool {
        let opts = FilterOpts {
            prefixes: vec![pfx("10.0.0.0/8"), pfx("2001:db8::/32")],
            prefix_mode: Some(mode),
            ..Default::default()
        };
        compile(&opts).unwrap().execute(msg).unwrap()
    }

    #[test]
    fn test_prefix_filter_modes() {
        let msg = update_with_path(&[65000]); // announces 10.1.0.0/16
        assert!(prefix_filter_verdict(PrefixMode::Subnet, &msg));
        assert!(!prefix_filter_verdict(PrefixMode::Supernet, &msg));
        assert!(prefix_filter_verdict(PrefixMode::Related, &msg));
        assert!(!prefix_filter_verdict(PrefixMode::Exact, &msg));
    }

    #[test]
    fn test_prefix_filter_sees_withdrawn_and_v6() {
        let msg = UpdateBuilder::new()
            .withdraw(pfx("10.9.0.0/16"))
            .build()
            .unwrap();
        assert!(prefix_filter_verdict(PrefixMode::Subnet, &msg));

        let v6 = UpdateBuilder::new()
            .announce(pfx("2001:db8:1::/48"))
            .build()
            .unwrap();
        assert!(prefix_filter_verdict(PrefixMode::Subnet, &v6));
        assert!(!prefix_filter_verdict(PrefixMode::Exact, &v6));
    }

    #[test]
    fn test_peer_as_filter() {
        let opts = FilterOpts {
            peer_as: vec![65000],
            ..Default::default()
        };
        let mut vm = compile(&opts).unwrap();
        let msg = update_with_path(&[1]);

        vm.set_peer(65000, NetAddr::host("192.0.2.1".parse().unwrap()));
        assert!(vm.execute(&msg).unwrap());
        vm.set_peer(65001, NetAddr::host("192.0.2.1".parse().unwrap()));
        assert!(!vm.execute(&msg).unwrap());
    }

    #[test]
    fn test_peer_addr_filter() {
        let opts = FilterOpts {
            peer_addrs: vec![NetAddr::host("192.0.2.1".parse().unwrap())],
            ..Default::default()
        };
        let mut vm = compile(&opts).unwrap();
        let msg = update_with_path(&[1]);

        vm.set_peer(65000, NetAddr::host("192.0.2.1".parse().unwrap()));
        assert!(vm.execute(&msg).unwrap());
        vm.set_peer(65000, NetAddr::host("192.0.2.9".parse().unwrap()));
        assert!(!vm.execute(&msg).unwrap());
    }

    #[test]
    fn test_attr_filter() {
        let opts = FilterOpts {
            attrs: vec![crate::bgp::ATTR_COMMUNITY, crate::bgp::ATTR_AGGREGATOR],
            ..Default::default()
        };
        let mut vm = compile(&opts).unwrap();
        assert!(vm
            .execute(&update_with_communities(&[comm("100:1")]))
            .unwrap());
        assert!(!vm.execute(&update_with_path(&[1])).unwrap());
    }

    #[test]
    fn test_loop_filter() {
        let looped = update_with_path(&[1, 2, 3, 2, 4]);
        let prepended = update_with_path(&[1, 2, 2, 3, 4, 5]);

        let keep = FilterOpts {
            loops: Some(LoopMode::Keep),
            ..Default::default()
        };
        let mut vm = compile(&keep).unwrap();
        assert!(vm.execute(&looped).unwrap());
        assert!(!vm.execute(&prepended).unwrap());

        let discard = FilterOpts {
            loops: Some(LoopMode::Discard),
            ..Default::default()
        };
        let mut vm = compile(&discard).unwrap();
        assert!(!vm.execute(&looped).unwrap());
        assert!(vm.execute(&prepended).unwrap());
    }

    #[test]
    fn test_empty_filter_accepts_everything() {
        let mut vm = compile(&FilterOpts::default()).unwrap();
        assert_eq!(vm.code().len(), 1); // the terminal LOAD true
        assert!(vm.execute(&update_with_path(&[1, 2, 3])).unwrap());
    }

    #[test]
    fn test_stages_compose() {
        let opts = FilterOpts {
            peer_as: vec![65000],
            paths: vec![PathPattern {
                terms: expr::parse_path_expr("^1").unwrap(),
                negate: false,
            }],
            ..Default::default()
        };
        let mut vm = compile(&opts).unwrap();
        let msg = update_with_path(&[1, 2]);

        vm.set_peer(65000, NetAddr::host("192.0.2.1".parse().unwrap()));
        assert!(vm.execute(&msg).unwrap());
        // path guard fails
        assert!(!vm.execute(&update_with_path(&[2, 1])).unwrap());
        // peer guard fails
        vm.set_peer(64999, NetAddr::host("192.0.2.1".parse().unwrap()));
        assert!(!vm.execute(&msg).unwrap());
    }
}
