#![forbid(unsafe_code)]

use clap::Parser;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

use bgpgrep_lib::bgp::BgpMessage;
use bgpgrep_lib::dump::{dump_hex, dump_peer_table, dump_text, DumpCtx};
use bgpgrep_lib::error::{BuildError, GrepError, Result};
use bgpgrep_lib::filter::{
    self, expr, CommunityTerm, FilterOpts, LoopMode, PathPattern, PrefixMode,
};
use bgpgrep_lib::input::open_input;
use bgpgrep_lib::mrt::table_dump::{self, PeerTable};
use bgpgrep_lib::mrt::{bgp4mp, MrtReader, MRT_BGP4MP, MRT_BGP4MP_ET, MRT_TABLE_DUMP_V2};
use bgpgrep_lib::scanner::Scanner;
use bgpgrep_lib::{NetAddr, Vm};

#[derive(Parser, Debug)]
#[command(
    name = "bgpgrep",
    version,
    about = "Filter and print BGP routing data from MRT archives"
)]
struct Cli {
    /// Accept only records whose peer AS is in the given set
    #[arg(short = 'a', value_name = "AS")]
    peer_as: Vec<u32>,

    /// Read peer ASes from a token file
    #[arg(short = 'A', value_name = "FILE")]
    peer_as_file: Vec<PathBuf>,

    /// Accept only records whose peer address is in the given set
    #[arg(short = 'i', value_name = "ADDR")]
    peer_addr: Vec<String>,

    /// Read peer addresses from a token file
    #[arg(short = 'I', value_name = "FILE")]
    peer_addr_file: Vec<PathBuf>,

    /// Prefix filter: keep records carrying exactly a listed prefix
    #[arg(short = 'e', value_name = "PREFIX")]
    exact: Vec<String>,

    /// Like -e, reading prefixes from a token file
    #[arg(short = 'E', value_name = "FILE")]
    exact_file: Vec<PathBuf>,

    /// Prefix filter: keep records carrying subnets of listed prefixes
    #[arg(short = 's', value_name = "PREFIX")]
    subnet: Vec<String>,

    /// Like -s, reading prefixes from a token file
    #[arg(short = 'S', value_name = "FILE")]
    subnet_file: Vec<PathBuf>,

    /// Prefix filter: keep records carrying supernets of listed prefixes
    #[arg(short = 'u', value_name = "PREFIX")]
    supernet: Vec<String>,

    /// Like -u, reading prefixes from a token file
    #[arg(short = 'U', value_name = "FILE")]
    supernet_file: Vec<PathBuf>,

    /// Prefix filter: keep records related to listed prefixes
    #[arg(short = 'r', value_name = "PREFIX")]
    related: Vec<String>,

    /// Like -r, reading prefixes from a token file
    #[arg(short = 'R', value_name = "FILE")]
    related_file: Vec<PathBuf>,

    /// Accept iff the AS path matches the expression
    #[arg(short = 'p', value_name = "EXPR")]
    path_match: Vec<String>,

    /// Accept iff the AS path does not match the expression
    #[arg(short = 'P', value_name = "EXPR")]
    path_differ: Vec<String>,

    /// Accept iff the community attribute contains all listed communities
    #[arg(short = 'm', value_name = "COMMUNITIES")]
    comm_match: Vec<String>,

    /// Accept iff the community attribute lacks some listed community
    #[arg(short = 'M', value_name = "COMMUNITIES")]
    comm_differ: Vec<String>,

    /// Accept iff the UPDATE has one of the listed attributes (name or
    /// decimal code)
    #[arg(short = 't', value_name = "ATTR")]
    attr: Vec<String>,

    /// Like -t, reading attribute selectors from a token file
    #[arg(short = 'T', value_name = "FILE")]
    attr_file: Vec<PathBuf>,

    /// Keep only records with an AS loop
    #[arg(short = 'l', overrides_with = "no_loops")]
    loops: bool,

    /// Discard records with an AS loop
    #[arg(short = 'L', overrides_with = "loops")]
    no_loops: bool,

    /// Emit the peer index table only; do not run the filter
    #[arg(short = 'f')]
    peer_index_only: bool,

    /// Dump matching packets as C hex arrays
    #[arg(short = 'c')]
    hex: bool,

    /// Print the compiled filter bytecode to standard error
    #[arg(short = 'd')]
    dump_bytecode: bool,

    /// Redirect standard output to a file
    #[arg(short = 'o', value_name = "FILE")]
    output: Option<PathBuf>,

    /// MRT archives to process; standard input when empty. Extensions
    /// .gz/.z, .bz2 and .xz select transparent decompression.
    #[arg(value_name = "FILE")]
    files: Vec<PathBuf>,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    std::process::exit(run(&cli));
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> i32 {
    let opts = match build_opts(cli) {
        Ok(opts) => opts,
        Err(err) => {
            error!(%err, "invalid filter options");
            return 1;
        }
    };
    let mut vm = match filter::compile(&opts) {
        Ok(vm) => vm,
        Err(err) => {
            error!(%err, "cannot build filter program");
            return 1;
        }
    };
    if cli.dump_bytecode {
        eprint!("{}", vm.disassemble());
    }

    let mut out: Box<dyn Write> = match &cli.output {
        Some(path) => match std::fs::File::create(path) {
            Ok(file) => Box::new(BufWriter::new(file)),
            Err(err) => {
                error!(file = %path.display(), %err, "cannot open output file");
                return 1;
            }
        },
        None => Box::new(BufWriter::new(std::io::stdout())),
    };

    let inputs: Vec<Option<PathBuf>> = if cli.files.is_empty() {
        vec![None]
    } else {
        cli.files.iter().cloned().map(Some).collect()
    };

    let mut failed = false;
    for input in inputs {
        let (label, reader) = match open_input(input.as_deref()) {
            Ok(opened) => opened,
            Err(err) => {
                error!(%err, "cannot open input");
                failed = true;
                continue;
            }
        };
        match process_input(&mut vm, reader, &label, out.as_mut(), cli) {
            Ok(clean) => failed |= !clean,
            Err(err) => {
                error!(file = %label, %err, "processing failed");
                failed = true;
            }
        }
    }
    if let Err(err) = out.flush() {
        error!(%err, "cannot flush output");
        failed = true;
    }
    i32::from(failed)
}

fn read_tokens(path: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(path)?;
    let scanner = Scanner::new(
        path.display().to_string(),
        std::io::BufReader::new(file),
    );
    Ok(scanner.tokens()?)
}

/// Collect the prefix strings of one relational mode, inline arguments
/// plus token files.
fn collect_strings(inline: &[String], files: &[PathBuf]) -> Result<Vec<String>> {
    let mut out = inline.to_vec();
    for file in files {
        out.extend(read_tokens(file)?);
    }
    Ok(out)
}

fn build_opts(cli: &Cli) -> Result<FilterOpts> {
    let mut opts = FilterOpts::default();

    opts.peer_as = cli.peer_as.clone();
    for file in &cli.peer_as_file {
        for token in read_tokens(file)? {
            let asn = token
                .parse()
                .map_err(|_| GrepError::Build(BuildError::BadAtom(token.clone())))?;
            opts.peer_as.push(asn);
        }
    }

    for token in collect_strings(&cli.peer_addr, &cli.peer_addr_file)? {
        opts.peer_addrs.push(token.parse::<NetAddr>()?);
    }

    let prefix_sets = [
        (PrefixMode::Exact, collect_strings(&cli.exact, &cli.exact_file)?),
        (
            PrefixMode::Subnet,
            collect_strings(&cli.subnet, &cli.subnet_file)?,
        ),
        (
            PrefixMode::Supernet,
            collect_strings(&cli.supernet, &cli.supernet_file)?,
        ),
        (
            PrefixMode::Related,
            collect_strings(&cli.related, &cli.related_file)?,
        ),
    ];
    for (mode, strings) in prefix_sets {
        if strings.is_empty() {
            continue;
        }
        if opts.prefix_mode.is_some() {
            return Err(GrepError::Unsupported(
                "conflicting prefix filters: use only one of -e/-s/-u/-r".to_string(),
            ));
        }
        opts.prefix_mode = Some(mode);
        for s in strings {
            opts.prefixes.push(s.parse::<NetAddr>()?);
        }
    }

    for spec in &cli.path_match {
        opts.paths.push(PathPattern {
            terms: expr::parse_path_expr(spec).map_err(GrepError::Build)?,
            negate: false,
        });
    }
    for spec in &cli.path_differ {
        opts.paths.push(PathPattern {
            terms: expr::parse_path_expr(spec).map_err(GrepError::Build)?,
            negate: true,
        });
    }

    for spec in &cli.comm_match {
        opts.communities.push(CommunityTerm {
            comms: expr::parse_community_set(spec).map_err(GrepError::Build)?,
            negate: false,
        });
    }
    for spec in &cli.comm_differ {
        opts.communities.push(CommunityTerm {
            comms: expr::parse_community_set(spec).map_err(GrepError::Build)?,
            negate: true,
        });
    }

    for token in collect_strings(&cli.attr, &cli.attr_file)? {
        opts.attrs.push(expr::parse_attr_code(&token).map_err(GrepError::Build)?);
    }

    opts.loops = if cli.loops {
        Some(LoopMode::Keep)
    } else if cli.no_loops {
        Some(LoopMode::Discard)
    } else {
        None
    };

    Ok(opts)
}

fn emit_match(
    out: &mut dyn Write,
    cli: &Cli,
    matched: &mut usize,
    ctx: &DumpCtx,
    msg: &BgpMessage,
) -> Result<()> {
    if cli.hex {
        dump_hex(out, *matched, msg.wire())?;
    } else {
        dump_text(out, ctx, msg)?;
    }
    *matched += 1;
    Ok(())
}

fn process_input(
    vm: &mut Vm,
    reader: Box<dyn Read>,
    label: &str,
    out: &mut dyn Write,
    cli: &Cli,
) -> Result<bool> {
    let mut mrt = MrtReader::new(reader);
    let mut peers: Option<PeerTable> = None;
    let mut clean = true;
    let mut matched = 0usize;

    while let Some(record) = mrt.next_record()? {
        let header = record.header;
        match header.mrt_type {
            MRT_BGP4MP | MRT_BGP4MP_ET => {
                if cli.peer_index_only {
                    continue;
                }
                let msg = match bgp4mp::parse_message(header.subtype, record.body) {
                    Ok(Some(msg)) => msg,
                    Ok(None) => continue, // state change
                    Err(err) => {
                        warn!(file = %label, offset = mrt.offset(), %err, "skipping record");
                        clean = false;
                        continue;
                    }
                };
                let bgp = match BgpMessage::from_wire(msg.bgp.clone(), msg.asn32) {
                    Ok(bgp) => bgp,
                    Err(err) => {
                        warn!(file = %label, offset = mrt.offset(), %err, "bad BGP message");
                        clean = false;
                        continue;
                    }
                };
                if !bgp.is_update() {
                    debug!(file = %label, kind = bgp.kind(), "skipping non-UPDATE message");
                    continue;
                }
                vm.set_peer(msg.peer_as, NetAddr::host(msg.peer_addr));
                match vm.execute(&bgp) {
                    Ok(true) => {
                        let ctx = DumpCtx {
                            tag: "BGP4MP",
                            timestamp: header.timestamp,
                            peer_addr: msg.peer_addr,
                            peer_as: msg.peer_as,
                        };
                        emit_match(out, cli, &mut matched, &ctx, &bgp)?;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(file = %label, code = err.code(), %err, "filter error; record skipped");
                        clean = false;
                    }
                }
            }

            MRT_TABLE_DUMP_V2 => match header.subtype {
                table_dump::TD2_PEER_INDEX_TABLE => {
                    match table_dump::parse_peer_index(record.body) {
                        Ok(table) => {
                            if cli.peer_index_only {
                                dump_peer_table(out, &table)?;
                            }
                            peers = Some(table);
                        }
                        Err(err) => {
                            warn!(file = %label, %err, "bad peer index table");
                            clean = false;
                        }
                    }
                }
                table_dump::TD2_RIB_IPV4_UNICAST | table_dump::TD2_RIB_IPV6_UNICAST => {
                    if cli.peer_index_only {
                        continue;
                    }
                    let rib = match table_dump::parse_rib(header.subtype, record.body) {
                        Ok(rib) => rib,
                        Err(err) => {
                            warn!(file = %label, offset = mrt.offset(), %err, "bad RIB record");
                            clean = false;
                            continue;
                        }
                    };
                    for entry in &rib.entries {
                        let Some(peer) = peers.as_ref().and_then(|t| t.get(entry.peer_index))
                        else {
                            warn!(
                                file = %label,
                                peer_index = entry.peer_index,
                                "RIB entry references unknown peer"
                            );
                            clean = false;
                            continue;
                        };
                        let bgp = match table_dump::synthesize_update(&rib.prefix, &entry.attrs)
                        {
                            Ok(bgp) => bgp,
                            Err(err) => {
                                warn!(file = %label, %err, "bad RIB attributes");
                                clean = false;
                                continue;
                            }
                        };
                        vm.set_peer(peer.asn, NetAddr::host(peer.addr));
                        match vm.execute(&bgp) {
                            Ok(true) => {
                                let ctx = DumpCtx {
                                    tag: "TABLE_DUMP2",
                                    timestamp: header.timestamp,
                                    peer_addr: peer.addr,
                                    peer_as: peer.asn,
                                };
                                emit_match(out, cli, &mut matched, &ctx, &bgp)?;
                            }
                            Ok(false) => {}
                            Err(err) => {
                                warn!(
                                    file = %label,
                                    code = err.code(),
                                    %err,
                                    "filter error; record skipped"
                                );
                                clean = false;
                            }
                        }
                    }
                }
                other => {
                    warn!(file = %label, subtype = other, "unsupported TABLE_DUMP_V2 subtype");
                }
            },

            other => {
                debug!(file = %label, mrt_type = other, "skipping record type");
            }
        }
    }
    Ok(clean)
}
