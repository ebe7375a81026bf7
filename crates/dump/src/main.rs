//! Object dump tool
//!
//! Connects to a running server, walks an id range within one read-only
//! transaction, and prints one line per live object, with optional
//! reference and hex payload dumps. Exits 0 on success and 1 on any
//! connection or IO failure.

use clap::Parser;
use std::path::PathBuf;
use tessera_client::Session;
use tessera_core::{Object, ObjectId};

/// Object types at or above this value are internal catalog types, hidden
/// unless `--catalog` is given.
const CATALOG_TYPE_BASE: u32 = 0xFFFF_FF00;

const BYTES_PER_LINE: usize = 16;
const GROUP_SIZE: usize = 8;

/// Dump objects from a Tessera server.
#[derive(Debug, Parser)]
#[command(name = "tessera-dump", version, about)]
struct Args {
    /// Path of the server socket.
    #[arg(long, default_value = "/tmp/tessera.sock")]
    socket: PathBuf,

    /// First object id to dump.
    #[arg(long, default_value_t = 1)]
    start: u64,

    /// Last object id to dump (inclusive). Defaults to the highest
    /// allocated id.
    #[arg(long)]
    end: Option<u64>,

    /// Print each object's reference slots.
    #[arg(long)]
    references: bool,

    /// Hex-dump each object's data payload.
    #[arg(long)]
    payload: bool,

    /// Include catalog-typed objects.
    #[arg(long)]
    catalog: bool,

    /// Stop after printing this many lines (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    line_limit: usize,
}

/// Tracks the `--line-limit` budget across print helpers.
struct LineBudget {
    remaining: Option<usize>,
}

impl LineBudget {
    fn new(limit: usize) -> LineBudget {
        LineBudget {
            remaining: (limit > 0).then_some(limit),
        }
    }

    /// Consume one line; false once the budget is spent.
    fn take(&mut self) -> bool {
        match &mut self.remaining {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }
}

fn object_line(object: &Object) -> String {
    format!(
        "id={:016x}, type={:08x}, payload={:04x}, references={:02x}",
        object.id().get(),
        object.type_id().get(),
        object.header.payload_size,
        object.header.num_references,
    )
}

fn reference_lines(object: &Object, out: &mut Vec<String>, budget: &mut LineBudget) {
    for (slot, reference) in object.references.iter().enumerate() {
        if !budget.take() {
            return;
        }
        out.push(format!("      {:02x}: {:016x}", slot, reference.get()));
    }
}

fn hex_dump_line(offset: usize, chunk: &[u8]) -> String {
    let mut line = format!("      {offset:08x}: ");
    for (i, byte) in chunk.iter().enumerate() {
        if i == GROUP_SIZE {
            line.push(' ');
        }
        line.push_str(&format!("{byte:02x} "));
    }
    for i in chunk.len()..BYTES_PER_LINE {
        if i == GROUP_SIZE {
            line.push(' ');
        }
        line.push_str("   ");
    }
    line.push_str("| ");
    for (i, byte) in chunk.iter().enumerate() {
        if i == GROUP_SIZE {
            line.push(' ');
        }
        let printable = (b' '..=b'~').contains(byte);
        line.push(if printable { *byte as char } else { '.' });
        line.push(' ');
    }
    line
}

fn payload_lines(object: &Object, out: &mut Vec<String>, budget: &mut LineBudget) {
    for (index, chunk) in object.data.chunks(BYTES_PER_LINE).enumerate() {
        if !budget.take() {
            return;
        }
        out.push(hex_dump_line(index * BYTES_PER_LINE, chunk));
    }
}

fn dump(args: &Args) -> tessera_core::Result<Vec<String>> {
    let mut session = Session::connect(&args.socket)?;
    session.begin()?;

    let mut budget = LineBudget::new(args.line_limit);
    let mut out = Vec::new();
    // Without --end, scan everything ever allocated; lookups filter the
    // dead ids.
    let end = args.end.unwrap_or_else(|| session.last_id().get());
    for id in args.start..=end {
        let Some(object) = session.lookup(ObjectId::new(id))? else {
            continue;
        };
        let is_catalog = object.type_id().get() >= CATALOG_TYPE_BASE;
        if !args.catalog && is_catalog {
            continue;
        }
        if !budget.take() {
            break;
        }
        out.push(object_line(&object));
        if args.references && !object.references.is_empty() {
            reference_lines(&object, &mut out, &mut budget);
        }
        if args.payload && !object.data.is_empty() {
            payload_lines(&object, &mut out, &mut budget);
        }
    }
    session.rollback()?;
    Ok(out)
}

fn main() {
    tracing_subscriber::fmt().with_target(false).init();
    let args = Args::parse();
    match dump(&args) {
        Ok(lines) => {
            for line in lines {
                println!("{line}");
            }
        }
        Err(e) => {
            eprintln!("tessera-dump: {e}");
            std::process::exit(1);
        }
    }
}
