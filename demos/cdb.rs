use clap::{Parser, Subcommand};
use constdb::{Cdb, CdbBuilder};
use std::fs::File;
use std::io::{BufReader, BufWriter, Error, ErrorKind, Result, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Info(args) => run_info(args),
        Command::Make(args) => run_make(args),
        Command::Dump(args) => run_dump(args),
        Command::Get(args) => run_get(args),
    }
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "cdb utility for creating, inspecting and dumping constant databases",
    subcommand_required = true,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print table statistics of a cdb file as JSON
    Info(InfoArgs),
    /// Build a cdb file from records in the `+klen,vlen:key->value` format
    Make(MakeArgs),
    /// Write every record of a cdb file to stdout in the `+klen,vlen:key->value` format
    Dump(DumpArgs),
    /// Print the first value stored under a key
    Get(GetArgs),
}

#[derive(clap::Args)]
struct InfoArgs {
    /// Path to the cdb file
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Optional key whose values are listed
    #[arg(short, long)]
    key: Option<String>,
}

#[derive(clap::Args)]
struct MakeArgs {
    /// Path to the record text; reads stdin when omitted
    #[arg(short, long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// Path to the cdb file to produce
    #[arg(short, long, value_name = "FILE")]
    output: PathBuf,

    /// Optional override for writer buffer size in bytes
    #[arg(long, value_name = "BYTES", default_value_t = 16 << 20)]
    buffer_size: usize,
}

#[derive(clap::Args)]
struct DumpArgs {
    /// Path to the cdb file
    #[arg(value_name = "FILE")]
    input: PathBuf,
}

#[derive(clap::Args)]
struct GetArgs {
    /// Path to the cdb file
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Key to look up
    key: String,
}

fn run_info(args: InfoArgs) -> Result<()> {
    let cdb = Cdb::open(&args.input)?;

    let json = serde_json::to_string_pretty(&cdb.info()?)
        .map_err(|e| Error::other(format!("Failed to format JSON: {e}")))?;
    println!("{}", json);

    if let Some(key) = args.key {
        let values = cdb
            .values(key.as_bytes())
            .map(|value| value.map(|v| String::from_utf8_lossy(&v).into_owned()))
            .collect::<Result<Vec<_>>>()?;
        println!("{}: {:?}", key, values);
    }

    Ok(())
}

fn run_make(args: MakeArgs) -> Result<()> {
    let writer = File::create(&args.output)?;
    let builder = CdbBuilder::default().with_writer_buffer_size(args.buffer_size);
    let info = match args.input {
        Some(path) => builder.build_from_dump(&writer, BufReader::new(File::open(path)?))?,
        None => builder.build_from_dump(&writer, std::io::stdin().lock())?,
    };

    let json = serde_json::to_string_pretty(&info)
        .map_err(|e| Error::other(format!("Failed to format JSON: {e}")))?;
    println!("{}", json);

    Ok(())
}

fn run_dump(args: DumpArgs) -> Result<()> {
    let cdb = Cdb::open(&args.input)?;
    let mut out = BufWriter::new(std::io::stdout().lock());
    cdb.dump(&mut out)?;
    out.flush()
}

fn run_get(args: GetArgs) -> Result<()> {
    let cdb = Cdb::open(&args.input)?;
    match cdb.get(args.key.as_bytes())? {
        Some(value) => {
            let mut out = std::io::stdout().lock();
            out.write_all(&value)?;
            out.write_all(b"\n")
        }
        None => Err(Error::new(
            ErrorKind::NotFound,
            format!("key {:?} not found", args.key),
        )),
    }
}
