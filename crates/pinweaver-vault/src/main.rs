//! pinweaver-vault - host a pinweaver engine over a framed pipe
//!
//! owns the persistent store and the device seed, loads the tree once and
//! then answers requests one at a time.
//!
//! usage:
//!   pinweaver-vault init --bits-per-level 2 --height 6
//!   pinweaver-vault status
//!   pinweaver-vault log
//!   pinweaver-vault serve          # len:u32 le || request on stdin
//!
//! data stored in ~/.pinweaver-vault/

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use pinweaver::message::REQUEST_HEADER_SIZE;
use pinweaver::{
    parse_response, Error, LogEntry, MessageType, NvStorage, PinWeaver, Platform, Request,
    SledStorage, SoftwarePlatform, TreeParams, PROTOCOL_VERSION,
};
use rand::RngCore;
use serde::Serialize;
use tracing::{debug, info, warn};

type BoxError = Box<dyn std::error::Error>;

/// largest request the header's u16 length field can describe
const MAX_FRAME_SIZE: u32 = REQUEST_HEADER_SIZE as u32 + u16::MAX as u32;

/// pinweaver-vault - brute-force resistant pin checking
#[derive(Parser)]
#[command(name = "pinweaver-vault")]
#[command(about = "pinweaver vault - host a pinweaver engine over a framed pipe")]
#[command(version)]
struct Args {
    /// data directory (default: ~/.pinweaver-vault)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// reset the tree, dropping every enrolled credential
    Init {
        #[arg(short, long, default_value = "2")]
        bits_per_level: u8,
        #[arg(long, default_value = "6")]
        height: u8,
    },
    /// print tree parameters, root, restart count and log as json
    Status,
    /// print the replay log as json
    Log,
    /// answer framed requests from stdin on stdout until eof
    Serve,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    params: Option<TreeParams>,
    root: String,
    restart_count: u32,
    log: Vec<LogEntry>,
}

type Engine = PinWeaver<SoftwarePlatform, SledStorage>;

/// how a command treats the process start
#[derive(Clone, Copy, PartialEq, Eq)]
enum Boot {
    /// a fresh process is a restart of the engine
    Engine,
    /// read only look at the store, no restart is counted
    Inspect,
}

/// one frame off the pipe
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Request(Vec<u8>),
    /// length over the limit, its bytes were skipped
    Oversized(u32),
}

/// load the device seed, creating it on first run
fn load_device_seed(path: &Path) -> Result<[u8; 32], BoxError> {
    if path.exists() {
        let bytes = std::fs::read(path)?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("{} must hold exactly 32 bytes", path.display()))?;
        return Ok(seed);
    }

    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    std::fs::write(path, seed)?;
    info!("created device seed at {}", path.display());
    Ok(seed)
}

fn open_engine(data_dir: &Path, boot: Boot) -> Result<Engine, BoxError> {
    std::fs::create_dir_all(data_dir)?;
    let seed = load_device_seed(&data_dir.join("device.seed"))?;
    let storage = SledStorage::open(data_dir.join("db"))?;

    warn!("software platform has no hardware binding - use only for testing");
    let platform = SoftwarePlatform::from_device_key(seed);
    Ok(match boot {
        Boot::Engine => PinWeaver::open(platform, storage),
        Boot::Inspect => PinWeaver::inspect(platform, storage),
    })
}

fn log_entries(engine: &Engine) -> Vec<LogEntry> {
    match engine.log() {
        Ok(log) => log.iter().copied().collect(),
        Err(e) => {
            warn!("log unavailable: {}", e);
            Vec::new()
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), BoxError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init(engine: &mut Engine, bits_per_level: u8, height: u8) -> Result<(), BoxError> {
    let request = Request::ResetTree {
        bits_per_level,
        height,
    };
    let bytes = engine.handle_request(&request.to_bytes(PROTOCOL_VERSION)?);
    let response = parse_response(&request, &bytes)?;
    response.result()?;

    info!(
        "tree reset: bits_per_level={} height={} root={}",
        bits_per_level,
        height,
        hex::encode(response.header.root)
    );
    Ok(())
}

/// read one frame, `None` on a clean eof between frames
fn read_frame(input: &mut impl Read) -> io::Result<Option<Frame>> {
    let mut len = [0u8; 4];
    match input.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_le_bytes(len);
    if len > MAX_FRAME_SIZE {
        io::copy(&mut (&mut *input).take(u64::from(len)), &mut io::sink())?;
        return Ok(Some(Frame::Oversized(len)));
    }
    let mut frame = vec![0u8; len as usize];
    input.read_exact(&mut frame)?;
    Ok(Some(Frame::Request(frame)))
}

fn write_frame(output: &mut impl Write, frame: &[u8]) -> io::Result<()> {
    output.write_all(&(frame.len() as u32).to_le_bytes())?;
    output.write_all(frame)?;
    output.flush()
}

/// answer frames from `input` on `output` until eof
fn serve<P: Platform, S: NvStorage>(
    engine: &mut PinWeaver<P, S>,
    input: &mut impl Read,
    output: &mut impl Write,
) -> io::Result<u64> {
    let mut handled = 0u64;
    while let Some(frame) = read_frame(input)? {
        let request = match frame {
            Frame::Request(request) => request,
            Frame::Oversized(len) => {
                warn!("skipped frame of {} bytes, limit is {}", len, MAX_FRAME_SIZE);
                let response = engine.error_response(PROTOCOL_VERSION, &Error::LengthInvalid);
                write_frame(output, &response)?;
                handled += 1;
                continue;
            }
        };

        let kind = request
            .get(1)
            .and_then(|&k| MessageType::try_from(k).ok())
            .unwrap_or(MessageType::Invalid);
        let response = engine.handle_request(&request);
        write_frame(output, &response)?;

        handled += 1;
        debug!(
            "request {} ({:?}): {} bytes in, {} out",
            handled,
            kind,
            request.len(),
            response.len()
        );
    }
    Ok(handled)
}

fn main() -> Result<(), BoxError> {
    // stdout carries frames in serve mode, keep logs on stderr
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pinweaver_vault=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let data_dir = args.data_dir.unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".pinweaver-vault")
    });

    info!("pinweaver-vault v{}", env!("CARGO_PKG_VERSION"));
    info!("  data: {}", data_dir.display());

    let boot = match args.command {
        Command::Status | Command::Log => Boot::Inspect,
        Command::Init { .. } | Command::Serve => Boot::Engine,
    };
    let mut engine = open_engine(&data_dir, boot)?;

    match args.command {
        Command::Init {
            bits_per_level,
            height,
        } => init(&mut engine, bits_per_level, height),
        Command::Status => print_json(&StatusResponse {
            version: env!("CARGO_PKG_VERSION").into(),
            params: engine.params(),
            root: hex::encode(engine.root()),
            restart_count: engine.restart_count(),
            log: log_entries(&engine),
        }),
        Command::Log => print_json(&log_entries(&engine)),
        Command::Serve => {
            info!("serving on stdin/stdout");
            let handled = serve(&mut engine, &mut io::stdin().lock(), &mut io::stdout().lock())?;
            info!("input closed after {} requests", handled);
            Ok(())
        }
    }
}
