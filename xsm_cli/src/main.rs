use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use serde::Serialize;

use xsm_core::crc64;
use xsm_core::format::MAX_SEGMENT_SIZE;
use xsm_core::{FramingOptions, StructuredMessageError, StructuredMessageReader};
use xsm_transfer::{
    crc64_header_value, FramedUpload, ResponseBody, StructuredBodyType, TransferValidation,
    UploadBody,
};

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "xsm",
    about = "XSM/1.0 structured messages: frame, validate, and inspect CRC64-checked transfer bodies",
    version
)]
struct Cli {
    /// Log level: off | error | warn | info | debug | trace
    #[arg(long = "log-level", value_name = "LEVEL", global = true, default_value = "warn")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Frame a file as a structured message
    Encode {
        /// Source file to frame
        input: PathBuf,
        /// Destination structured message file
        output: PathBuf,
        /// Payload bytes per segment (default and maximum: 4 MiB)
        #[arg(short, long, default_value_t = MAX_SEGMENT_SIZE)]
        segment_size: usize,
        /// Omit per-segment CRC64 footers and the trailer
        #[arg(long)]
        no_crc64: bool,
    },
    /// Validate a structured message and write out its payload
    Decode {
        /// Source structured message file
        input: PathBuf,
        /// Destination file ("-" writes to stdout)
        output: PathBuf,
    },
    /// Print header fields, per-segment details, and validation status
    Inspect {
        /// Structured message file to inspect
        file: PathBuf,
        /// Print per-segment details
        #[arg(long)]
        segments: bool,
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the CRC64 of a file
    Checksum {
        /// File to checksum
        file: PathBuf,
    },
    /// Show which upload validation strategy a file would get
    Plan {
        /// File to plan an upload for
        file: PathBuf,
    },
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn human_bytes(n: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.2} {}", v, UNITS[unit])
    }
}

fn open_input(path: &Path) -> anyhow::Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("opening input file {:?}", path))?;
    Ok(BufReader::new(file))
}

fn create_output(path: &Path) -> anyhow::Result<Box<dyn Write>> {
    if path.to_str() == Some("-") {
        return Ok(Box::new(io::stdout()));
    }
    let file = File::create(path).with_context(|| format!("creating output file {:?}", path))?;
    Ok(Box::new(BufWriter::new(file)))
}

// ── Subcommand implementations ─────────────────────────────────────────────

fn run_encode(
    input: PathBuf,
    output: PathBuf,
    segment_size: usize,
    no_crc64: bool,
) -> anyhow::Result<()> {
    let src = open_input(&input)?;
    let content_length = src.get_ref().metadata()?.len();
    let options = FramingOptions {
        segment_size,
        crc64: !no_crc64,
    };

    let t0 = Instant::now();
    let mut framed = FramedUpload::new(src, content_length, options)
        .with_context(|| format!("framing {:?}", input))?;
    let mut dst = create_output(&output)?;
    let written = io::copy(&mut framed, &mut dst)?;
    dst.flush()?;
    let elapsed = t0.elapsed();

    eprintln!("  segments    : {}", framed.num_segments());
    eprintln!("  segment size: {}", human_bytes(segment_size as u64));
    eprintln!("  crc64       : {}", if no_crc64 { "off" } else { "on" });
    eprintln!("  payload     : {}", human_bytes(content_length));
    eprintln!("  message     : {}", human_bytes(written));
    if !no_crc64 {
        eprintln!("  message crc : {:016x}", framed.total_crc64());
    }
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

fn run_decode(input: PathBuf, output: PathBuf) -> anyhow::Result<()> {
    let src = open_input(&input)?;
    let marker = StructuredBodyType::CRC64.to_string();
    let mut body = ResponseBody::new(src, Some(marker.as_str()));
    let mut dst = create_output(&output)?;

    let t0 = Instant::now();
    let total = io::copy(&mut body, &mut dst)
        .with_context(|| format!("validating structured message {:?}", input))?;
    dst.flush()?;
    let segments = body.message_header().map_or(0, |h| h.num_segments);
    let crc = body.close()?;
    let elapsed = t0.elapsed();

    eprintln!("  segments    : {}", segments);
    eprintln!("  payload     : {}", human_bytes(total));
    match crc {
        Some(crc) => eprintln!("  message crc : {:016x} (validated)", crc),
        None => eprintln!("  message crc : none (message carries no checksums)"),
    }
    eprintln!(
        "  throughput  : {}/s",
        human_bytes((total as f64 / elapsed.as_secs_f64()) as u64)
    );
    Ok(())
}

#[derive(Serialize)]
struct SegmentReport {
    number: u16,
    length: usize,
    crc64: Option<String>,
}

#[derive(Serialize)]
struct InspectReport {
    version: u8,
    message_length: u64,
    flags: u16,
    crc64: bool,
    num_segments: u16,
    payload_length: u64,
    segments: Vec<SegmentReport>,
    message_crc64: Option<String>,
    valid: bool,
    error: Option<String>,
}

/// Read every segment and the trailer, recording what was seen before any failure.
fn scan_segments<R: Read>(
    reader: &mut StructuredMessageReader<R>,
    segments: &mut Vec<SegmentReport>,
) -> Result<Option<u64>, StructuredMessageError> {
    while let Some(segment) = reader.read_segment()? {
        segments.push(SegmentReport {
            number: segment.number,
            length: segment.data.len(),
            crc64: segment.crc64.map(|c| format!("{:016x}", c)),
        });
    }
    reader.read_trailer()
}

fn run_inspect(file: PathBuf, show_segments: bool, json: bool) -> anyhow::Result<()> {
    let mut reader = StructuredMessageReader::new(open_input(&file)?);
    let header = reader
        .read_header()
        .with_context(|| format!("reading structured message header from {:?}", file))?;

    let mut segments = Vec::new();
    let outcome = scan_segments(&mut reader, &mut segments);
    let payload_length = segments.iter().map(|s| s.length as u64).sum::<u64>();

    let report = InspectReport {
        version: header.version,
        message_length: header.message_length,
        flags: header.flags,
        crc64: header.crc64_enabled(),
        num_segments: header.num_segments,
        payload_length,
        message_crc64: outcome
            .as_ref()
            .ok()
            .copied()
            .flatten()
            .map(|c| format!("{:016x}", c)),
        valid: outcome.is_ok(),
        error: outcome.as_ref().err().map(|e| e.to_string()),
        segments: if show_segments || json { segments } else { Vec::new() },
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("=== XSM/1.0 message: {:?} ===", file);
    println!();
    println!("  version        : {}", report.version);
    println!("  message length : {}", human_bytes(report.message_length));
    println!("  flags          : 0x{:04x}", report.flags);
    println!("  crc64          : {}", if report.crc64 { "on" } else { "off" });
    println!("  segments       : {}", report.num_segments);
    println!("  payload        : {}", human_bytes(report.payload_length));
    if let Some(crc) = &report.message_crc64 {
        println!("  message crc64  : {}", crc);
    }
    match &report.error {
        None => println!("  status         : valid"),
        Some(e) => println!("  status         : INVALID ({})", e),
    }

    if show_segments {
        println!();
        println!("  {:>8}  {:>12}  {:>16}", "segment", "length", "crc64");
        println!("  {}", "-".repeat(40));
        for s in &report.segments {
            println!(
                "  {:>8}  {:>12}  {:>16}",
                s.number,
                human_bytes(s.length as u64),
                s.crc64.as_deref().unwrap_or("-")
            );
        }
    }

    if let Err(e) = outcome {
        return Err(e).with_context(|| format!("{:?} failed validation", file));
    }
    Ok(())
}

fn run_checksum(file: PathBuf) -> anyhow::Result<()> {
    let mut src = open_input(&file)?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut crc = 0u64;
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        crc = crc64::update(crc, &buf[..n]);
        total += n as u64;
    }
    info!("checksummed {} bytes of {:?}", total, file);

    println!("{:016x}  {}", crc, crc64_header_value(crc));
    Ok(())
}

fn run_plan(file: PathBuf) -> anyhow::Result<()> {
    let src = File::open(&file).with_context(|| format!("opening input file {:?}", file))?;
    let body = UploadBody::prepare(src)?;

    match body.validation() {
        TransferValidation::Inline { crc64 } => {
            println!("  strategy       : inline crc64");
            println!("  crc64          : {:016x}", crc64);
        }
        TransferValidation::Framed {
            num_segments,
            content_length,
            message_length,
            ..
        } => {
            println!("  strategy       : structured message");
            println!("  segments       : {}", num_segments);
            println!("  payload        : {}", human_bytes(content_length));
            println!("  message length : {}", human_bytes(message_length));
        }
    }
    println!("  wire length    : {}", body.wire_length());
    for (name, value) in body.transport_headers() {
        println!("  {}: {}", name, value);
    }
    Ok(())
}

// ── Entry point ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.log_level)
        .init();

    match cli.command {
        Commands::Encode {
            input,
            output,
            segment_size,
            no_crc64,
        } => run_encode(input, output, segment_size, no_crc64),
        Commands::Decode { input, output } => run_decode(input, output),
        Commands::Inspect {
            file,
            segments,
            json,
        } => run_inspect(file, segments, json),
        Commands::Checksum { file } => run_checksum(file),
        Commands::Plan { file } => run_plan(file),
    }
}
