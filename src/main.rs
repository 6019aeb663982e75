use anyhow::{Context, Result};
use clap::Parser;
use megatrace::capture::{Capture, CapturedEvent};
use megatrace::cli::{Cli, OutputFormat};
use megatrace::logging;
use megatrace::wire::StreamDecoder;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::TcpListener;

/// Decode one stream, printing events as they arrive
fn consume<R: Read>(reader: R, args: &Cli, capture: &mut Capture) -> Result<()> {
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut batch: Vec<CapturedEvent> = Vec::new();

    for message in StreamDecoder::new(reader) {
        let message = message.context("Failed to decode event stream")?;
        batch.clear();
        capture.apply(message, &mut batch);
        if args.summary_only {
            continue;
        }
        for event in &batch {
            let line = match args.format {
                OutputFormat::Text => capture.render_text(event),
                OutputFormat::Json => capture.render_json(event)?,
            };
            writeln!(out, "{}", line)?;
        }
    }
    out.flush()?;
    Ok(())
}

fn print_summary(capture: &Capture, args: &Cli) -> Result<()> {
    let summary = capture.summary();
    match args.format {
        OutputFormat::Text => eprint!("{}", summary),
        OutputFormat::Json => eprintln!("{}", serde_json::to_string(&summary)?),
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();
    logging::init(args.debug);

    let mut capture = Capture::new();

    if let Some(path) = &args.input {
        let file = File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        consume(BufReader::new(file), &args, &mut capture)?;
        return print_summary(&capture, &args);
    }

    let listener = TcpListener::bind(&args.listen)
        .with_context(|| format!("Failed to listen on {}", args.listen))?;
    tracing::info!(address = %args.listen, "waiting for bridge connections");

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let peer = stream.peer_addr().ok();
        tracing::info!(?peer, "bridge connected");

        // A broken connection ends that stream, not the tool
        if let Err(e) = consume(BufReader::new(stream), &args, &mut capture) {
            tracing::warn!(?peer, error = %e, "stream ended with an error");
        }
        tracing::info!(?peer, "bridge disconnected");

        if args.once {
            break;
        }
    }

    print_summary(&capture, &args)
}
