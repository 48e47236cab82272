use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pcap_session::scrub::ScrubGranularity;
use pcap_session::writer::CaptureFormat;
use pcap_session::{Config, JsonMetadataStore, PcapError, PcapService};

#[derive(Parser, Debug)]
#[command(name = "pcap-session")]
#[command(about = "Reassemble, export or scrub the stored packets of a session")]
#[command(version)]
struct Args {
    /// JSON metadata file: sessions, capture file table and key-encryption keys
    #[arg(short, long)]
    metadata: PathBuf,

    /// Optional TOML or JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the reassembled streams of a session
    Reassemble {
        session: String,

        #[arg(long)]
        max_packets: Option<usize>,

        /// IP protocol number overriding the one recorded on the session
        #[arg(long)]
        protocol: Option<u8>,

        /// Print segments as hex instead of text
        #[arg(long)]
        hex: bool,

        /// Print every packet on its own instead of merged segments
        #[arg(long)]
        frames: bool,
    },
    /// Write a session and the sessions linked to it as a capture file
    Export {
        session: String,

        /// pcap or pcapng
        #[arg(short, long, default_value = "pcap")]
        format: CaptureFormat,

        #[arg(short, long)]
        output: PathBuf,
    },
    /// Overwrite the stored packets of a session in place
    Scrub {
        session: String,

        /// payload or entire
        #[arg(short, long, default_value = "payload")]
        granularity: ScrubGranularity,

        /// Delete the session metadata instead of marking it scrubbed
        #[arg(long)]
        delete: bool,

        #[arg(long, default_value = "pcap-session")]
        by: String,
    },
}

fn print_data(data: &[u8], hex: bool) {
    if hex {
        for line in data.chunks(32) {
            println!("{}", hex::encode(line));
        }
    } else {
        println!("{}", String::from_utf8_lossy(data));
    }
}

#[tokio::main]
async fn main() -> Result<(), PcapError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    let store = Arc::new(JsonMetadataStore::load(&args.metadata)?);
    let service = PcapService::new(store.clone(), config);

    match args.command {
        Commands::Reassemble {
            session,
            max_packets,
            hex,
            frames: true,
            ..
        } => {
            let flow = service.packet_flow(&session, max_packets).await?;
            println!(
                "source {}, destination {}",
                flow.source_key,
                flow.destination_key.as_deref().unwrap_or("-")
            );
            for f in &flow.frames {
                let side = if f.src { "src" } else { "dst" };
                match f.tcp_flags {
                    Some(flags) => println!("== {} {} ({} bytes, ts {}) {:?}", side, f.key, f.data.len(), f.ts, flags),
                    None => println!("== {} {} ({} bytes, ts {})", side, f.key, f.data.len(), f.ts),
                }
                print_data(&f.data, hex);
            }
        }
        Commands::Reassemble {
            session,
            max_packets,
            protocol,
            hex,
            frames: false,
        } => {
            let segments = service.decode_and_reassemble(&session, max_packets, protocol).await?;
            for s in &segments {
                if s.is_gap_marker() {
                    println!("== [gap]");
                    continue;
                }
                println!("== {} ({} bytes, ts {})", s.key, s.data.len(), s.ts.unwrap_or(0));
                print_data(&s.data, hex);
            }
        }
        Commands::Export {
            session,
            format,
            output,
        } => {
            let file = tokio::fs::File::create(&output).await.map_err(|source| PcapError::File {
                path: output.clone(),
                source,
            })?;
            service.write_capture_stream(&session, format, file).await?;
            info!(output = %output.display(), "export done");
        }
        Commands::Scrub {
            session,
            granularity,
            delete,
            by,
        } => {
            let summary = service.scrub_session(&session, granularity, delete, &by).await?;
            for p in &summary.packets {
                match &p.result {
                    Ok(bytes) => println!("{} @{}: scrubbed {} bytes", p.file, p.offset, bytes),
                    Err(e) => println!("{} @{}: {}", p.file, p.offset, e),
                }
            }
            println!(
                "{} of {} packets scrubbed, metadata {:?}",
                summary.scrubbed(),
                summary.packets.len(),
                summary.metadata
            );
            store.save(&args.metadata)?;
        }
    }
    Ok(())
}
