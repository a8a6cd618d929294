//! Capture trace inspection tool

use std::path::PathBuf;
use std::process;

use clap::Parser;
use colored::*;

use redfire_ivr_replay::capture::{format_timestamp, DatagramKind, SnoopReader};
use redfire_ivr_replay::template::{CaseCache, RawPacket, UdpCategory};
use redfire_ivr_replay::Result;

#[derive(Parser)]
#[command(name = "trace-inspect")]
#[command(about = "List the UDP traffic or the call templates of a snoop trace")]
#[command(version = redfire_ivr_replay::VERSION)]
struct InspectCli {
    /// Snoop capture file
    trace: PathBuf,

    /// Show the templated dialogs instead of raw datagrams
    #[arg(short, long)]
    dialogs: bool,

    /// UDP ports treated as signaling
    #[arg(short = 'p', long = "signaling-port", default_values_t = [5060u16, 5061])]
    signaling_ports: Vec<u16>,

    /// Bytes of each payload to dump, 0 for none
    #[arg(short = 'x', long, default_value = "32")]
    hex_bytes: usize,
}

fn main() {
    let cli = InspectCli::parse();
    let result = if cli.dialogs {
        show_dialogs(&cli)
    } else {
        show_datagrams(&cli)
    };
    if let Err(e) = result {
        eprintln!("{} {}", "✗".red(), e);
        process::exit(1);
    }
}

fn show_datagrams(cli: &InspectCli) -> Result<()> {
    let datagrams = SnoopReader::open(&cli.trace)?.read_datagrams(&cli.signaling_ports)?;
    println!("{} {} UDP datagram(s)", cli.trace.display().to_string().bold(), datagrams.len());

    for datagram in &datagrams {
        let kind = match datagram.kind {
            DatagramKind::Signaling => "SIP".cyan(),
            DatagramKind::Unknown => "UDP".normal(),
        };
        println!(
            "{:>6} {} {} {} -> {} ({} bytes)",
            datagram.index,
            datagram.timestamp_label(),
            kind,
            datagram.src,
            datagram.dst,
            datagram.payload.len()
        );
        if datagram.kind == DatagramKind::Signaling {
            if let Some(line) = String::from_utf8_lossy(&datagram.payload).lines().next() {
                println!("       {}", line.dimmed());
            }
        } else {
            dump(&datagram.payload, cli.hex_bytes);
        }
    }
    Ok(())
}

fn show_dialogs(cli: &InspectCli) -> Result<()> {
    let cache = CaseCache::new(".", ".", cli.signaling_ports.clone());
    let template = cache.parse_trace(&cli.trace)?;
    println!(
        "{} {} dialog(s)",
        template.info.trace_name().bold(),
        template.dialogs.len()
    );

    for dialog in &template.dialogs {
        println!(
            "\n{} {}: {} -> {} ({} packets, {} expected)",
            "Dialog".bold(),
            dialog.index,
            dialog.numbers.calling,
            dialog.numbers.called,
            dialog.packets.len(),
            dialog.received_count()
        );
        for packet in &dialog.packets {
            print_packet(packet);
            if packet.category.is_media() {
                dump(&packet.data, cli.hex_bytes);
            }
        }
    }
    Ok(())
}

fn print_packet(packet: &RawPacket) {
    let direction = if packet.received {
        "<--".yellow()
    } else {
        "-->".green()
    };
    let description = match packet.category {
        UdpCategory::Sip => packet.describe().cyan(),
        category if category.is_ivr() => packet.describe().magenta(),
        _ => packet.describe().normal(),
    };
    println!(
        "{:>6} {} {:>+10.3}ms {} {}",
        packet.index,
        format_timestamp(packet.timestamp_us),
        packet.delay_us as f64 / 1000.0,
        direction,
        description
    );
}

fn dump(payload: &[u8], limit: usize) {
    if limit == 0 || payload.is_empty() {
        return;
    }
    let shown = &payload[..payload.len().min(limit)];
    let ellipsis = if payload.len() > limit { " .." } else { "" };
    println!("       {}{}", hex::encode(shown).dimmed(), ellipsis);
}
