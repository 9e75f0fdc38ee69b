//! Gate actuation test tool
//!
//! Opens the actuator's serial port and sends `<slot>:OPEN` / `<slot>:CLOSE`
//! lines, either once from flags or interactively from stdin.

use clap::{Parser, ValueEnum};
use parkgate::domain::types::{GateAction, SlotNumber};
use parkgate::io::serial_gate::{open_gate_port, RESET_SETTLE};
use parkgate::services::gate::encode_command;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Action {
    Open,
    Close,
}

impl From<Action> for GateAction {
    fn from(action: Action) -> Self {
        match action {
            Action::Open => GateAction::Open,
            Action::Close => GateAction::Close,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "gate_test", about = "Send gate commands over the serial link")]
struct Args {
    #[arg(long, default_value = "/dev/ttyACM0")]
    device: String,

    #[arg(long, default_value = "9600")]
    baud: u32,

    /// Slot the command is addressed to
    #[arg(long, default_value = "1")]
    slot: u32,

    /// Send a single command and exit; interactive when omitted
    #[arg(long, value_enum)]
    action: Option<Action>,

    /// Skip the wait for the board to reset after opening the port
    #[arg(long)]
    no_settle: bool,
}

async fn send<W: AsyncWrite + Unpin>(link: &mut W, slot: SlotNumber, action: GateAction) -> std::io::Result<()> {
    let line = encode_command(slot, action);
    link.write_all(line.as_bytes()).await?;
    link.flush().await?;
    println!("sent {}", line.trim_end());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let slot = SlotNumber(args.slot);
    let settle = if args.no_settle { Duration::ZERO } else { RESET_SETTLE };

    println!("Opening {} @ {}baud...", args.device, args.baud);
    let mut port = open_gate_port(&args.device, args.baud, settle).await?;
    println!("Port opened ✓");

    if let Some(action) = args.action {
        send(&mut port, slot, action.into()).await?;
        return Ok(());
    }

    println!("Slot {}: '1' = OPEN, '2' = CLOSE, 'q' = quit", slot);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "1" => send(&mut port, slot, GateAction::Open).await?,
            "2" => send(&mut port, slot, GateAction::Close).await?,
            "q" | "quit" => break,
            "" => {}
            other => println!("Invalid input: {other}"),
        }
    }
    Ok(())
}
